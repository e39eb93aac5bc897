//! Engine service.
//! The public face of the orchestration layer. Every operation that touches
//! the board or the engine is a job on one FIFO [`CommandQueue`], so callers
//! can fire requests concurrently without ever interleaving `position`/`go`
//! pairs. A dispatcher task routes worker events to the request in flight.
//!
//! Search failures never surface as errors: callers get `Ok(None)` and a
//! warning in the log. Only a disposed service (or a bad argument) is an `Err`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{CancelReason, QueueError, RequestError, ServiceError, TablebaseError, WorkerError};
use crate::machine::{reduce, EngineAction, EngineState, WorkerPhase};
use crate::protocol::{is_safe_argument, EngineResponse, Evaluation, GoParams, UciCommand};
use crate::queue::CommandQueue;
use crate::requests::{BestMove, Request, RequestId, RequestKind, RequestManager, RequestOutcome};
use crate::rules::{parse_position, AppliedMove, ChessRules, MoveRequest, ShakmatyRules};
use crate::tablebase::{LichessTablebase, Tablebase, TablebaseEntry};
use crate::worker::{ProcessSpawner, UciProcessSpawner, WorkerEvent, WorkerManager};

type Board = Box<dyn ChessRules>;

/// Engine and tablebase verdicts for one position. Either side may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DualEvaluation {
    pub engine: Option<Evaluation>,
    pub tablebase: Option<TablebaseEntry>,
}

// *************** Shared context ***************

/// State shared by queued jobs and the dispatcher.
struct Context {
    worker: WorkerManager,
    requests: RequestManager,
    /// The one request the engine is currently working on.
    active: Mutex<Option<(RequestId, RequestKind)>>,
    machine: Mutex<EngineState>,
    config: Config,
}

impl Context {
    fn record(&self, action: EngineAction) {
        let mut machine = self.machine.lock();
        *machine = reduce(&machine, action);
    }

    fn record_init(&self, result: &Result<(), WorkerError>) {
        match result {
            Ok(()) => self.record(EngineAction::InitSuccess),
            Err(error) => self.record(EngineAction::InitFailure {
                error: error.to_string(),
            }),
        }
    }

    fn set_active(&self, id: &RequestId, kind: RequestKind) {
        *self.active.lock() = Some((id.clone(), kind));
    }

    fn clear_active(&self, id: &RequestId) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|(current, _)| current == id) {
            *active = None;
        }
    }

    /// Brings the engine up if needed: lazily on first use, or by restart
    /// after a crash.
    async fn ensure_ready(&self) -> Result<(), WorkerError> {
        match self.worker.phase() {
            WorkerPhase::Ready => return Ok(()),
            WorkerPhase::Terminated => return Err(WorkerError::Terminated),
            WorkerPhase::Initializing => {
                return self
                    .worker
                    .wait_ready(self.config.worker_settings().handshake_timeout)
                    .await;
            }
            WorkerPhase::Error | WorkerPhase::Uninitialized => {}
        }

        self.record(EngineAction::InitStart);
        let result = if self.worker.crashed() {
            if !self.config.engine.restart_on_crash {
                Err(WorkerError::NotReady(WorkerPhase::Error.to_string()))
            } else {
                info!("restarting engine after crash");
                self.worker.restart().await
            }
        } else {
            self.worker.initialize().await
        };
        self.record_init(&result);
        result
    }

    /// Runs one search request end to end.
    async fn search(
        &self,
        kind: RequestKind,
        fen: String,
        go: GoParams,
        timeout: Duration,
        multi_pv: Option<u32>,
    ) -> Option<RequestOutcome> {
        if let Err(error) = self.ensure_ready().await {
            warn!(%error, %kind, "engine unavailable");
            let id = self.requests.generate_id(kind);
            self.record(EngineAction::RequestStart { id: id.clone() });
            self.record(EngineAction::RequestFailure {
                id,
                error: error.to_string(),
            });
            return None;
        }

        let id = self.requests.generate_id(kind);
        let completion = self
            .requests
            .register(Request::new(id.clone(), kind, fen.clone(), timeout), timeout);
        self.set_active(&id, kind);
        self.record(EngineAction::RequestStart { id: id.clone() });
        let started = Instant::now();

        if let Some(lines) = multi_pv {
            self.worker.send_command(&UciCommand::SetOption {
                name: "MultiPV".into(),
                value: lines.to_string(),
            });
        }
        let sent = self.worker.send_command(&UciCommand::Position { fen })
            && self.worker.send_command(&UciCommand::Go(go));
        if !sent {
            warn!(request = %id, "could not send search to engine, waiting for timeout");
        }

        let result = completion.await.unwrap_or(Err(RequestError::Dropped));
        self.clear_active(&id);

        if multi_pv.is_some() {
            self.worker.send_command(&UciCommand::SetOption {
                name: "MultiPV".into(),
                value: "1".into(),
            });
        }

        match result {
            Ok(outcome) => {
                debug!(request = %id, elapsed = ?started.elapsed(), "search finished");
                self.record(EngineAction::RequestSuccess {
                    id,
                    latency: started.elapsed(),
                });
                Some(outcome)
            }
            Err(error) => {
                warn!(request = %id, %error, "search failed");
                match &error {
                    RequestError::Timeout { .. } => self.record(EngineAction::RequestTimeout { id }),
                    RequestError::Cancelled {
                        reason: CancelReason::Crash(_) | CancelReason::Shutdown,
                        ..
                    } => {}
                    RequestError::Cancelled { .. } => self.record(EngineAction::RequestCancel { id }),
                    RequestError::Engine { .. } | RequestError::Dropped => {
                        self.record(EngineAction::RequestFailure {
                            id,
                            error: error.to_string(),
                        })
                    }
                }
                let engine_gone = matches!(
                    &error,
                    RequestError::Cancelled {
                        reason: CancelReason::Crash(_) | CancelReason::Shutdown,
                        ..
                    }
                );
                if !engine_gone {
                    self.resync().await;
                }
                None
            }
        }
    }

    /// Stops whatever the engine is doing and waits for `readyok`, so a late
    /// `bestmove` cannot be matched to the next request.
    async fn resync(&self) {
        if self.worker.phase() != WorkerPhase::Ready {
            return;
        }
        let timeout = self.config.sync_timeout();
        let id = self.requests.generate_id(RequestKind::Sync);
        let completion = self
            .requests
            .register(Request::new(id.clone(), RequestKind::Sync, "", timeout), timeout);
        self.set_active(&id, RequestKind::Sync);

        self.worker.send_command(&UciCommand::Stop);
        self.worker.send_command(&UciCommand::IsReady);
        let result = completion.await.unwrap_or(Err(RequestError::Dropped));
        self.clear_active(&id);

        match result {
            Ok(_) => debug!("engine resynchronised"),
            Err(error @ RequestError::Cancelled { .. }) => debug!(%error, "resync abandoned"),
            Err(error) => {
                warn!(%error, "engine did not resynchronise, dropping process");
                self.worker.cleanup();
                self.record(EngineAction::Error {
                    message: "engine unresponsive".into(),
                });
            }
        }
    }

    async fn best_move(&self, fen: String) -> Option<BestMove> {
        let movetime = self.config.move_time();
        match self
            .search(RequestKind::BestMove, fen, GoParams::movetime(movetime), movetime, None)
            .await?
        {
            RequestOutcome::BestMove(best) => Some(best),
            _ => None,
        }
    }

    async fn evaluate(&self, fen: String) -> Option<Evaluation> {
        let go = GoParams::depth(self.config.search.eval_depth);
        match self
            .search(RequestKind::Evaluation, fen, go, self.config.eval_timeout(), None)
            .await?
        {
            RequestOutcome::Evaluation(evaluation) => Some(evaluation),
            _ => None,
        }
    }

    async fn evaluate_lines(&self, fen: String, lines: u32) -> Option<Vec<Evaluation>> {
        let go = GoParams::depth(self.config.search.eval_depth);
        match self
            .search(RequestKind::MultiLine, fen, go, self.config.eval_timeout(), Some(lines))
            .await?
        {
            RequestOutcome::MultiLine(evaluations) => Some(evaluations),
            _ => None,
        }
    }
}

async fn lookup_tablebase(
    tablebase: Option<Arc<dyn Tablebase>>,
    fen: String,
    timeout: Duration,
) -> Option<TablebaseEntry> {
    let tablebase = tablebase?;
    match tokio::time::timeout(timeout, tablebase.lookup(&fen)).await {
        Ok(Ok(entry)) => Some(entry),
        Ok(Err(error)) => {
            warn!(%error, "tablebase lookup failed");
            None
        }
        Err(_) => {
            warn!(error = %TablebaseError::Timeout(timeout), "tablebase lookup abandoned");
            None
        }
    }
}

// *************** Dispatcher ***************

/// Routes worker events to the request in flight.
async fn dispatch(
    ctx: Arc<Context>,
    queue: Arc<CommandQueue<Board>>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        let active = ctx.active.lock().clone();
        match event {
            WorkerEvent::Response(EngineResponse::Info(fragment)) => match active {
                Some((id, kind)) if kind.is_search() => {
                    ctx.requests.record_info(&id, &fragment);
                }
                _ => trace!("info line with no search in flight"),
            },
            WorkerEvent::Response(EngineResponse::BestMove(signal)) => match active {
                Some((id, kind)) if kind.is_search() => {
                    if let Err(error) = ctx.requests.complete(&id, signal) {
                        debug!(%error, "bestmove for a finished request");
                    }
                }
                _ => debug!(best = ?signal.best, "discarding stray bestmove"),
            },
            WorkerEvent::Response(EngineResponse::ReadyOk) => {
                if let Some((id, RequestKind::Sync)) = active {
                    if let Err(error) = ctx.requests.resolve(&id, RequestOutcome::Synced) {
                        debug!(%error, "readyok for a finished sync");
                    }
                }
            }
            WorkerEvent::Response(other) => trace!(?other, "unrouted engine output"),
            WorkerEvent::ProtocolError { line, error } => match active {
                Some((id, RequestKind::Sync)) => {
                    debug!(request = %id, %line, %error, "ignoring malformed output while resyncing");
                }
                Some((id, _)) => {
                    warn!(request = %id, %line, "failing request on malformed engine output");
                    ctx.requests.reject(
                        &id,
                        RequestError::Engine {
                            id: id.clone(),
                            message: error.to_string(),
                        },
                    );
                }
                None => debug!(%line, %error, "malformed engine output with nothing in flight"),
            },
            WorkerEvent::Crashed { reason } => {
                ctx.record(EngineAction::Error {
                    message: reason.clone(),
                });
                // The queue must be empty before the in-flight job is released.
                let discarded = queue.clear();
                *ctx.active.lock() = None;
                let cancelled = ctx.requests.cancel_all(CancelReason::Crash(reason));
                ctx.record(EngineAction::RequestCancelAll { count: cancelled });
                warn!(cancelled, discarded, "engine crash handled, restart on next use");
            }
        }
    }
    debug!("worker event stream closed");
}

// *************** Service ***************

pub struct EngineService {
    ctx: Arc<Context>,
    queue: Arc<CommandQueue<Board>>,
    tablebase: Option<Arc<dyn Tablebase>>,
    disposed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineService {
    /// Wires the components together and starts the dispatcher and sweeper
    /// tasks. Must be called inside a tokio runtime. The engine itself is
    /// started lazily unless [`initialize`](Self::initialize) is called.
    pub fn new(
        config: Config,
        spawner: Arc<dyn ProcessSpawner>,
        rules: Box<dyn ChessRules>,
        tablebase: Option<Arc<dyn Tablebase>>,
    ) -> Self {
        let (worker, events) = WorkerManager::new(spawner, config.worker_settings());
        let ctx = Arc::new(Context {
            worker,
            requests: RequestManager::new(config.timeout_buffer()),
            active: Mutex::new(None),
            machine: Mutex::new(EngineState::default()),
            config,
        });
        let queue = Arc::new(CommandQueue::new(rules));

        let dispatcher = tokio::spawn(dispatch(ctx.clone(), queue.clone(), events));
        let sweeper = ctx
            .requests
            .spawn_sweeper(ctx.config.sweep_interval(), ctx.config.stale_after());

        Self {
            ctx,
            queue,
            tablebase,
            disposed: AtomicBool::new(false),
            tasks: Mutex::new(vec![dispatcher, sweeper]),
        }
    }

    /// Real engine binary, shakmaty rules and (if enabled) the Lichess tablebase.
    pub fn from_config(config: Config) -> Result<Self, TablebaseError> {
        let spawner = Arc::new(UciProcessSpawner::new(
            config.engine.path.clone(),
            config.engine.args.clone(),
        ));
        let tablebase: Option<Arc<dyn Tablebase>> = if config.tablebase.enabled {
            let client = LichessTablebase::new(config.tablebase.url.clone(), config.tablebase_timeout())?
                .with_max_pieces(config.tablebase.max_pieces);
            Some(Arc::new(client))
        } else {
            None
        };
        Ok(Self::new(config, spawner, Box::new(ShakmatyRules::new()), tablebase))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn check_disposed(&self) -> Result<(), ServiceError> {
        if self.is_disposed() {
            return Err(ServiceError::Disposed);
        }
        Ok(())
    }

    fn check_fen(fen: &str) -> Result<(), ServiceError> {
        if !is_safe_argument(fen) || parse_position(fen).is_none() {
            return Err(ServiceError::InvalidArgument(format!("invalid FEN: {:?}", fen)));
        }
        Ok(())
    }

    /// Queues a board-only job. If crash recovery discards it, the job never
    /// ran and the caller gets `fallback`.
    async fn run_board<T, F>(&self, fallback: T, job: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Board) -> BoxFuture<'a, T> + Send + 'static,
    {
        self.check_disposed()?;
        match self.queue.run(job).await {
            Ok(value) => Ok(value),
            Err(QueueError::Closed) => Err(ServiceError::Disposed),
            Err(QueueError::Discarded) => {
                self.check_disposed()?;
                warn!("board job discarded by crash recovery");
                Ok(fallback)
            }
        }
    }

    /// Queues a job that runs exactly one search, counted in the queue depth
    /// until the search starts.
    async fn run_search<T, F>(&self, job: F) -> Result<Option<T>, ServiceError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Board) -> BoxFuture<'a, Option<T>> + Send + 'static,
    {
        self.check_disposed()?;
        self.ctx.record(EngineAction::RequestEnqueue);
        self.run_engine(job).await
    }

    /// Queues an engine job. A discarded job yields `None`.
    async fn run_engine<T, F>(&self, job: F) -> Result<Option<T>, ServiceError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Board) -> BoxFuture<'a, Option<T>> + Send + 'static,
    {
        self.check_disposed()?;
        match self.queue.run(job).await {
            Ok(value) => Ok(value),
            Err(QueueError::Closed) => Err(ServiceError::Disposed),
            Err(QueueError::Discarded) => {
                self.check_disposed()?;
                debug!("engine job discarded");
                Ok(None)
            }
        }
    }

    // *************** Board operations ***************

    pub async fn get_position(&self) -> Result<String, ServiceError> {
        self.run_board(String::new(), |rules: &mut Board| {
            let fen = rules.current_position();
            async move { fen }.boxed()
        })
        .await
    }

    /// Returns `Ok(false)` if the rules reject the FEN; the old position stays.
    pub async fn set_position(&self, fen: &str) -> Result<bool, ServiceError> {
        let fen = fen.trim().to_string();
        self.run_board(false, move |rules: &mut Board| {
            let loaded = rules.load_position(&fen);
            async move { loaded }.boxed()
        })
        .await
    }

    pub async fn reset(&self) -> Result<String, ServiceError> {
        self.run_board(String::new(), |rules: &mut Board| {
            rules.reset();
            let fen = rules.current_position();
            async move { fen }.boxed()
        })
        .await
    }

    /// Returns `Ok(None)` for an illegal move.
    pub async fn make_move(&self, mv: MoveRequest) -> Result<Option<AppliedMove>, ServiceError> {
        self.run_board(None, move |rules: &mut Board| {
            let applied = rules.apply_move(&mv);
            if applied.is_none() {
                debug!(uci = %mv.to_uci(), "rejected illegal move");
            }
            async move { applied }.boxed()
        })
        .await
    }

    // *************** Engine operations ***************

    /// Best move for the current board, searched with `go movetime`.
    pub async fn get_best_move(&self) -> Result<Option<BestMove>, ServiceError> {
        let ctx = self.ctx.clone();
        self.run_search(move |rules: &mut Board| {
            let fen = rules.current_position();
            async move { ctx.best_move(fen).await }.boxed()
        })
        .await
    }

    /// Evaluates `fen`, or the current board when `None`, with `go depth`.
    pub async fn get_evaluation(&self, fen: Option<&str>) -> Result<Option<Evaluation>, ServiceError> {
        self.check_disposed()?;
        let requested = fen.map(str::trim).map(str::to_string);
        if let Some(fen) = &requested {
            Self::check_fen(fen)?;
        }
        let ctx = self.ctx.clone();
        self.run_search(move |rules: &mut Board| {
            let fen = requested.unwrap_or_else(|| rules.current_position());
            async move { ctx.evaluate(fen).await }.boxed()
        })
        .await
    }

    /// Top `lines` principal variations, sorted by `multipv` index.
    pub async fn get_multi_line_evaluation(
        &self,
        fen: Option<&str>,
        lines: u32,
    ) -> Result<Option<Vec<Evaluation>>, ServiceError> {
        self.check_disposed()?;
        if lines == 0 {
            return Err(ServiceError::InvalidArgument("lines must be at least 1".into()));
        }
        let requested = fen.map(str::trim).map(str::to_string);
        if let Some(fen) = &requested {
            Self::check_fen(fen)?;
        }
        let lines = lines.min(self.ctx.config.search.multi_pv.max(1));
        let ctx = self.ctx.clone();
        self.run_search(move |rules: &mut Board| {
            let fen = requested.unwrap_or_else(|| rules.current_position());
            async move { ctx.evaluate_lines(fen, lines).await }.boxed()
        })
        .await
    }

    /// Engine evaluation and tablebase lookup, run side by side.
    pub async fn get_dual_evaluation(&self, fen: &str) -> Result<DualEvaluation, ServiceError> {
        self.check_disposed()?;
        let fen = fen.trim().to_string();
        Self::check_fen(&fen)?;

        let ctx = self.ctx.clone();
        let tablebase = self.tablebase.clone();
        let tablebase_timeout = self.ctx.config.tablebase_timeout();
        let dual = self
            .run_search(move |_: &mut Board| {
                async move {
                    let (engine, tablebase) = tokio::join!(
                        ctx.evaluate(fen.clone()),
                        lookup_tablebase(tablebase, fen.clone(), tablebase_timeout)
                    );
                    Some(DualEvaluation { engine, tablebase })
                }
                .boxed()
            })
            .await?;
        Ok(dual.unwrap_or_default())
    }

    // *************** Lifecycle ***************

    /// Starts the engine now instead of on first use.
    pub async fn initialize(&self) -> Result<(), ServiceError> {
        self.check_disposed()?;
        let ctx = self.ctx.clone();
        let result = self
            .queue
            .run(move |_: &mut Board| async move { ctx.ensure_ready().await }.boxed())
            .await;
        match result {
            Ok(ready) => ready.map_err(ServiceError::from),
            Err(_) => Err(ServiceError::Disposed),
        }
    }

    /// Replaces the engine process with a fresh one.
    pub async fn restart(&self) -> Result<(), ServiceError> {
        self.check_disposed()?;
        let ctx = self.ctx.clone();
        let result = self
            .queue
            .run(move |_: &mut Board| {
                async move {
                    ctx.record(EngineAction::InitStart);
                    let result = ctx.worker.restart().await;
                    ctx.record_init(&result);
                    result
                }
                .boxed()
            })
            .await;
        match result {
            Ok(restarted) => restarted.map_err(ServiceError::from),
            Err(_) => Err(ServiceError::Disposed),
        }
    }

    /// Sends `setoption` to the engine. Returns whether it was delivered.
    pub async fn set_option(&self, name: &str, value: &str) -> Result<bool, ServiceError> {
        self.check_disposed()?;
        if !is_safe_argument(name) || !is_safe_argument(value) {
            return Err(ServiceError::InvalidArgument(format!(
                "invalid option {:?} = {:?}",
                name, value
            )));
        }
        let (name, value) = (name.trim().to_string(), value.trim().to_string());
        let ctx = self.ctx.clone();
        let sent = self
            .run_engine(move |_: &mut Board| {
                async move {
                    if let Err(error) = ctx.ensure_ready().await {
                        warn!(%error, option = %name, "engine unavailable, option not set");
                        return Some(false);
                    }
                    let sent = ctx.worker.send_command(&UciCommand::SetOption {
                        name: name.clone(),
                        value: value.clone(),
                    });
                    if sent {
                        ctx.record(EngineAction::ConfigUpdate { name, value });
                    }
                    Some(sent)
                }
                .boxed()
            })
            .await?;
        Ok(sent.unwrap_or(false))
    }

    /// Metrics snapshot from the state machine. Its `phase` is the mirrored
    /// one; [`worker_phase`](Self::worker_phase) reads the worker directly.
    pub fn state(&self) -> EngineState {
        self.ctx.machine.lock().clone()
    }

    pub fn worker_phase(&self) -> WorkerPhase {
        self.ctx.worker.phase()
    }

    /// Tears everything down. A second call returns [`ServiceError::Disposed`].
    pub fn shutdown(&self) -> Result<(), ServiceError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::Disposed);
        }
        info!("shutting down engine service");

        self.queue.close();
        let discarded = self.queue.clear();
        let cancelled = self.ctx.requests.cancel_all(CancelReason::Shutdown);
        self.ctx.worker.terminate();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        self.ctx.record(EngineAction::RequestCancelAll { count: cancelled });
        self.ctx.record(EngineAction::Terminate);
        debug!(discarded, cancelled, "engine service disposed");
        Ok(())
    }
}

impl Drop for EngineService {
    fn drop(&mut self) {
        if !self.is_disposed() {
            let _ = self.shutdown();
        }
    }
}

// *************** Tests ***************
