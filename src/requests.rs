//! Request correlation.
//! Every question we put to the engine gets an id, a one-shot completion
//! channel and a timer. Responses are matched back by id (and kind), and each
//! entry is completed exactly once: resolve, reject, timeout and cancel all
//! remove the entry under the lock before touching its channel.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CancelReason, CorrelationError, RequestError};
use crate::protocol::{BestMoveSignal, Evaluation, InfoFragment};

/// What a request asks the engine for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    BestMove,
    Evaluation,
    MultiLine,
    /// `isready` / `readyok` round trip.
    Sync,
}

impl RequestKind {
    fn tag(self) -> &'static str {
        match self {
            RequestKind::BestMove => "best",
            RequestKind::Evaluation => "eval",
            RequestKind::MultiLine => "multi",
            RequestKind::Sync => "sync",
        }
    }

    /// Kinds answered by a `bestmove` line.
    pub fn is_search(self) -> bool {
        !matches!(self, RequestKind::Sync)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::BestMove => "best-move",
            RequestKind::Evaluation => "evaluation",
            RequestKind::MultiLine => "multi-line-evaluation",
            RequestKind::Sync => "sync",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One question for the engine. Immutable once registered.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    pub position: String,
    pub time_limit: Duration,
    pub created_at: Instant,
}

impl Request {
    pub fn new(id: RequestId, kind: RequestKind, position: impl Into<String>, time_limit: Duration) -> Self {
        Self {
            id,
            kind,
            position: position.into(),
            time_limit,
            created_at: Instant::now(),
        }
    }
}

/// Result of a best-move search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BestMove {
    /// `None` when the position has no legal moves.
    pub uci: Option<String>,
    pub ponder: Option<String>,
    pub evaluation: Option<Evaluation>,
}

/// What a request resolves to, one variant per [`RequestKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    BestMove(BestMove),
    Evaluation(Evaluation),
    MultiLine(Vec<Evaluation>),
    Synced,
}

impl RequestOutcome {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestOutcome::BestMove(_) => RequestKind::BestMove,
            RequestOutcome::Evaluation(_) => RequestKind::Evaluation,
            RequestOutcome::MultiLine(_) => RequestKind::MultiLine,
            RequestOutcome::Synced => RequestKind::Sync,
        }
    }
}

pub type Completion = Result<RequestOutcome, RequestError>;

struct PendingEntry {
    request: Request,
    responder: oneshot::Sender<Completion>,
    timer: JoinHandle<()>,
    partial: Option<Evaluation>,
    lines: BTreeMap<u32, Evaluation>,
}

impl PendingEntry {
    fn finish(self, completion: Completion) {
        self.timer.abort();
        // The caller may have stopped listening; that is not our problem.
        let _ = self.responder.send(completion);
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    pending: HashMap<RequestId, PendingEntry>,
}

/// Id-keyed table of in-flight requests. Cheap to clone.
#[derive(Clone)]
pub struct RequestManager {
    registry: Arc<Mutex<Registry>>,
    timeout_buffer: Duration,
}

impl RequestManager {
    pub fn new(timeout_buffer: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            timeout_buffer,
        }
    }

    pub fn timeout_buffer(&self) -> Duration {
        self.timeout_buffer
    }

    /// Returns an id unique for the lifetime of this manager.
    pub fn generate_id(&self, kind: RequestKind) -> RequestId {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        RequestId(format!("{}-{}", kind.tag(), registry.next_id))
    }

    /// Stores the request and arms its timer for `timeout` plus the jitter buffer.
    ///
    /// Must be called from inside a tokio runtime. Registering an id that is
    /// already pending cancels the old entry first.
    pub fn register(&self, request: Request, timeout: Duration) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        let id = request.id.clone();
        let deadline = timeout + self.timeout_buffer;

        let stale = {
            let mut registry = self.registry.lock();
            let stale = registry.pending.remove(&id);
            // Spawned under the lock so the timer cannot run before the entry exists.
            let timer = spawn_timer(Arc::downgrade(&self.registry), id.clone(), deadline);
            registry.pending.insert(
                id.clone(),
                PendingEntry {
                    request,
                    responder: tx,
                    timer,
                    partial: None,
                    lines: BTreeMap::new(),
                },
            );
            stale
        };

        if let Some(stale) = stale {
            warn!(request = %id, "re-registered pending request, cancelling the old one");
            stale.finish(Err(RequestError::Cancelled {
                id: id.clone(),
                reason: CancelReason::Superseded,
            }));
        }
        debug!(request = %id, ?deadline, "registered request");
        rx
    }

    /// Completes a pending request whose kind matches the outcome.
    ///
    /// A kind mismatch leaves the entry pending.
    pub fn resolve(&self, id: &RequestId, outcome: RequestOutcome) -> Result<(), CorrelationError> {
        let entry = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.pending.get(id) else {
                return Err(CorrelationError::Unknown(id.clone()));
            };
            if entry.request.kind != outcome.kind() {
                return Err(CorrelationError::KindMismatch {
                    id: id.clone(),
                    expected: entry.request.kind,
                    actual: outcome.kind(),
                });
            }
            registry.pending.remove(id)
        };
        if let Some(entry) = entry {
            debug!(request = %id, elapsed = ?entry.request.created_at.elapsed(), "resolved request");
            entry.finish(Ok(outcome));
        }
        Ok(())
    }

    /// Fails a pending request. Returns false if it was already gone.
    pub fn reject(&self, id: &RequestId, error: RequestError) -> bool {
        let entry = self.registry.lock().pending.remove(id);
        match entry {
            Some(entry) => {
                debug!(request = %id, %error, "rejected request");
                entry.finish(Err(error));
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, id: &RequestId) -> bool {
        self.reject(
            id,
            RequestError::Cancelled {
                id: id.clone(),
                reason: CancelReason::Caller,
            },
        )
    }

    /// Cancels every pending request with the same reason. Returns the count.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let drained: Vec<(RequestId, PendingEntry)> = self.registry.lock().pending.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.finish(Err(RequestError::Cancelled {
                id,
                reason: reason.clone(),
            }));
        }
        if count > 0 {
            info!(count, %reason, "cancelled all pending requests");
        }
        count
    }

    /// Folds an `info` fragment into the request's running evaluation.
    pub fn record_info(&self, id: &RequestId, fragment: &InfoFragment) -> bool {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.pending.get_mut(id) else {
            return false;
        };
        if !fragment.has_evaluation() && fragment.depth.is_none() {
            return true;
        }
        match entry.request.kind {
            RequestKind::MultiLine => {
                let index = fragment.multipv.unwrap_or(1);
                entry
                    .lines
                    .entry(index)
                    .and_modify(|line| line.merge(fragment))
                    .or_insert_with(|| {
                        let mut line = Evaluation::from_fragment(fragment);
                        line.multipv = Some(index);
                        line
                    });
            }
            RequestKind::Sync => return false,
            _ => {
                // With MultiPV > 1 only the top line describes the position.
                if fragment.multipv.is_some_and(|index| index > 1) {
                    return true;
                }
                entry
                    .partial
                    .get_or_insert_with(Evaluation::default)
                    .merge(fragment);
            }
        }
        true
    }

    /// Freezes the accumulated evaluation and resolves the request with it.
    pub fn complete(&self, id: &RequestId, signal: BestMoveSignal) -> Result<(), CorrelationError> {
        let outcome = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.pending.get_mut(id) else {
                return Err(CorrelationError::Unknown(id.clone()));
            };
            match entry.request.kind {
                RequestKind::BestMove => RequestOutcome::BestMove(BestMove {
                    uci: signal.best,
                    ponder: signal.ponder,
                    evaluation: entry.partial.take(),
                }),
                RequestKind::Evaluation => {
                    RequestOutcome::Evaluation(entry.partial.take().unwrap_or_default())
                }
                RequestKind::MultiLine => {
                    RequestOutcome::MultiLine(std::mem::take(&mut entry.lines).into_values().collect())
                }
                RequestKind::Sync => {
                    return Err(CorrelationError::KindMismatch {
                        id: id.clone(),
                        expected: RequestKind::Sync,
                        actual: RequestKind::BestMove,
                    });
                }
            }
        };
        self.resolve(id, outcome)
    }

    /// Cancels requests older than `max_age`. Returns how many were swept.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let stale: Vec<(RequestId, PendingEntry)> = {
            let mut registry = self.registry.lock();
            let ids: Vec<RequestId> = registry
                .pending
                .iter()
                .filter(|(_, entry)| entry.request.created_at.elapsed() > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| registry.pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        let count = stale.len();
        for (id, entry) in stale {
            warn!(request = %id, age = ?entry.request.created_at.elapsed(), "sweeping stale request");
            entry.finish(Err(RequestError::Cancelled {
                id,
                reason: CancelReason::Stale,
            }));
        }
        count
    }

    /// Runs [`cleanup_stale`](Self::cleanup_stale) every `interval` until aborted.
    pub fn spawn_sweeper(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let swept = manager.cleanup_stale(max_age);
                if swept > 0 {
                    info!(swept, "stale request sweep");
                }
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.registry.lock().pending.len()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.registry.lock().pending.contains_key(id)
    }
}

fn spawn_timer(registry: Weak<Mutex<Registry>>, id: RequestId, deadline: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        let Some(registry) = registry.upgrade() else {
            return;
        };
        let entry = registry.lock().pending.remove(&id);
        if let Some(entry) = entry {
            warn!(request = %id, ?deadline, "request timed out");
            // Aborting our own handle is harmless: we are past the last await.
            entry.finish(Err(RequestError::Timeout { id, after: deadline }));
        }
    })
}

// *************** Tests ***************
