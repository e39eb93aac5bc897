//! Worker lifecycle management.
//! Owns the engine process: spawns it, runs the `uci`/`isready` handshake,
//! forwards commands while it is ready, and turns its output into
//! [`WorkerEvent`]s. A crashed or hung process is cleaned up here and reported
//! upwards; nothing outside this module ever touches the process handle.
//!
//! Latency: handshake is typically 50-300ms for Stockfish with NNUE loading.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{ProtocolError, WorkerError};
use crate::machine::WorkerPhase;
use crate::protocol::{parse_line, EngineOption, EngineResponse, UciCommand};

/// How long a process gets to honour `quit` before it is killed.
const QUIT_GRACE: Duration = Duration::from_millis(500);

// *************** Process abstraction ***************

/// Raw output of an engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    Line(String),
    Exited(Option<i32>),
    Failed(String),
}

/// Line-oriented connection to a running engine. Dropping `commands` shuts
/// the process down.
pub struct ProcessHandle {
    pub commands: mpsc::UnboundedSender<String>,
    pub output: mpsc::UnboundedReceiver<ProcessOutput>,
}

/// Starts engine processes. Swapped for an in-memory engine in tests.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self) -> Result<ProcessHandle, WorkerError>;
}

/// Spawns a real UCI binary (Stockfish or anything speaking the protocol).
pub struct UciProcessSpawner {
    path: PathBuf,
    args: Vec<String>,
}

impl UciProcessSpawner {
    pub fn new(path: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            path: path.into(),
            args,
        }
    }
}

#[async_trait]
impl ProcessSpawner for UciProcessSpawner {
    async fn spawn(&self) -> Result<ProcessHandle, WorkerError> {
        let mut child = Command::new(&self.path)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Spawn(format!("{}: {}", self.path.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("engine stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("engine stdout unavailable".into()))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise(child, stdin, stdout, command_rx, output_tx));

        debug!(path = %self.path.display(), "spawned engine process");
        Ok(ProcessHandle {
            commands: command_tx,
            output: output_rx,
        })
    }
}

/// Pumps commands into stdin and stdout lines out until either side goes away.
async fn supervise(
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    mut commands: mpsc::UnboundedReceiver<String>,
    output: mpsc::UnboundedSender<ProcessOutput>,
) {
    let mut lines = BufReader::new(stdout).split(b'\n');

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(line) => {
                    let mut bytes = line.into_bytes();
                    bytes.push(b'\n');
                    let written = match stdin.write_all(&bytes).await {
                        Ok(()) => stdin.flush().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = written {
                        let _ = output.send(ProcessOutput::Failed(format!("write to engine failed: {}", e)));
                        break;
                    }
                }
                None => {
                    let _ = stdin.write_all(b"quit\n").await;
                    let _ = stdin.flush().await;
                    if tokio::time::timeout(QUIT_GRACE, child.wait()).await.is_ok() {
                        return;
                    }
                    break;
                }
            },
            segment = lines.next_segment() => match segment {
                Ok(Some(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let line = text.trim_end_matches('\r').to_string();
                    if output.send(ProcessOutput::Line(line)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let code = child.wait().await.ok().and_then(|status| status.code());
                    let _ = output.send(ProcessOutput::Exited(code));
                    return;
                }
                Err(e) => {
                    let _ = output.send(ProcessOutput::Failed(format!("read from engine failed: {}", e)));
                    break;
                }
            },
        }
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill engine process");
    }
}

// *************** Lifecycle manager ***************

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub handshake_timeout: Duration,
    pub max_init_attempts: u32,
    /// `setoption` pairs applied after `uciok`, when the engine advertises them.
    pub options: Vec<(String, String)>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_init_attempts: 3,
            options: Vec::new(),
        }
    }
}

/// What the worker tells the rest of the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Response(EngineResponse),
    ProtocolError { line: String, error: ProtocolError },
    Crashed { reason: String },
}

#[derive(Default)]
struct WorkerInner {
    commands: Option<mpsc::UnboundedSender<String>>,
    pump: Option<JoinHandle<()>>,
    /// Bumped on every (re)start and teardown so stale pumps stay quiet.
    generation: u64,
    attempts: u32,
    crashed: bool,
    terminated: bool,
    last_error: Option<String>,
    engine_name: Option<String>,
    options: Vec<EngineOption>,
}

/// Sole owner of the engine process handle.
pub struct WorkerManager {
    spawner: Arc<dyn ProcessSpawner>,
    settings: WorkerSettings,
    inner: Arc<Mutex<WorkerInner>>,
    phase: Arc<watch::Sender<WorkerPhase>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    init_lock: tokio::sync::Mutex<()>,
}

impl WorkerManager {
    /// Creates the manager and the event stream it publishes to.
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        settings: WorkerSettings,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(WorkerPhase::Uninitialized);
        let manager = Self {
            spawner,
            settings,
            inner: Arc::new(Mutex::new(WorkerInner::default())),
            phase: Arc::new(phase),
            events,
            init_lock: tokio::sync::Mutex::new(()),
        };
        (manager, events_rx)
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerPhase> {
        self.phase.subscribe()
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// True if the last process died on its own rather than being shut down.
    pub fn crashed(&self) -> bool {
        self.inner.lock().crashed
    }

    pub fn engine_name(&self) -> Option<String> {
        self.inner.lock().engine_name.clone()
    }

    /// Options the engine advertised during the last handshake.
    pub fn options(&self) -> Vec<EngineOption> {
        self.inner.lock().options.clone()
    }

    /// Spawns the engine and completes the handshake.
    ///
    /// No-op when already ready. Gives up without spawning once
    /// `max_init_attempts` consecutive attempts have failed.
    pub async fn initialize(&self) -> Result<(), WorkerError> {
        let _init = self.init_lock.lock().await;

        match self.phase() {
            WorkerPhase::Ready => return Ok(()),
            WorkerPhase::Terminated => return Err(WorkerError::Terminated),
            _ => {}
        }

        let attempt = {
            let mut inner = self.inner.lock();
            if inner.attempts >= self.settings.max_init_attempts {
                warn!(attempts = inner.attempts, "engine initialization attempts exhausted");
                return Err(WorkerError::AttemptsExhausted {
                    attempts: inner.attempts,
                });
            }
            inner.attempts += 1;
            inner.attempts
        };

        self.phase.send_replace(WorkerPhase::Initializing);
        info!(attempt, max = self.settings.max_init_attempts, "starting engine");

        let result = match self.spawner.spawn().await {
            Ok(handle) => self.handshake(handle).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(ready) => self.commit(ready),
            Err(error) => {
                self.inner.lock().last_error = Some(error.to_string());
                self.phase.send_replace(WorkerPhase::Error);
                warn!(%error, attempt, "engine initialization failed");
                Err(error)
            }
        }
    }

    /// Parks until the engine is ready, failed, or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), WorkerError> {
        let mut rx = self.phase.subscribe();
        let settled = rx.wait_for(|phase| {
            matches!(
                phase,
                WorkerPhase::Ready | WorkerPhase::Error | WorkerPhase::Terminated
            )
        });
        match tokio::time::timeout(timeout, settled).await.map(|r| r.map(|phase| *phase)) {
            Ok(Ok(WorkerPhase::Ready)) => Ok(()),
            Ok(Ok(WorkerPhase::Terminated)) | Ok(Err(_)) => Err(WorkerError::Terminated),
            Ok(Ok(phase)) => Err(WorkerError::NotReady(phase.to_string())),
            Err(_) => Err(WorkerError::HandshakeTimeout(timeout)),
        }
    }

    /// Sends a command if the engine is ready. Never fails loudly.
    pub fn send_command(&self, command: &UciCommand) -> bool {
        let phase = self.phase();
        if phase != WorkerPhase::Ready {
            debug!(%command, %phase, "dropping command, engine not ready");
            return false;
        }
        let inner = self.inner.lock();
        let Some(commands) = inner.commands.as_ref() else {
            debug!(%command, "dropping command, no engine process");
            return false;
        };
        trace!(%command, "engine <<");
        if commands.send(command.to_string()).is_err() {
            warn!(%command, "engine stdin closed, command lost");
            return false;
        }
        true
    }

    /// Releases the process handle. Safe to call any number of times.
    pub fn cleanup(&self) {
        self.release();
        if self.phase() != WorkerPhase::Terminated {
            self.phase.send_replace(WorkerPhase::Uninitialized);
        }
    }

    /// Shuts the engine down for good.
    pub fn terminate(&self) {
        self.inner.lock().terminated = true;
        let previous = self.phase.send_replace(WorkerPhase::Terminated);
        self.release();
        if previous != WorkerPhase::Terminated {
            info!("engine worker terminated");
        }
    }

    fn release(&self) {
        let (commands, pump) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            (inner.commands.take(), inner.pump.take())
        };
        let had_process = commands.is_some();
        // Dropping the sender asks the supervisor to quit and reap the process.
        drop(commands);
        if let Some(pump) = pump {
            pump.abort();
        }
        if had_process {
            debug!("released engine process");
        }
    }

    /// Tears the current process down and starts a fresh one with a clean
    /// attempt counter.
    pub async fn restart(&self) -> Result<(), WorkerError> {
        if self.inner.lock().terminated {
            return Err(WorkerError::Terminated);
        }
        info!("restarting engine");
        self.cleanup();
        {
            let mut inner = self.inner.lock();
            inner.attempts = 0;
            inner.crashed = false;
        }
        self.initialize().await
    }

    async fn handshake(&self, handle: ProcessHandle) -> Result<Handshaken, WorkerError> {
        let ProcessHandle {
            commands,
            mut output,
        } = handle;
        let timeout = self.settings.handshake_timeout;

        let exchange = async {
            let mut options = Vec::new();
            let mut name = None;

            push(&commands, &UciCommand::Uci)?;
            wait_for(&mut output, |response| match response {
                EngineResponse::UciOk => true,
                EngineResponse::Option(option) => {
                    options.push(option);
                    false
                }
                EngineResponse::Id { key, value } if key == "name" => {
                    name = Some(value);
                    false
                }
                _ => false,
            })
            .await?;

            for (option, value) in &self.settings.options {
                if options.iter().any(|o: &EngineOption| o.name.eq_ignore_ascii_case(option)) {
                    push(
                        &commands,
                        &UciCommand::SetOption {
                            name: option.clone(),
                            value: value.clone(),
                        },
                    )?;
                } else {
                    warn!(%option, "engine does not advertise option, skipping");
                }
            }

            push(&commands, &UciCommand::IsReady)?;
            wait_for(&mut output, |response| response == EngineResponse::ReadyOk).await?;
            Ok::<_, WorkerError>((options, name))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok((options, name))) => Ok(Handshaken {
                commands,
                output,
                options,
                name,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WorkerError::HandshakeTimeout(timeout)),
        }
    }

    fn commit(&self, ready: Handshaken) -> Result<(), WorkerError> {
        let Handshaken {
            commands,
            output,
            options,
            name,
        } = ready;

        let generation = {
            let mut inner = self.inner.lock();
            if inner.terminated {
                return Err(WorkerError::Terminated);
            }
            inner.generation += 1;
            inner.attempts = 0;
            inner.crashed = false;
            inner.last_error = None;
            inner.commands = Some(commands);
            inner.options = options;
            inner.engine_name = name;
            inner.generation
        };

        self.phase.send_replace(WorkerPhase::Ready);
        info!(engine = ?self.engine_name(), "engine ready");

        let pump = tokio::spawn(pump(
            self.inner.clone(),
            self.phase.clone(),
            self.events.clone(),
            output,
            generation,
        ));
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.pump = Some(pump);
        }
        Ok(())
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

struct Handshaken {
    commands: mpsc::UnboundedSender<String>,
    output: mpsc::UnboundedReceiver<ProcessOutput>,
    options: Vec<EngineOption>,
    name: Option<String>,
}

fn push(commands: &mpsc::UnboundedSender<String>, command: &UciCommand) -> Result<(), WorkerError> {
    trace!(%command, "engine <<");
    commands
        .send(command.to_string())
        .map_err(|_| WorkerError::HandshakeFailed("engine stdin closed".into()))
}

async fn wait_for(
    output: &mut mpsc::UnboundedReceiver<ProcessOutput>,
    mut done: impl FnMut(EngineResponse) -> bool,
) -> Result<(), WorkerError> {
    while let Some(item) = output.recv().await {
        match item {
            ProcessOutput::Line(line) => match parse_line(&line) {
                Ok(response) => {
                    if done(response) {
                        return Ok(());
                    }
                }
                Err(error) => debug!(%error, "ignoring malformed handshake line"),
            },
            ProcessOutput::Exited(code) => {
                return Err(WorkerError::HandshakeFailed(format!("exit code {:?}", code)));
            }
            ProcessOutput::Failed(reason) => return Err(WorkerError::HandshakeFailed(reason)),
        }
    }
    Err(WorkerError::HandshakeFailed("engine output closed".into()))
}

/// Forwards parsed engine output until the process goes away, then reports
/// a crash unless the manager has already moved on.
async fn pump(
    inner: Arc<Mutex<WorkerInner>>,
    phase: Arc<watch::Sender<WorkerPhase>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    mut output: mpsc::UnboundedReceiver<ProcessOutput>,
    generation: u64,
) {
    let reason = loop {
        match output.recv().await {
            Some(ProcessOutput::Line(line)) => {
                trace!(%line, "engine >>");
                let event = match parse_line(&line) {
                    Ok(response) => WorkerEvent::Response(response),
                    Err(error) => {
                        warn!(%line, %error, "malformed engine output");
                        WorkerEvent::ProtocolError { line, error }
                    }
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Some(ProcessOutput::Exited(code)) => {
                break match code {
                    Some(code) => format!("engine exited with code {}", code),
                    None => "engine killed by signal".to_string(),
                };
            }
            Some(ProcessOutput::Failed(reason)) => break reason,
            None => break "engine output closed".to_string(),
        }
    };

    let current = {
        let mut inner = inner.lock();
        if inner.generation != generation || inner.commands.is_none() {
            false
        } else {
            inner.generation += 1;
            inner.commands = None;
            inner.pump = None;
            inner.crashed = true;
            inner.last_error = Some(reason.clone());
            true
        }
    };

    if current {
        error!(%reason, "engine crashed");
        phase.send_replace(WorkerPhase::Error);
        let _ = events.send(WorkerEvent::Crashed { reason });
    }
}

// *************** Tests ***************
