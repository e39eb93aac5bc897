//! In-memory UCI engine for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::WorkerError;
use crate::worker::{ProcessHandle, ProcessOutput, ProcessSpawner};

/// How the fake reacts to `go`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMode {
    /// Answers with info lines and `bestmove e2e4 ponder e7e5`.
    Normal,
    /// Ignores `go` and `stop`, still answers `isready`.
    Silent,
    /// Exits with code 139 on `go`.
    CrashOnGo,
    /// Never completes the handshake.
    NoHandshake,
    /// Sends a non-ASCII info line, then a normal reply.
    Garbage,
    /// Behaves as if the side to move is checkmated.
    Mated,
    /// Ignores `go`. On `stop` sends a non-ASCII line, then `bestmove a2a3`
    /// after the think time.
    LateReply,
}

const LINES: [&str; 3] = ["e2e4 e7e5 g1f3", "d2d4 d7d5 c2c4", "g1f3 g8f6 c2c4"];

struct FakeState {
    mode: Mutex<FakeMode>,
    think: Mutex<Duration>,
    log: Mutex<Vec<String>>,
    spawns: AtomicUsize,
    /// Output side of the most recently spawned process.
    output: Mutex<Option<mpsc::UnboundedSender<ProcessOutput>>>,
}

#[derive(Clone)]
pub struct FakeEngine {
    state: Arc<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_mode(FakeMode::Normal)
    }

    pub fn with_mode(mode: FakeMode) -> Self {
        Self {
            state: Arc::new(FakeState {
                mode: Mutex::new(mode),
                think: Mutex::new(Duration::from_millis(5)),
                log: Mutex::new(Vec::new()),
                spawns: AtomicUsize::new(0),
                output: Mutex::new(None),
            }),
        }
    }

    pub fn set_mode(&self, mode: FakeMode) {
        *self.state.mode.lock() = mode;
    }

    pub fn set_think_time(&self, think: Duration) {
        *self.state.think.lock() = think;
    }

    /// Every line received, across all spawned processes.
    pub fn commands(&self) -> Vec<String> {
        self.state.log.lock().clone()
    }

    pub fn spawns(&self) -> usize {
        self.state.spawns.load(Ordering::SeqCst)
    }

    /// Makes the current process exit with code 139 right now.
    pub fn crash(&self) {
        if let Some(output) = self.state.output.lock().take() {
            let _ = output.send(ProcessOutput::Exited(Some(139)));
        }
    }
}

#[async_trait]
impl ProcessSpawner for FakeEngine {
    async fn spawn(&self) -> Result<ProcessHandle, WorkerError> {
        self.state.spawns.fetch_add(1, Ordering::SeqCst);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        *self.state.output.lock() = Some(output_tx.clone());
        tokio::spawn(run(self.state.clone(), command_rx, output_tx));
        Ok(ProcessHandle {
            commands: command_tx,
            output: output_rx,
        })
    }
}

async fn run(
    state: Arc<FakeState>,
    mut commands: mpsc::UnboundedReceiver<String>,
    output: mpsc::UnboundedSender<ProcessOutput>,
) {
    let say = |text: &str| {
        let _ = output.send(ProcessOutput::Line(text.to_string()));
    };
    let mut multi_pv = 1usize;

    while let Some(line) = commands.recv().await {
        state.log.lock().push(line.clone());
        let mode = *state.mode.lock();
        let think = *state.think.lock();
        let mut words = line.split_whitespace();

        match words.next().unwrap_or("") {
            "uci" if mode != FakeMode::NoHandshake => {
                say("id name FakeFish");
                say("id author Test Suite");
                say("option name Hash type spin default 16 min 1 max 1024");
                say("option name Threads type spin default 1 min 1 max 8");
                say("option name MultiPV type spin default 1 min 1 max 5");
                say("uciok");
            }
            "isready" if mode != FakeMode::NoHandshake => say("readyok"),
            "setoption" => {
                let words: Vec<&str> = words.collect();
                if words.get(1) == Some(&"MultiPV") {
                    multi_pv = words.get(3).and_then(|v| v.parse().ok()).unwrap_or(1);
                }
            }
            "go" => match mode {
                FakeMode::Normal | FakeMode::NoHandshake => {
                    tokio::time::sleep(think).await;
                    for index in 1..=multi_pv.min(LINES.len()) {
                        let score = 40 - 15 * index as i32;
                        say(&format!(
                            "info depth 12 seldepth 16 multipv {} score cp {} nodes 48000 nps 960000 time 50 pv {}",
                            index,
                            score,
                            LINES[index - 1]
                        ));
                    }
                    say("bestmove e2e4 ponder e7e5");
                }
                FakeMode::Garbage => {
                    say("info depth 3 score cp 12 pv e2e4 \u{2717}");
                    say("bestmove e2e4");
                }
                FakeMode::Mated => {
                    say("info depth 0 score mate 0");
                    say("bestmove (none)");
                }
                FakeMode::CrashOnGo => {
                    let _ = output.send(ProcessOutput::Exited(Some(139)));
                    return;
                }
                FakeMode::Silent | FakeMode::LateReply => {}
            },
            "stop" if mode == FakeMode::LateReply => {
                say("info string stopping \u{2717}");
                tokio::time::sleep(think).await;
                say("bestmove a2a3");
            }
            "quit" => return,
            _ => {}
        }
    }
}
