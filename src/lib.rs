//! Orchestration layer between a chess trainer and an external UCI engine.
//!
//! [`EngineService`] is the entry point: it owns the engine process, a FIFO
//! queue of board/engine jobs, and the request bookkeeping that matches the
//! engine's asynchronous replies to the callers waiting for them.

pub mod config;
pub mod engine;
pub mod error;
pub mod machine;
pub mod protocol;
pub mod queue;
pub mod requests;
pub mod rules;
pub mod service;
pub mod tablebase;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::{Config, load_config};
pub use error::{ProtocolError, QueueError, RequestError, ServiceError, TablebaseError, WorkerError};
pub use machine::{EngineAction, EngineState, WorkerPhase};
pub use protocol::{Evaluation, UciCommand};
pub use requests::BestMove;
pub use rules::{AppliedMove, ChessRules, MoveRequest, ShakmatyRules};
pub use service::{DualEvaluation, EngineService};
pub use tablebase::{LichessTablebase, Tablebase, TablebaseEntry};
pub use worker::{ProcessSpawner, UciProcessSpawner};
