//! Error types for the engine orchestration layer.
//!
//! Each component gets its own enum so callers can tell a bad protocol line
//! from a dead engine from a disposed service. The binary wraps all of them in
//! `anyhow` at the edges.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::requests::{RequestId, RequestKind};

/// Errors produced while parsing a single line of engine output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("line contains non-ASCII bytes: {line:?}")]
    NonAscii { line: String },

    #[error("unexpected line break inside protocol line")]
    LineBreak,

    #[error("invalid integer {value:?} for `{key}`")]
    InvalidInteger { key: &'static str, value: String },

    #[error("`{key}` is missing its value")]
    MissingValue { key: &'static str },

    #[error("bestmove line without a move")]
    MissingMove,

    #[error("option line without a name")]
    MissingOptionName,
}

/// Errors raised by the worker lifecycle manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("failed to spawn engine: {0}")]
    Spawn(String),

    #[error("engine handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("engine exited during handshake: {0}")]
    HandshakeFailed(String),

    #[error("engine initialization gave up after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    #[error("engine is not ready (phase: {0})")]
    NotReady(String),

    #[error("engine worker has been terminated")]
    Terminated,
}

/// Why a pending request was cancelled rather than answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit `cancel(id)` by the owner of the request.
    Caller,
    /// A new registration reused the id.
    Superseded,
    /// Swept by the stale-request maintenance pass.
    Stale,
    /// The service is shutting down.
    Shutdown,
    /// The engine process died.
    Crash(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Caller => write!(f, "cancelled by caller"),
            CancelReason::Superseded => write!(f, "superseded by a newer request"),
            CancelReason::Stale => write!(f, "stale request swept"),
            CancelReason::Shutdown => write!(f, "engine service shut down"),
            CancelReason::Crash(reason) => write!(f, "engine crashed: {}", reason),
        }
    }
}

/// Failure delivered to the caller waiting on a single request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("request {id} timed out after {after:?}")]
    Timeout { id: RequestId, after: Duration },

    #[error("request {id} cancelled: {reason}")]
    Cancelled { id: RequestId, reason: CancelReason },

    #[error("request {id} failed: {message}")]
    Engine { id: RequestId, message: String },

    #[error("request was dropped before completion")]
    Dropped,
}

impl RequestError {
    /// True when the request died because the engine process crashed.
    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            RequestError::Cancelled {
                reason: CancelReason::Crash(_),
                ..
            }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Timeout { .. })
    }
}

/// Returned when a response cannot be matched to a pending request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("no pending request with id {0}")]
    Unknown(RequestId),

    #[error("request {id} is a {expected} request, got a {actual} response")]
    KindMismatch {
        id: RequestId,
        expected: RequestKind,
        actual: RequestKind,
    },
}

/// Errors from the command queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("command queue is closed")]
    Closed,

    #[error("queued command was discarded before it ran")]
    Discarded,
}

/// Errors surfaced by the public engine service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("engine service has been disposed")]
    Disposed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Errors from the tablebase collaborator.
#[derive(Error, Debug)]
pub enum TablebaseError {
    #[error("tablebase request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tablebase returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("tablebase lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid FEN for tablebase lookup: {0}")]
    InvalidFen(String),
}
