//! Engine state machine.
//!
//! A pure reducer over [`EngineAction`]s that mirrors what the worker and the
//! service are doing. It is an observability aid: nothing reads it to decide
//! behavior, so every action is accepted and no transition can fail.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::requests::RequestId;

/// Lifecycle phase of the engine worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum WorkerPhase {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Error,
    Terminated,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerPhase::Uninitialized => "uninitialized",
            WorkerPhase::Initializing => "initializing",
            WorkerPhase::Ready => "ready",
            WorkerPhase::Error => "error",
            WorkerPhase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    InitStart,
    InitSuccess,
    InitFailure { error: String },
    Ready,
    Error { message: String },
    Terminate,
    RequestEnqueue,
    RequestStart { id: RequestId },
    RequestSuccess { id: RequestId, latency: Duration },
    RequestFailure { id: RequestId, error: String },
    RequestTimeout { id: RequestId },
    RequestCancel { id: RequestId },
    RequestCancelAll { count: usize },
    ConfigUpdate { name: String, value: String },
    Reset,
}

/// Snapshot of the engine as seen from the outside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineState {
    pub phase: WorkerPhase,
    pub init_attempts: u32,
    pub last_error: Option<String>,
    pub queue_depth: usize,
    #[serde(skip)]
    pub in_flight: Option<RequestId>,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    #[serde(skip)]
    pub total_latency: Duration,
    pub options: BTreeMap<String, String>,
}

impl EngineState {
    /// Fraction of finished requests that succeeded, `None` before the first one.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.completed + self.failed + self.timed_out + self.cancelled;
        (finished > 0).then(|| self.completed as f64 / finished as f64)
    }

    pub fn average_latency(&self) -> Option<Duration> {
        let completed = u32::try_from(self.completed).ok().filter(|n| *n > 0)?;
        Some(self.total_latency / completed)
    }
}

/// Applies one action, returning the next state.
pub fn reduce(state: &EngineState, action: EngineAction) -> EngineState {
    let mut next = state.clone();

    if state.phase == WorkerPhase::Terminated && action != EngineAction::Reset {
        return next;
    }

    match action {
        EngineAction::InitStart => {
            next.phase = WorkerPhase::Initializing;
            next.init_attempts += 1;
        }
        EngineAction::InitSuccess | EngineAction::Ready => {
            next.phase = WorkerPhase::Ready;
            next.init_attempts = 0;
            next.last_error = None;
        }
        EngineAction::InitFailure { error } => {
            next.phase = WorkerPhase::Error;
            next.last_error = Some(error);
        }
        EngineAction::Error { message } => {
            next.phase = WorkerPhase::Error;
            next.last_error = Some(message);
            next.in_flight = None;
        }
        EngineAction::Terminate => {
            next.phase = WorkerPhase::Terminated;
            next.queue_depth = 0;
            next.in_flight = None;
        }
        EngineAction::RequestEnqueue => next.queue_depth += 1,
        EngineAction::RequestStart { id } => {
            next.queue_depth = next.queue_depth.saturating_sub(1);
            next.in_flight = Some(id);
        }
        EngineAction::RequestSuccess { id, latency } => {
            finish(&mut next, &id);
            next.completed += 1;
            next.total_latency += latency;
        }
        EngineAction::RequestFailure { id, error } => {
            finish(&mut next, &id);
            next.failed += 1;
            next.last_error = Some(error);
        }
        EngineAction::RequestTimeout { id } => {
            finish(&mut next, &id);
            next.timed_out += 1;
        }
        EngineAction::RequestCancel { id } => {
            finish(&mut next, &id);
            next.cancelled += 1;
        }
        EngineAction::RequestCancelAll { count } => {
            next.in_flight = None;
            next.queue_depth = 0;
            next.cancelled += count as u64;
        }
        EngineAction::ConfigUpdate { name, value } => {
            next.options.insert(name, value);
        }
        EngineAction::Reset => next = EngineState::default(),
    }

    next
}

fn finish(state: &mut EngineState, id: &RequestId) {
    if state.in_flight.as_ref() == Some(id) {
        state.in_flight = None;
    }
}
