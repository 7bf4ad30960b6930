//! Tracker error types.

use thiserror::Error;
use uuid::Uuid;

use flowplane_dispatch::DispatchError;
use flowplane_state::{ErrorKind, RunState, StateError};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("flow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(Uuid),

    /// Heartbeats are only accepted from running or cancelling runs.
    #[error("flow run {run_id} is {state:?} and does not accept heartbeats")]
    NotRunning { run_id: Uuid, state: RunState },

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

impl TrackerError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            TrackerError::Dispatch(e) => e.kind(),
            TrackerError::State(e) => e.kind(),
            _ => None,
        }
    }
}
