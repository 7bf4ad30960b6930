//! Queue error types.

use thiserror::Error;
use uuid::Uuid;

use flowplane_core::SchemaViolation;
use flowplane_state::{ErrorKind, StateError};

/// Errors that can occur while accepting, ordering or admitting run requests.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("deployment not found: {0}")]
    DeploymentNotFound(Uuid),

    #[error("work pool not found: {0}")]
    PoolNotFound(String),

    #[error("work queue not found: {0}")]
    QueueNotFound(String),

    #[error("parameters rejected: {}", join(.0))]
    InvalidParameters(Vec<SchemaViolation>),

    #[error("job variables rejected: {}", join(.0))]
    InvalidJobVariables(Vec<SchemaViolation>),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            QueueError::InvalidParameters(_) | QueueError::InvalidJobVariables(_) => {
                Some(ErrorKind::ConfigurationError)
            }
            QueueError::State(e) => e.kind(),
            _ => None,
        }
    }
}

fn join(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
