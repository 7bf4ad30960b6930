//! Error types for the flowplane state store.

use thiserror::Error;

use crate::types::{ErrorKind, RunState};

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid run state transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunState, to: RunState },
}

impl StateError {
    /// Storage failures are not part of the run error taxonomy.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StateError::Conflict(_) => Some(ErrorKind::ConfigurationError),
            _ => None,
        }
    }

    /// Storage-level failures that may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Open(_)
                | StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
        )
    }
}
