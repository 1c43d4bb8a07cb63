use thiserror::Error;
use uuid::Uuid;

use crate::sessions::model::SessionStatus;

/// Failures of the durable session store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported store version {found} (expected {expected})")]
    UnsupportedVersion { found: String, expected: String },

    #[error("write conflict on session {0}")]
    Conflict(Uuid),
}

/// Errors surfaced by session lifecycle operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("cannot {action} session {id} while it is {from}")]
    InvalidTransition {
        id: Uuid,
        from: SessionStatus,
        action: &'static str,
    },

    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("actor '{actor}' may not {action}")]
    Forbidden { actor: String, action: &'static str },

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl SessionError {
    /// Stable machine-readable code for callers and the HTTP layer
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Validation(_) => "validation_error",
            SessionError::InvalidTransition { .. } => "invalid_transition",
            SessionError::NotFound(_) => "not_found",
            SessionError::Forbidden { .. } => "forbidden",
            SessionError::Persistence(_) => "persistence_error",
        }
    }

    /// Whether retrying the same call later could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Persistence(_))
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
pub type StoreResult<T> = Result<T, StoreError>;
