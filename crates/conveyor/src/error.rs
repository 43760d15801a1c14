//! Engine error type.
//!
//! Expected races surface either as typed result values or as
//! [`EngineError::ServiceValidation`]; the remaining variants are integrity or
//! infrastructure failures the caller propagates.

use conveyor_backends_core::BackendError;
use conveyor_run_core::{RunId, SnapshotId};

use crate::run_queue::{CodecError, KeyError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The request lost a race or violated a policy; `status` is HTTP-like.
    #[error("{message}")]
    ServiceValidation { message: String, status: u16 },

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),

    #[error("environment {0} not found")]
    EnvironmentNotFound(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("timed out after {timeout_ms}ms waiting for the lock on run {run_id}")]
    LockTimeout { run_id: RunId, timeout_ms: u64 },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl EngineError {
    pub fn validation(status: u16, message: impl Into<String>) -> Self {
        Self::ServiceValidation {
            message: message.into(),
            status,
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::ServiceValidation { status, .. } => *status,
            Self::RunNotFound(_) | Self::SnapshotNotFound(_) | Self::EnvironmentNotFound(_) => 404,
            Self::LockTimeout { .. } => 503,
            _ => 500,
        }
    }

    /// Routine outcome under concurrent callers rather than a broken invariant.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::ServiceValidation { .. } | Self::LockTimeout { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_expected() {
        let err = EngineError::validation(400, "Not the latest snapshot");
        assert!(err.is_expected());
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_string(), "Not the latest snapshot");

        let err = EngineError::RunNotFound(RunId::new());
        assert!(!err.is_expected());
        assert_eq!(err.status_code(), 404);
    }
}
