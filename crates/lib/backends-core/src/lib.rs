//! Core primitives shared by the conveyor backend traits.

/// The common backend error for the relational store and the shared store.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),

    /// A conditional write lost against a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Utility type alias for backend results.
pub type BackendResult<T> = Result<T, BackendError>;
