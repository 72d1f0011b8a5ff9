//! Error types for the fleetgrid state store.

use thiserror::Error;

use crate::types::ManifestState;

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

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Dirty write: the presented version is no longer the stored one.
    #[error("version mismatch for {name}: presented {expected}, stored {found}")]
    VersionMismatch {
        name: String,
        expected: u64,
        found: u64,
    },

    #[error("invalid manifest state transition {from} -> {to}")]
    InvalidTransition {
        from: ManifestState,
        to: ManifestState,
    },
}

impl StateError {
    /// True for a rejected compare-and-swap, the only retryable condition.
    pub fn is_dirty_write(&self) -> bool {
        matches!(self, StateError::VersionMismatch { .. })
    }
}
