//! Manager error types.
//!
//! Every failure of a manager operation maps onto one of a small fixed set
//! of [`Code`]s that callers (the HTTP layer, builder workers) branch on.

use fleetgrid_state::StateError;
use thiserror::Error;

/// Errors that can occur during manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("version mismatch for {name}: presented {presented}, stored {stored}")]
    VersionMismatch {
        name: String,
        presented: u64,
        stored: u64,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

/// Status codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    NotFound,
    Aborted,
    FailedPrecondition,
    InvalidArgument,
    Internal,
}

impl ManagerError {
    pub fn code(&self) -> Code {
        match self {
            ManagerError::NotFound(_) => Code::NotFound,
            ManagerError::VersionMismatch { .. } | ManagerError::Aborted(_) => Code::Aborted,
            ManagerError::FailedPrecondition(_) => Code::FailedPrecondition,
            ManagerError::Validation(_) | ManagerError::InvalidArgument(_) => {
                Code::InvalidArgument
            }
            ManagerError::Internal(_) => Code::Internal,
            ManagerError::State(err) => match err {
                StateError::NotFound(_) => Code::NotFound,
                StateError::VersionMismatch { .. } => Code::Aborted,
                StateError::AlreadyExists(_) => Code::Aborted,
                StateError::InvalidTransition { .. } => Code::FailedPrecondition,
                _ => Code::Internal,
            },
        }
    }

    /// True for a rejected compare-and-swap.
    pub fn is_dirty_write(&self) -> bool {
        match self {
            ManagerError::VersionMismatch { .. } => true,
            ManagerError::State(err) => err.is_dirty_write(),
            _ => false,
        }
    }
}

impl From<fleet_core::ManifestError> for ManagerError {
    fn from(err: fleet_core::ManifestError) -> Self {
        ManagerError::Validation(err.to_string())
    }
}

impl From<fleet_core::keys::KeyError> for ManagerError {
    fn from(err: fleet_core::keys::KeyError) -> Self {
        ManagerError::Internal(err.to_string())
    }
}
