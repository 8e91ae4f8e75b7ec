//! Scheduler error types.

use thiserror::Error;

use stratus_state::StateError;
use stratus_storage::StorageError;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors from scheduling-domain operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("quota for role {role} exceeded: requested {requested}, available {available}")]
    QuotaExceeded {
        role: String,
        requested: String,
        available: String,
    },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
