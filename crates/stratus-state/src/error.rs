//! State-management error types.

use thiserror::Error;

use stratus_core::ScheduleStatus;
use stratus_storage::StorageError;

pub type StateResult<T> = Result<T, StateError>;

/// Errors from lifecycle management.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("illegal transition for task {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: String,
        from: ScheduleStatus,
        to: ScheduleStatus,
    },

    #[error("invalid maintenance request for host {host}: currently {mode}")]
    InvalidMaintenanceRequest { host: String, mode: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the advisory lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("{key} is already locked by {holder}")]
    AlreadyLocked { key: String, holder: String },

    #[error("lock token does not match the lock held on {0}")]
    TokenMismatch(String),

    #[error("no lock is held on {0}")]
    NotLocked(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
