//! Storage and recovery error types.

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors from the log or the transactional facade.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open log: {0}")]
    Open(String),

    #[error("log transaction error: {0}")]
    Transaction(String),

    #[error("log read error: {0}")]
    Read(String),

    #[error("log write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("log entry of {size} bytes exceeds max entry size {max}")]
    EntryTooLarge { size: usize, max: usize },

    #[error("task id already exists: {0}")]
    TaskIdExists(String),

    #[error("log replay failed at record {index}: {reason}")]
    Replay { index: u64, reason: String },
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Errors from the backup/restore workflow.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("no recovery is staged")]
    NoStagedRecovery,

    #[error("a recovery is already staged: {0}")]
    AlreadyStaged(String),

    #[error("backup io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt backup {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}
