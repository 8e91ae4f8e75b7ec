//! stratus-storage — durable log, in-memory stores, and the
//! transactional facade.
//!
//! Every mutation to scheduler state flows through [`Storage::write`]:
//! the closure mutates typed in-memory stores, each mutation is
//! captured as an [`records::Op`] with an undo entry, and on success
//! the op batch is appended to the write-ahead log as a single record.
//! On error every mutation is rolled back and nothing is logged.
//!
//! Recovery replays the newest snapshot record plus all subsequent op
//! records; snapshots truncate the log behind them.

pub mod backup;
pub mod error;
pub mod log;
pub mod mem;
pub mod ops;
pub mod records;
pub mod storage;

pub use backup::BackupManager;
pub use error::{RecoveryError, RecoveryResult, StorageError, StorageResult};
pub use log::WriteAheadLog;
pub use mem::Stores;
pub use records::{LogRecord, Op, Snapshot};
pub use storage::{Storage, WriteTxn};
