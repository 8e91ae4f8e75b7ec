//! Write-ahead log backed by redb.
//!
//! Records are opaque byte blobs keyed by a monotonically increasing
//! index. A snapshot record supersedes everything before it, so
//! [`WriteAheadLog::truncate_before`] removes the superseded prefix.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Log records: key = record index, value = serialized [`crate::LogRecord`].
const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("wal");

/// Default cap on a single serialized record.
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 512 * 1024;

fn txn_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transaction(e.to_string())
}

/// Append-only record log with prefix truncation.
pub struct WriteAheadLog {
    db: Database,
    max_entry_size: usize,
    next_index: u64,
}

impl WriteAheadLog {
    /// Open (or create) a log file at `path`.
    pub fn open(path: &Path, max_entry_size: usize) -> StorageResult<Self> {
        let db = Database::create(path).map_err(|e| StorageError::Open(e.to_string()))?;
        Self::init(db, max_entry_size)
    }

    /// An ephemeral in-memory log, for tests.
    pub fn open_in_memory() -> StorageResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(|e| StorageError::Open(e.to_string()))?;
        Self::init(db, DEFAULT_MAX_ENTRY_SIZE)
    }

    fn init(db: Database, max_entry_size: usize) -> StorageResult<Self> {
        let txn = db.begin_write().map_err(txn_err)?;
        txn.open_table(LOG_TABLE).map_err(txn_err)?;
        txn.commit().map_err(txn_err)?;

        let next_index = {
            let txn = db.begin_read().map_err(txn_err)?;
            let table = txn.open_table(LOG_TABLE).map_err(txn_err)?;
            let last = table.last().map_err(|e| StorageError::Read(e.to_string()))?;
            match last {
                Some((key, _)) => key.value() + 1,
                None => 0,
            }
        };

        Ok(Self {
            db,
            max_entry_size,
            next_index,
        })
    }

    /// Append one record, returning its index.
    pub fn append(&mut self, record: &[u8]) -> StorageResult<u64> {
        if record.len() > self.max_entry_size {
            return Err(StorageError::EntryTooLarge {
                size: record.len(),
                max: self.max_entry_size,
            });
        }
        self.append_unchecked(record)
    }

    /// Append without the entry-size cap. Snapshot records scale with
    /// cluster size and are exempt.
    pub fn append_unchecked(&mut self, record: &[u8]) -> StorageResult<u64> {
        let index = self.next_index;
        let txn = self.db.begin_write().map_err(txn_err)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(txn_err)?;
            table
                .insert(index, record)
                .map_err(|e| StorageError::Write(e.to_string()))?;
        }
        txn.commit().map_err(txn_err)?;

        self.next_index = index + 1;
        debug!(index, bytes = record.len(), "appended log record");
        Ok(index)
    }

    /// All records at or after `from`, in index order.
    pub fn entries_from(&self, from: u64) -> StorageResult<Vec<(u64, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(txn_err)?;
        let table = txn.open_table(LOG_TABLE).map_err(txn_err)?;

        let mut entries = Vec::new();
        for item in table
            .range(from..)
            .map_err(|e| StorageError::Read(e.to_string()))?
        {
            let (key, value) = item.map_err(|e| StorageError::Read(e.to_string()))?;
            entries.push((key.value(), value.value().to_vec()));
        }
        Ok(entries)
    }

    /// Remove every record with index strictly below `index`.
    pub fn truncate_before(&mut self, index: u64) -> StorageResult<()> {
        let txn = self.db.begin_write().map_err(txn_err)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(txn_err)?;
            let keys: Vec<u64> = table
                .range(..index)
                .map_err(|e| StorageError::Read(e.to_string()))?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<Result<_, _>>()
                .map_err(|e| StorageError::Read(e.to_string()))?;

            for key in keys {
                table
                    .remove(key)
                    .map_err(|e| StorageError::Write(e.to_string()))?;
            }
        }
        txn.commit().map_err(txn_err)?;
        debug!(index, "truncated log prefix");
        Ok(())
    }
}
