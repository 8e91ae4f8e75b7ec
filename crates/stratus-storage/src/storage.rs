//! Transactional storage facade.
//!
//! `Storage` is the single entry point for all reads and writes.
//! Writers are serialized by the store lock; a committed write appends
//! exactly one log record, so log order equals commit order. A failed
//! write rolls back every mutation via the captured undo entries and
//! appends nothing.

use std::mem;
use std::sync::{Mutex, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::{info, warn};

use stratus_core::{
    HostAttributes, JobConfiguration, JobKey, Lock, LockKey, MaintenanceMode, ResourceBag,
    ScheduledTask, TaskQuery,
};

use crate::error::{StorageError, StorageResult};
use crate::log::WriteAheadLog;
use crate::mem::Stores;
use crate::ops::{self, UndoOp};
use crate::records::{LogRecord, Op, Snapshot};

/// The transactional facade over the in-memory stores and the log.
pub struct Storage {
    stores: RwLock<Stores>,
    log: Mutex<WriteAheadLog>,
    ready_tx: watch::Sender<bool>,
}

impl Storage {
    pub fn new(log: WriteAheadLog) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            stores: RwLock::new(Stores::default()),
            log: Mutex::new(log),
            ready_tx,
        }
    }

    /// Storage over an ephemeral in-memory log, for tests.
    pub fn in_memory() -> StorageResult<Self> {
        Ok(Self::new(WriteAheadLog::open_in_memory()?))
    }

    /// Observers of the storage-ready signal; flips true once
    /// [`Storage::start`] has finished recovery.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Recover state from the log: restore the newest snapshot, replay
    /// subsequent op records, then mark storage ready.
    pub fn start(&self) -> StorageResult<()> {
        let entries = {
            let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            log.entries_from(0)?
        };

        let mut recovered = Stores::default();
        let mut snapshot_index = None;
        let mut replayed = 0usize;

        // Find the newest snapshot first; only records after it matter.
        for (index, data) in &entries {
            if let Ok(LogRecord::Snapshot { .. }) = serde_json::from_slice(data) {
                snapshot_index = Some(*index);
            }
        }

        for (index, data) in &entries {
            if let Some(snap_at) = snapshot_index {
                if *index < snap_at {
                    continue;
                }
            }
            let record: LogRecord =
                serde_json::from_slice(data).map_err(|e| StorageError::Replay {
                    index: *index,
                    reason: e.to_string(),
                })?;
            match record {
                LogRecord::Snapshot { snapshot } => {
                    recovered = Stores::from_snapshot(snapshot);
                }
                LogRecord::Ops { ops } => {
                    for op in &ops {
                        ops::apply(&mut recovered, op).map_err(|e| StorageError::Replay {
                            index: *index,
                            reason: e.to_string(),
                        })?;
                    }
                    replayed += 1;
                }
            }
        }

        let task_count = recovered.tasks.tasks.len();
        *self
            .stores
            .write()
            .unwrap_or_else(PoisonError::into_inner) = recovered;

        info!(
            records = entries.len(),
            replayed,
            tasks = task_count,
            from_snapshot = snapshot_index.is_some(),
            "storage recovered"
        );
        let _ = self.ready_tx.send(true);
        Ok(())
    }

    /// Snapshot-consistent read. Sees the latest committed state.
    pub fn read<T>(&self, f: impl FnOnce(&Stores) -> T) -> T {
        let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
        f(&stores)
    }

    /// Execute `f` as a write transaction: all mutations commit along
    /// with one log record, or none do.
    pub fn write<T, E>(&self, f: impl FnOnce(&mut WriteTxn<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        let mut txn = WriteTxn {
            stores: &mut *stores,
            journal: Vec::new(),
            undo: Vec::new(),
        };

        match f(&mut txn) {
            Ok(value) => {
                let journal = mem::take(&mut txn.journal);
                let undo_log = mem::take(&mut txn.undo);
                drop(txn);

                if journal.is_empty() {
                    return Ok(value);
                }

                match self.append_ops(journal) {
                    Ok(_) => Ok(value),
                    Err(e) => {
                        warn!(error = %e, "log append failed, rolling back write");
                        Self::rollback(&mut stores, undo_log);
                        Err(E::from(e))
                    }
                }
            }
            Err(e) => {
                let undo_log = mem::take(&mut txn.undo);
                drop(txn);
                Self::rollback(&mut stores, undo_log);
                Err(e)
            }
        }
    }

    /// Serialize every store into a snapshot record and truncate the
    /// records it supersedes. Returns the snapshot's log index.
    pub fn snapshot(&self, timestamp_ms: u64) -> StorageResult<u64> {
        let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
        let snapshot = stores.to_snapshot(timestamp_ms);
        let index = self.append_snapshot(snapshot)?;
        info!(index, "log snapshot written");
        Ok(index)
    }

    /// Capture the current state as a snapshot image without logging.
    pub fn to_snapshot(&self, timestamp_ms: u64) -> Snapshot {
        self.read(|stores| stores.to_snapshot(timestamp_ms))
    }

    /// Replace all store contents from a snapshot image, logging the
    /// snapshot so the change survives restart. Used by staged
    /// recovery commits.
    pub fn install_snapshot(&self, snapshot: Snapshot) -> StorageResult<u64> {
        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        let index = self.append_snapshot(snapshot.clone())?;
        *stores = Stores::from_snapshot(snapshot);
        info!(index, "snapshot installed");
        Ok(index)
    }

    fn append_ops(&self, ops: Vec<Op>) -> StorageResult<u64> {
        let data = serde_json::to_vec(&LogRecord::Ops { ops })
            .map_err(|e| StorageError::Serialize(e.to_string()))?;
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.append(&data)
    }

    fn append_snapshot(&self, snapshot: Snapshot) -> StorageResult<u64> {
        let data = serde_json::to_vec(&LogRecord::Snapshot { snapshot })
            .map_err(|e| StorageError::Serialize(e.to_string()))?;
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let index = log.append_unchecked(&data)?;
        log.truncate_before(index)?;
        Ok(index)
    }

    fn rollback(stores: &mut Stores, undo_log: Vec<UndoOp>) {
        for entry in undo_log.into_iter().rev() {
            ops::undo(stores, entry);
        }
    }
}

/// An open write transaction. Mutations are applied to the live stores
/// immediately (so the transaction reads its own writes) and captured
/// as journal ops plus undo entries.
pub struct WriteTxn<'a> {
    stores: &'a mut Stores,
    journal: Vec<Op>,
    undo: Vec<UndoOp>,
}

impl WriteTxn<'_> {
    /// Read access, including this transaction's own mutations.
    pub fn stores(&self) -> &Stores {
        self.stores
    }

    fn apply(&mut self, op: Op) -> StorageResult<()> {
        let undo = ops::apply(self.stores, &op)?;
        self.journal.push(op);
        self.undo.push(undo);
        Ok(())
    }

    pub fn save_framework_id(&mut self, id: &str) -> StorageResult<()> {
        self.apply(Op::SaveFrameworkId { id: id.to_string() })
    }

    /// Insert new task records. Fails the transaction if any id exists.
    pub fn save_tasks(&mut self, tasks: Vec<ScheduledTask>) -> StorageResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        self.apply(Op::SaveTasks { tasks })
    }

    /// Apply `f` to every task matching `query`; returns the mutated
    /// records in task-id order.
    pub fn mutate_tasks(
        &mut self,
        query: &TaskQuery,
        mut f: impl FnMut(&mut ScheduledTask),
    ) -> StorageResult<Vec<ScheduledTask>> {
        let mut matched = self.stores.tasks.fetch_all(query);
        matched.sort_by(|a, b| a.task_id().cmp(b.task_id()));

        let mut mutated = Vec::with_capacity(matched.len());
        for mut task in matched {
            f(&mut task);
            self.apply(Op::MutateTask {
                task: Box::new(task.clone()),
            })?;
            mutated.push(task);
        }
        Ok(mutated)
    }

    /// Remove every task matching `query`; returns the removed records.
    pub fn remove_tasks(&mut self, query: &TaskQuery) -> StorageResult<Vec<ScheduledTask>> {
        let matched = self.stores.tasks.fetch_all(query);
        if matched.is_empty() {
            return Ok(matched);
        }
        let task_ids = matched.iter().map(|t| t.task_id().to_string()).collect();
        self.apply(Op::RemoveTasks { task_ids })?;
        Ok(matched)
    }

    pub fn save_cron_job(&mut self, job: JobConfiguration) -> StorageResult<()> {
        self.apply(Op::SaveCronJob { job })
    }

    pub fn remove_cron_job(&mut self, key: &JobKey) -> StorageResult<()> {
        self.apply(Op::RemoveCronJob { key: key.clone() })
    }

    pub fn save_quota(&mut self, role: &str, quota: ResourceBag) -> StorageResult<()> {
        self.apply(Op::SaveQuota {
            role: role.to_string(),
            quota,
        })
    }

    pub fn remove_quota(&mut self, role: &str) -> StorageResult<()> {
        self.apply(Op::RemoveQuota {
            role: role.to_string(),
        })
    }

    pub fn save_lock(&mut self, lock: Lock) -> StorageResult<()> {
        self.apply(Op::SaveLock { lock })
    }

    pub fn remove_lock(&mut self, key: &LockKey) -> StorageResult<()> {
        self.apply(Op::RemoveLock { key: key.clone() })
    }

    pub fn save_host_attributes(&mut self, attributes: HostAttributes) -> StorageResult<()> {
        self.apply(Op::SaveHostAttributes { attributes })
    }

    pub fn set_maintenance_mode(
        &mut self,
        host: &str,
        mode: MaintenanceMode,
    ) -> StorageResult<()> {
        self.apply(Op::SetMaintenanceMode {
            host: host.to_string(),
            mode,
        })
    }
}
