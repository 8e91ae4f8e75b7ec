//! Backup export and staged restore.
//!
//! A backup is the current snapshot image written to a file under the
//! backup directory. Restores are staged: the operator loads a chosen
//! backup, may inspect and prune its tasks, and only `commit` swaps it
//! into live storage (through one logged snapshot install).

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tracing::info;

use stratus_core::{ScheduledTask, TaskQuery};

use crate::error::{RecoveryError, RecoveryResult};
use crate::records::Snapshot;
use crate::storage::Storage;

struct StagedRecovery {
    backup_id: String,
    snapshot: Snapshot,
}

/// Exports backups and drives the staged-restore workflow.
pub struct BackupManager {
    backup_dir: PathBuf,
    staged: Mutex<Option<StagedRecovery>>,
}

impl BackupManager {
    pub fn new(backup_dir: PathBuf) -> Self {
        Self {
            backup_dir,
            staged: Mutex::new(None),
        }
    }

    /// Write the current storage contents as a new backup file and
    /// return its id.
    pub fn perform_backup(
        &self,
        storage: &Storage,
        timestamp_ms: u64,
    ) -> RecoveryResult<String> {
        fs::create_dir_all(&self.backup_dir)?;
        let snapshot = storage.to_snapshot(timestamp_ms);
        let backup_id = format!("backup-{timestamp_ms}");
        let data = serde_json::to_vec_pretty(&snapshot).map_err(|e| RecoveryError::Corrupt {
            id: backup_id.clone(),
            reason: e.to_string(),
        })?;
        fs::write(self.backup_dir.join(&backup_id), data)?;
        info!(%backup_id, tasks = snapshot.tasks.len(), "backup written");
        Ok(backup_id)
    }

    /// Ids of every backup on disk, oldest first.
    pub fn list_backups(&self) -> RecoveryResult<Vec<String>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = fs::read_dir(&self.backup_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("backup-"))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Load a backup into the staging slot.
    pub fn stage_recovery(&self, backup_id: &str) -> RecoveryResult<()> {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = staged.as_ref() {
            return Err(RecoveryError::AlreadyStaged(current.backup_id.clone()));
        }

        let path = self.backup_dir.join(backup_id);
        if !path.is_file() {
            return Err(RecoveryError::BackupNotFound(backup_id.to_string()));
        }
        let data = fs::read(&path)?;
        let snapshot: Snapshot =
            serde_json::from_slice(&data).map_err(|e| RecoveryError::Corrupt {
                id: backup_id.to_string(),
                reason: e.to_string(),
            })?;

        info!(%backup_id, tasks = snapshot.tasks.len(), "recovery staged");
        *staged = Some(StagedRecovery {
            backup_id: backup_id.to_string(),
            snapshot,
        });
        Ok(())
    }

    /// Tasks in the staged snapshot matching `query`.
    pub fn query_recovery(&self, query: &TaskQuery) -> RecoveryResult<Vec<ScheduledTask>> {
        let staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        let stage = staged.as_ref().ok_or(RecoveryError::NoStagedRecovery)?;
        Ok(stage
            .snapshot
            .tasks
            .iter()
            .filter(|t| query.matches(t))
            .cloned()
            .collect())
    }

    /// Remove matching tasks from the staged snapshot; returns how many
    /// were removed.
    pub fn delete_recovery_tasks(&self, query: &TaskQuery) -> RecoveryResult<usize> {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        let stage = staged.as_mut().ok_or(RecoveryError::NoStagedRecovery)?;
        let before = stage.snapshot.tasks.len();
        stage.snapshot.tasks.retain(|t| !query.matches(t));
        Ok(before - stage.snapshot.tasks.len())
    }

    /// Swap the staged snapshot into live storage and clear the stage.
    pub fn commit_recovery(&self, storage: &Storage) -> RecoveryResult<()> {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        let stage = staged.take().ok_or(RecoveryError::NoStagedRecovery)?;
        storage.install_snapshot(stage.snapshot)?;
        info!(backup_id = %stage.backup_id, "recovery committed");
        Ok(())
    }

    /// Discard the staged snapshot, if any.
    pub fn unload_recovery(&self) {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        if staged.take().is_some() {
            info!("staged recovery unloaded");
        }
    }
}
