//! Log record schema.
//!
//! A committed write transaction serializes to one `LogRecord::Ops`;
//! a snapshot serializes every store into one `LogRecord::Snapshot`
//! that supersedes all earlier records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use stratus_core::{
    HostAttributes, JobConfiguration, JobKey, Lock, LockKey, MaintenanceMode, ResourceBag,
    ScheduledTask,
};

/// One entry in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    Ops { ops: Vec<Op> },
    Snapshot { snapshot: Snapshot },
}

/// A single store mutation, replayable during recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    SaveFrameworkId { id: String },
    SaveTasks { tasks: Vec<ScheduledTask> },
    MutateTask { task: Box<ScheduledTask> },
    RemoveTasks { task_ids: Vec<String> },
    SaveCronJob { job: JobConfiguration },
    RemoveCronJob { key: JobKey },
    SaveQuota { role: String, quota: ResourceBag },
    RemoveQuota { role: String },
    SaveLock { lock: Lock },
    RemoveLock { key: LockKey },
    SaveHostAttributes { attributes: HostAttributes },
    SetMaintenanceMode { host: String, mode: MaintenanceMode },
}

/// A complete serialized image of every store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp_ms: u64,
    pub framework_id: Option<String>,
    pub tasks: Vec<ScheduledTask>,
    pub cron_jobs: Vec<JobConfiguration>,
    pub quotas: BTreeMap<String, ResourceBag>,
    pub locks: Vec<Lock>,
    pub host_attributes: Vec<HostAttributes>,
}
