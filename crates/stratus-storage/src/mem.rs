//! In-memory typed stores.
//!
//! The stores hold the authoritative scheduler state between restarts;
//! they are rebuilt from the log on startup. Reads go through the
//! accessors here; every mutation goes through
//! [`crate::storage::WriteTxn`] so it is journaled and undoable.

use std::collections::HashMap;

use stratus_core::{
    HostAttributes, JobConfiguration, JobKey, Lock, LockKey, MaintenanceMode, ResourceBag,
    ScheduledTask, TaskQuery,
};

use crate::records::Snapshot;

/// All typed stores, addressed as one unit by the facade.
#[derive(Debug, Clone, Default)]
pub struct Stores {
    pub scheduler: SchedulerStore,
    pub jobs: JobStore,
    pub tasks: TaskStore,
    pub quotas: QuotaStore,
    pub locks: LockStore,
    pub attributes: AttributeStore,
}

impl Stores {
    /// Serialize every store into a snapshot image.
    pub fn to_snapshot(&self, timestamp_ms: u64) -> Snapshot {
        let mut tasks: Vec<ScheduledTask> = self.tasks.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.task_id().cmp(b.task_id()));

        let mut cron_jobs: Vec<JobConfiguration> =
            self.jobs.cron_jobs.values().cloned().collect();
        cron_jobs.sort_by(|a, b| a.key.cmp(&b.key));

        let mut locks: Vec<Lock> = self.locks.locks.values().cloned().collect();
        locks.sort_by(|a, b| a.key.cmp(&b.key));

        let mut host_attributes: Vec<HostAttributes> =
            self.attributes.hosts.values().cloned().collect();
        host_attributes.sort_by(|a, b| a.host.cmp(&b.host));

        Snapshot {
            timestamp_ms,
            framework_id: self.scheduler.framework_id.clone(),
            tasks,
            cron_jobs,
            quotas: self.quotas.quotas.clone().into_iter().collect(),
            locks,
            host_attributes,
        }
    }

    /// Rebuild every store from a snapshot image.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            scheduler: SchedulerStore {
                framework_id: snapshot.framework_id,
            },
            jobs: JobStore {
                cron_jobs: snapshot
                    .cron_jobs
                    .into_iter()
                    .map(|j| (j.key.clone(), j))
                    .collect(),
            },
            tasks: TaskStore {
                tasks: snapshot
                    .tasks
                    .into_iter()
                    .map(|t| (t.task_id().to_string(), t))
                    .collect(),
            },
            quotas: QuotaStore {
                quotas: snapshot.quotas.into_iter().collect(),
            },
            locks: LockStore {
                locks: snapshot
                    .locks
                    .into_iter()
                    .map(|l| (l.key.clone(), l))
                    .collect(),
            },
            attributes: AttributeStore {
                hosts: snapshot
                    .host_attributes
                    .into_iter()
                    .map(|h| (h.host.clone(), h))
                    .collect(),
            },
        }
    }
}

/// Scheduler-level singletons (the cluster manager registration id).
#[derive(Debug, Clone, Default)]
pub struct SchedulerStore {
    pub(crate) framework_id: Option<String>,
}

impl SchedulerStore {
    pub fn framework_id(&self) -> Option<&str> {
        self.framework_id.as_deref()
    }
}

/// Cron job templates. Instance jobs are not stored; they are
/// reconstructed from live tasks.
#[derive(Debug, Clone, Default)]
pub struct JobStore {
    pub(crate) cron_jobs: HashMap<JobKey, JobConfiguration>,
}

impl JobStore {
    pub fn fetch(&self, key: &JobKey) -> Option<&JobConfiguration> {
        self.cron_jobs.get(key)
    }

    pub fn fetch_all(&self) -> Vec<&JobConfiguration> {
        self.cron_jobs.values().collect()
    }
}

/// All live task records, keyed by task id.
#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    pub(crate) tasks: HashMap<String, ScheduledTask>,
}

impl TaskStore {
    pub fn fetch(&self, task_id: &str) -> Option<&ScheduledTask> {
        self.tasks.get(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// All tasks matching `query`, in unspecified order.
    pub fn fetch_all(&self, query: &TaskQuery) -> Vec<ScheduledTask> {
        self.tasks
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect()
    }

    pub fn count(&self, query: &TaskQuery) -> usize {
        self.tasks.values().filter(|t| query.matches(t)).count()
    }
}

/// Per-role resource quotas.
#[derive(Debug, Clone, Default)]
pub struct QuotaStore {
    pub(crate) quotas: HashMap<String, ResourceBag>,
}

impl QuotaStore {
    pub fn fetch(&self, role: &str) -> Option<ResourceBag> {
        self.quotas.get(role).copied()
    }
}

/// Advisory locks, at most one per key.
#[derive(Debug, Clone, Default)]
pub struct LockStore {
    pub(crate) locks: HashMap<LockKey, Lock>,
}

impl LockStore {
    pub fn fetch(&self, key: &LockKey) -> Option<&Lock> {
        self.locks.get(key)
    }

    pub fn fetch_all(&self) -> Vec<&Lock> {
        self.locks.values().collect()
    }
}

/// Host attributes and maintenance modes, keyed by host name.
#[derive(Debug, Clone, Default)]
pub struct AttributeStore {
    pub(crate) hosts: HashMap<String, HostAttributes>,
}

impl AttributeStore {
    pub fn fetch(&self, host: &str) -> Option<&HostAttributes> {
        self.hosts.get(host)
    }

    pub fn fetch_all(&self) -> Vec<&HostAttributes> {
        self.hosts.values().collect()
    }

    pub fn mode(&self, host: &str) -> MaintenanceMode {
        self.hosts
            .get(host)
            .map(|h| h.mode)
            .unwrap_or(MaintenanceMode::None)
    }

    /// Hosts currently in any of the given modes.
    pub fn hosts_in_mode(&self, modes: &[MaintenanceMode]) -> Vec<&HostAttributes> {
        self.hosts
            .values()
            .filter(|h| modes.contains(&h.mode))
            .collect()
    }
}
