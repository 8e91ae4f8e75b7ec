//! Op application and undo.
//!
//! [`apply`] is the single mutation path: the write transaction uses it
//! for live writes, and recovery uses it for replay, so a replayed log
//! always reconstructs exactly the committed state. Every application
//! returns the [`UndoOp`] that reverses it.

use stratus_core::{HostAttributes, Lock, MaintenanceMode, ResourceBag, ScheduledTask};

use crate::error::{StorageError, StorageResult};
use crate::mem::Stores;
use crate::records::Op;

/// Reverses one applied [`Op`].
#[derive(Debug)]
pub enum UndoOp {
    RestoreFrameworkId(Option<String>),
    RemoveTaskIds(Vec<String>),
    RestoreTask(Box<ScheduledTask>),
    RestoreTasks(Vec<ScheduledTask>),
    RestoreCronJob {
        key: stratus_core::JobKey,
        previous: Option<stratus_core::JobConfiguration>,
    },
    RestoreQuota {
        role: String,
        previous: Option<ResourceBag>,
    },
    RestoreLock {
        key: stratus_core::LockKey,
        previous: Option<Lock>,
    },
    RestoreHostAttributes {
        host: String,
        previous: Option<HostAttributes>,
    },
    RestoreMaintenanceMode {
        host: String,
        previous: Option<MaintenanceMode>,
    },
}

/// Apply one op to the stores, returning its undo entry.
pub fn apply(stores: &mut Stores, op: &Op) -> StorageResult<UndoOp> {
    match op {
        Op::SaveFrameworkId { id } => {
            let previous = stores.scheduler.framework_id.replace(id.clone());
            Ok(UndoOp::RestoreFrameworkId(previous))
        }

        Op::SaveTasks { tasks } => {
            for task in tasks {
                if stores.tasks.tasks.contains_key(task.task_id()) {
                    return Err(StorageError::TaskIdExists(task.task_id().to_string()));
                }
            }
            let ids = tasks.iter().map(|t| t.task_id().to_string()).collect();
            for task in tasks {
                stores
                    .tasks
                    .tasks
                    .insert(task.task_id().to_string(), task.clone());
            }
            Ok(UndoOp::RemoveTaskIds(ids))
        }

        Op::MutateTask { task } => {
            let previous = stores
                .tasks
                .tasks
                .insert(task.task_id().to_string(), (**task).clone());
            match previous {
                Some(p) => Ok(UndoOp::RestoreTask(Box::new(p))),
                // A mutate of an unknown id behaves as an insert.
                None => Ok(UndoOp::RemoveTaskIds(vec![task.task_id().to_string()])),
            }
        }

        Op::RemoveTasks { task_ids } => {
            let mut removed = Vec::new();
            for id in task_ids {
                if let Some(task) = stores.tasks.tasks.remove(id) {
                    removed.push(task);
                }
            }
            Ok(UndoOp::RestoreTasks(removed))
        }

        Op::SaveCronJob { job } => {
            let previous = stores.jobs.cron_jobs.insert(job.key.clone(), job.clone());
            Ok(UndoOp::RestoreCronJob {
                key: job.key.clone(),
                previous,
            })
        }

        Op::RemoveCronJob { key } => {
            let previous = stores.jobs.cron_jobs.remove(key);
            Ok(UndoOp::RestoreCronJob {
                key: key.clone(),
                previous,
            })
        }

        Op::SaveQuota { role, quota } => {
            let previous = stores.quotas.quotas.insert(role.clone(), *quota);
            Ok(UndoOp::RestoreQuota {
                role: role.clone(),
                previous,
            })
        }

        Op::RemoveQuota { role } => {
            let previous = stores.quotas.quotas.remove(role);
            Ok(UndoOp::RestoreQuota {
                role: role.clone(),
                previous,
            })
        }

        Op::SaveLock { lock } => {
            let previous = stores.locks.locks.insert(lock.key.clone(), lock.clone());
            Ok(UndoOp::RestoreLock {
                key: lock.key.clone(),
                previous,
            })
        }

        Op::RemoveLock { key } => {
            let previous = stores.locks.locks.remove(key);
            Ok(UndoOp::RestoreLock {
                key: key.clone(),
                previous,
            })
        }

        Op::SaveHostAttributes { attributes } => {
            let previous = stores
                .attributes
                .hosts
                .insert(attributes.host.clone(), attributes.clone());
            Ok(UndoOp::RestoreHostAttributes {
                host: attributes.host.clone(),
                previous,
            })
        }

        Op::SetMaintenanceMode { host, mode } => {
            match stores.attributes.hosts.get_mut(host) {
                Some(entry) => {
                    let previous = entry.mode;
                    entry.mode = *mode;
                    Ok(UndoOp::RestoreMaintenanceMode {
                        host: host.clone(),
                        previous: Some(previous),
                    })
                }
                None => {
                    // Unknown host: record the mode on a bare entry so
                    // drains can precede the first offer from a host.
                    let mut attributes = HostAttributes::new(host, "");
                    attributes.mode = *mode;
                    stores
                        .attributes
                        .hosts
                        .insert(host.clone(), attributes);
                    Ok(UndoOp::RestoreMaintenanceMode {
                        host: host.clone(),
                        previous: None,
                    })
                }
            }
        }
    }
}

/// Reverse one applied op.
pub fn undo(stores: &mut Stores, entry: UndoOp) {
    match entry {
        UndoOp::RestoreFrameworkId(previous) => {
            stores.scheduler.framework_id = previous;
        }
        UndoOp::RemoveTaskIds(ids) => {
            for id in ids {
                stores.tasks.tasks.remove(&id);
            }
        }
        UndoOp::RestoreTask(task) => {
            stores
                .tasks
                .tasks
                .insert(task.task_id().to_string(), *task);
        }
        UndoOp::RestoreTasks(tasks) => {
            for task in tasks {
                stores
                    .tasks
                    .tasks
                    .insert(task.task_id().to_string(), task);
            }
        }
        UndoOp::RestoreCronJob { key, previous } => match previous {
            Some(job) => {
                stores.jobs.cron_jobs.insert(key, job);
            }
            None => {
                stores.jobs.cron_jobs.remove(&key);
            }
        },
        UndoOp::RestoreQuota { role, previous } => match previous {
            Some(quota) => {
                stores.quotas.quotas.insert(role, quota);
            }
            None => {
                stores.quotas.quotas.remove(&role);
            }
        },
        UndoOp::RestoreLock { key, previous } => match previous {
            Some(lock) => {
                stores.locks.locks.insert(key, lock);
            }
            None => {
                stores.locks.locks.remove(&key);
            }
        },
        UndoOp::RestoreHostAttributes { host, previous } => match previous {
            Some(attributes) => {
                stores.attributes.hosts.insert(host, attributes);
            }
            None => {
                stores.attributes.hosts.remove(&host);
            }
        },
        UndoOp::RestoreMaintenanceMode { host, previous } => match previous {
            Some(mode) => {
                if let Some(entry) = stores.attributes.hosts.get_mut(&host) {
                    entry.mode = mode;
                }
            }
            None => {
                stores.attributes.hosts.remove(&host);
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::{
        AssignedTask, JobKey, LockKey, Resources, ScheduleStatus, TaskConfig,
    };

    fn task(id: &str) -> ScheduledTask {
        let config = TaskConfig {
            job: JobKey::new("r", "e", "j"),
            resources: Resources {
                cpu: 1.0,
                ram_mb: 64,
                disk_mb: 64,
                port_names: Vec::new(),
            },
            command: "true".to_string(),
            is_service: false,
            max_task_failures: 1,
            production: false,
            priority: 0,
            constraints: Vec::new(),
            container: None,
        };
        ScheduledTask::new(AssignedTask::new(id.to_string(), 0, config))
    }

    #[test]
    fn save_tasks_rejects_duplicate_ids() {
        let mut stores = Stores::default();
        apply(
            &mut stores,
            &Op::SaveTasks {
                tasks: vec![task("t1")],
            },
        )
        .unwrap();

        let err = apply(
            &mut stores,
            &Op::SaveTasks {
                tasks: vec![task("t1")],
            },
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::TaskIdExists(_)));
    }

    #[test]
    fn undo_reverses_save_and_remove() {
        let mut stores = Stores::default();
        let save_undo = apply(
            &mut stores,
            &Op::SaveTasks {
                tasks: vec![task("t1")],
            },
        )
        .unwrap();
        assert!(stores.tasks.contains("t1"));

        let remove_undo = apply(
            &mut stores,
            &Op::RemoveTasks {
                task_ids: vec!["t1".to_string()],
            },
        )
        .unwrap();
        assert!(!stores.tasks.contains("t1"));

        undo(&mut stores, remove_undo);
        assert!(stores.tasks.contains("t1"));
        undo(&mut stores, save_undo);
        assert!(!stores.tasks.contains("t1"));
    }

    #[test]
    fn undo_restores_mutated_task() {
        let mut stores = Stores::default();
        apply(
            &mut stores,
            &Op::SaveTasks {
                tasks: vec![task("t1")],
            },
        )
        .unwrap();

        let mut updated = task("t1");
        updated.status = ScheduleStatus::Pending;
        let undo_entry = apply(
            &mut stores,
            &Op::MutateTask {
                task: Box::new(updated),
            },
        )
        .unwrap();
        assert_eq!(
            stores.tasks.fetch("t1").unwrap().status,
            ScheduleStatus::Pending
        );

        undo(&mut stores, undo_entry);
        assert_eq!(
            stores.tasks.fetch("t1").unwrap().status,
            ScheduleStatus::Init
        );
    }

    #[test]
    fn maintenance_mode_on_unknown_host_creates_entry() {
        let mut stores = Stores::default();
        let undo_entry = apply(
            &mut stores,
            &Op::SetMaintenanceMode {
                host: "h1".to_string(),
                mode: stratus_core::MaintenanceMode::Draining,
            },
        )
        .unwrap();
        assert_eq!(
            stores.attributes.mode("h1"),
            stratus_core::MaintenanceMode::Draining
        );

        undo(&mut stores, undo_entry);
        assert!(stores.attributes.fetch("h1").is_none());
    }

    #[test]
    fn lock_roundtrip_with_undo() {
        let mut stores = Stores::default();
        let key = LockKey(JobKey::new("r", "e", "j"));
        let lock = Lock {
            key: key.clone(),
            token: "tok".to_string(),
            user: "u".to_string(),
            timestamp_ms: 1,
        };

        let undo_entry = apply(&mut stores, &Op::SaveLock { lock: lock.clone() }).unwrap();
        assert_eq!(stores.locks.fetch(&key), Some(&lock));

        undo(&mut stores, undo_entry);
        assert!(stores.locks.fetch(&key).is_none());
    }
}
