//! Per-role quota admission.
//!
//! Quotas cap the resources consumed by *production* active tasks of a
//! role. Non-production work is admitted freely and competes through
//! preemption instead.

use std::sync::Arc;

use stratus_core::{ResourceBag, ScheduleStatus, TaskConfig, TaskQuery};
use stratus_storage::{Storage, StorageError};

use crate::error::{SchedulerError, SchedulerResult};

pub struct QuotaManager {
    storage: Arc<Storage>,
}

impl QuotaManager {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Resources consumed by production active tasks of `role`.
    pub fn consumption(&self, role: &str) -> ResourceBag {
        self.storage.read(|stores| {
            stores
                .tasks
                .fetch_all(
                    &TaskQuery::unscoped()
                        .by_role(role)
                        .by_statuses(ScheduleStatus::ACTIVE_STATES),
                )
                .iter()
                .filter(|t| t.assigned.config.production)
                .fold(ResourceBag::default(), |acc, t| {
                    acc.add(&t.assigned.config.resource_bag())
                })
        })
    }

    pub fn quota(&self, role: &str) -> Option<ResourceBag> {
        self.storage.read(|stores| stores.quotas.fetch(role))
    }

    /// Admit `instances` additional copies of `config`, or explain why
    /// not. Non-production configs always pass.
    pub fn check_quota(&self, config: &TaskConfig, instances: u32) -> SchedulerResult<()> {
        if !config.production {
            return Ok(());
        }
        let role = &config.job.role;
        let quota = self.quota(role).unwrap_or_default();
        let mut requested = ResourceBag::default();
        for _ in 0..instances {
            requested = requested.add(&config.resource_bag());
        }
        let needed = self.consumption(role).add(&requested);

        if quota.at_least(&needed) {
            Ok(())
        } else {
            Err(SchedulerError::QuotaExceeded {
                role: role.clone(),
                requested: format!(
                    "cpu={:.2} ram={}MB disk={}MB",
                    needed.cpu, needed.ram_mb, needed.disk_mb
                ),
                available: format!(
                    "cpu={:.2} ram={}MB disk={}MB",
                    quota.cpu, quota.ram_mb, quota.disk_mb
                ),
            })
        }
    }

    /// Privileged: replace the role's quota.
    pub fn set_quota(&self, role: &str, quota: ResourceBag) -> SchedulerResult<()> {
        self.storage
            .write::<_, StorageError>(|txn| txn.save_quota(role, quota))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::{AssignedTask, JobKey, Resources, ScheduledTask};

    fn config(production: bool, cpu: f64) -> TaskConfig {
        TaskConfig {
            job: JobKey::new("r1", "prod", "web"),
            resources: Resources {
                cpu,
                ram_mb: 100,
                disk_mb: 10,
                port_names: Vec::new(),
            },
            command: "serve".to_string(),
            is_service: true,
            max_task_failures: -1,
            production,
            priority: 0,
            constraints: Vec::new(),
            container: None,
        }
    }

    fn active_task(id: &str, cfg: &TaskConfig) -> ScheduledTask {
        let mut t = ScheduledTask::new(AssignedTask::new(id.to_string(), 0, cfg.clone()));
        t.status = ScheduleStatus::Running;
        t
    }

    #[test]
    fn nonproduction_is_never_gated() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let quota = QuotaManager::new(storage);
        quota.check_quota(&config(false, 1000.0), 100).unwrap();
    }

    #[test]
    fn admission_counts_existing_production_tasks() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let cfg = config(true, 2.0);
        storage
            .write::<_, StorageError>(|txn| {
                txn.save_quota("r1", ResourceBag::new(5.0, 10_000, 10_000))?;
                txn.save_tasks(vec![active_task("t1", &cfg)])
            })
            .unwrap();

        let quota = QuotaManager::new(storage);
        // 2.0 used + 2.0 requested fits in 5.0.
        quota.check_quota(&cfg, 1).unwrap();
        // Two more would need 6.0.
        assert!(matches!(
            quota.check_quota(&cfg, 2),
            Err(SchedulerError::QuotaExceeded { .. })
        ));
    }

    #[test]
    fn missing_quota_means_zero() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let quota = QuotaManager::new(storage);
        assert!(matches!(
            quota.check_quota(&config(true, 0.1), 1),
            Err(SchedulerError::QuotaExceeded { .. })
        ));
    }

    #[test]
    fn set_quota_takes_effect() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let quota = QuotaManager::new(storage);
        quota
            .set_quota("r1", ResourceBag::new(10.0, 10_000, 10_000))
            .unwrap();
        quota.check_quota(&config(true, 1.0), 4).unwrap();
        assert_eq!(
            quota.quota("r1"),
            Some(ResourceBag::new(10.0, 10_000, 10_000))
        );
    }
}
