//! Preemption.
//!
//! When a placement attempt finds no feasible offer, the preemptor
//! searches for lower-priority RUNNING tasks whose eviction would make
//! room on some host. Victims are transitioned to PREEMPTING (which
//! kills them); the candidate stays queued and retries once the
//! victim's resources return as an offer.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use stratus_core::{ResourceBag, ScheduleStatus, ScheduledTask, TaskQuery};
use stratus_state::StateManager;
use stratus_storage::Storage;

use crate::offers::OfferPool;

pub trait Preemptor: Send + Sync {
    /// Search for preemption room for `task_id`; returns the victim
    /// task ids when a slot was found.
    fn attempt_preemption_for(&self, task_id: &str) -> Option<Vec<String>>;
}

/// A preemptor that never preempts.
#[derive(Debug, Default)]
pub struct NoPreemption;

impl Preemptor for NoPreemption {
    fn attempt_preemption_for(&self, _task_id: &str) -> Option<Vec<String>> {
        None
    }
}

/// Production tasks may displace non-production tasks; within the same
/// class, strictly higher numeric priority wins.
fn preempts(candidate: &ScheduledTask, victim: &ScheduledTask) -> bool {
    let c = &candidate.assigned.config;
    let v = &victim.assigned.config;
    if c.production != v.production {
        return c.production;
    }
    c.priority > v.priority
}

pub struct LivePreemptor {
    storage: Arc<Storage>,
    state_manager: Arc<StateManager>,
    offers: Arc<OfferPool>,
}

impl LivePreemptor {
    pub fn new(
        storage: Arc<Storage>,
        state_manager: Arc<StateManager>,
        offers: Arc<OfferPool>,
    ) -> Self {
        Self {
            storage,
            state_manager,
            offers,
        }
    }
}

impl Preemptor for LivePreemptor {
    fn attempt_preemption_for(&self, task_id: &str) -> Option<Vec<String>> {
        let candidate = self.storage.read(|s| s.tasks.fetch(task_id).cloned())?;
        if candidate.status != ScheduleStatus::Pending {
            return None;
        }
        let needed = candidate.assigned.config.resource_bag();

        // Free resources already offered per host.
        let mut free_by_host: HashMap<String, ResourceBag> = HashMap::new();
        for offer in self.offers.snapshot() {
            let entry = free_by_host.entry(offer.host.clone()).or_default();
            *entry = entry.add(&offer.resources);
        }

        let victims = self.storage.read(|stores| {
            let running = stores
                .tasks
                .fetch_all(&TaskQuery::unscoped().by_status(ScheduleStatus::Running));

            let mut by_host: HashMap<&str, Vec<&ScheduledTask>> = HashMap::new();
            for task in &running {
                if let Some(host) = task.assigned.slave_host.as_deref() {
                    by_host.entry(host).or_default().push(task);
                }
            }

            let mut hosts: Vec<&str> = by_host.keys().copied().collect();
            hosts.sort();

            for host in hosts {
                if stores.attributes.mode(host).blocks_placement() {
                    continue;
                }

                let mut eligible: Vec<&ScheduledTask> = by_host[host]
                    .iter()
                    .copied()
                    .filter(|v| preempts(&candidate, v))
                    .collect();
                if eligible.is_empty() {
                    continue;
                }
                // Weakest victims first.
                eligible.sort_by_key(|v| {
                    (
                        v.assigned.config.production,
                        v.assigned.config.priority,
                        v.task_id().to_string(),
                    )
                });

                let mut reclaimable = free_by_host.get(host).copied().unwrap_or_default();
                let mut chosen = Vec::new();
                for victim in eligible {
                    reclaimable = reclaimable.add(&victim.assigned.config.resource_bag());
                    chosen.push(victim.task_id().to_string());
                    if reclaimable.at_least(&needed) {
                        return Some((host.to_string(), chosen));
                    }
                }
            }
            None
        });

        let (host, victim_ids) = victims?;
        info!(
            task_id,
            host = %host,
            victims = victim_ids.len(),
            "preempting to make room"
        );
        for victim_id in &victim_ids {
            match self.state_manager.change_state(
                victim_id,
                ScheduleStatus::Preempting,
                Some(format!("preempted for {task_id}")),
            ) {
                Ok(true) => {}
                Ok(false) => debug!(victim_id, "victim moved on before preemption"),
                Err(e) => warn!(victim_id, error = %e, "failed to preempt victim"),
            }
        }
        Some(victim_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::{
        AssignedTask, FakeClock, JobKey, Resources, TaskConfig,
    };
    use stratus_state::{EventBus, RecordingDriver};
    use stratus_storage::StorageError;

    fn config(job: &str, production: bool, priority: u32, cpu: f64) -> TaskConfig {
        TaskConfig {
            job: JobKey::new("r1", "prod", job),
            resources: Resources {
                cpu,
                ram_mb: 100,
                disk_mb: 10,
                port_names: Vec::new(),
            },
            command: "serve".to_string(),
            is_service: false,
            max_task_failures: 1,
            production,
            priority,
            constraints: Vec::new(),
            container: None,
        }
    }

    struct Harness {
        storage: Arc<Storage>,
        state_manager: Arc<StateManager>,
        preemptor: LivePreemptor,
    }

    fn harness() -> Harness {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let state_manager = Arc::new(StateManager::new(
            Arc::clone(&storage),
            Arc::new(FakeClock::at(0)),
            Arc::new(RecordingDriver::default()),
            EventBus::default(),
            "sched1".to_string(),
        ));
        let preemptor = LivePreemptor::new(
            Arc::clone(&storage),
            Arc::clone(&state_manager),
            Arc::new(OfferPool::new()),
        );
        Harness {
            storage,
            state_manager,
            preemptor,
        }
    }

    fn running_on(h: &Harness, cfg: &TaskConfig, host: &str) -> String {
        let created = h.state_manager.insert_pending_tasks(cfg, &[0]).unwrap();
        let id = created[0].task_id().to_string();
        h.state_manager
            .assign_task(&id, &format!("slave-{host}"), host, Default::default())
            .unwrap();
        h.state_manager
            .change_state(&id, ScheduleStatus::Running, None)
            .unwrap();
        id
    }

    fn pending(h: &Harness, cfg: &TaskConfig) -> String {
        let created = h.state_manager.insert_pending_tasks(cfg, &[0]).unwrap();
        created[0].task_id().to_string()
    }

    #[test]
    fn lower_priority_victim_is_preempted() {
        let h = harness();
        let victim = running_on(&h, &config("low", false, 1, 1.0), "h1");
        let candidate = pending(&h, &config("high", false, 5, 1.0));

        let victims = h.preemptor.attempt_preemption_for(&candidate).unwrap();
        assert_eq!(victims, vec![victim.clone()]);
        assert_eq!(
            h.storage.read(|s| s.tasks.fetch(&victim).map(|t| t.status)),
            Some(ScheduleStatus::Preempting)
        );
    }

    #[test]
    fn equal_or_higher_priority_is_safe() {
        let h = harness();
        running_on(&h, &config("peer", false, 5, 1.0), "h1");
        let candidate = pending(&h, &config("cand", false, 5, 1.0));
        assert!(h.preemptor.attempt_preemption_for(&candidate).is_none());
    }

    #[test]
    fn production_preempts_nonproduction_regardless_of_priority() {
        let h = harness();
        let victim = running_on(&h, &config("batch", false, 100, 1.0), "h1");
        let candidate = pending(&h, &config("svc", true, 0, 1.0));

        let victims = h.preemptor.attempt_preemption_for(&candidate).unwrap();
        assert_eq!(victims, vec![victim]);
    }

    #[test]
    fn nonproduction_never_preempts_production() {
        let h = harness();
        running_on(&h, &config("svc", true, 0, 1.0), "h1");
        let candidate = pending(&h, &config("batch", false, 100, 1.0));
        assert!(h.preemptor.attempt_preemption_for(&candidate).is_none());
    }

    #[test]
    fn victim_must_free_enough_resources() {
        let h = harness();
        // The victim is too small to make room for the candidate.
        running_on(&h, &config("small", false, 1, 0.5), "h1");
        let candidate = pending(&h, &config("big", false, 5, 8.0));
        assert!(h.preemptor.attempt_preemption_for(&candidate).is_none());
    }

    #[test]
    fn multiple_victims_accumulate() {
        let h = harness();
        let v1 = running_on(&h, &config("a", false, 1, 2.0), "h1");
        let v2 = running_on(&h, &config("b", false, 2, 2.0), "h1");
        let candidate = pending(&h, &config("cand", false, 9, 4.0));

        let victims = h.preemptor.attempt_preemption_for(&candidate).unwrap();
        assert_eq!(victims.len(), 2);
        assert!(victims.contains(&v1) && victims.contains(&v2));
    }
}
