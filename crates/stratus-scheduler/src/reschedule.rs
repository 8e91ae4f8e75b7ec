//! Reschedule timing: startup spreading and flap damping.
//!
//! After a failover every PENDING task would otherwise hit the
//! placement path at once; the calculator spreads them over a bounded
//! random delay. Tasks whose predecessor died quickly are flapping and
//! enter THROTTLED; the throttler releases them to PENDING after a
//! penalty.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use stratus_core::{Clock, ScheduleStatus, ScheduledTask};
use stratus_state::{EventBus, ReschedulePolicy, RescheduleVerdict, SchedulerEvent, StateManager};

#[derive(Debug, Clone, Copy)]
pub struct RescheduleSettings {
    /// Upper bound of the random post-failover scheduling delay.
    pub first_schedule_delay_max_ms: u64,
    /// A predecessor that lived shorter than this was flapping.
    pub flapping_threshold_ms: u64,
    /// How long a flapping replacement stays THROTTLED.
    pub flap_penalty_ms: u64,
}

pub struct RescheduleCalculator {
    clock: Arc<dyn Clock>,
    settings: RescheduleSettings,
}

impl RescheduleCalculator {
    pub fn new(clock: Arc<dyn Clock>, settings: RescheduleSettings) -> Self {
        Self { clock, settings }
    }

    /// Bounded random delay applied to each task when the loop arms
    /// after recovery.
    pub fn startup_delay_ms(&self) -> u64 {
        if self.settings.first_schedule_delay_max_ms == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..=self.settings.first_schedule_delay_max_ms)
    }

    pub fn flap_penalty_ms(&self) -> u64 {
        self.settings.flap_penalty_ms
    }

    fn lifetime_ms(&self, task: &ScheduledTask) -> u64 {
        match (task.task_events.first(), task.task_events.last()) {
            (Some(first), Some(last)) => last.timestamp_ms.saturating_sub(first.timestamp_ms),
            _ => self.clock.now_ms(),
        }
    }
}

impl ReschedulePolicy for RescheduleCalculator {
    fn verdict(&self, ancestor: &ScheduledTask) -> RescheduleVerdict {
        if self.settings.flapping_threshold_ms == 0 {
            return RescheduleVerdict::Pending;
        }
        let lifetime = self.lifetime_ms(ancestor);
        if lifetime < self.settings.flapping_threshold_ms {
            debug!(
                ancestor = ancestor.task_id(),
                lifetime_ms = lifetime,
                "flapping task, throttling replacement"
            );
            RescheduleVerdict::Throttled
        } else {
            RescheduleVerdict::Pending
        }
    }
}

/// Releases THROTTLED tasks to PENDING once their penalty expires.
pub struct TaskThrottler {
    state_manager: Arc<StateManager>,
    penalty_ms: u64,
}

impl TaskThrottler {
    pub fn new(state_manager: Arc<StateManager>, penalty_ms: u64) -> Self {
        Self {
            state_manager,
            penalty_ms,
        }
    }

    /// Subscribe to the event bus and run until it closes.
    pub fn spawn(self, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let SchedulerEvent::TaskStateChange { task, .. } = event else {
                    continue;
                };
                if task.status != ScheduleStatus::Throttled {
                    continue;
                }
                let state_manager = Arc::clone(&self.state_manager);
                let penalty_ms = self.penalty_ms;
                let task_id = task.task_id().to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(penalty_ms)).await;
                    match state_manager.change_state(
                        &task_id,
                        ScheduleStatus::Pending,
                        Some("throttle penalty expired".to_string()),
                    ) {
                        Ok(_) => {}
                        Err(e) => warn!(task_id, error = %e, "failed to release throttled task"),
                    }
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::{
        AssignedTask, FakeClock, JobKey, Resources, TaskConfig, TaskEvent,
    };
    use stratus_state::RecordingDriver;
    use stratus_storage::Storage;

    fn settings(threshold: u64) -> RescheduleSettings {
        RescheduleSettings {
            first_schedule_delay_max_ms: 1_000,
            flapping_threshold_ms: threshold,
            flap_penalty_ms: 5_000,
        }
    }

    fn task_with_lifetime(lifetime_ms: u64) -> ScheduledTask {
        let config = TaskConfig {
            job: JobKey::new("r", "e", "j"),
            resources: Resources {
                cpu: 1.0,
                ram_mb: 64,
                disk_mb: 64,
                port_names: Vec::new(),
            },
            command: "true".to_string(),
            is_service: true,
            max_task_failures: -1,
            production: false,
            priority: 0,
            constraints: Vec::new(),
            container: None,
        };
        let mut t = ScheduledTask::new(AssignedTask::new("t1".to_string(), 0, config));
        for (ts, status) in [
            (1_000, ScheduleStatus::Pending),
            (1_000 + lifetime_ms, ScheduleStatus::Failed),
        ] {
            t.task_events.push(TaskEvent {
                timestamp_ms: ts,
                status,
                message: None,
                scheduler_host: "sched1".to_string(),
            });
        }
        t.status = ScheduleStatus::Failed;
        t
    }

    #[test]
    fn short_lived_ancestor_is_throttled() {
        let calc = RescheduleCalculator::new(Arc::new(FakeClock::at(0)), settings(60_000));
        assert_eq!(
            calc.verdict(&task_with_lifetime(1_000)),
            RescheduleVerdict::Throttled
        );
        assert_eq!(
            calc.verdict(&task_with_lifetime(120_000)),
            RescheduleVerdict::Pending
        );
    }

    #[test]
    fn zero_threshold_disables_throttling() {
        let calc = RescheduleCalculator::new(Arc::new(FakeClock::at(0)), settings(0));
        assert_eq!(
            calc.verdict(&task_with_lifetime(1)),
            RescheduleVerdict::Pending
        );
    }

    #[test]
    fn startup_delay_is_bounded() {
        let calc = RescheduleCalculator::new(Arc::new(FakeClock::at(0)), settings(0));
        for _ in 0..100 {
            assert!(calc.startup_delay_ms() <= 1_000);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttler_releases_to_pending() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let bus = EventBus::default();
        let state_manager = Arc::new(StateManager::new(
            Arc::clone(&storage),
            Arc::new(FakeClock::at(0)),
            Arc::new(RecordingDriver::default()),
            bus.clone(),
            "sched1".to_string(),
        ));

        TaskThrottler::new(Arc::clone(&state_manager), 5_000).spawn(&bus);
        tokio::task::yield_now().await;

        // Seed a throttled record directly.
        let throttled = {
            let mut t = task_with_lifetime(0);
            t.assigned.task_id = "throttled-1".to_string();
            t.status = ScheduleStatus::Throttled;
            t.task_events.clear();
            t
        };
        storage
            .write::<_, stratus_storage::StorageError>(|txn| {
                txn.save_tasks(vec![throttled.clone()])
            })
            .unwrap();
        bus.publish(SchedulerEvent::TaskStateChange {
            task: throttled,
            old: ScheduleStatus::Init,
        });
        tokio::task::yield_now().await;

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        tokio::task::yield_now().await;

        assert_eq!(
            storage.read(|s| s.tasks.fetch("throttled-1").map(|t| t.status)),
            Some(ScheduleStatus::Pending)
        );
    }
}
