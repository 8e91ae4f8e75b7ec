//! State-machine host.
//!
//! Routes agent status updates, placement results, and operator
//! transitions through the pure state machine and interprets the
//! resulting work commands inside a single storage write transaction:
//! either the new status, its task event, and any derived
//! reschedule/delete all commit together, or none do. Driver
//! instructions and event-bus notifications are deferred until after
//! commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use stratus_core::{
    new_task_id, AssignedTask, Clock, ScheduleStatus, ScheduledTask, TaskConfig, TaskEvent,
    TaskQuery,
};
use stratus_storage::{Storage, WriteTxn};

use crate::driver::Driver;
use crate::error::{StateError, StateResult};
use crate::events::{EventBus, SchedulerEvent};
use crate::machine::{evaluate, Eval, TransitionContext, WorkCommand};

/// Where a replacement task should start its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleVerdict {
    /// Schedulable immediately.
    Pending,
    /// Penalized first; the throttler will release it to PENDING.
    Throttled,
}

/// Decides whether a replacement task is throttled for flapping.
pub trait ReschedulePolicy: Send + Sync {
    fn verdict(&self, ancestor: &ScheduledTask) -> RescheduleVerdict;
}

/// Never throttles. Used until a calculator is wired in.
struct ImmediateReschedule;

impl ReschedulePolicy for ImmediateReschedule {
    fn verdict(&self, _ancestor: &ScheduledTask) -> RescheduleVerdict {
        RescheduleVerdict::Pending
    }
}

/// Driver instructions and notifications collected during a
/// transaction, applied only after it commits.
#[derive(Default)]
struct SideEffects {
    kills: Vec<String>,
    state_changes: Vec<(ScheduledTask, ScheduleStatus)>,
    deleted: Vec<ScheduledTask>,
}

/// The authoritative lifecycle interpreter.
pub struct StateManager {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    driver: Arc<dyn Driver>,
    events: EventBus,
    policy: Arc<dyn ReschedulePolicy>,
    local_host: String,
    illegal_transitions: AtomicU64,
}

impl StateManager {
    pub fn new(
        storage: Arc<Storage>,
        clock: Arc<dyn Clock>,
        driver: Arc<dyn Driver>,
        events: EventBus,
        local_host: String,
    ) -> Self {
        Self {
            storage,
            clock,
            driver,
            events,
            policy: Arc::new(ImmediateReschedule),
            local_host,
            illegal_transitions: AtomicU64::new(0),
        }
    }

    /// Replace the reschedule policy (flapping detection).
    pub fn with_reschedule_policy(mut self, policy: Arc<dyn ReschedulePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn illegal_transition_count(&self) -> u64 {
        self.illegal_transitions.load(Ordering::Relaxed)
    }

    /// Attempt one transition. Returns whether it was applied.
    pub fn change_state(
        &self,
        task_id: &str,
        to: ScheduleStatus,
        audit_message: Option<String>,
    ) -> StateResult<bool> {
        let mut effects = SideEffects::default();
        let applied = self.storage.write(|txn| {
            self.transition_in_txn(txn, &mut effects, task_id, to, audit_message.clone())
        })?;
        self.finish(effects);
        Ok(applied)
    }

    /// Attempt the same transition on every task matching `query`, all
    /// in one transaction. Returns the ids whose transition applied.
    pub fn change_states(
        &self,
        query: &TaskQuery,
        to: ScheduleStatus,
        audit_message: Option<String>,
    ) -> StateResult<Vec<String>> {
        let mut effects = SideEffects::default();
        let applied = self.storage.write(|txn| {
            let mut matched = txn.stores().tasks.fetch_all(query);
            matched.sort_by(|a, b| a.task_id().cmp(b.task_id()));

            let mut applied = Vec::new();
            for task in matched {
                let id = task.task_id().to_string();
                if self.transition_in_txn(txn, &mut effects, &id, to, audit_message.clone())? {
                    applied.push(id);
                }
            }
            Ok::<_, StateError>(applied)
        })?;
        self.finish(effects);
        Ok(applied)
    }

    /// Route an agent status update. Updates for unknown live tasks are
    /// zombies: the agent is told to kill them.
    pub fn handle_status_update(
        &self,
        task_id: &str,
        status: ScheduleStatus,
        message: Option<String>,
    ) -> StateResult<bool> {
        let known = self.storage.read(|s| s.tasks.contains(task_id));
        if !known {
            if matches!(
                status,
                ScheduleStatus::Assigned | ScheduleStatus::Starting | ScheduleStatus::Running
            ) {
                warn!(task_id, %status, "status update for unknown task, killing");
                self.driver.kill_task(task_id);
            }
            return Ok(false);
        }
        self.change_state(task_id, status, message)
    }

    /// Operator-injected transition. Unlike agent updates, an illegal
    /// target is surfaced as an error.
    pub fn force_task_state(&self, task_id: &str, status: ScheduleStatus) -> StateResult<()> {
        let from = self
            .storage
            .read(|s| s.tasks.fetch(task_id).map(|t| t.status))
            .ok_or_else(|| StateError::TaskNotFound(task_id.to_string()))?;

        let applied = self.change_state(
            task_id,
            status,
            Some("state forced by operator".to_string()),
        )?;
        if !applied {
            return Err(StateError::IllegalTransition {
                task_id: task_id.to_string(),
                from,
                to: status,
            });
        }
        Ok(())
    }

    /// Create PENDING tasks for the given instances of a config, all in
    /// one transaction. Returns the created records.
    pub fn insert_pending_tasks(
        &self,
        config: &TaskConfig,
        instance_ids: &[u32],
    ) -> StateResult<Vec<ScheduledTask>> {
        let mut effects = SideEffects::default();
        let created = self.storage.write(|txn| {
            let mut created = Vec::with_capacity(instance_ids.len());
            for &instance_id in instance_ids {
                let task = ScheduledTask::new(AssignedTask::new(
                    new_task_id(&config.job, instance_id),
                    instance_id,
                    config.clone(),
                ));
                let id = task.task_id().to_string();
                txn.save_tasks(vec![task])?;
                self.transition_in_txn(
                    txn,
                    &mut effects,
                    &id,
                    ScheduleStatus::Pending,
                    None,
                )?;
                match txn.stores().tasks.fetch(&id) {
                    Some(task) => created.push(task.clone()),
                    None => return Err(StateError::TaskNotFound(id)),
                }
            }
            Ok(created)
        })?;
        self.finish(effects);
        Ok(created)
    }

    /// Remove task records outright (operator delete / GC).
    pub fn delete_tasks(&self, query: &TaskQuery) -> StateResult<Vec<ScheduledTask>> {
        let removed = self
            .storage
            .write(|txn| txn.remove_tasks(query))
            .map_err(StateError::Storage)?;
        if !removed.is_empty() {
            info!(count = removed.len(), "tasks deleted");
            self.events.publish(SchedulerEvent::TasksDeleted {
                tasks: removed.clone(),
            });
        }
        Ok(removed)
    }

    /// Record a placement: write the host assignment and transition
    /// PENDING → ASSIGNED atomically. Returns the assigned record; the
    /// caller emits the launch.
    pub fn assign_task(
        &self,
        task_id: &str,
        slave_id: &str,
        slave_host: &str,
        ports: BTreeMap<String, u16>,
    ) -> StateResult<ScheduledTask> {
        let mut effects = SideEffects::default();
        let assigned = self.storage.write(|txn| {
            let matched = txn.mutate_tasks(&TaskQuery::unscoped().by_task_id(task_id), |t| {
                t.assigned.slave_id = Some(slave_id.to_string());
                t.assigned.slave_host = Some(slave_host.to_string());
                t.assigned.assigned_ports = ports.clone();
            })?;
            if matched.is_empty() {
                return Err(StateError::TaskNotFound(task_id.to_string()));
            }

            let applied = self.transition_in_txn(
                txn,
                &mut effects,
                task_id,
                ScheduleStatus::Assigned,
                Some(format!("assigned to {slave_host}")),
            )?;
            if !applied {
                // Aborting the transaction rolls the assignment back.
                return Err(StateError::IllegalTransition {
                    task_id: task_id.to_string(),
                    from: matched[0].status,
                    to: ScheduleStatus::Assigned,
                });
            }
            txn.stores()
                .tasks
                .fetch(task_id)
                .cloned()
                .ok_or_else(|| StateError::TaskNotFound(task_id.to_string()))
        })?;
        self.finish(effects);
        Ok(assigned)
    }

    // ── Internal ───────────────────────────────────────────────────

    /// Evaluate and interpret one transition inside `txn`.
    fn transition_in_txn(
        &self,
        txn: &mut WriteTxn<'_>,
        effects: &mut SideEffects,
        task_id: &str,
        to: ScheduleStatus,
        audit_message: Option<String>,
    ) -> StateResult<bool> {
        let task = match txn.stores().tasks.fetch(task_id) {
            Some(task) => task.clone(),
            None => {
                warn!(task_id, %to, "transition requested for unknown task");
                return Ok(false);
            }
        };

        let ctx = TransitionContext {
            is_service: task.assigned.config.is_service,
            max_task_failures: task.assigned.config.max_task_failures,
            failure_count: task.failure_count,
        };

        match evaluate(task.status, to, ctx) {
            Eval::Noop => Ok(false),
            Eval::Illegal { commands } => {
                error!(task_id, from = %task.status, %to, "illegal state transition attempted");
                self.illegal_transitions.fetch_add(1, Ordering::Relaxed);
                for command in commands {
                    if command == WorkCommand::Kill {
                        effects.kills.push(task_id.to_string());
                    }
                }
                Ok(false)
            }
            Eval::Allowed { to, commands } => {
                for command in commands {
                    self.run_command(
                        txn,
                        effects,
                        &task,
                        to,
                        command,
                        audit_message.as_deref(),
                    )?;
                }
                Ok(true)
            }
        }
    }

    fn run_command(
        &self,
        txn: &mut WriteTxn<'_>,
        effects: &mut SideEffects,
        task: &ScheduledTask,
        to: ScheduleStatus,
        command: WorkCommand,
        audit_message: Option<&str>,
    ) -> StateResult<()> {
        let id_query = TaskQuery::unscoped().by_task_id(task.task_id());
        match command {
            WorkCommand::UpdateState => {
                let event = TaskEvent {
                    timestamp_ms: self.clock.now_ms(),
                    status: to,
                    message: audit_message.map(str::to_string),
                    scheduler_host: self.local_host.clone(),
                };
                let mutated = txn.mutate_tasks(&id_query, |t| {
                    t.status = to;
                    t.task_events.push(event.clone());
                })?;
                if let Some(updated) = mutated.into_iter().next() {
                    effects.state_changes.push((updated, task.status));
                }
            }

            WorkCommand::IncrementFailures => {
                txn.mutate_tasks(&id_query, |t| t.failure_count += 1)?;
            }

            WorkCommand::Kill => effects.kills.push(task.task_id().to_string()),

            WorkCommand::Delete => {
                let removed = txn.remove_tasks(&id_query)?;
                effects.deleted.extend(removed);
            }

            WorkCommand::Reschedule => {
                // Read back the record so failure increments applied
                // earlier in this transition are visible.
                let ancestor = txn
                    .stores()
                    .tasks
                    .fetch(task.task_id())
                    .cloned()
                    .unwrap_or_else(|| task.clone());

                let mut replacement = ScheduledTask::new(AssignedTask::new(
                    new_task_id(ancestor.job_key(), ancestor.assigned.instance_id),
                    ancestor.assigned.instance_id,
                    ancestor.assigned.config.clone(),
                ));
                replacement.ancestor_id = Some(ancestor.task_id().to_string());
                // Only consecutive failures count against the budget.
                replacement.failure_count = if to == ScheduleStatus::Failed {
                    ancestor.failure_count
                } else {
                    0
                };

                let replacement_id = replacement.task_id().to_string();
                let initial = match self.policy.verdict(&ancestor) {
                    RescheduleVerdict::Pending => ScheduleStatus::Pending,
                    RescheduleVerdict::Throttled => ScheduleStatus::Throttled,
                };

                info!(
                    ancestor = ancestor.task_id(),
                    replacement = %replacement_id,
                    %initial,
                    "rescheduling task"
                );
                txn.save_tasks(vec![replacement])?;
                self.transition_in_txn(
                    txn,
                    effects,
                    &replacement_id,
                    initial,
                    Some(format!("rescheduled from {}", ancestor.task_id())),
                )?;
            }
        }
        Ok(())
    }

    /// Apply driver instructions and publish events, strictly after the
    /// transaction committed.
    fn finish(&self, effects: SideEffects) {
        for task_id in &effects.kills {
            self.driver.kill_task(task_id);
        }
        for (task, old) in effects.state_changes {
            self.events
                .publish(SchedulerEvent::TaskStateChange { task, old });
        }
        if !effects.deleted.is_empty() {
            self.events.publish(SchedulerEvent::TasksDeleted {
                tasks: effects.deleted,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RecordingDriver;
    use stratus_core::{FakeClock, JobKey, Resources};

    fn config(is_service: bool, max_failures: i32) -> TaskConfig {
        TaskConfig {
            job: JobKey::new("r1", "prod", "web"),
            resources: Resources {
                cpu: 1.0,
                ram_mb: 100,
                disk_mb: 10,
                port_names: Vec::new(),
            },
            command: "serve".to_string(),
            is_service,
            max_task_failures: max_failures,
            production: false,
            priority: 0,
            constraints: Vec::new(),
            container: None,
        }
    }

    struct Harness {
        storage: Arc<Storage>,
        driver: Arc<RecordingDriver>,
        manager: StateManager,
    }

    fn harness() -> Harness {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let driver = Arc::new(RecordingDriver::default());
        let manager = StateManager::new(
            Arc::clone(&storage),
            Arc::new(FakeClock::at(1_000)),
            driver.clone(),
            EventBus::default(),
            "sched1".to_string(),
        );
        Harness {
            storage,
            driver,
            manager,
        }
    }

    fn committed_states(storage: &Storage, task_id: &str) -> Vec<ScheduleStatus> {
        storage.read(|s| {
            s.tasks
                .fetch(task_id)
                .map(|t| t.task_events.iter().map(|e| e.status).collect())
                .unwrap_or_default()
        })
    }

    #[test]
    fn happy_path_records_every_state() {
        let h = harness();
        let created = h
            .manager
            .insert_pending_tasks(&config(false, 1), &[0])
            .unwrap();
        let id = created[0].task_id().to_string();

        for status in [
            ScheduleStatus::Assigned,
            ScheduleStatus::Starting,
            ScheduleStatus::Running,
            ScheduleStatus::Finished,
        ] {
            assert!(h.manager.change_state(&id, status, None).unwrap());
        }

        assert_eq!(
            committed_states(&h.storage, &id),
            vec![
                ScheduleStatus::Pending,
                ScheduleStatus::Assigned,
                ScheduleStatus::Starting,
                ScheduleStatus::Running,
                ScheduleStatus::Finished,
            ]
        );
        // Not a service: no replacement task appeared.
        assert_eq!(h.storage.read(|s| s.tasks.fetch_all(&TaskQuery::unscoped()).len()), 1);

        // Remote removal garbage-collects the record.
        assert!(h
            .manager
            .change_state(&id, ScheduleStatus::Unknown, None)
            .unwrap());
        assert!(!h.storage.read(|s| s.tasks.contains(&id)));
    }

    #[test]
    fn finished_service_respawns_with_ancestor() {
        let h = harness();
        let created = h
            .manager
            .insert_pending_tasks(&config(true, 1), &[0])
            .unwrap();
        let id = created[0].task_id().to_string();

        for status in [
            ScheduleStatus::Assigned,
            ScheduleStatus::Starting,
            ScheduleStatus::Running,
            ScheduleStatus::Finished,
        ] {
            h.manager.change_state(&id, status, None).unwrap();
        }

        let pending = h.storage.read(|s| {
            s.tasks
                .fetch_all(&TaskQuery::unscoped().by_status(ScheduleStatus::Pending))
        });
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].task_id(), id);
        assert_eq!(pending[0].ancestor_id.as_deref(), Some(id.as_str()));
        assert_eq!(pending[0].failure_count, 0);
    }

    #[test]
    fn failure_budget_exhaustion_stops_rescheduling() {
        let h = harness();
        let created = h
            .manager
            .insert_pending_tasks(&config(false, 3), &[0])
            .unwrap();
        let id = created[0].task_id().to_string();

        // Pre-load two prior failures.
        h.storage
            .write::<_, stratus_storage::StorageError>(|txn| {
                txn.mutate_tasks(&TaskQuery::unscoped().by_task_id(&id), |t| {
                    t.failure_count = 2;
                })
                .map(|_| ())
            })
            .unwrap();

        for status in [
            ScheduleStatus::Assigned,
            ScheduleStatus::Running,
            ScheduleStatus::Failed,
        ] {
            h.manager.change_state(&id, status, None).unwrap();
        }

        let task = h.storage.read(|s| s.tasks.fetch(&id).cloned()).unwrap();
        assert_eq!(task.failure_count, 3);
        // Budget exhausted: 2 < 3 − 1 is false, so no replacement.
        let pending = h.storage.read(|s| {
            s.tasks
                .fetch_all(&TaskQuery::unscoped().by_status(ScheduleStatus::Pending))
        });
        assert!(pending.is_empty());
    }

    #[test]
    fn failed_with_budget_inherits_failure_count() {
        let h = harness();
        let created = h
            .manager
            .insert_pending_tasks(&config(false, 5), &[0])
            .unwrap();
        let id = created[0].task_id().to_string();

        for status in [
            ScheduleStatus::Assigned,
            ScheduleStatus::Running,
            ScheduleStatus::Failed,
        ] {
            h.manager.change_state(&id, status, None).unwrap();
        }

        let replacement = h.storage.read(|s| {
            s.tasks
                .fetch_all(&TaskQuery::unscoped().by_status(ScheduleStatus::Pending))
        });
        assert_eq!(replacement.len(), 1);
        assert_eq!(replacement[0].failure_count, 1);
    }

    #[test]
    fn killing_a_pending_task_deletes_it() {
        let h = harness();
        let created = h
            .manager
            .insert_pending_tasks(&config(false, 1), &[0])
            .unwrap();
        let id = created[0].task_id().to_string();

        assert!(h
            .manager
            .change_state(&id, ScheduleStatus::Killing, None)
            .unwrap());
        assert!(!h.storage.read(|s| s.tasks.contains(&id)));
        // No agent involved.
        assert!(h.driver.killed().is_empty());
    }

    #[test]
    fn killing_a_running_task_reaches_the_driver() {
        let h = harness();
        let created = h
            .manager
            .insert_pending_tasks(&config(false, 1), &[0])
            .unwrap();
        let id = created[0].task_id().to_string();
        for status in [ScheduleStatus::Assigned, ScheduleStatus::Running] {
            h.manager.change_state(&id, status, None).unwrap();
        }

        h.manager
            .change_state(&id, ScheduleStatus::Killing, None)
            .unwrap();
        assert_eq!(h.driver.killed(), vec![id.clone()]);
        assert_eq!(
            h.storage.read(|s| s.tasks.fetch(&id).map(|t| t.status)),
            Some(ScheduleStatus::Killing)
        );
    }

    #[test]
    fn illegal_transition_is_counted_and_dropped() {
        let h = harness();
        let created = h
            .manager
            .insert_pending_tasks(&config(false, 1), &[0])
            .unwrap();
        let id = created[0].task_id().to_string();

        assert!(!h
            .manager
            .change_state(&id, ScheduleStatus::Running, None)
            .unwrap());
        assert_eq!(h.manager.illegal_transition_count(), 1);
        assert_eq!(
            h.storage.read(|s| s.tasks.fetch(&id).map(|t| t.status)),
            Some(ScheduleStatus::Pending)
        );
    }

    #[test]
    fn unknown_live_status_update_is_rekilled() {
        let h = harness();
        assert!(!h
            .manager
            .handle_status_update("ghost", ScheduleStatus::Running, None)
            .unwrap());
        assert_eq!(h.driver.killed(), vec!["ghost".to_string()]);
    }

    #[test]
    fn force_task_state_rejects_illegal_targets() {
        let h = harness();
        let created = h
            .manager
            .insert_pending_tasks(&config(false, 1), &[0])
            .unwrap();
        let id = created[0].task_id().to_string();

        let err = h
            .manager
            .force_task_state(&id, ScheduleStatus::Finished)
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));

        // A legal force applies normally.
        h.manager
            .force_task_state(&id, ScheduleStatus::Assigned)
            .unwrap();
        assert_eq!(
            h.storage.read(|s| s.tasks.fetch(&id).map(|t| t.status)),
            Some(ScheduleStatus::Assigned)
        );
    }

    #[test]
    fn assign_task_writes_host_and_ports() {
        let h = harness();
        let mut cfg = config(false, 1);
        cfg.resources.port_names = vec!["http".to_string()];
        let created = h.manager.insert_pending_tasks(&cfg, &[0]).unwrap();
        let id = created[0].task_id().to_string();

        let assigned = h
            .manager
            .assign_task(&id, "slave-a", "host-a", [("http".to_string(), 31000)].into())
            .unwrap();
        assert_eq!(assigned.status, ScheduleStatus::Assigned);
        assert_eq!(assigned.assigned.slave_host.as_deref(), Some("host-a"));
        assert_eq!(assigned.assigned.assigned_ports.get("http"), Some(&31000));
    }

    #[test]
    fn assign_task_rolls_back_when_not_pending() {
        let h = harness();
        let created = h
            .manager
            .insert_pending_tasks(&config(false, 1), &[0])
            .unwrap();
        let id = created[0].task_id().to_string();
        h.manager
            .change_state(&id, ScheduleStatus::Assigned, None)
            .unwrap();
        h.manager
            .change_state(&id, ScheduleStatus::Running, None)
            .unwrap();

        let err = h
            .manager
            .assign_task(&id, "slave-b", "host-b", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));
        // The failed assignment did not leak into the record.
        let task = h.storage.read(|s| s.tasks.fetch(&id).cloned()).unwrap();
        assert_ne!(task.assigned.slave_host.as_deref(), Some("host-b"));
    }

    #[test]
    fn restart_kills_then_reschedules_on_terminal() {
        let h = harness();
        let created = h
            .manager
            .insert_pending_tasks(&config(false, 1), &[0])
            .unwrap();
        let id = created[0].task_id().to_string();
        for status in [ScheduleStatus::Assigned, ScheduleStatus::Running] {
            h.manager.change_state(&id, status, None).unwrap();
        }

        h.manager
            .change_state(&id, ScheduleStatus::Restarting, None)
            .unwrap();
        assert_eq!(h.driver.killed(), vec![id.clone()]);

        h.manager
            .change_state(&id, ScheduleStatus::Killed, None)
            .unwrap();
        let pending = h.storage.read(|s| {
            s.tasks
                .fetch_all(&TaskQuery::unscoped().by_status(ScheduleStatus::Pending))
        });
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ancestor_id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn events_preserve_timestamp_order_and_final_status() {
        let h = harness();
        let created = h
            .manager
            .insert_pending_tasks(&config(false, 1), &[0])
            .unwrap();
        let id = created[0].task_id().to_string();
        for status in [
            ScheduleStatus::Assigned,
            ScheduleStatus::Starting,
            ScheduleStatus::Running,
        ] {
            h.manager.change_state(&id, status, None).unwrap();
        }

        let task = h.storage.read(|s| s.tasks.fetch(&id).cloned()).unwrap();
        let events = &task.task_events;
        assert_eq!(events.last().map(|e| e.status), Some(task.status));
        assert!(events.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
    }
}
