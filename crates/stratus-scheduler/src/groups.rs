//! Task groups and the scheduling loop.
//!
//! Tasks that schedule identically share a group keyed by their config
//! fingerprint. Each group runs one serialized worker: pop the head,
//! take a global rate-limiter permit, attempt placement, and on failure
//! push the task back with an exponentially grown penalty and consult
//! the preemptor. One permit buys at most one attempt per group, so a
//! thousand-instance job cannot starve a one-instance job.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use stratus_core::{Clock, GroupKey, ScheduleStatus, ScheduledTask, TaskQuery};
use stratus_state::SchedulerEvent;
use stratus_storage::Storage;

use crate::assigner::SchedulingAction;
use crate::backoff::BackoffStrategy;
use crate::preemptor::Preemptor;
use crate::rate_limiter::RateLimiter;
use crate::reschedule::RescheduleCalculator;

/// Shared knobs for every group.
pub struct TaskGroupsSettings {
    pub backoff: Arc<dyn BackoffStrategy>,
    pub rate_limiter: Arc<RateLimiter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Empty,
    Ready,
    NotReady { ready_at_ms: u64 },
}

struct QueueEntry {
    task_id: String,
    ready_at_ms: u64,
}

/// A FIFO of same-fingerprint tasks plus the group's backoff penalty.
pub struct TaskGroup {
    key: GroupKey,
    queue: Mutex<VecDeque<QueueEntry>>,
    penalty_ms: AtomicU64,
}

impl TaskGroup {
    fn new(key: GroupKey, initial_penalty_ms: u64) -> Self {
        Self {
            key,
            queue: Mutex::new(VecDeque::new()),
            penalty_ms: AtomicU64::new(initial_penalty_ms),
        }
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn penalty_ms(&self) -> u64 {
        self.penalty_ms.load(Ordering::Relaxed)
    }

    fn set_penalty_ms(&self, penalty_ms: u64) {
        self.penalty_ms.store(penalty_ms, Ordering::Relaxed);
    }

    fn state(&self, now_ms: u64) -> GroupState {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.front() {
            None => GroupState::Empty,
            Some(head) if head.ready_at_ms <= now_ms => GroupState::Ready,
            Some(head) => GroupState::NotReady {
                ready_at_ms: head.ready_at_ms,
            },
        }
    }

    fn pop(&self) -> Option<String> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .map(|e| e.task_id)
    }

    fn push(&self, task_id: String, ready_at_ms: u64) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(QueueEntry {
                task_id,
                ready_at_ms,
            });
    }

    fn remove(&self, task_id: &str) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|e| e.task_id != task_id);
    }

    fn is_queue_empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

struct Inner {
    groups: Mutex<HashMap<GroupKey, Arc<TaskGroup>>>,
    settings: TaskGroupsSettings,
    action: Arc<dyn SchedulingAction>,
    preemptor: Arc<dyn Preemptor>,
    clock: Arc<dyn Clock>,
    calculator: Arc<RescheduleCalculator>,
    storage: Arc<Storage>,
}

impl Inner {
    /// Drop the group if its queue is empty. Holding the map lock keeps
    /// enqueues from racing the removal.
    fn maybe_invalidate(&self, group: &Arc<TaskGroup>) -> bool {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        if group.is_queue_empty() {
            groups.remove(&group.key);
            debug!(group = %group.key, "group drained, invalidated");
            true
        } else {
            false
        }
    }
}

/// The collection of live task groups and their workers.
pub struct TaskGroups {
    inner: Arc<Inner>,
}

impl TaskGroups {
    pub fn new(
        settings: TaskGroupsSettings,
        action: Arc<dyn SchedulingAction>,
        preemptor: Arc<dyn Preemptor>,
        clock: Arc<dyn Clock>,
        calculator: Arc<RescheduleCalculator>,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                groups: Mutex::new(HashMap::new()),
                settings,
                action,
                preemptor,
                clock,
                calculator,
                storage,
            }),
        }
    }

    /// React to a committed scheduler event.
    pub fn handle_event(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::TaskStateChange { task, .. }
                if task.status == ScheduleStatus::Pending =>
            {
                self.add_task(task, 0);
            }
            SchedulerEvent::TasksDeleted { tasks } => {
                let groups = self
                    .inner
                    .groups
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                for task in tasks {
                    if let Some(group) = groups.get(&task.assigned.config.group_key()) {
                        group.remove(task.task_id());
                    }
                }
            }
            SchedulerEvent::StorageReady => self.storage_started(),
            _ => {}
        }
    }

    /// Arm the loop after recovery: every PENDING task becomes eligible,
    /// spread over a bounded random delay to avoid a thundering herd.
    pub fn storage_started(&self) {
        let pending = self.inner.storage.read(|s| {
            s.tasks
                .fetch_all(&TaskQuery::unscoped().by_status(ScheduleStatus::Pending))
        });
        info!(tasks = pending.len(), "storage ready, arming scheduling loop");
        for task in pending {
            let delay = self.inner.calculator.startup_delay_ms();
            self.add_task(&task, delay);
        }
    }

    /// Enqueue a task into its group, creating the group (and its
    /// worker) on first use.
    fn add_task(&self, task: &ScheduledTask, delay_ms: u64) {
        let key = task.assigned.config.group_key();
        let ready_at = self.inner.clock.now_ms() + delay_ms;

        let mut groups = self
            .inner
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let group = groups.entry(key.clone()).or_insert_with(|| {
            let group = Arc::new(TaskGroup::new(
                key.clone(),
                self.inner.settings.backoff.initial_ms(),
            ));
            info!(group = %group.key, penalty_ms = group.penalty_ms(), "evaluating new group");
            tokio::spawn(run_group(Arc::clone(&self.inner), Arc::clone(&group)));
            group
        });
        group.push(task.task_id().to_string(), ready_at);
    }

    pub fn group_count(&self) -> usize {
        self.inner
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One group's serialized worker loop.
async fn run_group(inner: Arc<Inner>, group: Arc<TaskGroup>) {
    let mut delay_ms = group.penalty_ms();
    loop {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        match group.state(inner.clock.now_ms()) {
            GroupState::Empty => {
                if inner.maybe_invalidate(&group) {
                    return;
                }
                delay_ms = group.penalty_ms();
            }

            GroupState::NotReady { ready_at_ms } => {
                delay_ms = ready_at_ms
                    .saturating_sub(inner.clock.now_ms())
                    .max(1);
            }

            GroupState::Ready => {
                let Some(task_id) = group.pop() else {
                    delay_ms = group.penalty_ms();
                    continue;
                };

                inner.settings.rate_limiter.acquire().await;
                if inner.action.schedule(&task_id) {
                    group.set_penalty_ms(inner.settings.backoff.initial_ms());
                    if inner.maybe_invalidate(&group) {
                        return;
                    }
                    delay_ms = group.penalty_ms();
                } else {
                    let penalty = inner.settings.backoff.next_ms(group.penalty_ms());
                    group.push(task_id.clone(), inner.clock.now_ms() + penalty);
                    group.set_penalty_ms(penalty);
                    delay_ms = penalty;
                    debug!(group = %group.key, task_id, penalty_ms = penalty, "attempt failed, backing off");
                    inner.preemptor.attempt_preemption_for(&task_id);
                }
            }
        }
    }
}
