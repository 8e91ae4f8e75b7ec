//! Scheduler event bus.
//!
//! Committed state changes are published here; the scheduling loop and
//! the maintenance controller subscribe. Publication happens strictly
//! after the storage transaction commits, so subscribers always observe
//! persisted state.

use tokio::sync::broadcast;

use stratus_core::{ScheduledTask, ScheduleStatus};

/// Events published after a committed storage transaction.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A task moved to a new committed state.
    TaskStateChange {
        task: ScheduledTask,
        old: ScheduleStatus,
    },
    /// Task records were deleted.
    TasksDeleted { tasks: Vec<ScheduledTask> },
    /// Storage finished recovery; PENDING tasks are schedulable.
    StorageReady,
}

/// Broadcast fan-out of [`SchedulerEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Publish to whoever is listening; lagging or absent receivers are
    /// not an error.
    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
