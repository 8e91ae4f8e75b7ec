//! Cluster-manager driver seam.
//!
//! The scheduler core never talks to agents directly; it emits launch
//! and kill instructions through this trait after the owning storage
//! transaction commits. The wire protocol behind it is out of scope.

use std::sync::{Mutex, PoisonError};

use tracing::info;

use stratus_core::ScheduledTask;

pub trait Driver: Send + Sync {
    /// Ask the agent running `task_id` to terminate it.
    fn kill_task(&self, task_id: &str);

    /// Launch an assigned task against the reserved offer.
    fn launch_task(&self, offer_id: &str, task: &ScheduledTask);
}

/// A driver that only logs, for single-process operation without a
/// cluster manager attached.
#[derive(Debug, Default)]
pub struct LoggingDriver;

impl Driver for LoggingDriver {
    fn kill_task(&self, task_id: &str) {
        info!(task_id, "driver: kill task");
    }

    fn launch_task(&self, offer_id: &str, task: &ScheduledTask) {
        info!(
            offer_id,
            task_id = task.task_id(),
            host = task.assigned.slave_host.as_deref().unwrap_or("<unassigned>"),
            "driver: launch task"
        );
    }
}

/// Records every instruction, for tests.
#[derive(Debug, Default)]
pub struct RecordingDriver {
    kills: Mutex<Vec<String>>,
    launches: Mutex<Vec<(String, String)>>,
}

impl RecordingDriver {
    pub fn killed(&self) -> Vec<String> {
        self.kills
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(offer_id, task_id)` pairs in launch order.
    pub fn launched(&self) -> Vec<(String, String)> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Driver for RecordingDriver {
    fn kill_task(&self, task_id: &str) {
        self.kills
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task_id.to_string());
    }

    fn launch_task(&self, offer_id: &str, task: &ScheduledTask) {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((offer_id.to_string(), task.task_id().to_string()));
    }
}
