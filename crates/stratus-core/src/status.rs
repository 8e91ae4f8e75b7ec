//! Task lifecycle states.

use serde::{Deserialize, Serialize};

/// The lifecycle state of a task.
///
/// Tasks begin in `Init`, become schedulable in `Pending` (or
/// `Throttled` when penalized for flapping), and move through
/// assignment and execution until they reach a terminal state. Once a
/// terminal task is no longer known to any agent it is transitioned to
/// `Unknown` and garbage-collected.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Init,
    Pending,
    Throttled,
    Assigned,
    Starting,
    Running,
    Preempting,
    Restarting,
    Killing,
    Finished,
    Failed,
    Killed,
    Lost,
    Unknown,
}

impl ScheduleStatus {
    /// States in which a task occupies (or is about to occupy) cluster
    /// resources, or is waiting to.
    pub const ACTIVE_STATES: [ScheduleStatus; 8] = [
        ScheduleStatus::Pending,
        ScheduleStatus::Throttled,
        ScheduleStatus::Assigned,
        ScheduleStatus::Starting,
        ScheduleStatus::Running,
        ScheduleStatus::Preempting,
        ScheduleStatus::Restarting,
        ScheduleStatus::Killing,
    ];

    /// States from which a task never runs again.
    pub const TERMINAL_STATES: [ScheduleStatus; 4] = [
        ScheduleStatus::Finished,
        ScheduleStatus::Failed,
        ScheduleStatus::Killed,
        ScheduleStatus::Lost,
    ];

    pub fn is_active(self) -> bool {
        Self::ACTIVE_STATES.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL_STATES.contains(&self)
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScheduleStatus::Init => "INIT",
            ScheduleStatus::Pending => "PENDING",
            ScheduleStatus::Throttled => "THROTTLED",
            ScheduleStatus::Assigned => "ASSIGNED",
            ScheduleStatus::Starting => "STARTING",
            ScheduleStatus::Running => "RUNNING",
            ScheduleStatus::Preempting => "PREEMPTING",
            ScheduleStatus::Restarting => "RESTARTING",
            ScheduleStatus::Killing => "KILLING",
            ScheduleStatus::Finished => "FINISHED",
            ScheduleStatus::Failed => "FAILED",
            ScheduleStatus::Killed => "KILLED",
            ScheduleStatus::Lost => "LOST",
            ScheduleStatus::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}
