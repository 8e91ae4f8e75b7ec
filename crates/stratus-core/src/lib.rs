//! stratus-core — domain types for the stratus cluster scheduler.
//!
//! Everything the scheduler persists or reasons about lives here: task
//! configurations and their lifecycle records, job templates, resource
//! aggregates, host attributes, advisory locks, and the task query used
//! to address sets of tasks. All types are JSON-serializable; the
//! storage layer writes them verbatim into log records and snapshots.

pub mod clock;
pub mod hosts;
pub mod job;
pub mod lock;
pub mod query;
pub mod resources;
pub mod status;
pub mod task;

pub use clock::{Clock, FakeClock, SystemClock};
pub use hosts::{HostAttributes, MaintenanceMode};
pub use job::{is_valid_cron_schedule, JobConfiguration};
pub use lock::{Lock, LockKey};
pub use query::TaskQuery;
pub use resources::{ResourceBag, Resources};
pub use status::ScheduleStatus;
pub use task::{
    new_task_id, AssignedTask, Constraint, GroupKey, JobKey, ScheduledTask, TaskConfig,
    TaskEvent,
};
