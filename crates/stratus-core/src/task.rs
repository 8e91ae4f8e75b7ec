//! Task configuration and lifecycle records.
//!
//! A `TaskConfig` describes *what* to run; an `AssignedTask` pins a
//! config to a task id, instance index, and (once placed) a host; a
//! `ScheduledTask` carries the authoritative lifecycle state and its
//! audit trail of `TaskEvent`s.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::resources::{ResourceBag, Resources};
use crate::status::ScheduleStatus;

/// Coordinates that name a job: `(role, environment, name)`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct JobKey {
    pub role: String,
    pub environment: String,
    pub name: String,
}

impl JobKey {
    pub fn new(role: &str, environment: &str, name: &str) -> Self {
        Self {
            role: role.to_string(),
            environment: environment.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.role, self.environment, self.name)
    }
}

/// A host-attribute predicate attached to a task config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// The host attribute `name` must (or, when negated, must not)
    /// intersect `values`.
    Value {
        name: String,
        negated: bool,
        values: BTreeSet<String>,
    },
    /// At most `limit` active tasks of this job per distinct value of
    /// the attribute `name` (e.g. `host` limit 1 spreads instances).
    Limit { name: String, limit: u32 },
}

/// Immutable description of a task: what to run and how to schedule it.
///
/// Two configs that are equal schedule identically and share a
/// [`GroupKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub job: JobKey,
    pub resources: Resources,
    /// Shell command executed on the agent.
    pub command: String,
    /// Service tasks are always rescheduled when they terminate.
    pub is_service: bool,
    /// Failure budget; −1 means unlimited.
    pub max_task_failures: i32,
    /// Production tasks count against role quota and are shielded from
    /// preemption by non-production tasks.
    pub production: bool,
    /// Preemption ladder within a production class; higher wins.
    pub priority: u32,
    pub constraints: Vec<Constraint>,
    /// Opaque container/executor metadata, passed through to the agent.
    #[serde(default)]
    pub container: Option<String>,
}

impl TaskConfig {
    /// The scheduling-equivalence fingerprint for this config.
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            job: self.job.clone(),
            fingerprint: serde_json::to_string(self).unwrap_or_default(),
        }
    }

    pub fn resource_bag(&self) -> ResourceBag {
        ResourceBag::from(&self.resources)
    }
}

/// Identifies a group of tasks that are equal in the way they schedule.
///
/// All scheduling-relevant fields participate via the serialized
/// fingerprint; the job key is kept alongside for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    job: JobKey,
    fingerprint: String,
}

impl GroupKey {
    pub fn job(&self) -> &JobKey {
        &self.job
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.job)
    }
}

/// A task config bound to a task id and instance index, plus host
/// assignment once placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTask {
    pub task_id: String,
    /// 0-based index within the job.
    pub instance_id: u32,
    pub config: TaskConfig,
    pub slave_id: Option<String>,
    pub slave_host: Option<String>,
    /// Concrete port bindings, keyed by the config's port names.
    #[serde(default)]
    pub assigned_ports: BTreeMap<String, u16>,
}

impl AssignedTask {
    pub fn new(task_id: String, instance_id: u32, config: TaskConfig) -> Self {
        Self {
            task_id,
            instance_id,
            config,
            slave_id: None,
            slave_host: None,
            assigned_ports: BTreeMap::new(),
        }
    }
}

/// One entry in a task's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp_ms: u64,
    pub status: ScheduleStatus,
    pub message: Option<String>,
    /// Hostname of the scheduler that recorded the event.
    pub scheduler_host: String,
}

/// The authoritative record of a task: assignment, lifecycle state,
/// failure accounting, and audit trail.
///
/// Invariant: when `task_events` is non-empty, the last event's status
/// equals `status`, and event timestamps are non-decreasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub assigned: AssignedTask,
    pub status: ScheduleStatus,
    pub failure_count: i32,
    /// Task id of the predecessor when this task is a reschedule.
    pub ancestor_id: Option<String>,
    pub task_events: Vec<TaskEvent>,
}

impl ScheduledTask {
    pub fn new(assigned: AssignedTask) -> Self {
        Self {
            assigned,
            status: ScheduleStatus::Init,
            failure_count: 0,
            ancestor_id: None,
            task_events: Vec::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.assigned.task_id
    }

    pub fn job_key(&self) -> &JobKey {
        &self.assigned.config.job
    }

    pub fn latest_event(&self) -> Option<&TaskEvent> {
        self.task_events.last()
    }
}

/// Mint a globally unique task id for an instance of a job.
pub fn new_task_id(job: &JobKey, instance_id: u32) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        job.role,
        job.environment,
        job.name,
        instance_id,
        uuid::Uuid::new_v4()
    )
}
