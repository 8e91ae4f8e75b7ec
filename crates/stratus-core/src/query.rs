//! Task queries.
//!
//! A `TaskQuery` addresses a set of tasks by any combination of job
//! coordinates, ids, statuses, and host. An unset field matches
//! everything; all set fields must match.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::status::ScheduleStatus;
use crate::task::{JobKey, ScheduledTask};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ids: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_ids: Option<BTreeSet<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statuses: Option<BTreeSet<ScheduleStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_host: Option<String>,
}

impl TaskQuery {
    /// A query that matches every task.
    pub fn unscoped() -> Self {
        Self::default()
    }

    pub fn by_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    pub fn by_job(mut self, key: &JobKey) -> Self {
        self.role = Some(key.role.clone());
        self.environment = Some(key.environment.clone());
        self.job_name = Some(key.name.clone());
        self
    }

    pub fn by_task_id(self, task_id: &str) -> Self {
        self.by_task_ids([task_id])
    }

    pub fn by_task_ids<'a>(mut self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        self.task_ids = Some(ids.into_iter().map(str::to_string).collect());
        self
    }

    pub fn by_instance_ids(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.instance_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn by_status(mut self, status: ScheduleStatus) -> Self {
        self.statuses = Some([status].into());
        self
    }

    pub fn by_statuses(mut self, statuses: impl IntoIterator<Item = ScheduleStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    pub fn by_slave_host(mut self, host: &str) -> Self {
        self.slave_host = Some(host.to_string());
        self
    }

    /// Restrict to active (non-terminal, non-init) states.
    pub fn active(self) -> Self {
        self.by_statuses(ScheduleStatus::ACTIVE_STATES)
    }

    pub fn matches(&self, task: &ScheduledTask) -> bool {
        let job = task.job_key();
        if let Some(role) = &self.role {
            if &job.role != role {
                return false;
            }
        }
        if let Some(environment) = &self.environment {
            if &job.environment != environment {
                return false;
            }
        }
        if let Some(name) = &self.job_name {
            if &job.name != name {
                return false;
            }
        }
        if let Some(ids) = &self.task_ids {
            if !ids.contains(task.task_id()) {
                return false;
            }
        }
        if let Some(instances) = &self.instance_ids {
            if !instances.contains(&task.assigned.instance_id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(host) = &self.slave_host {
            if task.assigned.slave_host.as_deref() != Some(host.as_str()) {
                return false;
            }
        }
        true
    }
}
