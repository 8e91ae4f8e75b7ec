//! Job configuration.

use serde::{Deserialize, Serialize};

use crate::task::{JobKey, TaskConfig};

/// A user-submitted job: a task template plus an instance count.
///
/// Only cron jobs are stored long-term; instance jobs are reconstructed
/// from their live tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfiguration {
    pub key: JobKey,
    /// Identity of the submitting user.
    pub owner: String,
    pub task: TaskConfig,
    pub instance_count: u32,
    /// Five-field cron expression; present only for cron jobs.
    #[serde(default)]
    pub cron_schedule: Option<String>,
}

impl JobConfiguration {
    pub fn is_cron(&self) -> bool {
        self.cron_schedule.is_some()
    }
}

/// Shape-check a cron expression: five whitespace-separated fields.
pub fn is_valid_cron_schedule(expr: &str) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    fields.len() == 5 && fields.iter().all(|f| !f.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_pass() {
        assert!(is_valid_cron_schedule("*/5 * * * *"));
        assert!(is_valid_cron_schedule("0 12 * * 1-5"));
    }

    #[test]
    fn short_or_empty_expressions_fail() {
        assert!(!is_valid_cron_schedule(""));
        assert!(!is_valid_cron_schedule("* * *"));
        assert!(!is_valid_cron_schedule("* * * * * *"));
    }
}
