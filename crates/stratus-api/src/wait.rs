//! Bounded wait for tasks to terminate.
//!
//! `killTasks` waits for the matched tasks to leave the active states,
//! polling with exponential backoff. Exhausting the budget surfaces a
//! timeout to the caller; the KILLING transitions themselves stand.

use std::sync::Arc;
use std::time::Duration;

use stratus_storage::Storage;

use crate::response::ApiError;

#[derive(Debug, Clone, Copy)]
pub struct KillSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Total wait budget across all polls.
    pub max_total_wait_ms: u64,
}

impl Default for KillSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_total_wait_ms: 5 * 60 * 1_000,
        }
    }
}

fn all_done(storage: &Storage, task_ids: &[String]) -> bool {
    storage.read(|stores| {
        task_ids.iter().all(|id| {
            stores
                .tasks
                .fetch(id)
                .map(|t| !t.status.is_active())
                .unwrap_or(true)
        })
    })
}

/// Wait until every task is terminal or deleted.
pub async fn wait_for_terminal(
    storage: &Arc<Storage>,
    task_ids: &[String],
    settings: KillSettings,
) -> Result<(), ApiError> {
    let mut backoff_ms = settings.initial_backoff_ms.max(1);
    let mut waited_ms = 0u64;

    loop {
        if all_done(storage, task_ids) {
            return Ok(());
        }
        if waited_ms >= settings.max_total_wait_ms {
            return Err(ApiError::Timeout(format!(
                "{} tasks still active after {}ms",
                task_ids.len(),
                waited_ms
            )));
        }

        let sleep_ms = backoff_ms.min(settings.max_total_wait_ms - waited_ms);
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        waited_ms += sleep_ms;
        backoff_ms = (backoff_ms * 2).min(settings.max_backoff_ms);
    }
}
