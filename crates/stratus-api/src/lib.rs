//! stratus-api — the operator/user RPC surface.
//!
//! A thin translation layer between HTTP and the scheduler core: every
//! handler authenticates the caller, validates any declared lock, calls
//! into the core, and answers with a `response_code` envelope.
//!
//! # Routes (all under `/api/v1`)
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | POST | `/jobs` | createJob |
//! | POST | `/jobs/populate` | populateJobConfig |
//! | GET | `/jobs` | getJobs |
//! | GET | `/roles` | getRoleSummary |
//! | PUT | `/cron/{role}/{env}/{name}` | replaceCronTemplate |
//! | POST | `/cron/{role}/{env}/{name}/start` | startCronJob |
//! | POST | `/tasks/query` | getTasksStatus |
//! | POST | `/tasks/kill` | killTasks |
//! | POST | `/tasks/{task_id}/state` | forceTaskState |
//! | POST | `/jobs/{role}/{env}/{name}/restart` | restartShards |
//! | POST | `/jobs/{role}/{env}/{name}/instances` | addInstances |
//! | POST | `/locks` | acquireLock |
//! | DELETE | `/locks` | releaseLock |
//! | GET | `/quotas/{role}` | getQuota |
//! | POST | `/quotas/{role}` | setQuota |
//! | POST | `/maintenance/{start,drain,status,end}` | host lifecycle |
//! | POST | `/backups` + `/recovery/*` | backup/restore workflow |
//! | POST | `/snapshot` | force a log snapshot |
//! | GET | `/version` | getVersion |

pub mod auth;
pub mod handlers;
pub mod response;
pub mod wait;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;

use stratus_core::Clock;
use stratus_scheduler::QuotaManager;
use stratus_state::{LockManager, MaintenanceController, StateManager};
use stratus_storage::{BackupManager, Storage};

pub use auth::{CapabilityValidator, StaticAuth, IDENTITY_HEADER};
pub use response::{ApiError, ApiResponse, ApiResult, ResponseCode};
pub use wait::KillSettings;

/// Shared state for every handler.
#[derive(Clone)]
pub struct ApiState {
    pub storage: Arc<Storage>,
    pub state_manager: Arc<StateManager>,
    pub locks: Arc<LockManager>,
    pub maintenance: Arc<MaintenanceController>,
    pub quota: Arc<QuotaManager>,
    pub backups: Arc<BackupManager>,
    pub auth: Arc<dyn CapabilityValidator>,
    pub clock: Arc<dyn Clock>,
    pub kill_settings: KillSettings,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/jobs", post(handlers::create_job).get(handlers::get_jobs))
        .route("/jobs/populate", post(handlers::populate_job_config))
        .route("/roles", get(handlers::get_role_summary))
        .route(
            "/cron/{role}/{environment}/{name}",
            put(handlers::replace_cron_template),
        )
        .route(
            "/cron/{role}/{environment}/{name}/start",
            post(handlers::start_cron_job),
        )
        .route("/tasks/query", post(handlers::get_tasks_status))
        .route("/tasks/kill", post(handlers::kill_tasks))
        .route("/tasks/{task_id}/state", post(handlers::force_task_state))
        .route(
            "/jobs/{role}/{environment}/{name}/restart",
            post(handlers::restart_shards),
        )
        .route(
            "/jobs/{role}/{environment}/{name}/instances",
            post(handlers::add_instances),
        )
        .route(
            "/locks",
            post(handlers::acquire_lock).delete(handlers::release_lock),
        )
        .route(
            "/quotas/{role}",
            get(handlers::get_quota).post(handlers::set_quota),
        )
        .route("/maintenance/start", post(handlers::start_maintenance))
        .route("/maintenance/drain", post(handlers::drain_hosts))
        .route("/maintenance/status", post(handlers::maintenance_status))
        .route("/maintenance/end", post(handlers::end_maintenance))
        .route(
            "/backups",
            post(handlers::perform_backup).get(handlers::list_backups),
        )
        .route("/recovery/stage", post(handlers::stage_recovery))
        .route("/recovery/query", post(handlers::query_recovery))
        .route("/recovery/delete", post(handlers::delete_recovery_tasks))
        .route("/recovery/commit", post(handlers::commit_recovery))
        .route("/recovery/unload", post(handlers::unload_recovery))
        .route("/snapshot", post(handlers::snapshot))
        .route("/version", get(handlers::get_version));

    Router::new().nest("/api/v1", api).with_state(state)
}
