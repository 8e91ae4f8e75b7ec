//! Operation handlers.
//!
//! Each handler is a thin translation: authenticate, validate the
//! declared lock, call into the core, and wrap the outcome in the
//! response envelope.

use std::collections::{BTreeMap, BTreeSet};

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use stratus_core::{
    is_valid_cron_schedule, JobConfiguration, JobKey, Lock, LockKey, MaintenanceMode,
    ResourceBag, ScheduleStatus, ScheduledTask, TaskConfig, TaskQuery,
};

use crate::auth::identity;
use crate::response::{ApiError, ApiResponse, ApiResult};
use crate::wait::wait_for_terminal;
use crate::ApiState;

// ── Request/response bodies ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub job: JobConfiguration,
    #[serde(default)]
    pub lock_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KillTasksRequest {
    pub query: TaskQuery,
    #[serde(default)]
    pub lock_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestartShardsRequest {
    pub instance_ids: Vec<u32>,
    #[serde(default)]
    pub lock_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddInstancesRequest {
    pub instance_ids: Vec<u32>,
    pub task: TaskConfig,
    #[serde(default)]
    pub lock_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AcquireLockRequest {
    pub job: JobKey,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseLockRequest {
    pub lock: Lock,
}

#[derive(Debug, Deserialize)]
pub struct SetQuotaRequest {
    pub quota: ResourceBag,
}

#[derive(Debug, Deserialize)]
pub struct ForceStateRequest {
    pub status: ScheduleStatus,
}

#[derive(Debug, Deserialize)]
pub struct HostsRequest {
    pub hosts: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusRequest {
    #[serde(default)]
    pub hosts: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct StageRecoveryRequest {
    pub backup_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RecoveryQueryRequest {
    pub query: TaskQuery,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HostStatusResult {
    pub host: String,
    pub mode: MaintenanceMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoleSummary {
    pub role: String,
    pub job_count: usize,
    pub cron_job_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuotaResult {
    pub quota: ResourceBag,
    pub consumed: ResourceBag,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResult {
    pub version: String,
}

// ── Validation ─────────────────────────────────────────────────────

/// Apply defaults and validate a submitted job. Pure.
fn populate_job(mut job: JobConfiguration) -> Result<JobConfiguration, ApiError> {
    if job.instance_count == 0 {
        return Err(ApiError::Invalid("instance count must be positive".into()));
    }
    if job.task.command.trim().is_empty() {
        return Err(ApiError::Invalid("task command must not be empty".into()));
    }
    if job.task.resources.cpu <= 0.0 || job.task.resources.ram_mb == 0 {
        return Err(ApiError::Invalid(
            "task must request positive cpu and ram".into(),
        ));
    }
    if job.task.max_task_failures < -1 {
        return Err(ApiError::Invalid(
            "max task failures must be -1 (unlimited) or non-negative".into(),
        ));
    }
    if let Some(schedule) = &job.cron_schedule {
        if !is_valid_cron_schedule(schedule) {
            return Err(ApiError::Invalid(format!(
                "malformed cron schedule: {schedule}"
            )));
        }
    }
    // The task template inherits the job's coordinates.
    job.task.job = job.key.clone();
    Ok(job)
}

fn job_key_of(role: String, environment: String, name: String) -> JobKey {
    JobKey {
        role,
        environment,
        name,
    }
}

fn active_count(state: &ApiState, key: &JobKey) -> usize {
    state
        .storage
        .read(|s| s.tasks.count(&TaskQuery::unscoped().by_job(key).active()))
}

// ── Jobs ───────────────────────────────────────────────────────────

/// POST /api/v1/jobs
pub async fn create_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<Vec<String>> {
    let user = identity(&headers)?;
    state.auth.authorize(&user, &req.job.key.role)?;
    let job = populate_job(req.job)?;
    state
        .locks
        .assert_not_locked(&LockKey(job.key.clone()), req.lock_token.as_deref())?;

    if job.is_cron() {
        let exists = state
            .storage
            .read(|s| s.jobs.fetch(&job.key).is_some());
        if exists {
            return Err(ApiError::Invalid(format!(
                "cron job {} already exists",
                job.key
            )));
        }
        let key = job.key.clone();
        state
            .storage
            .write::<_, stratus_storage::StorageError>(|txn| txn.save_cron_job(job.clone()))?;
        info!(job = %key, user, "cron job created");
        return Ok(ApiResponse::ok(format!("cron job {key} created"), Vec::new()));
    }

    if active_count(&state, &job.key) > 0 {
        return Err(ApiError::Invalid(format!("job {} already exists", job.key)));
    }
    state.quota.check_quota(&job.task, job.instance_count)?;

    let instance_ids: Vec<u32> = (0..job.instance_count).collect();
    let created = state
        .state_manager
        .insert_pending_tasks(&job.task, &instance_ids)?;
    let ids: Vec<String> = created.iter().map(|t| t.task_id().to_string()).collect();
    info!(job = %job.key, instances = ids.len(), user, "job created");
    Ok(ApiResponse::ok(
        format!("job {} created with {} instances", job.key, ids.len()),
        ids,
    ))
}

/// POST /api/v1/jobs/populate — pure defaults application.
pub async fn populate_job_config(
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<JobConfiguration> {
    let job = populate_job(req.job)?;
    Ok(ApiResponse::ok("job config populated", job))
}

/// GET /api/v1/jobs?role=
pub async fn get_jobs(
    State(state): State<ApiState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> ApiResult<Vec<JobConfiguration>> {
    let role = params.get("role").cloned();
    let mut jobs: Vec<JobConfiguration> = Vec::new();

    state.storage.read(|s| {
        for cron in s.jobs.fetch_all() {
            if role.as_deref().is_none_or(|r| cron.key.role == r) {
                jobs.push(cron.clone());
            }
        }

        // Instance jobs are reconstructed from their live tasks.
        let mut by_job: BTreeMap<JobKey, Vec<&ScheduledTask>> = BTreeMap::new();
        let active = s.tasks.fetch_all(&TaskQuery::unscoped().active());
        for task in &active {
            if role.as_deref().is_none_or(|r| task.job_key().role == r) {
                by_job.entry(task.job_key().clone()).or_default().push(task);
            }
        }
        for (key, tasks) in by_job {
            if jobs.iter().any(|j| j.key == key) {
                continue;
            }
            let instances: BTreeSet<u32> =
                tasks.iter().map(|t| t.assigned.instance_id).collect();
            jobs.push(JobConfiguration {
                key,
                owner: String::new(),
                task: tasks[0].assigned.config.clone(),
                instance_count: instances.len() as u32,
                cron_schedule: None,
            });
        }
    });

    jobs.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(ApiResponse::ok(format!("{} jobs", jobs.len()), jobs))
}

/// GET /api/v1/roles
pub async fn get_role_summary(State(state): State<ApiState>) -> ApiResult<Vec<RoleSummary>> {
    let mut summary: BTreeMap<String, (BTreeSet<JobKey>, usize)> = BTreeMap::new();
    state.storage.read(|s| {
        for task in s.tasks.fetch_all(&TaskQuery::unscoped().active()) {
            summary
                .entry(task.job_key().role.clone())
                .or_default()
                .0
                .insert(task.job_key().clone());
        }
        for cron in s.jobs.fetch_all() {
            summary.entry(cron.key.role.clone()).or_default().1 += 1;
        }
    });

    let roles: Vec<RoleSummary> = summary
        .into_iter()
        .map(|(role, (jobs, cron_jobs))| RoleSummary {
            role,
            job_count: jobs.len(),
            cron_job_count: cron_jobs,
        })
        .collect();
    Ok(ApiResponse::ok(format!("{} roles", roles.len()), roles))
}

// ── Cron ───────────────────────────────────────────────────────────

/// PUT /api/v1/cron/{role}/{environment}/{name}
pub async fn replace_cron_template(
    State(state): State<ApiState>,
    Path((role, environment, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<Vec<String>> {
    let user = identity(&headers)?;
    let key = job_key_of(role, environment, name);
    state.auth.authorize(&user, &key.role)?;

    let mut job = req.job;
    job.key = key.clone();
    let job = populate_job(job)?;
    if !job.is_cron() {
        return Err(ApiError::Invalid("template must carry a cron schedule".into()));
    }

    let known = state.storage.read(|s| s.jobs.fetch(&key).is_some());
    if !known {
        return Err(ApiError::Invalid(format!("unknown cron job {key}")));
    }
    state
        .locks
        .assert_not_locked(&LockKey(key.clone()), req.lock_token.as_deref())?;
    state
        .storage
        .write::<_, stratus_storage::StorageError>(|txn| txn.save_cron_job(job))?;
    Ok(ApiResponse::ok(format!("cron template {key} replaced"), Vec::new()))
}

/// POST /api/v1/cron/{role}/{environment}/{name}/start
pub async fn start_cron_job(
    State(state): State<ApiState>,
    Path((role, environment, name)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Vec<String>> {
    let user = identity(&headers)?;
    let key = job_key_of(role, environment, name);
    state.auth.authorize(&user, &key.role)?;

    let template = state
        .storage
        .read(|s| s.jobs.fetch(&key).cloned())
        .ok_or_else(|| ApiError::Invalid(format!("unknown cron job {key}")))?;

    if active_count(&state, &key) > 0 {
        return Err(ApiError::Invalid(format!("cron job {key} is already running")));
    }
    state
        .quota
        .check_quota(&template.task, template.instance_count)?;

    let instance_ids: Vec<u32> = (0..template.instance_count).collect();
    let created = state
        .state_manager
        .insert_pending_tasks(&template.task, &instance_ids)?;
    let ids: Vec<String> = created.iter().map(|t| t.task_id().to_string()).collect();
    info!(job = %key, instances = ids.len(), "cron job launched");
    Ok(ApiResponse::ok(format!("cron job {key} launched"), ids))
}

// ── Task queries & mutations ───────────────────────────────────────

/// POST /api/v1/tasks/query
pub async fn get_tasks_status(
    State(state): State<ApiState>,
    Json(query): Json<TaskQuery>,
) -> ApiResult<Vec<ScheduledTask>> {
    let mut tasks = state.storage.read(|s| s.tasks.fetch_all(&query));
    tasks.sort_by(|a, b| a.task_id().cmp(b.task_id()));
    Ok(ApiResponse::ok(format!("{} tasks", tasks.len()), tasks))
}

/// POST /api/v1/tasks/kill
pub async fn kill_tasks(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<KillTasksRequest>,
) -> ApiResult<Vec<String>> {
    let user = identity(&headers)?;
    let matched = state.storage.read(|s| s.tasks.fetch_all(&req.query));
    if matched.is_empty() {
        return Err(ApiError::Invalid("no tasks found".into()));
    }

    let roles: BTreeSet<&str> = matched.iter().map(|t| t.job_key().role.as_str()).collect();
    for role in roles {
        state.auth.authorize(&user, role)?;
    }
    let keys: BTreeSet<JobKey> = matched.iter().map(|t| t.job_key().clone()).collect();
    for key in keys {
        state
            .locks
            .assert_not_locked(&LockKey(key), req.lock_token.as_deref())?;
    }

    let active_ids: Vec<&str> = matched
        .iter()
        .filter(|t| t.status.is_active())
        .map(|t| t.task_id())
        .collect();
    if active_ids.is_empty() {
        return Err(ApiError::Invalid("no active tasks found".into()));
    }

    let kill_query = TaskQuery::unscoped().by_task_ids(active_ids.iter().copied());
    let transitioned = state.state_manager.change_states(
        &kill_query,
        ScheduleStatus::Killing,
        Some(format!("killed by {user}")),
    )?;

    wait_for_terminal(&state.storage, &transitioned, state.kill_settings).await?;
    info!(count = transitioned.len(), user, "tasks killed");
    Ok(ApiResponse::ok(
        format!("{} tasks killed", transitioned.len()),
        transitioned,
    ))
}

/// POST /api/v1/jobs/{role}/{environment}/{name}/restart
pub async fn restart_shards(
    State(state): State<ApiState>,
    Path((role, environment, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(req): Json<RestartShardsRequest>,
) -> ApiResult<Vec<String>> {
    let user = identity(&headers)?;
    let key = job_key_of(role, environment, name);
    state.auth.authorize(&user, &key.role)?;
    state
        .locks
        .assert_not_locked(&LockKey(key.clone()), req.lock_token.as_deref())?;

    let query = TaskQuery::unscoped()
        .by_job(&key)
        .by_instance_ids(req.instance_ids.iter().copied())
        .active();
    let transitioned = state.state_manager.change_states(
        &query,
        ScheduleStatus::Restarting,
        Some(format!("restarted by {user}")),
    )?;
    if transitioned.is_empty() {
        return Err(ApiError::Invalid("no tasks found".into()));
    }
    Ok(ApiResponse::ok(
        format!("{} shards restarting", transitioned.len()),
        transitioned,
    ))
}

/// POST /api/v1/jobs/{role}/{environment}/{name}/instances
pub async fn add_instances(
    State(state): State<ApiState>,
    Path((role, environment, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(req): Json<AddInstancesRequest>,
) -> ApiResult<Vec<String>> {
    let user = identity(&headers)?;
    let key = job_key_of(role, environment, name);
    state.auth.authorize(&user, &key.role)?;
    state
        .locks
        .assert_not_locked(&LockKey(key.clone()), req.lock_token.as_deref())?;

    if req.instance_ids.is_empty() {
        return Err(ApiError::Invalid("no instance ids supplied".into()));
    }
    let mut task = req.task;
    task.job = key.clone();

    let colliding = state.storage.read(|s| {
        s.tasks.count(
            &TaskQuery::unscoped()
                .by_job(&key)
                .by_instance_ids(req.instance_ids.iter().copied())
                .active(),
        )
    });
    if colliding > 0 {
        return Err(ApiError::Invalid(format!(
            "{colliding} of the requested instances are already active"
        )));
    }

    state
        .quota
        .check_quota(&task, req.instance_ids.len() as u32)?;
    let created = state
        .state_manager
        .insert_pending_tasks(&task, &req.instance_ids)?;
    let ids: Vec<String> = created.iter().map(|t| t.task_id().to_string()).collect();
    Ok(ApiResponse::ok(
        format!("added {} instances to {key}", ids.len()),
        ids,
    ))
}

/// POST /api/v1/tasks/{task_id}/state — privileged.
pub async fn force_task_state(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ForceStateRequest>,
) -> ApiResult<serde_json::Value> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    state.state_manager.force_task_state(&task_id, req.status)?;
    info!(task_id, status = %req.status, user, "task state forced");
    Ok(ApiResponse::ok_empty(format!(
        "task {task_id} forced to {}",
        req.status
    )))
}

// ── Locks & quota ──────────────────────────────────────────────────

/// POST /api/v1/locks
pub async fn acquire_lock(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<AcquireLockRequest>,
) -> ApiResult<Lock> {
    let user = identity(&headers)?;
    state.auth.authorize(&user, &req.job.role)?;
    let lock = state.locks.acquire(LockKey(req.job), &user)?;
    Ok(ApiResponse::ok("lock acquired", lock))
}

/// DELETE /api/v1/locks
pub async fn release_lock(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<ReleaseLockRequest>,
) -> ApiResult<serde_json::Value> {
    let user = identity(&headers)?;
    state.auth.authorize(&user, &req.lock.key.0.role)?;
    state.locks.release(&req.lock)?;
    Ok(ApiResponse::ok_empty("lock released"))
}

/// GET /api/v1/quotas/{role}
pub async fn get_quota(
    State(state): State<ApiState>,
    Path(role): Path<String>,
) -> ApiResult<QuotaResult> {
    let result = QuotaResult {
        quota: state.quota.quota(&role).unwrap_or_default(),
        consumed: state.quota.consumption(&role),
    };
    Ok(ApiResponse::ok(format!("quota for {role}"), result))
}

/// POST /api/v1/quotas/{role} — privileged.
pub async fn set_quota(
    State(state): State<ApiState>,
    Path(role): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetQuotaRequest>,
) -> ApiResult<serde_json::Value> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    state.quota.set_quota(&role, req.quota)?;
    info!(role, user, "quota updated");
    Ok(ApiResponse::ok_empty(format!("quota for {role} updated")))
}

// ── Maintenance ────────────────────────────────────────────────────

fn host_results(statuses: Vec<stratus_state::HostStatus>) -> Vec<HostStatusResult> {
    statuses
        .into_iter()
        .map(|s| HostStatusResult {
            host: s.host,
            mode: s.mode,
        })
        .collect()
}

/// POST /api/v1/maintenance/start — privileged.
pub async fn start_maintenance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<HostsRequest>,
) -> ApiResult<Vec<HostStatusResult>> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    let statuses = state.maintenance.start_maintenance(&req.hosts)?;
    Ok(ApiResponse::ok("maintenance scheduled", host_results(statuses)))
}

/// POST /api/v1/maintenance/drain — privileged.
pub async fn drain_hosts(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<HostsRequest>,
) -> ApiResult<Vec<HostStatusResult>> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    let statuses = state.maintenance.drain(&req.hosts)?;
    Ok(ApiResponse::ok("draining", host_results(statuses)))
}

/// POST /api/v1/maintenance/status — privileged.
pub async fn maintenance_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<StatusRequest>,
) -> ApiResult<Vec<HostStatusResult>> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    let statuses = state.maintenance.status(req.hosts.as_deref())?;
    Ok(ApiResponse::ok("maintenance status", host_results(statuses)))
}

/// POST /api/v1/maintenance/end — privileged.
pub async fn end_maintenance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<HostsRequest>,
) -> ApiResult<Vec<HostStatusResult>> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    let statuses = state.maintenance.end_maintenance(&req.hosts)?;
    Ok(ApiResponse::ok("maintenance ended", host_results(statuses)))
}

// ── Backup & recovery ──────────────────────────────────────────────

/// POST /api/v1/backups — privileged.
pub async fn perform_backup(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<String> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    let id = state
        .backups
        .perform_backup(&state.storage, state.clock.now_ms())?;
    Ok(ApiResponse::ok("backup written", id))
}

/// GET /api/v1/backups — privileged.
pub async fn list_backups(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Vec<String>> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    let ids = state.backups.list_backups()?;
    Ok(ApiResponse::ok(format!("{} backups", ids.len()), ids))
}

/// POST /api/v1/recovery/stage — privileged.
pub async fn stage_recovery(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<StageRecoveryRequest>,
) -> ApiResult<serde_json::Value> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    state.backups.stage_recovery(&req.backup_id)?;
    Ok(ApiResponse::ok_empty(format!("{} staged", req.backup_id)))
}

/// POST /api/v1/recovery/query — privileged.
pub async fn query_recovery(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<RecoveryQueryRequest>,
) -> ApiResult<Vec<ScheduledTask>> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    let tasks = state.backups.query_recovery(&req.query)?;
    Ok(ApiResponse::ok(format!("{} staged tasks", tasks.len()), tasks))
}

/// POST /api/v1/recovery/delete — privileged.
pub async fn delete_recovery_tasks(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<RecoveryQueryRequest>,
) -> ApiResult<usize> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    let removed = state.backups.delete_recovery_tasks(&req.query)?;
    Ok(ApiResponse::ok(format!("{removed} staged tasks removed"), removed))
}

/// POST /api/v1/recovery/commit — privileged.
pub async fn commit_recovery(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<serde_json::Value> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    state.backups.commit_recovery(&state.storage)?;
    info!(user, "recovery committed");
    Ok(ApiResponse::ok_empty("recovery committed"))
}

/// POST /api/v1/recovery/unload — privileged.
pub async fn unload_recovery(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<serde_json::Value> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    state.backups.unload_recovery();
    Ok(ApiResponse::ok_empty("recovery unloaded"))
}

// ── Misc ───────────────────────────────────────────────────────────

/// POST /api/v1/snapshot — privileged.
pub async fn snapshot(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<u64> {
    let user = identity(&headers)?;
    state.auth.authorize_admin(&user)?;
    let index = state.storage.snapshot(state.clock.now_ms())?;
    Ok(ApiResponse::ok("snapshot written", index))
}

/// GET /api/v1/version
pub async fn get_version() -> ApiResult<VersionResult> {
    Ok(ApiResponse::ok(
        "version",
        VersionResult {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    ))
}
