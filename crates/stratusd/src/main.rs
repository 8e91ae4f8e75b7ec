//! stratusd — the stratus scheduler daemon.
//!
//! Single binary: recovers state from the write-ahead log, wires the
//! scheduler core together, arms the scheduling loop, and serves the
//! REST API until shutdown.
//!
//! # Usage
//!
//! ```text
//! stratusd --port 8653 --data-dir /var/lib/stratus --backup-dir /var/lib/stratus/backups
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use stratus_api::{ApiState, KillSettings, StaticAuth};
use stratus_core::{Clock, SystemClock};
use stratus_scheduler::{
    LivePreemptor, OfferPool, QuotaManager, RateLimiter, RescheduleCalculator,
    RescheduleSettings, TaskAssigner, TaskGroups, TaskGroupsSettings, TaskThrottler,
    TruncatedBinaryBackoff,
};
use stratus_state::{
    EventBus, LockManager, LoggingDriver, MaintenanceController, StateManager,
};
use stratus_storage::{BackupManager, Storage, WriteAheadLog};

#[derive(Parser)]
#[command(name = "stratusd", about = "stratus cluster scheduler daemon")]
struct Cli {
    /// HTTP API port.
    #[arg(long, default_value = "8653")]
    port: u16,

    /// Data directory for the write-ahead log.
    #[arg(long, default_value = "/var/lib/stratus")]
    data_dir: PathBuf,

    /// Directory for backup files.
    #[arg(long, default_value = "/var/lib/stratus/backups")]
    backup_dir: PathBuf,

    /// Interval between automatic log snapshots, in seconds.
    #[arg(long, default_value = "300")]
    log_snapshot_interval_secs: u64,

    /// Maximum size of a single log record, in bytes.
    #[arg(long, default_value = "524288")]
    log_max_entry_size_bytes: usize,

    /// Initial backoff while waiting for killed tasks, in milliseconds.
    #[arg(long, default_value = "1000")]
    kill_task_initial_backoff_ms: u64,

    /// Backoff cap while waiting for killed tasks, in milliseconds.
    #[arg(long, default_value = "30000")]
    kill_task_max_backoff_ms: u64,

    /// Total wait budget for killTasks, in milliseconds.
    #[arg(long, default_value = "300000")]
    kill_task_max_total_wait_ms: u64,

    /// Global placement attempts per second.
    #[arg(long, default_value = "40.0")]
    scheduling_max_per_sec: f64,

    /// Initial task-group penalty, in milliseconds.
    #[arg(long, default_value = "1000")]
    initial_penalty_ms: u64,

    /// Task-group penalty cap, in milliseconds.
    #[arg(long, default_value = "60000")]
    max_penalty_ms: u64,

    /// Upper bound of the random post-failover scheduling delay.
    #[arg(long, default_value = "5000")]
    first_schedule_delay_max_ms: u64,

    /// Tasks whose predecessor lived less than this are throttled.
    #[arg(long, default_value = "300")]
    flapping_threshold_secs: u64,

    /// Throttle penalty for flapping tasks, in milliseconds.
    #[arg(long, default_value = "60000")]
    flap_penalty_ms: u64,

    /// Admin users (repeatable).
    #[arg(long = "admin")]
    admins: Vec<String>,

    /// Grace period for in-flight requests at shutdown, in seconds.
    #[arg(long, default_value = "5")]
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stratusd=debug,stratus=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)?;

    // Storage recovery comes first; nothing schedules until the log is
    // replayed.
    let log = WriteAheadLog::open(
        &cli.data_dir.join("wal.redb"),
        cli.log_max_entry_size_bytes,
    )?;
    let storage = Arc::new(Storage::new(log));
    storage.start()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events = EventBus::default();
    let driver = Arc::new(LoggingDriver);
    let local_host = std::env::var("HOSTNAME").unwrap_or_else(|_| "stratus".to_string());

    let calculator = Arc::new(RescheduleCalculator::new(
        Arc::clone(&clock),
        RescheduleSettings {
            first_schedule_delay_max_ms: cli.first_schedule_delay_max_ms,
            flapping_threshold_ms: cli.flapping_threshold_secs * 1_000,
            flap_penalty_ms: cli.flap_penalty_ms,
        },
    ));

    let state_manager = Arc::new(
        StateManager::new(
            Arc::clone(&storage),
            Arc::clone(&clock),
            driver.clone(),
            events.clone(),
            local_host,
        )
        .with_reschedule_policy(calculator.clone()),
    );

    let locks = Arc::new(LockManager::new(Arc::clone(&storage), Arc::clone(&clock)));
    let quota = Arc::new(QuotaManager::new(Arc::clone(&storage)));
    let maintenance = Arc::new(MaintenanceController::new(
        Arc::clone(&storage),
        Arc::clone(&state_manager),
    ));
    let backups = Arc::new(BackupManager::new(cli.backup_dir.clone()));

    let offers = Arc::new(OfferPool::new());
    let assigner = Arc::new(TaskAssigner::new(
        Arc::clone(&storage),
        Arc::clone(&state_manager),
        Arc::clone(&offers),
        driver.clone(),
    ));
    let preemptor = Arc::new(LivePreemptor::new(
        Arc::clone(&storage),
        Arc::clone(&state_manager),
        Arc::clone(&offers),
    ));
    let groups = Arc::new(TaskGroups::new(
        TaskGroupsSettings {
            backoff: Arc::new(TruncatedBinaryBackoff::new(
                cli.initial_penalty_ms,
                cli.max_penalty_ms,
            )),
            rate_limiter: Arc::new(RateLimiter::new(cli.scheduling_max_per_sec)),
        },
        assigner,
        preemptor,
        Arc::clone(&clock),
        Arc::clone(&calculator),
        Arc::clone(&storage),
    ));

    TaskThrottler::new(Arc::clone(&state_manager), cli.flap_penalty_ms).spawn(&events);
    spawn_event_pump(events.clone(), Arc::clone(&groups), Arc::clone(&maintenance));
    spawn_snapshot_timer(
        Arc::clone(&storage),
        Arc::clone(&clock),
        cli.log_snapshot_interval_secs,
    );

    // Storage is consistent; arm the scheduling loop.
    groups.storage_started();

    let mut auth = StaticAuth::new();
    for admin in &cli.admins {
        auth = auth.with_admin(admin);
    }

    let api_state = ApiState {
        storage: Arc::clone(&storage),
        state_manager,
        locks,
        maintenance,
        quota,
        backups,
        auth: Arc::new(auth),
        clock,
        kill_settings: KillSettings {
            initial_backoff_ms: cli.kill_task_initial_backoff_ms,
            max_backoff_ms: cli.kill_task_max_backoff_ms,
            max_total_wait_ms: cli.kill_task_max_total_wait_ms,
        },
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "stratusd serving");

    axum::serve(listener, stratus_api::build_router(api_state))
        .with_graceful_shutdown(shutdown_signal(cli.shutdown_grace_secs))
        .await?;

    info!("stratusd stopped");
    Ok(())
}

/// Forward committed events to the scheduling loop and the maintenance
/// controller.
fn spawn_event_pump(
    events: EventBus,
    groups: Arc<TaskGroups>,
    maintenance: Arc<MaintenanceController>,
) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            groups.handle_event(&event);
            if let Err(e) = maintenance.handle_event(&event) {
                warn!(error = %e, "maintenance event handling failed");
            }
        }
    });
}

fn spawn_snapshot_timer(storage: Arc<Storage>, clock: Arc<dyn Clock>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            match storage.snapshot(clock.now_ms()) {
                Ok(index) => info!(index, "periodic snapshot"),
                Err(e) => warn!(error = %e, "periodic snapshot failed"),
            }
        }
    });
}

async fn shutdown_signal(grace_secs: u64) {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to listen for shutdown signal");
        return;
    }
    info!(grace_secs, "shutdown requested, draining");
    tokio::time::sleep(Duration::from_secs(grace_secs)).await;
}
