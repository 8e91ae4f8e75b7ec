//! Host maintenance controller.
//!
//! Hosts move `NONE → SCHEDULED → DRAINING → DRAINED → NONE`. Draining
//! a host restarts every active task on it (kill + reschedule through
//! the state machine); once no active tasks remain the host flips to
//! DRAINED. Draining and drained hosts are excluded from placement.

use std::sync::Arc;

use tracing::{info, warn};

use stratus_core::{MaintenanceMode, ScheduleStatus, TaskQuery};
use stratus_storage::Storage;

use crate::error::StateResult;
use crate::events::SchedulerEvent;
use crate::manager::StateManager;

/// Per-host status returned by the maintenance operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatus {
    pub host: String,
    pub mode: MaintenanceMode,
}

pub struct MaintenanceController {
    storage: Arc<Storage>,
    state_manager: Arc<StateManager>,
}

impl MaintenanceController {
    pub fn new(storage: Arc<Storage>, state_manager: Arc<StateManager>) -> Self {
        Self {
            storage,
            state_manager,
        }
    }

    /// Mark hosts for upcoming maintenance: NONE → SCHEDULED.
    pub fn start_maintenance(&self, hosts: &[String]) -> StateResult<Vec<HostStatus>> {
        self.set_modes(hosts, MaintenanceMode::None, MaintenanceMode::Scheduled)
    }

    /// Begin draining: SCHEDULED → DRAINING, then restart every active
    /// task on the drained hosts. Hosts with nothing running flip
    /// straight to DRAINED.
    pub fn drain(&self, hosts: &[String]) -> StateResult<Vec<HostStatus>> {
        let statuses =
            self.set_modes(hosts, MaintenanceMode::Scheduled, MaintenanceMode::Draining)?;

        for status in &statuses {
            if status.mode != MaintenanceMode::Draining {
                continue;
            }
            let query = TaskQuery::unscoped()
                .by_slave_host(&status.host)
                .active();
            let restarted = self.state_manager.change_states(
                &query,
                ScheduleStatus::Restarting,
                Some(format!("host {} is draining", status.host)),
            )?;
            info!(
                host = %status.host,
                tasks = restarted.len(),
                "draining host"
            );
        }

        // Empty hosts are already drained.
        self.promote_drained(hosts)?;
        self.status(Some(hosts))
    }

    /// Return hosts to service: any mode → NONE.
    pub fn end_maintenance(&self, hosts: &[String]) -> StateResult<Vec<HostStatus>> {
        self.storage.write(|txn| {
            let mut statuses = Vec::with_capacity(hosts.len());
            for host in hosts {
                txn.set_maintenance_mode(host, MaintenanceMode::None)?;
                statuses.push(HostStatus {
                    host: host.clone(),
                    mode: MaintenanceMode::None,
                });
            }
            Ok(statuses)
        })
    }

    /// Current mode of the given hosts (or every known host).
    pub fn status(&self, hosts: Option<&[String]>) -> StateResult<Vec<HostStatus>> {
        Ok(self.storage.read(|stores| match hosts {
            Some(hosts) => hosts
                .iter()
                .map(|host| HostStatus {
                    host: host.clone(),
                    mode: stores.attributes.mode(host),
                })
                .collect(),
            None => {
                let mut all: Vec<HostStatus> = stores
                    .attributes
                    .fetch_all()
                    .into_iter()
                    .map(|h| HostStatus {
                        host: h.host.clone(),
                        mode: h.mode,
                    })
                    .collect();
                all.sort_by(|a, b| a.host.cmp(&b.host));
                all
            }
        }))
    }

    /// React to a committed task event: when the last active task
    /// leaves a draining host, the host becomes DRAINED.
    pub fn handle_event(&self, event: &SchedulerEvent) -> StateResult<()> {
        let hosts: Vec<String> = match event {
            SchedulerEvent::TaskStateChange { task, .. } if !task.status.is_active() => {
                task.assigned.slave_host.iter().cloned().collect()
            }
            SchedulerEvent::TasksDeleted { tasks } => tasks
                .iter()
                .filter_map(|t| t.assigned.slave_host.clone())
                .collect(),
            _ => return Ok(()),
        };
        if !hosts.is_empty() {
            self.promote_drained(&hosts)?;
        }
        Ok(())
    }

    fn promote_drained(&self, hosts: &[String]) -> StateResult<()> {
        self.storage.write(|txn| {
            for host in hosts {
                if txn.stores().attributes.mode(host) != MaintenanceMode::Draining {
                    continue;
                }
                let active = txn
                    .stores()
                    .tasks
                    .count(&TaskQuery::unscoped().by_slave_host(host).active());
                if active == 0 {
                    info!(host = %host, "host drained");
                    txn.set_maintenance_mode(host, MaintenanceMode::Drained)?;
                }
            }
            Ok(())
        })
    }

    fn set_modes(
        &self,
        hosts: &[String],
        expected: MaintenanceMode,
        next: MaintenanceMode,
    ) -> StateResult<Vec<HostStatus>> {
        self.storage.write(|txn| {
            let mut statuses = Vec::with_capacity(hosts.len());
            for host in hosts {
                let current = txn.stores().attributes.mode(host);
                if current == expected {
                    txn.set_maintenance_mode(host, next)?;
                    statuses.push(HostStatus {
                        host: host.clone(),
                        mode: next,
                    });
                } else {
                    warn!(host = %host, mode = current_mode(current), "maintenance request out of order");
                    statuses.push(HostStatus {
                        host: host.clone(),
                        mode: current,
                    });
                }
            }
            Ok(statuses)
        })
    }
}

fn current_mode(mode: MaintenanceMode) -> &'static str {
    match mode {
        MaintenanceMode::None => "NONE",
        MaintenanceMode::Scheduled => "SCHEDULED",
        MaintenanceMode::Draining => "DRAINING",
        MaintenanceMode::Drained => "DRAINED",
    }
}
