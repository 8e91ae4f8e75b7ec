//! Placement action.
//!
//! Given a PENDING task id, pick the first offer that fits, bind ports,
//! write the assignment (transitioning PENDING → ASSIGNED) and emit the
//! launch. The offer is consumed only after the assignment commits; a
//! write failure leaves both the task and the offer untouched.

use std::sync::Arc;

use tracing::{debug, info, warn};

use stratus_core::ScheduleStatus;
use stratus_state::{Driver, StateManager};
use stratus_storage::Storage;

use crate::filter::find_fit;
use crate::offers::OfferPool;

/// Attempts to schedule one task, possibly performing irreversible
/// actions. Returns whether the task was placed (or no longer needs
/// placing).
pub trait SchedulingAction: Send + Sync {
    fn schedule(&self, task_id: &str) -> bool;
}

/// The offer-driven first-fit placement action.
pub struct TaskAssigner {
    storage: Arc<Storage>,
    state_manager: Arc<StateManager>,
    offers: Arc<OfferPool>,
    driver: Arc<dyn Driver>,
}

impl TaskAssigner {
    pub fn new(
        storage: Arc<Storage>,
        state_manager: Arc<StateManager>,
        offers: Arc<OfferPool>,
        driver: Arc<dyn Driver>,
    ) -> Self {
        Self {
            storage,
            state_manager,
            offers,
            driver,
        }
    }
}

impl SchedulingAction for TaskAssigner {
    fn schedule(&self, task_id: &str) -> bool {
        let task = match self.storage.read(|s| s.tasks.fetch(task_id).cloned()) {
            Some(task) => task,
            // Deleted since it was queued; nothing left to place.
            None => return true,
        };
        if task.status != ScheduleStatus::Pending {
            debug!(task_id, status = %task.status, "task no longer pending, dropping");
            return true;
        }

        let offers = self.offers.snapshot();
        let chosen = self.storage.read(|stores| {
            find_fit(&task, &offers, stores).map(|offer| offer.clone())
        });
        let Some(offer) = chosen else {
            debug!(task_id, offers = offers.len(), "no feasible offer");
            return false;
        };

        let port_names = &task.assigned.config.resources.port_names;
        let Some(ports) = offer.allocate_ports(port_names) else {
            debug!(task_id, offer_id = %offer.offer_id, "offer cannot cover named ports");
            return false;
        };

        match self
            .state_manager
            .assign_task(task_id, &offer.slave_id, &offer.host, ports)
        {
            Ok(assigned) => {
                self.offers.take(&offer.offer_id);
                self.driver.launch_task(&offer.offer_id, &assigned);
                info!(task_id, host = %offer.host, offer_id = %offer.offer_id, "task placed");
                true
            }
            Err(e) => {
                warn!(task_id, error = %e, "assignment failed, offer retained");
                false
            }
        }
    }
}
