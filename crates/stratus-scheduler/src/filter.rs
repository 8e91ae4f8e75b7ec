//! Offer filtering: maintenance, resources, and constraints.

use std::collections::BTreeSet;

use stratus_core::{Constraint, ScheduledTask, TaskQuery};
use stratus_storage::Stores;

use crate::offers::Offer;

/// Whether `offer` can host `task`, judging maintenance mode, resource
/// fit, and every config constraint.
pub fn offer_fits(task: &ScheduledTask, offer: &Offer, stores: &Stores) -> bool {
    if stores.attributes.mode(&offer.host).blocks_placement() {
        return false;
    }
    if !offer.resources.at_least(&task.assigned.config.resource_bag()) {
        return false;
    }
    task.assigned
        .config
        .constraints
        .iter()
        .all(|c| constraint_satisfied(task, offer, c, stores))
}

/// First offer (in the given order) that fits the task.
pub fn find_fit<'a>(
    task: &ScheduledTask,
    offers: &'a [Offer],
    stores: &Stores,
) -> Option<&'a Offer> {
    offers.iter().find(|offer| offer_fits(task, offer, stores))
}

fn constraint_satisfied(
    task: &ScheduledTask,
    offer: &Offer,
    constraint: &Constraint,
    stores: &Stores,
) -> bool {
    match constraint {
        Constraint::Value {
            name,
            negated,
            values,
        } => {
            let host_values = attribute_values(offer, name);
            let intersects = host_values.iter().any(|v| values.contains(v));
            intersects != *negated
        }

        // At most `limit` active tasks of this job per distinct value of
        // the attribute; counts tasks on hosts sharing any of the
        // offer's values for it.
        Constraint::Limit { name, limit } => {
            let offer_values = attribute_values(offer, name);
            if offer_values.is_empty() {
                return true;
            }
            let job_tasks = stores
                .tasks
                .fetch_all(&TaskQuery::unscoped().by_job(task.job_key()).active());
            let colliding = job_tasks
                .iter()
                .filter(|t| t.task_id() != task.task_id())
                .filter(|t| {
                    t.assigned.slave_host.as_deref().is_some_and(|host| {
                        host_attribute_values(stores, host, name)
                            .iter()
                            .any(|v| offer_values.contains(v))
                    })
                })
                .count();
            (colliding as u32) < *limit
        }
    }
}

/// The offer's values for an attribute; `host` is implicit on every
/// offer.
fn attribute_values(offer: &Offer, name: &str) -> BTreeSet<String> {
    if name == "host" {
        return [offer.host.clone()].into();
    }
    offer.attributes.get(name).cloned().unwrap_or_default()
}

fn host_attribute_values(stores: &Stores, host: &str, name: &str) -> BTreeSet<String> {
    if name == "host" {
        return [host.to_string()].into();
    }
    stores
        .attributes
        .fetch(host)
        .and_then(|h| h.attributes.get(name).cloned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use stratus_core::{
        AssignedTask, JobKey, MaintenanceMode, ResourceBag, Resources, ScheduleStatus,
        TaskConfig,
    };
    use stratus_storage::{Storage, StorageError};

    fn task_with(constraints: Vec<Constraint>) -> ScheduledTask {
        let config = TaskConfig {
            job: JobKey::new("r", "prod", "web"),
            resources: Resources {
                cpu: 1.0,
                ram_mb: 100,
                disk_mb: 10,
                port_names: Vec::new(),
            },
            command: "serve".to_string(),
            is_service: true,
            max_task_failures: -1,
            production: false,
            priority: 0,
            constraints,
            container: None,
        };
        let mut t = ScheduledTask::new(AssignedTask::new("t1".to_string(), 0, config));
        t.status = ScheduleStatus::Pending;
        t
    }

    fn offer(id: &str, host: &str) -> Offer {
        Offer {
            offer_id: id.to_string(),
            slave_id: format!("slave-{host}"),
            host: host.to_string(),
            resources: ResourceBag::new(4.0, 4096, 40960),
            port_ranges: vec![(31000, 31010)],
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn resource_shortfall_rejects() {
        let storage = Storage::in_memory().unwrap();
        let task = task_with(Vec::new());
        let mut small = offer("o1", "h1");
        small.resources = ResourceBag::new(0.5, 4096, 40960);

        storage.read(|stores| {
            assert!(!offer_fits(&task, &small, stores));
            assert!(offer_fits(&task, &offer("o2", "h2"), stores));
        });
    }

    #[test]
    fn draining_host_rejects() {
        let storage = Storage::in_memory().unwrap();
        storage
            .write::<_, StorageError>(|txn| {
                txn.set_maintenance_mode("h1", MaintenanceMode::Draining)
            })
            .unwrap();

        let task = task_with(Vec::new());
        storage.read(|stores| {
            assert!(!offer_fits(&task, &offer("o1", "h1"), stores));
        });
    }

    #[test]
    fn value_constraint_matches_attribute() {
        let storage = Storage::in_memory().unwrap();
        let task = task_with(vec![Constraint::Value {
            name: "rack".to_string(),
            negated: false,
            values: ["r1".to_string()].into(),
        }]);

        let mut matching = offer("o1", "h1");
        matching
            .attributes
            .insert("rack".to_string(), ["r1".to_string()].into());
        let mut other = offer("o2", "h2");
        other
            .attributes
            .insert("rack".to_string(), ["r2".to_string()].into());

        storage.read(|stores| {
            assert!(offer_fits(&task, &matching, stores));
            assert!(!offer_fits(&task, &other, stores));
        });
    }

    #[test]
    fn negated_value_constraint_excludes() {
        let storage = Storage::in_memory().unwrap();
        let task = task_with(vec![Constraint::Value {
            name: "rack".to_string(),
            negated: true,
            values: ["r1".to_string()].into(),
        }]);

        let mut excluded = offer("o1", "h1");
        excluded
            .attributes
            .insert("rack".to_string(), ["r1".to_string()].into());

        storage.read(|stores| {
            assert!(!offer_fits(&task, &excluded, stores));
            assert!(offer_fits(&task, &offer("o2", "h2"), stores));
        });
    }

    #[test]
    fn host_limit_spreads_instances() {
        let storage = Storage::in_memory().unwrap();
        // One instance of the job already runs on h1.
        let mut running = task_with(Vec::new());
        running.assigned.task_id = "t0".to_string();
        running.status = ScheduleStatus::Running;
        running.assigned.slave_host = Some("h1".to_string());
        storage
            .write::<_, StorageError>(|txn| txn.save_tasks(vec![running]))
            .unwrap();

        let task = task_with(vec![Constraint::Limit {
            name: "host".to_string(),
            limit: 1,
        }]);

        storage.read(|stores| {
            assert!(!offer_fits(&task, &offer("o1", "h1"), stores));
            assert!(offer_fits(&task, &offer("o2", "h2"), stores));
        });
    }

    #[test]
    fn first_fit_respects_offer_order() {
        let storage = Storage::in_memory().unwrap();
        let task = task_with(Vec::new());
        let mut small = offer("o1", "h1");
        small.resources = ResourceBag::default();
        let offers = vec![small, offer("o2", "h2"), offer("o3", "h3")];

        storage.read(|stores| {
            let fit = find_fit(&task, &offers, stores).unwrap();
            assert_eq!(fit.offer_id, "o2");
        });
    }
}
