//! Resource offer pool.
//!
//! Offers are time-bounded advertisements of free host resources from
//! the cluster manager. The pool indexes them by id; accepting an offer
//! removes it, and the host's attributes are recorded for constraint
//! matching as offers arrive.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use stratus_core::{HostAttributes, ResourceBag};
use stratus_storage::{Storage, StorageError, StorageResult};

/// An advertised slice of free resources on one host.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub offer_id: String,
    pub slave_id: String,
    pub host: String,
    pub resources: ResourceBag,
    /// Inclusive port ranges available on the host.
    pub port_ranges: Vec<(u16, u16)>,
    pub attributes: BTreeMap<String, BTreeSet<String>>,
}

impl Offer {
    /// Bind concrete ports for the given names out of the offer's
    /// ranges. Returns `None` when the ranges cannot cover them.
    pub fn allocate_ports(&self, names: &[String]) -> Option<BTreeMap<String, u16>> {
        let mut available = self
            .port_ranges
            .iter()
            .flat_map(|&(lo, hi)| lo..=hi);
        let mut ports = BTreeMap::new();
        for name in names {
            ports.insert(name.clone(), available.next()?);
        }
        Some(ports)
    }
}

/// The live set of unaccepted offers.
pub struct OfferPool {
    offers: Mutex<HashMap<String, Offer>>,
}

impl OfferPool {
    pub fn new() -> Self {
        Self {
            offers: Mutex::new(HashMap::new()),
        }
    }

    /// Admit an offer and record its host attributes (preserving any
    /// maintenance mode already set for the host).
    pub fn add(&self, offer: Offer, storage: &Storage) -> StorageResult<()> {
        storage.write::<_, StorageError>(|txn| {
            let mode = txn.stores().attributes.mode(&offer.host);
            let mut attributes = HostAttributes::new(&offer.host, &offer.slave_id);
            attributes.attributes = offer.attributes.clone();
            attributes.mode = mode;
            txn.save_host_attributes(attributes)
        })?;

        debug!(offer_id = %offer.offer_id, host = %offer.host, "offer added");
        self.offers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(offer.offer_id.clone(), offer);
        Ok(())
    }

    /// Drop a rescinded offer. Returns whether it was present.
    pub fn remove(&self, offer_id: &str) -> bool {
        self.offers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(offer_id)
            .is_some()
    }

    /// Consume an accepted offer.
    pub fn take(&self, offer_id: &str) -> Option<Offer> {
        self.offers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(offer_id)
    }

    /// A point-in-time copy of all live offers, in stable id order.
    pub fn snapshot(&self) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self
            .offers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        offers.sort_by(|a, b| a.offer_id.cmp(&b.offer_id));
        offers
    }

    pub fn len(&self) -> usize {
        self.offers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OfferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::MaintenanceMode;

    fn offer(id: &str, host: &str) -> Offer {
        Offer {
            offer_id: id.to_string(),
            slave_id: format!("slave-{host}"),
            host: host.to_string(),
            resources: ResourceBag::new(4.0, 4096, 40960),
            port_ranges: vec![(31000, 31002)],
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn take_consumes_the_offer() {
        let pool = OfferPool::new();
        let storage = Storage::in_memory().unwrap();
        pool.add(offer("o1", "h1"), &storage).unwrap();

        assert!(pool.take("o1").is_some());
        assert!(pool.take("o1").is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn add_records_host_attributes_preserving_mode() {
        let pool = OfferPool::new();
        let storage = Storage::in_memory().unwrap();
        storage
            .write::<_, StorageError>(|txn| {
                txn.set_maintenance_mode("h1", MaintenanceMode::Draining)
            })
            .unwrap();

        let mut o = offer("o1", "h1");
        o.attributes
            .insert("rack".to_string(), ["r1".to_string()].into());
        pool.add(o, &storage).unwrap();

        let host = storage.read(|s| s.attributes.fetch("h1").cloned()).unwrap();
        assert_eq!(host.mode, MaintenanceMode::Draining);
        assert!(host.attributes.contains_key("rack"));
        assert_eq!(host.slave_id, "slave-h1");
    }

    #[test]
    fn port_allocation_walks_the_ranges() {
        let o = offer("o1", "h1");
        let ports = o
            .allocate_ports(&["http".to_string(), "admin".to_string()])
            .unwrap();
        assert_eq!(ports.get("http"), Some(&31000));
        assert_eq!(ports.get("admin"), Some(&31001));

        // Too many names for the range.
        let names: Vec<String> = (0..4).map(|i| format!("p{i}")).collect();
        assert!(o.allocate_ports(&names).is_none());
    }
}
