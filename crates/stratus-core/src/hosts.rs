//! Host attributes and maintenance lifecycle.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Maintenance lifecycle of a worker host.
///
/// `None → Scheduled → Draining → Drained → None`. Draining and
/// drained hosts are excluded from placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaintenanceMode {
    None,
    Scheduled,
    Draining,
    Drained,
}

impl MaintenanceMode {
    /// True when the host must not receive new tasks.
    pub fn blocks_placement(self) -> bool {
        matches!(self, MaintenanceMode::Draining | MaintenanceMode::Drained)
    }
}

/// Attributes advertised by a worker host, used for constraint
/// matching, plus the host's maintenance mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostAttributes {
    pub host: String,
    pub slave_id: String,
    /// Attribute name → set of values (e.g. `rack → {r1}`).
    pub attributes: BTreeMap<String, BTreeSet<String>>,
    pub mode: MaintenanceMode,
}

impl HostAttributes {
    pub fn new(host: &str, slave_id: &str) -> Self {
        Self {
            host: host.to_string(),
            slave_id: slave_id.to_string(),
            attributes: BTreeMap::new(),
            mode: MaintenanceMode::None,
        }
    }

    pub fn with_attribute(mut self, name: &str, values: &[&str]) -> Self {
        self.attributes.insert(
            name.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draining_and_drained_block_placement() {
        assert!(!MaintenanceMode::None.blocks_placement());
        assert!(!MaintenanceMode::Scheduled.blocks_placement());
        assert!(MaintenanceMode::Draining.blocks_placement());
        assert!(MaintenanceMode::Drained.blocks_placement());
    }
}
