//! The cluster-scoped L7 firewall rule.
//!
//! One rule per cluster, its allowed-port set always replaced wholesale with
//! the union of every port the backend pool retains. Recomputing instead of
//! patching means two concurrent syncs converge on the same rule instead of
//! stomping each other's increments.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::cloud::{Cloud, Firewall, Result};
use crate::namer::Namer;

/// The provider's L7 health-check and proxy source range.
const L7_SOURCE_RANGE: &str = "130.211.0.0/22";

pub(crate) struct FirewallPool {
    cloud: Arc<dyn Cloud>,
    namer: Namer,
    lock: Mutex<()>,
}

impl FirewallPool {
    pub(crate) fn new(cloud: Arc<dyn Cloud>, namer: Namer) -> Self {
        Self {
            cloud,
            namer,
            lock: Mutex::new(()),
        }
    }

    /// Converge the firewall rule on exactly `ports`. An empty set deletes
    /// the rule outright.
    pub(crate) fn sync(&self, ports: &BTreeSet<i32>) -> Result<()> {
        let _guard = self.lock.lock().unwrap();

        let name = self.namer.firewall_rule();
        if ports.is_empty() {
            return match self.cloud.delete_firewall(&name) {
                Ok(()) => {
                    info!(firewall = %name, "deleted firewall rule: no ports in use");
                    Ok(())
                }
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            };
        }

        let desired = Firewall {
            name: name.clone(),
            allowed_ports: ports.clone(),
            source_range: L7_SOURCE_RANGE.to_string(),
        };
        match self.cloud.get_firewall(&name) {
            Ok(existing) if existing == desired => Ok(()),
            Ok(_) => {
                debug!(firewall = %name, ?ports, "replacing firewall port set");
                self.cloud.update_firewall(&desired)
            }
            Err(e) if e.is_not_found() => {
                info!(firewall = %name, ?ports, "creating firewall rule");
                self.cloud.create_firewall(&desired)
            }
            Err(e) => Err(e),
        }
    }
}
