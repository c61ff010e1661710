//! The cluster resource manager: the single choke point through which the
//! reconciler touches provider state.
//!
//! Composes the backend, L7, and firewall pools and sequences them in
//! dependency order: backends before the proxies that reference them, the
//! firewall recomputed last from the full port universe.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::backends::BackendPool;
use crate::cloud::{Cloud, Result};
use crate::firewall::FirewallPool;
use crate::loadbalancers::{L7, L7Pool, L7RuntimeInfo};
use crate::namer::Namer;
use crate::urlmap::UrlMapSpec;

pub(crate) struct ClusterManager {
    backends: BackendPool,
    l7s: L7Pool,
    firewall: FirewallPool,
    default_backend_port: i32,
}

impl ClusterManager {
    pub(crate) fn new(cloud: Arc<dyn Cloud>, namer: Namer, default_backend_port: i32) -> Self {
        Self {
            backends: BackendPool::new(cloud.clone(), namer.clone()),
            l7s: L7Pool::new(cloud.clone(), namer.clone(), default_backend_port),
            firewall: FirewallPool::new(cloud, namer),
            default_backend_port,
        }
    }

    /// Converge shared state on the full desired universe: every backend in
    /// `node_ports`, every L7 proxy in `lbs`, and the firewall rule covering
    /// exactly that port set. Each step is idempotent; a failure part-way
    /// leaves nothing that a re-run won't pick up.
    pub(crate) fn checkpoint(
        &self,
        lbs: &[L7RuntimeInfo],
        node_ports: &BTreeSet<i32>,
    ) -> Result<()> {
        let ports = self.with_default_port(node_ports);
        for port in &ports {
            self.backends.ensure(*port)?;
        }
        self.l7s.sync(lbs)?;
        self.firewall.sync(&ports)?;
        Ok(())
    }

    pub(crate) fn update_url_map(&self, key: &str, spec: &UrlMapSpec) -> Result<()> {
        self.l7s.update_url_map(key, spec)
    }

    pub(crate) fn l7(&self, key: &str) -> Option<L7> {
        self.l7s.get(key)
    }

    pub(crate) fn delete_lb(&self, key: &str) -> Result<()> {
        self.l7s.delete_lb(key)
    }

    /// Reclaim everything no longer referenced: stale L7 proxies, backends
    /// whose port fell out of the live set, and the firewall rule. With no
    /// live keys at all, the cluster-scoped defaults go too.
    pub(crate) fn gc(&self, live_keys: &HashSet<String>, node_ports: &BTreeSet<i32>) -> Result<()> {
        self.l7s.gc(live_keys)?;

        let ports = if live_keys.is_empty() {
            BTreeSet::new()
        } else {
            self.with_default_port(node_ports)
        };
        self.backends.gc(&ports)?;
        self.firewall.sync(&ports)?;
        Ok(())
    }

    fn with_default_port(&self, node_ports: &BTreeSet<i32>) -> BTreeSet<i32> {
        let mut ports = node_ports.clone();
        ports.insert(self.default_backend_port);
        ports
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cloud::fake::FakeCloud;

    const DEFAULT_PORT: i32 = 30000;

    fn manager() -> (Arc<FakeCloud>, ClusterManager) {
        let cloud = Arc::new(FakeCloud::default());
        let manager = ClusterManager::new(cloud.clone(), Namer::new("test"), DEFAULT_PORT);
        (cloud, manager)
    }

    fn info(key: &str) -> L7RuntimeInfo {
        L7RuntimeInfo {
            key: key.to_string(),
            certs: vec![],
            static_address_name: None,
        }
    }

    #[test]
    fn test_checkpoint_wires_backends_firewall_and_proxy() {
        let (cloud, manager) = manager();
        let ports: BTreeSet<i32> = [30001, 30002].into_iter().collect();

        manager.checkpoint(&[info("default/web")], &ports).unwrap();

        // declared ports plus the cluster default backend
        assert_eq!(cloud.num_backend_services(), 3);
        let firewall = cloud.get_firewall("k8s-fw-l7--test").unwrap();
        assert_eq!(
            firewall.allowed_ports,
            [30000, 30001, 30002].into_iter().collect()
        );
        assert!(manager.l7("default/web").is_some());
    }

    #[test]
    fn test_gc_with_no_live_keys_reclaims_everything() {
        let (cloud, manager) = manager();
        let ports: BTreeSet<i32> = [30001].into_iter().collect();
        manager.checkpoint(&[info("default/web")], &ports).unwrap();

        manager.gc(&HashSet::new(), &BTreeSet::new()).unwrap();

        assert_eq!(cloud.num_backend_services(), 0);
        assert_eq!(cloud.num_url_maps(), 0);
        assert_eq!(cloud.num_forwarding_rules(), 0);
        assert!(cloud.get_firewall("k8s-fw-l7--test").is_err());
    }
}
