//! The sync engine.
//!
//! `sync(key)` converges provider state for one routing resource and runs the
//! global GC pass. Every step is idempotent and recomputes from declared
//! state, so a failed sync is simply retried whole by the queue - there is no
//! internal retry and no state carried between attempts.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cloud::CloudError;
use crate::clusters::ClusterManager;
use crate::loadbalancers::L7RuntimeInfo;
use crate::state::{ClusterState, RouteSpec, StatusSink};
use crate::tls::{TlsError, TlsLoader};
use crate::urlmap::{self, UrlMapSpec};

#[derive(Debug, thiserror::Error)]
pub(crate) enum SyncError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

pub(crate) struct LbController {
    state: Arc<dyn ClusterState>,
    tls: Arc<dyn TlsLoader>,
    status: Arc<dyn StatusSink>,
    manager: ClusterManager,
    default_backend_port: i32,
}

impl LbController {
    pub(crate) fn new(
        state: Arc<dyn ClusterState>,
        tls: Arc<dyn TlsLoader>,
        status: Arc<dyn StatusSink>,
        manager: ClusterManager,
        default_backend_port: i32,
    ) -> Self {
        Self {
            state,
            tls,
            status,
            manager,
            default_backend_port,
        }
    }

    /// Converge provider state for one routing resource key.
    pub(crate) fn sync(&self, key: &str) -> Result<(), SyncError> {
        let _timer = crate::metrics::scoped_timer!("sync_time");

        // the full declared universe, not just this key: backend liveness and
        // the firewall port set are properties of everything declared, and
        // recomputing them here is what makes GC safe under sharing.
        let routes = self.state.routes();
        let live_keys: HashSet<String> = routes.iter().map(|route| route.key.clone()).collect();
        let live_ports: BTreeSet<i32> = routes
            .iter()
            .flat_map(|route| self.build_url_map(route).node_ports())
            .collect();

        let Some(route) = self.state.route(key) else {
            debug!(key, "routing resource deleted, tearing down");
            self.manager.delete_lb(key)?;
            self.manager.gc(&live_keys, &live_ports)?;
            return Ok(());
        };

        let infos = routes
            .iter()
            .map(|route| self.runtime_info(route))
            .collect::<Result<Vec<_>, SyncError>>()?;
        self.manager.checkpoint(&infos, &live_ports)?;

        let spec = self.build_url_map(&route);
        self.manager.update_url_map(key, &spec)?;

        // status write-back is best effort; the sync already succeeded
        if let Some(l7) = self.manager.l7(key) {
            if !l7.address.is_empty() {
                if let Err(e) = self.status.set_observed_address(key, &l7.address) {
                    warn!(key, err = %e, "failed to record observed address");
                }
            }
        }

        self.manager.gc(&live_keys, &live_ports)?;
        Ok(())
    }

    /// Keys of every routing resource that references a service. The watch
    /// layer uses this to re-enqueue when a service appears or changes, which
    /// is how "no service yet" entries self-heal.
    pub(crate) fn keys_for_service(&self, namespace: &str, service: &str) -> Vec<String> {
        self.state
            .routes()
            .into_iter()
            .filter(|route| {
                route.namespace == namespace && references_service(route, service)
            })
            .map(|route| route.key)
            .collect()
    }

    /// Same, for TLS secrets.
    pub(crate) fn keys_for_secret(&self, namespace: &str, secret: &str) -> Vec<String> {
        self.state
            .routes()
            .into_iter()
            .filter(|route| {
                route.namespace == namespace && route.tls_secrets.iter().any(|name| name == secret)
            })
            .map(|route| route.key)
            .collect()
    }

    /// Resolve a route's backend references into the resolved URL map.
    /// References that don't resolve yet become empty entries, never errors.
    fn build_url_map(&self, route: &RouteSpec) -> UrlMapSpec {
        let default_backend = route
            .default_backend
            .as_ref()
            .and_then(|backend| self.state.node_port(&route.namespace, backend))
            .unwrap_or(self.default_backend_port);

        let hosts: Vec<(String, Vec<(String, Option<i32>)>)> = route
            .host_rules
            .iter()
            .map(|rule| {
                let paths = rule
                    .paths
                    .iter()
                    .map(|(path, backend)| {
                        (
                            path.clone(),
                            self.state.node_port(&route.namespace, backend),
                        )
                    })
                    .collect();
                (rule.host.clone(), paths)
            })
            .collect();

        urlmap::build(default_backend, &hosts)
    }

    fn runtime_info(&self, route: &RouteSpec) -> Result<L7RuntimeInfo, SyncError> {
        let mut certs = vec![];
        for secret in &route.tls_secrets {
            if let Some(loaded) = self.tls.load(&route.namespace, secret)? {
                certs.push(loaded);
            }
        }

        Ok(L7RuntimeInfo {
            key: route.key.clone(),
            certs,
            static_address_name: route.static_address_name.clone(),
        })
    }
}

fn references_service(route: &RouteSpec, service: &str) -> bool {
    let default_matches = route
        .default_backend
        .as_ref()
        .is_some_and(|backend| backend.service == service);

    default_matches
        || route
            .host_rules
            .iter()
            .flat_map(|rule| &rule.paths)
            .any(|(_, backend)| backend.service == service)
}
