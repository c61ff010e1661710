//! The backend service pool.
//!
//! Backends are shared: any number of routing resources may point at the same
//! node port. There is no stored reference count - liveness is re-derived on
//! every pass from the full set of declared ports, and [BackendPool::gc]
//! deletes whatever fell out of that set.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::cloud::{BackendService, Cloud, HealthCheck, Result};
use crate::namer::Namer;

const HEALTH_CHECK_PATH: &str = "/healthz";

pub(crate) struct BackendPool {
    cloud: Arc<dyn Cloud>,
    namer: Namer,
    // serializes provider read/modify/write across concurrent syncs that
    // share a backend. held per operation, never across a whole sync.
    lock: Mutex<()>,
}

impl BackendPool {
    pub(crate) fn new(cloud: Arc<dyn Cloud>, namer: Namer) -> Self {
        Self {
            cloud,
            namer,
            lock: Mutex::new(()),
        }
    }

    /// Create the backend service and its health check for a node port if
    /// they don't exist. Safe to call any number of times.
    pub(crate) fn ensure(&self, port: i32) -> Result<BackendService> {
        let _guard = self.lock.lock().unwrap();

        let name = self.namer.backend(port);
        match self.cloud.get_backend_service(&name) {
            Ok(backend) => Ok(backend),
            Err(e) if e.is_not_found() => {
                let health_check = self.ensure_health_check(port)?;
                let backend = BackendService {
                    name: name.clone(),
                    port,
                    health_check,
                };
                self.cloud.create_backend_service(&backend)?;
                info!(backend = %name, port, "created backend service");
                Ok(backend)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Result<BackendService> {
        self.cloud.get_backend_service(name)
    }

    fn ensure_health_check(&self, port: i32) -> Result<String> {
        let name = self.namer.health_check(port);
        match self.cloud.get_health_check(&name) {
            Ok(_) => Ok(name),
            Err(e) if e.is_not_found() => {
                self.cloud.create_health_check(&HealthCheck {
                    name: name.clone(),
                    port,
                    request_path: HEALTH_CHECK_PATH.to_string(),
                })?;
                Ok(name)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete every backend this pool owns whose port is not in `live_ports`,
    /// along with its health check. Returns the number of backends deleted.
    pub(crate) fn gc(&self, live_ports: &BTreeSet<i32>) -> Result<usize> {
        let _guard = self.lock.lock().unwrap();

        let mut deleted = 0;
        for backend in self.cloud.list_backend_services()? {
            // ownership check: only touch backends whose name we would have
            // derived ourselves.
            if backend.name != self.namer.backend(backend.port) {
                continue;
            }
            if live_ports.contains(&backend.port) {
                continue;
            }

            debug!(backend = %backend.name, port = backend.port, "gc: deleting unreferenced backend");
            self.cloud.delete_backend_service(&backend.name)?;
            match self.cloud.delete_health_check(&self.namer.health_check(backend.port)) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            deleted += 1;
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cloud::fake::FakeCloud;

    fn pool() -> (Arc<FakeCloud>, BackendPool) {
        let cloud = Arc::new(FakeCloud::default());
        let pool = BackendPool::new(cloud.clone(), Namer::new("test"));
        (cloud, pool)
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let (cloud, pool) = pool();

        let first = pool.ensure(30001).unwrap();
        let second = pool.ensure(30001).unwrap();
        assert_eq!(first, second);
        assert_eq!(cloud.num_backend_services(), 1);

        // health check exists and is bound
        assert_eq!(first.health_check, "k8s-hc-30001--test");
        cloud.get_health_check(&first.health_check).unwrap();
    }

    #[test]
    fn test_gc_spares_live_ports() {
        let (cloud, pool) = pool();
        pool.ensure(30001).unwrap();
        pool.ensure(30002).unwrap();
        pool.ensure(30003).unwrap();

        let live: BTreeSet<i32> = [30002].into_iter().collect();
        let deleted = pool.gc(&live).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(cloud.num_backend_services(), 1);
        pool.get("k8s-be-30002--test").unwrap();

        // health checks follow their backends
        assert!(cloud.get_health_check("k8s-hc-30001--test").is_err());
        cloud.get_health_check("k8s-hc-30002--test").unwrap();
    }

    #[test]
    fn test_gc_ignores_foreign_backends() {
        let (cloud, pool) = pool();
        cloud
            .create_backend_service(&BackendService {
                name: "someone-elses-backend".to_string(),
                port: 31000,
                health_check: String::new(),
            })
            .unwrap();

        pool.gc(&BTreeSet::new()).unwrap();
        assert_eq!(cloud.num_backend_services(), 1);
    }
}
