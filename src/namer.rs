//! Stable names for every provider resource we own.
//!
//! All garbage collection works by re-deriving names from declared state, so
//! the scheme here is load-bearing: a name change orphans existing resources.

/// Derives provider resource names from a cluster name. Cheap to clone and
/// share between pools.
#[derive(Clone, Debug)]
pub(crate) struct Namer {
    cluster: String,
}

impl Namer {
    pub(crate) fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    /// The backend service for a node port.
    pub(crate) fn backend(&self, port: i32) -> String {
        format!("k8s-be-{port}--{}", self.cluster)
    }

    /// The health check paired with [Namer::backend] for the same port.
    pub(crate) fn health_check(&self, port: i32) -> String {
        format!("k8s-hc-{port}--{}", self.cluster)
    }

    /// The single cluster-scoped L7 firewall rule.
    pub(crate) fn firewall_rule(&self) -> String {
        format!("k8s-fw-l7--{}", self.cluster)
    }

    /// The load balancer name for a `namespace/name` routing key. Everything
    /// hanging off one L7 proxy derives from this.
    pub(crate) fn lb_name(&self, key: &str) -> String {
        format!("{}--{}", key.replace('/', "-"), self.cluster)
    }

    pub(crate) fn url_map(&self, lb_name: &str) -> String {
        format!("k8s-um-{lb_name}")
    }

    pub(crate) fn http_proxy(&self, lb_name: &str) -> String {
        format!("k8s-tp-{lb_name}")
    }

    pub(crate) fn https_proxy(&self, lb_name: &str) -> String {
        format!("k8s-tps-{lb_name}")
    }

    pub(crate) fn http_rule(&self, lb_name: &str) -> String {
        format!("k8s-fws-http-{lb_name}")
    }

    pub(crate) fn https_rule(&self, lb_name: &str) -> String {
        format!("k8s-fws-https-{lb_name}")
    }

    /// The provider certificate resource for one piece of TLS material,
    /// named by content fingerprint so rotation shows up as a name change.
    pub(crate) fn ssl_cert(&self, fingerprint: &str) -> String {
        format!("k8s-ssl-{fingerprint}--{}", self.cluster)
    }

    /// The name under which this controller reserves an ephemeral address for
    /// a load balancer. User-reserved addresses never use this name, which is
    /// how release-on-teardown tells the two apart.
    pub(crate) fn address(&self, lb_name: &str) -> String {
        format!("k8s-ip-{lb_name}")
    }
}
