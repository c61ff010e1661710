//! The cloud provider boundary.
//!
//! Every provider-side resource the controller owns is modeled here, along
//! with the [Cloud] trait the pools call through. The trait is deliberately
//! dumb: create/get/delete per resource kind, no retries, no batching.
//! Idempotency lives in the pools, which always check existence before
//! creating.

use std::collections::{BTreeMap, BTreeSet};

use crate::tls::TlsCerts;

#[cfg(test)]
pub(crate) mod fake;
pub(crate) mod gce;

#[derive(Debug, thiserror::Error)]
pub(crate) enum CloudError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl CloudError {
    pub(crate) fn not_found(kind: &'static str, name: &str) -> Self {
        CloudError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }
}

pub(crate) type Result<T> = std::result::Result<T, CloudError>;

/// A backend service routing to the instances listening on one node port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BackendService {
    pub name: String,
    pub port: i32,
    pub health_check: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HealthCheck {
    pub name: String,
    pub port: i32,
    pub request_path: String,
}

/// A provider URL map. `host_rules` maps host -> ordered (path, backend
/// service name) pairs; the provider applies path rules first-match-wins, so
/// path order is significant and host order is not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct UrlMap {
    pub name: String,
    pub default_backend: String,
    pub host_rules: BTreeMap<String, Vec<(String, String)>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TargetHttpProxy {
    pub name: String,
    pub url_map: String,
}

/// An HTTPS target proxy. Certificates are attached by resource name; the
/// names are content-derived, so comparing `cert_names` against the desired
/// set detects rotated material without reading keys back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TargetHttpsProxy {
    pub name: String,
    pub url_map: String,
    pub cert_names: Vec<String>,
}

/// Uploaded TLS material. The private key is write-only on real providers;
/// reads return it empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SslCertificate {
    pub name: String,
    pub certs: TlsCerts,
}

/// A global forwarding rule binding an address to a target proxy. The
/// provider forbids changing `ip_address` on a live rule, which is why the
/// L7 pool recreates rules instead of patching them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ForwardingRule {
    pub name: String,
    pub ip_address: String,
    pub target: String,
    pub port_range: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Address {
    pub name: String,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Firewall {
    pub name: String,
    pub allowed_ports: BTreeSet<i32>,
    pub source_range: String,
}

/// The provider API surface the pools are written against.
///
/// Implementations: [gce::GceCloud] against a real compute API, and
/// [fake::FakeCloud] for tests. Calls are synchronous; the caller owns
/// timeouts and runs syncs on blocking-friendly workers.
pub(crate) trait Cloud: Send + Sync {
    fn create_backend_service(&self, backend: &BackendService) -> Result<()>;
    fn get_backend_service(&self, name: &str) -> Result<BackendService>;
    fn list_backend_services(&self) -> Result<Vec<BackendService>>;
    fn delete_backend_service(&self, name: &str) -> Result<()>;

    fn create_health_check(&self, check: &HealthCheck) -> Result<()>;
    fn get_health_check(&self, name: &str) -> Result<HealthCheck>;
    fn delete_health_check(&self, name: &str) -> Result<()>;

    fn create_url_map(&self, url_map: &UrlMap) -> Result<()>;
    fn get_url_map(&self, name: &str) -> Result<UrlMap>;
    fn update_url_map(&self, url_map: &UrlMap) -> Result<()>;
    fn delete_url_map(&self, name: &str) -> Result<()>;

    fn create_http_proxy(&self, proxy: &TargetHttpProxy) -> Result<()>;
    fn get_http_proxy(&self, name: &str) -> Result<TargetHttpProxy>;
    fn delete_http_proxy(&self, name: &str) -> Result<()>;

    fn create_https_proxy(&self, proxy: &TargetHttpsProxy) -> Result<()>;
    fn get_https_proxy(&self, name: &str) -> Result<TargetHttpsProxy>;
    /// Repoint a live proxy's url map and certificate set. Unlike forwarding
    /// rule addresses, these are mutable in place, which is what makes cert
    /// rotation possible without touching the forwarding rule.
    fn update_https_proxy(&self, proxy: &TargetHttpsProxy) -> Result<()>;
    fn delete_https_proxy(&self, name: &str) -> Result<()>;

    fn create_ssl_certificate(&self, cert: &SslCertificate) -> Result<()>;
    fn get_ssl_certificate(&self, name: &str) -> Result<SslCertificate>;
    fn delete_ssl_certificate(&self, name: &str) -> Result<()>;

    fn create_forwarding_rule(&self, rule: &ForwardingRule) -> Result<()>;
    fn get_forwarding_rule(&self, name: &str) -> Result<ForwardingRule>;
    fn delete_forwarding_rule(&self, name: &str) -> Result<()>;

    /// Reserve a new address and let the provider pick its value.
    fn allocate_address(&self, name: &str) -> Result<Address>;
    /// Reserve an address with a caller-chosen value.
    fn reserve_address(&self, address: &Address) -> Result<()>;
    fn get_address(&self, name: &str) -> Result<Address>;
    fn release_address(&self, name: &str) -> Result<()>;

    fn create_firewall(&self, firewall: &Firewall) -> Result<()>;
    fn get_firewall(&self, name: &str) -> Result<Firewall>;
    fn update_firewall(&self, firewall: &Firewall) -> Result<()>;
    fn delete_firewall(&self, name: &str) -> Result<()>;
}
