//! Declared state: what the cluster says the world should look like.
//!
//! The reconciler reads through [ClusterState] and writes observed addresses
//! through [StatusSink], so the sync path never touches the Kubernetes API
//! directly and tests can run against plain in-memory maps.

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Patch, PatchParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, ResourceExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Annotation naming a user-reserved static address for an Ingress.
pub(crate) const STATIC_IP_ANNOTATION: &str = "griddle.io/static-ip-name";

/// A declared backend: a service and which of its ports. `port: None` means
/// the service's only (first) port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BackendRef {
    pub service: String,
    pub port: Option<ServicePortRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ServicePortRef {
    Number(i32),
    Name(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HostRule {
    pub host: String,
    /// Declared order matters: the provider routes first-match-wins.
    pub paths: Vec<(String, BackendRef)>,
}

/// One routing resource, distilled from an Ingress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RouteSpec {
    pub key: String,
    pub namespace: String,
    pub name: String,
    pub default_backend: Option<BackendRef>,
    pub host_rules: Vec<HostRule>,
    pub tls_secrets: Vec<String>,
    pub static_address_name: Option<String>,
}

pub(crate) trait ClusterState: Send + Sync {
    fn route(&self, key: &str) -> Option<RouteSpec>;
    fn routes(&self) -> Vec<RouteSpec>;
    /// Resolve a backend reference to the node port traffic should target.
    /// `None` means the service (or the named port) doesn't exist yet.
    fn node_port(&self, namespace: &str, backend: &BackendRef) -> Option<i32>;
}

pub(crate) trait StatusSink: Send + Sync {
    fn set_observed_address(&self, key: &str, address: &str) -> anyhow::Result<()>;
}

/// [ClusterState] backed by the reflector stores the watch layer keeps warm.
pub(crate) struct KubeState {
    ingresses: Store<Ingress>,
    services: Store<Service>,
}

impl KubeState {
    pub(crate) fn new(ingresses: Store<Ingress>, services: Store<Service>) -> Self {
        Self {
            ingresses,
            services,
        }
    }
}

impl ClusterState for KubeState {
    fn route(&self, key: &str) -> Option<RouteSpec> {
        let (namespace, name) = key.split_once('/')?;
        let ingress = self
            .ingresses
            .get(&ObjectRef::new(name).within(namespace))?;
        route_from_ingress(&ingress)
    }

    fn routes(&self) -> Vec<RouteSpec> {
        self.ingresses
            .state()
            .iter()
            .filter_map(|ingress| route_from_ingress(ingress))
            .collect()
    }

    fn node_port(&self, namespace: &str, backend: &BackendRef) -> Option<i32> {
        let service = self
            .services
            .get(&ObjectRef::new(&backend.service).within(namespace))?;
        let ports = service.spec.as_ref()?.ports.as_ref()?;

        let port = match &backend.port {
            Some(ServicePortRef::Number(number)) => {
                ports.iter().find(|port| port.port == *number)?
            }
            Some(ServicePortRef::Name(name)) => {
                ports.iter().find(|port| port.name.as_deref() == Some(name))?
            }
            None => ports.first()?,
        };
        port.node_port
    }
}

/// Distill an Ingress into the shape the reconciler works with. Returns
/// `None` for objects without the metadata to derive a key.
pub(crate) fn route_from_ingress(ingress: &Ingress) -> Option<RouteSpec> {
    let namespace = ingress.metadata.namespace.clone()?;
    let name = ingress.metadata.name.clone()?;
    let spec = ingress.spec.as_ref()?;

    let default_backend = spec.default_backend.as_ref().and_then(backend_ref);

    let mut host_rules = vec![];
    for rule in spec.rules.iter().flatten() {
        let mut paths = vec![];
        for path in rule.http.iter().flat_map(|http| &http.paths) {
            if let Some(backend) = backend_ref(&path.backend) {
                paths.push((path.path.clone().unwrap_or_default(), backend));
            }
        }
        host_rules.push(HostRule {
            host: rule.host.clone().unwrap_or_default(),
            paths,
        });
    }

    let tls_secrets = spec
        .tls
        .iter()
        .flatten()
        .filter_map(|tls| tls.secret_name.clone())
        .collect();

    let static_address_name = ingress.annotations().get(STATIC_IP_ANNOTATION).cloned();

    Some(RouteSpec {
        key: format!("{namespace}/{name}"),
        namespace,
        name,
        default_backend,
        host_rules,
        tls_secrets,
        static_address_name,
    })
}

fn backend_ref(backend: &k8s_openapi::api::networking::v1::IngressBackend) -> Option<BackendRef> {
    let service = backend.service.as_ref()?;
    let port = service.port.as_ref().and_then(|port| {
        if let Some(number) = port.number {
            Some(ServicePortRef::Number(number))
        } else {
            port.name.clone().map(ServicePortRef::Name)
        }
    });
    Some(BackendRef {
        service: service.name.clone(),
        port,
    })
}

/// A [StatusSink] that hands addresses to an async writer task, keeping the
/// sync path free of Kubernetes API calls. Write-back is best effort by
/// contract; a full channel or failed patch is logged and dropped.
pub(crate) struct IngressStatusSink {
    tx: mpsc::UnboundedSender<(String, String)>,
}

impl StatusSink for IngressStatusSink {
    fn set_observed_address(&self, key: &str, address: &str) -> anyhow::Result<()> {
        self.tx
            .send((key.to_string(), address.to_string()))
            .map_err(|_| anyhow::anyhow!("status writer is gone"))
    }
}

/// Build the sink and the task that drains it.
pub(crate) fn status_writer(
    client: kube::Client,
) -> (IngressStatusSink, impl std::future::Future<Output = ()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();

    let run = async move {
        while let Some((key, address)) = rx.recv().await {
            let Some((namespace, name)) = key.split_once('/') else {
                continue;
            };
            let api: Api<Ingress> = Api::namespaced(client.clone(), namespace);
            let status = serde_json::json!({
                "status": {
                    "loadBalancer": { "ingress": [{ "ip": address }] }
                }
            });
            match api
                .patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
                .await
            {
                Ok(_) => debug!(key, address, "wrote observed address"),
                Err(e) => warn!(key, err = %e, "failed to write observed address"),
            }
        }
    };

    (IngressStatusSink { tx }, run)
}


#[cfg(test)]
mod test {
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
        IngressSpec, IngressTLS, ServiceBackendPort,
    };

    use super::*;

    fn ingress() -> Ingress {
        let mut ingress = Ingress::default();
        ingress.metadata.namespace = Some("default".to_string());
        ingress.metadata.name = Some("web".to_string());
        ingress.spec = Some(IngressSpec {
            default_backend: Some(service_backend("default-svc")),
            rules: Some(vec![IngressRule {
                host: Some("foo.example.com".to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![
                        http_path("/foo1", "foo1svc"),
                        http_path("/foo2", "foo2svc"),
                    ],
                }),
            }]),
            tls: Some(vec![IngressTLS {
                hosts: None,
                secret_name: Some("web-tls".to_string()),
            }]),
            ..Default::default()
        });
        ingress
    }

    fn service_backend(name: &str) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: name.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(80),
                    name: None,
                }),
            }),
            resource: None,
        }
    }

    fn http_path(path: &str, svc: &str) -> HTTPIngressPath {
        HTTPIngressPath {
            path: Some(path.to_string()),
            path_type: "ImplementationSpecific".to_string(),
            backend: service_backend(svc),
        }
    }

    #[test]
    fn test_route_from_ingress() {
        let route = route_from_ingress(&ingress()).unwrap();

        assert_eq!(route.key, "default/web");
        assert_eq!(route.tls_secrets, vec!["web-tls".to_string()]);
        assert_eq!(route.static_address_name, None);

        assert_eq!(route.host_rules.len(), 1);
        let rule = &route.host_rules[0];
        assert_eq!(rule.host, "foo.example.com");
        let paths: Vec<(&str, &str)> = rule
            .paths
            .iter()
            .map(|(path, backend)| (path.as_str(), backend.service.as_str()))
            .collect();
        assert_eq!(paths, vec![("/foo1", "foo1svc"), ("/foo2", "foo2svc")]);
    }

    #[test]
    fn test_route_reads_static_ip_annotation() {
        let mut ing = ingress();
        ing.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(STATIC_IP_ANNOTATION.to_string(), "testip".to_string());

        let route = route_from_ingress(&ing).unwrap();
        assert_eq!(route.static_address_name.as_deref(), Some("testip"));
    }

    #[test]
    fn test_route_with_no_metadata_is_skipped() {
        let mut ing = ingress();
        ing.metadata.namespace = None;
        assert!(route_from_ingress(&ing).is_none());
    }
}
