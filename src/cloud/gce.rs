//! A thin REST client for the GCE-style compute API.
//!
//! This is deliberately minimal plumbing: one blocking call per operation,
//! mutations polled to completion, errors mapped onto [CloudError]. Retry and
//! backoff policy belongs to the queue that re-enqueues failed syncs, not
//! here.

use reqwest::{blocking::Client, header::ACCEPT, StatusCode};
use serde_json::{json, Value};

use super::*;

pub(crate) struct GceCloud {
    http: Client,
    endpoint: String,
    project: String,
    token: String,
}

impl GceCloud {
    pub(crate) fn new(endpoint: &str, project: &str, token: &str) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            project: project.to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, collection: &str, name: Option<&str>) -> String {
        let base = format!(
            "{}/compute/v1/projects/{}/global/{collection}",
            self.endpoint, self.project
        );
        match name {
            Some(name) => format!("{base}/{name}"),
            None => base,
        }
    }

    fn get_json(&self, collection: &str, name: &str, kind: &'static str) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(collection, Some(name)))
            .header(ACCEPT, "application/json")
            .bearer_auth(&self.token)
            .send()
            .map_err(|e| CloudError::Provider(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(CloudError::not_found(kind, name)),
            status if status.is_success() => resp
                .json::<Value>()
                .map_err(|e| CloudError::Provider(e.to_string())),
            status => Err(CloudError::Provider(format!(
                "GET {kind} {name:?}: {status}"
            ))),
        }
    }

    fn list_json(&self, collection: &str) -> Result<Vec<Value>> {
        // a single page is enough for the resource counts we manage; the
        // provider default page size is 500.
        let resp = self
            .http
            .get(self.url(collection, None))
            .header(ACCEPT, "application/json")
            .bearer_auth(&self.token)
            .send()
            .map_err(|e| CloudError::Provider(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CloudError::Provider(format!(
                "LIST {collection}: {}",
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .map_err(|e| CloudError::Provider(e.to_string()))?;
        Ok(body["items"].as_array().cloned().unwrap_or_default())
    }

    fn mutate(
        &self,
        method: reqwest::Method,
        url: String,
        body: Option<&Value>,
        kind: &'static str,
        name: &str,
    ) -> Result<()> {
        let mut req = self
            .http
            .request(method, url)
            .header(ACCEPT, "application/json")
            .bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().map_err(|e| CloudError::Provider(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(CloudError::not_found(kind, name)),
            StatusCode::CONFLICT => Err(CloudError::InvalidOperation(format!(
                "{kind} {name:?} already exists"
            ))),
            status if status.is_success() => {
                let op: Value = resp
                    .json()
                    .map_err(|e| CloudError::Provider(e.to_string()))?;
                self.wait_op(&op, kind, name)
            }
            status => Err(CloudError::Provider(format!("{kind} {name:?}: {status}"))),
        }
    }

    /// Poll a compute operation until it reports DONE.
    fn wait_op(&self, op: &Value, kind: &'static str, name: &str) -> Result<()> {
        let Some(op_name) = op["name"].as_str() else {
            // not an async operation response
            return Ok(());
        };

        loop {
            let op = self.get_json("operations", op_name, "operation")?;
            if op["status"].as_str() == Some("DONE") {
                if let Some(errors) = op["error"]["errors"].as_array() {
                    return Err(CloudError::Provider(format!(
                        "{kind} {name:?}: {errors:?}"
                    )));
                }
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(500));
        }
    }

    fn post(&self, collection: &str, body: Value, kind: &'static str, name: &str) -> Result<()> {
        self.mutate(
            reqwest::Method::POST,
            self.url(collection, None),
            Some(&body),
            kind,
            name,
        )
    }

    fn put(&self, collection: &str, body: Value, kind: &'static str, name: &str) -> Result<()> {
        self.mutate(
            reqwest::Method::PUT,
            self.url(collection, Some(name)),
            Some(&body),
            kind,
            name,
        )
    }

    fn delete(&self, collection: &str, name: &str, kind: &'static str) -> Result<()> {
        self.mutate(
            reqwest::Method::DELETE,
            self.url(collection, Some(name)),
            None,
            kind,
            name,
        )
    }
}

fn str_field(value: &Value, field: &str) -> String {
    value[field].as_str().unwrap_or_default().to_string()
}

/// Resource names come back as full self links; we only care about the leaf.
fn name_from_link(link: &str) -> String {
    link.rsplit('/').next().unwrap_or(link).to_string()
}

fn parse_backend(value: &Value) -> BackendService {
    BackendService {
        name: str_field(value, "name"),
        port: value["port"].as_i64().unwrap_or_default() as i32,
        health_check: value["healthChecks"]
            .as_array()
            .and_then(|checks| checks.first())
            .and_then(Value::as_str)
            .map(name_from_link)
            .unwrap_or_default(),
    }
}

fn url_map_to_json(url_map: &UrlMap) -> Value {
    let mut host_rules = vec![];
    let mut path_matchers = vec![];
    for (i, (host, paths)) in url_map.host_rules.iter().enumerate() {
        let matcher = format!("pm-{i}");
        host_rules.push(json!({ "hosts": [host], "pathMatcher": matcher }));
        let path_rules: Vec<Value> = paths
            .iter()
            .map(|(path, backend)| json!({ "paths": [path], "service": backend }))
            .collect();
        path_matchers.push(json!({
            "name": matcher,
            "defaultService": url_map.default_backend,
            "pathRules": path_rules,
        }));
    }

    json!({
        "name": url_map.name,
        "defaultService": url_map.default_backend,
        "hostRules": host_rules,
        "pathMatchers": path_matchers,
    })
}

fn url_map_from_json(value: &Value) -> UrlMap {
    let mut matcher_hosts: BTreeMap<String, String> = BTreeMap::new();
    for rule in value["hostRules"].as_array().into_iter().flatten() {
        let matcher = str_field(rule, "pathMatcher");
        if let Some(host) = rule["hosts"]
            .as_array()
            .and_then(|hosts| hosts.first())
            .and_then(Value::as_str)
        {
            matcher_hosts.insert(matcher, host.to_string());
        }
    }

    let mut host_rules = BTreeMap::new();
    for matcher in value["pathMatchers"].as_array().into_iter().flatten() {
        let Some(host) = matcher_hosts.get(&str_field(matcher, "name")) else {
            continue;
        };
        let mut paths = vec![];
        for path_rule in matcher["pathRules"].as_array().into_iter().flatten() {
            let backend = name_from_link(&str_field(path_rule, "service"));
            for path in path_rule["paths"].as_array().into_iter().flatten() {
                if let Some(path) = path.as_str() {
                    paths.push((path.to_string(), backend.clone()));
                }
            }
        }
        host_rules.insert(host.clone(), paths);
    }

    UrlMap {
        name: str_field(value, "name"),
        default_backend: name_from_link(&str_field(value, "defaultService")),
        host_rules,
    }
}

impl Cloud for GceCloud {
    fn create_backend_service(&self, backend: &BackendService) -> Result<()> {
        self.post(
            "backendServices",
            json!({
                "name": backend.name,
                "port": backend.port,
                "protocol": "HTTP",
                "healthChecks": [backend.health_check],
            }),
            "backend service",
            &backend.name,
        )
    }

    fn get_backend_service(&self, name: &str) -> Result<BackendService> {
        let value = self.get_json("backendServices", name, "backend service")?;
        Ok(parse_backend(&value))
    }

    fn list_backend_services(&self) -> Result<Vec<BackendService>> {
        let items = self.list_json("backendServices")?;
        Ok(items.iter().map(parse_backend).collect())
    }

    fn delete_backend_service(&self, name: &str) -> Result<()> {
        self.delete("backendServices", name, "backend service")
    }

    fn create_health_check(&self, check: &HealthCheck) -> Result<()> {
        self.post(
            "httpHealthChecks",
            json!({
                "name": check.name,
                "port": check.port,
                "requestPath": check.request_path,
            }),
            "health check",
            &check.name,
        )
    }

    fn get_health_check(&self, name: &str) -> Result<HealthCheck> {
        let value = self.get_json("httpHealthChecks", name, "health check")?;
        Ok(HealthCheck {
            name: str_field(&value, "name"),
            port: value["port"].as_i64().unwrap_or_default() as i32,
            request_path: str_field(&value, "requestPath"),
        })
    }

    fn delete_health_check(&self, name: &str) -> Result<()> {
        self.delete("httpHealthChecks", name, "health check")
    }

    fn create_url_map(&self, url_map: &UrlMap) -> Result<()> {
        self.post("urlMaps", url_map_to_json(url_map), "url map", &url_map.name)
    }

    fn get_url_map(&self, name: &str) -> Result<UrlMap> {
        let value = self.get_json("urlMaps", name, "url map")?;
        Ok(url_map_from_json(&value))
    }

    fn update_url_map(&self, url_map: &UrlMap) -> Result<()> {
        self.put("urlMaps", url_map_to_json(url_map), "url map", &url_map.name)
    }

    fn delete_url_map(&self, name: &str) -> Result<()> {
        self.delete("urlMaps", name, "url map")
    }

    fn create_http_proxy(&self, proxy: &TargetHttpProxy) -> Result<()> {
        self.post(
            "targetHttpProxies",
            json!({ "name": proxy.name, "urlMap": proxy.url_map }),
            "target http proxy",
            &proxy.name,
        )
    }

    fn get_http_proxy(&self, name: &str) -> Result<TargetHttpProxy> {
        let value = self.get_json("targetHttpProxies", name, "target http proxy")?;
        Ok(TargetHttpProxy {
            name: str_field(&value, "name"),
            url_map: name_from_link(&str_field(&value, "urlMap")),
        })
    }

    fn delete_http_proxy(&self, name: &str) -> Result<()> {
        self.delete("targetHttpProxies", name, "target http proxy")
    }

    fn create_https_proxy(&self, proxy: &TargetHttpsProxy) -> Result<()> {
        self.post(
            "targetHttpsProxies",
            json!({
                "name": proxy.name,
                "urlMap": proxy.url_map,
                "sslCertificates": proxy.cert_names,
            }),
            "target https proxy",
            &proxy.name,
        )
    }

    fn get_https_proxy(&self, name: &str) -> Result<TargetHttpsProxy> {
        let value = self.get_json("targetHttpsProxies", name, "target https proxy")?;
        let cert_names = value["sslCertificates"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(name_from_link)
            .collect();
        Ok(TargetHttpsProxy {
            name: str_field(&value, "name"),
            url_map: name_from_link(&str_field(&value, "urlMap")),
            cert_names,
        })
    }

    fn update_https_proxy(&self, proxy: &TargetHttpsProxy) -> Result<()> {
        // no single PUT for target proxies; url map and cert set have
        // dedicated setter calls
        self.mutate(
            reqwest::Method::POST,
            format!(
                "{}/setUrlMap",
                self.url("targetHttpsProxies", Some(&proxy.name))
            ),
            Some(&json!({ "urlMap": proxy.url_map })),
            "target https proxy",
            &proxy.name,
        )?;
        self.mutate(
            reqwest::Method::POST,
            format!(
                "{}/setSslCertificates",
                self.url("targetHttpsProxies", Some(&proxy.name))
            ),
            Some(&json!({ "sslCertificates": proxy.cert_names })),
            "target https proxy",
            &proxy.name,
        )
    }

    fn delete_https_proxy(&self, name: &str) -> Result<()> {
        self.delete("targetHttpsProxies", name, "target https proxy")
    }

    fn create_ssl_certificate(&self, cert: &SslCertificate) -> Result<()> {
        self.post(
            "sslCertificates",
            json!({
                "name": cert.name,
                "certificate": cert.certs.cert,
                "privateKey": cert.certs.key,
            }),
            "ssl certificate",
            &cert.name,
        )
    }

    fn get_ssl_certificate(&self, name: &str) -> Result<SslCertificate> {
        let value = self.get_json("sslCertificates", name, "ssl certificate")?;
        Ok(SslCertificate {
            name: str_field(&value, "name"),
            certs: TlsCerts {
                // private keys are write-only on the provider side
                key: String::new(),
                cert: str_field(&value, "certificate"),
            },
        })
    }

    fn delete_ssl_certificate(&self, name: &str) -> Result<()> {
        self.delete("sslCertificates", name, "ssl certificate")
    }

    fn create_forwarding_rule(&self, rule: &ForwardingRule) -> Result<()> {
        self.post(
            "forwardingRules",
            json!({
                "name": rule.name,
                "IPAddress": rule.ip_address,
                "target": rule.target,
                "portRange": rule.port_range,
            }),
            "forwarding rule",
            &rule.name,
        )
    }

    fn get_forwarding_rule(&self, name: &str) -> Result<ForwardingRule> {
        let value = self.get_json("forwardingRules", name, "forwarding rule")?;
        Ok(ForwardingRule {
            name: str_field(&value, "name"),
            ip_address: str_field(&value, "IPAddress"),
            target: name_from_link(&str_field(&value, "target")),
            port_range: str_field(&value, "portRange"),
        })
    }

    fn delete_forwarding_rule(&self, name: &str) -> Result<()> {
        self.delete("forwardingRules", name, "forwarding rule")
    }

    fn allocate_address(&self, name: &str) -> Result<Address> {
        self.post("addresses", json!({ "name": name }), "address", name)?;
        self.get_address(name)
    }

    fn reserve_address(&self, address: &Address) -> Result<()> {
        self.post(
            "addresses",
            json!({ "name": address.name, "address": address.address }),
            "address",
            &address.name,
        )
    }

    fn get_address(&self, name: &str) -> Result<Address> {
        let value = self.get_json("addresses", name, "address")?;
        Ok(Address {
            name: str_field(&value, "name"),
            address: str_field(&value, "address"),
        })
    }

    fn release_address(&self, name: &str) -> Result<()> {
        self.delete("addresses", name, "address")
    }

    fn create_firewall(&self, firewall: &Firewall) -> Result<()> {
        self.post(
            "firewalls",
            firewall_to_json(firewall),
            "firewall",
            &firewall.name,
        )
    }

    fn get_firewall(&self, name: &str) -> Result<Firewall> {
        let value = self.get_json("firewalls", name, "firewall")?;
        let allowed_ports = value["allowed"]
            .as_array()
            .into_iter()
            .flatten()
            .flat_map(|allowed| allowed["ports"].as_array().into_iter().flatten())
            .filter_map(|port| port.as_str().and_then(|p| p.parse().ok()))
            .collect();
        Ok(Firewall {
            name: str_field(&value, "name"),
            allowed_ports,
            source_range: value["sourceRanges"]
                .as_array()
                .and_then(|ranges| ranges.first())
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn update_firewall(&self, firewall: &Firewall) -> Result<()> {
        self.put(
            "firewalls",
            firewall_to_json(firewall),
            "firewall",
            &firewall.name,
        )
    }

    fn delete_firewall(&self, name: &str) -> Result<()> {
        self.delete("firewalls", name, "firewall")
    }
}

fn firewall_to_json(firewall: &Firewall) -> Value {
    let ports: Vec<String> = firewall
        .allowed_ports
        .iter()
        .map(|port| port.to_string())
        .collect();
    json!({
        "name": firewall.name,
        "allowed": [{ "IPProtocol": "tcp", "ports": ports }],
        "sourceRanges": [firewall.source_range],
    })
}
