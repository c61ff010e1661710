//! An in-memory [Cloud] that mirrors the provider semantics the pools depend
//! on: existence checks, named address reservation, ephemeral allocation, and
//! the no-live-address-mutation rule for forwarding rules.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::*;

#[derive(Default)]
pub(crate) struct FakeCloud {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    backends: BTreeMap<String, BackendService>,
    health_checks: BTreeMap<String, HealthCheck>,
    url_maps: BTreeMap<String, UrlMap>,
    http_proxies: BTreeMap<String, TargetHttpProxy>,
    https_proxies: BTreeMap<String, TargetHttpsProxy>,
    ssl_certs: BTreeMap<String, SslCertificate>,
    rules: BTreeMap<String, ForwardingRule>,
    addresses: BTreeMap<String, Address>,
    firewalls: BTreeMap<String, Firewall>,
    next_ip: u32,
}

macro_rules! fake_crud {
    ($create:ident, $get:ident, $delete:ident, $field:ident, $ty:ty, $kind:literal) => {
        fn $create(&self, resource: &$ty) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if inner.$field.contains_key(&resource.name) {
                return Err(CloudError::InvalidOperation(format!(
                    concat!($kind, " {:?} already exists"),
                    resource.name
                )));
            }
            inner.$field.insert(resource.name.clone(), resource.clone());
            Ok(())
        }

        fn $get(&self, name: &str) -> Result<$ty> {
            let inner = self.inner.lock().unwrap();
            inner
                .$field
                .get(name)
                .cloned()
                .ok_or_else(|| CloudError::not_found($kind, name))
        }

        fn $delete(&self, name: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner
                .$field
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| CloudError::not_found($kind, name))
        }
    };
}

impl Cloud for FakeCloud {
    fake_crud!(
        create_backend_service,
        get_backend_service,
        delete_backend_service,
        backends,
        BackendService,
        "backend service"
    );

    fake_crud!(
        create_health_check,
        get_health_check,
        delete_health_check,
        health_checks,
        HealthCheck,
        "health check"
    );

    fake_crud!(
        create_url_map,
        get_url_map,
        delete_url_map,
        url_maps,
        UrlMap,
        "url map"
    );

    fake_crud!(
        create_http_proxy,
        get_http_proxy,
        delete_http_proxy,
        http_proxies,
        TargetHttpProxy,
        "target http proxy"
    );

    fake_crud!(
        create_https_proxy,
        get_https_proxy,
        delete_https_proxy,
        https_proxies,
        TargetHttpsProxy,
        "target https proxy"
    );

    fake_crud!(
        create_ssl_certificate,
        get_ssl_certificate,
        delete_ssl_certificate,
        ssl_certs,
        SslCertificate,
        "ssl certificate"
    );

    fake_crud!(
        create_firewall,
        get_firewall,
        delete_firewall,
        firewalls,
        Firewall,
        "firewall"
    );

    fn update_https_proxy(&self, proxy: &TargetHttpsProxy) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.https_proxies.contains_key(&proxy.name) {
            return Err(CloudError::not_found("target https proxy", &proxy.name));
        }
        inner.https_proxies.insert(proxy.name.clone(), proxy.clone());
        Ok(())
    }

    fn list_backend_services(&self) -> Result<Vec<BackendService>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.backends.values().cloned().collect())
    }

    fn update_url_map(&self, url_map: &UrlMap) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.url_maps.contains_key(&url_map.name) {
            return Err(CloudError::not_found("url map", &url_map.name));
        }
        inner.url_maps.insert(url_map.name.clone(), url_map.clone());
        Ok(())
    }

    fn create_forwarding_rule(&self, rule: &ForwardingRule) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.rules.contains_key(&rule.name) {
            // the provider rejects re-creating a live rule; the caller has to
            // delete it first.
            return Err(CloudError::InvalidOperation(format!(
                "forwarding rule {:?} already exists",
                rule.name
            )));
        }
        if rule.ip_address.is_empty() {
            return Err(CloudError::InvalidOperation(format!(
                "forwarding rule {:?} has no address",
                rule.name
            )));
        }
        inner.rules.insert(rule.name.clone(), rule.clone());
        Ok(())
    }

    fn get_forwarding_rule(&self, name: &str) -> Result<ForwardingRule> {
        let inner = self.inner.lock().unwrap();
        inner
            .rules
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found("forwarding rule", name))
    }

    fn delete_forwarding_rule(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .rules
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("forwarding rule", name))
    }

    fn allocate_address(&self, name: &str) -> Result<Address> {
        let mut inner = self.inner.lock().unwrap();
        if inner.addresses.contains_key(name) {
            return Err(CloudError::InvalidOperation(format!(
                "address {name:?} already exists"
            )));
        }
        inner.next_ip += 1;
        let address = Address {
            name: name.to_string(),
            address: format!("10.0.{}.{}", inner.next_ip / 256, inner.next_ip % 256),
        };
        inner.addresses.insert(name.to_string(), address.clone());
        Ok(address)
    }

    fn reserve_address(&self, address: &Address) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.addresses.contains_key(&address.name) {
            return Err(CloudError::InvalidOperation(format!(
                "address {:?} already exists",
                address.name
            )));
        }
        inner.addresses.insert(address.name.clone(), address.clone());
        Ok(())
    }

    fn get_address(&self, name: &str) -> Result<Address> {
        let inner = self.inner.lock().unwrap();
        inner
            .addresses
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found("address", name))
    }

    fn release_address(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .addresses
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("address", name))
    }

    fn update_firewall(&self, firewall: &Firewall) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.firewalls.contains_key(&firewall.name) {
            return Err(CloudError::not_found("firewall", &firewall.name));
        }
        inner
            .firewalls
            .insert(firewall.name.clone(), firewall.clone());
        Ok(())
    }
}

// assertion helpers for tests that want to look at provider state directly.
impl FakeCloud {
    pub(crate) fn forwarding_rules_with_ip(&self, ip: &str) -> Vec<ForwardingRule> {
        let inner = self.inner.lock().unwrap();
        inner
            .rules
            .values()
            .filter(|rule| rule.ip_address == ip)
            .cloned()
            .collect()
    }

    pub(crate) fn has_address(&self, name: &str) -> bool {
        self.inner.lock().unwrap().addresses.contains_key(name)
    }

    pub(crate) fn num_url_maps(&self) -> usize {
        self.inner.lock().unwrap().url_maps.len()
    }

    pub(crate) fn num_target_proxies(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.http_proxies.len() + inner.https_proxies.len()
    }

    pub(crate) fn num_forwarding_rules(&self) -> usize {
        self.inner.lock().unwrap().rules.len()
    }

    pub(crate) fn num_backend_services(&self) -> usize {
        self.inner.lock().unwrap().backends.len()
    }

    pub(crate) fn num_ssl_certificates(&self) -> usize {
        self.inner.lock().unwrap().ssl_certs.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_forwarding_rule_address_is_immutable() {
        let cloud = FakeCloud::default();
        let rule = ForwardingRule {
            name: "rule".to_string(),
            ip_address: "1.2.3.4".to_string(),
            target: "proxy".to_string(),
            port_range: "80".to_string(),
        };
        cloud.create_forwarding_rule(&rule).unwrap();

        let moved = ForwardingRule {
            ip_address: "5.6.7.8".to_string(),
            ..rule.clone()
        };
        assert!(matches!(
            cloud.create_forwarding_rule(&moved),
            Err(CloudError::InvalidOperation(_))
        ));

        cloud.delete_forwarding_rule("rule").unwrap();
        cloud.create_forwarding_rule(&moved).unwrap();
        assert_eq!(
            cloud.get_forwarding_rule("rule").unwrap().ip_address,
            "5.6.7.8"
        );
    }

    #[test]
    fn test_allocated_addresses_are_distinct() {
        let cloud = FakeCloud::default();
        let a = cloud.allocate_address("ip-a").unwrap();
        let b = cloud.allocate_address("ip-b").unwrap();
        assert_ne!(a.address, b.address);

        cloud.release_address("ip-a").unwrap();
        assert!(cloud.release_address("ip-a").is_err());
    }
}
