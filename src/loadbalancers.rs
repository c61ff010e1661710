//! The L7 pool: one URL map, one or two target proxies, one or two forwarding
//! rules, and one address per routing resource.
//!
//! Ensure is written to be re-runnable from scratch after any partial
//! failure. Drift is detected against live provider state on every pass, not
//! against a cached "already synced" flag, because provider state can be
//! mutated out from under us.

use std::collections::{BTreeMap, HashMap, HashSet};

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::cloud::{
    Cloud, ForwardingRule, Result, SslCertificate, TargetHttpProxy, TargetHttpsProxy, UrlMap,
};
use crate::namer::Namer;
use crate::tls::TlsCerts;
use crate::urlmap::UrlMapSpec;

/// Everything the pool needs to know about one routing resource to wire up
/// its edge: TLS material and the optionally requested static address.
#[derive(Clone, Debug)]
pub(crate) struct L7RuntimeInfo {
    pub key: String,
    pub certs: Vec<TlsCerts>,
    pub static_address_name: Option<String>,
}

/// A snapshot of one synced L7 proxy.
#[derive(Clone, Debug)]
pub(crate) struct L7 {
    pub key: String,
    pub lb_name: String,
    /// The address both forwarding rules are bound to.
    pub address: String,
}

impl L7 {
    pub(crate) fn url_map_name(&self, namer: &Namer) -> String {
        namer.url_map(&self.lb_name)
    }
}

pub(crate) struct L7Pool {
    cloud: Arc<dyn Cloud>,
    namer: Namer,
    default_backend_port: i32,
    lbs: Mutex<HashMap<String, L7>>,
}

impl L7Pool {
    pub(crate) fn new(cloud: Arc<dyn Cloud>, namer: Namer, default_backend_port: i32) -> Self {
        Self {
            cloud,
            namer,
            default_backend_port,
            lbs: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<L7> {
        self.lbs.lock().unwrap().get(key).cloned()
    }

    /// Ensure an L7 proxy exists and is wired up for every runtime info.
    pub(crate) fn sync(&self, infos: &[L7RuntimeInfo]) -> Result<()> {
        for info in infos {
            let l7 = self.ensure(info)?;
            self.lbs.lock().unwrap().insert(info.key.clone(), l7);
        }
        Ok(())
    }

    /// Converge one proxy's URL map on the desired spec.
    pub(crate) fn update_url_map(&self, key: &str, spec: &UrlMapSpec) -> Result<()> {
        let lb_name = self.namer.lb_name(key);
        let um_name = self.namer.url_map(&lb_name);

        let desired = provider_url_map(&um_name, spec, &self.namer);
        let live = self.cloud.get_url_map(&um_name)?;
        if live != desired {
            debug!(url_map = %um_name, "correcting url map drift");
            self.cloud.update_url_map(&desired)?;
        }
        Ok(())
    }

    /// Tear down every proxy whose key is not in `live_keys`.
    pub(crate) fn gc(&self, live_keys: &HashSet<String>) -> Result<()> {
        let stale: Vec<String> = {
            let lbs = self.lbs.lock().unwrap();
            lbs.keys()
                .filter(|key| !live_keys.contains(*key))
                .cloned()
                .collect()
        };

        for key in stale {
            self.delete_lb(&key)?;
        }
        Ok(())
    }

    /// Cascade-delete the proxy for a key: forwarding rules, target proxies,
    /// URL map, and any ephemeral address this pool allocated. Backends are
    /// shared and explicitly not touched here. Deleting an absent proxy is a
    /// no-op.
    pub(crate) fn delete_lb(&self, key: &str) -> Result<()> {
        let lb_name = self.namer.lb_name(key);

        self.delete_https_half(&lb_name)?;
        ignore_not_found(self.cloud.delete_forwarding_rule(&self.namer.http_rule(&lb_name)))?;
        ignore_not_found(self.cloud.delete_http_proxy(&self.namer.http_proxy(&lb_name)))?;
        ignore_not_found(self.cloud.delete_url_map(&self.namer.url_map(&lb_name)))?;
        // only the address we reserved ourselves; a user-reserved address is
        // never ours to release
        ignore_not_found(self.cloud.release_address(&self.namer.address(&lb_name)))?;

        if self.lbs.lock().unwrap().remove(key).is_some() {
            info!(key, "deleted L7 proxy");
        }
        Ok(())
    }

    fn ensure(&self, info: &L7RuntimeInfo) -> Result<L7> {
        let lb_name = self.namer.lb_name(&info.key);
        let um_name = self.namer.url_map(&lb_name);

        // url map first; everything else points at it. it starts with just
        // the default backend and gets its rules from update_url_map.
        match self.cloud.get_url_map(&um_name) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                self.cloud.create_url_map(&UrlMap {
                    name: um_name.clone(),
                    default_backend: self.namer.backend(self.default_backend_port),
                    host_rules: BTreeMap::new(),
                })?;
                info!(key = %info.key, url_map = %um_name, "created url map");
            }
            Err(e) => return Err(e),
        }

        let http_proxy = self.namer.http_proxy(&lb_name);
        self.ensure_http_proxy(&http_proxy, &um_name)?;

        // pick the address before touching any forwarding rule so both rules
        // see the same value in a single pass. a requested named address wins;
        // otherwise whatever the existing rule holds; otherwise an ephemeral
        // allocation happens on first rule create.
        let mut ip = match &info.static_address_name {
            Some(name) => Some(self.cloud.get_address(name)?.address),
            None => None,
        };

        self.ensure_forwarding_rule(
            &self.namer.http_rule(&lb_name),
            &http_proxy,
            &mut ip,
            "80",
            &lb_name,
        )?;

        if info.certs.is_empty() {
            // TLS was removed (or never present): make sure no HTTPS half is
            // left behind.
            self.delete_https_half(&lb_name)?;
        } else {
            let https_proxy = self.namer.https_proxy(&lb_name);
            self.ensure_https_proxy(&https_proxy, &um_name, &info.certs)?;
            self.ensure_forwarding_rule(
                &self.namer.https_rule(&lb_name),
                &https_proxy,
                &mut ip,
                "443",
                &lb_name,
            )?;
        }

        // once a user-named address is bound, our old ephemeral reservation
        // (if any) is dead weight
        if info.static_address_name.is_some() {
            match self.cloud.release_address(&self.namer.address(&lb_name)) {
                Ok(()) => info!(key = %info.key, "released superseded ephemeral address"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        Ok(L7 {
            key: info.key.clone(),
            lb_name,
            address: ip.unwrap_or_default(),
        })
    }

    fn ensure_http_proxy(&self, name: &str, um_name: &str) -> Result<()> {
        match self.cloud.get_http_proxy(name) {
            Ok(proxy) if proxy.url_map == um_name => return Ok(()),
            Ok(_) => self.cloud.delete_http_proxy(name)?,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.cloud.create_http_proxy(&TargetHttpProxy {
            name: name.to_string(),
            url_map: um_name.to_string(),
        })
    }

    /// Converge the HTTPS proxy on (`um_name`, `certs`). Certificate resource
    /// names are content-derived, so rotated material shows up as a cert-name
    /// mismatch on the live proxy even though private keys can't be read
    /// back. New certs are uploaded first, the live proxy is repointed in
    /// place (a live proxy can't be deleted while a forwarding rule targets
    /// it), and the superseded cert resources are deleted last.
    fn ensure_https_proxy(&self, name: &str, um_name: &str, certs: &[TlsCerts]) -> Result<()> {
        let desired: Vec<String> = certs
            .iter()
            .map(|cert| self.namer.ssl_cert(&cert.fingerprint()))
            .collect();

        let existing = match self.cloud.get_https_proxy(name) {
            Ok(proxy) if proxy.url_map == um_name && proxy.cert_names == desired => {
                return Ok(())
            }
            Ok(proxy) => Some(proxy),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        for (cert_name, cert) in desired.iter().zip(certs) {
            match self.cloud.get_ssl_certificate(cert_name) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    self.cloud.create_ssl_certificate(&SslCertificate {
                        name: cert_name.clone(),
                        certs: cert.clone(),
                    })?;
                }
                Err(e) => return Err(e),
            }
        }

        let proxy = TargetHttpsProxy {
            name: name.to_string(),
            url_map: um_name.to_string(),
            cert_names: desired.clone(),
        };
        match &existing {
            Some(_) => {
                debug!(proxy = %name, "updating https proxy certs");
                self.cloud.update_https_proxy(&proxy)?;
            }
            None => self.cloud.create_https_proxy(&proxy)?,
        }

        for cert_name in existing.into_iter().flat_map(|proxy| proxy.cert_names) {
            if !desired.contains(&cert_name) {
                ignore_not_found(self.cloud.delete_ssl_certificate(&cert_name))?;
            }
        }
        Ok(())
    }

    /// Tear down the HTTPS forwarding rule, proxy, and the certs attached to
    /// it. A no-op when none of it exists.
    fn delete_https_half(&self, lb_name: &str) -> Result<()> {
        ignore_not_found(
            self.cloud
                .delete_forwarding_rule(&self.namer.https_rule(lb_name)),
        )?;

        let name = self.namer.https_proxy(lb_name);
        let cert_names = match self.cloud.get_https_proxy(&name) {
            Ok(proxy) => {
                self.cloud.delete_https_proxy(&name)?;
                proxy.cert_names
            }
            Err(e) if e.is_not_found() => vec![],
            Err(e) => return Err(e),
        };
        for cert_name in cert_names {
            ignore_not_found(self.cloud.delete_ssl_certificate(&cert_name))?;
        }
        Ok(())
    }

    /// Converge one forwarding rule on (`target`, `ip`).
    ///
    /// `ip` is in/out: `None` means "no address requirement yet" and is filled
    /// in from the existing rule or a fresh ephemeral allocation, so that the
    /// second rule of a pair is pinned to whatever the first one got.
    ///
    /// The provider forbids changing the address of a live rule, so an
    /// address change is a delete-and-recreate.
    fn ensure_forwarding_rule(
        &self,
        name: &str,
        target: &str,
        ip: &mut Option<String>,
        port_range: &str,
        lb_name: &str,
    ) -> Result<()> {
        match self.cloud.get_forwarding_rule(name) {
            Ok(rule) => {
                let moved = ip.as_deref().is_some_and(|want| want != rule.ip_address);
                if !moved && rule.target == target {
                    if ip.is_none() {
                        *ip = Some(rule.ip_address);
                    }
                    return Ok(());
                }
                debug!(rule = %name, moved, "recreating forwarding rule");
                self.cloud.delete_forwarding_rule(name)?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let ip_address = match ip {
            Some(ip) => ip.clone(),
            None => {
                let allocated = self.ensure_ephemeral_address(lb_name)?;
                *ip = Some(allocated.clone());
                allocated
            }
        };

        self.cloud.create_forwarding_rule(&ForwardingRule {
            name: name.to_string(),
            ip_address,
            target: target.to_string(),
            port_range: port_range.to_string(),
        })
    }

    /// Reuse our reservation for this lb if it survives from an earlier pass,
    /// so recreating rules doesn't churn the address.
    fn ensure_ephemeral_address(&self, lb_name: &str) -> Result<String> {
        let name = self.namer.address(lb_name);
        match self.cloud.get_address(&name) {
            Ok(address) => Ok(address.address),
            Err(e) if e.is_not_found() => {
                let address = self.cloud.allocate_address(&name)?;
                info!(address = %address.address, lb = %lb_name, "allocated ephemeral address");
                Ok(address.address)
            }
            Err(e) => Err(e),
        }
    }
}

/// The provider-side rendering of a resolved URL map: node ports become
/// backend service names.
pub(crate) fn provider_url_map(name: &str, spec: &UrlMapSpec, namer: &Namer) -> UrlMap {
    let host_rules = spec
        .host_rules
        .iter()
        .map(|(host, rules)| {
            let paths = rules
                .iter()
                .map(|rule| (rule.path.clone(), namer.backend(rule.node_port)))
                .collect();
            (host.clone(), paths)
        })
        .collect();

    UrlMap {
        name: name.to_string(),
        default_backend: namer.backend(spec.default_backend),
        host_rules,
    }
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cloud::fake::FakeCloud;
    use crate::cloud::Address;

    const DEFAULT_PORT: i32 = 30000;

    fn pool() -> (Arc<FakeCloud>, L7Pool) {
        let cloud = Arc::new(FakeCloud::default());
        let pool = L7Pool::new(cloud.clone(), Namer::new("test"), DEFAULT_PORT);
        (cloud, pool)
    }

    fn tls_info(key: &str) -> L7RuntimeInfo {
        L7RuntimeInfo {
            key: key.to_string(),
            certs: vec![TlsCerts {
                key: "key".to_string(),
                cert: "cert".to_string(),
            }],
            static_address_name: None,
        }
    }

    #[test]
    fn test_first_sync_binds_one_address_to_both_rules() {
        let (cloud, pool) = pool();
        pool.sync(&[tls_info("default/web")]).unwrap();

        let l7 = pool.get("default/web").unwrap();
        assert!(!l7.address.is_empty());

        let rules = cloud.forwarding_rules_with_ip(&l7.address);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].ip_address, rules[1].ip_address);
        assert!(cloud.has_address("k8s-ip-default-web--test"));
    }

    #[test]
    fn test_sync_is_idempotent() {
        let (cloud, pool) = pool();
        let info = tls_info("default/web");

        pool.sync(&[info.clone()]).unwrap();
        let first = pool.get("default/web").unwrap();

        pool.sync(&[info]).unwrap();
        let second = pool.get("default/web").unwrap();

        assert_eq!(first.address, second.address);
        assert_eq!(cloud.num_forwarding_rules(), 2);
        assert_eq!(cloud.num_target_proxies(), 2);
        assert_eq!(cloud.num_url_maps(), 1);
    }

    #[test]
    fn test_static_address_migration_recreates_both_rules() {
        let (cloud, pool) = pool();
        let mut info = tls_info("default/web");

        pool.sync(&[info.clone()]).unwrap();
        let ephemeral = pool.get("default/web").unwrap().address;

        cloud
            .reserve_address(&Address {
                name: "testip".to_string(),
                address: "1.2.3.4".to_string(),
            })
            .unwrap();
        info.static_address_name = Some("testip".to_string());
        pool.sync(&[info]).unwrap();

        let rules = cloud.forwarding_rules_with_ip("1.2.3.4");
        assert_eq!(rules.len(), 2);
        assert!(cloud.forwarding_rules_with_ip(&ephemeral).is_empty());

        // the superseded ephemeral reservation is released, the user's
        // reservation is left alone
        assert!(!cloud.has_address("k8s-ip-default-web--test"));
        assert!(cloud.has_address("testip"));
    }

    #[test]
    fn test_missing_named_address_fails_sync() {
        let (_cloud, pool) = pool();
        let mut info = tls_info("default/web");
        info.static_address_name = Some("not-reserved".to_string());

        assert!(pool.sync(&[info]).is_err());
    }

    #[test]
    fn test_removing_tls_tears_down_https_half() {
        let (cloud, pool) = pool();
        let mut info = tls_info("default/web");
        pool.sync(&[info.clone()]).unwrap();
        assert_eq!(cloud.num_forwarding_rules(), 2);

        info.certs.clear();
        pool.sync(&[info]).unwrap();
        assert_eq!(cloud.num_forwarding_rules(), 1);
        assert_eq!(cloud.num_target_proxies(), 1);
        assert_eq!(cloud.num_ssl_certificates(), 0);
    }

    #[test]
    fn test_cert_rotation_reaches_the_proxy() {
        let (cloud, pool) = pool();
        let mut info = tls_info("default/web");
        pool.sync(&[info.clone()]).unwrap();

        let proxy_name = "k8s-tps-default-web--test";
        let old_certs = cloud.get_https_proxy(proxy_name).unwrap().cert_names;
        assert_eq!(old_certs.len(), 1);

        info.certs = vec![TlsCerts {
            key: "rotated-key".to_string(),
            cert: "rotated-cert".to_string(),
        }];
        pool.sync(&[info.clone()]).unwrap();

        let new_certs = cloud.get_https_proxy(proxy_name).unwrap().cert_names;
        assert_ne!(new_certs, old_certs);
        let live = cloud.get_ssl_certificate(&new_certs[0]).unwrap();
        assert_eq!(live.certs.cert, "rotated-cert");

        // the superseded cert resource is gone, and re-syncing the same
        // material changes nothing
        assert!(cloud.get_ssl_certificate(&old_certs[0]).is_err());
        pool.sync(&[info]).unwrap();
        assert_eq!(cloud.get_https_proxy(proxy_name).unwrap().cert_names, new_certs);
        assert_eq!(cloud.num_ssl_certificates(), 1);
    }

    #[test]
    fn test_delete_lb_cascades_and_releases_address() {
        let (cloud, pool) = pool();
        pool.sync(&[tls_info("default/web")]).unwrap();

        pool.delete_lb("default/web").unwrap();
        assert_eq!(cloud.num_forwarding_rules(), 0);
        assert_eq!(cloud.num_target_proxies(), 0);
        assert_eq!(cloud.num_url_maps(), 0);
        assert_eq!(cloud.num_ssl_certificates(), 0);
        assert!(!cloud.has_address("k8s-ip-default-web--test"));
        assert!(pool.get("default/web").is_none());

        // deleting again is a no-op
        pool.delete_lb("default/web").unwrap();
    }

    #[test]
    fn test_gc_only_touches_stale_keys() {
        let (cloud, pool) = pool();
        pool.sync(&[tls_info("default/a"), tls_info("default/b")])
            .unwrap();

        let live: HashSet<String> = ["default/b".to_string()].into_iter().collect();
        pool.gc(&live).unwrap();

        assert!(pool.get("default/a").is_none());
        assert!(pool.get("default/b").is_some());
        assert_eq!(cloud.num_url_maps(), 1);
    }
}
