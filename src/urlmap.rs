//! The desired-state builder: turns declared host/path rules into the
//! resolved URL map handed to the cluster resource manager.

use std::collections::{BTreeMap, BTreeSet};

/// The host GCE-style providers route to when a rule declares no host.
pub(crate) const DEFAULT_HOST: &str = "*";

/// The catch-all path used when a rule declares no path.
pub(crate) const DEFAULT_PATH: &str = "/*";

/// host -> (path -> service name). The declared-state shape before any port
/// resolution happens. Mostly useful for building test fixtures.
pub(crate) type PrimitivePathMap = BTreeMap<String, BTreeMap<String, String>>;

/// A single resolved routing rule: requests matching `path` go to the backend
/// service derived from `node_port`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PathRule {
    pub path: String,
    pub node_port: i32,
}

/// A resolved URL map for one routing resource.
///
/// Hosts are kept sorted because host ordering is irrelevant to routing, but
/// path order within a host is the declared order: the provider applies path
/// rules first-match-wins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct UrlMapSpec {
    pub default_backend: i32,
    pub host_rules: BTreeMap<String, Vec<PathRule>>,
}

impl UrlMapSpec {
    pub(crate) fn new(default_backend: i32) -> Self {
        Self {
            default_backend,
            host_rules: BTreeMap::new(),
        }
    }

    /// Replace the path rules for a host. An empty host normalizes to
    /// [DEFAULT_HOST].
    pub(crate) fn put_path_rules_for_host(&mut self, host: &str, rules: Vec<PathRule>) {
        let host = normalize_host(host);
        self.host_rules.insert(host.to_string(), rules);
    }

    /// Every node port this map routes to, including the default backend.
    pub(crate) fn node_ports(&self) -> BTreeSet<i32> {
        let mut ports: BTreeSet<i32> = self
            .host_rules
            .values()
            .flatten()
            .map(|rule| rule.node_port)
            .collect();
        ports.insert(self.default_backend);
        ports
    }
}

/// Build a [UrlMapSpec] from declared rules with already-resolved backends.
///
/// A rule whose backend did not resolve (the referenced service doesn't exist
/// yet) is dropped, but its host entry is kept: the routing resource is valid
/// but incomplete and fills in on a later sync.
pub(crate) fn build(
    default_backend: i32,
    hosts: &[(String, Vec<(String, Option<i32>)>)],
) -> UrlMapSpec {
    let mut spec = UrlMapSpec::new(default_backend);

    for (host, paths) in hosts {
        let rules = paths
            .iter()
            .filter_map(|(path, port)| {
                port.map(|node_port| PathRule {
                    path: normalize_path(path).to_string(),
                    node_port,
                })
            })
            .collect();
        spec.put_path_rules_for_host(host, rules);
    }

    spec
}

fn normalize_host(host: &str) -> &str {
    if host.is_empty() {
        DEFAULT_HOST
    } else {
        host
    }
}

fn normalize_path(path: &str) -> &str {
    if path.is_empty() {
        DEFAULT_PATH
    } else {
        path
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn resolved(path: &str, port: i32) -> (String, Option<i32>) {
        (path.to_string(), Some(port))
    }

    #[test]
    fn test_build_preserves_path_order() {
        let spec = build(
            30000,
            &[(
                "foo.example.com".to_string(),
                vec![
                    resolved("/zzz", 30001),
                    resolved("/aaa", 30002),
                    resolved("/mmm", 30003),
                ],
            )],
        );

        let paths: Vec<&str> = spec.host_rules["foo.example.com"]
            .iter()
            .map(|r| r.path.as_str())
            .collect();
        assert_eq!(paths, vec!["/zzz", "/aaa", "/mmm"]);
    }

    #[test]
    fn test_build_applies_default_sentinels() {
        let spec = build(30000, &[("".to_string(), vec![resolved("", 30001)])]);

        let rules = &spec.host_rules[DEFAULT_HOST];
        assert_eq!(
            rules,
            &vec![PathRule {
                path: DEFAULT_PATH.to_string(),
                node_port: 30001
            }]
        );
    }

    #[test]
    fn test_build_keeps_host_with_unresolved_backend() {
        let spec = build(
            30000,
            &[(
                "foo.example.com".to_string(),
                vec![("/foo1".to_string(), None)],
            )],
        );

        assert!(spec.host_rules["foo.example.com"].is_empty());
    }

    #[test]
    fn test_node_ports_include_default_backend() {
        let spec = build(
            30000,
            &[(
                "foo.example.com".to_string(),
                vec![resolved("/foo1", 30001), resolved("/foo2", 30002)],
            )],
        );

        let ports: Vec<i32> = spec.node_ports().into_iter().collect();
        assert_eq!(ports, vec![30000, 30001, 30002]);
    }
}
