//! TLS certificate loading for HTTPS target proxies.
//!
//! The reconciler only needs key/cert material for the secrets a routing
//! resource names; where it comes from is behind [TlsLoader] so tests can
//! swap in a canned loader.

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::{ObjectRef, Store};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TlsCerts {
    pub key: String,
    pub cert: String,
}

impl TlsCerts {
    /// A short content fingerprint. Provider certificate resources are named
    /// by this, so rotated material gets a new name and the proxy's attached
    /// cert list reveals whether rotation has been applied. Private keys are
    /// write-only on the provider side and can't be compared directly.
    pub(crate) fn fingerprint(&self) -> String {
        use std::hash::{Hash, Hasher};

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.key.hash(&mut hasher);
        self.cert.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TlsError {
    #[error("secret {namespace}/{name} has no {field}")]
    MissingField {
        namespace: String,
        name: String,
        field: &'static str,
    },

    #[error("secret {namespace}/{name} is not valid utf-8")]
    InvalidEncoding { namespace: String, name: String },
}

pub(crate) trait TlsLoader: Send + Sync {
    /// Load key/cert material for a named secret. `Ok(None)` means the secret
    /// doesn't exist yet - the proxy is created HTTP-only and picks up the
    /// cert on a later sync.
    fn load(&self, namespace: &str, name: &str) -> Result<Option<TlsCerts>, TlsError>;
}

/// Loads certs out of the cluster's Secret store.
pub(crate) struct SecretTlsLoader {
    secrets: Store<Secret>,
}

impl SecretTlsLoader {
    pub(crate) fn new(secrets: Store<Secret>) -> Self {
        Self { secrets }
    }
}

impl TlsLoader for SecretTlsLoader {
    fn load(&self, namespace: &str, name: &str) -> Result<Option<TlsCerts>, TlsError> {
        let Some(secret) = self.secrets.get(&ObjectRef::new(name).within(namespace)) else {
            return Ok(None);
        };

        let field = |field: &'static str| -> Result<String, TlsError> {
            let bytes = secret
                .data
                .as_ref()
                .and_then(|data| data.get(field))
                .ok_or_else(|| TlsError::MissingField {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    field,
                })?;
            String::from_utf8(bytes.0.clone()).map_err(|_| TlsError::InvalidEncoding {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        };

        Ok(Some(TlsCerts {
            key: field("tls.key")?,
            cert: field("tls.crt")?,
        }))
    }
}
