//! Tenant Credentials
//!
//! A credential binds a tenant key to the long-term secret its daily
//! encryption keys are derived from. The active set is published as an
//! immutable [`CredentialSet`] behind a shared pointer: readers clone the
//! current `Arc` and keep using it for as long as they like, while the sync
//! client builds a whole new set and swaps it in. Nobody ever sees a table
//! that is half-way through an update.
//!
//! Static credentials from the config file are always part of the snapshot;
//! synced credentials are layered on top and win on tenant-key collisions.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::metrics;

/// A tenant's identity plus its long-term secret
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Human readable name
    #[serde(default)]
    pub name: String,

    /// Tenant key, sent upstream as the API key header
    #[serde(alias = "app_key")]
    pub tenant_key: String,

    /// Base64 encoded long-term secret (HKDF input keying material)
    #[serde(alias = "master_secret")]
    pub secret: String,
}

impl Credential {
    pub fn new(
        name: impl Into<String>,
        tenant_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            tenant_key: tenant_key.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("tenant_key", &self.tenant_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Immutable lookup table of credentials keyed by tenant key
#[derive(Debug, Default)]
pub struct CredentialSet {
    by_key: HashMap<String, Arc<Credential>>,
}

impl CredentialSet {
    /// Build a set; later entries replace earlier ones with the same key
    pub fn from_credentials<I>(credentials: I) -> Self
    where
        I: IntoIterator<Item = Credential>,
    {
        let by_key = credentials
            .into_iter()
            .map(|c| (c.tenant_key.clone(), Arc::new(c)))
            .collect();
        Self { by_key }
    }

    pub fn get(&self, tenant_key: &str) -> Option<Arc<Credential>> {
        self.by_key.get(tenant_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn tenant_keys(&self) -> impl Iterator<Item = &str> {
        self.by_key.keys().map(String::as_str)
    }
}

/// Shared handle to the active credential snapshot
///
/// Cloning the store is cheap and every clone observes the same snapshot.
#[derive(Clone)]
pub struct CredentialStore {
    static_credentials: Arc<Vec<Credential>>,
    current: Arc<RwLock<Arc<CredentialSet>>>,
}

impl CredentialStore {
    /// Create a store seeded with the static (config file) credentials
    pub fn new(static_credentials: Vec<Credential>) -> Self {
        let snapshot = CredentialSet::from_credentials(static_credentials.iter().cloned());
        metrics::CREDENTIALS_ACTIVE.set(snapshot.len() as i64);
        Self {
            static_credentials: Arc::new(static_credentials),
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// The current snapshot. The lock is held only long enough to clone the `Arc`.
    pub fn snapshot(&self) -> Arc<CredentialSet> {
        Arc::clone(&self.current.read())
    }

    pub fn lookup(&self, tenant_key: &str) -> Option<Arc<Credential>> {
        self.snapshot().get(tenant_key)
    }

    /// Replace the synced credentials wholesale
    ///
    /// The new snapshot is built before the swap, so the write lock only
    /// covers a pointer assignment.
    pub fn replace(&self, synced: Vec<Credential>) {
        let merged = self.static_credentials.iter().cloned().chain(synced);
        let next = Arc::new(CredentialSet::from_credentials(merged));
        let count = next.len();

        *self.current.write() = next;

        metrics::CREDENTIALS_ACTIVE.set(count as i64);
        tracing::debug!(credentials = count, "Credential snapshot replaced");
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(key: &str, secret: &str) -> Credential {
        Credential::new(format!("{key}-name"), key, secret)
    }

    #[test]
    fn test_lookup_static_credentials() {
        let store = CredentialStore::new(vec![cred("k1", "c2VjcmV0")]);

        let found = store.lookup("k1").unwrap();
        assert_eq!(found.tenant_key, "k1");
        assert!(store.lookup("missing").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replace_layers_synced_over_static() {
        let store = CredentialStore::new(vec![cred("k1", "c3RhdGlj"), cred("k2", "c3RhdGlj")]);

        store.replace(vec![cred("k1", "c3luY2Vk"), cred("k3", "c3luY2Vk")]);

        assert_eq!(store.lookup("k1").unwrap().secret, "c3luY2Vk");
        assert_eq!(store.lookup("k2").unwrap().secret, "c3RhdGlj");
        assert!(store.lookup("k3").is_some());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_replace_drops_previously_synced_entries() {
        let store = CredentialStore::new(vec![]);

        store.replace(vec![cred("a", "eA=="), cred("b", "eA==")]);
        assert_eq!(store.len(), 2);

        store.replace(vec![cred("b", "eA==")]);
        assert!(store.lookup("a").is_none());
        assert!(store.lookup("b").is_some());
    }

    #[test]
    fn test_held_snapshot_is_unaffected_by_swap() {
        let store = CredentialStore::new(vec![cred("k1", "b2xk")]);
        let held = store.snapshot();

        store.replace(vec![cred("k1", "bmV3"), cred("k9", "bmV3")]);

        assert_eq!(held.get("k1").unwrap().secret, "b2xk");
        assert!(held.get("k9").is_none());
        assert_eq!(store.lookup("k1").unwrap().secret, "bmV3");
    }

    #[test]
    fn test_clones_share_snapshot() {
        let store = CredentialStore::new(vec![]);
        let other = store.clone();

        other.replace(vec![cred("shared", "eA==")]);
        assert!(store.lookup("shared").is_some());
    }

    #[test]
    fn test_concurrent_readers_during_swaps() {
        let store = CredentialStore::new(vec![cred("base", "eA==")]);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        let snapshot = store.snapshot();
                        // Every snapshot is complete: static entry plus one synced entry or none
                        assert!(snapshot.get("base").is_some());
                        assert!(snapshot.len() == 1 || snapshot.len() == 2);
                    }
                })
            })
            .collect();

        for i in 0..200 {
            store.replace(vec![cred(&format!("synced-{i}"), "eA==")]);
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", cred("k1", "dG9wLXNlY3JldA=="));
        assert!(rendered.contains("k1"));
        assert!(!rendered.contains("dG9wLXNlY3JldA=="));
    }

    #[test]
    fn test_deserialize_accepts_legacy_field_names() {
        let json = r#"{"name":"app","app_key":"k1","master_secret":"eA=="}"#;
        let c: Credential = serde_json::from_str(json).unwrap();
        assert_eq!(c.tenant_key, "k1");
        assert_eq!(c.secret, "eA==");
    }
}
