//! Known-hosts table: persisted bindings from bare names to public keys.
//!
//! Only this module mutates the table; everything else reads through the
//! accessors. The default save path refuses to bind a key that is already
//! bound to a different name (or rebind a name to a different key) — passing
//! `update = true` is the explicit consent that creates an alias or rebinds.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::storage::{KvStore, StorageError};

/// Store key the serialized table lives under.
pub const KV_KNOWN_HOSTS: &str = "knownHosts";

/// Errors from known-hosts mutation.
#[derive(Debug)]
pub enum KeyStoreError {
    /// The key is already bound to a different name.
    AlreadyBound {
        /// Name the caller tried to bind.
        name: String,
        /// Name the key is currently bound to.
        existing: String,
    },
    /// The name is already bound to a different key.
    NameTaken {
        /// Name the caller tried to bind.
        name: String,
    },
    /// Persistence failed; the in-memory table was not changed.
    Storage(StorageError),
}

impl std::fmt::Display for KeyStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyBound { name, existing } => {
                write!(f, "key already bound to {existing:?}, refusing {name:?}")
            }
            Self::NameTaken { name } => {
                write!(f, "{name:?} already bound to a different key")
            }
            Self::Storage(e) => write!(f, "known-hosts storage error: {e}"),
        }
    }
}

impl std::error::Error for KeyStoreError {}

/// The persisted name → public-key table.
pub struct KnownHosts {
    kv: Arc<dyn KvStore>,
    entries: Mutex<BTreeMap<String, String>>,
}

impl std::fmt::Debug for KnownHosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnownHosts")
            .field(
                "entries",
                &self.entries.lock().expect("hosts lock poisoned").len(),
            )
            .finish_non_exhaustive()
    }
}

impl KnownHosts {
    /// Load the table from the store; a missing or corrupt document starts
    /// empty (corruption is logged, not fatal).
    pub fn load(kv: Arc<dyn KvStore>) -> Self {
        let entries = match kv.get(KV_KNOWN_HOSTS) {
            Some(json) => match serde_json::from_str(&json) {
                Ok(map) => map,
                Err(e) => {
                    log::warn!("[KnownHosts] stored table unreadable ({e}); starting empty");
                    BTreeMap::new()
                }
            },
            None => BTreeMap::new(),
        };
        Self {
            kv,
            entries: Mutex::new(entries),
        }
    }

    /// Bind `name` to `public_key`.
    ///
    /// Re-saving an identical binding is a no-op. Without `update`, a key
    /// bound to another name fails with `AlreadyBound` and a name bound to
    /// another key fails with `NameTaken`.
    ///
    /// # Errors
    ///
    /// `AlreadyBound` / `NameTaken` per above, `Storage` when persisting
    /// fails (the table is left unchanged).
    pub fn save_public_key(
        &self,
        name: &str,
        public_key: &str,
        update: bool,
    ) -> Result<(), KeyStoreError> {
        let mut entries = self.entries.lock().expect("hosts lock poisoned");

        if entries.get(name).map(String::as_str) == Some(public_key) {
            return Ok(());
        }

        if !update {
            if entries.contains_key(name) {
                return Err(KeyStoreError::NameTaken {
                    name: name.to_string(),
                });
            }
            if let Some((existing, _)) = entries.iter().find(|(_, key)| key.as_str() == public_key)
            {
                return Err(KeyStoreError::AlreadyBound {
                    name: name.to_string(),
                    existing: existing.clone(),
                });
            }
        }

        let mut next = entries.clone();
        next.insert(name.to_string(), public_key.to_string());
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    /// Public key bound to `name`, if any.
    pub fn get_public_key(&self, name: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("hosts lock poisoned")
            .get(name)
            .cloned()
    }

    /// Drop the binding for `name`.
    ///
    /// # Errors
    ///
    /// `Storage` when persisting fails.
    pub fn remove_public_key(&self, name: &str) -> Result<(), KeyStoreError> {
        let mut entries = self.entries.lock().expect("hosts lock poisoned");
        if !entries.contains_key(name) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(name);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    /// Reverse lookup: every name bound to `public_key`, in name order.
    pub fn peer_names_for_key(&self, public_key: &str) -> Vec<String> {
        self.entries
            .lock()
            .expect("hosts lock poisoned")
            .iter()
            .filter(|(_, key)| key.as_str() == public_key)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether any name is bound to `public_key`.
    pub fn contains_key(&self, public_key: &str) -> bool {
        self.entries
            .lock()
            .expect("hosts lock poisoned")
            .values()
            .any(|key| key == public_key)
    }

    /// All known names.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("hosts lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), KeyStoreError> {
        let json = serde_json::to_string(entries)
            .map_err(|e| KeyStoreError::Storage(StorageError::Serialize(e.to_string())))?;
        self.kv
            .set(KV_KNOWN_HOSTS, &json)
            .map_err(KeyStoreError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;

    fn hosts() -> KnownHosts {
        KnownHosts::load(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn test_save_and_get() {
        let hosts = hosts();
        hosts.save_public_key("alice", "K1", false).expect("save");
        assert_eq!(hosts.get_public_key("alice").as_deref(), Some("K1"));
        assert!(hosts.get_public_key("bob").is_none());
    }

    #[test]
    fn test_identical_resave_is_noop() {
        let hosts = hosts();
        hosts.save_public_key("alice", "K1", false).expect("save");
        hosts.save_public_key("alice", "K1", false).expect("resave");
    }

    #[test]
    fn test_key_bound_elsewhere_fails_without_update() {
        let hosts = hosts();
        hosts.save_public_key("alice", "K1", false).expect("save");

        match hosts.save_public_key("allie", "K1", false) {
            Err(KeyStoreError::AlreadyBound { existing, .. }) => assert_eq!(existing, "alice"),
            other => panic!("expected AlreadyBound, got {other:?}"),
        }

        // Explicit consent creates the alias
        hosts.save_public_key("allie", "K1", true).expect("alias");
        let mut names = hosts.peer_names_for_key("K1");
        names.sort();
        assert_eq!(names, vec!["alice".to_string(), "allie".to_string()]);
    }

    #[test]
    fn test_name_rebind_fails_without_update() {
        let hosts = hosts();
        hosts.save_public_key("alice", "K1", false).expect("save");

        assert!(matches!(
            hosts.save_public_key("alice", "K2", false),
            Err(KeyStoreError::NameTaken { .. })
        ));

        hosts.save_public_key("alice", "K2", true).expect("rebind");
        assert_eq!(hosts.get_public_key("alice").as_deref(), Some("K2"));
        assert!(!hosts.contains_key("K1"));
    }

    #[test]
    fn test_remove() {
        let hosts = hosts();
        hosts.save_public_key("alice", "K1", false).expect("save");
        hosts.remove_public_key("alice").expect("remove");
        assert!(hosts.get_public_key("alice").is_none());
        hosts.remove_public_key("alice").expect("remove absent");
    }

    #[test]
    fn test_persists_across_reload() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        {
            let hosts = KnownHosts::load(Arc::clone(&kv));
            hosts.save_public_key("alice", "K1", false).expect("save");
        }
        let hosts = KnownHosts::load(kv);
        assert_eq!(hosts.get_public_key("alice").as_deref(), Some("K1"));
    }
}
