//! Multi-window presence: leased tab ids over the key/value store.
//!
//! Several windows of one profile share a display name; each claims the
//! smallest free integer id and appends it as a `(N)` suffix (window zero
//! stays bare). Liveness is a per-tab last-seen stamp refreshed on a short
//! poll; leases older than the timeout are pruned by whoever starts next.
//! When the store misbehaves the client degrades to "no suffix" — presence
//! is a convenience, never a hard dependency.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::TabConfig;
use crate::storage::KvStore;

/// Store key holding the live id list (JSON array).
const KV_LIVE_TABS: &str = "tabs.live";
/// Store key prefix for per-tab last-seen stamps.
const KV_SEEN_PREFIX: &str = "tabs.seen.";

fn seen_key(id: u32) -> String {
    format!("{KV_SEEN_PREFIX}{id}")
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A claimed tab id, heartbeating while alive.
pub struct TabLease {
    kv: Arc<dyn KvStore>,
    id: u32,
    enabled: bool,
    heartbeat: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TabLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabLease")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl TabLease {
    /// Prune dead leases, claim the smallest free id and start the
    /// heartbeat. Never fails: storage trouble yields a disabled lease
    /// with id zero.
    pub fn acquire(kv: Arc<dyn KvStore>, config: &TabConfig) -> Self {
        if !config.enabled {
            return Self::disabled(kv);
        }

        let mut live = Self::read_live(&kv);

        // Prune leases whose last-seen is stale.
        let deadline = now_ms() - config.timeout_ms as i64;
        live.retain(|id| {
            let fresh = kv
                .get(&seen_key(*id))
                .and_then(|stamp| stamp.parse::<i64>().ok())
                .is_some_and(|stamp| stamp >= deadline);
            if !fresh {
                let _ = kv.remove(&seen_key(*id));
            }
            fresh
        });

        // Smallest free integer.
        let mut id = 0u32;
        while live.contains(&id) {
            id += 1;
        }
        live.push(id);
        live.sort_unstable();

        if Self::write_live(&kv, &live).is_err()
            || kv.set(&seen_key(id), &now_ms().to_string()).is_err()
        {
            log::warn!("[Presence] tab store unavailable; running without a suffix");
            return Self::disabled(kv);
        }

        let heartbeat = Self::spawn_heartbeat(Arc::clone(&kv), id, config.poll_interval_ms);
        log::debug!("[Presence] claimed tab id {id}");

        Self {
            kv,
            id,
            enabled: true,
            heartbeat: Some(heartbeat),
        }
    }

    fn disabled(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            id: 0,
            enabled: false,
            heartbeat: None,
        }
    }

    fn spawn_heartbeat(kv: Arc<dyn KvStore>, id: u32, poll_ms: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(poll_ms.max(100)));
            loop {
                ticker.tick().await;
                if kv.set(&seen_key(id), &now_ms().to_string()).is_err() {
                    log::warn!("[Presence] heartbeat write failed for tab {id}");
                }
            }
        })
    }

    fn read_live(kv: &Arc<dyn KvStore>) -> Vec<u32> {
        kv.get(KV_LIVE_TABS)
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default()
    }

    fn write_live(kv: &Arc<dyn KvStore>, live: &[u32]) -> Result<(), ()> {
        let json = serde_json::to_string(live).map_err(|_| ())?;
        kv.set(KV_LIVE_TABS, &json).map_err(|_| ())
    }

    /// The claimed id; feeds [`crate::identity::with_tab_suffix`].
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Give the id back and stop the heartbeat. Called on shutdown, before
    /// the `unload` signal goes out.
    pub fn release(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if !self.enabled {
            return;
        }
        self.enabled = false;

        let mut live = Self::read_live(&self.kv);
        live.retain(|id| *id != self.id);
        if Self::write_live(&self.kv, &live).is_err() {
            log::warn!("[Presence] could not release tab id {}", self.id);
        }
        let _ = self.kv.remove(&seen_key(self.id));
    }
}

impl Drop for TabLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;

    fn config() -> TabConfig {
        TabConfig {
            enabled: true,
            poll_interval_ms: 50,
            timeout_ms: 200,
        }
    }

    #[tokio::test]
    async fn test_first_tab_gets_zero() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let lease = TabLease::acquire(Arc::clone(&kv), &config());
        assert_eq!(lease.id(), 0);
    }

    #[tokio::test]
    async fn test_second_tab_gets_next_free() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let first = TabLease::acquire(Arc::clone(&kv), &config());
        let second = TabLease::acquire(Arc::clone(&kv), &config());
        assert_eq!(first.id(), 0);
        assert_eq!(second.id(), 1);
    }

    #[tokio::test]
    async fn test_release_frees_the_id() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let mut first = TabLease::acquire(Arc::clone(&kv), &config());
        let _second = TabLease::acquire(Arc::clone(&kv), &config());

        first.release();
        let third = TabLease::acquire(Arc::clone(&kv), &config());
        assert_eq!(third.id(), 0, "released id is reused");
    }

    #[tokio::test]
    async fn test_stale_lease_pruned() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        // Forge a dead tab: listed, but last seen long ago.
        kv.set(KV_LIVE_TABS, "[0]").expect("set");
        kv.set(&seen_key(0), &(now_ms() - 10_000).to_string())
            .expect("set");

        let lease = TabLease::acquire(Arc::clone(&kv), &config());
        assert_eq!(lease.id(), 0, "dead lease gets pruned and reissued");
    }

    #[tokio::test]
    async fn test_disabled_config_means_no_suffix() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let tab_config = TabConfig {
            enabled: false,
            ..config()
        };
        let lease = TabLease::acquire(Arc::clone(&kv), &tab_config);
        assert_eq!(lease.id(), 0);
        assert!(kv.get(KV_LIVE_TABS).is_none(), "store untouched");
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_stamp() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let _lease = TabLease::acquire(Arc::clone(&kv), &config());

        let first: i64 = kv.get(&seen_key(0)).expect("stamp").parse().expect("i64");
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        let second: i64 = kv.get(&seen_key(0)).expect("stamp").parse().expect("i64");
        assert!(second >= first);
    }
}
