use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::tunnel::Tunnel;

const CACHE_VERSION: u32 = 1;
/// Affinity cache is bounded by total key+value bytes, not entry count, so a
/// workload with long hostnames doesn't silently retain far more or less
/// than this much state on restart.
const CACHE_BYTE_BUDGET: usize = 1024 * 1024;
/// Number of fresh URL candidates `register_repeat` tries before giving up.
const MAX_URL_COLLISION_RETRIES: u32 = 5;

/// Explicit, versioned on-disk format for the affinity cache. Never
/// bincode or any language-specific serialization: a format this small
/// and this load-bearing deserves a format that survives a rewrite.
#[derive(Serialize, Deserialize)]
struct CacheSnapshot {
    version: u32,
    entries: Vec<(String, String)>,
}

/// An LRU keyed by `client-id-<proto>:<id>` / `client-ip-<proto>:<ip>`,
/// bounded by cumulative key+value byte length rather than entry count.
struct AffinityCache {
    lru: LruCache<String, String>,
    bytes: usize,
}

impl AffinityCache {
    fn new() -> Self {
        AffinityCache {
            lru: LruCache::unbounded(),
            bytes: 0,
        }
    }

    fn entry_bytes(key: &str, value: &str) -> usize {
        key.len() + value.len()
    }

    fn put(&mut self, key: String, value: String) {
        let added = Self::entry_bytes(&key, &value);
        if let Some(old) = self.lru.put(key.clone(), value) {
            self.bytes = self.bytes.saturating_sub(Self::entry_bytes(&key, &old));
        }
        self.bytes += added;

        while self.bytes > CACHE_BYTE_BUDGET {
            let Some((k, v)) = self.lru.pop_lru() else {
                break;
            };
            self.bytes = self.bytes.saturating_sub(Self::entry_bytes(&k, &v));
        }
    }

    fn get(&mut self, key: &str) -> Option<String> {
        self.lru.get(key).cloned()
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.lru.iter()
    }
}

/// Maps live public URLs to their owning `Tunnel`, plus an affinity cache of
/// `client-id-<proto>:<id>` / `client-ip-<proto>:<ip>` keys to the last URL
/// issued to that client, so that reconnects get the same address back.
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    affinity: Mutex<AffinityCache>,
    cache_file: Option<PathBuf>,
}

impl TunnelRegistry {
    pub fn new(cache_file: Option<PathBuf>) -> Self {
        let registry = TunnelRegistry {
            tunnels: RwLock::new(HashMap::new()),
            affinity: Mutex::new(AffinityCache::new()),
            cache_file,
        };
        if let Some(path) = &registry.cache_file {
            if let Err(e) = registry.load(path) {
                tracing::warn!(error = %e, path = %path.display(), "failed to load affinity cache");
            }
        }
        registry
    }

    pub fn register(&self, url: &str, tunnel: Arc<Tunnel>) -> Result<(), ServerError> {
        let mut map = self.tunnels.write();
        if map.contains_key(url) {
            return Err(ServerError::UrlTaken(url.to_string()));
        }
        map.insert(url.to_string(), tunnel);
        Ok(())
    }

    pub fn register_and_cache(
        &self,
        url: &str,
        tunnel: Arc<Tunnel>,
        cache_keys: &[String],
    ) -> Result<(), ServerError> {
        self.register(url, tunnel)?;
        let mut cache = self.affinity.lock();
        for key in cache_keys {
            cache.put(key.clone(), url.to_string());
        }
        Ok(())
    }

    /// Tries `cached_url` first, then up to `MAX_URL_COLLISION_RETRIES` fresh
    /// candidates from `url_fn`. Each attempt registers through the atomic
    /// `register` insert itself rather than a separate existence check, so a
    /// concurrent registration of the same URL between check and insert is
    /// retried with the next candidate instead of propagating as an error.
    /// `make_tunnel` builds the `Tunnel` for a given candidate URL, since the
    /// URL is baked into the tunnel at construction time.
    pub fn register_repeat(
        &self,
        cached_url: Option<&str>,
        mut url_fn: impl FnMut() -> String,
        mut make_tunnel: impl FnMut(&str) -> Arc<Tunnel>,
        cache_keys: &[String],
    ) -> Result<Arc<Tunnel>, ServerError> {
        if let Some(cached) = cached_url {
            let tunnel = make_tunnel(cached);
            match self.register_and_cache(cached, Arc::clone(&tunnel), cache_keys) {
                Ok(()) => return Ok(tunnel),
                Err(ServerError::UrlTaken(_)) => {}
                Err(e) => return Err(e),
            }
        }

        for _ in 0..MAX_URL_COLLISION_RETRIES {
            let candidate = url_fn();
            let tunnel = make_tunnel(&candidate);
            match self.register_and_cache(&candidate, Arc::clone(&tunnel), cache_keys) {
                Ok(()) => return Ok(tunnel),
                Err(ServerError::UrlTaken(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(ServerError::RegistrationExhausted(MAX_URL_COLLISION_RETRIES))
    }

    pub fn get_cached(&self, key: &str) -> Option<String> {
        self.affinity.lock().get(key)
    }

    pub fn get(&self, url: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().get(url).cloned()
    }

    pub fn del(&self, url: &str) {
        self.tunnels.write().remove(url);
    }

    pub fn len(&self) -> usize {
        self.tunnels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(&self, path: &Path) -> Result<(), ServerError> {
        let data = std::fs::read(path)?;
        let snapshot: CacheSnapshot = serde_json::from_slice(&data).map_err(|e| {
            ServerError::Cache(format!("parse error: {e}"))
        })?;
        if snapshot.version != CACHE_VERSION {
            tracing::warn!(
                found = snapshot.version,
                expected = CACHE_VERSION,
                "affinity cache version mismatch, ignoring snapshot"
            );
            return Ok(());
        }
        let mut cache = self.affinity.lock();
        for (k, v) in snapshot.entries {
            cache.put(k, v);
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), ServerError> {
        let Some(path) = &self.cache_file else {
            return Ok(());
        };
        let entries: Vec<(String, String)> = {
            let cache = self.affinity.lock();
            cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let snapshot = CacheSnapshot {
            version: CACHE_VERSION,
            entries,
        };
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| ServerError::Cache(format!("encode error: {e}")))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Spawns the periodic snapshot-to-disk task; returns its handle so
    /// callers can abort it on shutdown.
    pub fn spawn_periodic_save(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        self.cache_file.as_ref()?;
        let registry = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                interval.tick().await;
                if let Err(e) = registry.save() {
                    tracing::warn!(error = %e, "failed to save affinity cache");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::test_support::{dummy_tunnel, dummy_tunnel_with};

    #[test]
    fn register_rejects_duplicate_url() {
        let reg = TunnelRegistry::new(None);
        reg.register("http://a.example.com", dummy_tunnel()).unwrap();
        let err = reg
            .register("http://a.example.com", dummy_tunnel())
            .unwrap_err();
        assert!(matches!(err, ServerError::UrlTaken(_)));
    }

    #[test]
    fn register_and_cache_writes_both_affinity_keys() {
        let reg = TunnelRegistry::new(None);
        reg.register_and_cache(
            "tcp://host:1000",
            dummy_tunnel(),
            &["client-id-tcp:abc".to_string(), "client-ip-tcp:1.2.3.4".to_string()],
        )
        .unwrap();

        assert_eq!(
            reg.get_cached("client-id-tcp:abc"),
            Some("tcp://host:1000".to_string())
        );
        assert_eq!(
            reg.get_cached("client-ip-tcp:1.2.3.4"),
            Some("tcp://host:1000".to_string())
        );
    }

    #[test]
    fn del_removes_entry_and_get_reflects_it() {
        let reg = TunnelRegistry::new(None);
        reg.register("http://a.example.com", dummy_tunnel()).unwrap();
        assert!(reg.get("http://a.example.com").is_some());
        reg.del("http://a.example.com");
        assert!(reg.get("http://a.example.com").is_none());
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("tunnel-cache-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cache.json");

        let reg = TunnelRegistry::new(Some(path.clone()));
        reg.register_and_cache(
            "http://a.example.com",
            dummy_tunnel(),
            &["client-id-http:abc".to_string()],
        )
        .unwrap();
        reg.save().unwrap();

        let reg2 = TunnelRegistry::new(Some(path.clone()));
        assert_eq!(
            reg2.get_cached("client-id-http:abc"),
            Some("http://a.example.com".to_string())
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn register_repeat_uses_cached_url_first() {
        let reg = TunnelRegistry::new(None);
        let tunnel = reg
            .register_repeat(
                Some("http://cached.example.com"),
                || panic!("url_fn should not be called when the cached url is free"),
                |url| dummy_tunnel_with(url, "c1"),
                &[],
            )
            .unwrap();
        assert_eq!(tunnel.url, "http://cached.example.com");
    }

    #[test]
    fn register_repeat_falls_back_and_exhausts_after_five_collisions() {
        let reg = TunnelRegistry::new(None);
        reg.register("http://taken.example.com", dummy_tunnel()).unwrap();

        let err = reg
            .register_repeat(
                None,
                || "http://taken.example.com".to_string(),
                |url| dummy_tunnel_with(url, "c2"),
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, ServerError::RegistrationExhausted(5)));
    }

    #[test]
    fn affinity_cache_evicts_least_recently_used_past_byte_budget() {
        let reg = TunnelRegistry::new(None);
        let big_value = "x".repeat(CACHE_BYTE_BUDGET);
        reg.register_and_cache(
            "http://a.example.com",
            dummy_tunnel(),
            &["first-key".to_string()],
        )
        .unwrap();
        {
            let mut cache = reg.affinity.lock();
            cache.put("second-key".to_string(), big_value);
        }
        assert_eq!(reg.get_cached("first-key"), None);
    }
}
