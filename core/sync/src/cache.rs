//! Key-value cache with TTL expiry and a size budget, backed by durable
//! storage.
//!
//! Memory is authoritative while the process runs; durable storage is
//! written through on a best-effort basis and read on a memory miss.
//! Storage failures are logged and never surface to callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use offsync_common::ClockSource;
use offsync_storage::{load_json, save_json, KeyValueStore};

use crate::config::CacheConfig;

const DURABLE_PREFIX: &str = "cache:";

/// A cached value with its freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    /// Insertion time, milliseconds since Unix epoch.
    pub timestamp: u64,
    /// Time-to-live in milliseconds.
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
    /// Keys whose invalidation also invalidates this entry.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Estimated footprint in bytes.
    #[serde(default)]
    pub size: u64,
}

impl CacheEntry {
    /// An entry is expired once `now >= timestamp + ttl`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.timestamp.saturating_add(self.ttl)
    }
}

/// Optional metadata for [`CacheStore::put`].
#[derive(Debug, Clone, Default)]
pub struct CacheMeta {
    pub ttl: Option<Duration>,
    pub etag: Option<String>,
    pub last_modified: Option<u64>,
    pub dependencies: Vec<String>,
}

impl CacheMeta {
    /// Metadata with only a TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Insertion sequence, tie-break for equal timestamps.
    order: HashMap<String, u64>,
    next_seq: u64,
    bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn insert(&mut self, entry: CacheEntry) {
        self.remove(&entry.key);
        self.bytes += entry.size;
        self.order.insert(entry.key.clone(), self.next_seq);
        self.next_seq += 1;
        self.entries.insert(entry.key.clone(), entry);
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.order.remove(key);
        let entry = self.entries.remove(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn oldest_key(&self) -> Option<String> {
        self.entries
            .values()
            .min_by_key(|e| (e.timestamp, self.order.get(&e.key).copied().unwrap_or(0)))
            .map(|e| e.key.clone())
    }
}

/// TTL- and size-bounded cache.
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn ClockSource>,
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl CacheStore {
    /// Create an empty cache. Call [`hydrate`](Self::hydrate) to load
    /// durable entries.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn ClockSource>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Load durable entries into memory, dropping expired or corrupt ones.
    ///
    /// Returns the number of entries loaded.
    pub async fn hydrate(&self) -> usize {
        let mut inner = self.inner.lock().await;

        let keys = match self.store.list_keys(DURABLE_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cache hydration skipped, storage unavailable: {}", e);
                return 0;
            }
        };

        let now = self.clock.now_ms();
        let mut loaded = Vec::new();
        let mut stale = Vec::new();

        for durable_key in keys {
            match load_json::<CacheEntry, _>(self.store.as_ref(), &durable_key).await {
                Ok(Some(entry)) if !entry.is_expired(now) => loaded.push(entry),
                Ok(Some(_)) => stale.push(durable_key),
                Ok(None) => {}
                Err(e) => {
                    warn!("Dropping unreadable cache entry {}: {}", durable_key, e);
                    stale.push(durable_key);
                }
            }
        }

        for durable_key in &stale {
            self.delete_durable_key(durable_key).await;
        }

        // Oldest first so insertion order matches original timestamps
        loaded.sort_by_key(|e| e.timestamp);
        let count = loaded.len();

        for entry in loaded {
            inner.insert(entry);
        }
        let evicted = self.evict_over_budget(&mut inner, None);
        for key in &evicted {
            self.delete_durable(key).await;
        }

        info!(
            "Cache hydrated: {} entries ({} stale dropped)",
            count - evicted.len(),
            stale.len()
        );
        count - evicted.len()
    }

    /// Store a value, then evict the oldest entries until the estimated
    /// total size is within budget.
    ///
    /// A value larger than the whole budget is not cached.
    pub async fn put(&self, key: &str, data: Value, meta: CacheMeta) {
        let ttl = meta.ttl.unwrap_or_else(|| self.config.default_ttl());
        let size = estimate_size(key, &data);

        if size > self.config.max_size_bytes {
            warn!(
                "Cache value for {} ({} bytes) exceeds budget of {} bytes, not cached",
                key, size, self.config.max_size_bytes
            );
            self.remove(key).await;
            return;
        }

        let entry = CacheEntry {
            key: key.to_string(),
            data,
            timestamp: self.clock.now_ms(),
            ttl: ttl.as_millis() as u64,
            etag: meta.etag,
            last_modified: meta.last_modified,
            dependencies: meta.dependencies,
            size,
        };

        // Durable writes stay under the lock so memory and storage agree
        let mut inner = self.inner.lock().await;
        inner.insert(entry.clone());
        let evicted = self.evict_over_budget(&mut inner, Some(key));

        if let Err(e) = save_json(self.store.as_ref(), &durable_key(key), &entry).await {
            warn!("Cache write-through failed for {}, memory only: {}", key, e);
        }
        for key in &evicted {
            self.delete_durable(key).await;
        }
    }

    /// Read a value. Expired entries are evicted and read as `None`.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_entry(key).await.map(|e| e.data)
    }

    /// Read a full entry including etag and last-modified.
    ///
    /// Falls back to durable storage on a memory miss and re-populates
    /// memory on a durable hit.
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        let cached = inner.entries.get(key).cloned();
        match cached {
            Some(entry) if !entry.is_expired(now) => {
                inner.hits += 1;
                return Some(entry);
            }
            Some(_) => {
                inner.remove(key);
                inner.misses += 1;
                debug!("Cache entry {} expired", key);
                self.delete_durable(key).await;
                return None;
            }
            None => {}
        }

        let durable = match load_json::<CacheEntry, _>(self.store.as_ref(), &durable_key(key)).await
        {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cache read-through failed for {}: {}", key, e);
                None
            }
        };

        match durable {
            Some(entry) if !entry.is_expired(now) => {
                inner.hits += 1;
                inner.insert(entry.clone());
                let evicted = self.evict_over_budget(&mut inner, Some(key));
                for key in &evicted {
                    self.delete_durable(key).await;
                }
                Some(entry)
            }
            Some(_) => {
                inner.misses += 1;
                self.delete_durable(key).await;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Remove one entry.
    pub async fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.remove(key).is_some();
        self.delete_durable(key).await;
        removed
    }

    /// Remove entries whose key contains `pattern`, or every entry when
    /// `pattern` is `None`. Entries depending on a removed key are removed
    /// too, transitively.
    ///
    /// Returns the number of entries removed from memory.
    pub async fn invalidate(&self, pattern: Option<&str>) -> usize {
        let mut inner = self.inner.lock().await;

        let mut doomed: Vec<String> = match pattern {
            Some(pattern) => inner
                .entries
                .keys()
                .filter(|k| k.contains(pattern))
                .cloned()
                .collect(),
            None => inner.entries.keys().cloned().collect(),
        };
        let mut removed: HashSet<String> = HashSet::new();

        while let Some(key) = doomed.pop() {
            if !removed.insert(key.clone()) {
                continue;
            }
            inner.remove(&key);

            doomed.extend(
                inner
                    .entries
                    .values()
                    .filter(|e| e.dependencies.iter().any(|d| *d == key))
                    .map(|e| e.key.clone()),
            );
        }

        // Durable-only entries (not hydrated) must go too
        let mut durable_keys = removed.clone();
        match self.store.list_keys(DURABLE_PREFIX).await {
            Ok(keys) => durable_keys.extend(
                keys.iter()
                    .filter_map(|k| k.strip_prefix(DURABLE_PREFIX))
                    .filter(|k| pattern.map_or(true, |p| k.contains(p)))
                    .map(str::to_string),
            ),
            Err(e) => warn!("Cache invalidation could not list durable keys: {}", e),
        }
        for key in &durable_keys {
            self.delete_durable(key).await;
        }
        drop(inner);

        if !removed.is_empty() {
            debug!("Invalidated {} cache entries ({:?})", removed.len(), pattern);
        }
        removed.len()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
            self.delete_durable(key).await;
        }
        drop(inner);

        if !expired.is_empty() {
            debug!("Cache sweep removed {} expired entries", expired.len());
        }
        expired.len()
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `shutdown`
    /// flips to `true` or its sender is dropped.
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Cache sweeper stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Current counters.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Keys currently held in memory, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().await.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn evict_over_budget(&self, inner: &mut CacheInner, keep: Option<&str>) -> Vec<String> {
        let mut evicted = Vec::new();

        while inner.bytes > self.config.max_size_bytes {
            let Some(oldest) = inner.oldest_key() else {
                break;
            };
            if Some(oldest.as_str()) == keep && inner.entries.len() == 1 {
                break;
            }
            let victim = if Some(oldest.as_str()) == keep {
                // The entry just written is never its own victim
                inner
                    .entries
                    .values()
                    .filter(|e| e.key != oldest)
                    .min_by_key(|e| (e.timestamp, inner.order.get(&e.key).copied().unwrap_or(0)))
                    .map(|e| e.key.clone())
            } else {
                Some(oldest)
            };
            let Some(victim) = victim else {
                break;
            };

            inner.remove(&victim);
            inner.evictions += 1;
            debug!("Evicted cache entry {}", victim);
            evicted.push(victim);
        }

        evicted
    }

    async fn delete_durable(&self, key: &str) {
        self.delete_durable_key(&durable_key(key)).await;
    }

    async fn delete_durable_key(&self, durable_key: &str) {
        if let Err(e) = self.store.delete(durable_key).await {
            warn!("Failed to delete durable cache key {}: {}", durable_key, e);
        }
    }
}

fn durable_key(key: &str) -> String {
    format!("{}{}", DURABLE_PREFIX, key)
}

fn estimate_size(key: &str, data: &Value) -> u64 {
    let data_len = serde_json::to_string(data).map(|s| s.len()).unwrap_or(0);
    (key.len() + data_len) as u64
}
