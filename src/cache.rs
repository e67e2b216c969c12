//! Cache manager: the in-memory mirror of the durable store.
//!
//! Two-level mapping `bucket → (specific key → entry)` kept per tab, with
//! latest-wins writes guarded by server timestamps, lazy rehydration from
//! the durable store, and cross-tab mirroring over the broadcast bus. A
//! freshly booted tab can hydrate its memory from a peer's dump
//! (`cache-request` / `cache-response`) instead of walking the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::bus::{BroadcastBus, BusMessage};
use crate::observable::Observable;
use crate::store::{CacheEntry, PersistentStore, now_ms};

/// Upper bound on waiting for a peer's `cache-response`.
const SYNC_TIMEOUT: Duration = Duration::from_millis(200);

/// Memory dump exchanged between tabs during hydration.
pub type CacheDump = Vec<(String, HashMap<String, CacheEntry>)>;

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    peer_applied: AtomicU64,
}

/// Snapshot of cache activity.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub peer_applied: u64,
}

struct CacheInner {
    store: Arc<PersistentStore>,
    bus: BroadcastBus,
    buckets: DashMap<String, HashMap<String, CacheEntry>>,
    /// Set once peer hydration completed or timed out; `wait_for_sync` is
    /// one-shot per tab.
    hydrated: Observable<bool>,
    pending_request: parking_lot::Mutex<Option<String>>,
    counters: CacheCounters,
}

/// Unified cache operations for one tab. Cheap to clone.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
}

impl CacheManager {
    /// Build the manager and attach it to the bus. The durable store is
    /// preloaded lazily: bucket contents are read on first miss.
    pub fn new(store: Arc<PersistentStore>, bus: BroadcastBus) -> Self {
        let inner = Arc::new(CacheInner {
            store,
            bus: bus.clone(),
            buckets: DashMap::new(),
            hydrated: Observable::new(false),
            pending_request: parking_lot::Mutex::new(None),
            counters: CacheCounters::default(),
        });

        let weak = Arc::downgrade(&inner);
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                Self::handle_peer_message(&inner, envelope.msg);
            }
        });

        Self { inner }
    }

    fn handle_peer_message(inner: &Arc<CacheInner>, msg: BusMessage) {
        match msg {
            BusMessage::CacheSet {
                bucket,
                key,
                data,
                expiry,
                timestamp,
            } => {
                let entry = CacheEntry {
                    data,
                    expiry,
                    timestamp,
                };
                if Self::apply_to_memory(inner, &bucket, &key, entry) {
                    inner.counters.peer_applied.fetch_add(1, Ordering::Relaxed);
                }
            }
            BusMessage::CacheInvalidate { bucket } => {
                inner.buckets.remove(&bucket);
                inner.store.delete_bucket(&bucket);
            }
            BusMessage::CacheRequest { request_id } => {
                if !inner.buckets.is_empty() {
                    let dump = Self::dump_memory(inner);
                    inner.bus.send(BusMessage::CacheResponse { request_id, dump });
                }
            }
            BusMessage::CacheResponse { request_id, dump } => {
                let matches = inner
                    .pending_request
                    .lock()
                    .take_if(|pending| *pending == request_id)
                    .is_some();
                if matches {
                    Self::merge_dump(inner, dump);
                    inner.hydrated.set(true);
                }
            }
            _ => {}
        }
    }

    /// Latest-wins application to memory only. Returns whether the entry
    /// replaced (or created) the stored one.
    fn apply_to_memory(inner: &CacheInner, bucket: &str, key: &str, entry: CacheEntry) -> bool {
        let mut map = inner.buckets.entry(bucket.to_string()).or_default();
        let newer = map
            .get(key)
            .is_none_or(|existing| entry.timestamp >= existing.timestamp);
        if newer {
            map.insert(key.to_string(), entry);
        }
        newer
    }

    fn dump_memory(inner: &CacheInner) -> CacheDump {
        inner
            .buckets
            .iter()
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect()
    }

    fn merge_dump(inner: &CacheInner, dump: CacheDump) {
        let mut applied = 0usize;
        for (bucket, entries) in dump {
            for (key, entry) in entries {
                if Self::apply_to_memory(inner, &bucket, &key, entry) {
                    applied += 1;
                }
            }
        }
        debug!(applied, "merged peer cache dump");
    }

    /// Write path. Rejects null data and non-positive TTLs, applies
    /// latest-wins to memory, mirrors to the store, then broadcasts to
    /// peers.
    pub fn set(
        &self,
        bucket: &str,
        key: &str,
        data: serde_json::Value,
        ttl_seconds: i64,
        server_timestamp: i64,
    ) -> Result<()> {
        if data.is_null() {
            bail!("refusing to cache null data for '{key}'");
        }
        if ttl_seconds <= 0 {
            bail!("refusing to cache '{key}' with non-positive ttl {ttl_seconds}");
        }

        let entry = CacheEntry {
            data,
            expiry: now_ms() + ttl_seconds * 1000,
            timestamp: server_timestamp,
        };

        let applied = Self::apply_to_memory(&self.inner, bucket, key, entry.clone());
        if !applied {
            debug!(bucket, key, server_timestamp, "dropped stale cache write");
            return Ok(());
        }

        self.inner.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.inner.store.set_cache(bucket, key, &entry);
        self.inner.bus.send(BusMessage::CacheSet {
            bucket: bucket.to_string(),
            key: key.to_string(),
            data: entry.data,
            expiry: entry.expiry,
            timestamp: entry.timestamp,
        });
        Ok(())
    }

    /// Read path: memory first, with TTL eviction on read; on miss,
    /// rehydrate the entry from the store and re-check expiry.
    pub fn get(&self, bucket: &str, key: &str) -> Option<serde_json::Value> {
        let now = now_ms();

        if let Some(mut map) = self.inner.buckets.get_mut(bucket) {
            if let Some(entry) = map.get(key) {
                if entry.is_expired_at(now) {
                    map.remove(key);
                    drop(map);
                    self.inner.store.delete_cache(bucket, key);
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.data.clone());
            }
        }

        // Lazy rehydration from the durable store.
        if let Some(entry) = self.inner.store.get_cache(bucket, key) {
            if entry.is_expired_at(now) {
                self.inner.store.delete_cache(bucket, key);
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            let data = entry.data.clone();
            Self::apply_to_memory(&self.inner, bucket, key, entry);
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(data);
        }

        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Search every bucket for a specific key. Used by background polling
    /// where the bucket is not known. Memory first, then the slow path
    /// over every stored bucket name.
    pub fn find(&self, key: &str) -> Option<serde_json::Value> {
        let now = now_ms();
        for bucket in self.inner.buckets.iter() {
            if let Some(entry) = bucket.value().get(key) {
                if !entry.is_expired_at(now) {
                    return Some(entry.data.clone());
                }
            }
        }

        for bucket in self.inner.store.get_all_bucket_keys() {
            if let Some(entry) = self.inner.store.get_cache(&bucket, key) {
                if !entry.is_expired_at(now) {
                    return Some(entry.data.clone());
                }
            }
        }
        None
    }

    /// Drop a bucket everywhere and tell peers to do the same.
    pub fn invalidate(&self, bucket: &str) {
        self.invalidate_local(bucket);
        self.inner.bus.send(BusMessage::CacheInvalidate {
            bucket: bucket.to_string(),
        });
    }

    /// Drop a bucket from memory and store without rebroadcast (peer path).
    pub fn invalidate_local(&self, bucket: &str) {
        self.inner.buckets.remove(bucket);
        self.inner.store.delete_bucket(bucket);
    }

    /// Drop all in-memory contents, leaving the store untouched. Used on
    /// the follower path of `ws-invalidate-all`, where the leader already
    /// cleared the shared store.
    pub fn drop_memory(&self) {
        self.inner.buckets.clear();
    }

    /// Full purge: memory and the cache namespace of the store.
    pub fn clear(&self) {
        self.inner.buckets.clear();
        self.inner.store.clear_cache();
    }

    /// One-shot hydration barrier. The first caller asks peers for their
    /// memory dump and waits up to 200 ms; every later caller returns
    /// immediately.
    pub async fn wait_for_sync(&self) {
        if self.inner.hydrated.get() {
            return;
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let first = {
            let mut pending = self.inner.pending_request.lock();
            if self.inner.hydrated.get() {
                return;
            }
            if pending.is_none() {
                *pending = Some(request_id.clone());
                true
            } else {
                false
            }
        };

        if first {
            self.inner.bus.send(BusMessage::CacheRequest {
                request_id: request_id.clone(),
            });
        }

        let hydrated = self.inner.hydrated.clone();
        let timed_out =
            tokio::time::timeout(SYNC_TIMEOUT, hydrated.wait_for(|v| *v)).await.is_err();
        if timed_out {
            warn!("no peer answered cache hydration request, continuing");
            self.inner.pending_request.lock().take();
            self.inner.hydrated.set(true);
        }
    }

    /// Whether the cache holds anything for `key`, read either as a
    /// bucket name or as a specific key in any bucket. Background polling
    /// uses this to detect that a focused tab already refilled the data.
    pub fn has_entries_for(&self, key: &str) -> bool {
        if self
            .inner
            .buckets
            .get(key)
            .is_some_and(|map| !map.is_empty())
        {
            return true;
        }
        if self
            .inner
            .store
            .get_bucket(key)
            .is_some_and(|map| !map.is_empty())
        {
            return true;
        }
        self.find(key).is_some()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.counters.hits.load(Ordering::Relaxed),
            misses: self.inner.counters.misses.load(Ordering::Relaxed),
            sets: self.inner.counters.sets.load(Ordering::Relaxed),
            peer_applied: self.inner.counters.peer_applied.load(Ordering::Relaxed),
        }
    }

    /// Whether any bucket currently holds entries in memory.
    pub fn is_empty(&self) -> bool {
        self.inner.buckets.is_empty()
    }
}
