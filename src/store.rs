//! Durable origin-local store.
//!
//! Two keyed namespaces backed by sled trees: `timestamps` (bucket →
//! server time) and `cache` (bucket → map of specific key → entry). The
//! store is shared by every tab of an origin and survives sessions.
//!
//! Failure policy: an operation that cannot reach the backing store logs a
//! warning and returns a benign value. Store failure never fails a fetch;
//! the cache manager degrades to memory-only.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Current wall clock in ms since epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// One cached value.
///
/// `timestamp` is the server-authoritative ordering key; `expiry` is the
/// local TTL horizon checked on read. `data` is any JSON value except
/// `null` (the cache refuses to store null).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub data: serde_json::Value,
    pub expiry: i64,
    pub timestamp: i64,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expiry
    }
}

type BucketMap = HashMap<String, CacheEntry>;

/// Handle on the two durable namespaces.
pub struct PersistentStore {
    timestamps: sled::Tree,
    cache: sled::Tree,
}

fn decode_ts(bytes: &[u8]) -> Option<i64> {
    bytes.try_into().ok().map(i64::from_be_bytes)
}

fn decode_bucket(bytes: &[u8]) -> Option<BucketMap> {
    match serde_json::from_slice(bytes) {
        Ok(map) => Some(map),
        Err(e) => {
            warn!(error = %e, "undecodable bucket map in store, treating as empty");
            None
        }
    }
}

impl PersistentStore {
    /// Open the two trees on an already-open origin database.
    pub fn open(db: &sled::Db, timestamp_tree: &str, cache_tree: &str) -> anyhow::Result<Self> {
        Ok(Self {
            timestamps: db.open_tree(timestamp_tree)?,
            cache: db.open_tree(cache_tree)?,
        })
    }

    /// Latest-wins timestamp write: persists only if strictly newer than
    /// the stored value. Stale writes are dropped silently.
    pub fn set_timestamp(&self, bucket: &str, ts: i64) {
        let result = self.timestamps.fetch_and_update(bucket.as_bytes(), |old| {
            let current = old.and_then(decode_ts);
            if current.is_none_or(|c| ts > c) {
                Some(ts.to_be_bytes().to_vec())
            } else {
                old.map(<[u8]>::to_vec)
            }
        });
        if let Err(e) = result {
            warn!(bucket, error = %e, "failed to persist bucket timestamp");
        }
    }

    pub fn get_timestamp(&self, bucket: &str) -> Option<i64> {
        match self.timestamps.get(bucket.as_bytes()) {
            Ok(value) => value.as_deref().and_then(decode_ts),
            Err(e) => {
                warn!(bucket, error = %e, "failed to read bucket timestamp");
                None
            }
        }
    }

    pub fn delete_timestamp(&self, bucket: &str) {
        if let Err(e) = self.timestamps.remove(bucket.as_bytes()) {
            warn!(bucket, error = %e, "failed to delete bucket timestamp");
        }
    }

    pub fn get_all_timestamps(&self) -> HashMap<String, i64> {
        let mut out = HashMap::new();
        for item in self.timestamps.iter() {
            match item {
                Ok((key, value)) => {
                    if let (Ok(bucket), Some(ts)) =
                        (String::from_utf8(key.to_vec()), decode_ts(&value))
                    {
                        out.insert(bucket, ts);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to iterate bucket timestamps");
                    break;
                }
            }
        }
        out
    }

    /// Read-modify-write of one entry inside its bucket map, applying
    /// latest-wins on the entry timestamp. A single atomic store update.
    pub fn set_cache(&self, bucket: &str, key: &str, entry: &CacheEntry) {
        let result = self.cache.fetch_and_update(bucket.as_bytes(), |old| {
            let mut map = old.and_then(decode_bucket).unwrap_or_default();
            let newer = map
                .get(key)
                .is_none_or(|existing| entry.timestamp >= existing.timestamp);
            if newer {
                map.insert(key.to_string(), entry.clone());
            }
            match serde_json::to_vec(&map) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(bucket, key, error = %e, "failed to encode bucket map");
                    old.map(<[u8]>::to_vec)
                }
            }
        });
        if let Err(e) = result {
            warn!(bucket, key, error = %e, "failed to persist cache entry");
        }
    }

    pub fn get_cache(&self, bucket: &str, key: &str) -> Option<CacheEntry> {
        self.get_bucket(bucket)?.remove(key)
    }

    pub fn get_bucket(&self, bucket: &str) -> Option<BucketMap> {
        match self.cache.get(bucket.as_bytes()) {
            Ok(value) => value.as_deref().and_then(decode_bucket),
            Err(e) => {
                warn!(bucket, error = %e, "failed to read bucket");
                None
            }
        }
    }

    /// Remove a single entry from its bucket map. Read-modify-write like
    /// [`Self::set_cache`]; used when a TTL-expired entry is evicted on
    /// read so the durable mirror does not resurrect it.
    pub fn delete_cache(&self, bucket: &str, key: &str) {
        let result = self.cache.fetch_and_update(bucket.as_bytes(), |old| {
            let mut map = old.and_then(decode_bucket)?;
            map.remove(key);
            if map.is_empty() {
                return None;
            }
            match serde_json::to_vec(&map) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(bucket, key, error = %e, "failed to encode bucket map");
                    old.map(<[u8]>::to_vec)
                }
            }
        });
        if let Err(e) = result {
            warn!(bucket, key, error = %e, "failed to delete cache entry");
        }
    }

    pub fn delete_bucket(&self, bucket: &str) {
        if let Err(e) = self.cache.remove(bucket.as_bytes()) {
            warn!(bucket, error = %e, "failed to delete bucket");
        }
    }

    /// Every bucket the store knows about: the union of the cache and
    /// timestamp namespaces (a bucket may have a timestamp but no cached
    /// entries yet).
    pub fn get_all_bucket_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for tree in [&self.cache, &self.timestamps] {
            for item in tree.iter() {
                match item {
                    Ok((key, _)) => {
                        if let Ok(bucket) = String::from_utf8(key.to_vec()) {
                            if !keys.contains(&bucket) {
                                keys.push(bucket);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to iterate bucket keys");
                        break;
                    }
                }
            }
        }
        keys
    }

    pub fn clear_cache(&self) {
        if let Err(e) = self.cache.clear() {
            warn!(error = %e, "failed to clear cache namespace");
        }
    }

    pub fn clear_timestamps(&self) {
        if let Err(e) = self.timestamps.clear() {
            warn!(error = %e, "failed to clear timestamp namespace");
        }
    }

    pub fn clear_all(&self) {
        self.clear_cache();
        self.clear_timestamps();
    }
}
