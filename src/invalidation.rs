//! Invalidation engine: interprets upstream server messages.
//!
//! Runs on the leader's upstream message path. Servers speak three
//! shapes: a full sync (`invalidate` with a bucket→timestamp map) that is
//! authoritative over the whole bucket set, a delta (`invalidate-delta`)
//! that only advances the listed buckets, and custom messages fanned out
//! to application listeners. A bare non-JSON payload is shorthand for a
//! single-bucket invalidation.
//!
//! Followers never re-run invalidations against the shared store — the
//! leader's `cache-invalidate` broadcasts already moved the data — they
//! only notify their own subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::BusMessage;
use crate::cache::CacheManager;
use crate::config::RouteKeyMapper;
use crate::coordinator::CoordinatorShared;
use crate::store::{PersistentStore, now_ms};
use crate::subscribers::SubscriptionRegistry;

/// Predicate deciding whether a server-announced `(bucket, timestamp)`
/// must invalidate local state. The default keeps the monotonicity rule:
/// invalidate only when the local timestamp is older or absent.
pub type ShouldInvalidate = Arc<dyn Fn(&str, i64, &PersistentStore) -> bool + Send + Sync>;

/// Listener for non-invalidation server messages.
pub type CustomCallback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Middleware over the upstream message path. Returning
/// [`MessageOutcome::Handled`] consumes the message; `Continue` lets the
/// default handling run.
pub type MessageMiddleware = Arc<
    dyn Fn(ServerMessage, MessageContext) -> BoxFuture<'static, Result<MessageOutcome>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Handled,
    Continue,
}

/// A parsed upstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `{type:"invalidate", data:{bucket: ts, ...}}` — authoritative over
    /// the full bucket set.
    FullSync { data: HashMap<String, i64> },
    /// `{type:"invalidate-delta", data:{bucket: ts, ...}}` — advances the
    /// listed buckets only.
    Delta { data: HashMap<String, i64> },
    /// `{type:"invalidate", key:"..."}` or a bare string payload.
    InvalidateKey { key: String },
    /// Anything else; dispatched to custom listeners and relayed.
    Custom { payload: serde_json::Value },
}

fn timestamp_map(value: &serde_json::Value) -> Option<HashMap<String, i64>> {
    let object = value.as_object()?;
    let mut map = HashMap::with_capacity(object.len());
    for (bucket, ts) in object {
        #[allow(clippy::cast_possible_truncation)]
        match ts.as_i64().or_else(|| ts.as_f64().map(|f| f as i64)) {
            Some(ts) => {
                map.insert(bucket.clone(), ts);
            }
            None => {
                warn!(bucket = %bucket, "non-numeric timestamp in invalidation payload, skipping");
            }
        }
    }
    Some(map)
}

impl ServerMessage {
    /// Parse a raw upstream payload. Objects are discriminated on their
    /// `type`; anything that is not a JSON object is treated as a bare
    /// invalidation key.
    pub fn parse(raw: &str) -> Self {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
            return Self::InvalidateKey {
                key: raw.to_string(),
            };
        };
        if !value.is_object() {
            return Self::InvalidateKey {
                key: raw.to_string(),
            };
        }

        match value.get("type").and_then(serde_json::Value::as_str) {
            Some("invalidate") => {
                if let Some(data) = value.get("data").and_then(timestamp_map) {
                    Self::FullSync { data }
                } else if let Some(key) = value.get("key").and_then(serde_json::Value::as_str) {
                    Self::InvalidateKey {
                        key: key.to_string(),
                    }
                } else {
                    warn!("invalidate message without data or key, passing to listeners");
                    Self::Custom { payload: value }
                }
            }
            Some("invalidate-delta") => match value.get("data").and_then(timestamp_map) {
                Some(data) => Self::Delta { data },
                None => {
                    warn!("invalidate-delta message without data, passing to listeners");
                    Self::Custom { payload: value }
                }
            },
            _ => Self::Custom { payload: value },
        }
    }
}

#[derive(Debug, Default)]
struct EngineCounters {
    full_syncs: AtomicU64,
    deltas: AtomicU64,
    invalidations_applied: AtomicU64,
    custom_messages: AtomicU64,
}

/// Snapshot of [`InvalidationEngine`] activity.
#[derive(Debug, Clone, Default)]
pub struct InvalidationStats {
    pub full_syncs: u64,
    pub deltas: u64,
    pub invalidations_applied: u64,
    pub custom_messages: u64,
}

struct EngineInner {
    store: Arc<PersistentStore>,
    cache: CacheManager,
    subscribers: SubscriptionRegistry,
    shared: Arc<CoordinatorShared>,
    should_invalidate: Option<ShouldInvalidate>,
    middleware: Option<MessageMiddleware>,
    route_mapper: Option<RouteKeyMapper>,
    custom_listeners: Mutex<Vec<(u64, CustomCallback)>>,
    next_listener_id: AtomicU64,
    counters: EngineCounters,
}

/// The leader-side interpreter of upstream messages, plus the follower
/// notification paths.
#[derive(Clone)]
pub struct InvalidationEngine {
    inner: Arc<EngineInner>,
}

/// Revokes one custom-message listener.
pub struct ListenerHandle {
    inner: std::sync::Weak<EngineInner>,
    id: u64,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .custom_listeners
                .lock()
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl InvalidationEngine {
    pub(crate) fn new(
        store: Arc<PersistentStore>,
        cache: CacheManager,
        subscribers: SubscriptionRegistry,
        shared: Arc<CoordinatorShared>,
        should_invalidate: Option<ShouldInvalidate>,
        middleware: Option<MessageMiddleware>,
        route_mapper: Option<RouteKeyMapper>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                cache,
                subscribers,
                shared,
                should_invalidate,
                middleware,
                route_mapper,
                custom_listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                counters: EngineCounters::default(),
            }),
        }
    }

    /// Register a listener for custom server messages. Fires on the
    /// leader directly and on followers via the `ws-custom` relay.
    pub fn on_message(&self, callback: CustomCallback) -> ListenerHandle {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.custom_listeners.lock().push((id, callback));
        ListenerHandle {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    fn map_route(&self, path: &str) -> String {
        self.inner
            .route_mapper
            .as_ref()
            .map_or_else(|| path.to_string(), |mapper| mapper(path))
    }

    /// Leader entry point for every upstream payload.
    pub async fn handle_upstream(&self, raw: &str) {
        let msg = ServerMessage::parse(raw);

        if let Some(middleware) = &self.inner.middleware {
            match middleware(msg.clone(), self.context()).await {
                Ok(MessageOutcome::Handled) => {
                    debug!("upstream message consumed by middleware");
                    return;
                }
                Ok(MessageOutcome::Continue) => {}
                Err(e) => {
                    warn!(error = %e, "message middleware failed, running default handling");
                }
            }
        }

        match msg {
            ServerMessage::FullSync { data } => self.full_sync(&data),
            ServerMessage::Delta { data } => self.delta(&data),
            ServerMessage::InvalidateKey { key } => {
                let bucket = self.map_route(&key);
                let now = now_ms();
                if self.should_invalidate(&bucket, now) {
                    self.invalidate_and_notify(&bucket, now);
                }
            }
            ServerMessage::Custom { payload } => self.dispatch_custom(payload),
        }
    }

    /// Default timestamp comparison, overridable via configuration.
    fn should_invalidate(&self, bucket: &str, ts: i64) -> bool {
        match &self.inner.should_invalidate {
            Some(predicate) => predicate(bucket, ts, &self.inner.store),
            None => self
                .inner
                .store
                .get_timestamp(bucket)
                .is_none_or(|local| local < ts),
        }
    }

    /// Full sync: the server's bucket set is authoritative. An empty map
    /// purges everything; otherwise listed buckets advance through the
    /// predicate and unlisted local buckets are pruned.
    fn full_sync(&self, data: &HashMap<String, i64>) {
        self.inner.counters.full_syncs.fetch_add(1, Ordering::Relaxed);

        if data.is_empty() {
            info!("empty full sync: purging all local buckets");
            self.inner.cache.clear();
            self.inner.store.clear_timestamps();
            self.inner.shared.broadcast(BusMessage::WsInvalidateAll);
            self.inner.subscribers.notify_all();
            self.enable_cache();
            return;
        }

        for (bucket, ts) in data {
            if self.should_invalidate(bucket, *ts) {
                self.invalidate_and_notify(bucket, *ts);
            }
        }

        // The server did not list these: they no longer exist upstream.
        for bucket in self.inner.store.get_all_bucket_keys() {
            if !data.contains_key(&bucket) {
                self.purge_bucket(&bucket);
            }
        }

        self.enable_cache();
    }

    /// Delta: advance the listed buckets, leave the rest alone. Stale
    /// entries are dropped by the same comparison full sync uses.
    fn delta(&self, data: &HashMap<String, i64>) {
        self.inner.counters.deltas.fetch_add(1, Ordering::Relaxed);
        for (bucket, ts) in data {
            if self.should_invalidate(bucket, *ts) {
                self.invalidate_and_notify(bucket, *ts);
            }
        }
    }

    /// Apply one invalidation: advance the bucket timestamp, drop the
    /// bucket (memory + store + peer broadcast), tell followers to notify
    /// their subscribers, then notify our own.
    pub fn invalidate_and_notify(&self, bucket: &str, ts: i64) {
        self.inner
            .counters
            .invalidations_applied
            .fetch_add(1, Ordering::Relaxed);
        self.inner.store.set_timestamp(bucket, ts);
        self.inner.cache.invalidate(bucket);
        self.inner.shared.broadcast(BusMessage::WsInvalidate {
            key: bucket.to_string(),
            timestamp: ts,
        });
        self.inner.subscribers.notify(bucket);
    }

    /// Remove a bucket the server no longer knows: cache rows and the
    /// bucket timestamp both go away.
    fn purge_bucket(&self, bucket: &str) {
        self.inner
            .counters
            .invalidations_applied
            .fetch_add(1, Ordering::Relaxed);
        self.inner.store.delete_timestamp(bucket);
        self.inner.cache.invalidate(bucket);
        self.inner.shared.broadcast(BusMessage::WsInvalidate {
            key: bucket.to_string(),
            timestamp: now_ms(),
        });
        self.inner.subscribers.notify(bucket);
    }

    fn dispatch_custom(&self, payload: serde_json::Value) {
        self.inner
            .counters
            .custom_messages
            .fetch_add(1, Ordering::Relaxed);
        self.dispatch_custom_local(&payload);
        self.inner.shared.broadcast(BusMessage::WsCustom { payload });
    }

    /// Fire custom listeners without relaying (the follower receive path).
    pub fn dispatch_custom_local(&self, payload: &serde_json::Value) {
        let listeners: Vec<CustomCallback> = self
            .inner
            .custom_listeners
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for listener in listeners {
            listener(payload);
        }
    }

    /// Follower path for `ws-invalidate`: the leader's `cache-invalidate`
    /// already handled the data, so only subscribers are notified.
    pub fn on_ws_invalidate(&self, key: &str) {
        self.inner.subscribers.notify(key);
    }

    /// Follower path for `ws-invalidate-all`: drop tab-local memory (the
    /// leader cleared the shared store) and fire everything.
    pub fn on_ws_invalidate_all(&self) {
        self.inner.cache.drop_memory();
        self.inner.subscribers.notify_all();
    }

    fn enable_cache(&self) {
        if !self.inner.shared.is_explicitly_closed() {
            self.inner.shared.set_cache_enabled(true);
        }
    }

    /// The capability object handed to message middleware.
    pub fn context(&self) -> MessageContext {
        MessageContext {
            engine: self.clone(),
        }
    }

    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            full_syncs: self.inner.counters.full_syncs.load(Ordering::Relaxed),
            deltas: self.inner.counters.deltas.load(Ordering::Relaxed),
            invalidations_applied: self
                .inner
                .counters
                .invalidations_applied
                .load(Ordering::Relaxed),
            custom_messages: self.inner.counters.custom_messages.load(Ordering::Relaxed),
        }
    }
}

/// Narrow capability surface exposed to `handle_message` middleware —
/// the internals it may touch, nothing more.
#[derive(Clone)]
pub struct MessageContext {
    engine: InvalidationEngine,
}

impl MessageContext {
    pub fn db(&self) -> &PersistentStore {
        &self.engine.inner.store
    }

    pub fn cache(&self) -> &CacheManager {
        &self.engine.inner.cache
    }

    pub fn broadcast(&self, msg: BusMessage) {
        self.engine.inner.shared.broadcast(msg);
    }

    /// Fire subscribers for `key` immediately.
    pub fn trigger_subscribers(&self, key: &str) {
        self.engine.inner.subscribers.notify_now(key);
    }

    /// Start background polling for `key` subscribers.
    pub fn poll_subscribers(&self, key: &str) {
        self.engine.inner.subscribers.poll(key);
    }

    pub fn route_to_cache_key(&self, path: &str) -> String {
        self.engine.map_route(path)
    }

    /// Invalidate every known bucket not present in `valid_keys`.
    pub fn invalidate_except(&self, valid_keys: &[String]) {
        let now = now_ms();
        for bucket in self.engine.inner.store.get_all_bucket_keys() {
            if !valid_keys.contains(&bucket) {
                self.engine.invalidate_and_notify(&bucket, now);
            }
        }
    }

    pub fn enable_cache(&self) {
        self.engine.enable_cache();
    }

    /// Verbose log line, gated on the runtime debug toggle.
    pub fn log(&self, message: &str) {
        if self.engine.inner.shared.is_debug_enabled() {
            info!(target: "tabsync::middleware", "{message}");
        } else {
            debug!(target: "tabsync::middleware", "{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_sync() {
        let msg =
            ServerMessage::parse(r#"{"type":"invalidate","data":{"/todos":100,"/users/{id}":50}}"#);
        let ServerMessage::FullSync { data } = msg else {
            panic!("expected full sync");
        };
        assert_eq!(data.get("/todos"), Some(&100));
        assert_eq!(data.get("/users/{id}"), Some(&50));
    }

    #[test]
    fn parses_delta() {
        let msg = ServerMessage::parse(r#"{"type":"invalidate-delta","data":{"/todos":7}}"#);
        assert_eq!(
            msg,
            ServerMessage::Delta {
                data: HashMap::from([("/todos".to_string(), 7)])
            }
        );
    }

    #[test]
    fn parses_keyed_invalidate() {
        let msg = ServerMessage::parse(r#"{"type":"invalidate","key":"/todos"}"#);
        assert_eq!(
            msg,
            ServerMessage::InvalidateKey {
                key: "/todos".to_string()
            }
        );
    }

    #[test]
    fn bare_payload_is_an_invalidation_key() {
        let msg = ServerMessage::parse("/todos");
        assert_eq!(
            msg,
            ServerMessage::InvalidateKey {
                key: "/todos".to_string()
            }
        );
    }

    #[test]
    fn unknown_types_are_custom() {
        let msg = ServerMessage::parse(r#"{"type":"chat","text":"hi"}"#);
        let ServerMessage::Custom { payload } = msg else {
            panic!("expected custom");
        };
        assert_eq!(payload["type"], "chat");
    }

    #[test]
    fn empty_data_object_is_a_full_sync_purge() {
        let msg = ServerMessage::parse(r#"{"type":"invalidate","data":{}}"#);
        assert_eq!(
            msg,
            ServerMessage::FullSync {
                data: HashMap::new()
            }
        );
    }
}
