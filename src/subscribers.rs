//! Subscription registry with focus-aware dispatch.
//!
//! Consumers register callbacks per key (a specific URL or a bucket
//! pattern) and globally (fired on full purges and connectivity
//! recovery). When an invalidation arrives, a focused tab fires callbacks
//! on the next scheduler turn; an unfocused tab polls instead, waiting for
//! the focused tab to repopulate the cache so background tabs read
//! cheaply rather than stampeding the network. The poll ends early on
//! focus regain or cache refill, and is bounded by a per-route maximum
//! wait.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::CacheManager;
use crate::observable::Observable;

/// A subscriber callback. Carries no payload: the consumer re-reads
/// through the fetch path on notification.
pub type SubscriberCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Key(String),
    Global,
}

struct RegistryInner {
    per_key: Mutex<HashMap<String, Vec<(u64, SubscriberCallback)>>>,
    global: Mutex<Vec<(u64, SubscriberCallback)>>,
    next_id: AtomicU64,
    cache: CacheManager,
    focused: Observable<bool>,
    /// Per-route override of the background wait bound, keyed by specific
    /// key.
    route_delays: DashMap<String, u64>,
    poll_interval: Duration,
    default_max_wait: Duration,
}

/// Registry of per-key and global invalidation subscribers for one tab.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

/// Returned by the subscribe calls; revokes exactly one registration.
pub struct SubscriptionHandle {
    inner: std::sync::Weak<RegistryInner>,
    scope: Scope,
    id: u64,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match &self.scope {
            Scope::Key(key) => {
                let mut per_key = inner.per_key.lock();
                if let Some(list) = per_key.get_mut(key) {
                    list.retain(|(id, _)| *id != self.id);
                    if list.is_empty() {
                        per_key.remove(key);
                    }
                }
            }
            Scope::Global => {
                inner.global.lock().retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl SubscriptionRegistry {
    pub fn new(
        cache: CacheManager,
        focused: Observable<bool>,
        poll_interval: Duration,
        default_max_wait: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                per_key: Mutex::new(HashMap::new()),
                global: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                cache,
                focused,
                route_delays: DashMap::new(),
                poll_interval,
                default_max_wait,
            }),
        }
    }

    pub fn subscribe(&self, key: &str, callback: SubscriberCallback) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .per_key
            .lock()
            .entry(key.to_string())
            .or_default()
            .push((id, callback));
        SubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            scope: Scope::Key(key.to_string()),
            id,
        }
    }

    pub fn subscribe_global(&self, callback: SubscriberCallback) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.global.lock().push((id, callback));
        SubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            scope: Scope::Global,
            id,
        }
    }

    /// Record a per-route background wait bound for a specific key.
    pub fn set_route_delay(&self, specific_key: &str, max_wait_ms: u64) {
        self.inner
            .route_delays
            .insert(specific_key.to_string(), max_wait_ms);
    }

    fn callbacks_for(&self, key: &str) -> Vec<SubscriberCallback> {
        self.inner
            .per_key
            .lock()
            .get(key)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    fn fire(callbacks: &[SubscriberCallback]) {
        for cb in callbacks {
            cb();
        }
    }

    /// Focus-aware notification for `key`: immediate on a focused tab,
    /// polled on a background one.
    pub fn notify(&self, key: &str) {
        if self.inner.focused.get() {
            self.notify_now(key);
        } else {
            self.poll(key);
        }
    }

    /// Fire per-key callbacks on the next scheduler turn.
    pub fn notify_now(&self, key: &str) {
        let callbacks = self.callbacks_for(key);
        if callbacks.is_empty() {
            return;
        }
        tokio::spawn(async move { Self::fire(&callbacks) });
    }

    /// Background-poll dispatch: tick every poll interval until focus is
    /// regained, the cache refilled, or the bounded wait elapsed; then
    /// fire.
    pub fn poll(&self, key: &str) {
        let callbacks = self.callbacks_for(key);
        if callbacks.is_empty() {
            return;
        }

        let max_wait = self
            .inner
            .route_delays
            .get(key)
            .map_or(self.inner.default_max_wait, |ms| {
                Duration::from_millis(*ms)
            });
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();

        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                tokio::time::sleep(inner.poll_interval).await;
                if inner.focused.get() {
                    debug!(key = %key, "background poll ended: focus regained");
                    break;
                }
                if inner.cache.has_entries_for(&key) {
                    debug!(key = %key, "background poll ended: cache refilled by peer");
                    break;
                }
                if started.elapsed() >= max_wait {
                    debug!(key = %key, "background poll ended: wait bound elapsed");
                    break;
                }
            }
            Self::fire(&callbacks);
        });
    }

    /// Fire global-invalidation callbacks.
    pub fn notify_global(&self) {
        let callbacks: Vec<SubscriberCallback> = self
            .inner
            .global
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        if callbacks.is_empty() {
            return;
        }
        tokio::spawn(async move { Self::fire(&callbacks) });
    }

    /// Fire global callbacks plus every per-key callback. Used when the
    /// whole cache was purged.
    pub fn notify_all(&self) {
        self.notify_global();
        let keys: Vec<String> = self.inner.per_key.lock().keys().cloned().collect();
        for key in keys {
            self.notify_now(&key);
        }
    }
}
