//! tabsync
//!
//! A reactive bucketed cache runtime with a tab-elected upstream socket:
//! - **Bucketed cache**: route patterns are buckets, concrete URLs are
//!   keys inside them; buckets invalidate, keys look up
//! - **Single shared upstream**: one elected leader tab owns the
//!   websocket; followers relay through a broadcast bus
//! - **Server-authoritative staleness**: every write carries a server
//!   timestamp, latest-wins everywhere, stale writes drop silently
//! - **Focus-aware notification**: focused tabs refetch immediately,
//!   background tabs poll and piggyback on the focused tab's refill
//! - **Request coalescing**: concurrent fetches for one key share one
//!   HTTP request
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tabsync::{
//!     CacheClient, ClientConfig, FetchOptions, FetchedResponse, Origin, OriginConfig, RouteDef,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let origin = Origin::open(OriginConfig::default())?;
//!
//!     let config = ClientConfig::new()
//!         .with_base_url("https://api.example.com")
//!         .with_ws_url("wss://api.example.com/ws")
//!         .with_get_timestamp(Arc::new(|response: &FetchedResponse| {
//!             response.headers.get("x-server-time")?.to_str().ok()?.parse().ok()
//!         }));
//!
//!     let client = CacheClient::new(&origin, config)?;
//!     client.connect().await;
//!
//!     let todos = client
//!         .fetch(&RouteDef::new("/todos"), None, None, FetchOptions::default())
//!         .await?;
//!     println!("todos: {todos}");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! consumer → FetchOrchestrator → CacheManager (hit) ──────────→ consumer
//!                 ↓ miss                ↑ write-back (server ts)
//!             HTTP client ─────────────┘
//!
//! server ─ws→ Coordinator (leader) → InvalidationEngine
//!                 ↓ broadcast bus             ↓
//!             follower tabs           CacheManager.invalidate
//!                 ↓                           ↓
//!         SubscriptionRegistry ← focus-aware notify
//! ```
//!
//! Several clients sharing one [`Origin`] model same-origin browser tabs:
//! they share the broadcast bus, the leader slot, and the durable store,
//! while each keeps its own in-memory mirror, subscribers and focus
//! state.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};

pub mod bus;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod invalidation;
pub mod observable;
pub mod store;
pub mod subscribers;
pub mod transport;

pub use bus::{BusHub, BusMessage, SharedSlot, TabContext};
pub use cache::{CacheManager, CacheStats};
pub use config::{
    ApiConfig, ClientConfig, DbConfig, OriginConfig, RouteKeyMapper, StartupConfig, UpstreamUrl,
    WsConfig,
};
pub use coordinator::{Coordinator, Role, WsStatus};
pub use error::FetchError;
pub use fetch::{
    FetchOptions, FetchOrchestrator, FetchStats, FetchedResponse, RouteDef, TimestampExtractor,
    build_path,
};
pub use invalidation::{
    CustomCallback, InvalidationStats, ListenerHandle, MessageContext, MessageMiddleware,
    MessageOutcome, ServerMessage, ShouldInvalidate,
};
pub use observable::Observable;
pub use store::{CacheEntry, PersistentStore};
pub use subscribers::{SubscriberCallback, SubscriptionHandle, SubscriptionRegistry};
pub use transport::{MemoryTransport, UpstreamTransport, WebSocketTransport};

use crate::coordinator::CoordinatorShared;
use crate::invalidation::InvalidationEngine;

/// The shared environment of one origin: the broadcast hub, the leader
/// slot, and the durable store every tab of the origin reads and writes.
pub struct Origin {
    hub: BusHub,
    slot: Arc<SharedSlot>,
    db: sled::Db,
    config: OriginConfig,
}

impl Origin {
    /// Open (or create) the origin's durable store and its shared state.
    pub fn open(config: OriginConfig) -> Result<Arc<Self>> {
        let db = sled::open(&config.db.path).with_context(|| {
            format!("failed to open origin store at {}", config.db.path.display())
        })?;
        Ok(Arc::new(Self {
            hub: BusHub::new(),
            slot: Arc::new(SharedSlot::new()),
            db,
            config,
        }))
    }
}

/// One tab's client: the cache, coordinator, subscriptions and fetch
/// path, wired together over the origin's shared plumbing.
///
/// Must be constructed inside a Tokio runtime (background listeners are
/// spawned immediately). Dropping the client hands leadership off to a
/// peer, like a closing tab.
pub struct CacheClient {
    enabled: bool,
    auto_refetch_on_invalidation: bool,
    activity_indicator_duration: std::time::Duration,
    tab: TabContext,
    store: Arc<PersistentStore>,
    cache: CacheManager,
    subscribers: SubscriptionRegistry,
    engine: InvalidationEngine,
    coordinator: Coordinator,
    fetcher: FetchOrchestrator,
}

impl CacheClient {
    /// Build a client with the production websocket transport.
    pub fn new(origin: &Arc<Origin>, config: ClientConfig) -> Result<Self> {
        Self::with_transport(origin, config, Arc::new(WebSocketTransport::new()))
    }

    /// Build a client over a custom upstream transport.
    pub fn with_transport(
        origin: &Arc<Origin>,
        config: ClientConfig,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Result<Self> {
        let tab = TabContext::new();
        let store = Arc::new(PersistentStore::open(
            &origin.db,
            &origin.config.db.timestamp_tree,
            &origin.config.db.cache_tree,
        )?);
        let bus = origin.hub.attach(&config.ws.channel_name, tab.id());
        let cache = CacheManager::new(Arc::clone(&store), bus.clone());
        let subscribers = SubscriptionRegistry::new(
            cache.clone(),
            tab.focused().clone(),
            config.ws.background_poll_interval,
            config.ws.default_background_delay,
        );

        let initial_cache_enabled = config.enabled && config.ws.startup.enable_cache_before_socket;
        let shared = Arc::new(CoordinatorShared::new(
            tab.clone(),
            bus,
            initial_cache_enabled,
            config.debug,
        ));
        let engine = InvalidationEngine::new(
            Arc::clone(&store),
            cache.clone(),
            subscribers.clone(),
            Arc::clone(&shared),
            config.ws.should_invalidate.clone(),
            config.ws.handle_message.clone(),
            config.ws.route_to_cache_key.clone(),
        );
        let coordinator = Coordinator::new(
            shared,
            Arc::clone(&origin.slot),
            engine.clone(),
            subscribers.clone(),
            transport,
            config.ws.url.clone(),
            config.ws.startup.enable_cache_before_socket,
        );

        let http = config.api.client.clone().unwrap_or_default();
        let fetcher = FetchOrchestrator::new(
            config.enabled,
            config.cache_writes_offline,
            config.api.default_cache_ttl_secs,
            config.api.base_url.clone(),
            http,
            config.get_timestamp.clone(),
            Arc::clone(&store),
            cache.clone(),
            subscribers.clone(),
            coordinator.clone(),
            config.ws.startup.wait_for_socket,
            config.ws.startup.socket_wait_timeout,
        );

        Ok(Self {
            enabled: config.enabled,
            auto_refetch_on_invalidation: config.auto_refetch_on_invalidation,
            activity_indicator_duration: config.ws.activity_indicator_duration,
            tab,
            store,
            cache,
            subscribers,
            engine,
            coordinator,
            fetcher,
        })
    }

    /// Join (or start) the origin's leader coordination and, when this
    /// tab wins, open the upstream socket. A no-op for disabled clients.
    pub async fn connect(&self) {
        if self.enabled {
            self.coordinator.connect().await;
        }
    }

    /// User-initiated teardown. No reconnect fires until `connect()` is
    /// called again.
    pub fn disconnect(&self) {
        self.coordinator.disconnect();
    }

    /// Fetch a route through the cache. See
    /// [`FetchOrchestrator::fetch`].
    pub async fn fetch(
        &self,
        route: &RouteDef,
        params: Option<&BTreeMap<String, String>>,
        query: Option<&BTreeMap<String, String>>,
        opts: FetchOptions,
    ) -> Result<serde_json::Value> {
        self.fetcher.fetch(route, params, query, opts).await
    }

    /// Register an invalidation subscriber for a specific key or bucket
    /// pattern.
    pub fn subscribe(&self, key: &str, callback: SubscriberCallback) -> SubscriptionHandle {
        self.subscribers.subscribe(key, callback)
    }

    /// Register a global-invalidation subscriber (full purges,
    /// connectivity recovery).
    pub fn subscribe_global(&self, callback: SubscriberCallback) -> SubscriptionHandle {
        self.subscribers.subscribe_global(callback)
    }

    /// Register a listener for custom (non-invalidation) server
    /// messages.
    pub fn on_message(&self, callback: CustomCallback) -> ListenerHandle {
        self.engine.on_message(callback)
    }

    /// Send an opaque payload upstream: directly when leading, relayed
    /// when following.
    pub fn send(&self, payload: serde_json::Value) {
        self.coordinator.send(payload);
    }

    /// Host hook: document focus changed.
    pub fn set_focused(&self, focused: bool) {
        self.tab.focused().set(focused);
    }

    /// Host hook: browser connectivity changed.
    pub fn set_online(&self, online: bool) {
        if online {
            self.coordinator.set_online();
        } else {
            self.coordinator.set_offline();
        }
    }

    /// Toggle verbose logging at runtime; the leader syncs the flag to
    /// followers.
    pub fn set_debug(&self, enabled: bool) {
        self.coordinator.set_debug(enabled);
    }

    pub fn tab_id(&self) -> &str {
        self.tab.id()
    }

    pub fn is_leader_tab(&self) -> bool {
        self.coordinator.role().get() == Role::Leader
    }

    pub fn role(&self) -> Observable<Role> {
        self.coordinator.role()
    }

    pub fn ws_status(&self) -> Observable<WsStatus> {
        self.coordinator.ws_status()
    }

    pub fn cache_enabled(&self) -> Observable<bool> {
        self.coordinator.cache_enabled()
    }

    pub fn debug_enabled(&self) -> Observable<bool> {
        self.coordinator.debug_enabled()
    }

    /// Binding-layer hint: whether subscribers should refetch
    /// automatically on invalidation.
    pub fn auto_refetch_on_invalidation(&self) -> bool {
        self.auto_refetch_on_invalidation
    }

    /// Binding-layer hint: how long to keep activity indicators visible.
    pub fn activity_indicator_duration(&self) -> std::time::Duration {
        self.activity_indicator_duration
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn fetch_stats(&self) -> FetchStats {
        self.fetcher.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn invalidation_stats(&self) -> InvalidationStats {
        self.engine.stats()
    }
}

impl Drop for CacheClient {
    fn drop(&mut self) {
        // A closing tab hands leadership off instantly instead of letting
        // peers wait out the heartbeat timeout.
        self.coordinator.shutdown();
    }
}
