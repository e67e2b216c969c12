//! Client and origin configuration.
//!
//! Mirrors the construction-time options of the runtime: the master
//! switch, cache-write policy, the timestamp extractor required for
//! caching, HTTP client settings, and the websocket/broadcast section
//! with its startup and background-polling knobs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::fetch::TimestampExtractor;
use crate::invalidation::{MessageMiddleware, ShouldInvalidate};

/// Maps a server-emitted route path to a bucket key.
pub type RouteKeyMapper = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Upstream socket address: a static URL, or a thunk evaluated per
/// connection attempt (the thunk form lets auth tokens stay fresh).
#[derive(Clone)]
pub enum UpstreamUrl {
    Static(String),
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl UpstreamUrl {
    pub fn resolve(&self) -> String {
        match self {
            Self::Static(url) => url.clone(),
            Self::Dynamic(thunk) => thunk(),
        }
    }
}

impl From<&str> for UpstreamUrl {
    fn from(url: &str) -> Self {
        Self::Static(url.to_string())
    }
}

impl From<String> for UpstreamUrl {
    fn from(url: String) -> Self {
        Self::Static(url)
    }
}

/// Durable store settings for one origin.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory of the sled database.
    pub path: PathBuf,
    pub timestamp_tree: String,
    pub cache_tree: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./tabsync-db"),
            timestamp_tree: "timestamps".to_string(),
            cache_tree: "cache".to_string(),
        }
    }
}

/// Origin-wide configuration (shared by every tab of the origin).
#[derive(Debug, Clone, Default)]
pub struct OriginConfig {
    pub db: DbConfig,
}

/// HTTP client settings.
#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: String,
    /// Default TTL in seconds for routes that do not set their own.
    pub default_cache_ttl_secs: i64,
    /// Caller-supplied client; a default one is built when absent.
    pub client: Option<reqwest::Client>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            default_cache_ttl_secs: 300,
            client: None,
        }
    }
}

/// First-connection behavior.
#[derive(Debug, Clone)]
pub struct StartupConfig {
    /// When false, cache serving stays disabled until the first full sync
    /// completes (protects against serving stale data across a server
    /// restart).
    pub enable_cache_before_socket: bool,
    /// When true, the very first fetch of the client's lifetime blocks
    /// until the socket connects (or the timeout elapses).
    pub wait_for_socket: bool,
    pub socket_wait_timeout: Duration,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            enable_cache_before_socket: false,
            wait_for_socket: false,
            socket_wait_timeout: Duration::from_millis(5000),
        }
    }
}

/// Websocket, broadcast, and invalidation settings.
#[derive(Clone)]
pub struct WsConfig {
    pub url: UpstreamUrl,
    /// Broadcast channel namespace for this client's origin traffic.
    pub channel_name: String,
    /// Normalizes server-emitted paths to bucket keys.
    pub route_to_cache_key: Option<RouteKeyMapper>,
    /// Bound on background-tab notification delay, unless a route
    /// overrides it.
    pub default_background_delay: Duration,
    pub background_poll_interval: Duration,
    /// How long binding layers keep activity indicators visible. Not
    /// consumed by the core.
    pub activity_indicator_duration: Duration,
    pub startup: StartupConfig,
    /// Overrides the default timestamp comparison deciding whether a
    /// server-announced bucket must be invalidated.
    pub should_invalidate: Option<ShouldInvalidate>,
    /// Middleware that may consume upstream messages before the default
    /// handling.
    pub handle_message: Option<MessageMiddleware>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: UpstreamUrl::Static(String::new()),
            channel_name: "tabsync".to_string(),
            route_to_cache_key: None,
            default_background_delay: Duration::from_millis(500),
            background_poll_interval: Duration::from_millis(200),
            activity_indicator_duration: Duration::from_millis(300),
            startup: StartupConfig::default(),
            should_invalidate: None,
            handle_message: None,
        }
    }
}

/// Per-client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Master switch. When false: no socket, no cache, pass-through
    /// fetches.
    pub enabled: bool,
    /// Binding-layer hint: refetch automatically on invalidation instead
    /// of flagging refetch-needed.
    pub auto_refetch_on_invalidation: bool,
    /// Keep writing the cache while serving is disabled, so it is warm
    /// when connectivity returns.
    pub cache_writes_offline: bool,
    /// Verbose logging, runtime-toggleable.
    pub debug: bool,
    /// Extracts the server-authoritative timestamp (ms since epoch) from
    /// a response. Required whenever caching is enabled.
    pub get_timestamp: Option<TimestampExtractor>,
    pub api: ApiConfig,
    pub ws: WsConfig,
}

// The master switch defaults to on; a derived `Default` would silently
// flip it off.
impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_refetch_on_invalidation: false,
            cache_writes_offline: false,
            debug: false,
            get_timestamp: None,
            api: ApiConfig::default(),
            ws: WsConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api.base_url = base_url.into();
        self
    }

    pub fn with_ws_url(mut self, url: impl Into<UpstreamUrl>) -> Self {
        self.ws.url = url.into();
        self
    }

    pub fn with_get_timestamp(mut self, extractor: TimestampExtractor) -> Self {
        self.get_timestamp = Some(extractor);
        self
    }

    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.ws.channel_name = name.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
