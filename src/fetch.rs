//! Cache-aware fetch orchestration.
//!
//! The read path consumers actually call: cache lookup against the
//! bucketed store, in-flight coalescing so one specific key never has two
//! concurrent HTTP requests, and write-back stamped with the
//! server-authoritative timestamp. A client configured with the master
//! switch off degrades to plain pass-through GETs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::{debug, warn};

use crate::cache::CacheManager;
use crate::coordinator::{Coordinator, WsStatus};
use crate::error::FetchError;
use crate::store::PersistentStore;
use crate::subscribers::SubscriptionRegistry;

/// A route an application fetches through the cache.
#[derive(Debug, Clone)]
pub struct RouteDef {
    /// Route pattern with `{name}` placeholders; doubles as the bucket.
    pub path: String,
    /// TTL override in seconds; the API default applies when absent.
    pub cache_ttl: Option<i64>,
    /// Background notification wait override for this route, in ms.
    pub background_delay: Option<u64>,
}

impl RouteDef {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cache_ttl: None,
            background_delay: None,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, seconds: i64) -> Self {
        self.cache_ttl = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_background_delay(mut self, ms: u64) -> Self {
        self.background_delay = Some(ms);
        self
    }
}

/// What the timestamp extractor sees of a completed response.
pub struct FetchedResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: serde_json::Value,
}

/// Extracts the server-authoritative timestamp (ms since epoch) from a
/// response. Required whenever caching is enabled.
pub type TimestampExtractor = Arc<dyn Fn(&FetchedResponse) -> Option<i64> + Send + Sync>;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Cache under this key instead of the composed URL.
    pub cache_key: Option<String>,
    /// Bypass the cache read; the response is still written back.
    pub force: bool,
}

impl FetchOptions {
    pub fn force() -> Self {
        Self {
            cache_key: None,
            force: true,
        }
    }
}

/// Snapshot of fetch-path activity.
#[derive(Debug, Clone, Default)]
pub struct FetchStats {
    pub requests: u64,
    pub cache_hits: u64,
    pub coalesced: u64,
    pub network_fetches: u64,
}

#[derive(Debug, Default)]
struct FetchCounters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    network_fetches: AtomicU64,
}

type SharedFlight = Shared<BoxFuture<'static, std::result::Result<serde_json::Value, Arc<anyhow::Error>>>>;

pub(crate) struct FetchInner {
    enabled: bool,
    cache_writes_offline: bool,
    default_ttl: i64,
    base_url: String,
    http: reqwest::Client,
    get_timestamp: Option<TimestampExtractor>,
    store: Arc<PersistentStore>,
    cache: CacheManager,
    subscribers: SubscriptionRegistry,
    coordinator: Coordinator,
    wait_for_socket: bool,
    socket_wait_timeout: Duration,
    /// The startup socket wait happens at most once per client lifetime.
    startup_done: AtomicBool,
    pending: DashMap<String, SharedFlight>,
    counters: FetchCounters,
}

/// The fetch path of one client. Cheap to clone.
#[derive(Clone)]
pub struct FetchOrchestrator {
    inner: Arc<FetchInner>,
}

/// Expand `{name}` placeholders from `params` and append the query
/// string. Query pairs keep their map order, so composed URLs are stable
/// cache keys.
pub fn build_path(
    base_url: &str,
    path: &str,
    params: Option<&BTreeMap<String, String>>,
    query: Option<&BTreeMap<String, String>>,
) -> Result<String> {
    let mut filled = path.to_string();
    if let Some(params) = params {
        for (name, value) in params {
            filled = filled.replace(&format!("{{{name}}}"), value);
        }
    }

    let base = base_url.trim_end_matches('/');
    let joined = if filled.starts_with('/') || base.is_empty() {
        format!("{base}{filled}")
    } else {
        format!("{base}/{filled}")
    };

    match query {
        Some(query) if !query.is_empty() => {
            let url = reqwest::Url::parse_with_params(&joined, query.iter())
                .with_context(|| format!("failed to compose url from '{joined}'"))?;
            Ok(url.to_string())
        }
        _ => Ok(joined),
    }
}

impl FetchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        enabled: bool,
        cache_writes_offline: bool,
        default_ttl: i64,
        base_url: String,
        http: reqwest::Client,
        get_timestamp: Option<TimestampExtractor>,
        store: Arc<PersistentStore>,
        cache: CacheManager,
        subscribers: SubscriptionRegistry,
        coordinator: Coordinator,
        wait_for_socket: bool,
        socket_wait_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(FetchInner {
                enabled,
                cache_writes_offline,
                default_ttl,
                base_url,
                http,
                get_timestamp,
                store,
                cache,
                subscribers,
                coordinator,
                wait_for_socket,
                socket_wait_timeout,
                startup_done: AtomicBool::new(false),
                pending: DashMap::new(),
                counters: FetchCounters::default(),
            }),
        }
    }

    /// Fetch a route through the cache.
    ///
    /// `force` bypasses the cache read but never the write-back;
    /// concurrent calls for one specific key share a single HTTP request.
    pub async fn fetch(
        &self,
        route: &RouteDef,
        params: Option<&BTreeMap<String, String>>,
        query: Option<&BTreeMap<String, String>>,
        opts: FetchOptions,
    ) -> Result<serde_json::Value> {
        let inner = &self.inner;
        inner.counters.requests.fetch_add(1, Ordering::Relaxed);

        let url = build_path(&inner.base_url, &route.path, params, query)?;

        // Master switch off: no socket, no cache, plain GET.
        if !inner.enabled {
            return direct_get(&inner.http, &url).await;
        }

        let specific_key = opts.cache_key.clone().unwrap_or_else(|| url.clone());
        let ttl = route.cache_ttl.unwrap_or(inner.default_ttl);

        if let Some(delay) = route.background_delay {
            inner.subscribers.set_route_delay(&specific_key, delay);
        }

        // Caching without a timestamp source is a misconfiguration.
        if ttl > 0 && inner.get_timestamp.is_none() {
            return Err(FetchError::MissingTimestampExtractor.into());
        }

        // One-shot startup wait for the upstream socket.
        if inner.wait_for_socket && !inner.startup_done.swap(true, Ordering::SeqCst) {
            if inner.coordinator.ws_status().get() != WsStatus::Connected {
                let connected = inner
                    .coordinator
                    .wait_for_connection(inner.socket_wait_timeout)
                    .await;
                if !connected {
                    warn!("startup socket wait timed out, fetching anyway");
                }
            }
        }

        let cache_enabled = inner.coordinator.cache_enabled().get();
        if cache_enabled {
            inner.cache.wait_for_sync().await;
        }

        if !opts.force && cache_enabled && ttl > 0 {
            if let Some(hit) = inner.cache.get(&route.path, &specific_key) {
                inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %specific_key, "cache hit");
                return Ok(hit);
            }
        }

        // Join an in-flight request for the same key instead of issuing
        // another one. The entry API keeps lookup-or-insert atomic.
        let flight = match inner.pending.entry(specific_key.clone()) {
            Entry::Occupied(occupied) => {
                inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %specific_key, "joining in-flight fetch");
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                let weak = Arc::downgrade(inner);
                let url = url.clone();
                let route_pattern = route.path.clone();
                let key = specific_key.clone();
                let flight = async move {
                    let result = match weak.upgrade() {
                        Some(inner) => perform(&inner, &url, &route_pattern, &key, ttl).await,
                        None => Err(anyhow::anyhow!("client was dropped mid-fetch")),
                    };
                    // The pending entry must go away however this ends.
                    if let Some(inner) = weak.upgrade() {
                        inner.pending.remove(&key);
                    }
                    result.map_err(Arc::new)
                }
                .boxed()
                .shared();
                vacant.insert(flight.clone());
                flight
            }
        };

        flight.await.map_err(|e| anyhow::anyhow!("{e:#}"))
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            requests: self.inner.counters.requests.load(Ordering::Relaxed),
            cache_hits: self.inner.counters.cache_hits.load(Ordering::Relaxed),
            coalesced: self.inner.counters.coalesced.load(Ordering::Relaxed),
            network_fetches: self.inner.counters.network_fetches.load(Ordering::Relaxed),
        }
    }
}

async fn direct_get(http: &reqwest::Client, url: &str) -> Result<serde_json::Value> {
    let response = http.get(url).send().await.map_err(|source| FetchError::Http {
        url: url.to_string(),
        source,
    })?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        }
        .into());
    }
    response
        .json()
        .await
        .map_err(|source| FetchError::Http {
            url: url.to_string(),
            source,
        })
        .map_err(Into::into)
}

/// The network leg: GET, extract the server timestamp, write back.
async fn perform(
    inner: &Arc<FetchInner>,
    url: &str,
    route_pattern: &str,
    specific_key: &str,
    ttl: i64,
) -> Result<serde_json::Value> {
    inner.counters.network_fetches.fetch_add(1, Ordering::Relaxed);

    let response = inner
        .http
        .get(url)
        .send()
        .await
        .map_err(|source| FetchError::Http {
            url: url.to_string(),
            source,
        })?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        }
        .into());
    }
    let headers = response.headers().clone();
    let body: serde_json::Value =
        response.json().await.map_err(|source| FetchError::Http {
            url: url.to_string(),
            source,
        })?;

    let cache_enabled = inner.coordinator.cache_enabled().get();
    let write_back = ttl > 0 && (cache_enabled || inner.cache_writes_offline);
    if write_back {
        let extractor = inner
            .get_timestamp
            .as_ref()
            .ok_or(FetchError::MissingTimestampExtractor)?;
        let fetched = FetchedResponse {
            status: status.as_u16(),
            headers,
            body: body.clone(),
        };
        let ts = extractor(&fetched).ok_or_else(|| FetchError::NoTimestamp {
            url: url.to_string(),
        })?;

        inner.store.set_timestamp(route_pattern, ts);
        if let Err(e) = inner
            .cache
            .set(route_pattern, specific_key, body.clone(), ttl, ts)
        {
            warn!(key = specific_key, error = %e, "write-back skipped");
        }
    }

    Ok(body)
}
