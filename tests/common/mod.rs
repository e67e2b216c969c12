//! Shared fixtures for the integration suites: a per-test origin over a
//! temp directory, clients wired to an in-memory upstream transport, and
//! small wait/counter helpers.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tabsync::{
    CacheClient, ClientConfig, DbConfig, FetchedResponse, MemoryTransport, Origin, OriginConfig,
    SubscriberCallback, TimestampExtractor,
};

/// A fresh origin backed by a temp directory plus a shared in-memory
/// upstream. Keep the struct alive for the duration of the test: the
/// temp directory dies with it.
pub struct TestOrigin {
    pub origin: Arc<Origin>,
    pub transport: MemoryTransport,
    _dir: tempfile::TempDir,
}

pub fn test_origin() -> TestOrigin {
    let dir = tempfile::tempdir().unwrap();
    let config = OriginConfig {
        db: DbConfig {
            path: dir.path().to_path_buf(),
            ..DbConfig::default()
        },
    };
    TestOrigin {
        origin: Origin::open(config).unwrap(),
        transport: MemoryTransport::new(),
        _dir: dir,
    }
}

/// Timestamp extractor reading the `x-server-time` response header.
pub fn header_timestamp() -> TimestampExtractor {
    Arc::new(|response: &FetchedResponse| {
        response
            .headers
            .get("x-server-time")?
            .to_str()
            .ok()?
            .parse()
            .ok()
    })
}

/// Baseline client configuration: in-memory upstream, header timestamps,
/// fast background polling so focus tests stay quick.
pub fn base_config() -> ClientConfig {
    let mut config = ClientConfig::new()
        .with_ws_url("mem://upstream")
        .with_get_timestamp(header_timestamp());
    config.ws.background_poll_interval = Duration::from_millis(50);
    config.ws.default_background_delay = Duration::from_millis(150);
    config
}

/// Build a client on this origin's bus, store and upstream.
pub fn client(env: &TestOrigin, config: ClientConfig) -> CacheClient {
    CacheClient::with_transport(&env.origin, config, Arc::new(env.transport.clone())).unwrap()
}

/// Build a client with the baseline config and connect it. When the
/// client wins the election, this also waits for its socket to come up
/// so server pushes cannot race the connection.
pub async fn connected_client(env: &TestOrigin) -> CacheClient {
    let client = client(env, base_config());
    client.connect().await;
    if client.is_leader_tab() {
        assert!(
            wait_until(|| env.transport.server().active_connections() >= 1, 1000).await,
            "leader socket did not come up"
        );
    }
    client
}

/// Push a raw upstream payload once a live connection exists to carry it.
pub async fn push_upstream(env: &TestOrigin, text: impl Into<String>) {
    assert!(
        wait_until(|| env.transport.server().active_connections() >= 1, 1000).await,
        "no upstream connection to push to"
    );
    env.transport.server().push(text);
}

/// Push a full sync from the fake server and wait for the leader to
/// apply it (every full sync re-enables cache serving).
pub async fn push_full_sync(env: &TestOrigin, client: &CacheClient, data: &serde_json::Value) {
    push_upstream(env, serde_json::json!({"type": "invalidate", "data": data}).to_string()).await;
    assert!(
        wait_until(|| client.cache_enabled().get(), 1000).await,
        "full sync was not applied in time"
    );
    // Give the engine a turn to finish broadcasts.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Poll `condition` every 10 ms until it holds or `timeout_ms` elapses.
pub async fn wait_until<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let started = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Unique key per test run to avoid collisions inside one origin.
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// A subscriber callback that counts its invocations.
pub fn counting_callback() -> (SubscriberCallback, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let cloned = Arc::clone(&count);
    (
        Arc::new(move || {
            cloned.fetch_add(1, Ordering::SeqCst);
        }),
        count,
    )
}

pub fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}
