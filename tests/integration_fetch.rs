//! Fetch path integration against a mock HTTP server: coalescing,
//! cache hits, force semantics, write-back policy, and failure modes.

mod common;

use std::time::Duration;

use common::*;
use serde_json::json;
use tabsync::{FetchError, FetchOptions, RouteDef};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn todos_response(body: serde_json::Value, server_time: i64) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_json(body)
        .insert_header("x-server-time", server_time.to_string().as_str())
}

/// Two concurrent fetches on a cold cache share one HTTP request and
/// resolve to identical data.
#[tokio::test]
async fn concurrent_fetches_coalesce() {
    let http = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(todos_response(json!([1, 2, 3]), 1000).set_delay(Duration::from_millis(150)))
        .expect(1)
        .mount(&http)
        .await;

    let env = test_origin();
    let client = client(&env, base_config().with_base_url(http.uri()));

    let route = RouteDef::new("/todos");
    let (a, b) = tokio::join!(
        client.fetch(&route, None, None, FetchOptions::default()),
        client.fetch(&route, None, None, FetchOptions::default()),
    );

    assert_eq!(a.unwrap(), json!([1, 2, 3]));
    assert_eq!(b.unwrap(), json!([1, 2, 3]));

    let stats = client.fetch_stats();
    assert_eq!(stats.network_fetches, 1);
    assert_eq!(stats.coalesced, 1);
    http.verify().await;
}

/// With cache serving enabled, the second fetch is served from memory and
/// the bucket timestamp reflects the server's.
#[tokio::test]
async fn warm_cache_serves_without_network() {
    let http = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(todos_response(json!(["milk"]), 1000))
        .expect(1)
        .mount(&http)
        .await;

    let env = test_origin();
    let client = client(&env, base_config().with_base_url(http.uri()));
    client.connect().await;
    push_full_sync(&env, &client, &json!({})).await;

    let route = RouteDef::new("/todos");
    let first = client
        .fetch(&route, None, None, FetchOptions::default())
        .await
        .unwrap();
    let second = client
        .fetch(&route, None, None, FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(client.store().get_timestamp("/todos"), Some(1000));
    let stats = client.fetch_stats();
    assert_eq!(stats.network_fetches, 1);
    assert_eq!(stats.cache_hits, 1);
    http.verify().await;
}

/// Placeholder and query expansion produce the specific key the entry is
/// cached under.
#[tokio::test]
async fn parameterized_route_caches_by_composed_url() {
    let http = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/42"))
        .respond_with(todos_response(json!({"id": 42}), 500))
        .mount(&http)
        .await;

    let env = test_origin();
    let client = client(&env, base_config().with_base_url(http.uri()));
    client.connect().await;
    push_full_sync(&env, &client, &json!({})).await;

    let route = RouteDef::new("/users/{id}");
    let data = client
        .fetch(
            &route,
            Some(&params(&[("id", "42")])),
            Some(&params(&[("expand", "profile")])),
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(data, json!({"id": 42}));

    let specific = format!("{}/users/42?expand=profile", http.uri());
    assert_eq!(
        client.cache().get("/users/{id}", &specific),
        Some(json!({"id": 42}))
    );
    assert_eq!(client.store().get_timestamp("/users/{id}"), Some(500));
}

/// `force` bypasses the cache read but still writes the response back.
#[tokio::test]
async fn force_refetches_and_updates_cache() {
    let http = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(todos_response(json!("v1"), 1000))
        .up_to_n_times(1)
        .mount(&http)
        .await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(todos_response(json!("v2"), 2000))
        .mount(&http)
        .await;

    let env = test_origin();
    let client = client(&env, base_config().with_base_url(http.uri()));
    client.connect().await;
    push_full_sync(&env, &client, &json!({})).await;

    let route = RouteDef::new("/todos");
    let first = client
        .fetch(&route, None, None, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(first, json!("v1"));

    let forced = client
        .fetch(&route, None, None, FetchOptions::force())
        .await
        .unwrap();
    assert_eq!(forced, json!("v2"));

    // The forced response replaced the cached value.
    let cached = client
        .fetch(&route, None, None, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(cached, json!("v2"));
    assert_eq!(client.store().get_timestamp("/todos"), Some(2000));
}

/// Caching without a timestamp extractor is a misconfiguration and fails
/// before any request is made.
#[tokio::test]
async fn missing_extractor_fails_fast() {
    let env = test_origin();
    let mut config = base_config().with_base_url("http://127.0.0.1:9");
    config.get_timestamp = None;
    let client = client(&env, config);

    let err = client
        .fetch(&RouteDef::new("/todos"), None, None, FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FetchError>(),
        Some(FetchError::MissingTimestampExtractor)
    ));
}

/// A response the extractor cannot timestamp must not enter the cache.
#[tokio::test]
async fn response_without_timestamp_is_rejected() {
    let http = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([1])))
        .mount(&http)
        .await;

    let env = test_origin();
    let client = client(&env, base_config().with_base_url(http.uri()));
    client.connect().await;
    push_full_sync(&env, &client, &json!({})).await;

    let err = client
        .fetch(&RouteDef::new("/todos"), None, None, FetchOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no server timestamp"));
    assert_eq!(client.cache().get("/todos", &format!("{}/todos", http.uri())), None);
}

/// HTTP failures propagate unmodified and leave the cache untouched.
#[tokio::test]
async fn http_failure_propagates_without_cache_mutation() {
    let http = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&http)
        .await;

    let env = test_origin();
    let client = client(&env, base_config().with_base_url(http.uri()));

    let err = client
        .fetch(&RouteDef::new("/todos"), None, None, FetchOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("status 500"));
    assert!(client.store().get_all_timestamps().is_empty());
    assert!(client.store().get_bucket("/todos").is_none());
}

/// `cache_writes_offline` fills the cache even while serving is
/// disabled, so reads are warm once it re-enables.
#[tokio::test]
async fn offline_writes_fill_the_cache() {
    let http = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(todos_response(json!(["offline"]), 700))
        .mount(&http)
        .await;

    let env = test_origin();
    let mut config = base_config().with_base_url(http.uri());
    config.cache_writes_offline = true;
    let client = client(&env, config);

    assert!(!client.cache_enabled().get());
    client
        .fetch(&RouteDef::new("/todos"), None, None, FetchOptions::default())
        .await
        .unwrap();

    let specific = format!("{}/todos", http.uri());
    assert_eq!(client.cache().get("/todos", &specific), Some(json!(["offline"])));
    assert_eq!(client.store().get_timestamp("/todos"), Some(700));
}

/// The startup socket wait blocks only the first fetch of the client's
/// lifetime.
#[tokio::test]
async fn startup_socket_wait_is_one_shot() {
    let http = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(todos_response(json!([]), 1))
        .mount(&http)
        .await;

    let env = test_origin();
    let mut config = base_config().with_base_url(http.uri());
    config.ws.startup.wait_for_socket = true;
    config.ws.startup.socket_wait_timeout = Duration::from_millis(200);
    let client = client(&env, config);
    // Never connected: the socket can't come up, so the wait times out.

    let route = RouteDef::new("/todos");
    let started = std::time::Instant::now();
    client
        .fetch(&route, None, None, FetchOptions::default())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(180));

    let started = std::time::Instant::now();
    client
        .fetch(&route, None, None, FetchOptions::default())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(150));
}

/// The master switch off means pass-through GETs: no cache, no
/// timestamps, no socket.
#[tokio::test]
async fn disabled_client_passes_through() {
    let http = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["plain"])))
        .expect(2)
        .mount(&http)
        .await;

    let env = test_origin();
    let mut config = base_config().with_base_url(http.uri()).disabled();
    config.get_timestamp = None;
    let client = client(&env, config);
    client.connect().await;

    let route = RouteDef::new("/todos");
    for _ in 0..2 {
        let data = client
            .fetch(&route, None, None, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(data, json!(["plain"]));
    }

    assert!(client.store().get_all_timestamps().is_empty());
    assert_eq!(env.transport.server().connections_opened(), 0);
    http.verify().await;
}

/// A cache-key override stores the entry under the caller's key.
#[tokio::test]
async fn cache_key_override_is_honored() {
    let http = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(todos_response(json!([7]), 300))
        .mount(&http)
        .await;

    let env = test_origin();
    let client = client(&env, base_config().with_base_url(http.uri()));
    client.connect().await;
    push_full_sync(&env, &client, &json!({})).await;

    let opts = FetchOptions {
        cache_key: Some("todos-for-sidebar".to_string()),
        force: false,
    };
    client
        .fetch(&RouteDef::new("/todos"), None, None, opts)
        .await
        .unwrap();

    assert_eq!(
        client.cache().get("/todos", "todos-for-sidebar"),
        Some(json!([7]))
    );
}
