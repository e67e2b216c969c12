//! Coordination integration: election, heartbeat handoff, socket
//! exclusivity, relay, offline cycle, and disconnect semantics.

mod common;

use std::time::Duration;

use common::*;
use serde_json::json;
use tabsync::{Role, WsStatus};

/// A lone tab elects itself and opens the upstream socket.
#[tokio::test]
async fn lone_tab_becomes_leader() {
    let env = test_origin();
    let client = connected_client(&env).await;

    assert!(client.is_leader_tab());
    assert!(
        wait_until(|| client.ws_status().get() == WsStatus::Connected, 1000).await,
        "leader did not open the socket"
    );
    assert_eq!(env.transport.server().connections_opened(), 1);

    // Connected is not enough to serve from cache: the first full sync is.
    assert!(!client.cache_enabled().get());
}

/// The second tab finds a live leader in the shared slot and follows.
#[tokio::test]
async fn second_tab_follows() {
    let env = test_origin();
    let leader = connected_client(&env).await;
    let follower = connected_client(&env).await;

    assert!(leader.is_leader_tab());
    assert_eq!(follower.role().get(), Role::Follower);

    // Only one upstream socket exists for the whole origin.
    assert_eq!(env.transport.server().connections_opened(), 1);
    assert_eq!(env.transport.server().active_connections(), 1);

    // The leader's status sync reaches the follower.
    assert!(
        wait_until(|| follower.ws_status().get() == WsStatus::Connected, 1000).await,
        "follower did not adopt the leader's socket status"
    );
}

/// Tabs racing a cold origin converge on exactly one leader and one
/// socket.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_elections_converge() {
    let env = test_origin();
    let a = client(&env, base_config());
    let b = client(&env, base_config());

    tokio::join!(a.connect(), b.connect());

    assert!(
        wait_until(
            || {
                let roles = (a.role().get(), b.role().get());
                matches!(
                    roles,
                    (Role::Leader, Role::Follower) | (Role::Follower, Role::Leader)
                )
            },
            2000
        )
        .await,
        "election did not converge to one leader"
    );
    assert!(
        wait_until(|| env.transport.server().active_connections() == 1, 2000).await,
        "more than one live upstream socket"
    );
}

/// A dying leader steps down explicitly; a follower takes over without
/// waiting out the heartbeat timeout.
#[tokio::test]
async fn stepdown_hands_leadership_off() {
    let env = test_origin();
    let leader = connected_client(&env).await;
    let follower = connected_client(&env).await;
    assert_eq!(follower.role().get(), Role::Follower);

    drop(leader);

    assert!(
        wait_until(|| follower.role().get() == Role::Leader, 1000).await,
        "follower did not take over after stepdown"
    );
    assert!(
        wait_until(|| env.transport.server().active_connections() == 1, 1000).await,
        "new leader did not open its own socket"
    );
    assert_eq!(env.transport.server().connections_opened(), 2);
}

/// Followers relay their sends through the leader's socket.
#[tokio::test]
async fn follower_sends_are_relayed() {
    let env = test_origin();
    let leader = connected_client(&env).await;
    let follower = connected_client(&env).await;
    assert!(leader.is_leader_tab());
    wait_until(|| leader.ws_status().get() == WsStatus::Connected, 1000).await;

    follower.send(json!({"action": "subscribe", "topic": "todos"}));
    leader.send(json!("raw-string-payload"));

    assert!(
        wait_until(|| env.transport.server().sent_messages().len() == 2, 1000).await,
        "payloads did not reach the server"
    );
    let sent = env.transport.server().sent_messages();
    assert!(sent.contains(&r#"{"action":"subscribe","topic":"todos"}"#.to_string()));
    // String payloads pass through without re-quoting.
    assert!(sent.contains(&"raw-string-payload".to_string()));
}

/// Offline/online cycle: the socket closes without reconnect, then
/// reconnects with a reset backoff and fires global callbacks.
#[tokio::test]
async fn offline_cycle() {
    let env = test_origin();
    let client = connected_client(&env).await;
    wait_until(|| client.ws_status().get() == WsStatus::Connected, 1000).await;

    let (callback, refetches) = counting_callback();
    let _sub = client.subscribe_global(callback);

    client.set_online(false);
    assert_eq!(client.ws_status().get(), WsStatus::Offline);
    assert!(!client.cache_enabled().get());
    assert!(
        wait_until(|| env.transport.server().active_connections() == 0, 1000).await,
        "socket did not close on offline"
    );

    let opened_before = env.transport.server().connections_opened();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        env.transport.server().connections_opened(),
        opened_before,
        "reconnect must not run while offline"
    );

    client.set_online(true);
    assert_eq!(client.coordinator().reconnect_attempts(), 0);
    assert!(
        wait_until(|| client.ws_status().get() == WsStatus::Connected, 1000).await,
        "leader did not reconnect when back online"
    );
    assert!(
        wait_until(|| refetches.load(std::sync::atomic::Ordering::SeqCst) >= 1, 500).await,
        "global invalidation callbacks did not fire on recovery"
    );
}

/// After `disconnect()` nothing reconnects until the next `connect()`.
#[tokio::test]
async fn disconnect_silences_reconnects() {
    let env = test_origin();
    let client = connected_client(&env).await;
    wait_until(|| client.ws_status().get() == WsStatus::Connected, 1000).await;

    client.disconnect();
    assert_eq!(client.ws_status().get(), WsStatus::Disconnected);
    assert!(!client.cache_enabled().get());
    assert!(
        wait_until(|| env.transport.server().active_connections() == 0, 1000).await,
        "socket did not close on disconnect"
    );

    let opened = env.transport.server().connections_opened();
    // Even a server-side kick while disconnected must not resurrect it.
    env.transport.server().close_all();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(env.transport.server().connections_opened(), opened);

    client.connect().await;
    assert!(
        wait_until(|| client.ws_status().get() == WsStatus::Connected, 1000).await,
        "explicit reconnect failed"
    );
    assert_eq!(env.transport.server().connections_opened(), opened + 1);
}

/// A severed socket disables cache serving until the next full sync.
#[tokio::test]
async fn socket_loss_disables_cache() {
    let env = test_origin();
    let client = connected_client(&env).await;
    wait_until(|| client.ws_status().get() == WsStatus::Connected, 1000).await;
    push_full_sync(&env, &client, &json!({})).await;
    assert!(client.cache_enabled().get());

    env.transport.server().close_all();
    assert!(
        wait_until(|| !client.cache_enabled().get(), 1000).await,
        "cache stayed enabled after socket loss"
    );
    assert_eq!(client.ws_status().get(), WsStatus::Disconnected);
}

/// The runtime debug toggle syncs from leader to followers.
#[tokio::test]
async fn debug_toggle_syncs_to_followers() {
    let env = test_origin();
    let leader = connected_client(&env).await;
    let follower = connected_client(&env).await;

    leader.set_debug(true);
    assert!(
        wait_until(|| follower.debug_enabled().get(), 500).await,
        "debug flag did not reach the follower"
    );
}

/// A disabled client never coordinates or opens sockets.
#[tokio::test]
async fn disabled_client_stays_out() {
    let env = test_origin();
    let client = client(&env, base_config().disabled());
    client.connect().await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(client.role().get(), Role::Follower);
    assert_eq!(env.transport.server().connections_opened(), 0);
}
