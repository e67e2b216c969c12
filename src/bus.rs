//! Intra-origin broadcast bus and shared tab state.
//!
//! Models the cross-tab plumbing a browser origin provides: a named
//! pub/sub channel (`BroadcastChannel`), a synchronously readable shared
//! key/value slot used for leader election, and per-tab identity/focus
//! state. Tabs in the same origin share a [`BusHub`]; each tab holds a
//! [`BroadcastBus`] handle that never observes its own messages.
//!
//! Delivery is best-effort with per-sender ordering only. Cache and
//! coordinator traffic share one physical channel; the `type` tag on
//! [`BusMessage`] discriminates.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::coordinator::WsStatus;
use crate::observable::Observable;
use crate::store::CacheEntry;

/// Shared-slot key holding the current leader's tab id.
pub const LEADER_TAB_KEY: &str = "ws-leader-tab";
/// Shared-slot key holding the leader's last heartbeat (ms since epoch).
pub const LEADER_HEARTBEAT_KEY: &str = "ws-leader-heartbeat";

/// Per-channel buffer. Receivers that lag past this drop old messages,
/// which the bus tolerates (best-effort delivery).
const CHANNEL_CAPACITY: usize = 256;

/// Every cross-tab message type, tagged for on-wire discrimination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BusMessage {
    /// A peer wrote an entry; apply locally with latest-wins.
    CacheSet {
        bucket: String,
        key: String,
        data: serde_json::Value,
        expiry: i64,
        timestamp: i64,
    },
    /// A peer dropped a bucket; drop it locally without rebroadcast.
    CacheInvalidate { bucket: String },
    /// A freshly booted tab asking peers for their in-memory contents.
    CacheRequest { request_id: String },
    /// Reply to [`BusMessage::CacheRequest`] with a full memory dump.
    CacheResponse {
        request_id: String,
        dump: Vec<(String, HashMap<String, CacheEntry>)>,
    },
    /// Leader heartbeat / claim of the leader slot.
    LeaderClaim { tab_id: String },
    /// Ask the current leader to rebroadcast its claim and status.
    LeaderQuery,
    /// The leader is going away; elect without waiting for timeout.
    LeaderStepdown { old_leader_id: String },
    /// Leader applied an invalidation; followers notify subscribers.
    WsInvalidate { key: String, timestamp: i64 },
    /// Leader purged everything; followers drop memory and notify.
    WsInvalidateAll,
    /// Leader's socket status, adopted by followers.
    WsStatus { status: WsStatus },
    /// Follower payload to be written to the upstream socket by the leader.
    WsUpstream { payload: serde_json::Value },
    /// Non-invalidation server message fanned out to followers.
    WsCustom { payload: serde_json::Value },
    /// Leader's cache-serving flag, adopted by followers.
    WsCacheEnabled {
        enabled: bool,
        explicitly_closed: bool,
    },
    /// Runtime debug-log toggle, adopted by followers.
    WsDebugEnabled { enabled: bool },
    NetworkOnline,
    NetworkOffline,
}

/// A bus message plus its sender, so receivers can skip their own traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    #[serde(flatten)]
    pub msg: BusMessage,
}

/// Origin-wide registry of named broadcast channels.
#[derive(Default)]
pub struct BusHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl BusHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Envelope> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Attach a tab to a named channel.
    pub fn attach(&self, channel: &str, tab_id: &str) -> BroadcastBus {
        BroadcastBus {
            tab_id: tab_id.to_string(),
            tx: self.sender(channel),
        }
    }
}

/// A tab's handle on one named channel.
#[derive(Clone)]
pub struct BroadcastBus {
    tab_id: String,
    tx: broadcast::Sender<Envelope>,
}

impl BroadcastBus {
    /// Fan a message out to every other tab on the channel. Best-effort:
    /// a channel with no listeners is not an error.
    pub fn send(&self, msg: BusMessage) {
        let _ = self.tx.send(Envelope {
            from: self.tab_id.clone(),
            msg,
        });
    }

    /// Subscribe to peer traffic. The receiver filters out this tab's own
    /// messages.
    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            tab_id: self.tab_id.clone(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }
}

/// Receiving half of a tab's bus attachment.
pub struct BusReceiver {
    tab_id: String,
    rx: broadcast::Receiver<Envelope>,
}

impl BusReceiver {
    /// Next peer message, or `None` once the channel is gone. Own messages
    /// are skipped; lagged gaps are tolerated.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.from == self.tab_id => {}
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus receiver lagged, dropping messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Cross-tab shared key/value slot, readable synchronously by every tab.
///
/// Holds the leader slot (`ws-leader-tab` + `ws-leader-heartbeat`).
/// Writes are last-writer-wins; election handles the races (double-check
/// after the election wait).
#[derive(Default)]
pub struct SharedSlot {
    map: RwLock<HashMap<String, String>>,
}

impl SharedSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.map.write().insert(key.to_string(), value.into());
    }

    pub fn remove(&self, key: &str) {
        self.map.write().remove(key);
    }
}

/// Per-tab identity and host-driven state.
///
/// The crate is host-agnostic: a browser shell (or a test) drives focus
/// and connectivity through the observables.
#[derive(Clone)]
pub struct TabContext {
    id: String,
    focused: Observable<bool>,
    online: Observable<bool>,
}

impl TabContext {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            focused: Observable::new(true),
            online: Observable::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn focused(&self) -> &Observable<bool> {
        &self.focused
    }

    pub fn online(&self) -> &Observable<bool> {
        &self.online
    }
}

impl Default for TabContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_wire_format_uses_kebab_tags() {
        let envelope = Envelope {
            from: "tab-1".to_string(),
            msg: BusMessage::WsInvalidate {
                key: "/todos".to_string(),
                timestamp: 100,
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "ws-invalidate");
        assert_eq!(json["key"], "/todos");
        assert_eq!(json["from"], "tab-1");

        let parsed: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.msg, envelope.msg);
    }

    #[tokio::test]
    async fn receiver_skips_own_messages() {
        let hub = BusHub::new();
        let a = hub.attach("chan", "tab-a");
        let b = hub.attach("chan", "tab-b");

        let mut rx_a = a.subscribe();
        a.send(BusMessage::LeaderQuery);
        b.send(BusMessage::NetworkOffline);

        let got = rx_a.recv().await.unwrap();
        assert_eq!(got.from, "tab-b");
        assert_eq!(got.msg, BusMessage::NetworkOffline);
    }

    #[test]
    fn slot_is_last_writer_wins() {
        let slot = SharedSlot::new();
        slot.set(LEADER_TAB_KEY, "a");
        slot.set(LEADER_TAB_KEY, "b");
        assert_eq!(slot.get(LEADER_TAB_KEY).as_deref(), Some("b"));
        slot.remove(LEADER_TAB_KEY);
        assert!(slot.get(LEADER_TAB_KEY).is_none());
    }
}
