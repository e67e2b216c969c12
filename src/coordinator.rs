//! Tab coordination: leader election, heartbeating, and the upstream
//! socket.
//!
//! Exactly one tab per origin holds the upstream socket. Leadership is
//! claimed through a shared slot (`ws-leader-tab` + `ws-leader-heartbeat`)
//! with a short election window and a double-check against claim races;
//! the winner heartbeats every two seconds and steps down explicitly on
//! shutdown so peers elect without waiting for the timeout. Followers
//! relay their sends through the bus and adopt the leader's status
//! broadcasts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{
    BroadcastBus, BusMessage, Envelope, LEADER_HEARTBEAT_KEY, LEADER_TAB_KEY, SharedSlot,
    TabContext,
};
use crate::config::UpstreamUrl;
use crate::invalidation::InvalidationEngine;
use crate::observable::Observable;
use crate::store::now_ms;
use crate::subscribers::SubscriptionRegistry;
use crate::transport::UpstreamTransport;

/// A leader heartbeat older than this is a dead leader.
pub const LEADER_TIMEOUT: Duration = Duration::from_millis(5000);
/// Leader heartbeat / follower timeout-poll cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2000);
/// How long a tab listens for competing claims before taking leadership.
const ELECTION_WINDOW: Duration = Duration::from_millis(150);
/// Ceiling on the progressive reconnect delay.
const RECONNECT_CAP_MS: u64 = 20_000;

/// This tab's position in the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
    Electing,
}

/// Upstream socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Offline,
}

/// Observable coordinator state shared with the invalidation engine.
///
/// Status setters broadcast to followers only when this tab is the
/// leader; followers adopt values through the `adopt_*` variants without
/// re-emitting.
pub(crate) struct CoordinatorShared {
    pub(crate) tab: TabContext,
    pub(crate) bus: BroadcastBus,
    pub(crate) role: Observable<Role>,
    pub(crate) ws_status: Observable<WsStatus>,
    pub(crate) cache_enabled: Observable<bool>,
    pub(crate) debug_enabled: Observable<bool>,
    pub(crate) explicitly_closed: AtomicBool,
}

impl CoordinatorShared {
    pub(crate) fn new(
        tab: TabContext,
        bus: BroadcastBus,
        cache_enabled: bool,
        debug: bool,
    ) -> Self {
        Self {
            tab,
            bus,
            role: Observable::new(Role::Follower),
            ws_status: Observable::new(WsStatus::Disconnected),
            cache_enabled: Observable::new(cache_enabled),
            debug_enabled: Observable::new(debug),
            explicitly_closed: AtomicBool::new(false),
        }
    }

    fn is_leader(&self) -> bool {
        self.role.get() == Role::Leader
    }

    pub(crate) fn broadcast(&self, msg: BusMessage) {
        self.bus.send(msg);
    }

    pub(crate) fn set_ws_status(&self, status: WsStatus) {
        if self.ws_status.set(status) && self.is_leader() {
            self.bus.send(BusMessage::WsStatus { status });
        }
    }

    fn adopt_ws_status(&self, status: WsStatus) {
        self.ws_status.set(status);
    }

    pub(crate) fn set_cache_enabled(&self, enabled: bool) {
        if self.cache_enabled.set(enabled) && self.is_leader() {
            self.bus.send(BusMessage::WsCacheEnabled {
                enabled,
                explicitly_closed: self.is_explicitly_closed(),
            });
        }
    }

    fn adopt_cache_enabled(&self, enabled: bool, explicitly_closed: bool) {
        self.cache_enabled.set(enabled);
        self.explicitly_closed
            .store(explicitly_closed, Ordering::SeqCst);
    }

    pub(crate) fn set_debug(&self, enabled: bool) {
        if self.debug_enabled.set(enabled) && self.is_leader() {
            self.bus.send(BusMessage::WsDebugEnabled { enabled });
        }
    }

    fn adopt_debug(&self, enabled: bool) {
        self.debug_enabled.set(enabled);
    }

    pub(crate) fn is_explicitly_closed(&self) -> bool {
        self.explicitly_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_debug_enabled(&self) -> bool {
        self.debug_enabled.get()
    }
}

enum SocketCommand {
    Send(String),
    Close,
}

struct SocketHandle {
    tx: mpsc::UnboundedSender<SocketCommand>,
}

pub(crate) struct CoordinatorInner {
    shared: Arc<CoordinatorShared>,
    slot: Arc<SharedSlot>,
    engine: InvalidationEngine,
    subscribers: SubscriptionRegistry,
    transport: Arc<dyn UpstreamTransport>,
    url: UpstreamUrl,
    enable_cache_before_socket: bool,
    /// Has `connect()` ever been called; the ticker stays passive before.
    started: AtomicBool,
    last_heartbeat: AtomicI64,
    /// Most recent claim heard: `(tab id, local time)`.
    last_claim: parking_lot::Mutex<Option<(String, i64)>>,
    reconnect_attempts: AtomicU32,
    reconnect_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    socket: parking_lot::Mutex<Option<SocketHandle>>,
    election_lock: tokio::sync::Mutex<()>,
}

/// Election, heartbeat, socket lifecycle and relay for one tab.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    pub(crate) fn new(
        shared: Arc<CoordinatorShared>,
        slot: Arc<SharedSlot>,
        engine: InvalidationEngine,
        subscribers: SubscriptionRegistry,
        transport: Arc<dyn UpstreamTransport>,
        url: UpstreamUrl,
        enable_cache_before_socket: bool,
    ) -> Self {
        let inner = Arc::new(CoordinatorInner {
            shared,
            slot,
            engine,
            subscribers,
            transport,
            url,
            enable_cache_before_socket,
            started: AtomicBool::new(false),
            last_heartbeat: AtomicI64::new(0),
            last_claim: parking_lot::Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            reconnect_task: parking_lot::Mutex::new(None),
            socket: parking_lot::Mutex::new(None),
            election_lock: tokio::sync::Mutex::new(()),
        });
        CoordinatorInner::spawn_listener(&inner);
        CoordinatorInner::spawn_ticker(&inner);
        Self { inner }
    }

    /// Resolve this tab's role and, when it wins, open the upstream
    /// socket. Leadership settles within roughly the election window.
    pub async fn connect(&self) {
        self.inner
            .shared
            .explicitly_closed
            .store(false, Ordering::SeqCst);
        self.inner.started.store(true, Ordering::SeqCst);
        if self.inner.enable_cache_before_socket {
            self.inner.shared.set_cache_enabled(true);
        }
        self.inner.elect().await;
    }

    /// User-initiated teardown: close the socket, silence the reconnect
    /// timer, and give up leadership. No reconnect fires until a
    /// subsequent `connect()`.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner
            .shared
            .explicitly_closed
            .store(true, Ordering::SeqCst);
        inner.cancel_reconnect();
        inner.shared.set_cache_enabled(false);
        inner.shared.set_ws_status(WsStatus::Disconnected);
        inner.close_socket();
        if inner.shared.is_leader() {
            inner.shared.bus.send(BusMessage::LeaderStepdown {
                old_leader_id: inner.shared.tab.id().to_string(),
            });
            inner.slot.remove(LEADER_TAB_KEY);
            inner.slot.remove(LEADER_HEARTBEAT_KEY);
        }
        inner.shared.role.set(Role::Follower);
    }

    /// Tab teardown (the `beforeunload` analog): hand leadership off
    /// instantly so peers elect without the five-second timeout.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shared.is_leader() {
            inner.shared.bus.send(BusMessage::LeaderStepdown {
                old_leader_id: inner.shared.tab.id().to_string(),
            });
            inner.slot.remove(LEADER_TAB_KEY);
            inner.slot.remove(LEADER_HEARTBEAT_KEY);
        }
        inner.cancel_reconnect();
        inner.close_socket();
    }

    /// Write to the upstream: directly when leading, relayed over the bus
    /// when following. Without a resolved role the payload is dropped.
    pub fn send(&self, payload: serde_json::Value) {
        match self.inner.shared.role.get() {
            Role::Leader => self.inner.write_upstream(payload),
            Role::Follower => self
                .inner
                .shared
                .bus
                .send(BusMessage::WsUpstream { payload }),
            Role::Electing => {
                warn!("no leadership resolved yet, dropping outbound payload");
            }
        }
    }

    /// Poll (50 ms granularity) until the socket reports connected.
    /// Resolves `false` on timeout.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.shared.ws_status.get() == WsStatus::Connected {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Browser went offline: close the socket and stop reconnecting.
    pub fn set_offline(&self) {
        self.inner.apply_offline(true);
    }

    /// Connectivity returned: reset the backoff, reconnect when leading,
    /// and nudge consumers to refetch.
    pub fn set_online(&self) {
        self.inner.apply_online(true);
    }

    pub fn set_debug(&self, enabled: bool) {
        self.inner.shared.set_debug(enabled);
    }

    pub fn role(&self) -> Observable<Role> {
        self.inner.shared.role.clone()
    }

    pub fn ws_status(&self) -> Observable<WsStatus> {
        self.inner.shared.ws_status.clone()
    }

    pub fn cache_enabled(&self) -> Observable<bool> {
        self.inner.shared.cache_enabled.clone()
    }

    pub fn debug_enabled(&self) -> Observable<bool> {
        self.inner.shared.debug_enabled.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }
}

impl CoordinatorInner {
    fn spawn_listener(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let mut rx = inner.shared.bus.subscribe();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_bus(envelope);
            }
        });
    }

    fn spawn_ticker(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.started.load(Ordering::SeqCst) {
                    continue;
                }
                match inner.shared.role.get() {
                    Role::Leader => inner.heartbeat(),
                    Role::Follower => {
                        let stale =
                            now_ms() - inner.last_heartbeat.load(Ordering::SeqCst)
                                > leader_timeout_ms();
                        if stale && !inner.shared.is_explicitly_closed() {
                            warn!("leader heartbeat timed out, re-entering election");
                            inner.elect().await;
                        }
                    }
                    Role::Electing => {}
                }
            }
        });
    }

    fn heartbeat(self: &Arc<Self>) {
        let tab_id = self.shared.tab.id().to_string();
        self.slot.set(LEADER_TAB_KEY, tab_id.clone());
        self.slot.set(LEADER_HEARTBEAT_KEY, now_ms().to_string());
        self.shared.bus.send(BusMessage::LeaderClaim { tab_id });
    }

    fn slot_heartbeat(&self) -> Option<i64> {
        self.slot
            .get(LEADER_HEARTBEAT_KEY)
            .and_then(|v| v.parse::<i64>().ok())
    }

    /// Election. Fast path: a live leader in the shared slot makes this
    /// tab a follower immediately. Otherwise broadcast a query, listen
    /// through the election window, and double-check the slot before
    /// claiming.
    async fn elect(self: &Arc<Self>) {
        let _guard = self.election_lock.lock().await;
        if self.shared.is_leader() {
            return;
        }
        let tab_id = self.shared.tab.id().to_string();

        if let (Some(leader), Some(hb)) = (self.slot.get(LEADER_TAB_KEY), self.slot_heartbeat()) {
            if leader != tab_id && now_ms() - hb < leader_timeout_ms() {
                debug!(leader = %leader, "live leader in shared slot, following");
                self.become_follower(hb);
                self.shared.bus.send(BusMessage::LeaderQuery);
                return;
            }
        }

        self.shared.role.set(Role::Electing);
        let election_started = now_ms();
        self.shared.bus.send(BusMessage::LeaderQuery);

        // Small jitter de-synchronizes tabs electing at the same instant.
        let jitter = u64::from(rand::random::<u8>() % 25);
        tokio::time::sleep(ELECTION_WINDOW + Duration::from_millis(jitter)).await;

        let claim_heard = self
            .last_claim
            .lock()
            .as_ref()
            .is_some_and(|(claimer, at)| *claimer != tab_id && *at >= election_started);
        let slot_taken = self.slot.get(LEADER_TAB_KEY).is_some_and(|leader| {
            leader != tab_id
                && self
                    .slot_heartbeat()
                    .is_some_and(|hb| now_ms() - hb < leader_timeout_ms())
        });

        if claim_heard || slot_taken {
            debug!("another tab claimed leadership during the window, following");
            self.become_follower(now_ms());
            return;
        }

        self.become_leader();
    }

    fn become_leader(self: &Arc<Self>) {
        let tab_id = self.shared.tab.id().to_string();
        self.slot.set(LEADER_TAB_KEY, tab_id.clone());
        self.slot.set(LEADER_HEARTBEAT_KEY, now_ms().to_string());
        self.shared.role.set(Role::Leader);
        info!(tab_id = %tab_id, "elected leader");
        self.shared.bus.send(BusMessage::LeaderClaim { tab_id });
        if self.shared.tab.online().get() {
            self.open_socket();
        } else {
            self.shared.set_ws_status(WsStatus::Offline);
        }
    }

    fn become_follower(self: &Arc<Self>, heartbeat: i64) {
        self.last_heartbeat.store(heartbeat, Ordering::SeqCst);
        self.shared.role.set(Role::Follower);
        self.cancel_reconnect();
        // A follower holding a socket is a defect.
        self.close_socket();
        // The leader's next status broadcast corrects this if wrong.
        self.shared.adopt_ws_status(WsStatus::Disconnected);
    }

    fn demote(self: &Arc<Self>) {
        self.become_follower(now_ms());
    }

    fn handle_bus(self: &Arc<Self>, envelope: Envelope) {
        let tab_id = self.shared.tab.id().to_string();
        let leading = self.shared.is_leader();

        match envelope.msg {
            BusMessage::LeaderClaim { tab_id: claimer } => {
                self.last_heartbeat.store(now_ms(), Ordering::SeqCst);
                *self.last_claim.lock() = Some((claimer.clone(), now_ms()));
                if leading && claimer != tab_id {
                    // Two leaders briefly: the shared slot arbitrates.
                    if self.slot.get(LEADER_TAB_KEY).as_deref() != Some(tab_id.as_str()) {
                        warn!(winner = %claimer, "lost claim race, stepping down");
                        self.demote();
                    }
                }
            }
            BusMessage::LeaderQuery => {
                if leading {
                    self.heartbeat();
                    self.shared.bus.send(BusMessage::WsStatus {
                        status: self.shared.ws_status.get(),
                    });
                    self.shared.bus.send(BusMessage::WsCacheEnabled {
                        enabled: self.shared.cache_enabled.get(),
                        explicitly_closed: self.shared.is_explicitly_closed(),
                    });
                    self.shared.bus.send(BusMessage::WsDebugEnabled {
                        enabled: self.shared.debug_enabled.get(),
                    });
                }
            }
            BusMessage::LeaderStepdown { old_leader_id } => {
                if !leading
                    && self.started.load(Ordering::SeqCst)
                    && !self.shared.is_explicitly_closed()
                {
                    debug!(old_leader_id = %old_leader_id, "leader stepped down, electing now");
                    let inner = Arc::clone(self);
                    tokio::spawn(async move { inner.elect().await });
                }
            }
            BusMessage::WsUpstream { payload } => {
                if leading {
                    self.write_upstream(payload);
                }
            }
            BusMessage::WsStatus { status } => {
                if !leading {
                    self.shared.adopt_ws_status(status);
                }
            }
            BusMessage::WsCacheEnabled {
                enabled,
                explicitly_closed,
            } => {
                if !leading {
                    self.shared.adopt_cache_enabled(enabled, explicitly_closed);
                }
            }
            BusMessage::WsDebugEnabled { enabled } => {
                if !leading {
                    self.shared.adopt_debug(enabled);
                }
            }
            BusMessage::WsInvalidate { key, .. } => {
                if !leading {
                    self.engine.on_ws_invalidate(&key);
                }
            }
            BusMessage::WsInvalidateAll => {
                if !leading {
                    self.engine.on_ws_invalidate_all();
                }
            }
            BusMessage::WsCustom { payload } => {
                if !leading {
                    self.engine.dispatch_custom_local(&payload);
                }
            }
            BusMessage::NetworkOffline => self.apply_offline(false),
            BusMessage::NetworkOnline => self.apply_online(false),
            // Cache traffic is the cache manager's concern.
            _ => {}
        }
    }

    /// Write a relayed or local payload to the socket. JSON payloads are
    /// stringified; strings pass through untouched.
    fn write_upstream(&self, payload: serde_json::Value) {
        let text = match payload {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let sent = self
            .socket
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.tx.send(SocketCommand::Send(text)).is_ok());
        if !sent {
            warn!("no open upstream socket, dropping outbound payload");
        }
    }

    fn open_socket(self: &Arc<Self>) {
        if self.shared.is_explicitly_closed() || !self.shared.tab.online().get() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        {
            // Register the handle before the task can possibly tear it
            // down again.
            let mut socket = self.socket.lock();
            if socket.is_some() {
                return;
            }
            *socket = Some(SocketHandle { tx });
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(run_socket(weak, rx));
    }

    fn close_socket(&self) {
        if let Some(handle) = self.socket.lock().take() {
            let _ = handle.tx.send(SocketCommand::Close);
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    /// The socket is gone. Stop serving cache, and — while still the
    /// online, non-closed leader — schedule a progressively delayed
    /// reconnect.
    fn socket_down(self: &Arc<Self>, errored: bool) {
        self.socket.lock().take();
        self.shared.set_ws_status(if errored {
            WsStatus::Error
        } else {
            WsStatus::Disconnected
        });
        self.shared.set_cache_enabled(false);

        if !self.shared.is_explicitly_closed()
            && self.shared.is_leader()
            && self.shared.tab.online().get()
        {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        let delay = (5000 + u64::from(attempts / 4) * 5000).min(RECONNECT_CAP_MS);
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        info!(attempts, delay_ms = delay, "scheduling upstream reconnect");

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.shared.is_explicitly_closed()
                || !inner.shared.is_leader()
                || !inner.shared.tab.online().get()
            {
                return;
            }
            inner.open_socket();
        });

        let mut slot = self.reconnect_task.lock();
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    fn apply_offline(self: &Arc<Self>, broadcast: bool) {
        if !self.shared.tab.online().set(false) {
            return;
        }
        self.cancel_reconnect();
        self.close_socket();
        self.shared.set_ws_status(WsStatus::Offline);
        self.shared.set_cache_enabled(false);
        if broadcast {
            self.shared.bus.send(BusMessage::NetworkOffline);
        }
    }

    fn apply_online(self: &Arc<Self>, broadcast: bool) {
        if !self.shared.tab.online().set(true) {
            return;
        }
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        if self.shared.is_leader() && !self.shared.is_explicitly_closed() {
            self.open_socket();
        }
        // Consumers refetch whatever they missed while offline.
        self.subscribers.notify_global();
        if broadcast {
            self.shared.bus.send(BusMessage::NetworkOnline);
        }
    }
}

fn leader_timeout_ms() -> i64 {
    i64::try_from(LEADER_TIMEOUT.as_millis()).unwrap_or(5000)
}

/// The socket task: one per connection, leader only. Owns both halves of
/// the transport; commands arrive over the handle channel, server frames
/// feed the invalidation engine.
async fn run_socket(
    weak: std::sync::Weak<CoordinatorInner>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) {
    let (url, transport) = {
        let Some(inner) = weak.upgrade() else { return };
        inner.shared.set_ws_status(WsStatus::Connecting);
        (inner.url.resolve(), Arc::clone(&inner.transport))
    };

    let pair = match transport.connect(&url).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "upstream connection failed");
            if let Some(inner) = weak.upgrade() {
                inner.socket_down(true);
            }
            return;
        }
    };

    {
        let Some(inner) = weak.upgrade() else { return };
        // Connected, but the cache stays disabled until the first full
        // sync proves the server state is current.
        inner.shared.set_ws_status(WsStatus::Connected);
    }

    let (mut sink, mut stream) = (pair.sink, pair.stream);
    let errored;
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(SocketCommand::Send(text)) => {
                    if let Err(e) = sink.send(text).await {
                        warn!(error = %e, "upstream write failed");
                        errored = true;
                        break;
                    }
                }
                Some(SocketCommand::Close) | None => {
                    // Deliberate close: the initiator already updated state.
                    let _ = sink.close().await;
                    return;
                }
            },
            frame = stream.next() => match frame {
                Some(text) => {
                    let Some(inner) = weak.upgrade() else { return };
                    inner.engine.handle_upstream(&text).await;
                }
                None => {
                    errored = false;
                    break;
                }
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        inner.socket_down(errored);
    }
}
