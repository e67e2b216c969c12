//! Upstream transport seam.
//!
//! The coordinator owns at most one upstream connection per origin and
//! talks to it through these traits, so the socket implementation is
//! pluggable. [`WebSocketTransport`] is the production implementation
//! over tokio-tungstenite; [`MemoryTransport`] is an in-process reference
//! implementation with server-side push and failure injection, used by
//! the integration suites.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Factory for upstream connections.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<UpstreamPair>;
}

/// A connected upstream, split so the writer and reader halves can live
/// in separate tasks.
pub struct UpstreamPair {
    pub sink: Box<dyn UpstreamSink>,
    pub stream: Box<dyn UpstreamStream>,
}

/// Writer half of an upstream connection. Text frames only; the core
/// never interprets outgoing payloads.
#[async_trait]
pub trait UpstreamSink: Send {
    async fn send(&mut self, text: String) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Reader half. `None` means the connection is gone (closed or failed).
#[async_trait]
pub trait UpstreamStream: Send {
    async fn next(&mut self) -> Option<String>;
}

// ===== WebSocket implementation =====

/// Production transport over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct WebSocketSink {
    sink: futures_util::stream::SplitSink<WsStream, Message>,
}

struct WebSocketReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl UpstreamTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<UpstreamPair> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("failed to open upstream socket to '{url}'"))?;
        let (sink, stream) = ws.split();
        Ok(UpstreamPair {
            sink: Box::new(WebSocketSink { sink }),
            stream: Box::new(WebSocketReader { stream }),
        })
    }
}

#[async_trait]
impl UpstreamSink for WebSocketSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .context("failed to write to upstream socket")
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .send(Message::Close(None))
            .await
            .context("failed to close upstream socket")
    }
}

#[async_trait]
impl UpstreamStream for WebSocketReader {
    async fn next(&mut self) -> Option<String> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(text.to_string()),
                Ok(Message::Close(_)) => return None,
                Ok(other) => {
                    debug!(kind = ?other, "ignoring non-text upstream frame");
                }
                Err(_) => return None,
            }
        }
    }
}

// ===== In-memory reference implementation =====

struct ActiveConn {
    id: usize,
    to_client: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct MemoryShared {
    refuse: AtomicBool,
    opened: AtomicUsize,
    next_id: AtomicUsize,
    active: Mutex<Vec<ActiveConn>>,
    sent: Mutex<Vec<String>>,
}

/// In-process transport: connections are mpsc pairs against a
/// [`MemoryServerHandle`]. Counts every opened connection, supports
/// refusing new ones and severing live ones — enough to exercise the
/// whole coordinator state machine without a network.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<MemoryShared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The server side of this transport.
    pub fn server(&self) -> MemoryServerHandle {
        MemoryServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[async_trait]
impl UpstreamTransport for MemoryTransport {
    async fn connect(&self, _url: &str) -> Result<UpstreamPair> {
        if self.shared.refuse.load(Ordering::SeqCst) {
            bail!("memory transport is refusing connections");
        }
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (to_client, from_server) = mpsc::unbounded_channel();
        self.shared.active.lock().push(ActiveConn { id, to_client });
        Ok(UpstreamPair {
            sink: Box::new(MemorySink {
                shared: Arc::clone(&self.shared),
                id,
            }),
            stream: Box::new(MemoryReader { rx: from_server }),
        })
    }
}

struct MemorySink {
    shared: Arc<MemoryShared>,
    id: usize,
}

#[async_trait]
impl UpstreamSink for MemorySink {
    async fn send(&mut self, text: String) -> Result<()> {
        if !self
            .shared
            .active
            .lock()
            .iter()
            .any(|conn| conn.id == self.id)
        {
            bail!("memory connection is closed");
        }
        self.shared.sent.lock().push(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.active.lock().retain(|conn| conn.id != self.id);
        Ok(())
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl UpstreamStream for MemoryReader {
    async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Server-side controls for a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryServerHandle {
    shared: Arc<MemoryShared>,
}

impl MemoryServerHandle {
    /// Push a server message to every live connection.
    pub fn push(&self, text: impl Into<String>) {
        let text = text.into();
        let mut active = self.shared.active.lock();
        active.retain(|conn| conn.to_client.send(text.clone()).is_ok());
    }

    /// Sever every live connection (the client sees end-of-stream).
    pub fn close_all(&self) {
        self.shared.active.lock().clear();
    }

    /// Make subsequent connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Total connections ever opened.
    pub fn connections_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Connections whose client half is still alive.
    pub fn active_connections(&self) -> usize {
        let mut active = self.shared.active.lock();
        active.retain(|conn| !conn.to_client.is_closed());
        active.len()
    }

    /// Every payload clients have written, in arrival order.
    pub fn sent_messages(&self) -> Vec<String> {
        self.shared.sent.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_transport_round_trips() {
        let transport = MemoryTransport::new();
        let server = transport.server();

        let mut pair = transport.connect("mem://test").await.unwrap();
        assert_eq!(server.connections_opened(), 1);
        assert_eq!(server.active_connections(), 1);

        pair.sink.send("hello".to_string()).await.unwrap();
        assert_eq!(server.sent_messages(), vec!["hello".to_string()]);

        server.push("world");
        assert_eq!(pair.stream.next().await.as_deref(), Some("world"));

        server.close_all();
        assert_eq!(pair.stream.next().await, None);
    }

    #[tokio::test]
    async fn refused_connections_fail() {
        let transport = MemoryTransport::new();
        transport.server().refuse_connections(true);
        assert!(transport.connect("mem://test").await.is_err());
        assert_eq!(transport.server().connections_opened(), 0);
    }
}
