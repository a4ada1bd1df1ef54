//! Transport abstraction underlying the sync channel.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use offsync_common::{Error, Result};

use crate::protocol::SyncMessage;

/// Something received from an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// A text message.
    Message(String),
    /// The remote closed the connection.
    Closed,
    /// The connection broke.
    Error(String),
}

/// An open bidirectional connection.
///
/// Dropping `outgoing` closes the connection.
pub struct TransportConnection {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<TransportFrame>,
}

/// Opens persistent connections to a URL.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &str;

    /// Open a connection.
    ///
    /// # Errors
    /// - `Transport` if the connection cannot be established
    async fn open(&self, url: &str) -> Result<TransportConnection>;
}

/// The far end of a [`MemoryTransport`] connection, driven by tests.
pub struct MemoryPeer {
    received: mpsc::UnboundedReceiver<String>,
    frames: mpsc::UnboundedSender<TransportFrame>,
}

impl MemoryPeer {
    /// Next message the channel sent, or `None` once it hung up.
    pub async fn recv(&mut self) -> Option<String> {
        self.received.recv().await
    }

    /// Next message the channel sent, parsed.
    pub async fn recv_message(&mut self) -> Option<SyncMessage> {
        let raw = self.recv().await?;
        SyncMessage::parse(&raw).ok()
    }

    /// Deliver a message to the channel.
    pub fn send(&self, message: &SyncMessage) -> Result<()> {
        self.send_raw(message.to_json()?)
    }

    /// Deliver an arbitrary text frame.
    pub fn send_raw(&self, raw: impl Into<String>) -> Result<()> {
        self.push(TransportFrame::Message(raw.into()))
    }

    /// Close the connection from the remote side.
    pub fn close(&self) -> Result<()> {
        self.push(TransportFrame::Closed)
    }

    /// Break the connection with an error.
    pub fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.push(TransportFrame::Error(reason.into()))
    }

    fn push(&self, frame: TransportFrame) -> Result<()> {
        self.frames
            .send(frame)
            .map_err(|_| Error::NotConnected("channel side dropped".to_string()))
    }
}

/// In-process transport for tests.
///
/// Each successful open hands a [`MemoryPeer`] to [`accept`](Self::accept).
/// Opens can be made to fail or hang to exercise the reconnect path.
#[derive(Clone)]
pub struct MemoryTransport {
    reachable: Arc<AtomicBool>,
    hang: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: Arc<Mutex<mpsc::UnboundedReceiver<MemoryPeer>>>,
}

impl MemoryTransport {
    /// Create a reachable transport.
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            reachable: Arc::new(AtomicBool::new(true)),
            hang: Arc::new(AtomicBool::new(false)),
            attempts: Arc::new(AtomicU32::new(0)),
            peers_tx,
            peers_rx: Arc::new(Mutex::new(peers_rx)),
        }
    }

    /// Make subsequent opens succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make subsequent opens never complete.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Number of open attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next successfully opened connection.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&self, url: &str) -> Result<TransportConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("{} is unreachable", url)));
        }

        let (outgoing, received) = mpsc::unbounded_channel();
        let (frames, incoming) = mpsc::unbounded_channel();

        self.peers_tx
            .send(MemoryPeer { received, frames })
            .map_err(|_| Error::Transport("memory transport shut down".to_string()))?;

        Ok(TransportConnection { outgoing, incoming })
    }
}
