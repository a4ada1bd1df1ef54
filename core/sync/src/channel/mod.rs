//! Persistent bidirectional sync channel with a reconnect state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Open
//! Connecting | Open -> Reconnecting -> Open
//! Reconnecting -> Disconnected          (after max_attempts failures)
//! any -> Closed                         (disconnect)
//! ```
//!
//! Outgoing messages are never buffered: [`SyncChannel::send`] fails unless
//! the channel is open and callers keep their own copy to resend.

pub mod transport;
pub mod ws;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use offsync_common::{Error, Result};

use crate::config::ChannelConfig;
use crate::protocol::SyncMessage;
use crate::retry::BackoffPolicy;

pub use transport::{MemoryPeer, MemoryTransport, Transport, TransportConnection, TransportFrame};
pub use ws::WebSocketTransport;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    /// Explicitly disconnected; stays closed until `connect` is called.
    Closed,
}

/// Something the channel wants its owner to know.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    /// A well-formed inbound message.
    Message(SyncMessage),
    /// Attempt `attempt` failed; the next one starts after `delay`.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Reconnecting stopped after `attempts` consecutive failures.
    GaveUp { attempts: u32 },
}

/// Receiving half of the channel's event stream.
pub struct ChannelEvents {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelEvents {
    /// Next event, or `None` once the channel is dropped.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.rx.try_recv().ok()
    }
}

struct Shared {
    state: watch::Sender<ChannelState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        let changed = self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            debug!("Sync channel state: {:?}", state);
            self.emit(ChannelEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // The owner may have stopped listening
        let _ = self.events.send(event);
    }

    fn set_outgoing(&self, outgoing: Option<mpsc::UnboundedSender<String>>) {
        *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = outgoing;
    }
}

/// A persistent connection to the sync endpoint.
pub struct SyncChannel {
    transport: Arc<dyn Transport>,
    url: String,
    config: ChannelConfig,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SyncChannel {
    /// Create a disconnected channel and its event stream.
    pub fn new(
        transport: Arc<dyn Transport>,
        url: impl Into<String>,
        config: ChannelConfig,
    ) -> (Self, ChannelEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Disconnected);

        let channel = Self {
            transport,
            url: url.into(),
            config,
            shared: Arc::new(Shared {
                state,
                outgoing: Mutex::new(None),
                events,
            }),
            supervisor: Mutex::new(None),
        };

        (channel, ChannelEvents { rx })
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Whether messages can be sent.
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start connecting in the background. A no-op while already
    /// connecting, open or reconnecting.
    pub fn connect(&self) {
        let mut slot = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = slot.as_ref() {
            if !task.is_finished() {
                debug!("Sync channel already active");
                return;
            }
        }

        let supervisor = Supervisor {
            transport: self.transport.clone(),
            url: self.url.clone(),
            backoff: self.config.backoff(),
            max_attempts: self.config.max_attempts.max(1),
            connect_timeout: self.config.connect_timeout(),
            shared: self.shared.clone(),
        };
        *slot = Some(tokio::spawn(supervisor.run()));
    }

    /// Send a message.
    ///
    /// # Errors
    /// - `NotConnected` unless the channel is open
    /// - `Transport` if the connection dropped underneath
    pub fn send(&self, message: &SyncMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected(format!(
                "sync channel is {:?}",
                self.state()
            )));
        }

        let raw = message.to_json()?;
        let outgoing = self.shared.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        let sender = outgoing
            .as_ref()
            .ok_or_else(|| Error::NotConnected("sync channel has no connection".to_string()))?;
        sender
            .send(raw)
            .map_err(|_| Error::Transport("connection closed while sending".to_string()))?;

        debug!("Sent {}", message.kind());
        Ok(())
    }

    /// Cancel any pending reconnect, drop the connection and move to
    /// [`ChannelState::Closed`].
    pub fn disconnect(&self) {
        if let Some(task) = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.shared.set_outgoing(None);
        self.shared.set_state(ChannelState::Closed);
        info!("Sync channel closed");
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        if let Some(task) = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

struct Supervisor {
    transport: Arc<dyn Transport>,
    url: String,
    backoff: BackoffPolicy,
    max_attempts: u32,
    connect_timeout: Duration,
    shared: Arc<Shared>,
}

impl Supervisor {
    async fn run(self) {
        let mut failures: u32 = 0;
        self.shared.set_state(ChannelState::Connecting);

        loop {
            let opened = timeout(self.connect_timeout, self.transport.open(&self.url)).await;

            let connection = match opened {
                Ok(Ok(connection)) => Some(connection),
                Ok(Err(e)) => {
                    warn!("Sync channel connect failed: {}", e);
                    None
                }
                Err(_) => {
                    warn!(
                        "Sync channel connect timed out after {:?}",
                        self.connect_timeout
                    );
                    None
                }
            };

            if let Some(connection) = connection {
                failures = 0;
                self.shared.set_outgoing(Some(connection.outgoing));
                self.shared.set_state(ChannelState::Open);
                info!("Sync channel open to {}", self.url);

                self.read(connection.incoming).await;
                self.shared.set_outgoing(None);
            }

            failures += 1;
            if failures >= self.max_attempts {
                warn!(
                    "Sync channel giving up after {} consecutive failures",
                    failures
                );
                self.shared.set_state(ChannelState::Disconnected);
                self.shared.emit(ChannelEvent::GaveUp { attempts: failures });
                return;
            }

            let delay = self.backoff.delay_for_retry(failures);
            self.shared.set_state(ChannelState::Reconnecting);
            self.shared.emit(ChannelEvent::ReconnectScheduled {
                attempt: failures,
                delay,
            });
            debug!("Reconnect attempt {} in {:?}", failures + 1, delay);
            sleep(delay).await;
        }
    }

    /// Forward inbound messages until the connection ends.
    async fn read(&self, mut incoming: mpsc::UnboundedReceiver<TransportFrame>) {
        while let Some(frame) = incoming.recv().await {
            match frame {
                TransportFrame::Message(raw) => match SyncMessage::parse(&raw) {
                    Ok(message) => {
                        debug!("Received {}", message.kind());
                        self.shared.emit(ChannelEvent::Message(message));
                    }
                    Err(e) => warn!("Dropping malformed sync message: {}", e),
                },
                TransportFrame::Closed => {
                    info!("Sync channel closed by remote");
                    return;
                }
                TransportFrame::Error(reason) => {
                    warn!("Sync channel connection error: {}", reason);
                    return;
                }
            }
        }
        warn!("Sync channel transport ended");
    }
}
