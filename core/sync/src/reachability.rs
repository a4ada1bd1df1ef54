//! Connectivity tracking.
//!
//! A [`ConnectivityProvider`] reports raw connectivity; the
//! [`ReachabilityMonitor`] debounces it and publishes one
//! [`ReachabilityEvent`] per settled transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::ReachabilityConfig;

/// Source of raw connectivity state.
pub trait ConnectivityProvider: Send + Sync {
    /// Current connectivity.
    fn is_connected(&self) -> bool;

    /// Subscribe to connectivity changes.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity set programmatically, by the host platform or by tests.
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(connected: bool) -> Self {
        let (tx, _rx) = watch::channel(connected);
        Self { tx }
    }

    /// Report a connectivity change. Setting the current value is a no-op.
    pub fn set_connected(&self, connected: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }
}

impl ConnectivityProvider for ManualConnectivity {
    fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Connectivity inferred from periodically opening a TCP connection.
pub struct TcpConnectivity {
    tx: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl TcpConnectivity {
    /// Start probing `addr` (host:port) every `interval`, counting an
    /// attempt that takes longer than `connect_timeout` as offline.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(addr: impl Into<String>, interval: Duration, connect_timeout: Duration) -> Self {
        let addr = addr.into();
        let (tx, _rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let state_tx = tx.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let connected = tcp_reachable(&addr, connect_timeout).await;
                let changed = state_tx.send_if_modified(|current| {
                    let changed = *current != connected;
                    *current = connected;
                    changed
                });
                if changed {
                    debug!("{} now {}", addr, if connected { "reachable" } else { "unreachable" });
                }
            }
        });

        Self { tx, task }
    }
}

impl ConnectivityProvider for TcpConnectivity {
    fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Drop for TcpConnectivity {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Try a single TCP connection to `addr`.
pub async fn tcp_reachable(addr: &str, connect_timeout: Duration) -> bool {
    matches!(timeout(connect_timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// A settled connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityEvent {
    Online,
    Offline,
}

/// Debounced view of a connectivity provider.
pub struct ReachabilityMonitor {
    provider: Arc<dyn ConnectivityProvider>,
    debounce: Duration,
    online: Arc<AtomicBool>,
    events: broadcast::Sender<ReachabilityEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReachabilityMonitor {
    pub fn new(provider: Arc<dyn ConnectivityProvider>, config: &ReachabilityConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        let online = Arc::new(AtomicBool::new(provider.is_connected()));

        Self {
            provider,
            debounce: config.debounce(),
            online,
            events,
            task: Mutex::new(None),
        }
    }

    /// Debounced connectivity.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Subscribe to settled transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ReachabilityEvent> {
        self.events.subscribe()
    }

    /// Start watching the provider. Calling it again restarts the watch.
    pub fn start(&self) {
        let mut rx = self.provider.subscribe();
        let mut reported = *rx.borrow_and_update();
        self.online.store(reported, Ordering::SeqCst);

        let debounce = self.debounce;
        let online = self.online.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    debug!("Connectivity provider gone, monitor stopping");
                    return;
                }

                // Wait for the state to hold still for a full window
                loop {
                    match timeout(debounce, rx.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return,
                        Err(_) => break,
                    }
                }

                let current = *rx.borrow_and_update();
                if current == reported {
                    debug!("Connectivity flapped back to {}", current);
                    continue;
                }

                reported = current;
                online.store(current, Ordering::SeqCst);
                let event = if current {
                    ReachabilityEvent::Online
                } else {
                    ReachabilityEvent::Offline
                };
                info!("Reachability changed: {:?}", event);
                let _ = events.send(event);
            }
        });

        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Stop watching. The last debounced state is kept.
    pub fn stop(&self) {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

impl Drop for ReachabilityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
