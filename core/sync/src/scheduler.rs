//! Sync scheduling: one worker serialises drains and sync cycles, on
//! demand and on a timer.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use offsync_common::{Error, Result};

/// When the scheduler runs work without an explicit request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SyncMode {
    /// Only explicit requests.
    Manual,
    /// Drain immediately when local changes are queued.
    #[default]
    OnDemand,
    /// Incremental sync at regular intervals.
    Periodic { interval_ms: u64 },
    /// Both on-demand and periodic.
    Hybrid { interval_ms: u64 },
}

impl SyncMode {
    /// Period of the timer, if this mode has one.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval_ms } | SyncMode::Hybrid { interval_ms } => {
                Some(Duration::from_millis((*interval_ms).max(1)))
            }
            _ => None,
        }
    }

    /// Whether local changes trigger an immediate drain.
    pub fn drains_on_change(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }
}

/// Work the scheduler can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Execute every eligible queued action.
    Drain,
    /// Ask the remote for changes since the last sync point.
    Incremental,
    /// Ask the remote for the complete data set.
    Full,
    /// Stop the worker.
    Shutdown,
}

/// Summary of one unit of scheduled work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub actions_succeeded: usize,
    pub actions_failed: usize,
    pub events_applied: usize,
    pub conflicts_resolved: usize,
    pub duration: Duration,
}

type Envelope = (SyncRequest, Option<oneshot::Sender<Result<SyncReport>>>);

/// Front end for submitting work to the scheduler worker.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<Envelope>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode. The returned handle must
    /// be run for requests to be served.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Drain the action queue and wait for the result.
    pub async fn request_drain(&self) -> Result<SyncReport> {
        self.request(SyncRequest::Drain).await
    }

    /// Run an incremental sync and wait for the result.
    pub async fn request_incremental(&self) -> Result<SyncReport> {
        self.request(SyncRequest::Incremental).await
    }

    /// Run a full sync and wait for the result.
    pub async fn request_full(&self) -> Result<SyncReport> {
        self.request(SyncRequest::Full).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, Some(response_tx)))
            .await
            .map_err(|_| Error::NotConnected("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::NotConnected("Scheduler dropped the request".to_string()))?
    }

    /// Submit work without waiting. Dropped silently if the worker is
    /// saturated, since a pending request of the same kind will cover it.
    pub fn trigger(&self, request: SyncRequest) {
        if self.request_tx.try_send((request, None)).is_err() {
            debug!("Scheduler busy, {:?} request coalesced", request);
        }
    }

    /// Notify the scheduler that local changes were queued.
    pub async fn notify_change(&self) {
        let mode = self.mode.read().await.clone();
        if mode.drains_on_change() {
            self.trigger(SyncRequest::Drain);
        } else {
            debug!("Change notification ignored (mode: {:?})", mode);
        }
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the worker after the request it is currently running.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send((SyncRequest::Shutdown, None)).await;
    }
}

/// Worker half of the scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<Envelope>,
}

impl SyncSchedulerHandle {
    /// Run the worker until shutdown or until every [`SyncScheduler`] is
    /// dropped.
    ///
    /// This should be spawned in a tokio task. `sync_fn` runs one request
    /// at a time; periodic ticks run [`SyncRequest::Incremental`].
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncReport>> + Send,
    {
        let mut current_interval = self.mode.read().await.interval();
        let mut ticker = current_interval.map(periodic_ticker);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                received = self.request_rx.recv() => {
                    let Some((request, response_tx)) = received else {
                        info!("All scheduler handles dropped, stopping");
                        break;
                    };
                    if request == SyncRequest::Shutdown {
                        info!("Sync scheduler shutting down");
                        break;
                    }

                    debug!("Processing sync request: {:?}", request);
                    let result = sync_fn(request).await;
                    if let Err(e) = &result {
                        error!("{:?} failed: {}", request, e);
                    }
                    if let Some(response_tx) = response_tx {
                        let _ = response_tx.send(result);
                    }
                }

                _ = wait_for_periodic(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    match sync_fn(SyncRequest::Incremental).await {
                        Ok(report) => info!(
                            "Periodic sync completed: {} events applied, {} conflicts",
                            report.events_applied, report.conflicts_resolved
                        ),
                        Err(e) => error!("Periodic sync failed: {}", e),
                    }
                }
            }

            // Recreate the timer if the mode changed
            let expected = self.mode.read().await.interval();
            if expected != current_interval {
                current_interval = expected;
                ticker = current_interval.map(periodic_ticker);
            }
        }
    }
}

fn periodic_ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();
    ticker
}

async fn wait_for_periodic(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
