//! Sync orchestration.
//!
//! The [`SyncOrchestrator`] wires the cache, the action queue, the
//! reachability monitor, the sync channel and the conflict resolver
//! together:
//!
//! - going online connects the channel and drains the action queue
//! - an open channel asks for changes since the last sync point and
//!   falls back to a full sync when the remote cannot serve them
//! - inbound events are applied to entity records in the cache, through
//!   the conflict resolver when they diverge from unacknowledged local
//!   state
//! - local changes are batched out over the channel, highest priority first

use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use offsync_common::{ClockSource, EntityKey, Error, Result};
use offsync_storage::{load_json, save_json, KeyValueStore};

use crate::cache::{CacheMeta, CacheStats, CacheStore};
use crate::channel::{ChannelEvent, ChannelEvents, ChannelState, SyncChannel, Transport};
use crate::config::SyncConfig;
use crate::conflict::{
    ConflictResolver, EntityVersion, Resolution, ResolutionStrategy, SyncConflict, WinningVersion,
};
use crate::protocol::{EventType, SyncEvent, SyncMessage};
use crate::queue::{ActionQueue, ActionType, FailureOutcome, OfflineAction};
use crate::reachability::{ConnectivityProvider, ReachabilityEvent, ReachabilityMonitor};
use crate::remote::{RemoteApi, SyncResponse};
use crate::scheduler::{SyncMode, SyncReport, SyncRequest, SyncScheduler};
use crate::state::{EntityRecord, EntityState, EventOutcome, ProcessedEvent, RecentEvents, SyncState};

/// Storage key of the persisted [`SyncState`].
pub const STATE_KEY: &str = "sync:state";

/// Idle wait of the retry timer when nothing is backing off.
const RETRY_IDLE: Duration = Duration::from_secs(3600);

/// Collaborators the orchestrator runs against.
#[derive(Clone)]
pub struct SyncBackends {
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn ClockSource>,
    pub transport: Arc<dyn Transport>,
    pub channel_url: String,
    pub connectivity: Arc<dyn ConnectivityProvider>,
    pub remote: Arc<dyn RemoteApi>,
}

/// Something subscribers may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    /// An entity record changed because of remote data.
    DataSynced {
        entity: EntityKey,
        data: Value,
        operation: EventType,
    },
    ConflictResolved {
        entity: EntityKey,
        winning_version: WinningVersion,
        reason: String,
    },
    ActionSucceeded {
        action_id: String,
        response: Value,
    },
    ActionFailed {
        action_id: String,
        error: String,
        will_retry: bool,
    },
    /// The remote announced or served a sync point.
    SyncCompleted { timestamp: u64, version: u64 },
    ReachabilityChanged { online: bool },
    ChannelStateChanged(ChannelState),
    SyncError { message: String },
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub online: bool,
    pub channel_state: ChannelState,
    pub pending_actions: usize,
    pub in_flight_actions: usize,
    pub failed_actions: usize,
    pub pending_changes: usize,
    pub last_sync_timestamp: u64,
    pub sync_version: u64,
    pub cache: CacheStats,
    pub running: bool,
}

struct Inner {
    config: SyncConfig,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn ClockSource>,
    remote: Arc<dyn RemoteApi>,
    cache: Arc<CacheStore>,
    queue: Arc<ActionQueue>,
    channel: SyncChannel,
    channel_events: Mutex<ChannelEvents>,
    reachability: ReachabilityMonitor,
    resolver: RwLock<ConflictResolver>,
    state: Mutex<SyncState>,
    /// Pending changes already written to the current connection.
    sent: StdMutex<HashSet<String>>,
    recent: StdMutex<RecentEvents>,
    notifications: broadcast::Sender<SyncNotification>,
    scheduler: StdMutex<Option<SyncScheduler>>,
    /// Mode for the next start.
    sync_mode: StdMutex<SyncMode>,
    drain_lock: Mutex<()>,
    apply_lock: Mutex<()>,
}

struct Tasks {
    worker: JoinHandle<()>,
    channel_loop: JoinHandle<()>,
    reachability_loop: JoinHandle<()>,
    retry_timer: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    sweeper_stop: watch::Sender<bool>,
}

/// Offline-first sync engine.
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
    tasks: Mutex<Option<Tasks>>,
}

impl SyncOrchestrator {
    /// Build the engine, restoring the cache, the action queue and the sync
    /// state from durable storage.
    ///
    /// A sync state that is unreadable or belongs to another device is
    /// discarded and sync restarts from scratch.
    ///
    /// # Errors
    /// - `InvalidInput` if the configuration is invalid
    pub async fn new(config: SyncConfig, backends: SyncBackends) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(CacheStore::new(
            backends.store.clone(),
            backends.clock.clone(),
            config.cache.clone(),
        ));
        let restored = cache.hydrate().await;
        debug!("Restored {} cache entries", restored);

        let queue = Arc::new(
            ActionQueue::load(
                backends.store.clone(),
                backends.clock.clone(),
                config.queue.clone(),
            )
            .await,
        );

        let state = match load_json::<SyncState, _>(backends.store.as_ref(), STATE_KEY).await {
            Ok(Some(state)) if state.device_id == config.device_id => state,
            Ok(Some(state)) => {
                warn!(
                    "Stored sync state belongs to device {}, starting fresh",
                    state.device_id
                );
                SyncState::new(&config.device_id, &config.user_id)
            }
            Ok(None) => SyncState::new(&config.device_id, &config.user_id),
            Err(e) => {
                warn!("Sync state unreadable, starting fresh: {}", e);
                SyncState::new(&config.device_id, &config.user_id)
            }
        };

        let (channel, channel_events) = SyncChannel::new(
            backends.transport.clone(),
            backends.channel_url.clone(),
            config.channel.clone(),
        );
        let reachability = ReachabilityMonitor::new(backends.connectivity.clone(), &config.reachability);
        let (notifications, _) = broadcast::channel(256);

        info!(
            "Sync orchestrator ready for device {} (version {}, {} pending changes)",
            config.device_id,
            state.sync_version,
            state.pending_changes().len()
        );

        let inner = Inner {
            resolver: RwLock::new(ConflictResolver::new(config.orchestrator.collision_policy)),
            recent: StdMutex::new(RecentEvents::new(config.orchestrator.recent_events_capacity)),
            sync_mode: StdMutex::new(config.orchestrator.sync_mode.clone()),
            config,
            store: backends.store,
            clock: backends.clock,
            remote: backends.remote,
            cache,
            queue,
            channel,
            channel_events: Mutex::new(channel_events),
            reachability,
            state: Mutex::new(state),
            sent: StdMutex::new(HashSet::new()),
            notifications,
            scheduler: StdMutex::new(None),
            drain_lock: Mutex::new(()),
            apply_lock: Mutex::new(()),
        };

        Ok(Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(None),
        })
    }

    /// Start background work: the scheduler worker, reachability tracking,
    /// the channel, retry timers and cache sweeping.
    ///
    /// # Errors
    /// - `AlreadyExists` if already running
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Err(Error::AlreadyExists("Sync orchestrator already running".to_string()));
        }

        let mode = self.inner.mode_slot().clone();
        let (scheduler, handle) = SyncScheduler::new(mode);
        *self.inner.scheduler_slot() = Some(scheduler.clone());

        let inner = self.inner.clone();
        let worker = tokio::spawn(handle.run(move |request| {
            let inner = inner.clone();
            async move { inner.handle_request(request).await }
        }));

        let inner = self.inner.clone();
        let channel_loop = tokio::spawn(async move {
            let mut events = inner.channel_events.lock().await;
            while let Some(event) = events.recv().await {
                inner.handle_channel_event(event).await;
            }
        });

        let mut transitions = self.inner.reachability.subscribe();
        self.inner.reachability.start();
        let inner = self.inner.clone();
        let reachability_scheduler = scheduler.clone();
        let reachability_loop = tokio::spawn(async move {
            loop {
                match transitions.recv().await {
                    Ok(ReachabilityEvent::Online) => {
                        inner.notify(SyncNotification::ReachabilityChanged { online: true });
                        inner.channel.connect();
                        reachability_scheduler.trigger(SyncRequest::Drain);
                    }
                    Ok(ReachabilityEvent::Offline) => {
                        inner.notify(SyncNotification::ReachabilityChanged { online: false });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("Missed {} reachability events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        let inner = self.inner.clone();
        let retry_scheduler = scheduler.clone();
        let retry_timer = tokio::spawn(async move {
            loop {
                let wait = match inner.queue.next_ready_at().await {
                    Some(at) => Duration::from_millis(at.saturating_sub(inner.clock.now_ms())),
                    None => RETRY_IDLE,
                };
                tokio::select! {
                    _ = inner.queue.changed() => {}
                    _ = sleep(wait) => {
                        if inner.reachability.is_online() {
                            retry_scheduler.trigger(SyncRequest::Drain);
                        }
                    }
                }
            }
        });

        let (sweeper_stop, sweeper_rx) = watch::channel(false);
        let sweeper = self.inner.cache.clone().spawn_sweeper(sweeper_rx);

        if self.inner.reachability.is_online() {
            self.inner.channel.connect();
            scheduler.trigger(SyncRequest::Drain);
        }

        *tasks = Some(Tasks {
            worker,
            channel_loop,
            reachability_loop,
            retry_timer,
            sweeper,
            sweeper_stop,
        });
        info!("Sync orchestrator started");
        Ok(())
    }

    /// Stop background work and close the channel. The request the worker
    /// is running finishes first. Can be started again afterwards.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };

        let scheduler = self.inner.scheduler_slot().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        if let Err(e) = tasks.worker.await {
            warn!("Scheduler worker ended abnormally: {}", e);
        }

        tasks.channel_loop.abort();
        tasks.reachability_loop.abort();
        tasks.retry_timer.abort();
        let _ = tasks.sweeper_stop.send(true);
        tasks.sweeper.abort();

        self.inner.channel.disconnect();
        self.inner.reachability.stop();

        let state = self.inner.state.lock().await;
        self.inner.persist_state(&state).await;
        info!("Sync orchestrator stopped");
    }

    /// Whether background work is running.
    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Change when the scheduler runs work on its own. Kept across
    /// restarts.
    pub async fn set_sync_mode(&self, mode: SyncMode) {
        *self.inner.mode_slot() = mode.clone();
        let scheduler = self.inner.scheduler_slot().clone();
        if let Some(scheduler) = scheduler {
            scheduler.set_mode(mode).await;
        }
    }

    /// Current sync mode.
    pub async fn sync_mode(&self) -> SyncMode {
        let scheduler = self.inner.scheduler_slot().clone();
        match scheduler {
            Some(scheduler) => scheduler.get_mode().await,
            None => self.inner.mode_slot().clone(),
        }
    }

    /// Execute every eligible queued action against the remote.
    ///
    /// Does nothing while offline. While running, the request is queued
    /// behind the worker's current one.
    pub async fn drain(&self) -> Result<SyncReport> {
        let scheduler = self.inner.scheduler_slot().clone();
        match scheduler {
            Some(scheduler) => scheduler.request_drain().await,
            None => self.inner.drain().await,
        }
    }

    /// Pull remote changes: over the channel if it is open, otherwise over
    /// the remote API with a full-sync fallback.
    ///
    /// # Errors
    /// - `NotConnected` while offline
    /// - transient remote errors, which are also published as
    ///   [`SyncNotification::SyncError`]
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let scheduler = self.inner.scheduler_slot().clone();
        match scheduler {
            Some(scheduler) => scheduler.request_incremental().await,
            None => self.inner.sync_now().await,
        }
    }

    /// Replace local state with the complete remote data set.
    pub async fn full_sync(&self) -> Result<SyncReport> {
        let scheduler = self.inner.scheduler_slot().clone();
        match scheduler {
            Some(scheduler) => scheduler.request_full().await,
            None => self.inner.full_sync().await,
        }
    }

    /// Apply remote events received through some other path.
    pub async fn apply_events(&self, events: Vec<SyncEvent>) -> Result<SyncReport> {
        self.inner.apply_events(events).await
    }

    /// Build an event for a local change, stamped with this device's
    /// identity and the current time.
    pub fn local_event(&self, event_type: EventType, entity: &EntityKey, data: Value) -> SyncEvent {
        SyncEvent::new(
            event_type,
            entity,
            data,
            self.inner.clock.now_ms(),
            self.inner.config.device_id.clone(),
            self.inner.config.user_id.clone(),
        )
    }

    /// Record a local change to an entity and queue it for transmission.
    ///
    /// The entity record becomes pending until the remote echoes the change
    /// back. `strategy` overrides the configured default for conflicts on
    /// this entity.
    pub async fn record_local_change(
        &self,
        event: SyncEvent,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<()> {
        let key = event.entity_key()?;
        let strategy = strategy.unwrap_or_else(|| self.inner.config.orchestrator.default_strategy.clone());

        let previous = self.inner.load_entity(&key).await;
        let record = EntityRecord::pending_local(&event, previous.as_ref(), strategy);
        self.inner.store_entity(&key, &record).await;

        {
            let mut state = self.inner.state.lock().await;
            state.add_pending_change(event);
            self.inner.persist_state(&state).await;
        }

        if self.inner.channel.is_open() {
            if let Err(e) = self.inner.flush_outgoing().await {
                warn!("Local change for {} kept for later: {}", key, e);
            }
        }
        Ok(())
    }

    /// Queue an action for the remote API.
    ///
    /// If the action targets an entity, its record is updated optimistically
    /// and stays pending until the action succeeds. Actions the queue drops
    /// to make room are reported as failed.
    ///
    /// # Errors
    /// - `QueueFull` if the queue has no room for this action
    pub async fn enqueue_action(&self, action: OfflineAction) -> Result<String> {
        let optimistic = action.entity.clone().map(|entity| {
            let strategy = action
                .conflict_resolution
                .clone()
                .unwrap_or_else(|| self.inner.config.orchestrator.default_strategy.clone());
            let event = self.local_event(event_type_for(action.action_type), &entity, action.payload.clone());
            (entity, event, strategy)
        });

        let enqueued = self.inner.queue.enqueue_detailed(action).await?;

        if let Some((entity, event, strategy)) = optimistic {
            let previous = self.inner.load_entity(&entity).await;
            let record = EntityRecord::pending_local(&event, previous.as_ref(), strategy);
            self.inner.store_entity(&entity, &record).await;
        }
        self.inner.settle_dropped(enqueued.dropped).await;

        if self.inner.reachability.is_online() {
            let scheduler = self.inner.scheduler_slot().clone();
            if let Some(scheduler) = scheduler {
                scheduler.notify_change().await;
            }
        }
        Ok(enqueued.id)
    }

    /// Send pending local changes over the channel.
    ///
    /// Returns the number of events sent. Changes stay pending until the
    /// remote echoes them back and are sent again on the next connection.
    /// Stops at the first failed send.
    pub async fn flush_outgoing(&self) -> Result<usize> {
        self.inner.flush_outgoing().await
    }

    /// Register a named conflict handler for [`ResolutionStrategy::Custom`].
    ///
    /// # Errors
    /// - `AlreadyExists` if the name is taken
    pub fn register_resolver<F>(&self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&SyncConflict) -> Result<Resolution> + Send + Sync + 'static,
    {
        self.inner
            .resolver
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(name, handler)
    }

    /// Subscribe to notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.inner.notifications.subscribe()
    }

    /// Current status.
    pub async fn status(&self) -> SyncStatus {
        let (pending_changes, last_sync_timestamp, sync_version) = {
            let state = self.inner.state.lock().await;
            (
                state.pending_changes().len(),
                state.last_sync_timestamp,
                state.sync_version,
            )
        };
        let in_flight_actions = self.inner.queue.in_flight_count().await;

        SyncStatus {
            online: self.inner.reachability.is_online(),
            channel_state: self.inner.channel.state(),
            pending_actions: self.inner.queue.len().await.saturating_sub(in_flight_actions),
            in_flight_actions,
            failed_actions: self.inner.queue.failed().await.len(),
            pending_changes,
            last_sync_timestamp,
            sync_version,
            cache: self.inner.cache.stats().await,
            running: self.is_running().await,
        }
    }

    /// Snapshot of the sync state.
    pub async fn sync_state(&self) -> SyncState {
        self.inner.state.lock().await.clone()
    }

    /// Local record of an entity.
    pub async fn entity(&self, key: &EntityKey) -> Option<EntityRecord> {
        self.inner.load_entity(key).await
    }

    /// Recently processed inbound events, oldest first.
    pub fn recent_events(&self) -> Vec<ProcessedEvent> {
        self.inner.recent().iter().cloned().collect()
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.cache
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.inner.queue
    }

    pub fn channel(&self) -> &SyncChannel {
        &self.inner.channel
    }
}

impl Inner {
    fn notify(&self, notification: SyncNotification) {
        // Nobody listening is fine
        let _ = self.notifications.send(notification);
    }

    fn scheduler_slot(&self) -> std::sync::MutexGuard<'_, Option<SyncScheduler>> {
        self.scheduler.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mode_slot(&self) -> std::sync::MutexGuard<'_, SyncMode> {
        self.sync_mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sent(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn recent(&self) -> std::sync::MutexGuard<'_, RecentEvents> {
        self.recent.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist_state(&self, state: &SyncState) {
        if let Err(e) = save_json(self.store.as_ref(), STATE_KEY, state).await {
            warn!("Failed to persist sync state, continuing in memory: {}", e);
        }
    }

    async fn load_entity(&self, key: &EntityKey) -> Option<EntityRecord> {
        let raw = self.cache.get(&key.cache_key()).await?;
        match serde_json::from_value(raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Discarding unreadable record for {}: {}", key, e);
                None
            }
        }
    }

    async fn store_entity(&self, key: &EntityKey, record: &EntityRecord) {
        match serde_json::to_value(record) {
            Ok(value) => {
                let meta = CacheMeta::with_ttl(self.config.orchestrator.entity_ttl());
                self.cache.put(&key.cache_key(), value, meta).await;
            }
            Err(e) => error!("Failed to encode record for {}: {}", key, e),
        }
    }

    async fn handle_request(&self, request: SyncRequest) -> Result<SyncReport> {
        match request {
            SyncRequest::Drain => self.drain().await,
            SyncRequest::Incremental => self.sync_now().await,
            SyncRequest::Full => self.full_sync().await,
            SyncRequest::Shutdown => Ok(SyncReport::default()),
        }
    }

    async fn drain(&self) -> Result<SyncReport> {
        let _guard = self.drain_lock.lock().await;
        let started = Instant::now();
        let mut report = SyncReport::default();

        if !self.reachability.is_online() {
            debug!("Offline, not draining");
            return Ok(report);
        }

        loop {
            let batch = self
                .queue
                .dequeue_batch(self.config.orchestrator.drain_batch_size)
                .await;
            if batch.is_empty() {
                break;
            }

            for action in batch {
                if !self.reachability.is_online() {
                    if let Err(e) = self.queue.release(&action.id).await {
                        warn!("Failed to release action {}: {}", action.id, e);
                    }
                    continue;
                }

                match self.remote.execute(&action).await {
                    Ok(response) => {
                        if let Err(e) = self.queue.complete(&action.id).await {
                            warn!("Completed action {} vanished from the queue: {}", action.id, e);
                        }
                        if let Some(entity) = &action.entity {
                            self.settle_entity(entity, EntityState::Confirmed).await;
                        }
                        report.actions_succeeded += 1;
                        self.notify(SyncNotification::ActionSucceeded {
                            action_id: action.id.clone(),
                            response,
                        });
                    }
                    Err(e) => {
                        report.actions_failed += 1;
                        let will_retry = match self.queue.fail(&action.id, &e).await {
                            Ok(FailureOutcome::Retrying { .. }) => true,
                            Ok(FailureOutcome::Archived) => {
                                if let Some(entity) = &action.entity {
                                    self.settle_entity(entity, EntityState::Failed).await;
                                }
                                false
                            }
                            Err(qe) => {
                                warn!("Failed action {} vanished from the queue: {}", action.id, qe);
                                false
                            }
                        };
                        self.notify(SyncNotification::ActionFailed {
                            action_id: action.id.clone(),
                            error: e.to_string(),
                            will_retry,
                        });
                    }
                }
            }

            if !self.reachability.is_online() {
                info!("Went offline, drain interrupted");
                break;
            }
        }

        report.duration = started.elapsed();
        if report.actions_succeeded + report.actions_failed > 0 {
            info!(
                "Drain completed in {:?}: {} succeeded, {} failed",
                report.duration, report.actions_succeeded, report.actions_failed
            );
        }
        Ok(report)
    }

    /// Settle a pending entity record after its action finished.
    async fn settle_entity(&self, key: &EntityKey, outcome: EntityState) {
        let Some(mut record) = self.load_entity(key).await else {
            return;
        };
        if record.state != EntityState::Pending {
            return;
        }
        match outcome {
            EntityState::Confirmed => record.mark_confirmed(),
            EntityState::Failed => record.mark_failed(),
            EntityState::Pending => return,
        }
        self.store_entity(key, &record).await;
    }

    /// Fail the records of actions evicted from a full queue.
    async fn settle_dropped(&self, dropped: Vec<OfflineAction>) {
        for action in dropped {
            if let Some(entity) = &action.entity {
                // A later action for the same entity still owns the record
                if !self.queue.targets_entity(entity).await {
                    self.settle_entity(entity, EntityState::Failed).await;
                }
            }
            self.notify(SyncNotification::ActionFailed {
                action_id: action.id,
                error: "dropped from a full action queue".to_string(),
                will_retry: false,
            });
        }
    }

    async fn sync_now(&self) -> Result<SyncReport> {
        if self.channel.is_open() {
            let (since, version) = self.sync_point().await;
            self.channel
                .send(&SyncMessage::IncrementalSyncRequest { since, version })?;
            if let Err(e) = self.flush_outgoing().await {
                warn!("Outgoing changes kept for later: {}", e);
            }
            return Ok(SyncReport::default());
        }

        if !self.reachability.is_online() {
            return Err(Error::NotConnected("device is offline".to_string()));
        }

        let (since, version) = self.sync_point().await;
        match self.remote.incremental_sync(since, version).await {
            Ok(response) => self.apply_response(response).await,
            Err(e) if e.is_transient() => {
                self.notify(SyncNotification::SyncError {
                    message: e.to_string(),
                });
                Err(e)
            }
            Err(e) => {
                warn!("Incremental sync rejected, falling back to full sync: {}", e);
                self.full_sync().await
            }
        }
    }

    async fn full_sync(&self) -> Result<SyncReport> {
        if self.channel.is_open() {
            self.channel.send(&SyncMessage::FullSyncRequest)?;
            return Ok(SyncReport::default());
        }

        match self.remote.full_sync().await {
            Ok(response) => self.apply_response(response).await,
            Err(e) => {
                self.notify(SyncNotification::SyncError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn sync_point(&self) -> (u64, u64) {
        let state = self.state.lock().await;
        (state.last_sync_timestamp, state.sync_version)
    }

    async fn apply_response(&self, response: SyncResponse) -> Result<SyncReport> {
        let report = self.apply_events(response.events).await?;
        self.adopt_sync_point(response.timestamp, response.version).await;
        Ok(report)
    }

    async fn adopt_sync_point(&self, timestamp: u64, version: u64) {
        let (timestamp, version) = {
            let mut state = self.state.lock().await;
            state.adopt_server_version(timestamp, version);
            self.persist_state(&state).await;
            (state.last_sync_timestamp, state.sync_version)
        };
        self.notify(SyncNotification::SyncCompleted { timestamp, version });
    }

    async fn apply_events(&self, events: Vec<SyncEvent>) -> Result<SyncReport> {
        let _guard = self.apply_lock.lock().await;
        let started = Instant::now();
        let mut report = SyncReport::default();
        let mut newest: Option<u64> = None;
        let mut requeued = false;

        for event in events {
            if self.recent().contains(&event.id) {
                debug!("Skipping already processed event {}", event.id);
                continue;
            }
            let key = match event.entity_key() {
                Ok(key) => key,
                Err(e) => {
                    warn!("Dropping event {} with invalid entity: {}", event.id, e);
                    continue;
                }
            };

            let outcome = self.apply_event(&event, &key).await;
            match outcome {
                EventOutcome::Applied => report.events_applied += 1,
                EventOutcome::Resolved(winner) => {
                    report.events_applied += 1;
                    report.conflicts_resolved += 1;
                    requeued |= winner != WinningVersion::Remote;
                }
                EventOutcome::Confirmed => {}
            }

            self.recent().record(&event, outcome);
            newest = Some(newest.map_or(event.timestamp, |n| n.max(event.timestamp)));
        }

        if let Some(newest) = newest {
            let mut state = self.state.lock().await;
            state.record_applied_batch(newest);
            self.persist_state(&state).await;
        }

        if requeued && self.channel.is_open() {
            if let Err(e) = self.flush_outgoing().await {
                warn!("Resolved changes kept for later: {}", e);
            }
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    async fn apply_event(&self, event: &SyncEvent, key: &EntityKey) -> EventOutcome {
        let local = self.load_entity(key).await;

        if event.device_id == self.config.device_id {
            match local {
                Some(mut record) if record.state != EntityState::Confirmed => {
                    if record.data == event.data {
                        record.mark_confirmed();
                        self.store_entity(key, &record).await;
                        debug!("Remote confirmed local change to {}", key);
                    }
                }
                Some(_) => {}
                None => self.store_entity(key, &EntityRecord::confirmed(event)).await,
            }
            self.acknowledge_change(&event.id).await;
            return EventOutcome::Confirmed;
        }

        match local {
            Some(record) if record.diverges_from(event) => {
                let winner = self.resolve_divergence(event, key, &record).await;
                EventOutcome::Resolved(winner)
            }
            _ => {
                self.store_entity(key, &EntityRecord::confirmed(event)).await;
                self.notify(SyncNotification::DataSynced {
                    entity: key.clone(),
                    data: event.data.clone(),
                    operation: event.event_type,
                });
                EventOutcome::Applied
            }
        }
    }

    async fn resolve_divergence(
        &self,
        event: &SyncEvent,
        key: &EntityKey,
        local: &EntityRecord,
    ) -> WinningVersion {
        let remote_version = EntityVersion::new(event.data.clone(), event.timestamp, event.device_id.clone())
            .with_operation(event.event_type);
        let conflict = SyncConflict::new(
            key,
            local.as_version(),
            remote_version,
            local.base_version(),
            local.strategy.clone(),
        );

        let resolution = self
            .resolver
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(&conflict);
        info!(
            "Conflict on {} resolved: {} ({})",
            key, resolution.winning_version, resolution.reason
        );

        let operation = match resolution.winning_version {
            WinningVersion::Remote => {
                let mut record = EntityRecord::confirmed(event);
                record.data = resolution.resolved_data.clone();
                record.operation = resolution.operation.unwrap_or(event.event_type);
                record.strategy = local.strategy.clone();
                record.mark_confirmed();
                self.store_entity(key, &record).await;

                let mut state = self.state.lock().await;
                let superseded: HashSet<String> = state
                    .pending_changes()
                    .iter()
                    .filter(|e| e.entity_type == key.entity_type && e.entity_id == key.entity_id)
                    .map(|e| e.id.clone())
                    .collect();
                state.remove_pending_changes(&superseded);
                self.persist_state(&state).await;
                record.operation
            }
            WinningVersion::Local | WinningVersion::Merged => {
                let operation = resolution.operation.unwrap_or(local.operation);
                let outgoing = SyncEvent::new(
                    operation,
                    key,
                    resolution.resolved_data.clone(),
                    self.clock.now_ms(),
                    self.config.device_id.clone(),
                    self.config.user_id.clone(),
                );

                // The remote side is now the common ancestor
                let mut record = EntityRecord::pending_local(&outgoing, None, local.strategy.clone());
                record.base = (event.event_type != EventType::Delete).then(|| event.data.clone());
                record.base_timestamp = event.timestamp;
                self.store_entity(key, &record).await;

                let mut state = self.state.lock().await;
                state.add_pending_change(outgoing);
                self.persist_state(&state).await;
                operation
            }
        };

        self.notify(SyncNotification::ConflictResolved {
            entity: key.clone(),
            winning_version: resolution.winning_version,
            reason: resolution.reason.clone(),
        });
        self.notify(SyncNotification::DataSynced {
            entity: key.clone(),
            data: resolution.resolved_data,
            operation,
        });
        resolution.winning_version
    }

    async fn flush_outgoing(&self) -> Result<usize> {
        let state = self.state.lock().await;
        let mut outgoing: Vec<SyncEvent> = {
            let sent = self.sent();
            state
                .pending_changes()
                .iter()
                .filter(|e| !sent.contains(&e.id))
                .cloned()
                .collect()
        };
        if outgoing.is_empty() {
            return Ok(0);
        }
        // Stable: FIFO within a priority
        outgoing.sort_by(|a, b| b.effective_priority().cmp(&a.effective_priority()));

        let mut sent = 0;
        let mut failure = None;
        for chunk in outgoing.chunks(self.config.orchestrator.batch_size.max(1)) {
            let message = match chunk {
                [event] => SyncMessage::SyncEvent {
                    event: event.clone(),
                },
                events => SyncMessage::SyncBatch {
                    events: events.to_vec(),
                },
            };
            match self.channel.send(&message) {
                Ok(()) => {
                    self.sent().extend(chunk.iter().map(|e| e.id.clone()));
                    sent += chunk.len();
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if sent > 0 {
            debug!("Sent {} local changes", sent);
        }

        match failure {
            Some(e) if sent == 0 => Err(e),
            Some(e) => {
                warn!("Sent {} local changes before failing: {}", sent, e);
                Ok(sent)
            }
            None => Ok(sent),
        }
    }

    /// Drop a pending change the remote has echoed back.
    async fn acknowledge_change(&self, id: &str) {
        self.sent().remove(id);
        let mut state = self.state.lock().await;
        if state.pending_changes().iter().any(|e| e.id == id) {
            state.remove_pending_changes(&HashSet::from([id.to_string()]));
            self.persist_state(&state).await;
            debug!("Remote acknowledged change {}", id);
        }
    }

    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged(state) => {
                // Anything written to the previous connection may be lost
                self.sent().clear();
                self.notify(SyncNotification::ChannelStateChanged(state));
                if state == ChannelState::Open {
                    let (since, version) = self.sync_point().await;
                    if let Err(e) = self
                        .channel
                        .send(&SyncMessage::IncrementalSyncRequest { since, version })
                    {
                        warn!("Failed to request incremental sync: {}", e);
                        return;
                    }
                    if let Err(e) = self.flush_outgoing().await {
                        warn!("Outgoing changes kept for later: {}", e);
                    }
                }
            }
            ChannelEvent::Message(message) => self.handle_message(message).await,
            ChannelEvent::ReconnectScheduled { attempt, delay } => {
                debug!("Channel reconnect {} scheduled in {:?}", attempt, delay);
            }
            ChannelEvent::GaveUp { attempts } => {
                self.notify(SyncNotification::SyncError {
                    message: format!("Sync channel gave up after {} attempts", attempts),
                });
            }
        }
    }

    async fn handle_message(&self, message: SyncMessage) {
        let result = match message {
            SyncMessage::SyncEvent { event } => self.apply_events(vec![event]).await.map(|_| ()),
            SyncMessage::SyncBatch { events } => self.apply_events(events).await.map(|_| ()),
            SyncMessage::IncrementalSyncError { error, message } => {
                warn!("Incremental sync refused ({}): {}, requesting full sync", error, message);
                self.channel.send(&SyncMessage::FullSyncRequest)
            }
            SyncMessage::SyncComplete { timestamp, version } => {
                self.adopt_sync_point(timestamp, version).await;
                Ok(())
            }
            other => {
                debug!("Ignoring inbound {}", other.kind());
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("Failed to handle sync message: {}", e);
            self.notify(SyncNotification::SyncError {
                message: e.to_string(),
            });
        }
    }
}

fn event_type_for(action_type: ActionType) -> EventType {
    match action_type {
        ActionType::Create => EventType::Create,
        ActionType::Delete => EventType::Delete,
        ActionType::Update | ActionType::Sync => EventType::Update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryPeer, MemoryTransport};
    use crate::config::{ChannelConfig, OrchestratorConfig, QueueConfig, ReachabilityConfig};
    use crate::queue::Priority;
    use crate::reachability::ManualConnectivity;
    use crate::remote::RecordingRemote;
    use offsync_common::ManualClock;
    use offsync_storage::MemoryStore;
    use serde_json::json;
    use tokio::time::timeout;

    struct Harness {
        orchestrator: SyncOrchestrator,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        transport: MemoryTransport,
        connectivity: Arc<ManualConnectivity>,
        remote: Arc<RecordingRemote>,
    }

    fn config() -> SyncConfig {
        SyncConfig::new("device-a", "user-1")
            .with_channel(ChannelConfig {
                base_delay_ms: 10,
                max_delay_ms: 100,
                max_attempts: 5,
                connect_timeout_ms: 1_000,
            })
            .with_reachability(ReachabilityConfig { debounce_ms: 10 })
            .with_orchestrator(OrchestratorConfig {
                batch_size: 2,
                ..OrchestratorConfig::default()
            })
    }

    async fn harness_with(online: bool, store: Arc<MemoryStore>) -> Harness {
        harness_configured(online, store, config()).await
    }

    async fn harness_configured(online: bool, store: Arc<MemoryStore>, config: SyncConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000));
        let transport = MemoryTransport::new();
        let connectivity = Arc::new(ManualConnectivity::new(online));
        let remote = Arc::new(RecordingRemote::new());

        let backends = SyncBackends {
            store: store.clone(),
            clock: clock.clone(),
            transport: Arc::new(transport.clone()),
            channel_url: "mem://sync".to_string(),
            connectivity: connectivity.clone(),
            remote: remote.clone(),
        };
        let orchestrator = SyncOrchestrator::new(config, backends).await.unwrap();

        Harness {
            orchestrator,
            store,
            clock,
            transport,
            connectivity,
            remote,
        }
    }

    async fn harness(online: bool) -> Harness {
        harness_with(online, Arc::new(MemoryStore::new())).await
    }

    fn key(id: &str) -> EntityKey {
        EntityKey::new("task", id).unwrap()
    }

    fn remote_event(event_type: EventType, id: &str, data: Value, timestamp: u64) -> SyncEvent {
        SyncEvent::new(event_type, &key(id), data, timestamp, "device-b", "user-2")
    }

    async fn open_channel(h: &Harness) -> MemoryPeer {
        h.orchestrator.channel().connect();
        let peer = timeout(Duration::from_secs(5), h.transport.accept())
            .await
            .unwrap()
            .unwrap();
        let mut state = h.orchestrator.channel().watch_state();
        timeout(Duration::from_secs(5), state.wait_for(|s| *s == ChannelState::Open))
            .await
            .unwrap()
            .unwrap();
        peer
    }

    async fn next_message(peer: &mut MemoryPeer) -> SyncMessage {
        timeout(Duration::from_secs(5), peer.recv_message())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_drain_archives_exhausted_action_and_continues() {
        let h = harness(true).await;
        h.remote.fail_endpoint_always("/a1");
        let mut notifications = h.orchestrator.subscribe();

        let a1 = h
            .orchestrator
            .enqueue_action(
                OfflineAction::new(ActionType::Create, "/a1", "POST", json!({}))
                    .with_priority(Priority::High)
                    .with_max_retries(1),
            )
            .await
            .unwrap();
        let a2 = h
            .orchestrator
            .enqueue_action(OfflineAction::new(ActionType::Create, "/a2", "POST", json!({})))
            .await
            .unwrap();

        let report = h.orchestrator.drain().await.unwrap();
        assert_eq!(report.actions_succeeded, 1);
        assert_eq!(report.actions_failed, 1);

        let failed = h.orchestrator.queue().failed().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].action.id, a1);
        assert!(h.orchestrator.queue().is_empty().await);
        assert_eq!(h.remote.executed()[0].id, a2);

        assert_eq!(
            notifications.try_recv().unwrap(),
            SyncNotification::ActionFailed {
                action_id: a1,
                error: failed[0].error.clone(),
                will_retry: false,
            }
        );
        assert!(matches!(
            notifications.try_recv().unwrap(),
            SyncNotification::ActionSucceeded { action_id, .. } if action_id == a2
        ));
    }

    #[tokio::test]
    async fn test_drain_waits_while_offline() {
        let h = harness(false).await;
        h.orchestrator
            .enqueue_action(OfflineAction::new(ActionType::Update, "/items/1", "PUT", json!({})))
            .await
            .unwrap();

        let report = h.orchestrator.drain().await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(h.orchestrator.queue().len().await, 1);
        assert!(h.remote.executed().is_empty());
    }

    #[tokio::test]
    async fn test_action_settles_optimistic_record() {
        let h = harness(true).await;
        h.remote.fail_endpoint_always("/tasks/2");

        h.orchestrator
            .enqueue_action(
                OfflineAction::new(ActionType::Create, "/tasks/1", "POST", json!({"t": 1}))
                    .for_entity(key("1")),
            )
            .await
            .unwrap();
        h.orchestrator
            .enqueue_action(
                OfflineAction::new(ActionType::Create, "/tasks/2", "POST", json!({"t": 2}))
                    .for_entity(key("2"))
                    .with_max_retries(1),
            )
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator.entity(&key("1")).await.unwrap().state,
            EntityState::Pending
        );

        h.orchestrator.drain().await.unwrap();

        let confirmed = h.orchestrator.entity(&key("1")).await.unwrap();
        assert_eq!(confirmed.state, EntityState::Confirmed);
        assert_eq!(confirmed.data, json!({"t": 1}));
        assert_eq!(
            h.orchestrator.entity(&key("2")).await.unwrap().state,
            EntityState::Failed
        );
    }

    #[tokio::test]
    async fn test_queue_overflow_fails_dropped_entity() {
        let config = config().with_queue(QueueConfig {
            max_size: 1,
            ..QueueConfig::default()
        });
        let h = harness_configured(false, Arc::new(MemoryStore::new()), config).await;
        let mut notifications = h.orchestrator.subscribe();

        let low = h
            .orchestrator
            .enqueue_action(
                OfflineAction::new(ActionType::Create, "/tasks/1", "POST", json!({"t": 1}))
                    .with_priority(Priority::Low)
                    .for_entity(key("1")),
            )
            .await
            .unwrap();
        h.orchestrator
            .enqueue_action(
                OfflineAction::new(ActionType::Create, "/tasks/2", "POST", json!({"t": 2}))
                    .with_priority(Priority::High)
                    .for_entity(key("2")),
            )
            .await
            .unwrap();

        assert_eq!(
            h.orchestrator.entity(&key("1")).await.unwrap().state,
            EntityState::Failed
        );
        assert_eq!(
            h.orchestrator.entity(&key("2")).await.unwrap().state,
            EntityState::Pending
        );
        assert_eq!(
            notifications.try_recv().unwrap(),
            SyncNotification::ActionFailed {
                action_id: low,
                error: "dropped from a full action queue".to_string(),
                will_retry: false,
            }
        );

        // No room below High: rejected without touching the record
        let rejected = h
            .orchestrator
            .enqueue_action(
                OfflineAction::new(ActionType::Create, "/tasks/3", "POST", json!({"t": 3}))
                    .for_entity(key("3")),
            )
            .await;
        assert!(matches!(rejected, Err(Error::QueueFull(_))));
        assert!(h.orchestrator.entity(&key("3")).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_action_retries_after_backoff() {
        let h = harness(true).await;
        h.remote.fail_endpoint("/flaky", 1);

        h.orchestrator
            .enqueue_action(OfflineAction::new(ActionType::Sync, "/flaky", "POST", json!({})))
            .await
            .unwrap();

        let first = h.orchestrator.drain().await.unwrap();
        assert_eq!(first.actions_failed, 1);
        assert_eq!(h.orchestrator.queue().len().await, 1);

        // Still backing off
        let waiting = h.orchestrator.drain().await.unwrap();
        assert_eq!(waiting.actions_succeeded + waiting.actions_failed, 0);

        h.clock.advance(Duration::from_secs(1));
        let second = h.orchestrator.drain().await.unwrap();
        assert_eq!(second.actions_succeeded, 1);
        assert!(h.orchestrator.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_apply_without_local_state() {
        let h = harness(true).await;
        let mut notifications = h.orchestrator.subscribe();

        let event = remote_event(EventType::Create, "1", json!({"title": "remote"}), 500);
        let report = h.orchestrator.apply_events(vec![event]).await.unwrap();
        assert_eq!(report.events_applied, 1);
        assert_eq!(report.conflicts_resolved, 0);

        let record = h.orchestrator.entity(&key("1")).await.unwrap();
        assert_eq!(record.data, json!({"title": "remote"}));
        assert_eq!(record.state, EntityState::Confirmed);

        assert_eq!(
            notifications.try_recv().unwrap(),
            SyncNotification::DataSynced {
                entity: key("1"),
                data: json!({"title": "remote"}),
                operation: EventType::Create,
            }
        );

        let state = h.orchestrator.sync_state().await;
        assert_eq!(state.last_sync_timestamp, 500);
        assert_eq!(state.sync_version, 1);
    }

    #[tokio::test]
    async fn test_newer_remote_wins_last_write_wins() {
        let h = harness(true).await;
        let local = h
            .orchestrator
            .local_event(EventType::Update, &key("1"), json!({"title": "mine"}));
        h.orchestrator.record_local_change(local, None).await.unwrap();
        assert_eq!(h.orchestrator.status().await.pending_changes, 1);

        let remote = remote_event(EventType::Update, "1", json!({"title": "theirs"}), 2_000);
        let report = h.orchestrator.apply_events(vec![remote]).await.unwrap();
        assert_eq!(report.conflicts_resolved, 1);

        let record = h.orchestrator.entity(&key("1")).await.unwrap();
        assert_eq!(record.data, json!({"title": "theirs"}));
        assert_eq!(record.state, EntityState::Confirmed);
        assert_eq!(h.orchestrator.status().await.pending_changes, 0);

        let recent = h.orchestrator.recent_events();
        assert_eq!(
            recent[0].outcome,
            EventOutcome::Resolved(WinningVersion::Remote)
        );
    }

    #[tokio::test]
    async fn test_newer_local_wins_and_is_requeued() {
        let h = harness(true).await;
        let local = h
            .orchestrator
            .local_event(EventType::Update, &key("1"), json!({"title": "mine"}));
        h.orchestrator.record_local_change(local, None).await.unwrap();

        let remote = remote_event(EventType::Update, "1", json!({"title": "old"}), 500);
        h.orchestrator.apply_events(vec![remote]).await.unwrap();

        let record = h.orchestrator.entity(&key("1")).await.unwrap();
        assert_eq!(record.data, json!({"title": "mine"}));
        assert_eq!(record.state, EntityState::Pending);
        assert_eq!(record.base, Some(json!({"title": "old"})));

        let state = h.orchestrator.sync_state().await;
        assert_eq!(state.pending_changes().len(), 1);
        assert_eq!(state.pending_changes()[0].data, json!({"title": "mine"}));
    }

    #[tokio::test]
    async fn test_three_way_merge_combines_fields() {
        let h = harness(true).await;
        let base = remote_event(EventType::Create, "1", json!({"title": "a", "body": "x"}), 100);
        h.orchestrator.apply_events(vec![base]).await.unwrap();

        let local = h.orchestrator.local_event(
            EventType::Update,
            &key("1"),
            json!({"title": "b", "body": "x"}),
        );
        h.orchestrator
            .record_local_change(local, Some(ResolutionStrategy::ThreeWayMerge))
            .await
            .unwrap();

        let remote = remote_event(EventType::Update, "1", json!({"title": "a", "body": "y"}), 2_000);
        h.orchestrator.apply_events(vec![remote]).await.unwrap();

        let record = h.orchestrator.entity(&key("1")).await.unwrap();
        assert_eq!(record.data, json!({"title": "b", "body": "y"}));
        assert_eq!(record.state, EntityState::Pending);

        let state = h.orchestrator.sync_state().await;
        assert_eq!(state.pending_changes().len(), 1);
        assert_eq!(state.pending_changes()[0].data, json!({"title": "b", "body": "y"}));
        assert_eq!(
            h.orchestrator.recent_events().last().unwrap().outcome,
            EventOutcome::Resolved(WinningVersion::Merged)
        );
    }

    #[tokio::test]
    async fn test_custom_resolver_is_used() {
        let h = harness(true).await;
        h.orchestrator
            .register_resolver("keep-local", |conflict| {
                Ok(Resolution {
                    winning_version: WinningVersion::Local,
                    resolved_data: conflict.local_version.data.clone(),
                    operation: None,
                    reason: "local always wins".to_string(),
                })
            })
            .unwrap();
        assert!(h.orchestrator.register_resolver("keep-local", |_| unreachable!()).is_err());

        let local = h
            .orchestrator
            .local_event(EventType::Update, &key("1"), json!("mine"));
        h.orchestrator
            .record_local_change(
                local,
                Some(ResolutionStrategy::Custom {
                    name: "keep-local".to_string(),
                }),
            )
            .await
            .unwrap();

        let mut notifications = h.orchestrator.subscribe();
        let remote = remote_event(EventType::Update, "1", json!("theirs"), 9_000);
        h.orchestrator.apply_events(vec![remote]).await.unwrap();

        assert_eq!(h.orchestrator.entity(&key("1")).await.unwrap().data, json!("mine"));
        assert_eq!(
            notifications.try_recv().unwrap(),
            SyncNotification::ConflictResolved {
                entity: key("1"),
                winning_version: WinningVersion::Local,
                reason: "local always wins".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_own_echo_confirms_without_conflict() {
        let h = harness(true).await;
        let local = h
            .orchestrator
            .local_event(EventType::Create, &key("1"), json!({"v": 1}));
        let echo = local.clone();
        h.orchestrator.record_local_change(local, None).await.unwrap();

        let report = h.orchestrator.apply_events(vec![echo]).await.unwrap();
        assert_eq!(report.conflicts_resolved, 0);
        assert_eq!(report.events_applied, 0);

        let record = h.orchestrator.entity(&key("1")).await.unwrap();
        assert_eq!(record.state, EntityState::Confirmed);
        assert_eq!(
            h.orchestrator.recent_events()[0].outcome,
            EventOutcome::Confirmed
        );
        assert_eq!(h.orchestrator.status().await.pending_changes, 0);
    }

    #[tokio::test]
    async fn test_duplicate_events_are_ignored() {
        let h = harness(true).await;
        let event = remote_event(EventType::Create, "1", json!(1), 10);

        h.orchestrator.apply_events(vec![event.clone()]).await.unwrap();
        let again = h.orchestrator.apply_events(vec![event]).await.unwrap();

        assert_eq!(again.events_applied, 0);
        assert_eq!(h.orchestrator.recent_events().len(), 1);
        assert_eq!(h.orchestrator.sync_state().await.sync_version, 1);
    }

    #[tokio::test]
    async fn test_flush_sends_critical_first_in_batches() {
        let h = harness(true).await;
        let mut ids = Vec::new();
        for (id, priority) in [
            ("low", Some(Priority::Low)),
            ("medium", None),
            ("critical", Some(Priority::Critical)),
            ("high", Some(Priority::High)),
        ] {
            let mut event = h.orchestrator.local_event(EventType::Update, &key(id), json!(id));
            event.priority = priority;
            ids.push((id, event.id.clone()));
            h.orchestrator.record_local_change(event, None).await.unwrap();
        }
        let id_of = |name: &str| ids.iter().find(|(n, _)| *n == name).unwrap().1.clone();

        let mut peer = open_channel(&h).await;
        assert_eq!(h.orchestrator.flush_outgoing().await.unwrap(), 4);

        let batch = |message: SyncMessage| match message {
            SyncMessage::SyncBatch { events } => events,
            other => panic!("expected batch, got {:?}", other),
        };
        let ids_of = |events: &[SyncEvent]| events.iter().map(|e| e.id.clone()).collect::<Vec<_>>();
        let first = batch(next_message(&mut peer).await);
        let second = batch(next_message(&mut peer).await);
        assert_eq!(ids_of(&first), vec![id_of("critical"), id_of("high")]);
        assert_eq!(ids_of(&second), vec![id_of("medium"), id_of("low")]);

        // Sent but unacknowledged: kept, and not sent twice on one connection
        assert_eq!(h.orchestrator.status().await.pending_changes, 4);
        assert_eq!(h.orchestrator.flush_outgoing().await.unwrap(), 0);

        h.orchestrator.apply_events(first).await.unwrap();
        h.orchestrator.apply_events(second).await.unwrap();
        assert_eq!(h.orchestrator.status().await.pending_changes, 0);
    }

    #[tokio::test]
    async fn test_unacknowledged_change_is_resent_after_connection_error() {
        let h = harness(true).await;
        h.orchestrator.start().await.unwrap();

        let mut peer = timeout(Duration::from_secs(5), h.transport.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            next_message(&mut peer).await,
            SyncMessage::IncrementalSyncRequest { .. }
        ));

        let change = h.orchestrator.local_event(EventType::Update, &key("1"), json!({"v": 1}));
        h.orchestrator
            .record_local_change(change.clone(), None)
            .await
            .unwrap();
        assert_eq!(
            next_message(&mut peer).await,
            SyncMessage::SyncEvent {
                event: change.clone()
            }
        );

        // The frame never reaches the remote
        peer.fail("connection reset").unwrap();

        let mut peer = timeout(Duration::from_secs(5), h.transport.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            next_message(&mut peer).await,
            SyncMessage::IncrementalSyncRequest { .. }
        ));
        assert_eq!(
            next_message(&mut peer).await,
            SyncMessage::SyncEvent {
                event: change.clone()
            }
        );

        peer.send(&SyncMessage::SyncEvent { event: change }).unwrap();
        timeout(Duration::from_secs(5), async {
            while h.orchestrator.status().await.pending_changes > 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            h.orchestrator.entity(&key("1")).await.unwrap().state,
            EntityState::Confirmed
        );

        h.orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_flush_without_channel_keeps_changes() {
        let h = harness(true).await;
        let event = h.orchestrator.local_event(EventType::Delete, &key("1"), Value::Null);
        h.orchestrator.record_local_change(event, None).await.unwrap();

        assert!(matches!(
            h.orchestrator.flush_outgoing().await,
            Err(Error::NotConnected(_))
        ));
        assert_eq!(h.orchestrator.status().await.pending_changes, 1);
    }

    #[tokio::test]
    async fn test_http_sync_falls_back_to_full() {
        let h = harness(true).await;
        h.remote.reject_incremental(true);
        h.remote.set_feed(SyncResponse {
            events: vec![remote_event(EventType::Create, "9", json!({"n": 9}), 700)],
            timestamp: 800,
            version: 12,
        });

        let report = h.orchestrator.sync_now().await.unwrap();
        assert_eq!(report.events_applied, 1);
        assert_eq!(h.remote.incremental_calls(), vec![(0, 0)]);
        assert_eq!(h.remote.full_calls(), 1);

        let state = h.orchestrator.sync_state().await;
        assert_eq!(state.last_sync_timestamp, 800);
        assert_eq!(state.sync_version, 12);
        assert!(h.orchestrator.entity(&key("9")).await.is_some());
    }

    #[tokio::test]
    async fn test_sync_now_offline() {
        let h = harness(false).await;
        assert!(matches!(
            h.orchestrator.sync_now().await,
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        {
            let h = harness_with(false, store.clone()).await;
            let event = h.orchestrator.local_event(EventType::Update, &key("1"), json!(1));
            h.orchestrator.record_local_change(event, None).await.unwrap();
            h.orchestrator
                .apply_events(vec![remote_event(EventType::Create, "2", json!(2), 300)])
                .await
                .unwrap();
        }

        let h = harness_with(false, store).await;
        let state = h.orchestrator.sync_state().await;
        assert_eq!(state.pending_changes().len(), 1);
        assert_eq!(state.last_sync_timestamp, 300);
        assert_eq!(
            h.orchestrator.entity(&key("1")).await.unwrap().state,
            EntityState::Pending
        );
    }

    async fn open_on_disk(root: &std::path::Path) -> SyncOrchestrator {
        let backends = SyncBackends {
            store: Arc::new(offsync_storage::LocalStore::new(root).unwrap()),
            clock: Arc::new(ManualClock::new(1_000)),
            transport: Arc::new(MemoryTransport::new()),
            channel_url: "mem://sync".to_string(),
            connectivity: Arc::new(ManualConnectivity::new(false)),
            remote: Arc::new(RecordingRemote::new()),
        };
        SyncOrchestrator::new(config(), backends).await.unwrap()
    }

    #[tokio::test]
    async fn test_queue_and_state_survive_restart_on_disk() {
        let dir = tempfile::tempdir().unwrap();

        let id = {
            let orchestrator = open_on_disk(dir.path()).await;
            let id = orchestrator
                .enqueue_action(
                    OfflineAction::new(ActionType::Create, "/tasks/1", "POST", json!({"t": 1}))
                        .for_entity(key("1")),
                )
                .await
                .unwrap();
            orchestrator
                .apply_events(vec![remote_event(EventType::Create, "2", json!(2), 300)])
                .await
                .unwrap();
            id
        };

        let orchestrator = open_on_disk(dir.path()).await;
        let pending = orchestrator.queue().pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(orchestrator.sync_state().await.last_sync_timestamp, 300);
        assert_eq!(
            orchestrator.entity(&key("2")).await.unwrap().data,
            json!(2)
        );
    }

    #[tokio::test]
    async fn test_corrupt_state_starts_fresh() {
        let store = Arc::new(MemoryStore::new());
        store.set(STATE_KEY, "{oops".to_string()).await.unwrap();

        let h = harness_with(true, store).await;
        let state = h.orchestrator.sync_state().await;
        assert_eq!(state.device_id, "device-a");
        assert_eq!(state.sync_version, 0);

        let event = h.orchestrator.local_event(EventType::Create, &key("1"), json!(1));
        h.orchestrator.record_local_change(event, None).await.unwrap();
        let raw = h.store.get(STATE_KEY).await.unwrap().unwrap();
        assert_eq!(SyncState::from_json(&raw).unwrap().pending_changes().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_requests_incremental_then_full() {
        let h = harness(true).await;
        h.orchestrator.start().await.unwrap();
        assert!(h.orchestrator.start().await.is_err());

        let mut peer = timeout(Duration::from_secs(5), h.transport.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            next_message(&mut peer).await,
            SyncMessage::IncrementalSyncRequest { since: 0, version: 0 }
        );

        peer.send(&SyncMessage::IncrementalSyncError {
            error: "stale".to_string(),
            message: "version too old".to_string(),
        })
        .unwrap();
        assert_eq!(next_message(&mut peer).await, SyncMessage::FullSyncRequest);

        let mut notifications = h.orchestrator.subscribe();
        peer.send(&SyncMessage::SyncBatch {
            events: vec![
                remote_event(EventType::Create, "1", json!(1), 40),
                remote_event(EventType::Create, "2", json!(2), 50),
            ],
        })
        .unwrap();
        peer.send(&SyncMessage::SyncComplete {
            timestamp: 60,
            version: 7,
        })
        .unwrap();

        timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SyncNotification::SyncCompleted { version, .. }) = notifications.recv().await {
                    assert_eq!(version, 7);
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert!(h.orchestrator.entity(&key("2")).await.is_some());
        let status = h.orchestrator.status().await;
        assert_eq!(status.sync_version, 7);
        assert_eq!(status.last_sync_timestamp, 60);
        assert!(status.running);

        h.orchestrator.stop().await;
        assert!(!h.orchestrator.is_running().await);
        assert_eq!(h.orchestrator.channel().state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_requests_go_through_worker_while_running() {
        let h = harness(false).await;
        h.orchestrator.set_sync_mode(SyncMode::Manual).await;
        h.orchestrator.start().await.unwrap();
        assert_eq!(h.orchestrator.sync_mode().await, SyncMode::Manual);

        h.orchestrator
            .enqueue_action(OfflineAction::new(ActionType::Create, "/notes", "POST", json!({})))
            .await
            .unwrap();
        let report = h.orchestrator.drain().await.unwrap();
        assert_eq!(report.actions_succeeded, 0);
        assert!(h.remote.executed().is_empty());

        assert!(matches!(
            h.orchestrator.sync_now().await,
            Err(Error::NotConnected(_))
        ));
        h.orchestrator.full_sync().await.unwrap();
        assert_eq!(h.remote.full_calls(), 1);

        let periodic = SyncMode::Periodic { interval_ms: 60_000 };
        h.orchestrator.set_sync_mode(periodic.clone()).await;
        h.orchestrator.stop().await;
        assert_eq!(h.orchestrator.sync_mode().await, periodic);
        assert!(h.orchestrator.drain().await.is_ok());
    }

    #[tokio::test]
    async fn test_going_online_drains_queue() {
        let h = harness(false).await;
        h.orchestrator.start().await.unwrap();
        let mut notifications = h.orchestrator.subscribe();

        let id = h
            .orchestrator
            .enqueue_action(OfflineAction::new(ActionType::Create, "/notes", "POST", json!({})))
            .await
            .unwrap();
        assert!(h.remote.executed().is_empty());

        h.connectivity.set_connected(true);

        timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SyncNotification::ActionSucceeded { action_id, .. }) = notifications.recv().await {
                    assert_eq!(action_id, id);
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert!(h.orchestrator.queue().is_empty().await);

        h.orchestrator.stop().await;
    }
}
