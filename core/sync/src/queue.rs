//! Durable priority queue of pending offline mutations.
//!
//! Ordering is priority-major, FIFO-minor. An action is held back while any
//! id in its `dependencies` is still queued or in flight, and after a failed
//! attempt until its backoff delay has elapsed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use offsync_common::{ClockSource, EntityKey, Error, Result};
use offsync_storage::{load_json, save_json, KeyValueStore};

use crate::config::QueueConfig;
use crate::conflict::ResolutionStrategy;

const PENDING_KEY: &str = "queue:pending";
const FAILED_KEY: &str = "queue:failed";

/// Dispatch priority. Higher variants dequeue first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    #[serde(alias = "normal")]
    Medium,
    High,
    Critical,
}

/// Kind of mutation an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    Sync,
}

/// A mutation made while offline, waiting to be executed against the
/// remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAction {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub endpoint: String,
    pub method: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Enqueue time, milliseconds since Unix epoch.
    pub timestamp: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<ResolutionStrategy>,
    /// Entity this action creates or changes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKey>,
    /// Earliest time the next attempt may start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OfflineAction {
    /// Create an action with medium priority and three retries.
    ///
    /// The id and timestamp are assigned on enqueue.
    pub fn new(
        action_type: ActionType,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: String::new(),
            action_type,
            endpoint: endpoint.into(),
            method: method.into(),
            payload,
            headers: BTreeMap::new(),
            timestamp: 0,
            retry_count: 0,
            max_retries: 3,
            priority: Priority::Medium,
            dependencies: Vec::new(),
            conflict_resolution: None,
            entity: None,
            not_before: None,
            last_error: None,
        }
    }

    /// Set dispatch priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the attempt budget. An action with `max_retries == 1` is tried
    /// once and archived on failure.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Hold this action until the given actions have left the queue.
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Strategy to use if this change later conflicts with a remote one.
    pub fn with_conflict_resolution(mut self, strategy: ResolutionStrategy) -> Self {
        self.conflict_resolution = Some(strategy);
        self
    }

    /// Mark the entity this action changes.
    pub fn for_entity(mut self, entity: EntityKey) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Whether the backoff delay (if any) has elapsed at `now_ms`.
    pub fn is_ready(&self, now_ms: u64) -> bool {
        self.not_before.map_or(true, |t| now_ms >= t)
    }
}

/// An action that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedAction {
    pub action: OfflineAction,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// An accepted action and whatever it displaced.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub id: String,
    /// Older actions dropped to stay within the size bound.
    pub dropped: Vec<OfflineAction>,
}

/// What happened to an action after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Requeued; eligible again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Moved to the failed-action archive.
    Archived,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueSnapshot {
    pending: Vec<OfflineAction>,
    #[serde(default)]
    in_flight: Vec<OfflineAction>,
}

#[derive(Default)]
struct QueueInner {
    pending: Vec<OfflineAction>,
    in_flight: Vec<OfflineAction>,
    failed: Vec<FailedAction>,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    fn insert_at_class_tail(&mut self, action: OfflineAction) {
        let pos = self
            .pending
            .iter()
            .position(|a| a.priority < action.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, action);
    }

    fn insert_at_class_head(&mut self, action: OfflineAction) {
        let pos = self
            .pending
            .iter()
            .position(|a| a.priority <= action.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, action);
    }

    /// Drop the oldest action of the lowest pending class until within
    /// `max_size`. In-flight actions count towards the bound but are never
    /// dropped.
    fn enforce_bound(&mut self, max_size: usize) -> Vec<OfflineAction> {
        let mut dropped = Vec::new();

        while self.len() > max_size && !self.pending.is_empty() {
            let lowest = self
                .pending
                .iter()
                .map(|a| a.priority)
                .min()
                .unwrap_or_default();

            let victim = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, a)| a.priority == lowest)
                .min_by_key(|(pos, a)| (a.timestamp, *pos))
                .map(|(pos, _)| pos);

            match victim {
                Some(pos) => dropped.push(self.pending.remove(pos)),
                None => break,
            }
        }

        dropped
    }

    fn queued_ids(&self) -> HashSet<String> {
        self.pending
            .iter()
            .chain(self.in_flight.iter())
            .map(|a| a.id.clone())
            .collect()
    }
}

/// Persistent priority queue of offline actions.
pub struct ActionQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn ClockSource>,
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    changed: Notify,
}

impl ActionQueue {
    /// Load the queue from durable storage.
    ///
    /// A missing snapshot yields an empty queue. A corrupted snapshot is
    /// discarded with an error log rather than blocking all future sync.
    /// Actions that were in flight when the snapshot was taken are put back
    /// at the head of their class.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn ClockSource>,
        config: QueueConfig,
    ) -> Self {
        let mut inner = QueueInner::default();

        match load_json::<QueueSnapshot, _>(store.as_ref(), PENDING_KEY).await {
            Ok(Some(snapshot)) => {
                for action in snapshot.pending {
                    inner.insert_at_class_tail(action);
                }
                for action in snapshot.in_flight.into_iter().rev() {
                    inner.insert_at_class_head(action);
                }
            }
            Ok(None) => {}
            Err(Error::Serialization(e)) => {
                error!("Action queue snapshot is corrupted, resetting to empty: {}", e);
                if let Err(e) = store.delete(PENDING_KEY).await {
                    warn!("Failed to remove corrupted queue snapshot: {}", e);
                }
            }
            Err(e) => {
                warn!("Failed to read action queue, starting empty: {}", e);
            }
        }

        match load_json::<Vec<FailedAction>, _>(store.as_ref(), FAILED_KEY).await {
            Ok(Some(failed)) => inner.failed = failed,
            Ok(None) => {}
            Err(e) => error!("Failed-action archive unreadable, starting empty: {}", e),
        }

        let dropped = inner.enforce_bound(config.max_size);
        if !dropped.is_empty() {
            warn!(
                "Dropped {} queued actions exceeding max size {}",
                dropped.len(),
                config.max_size
            );
        }

        info!(
            "Action queue loaded: {} pending, {} archived",
            inner.pending.len(),
            inner.failed.len()
        );

        Self {
            store,
            clock,
            config,
            inner: Mutex::new(inner),
            changed: Notify::new(),
        }
    }

    /// Add an action to the queue and return its id.
    ///
    /// See [`enqueue_detailed`](Self::enqueue_detailed).
    pub async fn enqueue(&self, action: OfflineAction) -> Result<String> {
        self.enqueue_detailed(action).await.map(|enqueued| enqueued.id)
    }

    /// Add an action to the queue.
    ///
    /// Assigns a fresh id and timestamp, inserts behind every queued action
    /// of the same or higher priority, enforces the size bound and persists
    /// a snapshot. Wakes the drainer. Actions dropped by the size bound are
    /// returned so their owners can be told.
    ///
    /// # Errors
    /// - `InvalidInput` if endpoint or method is empty
    /// - `QueueFull` if the bound leaves no room for the action itself;
    ///   the queue is left unchanged
    pub async fn enqueue_detailed(&self, mut action: OfflineAction) -> Result<Enqueued> {
        if action.endpoint.trim().is_empty() || action.method.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Action endpoint and method are required".to_string(),
            ));
        }

        action.id = Uuid::new_v4().to_string();
        action.timestamp = self.clock.now_ms();
        action.retry_count = 0;
        action.not_before = None;
        action.last_error = None;
        let id = action.id.clone();

        let mut inner = self.inner.lock().await;
        debug!(
            "Enqueue {} {:?} {} {} (priority {:?})",
            id, action.action_type, action.method, action.endpoint, action.priority
        );
        inner.insert_at_class_tail(action);

        let dropped = inner.enforce_bound(self.config.max_size);
        if let Some(rejected) = dropped.iter().find(|a| a.id == id) {
            // The bound held before this insert, so nothing else was dropped
            warn!(
                "Queue full ({}), rejected action {} (priority {:?})",
                self.config.max_size, rejected.id, rejected.priority
            );
            return Err(Error::QueueFull(format!(
                "{} actions queued or in flight, none below priority {:?}",
                inner.len(),
                rejected.priority
            )));
        }

        for action in &dropped {
            warn!(
                "Queue full ({}), dropped action {} (priority {:?})",
                self.config.max_size, action.id, action.priority
            );
        }

        self.persist_pending(&inner).await;
        drop(inner);

        self.changed.notify_one();
        Ok(Enqueued { id, dropped })
    }

    /// Remove up to `max` eligible actions, in priority-then-FIFO order.
    ///
    /// An action is eligible when its backoff delay has elapsed and none of
    /// its dependencies is queued or in flight. Returned actions are in
    /// flight until passed to [`complete`](Self::complete),
    /// [`fail`](Self::fail) or [`release`](Self::release).
    pub async fn dequeue_batch(&self, max: usize) -> Vec<OfflineAction> {
        if max == 0 {
            return Vec::new();
        }

        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;
        let blocking = inner.queued_ids();

        let mut selected = Vec::new();
        let mut pos = 0;
        while pos < inner.pending.len() && selected.len() < max {
            let candidate = &inner.pending[pos];
            let blocked = candidate.dependencies.iter().any(|dep| blocking.contains(dep));

            if candidate.is_ready(now) && !blocked {
                selected.push(inner.pending.remove(pos));
            } else {
                pos += 1;
            }
        }

        if !selected.is_empty() {
            inner.in_flight.extend(selected.iter().cloned());
            self.persist_pending(&inner).await;
        }

        selected
    }

    /// Mark an in-flight action as successfully executed.
    pub async fn complete(&self, id: &str) -> Result<OfflineAction> {
        let mut inner = self.inner.lock().await;
        let action = take_in_flight(&mut inner, id)?;
        self.persist_pending(&inner).await;
        drop(inner);

        // Dependents may be unblocked now
        self.changed.notify_one();
        Ok(action)
    }

    /// Record a failed attempt of an in-flight action.
    ///
    /// Increments `retry_count`; while it stays below `max_retries` the
    /// action is requeued at the tail of its class and held back for
    /// `min(base * multiplier^(retry_count-1), cap)`. Otherwise it moves to
    /// the failed-action archive.
    pub async fn fail(&self, id: &str, err: &Error) -> Result<FailureOutcome> {
        let mut inner = self.inner.lock().await;
        let mut action = take_in_flight(&mut inner, id)?;

        action.retry_count += 1;
        action.last_error = Some(err.to_string());

        let outcome = if action.retry_count < action.max_retries {
            let delay = self.config.backoff.delay_for_retry(action.retry_count);
            action.not_before = Some(self.clock.now_ms() + delay.as_millis() as u64);
            let attempt = action.retry_count;
            debug!("Action {} failed (attempt {}), retry in {:?}", id, attempt, delay);
            inner.insert_at_class_tail(action);
            FailureOutcome::Retrying { attempt, delay }
        } else {
            warn!(
                "Action {} failed after {} attempts, archiving: {}",
                id, action.retry_count, err
            );
            inner.failed.push(FailedAction {
                action,
                error: err.to_string(),
                failed_at: Utc::now(),
            });
            self.persist_failed(&inner).await;
            FailureOutcome::Archived
        };

        self.persist_pending(&inner).await;
        drop(inner);

        self.changed.notify_one();
        Ok(outcome)
    }

    /// Put an in-flight action back without counting an attempt.
    pub async fn release(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let action = take_in_flight(&mut inner, id)?;
        inner.insert_at_class_head(action);
        self.persist_pending(&inner).await;
        Ok(())
    }

    /// Cancel a queued (not in-flight) action.
    pub async fn remove(&self, id: &str) -> Result<OfflineAction> {
        let mut inner = self.inner.lock().await;
        let pos = inner
            .pending
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| Error::NotFound(format!("Queued action not found: {}", id)))?;
        let action = inner.pending.remove(pos);
        self.persist_pending(&inner).await;
        drop(inner);

        self.changed.notify_one();
        Ok(action)
    }

    /// Move an archived action back into the queue with a fresh attempt
    /// budget. Returns the new id.
    pub async fn retry_failed(&self, id: &str) -> Result<String> {
        let failed = {
            let mut inner = self.inner.lock().await;
            let pos = inner
                .failed
                .iter()
                .position(|f| f.action.id == id)
                .ok_or_else(|| Error::NotFound(format!("Failed action not found: {}", id)))?;
            inner.failed.remove(pos)
        };

        info!("Re-enqueueing archived action {}", id);
        let result = self.enqueue(failed.action.clone()).await;

        let mut inner = self.inner.lock().await;
        if result.is_err() {
            // Keep it archived so it can be retried later
            inner.failed.push(failed);
        }
        self.persist_failed(&inner).await;
        result
    }

    /// Empty the failed-action archive. Returns how many were removed.
    pub async fn clear_failed(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let count = inner.failed.len();
        inner.failed.clear();
        self.persist_failed(&inner).await;
        count
    }

    /// Snapshot of queued actions in dispatch order.
    pub async fn pending(&self) -> Vec<OfflineAction> {
        self.inner.lock().await.pending.clone()
    }

    /// Snapshot of the failed-action archive.
    pub async fn failed(&self) -> Vec<FailedAction> {
        self.inner.lock().await.failed.clone()
    }

    /// Number of queued plus in-flight actions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Check if nothing is queued or in flight.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of in-flight actions.
    pub async fn in_flight_count(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    /// Whether an action with this id is queued or in flight.
    pub async fn targets_entity(&self, entity: &EntityKey) -> bool {
        let inner = self.inner.lock().await;
        inner
            .pending
            .iter()
            .chain(inner.in_flight.iter())
            .any(|a| a.entity.as_ref() == Some(entity))
    }

    pub async fn contains(&self, id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .pending
            .iter()
            .chain(inner.in_flight.iter())
            .any(|a| a.id == id)
    }

    /// Earliest future time at which a backed-off action becomes ready.
    /// `None` if no queued action is waiting out a retry delay.
    pub async fn next_ready_at(&self) -> Option<u64> {
        let now = self.clock.now_ms();
        self.inner
            .lock()
            .await
            .pending
            .iter()
            .filter_map(|a| a.not_before)
            .filter(|t| *t > now)
            .min()
    }

    /// Wait until the queue changes (enqueue, completion, failure).
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    async fn persist_pending(&self, inner: &QueueInner) {
        let snapshot = QueueSnapshotRef {
            pending: &inner.pending,
            in_flight: &inner.in_flight,
        };
        if let Err(e) = save_json(self.store.as_ref(), PENDING_KEY, &snapshot).await {
            warn!("Failed to persist action queue, continuing in memory: {}", e);
        }
    }

    async fn persist_failed(&self, inner: &QueueInner) {
        if let Err(e) = save_json(self.store.as_ref(), FAILED_KEY, &inner.failed).await {
            warn!("Failed to persist failed-action archive, continuing in memory: {}", e);
        }
    }
}

#[derive(Serialize)]
struct QueueSnapshotRef<'a> {
    pending: &'a [OfflineAction],
    in_flight: &'a [OfflineAction],
}

fn take_in_flight(inner: &mut QueueInner, id: &str) -> Result<OfflineAction> {
    let pos = inner
        .in_flight
        .iter()
        .position(|a| a.id == id)
        .ok_or_else(|| Error::NotFound(format!("In-flight action not found: {}", id)))?;
    Ok(inner.in_flight.remove(pos))
}
