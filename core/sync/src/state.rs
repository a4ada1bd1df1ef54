//! Sync state tracking and persistence.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

use offsync_common::{Error, Result};

use crate::conflict::{EntityVersion, ResolutionStrategy, WinningVersion};
use crate::protocol::{EventType, SyncEvent};

/// Per-device sync progress.
///
/// `last_sync_timestamp` and `sync_version` only ever move forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Newest remote event timestamp applied, milliseconds since epoch.
    pub last_sync_timestamp: u64,
    pub device_id: String,
    pub user_id: String,
    /// Local changes not yet handed to the channel.
    #[serde(default)]
    pending_changes: Vec<SyncEvent>,
    pub sync_version: u64,
}

impl SyncState {
    /// Create a fresh state for a device.
    pub fn new(device_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            last_sync_timestamp: 0,
            device_id: device_id.into(),
            user_id: user_id.into(),
            pending_changes: Vec::new(),
            sync_version: 0,
        }
    }

    /// Record a successfully applied batch whose newest event is at
    /// `newest_timestamp`.
    pub fn record_applied_batch(&mut self, newest_timestamp: u64) {
        self.last_sync_timestamp = self.last_sync_timestamp.max(newest_timestamp);
        self.sync_version += 1;
    }

    /// Adopt a server-announced sync point if it is ahead of ours.
    pub fn adopt_server_version(&mut self, timestamp: u64, version: u64) {
        self.last_sync_timestamp = self.last_sync_timestamp.max(timestamp);
        self.sync_version = self.sync_version.max(version);
    }

    /// Queue a local change for transmission. A newer change to the same
    /// entity replaces the older one.
    pub fn add_pending_change(&mut self, event: SyncEvent) {
        self.pending_changes
            .retain(|e| !(e.entity_type == event.entity_type && e.entity_id == event.entity_id));
        self.pending_changes.push(event);
    }

    /// Remove acknowledged changes by event id.
    pub fn remove_pending_changes(&mut self, ids: &HashSet<String>) {
        self.pending_changes.retain(|e| !ids.contains(&e.id));
    }

    /// Local changes awaiting acknowledgement, oldest first.
    pub fn pending_changes(&self) -> &[SyncEvent] {
        &self.pending_changes
    }

    /// Check if there are pending changes.
    pub fn has_pending_changes(&self) -> bool {
        !self.pending_changes.is_empty()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Lifecycle of a locally known entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    /// Changed locally; the remote has not acknowledged it yet.
    Pending,
    /// Matches what the remote last acknowledged or sent.
    Confirmed,
    /// The local change could not be delivered.
    Failed,
}

/// Local copy of an entity, cached under its entity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub data: Value,
    pub timestamp: u64,
    pub device_id: String,
    pub operation: EventType,
    /// Last confirmed data, the common ancestor for three-way merges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Value>,
    /// Timestamp of `base`.
    #[serde(default)]
    pub base_timestamp: u64,
    pub state: EntityState,
    #[serde(default)]
    pub strategy: ResolutionStrategy,
}

impl EntityRecord {
    /// Record for a change that arrived from (or was confirmed by) the
    /// remote.
    pub fn confirmed(event: &SyncEvent) -> Self {
        let base = (event.event_type != EventType::Delete).then(|| event.data.clone());
        Self {
            data: event.data.clone(),
            timestamp: event.timestamp,
            device_id: event.device_id.clone(),
            operation: event.event_type,
            base,
            base_timestamp: event.timestamp,
            state: EntityState::Confirmed,
            strategy: ResolutionStrategy::default(),
        }
    }

    /// Optimistic record for a local change, keeping the previous confirmed
    /// data as the merge base.
    pub fn pending_local(
        event: &SyncEvent,
        previous: Option<&EntityRecord>,
        strategy: ResolutionStrategy,
    ) -> Self {
        let (base, base_timestamp) = match previous {
            Some(prev) if prev.state == EntityState::Confirmed => {
                (prev.base.clone().or_else(|| Some(prev.data.clone())), prev.timestamp)
            }
            Some(prev) => (prev.base.clone(), prev.base_timestamp),
            None => (None, 0),
        };

        Self {
            data: event.data.clone(),
            timestamp: event.timestamp,
            device_id: event.device_id.clone(),
            operation: event.event_type,
            base,
            base_timestamp,
            state: EntityState::Pending,
            strategy,
        }
    }

    /// Whether applying `event` verbatim would overwrite unacknowledged
    /// local state.
    pub fn diverges_from(&self, event: &SyncEvent) -> bool {
        self.state == EntityState::Pending
            && (self.data != event.data
                || (self.operation == EventType::Delete) != (event.event_type == EventType::Delete))
    }

    /// Promote to confirmed; the current data becomes the new base.
    pub fn mark_confirmed(&mut self) {
        self.state = EntityState::Confirmed;
        self.base = (self.operation != EventType::Delete).then(|| self.data.clone());
        self.base_timestamp = self.timestamp;
    }

    /// Mark the local change as undeliverable.
    pub fn mark_failed(&mut self) {
        self.state = EntityState::Failed;
    }

    /// This record as one side of a conflict.
    pub fn as_version(&self) -> EntityVersion {
        EntityVersion::new(self.data.clone(), self.timestamp, self.device_id.clone())
            .with_operation(self.operation)
    }

    /// The merge base as a conflict version, if known.
    pub fn base_version(&self) -> Option<EntityVersion> {
        self.base
            .as_ref()
            .map(|data| EntityVersion::new(data.clone(), self.base_timestamp, ""))
    }
}

/// How an inbound event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    Resolved(WinningVersion),
    /// Echo of our own change.
    Confirmed,
}

/// A processed inbound event, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEvent {
    pub event_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub device_id: String,
    pub timestamp: u64,
    pub outcome: EventOutcome,
}

/// Bounded ring buffer of recently processed events, oldest evicted first.
#[derive(Debug)]
pub struct RecentEvents {
    capacity: usize,
    records: VecDeque<ProcessedEvent>,
    ids: HashSet<String>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Whether an event with this id was processed recently.
    pub fn contains(&self, event_id: &str) -> bool {
        self.ids.contains(event_id)
    }

    /// Remember a processed event.
    pub fn record(&mut self, event: &SyncEvent, outcome: EventOutcome) {
        if self.records.len() == self.capacity {
            if let Some(oldest) = self.records.pop_front() {
                self.ids.remove(&oldest.event_id);
            }
        }

        self.ids.insert(event.id.clone());
        self.records.push_back(ProcessedEvent {
            event_id: event.id.clone(),
            entity_type: event.entity_type.clone(),
            entity_id: event.entity_id.clone(),
            device_id: event.device_id.clone(),
            timestamp: event.timestamp,
            outcome,
        });
    }

    /// Records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessedEvent> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_common::EntityKey;
    use serde_json::json;

    fn event(event_type: EventType, data: Value, timestamp: u64, device: &str) -> SyncEvent {
        let key = EntityKey::new("note", "n1").unwrap();
        SyncEvent::new(event_type, &key, data, timestamp, device, "user")
    }

    #[test]
    fn test_state_advances_monotonically() {
        let mut state = SyncState::new("device-a", "user");

        state.record_applied_batch(500);
        state.record_applied_batch(300);
        assert_eq!(state.last_sync_timestamp, 500);
        assert_eq!(state.sync_version, 2);

        state.adopt_server_version(400, 1);
        assert_eq!(state.last_sync_timestamp, 500);
        assert_eq!(state.sync_version, 2);

        state.adopt_server_version(900, 10);
        assert_eq!(state.last_sync_timestamp, 900);
        assert_eq!(state.sync_version, 10);
    }

    #[test]
    fn test_pending_changes_replace_per_entity() {
        let mut state = SyncState::new("d", "u");
        let first = event(EventType::Create, json!({"v": 1}), 1, "d");
        let second = event(EventType::Update, json!({"v": 2}), 2, "d");
        let second_id = second.id.clone();

        state.add_pending_change(first);
        state.add_pending_change(second);
        assert_eq!(state.pending_changes().len(), 1);
        assert_eq!(state.pending_changes()[0].data, json!({"v": 2}));

        state.remove_pending_changes(&HashSet::from([second_id]));
        assert!(!state.has_pending_changes());
    }

    #[test]
    fn test_state_serialization() {
        let mut state = SyncState::new("d", "u");
        state.add_pending_change(event(EventType::Update, json!(1), 1, "d"));
        state.record_applied_batch(77);

        let json = state.to_json().unwrap();
        assert!(json.contains("lastSyncTimestamp"));
        let restored = SyncState::from_json(&json).unwrap();
        assert_eq!(restored, state);

        assert!(SyncState::from_json("{}").is_err());
    }

    #[test]
    fn test_divergence_only_for_pending() {
        let remote = event(EventType::Update, json!({"title": "remote"}), 20, "other");

        let confirmed = EntityRecord::confirmed(&event(
            EventType::Create,
            json!({"title": "base"}),
            10,
            "other",
        ));
        assert!(!confirmed.diverges_from(&remote));

        let local = event(EventType::Update, json!({"title": "mine"}), 15, "me");
        let pending = EntityRecord::pending_local(
            &local,
            Some(&confirmed),
            ResolutionStrategy::ThreeWayMerge,
        );
        assert!(pending.diverges_from(&remote));
        assert_eq!(pending.base, Some(json!({"title": "base"})));
        assert_eq!(pending.base_version().unwrap().timestamp, 10);

        let same = event(EventType::Update, json!({"title": "mine"}), 30, "other");
        assert!(!pending.diverges_from(&same));
    }

    #[test]
    fn test_pending_keeps_base_across_local_edits() {
        let confirmed = EntityRecord::confirmed(&event(EventType::Create, json!(1), 10, "x"));
        let first = EntityRecord::pending_local(
            &event(EventType::Update, json!(2), 20, "me"),
            Some(&confirmed),
            ResolutionStrategy::default(),
        );
        let mut second = EntityRecord::pending_local(
            &event(EventType::Update, json!(3), 30, "me"),
            Some(&first),
            ResolutionStrategy::default(),
        );
        assert_eq!(second.base, Some(json!(1)));

        second.mark_confirmed();
        assert_eq!(second.state, EntityState::Confirmed);
        assert_eq!(second.base, Some(json!(3)));
    }

    #[test]
    fn test_recent_events_ring_buffer() {
        let mut recent = RecentEvents::new(2);
        let a = event(EventType::Create, json!(1), 1, "x");
        let b = event(EventType::Update, json!(2), 2, "x");
        let c = event(EventType::Update, json!(3), 3, "x");

        recent.record(&a, EventOutcome::Applied);
        recent.record(&b, EventOutcome::Applied);
        recent.record(&c, EventOutcome::Resolved(WinningVersion::Merged));

        assert_eq!(recent.len(), 2);
        assert!(!recent.contains(&a.id));
        assert!(recent.contains(&c.id));
        assert_eq!(recent.iter().next().unwrap().event_id, b.id);
    }
}
