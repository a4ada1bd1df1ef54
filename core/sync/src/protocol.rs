//! Messages exchanged over the sync channel.
//!
//! Wire format is JSON, internally tagged by `type`:
//!
//! ```text
//! {"type":"sync_event","event":{...}}
//! {"type":"sync_batch","events":[...]}
//! {"type":"incremental_sync_request","since":1700000000000,"version":4}
//! {"type":"incremental_sync_error","error":"stale_version","message":"..."}
//! {"type":"full_sync_request"}
//! {"type":"sync_complete","timestamp":1700000000000,"version":5}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use offsync_common::{EntityKey, Error, Result};

use crate::queue::Priority;

/// Kind of change carried by a [`SyncEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

/// A single entity change, produced by a device or received from the
/// channel. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub data: Value,
    /// Milliseconds since Unix epoch on the producing device.
    pub timestamp: u64,
    pub device_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl SyncEvent {
    /// Create a new event with a fresh id.
    pub fn new(
        event_type: EventType,
        entity: &EntityKey,
        data: Value,
        timestamp: u64,
        device_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            data,
            timestamp,
            device_id: device_id.into(),
            user_id: user_id.into(),
            priority: None,
        }
    }

    /// Set the transmission priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Identity of the entity this event changes.
    pub fn entity_key(&self) -> Result<EntityKey> {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Effective transmission priority (unset counts as medium).
    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }
}

/// A message on the sync channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// One remote change.
    SyncEvent { event: SyncEvent },
    /// Several changes, applied in order.
    SyncBatch { events: Vec<SyncEvent> },
    /// Ask for everything after `since` at `version`.
    IncrementalSyncRequest { since: u64, version: u64 },
    /// The remote could not serve an incremental sync.
    IncrementalSyncError { error: String, message: String },
    /// Ask for the complete data set.
    FullSyncRequest,
    /// The remote finished sending a sync cycle.
    SyncComplete { timestamp: u64, version: u64 },
}

impl SyncMessage {
    /// Parse an inbound frame.
    ///
    /// # Errors
    /// - `Error::Parse` if the frame is not valid JSON, has an unknown
    ///   `type`, or carries an event with an empty entity type or id
    pub fn parse(raw: &str) -> Result<Self> {
        let message: SyncMessage =
            serde_json::from_str(raw).map_err(|e| Error::Parse(e.to_string()))?;

        let events: &[SyncEvent] = match &message {
            SyncMessage::SyncEvent { event } => std::slice::from_ref(event),
            SyncMessage::SyncBatch { events } => events,
            _ => &[],
        };
        for event in events {
            event
                .entity_key()
                .map_err(|e| Error::Parse(format!("event {}: {}", event.id, e)))?;
        }

        Ok(message)
    }

    /// Serialize for sending.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Wire name of this message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::SyncEvent { .. } => "sync_event",
            SyncMessage::SyncBatch { .. } => "sync_batch",
            SyncMessage::IncrementalSyncRequest { .. } => "incremental_sync_request",
            SyncMessage::IncrementalSyncError { .. } => "incremental_sync_error",
            SyncMessage::FullSyncRequest => "full_sync_request",
            SyncMessage::SyncComplete { .. } => "sync_complete",
        }
    }
}
