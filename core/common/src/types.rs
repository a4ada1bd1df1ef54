//! Common types used throughout the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a device taking part in sync.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "DeviceId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a synced entity: its type plus its id within that type.
///
/// Entities are cached under `entity:<type>:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    /// Prefix shared by all entity cache keys.
    pub const CACHE_PREFIX: &'static str = "entity:";

    /// Create a new entity key.
    ///
    /// # Errors
    /// - Either part is empty
    /// - The entity type contains a ':' separator
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> crate::Result<Self> {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();

        if entity_type.is_empty() || entity_id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Entity type and id cannot be empty".to_string(),
            ));
        }
        if entity_type.contains(':') {
            return Err(crate::Error::InvalidInput(format!(
                "Entity type cannot contain ':': {}",
                entity_type
            )));
        }

        Ok(Self {
            entity_type,
            entity_id,
        })
    }

    /// Cache key under which this entity's record is stored.
    pub fn cache_key(&self) -> String {
        format!("{}{}:{}", Self::CACHE_PREFIX, self.entity_type, self.entity_id)
    }

    /// Parse a cache key produced by [`EntityKey::cache_key`].
    ///
    /// The id may itself contain ':'; only the first separator after the
    /// type is significant.
    pub fn from_cache_key(key: &str) -> crate::Result<Self> {
        let rest = key.strip_prefix(Self::CACHE_PREFIX).ok_or_else(|| {
            crate::Error::InvalidInput(format!("Not an entity cache key: {}", key))
        })?;
        let (entity_type, entity_id) = rest.split_once(':').ok_or_else(|| {
            crate::Error::InvalidInput(format!("Malformed entity cache key: {}", key))
        })?;
        Self::new(entity_type, entity_id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}
