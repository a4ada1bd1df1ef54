//! Conflict detection and resolution.
//!
//! A conflict arises when a remote change arrives for an entity whose local
//! copy has diverged. Every conflict resolves to exactly one
//! [`Resolution`]; resolver failures fall back to last-write-wins.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use offsync_common::{EntityKey, Error, Result};

use crate::protocol::EventType;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// The later timestamp wins wholesale.
    #[default]
    LastWriteWins,
    /// Field-by-field merge against the common ancestor.
    ThreeWayMerge,
    /// Delegate to a handler registered under `name`.
    Custom { name: String },
}

/// Which side wins when both sides changed the same field differently
/// during a three-way merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    #[default]
    RemoteWins,
    LocalWins,
    /// The side with the later timestamp; remote on a tie.
    NewerWins,
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityVersion {
    pub data: Value,
    pub timestamp: u64,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<EventType>,
}

impl EntityVersion {
    pub fn new(data: Value, timestamp: u64, device_id: impl Into<String>) -> Self {
        Self {
            data,
            timestamp,
            device_id: device_id.into(),
            operation: None,
        }
    }

    pub fn with_operation(mut self, operation: EventType) -> Self {
        self.operation = Some(operation);
        self
    }

    fn is_delete(&self) -> bool {
        self.operation == Some(EventType::Delete)
    }
}

/// Divergent versions of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub local_version: EntityVersion,
    pub remote_version: EntityVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_version: Option<EntityVersion>,
    pub resolution_strategy: ResolutionStrategy,
}

impl SyncConflict {
    pub fn new(
        entity: &EntityKey,
        local_version: EntityVersion,
        remote_version: EntityVersion,
        original_version: Option<EntityVersion>,
        resolution_strategy: ResolutionStrategy,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            local_version,
            remote_version,
            original_version,
            resolution_strategy,
        }
    }
}

/// Which version a resolution adopted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WinningVersion {
    Local,
    Remote,
    Merged,
}

impl fmt::Display for WinningVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WinningVersion::Local => "local",
            WinningVersion::Remote => "remote",
            WinningVersion::Merged => "merged",
        };
        f.write_str(name)
    }
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub winning_version: WinningVersion,
    pub resolved_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<EventType>,
    pub reason: String,
}

/// Caller-supplied resolution function.
pub type CustomResolver = Arc<dyn Fn(&SyncConflict) -> Result<Resolution> + Send + Sync>;

/// Resolves conflicts according to each conflict's strategy.
pub struct ConflictResolver {
    collision_policy: CollisionPolicy,
    handlers: HashMap<String, CustomResolver>,
}

impl ConflictResolver {
    /// Create a resolver with the given field-collision policy.
    pub fn new(collision_policy: CollisionPolicy) -> Self {
        Self {
            collision_policy,
            handlers: HashMap::new(),
        }
    }

    /// Register a custom resolution function.
    ///
    /// # Errors
    /// - `AlreadyExists` if `name` is taken
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&SyncConflict) -> Result<Resolution> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Conflict handler '{}' is already registered",
                name
            )));
        }
        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    /// Check if a custom handler is registered.
    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Get the field-collision policy.
    pub fn collision_policy(&self) -> CollisionPolicy {
        self.collision_policy
    }

    /// Resolve a conflict. Never fails: a failing or missing strategy
    /// falls back to last-write-wins.
    pub fn resolve(&self, conflict: &SyncConflict) -> Resolution {
        let resolution = match &conflict.resolution_strategy {
            ResolutionStrategy::LastWriteWins => last_write_wins(conflict),
            ResolutionStrategy::ThreeWayMerge => self.three_way_merge(conflict),
            ResolutionStrategy::Custom { name } => self.custom(name, conflict),
        };

        debug!(
            "Resolved conflict {} on {}/{}: {} ({})",
            conflict.id,
            conflict.entity_type,
            conflict.entity_id,
            resolution.winning_version,
            resolution.reason
        );
        resolution
    }

    fn custom(&self, name: &str, conflict: &SyncConflict) -> Resolution {
        let Some(handler) = self.handlers.get(name) else {
            warn!(
                "No conflict handler named '{}', using last-write-wins",
                name
            );
            return last_write_wins(conflict);
        };

        match catch_unwind(AssertUnwindSafe(|| handler(conflict))) {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(e)) => {
                let e = Error::ConflictResolution(format!("handler '{}': {}", name, e));
                error!("{}, using last-write-wins", e);
                last_write_wins(conflict)
            }
            Err(_) => {
                error!(
                    "Conflict handler '{}' panicked, using last-write-wins",
                    name
                );
                last_write_wins(conflict)
            }
        }
    }

    fn three_way_merge(&self, conflict: &SyncConflict) -> Resolution {
        let local = &conflict.local_version;
        let remote = &conflict.remote_version;

        let Some(original) = &conflict.original_version else {
            debug!("No common ancestor for {}, using last-write-wins", conflict.id);
            return last_write_wins(conflict);
        };
        if local.is_delete() || remote.is_delete() {
            return last_write_wins(conflict);
        }

        let (Some(l), Some(r), Some(o)) = (
            local.data.as_object(),
            remote.data.as_object(),
            original.data.as_object(),
        ) else {
            debug!("Non-object data in {}, using last-write-wins", conflict.id);
            return last_write_wins(conflict);
        };

        let prefer_remote = match self.collision_policy {
            CollisionPolicy::RemoteWins => true,
            CollisionPolicy::LocalWins => false,
            CollisionPolicy::NewerWins => remote.timestamp >= local.timestamp,
        };

        let fields: BTreeSet<&String> = l.keys().chain(r.keys()).chain(o.keys()).collect();
        let mut merged = Map::new();
        let mut collisions = 0;

        for field in fields {
            let (lv, rv, ov) = (l.get(field), r.get(field), o.get(field));

            let value = if lv == rv {
                lv
            } else if lv == ov {
                rv
            } else if rv == ov {
                lv
            } else {
                collisions += 1;
                if prefer_remote {
                    rv
                } else {
                    lv
                }
            };

            // Absent means the field was removed
            if let Some(value) = value {
                merged.insert(field.clone(), value.clone());
            }
        }

        Resolution {
            winning_version: WinningVersion::Merged,
            resolved_data: Value::Object(merged),
            operation: Some(EventType::Update),
            reason: format!(
                "three-way merge, {} field collision(s) resolved {:?}",
                collisions, self.collision_policy
            ),
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(CollisionPolicy::default())
    }
}

/// Two-way last-write-wins.
///
/// The later timestamp wins. On equal timestamps a delete beats a
/// non-delete, then the lexicographically greater device id wins, then
/// remote.
pub fn last_write_wins(conflict: &SyncConflict) -> Resolution {
    let local = &conflict.local_version;
    let remote = &conflict.remote_version;

    let (remote_wins, reason) = if local.timestamp != remote.timestamp {
        (
            remote.timestamp > local.timestamp,
            "later timestamp wins".to_string(),
        )
    } else if local.is_delete() != remote.is_delete() {
        (remote.is_delete(), "delete wins on timestamp tie".to_string())
    } else if local.device_id != remote.device_id {
        (
            remote.device_id > local.device_id,
            "device id breaks timestamp tie".to_string(),
        )
    } else {
        (true, "identical versions, remote kept".to_string())
    };

    let (winning_version, version) = if remote_wins {
        (WinningVersion::Remote, remote)
    } else {
        (WinningVersion::Local, local)
    };

    Resolution {
        winning_version,
        resolved_data: version.data.clone(),
        operation: version.operation,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn key() -> EntityKey {
        EntityKey::new("task", "1").unwrap()
    }

    fn version(data: Value, timestamp: u64, device: &str) -> EntityVersion {
        EntityVersion::new(data, timestamp, device).with_operation(EventType::Update)
    }

    fn conflict(
        local: EntityVersion,
        remote: EntityVersion,
        original: Option<EntityVersion>,
        strategy: ResolutionStrategy,
    ) -> SyncConflict {
        SyncConflict::new(&key(), local, remote, original, strategy)
    }

    #[test]
    fn test_last_write_wins_remote_newer() {
        let c = conflict(
            version(json!({"v": "local"}), 100, "a"),
            version(json!({"v": "remote"}), 200, "b"),
            None,
            ResolutionStrategy::LastWriteWins,
        );

        let resolution = ConflictResolver::default().resolve(&c);
        assert_eq!(resolution.winning_version, WinningVersion::Remote);
        assert_eq!(resolution.resolved_data, json!({"v": "remote"}));
        assert_eq!(resolution.winning_version.to_string(), "remote");
    }

    #[test]
    fn test_later_delete_beats_update() {
        let c = conflict(
            version(json!({"v": 1}), 100, "a"),
            EntityVersion::new(Value::Null, 150, "b").with_operation(EventType::Delete),
            None,
            ResolutionStrategy::LastWriteWins,
        );

        let resolution = last_write_wins(&c);
        assert_eq!(resolution.operation, Some(EventType::Delete));
        assert_eq!(resolution.winning_version, WinningVersion::Remote);
    }

    #[test]
    fn test_timestamp_tie_breaks() {
        let delete = EntityVersion::new(Value::Null, 100, "a").with_operation(EventType::Delete);
        let c = conflict(
            delete,
            version(json!(1), 100, "z"),
            None,
            ResolutionStrategy::LastWriteWins,
        );
        assert_eq!(last_write_wins(&c).winning_version, WinningVersion::Local);

        let c = conflict(
            version(json!(1), 100, "phone"),
            version(json!(2), 100, "laptop"),
            None,
            ResolutionStrategy::LastWriteWins,
        );
        assert_eq!(last_write_wins(&c).winning_version, WinningVersion::Local);
    }

    #[test]
    fn test_three_way_merge_disjoint_fields() {
        let original = version(json!({"a": 1, "b": 1, "c": 1}), 10, "a");
        let local = version(json!({"a": 2, "b": 1, "c": 1}), 20, "a");
        let remote = version(json!({"a": 1, "b": 3, "c": 1}), 15, "b");

        let resolution = ConflictResolver::default().resolve(&conflict(
            local,
            remote,
            Some(original),
            ResolutionStrategy::ThreeWayMerge,
        ));

        assert_eq!(resolution.winning_version, WinningVersion::Merged);
        assert_eq!(resolution.resolved_data, json!({"a": 2, "b": 3, "c": 1}));
        assert_eq!(resolution.winning_version.to_string(), "merged");
    }

    #[test]
    fn test_three_way_merge_removed_and_added_fields() {
        let original = version(json!({"keep": 1, "drop": 1}), 10, "a");
        let local = version(json!({"keep": 1}), 20, "a");
        let remote = version(json!({"keep": 1, "drop": 1, "new": true}), 30, "b");

        let resolution = ConflictResolver::default().resolve(&conflict(
            local,
            remote,
            Some(original),
            ResolutionStrategy::ThreeWayMerge,
        ));
        assert_eq!(resolution.resolved_data, json!({"keep": 1, "new": true}));
    }

    #[test]
    fn test_collision_policies() {
        let make = || {
            conflict(
                version(json!({"title": "local"}), 300, "a"),
                version(json!({"title": "remote"}), 200, "b"),
                Some(version(json!({"title": "base"}), 100, "a")),
                ResolutionStrategy::ThreeWayMerge,
            )
        };

        let remote_wins = ConflictResolver::new(CollisionPolicy::RemoteWins).resolve(&make());
        assert_eq!(remote_wins.resolved_data, json!({"title": "remote"}));

        let local_wins = ConflictResolver::new(CollisionPolicy::LocalWins).resolve(&make());
        assert_eq!(local_wins.resolved_data, json!({"title": "local"}));

        let newer_wins = ConflictResolver::new(CollisionPolicy::NewerWins).resolve(&make());
        assert_eq!(newer_wins.resolved_data, json!({"title": "local"}));
    }

    #[test]
    fn test_three_way_without_original_falls_back() {
        let resolution = ConflictResolver::default().resolve(&conflict(
            version(json!({"a": 1}), 100, "a"),
            version(json!({"a": 2}), 200, "b"),
            None,
            ResolutionStrategy::ThreeWayMerge,
        ));
        assert_eq!(resolution.winning_version, WinningVersion::Remote);
        assert_eq!(resolution.resolved_data, json!({"a": 2}));
    }

    #[test]
    fn test_custom_handler() {
        let mut resolver = ConflictResolver::default();
        resolver
            .register("keep-local", |c: &SyncConflict| {
                Ok(Resolution {
                    winning_version: WinningVersion::Local,
                    resolved_data: c.local_version.data.clone(),
                    operation: c.local_version.operation,
                    reason: "user preference".into(),
                })
            })
            .unwrap();
        assert!(resolver.register("keep-local", |c: &SyncConflict| Ok(last_write_wins(c))).is_err());

        let resolution = resolver.resolve(&conflict(
            version(json!("mine"), 1, "a"),
            version(json!("theirs"), 2, "b"),
            None,
            ResolutionStrategy::Custom {
                name: "keep-local".into(),
            },
        ));
        assert_eq!(resolution.resolved_data, json!("mine"));
        assert_eq!(resolution.reason, "user preference");
    }

    #[test]
    fn test_failing_custom_handlers_fall_back() {
        let mut resolver = ConflictResolver::default();
        resolver
            .register("errors", |_: &SyncConflict| {
                Err(Error::InvalidInput("cannot decide".into()))
            })
            .unwrap();
        resolver
            .register("panics", |_: &SyncConflict| -> Result<Resolution> {
                panic!("handler bug")
            })
            .unwrap();

        for name in ["errors", "panics", "missing"] {
            let resolution = resolver.resolve(&conflict(
                version(json!("old"), 1, "a"),
                version(json!("new"), 2, "b"),
                None,
                ResolutionStrategy::Custom { name: name.into() },
            ));
            assert_eq!(resolution.winning_version, WinningVersion::Remote, "{}", name);
        }
    }

    #[test]
    fn test_strategy_serialization() {
        let value = serde_json::to_value(ResolutionStrategy::Custom {
            name: "x".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"kind": "custom", "name": "x"}));

        let parsed: ResolutionStrategy =
            serde_json::from_value(json!({"kind": "three-way-merge"})).unwrap();
        assert_eq!(parsed, ResolutionStrategy::ThreeWayMerge);
    }

    proptest! {
        #[test]
        fn prop_last_write_wins_picks_later(t1 in 0u64..1_000_000, gap in 1u64..1_000_000) {
            let t2 = t1 + gap;
            let resolver = ConflictResolver::default();

            let c = conflict(
                version(json!("early"), t1, "a"),
                version(json!("late"), t2, "b"),
                None,
                ResolutionStrategy::LastWriteWins,
            );
            prop_assert_eq!(resolver.resolve(&c).winning_version, WinningVersion::Remote);

            let c = conflict(
                version(json!("late"), t2, "a"),
                version(json!("early"), t1, "b"),
                None,
                ResolutionStrategy::LastWriteWins,
            );
            let first = resolver.resolve(&c);
            prop_assert_eq!(first.winning_version, WinningVersion::Local);
            prop_assert_eq!(first, resolver.resolve(&c));
        }
    }
}
