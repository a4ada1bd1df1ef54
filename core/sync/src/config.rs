//! Engine configuration.
//!
//! Every section deserializes with defaults, so a config file only needs
//! the values it overrides. Durations are stored in milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use offsync_common::{Error, Result};

use crate::conflict::{CollisionPolicy, ResolutionStrategy};
use crate::retry::BackoffPolicy;
use crate::scheduler::SyncMode;

/// Cache Store limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Budget for the estimated size of all entries.
    pub max_size_bytes: u64,
    /// TTL for entries stored without an explicit one.
    pub default_ttl_ms: u64,
    /// Period of the background expiry sweep.
    pub sweep_interval_ms: u64,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 5 * 1024 * 1024,
            default_ttl_ms: 5 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
        }
    }
}

/// Action Queue limits and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued plus in-flight actions.
    pub max_size: usize,
    /// Delay between attempts of a failed action.
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Sync Channel reconnect behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Delay before the first reconnect; doubles per attempt.
    pub base_delay_ms: u64,
    /// Cap for the reconnect delay.
    pub max_delay_ms: u64,
    /// Consecutive failures after which the channel gives up.
    pub max_attempts: u32,
    /// Time allowed for a single connection attempt.
    pub connect_timeout_ms: u64,
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Backoff policy for reconnect attempts.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Reachability Monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    /// How long connectivity must stay unchanged before a transition is
    /// reported.
    pub debounce_ms: u64,
}

impl ReachabilityConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

/// Sync Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum events per outgoing `sync_batch`.
    pub batch_size: usize,
    /// Maximum actions dequeued per drain step.
    pub drain_batch_size: usize,
    /// Capacity of the recently processed events buffer.
    pub recent_events_capacity: usize,
    /// Strategy for conflicts on entities without their own.
    pub default_strategy: ResolutionStrategy,
    /// Three-way merge field collision policy.
    pub collision_policy: CollisionPolicy,
    /// When to run incremental syncs without being asked.
    pub sync_mode: SyncMode,
    /// TTL for entity records in the cache.
    pub entity_ttl_ms: u64,
}

impl OrchestratorConfig {
    pub fn entity_ttl(&self) -> Duration {
        Duration::from_millis(self.entity_ttl_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            drain_batch_size: 10,
            recent_events_capacity: 500,
            default_strategy: ResolutionStrategy::LastWriteWins,
            collision_policy: CollisionPolicy::RemoteWins,
            sync_mode: SyncMode::OnDemand,
            entity_ttl_ms: 30 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identity of this device in sync events.
    pub device_id: String,
    pub user_id: String,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub channel: ChannelConfig,
    pub reachability: ReachabilityConfig,
    pub orchestrator: OrchestratorConfig,
}

impl SyncConfig {
    /// Create a configuration with defaults for the given identity.
    pub fn new(device_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Set the cache section.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the queue section.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set the channel section.
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Set the reachability section.
    pub fn with_reachability(mut self, reachability: ReachabilityConfig) -> Self {
        self.reachability = reachability;
        self
    }

    /// Set the orchestrator section.
    pub fn with_orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::InvalidInput("device_id must not be empty".to_string()));
        }
        if self.queue.max_size == 0 {
            return Err(Error::InvalidInput("queue.max_size must be positive".to_string()));
        }
        if self.orchestrator.batch_size == 0 || self.orchestrator.drain_batch_size == 0 {
            return Err(Error::InvalidInput(
                "orchestrator batch sizes must be positive".to_string(),
            ));
        }
        if self.channel.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "channel.max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_id: "local-device".to_string(),
            user_id: String::new(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            channel: ChannelConfig::default(),
            reachability: ReachabilityConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}
