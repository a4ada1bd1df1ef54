//! Offline-first sync engine.
//!
//! This module keeps an application usable without connectivity and
//! converges its data with a remote system once connectivity returns:
//! - TTL- and size-bounded cache with durable persistence
//! - Persistent priority queue of offline actions with retry backoff
//! - Debounced reachability monitoring
//! - Persistent sync channel with a reconnect state machine
//! - Conflict resolution (last-write-wins, three-way merge, custom)
//! - Orchestration of all of the above behind one [`SyncOrchestrator`]

pub mod cache;
pub mod channel;
pub mod config;
pub mod conflict;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod reachability;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use cache::{CacheEntry, CacheMeta, CacheStats, CacheStore};
pub use channel::{
    ChannelEvent, ChannelEvents, ChannelState, MemoryPeer, MemoryTransport, SyncChannel,
    Transport, TransportConnection, TransportFrame, WebSocketTransport,
};
pub use config::{
    CacheConfig, ChannelConfig, OrchestratorConfig, QueueConfig, ReachabilityConfig, SyncConfig,
};
pub use conflict::{
    last_write_wins, CollisionPolicy, ConflictResolver, CustomResolver, EntityVersion, Resolution,
    ResolutionStrategy, SyncConflict, WinningVersion,
};
pub use orchestrator::{SyncBackends, SyncNotification, SyncOrchestrator, SyncStatus, STATE_KEY};
pub use protocol::{EventType, SyncEvent, SyncMessage};
pub use queue::{
    ActionQueue, ActionType, Enqueued, FailedAction, FailureOutcome, OfflineAction, Priority,
};
pub use reachability::{
    ConnectivityProvider, ManualConnectivity, TcpConnectivity, ReachabilityEvent,
    ReachabilityMonitor,
};
pub use remote::{HttpRemoteApi, RecordingRemote, RemoteApi, SyncResponse};
pub use retry::{BackoffPolicy, RetryExecutor};
pub use scheduler::{SyncMode, SyncReport, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{EntityRecord, EntityState, EventOutcome, ProcessedEvent, RecentEvents, SyncState};
