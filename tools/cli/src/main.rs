//! offsync CLI - Command line interface for the offline sync engine.
//!
//! This tool inspects and manipulates the durable state of a device
//! (queued actions, cache, sync state) and can run the engine against a
//! remote endpoint.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use offsync_common::{ClockSource, EntityKey, SystemClock};
use offsync_storage::{create_default_registry, load_json, KeyValueStore};
use offsync_sync::{
    ActionQueue, ActionType, CacheStore, ConnectivityProvider, HttpRemoteApi, ManualConnectivity,
    OfflineAction, Priority, TcpConnectivity, SyncBackends, SyncConfig, SyncNotification,
    SyncOrchestrator, SyncState, WebSocketTransport, STATE_KEY,
};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "offsync - Offline-first sync engine")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding durable state (default: platform data dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Storage backend: "memory" or "local".
    #[arg(long, global = true, default_value = "local")]
    store: String,

    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or edit the action queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Inspect or edit the cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Inspect the sync state.
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Run the engine until interrupted.
    Run {
        /// Sync channel URL (ws:// or wss://).
        #[arg(long)]
        ws: String,

        /// Base URL of the remote API.
        #[arg(long)]
        api: String,

        /// host:port checked to detect connectivity (default: assume online).
        #[arg(long)]
        check_addr: Option<String>,

        /// Seconds between connectivity checks.
        #[arg(long, default_value = "5")]
        check_interval: u64,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued actions in dispatch order.
    List,

    /// List archived (permanently failed) actions.
    Failed,

    /// Queue a new action.
    Enqueue {
        /// Endpoint relative to the API base URL.
        #[arg(short, long)]
        endpoint: String,

        /// HTTP method.
        #[arg(short, long, default_value = "POST")]
        method: String,

        /// Action type: create, update, delete or sync.
        #[arg(short = 't', long, default_value = "create")]
        action_type: String,

        /// JSON payload.
        #[arg(short, long, default_value = "null")]
        payload: String,

        /// Priority: low, medium, high or critical.
        #[arg(long, default_value = "medium")]
        priority: String,

        /// Maximum attempts before archiving.
        #[arg(long, default_value = "3")]
        max_retries: u32,

        /// Entity the action changes, as type:id.
        #[arg(long)]
        entity: Option<String>,

        /// Ids of actions that must complete first.
        #[arg(long = "depends-on")]
        dependencies: Vec<String>,
    },

    /// Move an archived action back into the queue.
    Retry {
        /// Id of the archived action.
        id: String,
    },

    /// Drop every archived action.
    ClearFailed,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Print a cached value.
    Get {
        /// Cache key.
        key: String,
    },

    /// Remove entries whose key contains the pattern (all if omitted).
    Invalidate {
        /// Substring to match.
        pattern: Option<String>,
    },

    /// Remove expired entries.
    Sweep,
}

#[derive(Subcommand)]
enum StateCommands {
    /// Print the persisted sync state.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(cli.verbose, env.as_deref()))
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref()).await?;
    let store = open_store(&cli.store, cli.data_dir)?;
    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);

    match cli.command {
        Commands::Queue { command } => cmd_queue(command, store, clock, &config).await,
        Commands::Cache { command } => cmd_cache(command, store, clock, &config).await,
        Commands::State {
            command: StateCommands::Show,
        } => cmd_state_show(store).await,
        Commands::Run {
            ws,
            api,
            check_addr,
            check_interval,
        } => cmd_run(config, store, clock, &ws, &api, check_addr, check_interval).await,
    }
}

/// `RUST_LOG` directives when set and valid, else the `--verbose` level.
fn log_filter(verbose: bool, env: Option<&str>) -> EnvFilter {
    let fallback = if verbose { "debug" } else { "info" };
    env.and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback))
}

/// Read the configuration file. No flag or a missing file means defaults.
async fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };

    match tokio::fs::read_to_string(path).await {
        Ok(raw) => SyncConfig::from_json(&raw).context("Invalid configuration"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("Config {} not found, using defaults", path.display());
            Ok(SyncConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read config {}", path.display())),
    }
}

/// Resolve the storage backend.
fn open_store(name: &str, data_dir: Option<PathBuf>) -> Result<Arc<dyn KeyValueStore>> {
    let root = match data_dir {
        Some(dir) => dir,
        None => dirs::data_local_dir()
            .context("No local data directory on this platform, pass --data-dir")?
            .join("offsync"),
    };

    let registry = create_default_registry();
    let store = registry
        .resolve(name, serde_json::json!({ "root": root.to_string_lossy() }))
        .with_context(|| format!("Failed to open {} store", name))?;
    info!("Using {} store", store.name());
    Ok(store)
}

/// Parse a lowercase enum name through its serde representation.
fn parse_named<T: serde::de::DeserializeOwned>(what: &str, value: String) -> Result<T> {
    serde_json::from_value(Value::String(value.clone()))
        .with_context(|| format!("Invalid {}: {}", what, value))
}

async fn cmd_queue(
    command: QueueCommands,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn ClockSource>,
    config: &SyncConfig,
) -> Result<()> {
    let queue = ActionQueue::load(store, clock, config.queue.clone()).await;

    match command {
        QueueCommands::List => {
            let pending = queue.pending().await;
            if pending.is_empty() {
                println!("Queue is empty.");
            }
            for action in pending {
                let retry = action
                    .not_before
                    .map(|t| format!(" (retry after {})", format_ms(t)))
                    .unwrap_or_default();
                println!(
                    "  {} [{:?}] {} {} attempts {}/{}{}",
                    action.id,
                    action.priority,
                    action.method,
                    action.endpoint,
                    action.retry_count,
                    action.max_retries,
                    retry
                );
            }
        }

        QueueCommands::Failed => {
            let failed = queue.failed().await;
            if failed.is_empty() {
                println!("No failed actions.");
            }
            for entry in failed {
                println!(
                    "  {} {} {} failed at {}: {}",
                    entry.action.id,
                    entry.action.method,
                    entry.action.endpoint,
                    entry.failed_at.to_rfc3339(),
                    entry.error
                );
            }
        }

        QueueCommands::Enqueue {
            endpoint,
            method,
            action_type,
            payload,
            priority,
            max_retries,
            entity,
            dependencies,
        } => {
            let action_type: ActionType = parse_named("action type", action_type.to_uppercase())?;
            let priority: Priority = parse_named("priority", priority.to_lowercase())?;
            let payload: Value = serde_json::from_str(&payload).context("Payload is not valid JSON")?;

            let mut action = OfflineAction::new(action_type, endpoint, method, payload)
                .with_priority(priority)
                .with_max_retries(max_retries)
                .with_dependencies(dependencies);
            if let Some(entity) = entity {
                let (entity_type, entity_id) = entity
                    .split_once(':')
                    .context("Entity must be given as type:id")?;
                action = action.for_entity(EntityKey::new(entity_type, entity_id)?);
            }

            let id = queue.enqueue(action).await.context("Failed to enqueue action")?;
            println!("Queued action {}", id);
        }

        QueueCommands::Retry { id } => {
            let new_id = queue
                .retry_failed(&id)
                .await
                .context("Failed to requeue action")?;
            println!("Requeued {} as {}", id, new_id);
        }

        QueueCommands::ClearFailed => {
            let cleared = queue.clear_failed().await;
            println!("Cleared {} failed actions", cleared);
        }
    }

    Ok(())
}

async fn cmd_cache(
    command: CacheCommands,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn ClockSource>,
    config: &SyncConfig,
) -> Result<()> {
    let cache = CacheStore::new(store, clock, config.cache.clone());
    cache.hydrate().await;

    match command {
        CacheCommands::Get { key } => match cache.get_entry(&key).await {
            Some(entry) => {
                println!("{}", serde_json::to_string_pretty(&entry.data)?);
                println!(
                    "  stored {} ttl {}ms size {} bytes",
                    format_ms(entry.timestamp),
                    entry.ttl,
                    entry.size
                );
            }
            None => anyhow::bail!("No cached value for {}", key),
        },

        CacheCommands::Invalidate { pattern } => {
            let removed = cache.invalidate(pattern.as_deref()).await;
            println!("Invalidated {} entries", removed);
        }

        CacheCommands::Sweep => {
            let removed = cache.sweep().await;
            let stats = cache.stats().await;
            println!(
                "Removed {} expired entries, {} remain ({} bytes)",
                removed, stats.entries, stats.bytes
            );
        }
    }

    Ok(())
}

async fn cmd_state_show(store: Arc<dyn KeyValueStore>) -> Result<()> {
    let state: Option<SyncState> = load_json(store.as_ref(), STATE_KEY)
        .await
        .context("Failed to read sync state")?;

    let Some(state) = state else {
        println!("No sync state yet.");
        return Ok(());
    };

    println!("Sync State:");
    println!("  Device: {}", state.device_id);
    println!("  User: {}", state.user_id);
    println!("  Version: {}", state.sync_version);
    println!("  Last sync: {}", format_ms(state.last_sync_timestamp));
    println!("  Pending changes: {}", state.pending_changes().len());
    for change in state.pending_changes() {
        println!(
            "    {:?} {}/{} at {}",
            change.event_type,
            change.entity_type,
            change.entity_id,
            format_ms(change.timestamp)
        );
    }

    Ok(())
}

async fn cmd_run(
    config: SyncConfig,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn ClockSource>,
    ws: &str,
    api: &str,
    check_addr: Option<String>,
    check_interval: u64,
) -> Result<()> {
    let remote = HttpRemoteApi::new(api, Duration::from_secs(30))?;
    let connectivity: Arc<dyn ConnectivityProvider> = match check_addr {
        Some(addr) => Arc::new(TcpConnectivity::spawn(
            addr,
            Duration::from_secs(check_interval.max(1)),
            Duration::from_secs(3),
        )),
        None => Arc::new(ManualConnectivity::new(true)),
    };

    let backends = SyncBackends {
        store,
        clock,
        transport: Arc::new(WebSocketTransport::new()),
        channel_url: ws.to_string(),
        connectivity,
        remote: Arc::new(remote),
    };
    let orchestrator = SyncOrchestrator::new(config, backends)
        .await
        .context("Failed to start sync engine")?;

    let mut notifications = orchestrator.subscribe();
    orchestrator.start().await?;
    info!("Running, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = notifications.recv() => match received {
                Ok(notification) => print_notification(&notification),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    info!("Skipped {} notifications", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    orchestrator.stop().await;
    let status = orchestrator.status().await;
    println!(
        "Stopped: {} actions pending, {} failed, {} changes unsent, version {}",
        status.pending_actions, status.failed_actions, status.pending_changes, status.sync_version
    );
    Ok(())
}

fn print_notification(notification: &SyncNotification) {
    match notification {
        SyncNotification::DataSynced {
            entity, operation, ..
        } => println!("synced    {} ({:?})", entity, operation),
        SyncNotification::ConflictResolved {
            entity,
            winning_version,
            reason,
        } => println!("conflict  {} -> {} ({})", entity, winning_version, reason),
        SyncNotification::ActionSucceeded { action_id, .. } => println!("action    {} ok", action_id),
        SyncNotification::ActionFailed {
            action_id,
            error,
            will_retry,
        } => println!(
            "action    {} failed{}: {}",
            action_id,
            if *will_retry { ", will retry" } else { "" },
            error
        ),
        SyncNotification::SyncCompleted { timestamp, version } => {
            println!("sync      version {} at {}", version, format_ms(*timestamp))
        }
        SyncNotification::ReachabilityChanged { online } => {
            println!("network   {}", if *online { "online" } else { "offline" })
        }
        SyncNotification::ChannelStateChanged(state) => println!("channel   {:?}", state),
        SyncNotification::SyncError { message } => println!("error     {}", message),
    }
}

/// Format milliseconds since epoch as RFC 3339.
fn format_ms(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_sync::QueueConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_config_defaults() {
        let temp = TempDir::new().unwrap();

        assert_eq!(load_config(None).await.unwrap(), SyncConfig::default());
        let missing = temp.path().join("missing.json");
        assert_eq!(
            load_config(Some(&missing)).await.unwrap(),
            SyncConfig::default()
        );
    }

    #[tokio::test]
    async fn test_load_config_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("offsync.json");

        let config = SyncConfig::new("laptop", "ada").with_queue(QueueConfig {
            max_size: 5,
            ..QueueConfig::default()
        });
        tokio::fs::write(&path, config.to_json().unwrap()).await.unwrap();
        assert_eq!(load_config(Some(&path)).await.unwrap(), config);

        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(load_config(Some(&path)).await.is_err());
    }

    #[test]
    fn test_log_filter_prefers_env() {
        assert_eq!(log_filter(false, None).to_string(), "info");
        assert_eq!(log_filter(true, None).to_string(), "debug");
        assert_eq!(
            log_filter(false, Some("offsync_sync=trace")).to_string(),
            "offsync_sync=trace"
        );
        // Unparseable directives fall back to the flag
        assert_eq!(log_filter(true, Some("=!bad[")).to_string(), "debug");
    }
}
