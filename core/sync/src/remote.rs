//! Request/response surface of the remote system.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use url::Url;

use offsync_common::{Error, Result};

use crate::protocol::SyncEvent;
use crate::queue::OfflineAction;
use crate::retry::{BackoffPolicy, RetryExecutor};

/// Changes returned by an incremental or full sync request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub events: Vec<SyncEvent>,
    /// Server sync point after these events.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub version: u64,
}

/// The remote API queued actions and sync requests are executed against.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Execute one queued action. Returns the response body.
    ///
    /// # Errors
    /// - `ActionExecution` if the remote rejected the action
    /// - `Transport` if the request could not be delivered
    async fn execute(&self, action: &OfflineAction) -> Result<Value>;

    /// Changes after `since` at `version`.
    async fn incremental_sync(&self, since: u64, version: u64) -> Result<SyncResponse>;

    /// The complete data set.
    async fn full_sync(&self) -> Result<SyncResponse>;
}

/// [`RemoteApi`] over HTTP.
///
/// Sync requests go to `GET {base}/sync?since=&version=` and
/// `GET {base}/sync/full` and are retried in place on transient failures.
/// Actions are not: the queue owns their retries.
pub struct HttpRemoteApi {
    http: Client,
    base_url: Url,
    retry: RetryExecutor,
}

impl HttpRemoteApi {
    /// Create a client for `base_url`.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid API URL {}: {}", base_url, e)))?;

        let http = Client::builder()
            .user_agent("offsync/0.1")
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;

        let retry = RetryExecutor::new(
            BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(5)),
            2,
        );

        Ok(Self {
            http,
            base_url,
            retry,
        })
    }

    /// Replace the retry policy for sync requests.
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    fn url_for(&self, endpoint: &str) -> Result<Url> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", endpoint, e)))
    }

    async fn fetch_sync(&self, url: Url, query: &[(&str, u64)], what: &str) -> Result<SyncResponse> {
        self.retry
            .execute(|| {
                let mut request = self.http.get(url.clone());
                if !query.is_empty() {
                    request = request.query(query);
                }
                read_sync_response(request, what)
            })
            .await
    }
}

async fn read_sync_response(request: reqwest::RequestBuilder, what: &str) -> Result<SyncResponse> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::Transport(format!("{} request failed: {}", what, e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::ActionExecution {
            action_id: what.to_string(),
            status: Some(status.as_u16()),
            message: body,
        });
    }

    response
        .json()
        .await
        .map_err(|e| Error::Parse(format!("Invalid {} response: {}", what, e)))
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn execute(&self, action: &OfflineAction) -> Result<Value> {
        let method = Method::from_bytes(action.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::InvalidInput(format!("Invalid HTTP method: {}", action.method)))?;
        let url = self.url_for(&action.endpoint)?;

        let mut request = self.http.request(method.clone(), url);
        for (name, value) in &action.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !(action.payload.is_null() && (method == Method::GET || method == Method::DELETE)) {
            request = request.json(&action.payload);
        }

        debug!("Executing {} {} ({})", method, action.endpoint, action.id);
        let response = request.send().await.map_err(|e| {
            Error::Transport(format!("Action {} could not be delivered: {}", action.id, e))
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Error::ActionExecution {
                action_id: action.id.clone(),
                status: Some(status.as_u16()),
                message: body,
            });
        }
        if body.trim().is_empty() || status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    async fn incremental_sync(&self, since: u64, version: u64) -> Result<SyncResponse> {
        let query = [("since", since), ("version", version)];
        self.fetch_sync(self.url_for("sync")?, &query, "incremental-sync")
            .await
    }

    async fn full_sync(&self) -> Result<SyncResponse> {
        self.fetch_sync(self.url_for("sync/full")?, &[], "full-sync")
            .await
    }
}

#[derive(Default)]
struct RecordingState {
    executed: Vec<OfflineAction>,
    failures: HashMap<String, Option<u32>>,
    feed: SyncResponse,
    reject_incremental: bool,
    incremental_calls: Vec<(u64, u64)>,
    full_calls: usize,
}

/// Scriptable in-memory [`RemoteApi`] for tests and dry runs.
#[derive(Default)]
pub struct RecordingRemote {
    state: Mutex<RecordingState>,
}

impl RecordingRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` executions against `endpoint` with a 503.
    pub fn fail_endpoint(&self, endpoint: impl Into<String>, times: u32) {
        self.lock().failures.insert(endpoint.into(), Some(times));
    }

    /// Fail every execution against `endpoint` with a 503.
    pub fn fail_endpoint_always(&self, endpoint: impl Into<String>) {
        self.lock().failures.insert(endpoint.into(), None);
    }

    /// Events served by incremental and full syncs.
    pub fn set_feed(&self, feed: SyncResponse) {
        self.lock().feed = feed;
    }

    /// Make incremental syncs fail as if the version were stale.
    pub fn reject_incremental(&self, reject: bool) {
        self.lock().reject_incremental = reject;
    }

    /// Successfully executed actions, in order.
    pub fn executed(&self) -> Vec<OfflineAction> {
        self.lock().executed.clone()
    }

    /// `(since, version)` of every incremental sync request.
    pub fn incremental_calls(&self) -> Vec<(u64, u64)> {
        self.lock().incremental_calls.clone()
    }

    /// Number of full sync requests.
    pub fn full_calls(&self) -> usize {
        self.lock().full_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RemoteApi for RecordingRemote {
    async fn execute(&self, action: &OfflineAction) -> Result<Value> {
        let mut state = self.lock();

        let fail = match state.failures.get_mut(&action.endpoint) {
            Some(None) => true,
            Some(Some(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if fail {
            return Err(Error::ActionExecution {
                action_id: action.id.clone(),
                status: Some(503),
                message: "scripted failure".to_string(),
            });
        }

        state.executed.push(action.clone());
        Ok(serde_json::json!({ "id": action.id }))
    }

    async fn incremental_sync(&self, since: u64, version: u64) -> Result<SyncResponse> {
        let mut state = self.lock();
        state.incremental_calls.push((since, version));
        if state.reject_incremental {
            return Err(Error::ActionExecution {
                action_id: "incremental-sync".to_string(),
                status: Some(409),
                message: "stale sync version".to_string(),
            });
        }

        let mut response = state.feed.clone();
        response.events.retain(|e| e.timestamp > since);
        Ok(response)
    }

    async fn full_sync(&self) -> Result<SyncResponse> {
        let mut state = self.lock();
        state.full_calls += 1;
        Ok(state.feed.clone())
    }
}
