//! # Hooks
//!
//! Decision-function calls.
//!
//! A hook receives the parent, its observed children and whether the parent
//! is being finalized, and answers with the parent status plus the flat list
//! of desired children. The usual transport is an HTTP+JSON webhook; an
//! in-process closure can stand in for embedding and tests.

use crate::crd::{CompositeController, CompositeControllerHooks, Hook};
use crate::dynamic::ChildMap;
use crate::observability::metrics;
use async_trait::async_trait;
use kube::api::DynamicObject;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from a decision-function call
#[derive(Debug, Error)]
pub enum HookError {
    #[error("webhook request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("hook timed out after {0:?}")]
    Timeout(Duration),

    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("can't decode hook response: {0}")]
    Decode(String),

    /// An in-process hook refused the request
    #[error("{0}")]
    Failed(String),
}

/// Request body sent to a decision function
#[derive(Debug, Clone, Serialize)]
pub struct SyncRequest<'a> {
    pub controller: &'a CompositeController,
    pub parent: &'a DynamicObject,
    pub children: &'a ChildMap,
    pub finalizing: bool,
}

/// Response body returned by a decision function
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Replaces the parent status, with `observedGeneration` added; `None` leaves only that field
    #[serde(default)]
    pub status: Option<Map<String, Value>>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub children: Vec<DynamicObject>,

    /// Requeue the parent after this many seconds when positive
    #[serde(default, deserialize_with = "null_as_default")]
    pub resync_after_seconds: f64,

    /// Only meaningful for finalize calls
    #[serde(default, deserialize_with = "null_as_default")]
    pub finalized: bool,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A decision function
#[async_trait]
pub trait SyncHook: Send + Sync {
    async fn call(&self, request: &SyncRequest<'_>) -> Result<SyncResponse, HookError>;
}

/// Decision function reached over HTTP
#[derive(Debug, Clone)]
pub struct WebhookSyncHook {
    client: reqwest::Client,
    url: String,
}

impl WebhookSyncHook {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SyncHook for WebhookSyncHook {
    async fn call(&self, request: &SyncRequest<'_>) -> Result<SyncResponse, HookError> {
        debug!(url = %self.url, finalizing = request.finalizing, "calling webhook");
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(HookError::Transport)?;

        let status = response.status();
        let body = response.bytes().await.map_err(HookError::Transport)?;
        if !status.is_success() {
            return Err(HookError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        serde_json::from_slice(&body).map_err(|e| HookError::Decode(e.to_string()))
    }
}

type HookFn = dyn Fn(&SyncRequest<'_>) -> Result<SyncResponse, HookError> + Send + Sync;

/// Decision function implemented by a closure
#[derive(Clone)]
pub struct FnHook {
    func: Arc<HookFn>,
}

impl FnHook {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&SyncRequest<'_>) -> Result<SyncResponse, HookError> + Send + Sync + 'static,
    {
        Self { func: Arc::new(func) }
    }
}

impl std::fmt::Debug for FnHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHook").finish_non_exhaustive()
    }
}

#[async_trait]
impl SyncHook for FnHook {
    async fn call(&self, request: &SyncRequest<'_>) -> Result<SyncResponse, HookError> {
        (self.func)(request)
    }
}

/// A hook plus the deadline applied to each call
#[derive(Clone)]
pub struct TimedHook {
    hook: Arc<dyn SyncHook>,
    timeout: Duration,
    name: &'static str,
}

impl std::fmt::Debug for TimedHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedHook")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TimedHook {
    pub fn new(name: &'static str, hook: Arc<dyn SyncHook>, timeout: Duration) -> Self {
        Self { hook, timeout, name }
    }

    /// Call the hook, failing with [`HookError::Timeout`] past the deadline
    pub async fn call(&self, request: &SyncRequest<'_>) -> Result<SyncResponse, HookError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.hook.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(HookError::Timeout(self.timeout)),
        };
        let outcome = match &result {
            Ok(_) => "success",
            Err(HookError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        metrics::record_hook_call(self.name, outcome, started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!(hook = self.name, error = %e, "hook call failed");
        }
        result
    }
}

/// The decision functions configured for one CompositeController
#[derive(Debug, Clone)]
pub struct Hooks {
    pub sync: TimedHook,
    pub finalize: Option<TimedHook>,
}

impl Hooks {
    pub fn new(sync: TimedHook, finalize: Option<TimedHook>) -> Self {
        Self { sync, finalize }
    }

    /// Build webhook-backed hooks from configuration
    pub fn from_config(
        hooks: &CompositeControllerHooks,
        client: &reqwest::Client,
        default_timeout: Duration,
    ) -> Result<Self, String> {
        let sync = hooks
            .sync
            .as_ref()
            .ok_or_else(|| "sync hook is required".to_string())
            .and_then(|hook| webhook_hook("sync", hook, client, default_timeout))?;
        let finalize = hooks
            .finalize
            .as_ref()
            .map(|hook| webhook_hook("finalize", hook, client, default_timeout))
            .transpose()?;
        Ok(Self { sync, finalize })
    }

    /// The hook to call for a parent in the given state
    pub fn for_parent(&self, deleting: bool) -> &TimedHook {
        match (&self.finalize, deleting) {
            (Some(finalize), true) => finalize,
            _ => &self.sync,
        }
    }
}

fn webhook_hook(
    name: &'static str,
    hook: &Hook,
    client: &reqwest::Client,
    default_timeout: Duration,
) -> Result<TimedHook, String> {
    let webhook = hook
        .webhook
        .as_ref()
        .ok_or_else(|| format!("{name} hook has no webhook"))?;
    let timeout = webhook
        .timeout_duration()
        .map_err(|e| format!("{name} hook: {e}"))?
        .unwrap_or(default_timeout);
    Ok(TimedHook::new(
        name,
        Arc::new(WebhookSyncHook::new(client.clone(), webhook.url.clone())),
        timeout,
    ))
}
