//! # Parent Controller Runtime
//!
//! Runs one [`ParentController`] on top of a `kube-runtime` controller.
//!
//! Parents are watched directly and children through their controller
//! owner references, so any child change requeues its parent. Hook-requested
//! resyncs and error backoff both go through the returned [`Action`].

use crate::config::ControllerConfig;
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::{ChildResources, ControllerError, Hooks, ParentController};
use crate::crd::CompositeController;
use crate::dynamic::{discovery, display_name, ObjectStore, ResolvedResource};
use crate::observability::metrics;
use crate::runtime::error_policy::handle_reconciliation_error;
use crate::runtime::supervisor::ControllerFactory;
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::discovery::Discovery;
use kube::{Client, ResourceExt};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::watcher;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared state for one running CompositeController
pub struct ParentContext {
    /// Name of the CompositeController
    pub name: String,
    pub controller: ParentController,
    /// Per-parent error backoff, keyed by `namespace/name`
    pub backoff_states: Mutex<HashMap<String, FibonacciBackoff>>,
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
}

impl std::fmt::Debug for ParentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentContext")
            .field("name", &self.name)
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl ParentContext {
    pub fn new(controller: ParentController, config: &ControllerConfig) -> Self {
        Self {
            name: controller.config().name_any(),
            controller,
            backoff_states: Mutex::new(HashMap::new()),
            backoff_min_secs: config.error_backoff_min_secs,
            backoff_max_secs: config.error_backoff_max_secs,
        }
    }

    fn reset_backoff(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(key);
        }
    }
}

/// Reconcile one parent and translate the outcome into a requeue action
pub async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<ParentContext>) -> Result<Action, ControllerError> {
    let requeue = ctx.controller.sync(&obj).await?;
    ctx.reset_backoff(&display_name(&obj));
    Ok(match requeue {
        Some(after) => {
            metrics::increment_requeues_total("resync");
            Action::requeue(after)
        }
        None => Action::await_change(),
    })
}

/// Resolve the resources a CompositeController names and build its engine
pub fn build_parent_controller(
    discovery: &Discovery,
    config: &CompositeController,
    store: Arc<dyn ObjectStore>,
    hooks: Hooks,
    controller_config: &ControllerConfig,
) -> Result<ParentController, ControllerError> {
    let rule = &config.spec.parent_resource;
    let parent_resource = discovery::resolve(discovery, &rule.api_version, &rule.resource)
        .map_err(|e| ControllerError::store("can't resolve parent resource", e))?;

    let children = config
        .spec
        .child_resources
        .iter()
        .map(|child| {
            discovery::resolve(discovery, &child.api_version, &child.resource)
                .map_err(|e| ControllerError::store("can't resolve child resource", e))
        })
        .collect::<Result<Vec<ResolvedResource>, _>>()?
        .into_iter()
        .collect::<ChildResources>();

    ParentController::new(
        config.clone(),
        parent_resource,
        children,
        hooks,
        store,
        controller_config.retry_policy(),
    )
}

/// Namespace to scope a watch to; cluster-scoped resources are always watched cluster-wide
fn watch_scope<'a>(watch_namespace: Option<&'a str>, resource: &ResolvedResource) -> Option<&'a str> {
    watch_namespace.filter(|_| resource.namespaced)
}

/// Watch parents and owned children until `stop` flips to true
pub async fn run_parent_controller(
    client: Client,
    ctx: Arc<ParentContext>,
    watch_namespace: Option<String>,
    mut stop: watch::Receiver<bool>,
) {
    let parent_resource = ctx.controller.parent_resource();
    let parent = parent_resource.api_resource.clone();
    let api_for = |resource: &ResolvedResource| -> Api<DynamicObject> {
        match watch_scope(watch_namespace.as_deref(), resource) {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &resource.api_resource),
            None => Api::all_with(client.clone(), &resource.api_resource),
        }
    };

    let mut controller = Controller::new_with(api_for(parent_resource), watcher::Config::default(), parent.clone());
    for (kind, child) in ctx.controller.child_resources().iter() {
        debug!(controller = %ctx.name, kind = %kind, "watching owned children");
        controller = controller.owns_with(
            api_for(child),
            child.api_resource.clone(),
            watcher::Config::default(),
        );
    }

    info!(controller = %ctx.name, parent = %parent.kind, "starting parent controller");
    let name = ctx.name.clone();
    controller
        .graceful_shutdown_on(async move {
            if stop.wait_for(|stopped| *stopped).await.is_err() {
                debug!("stop signal sender dropped");
            }
        })
        .run(reconcile, handle_reconciliation_error, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(parent = %obj.name, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;
    info!(controller = %name, "parent controller stopped");
}

/// Starts parent controllers against the API server
#[derive(Clone)]
pub struct KubeControllerFactory {
    client: Client,
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
    config: ControllerConfig,
}

impl std::fmt::Debug for KubeControllerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeControllerFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KubeControllerFactory {
    pub fn new(client: Client, store: Arc<dyn ObjectStore>, config: ControllerConfig) -> Self {
        Self {
            client,
            store,
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ControllerFactory for KubeControllerFactory {
    async fn start(
        &self,
        config: &CompositeController,
        stop: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, ControllerError> {
        // Fresh discovery, so newly installed parent or child CRDs are found
        let discovery = discovery::run(self.client.clone())
            .await
            .map_err(|e| ControllerError::store("can't run API discovery", e))?;
        let hooks = Hooks::from_config(&config.spec.hooks, &self.http, self.config.hook_timeout())
            .map_err(ControllerError::Config)?;
        let controller = build_parent_controller(&discovery, config, Arc::clone(&self.store), hooks, &self.config)?;
        let ctx = Arc::new(ParentContext::new(controller, &self.config));

        Ok(tokio::spawn(run_parent_controller(
            self.client.clone(),
            ctx,
            self.config.watch_namespace.clone(),
            stop,
        )))
    }
}
