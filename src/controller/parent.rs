//! # Parent
//!
//! One reconciliation pass for one parent object.
//!
//! A pass keeps the finalizer in shape, claims children, asks the decision
//! function (through revision history when rollouts are enabled) for the
//! desired children, converges the children, and writes the parent status.
//! Child-management failures are remembered but do not prevent the status
//! write; they are returned at the end of the pass.

use super::children::{ChildManager, ChildResources};
use super::claim::{AdoptionGuard, ClaimManager};
use super::error::ControllerError;
use super::hooks::{Hooks, SyncRequest, SyncResponse};
use super::strategy::UpdateStrategyMap;
use crate::constants::CONTROLLER_UID_LABEL;
use crate::crd::CompositeController;
use crate::dynamic::{
    atomic_status_update, atomic_update, display_name, is_deleting, relative_name, set_nested, uid_of,
    ChildMap, ObjectStore, ResolvedResource, RetryPolicy, Selector,
};
use crate::observability::metrics;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// Decision-function output after revision bookkeeping
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// New parent status
    pub status: Option<Map<String, Value>>,
    /// Desired children keyed relative to the parent
    pub children: ChildMap,
    /// Smallest positive resync request, in seconds
    pub resync_after_seconds: f64,
    /// Whether every decision function agreed finalization is done
    pub finalized: bool,
}

/// Reconciles parents of one CompositeController
pub struct ParentController {
    pub(super) config: CompositeController,
    pub(super) parent_resource: ResolvedResource,
    pub(super) children: ChildResources,
    pub(super) strategies: UpdateStrategyMap,
    pub(super) hooks: Hooks,
    pub(super) store: Arc<dyn ObjectStore>,
    pub(super) retry: RetryPolicy,
}

impl std::fmt::Debug for ParentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentController")
            .field("name", &self.config.name_any())
            .field("parent", &self.parent_resource.api_resource.kind)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl ParentController {
    /// Build a controller from configuration and resolved resource types.
    ///
    /// Update strategies are mapped from resource names to kinds here, so a
    /// child rule whose resource was not resolved is a configuration error.
    pub fn new(
        config: CompositeController,
        parent_resource: ResolvedResource,
        children: ChildResources,
        hooks: Hooks,
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
    ) -> Result<Self, ControllerError> {
        let mut strategies = UpdateStrategyMap::new();
        for rule in &config.spec.child_resources {
            let (kind, _) = children
                .iter()
                .find(|(_, r)| {
                    r.api_resource.api_version == rule.api_version && r.api_resource.plural == rule.resource
                })
                .ok_or_else(|| {
                    ControllerError::Config(format!(
                        "can't find child resource {:?} in {}",
                        rule.resource, rule.api_version
                    ))
                })?;
            if let Some(strategy) = &rule.update_strategy {
                strategies.insert(kind.group_kind(), strategy.clone());
            }
        }

        Ok(Self {
            config,
            parent_resource,
            children,
            strategies,
            hooks,
            store,
            retry,
        })
    }

    pub fn config(&self) -> &CompositeController {
        &self.config
    }

    pub fn parent_resource(&self) -> &ResolvedResource {
        &self.parent_resource
    }

    pub fn child_resources(&self) -> &ChildResources {
        &self.children
    }

    /// Reconcile one parent, returning when it should be looked at again
    #[instrument(
        skip_all,
        fields(parent = %display_name(parent), kind = %self.parent_resource.kind())
    )]
    pub async fn sync(&self, parent: &DynamicObject) -> Result<Option<Duration>, ControllerError> {
        let started = Instant::now();
        metrics::increment_reconciliations();
        let result = self.sync_parent(parent).await;
        metrics::observe_reconciliation_duration(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            metrics::increment_reconciliation_errors(e.reason());
        }
        result
    }

    async fn sync_parent(&self, parent: &DynamicObject) -> Result<Option<Duration>, ControllerError> {
        // Finalizer first, so anything done later can still be cleaned up
        let parent = self.sync_finalizer(parent).await?;

        let selector = self.make_selector(&parent, &[])?;
        let observed = self.claim_children(&parent, &selector).await?;

        let mut outcome = self.sync_revisions(&parent, &observed).await?;

        for (kind, children) in outcome.children.iter() {
            for (name, child) in children {
                if !selector.matches(child.labels()) {
                    return Err(ControllerError::InvalidChild {
                        kind: kind.to_string(),
                        name: name.clone(),
                        reason: format!("labels don't match parent selector {selector}"),
                    });
                }
            }
        }

        let requeue_after = self.requeue_after(outcome.resync_after_seconds);

        let parent = if outcome.finalized && is_deleting(&parent) && self.has_finalizer(&parent) {
            info!("finalize hook reports done, removing finalizer");
            self.remove_finalizer(&parent).await?
        } else {
            parent
        };

        let mut manage_error = None;
        if !is_deleting(&parent) || self.should_finalize(&parent) {
            let manager = ChildManager::new(self.store.as_ref(), &self.children, &self.strategies);
            if let Err(e) = manager.manage(&parent, &observed, &outcome.children).await {
                manage_error = Some(e);
            }
        }

        self.update_parent_status(&parent, outcome.status.take()).await?;

        match manage_error {
            Some(e) => Err(e),
            None => Ok(requeue_after),
        }
    }

    fn requeue_after(&self, resync_after_seconds: f64) -> Option<Duration> {
        let periodic = self.config.spec.resync_period_seconds.unwrap_or(0.0);
        [resync_after_seconds, periodic]
            .into_iter()
            .filter(|s| s.is_finite() && *s > 0.0)
            .reduce(f64::min)
            .map(Duration::from_secs_f64)
    }

    /// Selector used to claim children; `extra` labels are required too
    pub(super) fn make_selector(
        &self,
        parent: &DynamicObject,
        extra: &[(&str, &str)],
    ) -> Result<Selector, ControllerError> {
        let selector = if self.config.generate_selector() {
            Selector::from_labels([(CONTROLLER_UID_LABEL, uid_of(parent))])
        } else {
            let label_selector: LabelSelector = parent
                .data
                .get("spec")
                .and_then(|spec| spec.get("selector"))
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| ControllerError::Config(format!(
                    "can't get label selector from {}: {e}",
                    display_name(parent)
                )))?
                .unwrap_or_default();
            Selector::from_label_selector(&label_selector).map_err(|source| ControllerError::Selector {
                parent: display_name(parent),
                source,
            })?
        };
        Ok(selector.with_labels(extra.iter().copied()))
    }

    async fn claim_children(&self, parent: &DynamicObject, selector: &Selector) -> Result<ChildMap, ControllerError> {
        let guard = AdoptionGuard::new(self.store.as_ref(), &self.parent_resource.api_resource, parent);
        let claims = ClaimManager::new(self.store.as_ref(), parent, selector, &self.retry, &guard);
        // Children of a cluster-scoped parent may live in any namespace
        let namespace = self
            .parent_resource
            .namespaced
            .then(|| parent.namespace())
            .flatten();

        let mut observed = ChildMap::new();
        let mut errors = Vec::new();
        for (kind, resource) in self.children.iter() {
            observed.ensure_kind(kind.clone());
            let candidates = self
                .store
                .list(&resource.api_resource, namespace.as_deref())
                .await
                .map_err(|e| ControllerError::store(format!("can't list {} children", kind.kind), e))?;

            let (claimed, claim_errors) = claims.claim(&resource.api_resource, candidates).await;
            errors.extend(claim_errors);
            for child in claimed {
                observed.insert(relative_name(parent, &child), child);
            }
        }

        ControllerError::aggregate(errors)?;
        debug!(children = observed.len(), "claimed children");
        Ok(observed)
    }

    /// Call the hook matching the parent's lifecycle state
    pub(super) async fn call_hook(
        &self,
        parent: &DynamicObject,
        observed: &ChildMap,
    ) -> Result<SyncResponse, ControllerError> {
        let finalizing = is_deleting(parent) && self.hooks.finalize.is_some();
        let request = SyncRequest {
            controller: &self.config,
            parent,
            children: observed,
            finalizing,
        };
        self.hooks
            .for_parent(finalizing)
            .call(&request)
            .await
            .map_err(|source| ControllerError::Hook {
                parent: format!("{} {}", self.parent_resource.kind(), display_name(parent)),
                source,
            })
    }

    /// Normalize hook output before it is compared with observed children.
    ///
    /// Children without a namespace inherit the parent's, and with a generated
    /// selector every child carries the `controller-uid` label.
    pub(super) fn prepare_children(&self, parent: &DynamicObject, children: &mut [DynamicObject]) {
        let namespace = parent.namespace().filter(|ns| !ns.is_empty());
        for child in children.iter_mut() {
            if let Some(ns) = &namespace {
                if child.namespace().is_none_or(|n| n.is_empty()) {
                    child.metadata.namespace = Some(ns.clone());
                }
            }
            if self.config.generate_selector() {
                child
                    .labels_mut()
                    .entry(CONTROLLER_UID_LABEL.to_string())
                    .or_insert_with(|| uid_of(parent).to_string());
            }
        }
    }

    pub(super) fn desired_map(&self, parent: &DynamicObject, mut children: Vec<DynamicObject>) -> ChildMap {
        self.prepare_children(parent, &mut children);
        ChildMap::from_list(parent, children)
    }

    fn has_finalizer(&self, parent: &DynamicObject) -> bool {
        let name = self.config.finalizer_name();
        parent.finalizers().iter().any(|f| *f == name)
    }

    /// Whether a pending-deletion parent still gets its children managed
    pub(super) fn should_finalize(&self, parent: &DynamicObject) -> bool {
        self.hooks.finalize.is_some() && self.has_finalizer(parent)
    }

    async fn sync_finalizer(&self, parent: &DynamicObject) -> Result<DynamicObject, ControllerError> {
        let name = self.config.finalizer_name();
        let wanted = self.hooks.finalize.is_some();
        let present = self.has_finalizer(parent);

        if wanted && !present && !is_deleting(parent) {
            debug!(finalizer = %name, "adding finalizer");
            return atomic_update(self.store.as_ref(), &self.parent_resource.api_resource, parent, &self.retry, |obj| {
                if obj.finalizers().iter().any(|f| *f == name) {
                    return false;
                }
                obj.finalizers_mut().push(name.clone());
                true
            })
            .await
            .map_err(|e| ControllerError::store(format!("can't add finalizer to {}", display_name(parent)), e));
        }
        if !wanted && present {
            return self.remove_finalizer(parent).await;
        }
        Ok(parent.clone())
    }

    async fn remove_finalizer(&self, parent: &DynamicObject) -> Result<DynamicObject, ControllerError> {
        let name = self.config.finalizer_name();
        debug!(finalizer = %name, "removing finalizer");
        atomic_update(self.store.as_ref(), &self.parent_resource.api_resource, parent, &self.retry, |obj| {
            if !obj.finalizers().iter().any(|f| *f == name) {
                return false;
            }
            obj.finalizers_mut().retain(|f| *f != name);
            true
        })
        .await
        .map_err(|e| ControllerError::store(format!("can't remove finalizer from {}", display_name(parent)), e))
    }

    async fn update_parent_status(
        &self,
        parent: &DynamicObject,
        status: Option<Map<String, Value>>,
    ) -> Result<(), ControllerError> {
        let mut status = status.unwrap_or_default();
        // Injected before comparing, so an unchanged status is a true no-op
        status.insert(
            "observedGeneration".to_string(),
            Value::from(parent.metadata.generation.unwrap_or(0)),
        );
        let status = Value::Object(status);

        let mutate = |obj: &mut DynamicObject| {
            if obj.data.get("status") == Some(&status) {
                return false;
            }
            set_nested(&mut obj.data, &["status"], status.clone());
            true
        };
        let store = self.store.as_ref();
        let resource = &self.parent_resource.api_resource;
        let result = if self.parent_resource.status_subresource {
            atomic_status_update(store, resource, parent, &self.retry, mutate).await
        } else {
            atomic_update(store, resource, parent, &self.retry, mutate).await
        };

        match result {
            Ok(_) => Ok(()),
            // The parent is gone or changed under us; the next pass will catch up
            Err(e) if e.is_not_found() || e.is_conflict() || e.is_gone() => {
                debug!(error = %e, "skipping status update");
                Ok(())
            }
            Err(e) => Err(ControllerError::store(
                format!("can't update status for {}", display_name(parent)),
                e,
            )),
        }
    }
}
