//! Shared fixtures for the engine tests.
//!
//! Every test runs a real [`ParentController`] against a [`MemoryStore`],
//! with decision functions implemented as closures.

#![allow(dead_code, reason = "not every test binary uses every fixture")]

use composite_controller::controller::{
    ChildResources, ControllerError, FnHook, Hooks, ParentController, SyncResponse, TimedHook,
};
use composite_controller::crd::{CompositeController, ControllerRevision};
use composite_controller::dynamic::{MemoryStore, ObjectStore, ResolvedResource, RetryPolicy};
use kube::api::DynamicObject;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const NS: &str = "ns";

pub fn things() -> ResolvedResource {
    ResolvedResource::new("ctl.example.com/v1", "Thing", "things", true).with_status_subresource()
}

pub fn pods() -> ResolvedResource {
    ResolvedResource::new("v1", "Pod", "pods", true)
}

/// CompositeController for `things` owning `pods`, with `extra` merged into the spec
pub fn composite(extra: Value) -> CompositeController {
    let mut spec = json!({
        "parentResource": {"apiVersion": "ctl.example.com/v1", "resource": "things"},
        "childResources": [{"apiVersion": "v1", "resource": "pods"}],
        "hooks": {}
    });
    if let (Value::Object(spec), Value::Object(extra)) = (&mut spec, extra) {
        spec.extend(extra);
    }
    serde_json::from_value(json!({
        "apiVersion": "metacontroller.k8s.io/v1alpha1",
        "kind": "CompositeController",
        "metadata": {"name": "things"},
        "spec": spec
    }))
    .unwrap()
}

pub fn pod(name: &str, image: &str) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name},
        "spec": {"image": image}
    }))
    .unwrap()
}

/// One pod per name in `spec.pods`, all running `spec.image` and labelled
/// with `spec.selector.matchLabels`
pub fn pods_from_spec(parent: &DynamicObject) -> Vec<DynamicObject> {
    let spec = &parent.data["spec"];
    let image = spec["image"].as_str().unwrap_or_default();
    let labels: BTreeMap<String, String> =
        serde_json::from_value(spec["selector"]["matchLabels"].clone()).unwrap_or_default();
    spec["pods"]
        .as_array()
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(|name| {
                    let mut child = pod(name, image);
                    if !labels.is_empty() {
                        child.metadata.labels = Some(labels.clone());
                    }
                    child
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Decision function that desires [`pods_from_spec`] and reports how many it saw
pub fn image_hook() -> FnHook {
    FnHook::new(|request| {
        let mut status = serde_json::Map::new();
        status.insert("observedChildren".to_string(), json!(request.children.len()));
        Ok(SyncResponse {
            status: Some(status),
            children: pods_from_spec(request.parent),
            ..SyncResponse::default()
        })
    })
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub controller: ParentController,
}

impl Harness {
    pub fn new(config: CompositeController, sync: FnHook, finalize: Option<FnHook>) -> Self {
        let timed = |name, hook: FnHook| TimedHook::new(name, Arc::new(hook), Duration::from_secs(5));
        let hooks = Hooks::new(timed("sync", sync), finalize.map(|hook| timed("finalize", hook)));
        Self::with_hooks(config, hooks)
    }

    pub fn with_hooks(config: CompositeController, hooks: Hooks) -> Self {
        let store = Arc::new(MemoryStore::new());
        let children: ChildResources = [pods()].into_iter().collect();
        let retry = RetryPolicy {
            steps: 5,
            initial: Duration::from_millis(1),
            factor: 2,
        };
        let store_dyn = Arc::clone(&store) as Arc<dyn ObjectStore>;
        let controller = ParentController::new(config, things(), children, hooks, store_dyn, retry).unwrap();
        Self { store, controller }
    }

    pub fn seed_parent(&self, name: &str, spec: Value) -> DynamicObject {
        self.store.seed(
            &things().api_resource,
            serde_json::from_value(json!({
                "apiVersion": "ctl.example.com/v1",
                "kind": "Thing",
                "metadata": {"name": name, "namespace": NS},
                "spec": spec
            }))
            .unwrap(),
        )
    }

    pub fn parent(&self, name: &str) -> Option<DynamicObject> {
        self.store.object(&things().api_resource, Some(NS), name)
    }

    /// Reconcile the stored copy of a parent
    pub async fn pass(&self, name: &str) -> Result<Option<Duration>, ControllerError> {
        let parent = self.parent(name).expect("parent exists");
        self.controller.sync(&parent).await
    }

    /// Replace a parent's spec, as a user edit would
    pub async fn set_spec(&self, name: &str, spec: Value) {
        let mut parent = self.parent(name).expect("parent exists");
        parent.data["spec"] = spec;
        self.store.update(&things().api_resource, &parent).await.unwrap();
    }

    /// Mark a parent as deleted through the store
    pub async fn delete_parent(&self, name: &str) {
        self.store
            .delete(&things().api_resource, Some(NS), name, None)
            .await
            .unwrap();
    }

    /// Stored pods as name -> image
    pub fn pod_images(&self) -> BTreeMap<String, String> {
        self.store
            .objects(&pods().api_resource)
            .into_iter()
            .map(|pod| {
                let image = pod.data["spec"]["image"].as_str().unwrap_or_default().to_string();
                (pod.metadata.name.unwrap_or_default(), image)
            })
            .collect()
    }

    pub fn revisions(&self) -> Vec<ControllerRevision> {
        self.store
            .objects(&ControllerRevision::api_resource())
            .iter()
            .map(|obj| ControllerRevision::from_dynamic(obj).unwrap())
            .collect()
    }

    pub fn status(&self, name: &str) -> Value {
        self.parent(name)
            .and_then(|parent| parent.data.get("status").cloned())
            .unwrap_or(Value::Null)
    }
}
