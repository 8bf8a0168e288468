//! # In-Memory Object Store
//!
//! [`ObjectStore`] kept entirely in process memory.
//!
//! Mirrors the API server behavior the engine depends on: UIDs and
//! resourceVersions are assigned on create, stale resourceVersions and UID
//! preconditions produce conflicts, `generation` moves when anything outside
//! metadata and status changes, and objects with finalizers are only marked
//! for deletion. There is no garbage collection of dependents.
//!
//! Every successful write is recorded as a [`StoreAction`], and failures can be
//! injected per operation and object name.

use super::store::{ObjectStore, StoreError};
use super::{display_name, uid_of};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Store operation, used for failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// A successful write, in order of execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAction {
    Create { kind: String, name: String },
    Update { kind: String, name: String },
    UpdateStatus { kind: String, name: String },
    Delete { kind: String, name: String },
}

type ObjectKey = (String, String, String, String);

#[derive(Debug, Clone)]
enum Injected {
    Conflicts(u32),
    Failure(String),
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    next_version: u64,
    actions: Vec<StoreAction>,
    injected: HashMap<(StoreOp, String), Injected>,
}

/// Thread-safe in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> ObjectKey {
    (
        resource.api_version.clone(),
        resource.plural.clone(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn not_found(resource: &ApiResource, name: &str) -> StoreError {
    StoreError::NotFound {
        kind: resource.kind.clone(),
        name: name.to_string(),
    }
}

fn conflict(resource: &ApiResource, name: &str, message: &str) -> StoreError {
    StoreError::Conflict {
        kind: resource.kind.clone(),
        name: name.to_string(),
        message: message.to_string(),
    }
}

/// Object content that participates in `generation`
fn spec_content(obj: &DynamicObject) -> Value {
    let mut data = obj.data.clone();
    if let Value::Object(fields) = &mut data {
        fields.remove("status");
    }
    data
}

fn deletion_time() -> Option<Time> {
    serde_json::from_value(Value::String("2024-01-01T00:00:00Z".to_string())).ok()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the store for the others
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert or overwrite an object directly, bypassing version checks.
    ///
    /// Missing UID, resourceVersion and generation are filled in.
    pub fn seed(&self, resource: &ApiResource, mut obj: DynamicObject) -> DynamicObject {
        let mut state = self.lock();
        state.next_version += 1;
        let version = state.next_version;
        obj.types.get_or_insert_with(|| kube::core::TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        obj.metadata
            .uid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        obj.metadata.resource_version = Some(version.to_string());
        obj.metadata.generation.get_or_insert(1);
        let k = key(resource, obj.namespace().as_deref(), &obj.name_any());
        state.objects.insert(k, obj.clone());
        obj
    }

    /// Current stored copy of an object
    pub fn object(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        self.lock()
            .objects
            .get(&key(resource, namespace, name))
            .cloned()
    }

    /// All stored objects of a resource
    pub fn objects(&self, resource: &ApiResource) -> Vec<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .filter(|((api_version, plural, _, _), _)| {
                *api_version == resource.api_version && *plural == resource.plural
            })
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// Overwrite the status of a stored object, as another controller would
    pub fn set_status(&self, resource: &ApiResource, namespace: Option<&str>, name: &str, status: Value) {
        let mut state = self.lock();
        state.next_version += 1;
        let version = state.next_version;
        if let Some(obj) = state.objects.get_mut(&key(resource, namespace, name)) {
            if let Value::Object(fields) = &mut obj.data {
                fields.insert("status".to_string(), status);
            }
            obj.metadata.resource_version = Some(version.to_string());
        }
    }

    /// Successful writes so far
    pub fn actions(&self) -> Vec<StoreAction> {
        self.lock().actions.clone()
    }

    pub fn clear_actions(&self) {
        self.lock().actions.clear();
    }

    /// Make the next `times` writes of `op` on `name` fail with a conflict
    pub fn inject_conflicts(&self, op: StoreOp, name: &str, times: u32) {
        self.lock()
            .injected
            .insert((op, name.to_string()), Injected::Conflicts(times));
    }

    /// Make every `op` on `name` fail until [`MemoryStore::clear_failures`]
    pub fn inject_failure(&self, op: StoreOp, name: &str, message: &str) {
        self.lock().injected.insert(
            (op, name.to_string()),
            Injected::Failure(message.to_string()),
        );
    }

    pub fn clear_failures(&self) {
        self.lock().injected.clear();
    }

    fn check_injected(state: &mut State, op: StoreOp, resource: &ApiResource, name: &str) -> Result<(), StoreError> {
        let k = (op, name.to_string());
        match state.injected.get_mut(&k) {
            Some(Injected::Failure(message)) => Err(StoreError::Other(message.clone())),
            Some(Injected::Conflicts(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(conflict(resource, name, "injected conflict"))
            }
            _ => Ok(()),
        }
    }

    fn record(state: &mut State, action: StoreAction) {
        state.actions.push(action);
    }

    fn write_existing(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
        op: StoreOp,
    ) -> Result<DynamicObject, StoreError> {
        let mut state = self.lock();
        let name = obj.name_any();
        Self::check_injected(&mut state, op, resource, &name)?;

        let k = key(resource, obj.namespace().as_deref(), &name);
        let stored = state
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| not_found(resource, &name))?;

        if obj.metadata.uid.is_some() && uid_of(obj) != uid_of(&stored) {
            return Err(conflict(resource, &name, "uid precondition failed"));
        }
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != stored.metadata.resource_version
        {
            return Err(conflict(
                resource,
                &name,
                "the object has been modified; please apply your changes to the latest version and try again",
            ));
        }

        let mut next = match op {
            StoreOp::UpdateStatus => {
                let mut next = stored.clone();
                let status = obj.data.get("status").cloned();
                if let Value::Object(fields) = &mut next.data {
                    match status {
                        Some(status) => fields.insert("status".to_string(), status),
                        None => fields.remove("status"),
                    };
                }
                next
            }
            _ => {
                let mut next = obj.clone();
                // Store-managed fields are never taken from the client
                next.metadata.uid = stored.metadata.uid.clone();
                next.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
                next.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
                next.metadata.generation = stored.metadata.generation;
                if spec_content(&next) != spec_content(&stored) {
                    next.metadata.generation = Some(stored.metadata.generation.unwrap_or(0) + 1);
                }
                if let Some(status) = stored.data.get("status") {
                    if let Value::Object(fields) = &mut next.data {
                        fields.insert("status".to_string(), status.clone());
                    }
                }
                next
            }
        };

        state.next_version += 1;
        next.metadata.resource_version = Some(state.next_version.to_string());

        let kind = resource.kind.clone();
        let display = display_name(&next);
        Self::record(
            &mut state,
            match op {
                StoreOp::UpdateStatus => StoreAction::UpdateStatus { kind, name: display },
                _ => StoreAction::Update { kind, name: display },
            },
        );

        if next.metadata.deletion_timestamp.is_some() && next.finalizers().is_empty() {
            state.objects.remove(&k);
        } else {
            state.objects.insert(k, next.clone());
        }
        Ok(next)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        Ok(self
            .objects(resource)
            .into_iter()
            .filter(|obj| match namespace {
                Some(ns) if !ns.is_empty() => obj.namespace().as_deref() == Some(ns),
                _ => true,
            })
            .collect())
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, StoreError> {
        let mut state = self.lock();
        Self::check_injected(&mut state, StoreOp::Get, resource, name)?;
        state
            .objects
            .get(&key(resource, namespace, name))
            .cloned()
            .ok_or_else(|| not_found(resource, name))
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let mut state = self.lock();
        let name = obj.name_any();
        Self::check_injected(&mut state, StoreOp::Create, resource, &name)?;

        let k = key(resource, obj.namespace().as_deref(), &name);
        if state.objects.contains_key(&k) {
            return Err(StoreError::AlreadyExists {
                kind: resource.kind.clone(),
                name,
            });
        }

        let mut created = obj.clone();
        created.types.get_or_insert_with(|| kube::core::TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.generation = Some(1);
        created.metadata.deletion_timestamp = None;
        state.next_version += 1;
        created.metadata.resource_version = Some(state.next_version.to_string());

        Self::record(
            &mut state,
            StoreAction::Create {
                kind: resource.kind.clone(),
                name: display_name(&created),
            },
        );
        state.objects.insert(k, created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        self.write_existing(resource, obj, StoreOp::Update)
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        self.write_existing(resource, obj, StoreOp::UpdateStatus)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        uid: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check_injected(&mut state, StoreOp::Delete, resource, name)?;

        let k = key(resource, namespace, name);
        let stored = state
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| not_found(resource, name))?;
        if let Some(uid) = uid {
            if uid != uid_of(&stored) {
                return Err(conflict(resource, name, "uid precondition failed"));
            }
        }

        Self::record(
            &mut state,
            StoreAction::Delete {
                kind: resource.kind.clone(),
                name: display_name(&stored),
            },
        );

        if stored.finalizers().is_empty() {
            state.objects.remove(&k);
        } else if stored.metadata.deletion_timestamp.is_none() {
            let mut marked = stored;
            marked.metadata.deletion_timestamp = deletion_time();
            state.next_version += 1;
            marked.metadata.resource_version = Some(state.next_version.to_string());
            state.objects.insert(k, marked);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::GroupVersionKind;
    use serde_json::json;

    fn pods() -> ApiResource {
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("", "v1", "Pod"), "pods")
    }

    fn pod(name: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &pods()).within("ns");
        obj.data = json!({"spec": {"image": "a"}});
        obj
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = MemoryStore::new();
        let created = store.create(&pods(), &pod("a")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.generation, Some(1));

        let err = store.create(&pods(), &pod("a")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&pods(), &pod("a")).await.unwrap();

        let mut first = created.clone();
        first.data["spec"]["image"] = json!("b");
        let updated = store.update(&pods(), &first).await.unwrap();
        assert_eq!(updated.metadata.generation, Some(2));

        let err = store.update(&pods(), &created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_keeps_status() {
        let store = MemoryStore::new();
        store.create(&pods(), &pod("a")).await.unwrap();
        store.set_status(&pods(), Some("ns"), "a", json!({"phase": "Running"}));

        let mut fresh = store.get(&pods(), Some("ns"), "a").await.unwrap();
        fresh.data["status"] = json!({"phase": "Hacked"});
        let updated = store.update(&pods(), &fresh).await.unwrap();
        assert_eq!(updated.data["status"], json!({"phase": "Running"}));
    }

    #[tokio::test]
    async fn test_delete_with_uid_precondition() {
        let store = MemoryStore::new();
        let created = store.create(&pods(), &pod("a")).await.unwrap();

        let err = store
            .delete(&pods(), Some("ns"), "a", Some("other-uid"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        store
            .delete(&pods(), Some("ns"), "a", created.metadata.uid.as_deref())
            .await
            .unwrap();
        assert!(store.object(&pods(), Some("ns"), "a").is_none());
        assert!(store
            .delete(&pods(), Some("ns"), "a", None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_finalizers_defer_deletion() {
        let store = MemoryStore::new();
        let mut obj = pod("a");
        obj.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
        store.create(&pods(), &obj).await.unwrap();

        store.delete(&pods(), Some("ns"), "a", None).await.unwrap();
        let mut marked = store.object(&pods(), Some("ns"), "a").unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        marked.metadata.finalizers = None;
        store.update(&pods(), &marked).await.unwrap();
        assert!(store.object(&pods(), Some("ns"), "a").is_none());
    }

    #[tokio::test]
    async fn test_injected_conflicts_run_out() {
        let store = MemoryStore::new();
        let created = store.create(&pods(), &pod("a")).await.unwrap();
        store.inject_conflicts(StoreOp::Update, "a", 1);

        assert!(store.update(&pods(), &created).await.unwrap_err().is_conflict());
        assert!(store.update(&pods(), &created).await.is_ok());
    }
}
