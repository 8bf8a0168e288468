//! # Dynamic Objects
//!
//! Untyped object access shared by the reconciliation engine.
//!
//! Parents and children are arbitrary resource types known only at runtime,
//! so they are handled as [`DynamicObject`]s and plain JSON values.

mod child_map;
pub mod discovery;
mod kube_store;
mod memory;
mod selector;
mod store;

pub use child_map::{ChildKind, ChildMap, GroupKind};
pub use discovery::ResolvedResource;
pub use kube_store::KubeStore;
pub use memory::{MemoryStore, StoreAction, StoreOp};
pub use selector::{Selector, SelectorError};
pub use store::{atomic_status_update, atomic_update, ObjectStore, RetryPolicy, StoreError};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};

/// Split an apiVersion into (group, version); the core group is empty
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// API group of an apiVersion
pub fn group_of(api_version: &str) -> &str {
    parse_api_version(api_version).0
}

pub fn api_version_of(obj: &DynamicObject) -> &str {
    obj.types
        .as_ref()
        .map(|t| t.api_version.as_str())
        .unwrap_or_default()
}

pub fn kind_of(obj: &DynamicObject) -> &str {
    obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default()
}

pub fn uid_of(obj: &DynamicObject) -> &str {
    obj.metadata.uid.as_deref().unwrap_or_default()
}

/// Whether the object has a deletion timestamp
pub fn is_deleting(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// `namespace/name` for logs
pub fn display_name(obj: &DynamicObject) -> String {
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => format!("{ns}/{}", obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Key of a child inside its [`ChildMap`] group.
///
/// Children of a cluster-scoped parent may live in several namespaces, so
/// their keys carry a namespace prefix.
pub fn relative_name(parent: &DynamicObject, child: &DynamicObject) -> String {
    let parent_ns = parent.namespace().unwrap_or_default();
    let child_ns = child.namespace().unwrap_or_default();
    if parent_ns.is_empty() && !child_ns.is_empty() {
        format!("{child_ns}/{}", child.name_any())
    } else {
        child.name_any()
    }
}

/// Full JSON form of an object
pub fn to_value(obj: &DynamicObject) -> Result<Value, serde_json::Error> {
    serde_json::to_value(obj)
}

pub fn from_value(value: Value) -> Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(value)
}

/// Structural equality over the canonical JSON form.
///
/// JSON maps compare independent of key order, so this is the single
/// change-detection primitive used for merges and revision updates.
pub fn objects_equal(a: &DynamicObject, b: &DynamicObject) -> bool {
    match (to_value(a), to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Controller reference pointing at `parent`
pub fn controller_ref(parent: &DynamicObject) -> OwnerReference {
    OwnerReference {
        api_version: api_version_of(parent).to_string(),
        kind: kind_of(parent).to_string(),
        name: parent.name_any(),
        uid: uid_of(parent).to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// The owner reference marked as controller, if any
pub fn get_controller_of(obj: &DynamicObject) -> Option<&OwnerReference> {
    obj.owner_references()
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Insert or replace the owner reference with the same UID
pub fn upsert_owner_reference(obj: &mut DynamicObject, owner: OwnerReference) {
    let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
    if let Some(existing) = refs.iter_mut().find(|r| r.uid == owner.uid) {
        *existing = owner;
    } else {
        refs.push(owner);
    }
}

/// Remove owner references with the given UID
pub fn remove_owner_reference(obj: &mut DynamicObject, uid: &str) {
    if let Some(refs) = obj.metadata.owner_references.as_mut() {
        refs.retain(|r| r.uid != uid);
        if refs.is_empty() {
            obj.metadata.owner_references = None;
        }
    }
}

/// Read a nested field by path
pub fn get_nested<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

/// Set a nested field, creating (or replacing non-object) intermediate maps
pub fn set_nested(value: &mut Value, path: &[&str], field: Value) {
    let Some((last, parents)) = path.split_last() else {
        *value = field;
        return;
    };
    let mut current = value;
    for key in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert((*last).to_string(), field);
    }
}

/// Remove a nested field; missing intermediates are a no-op
pub fn remove_nested(value: &mut Value, path: &[&str]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut current = value;
    for key in parents {
        current = current.get_mut(*key)?;
    }
    current.as_object_mut()?.remove(*last)
}

/// Split a dotted field path
pub fn field_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|p| !p.is_empty()).collect()
}
