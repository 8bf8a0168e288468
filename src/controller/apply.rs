//! # Apply
//!
//! Client-side three-way merge in the style of `kubectl apply`.
//!
//! Decision functions return partial objects. The partial last written is
//! kept in an annotation so that fields it no longer mentions can be removed,
//! while fields owned by other writers are left alone.

use crate::constants::LAST_APPLIED_ANNOTATION;
use crate::dynamic::{from_value, get_nested, remove_nested, set_nested, to_value};
use kube::api::DynamicObject;
use serde_json::{Map, Value};
use tracing::debug;

/// Metadata fields owned by the store; never changed by a merge
const STORE_MANAGED_METADATA: &[&str] = &[
    "selfLink",
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];

/// Errors from [`apply_update`]
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("can't convert object for merge: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Merge the change from `last_applied` to `desired` into `observed`
pub fn merge(observed: &Value, last_applied: &Value, desired: &Value) -> Value {
    merge_value(Some(observed.clone()), Some(last_applied), desired)
}

fn merge_value(destination: Option<Value>, last_applied: Option<&Value>, desired: &Value) -> Value {
    match (destination, desired) {
        (Some(Value::Object(dest)), Value::Object(des)) => {
            Value::Object(merge_object(dest, last_applied.and_then(Value::as_object), des))
        }
        (Some(Value::Array(dest)), Value::Array(des)) => {
            merge_array(dest, last_applied.and_then(Value::as_array), des)
        }
        // Scalars, nulls and shape changes: desired wins
        _ => desired.clone(),
    }
}

fn merge_object(
    mut destination: Map<String, Value>,
    last_applied: Option<&Map<String, Value>>,
    desired: &Map<String, Value>,
) -> Map<String, Value> {
    if let Some(last) = last_applied {
        for key in last.keys() {
            if !desired.contains_key(key) {
                destination.remove(key);
            }
        }
    }
    for (key, des) in desired {
        let dest = destination.remove(key);
        let last = last_applied.and_then(|l| l.get(key));
        destination.insert(key.clone(), merge_value(dest, last, des));
    }
    destination
}

fn merge_array(destination: Vec<Value>, last_applied: Option<&Vec<Value>>, desired: &[Value]) -> Value {
    match last_applied {
        Some(last) if is_list_map(&destination) && is_list_map(last) && is_list_map(desired) => {
            merge_list_map(destination, last, desired)
        }
        _ => Value::Array(desired.to_vec()),
    }
}

fn item_name(item: &Value) -> Option<&str> {
    item.get("name").and_then(Value::as_str)
}

/// Whether a list could be a list of objects keyed by `name`
fn is_list_map(list: &[Value]) -> bool {
    !list.is_empty() && list.iter().all(|item| item.is_object() && item_name(item).is_some())
}

fn to_list_map(list: &[Value]) -> Map<String, Value> {
    list.iter()
        .filter_map(|item| item_name(item).map(|name| (name.to_string(), item.clone())))
        .collect()
}

/// Merge lists of named objects item by item.
///
/// Items already present keep their position; new items follow in desired order.
fn merge_list_map(destination: Vec<Value>, last_applied: &[Value], desired: &[Value]) -> Value {
    let last_map = to_list_map(last_applied);
    let desired_map = to_list_map(desired);
    let mut merged = merge_object(to_list_map(&destination), Some(&last_map), &desired_map);

    let mut result = Vec::with_capacity(merged.len());
    for item in destination.iter().chain(desired) {
        if let Some(value) = item_name(item).and_then(|name| merged.remove(name)) {
            result.push(value);
        }
    }
    Value::Array(result)
}

/// Last partial object applied to `obj`; missing or unparseable means empty
pub fn get_last_applied(obj: &DynamicObject) -> Value {
    let Some(raw) = obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
    else {
        return Value::Object(Map::new());
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            debug!(
                annotation = LAST_APPLIED_ANNOTATION,
                "ignoring unparseable last-applied annotation"
            );
            Value::Object(Map::new())
        }
    }
}

/// Record `applied` as the last-applied partial object of `obj`
pub fn set_last_applied(obj: &mut DynamicObject, applied: &Value) -> Result<(), ApplyError> {
    let raw = serde_json::to_string(applied)?;
    obj.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), raw);
    Ok(())
}

/// Compute the full object that results from applying `desired` to `observed`.
///
/// Store-managed metadata and the whole `status` subtree keep their observed
/// values, and `desired` becomes the new last-applied record.
pub fn apply_update(observed: &DynamicObject, desired: &DynamicObject) -> Result<DynamicObject, ApplyError> {
    let observed_value = to_value(observed)?;
    let desired_value = to_value(desired)?;
    let last_applied = get_last_applied(observed);

    let mut merged = merge(&observed_value, &last_applied, &desired_value);

    for field in STORE_MANAGED_METADATA {
        revert(&mut merged, &observed_value, &["metadata", field]);
    }
    revert(&mut merged, &observed_value, &["status"]);

    set_nested(
        &mut merged,
        &["metadata", "annotations", LAST_APPLIED_ANNOTATION],
        Value::String(serde_json::to_string(&desired_value)?),
    );

    Ok(from_value(merged)?)
}

fn revert(merged: &mut Value, observed: &Value, path: &[&str]) {
    match get_nested(observed, path) {
        Some(value) => set_nested(merged, path, value.clone()),
        None => {
            remove_nested(merged, path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::objects_equal;
    use serde_json::json;

    fn object(value: Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_merge_removes_fields_dropped_from_desired() {
        let observed = json!({"spec": {"a": 1, "b": 2, "other": "kept"}});
        let last = json!({"spec": {"a": 1, "b": 2}});
        let desired = json!({"spec": {"a": 3}});
        assert_eq!(
            merge(&observed, &last, &desired),
            json!({"spec": {"a": 3, "other": "kept"}})
        );
    }

    #[test]
    fn test_merge_list_map_by_name() {
        let observed = json!({"containers": [
            {"name": "sidecar", "image": "s:1"},
            {"name": "app", "image": "a:1", "resources": {"cpu": "1"}}
        ]});
        let last = json!({"containers": [{"name": "app", "image": "a:1"}]});
        let desired = json!({"containers": [
            {"name": "app", "image": "a:2"},
            {"name": "new", "image": "n:1"}
        ]});
        assert_eq!(
            merge(&observed, &last, &desired),
            json!({"containers": [
                {"name": "sidecar", "image": "s:1"},
                {"name": "app", "image": "a:2", "resources": {"cpu": "1"}},
                {"name": "new", "image": "n:1"}
            ]})
        );
    }

    #[test]
    fn test_merge_list_map_drops_items_removed_from_desired() {
        let observed = json!({"ports": [{"name": "http"}, {"name": "debug"}]});
        let last = json!({"ports": [{"name": "http"}, {"name": "debug"}]});
        let desired = json!({"ports": [{"name": "http"}]});
        assert_eq!(
            merge(&observed, &last, &desired),
            json!({"ports": [{"name": "http"}]})
        );
    }

    #[test]
    fn test_merge_plain_arrays_and_shape_changes_take_desired() {
        let observed = json!({"args": ["a", "b"], "mode": {"x": 1}});
        let last = json!({});
        let desired = json!({"args": ["c"], "mode": "simple"});
        assert_eq!(
            merge(&observed, &last, &desired),
            json!({"args": ["c"], "mode": "simple"})
        );
    }

    #[test]
    fn test_merge_without_last_applied_list_replaces() {
        let observed = json!({"items": [{"name": "a", "v": 1}]});
        let desired = json!({"items": [{"name": "b"}]});
        assert_eq!(
            merge(&observed, &json!({}), &desired),
            json!({"items": [{"name": "b"}]})
        );
    }

    fn observed_pod() -> DynamicObject {
        object(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "a",
                "namespace": "ns",
                "uid": "u1",
                "resourceVersion": "7",
                "generation": 3,
                "labels": {"owner": "someone-else"}
            },
            "spec": {"image": "a:1", "nodeName": "n1"},
            "status": {"phase": "Running"}
        }))
    }

    #[test]
    fn test_apply_update_keeps_system_fields_and_status() {
        let desired = object(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "a", "namespace": "ns", "uid": "evil", "resourceVersion": "1", "generation": 99},
            "spec": {"image": "a:2"},
            "status": {"phase": "Failed"}
        }));

        let updated = apply_update(&observed_pod(), &desired).unwrap();
        assert_eq!(updated.metadata.uid.as_deref(), Some("u1"));
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("7"));
        assert_eq!(updated.metadata.generation, Some(3));
        assert_eq!(updated.data["status"], json!({"phase": "Running"}));
        assert_eq!(updated.data["spec"], json!({"image": "a:2", "nodeName": "n1"}));
        assert_eq!(
            updated.metadata.labels.as_ref().and_then(|l| l.get("owner")).map(String::as_str),
            Some("someone-else")
        );
        assert!(updated
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(LAST_APPLIED_ANNOTATION)));
    }

    #[test]
    fn test_apply_update_is_idempotent() {
        let desired = object(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "a", "namespace": "ns", "labels": {"app": "x"}},
            "spec": {"image": "a:2", "containers": [{"name": "c", "image": "i"}]}
        }));

        let once = apply_update(&observed_pod(), &desired).unwrap();
        let twice = apply_update(&once, &desired).unwrap();
        assert!(objects_equal(&once, &twice));
    }

    #[test]
    fn test_apply_update_removes_store_fields_absent_from_observed() {
        let mut observed = observed_pod();
        observed.metadata.generation = None;
        observed.data.as_object_mut().unwrap().remove("status");

        let desired = object(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "a", "generation": 5},
            "status": {"phase": "Pending"}
        }));
        let updated = apply_update(&observed, &desired).unwrap();
        assert_eq!(updated.metadata.generation, None);
        assert!(updated.data.get("status").is_none());
    }

    #[test]
    fn test_unparseable_last_applied_is_empty() {
        let mut obj = observed_pod();
        obj.metadata.annotations = Some(
            [(LAST_APPLIED_ANNOTATION.to_string(), "{not json".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(get_last_applied(&obj), json!({}));
        assert_eq!(get_last_applied(&observed_pod()), json!({}));
    }
}
