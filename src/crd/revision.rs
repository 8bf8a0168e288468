//! # ControllerRevision
//!
//! Immutable snapshot of a parent's revision-relevant fields, plus the set of
//! children that are still driven by that snapshot during a rollout.
//!
//! The wire form keeps `parentPatch` and `children` at the top level rather
//! than under `spec`, so the record is converted to and from
//! [`DynamicObject`] instead of deriving `CustomResource`.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion, CustomResourceValidation, JSONSchemaProps, JSONSchemaPropsOrArray,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use kube::api::{ApiResource, DynamicObject};
use kube::core::{GroupVersionKind, TypeMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const GROUP: &str = "metacontroller.k8s.io";
const VERSION: &str = "v1alpha1";
const KIND: &str = "ControllerRevision";
const PLURAL: &str = "controllerrevisions";

/// Revision record persisted next to the parent
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRevision {
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Projection of the parent onto the revision-relevant field paths
    #[serde(default)]
    pub parent_patch: Value,
    /// Children claimed by this revision, grouped by API group and kind
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ControllerRevisionChildren>,
}

/// Names of one child kind claimed by a revision
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRevisionChildren {
    #[serde(default)]
    pub api_group: String,
    pub kind: String,
    #[serde(default)]
    pub names: Vec<String>,
}

impl ControllerRevision {
    /// Resource descriptor for the revision collection
    pub fn api_resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(GROUP, VERSION, KIND), PLURAL)
    }

    /// Decode a stored revision
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self, serde_json::Error> {
        let mut revision: Self = serde_json::from_value(obj.data.clone())?;
        revision.metadata = obj.metadata.clone();
        Ok(revision)
    }

    /// Encode for storage
    pub fn to_dynamic(&self) -> Result<DynamicObject, serde_json::Error> {
        let mut data = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut data {
            fields.remove("metadata");
        }
        Ok(DynamicObject {
            types: Some(TypeMeta {
                api_version: format!("{GROUP}/{VERSION}"),
                kind: KIND.to_string(),
            }),
            metadata: self.metadata.clone(),
            data,
        })
    }

    /// CRD for the revision collection.
    ///
    /// Hand-built because the record has no `spec`; `parentPatch` holds an
    /// arbitrary projection of the parent.
    pub fn crd() -> CustomResourceDefinition {
        let preserve = JSONSchemaProps {
            type_: Some("object".to_string()),
            x_kubernetes_preserve_unknown_fields: Some(true),
            ..JSONSchemaProps::default()
        };
        let children = JSONSchemaProps {
            type_: Some("array".to_string()),
            items: Some(JSONSchemaPropsOrArray::Schema(
                Box::new(preserve.clone()),
            )),
            ..JSONSchemaProps::default()
        };
        let schema = JSONSchemaProps {
            type_: Some("object".to_string()),
            properties: Some(BTreeMap::from([
                ("parentPatch".to_string(), preserve),
                ("children".to_string(), children),
            ])),
            ..JSONSchemaProps::default()
        };

        CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some(format!("{PLURAL}.{GROUP}")),
                ..ObjectMeta::default()
            },
            spec: CustomResourceDefinitionSpec {
                group: GROUP.to_string(),
                names: CustomResourceDefinitionNames {
                    kind: KIND.to_string(),
                    plural: PLURAL.to_string(),
                    singular: Some("controllerrevision".to_string()),
                    ..CustomResourceDefinitionNames::default()
                },
                scope: "Namespaced".to_string(),
                versions: vec![CustomResourceDefinitionVersion {
                    name: VERSION.to_string(),
                    served: true,
                    storage: true,
                    schema: Some(CustomResourceValidation {
                        open_api_v3_schema: Some(schema),
                    }),
                    ..CustomResourceDefinitionVersion::default()
                }],
                ..CustomResourceDefinitionSpec::default()
            },
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Total number of claimed child names
    pub fn count_children(&self) -> usize {
        self.children.iter().map(|c| c.names.len()).sum()
    }

    /// Claim a child; idempotent
    pub fn add_child(&mut self, api_group: &str, kind: &str, name: &str) {
        let position = self
            .children
            .iter()
            .position(|c| c.api_group == api_group && c.kind == kind);
        let group = match position {
            Some(i) => &mut self.children[i],
            None => {
                self.children.push(ControllerRevisionChildren {
                    api_group: api_group.to_string(),
                    kind: kind.to_string(),
                    names: Vec::new(),
                });
                let last = self.children.len() - 1;
                &mut self.children[last]
            }
        };
        if !group.names.iter().any(|n| n == name) {
            group.names.push(name.to_string());
        }
    }

    /// Drop a claim; a missing group or name is a no-op
    pub fn remove_child(&mut self, api_group: &str, kind: &str, name: &str) {
        if let Some(group) = self
            .children
            .iter_mut()
            .find(|c| c.api_group == api_group && c.kind == kind)
        {
            group.names.retain(|n| n != name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_and_remove_child() {
        let mut revision = ControllerRevision::default();
        revision.add_child("apps", "Deployment", "a");
        revision.add_child("apps", "Deployment", "a");
        revision.add_child("apps", "Deployment", "b");
        revision.add_child("", "Pod", "p");
        assert_eq!(revision.count_children(), 3);

        revision.remove_child("apps", "Deployment", "a");
        revision.remove_child("apps", "StatefulSet", "a");
        revision.remove_child("", "Pod", "missing");
        assert_eq!(revision.count_children(), 2);
        assert_eq!(revision.children[0].names, vec!["b".to_string()]);
    }

    #[test]
    fn test_dynamic_conversion_keeps_wire_shape() {
        let mut revision = ControllerRevision {
            metadata: ObjectMeta {
                name: Some("things.example.com-abc".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            parent_patch: json!({"spec": {"replicas": 3}}),
            children: Vec::new(),
        };
        revision.add_child("", "Pod", "p1");

        let obj = revision.to_dynamic().unwrap();
        let wire = serde_json::to_value(&obj).unwrap();
        assert_eq!(wire["apiVersion"], "metacontroller.k8s.io/v1alpha1");
        assert_eq!(wire["kind"], "ControllerRevision");
        assert_eq!(wire["parentPatch"], json!({"spec": {"replicas": 3}}));
        assert_eq!(
            wire["children"],
            json!([{"apiGroup": "", "kind": "Pod", "names": ["p1"]}])
        );

        let decoded = ControllerRevision::from_dynamic(&obj).unwrap();
        assert_eq!(decoded, revision);
    }

    #[test]
    fn test_crd_names_match_api_resource() {
        let crd = ControllerRevision::crd();
        let resource = ControllerRevision::api_resource();
        assert_eq!(crd.metadata.name.as_deref(), Some("controllerrevisions.metacontroller.k8s.io"));
        assert_eq!(crd.spec.names.plural, resource.plural);
        assert_eq!(crd.spec.versions[0].name, resource.version);
    }
}
