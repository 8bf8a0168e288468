//! # Custom Resource Definitions
//!
//! CRD types for the Composite Controller.
//!
//! `CompositeController` objects configure one parent/child relationship each.
//! `ControllerRevision` records snapshot revision-relevant parent fields for rollouts.

mod revision;
mod status;

pub use revision::{ControllerRevision, ControllerRevisionChildren};
pub use status::{get_condition, set_condition, StatusCondition};

use kube::CustomResource;
use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;

/// CompositeController Custom Resource Definition
///
/// Declares a parent resource, the child resources it owns, and the decision
/// functions that compute desired children.
///
/// # Example
///
/// ```yaml
/// apiVersion: metacontroller.k8s.io/v1alpha1
/// kind: CompositeController
/// metadata:
///   name: blue-green
/// spec:
///   generateSelector: true
///   parentResource:
///     apiVersion: ctl.example.com/v1
///     resource: bluegreendeployments
///     revisionHistory:
///       fieldPaths: ["spec.template"]
///   childResources:
///     - apiVersion: v1
///       resource: pods
///       updateStrategy:
///         method: RollingInPlace
///         statusChecks:
///           conditions:
///             - type: Ready
///               status: "True"
///   hooks:
///     sync:
///       webhook:
///         url: http://blue-green.default/sync
///         timeout: 10s
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "CompositeController",
    group = "metacontroller.k8s.io",
    version = "v1alpha1",
    shortname = "cc",
    printcolumn = r#"{"name":"Parent", "type":"string", "jsonPath":".spec.parentResource.resource"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CompositeControllerSpec {
    /// The parent resource type this controller watches
    pub parent_resource: ParentResourceRule,
    /// Child resource types this controller creates and claims
    #[serde(default)]
    pub child_resources: Vec<ChildResourceRule>,
    /// Decision functions
    #[serde(default)]
    pub hooks: CompositeControllerHooks,
    /// Periodic resync of every parent, in seconds
    #[serde(default)]
    pub resync_period_seconds: Option<f64>,
    /// Select children by a generated `controller-uid` label instead of `.spec.selector`
    #[serde(default)]
    pub generate_selector: Option<bool>,
}

/// Parent resource rule
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParentResourceRule {
    /// API version of the parent, e.g. `ctl.example.com/v1`
    pub api_version: String,
    /// Plural resource name of the parent
    pub resource: String,
    /// Revision history settings; enables revision bookkeeping for rolling strategies
    #[serde(default)]
    pub revision_history: Option<RevisionHistory>,
}

/// Which parent fields are snapshotted into ControllerRevisions
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionHistory {
    /// Dotted field paths, defaults to `["spec"]`
    #[serde(default)]
    pub field_paths: Vec<String>,
}

/// Child resource rule
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChildResourceRule {
    /// API version of the child, e.g. `apps/v1`
    pub api_version: String,
    /// Plural resource name of the child
    pub resource: String,
    /// How existing children of this kind are updated
    #[serde(default)]
    pub update_strategy: Option<ChildUpdateStrategy>,
}

/// Update strategy for one child kind
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChildUpdateStrategy {
    /// Update method, defaults to OnDelete
    #[serde(default)]
    pub method: UpdateMethod,
    /// Gate used by the rolling methods before the next child is migrated
    #[serde(default)]
    pub status_checks: Option<StatusChecks>,
}

/// Child update method
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum UpdateMethod {
    /// Never touch existing children
    #[default]
    OnDelete,
    /// Delete children that differ, they are recreated on a later pass
    Recreate,
    /// Update children that differ
    InPlace,
    /// Recreate one child at a time across revisions
    RollingRecreate,
    /// Update one child at a time across revisions
    RollingInPlace,
}

impl UpdateMethod {
    /// Whether children of this kind are migrated between revisions one at a time
    pub fn is_rolling(self) -> bool {
        matches!(self, Self::RollingRecreate | Self::RollingInPlace)
    }
}

impl JsonSchema for UpdateMethod {
    fn schema_name() -> Cow<'static, str> {
        Cow::Borrowed("UpdateMethod")
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        schemars::json_schema!({
            "type": "string",
            "enum": ["OnDelete", "Recreate", "InPlace", "RollingRecreate", "RollingInPlace"],
            "description": "Child update method. OnDelete never updates existing children; Recreate deletes children that differ; InPlace updates them; the Rolling variants do the same one child at a time across revisions."
        })
    }
}

/// Status checks applied to children already migrated to the latest revision
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusChecks {
    #[serde(default)]
    pub conditions: Vec<StatusConditionCheck>,
}

/// A required status condition on a child
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusConditionCheck {
    /// Condition type that must be present
    pub r#type: String,
    /// Required condition status, if any
    #[serde(default)]
    pub status: Option<String>,
    /// Required condition reason, if any
    #[serde(default)]
    pub reason: Option<String>,
}

/// Decision functions of a CompositeController
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompositeControllerHooks {
    /// Called on every reconciliation of a live parent
    #[serde(default)]
    pub sync: Option<Hook>,
    /// Called instead of `sync` while a parent is pending deletion
    #[serde(default)]
    pub finalize: Option<Hook>,
}

/// A decision function reference
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    #[serde(default)]
    pub webhook: Option<Webhook>,
}

/// HTTP+JSON decision function
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    /// Full URL the request is POSTed to
    pub url: String,
    /// Request timeout, e.g. `10s` or `500ms`
    #[serde(default)]
    pub timeout: Option<String>,
}

impl Webhook {
    /// Configured timeout, if any
    pub fn timeout_duration(&self) -> Result<Option<Duration>, InvalidDuration> {
        self.timeout.as_deref().map(parse_duration).transpose()
    }
}

/// A duration string that could not be parsed
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid duration '{0}': expected <number><unit> with unit ms, s, m or h")]
pub struct InvalidDuration(pub String);

/// Parse a duration string such as `500ms`, `30s`, `1m` or `2h`
pub fn parse_duration(value: &str) -> Result<Duration, InvalidDuration> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| InvalidDuration(value.to_string()))?;
    let (number, unit) = trimmed.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_e| InvalidDuration(value.to_string()))?;

    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        "h" => Ok(Duration::from_secs(number * 3600)),
        _ => Err(InvalidDuration(value.to_string())),
    }
}

impl CompositeController {
    /// Field paths snapshotted into revisions
    pub fn revision_field_paths(&self) -> Vec<String> {
        match &self.spec.parent_resource.revision_history {
            Some(history) if !history.field_paths.is_empty() => history.field_paths.clone(),
            _ => crate::constants::DEFAULT_REVISION_FIELD_PATHS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Whether children are selected by a generated `controller-uid` label
    pub fn generate_selector(&self) -> bool {
        self.spec.generate_selector.unwrap_or(false)
    }

    /// Finalizer kept on parents while a finalize hook is configured
    pub fn finalizer_name(&self) -> String {
        format!(
            "{}{}",
            crate::constants::FINALIZER_PREFIX,
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }
}
