//! # Status Conditions
//!
//! Condition schema written onto parent status and read from child status.
//! Parent and child status are untyped, so helpers work on JSON maps.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Condition represents a condition of a resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    #[serde(default)]
    pub status: String,
    /// Reason for the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusCondition {
    pub fn new(r#type: &str, status: &str, reason: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            r#type: r#type.to_string(),
            status: status.to_string(),
            reason: (!reason.is_empty()).then(|| reason.to_string()),
            message: (!message.is_empty()).then_some(message),
        }
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Find a condition by type in `obj.status.conditions`
pub fn get_condition(obj: &Value, condition_type: &str) -> Option<StatusCondition> {
    obj.get("status")?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))
        .map(|c| StatusCondition {
            r#type: condition_type.to_string(),
            status: c
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            reason: c.get("reason").and_then(Value::as_str).map(str::to_string),
            message: c.get("message").and_then(Value::as_str).map(str::to_string),
        })
}

/// Replace the condition of the same type in `status.conditions`, or append it
pub fn set_condition(status: &mut Map<String, Value>, condition: &StatusCondition) {
    let entry = status
        .entry("conditions")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !entry.is_array() {
        *entry = Value::Array(Vec::new());
    }
    let Value::Array(conditions) = entry else {
        return;
    };

    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(condition.r#type.as_str()))
    {
        *existing = condition.to_value();
    } else {
        conditions.push(condition.to_value());
    }
}
