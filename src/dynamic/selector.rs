//! # Label Selectors
//!
//! Evaluates `matchLabels` / `matchExpressions` selectors against object labels.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::BTreeMap;
use std::fmt;

/// Errors converting a label selector
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("label selector is empty")]
    Empty,
    #[error("invalid operator '{0}' in label selector requirement")]
    InvalidOperator(String),
    #[error("operator '{operator}' for key '{key}' requires at least one value")]
    MissingValues { key: String, operator: String },
    #[error("operator '{operator}' for key '{key}' must not have values")]
    UnexpectedValues { key: String, operator: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(key, value) => labels.get(key) == Some(value),
            Self::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Self::NotIn(key, values) => labels.get(key).is_none_or(|v| !values.contains(v)),
            Self::Exists(key) => labels.contains_key(key),
            Self::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

/// A parsed label selector; all requirements must match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Selector matching `key=value` for every entry
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            requirements: labels
                .into_iter()
                .map(|(k, v)| Requirement::Equals(k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Convert an API label selector; an empty selector is rejected
    pub fn from_label_selector(selector: &LabelSelector) -> Result<Self, SelectorError> {
        let mut requirements: Vec<Requirement> = selector
            .match_labels
            .iter()
            .flatten()
            .map(|(k, v)| Requirement::Equals(k.clone(), v.clone()))
            .collect();

        for expression in selector.match_expressions.iter().flatten() {
            requirements.push(parse_requirement(expression)?);
        }

        if requirements.is_empty() {
            return Err(SelectorError::Empty);
        }
        Ok(Self { requirements })
    }

    /// Add `key=value` requirements
    #[must_use]
    pub fn with_labels<'a>(mut self, labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        self.requirements.extend(
            labels
                .into_iter()
                .map(|(k, v)| Requirement::Equals(k.to_string(), v.to_string())),
        );
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

fn parse_requirement(expression: &LabelSelectorRequirement) -> Result<Requirement, SelectorError> {
    let key = expression.key.clone();
    let values = expression.values.clone().unwrap_or_default();
    let operator = expression.operator.as_str();

    match operator {
        "In" | "NotIn" if values.is_empty() => Err(SelectorError::MissingValues {
            key,
            operator: operator.to_string(),
        }),
        "Exists" | "DoesNotExist" if !values.is_empty() => Err(SelectorError::UnexpectedValues {
            key,
            operator: operator.to_string(),
        }),
        "In" => Ok(Requirement::In(key, values)),
        "NotIn" => Ok(Requirement::NotIn(key, values)),
        "Exists" => Ok(Requirement::Exists(key)),
        "DoesNotExist" => Ok(Requirement::DoesNotExist(key)),
        other => Err(SelectorError::InvalidOperator(other.to_string())),
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match r {
                Requirement::Equals(k, v) => format!("{k}={v}"),
                Requirement::In(k, vs) => format!("{k} in ({})", vs.join(",")),
                Requirement::NotIn(k, vs) => format!("{k} notin ({})", vs.join(",")),
                Requirement::Exists(k) => k.clone(),
                Requirement::DoesNotExist(k) => format!("!{k}"),
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn requirement(key: &str, operator: &str, values: Option<Vec<&str>>) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: values.map(|vs| vs.into_iter().map(str::to_string).collect()),
        }
    }

    #[test]
    fn test_match_labels_and_expressions() {
        let selector = Selector::from_label_selector(&LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            match_expressions: Some(vec![
                requirement("tier", "In", Some(vec!["front", "edge"])),
                requirement("canary", "DoesNotExist", None),
            ]),
        })
        .unwrap();

        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "edge")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("tier", "back")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("tier", "front"), ("canary", "1")])));
        assert!(!selector.matches(&labels(&[("tier", "front")])));
    }

    #[test]
    fn test_not_in_matches_missing_key() {
        let selector = Selector::from_label_selector(&LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("env", "NotIn", Some(vec!["prod"]))]),
        })
        .unwrap();
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn test_invalid_selectors() {
        assert_eq!(
            Selector::from_label_selector(&LabelSelector::default()),
            Err(SelectorError::Empty)
        );
        assert!(matches!(
            Selector::from_label_selector(&LabelSelector {
                match_labels: None,
                match_expressions: Some(vec![requirement("a", "In", None)]),
            }),
            Err(SelectorError::MissingValues { .. })
        ));
        assert!(matches!(
            Selector::from_label_selector(&LabelSelector {
                match_labels: None,
                match_expressions: Some(vec![requirement("a", "Gt", Some(vec!["1"]))]),
            }),
            Err(SelectorError::InvalidOperator(_))
        ));
    }

    #[test]
    fn test_with_labels_and_display() {
        let selector = Selector::from_labels([("controller-uid", "u1")])
            .with_labels([("metacontroller.k8s.io/apiGroup", "ctl.example.com")]);
        assert_eq!(
            selector.to_string(),
            "controller-uid=u1,metacontroller.k8s.io/apiGroup=ctl.example.com"
        );
    }
}
