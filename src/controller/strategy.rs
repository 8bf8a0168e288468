//! # Update Strategies
//!
//! Per child (group, kind) update policy.

use crate::crd::{ChildUpdateStrategy, StatusChecks, UpdateMethod};
use crate::dynamic::GroupKind;
use std::collections::HashMap;

/// Update strategy lookup; kinds without an entry use OnDelete
#[derive(Debug, Clone, Default)]
pub struct UpdateStrategyMap {
    strategies: HashMap<GroupKind, ChildUpdateStrategy>,
}

impl UpdateStrategyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy; OnDelete entries are not stored
    pub fn insert(&mut self, group_kind: GroupKind, strategy: ChildUpdateStrategy) {
        if strategy.method != UpdateMethod::OnDelete {
            self.strategies.insert(group_kind, strategy);
        }
    }

    pub fn get(&self, group: &str, kind: &str) -> Option<&ChildUpdateStrategy> {
        self.strategies.get(&GroupKind::new(group, kind))
    }

    pub fn method(&self, group: &str, kind: &str) -> UpdateMethod {
        self.get(group, kind).map(|s| s.method).unwrap_or_default()
    }

    pub fn status_checks(&self, group: &str, kind: &str) -> Option<&StatusChecks> {
        self.get(group, kind).and_then(|s| s.status_checks.as_ref())
    }

    pub fn is_rolling(&self, group: &str, kind: &str) -> bool {
        self.method(group, kind).is_rolling()
    }

    /// Whether any child kind needs revision bookkeeping
    pub fn any_rolling(&self) -> bool {
        self.strategies.values().any(|s| s.method.is_rolling())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(method: UpdateMethod) -> ChildUpdateStrategy {
        ChildUpdateStrategy {
            method,
            status_checks: None,
        }
    }

    #[test]
    fn test_defaults_to_on_delete() {
        let mut map = UpdateStrategyMap::new();
        map.insert(GroupKind::new("apps", "Deployment"), strategy(UpdateMethod::InPlace));
        assert_eq!(map.method("apps", "Deployment"), UpdateMethod::InPlace);
        assert_eq!(map.method("", "Pod"), UpdateMethod::OnDelete);
        assert!(!map.any_rolling());
    }

    #[test]
    fn test_rolling_detection() {
        let mut map = UpdateStrategyMap::new();
        map.insert(GroupKind::new("", "ConfigMap"), strategy(UpdateMethod::OnDelete));
        map.insert(GroupKind::new("", "Pod"), strategy(UpdateMethod::RollingRecreate));
        assert!(map.any_rolling());
        assert!(map.is_rolling("", "Pod"));
        assert!(!map.is_rolling("", "ConfigMap"));
        assert!(map.get("", "ConfigMap").is_none());
    }
}
