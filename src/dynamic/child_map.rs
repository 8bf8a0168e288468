//! # Child Map
//!
//! Children grouped by (apiVersion, kind), then by relative name.

use super::{api_version_of, group_of, kind_of, relative_name};
use kube::api::DynamicObject;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Version-agnostic child type
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Versioned child type, the outer key of a [`ChildMap`]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChildKind {
    pub api_version: String,
    pub kind: String,
}

impl ChildKind {
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn of(obj: &DynamicObject) -> Self {
        Self::new(api_version_of(obj), kind_of(obj))
    }

    pub fn group(&self) -> &str {
        group_of(&self.api_version)
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group(), &self.kind)
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.api_version)
    }
}

/// Children grouped by kind, keyed by relative name within each group.
///
/// Serializes to the decision-function wire form
/// `{"<Kind>.<apiVersion>": {"<name>": object}}`.
#[derive(Debug, Clone, Default)]
pub struct ChildMap {
    groups: BTreeMap<ChildKind, BTreeMap<String, DynamicObject>>,
}

impl ChildMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group a flat list of children belonging to `parent`
    pub fn from_list(parent: &DynamicObject, children: impl IntoIterator<Item = DynamicObject>) -> Self {
        let mut map = Self::new();
        for child in children {
            map.insert(relative_name(parent, &child), child);
        }
        map
    }

    /// Make sure a (possibly empty) group exists for `kind`
    pub fn ensure_kind(&mut self, kind: ChildKind) -> &mut BTreeMap<String, DynamicObject> {
        self.groups.entry(kind).or_default()
    }

    pub fn insert(&mut self, name: String, child: DynamicObject) {
        self.ensure_kind(ChildKind::of(&child)).insert(name, child);
    }

    pub fn get(&self, kind: &ChildKind, name: &str) -> Option<&DynamicObject> {
        self.groups.get(kind).and_then(|g| g.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChildKind, &BTreeMap<String, DynamicObject>)> {
        self.groups.iter()
    }

    /// Total number of children across all groups
    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look a child up by group and kind, ignoring the API version
    pub fn find_group_kind_name(&self, group: &str, kind: &str, name: &str) -> Option<&DynamicObject> {
        self.groups
            .iter()
            .filter(|(k, _)| k.kind == kind && k.group() == group)
            .find_map(|(_, children)| children.get(name))
    }

    /// Replace a child that is already present; absent children are ignored
    pub fn replace_child(&mut self, name: &str, child: DynamicObject) {
        if let Some(existing) = self
            .groups
            .get_mut(&ChildKind::of(&child))
            .and_then(|g| g.get_mut(name))
        {
            *existing = child;
        }
    }
}

impl Serialize for ChildMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.groups.len()))?;
        for (kind, children) in &self.groups {
            map.serialize_entry(&kind.to_string(), children)?;
        }
        map.end()
    }
}
