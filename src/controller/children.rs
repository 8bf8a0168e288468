//! # Children
//!
//! Converges observed children towards desired children.
//!
//! This is the only place that creates, updates or deletes children. Every
//! child is handled independently and failures are collected, so one broken
//! child never blocks work on the others.

use super::apply::{apply_update, set_last_applied, ApplyError};
use super::error::ControllerError;
use super::strategy::UpdateStrategyMap;
use crate::crd::UpdateMethod;
use crate::dynamic::{
    controller_ref, display_name, is_deleting, objects_equal, to_value, uid_of,
    upsert_owner_reference, ChildKind, ChildMap, ObjectStore, ResolvedResource,
};
use crate::observability::metrics;
use kube::api::DynamicObject;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Child resource types a controller is allowed to manage
#[derive(Debug, Clone, Default)]
pub struct ChildResources {
    by_kind: BTreeMap<ChildKind, ResolvedResource>,
}

impl ChildResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource: ResolvedResource) {
        let kind = ChildKind::new(&resource.api_resource.api_version, &resource.api_resource.kind);
        self.by_kind.insert(kind, resource);
    }

    pub fn get(&self, kind: &ChildKind) -> Option<&ResolvedResource> {
        self.by_kind.get(kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChildKind, &ResolvedResource)> {
        self.by_kind.iter()
    }

    fn resolve(&self, kind: &ChildKind, name: &str) -> Result<&ResolvedResource, ControllerError> {
        self.get(kind).ok_or_else(|| ControllerError::InvalidChild {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: "kind is not declared in childResources".to_string(),
        })
    }
}

impl FromIterator<ResolvedResource> for ChildResources {
    fn from_iter<I: IntoIterator<Item = ResolvedResource>>(iter: I) -> Self {
        let mut resources = Self::new();
        for resource in iter {
            resources.insert(resource);
        }
        resources
    }
}

/// Issues the writes that take observed children to desired children
pub struct ChildManager<'a> {
    store: &'a dyn ObjectStore,
    resources: &'a ChildResources,
    strategies: &'a UpdateStrategyMap,
}

impl std::fmt::Debug for ChildManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildManager")
            .field("resources", &self.resources)
            .field("strategies", &self.strategies)
            .finish_non_exhaustive()
    }
}

impl<'a> ChildManager<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        resources: &'a ChildResources,
        strategies: &'a UpdateStrategyMap,
    ) -> Self {
        Self {
            store,
            resources,
            strategies,
        }
    }

    /// Delete undesired children, then update and create desired ones
    pub async fn manage(
        &self,
        parent: &DynamicObject,
        observed: &ChildMap,
        desired: &ChildMap,
    ) -> Result<(), ControllerError> {
        let mut errors = self.delete_children(parent, observed, desired).await;
        errors.extend(self.update_children(parent, observed, desired).await);
        ControllerError::aggregate(errors)
    }

    async fn delete_children(
        &self,
        parent: &DynamicObject,
        observed: &ChildMap,
        desired: &ChildMap,
    ) -> Vec<ControllerError> {
        let mut errors = Vec::new();
        for (kind, children) in observed.iter() {
            for (name, obj) in children {
                if is_deleting(obj) || desired.get(kind, name).is_some() {
                    continue;
                }
                let resource = match self.resources.resolve(kind, name) {
                    Ok(resource) => resource,
                    Err(e) => {
                        errors.push(e);
                        continue;
                    }
                };
                info!(
                    parent = %display_name(parent),
                    child = %display_name(obj),
                    kind = %kind.kind,
                    "deleting child"
                );
                if let Err(e) = self.delete(resource, obj).await {
                    errors.push(e);
                }
            }
        }
        errors
    }

    async fn update_children(
        &self,
        parent: &DynamicObject,
        observed: &ChildMap,
        desired: &ChildMap,
    ) -> Vec<ControllerError> {
        let mut errors = Vec::new();
        for (kind, children) in desired.iter() {
            for (name, obj) in children {
                let resource = match self.resources.resolve(kind, name) {
                    Ok(resource) => resource,
                    Err(e) => {
                        errors.push(e);
                        continue;
                    }
                };
                let result = match observed.get(kind, name) {
                    Some(existing) => self.update_child(parent, kind, resource, existing, obj).await,
                    None => self.create_child(parent, kind, resource, obj).await,
                };
                if let Err(e) = result {
                    errors.push(e);
                }
            }
        }
        errors
    }

    async fn update_child(
        &self,
        parent: &DynamicObject,
        kind: &ChildKind,
        resource: &ResolvedResource,
        observed: &DynamicObject,
        desired: &DynamicObject,
    ) -> Result<(), ControllerError> {
        let updated = apply_update(observed, desired)?;
        if objects_equal(&updated, observed) {
            debug!(child = %display_name(observed), kind = %kind.kind, "child is up to date");
            return Ok(());
        }
        if is_deleting(observed) {
            info!(
                child = %display_name(observed),
                kind = %kind.kind,
                "not updating child: pending deletion"
            );
            return Ok(());
        }

        match self.strategies.method(kind.group(), &kind.kind) {
            UpdateMethod::OnDelete => {
                info!(
                    child = %display_name(observed),
                    kind = %kind.kind,
                    "not updating child: update strategy is OnDelete"
                );
                Ok(())
            }
            UpdateMethod::Recreate | UpdateMethod::RollingRecreate => {
                info!(
                    parent = %display_name(parent),
                    child = %display_name(observed),
                    kind = %kind.kind,
                    "deleting child for recreate"
                );
                self.delete(resource, observed).await
            }
            UpdateMethod::InPlace | UpdateMethod::RollingInPlace => {
                info!(
                    parent = %display_name(parent),
                    child = %display_name(observed),
                    kind = %kind.kind,
                    "updating child"
                );
                match self.store.update(&resource.api_resource, &updated).await {
                    Ok(_) => {
                        metrics::increment_child_operations("update");
                        Ok(())
                    }
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(ControllerError::store(
                        format!("can't update {} {}", kind.kind, display_name(observed)),
                        e,
                    )),
                }
            }
        }
    }

    async fn create_child(
        &self,
        parent: &DynamicObject,
        kind: &ChildKind,
        resource: &ResolvedResource,
        desired: &DynamicObject,
    ) -> Result<(), ControllerError> {
        let applied = to_value(desired).map_err(ApplyError::from)?;
        let mut obj = desired.clone();
        set_last_applied(&mut obj, &applied)?;
        upsert_owner_reference(&mut obj, controller_ref(parent));

        info!(
            parent = %display_name(parent),
            child = %display_name(&obj),
            kind = %kind.kind,
            "creating child"
        );
        self.store
            .create(&resource.api_resource, &obj)
            .await
            .map_err(|e| ControllerError::store(format!("can't create {} {}", kind.kind, display_name(&obj)), e))?;
        metrics::increment_child_operations("create");
        Ok(())
    }

    async fn delete(&self, resource: &ResolvedResource, obj: &DynamicObject) -> Result<(), ControllerError> {
        let namespace = obj.namespace();
        match self
            .store
            .delete(
                &resource.api_resource,
                namespace.as_deref(),
                &obj.name_any(),
                Some(uid_of(obj)),
            )
            .await
        {
            Ok(()) => {
                metrics::increment_child_operations("delete");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(ControllerError::store(
                format!("can't delete {} {}", resource.kind(), display_name(obj)),
                e,
            )),
        }
    }
}
