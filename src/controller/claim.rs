//! # Claim
//!
//! Ownership claiming of children and revisions through controller
//! references and label selectors.
//!
//! A candidate is claimed when it carries a controller reference to the
//! parent and still matches the selector. Orphans that match are adopted,
//! owned objects that stopped matching are released. Objects controlled by
//! anything else are never touched.

use super::error::ControllerError;
use crate::dynamic::{
    atomic_update, controller_ref, display_name, get_controller_of, is_deleting, kind_of,
    remove_owner_reference, uid_of, upsert_owner_reference, ObjectStore, RetryPolicy, Selector,
    StoreError,
};
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Memoized "may this parent adopt anything" check.
///
/// Does one uncached read of the parent per reconciliation pass and refuses
/// adoption if the parent is gone, was recreated, or is being deleted.
pub struct AdoptionGuard<'a> {
    store: &'a dyn ObjectStore,
    parent_resource: &'a ApiResource,
    parent: &'a DynamicObject,
    result: OnceCell<Result<(), String>>,
}

impl std::fmt::Debug for AdoptionGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdoptionGuard")
            .field("parent", &display_name(self.parent))
            .field("result", &self.result.get())
            .finish_non_exhaustive()
    }
}

impl<'a> AdoptionGuard<'a> {
    pub fn new(store: &'a dyn ObjectStore, parent_resource: &'a ApiResource, parent: &'a DynamicObject) -> Self {
        Self {
            store,
            parent_resource,
            parent,
            result: OnceCell::new(),
        }
    }

    pub async fn can_adopt(&self) -> Result<(), String> {
        self.result
            .get_or_init(|| async {
                let fresh = self
                    .store
                    .get(
                        self.parent_resource,
                        self.parent.namespace().as_deref(),
                        &self.parent.name_any(),
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                if uid_of(&fresh) != uid_of(self.parent) {
                    return Err(format!(
                        "original {} {} is gone: got uid {}, wanted {}",
                        self.parent_resource.kind,
                        display_name(self.parent),
                        uid_of(&fresh),
                        uid_of(self.parent)
                    ));
                }
                if is_deleting(&fresh) {
                    return Err(format!(
                        "{} {} has just been deleted",
                        self.parent_resource.kind,
                        display_name(self.parent)
                    ));
                }
                Ok(())
            })
            .await
            .clone()
    }
}

/// Claims objects of one resource type for one parent
pub struct ClaimManager<'a> {
    store: &'a dyn ObjectStore,
    parent: &'a DynamicObject,
    selector: &'a Selector,
    retry: &'a RetryPolicy,
    guard: &'a AdoptionGuard<'a>,
}

impl std::fmt::Debug for ClaimManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimManager")
            .field("parent", &display_name(self.parent))
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

enum Decision {
    Keep,
    Ignore,
    Adopt,
    Release,
}

impl<'a> ClaimManager<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        parent: &'a DynamicObject,
        selector: &'a Selector,
        retry: &'a RetryPolicy,
        guard: &'a AdoptionGuard<'a>,
    ) -> Self {
        Self {
            store,
            parent,
            selector,
            retry,
            guard,
        }
    }

    fn decide(&self, obj: &DynamicObject) -> Decision {
        let matches = self.selector.matches(obj.labels());
        let parent_deleting = is_deleting(self.parent);

        match get_controller_of(obj) {
            Some(owner) if owner.uid != uid_of(self.parent) => Decision::Ignore,
            Some(_) if matches => Decision::Keep,
            Some(_) if parent_deleting => Decision::Ignore,
            Some(_) => Decision::Release,
            None if parent_deleting || !matches || is_deleting(obj) => Decision::Ignore,
            None => Decision::Adopt,
        }
    }

    /// Claim `candidates`, returning the claimed objects and per-object failures
    pub async fn claim(
        &self,
        resource: &ApiResource,
        candidates: Vec<DynamicObject>,
    ) -> (Vec<DynamicObject>, Vec<ControllerError>) {
        let mut claimed = Vec::new();
        let mut errors = Vec::new();

        for obj in candidates {
            match self.decide(&obj) {
                Decision::Keep => claimed.push(obj),
                Decision::Ignore => {}
                Decision::Adopt => match self.adopt(resource, &obj).await {
                    Ok(Some(adopted)) => claimed.push(adopted),
                    Ok(None) => {}
                    Err(e) => errors.push(e),
                },
                Decision::Release => {
                    if let Err(e) = self.release(resource, &obj).await {
                        errors.push(e);
                    }
                }
            }
        }
        (claimed, errors)
    }

    async fn adopt(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<Option<DynamicObject>, ControllerError> {
        if let Err(reason) = self.guard.can_adopt().await {
            return Err(ControllerError::Config(format!(
                "can't adopt {} {} ({}): {reason}",
                kind_of(obj),
                display_name(obj),
                uid_of(obj)
            )));
        }

        info!(
            parent = %display_name(self.parent),
            child = %display_name(obj),
            kind = %resource.kind,
            "adopting"
        );
        let owner = controller_ref(self.parent);
        let result = atomic_update(self.store, resource, obj, self.retry, |fresh| {
            // Someone else took it since the list; leave it to them
            if get_controller_of(fresh).is_some_and(|r| r.uid != owner.uid) {
                return false;
            }
            let current = fresh
                .owner_references()
                .iter()
                .find(|r| r.uid == owner.uid)
                .cloned();
            if current.as_ref() == Some(&owner) {
                return false;
            }
            upsert_owner_reference(fresh, owner.clone());
            true
        })
        .await;

        match result {
            Ok(fresh) => match get_controller_of(&fresh) {
                Some(r) if r.uid == owner.uid => Ok(Some(fresh)),
                other => {
                    info!(
                        child = %display_name(&fresh),
                        controller = other.map_or("", |r| r.uid.as_str()),
                        "child is controlled by another owner, not adopting"
                    );
                    Ok(None)
                }
            },
            // Gone before we could adopt it; nothing to claim
            Err(e) if e.is_not_found() || e.is_gone() => {
                debug!(child = %display_name(obj), error = %e, "child vanished during adoption");
                Ok(None)
            }
            Err(e) => Err(ControllerError::store(
                format!("can't adopt {} {}", resource.kind, display_name(obj)),
                e,
            )),
        }
    }

    async fn release(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<(), ControllerError> {
        info!(
            parent = %display_name(self.parent),
            child = %display_name(obj),
            kind = %resource.kind,
            "releasing"
        );
        let parent_uid = uid_of(self.parent).to_string();
        let result = atomic_update(self.store, resource, obj, self.retry, |fresh| {
            if !fresh.owner_references().iter().any(|r| r.uid == parent_uid) {
                return false;
            }
            remove_owner_reference(fresh, &parent_uid);
            true
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if released(&e) => Ok(()),
            Err(e) => Err(ControllerError::store(
                format!("can't release {} {}", resource.kind, display_name(obj)),
                e,
            )),
        }
    }
}

/// An object that is gone is no longer owned
fn released(err: &StoreError) -> bool {
    err.is_not_found() || err.is_gone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::{MemoryStore, StoreAction};
    use kube::core::GroupVersionKind;
    use serde_json::json;

    fn parents() -> ApiResource {
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("ctl.example.com", "v1", "Thing"), "things")
    }

    fn pods() -> ApiResource {
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("", "v1", "Pod"), "pods")
    }

    fn pod(name: &str, app: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &pods()).within("ns");
        obj.metadata.labels = Some([("app".to_string(), app.to_string())].into_iter().collect());
        obj.data = json!({"spec": {}});
        obj
    }

    fn selector() -> Selector {
        Selector::from_labels([("app", "web")])
    }

    async fn run_claim(store: &MemoryStore, parent: &DynamicObject) -> (Vec<DynamicObject>, Vec<ControllerError>) {
        let parent_resource = parents();
        let selector = selector();
        let retry = RetryPolicy::default();
        let guard = AdoptionGuard::new(store, &parent_resource, parent);
        let manager = ClaimManager::new(store, parent, &selector, &retry, &guard);
        let candidates = store.list(&pods(), Some("ns")).await.unwrap();
        manager.claim(&pods(), candidates).await
    }

    fn seed_parent(store: &MemoryStore) -> DynamicObject {
        store.seed(&parents(), DynamicObject::new("p", &parents()).within("ns"))
    }

    #[tokio::test]
    async fn test_adopts_matching_orphan_and_skips_others() {
        let store = MemoryStore::new();
        let parent = seed_parent(&store);
        store.seed(&pods(), pod("orphan", "web"));
        store.seed(&pods(), pod("unrelated", "db"));

        let mut foreign = pod("foreign", "web");
        upsert_owner_reference(
            &mut foreign,
            controller_ref(&store.seed(&parents(), DynamicObject::new("other", &parents()).within("ns"))),
        );
        store.seed(&pods(), foreign);

        let (claimed, errors) = run_claim(&store, &parent).await;
        assert!(errors.is_empty());
        let names: Vec<String> = claimed.iter().map(ResourceExt::name_any).collect();
        assert_eq!(names, vec!["orphan".to_string()]);

        let stored = store.object(&pods(), Some("ns"), "orphan").unwrap();
        assert_eq!(get_controller_of(&stored).map(|r| r.uid.clone()), parent.metadata.uid.clone());
        let foreign = store.object(&pods(), Some("ns"), "foreign").unwrap();
        assert_eq!(foreign.owner_references().len(), 1);
        assert_ne!(get_controller_of(&foreign).map(|r| r.uid.clone()), parent.metadata.uid.clone());
    }

    #[tokio::test]
    async fn test_does_not_adopt_child_taken_by_another_owner_since_the_list() {
        let store = MemoryStore::new();
        let parent = seed_parent(&store);
        let other = store.seed(&parents(), DynamicObject::new("other", &parents()).within("ns"));
        store.seed(&pods(), pod("contested", "web"));
        // The listed copy still looks like an orphan
        let candidates = store.list(&pods(), Some("ns")).await.unwrap();

        let mut taken = store.object(&pods(), Some("ns"), "contested").unwrap();
        upsert_owner_reference(&mut taken, controller_ref(&other));
        store.update(&pods(), &taken).await.unwrap();

        let parent_resource = parents();
        let selector = selector();
        let retry = RetryPolicy::default();
        let guard = AdoptionGuard::new(&store, &parent_resource, &parent);
        let manager = ClaimManager::new(&store, &parent, &selector, &retry, &guard);
        let (claimed, errors) = manager.claim(&pods(), candidates).await;

        assert!(claimed.is_empty());
        assert!(errors.is_empty());
        let stored = store.object(&pods(), Some("ns"), "contested").unwrap();
        let controllers: Vec<&str> = stored
            .owner_references()
            .iter()
            .filter(|r| r.controller == Some(true))
            .map(|r| r.uid.as_str())
            .collect();
        assert_eq!(controllers, vec![uid_of(&other)]);
    }

    #[tokio::test]
    async fn test_releases_owned_child_that_stopped_matching() {
        let store = MemoryStore::new();
        let parent = seed_parent(&store);
        let mut owned = pod("owned", "db");
        upsert_owner_reference(&mut owned, controller_ref(&parent));
        store.seed(&pods(), owned);

        let (claimed, errors) = run_claim(&store, &parent).await;
        assert!(claimed.is_empty());
        assert!(errors.is_empty());
        let stored = store.object(&pods(), Some("ns"), "owned").unwrap();
        assert!(get_controller_of(&stored).is_none());
    }

    #[tokio::test]
    async fn test_keeps_owned_child_without_writes() {
        let store = MemoryStore::new();
        let parent = seed_parent(&store);
        let mut owned = pod("owned", "web");
        upsert_owner_reference(&mut owned, controller_ref(&parent));
        store.seed(&pods(), owned);

        let (claimed, errors) = run_claim(&store, &parent).await;
        assert_eq!(claimed.len(), 1);
        assert!(errors.is_empty());
        assert!(store.actions().is_empty());
    }

    #[tokio::test]
    async fn test_release_of_vanished_child_is_success() {
        let store = MemoryStore::new();
        let parent = seed_parent(&store);
        let mut owned = pod("owned", "db");
        upsert_owner_reference(&mut owned, controller_ref(&parent));
        let owned = store.seed(&pods(), owned);
        store
            .delete(&pods(), Some("ns"), "owned", None)
            .await
            .unwrap();

        let parent_resource = parents();
        let selector = selector();
        let retry = RetryPolicy::default();
        let guard = AdoptionGuard::new(&store, &parent_resource, &parent);
        let manager = ClaimManager::new(&store, &parent, &selector, &retry, &guard);
        let (claimed, errors) = manager.claim(&pods(), vec![owned]).await;
        assert!(claimed.is_empty());
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_no_adoption_when_parent_was_recreated() {
        let store = MemoryStore::new();
        let mut parent = seed_parent(&store);
        parent.metadata.uid = Some("stale-uid".to_string());
        store.seed(&pods(), pod("orphan", "web"));

        let (claimed, errors) = run_claim(&store, &parent).await;
        assert!(claimed.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("is gone"));
        assert!(store.actions().is_empty());
    }

    #[tokio::test]
    async fn test_adoption_retries_conflicts() {
        let store = MemoryStore::new();
        let parent = seed_parent(&store);
        store.seed(&pods(), pod("orphan", "web"));
        store.inject_conflicts(crate::dynamic::StoreOp::Update, "orphan", 2);

        let (claimed, errors) = run_claim(&store, &parent).await;
        assert!(errors.is_empty());
        assert_eq!(claimed.len(), 1);
        assert_eq!(
            store.actions(),
            vec![StoreAction::Update {
                kind: "Pod".to_string(),
                name: "ns/orphan".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_deleting_parent_neither_adopts_nor_releases() {
        let store = MemoryStore::new();
        let mut parent = DynamicObject::new("p", &parents()).within("ns");
        parent.metadata.deletion_timestamp =
            serde_json::from_value(json!("2024-01-01T00:00:00Z")).ok();
        let parent = store.seed(&parents(), parent);
        store.seed(&pods(), pod("orphan", "web"));
        let mut owned = pod("owned", "db");
        upsert_owner_reference(&mut owned, controller_ref(&parent));
        store.seed(&pods(), owned);

        let (claimed, errors) = run_claim(&store, &parent).await;
        assert!(claimed.is_empty());
        assert!(errors.is_empty());
        assert!(store.actions().is_empty());
    }
}
