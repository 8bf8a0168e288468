//! # Kubernetes Object Store
//!
//! [`ObjectStore`] backed by the Kubernetes API server through `kube`.

use super::store::{ObjectStore, StoreError};
use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams, Preconditions,
    PropagationPolicy,
};
use kube::{Client, ResourceExt};

/// Object store talking to the API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, resource),
            _ => Api::all_with(self.client.clone(), resource),
        }
    }
}

/// Map API errors onto store errors
fn map_err(err: kube::Error, kind: &str, name: &str) -> StoreError {
    match err {
        kube::Error::Api(ref ae) if ae.code == 404 => StoreError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ref ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ref ae) if ae.code == 409 => StoreError::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            message: ae.message.clone(),
        },
        other => StoreError::Api(other),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let list = self
            .api(resource, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_err(e, &resource.kind, namespace.unwrap_or_default()))?;
        Ok(list
            .items
            .into_iter()
            .map(|mut obj| {
                // List items come back without type information
                obj.types.get_or_insert_with(|| kube::core::TypeMeta {
                    api_version: resource.api_version.clone(),
                    kind: resource.kind.clone(),
                });
                obj
            })
            .collect())
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, StoreError> {
        self.api(resource, namespace)
            .get(name)
            .await
            .map_err(|e| map_err(e, &resource.kind, name))
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let name = obj.name_any();
        self.api(resource, obj.namespace().as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_err(e, &resource.kind, &name))
    }

    async fn update(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let name = obj.name_any();
        self.api(resource, obj.namespace().as_deref())
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_err(e, &resource.kind, &name))
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let name = obj.name_any();
        let body = serde_json::to_vec(obj)?;
        self.api(resource, obj.namespace().as_deref())
            .replace_subresource("status", &name, &PostParams::default(), body)
            .await
            .map_err(|e| map_err(e, &resource.kind, &name))
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        uid: Option<&str>,
    ) -> Result<(), StoreError> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };
        self.api(resource, namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, &resource.kind, name))
    }
}
