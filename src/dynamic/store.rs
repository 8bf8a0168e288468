//! # Object Store
//!
//! Abstraction over the remote, versioned object store, plus the
//! read-modify-write combinator every conditional write goes through.

use super::{display_name, kind_of, uid_of};
use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use std::time::Duration;
use tracing::debug;

/// Errors returned by an [`ObjectStore`]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("original {kind} {name} is gone: got uid {actual}, wanted {expected}")]
    Gone {
        kind: String,
        name: String,
        expected: String,
        actual: String,
    },

    #[error("can't find resource {resource} in apiVersion {api_version}")]
    UnknownResource {
        api_version: String,
        resource: String,
    },

    #[error("Kubernetes API error: {0}")]
    Api(#[source] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// The object was deleted and possibly recreated under a new UID
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }
}

/// Dynamic access to arbitrary resource types.
///
/// `namespace` is `None` for cluster-scoped resources and for listing
/// across all namespaces.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    /// Uncached read
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, StoreError>;

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Replace the object; fails with `Conflict` on a stale resourceVersion
    async fn update(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Replace only the status of the object
    async fn update_status(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Delete with cascading (background) propagation.
    ///
    /// With `uid` set the delete only succeeds if the stored object still has that UID.
    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        uid: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// Bounded exponential backoff for conflicting writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts
    pub steps: u32,
    /// Delay after the first conflict
    pub initial: Duration,
    /// Multiplier applied after each further conflict
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: crate::constants::DEFAULT_CONFLICT_RETRY_STEPS,
            initial: Duration::from_millis(crate::constants::DEFAULT_CONFLICT_RETRY_INITIAL_MS),
            factor: crate::constants::DEFAULT_CONFLICT_RETRY_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(self.factor.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteTarget {
    Object,
    Status,
}

/// Read-modify-write with conflict retry.
///
/// Re-reads `orig`, verifies its UID, lets `mutate` change the fresh copy and
/// writes it back. `mutate` returns `false` when there is nothing to change,
/// in which case no write happens and the fresh object is returned. A UID
/// mismatch aborts with [`StoreError::Gone`].
pub async fn atomic_update<F>(
    store: &dyn ObjectStore,
    resource: &ApiResource,
    orig: &DynamicObject,
    policy: &RetryPolicy,
    mutate: F,
) -> Result<DynamicObject, StoreError>
where
    F: FnMut(&mut DynamicObject) -> bool + Send,
{
    read_modify_write(store, resource, orig, policy, WriteTarget::Object, mutate).await
}

/// [`atomic_update`] against the status of the object
pub async fn atomic_status_update<F>(
    store: &dyn ObjectStore,
    resource: &ApiResource,
    orig: &DynamicObject,
    policy: &RetryPolicy,
    mutate: F,
) -> Result<DynamicObject, StoreError>
where
    F: FnMut(&mut DynamicObject) -> bool + Send,
{
    read_modify_write(store, resource, orig, policy, WriteTarget::Status, mutate).await
}

async fn read_modify_write<F>(
    store: &dyn ObjectStore,
    resource: &ApiResource,
    orig: &DynamicObject,
    policy: &RetryPolicy,
    target: WriteTarget,
    mut mutate: F,
) -> Result<DynamicObject, StoreError>
where
    F: FnMut(&mut DynamicObject) -> bool + Send,
{
    let namespace = orig.namespace();
    let name = orig.name_any();
    let steps = policy.steps.max(1);
    let mut attempt = 0;

    loop {
        let mut current = store.get(resource, namespace.as_deref(), &name).await?;
        if uid_of(&current) != uid_of(orig) {
            return Err(StoreError::Gone {
                kind: kind_of(orig).to_string(),
                name: display_name(orig),
                expected: uid_of(orig).to_string(),
                actual: uid_of(&current).to_string(),
            });
        }

        if !mutate(&mut current) {
            return Ok(current);
        }

        let result = match target {
            WriteTarget::Object => store.update(resource, &current).await,
            WriteTarget::Status => store.update_status(resource, &current).await,
        };

        match result {
            Err(e) if e.is_conflict() && attempt + 1 < steps => {
                let delay = policy.delay(attempt);
                debug!(
                    object = %display_name(orig),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "write conflict, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_grow_by_factor() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(2), Duration::from_millis(250));
    }

    #[test]
    fn test_error_classification() {
        let conflict = StoreError::Conflict {
            kind: "Pod".to_string(),
            name: "ns/a".to_string(),
            message: "stale".to_string(),
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_not_found());
        let gone = StoreError::Gone {
            kind: "Pod".to_string(),
            name: "ns/a".to_string(),
            expected: "u1".to_string(),
            actual: "u2".to_string(),
        };
        assert!(gone.is_gone());
        assert_eq!(
            gone.to_string(),
            "original Pod ns/a is gone: got uid u2, wanted u1"
        );
    }
}
