//! # Resource Discovery
//!
//! Resolves `(apiVersion, plural resource)` pairs from configuration into
//! kinds, scope and subresources via API discovery.

use super::store::StoreError;
use super::parse_api_version;
use kube::api::ApiResource;
use kube::discovery::{Discovery, Scope};
use kube::Client;
use tracing::debug;

/// A resource type known to the API server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResource {
    pub api_resource: ApiResource,
    pub namespaced: bool,
    /// Whether `/status` is served as a subresource
    pub status_subresource: bool,
}

impl ResolvedResource {
    /// Describe a resource without asking the API server
    pub fn new(api_version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        let (group, version) = parse_api_version(api_version);
        Self {
            api_resource: ApiResource {
                group: group.to_string(),
                version: version.to_string(),
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                plural: plural.to_string(),
            },
            namespaced,
            status_subresource: false,
        }
    }

    #[must_use]
    pub fn with_status_subresource(mut self) -> Self {
        self.status_subresource = true;
        self
    }

    pub fn kind(&self) -> &str {
        &self.api_resource.kind
    }

    pub fn group(&self) -> &str {
        &self.api_resource.group
    }
}

/// Look up `plural` within `api_version` using a completed discovery run
pub fn resolve(
    discovery: &Discovery,
    api_version: &str,
    plural: &str,
) -> Result<ResolvedResource, StoreError> {
    let (group, version) = parse_api_version(api_version);
    let unknown = || StoreError::UnknownResource {
        api_version: api_version.to_string(),
        resource: plural.to_string(),
    };

    let api_group = discovery.get(group).ok_or_else(unknown)?;
    let (api_resource, caps) = api_group
        .versioned_resources(version)
        .into_iter()
        .find(|(ar, _)| ar.plural == plural)
        .ok_or_else(unknown)?;

    let status_subresource = caps
        .subresources
        .iter()
        .any(|(sub, _)| sub.plural.ends_with("status"));

    debug!(
        api_version = %api_version,
        resource = %plural,
        kind = %api_resource.kind,
        "resolved resource"
    );

    Ok(ResolvedResource {
        api_resource,
        namespaced: matches!(caps.scope, Scope::Namespaced),
        status_subresource,
    })
}

/// Run a full discovery pass against the API server
pub async fn run(client: Client) -> Result<Discovery, StoreError> {
    Discovery::new(client).run().await.map_err(StoreError::Api)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_resource_from_parts() {
        let pods = ResolvedResource::new("v1", "Pod", "pods", true);
        assert_eq!(pods.group(), "");
        assert_eq!(pods.api_resource.version, "v1");
        assert!(!pods.status_subresource);

        let things =
            ResolvedResource::new("ctl.example.com/v1", "Thing", "things", false).with_status_subresource();
        assert_eq!(things.group(), "ctl.example.com");
        assert_eq!(things.kind(), "Thing");
        assert!(things.status_subresource);
    }
}
