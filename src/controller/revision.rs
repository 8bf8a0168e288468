//! # Revision History
//!
//! Staged rollouts keep one `ControllerRevision` per distinct projection of
//! the parent onto its revision-relevant fields. Every pass materializes the
//! parent each revision describes, asks the decision function about each of
//! them concurrently, lets the rollout move children between revisions, and
//! persists the resulting claim lists before any child is touched.
//!
//! Index 0 of the revision list is always the latest parent state.

use super::apply::ApplyError;
use super::claim::{AdoptionGuard, ClaimManager};
use super::error::ControllerError;
use super::hooks::SyncResponse;
use super::parent::{ParentController, SyncOutcome};
use super::rollout::sync_rolling_update;
use crate::constants::{CONTROLLER_UID_LABEL, LABEL_KEY_API_GROUP, LABEL_KEY_RESOURCE, MAX_NAME_LENGTH};
use crate::crd::ControllerRevision;
use crate::dynamic::{
    controller_ref, display_name, field_path, from_value, get_nested, is_deleting, relative_name, set_nested,
    to_value, uid_of, ChildKind, ChildMap,
};
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// The parent as one revision sees it, plus what the decision function wants for it
#[derive(Debug, Clone)]
pub struct ParentRevision {
    /// Live parent with this revision's patch applied
    pub parent: DynamicObject,
    pub revision: ControllerRevision,
    pub status: Option<Map<String, Value>>,
    pub desired: ChildMap,
    /// Desired children in the order the decision function returned them
    pub desired_order: Vec<(ChildKind, String)>,
    pub resync_after_seconds: f64,
    pub finalized: bool,
}

impl ParentRevision {
    /// Wrap a decision-function response; children are keyed relative to `live_parent`
    pub fn new(
        live_parent: &DynamicObject,
        parent: DynamicObject,
        revision: ControllerRevision,
        response: SyncResponse,
    ) -> Self {
        let mut desired_order = Vec::with_capacity(response.children.len());
        for child in &response.children {
            let key = (ChildKind::of(child), relative_name(live_parent, child));
            if !desired_order.contains(&key) {
                desired_order.push(key);
            }
        }
        Self {
            parent,
            revision,
            status: response.status,
            desired: ChildMap::from_list(live_parent, response.children),
            desired_order,
            resync_after_seconds: response.resync_after_seconds,
            finalized: response.finalized,
        }
    }
}

/// Copy the values found at `paths` into a fresh patch object
pub fn make_patch(parent: &Value, paths: &[String]) -> Value {
    let mut patch = Value::Object(Map::new());
    for path in paths {
        let parts = field_path(path);
        if let Some(value) = get_nested(parent, &parts) {
            set_nested(&mut patch, &parts, value.clone());
        }
    }
    patch
}

/// Overlay the values `patch` carries at `paths` onto `target`
pub fn apply_patch(target: &mut Value, patch: &Value, paths: &[String]) {
    for path in paths {
        let parts = field_path(path);
        if let Some(value) = get_nested(patch, &parts) {
            set_nested(target, &parts, value.clone());
        }
    }
}

/// Deterministic revision name: `<plural>.<group>-<sha256(uid, patch)>`.
///
/// The core group is spelled `core`. The prefix is cut so the name fits the
/// store's name-length limit.
pub fn revision_name(plural: &str, group: &str, parent_uid: &str, patch: &[u8]) -> String {
    let group = if group.is_empty() { "core" } else { group };
    let mut hasher = Sha256::new();
    hasher.update(parent_uid.as_bytes());
    hasher.update(patch);
    let hash = format!("{:x}", hasher.finalize());

    let mut prefix = format!("{plural}.{group}");
    let max_prefix = MAX_NAME_LENGTH - hash.len() - 1;
    if prefix.len() > max_prefix {
        let mut end = max_prefix;
        while !prefix.is_char_boundary(end) {
            end -= 1;
        }
        prefix.truncate(end);
    }
    format!("{prefix}-{hash}")
}

/// Keep the latest revision and every other revision that still claims children
pub fn prune_revisions(revisions: Vec<ParentRevision>) -> Vec<ParentRevision> {
    revisions
        .into_iter()
        .enumerate()
        .filter(|(i, pr)| *i == 0 || pr.revision.count_children() > 0)
        .map(|(_, pr)| pr)
        .collect()
}

/// Latest desired children, with children still claimed by older revisions
/// replaced by those revisions' desired state
fn compose_desired(revisions: &[ParentRevision]) -> ChildMap {
    let mut desired = revisions[0].desired.clone();
    for pr in &revisions[1..] {
        for group in &pr.revision.children {
            for name in &group.names {
                if let Some(child) = pr.desired.find_group_kind_name(&group.api_group, &group.kind, name) {
                    desired.replace_child(name, child.clone());
                }
            }
        }
    }
    desired
}

impl ParentController {
    /// Ask the decision function for desired children, going through
    /// revision history when any child kind rolls out in stages
    pub(super) async fn sync_revisions(
        &self,
        parent: &DynamicObject,
        observed: &ChildMap,
    ) -> Result<SyncOutcome, ControllerError> {
        if !self.strategies.any_rolling() || (is_deleting(parent) && !self.should_finalize(parent)) {
            let response = self.call_hook(parent, observed).await?;
            return Ok(SyncOutcome {
                status: response.status,
                children: self.desired_map(parent, response.children),
                resync_after_seconds: response.resync_after_seconds,
                finalized: response.finalized,
            });
        }

        let observed_revisions = self.claim_revisions(parent).await?;
        let paths = self.config.revision_field_paths();
        let live = to_value(parent).map_err(ApplyError::from)?;
        let latest_patch = make_patch(&live, &paths);

        // Pair each revision with the parent it describes; latest goes first
        let mut latest_record = None;
        let mut historical = Vec::new();
        for revision in &observed_revisions {
            if revision.parent_patch == latest_patch && latest_record.is_none() {
                latest_record = Some(revision.clone());
                continue;
            }
            let mut value = live.clone();
            apply_patch(&mut value, &revision.parent_patch, &paths);
            let materialized = from_value(value).map_err(ApplyError::from)?;
            historical.push((materialized, revision.clone()));
        }
        let latest_record = match latest_record {
            Some(record) => record,
            None => self.new_controller_revision(parent, latest_patch)?,
        };
        let mut pairs = Vec::with_capacity(historical.len() + 1);
        pairs.push((parent.clone(), latest_record));
        pairs.extend(historical);

        let calls = pairs.iter().map(|(revision_parent, _)| self.call_hook(revision_parent, observed));
        let responses = futures::future::join_all(calls).await;

        let mut revisions = Vec::with_capacity(pairs.len());
        for ((revision_parent, record), response) in pairs.into_iter().zip(responses) {
            let mut response = response?;
            self.prepare_children(parent, &mut response.children);
            revisions.push(ParentRevision::new(parent, revision_parent, record, response));
        }

        let step = sync_rolling_update(&mut revisions, observed, &self.strategies);
        debug!(?step, revisions = revisions.len(), "rollout step");

        let revisions = prune_revisions(revisions);
        let desired_records: Vec<&ControllerRevision> = revisions.iter().map(|pr| &pr.revision).collect();
        self.manage_revisions(parent, &observed_revisions, &desired_records).await?;

        let children = compose_desired(&revisions);
        let resync_after_seconds = revisions
            .iter()
            .map(|pr| pr.resync_after_seconds)
            .filter(|s| *s > 0.0)
            .reduce(f64::min)
            .unwrap_or(0.0);
        let finalized = revisions.iter().all(|pr| pr.finalized);
        let status = revisions.into_iter().next().and_then(|latest| latest.status);

        Ok(SyncOutcome {
            status,
            children,
            resync_after_seconds,
            finalized,
        })
    }

    /// Claim the revisions belonging to this parent.
    ///
    /// Group and resource labels keep parents of different types that share
    /// a namespace and labels apart.
    async fn claim_revisions(&self, parent: &DynamicObject) -> Result<Vec<ControllerRevision>, ControllerError> {
        let group = self.parent_resource.group().to_string();
        let plural = self.parent_resource.api_resource.plural.clone();
        let selector = self.make_selector(
            parent,
            &[(LABEL_KEY_API_GROUP, group.as_str()), (LABEL_KEY_RESOURCE, plural.as_str())],
        )?;

        let resource = ControllerRevision::api_resource();
        let all = self
            .store
            .list(&resource, parent.namespace().as_deref())
            .await
            .map_err(|e| ControllerError::store("can't list ControllerRevisions", e))?;

        let guard = AdoptionGuard::new(self.store.as_ref(), &self.parent_resource.api_resource, parent);
        let claims = ClaimManager::new(self.store.as_ref(), parent, &selector, &self.retry, &guard);
        let (claimed, errors) = claims.claim(&resource, all).await;
        ControllerError::aggregate(errors)?;

        claimed
            .iter()
            .map(|obj| {
                ControllerRevision::from_dynamic(obj).map_err(|e| ControllerError::InvalidChild {
                    kind: "ControllerRevision".to_string(),
                    name: obj.name_any(),
                    reason: format!("can't decode: {e}"),
                })
            })
            .collect()
    }

    fn new_controller_revision(
        &self,
        parent: &DynamicObject,
        patch: Value,
    ) -> Result<ControllerRevision, ControllerError> {
        let patch_bytes = serde_json::to_vec(&patch).map_err(ApplyError::from)?;

        let mut labels: BTreeMap<String, String> = if self.config.generate_selector() {
            BTreeMap::from([(CONTROLLER_UID_LABEL.to_string(), uid_of(parent).to_string())])
        } else {
            // Orphaned revisions are found again through the template labels
            parent
                .data
                .pointer("/spec/template/metadata/labels")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| {
                    ControllerError::Config(format!("invalid template labels on {}: {e}", display_name(parent)))
                })?
                .unwrap_or_default()
        };
        let group = self.parent_resource.group();
        let plural = &self.parent_resource.api_resource.plural;
        labels.insert(LABEL_KEY_API_GROUP.to_string(), group.to_string());
        labels.insert(LABEL_KEY_RESOURCE.to_string(), plural.clone());

        let mut revision = ControllerRevision {
            parent_patch: patch,
            ..ControllerRevision::default()
        };
        revision.metadata.name = Some(revision_name(plural, group, uid_of(parent), &patch_bytes));
        revision.metadata.namespace = parent.namespace();
        revision.metadata.labels = Some(labels);
        revision.metadata.owner_references = Some(vec![controller_ref(parent)]);
        Ok(revision)
    }

    /// Persist the revision set; the first failure ends the pass
    async fn manage_revisions(
        &self,
        parent: &DynamicObject,
        observed: &[ControllerRevision],
        desired: &[&ControllerRevision],
    ) -> Result<(), ControllerError> {
        let resource = ControllerRevision::api_resource();
        let namespace = parent.namespace();

        for revision in observed {
            if desired.iter().any(|d| d.name() == revision.name()) {
                continue;
            }
            info!(revision = %revision.name(), "deleting ControllerRevision");
            match self
                .store
                .delete(&resource, namespace.as_deref(), revision.name(), revision.metadata.uid.as_deref())
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(ControllerError::store(
                        format!("can't delete ControllerRevision {}", revision.name()),
                        e,
                    ))
                }
            }
        }

        for revision in desired {
            let encode = |r: &ControllerRevision| {
                r.to_dynamic().map_err(|e| ControllerError::InvalidChild {
                    kind: "ControllerRevision".to_string(),
                    name: r.name().to_string(),
                    reason: format!("can't encode: {e}"),
                })
            };
            match observed.iter().find(|o| o.name() == revision.name()) {
                Some(old) if old == *revision => {}
                Some(old) => {
                    let mut updated = (*revision).clone();
                    updated.metadata.resource_version.clone_from(&old.metadata.resource_version);
                    info!(revision = %revision.name(), "updating ControllerRevision");
                    self.store
                        .update(&resource, &encode(&updated)?)
                        .await
                        .map_err(|e| {
                            ControllerError::store(format!("can't update ControllerRevision {}", revision.name()), e)
                        })?;
                }
                None => {
                    info!(revision = %revision.name(), "creating ControllerRevision");
                    self.store.create(&resource, &encode(*revision)?).await.map_err(|e| {
                        ControllerError::store(format!("can't create ControllerRevision {}", revision.name()), e)
                    })?;
                }
            }
        }
        Ok(())
    }
}
