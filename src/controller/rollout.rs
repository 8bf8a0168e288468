//! # Rollout
//!
//! Staged migration of children from older revisions to the latest one.
//!
//! Each pass reconciles the claims stored on the revisions, hands the latest
//! revision every child it can take for free, and then migrates at most one
//! more child. The next migration only happens once every child already on
//! the latest revision is updated and passes its status checks.
//!
//! Claims are indices into the per-pass revision array; index 0 is always the
//! latest revision and wins every tie.

use super::apply::apply_update;
use super::revision::ParentRevision;
use super::strategy::UpdateStrategyMap;
use crate::constants::{
    CONDITION_TYPE_UPDATED, REASON_ON_LATEST_REVISION, REASON_ROLLOUT_PROGRESSING,
    REASON_ROLLOUT_WAITING,
};
use crate::crd::{get_condition, set_condition, ControllerRevisionChildren, StatusChecks, StatusCondition, UpdateMethod};
use crate::dynamic::{objects_equal, ChildMap, GroupKind};
use crate::observability::metrics;
use kube::api::DynamicObject;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

/// Which revision claims each child, by group/kind then name
type ClaimTable = HashMap<GroupKind, HashMap<String, usize>>;

const LATEST: usize = 0;

/// Outcome of one rollout pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutStep {
    /// A child on the latest revision is not ready yet
    Waiting(String),
    /// One child was moved to the latest revision
    Progressing { kind: String, name: String },
    /// Every desired child is on the latest revision
    OnLatestRevision,
}

/// Advance the rollout by at most one child and record the condition on the
/// latest revision's status
pub fn sync_rolling_update(
    revisions: &mut [ParentRevision],
    observed: &ChildMap,
    strategies: &UpdateStrategyMap,
) -> RolloutStep {
    if revisions.is_empty() {
        return RolloutStep::OnLatestRevision;
    }

    let mut claimed = sync_revision_claims(revisions, strategies);
    fast_forward(revisions, observed, strategies, &mut claimed);

    let step = next_step(revisions, observed, strategies, &claimed);
    let latest = &mut revisions[LATEST];
    let condition = match &step {
        RolloutStep::Waiting(message) => {
            info!(revision = %latest.revision.name(), reason = %message, "rollout waiting");
            StatusCondition::new(CONDITION_TYPE_UPDATED, "False", REASON_ROLLOUT_WAITING, message.clone())
        }
        RolloutStep::Progressing { kind, name } => {
            info!(revision = %latest.revision.name(), kind = %kind, child = %name, "rollout progressing");
            metrics::increment_rollout_migrations();
            StatusCondition::new(
                CONDITION_TYPE_UPDATED,
                "False",
                REASON_ROLLOUT_PROGRESSING,
                format!("updating {kind} {name}"),
            )
        }
        RolloutStep::OnLatestRevision => StatusCondition::new(
            CONDITION_TYPE_UPDATED,
            "True",
            REASON_ON_LATEST_REVISION,
            format!("latest ControllerRevision: {}", latest.revision.name()),
        ),
    };
    set_condition(latest.status.get_or_insert_with(Default::default), &condition);
    step
}

/// Drop stale and duplicate claims, returning who claims what
fn sync_revision_claims(revisions: &mut [ParentRevision], strategies: &UpdateStrategyMap) -> ClaimTable {
    let mut claimed = ClaimTable::new();
    let mut kept = Vec::with_capacity(revisions.len());

    let latest_desired = &revisions[LATEST].desired;
    for (index, pr) in revisions.iter().enumerate() {
        let mut children = Vec::new();
        for group in &pr.revision.children {
            // Kinds that stopped rolling forget their claims
            if !strategies.is_rolling(&group.api_group, &group.kind) {
                continue;
            }
            let claims = claimed
                .entry(GroupKind::new(&group.api_group, &group.kind))
                .or_default();

            let mut names = Vec::new();
            for name in &group.names {
                if latest_desired
                    .find_group_kind_name(&group.api_group, &group.kind, name)
                    .is_none()
                {
                    continue;
                }
                if claims.contains_key(name) {
                    continue;
                }
                claims.insert(name.clone(), index);
                names.push(name.clone());
            }

            if !names.is_empty() {
                children.push(ControllerRevisionChildren {
                    api_group: group.api_group.clone(),
                    kind: group.kind.clone(),
                    names,
                });
            }
        }
        kept.push(children);
    }

    for (pr, children) in revisions.iter_mut().zip(kept) {
        pr.revision.children = children;
    }
    claimed
}

/// Give the latest revision every child that is unclaimed, or that already
/// matches what the latest revision wants
fn fast_forward(
    revisions: &mut [ParentRevision],
    observed: &ChildMap,
    strategies: &UpdateStrategyMap,
    claimed: &mut ClaimTable,
) {
    let mut moves: Vec<(GroupKind, String, Option<usize>)> = Vec::new();

    for (kind, children) in revisions[LATEST].desired.iter() {
        let group_kind = kind.group_kind();
        if !strategies.is_rolling(&group_kind.group, &group_kind.kind) {
            continue;
        }
        for (name, desired) in children {
            let owner = claimed.get(&group_kind).and_then(|c| c.get(name)).copied();
            match owner {
                None => moves.push((group_kind.clone(), name.clone(), None)),
                Some(LATEST) => {}
                Some(other) => {
                    let Some(child) = observed.find_group_kind_name(&group_kind.group, &group_kind.kind, name) else {
                        continue;
                    };
                    if is_up_to_date(child, desired) {
                        moves.push((group_kind.clone(), name.clone(), Some(other)));
                    }
                }
            }
        }
    }

    for (group_kind, name, from) in moves {
        debug!(kind = %group_kind.kind, child = %name, "fast-forwarding child to latest revision");
        revisions[LATEST]
            .revision
            .add_child(&group_kind.group, &group_kind.kind, &name);
        if let Some(from) = from {
            revisions[from]
                .revision
                .remove_child(&group_kind.group, &group_kind.kind, &name);
        }
        claimed.entry(group_kind).or_default().insert(name, LATEST);
    }
}

/// Pick and perform the single migration of this pass, if any
fn next_step(
    revisions: &mut [ParentRevision],
    observed: &ChildMap,
    strategies: &UpdateStrategyMap,
    claimed: &ClaimTable,
) -> RolloutStep {
    let candidate = revisions[LATEST]
        .desired_order
        .iter()
        .filter(|(kind, _)| strategies.is_rolling(kind.group(), &kind.kind))
        .find(|(kind, name)| {
            claimed
                .get(&kind.group_kind())
                .and_then(|c| c.get(name))
                .copied()
                != Some(LATEST)
        })
        .cloned();

    let Some((kind, name)) = candidate else {
        return RolloutStep::OnLatestRevision;
    };

    if let Err(message) = should_continue_rolling(&revisions[LATEST], observed, strategies) {
        return RolloutStep::Waiting(message);
    }

    let group = kind.group().to_string();
    revisions[LATEST].revision.add_child(&group, &kind.kind, &name);
    for pr in revisions.iter_mut().skip(1) {
        pr.revision.remove_child(&group, &kind.kind, &name);
    }
    RolloutStep::Progressing {
        kind: kind.kind,
        name,
    }
}

/// Every rolling child already on the latest revision must be observed,
/// updated and happy
fn should_continue_rolling(
    latest: &ParentRevision,
    observed: &ChildMap,
    strategies: &UpdateStrategyMap,
) -> Result<(), String> {
    for group in &latest.revision.children {
        let Some(strategy) = strategies
            .get(&group.api_group, &group.kind)
            .filter(|s| s.method.is_rolling())
        else {
            continue;
        };

        for name in &group.names {
            let kind = &group.kind;
            let child = observed
                .find_group_kind_name(&group.api_group, kind, name)
                .ok_or_else(|| format!("missing child {kind} {name}"))?;
            let desired = latest
                .desired
                .find_group_kind_name(&group.api_group, kind, name)
                .ok_or_else(|| format!("can't check if child {kind} {name} is updated: not desired by latest revision"))?;

            let updated = apply_update(child, desired)
                .map_err(|e| format!("can't check if child {kind} {name} is updated: {e}"))?;
            if !objects_equal(child, &updated) {
                return Err(format!("child {kind} {name} is not updated yet"));
            }

            if strategy.method == UpdateMethod::RollingInPlace {
                let observed_generation = child
                    .data
                    .get("status")
                    .and_then(|s| s.get("observedGeneration"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                // Not every controller reports observedGeneration
                if observed_generation > 0 && observed_generation < child.metadata.generation.unwrap_or(0) {
                    return Err(format!(
                        "child {kind} {name} with RollingInPlace update strategy hasn't observed latest spec"
                    ));
                }
            }

            check_status(strategies.status_checks(&group.api_group, kind), child)
                .map_err(|e| format!("child {kind} {name} failed status check: {e}"))?;
        }
    }
    Ok(())
}

fn is_up_to_date(child: &DynamicObject, desired: &DynamicObject) -> bool {
    apply_update(child, desired).is_ok_and(|updated| objects_equal(child, &updated))
}

/// Evaluate the configured condition checks against a child's status
fn check_status(checks: Option<&StatusChecks>, child: &DynamicObject) -> Result<(), String> {
    let Some(checks) = checks else {
        return Ok(());
    };

    for check in &checks.conditions {
        let condition = get_condition(&child.data, &check.r#type)
            .ok_or_else(|| format!("required condition type missing: {:?}", check.r#type))?;
        if let Some(want) = &check.status {
            if &condition.status != want {
                return Err(format!(
                    "{:?} condition status is {:?} (want {want:?})",
                    check.r#type, condition.status
                ));
            }
        }
        if let Some(want) = &check.reason {
            let reason = condition.reason.unwrap_or_default();
            if &reason != want {
                return Err(format!(
                    "{:?} condition reason is {reason:?} (want {want:?})",
                    check.r#type
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::hooks::SyncResponse;
    use crate::crd::{ChildUpdateStrategy, ControllerRevision, StatusConditionCheck};
    use crate::dynamic::ChildKind;
    use serde_json::json;

    fn parent() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "ctl.example.com/v1",
            "kind": "Thing",
            "metadata": {"name": "p", "namespace": "ns", "uid": "u1"}
        }))
        .unwrap()
    }

    fn pod(name: &str, image: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": "ns"},
            "spec": {"image": image}
        }))
        .unwrap()
    }

    /// Observed copy of `desired` as the engine would have written it
    fn observed_pod(desired: &DynamicObject) -> DynamicObject {
        let mut observed = apply_update(desired, desired).unwrap();
        observed.metadata.uid = Some(format!("uid-{}", desired.metadata.name.as_deref().unwrap()));
        observed.metadata.generation = Some(1);
        observed
    }

    fn strategies(method: UpdateMethod, checks: Option<StatusChecks>) -> UpdateStrategyMap {
        let mut map = UpdateStrategyMap::new();
        map.insert(
            GroupKind::new("", "Pod"),
            ChildUpdateStrategy {
                method,
                status_checks: checks,
            },
        );
        map
    }

    fn revision(name: &str, claims: &[&str], desired: Vec<DynamicObject>) -> ParentRevision {
        let mut record = ControllerRevision::default();
        record.metadata.name = Some(name.to_string());
        for claim in claims {
            record.add_child("", "Pod", claim);
        }
        let response = SyncResponse {
            children: desired,
            ..SyncResponse::default()
        };
        ParentRevision::new(&parent(), parent(), record, response)
    }

    fn claims(pr: &ParentRevision) -> Vec<String> {
        pr.revision
            .children
            .iter()
            .flat_map(|c| c.names.clone())
            .collect()
    }

    fn updated_condition(pr: &ParentRevision) -> StatusCondition {
        let status = json!({"status": pr.status.clone().unwrap()});
        get_condition(&status, CONDITION_TYPE_UPDATED).unwrap()
    }

    #[test]
    fn test_first_pass_claims_everything_for_latest() {
        let desired = vec![pod("a", "v1"), pod("b", "v1")];
        let mut revisions = vec![revision("r0", &[], desired)];
        let step = sync_rolling_update(
            &mut revisions,
            &ChildMap::new(),
            &strategies(UpdateMethod::RollingInPlace, None),
        );

        assert_eq!(step, RolloutStep::OnLatestRevision);
        assert_eq!(claims(&revisions[0]), vec!["a", "b"]);
        let condition = updated_condition(&revisions[0]);
        assert_eq!(condition.status, "True");
        assert_eq!(condition.message.as_deref(), Some("latest ControllerRevision: r0"));
    }

    #[test]
    fn test_migrates_one_child_per_pass_in_desired_order() {
        let old = vec![pod("b", "v1"), pod("a", "v1")];
        let new = vec![pod("b", "v2"), pod("a", "v2")];
        let observed = ChildMap::from_list(&parent(), old.iter().map(observed_pod));
        let mut revisions = vec![revision("r1", &[], new), revision("r0", &["a", "b"], old)];

        let step = sync_rolling_update(
            &mut revisions,
            &observed,
            &strategies(UpdateMethod::RollingInPlace, None),
        );

        assert_eq!(
            step,
            RolloutStep::Progressing {
                kind: "Pod".to_string(),
                name: "b".to_string()
            }
        );
        assert_eq!(claims(&revisions[0]), vec!["b"]);
        assert_eq!(claims(&revisions[1]), vec!["a"]);
        assert_eq!(
            updated_condition(&revisions[0]).reason.as_deref(),
            Some(REASON_ROLLOUT_PROGRESSING)
        );
    }

    #[test]
    fn test_pauses_when_migrated_child_is_not_updated() {
        let old = vec![pod("a", "v1"), pod("b", "v1")];
        let new = vec![pod("a", "v2"), pod("b", "v2")];
        // `a` is claimed by latest but still runs the old spec
        let observed = ChildMap::from_list(&parent(), old.iter().map(observed_pod));
        let mut revisions = vec![revision("r1", &["a"], new), revision("r0", &["b"], old)];

        let step = sync_rolling_update(
            &mut revisions,
            &observed,
            &strategies(UpdateMethod::RollingInPlace, None),
        );
        assert_eq!(step, RolloutStep::Waiting("child Pod a is not updated yet".to_string()));
        assert_eq!(claims(&revisions[1]), vec!["b"]);
        assert_eq!(
            updated_condition(&revisions[0]).reason.as_deref(),
            Some(REASON_ROLLOUT_WAITING)
        );
    }

    #[test]
    fn test_status_checks_gate_the_rollout() {
        let old = vec![pod("a", "v1"), pod("b", "v1")];
        let new = vec![pod("a", "v2"), pod("b", "v2")];
        let mut a = observed_pod(&new[0]);
        a.data["status"] = json!({"conditions": [{"type": "Ready", "status": "False"}]});
        let observed = ChildMap::from_list(&parent(), vec![a, observed_pod(&old[1])]);

        let checks = StatusChecks {
            conditions: vec![StatusConditionCheck {
                r#type: "Ready".to_string(),
                status: Some("True".to_string()),
                reason: None,
            }],
        };
        let mut revisions = vec![revision("r1", &["a"], new), revision("r0", &["b"], old)];
        let step = sync_rolling_update(
            &mut revisions,
            &observed,
            &strategies(UpdateMethod::RollingRecreate, Some(checks)),
        );
        assert_eq!(
            step,
            RolloutStep::Waiting(
                r#"child Pod a failed status check: "Ready" condition status is "False" (want "True")"#.to_string()
            )
        );
    }

    #[test]
    fn test_missing_condition_and_missing_child() {
        let checks = StatusChecks {
            conditions: vec![StatusConditionCheck {
                r#type: "Ready".to_string(),
                status: None,
                reason: Some("Done".to_string()),
            }],
        };
        let child = observed_pod(&pod("a", "v1"));
        assert_eq!(
            check_status(Some(&checks), &child),
            Err(r#"required condition type missing: "Ready""#.to_string())
        );

        let new = vec![pod("a", "v2"), pod("b", "v2")];
        let mut revisions = vec![revision("r1", &["a"], new), revision("r0", &["b"], vec![pod("b", "v1")])];
        let step = sync_rolling_update(
            &mut revisions,
            &ChildMap::new(),
            &strategies(UpdateMethod::RollingInPlace, None),
        );
        assert_eq!(step, RolloutStep::Waiting("missing child Pod a".to_string()));
    }

    #[test]
    fn test_stale_observed_generation_blocks_rolling_in_place() {
        let new = vec![pod("a", "v2"), pod("b", "v2")];
        let mut a = observed_pod(&new[0]);
        a.metadata.generation = Some(3);
        a.data["status"] = json!({"observedGeneration": 2});
        let observed = ChildMap::from_list(&parent(), vec![a]);

        let mut revisions = vec![revision("r1", &["a"], new), revision("r0", &["b"], vec![pod("b", "v1")])];
        let step = sync_rolling_update(
            &mut revisions,
            &observed,
            &strategies(UpdateMethod::RollingInPlace, None),
        );
        assert_eq!(
            step,
            RolloutStep::Waiting(
                "child Pod a with RollingInPlace update strategy hasn't observed latest spec".to_string()
            )
        );
    }

    #[test]
    fn test_fast_forward_moves_children_that_already_match() {
        let old = vec![pod("a", "v1")];
        let new = vec![pod("a", "v1")];
        let observed = ChildMap::from_list(&parent(), old.iter().map(observed_pod));
        let mut revisions = vec![revision("r1", &[], new), revision("r0", &["a"], old)];

        let step = sync_rolling_update(
            &mut revisions,
            &observed,
            &strategies(UpdateMethod::RollingInPlace, None),
        );
        assert_eq!(step, RolloutStep::OnLatestRevision);
        assert_eq!(claims(&revisions[0]), vec!["a"]);
        assert!(claims(&revisions[1]).is_empty());
    }

    #[test]
    fn test_claims_are_reconciled() {
        let desired = vec![pod("a", "v2"), pod("b", "v2")];
        let mut r0 = revision("r0", &["a", "b", "gone"], vec![pod("a", "v1")]);
        r0.revision.add_child("apps", "Deployment", "d");
        let mut revisions = vec![revision("r1", &["a"], desired), r0];

        let claimed = sync_revision_claims(&mut revisions, &strategies(UpdateMethod::RollingInPlace, None));

        // Latest wins the duplicate, undesired names and non-rolling kinds are dropped
        assert_eq!(claims(&revisions[0]), vec!["a"]);
        assert_eq!(claims(&revisions[1]), vec!["b"]);
        let pods = &claimed[&GroupKind::new("", "Pod")];
        assert_eq!(pods["a"], 0);
        assert_eq!(pods["b"], 1);
        assert!(!claimed.contains_key(&GroupKind::new("apps", "Deployment")));
    }

    #[test]
    fn test_non_rolling_kinds_are_ignored() {
        let mut revisions = vec![revision("r0", &[], vec![pod("a", "v1")])];
        let step = sync_rolling_update(
            &mut revisions,
            &ChildMap::new(),
            &strategies(UpdateMethod::InPlace, None),
        );
        assert_eq!(step, RolloutStep::OnLatestRevision);
        assert!(claims(&revisions[0]).is_empty());
        assert_eq!(
            revisions[0].desired_order,
            vec![(ChildKind::new("v1", "Pod"), "a".to_string())]
        );
    }
}
