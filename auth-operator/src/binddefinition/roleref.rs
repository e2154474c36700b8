//! Role-reference validation for the Binding Engine, kept pure over
//! already-fetched existence sets so the missing-ref formatting and
//! dedup/sort behavior can be tested without a live cluster.

use auth_operator_types::{BindDefinitionSpec, MissingRolePolicy};
use std::collections::{BTreeMap, BTreeSet};

/// `resolved_namespaces` maps each `roleBindings[i]` index to its
/// already-resolved Active namespace set.
pub fn missing_role_refs(
    spec: &BindDefinitionSpec,
    existing_cluster_roles: &BTreeSet<String>,
    existing_roles: &BTreeMap<String, BTreeSet<String>>,
    resolved_namespaces: &[BTreeSet<String>],
) -> Vec<String> {
    let mut missing = BTreeSet::new();

    for name in &spec.cluster_role_bindings.cluster_role_refs {
        if !existing_cluster_roles.contains(name) {
            missing.insert(format!("ClusterRole/{name}"));
        }
    }

    for (i, entry) in spec.role_bindings.iter().enumerate() {
        for name in &entry.cluster_role_refs {
            if !existing_cluster_roles.contains(name) {
                missing.insert(format!("ClusterRole/{name}"));
            }
        }
        let Some(namespaces) = resolved_namespaces.get(i) else {
            continue;
        };
        for ns in namespaces {
            let roles_in_ns = existing_roles.get(ns);
            for name in &entry.role_refs {
                let present = roles_in_ns.is_some_and(|roles| roles.contains(name));
                if !present {
                    missing.insert(format!("Role/{ns}/{name}"));
                }
            }
        }
    }

    missing.into_iter().collect()
}

pub enum RoleRefOutcome {
    AllPresent,
    Warn(Vec<String>),
    Error(Vec<String>),
}

pub fn evaluate(policy: MissingRolePolicy, missing: Vec<String>) -> RoleRefOutcome {
    if missing.is_empty() {
        return RoleRefOutcome::AllPresent;
    }
    match policy {
        MissingRolePolicy::Ignore => RoleRefOutcome::AllPresent,
        MissingRolePolicy::Warn => RoleRefOutcome::Warn(missing),
        MissingRolePolicy::Error => RoleRefOutcome::Error(missing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth_operator_types::RoleBindingEntry;

    #[test]
    fn missing_role_is_reported_sorted_and_deduplicated() {
        let spec = BindDefinitionSpec {
            target_name: "bd".into(),
            role_bindings: vec![RoleBindingEntry {
                role_refs: vec!["doesnotexist".into()],
                namespace: Some("ns1".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let resolved = vec![BTreeSet::from(["ns1".to_string()])];
        let missing =
            missing_role_refs(&spec, &BTreeSet::new(), &BTreeMap::new(), &resolved);
        assert_eq!(missing, vec!["Role/ns1/doesnotexist".to_string()]);
    }

    #[test]
    fn present_role_refs_are_not_reported() {
        let spec = BindDefinitionSpec {
            target_name: "bd".into(),
            role_bindings: vec![RoleBindingEntry {
                role_refs: vec!["view".into()],
                namespace: Some("ns1".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let resolved = vec![BTreeSet::from(["ns1".to_string()])];
        let existing_roles =
            BTreeMap::from([("ns1".to_string(), BTreeSet::from(["view".to_string()]))]);
        let missing =
            missing_role_refs(&spec, &BTreeSet::new(), &existing_roles, &resolved);
        assert!(missing.is_empty());
    }

    #[test]
    fn warn_policy_does_not_stall() {
        assert!(matches!(
            evaluate(MissingRolePolicy::Warn, vec!["Role/ns1/x".into()]),
            RoleRefOutcome::Warn(_)
        ));
    }

    #[test]
    fn error_policy_stalls() {
        assert!(matches!(
            evaluate(MissingRolePolicy::Error, vec!["Role/ns1/x".into()]),
            RoleRefOutcome::Error(_)
        ));
    }

    #[test]
    fn ignore_policy_clears_missing_even_if_found() {
        assert!(matches!(
            evaluate(MissingRolePolicy::Ignore, vec!["Role/ns1/x".into()]),
            RoleRefOutcome::AllPresent
        ));
    }
}
