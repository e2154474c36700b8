//! Pure rule-synthesis functions for the Role Synthesizer, kept free of any
//! Kubernetes client so determinism can be tested directly, each carrying
//! an inline `#[cfg(test)] mod tests`.

use crate::discovery::Snapshot;
use auth_operator_types::{RestrictedResource, RoleDefinitionSpec, TargetRoleKind};
use k8s_openapi::api::rbac::v1::PolicyRule;
use std::collections::{BTreeMap, BTreeSet};

const METRICS_NON_RESOURCE_URL: &str = "/metrics";

/// Builds the deterministic, sorted rule set for `spec` against `snapshot`.
pub fn build_rules(snapshot: &Snapshot, spec: &RoleDefinitionSpec) -> Vec<PolicyRule> {
    let restricted_resources: BTreeSet<(&str, &str)> = spec
        .restricted_resources
        .iter()
        .map(|r| (r.api_group.as_str(), r.resource.as_str()))
        .collect();

    // Key: (groupVersion, sorted verb tuple) -> resource names seen under it.
    let mut groups: BTreeMap<(String, Vec<String>), (String, BTreeSet<String>)> = BTreeMap::new();

    for (group_version, resources) in snapshot {
        for resource in resources {
            if resource.name.contains('/') {
                continue; // sub-resource, skipped upstream of the tracker
            }
            if spec.restricted_apis.contains(&resource.group) {
                continue;
            }
            if restricted_resources.contains(&(resource.group.as_str(), resource.name.as_str())) {
                continue;
            }
            if resource.namespaced && !spec.scope_namespaced {
                continue;
            }

            let mut verbs: Vec<String> = resource
                .verbs
                .iter()
                .filter(|v| !spec.restricted_verbs.contains(*v))
                .cloned()
                .collect();
            if verbs.is_empty() {
                continue;
            }
            verbs.sort();
            verbs.dedup();

            let key = (group_version.clone(), verbs);
            let entry = groups
                .entry(key)
                .or_insert_with(|| (resource.group.clone(), BTreeSet::new()));
            entry.1.insert(resource.name.clone());
        }
    }

    let mut rules: Vec<PolicyRule> = groups
        .into_iter()
        .map(|((_gv, verbs), (group, resources))| PolicyRule {
            api_groups: Some(vec![group]),
            resources: Some(resources.into_iter().collect()),
            verbs,
            ..Default::default()
        })
        .collect();

    if matches!(spec.target_role, TargetRoleKind::ClusterRole)
        && !spec.restricted_verbs.contains("get")
    {
        rules.push(PolicyRule {
            non_resource_urls: Some(vec![METRICS_NON_RESOURCE_URL.to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        });
    }

    sort_rules(&mut rules);
    rules
}

/// Sorts each rule's fields, then sorts the rule list so non-resource-URL
/// rules sort last and the rest order by apiGroups, resources, verbs.
fn sort_rules(rules: &mut [PolicyRule]) {
    for rule in rules.iter_mut() {
        if let Some(v) = &mut rule.api_groups {
            v.sort();
        }
        if let Some(v) = &mut rule.resources {
            v.sort();
        }
        if let Some(v) = &mut rule.resource_names {
            v.sort();
        }
        if let Some(v) = &mut rule.non_resource_urls {
            v.sort();
        }
        rule.verbs.sort();
    }
    rules.sort_by(|a, b| {
        let a_nonres = a.non_resource_urls.is_some();
        let b_nonres = b.non_resource_urls.is_some();
        a_nonres
            .cmp(&b_nonres)
            .then_with(|| a.api_groups.cmp(&b.api_groups))
            .then_with(|| a.resources.cmp(&b.resources))
            .then_with(|| a.verbs.cmp(&b.verbs))
    });
}

/// Whether `restricted_resources` contains the given pair; exposed for
/// reuse by the advisory role-ref validator in the Binding Engine, which
/// needs the same (group, resource) matching semantics.
pub fn restricts(restricted: &[RestrictedResource], group: &str, resource: &str) -> bool {
    restricted
        .iter()
        .any(|r| r.api_group == group && r.resource == resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ApiResource;
    use std::collections::BTreeSet as Set;

    fn snapshot_with_pods() -> Snapshot {
        let mut snap = Snapshot::new();
        snap.insert(
            "/v1".to_string(),
            vec![ApiResource {
                group: "".into(),
                version: "v1".into(),
                name: "pods".into(),
                namespaced: true,
                verbs: vec![
                    "get".into(),
                    "list".into(),
                    "watch".into(),
                    "create".into(),
                    "delete".into(),
                ],
            }],
        );
        snap
    }

    fn reader_spec() -> RoleDefinitionSpec {
        RoleDefinitionSpec {
            target_role: TargetRoleKind::ClusterRole,
            target_name: "reader".into(),
            target_namespace: None,
            scope_namespaced: true,
            restricted_apis: Set::new(),
            restricted_resources: vec![],
            restricted_verbs: ["create", "update", "patch", "delete", "deletecollection"]
                .into_iter()
                .map(String::from)
                .collect(),
            breakglass_allowed: None,
        }
    }

    #[test]
    fn reader_role_against_core_v1_pods() {
        let rules = build_rules(&snapshot_with_pods(), &reader_spec());
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].api_groups, Some(vec!["".to_string()]));
        assert_eq!(rules[0].resources, Some(vec!["pods".to_string()]));
        assert_eq!(
            rules[0].verbs,
            vec!["get".to_string(), "list".to_string(), "watch".to_string()]
        );
        assert_eq!(
            rules[1].non_resource_urls,
            Some(vec!["/metrics".to_string()])
        );
        assert_eq!(rules[1].verbs, vec!["get".to_string()]);
    }

    /// Two independent runs over the same inputs are byte-identical once
    /// serialized.
    #[test]
    fn build_rules_is_deterministic() {
        let snapshot = snapshot_with_pods();
        let spec = reader_spec();
        let first = build_rules(&snapshot, &spec);
        let second = build_rules(&snapshot, &spec);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn no_metrics_rule_when_get_is_restricted() {
        let mut spec = reader_spec();
        spec.restricted_verbs.insert("get".to_string());
        let rules = build_rules(&snapshot_with_pods(), &spec);
        assert!(rules.iter().all(|r| r.non_resource_urls.is_none()));
    }

    #[test]
    fn namespaced_role_never_gets_a_non_resource_rule() {
        let mut spec = reader_spec();
        spec.target_role = TargetRoleKind::Role;
        let rules = build_rules(&snapshot_with_pods(), &spec);
        assert!(rules.iter().all(|r| r.non_resource_urls.is_none()));
    }

    #[test]
    fn scope_namespaced_false_drops_namespaced_resources() {
        let mut spec = reader_spec();
        spec.scope_namespaced = false;
        let rules = build_rules(&snapshot_with_pods(), &spec);
        // Only the non-resource-URL rule should survive; pods is namespaced.
        assert_eq!(rules.len(), 1);
        assert!(rules[0].non_resource_urls.is_some());
    }

    #[test]
    fn restricted_resources_excludes_matching_pair() {
        let mut spec = reader_spec();
        spec.restricted_resources = vec![RestrictedResource {
            api_group: "".into(),
            resource: "pods".into(),
        }];
        let rules = build_rules(&snapshot_with_pods(), &spec);
        assert!(rules.iter().all(|r| r.resources.is_none()));
    }
}
