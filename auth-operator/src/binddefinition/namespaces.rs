//! Namespace resolution for the Binding Engine, kept pure over an
//! already-fetched namespace list so it can be unit tested without a live
//! cluster.

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedNamespaces {
    pub active: BTreeSet<String>,
    pub terminating: BTreeSet<String>,
}

fn is_terminating(ns: &Namespace) -> bool {
    ns.metadata.deletion_timestamp.is_some()
        || ns
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|p| p == "Terminating")
}

fn selector_matches_anything(selector: &LabelSelector) -> bool {
    !selector.match_labels.clone().unwrap_or_default().is_empty()
        || !selector
            .match_expressions
            .clone()
            .unwrap_or_default()
            .is_empty()
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = req.values.clone().unwrap_or_default();
    match req.operator.as_str() {
        "In" => labels.get(&req.key).is_some_and(|v| values.contains(v)),
        "NotIn" => !labels.get(&req.key).is_some_and(|v| values.contains(v)),
        "Exists" => labels.contains_key(&req.key),
        "DoesNotExist" => !labels.contains_key(&req.key),
        _ => false,
    }
}

fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let match_labels = selector.match_labels.clone().unwrap_or_default();
    let labels_ok = match_labels.iter().all(|(k, v)| labels.get(k) == Some(v));
    let expressions_ok = selector
        .match_expressions
        .clone()
        .unwrap_or_default()
        .iter()
        .all(|req| requirement_matches(req, labels));
    labels_ok && expressions_ok
}

/// Resolves the explicit `namespace` plus every non-empty
/// `namespaceSelector` entry against `all_namespaces`, partitioning the
/// result into Active / Terminating.
pub fn resolve(
    explicit_namespace: Option<&str>,
    selectors: &[LabelSelector],
    all_namespaces: &[Namespace],
) -> ResolvedNamespaces {
    let mut matched: BTreeSet<String> = BTreeSet::new();

    if let Some(ns) = explicit_namespace {
        if all_namespaces.iter().any(|n| n.name_any() == ns) {
            matched.insert(ns.to_string());
        }
    }

    for selector in selectors {
        if !selector_matches_anything(selector) {
            continue; // an empty selector does NOT match-all
        }
        for namespace in all_namespaces {
            if selector_matches(selector, namespace.labels()) {
                matched.insert(namespace.name_any());
            }
        }
    }

    let mut resolved = ResolvedNamespaces::default();
    for name in matched {
        let is_term = all_namespaces
            .iter()
            .find(|n| n.name_any() == name)
            .is_some_and(is_terminating);
        if is_term {
            resolved.terminating.insert(name);
        } else {
            resolved.active.insert(name);
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NamespaceStatus;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;

    fn ns(name: &str, labels: &[(&str, &str)], terminating: bool) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            status: Some(NamespaceStatus {
                phase: Some(if terminating {
                    "Terminating".to_string()
                } else {
                    "Active".to_string()
                }),
                ..Default::default()
            }),
            spec: None,
        }
    }

    #[test]
    fn selector_matches_only_env_test() {
        let namespaces = vec![
            ns("alpha", &[("env", "test")], false),
            ns("beta", &[("env", "prod")], false),
        ];
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("env".to_string(), "test".to_string())])),
            match_expressions: None,
        };
        let resolved = resolve(None, std::slice::from_ref(&selector), &namespaces);
        assert_eq!(
            resolved.active,
            BTreeSet::from(["alpha".to_string()])
        );
    }

    #[test]
    fn empty_selector_matches_nothing() {
        let namespaces = vec![ns("alpha", &[("env", "test")], false)];
        let selector = LabelSelector::default();
        let resolved = resolve(None, std::slice::from_ref(&selector), &namespaces);
        assert!(resolved.active.is_empty());
    }

    /// A terminating namespace is partitioned out of the active set even
    /// if it matches a selector.
    #[test]
    fn terminating_namespace_is_partitioned_separately() {
        let namespaces = vec![ns("alpha", &[("env", "test")], true)];
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("env".to_string(), "test".to_string())])),
            match_expressions: None,
        };
        let resolved = resolve(None, std::slice::from_ref(&selector), &namespaces);
        assert!(resolved.active.is_empty());
        assert_eq!(resolved.terminating, BTreeSet::from(["alpha".to_string()]));
    }

    #[test]
    fn explicit_namespace_not_found_is_skipped_silently() {
        let resolved = resolve(Some("missing"), &[], &[]);
        assert!(resolved.active.is_empty() && resolved.terminating.is_empty());
    }
}
