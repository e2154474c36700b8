//! Namespace-Terminator Assistant: when a namespace a `BindDefinition`
//! touches is Terminating, reports what is still blocking its deletion and,
//! once nothing is, releases the managed RoleBinding finalizers so the
//! namespace can finish going away.
//!
//! Listing arbitrary kinds by `ApiResource` via `kube::api::DynamicObject`
//! reuses the same discovery pass `discovery.rs` already runs.

use auth_operator_common::errors::Result;
use auth_operator_common::finalizers;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::{Discovery, Scope};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, ResourceExt};

const MAX_NAMES_PER_TYPE: usize = 10;

struct Blocking {
    kind: String,
    group: String,
    names: Vec<String>,
    total: usize,
}

fn is_role_bindings(group: &str, plural: &str) -> bool {
    group == "rbac.authorization.k8s.io" && plural == "rolebindings"
}

async fn find_blocking_resources(client: &Client, namespace: &str) -> Result<Vec<Blocking>> {
    let discovery = Discovery::new(client.clone()).run().await?;
    let mut blocking = Vec::new();

    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if caps.scope != Scope::Namespaced {
                continue;
            }
            if is_role_bindings(&ar.group, &ar.plural) {
                continue;
            }
            if !caps.verbs.iter().any(|v| v == "list") {
                continue;
            }

            let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);
            let list = match api
                .list(&ListParams::default().limit(MAX_NAMES_PER_TYPE as u32 + 1))
                .await
            {
                Ok(list) => list,
                Err(_) => continue,
            };
            if list.items.is_empty() {
                continue;
            }

            let names: Vec<String> = list
                .items
                .iter()
                .take(MAX_NAMES_PER_TYPE)
                .map(|o| o.name_any())
                .collect();
            blocking.push(Blocking {
                kind: ar.kind.clone(),
                group: ar.group.clone(),
                total: list.items.len(),
                names,
            });
        }
    }
    Ok(blocking)
}

fn format_blocking(blocking: &[Blocking]) -> String {
    blocking
        .iter()
        .map(|b| {
            let mut rendered = format!("{} ({}) ({}): {}", b.kind, b.group, b.total, b.names.join(", "));
            if b.total > b.names.len() {
                rendered.push_str(&format!(", +{} more", b.total - b.names.len()));
            }
            rendered
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Invoked once per Terminating namespace a `BindDefinition` resolves into.
/// Emits `DeletionPending` while something still blocks deletion, otherwise
/// drops this operator's RoleBinding finalizers in the namespace and emits
/// `AuthOperatorCleanup`.
pub async fn assist(client: &Client, reporter: &Reporter, namespace: &str) -> Result<()> {
    let blocking = find_blocking_resources(client, namespace).await?;

    let reference = ObjectReference {
        kind: Some("Namespace".to_string()),
        name: Some(namespace.to_string()),
        ..Default::default()
    };
    let recorder = Recorder::new(client.clone(), reporter.clone(), reference);

    if !blocking.is_empty() {
        recorder
            .publish(Event {
                type_: EventType::Warning,
                reason: "DeletionPending".into(),
                note: Some(format!(
                    "Namespace deletion is waiting for: {}",
                    format_blocking(&blocking)
                )),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await?;
        return Ok(());
    }

    let api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    let bindings = api.list(&Default::default()).await?;
    for rb in bindings.items {
        if !rb.finalizers().iter().any(|f| f == finalizers::ROLE_BINDING) {
            continue;
        }
        let remaining: Vec<String> = rb
            .finalizers()
            .iter()
            .filter(|f| *f != finalizers::ROLE_BINDING)
            .cloned()
            .collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
        api.patch(&rb.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }

    recorder
        .publish(Event {
            type_: EventType::Normal,
            reason: "AuthOperatorCleanup".into(),
            note: Some("cleared managed RoleBinding finalizers, namespace deletion can proceed".into()),
            action: "Cleanup".into(),
            secondary: None,
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_blocking_truncates_and_counts_overflow() {
        let blocking = vec![Blocking {
            kind: "Pod".into(),
            group: "".into(),
            total: 12,
            names: (0..10).map(|i| format!("pod-{i}")).collect(),
        }];
        let rendered = format_blocking(&blocking);
        assert!(rendered.contains("Pod () (12):"));
        assert!(rendered.ends_with("+2 more"));
    }

    #[test]
    fn format_blocking_joins_multiple_types_with_semicolons() {
        let blocking = vec![
            Blocking {
                kind: "Pod".into(),
                group: "".into(),
                total: 1,
                names: vec!["a".into()],
            },
            Blocking {
                kind: "Job".into(),
                group: "batch".into(),
                total: 1,
                names: vec!["b".into()],
            },
        ];
        assert_eq!(format_blocking(&blocking), "Pod () (1): a; Job (batch) (1): b");
    }
}
