//! ServiceAccount creation/adoption and the deletion-path cleanup that
//! releases a claim on one, including the shared-ownership rules that let
//! more than one `BindDefinition` reference the same ServiceAccount.

use auth_operator_common::errors::{Error, Result};
use auth_operator_common::{annotations, labels, per_owner_manager};
use auth_operator_types::{BindDefinition, Subject};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde_json::json;

fn csv_merge(existing: Option<&str>, name: &str) -> String {
    let mut names: Vec<String> = existing
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
    names.join(",")
}

fn csv_remove(existing: Option<&str>, name: &str) -> String {
    existing
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != name)
        .collect::<Vec<_>>()
        .join(",")
}

fn non_controller_owner_ref(bd: &BindDefinition) -> OwnerReference {
    let mut owner_ref = bd.controller_owner_ref(&()).unwrap();
    owner_ref.controller = Some(false);
    owner_ref.block_owner_deletion = Some(false);
    owner_ref
}

fn annotation_merge_patch(key: &str, value: &str) -> serde_json::Value {
    let mut annotations = serde_json::Map::new();
    annotations.insert(key.to_string(), json!(value));
    json!({ "metadata": { "annotations": annotations } })
}

fn has_any_bd_owner(sa: &ServiceAccount) -> bool {
    sa.owner_references()
        .iter()
        .any(|o| o.kind == "BindDefinition")
}

/// Creates, adopts, or annotates the ServiceAccount subject `subject` in
/// `namespace` for `bd`.
pub async fn ensure(
    client: &kube::Client,
    bd: &BindDefinition,
    subject: &Subject,
    namespace: &str,
    automount: bool,
) -> Result<EnsureOutcome> {
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let existing = auth_operator_common::apply::get_optional(&api, &subject.name).await?;

    match existing {
        None => {
            let mut sa_labels = bd.labels().clone();
            sa_labels.insert(labels::MANAGED_BY.into(), labels::OPERATOR_NAME.into());
            sa_labels.insert(labels::CREATED_BY.into(), labels::OPERATOR_NAME.into());

            let mut sa_annotations = std::collections::BTreeMap::new();
            sa_annotations.insert(annotations::SOURCE_KIND.into(), "BindDefinition".into());
            sa_annotations.insert(annotations::SOURCE_NAMES.into(), bd.name_any());

            let desired = ServiceAccount {
                metadata: ObjectMeta {
                    name: Some(subject.name.clone()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(sa_labels),
                    annotations: Some(sa_annotations),
                    owner_references: Some(vec![non_controller_owner_ref(bd)]),
                    ..Default::default()
                },
                automount_service_account_token: Some(automount),
                ..Default::default()
            };
            let manager = per_owner_manager(&bd.name_any());
            auth_operator_common::apply::apply(&api, &subject.name, &desired, &manager, false)
                .await?;
            Ok(EnsureOutcome::Managed)
        }
        Some(sa) if !has_any_bd_owner(&sa) => {
            // External SA: never mutate spec fields, only track it.
            let current = sa
                .annotations()
                .get(annotations::REFERENCED_BY)
                .map(String::as_str);
            let merged = csv_merge(current, &bd.name_any());
            let patch = annotation_merge_patch(annotations::REFERENCED_BY, &merged);
            api.patch(
                &subject.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
            Ok(EnsureOutcome::External)
        }
        Some(sa) => {
            let mut sa_labels = bd.labels().clone();
            sa_labels.insert(labels::MANAGED_BY.into(), labels::OPERATOR_NAME.into());
            sa_labels.insert(labels::CREATED_BY.into(), labels::OPERATOR_NAME.into());

            let current_source_names = sa
                .annotations()
                .get(annotations::SOURCE_NAMES)
                .map(String::as_str);
            let mut sa_annotations = std::collections::BTreeMap::new();
            sa_annotations.insert(annotations::SOURCE_KIND.into(), "BindDefinition".into());
            sa_annotations.insert(
                annotations::SOURCE_NAMES.into(),
                csv_merge(current_source_names, &bd.name_any()),
            );

            let mut owner_refs = sa.owner_references().to_vec();
            if !owner_refs
                .iter()
                .any(|o| o.kind == "BindDefinition" && o.name == bd.name_any())
            {
                owner_refs.push(non_controller_owner_ref(bd));
            }

            let desired = ServiceAccount {
                metadata: ObjectMeta {
                    name: Some(subject.name.clone()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(sa_labels),
                    annotations: Some(sa_annotations),
                    owner_references: Some(owner_refs),
                    ..Default::default()
                },
                automount_service_account_token: Some(automount),
                ..Default::default()
            };
            let manager = per_owner_manager(&bd.name_any());
            auth_operator_common::apply::apply(&api, &subject.name, &desired, &manager, false)
                .await?;
            Ok(EnsureOutcome::Managed)
        }
    }
}

pub enum EnsureOutcome {
    Managed,
    External,
}

/// Releases `bd`'s claim on a managed ServiceAccount subject. If other
/// owners remain, only `source-names` and this BD's ownerReference are
/// trimmed (the SA survives). If `bd` was the last owner, the SA is
/// deleted.
pub async fn release(
    client: &kube::Client,
    bd: &BindDefinition,
    subject: &Subject,
    namespace: &str,
) -> Result<()> {
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let Some(sa) = auth_operator_common::apply::get_optional(&api, &subject.name).await? else {
        return Ok(());
    };

    let remaining_owners: Vec<_> = sa
        .owner_references()
        .iter()
        .filter(|o| !(o.kind == "BindDefinition" && o.name == bd.name_any()))
        .cloned()
        .collect();

    if remaining_owners
        .iter()
        .any(|o| o.kind == "BindDefinition")
    {
        let current_source_names = sa
            .annotations()
            .get(annotations::SOURCE_NAMES)
            .map(String::as_str);
        let trimmed = csv_remove(current_source_names, &bd.name_any());
        let patch = json!({
            "metadata": {
                "ownerReferences": remaining_owners,
                "annotations": { "authorization.t-caas/source-names": trimmed },
            }
        });
        api.patch(
            &subject.name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        return Ok(());
    }

    if has_any_bd_owner(&sa) {
        auth_operator_common::apply::delete_if_exists(&api, &subject.name).await?;
    }
    Ok(())
}

/// Best-effort removal of `bd`'s name from an external SA's
/// `referenced-by` annotation. A race with external deletion is treated
/// as success.
pub async fn release_referenced_by(
    client: &kube::Client,
    bd: &BindDefinition,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let Some(sa) = auth_operator_common::apply::get_optional(&api, name).await? else {
        return Ok(());
    };
    let current = sa
        .annotations()
        .get(annotations::REFERENCED_BY)
        .map(String::as_str);
    let trimmed = csv_remove(current, &bd.name_any());
    let patch = annotation_merge_patch(annotations::REFERENCED_BY, &trimmed);
    match api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) => {
            let err = Error::from(e);
            if err.is_not_found() { Ok(()) } else { Err(err) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_merge_preserves_first_seen_order() {
        let merged = csv_merge(Some("bd1"), "bd2");
        assert_eq!(merged, "bd1,bd2");
    }

    #[test]
    fn csv_merge_is_idempotent() {
        let merged = csv_merge(Some("bd1,bd2"), "bd2");
        assert_eq!(merged, "bd1,bd2");
    }

    #[test]
    fn csv_remove_drops_only_the_named_entry() {
        let trimmed = csv_remove(Some("bd1,bd2"), "bd1");
        assert_eq!(trimmed, "bd2");
    }
}
