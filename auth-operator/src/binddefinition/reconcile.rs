//! Binding Engine: reconciles a `BindDefinition` into ClusterRoleBindings,
//! per-namespace RoleBindings, and managed ServiceAccounts.

use super::{namespaces, roleref, serviceaccount};
use crate::context::Context;
use crate::terminator;
use auth_operator_common::errors::{Error, Result};
use auth_operator_common::{annotations, conditions, finalizers, labels};
use auth_operator_types::{
    BindDefinition, BindDefinitionStatus, MissingRolePolicy, SubjectKind,
};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding, RoleRef, Subject};
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Resource, ResourceExt};
use owo_colors::OwoColorize;
use futures::stream::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(
    client: kube::Client,
    tracker: crate::discovery::Tracker,
    concurrency: u16,
    probe_interval: Duration,
    short_requeue: Duration,
) {
    let ctx = Arc::new(Context::new(client.clone(), tracker, probe_interval, short_requeue));
    let api: Api<BindDefinition> = Api::all(client);
    println!("{}", "starting BindDefinition controller".green());
    kube::runtime::Controller::new(api, Default::default())
        .concurrency(concurrency)
        .run(reconcile, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn reconcile(bd: Arc<BindDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let api: Api<BindDefinition> = Api::all(ctx.client.clone());
    if bd.meta().deletion_timestamp.is_none()
        && !bd.finalizers().iter().any(|f| f == finalizers::BIND_DEFINITION)
    {
        recorder(&ctx, &bd)
            .publish(Event {
                type_: EventType::Normal,
                reason: "FinalizerAdded".into(),
                note: Some(format!("attached finalizer {}", finalizers::BIND_DEFINITION)),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await?;
    }

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let result = finalizer(&api, finalizers::BIND_DEFINITION, bd, |event| async {
        match event {
            FinalizerEvent::Apply(bd) => apply(bd, ctx.clone()).await,
            FinalizerEvent::Cleanup(bd) => cleanup(bd, ctx.clone()).await,
        }
    })
    .await
    .map_err(Error::from);

    #[cfg(feature = "metrics")]
    ctx.metrics
        .reconcile_duration_seconds
        .with_label_values(&["BindDefinition"])
        .observe(started.elapsed().as_secs_f64());

    result
}

fn recorder(ctx: &Context, bd: &BindDefinition) -> Recorder {
    Recorder::new(ctx.client.clone(), ctx.reporter.clone(), bd.object_ref(&()))
}

fn recorder_for(ctx: &Context, reference: k8s_openapi::api::core::v1::ObjectReference) -> Recorder {
    Recorder::new(ctx.client.clone(), ctx.reporter.clone(), reference)
}

fn missing_role_policy(bd: &BindDefinition) -> MissingRolePolicy {
    bd.annotations()
        .get(auth_operator_types::MISSING_ROLE_POLICY_ANNOTATION)
        .and_then(|v| MissingRolePolicy::from_str(v).ok())
        .unwrap_or_default()
}

fn rbac_subjects(bd: &BindDefinition) -> Vec<Subject> {
    bd.spec
        .subjects
        .iter()
        .map(|s| Subject {
            kind: match s.kind {
                SubjectKind::User => "User".to_string(),
                SubjectKind::Group => "Group".to_string(),
                SubjectKind::ServiceAccount => "ServiceAccount".to_string(),
            },
            name: s.name.clone(),
            namespace: s.namespace.clone(),
            api_group: match s.kind {
                SubjectKind::ServiceAccount => None,
                _ => Some("rbac.authorization.k8s.io".to_string()),
            },
        })
        .collect()
}

fn generated_labels(bd: &BindDefinition) -> BTreeMap<String, String> {
    let mut generated = bd.labels().clone();
    generated.insert(labels::MANAGED_BY.into(), labels::OPERATOR_NAME.into());
    generated.insert(labels::CREATED_BY.into(), labels::OPERATOR_NAME.into());
    generated
}

fn generated_annotations(bd: &BindDefinition) -> BTreeMap<String, String> {
    let mut generated = BTreeMap::new();
    generated.insert(annotations::SOURCE_KIND.into(), "BindDefinition".into());
    generated.insert(annotations::SOURCE_NAME.into(), bd.name_any());
    generated
}

async fn list_all_namespaces(client: &kube::Client) -> Result<Vec<Namespace>> {
    let api: Api<Namespace> = Api::all(client.clone());
    Ok(api.list(&Default::default()).await?.items)
}

async fn list_cluster_role_names(client: &kube::Client) -> Result<BTreeSet<String>> {
    let api: Api<ClusterRole> = Api::all(client.clone());
    Ok(api
        .list(&Default::default())
        .await?
        .items
        .into_iter()
        .map(|r| r.name_any())
        .collect())
}

async fn list_role_names(client: &kube::Client, ns: &str) -> Result<BTreeSet<String>> {
    let api: Api<Role> = Api::namespaced(client.clone(), ns);
    Ok(api
        .list(&Default::default())
        .await?
        .items
        .into_iter()
        .map(|r| r.name_any())
        .collect())
}

async fn apply(bd: Arc<BindDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let generation = bd.meta().generation.unwrap_or_default();
    let mut status = bd.status.clone().unwrap_or_default();
    conditions::mark_reconciling(&mut status.conditions, generation, "Reconciling", "");

    let all_namespaces = list_all_namespaces(&ctx.client).await?;

    // Resolve each roleBindings[] entry's namespace set.
    let mut resolved_per_entry = Vec::with_capacity(bd.spec.role_bindings.len());
    for entry in &bd.spec.role_bindings {
        let resolved = namespaces::resolve(
            entry.namespace.as_deref(),
            entry.namespace_selector.as_deref().unwrap_or_default(),
            &all_namespaces,
        );
        for ns in &resolved.terminating {
            if let Some(namespace) = all_namespaces.iter().find(|n| &n.name_any() == ns) {
                recorder_for(&ctx, namespace.object_ref(&()))
                    .publish(Event {
                        type_: EventType::Warning,
                        reason: "DeletionPending".into(),
                        note: Some(format!(
                            "namespace is terminating; BindDefinition {} skips it",
                            bd.name_any()
                        )),
                        action: "Reconciling".into(),
                        secondary: None,
                    })
                    .await?;
            }
        }
        resolved_per_entry.push(resolved);
    }

    // Validate role references (advisory).
    let existing_cluster_roles = list_cluster_role_names(&ctx.client).await?;
    let mut existing_roles: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for resolved in &resolved_per_entry {
        for ns in &resolved.active {
            if !existing_roles.contains_key(ns) {
                existing_roles.insert(ns.clone(), list_role_names(&ctx.client, ns).await?);
            }
        }
    }
    let active_sets: Vec<BTreeSet<String>> = resolved_per_entry.iter().map(|r| r.active.clone()).collect();
    let missing = roleref::missing_role_refs(
        &bd.spec,
        &existing_cluster_roles,
        &existing_roles,
        &active_sets,
    );
    let policy = missing_role_policy(&bd);
    let mut requeue_short = false;
    match roleref::evaluate(policy, missing) {
        roleref::RoleRefOutcome::AllPresent => {
            status.missing_role_refs.clear();
            conditions::set(
                &mut status.conditions,
                generation,
                conditions::types::ROLE_REF_VALID,
                conditions::Status::True,
                "AllPresent",
                "",
            );
        }
        roleref::RoleRefOutcome::Warn(missing) => {
            status.missing_role_refs = missing.clone();
            conditions::set(
                &mut status.conditions,
                generation,
                conditions::types::ROLE_REF_VALID,
                conditions::Status::False,
                "MissingRoleRefs",
                missing.join(", "),
            );
            recorder(&ctx, &bd)
                .publish(Event {
                    type_: EventType::Warning,
                    reason: "MissingRoleRefs".into(),
                    note: Some(format!("missing: {}", missing.join(", "))),
                    action: "Reconciling".into(),
                    secondary: None,
                })
                .await?;
            requeue_short = true;
        }
        roleref::RoleRefOutcome::Error(missing) => {
            status.missing_role_refs = missing.clone();
            conditions::set(
                &mut status.conditions,
                generation,
                conditions::types::ROLE_REF_VALID,
                conditions::Status::False,
                "MissingRoleRefs",
                missing.join(", "),
            );
            conditions::mark_stalled(
                &mut status.conditions,
                generation,
                "MissingRoleRefs",
                format!("policy=error missing: {}", missing.join(", ")),
            );
            requeue_short = true;
        }
    }

    // Ensure ServiceAccounts, ClusterRoleBindings, and RoleBindings.
    let automount = bd.spec.automount_service_account_token.unwrap_or(true);
    let subjects = rbac_subjects(&bd);
    let mut external_sas = BTreeSet::new();

    for subject in &bd.spec.subjects {
        if subject.kind != SubjectKind::ServiceAccount {
            continue;
        }
        let Some(ns) = &subject.namespace else {
            continue;
        };
        let Some(namespace) = all_namespaces.iter().find(|n| &n.name_any() == ns) else {
            continue;
        };
        if namespaces::resolve(Some(ns.as_str()), &[], std::slice::from_ref(namespace))
            .terminating
            .contains(ns.as_str())
        {
            continue;
        }
        match serviceaccount::ensure(&ctx.client, &bd, subject, ns, automount).await? {
            serviceaccount::EnsureOutcome::External => {
                external_sas.insert(format!("{ns}/{}", subject.name));
            }
            serviceaccount::EnsureOutcome::Managed => {
                #[cfg(feature = "metrics")]
                ctx.metrics
                    .managed_objects
                    .with_label_values(&["ServiceAccount", "apply"])
                    .inc();
            }
        }
    }
    status.external_service_accounts = external_sas.into_iter().collect();

    for role_ref in &bd.spec.cluster_role_bindings.cluster_role_refs {
        ensure_cluster_role_binding(&ctx, &bd, role_ref, &subjects).await?;
    }

    for (entry, resolved) in bd.spec.role_bindings.iter().zip(resolved_per_entry.iter()) {
        for ns in &resolved.active {
            for role_ref in &entry.cluster_role_refs {
                ensure_role_binding(&ctx, &bd, ns, "ClusterRole", role_ref, &subjects).await?;
            }
            for role_ref in &entry.role_refs {
                ensure_role_binding(&ctx, &bd, ns, "Role", role_ref, &subjects).await?;
            }
        }
    }

    conditions::set(
        &mut status.conditions,
        generation,
        "Create",
        conditions::Status::True,
        "Present",
        "",
    );
    if !matches!(
        conditions::get(&status.conditions, conditions::types::STALLED),
        Some(c) if c.status == "True"
    ) {
        conditions::mark_ready(&mut status.conditions, generation, "Reconciled");
    }

    #[cfg(feature = "metrics")]
    {
        let name = bd.name_any();
        ctx.metrics
            .bind_definition_missing_role_refs
            .with_label_values(&[&name])
            .set(status.missing_role_refs.len() as f64);
        ctx.metrics
            .bind_definition_active_namespaces
            .with_label_values(&[&name])
            .set(resolved_per_entry.iter().map(|r| r.active.len()).sum::<usize>() as f64);
        ctx.metrics
            .bind_definition_external_service_accounts
            .with_label_values(&[&name])
            .set(status.external_service_accounts.len() as f64);
    }

    persist_status(&ctx, &bd, status).await?;

    #[cfg(feature = "metrics")]
    ctx.metrics
        .reconcile_total
        .with_label_values(&["BindDefinition"])
        .inc();

    Ok(Action::requeue(if requeue_short {
        ctx.short_requeue
    } else {
        ctx.probe_interval
    }))
}

async fn ensure_cluster_role_binding(
    ctx: &Context,
    bd: &BindDefinition,
    role_ref: &str,
    subjects: &[Subject],
) -> Result<()> {
    let name = auth_operator_types::binding_name(&bd.spec.target_name, role_ref);
    let api: Api<ClusterRoleBinding> = Api::all(ctx.client.clone());
    let desired = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(generated_labels(bd)),
            annotations: Some(generated_annotations(bd)),
            owner_references: Some(vec![bd.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role_ref.to_string(),
        },
        subjects: Some(subjects.to_vec()),
    };
    auth_operator_common::apply::apply(&api, &name, &desired, auth_operator_common::MANAGER_NAME, true)
        .await?;
    #[cfg(feature = "metrics")]
    ctx.metrics
        .managed_objects
        .with_label_values(&["ClusterRoleBinding", "apply"])
        .inc();
    Ok(())
}

async fn ensure_role_binding(
    ctx: &Context,
    bd: &BindDefinition,
    namespace: &str,
    role_kind: &str,
    role_ref: &str,
    subjects: &[Subject],
) -> Result<()> {
    let name = auth_operator_types::binding_name(&bd.spec.target_name, role_ref);
    let api: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), namespace);
    let desired = RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(generated_labels(bd)),
            annotations: Some(generated_annotations(bd)),
            owner_references: Some(vec![bd.controller_owner_ref(&()).unwrap()]),
            finalizers: Some(vec![finalizers::ROLE_BINDING.to_string()]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: role_kind.to_string(),
            name: role_ref.to_string(),
        },
        subjects: Some(subjects.to_vec()),
    };
    auth_operator_common::apply::apply(&api, &name, &desired, auth_operator_common::MANAGER_NAME, true)
        .await?;
    #[cfg(feature = "metrics")]
    ctx.metrics
        .managed_objects
        .with_label_values(&["RoleBinding", "apply"])
        .inc();
    Ok(())
}

async fn cleanup(bd: Arc<BindDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let mut status = bd.status.clone().unwrap_or_default();
    let generation = bd.meta().generation.unwrap_or_default();
    conditions::set(
        &mut status.conditions,
        generation,
        "Delete",
        conditions::Status::True,
        "Deleting",
        "",
    );
    persist_status(&ctx, &bd, status).await?;

    // Release every ServiceAccount subject.
    for subject in &bd.spec.subjects {
        if subject.kind != SubjectKind::ServiceAccount {
            continue;
        }
        let Some(ns) = &subject.namespace else { continue };
        let already_external = bd
            .status
            .as_ref()
            .map(|s| s.external_service_accounts.contains(&format!("{ns}/{}", subject.name)))
            .unwrap_or(false);
        if already_external {
            serviceaccount::release_referenced_by(&ctx.client, &bd, ns, &subject.name).await?;
        } else {
            let released = serviceaccount::release(&ctx.client, &bd, subject, ns).await;
            if released.is_ok() {
                recorder(&ctx, &bd)
                    .publish(Event {
                        type_: EventType::Normal,
                        reason: "Retained".into(),
                        note: Some(format!("ServiceAccount {ns}/{} retained by other owners or removed", subject.name)),
                        action: "Deleting".into(),
                        secondary: None,
                    })
                    .await?;
            }
            released?;
        }
    }

    // Delete owned ClusterRoleBindings.
    for role_ref in &bd.spec.cluster_role_bindings.cluster_role_refs {
        let name = auth_operator_types::binding_name(&bd.spec.target_name, role_ref);
        let api: Api<ClusterRoleBinding> = Api::all(ctx.client.clone());
        delete_if_owned(&ctx, &api, "ClusterRoleBinding", &name, &bd).await?;
    }

    // Delete owned RoleBindings, recomputing the namespace set including terminating.
    let all_namespaces = list_all_namespaces(&ctx.client).await?;
    for entry in &bd.spec.role_bindings {
        let resolved = namespaces::resolve(
            entry.namespace.as_deref(),
            entry.namespace_selector.as_deref().unwrap_or_default(),
            &all_namespaces,
        );
        let mut all_ns: BTreeSet<String> = resolved.active.clone();
        all_ns.extend(resolved.terminating.iter().cloned());

        for ns in &all_ns {
            for role_ref in entry.cluster_role_refs.iter().chain(entry.role_refs.iter()) {
                let name = auth_operator_types::binding_name(&bd.spec.target_name, role_ref);
                let api: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), ns);
                delete_if_owned(&ctx, &api, "RoleBinding", &name, &bd).await?;
            }
            if resolved.terminating.contains(ns) {
                terminator::assist(&ctx.client, &ctx.reporter, ns).await?;
            }
        }
    }

    #[cfg(feature = "metrics")]
    {
        let name = bd.name_any();
        ctx.metrics
            .bind_definition_missing_role_refs
            .remove_label_values(&[&name])
            .ok();
        ctx.metrics
            .bind_definition_active_namespaces
            .remove_label_values(&[&name])
            .ok();
        ctx.metrics
            .bind_definition_external_service_accounts
            .remove_label_values(&[&name])
            .ok();
    }

    Ok(Action::await_change())
}

/// Deletes `name` if this `BindDefinition` controls it, first stripping our
/// RoleBinding finalizer (a no-op for kinds that never carry it, like
/// ClusterRoleBinding) so the delete isn't left hanging on it.
async fn delete_if_owned<K>(
    ctx: &Context,
    api: &Api<K>,
    kind: &str,
    name: &str,
    bd: &BindDefinition,
) -> Result<()>
where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    let Some(obj) = auth_operator_common::apply::get_optional(api, name).await? else {
        return Ok(());
    };
    let controlled_by_us = obj
        .owner_references()
        .iter()
        .any(|o| o.controller == Some(true) && o.name == bd.name_any() && o.kind == "BindDefinition");
    if !controlled_by_us {
        return Ok(());
    }

    if obj.finalizers().iter().any(|f| f == finalizers::ROLE_BINDING) {
        let remaining: Vec<&String> = obj
            .finalizers()
            .iter()
            .filter(|f| *f != finalizers::ROLE_BINDING)
            .collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }

    auth_operator_common::apply::delete_if_exists(api, name).await?;
    #[cfg(feature = "metrics")]
    ctx.metrics
        .managed_objects
        .with_label_values(&[kind, "delete"])
        .inc();
    Ok(())
}

async fn persist_status(ctx: &Context, bd: &BindDefinition, mut status: BindDefinitionStatus) -> Result<()> {
    status.observed_generation = bd.meta().generation.unwrap_or_default();
    let api: Api<BindDefinition> = Api::all(ctx.client.clone());
    let patch = BindDefinition {
        metadata: ObjectMeta {
            name: bd.meta().name.clone(),
            ..Default::default()
        },
        spec: Default::default(),
        status: Some(status),
    };
    auth_operator_common::apply::apply_status(
        &api,
        &bd.name_any(),
        &patch,
        auth_operator_common::MANAGER_NAME,
    )
    .await?;
    Ok(())
}

fn error_policy(bd: Arc<BindDefinition>, error: &Error, ctx: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!("BindDefinition {} reconcile error: {error}", bd.name_any()).red()
    );
    #[cfg(feature = "metrics")]
    ctx.metrics
        .reconcile_errors_total
        .with_label_values(&["BindDefinition", &error.metric_label()])
        .inc();
    Action::requeue(std::time::Duration::from_secs(5))
}
