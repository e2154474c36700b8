//! Role Synthesizer: reconciles a `RoleDefinition` into a ClusterRole or
//! namespaced Role whose rules are computed from the live API surface.

use super::rules::build_rules;
use crate::context::Context;
use auth_operator_common::errors::{Error, Result};
use auth_operator_common::{annotations, conditions, finalizers, labels, per_owner_manager};
use auth_operator_types::{RoleDefinition, RoleDefinitionStatus, TargetRoleKind};
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule, Role};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ObjectMeta};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Resource, ResourceExt};
use owo_colors::OwoColorize;
use futures::stream::StreamExt;
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
    let api: Api<RoleDefinition> = Api::all(client);
    println!("{}", "starting RoleDefinition controller".green());
    kube::runtime::Controller::new(api, Default::default())
        .concurrency(concurrency)
        .run(reconcile, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn reconcile(rd: Arc<RoleDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let api: Api<RoleDefinition> = Api::all(ctx.client.clone());
    if rd.meta().deletion_timestamp.is_none()
        && !rd.finalizers().iter().any(|f| f == finalizers::ROLE_DEFINITION)
    {
        recorder(&ctx, &rd)
            .publish(Event {
                type_: EventType::Normal,
                reason: "FinalizerAdded".into(),
                note: Some(format!("attached finalizer {}", finalizers::ROLE_DEFINITION)),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await?;
    }

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let result = finalizer(&api, finalizers::ROLE_DEFINITION, rd, |event| async {
        match event {
            FinalizerEvent::Apply(rd) => apply(rd, ctx.clone()).await,
            FinalizerEvent::Cleanup(rd) => cleanup(rd, ctx.clone()).await,
        }
    })
    .await
    .map_err(Error::from);

    #[cfg(feature = "metrics")]
    ctx.metrics
        .reconcile_duration_seconds
        .with_label_values(&["RoleDefinition"])
        .observe(started.elapsed().as_secs_f64());

    result
}

fn recorder(ctx: &Context, rd: &RoleDefinition) -> Recorder {
    Recorder::new(ctx.client.clone(), ctx.reporter.clone(), rd.object_ref(&()))
}

async fn apply(rd: Arc<RoleDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let generation = rd.meta().generation.unwrap_or_default();
    let mut status = rd.status.clone().unwrap_or_default();
    conditions::mark_reconciling(&mut status.conditions, generation, "Reconciling", "");

    let snapshot = match ctx.tracker.get_api_resources().await {
        Ok(s) => s,
        Err(Error::NotStarted) => {
            conditions::set(
                &mut status.conditions,
                generation,
                conditions::types::API_DISCOVERY,
                conditions::Status::Unknown,
                "NotStarted",
                "API-surface tracker has not completed its first poll",
            );
            persist_status(&ctx, &rd, status).await?;
            return Ok(Action::requeue(ctx.short_requeue));
        }
        Err(e) => return Err(e),
    };
    conditions::set(
        &mut status.conditions,
        generation,
        conditions::types::API_DISCOVERY,
        conditions::Status::True,
        "Snapshotted",
        "",
    );

    let rules = build_rules(&snapshot, &rd.spec);
    conditions::set(
        &mut status.conditions,
        generation,
        conditions::types::RESOURCE_FILTERED,
        conditions::Status::True,
        "RulesBuilt",
        format!("{} rule(s)", rules.len()),
    );

    match check_ownership(&ctx, &rd).await? {
        OwnershipState::Conflict => {
            conditions::set(
                &mut status.conditions,
                generation,
                conditions::types::OWNER_REF,
                conditions::Status::False,
                "OwnershipConflict",
                "target role already exists and is controlled by a different owner",
            );
            conditions::mark_stalled(
                &mut status.conditions,
                generation,
                "OwnershipConflict",
                "target role is controlled by an object this RoleDefinition does not own",
            );
            recorder(&ctx, &rd)
                .publish(Event {
                    type_: EventType::Warning,
                    reason: "OwnershipConflict".into(),
                    note: Some(format!(
                        "target role {} already owned by another controller",
                        rd.spec.target_name
                    )),
                    action: "Reconciling".into(),
                    secondary: None,
                })
                .await?;
            persist_status(&ctx, &rd, status).await?;
            return Ok(Action::requeue(ctx.probe_interval));
        }
        OwnershipState::Owned | OwnershipState::Absent => {}
    }

    apply_target_role(&ctx, &rd, rules).await?;

    conditions::set(
        &mut status.conditions,
        generation,
        conditions::types::OWNER_REF,
        conditions::Status::True,
        "Applied",
        "",
    );
    conditions::set(
        &mut status.conditions,
        generation,
        "Create",
        conditions::Status::True,
        "Present",
        "",
    );
    conditions::mark_ready(&mut status.conditions, generation, "Reconciled");
    persist_status(&ctx, &rd, status).await?;

    #[cfg(feature = "metrics")]
    ctx.metrics
        .reconcile_total
        .with_label_values(&["RoleDefinition"])
        .inc();

    Ok(Action::requeue(ctx.probe_interval))
}

async fn cleanup(rd: Arc<RoleDefinition>, ctx: Arc<Context>) -> Result<Action> {
    delete_target_role(&ctx, &rd).await?;
    Ok(Action::await_change())
}

enum OwnershipState {
    Absent,
    Owned,
    Conflict,
}

async fn check_ownership(ctx: &Context, rd: &RoleDefinition) -> Result<OwnershipState> {
    let uid = rd.uid();
    let owners = match &rd.spec.target_role {
        TargetRoleKind::ClusterRole => {
            let api: Api<ClusterRole> = Api::all(ctx.client.clone());
            auth_operator_common::apply::get_optional(&api, &rd.spec.target_name)
                .await?
                .and_then(|r| r.owner_references().to_vec().into_iter().next())
        }
        TargetRoleKind::Role => {
            let ns = rd.spec.target_namespace.clone().ok_or_else(|| {
                Error::UserInput("Role-scoped RoleDefinition requires targetNamespace".into())
            })?;
            let api: Api<Role> = Api::namespaced(ctx.client.clone(), &ns);
            auth_operator_common::apply::get_optional(&api, &rd.spec.target_name)
                .await?
                .and_then(|r| r.owner_references().to_vec().into_iter().next())
        }
    };
    Ok(match owners {
        None => OwnershipState::Absent,
        Some(owner) if owner.controller != Some(true) => OwnershipState::Owned,
        Some(owner) if uid.as_deref() == Some(owner.uid.as_str()) => OwnershipState::Owned,
        Some(_) => OwnershipState::Conflict,
    })
}

fn object_meta(rd: &RoleDefinition, name: &str, namespace: Option<String>) -> ObjectMeta {
    let mut generated_labels = rd.labels().clone();
    generated_labels.insert(labels::MANAGED_BY.into(), labels::OPERATOR_NAME.into());
    generated_labels.insert(labels::CREATED_BY.into(), labels::OPERATOR_NAME.into());
    if let Some(allowed) = rd.spec.breakglass_allowed {
        generated_labels.insert(
            auth_operator_types::BREAKGLASS_LABEL.into(),
            allowed.to_string(),
        );
    }

    let mut generated_annotations = std::collections::BTreeMap::new();
    generated_annotations.insert(annotations::SOURCE_KIND.into(), "RoleDefinition".into());
    generated_annotations.insert(annotations::SOURCE_NAME.into(), rd.name_any());

    ObjectMeta {
        name: Some(name.to_string()),
        namespace,
        labels: Some(generated_labels),
        annotations: Some(generated_annotations),
        owner_references: Some(vec![rd.controller_owner_ref(&()).unwrap()]),
        ..Default::default()
    }
}

async fn apply_target_role(
    ctx: &Context,
    rd: &RoleDefinition,
    rules: Vec<PolicyRule>,
) -> Result<()> {
    let manager = per_owner_manager(&rd.name_any());
    match &rd.spec.target_role {
        TargetRoleKind::ClusterRole => {
            let api: Api<ClusterRole> = Api::all(ctx.client.clone());
            let desired = ClusterRole {
                metadata: object_meta(rd, &rd.spec.target_name, None),
                rules: Some(rules),
                ..Default::default()
            };
            auth_operator_common::apply::apply(&api, &rd.spec.target_name, &desired, &manager, true)
                .await?;
            #[cfg(feature = "metrics")]
            ctx.metrics
                .managed_objects
                .with_label_values(&["ClusterRole", "apply"])
                .inc();
        }
        TargetRoleKind::Role => {
            let ns = rd.spec.target_namespace.clone().ok_or_else(|| {
                Error::UserInput("Role-scoped RoleDefinition requires targetNamespace".into())
            })?;
            let api: Api<Role> = Api::namespaced(ctx.client.clone(), &ns);
            let desired = Role {
                metadata: object_meta(rd, &rd.spec.target_name, Some(ns)),
                rules: Some(rules),
            };
            auth_operator_common::apply::apply(&api, &rd.spec.target_name, &desired, &manager, true)
                .await?;
            #[cfg(feature = "metrics")]
            ctx.metrics
                .managed_objects
                .with_label_values(&["Role", "apply"])
                .inc();
        }
    }
    Ok(())
}

async fn delete_target_role(ctx: &Context, rd: &RoleDefinition) -> Result<()> {
    match &rd.spec.target_role {
        TargetRoleKind::ClusterRole => {
            let api: Api<ClusterRole> = Api::all(ctx.client.clone());
            auth_operator_common::apply::delete_if_exists(&api, &rd.spec.target_name).await?;
            #[cfg(feature = "metrics")]
            ctx.metrics
                .managed_objects
                .with_label_values(&["ClusterRole", "delete"])
                .inc();
            Ok(())
        }
        TargetRoleKind::Role => {
            let Some(ns) = rd.spec.target_namespace.clone() else {
                return Ok(());
            };
            let api: Api<Role> = Api::namespaced(ctx.client.clone(), &ns);
            auth_operator_common::apply::delete_if_exists(&api, &rd.spec.target_name).await?;
            #[cfg(feature = "metrics")]
            ctx.metrics
                .managed_objects
                .with_label_values(&["Role", "delete"])
                .inc();
            Ok(())
        }
    }
}

async fn persist_status(
    ctx: &Context,
    rd: &RoleDefinition,
    mut status: RoleDefinitionStatus,
) -> Result<()> {
    status.observed_generation = rd.meta().generation.unwrap_or_default();
    let api: Api<RoleDefinition> = Api::all(ctx.client.clone());
    let patch = RoleDefinition {
        metadata: ObjectMeta {
            name: rd.meta().name.clone(),
            ..Default::default()
        },
        spec: Default::default(),
        status: Some(status),
    };
    auth_operator_common::apply::apply_status(
        &api,
        &rd.name_any(),
        &patch,
        auth_operator_common::MANAGER_NAME,
    )
    .await?;
    Ok(())
}

fn error_policy(rd: Arc<RoleDefinition>, error: &Error, ctx: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!(
            "RoleDefinition {} reconcile error: {error}",
            rd.name_any()
        )
        .red()
    );
    #[cfg(feature = "metrics")]
    ctx.metrics
        .reconcile_errors_total
        .with_label_values(&["RoleDefinition", &error.metric_label()])
        .inc();
    Action::requeue(std::time::Duration::from_secs(5))
}
