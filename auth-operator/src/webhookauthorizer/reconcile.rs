//! WebhookAuthorizer reconciler: a status-only interface stub. No owned
//! objects, no finalizer -- it exists so the webhook-authorization story
//! has a CR to point a `status.conditions` consumer at.

use crate::context::Context;
use auth_operator_common::conditions;
use auth_operator_common::errors::{Error, Result};
use auth_operator_types::{WebhookAuthorizer, WebhookAuthorizerStatus};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
use kube::api::{Api, ObjectMeta};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
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
    let api: Api<WebhookAuthorizer> = Api::all(client);
    println!("{}", "starting WebhookAuthorizer controller".green());
    kube::runtime::Controller::new(api, Default::default())
        .concurrency(concurrency)
        .run(reconcile, error_policy, ctx)
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn reconcile(wa: Arc<WebhookAuthorizer>, ctx: Arc<Context>) -> Result<Action> {
    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let generation = wa.meta().generation.unwrap_or_default();
    let mut status = wa.status.clone().unwrap_or_default();
    conditions::mark_reconciling(&mut status.conditions, generation, "Reconciling", "");

    if requirement_is_malformed(&wa) {
        conditions::mark_stalled(
            &mut status.conditions,
            generation,
            "InvalidNamespaceSelector",
            "namespaceSelector contains a requirement with no operator-appropriate values",
        );
        status.authorizer_configured = false;
        persist_status(&ctx, &wa, status).await?;
        #[cfg(feature = "metrics")]
        ctx.metrics
            .reconcile_duration_seconds
            .with_label_values(&["WebhookAuthorizer"])
            .observe(started.elapsed().as_secs_f64());
        return Ok(Action::requeue(ctx.probe_interval));
    }

    status.authorizer_configured = true;
    conditions::mark_ready(&mut status.conditions, generation, "Reconciled");
    persist_status(&ctx, &wa, status).await?;

    if selector_is_non_empty(&wa) && !probe_matching_namespace(&ctx.client, &wa).await? {
        recorder(&ctx, &wa)
            .publish(Event {
                type_: EventType::Warning,
                reason: "NoMatchingNamespaces".into(),
                note: Some("namespaceSelector currently matches no namespace".into()),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await?;
    } else {
        recorder(&ctx, &wa)
            .publish(Event {
                type_: EventType::Normal,
                reason: "Reconciled".into(),
                note: Some("namespaceSelector accepted".into()),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await?;
    }

    #[cfg(feature = "metrics")]
    {
        ctx.metrics
            .reconcile_total
            .with_label_values(&["WebhookAuthorizer"])
            .inc();
        ctx.metrics
            .reconcile_duration_seconds
            .with_label_values(&["WebhookAuthorizer"])
            .observe(started.elapsed().as_secs_f64());
    }

    Ok(Action::requeue(ctx.probe_interval))
}

fn recorder(ctx: &Context, wa: &WebhookAuthorizer) -> Recorder {
    Recorder::new(ctx.client.clone(), ctx.reporter.clone(), wa.object_ref(&()))
}

/// An empty selector matches all namespaces and is valid; the only thing
/// worth rejecting is a requirement whose operator requires `values` but
/// carries none (`In`/`NotIn` with an empty or absent list can never
/// match, which is almost certainly a typo rather than intent).
fn requirement_is_malformed(wa: &WebhookAuthorizer) -> bool {
    wa.spec
        .namespace_selector
        .match_expressions
        .as_ref()
        .is_some_and(|reqs| reqs.iter().any(needs_values_but_has_none))
}

fn needs_values_but_has_none(req: &LabelSelectorRequirement) -> bool {
    matches!(req.operator.as_str(), "In" | "NotIn") && req.values.clone().unwrap_or_default().is_empty()
}

async fn persist_status(
    ctx: &Context,
    wa: &WebhookAuthorizer,
    mut status: WebhookAuthorizerStatus,
) -> Result<()> {
    status.observed_generation = wa.meta().generation.unwrap_or_default();
    let api: Api<WebhookAuthorizer> = Api::all(ctx.client.clone());
    let patch = WebhookAuthorizer {
        metadata: ObjectMeta {
            name: wa.meta().name.clone(),
            ..Default::default()
        },
        spec: Default::default(),
        status: Some(status),
    };
    auth_operator_common::apply::apply_status(
        &api,
        &wa.name_any(),
        &patch,
        auth_operator_common::MANAGER_NAME,
    )
    .await?;
    Ok(())
}

fn error_policy(wa: Arc<WebhookAuthorizer>, error: &Error, ctx: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!("WebhookAuthorizer {} reconcile error: {error}", wa.name_any()).red()
    );
    #[cfg(feature = "metrics")]
    ctx.metrics
        .reconcile_errors_total
        .with_label_values(&["WebhookAuthorizer", &error.metric_label()])
        .inc();
    Action::requeue(std::time::Duration::from_secs(5))
}

fn selector_is_non_empty(wa: &WebhookAuthorizer) -> bool {
    !wa.spec
        .namespace_selector
        .match_labels
        .clone()
        .unwrap_or_default()
        .is_empty()
        || !wa
            .spec
            .namespace_selector
            .match_expressions
            .clone()
            .unwrap_or_default()
            .is_empty()
}

/// Optional probe: a non-empty selector matching zero namespaces is
/// surfaced as an event, not a stall -- the selector may simply be waiting
/// on a namespace that hasn't been created yet.
async fn probe_matching_namespace(client: &kube::Client, wa: &WebhookAuthorizer) -> Result<bool> {
    let api: Api<Namespace> = Api::all(client.clone());
    let namespaces = api.list(&Default::default()).await?;
    Ok(namespaces.items.iter().any(|ns| {
        let labels = ns.labels();
        wa.spec
            .namespace_selector
            .match_labels
            .clone()
            .unwrap_or_default()
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }))
}
