//! Reconciler metrics: per-kind reconcile/error/duration counters behind
//! the optional `metrics` feature, built on the `prometheus` crate.

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use prometheus::{Encoder, GaugeVec, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

static GLOBAL: OnceLock<ControllerMetrics> = OnceLock::new();

#[derive(Clone)]
pub struct ControllerMetrics {
    pub reconcile_total: IntCounterVec,
    pub reconcile_errors_total: IntCounterVec,
    pub reconcile_duration_seconds: HistogramVec,
    pub managed_objects: IntCounterVec,
    /// Unresolved `roleRef`s on a BindDefinition, labeled by its name.
    pub bind_definition_missing_role_refs: GaugeVec,
    /// Namespaces a BindDefinition's selectors currently resolve to.
    pub bind_definition_active_namespaces: GaugeVec,
    /// ServiceAccount subjects a BindDefinition references outside any
    /// namespace it manages.
    pub bind_definition_external_service_accounts: GaugeVec,
    registry: Registry,
}

impl ControllerMetrics {
    /// `subsystem` namespaces the metric names, e.g. `"auth_operator"`.
    pub fn new(subsystem: &str) -> Self {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("reconcile_total", "total reconciliations run").subsystem(subsystem),
            &["kind"],
        )
        .unwrap();
        let reconcile_errors_total = IntCounterVec::new(
            Opts::new("reconcile_errors_total", "reconciliations ending in error")
                .subsystem(subsystem),
            &["kind", "error"],
        )
        .unwrap();
        let reconcile_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "reconcile_duration_seconds",
                "time spent in a single reconcile call",
            )
            .subsystem(subsystem)
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 2.5, 5., 15., 60.]),
            &["kind"],
        )
        .unwrap();
        let managed_objects = IntCounterVec::new(
            Opts::new(
                "managed_objects_total",
                "RBAC objects created, updated or deleted by the controller",
            )
            .subsystem(subsystem),
            &["kind", "verb"],
        )
        .unwrap();
        let bind_definition_missing_role_refs = GaugeVec::new(
            Opts::new(
                "bind_definition_missing_role_refs",
                "unresolved roleRefs on a BindDefinition",
            )
            .subsystem(subsystem),
            &["name"],
        )
        .unwrap();
        let bind_definition_active_namespaces = GaugeVec::new(
            Opts::new(
                "bind_definition_active_namespaces",
                "namespaces a BindDefinition's selectors currently resolve to",
            )
            .subsystem(subsystem),
            &["name"],
        )
        .unwrap();
        let bind_definition_external_service_accounts = GaugeVec::new(
            Opts::new(
                "bind_definition_external_service_accounts",
                "ServiceAccount subjects referenced outside any namespace the BindDefinition manages",
            )
            .subsystem(subsystem),
            &["name"],
        )
        .unwrap();

        registry
            .register(Box::new(reconcile_total.clone()))
            .unwrap();
        registry
            .register(Box::new(reconcile_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(reconcile_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(managed_objects.clone()))
            .unwrap();
        registry
            .register(Box::new(bind_definition_missing_role_refs.clone()))
            .unwrap();
        registry
            .register(Box::new(bind_definition_active_namespaces.clone()))
            .unwrap();
        registry
            .register(Box::new(bind_definition_external_service_accounts.clone()))
            .unwrap();

        Self {
            reconcile_total,
            reconcile_errors_total,
            reconcile_duration_seconds,
            managed_objects,
            bind_definition_missing_role_refs,
            bind_definition_active_namespaces,
            bind_definition_external_service_accounts,
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Every reconciler's `Context` shares this one process-wide instance --
    /// the three controllers would otherwise each register their own
    /// registry and `/metrics` could only ever expose one.
    pub fn global() -> ControllerMetrics {
        GLOBAL
            .get_or_init(|| ControllerMetrics::new("auth_operator"))
            .clone()
    }
}

/// Serves `/healthz` and `/metrics` (the latter rendering [`ControllerMetrics::global`])
/// until `shutdown` is cancelled.
pub async fn serve(port: u16, shutdown: CancellationToken) {
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("metrics server: failed to bind {addr}: {e}");
            return;
        }
    };

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(_) => continue,
            },
        };
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                let body = match req.uri().path() {
                    "/metrics" => {
                        let metrics = ControllerMetrics::global();
                        let families = metrics.registry().gather();
                        let mut buf = Vec::new();
                        TextEncoder::new().encode(&families, &mut buf).unwrap();
                        buf
                    }
                    _ => b"ok".to_vec(),
                };
                Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(body))))
            });
            let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await;
        });
    }
}
