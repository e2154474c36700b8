//! Shared reconciler context, injected into every `reconcile`/`error_policy`
//! call: client and metrics bundled behind one `Arc`, plus the
//! API-Surface Tracker handle the Role Synthesizer depends on.

use crate::discovery::Tracker;
use kube::client::Client;
use kube::runtime::events::Reporter;
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

pub struct Context {
    pub client: Client,
    pub tracker: Tracker,
    pub reporter: Reporter,
    /// Requeue interval for an already-settled object.
    pub probe_interval: Duration,
    /// Shorter requeue used when a dependency is temporarily missing.
    pub short_requeue: Duration,
    #[cfg(feature = "metrics")]
    pub metrics: ControllerMetrics,
}

impl Context {
    pub fn new(
        client: Client,
        tracker: Tracker,
        probe_interval: Duration,
        short_requeue: Duration,
    ) -> Self {
        let reporter = Reporter {
            controller: auth_operator_common::MANAGER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            client,
            tracker,
            reporter,
            probe_interval,
            short_requeue,
            #[cfg(feature = "metrics")]
            metrics: ControllerMetrics::global(),
        }
    }
}
