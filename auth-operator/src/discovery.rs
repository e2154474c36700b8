//! API-Surface Tracker: caches the set of namespaced and cluster-scoped
//! API resources the live cluster exposes and notifies the Role
//! Synthesizer when the snapshot changes.
//!
//! Built on `kube::discovery::Discovery`, polling on an interval and
//! publishing a new snapshot as a background task -- this tracker has no
//! CR of its own, so there's nothing to reconcile, only a cache to keep
//! warm.

use auth_operator_common::errors::{Error, Result};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// One resource entry as exposed by cluster API discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResource {
    pub group: String,
    pub version: String,
    pub name: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
}

/// `map<group/version, list<APIResource>>`.
pub type Snapshot = BTreeMap<String, Vec<ApiResource>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotState {
    NotStarted,
    Ready(Arc<Snapshot>),
}

/// Shared handle the reconcilers read from and the background poller
/// writes to. `changed` is a coalesced "something changed" signal, not a
/// delta stream.
#[derive(Clone)]
pub struct Tracker {
    state: Arc<RwLock<SnapshotState>>,
    changed: watch::Sender<()>,
}

impl Tracker {
    pub fn new() -> (Self, watch::Receiver<()>) {
        let (tx, rx) = watch::channel(());
        (
            Self {
                state: Arc::new(RwLock::new(SnapshotState::NotStarted)),
                changed: tx,
            },
            rx,
        )
    }

    /// Returns the current snapshot, or `Error::NotStarted` if the first
    /// poll hasn't completed yet.
    pub async fn get_api_resources(&self) -> Result<Arc<Snapshot>> {
        match &*self.state.read().await {
            SnapshotState::NotStarted => Err(Error::NotStarted),
            SnapshotState::Ready(snapshot) => Ok(snapshot.clone()),
        }
    }

    async fn publish(&self, snapshot: Snapshot) {
        let changed = {
            let current = self.state.read().await;
            match &*current {
                SnapshotState::Ready(existing) => existing.as_ref() != &snapshot,
                SnapshotState::NotStarted => true,
            }
        };
        *self.state.write().await = SnapshotState::Ready(Arc::new(snapshot));
        if changed {
            let _ = self.changed.send(());
        }
    }

    /// Runs the poll loop until `shutdown` is cancelled. Intended to be
    /// spawned once as a background task tied to the manager's lifetime.
    pub async fn run(self, client: Client, interval: Duration, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            match poll_once(&client).await {
                Ok(snapshot) => self.publish(snapshot).await,
                Err(e) => {
                    eprintln!("api-surface-tracker: discovery poll failed, keeping last snapshot: {e}");
                }
            }
        }
    }
}

/// A single discovery pass. Partial group failures are tolerated (logged,
/// skipped); a wholly failed discovery call is the only thing that fails
/// the cycle.
async fn poll_once(client: &Client) -> Result<Snapshot> {
    let discovery = kube::discovery::Discovery::new(client.clone())
        .run()
        .await?;

    let mut snapshot: Snapshot = BTreeMap::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            // Sub-resources (`pods/log`) are left in the snapshot; it is
            // the rule-builder's job to skip them, not the tracker's.
            let key = format!("{}/{}", ar.group, ar.version);
            snapshot.entry(key).or_default().push(ApiResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                name: ar.plural.clone(),
                namespaced: caps.scope == kube::discovery::Scope::Namespaced,
                verbs: caps.verbs.clone(),
            });
        }
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_tracker_reports_not_started() {
        let (tracker, _rx) = Tracker::new();
        assert!(matches!(
            tracker.get_api_resources().await,
            Err(Error::NotStarted)
        ));
    }

    #[tokio::test]
    async fn publish_signals_change_only_when_the_snapshot_differs() {
        let (tracker, mut rx) = Tracker::new();
        let one = ApiResource {
            group: "".into(),
            version: "v1".into(),
            name: "pods".into(),
            namespaced: true,
            verbs: vec!["get".into(), "list".into()],
        };
        let mut snap = Snapshot::new();
        snap.insert("/v1".into(), vec![one.clone()]);

        tracker.publish(snap.clone()).await;
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        tracker.publish(snap).await;
        assert!(!rx.has_changed().unwrap());
    }
}
