mod binddefinition;
mod context;
mod discovery;
mod roledefinition;
mod terminator;
mod util;
mod webhookauthorizer;

use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// `auth-operator`: reconciles `RoleDefinition`, `BindDefinition`, and
/// `WebhookAuthorizer` custom resources.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Namespace the leader-election Lease lives in.
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Name of the shared Lease used for leader election.
    #[arg(long, env = "LEASE_NAME", default_value = "auth-operator-lock")]
    lease_name: String,

    /// How long leadership is valid without renewal.
    #[arg(long, env = "LEASE_TTL_SECS", default_value_t = 15)]
    lease_ttl_secs: u64,

    /// How often to attempt to renew/acquire leadership.
    #[arg(long, env = "RENEW_EVERY_SECS", default_value_t = 5)]
    renew_every_secs: u64,

    /// How often the API-surface tracker polls cluster discovery.
    #[arg(long, env = "DISCOVERY_POLL_SECS", default_value_t = 60)]
    discovery_poll_secs: u64,

    /// HTTP port serving `/healthz` and `/metrics`.
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    health_port: u16,

    /// Number of objects each controller reconciles concurrently.
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 1)]
    worker_concurrency: u16,

    /// Requeue interval applied to an already-settled object.
    #[arg(long, env = "DEFAULT_REQUEUE_SECS", default_value_t = 60)]
    default_requeue_secs: u64,

    /// Shorter requeue interval applied while a dependency is temporarily
    /// missing.
    #[arg(long, env = "SHORT_REQUEUE_SECS", default_value_t = 10)]
    short_requeue_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    auth_operator_common::init();
    let cli = Cli::parse();

    let client = Client::try_default().await?;

    let (tracker, _changed) = discovery::Tracker::new();

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        auth_operator_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    tokio::spawn(tracker.clone().run(
        client.clone(),
        Duration::from_secs(cli.discovery_poll_secs),
        shutdown.clone(),
    ));

    #[cfg(feature = "metrics")]
    tokio::spawn(util::metrics::serve(cli.health_port, shutdown.clone()));
    #[cfg(not(feature = "metrics"))]
    tokio::spawn(util::serve_healthz(cli.health_port, shutdown.clone()));

    auth_operator_common::signal_ready();

    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("auth-operator-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &cli.namespace,
        LeaseLockParams {
            holder_id,
            lease_name: cli.lease_name.clone(),
            lease_ttl: Duration::from_secs(cli.lease_ttl_secs),
        },
    );

    println!("{}", "starting auth-operator".green());

    let mut controllers: Option<Vec<JoinHandle<()>>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(cli.renew_every_secs));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(tasks) = controllers.take() {
                    for task in tasks {
                        task.abort();
                    }
                }
                break;
            }
            _ = tick.tick() => {}
        }

        let lease = match leadership.try_acquire_or_renew().await {
            Ok(lease) => lease,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(tasks) = controllers.take() {
                    for task in tasks {
                        task.abort();
                    }
                    eprintln!("aborted controllers due to leader election error");
                }
                continue;
            }
        };

        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controllers.is_none() {
                println!("{}", "acquired leadership; starting controllers".green());
                let default_requeue = Duration::from_secs(cli.default_requeue_secs);
                let short_requeue = Duration::from_secs(cli.short_requeue_secs);
                controllers = Some(vec![
                    tokio::spawn(roledefinition::run(
                        client.clone(),
                        tracker.clone(),
                        cli.worker_concurrency,
                        default_requeue,
                        short_requeue,
                    )),
                    tokio::spawn(binddefinition::run(
                        client.clone(),
                        tracker.clone(),
                        cli.worker_concurrency,
                        default_requeue,
                        short_requeue,
                    )),
                    tokio::spawn(webhookauthorizer::run(
                        client.clone(),
                        tracker.clone(),
                        cli.worker_concurrency,
                        default_requeue,
                        short_requeue,
                    )),
                ]);
            }
        } else if let Some(tasks) = controllers.take() {
            eprintln!("lost leadership; stopping controllers");
            for task in tasks {
                task.abort();
            }
        }
    }

    Ok(())
}
