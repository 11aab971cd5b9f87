//! Policy discovery service: binds the discovery engines in `policy-core`
//! to a concrete `sqlx` store, a static/onboarded `ClusterSource`, and an
//! `axum` JSON-RPC surface, wired up by `policy-config`.

pub mod errors;
pub mod rpc;
pub mod store;
pub mod yaml;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use policy_config::{Config, ConfigLoader};
use policy_core::discovery::network::{NetworkDiscovery, RoundConfig};
use policy_core::discovery::system::SystemDiscovery;
use policy_core::discovery::{AdmissionTemplate, AdmissionWorker};
use policy_core::scheduler::Scheduler;
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::rpc::AppState;
use crate::store::{SqlStore, StaticClusterSource};

#[derive(Parser, Debug)]
#[command(name = "policy-server")]
#[command(about = "Runtime-behavior-based least-privilege policy discovery")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, env = "POLICY_CONFIG")]
    config: Option<PathBuf>,

    /// Server port (overrides config).
    #[arg(short, long, env = "POLICY_SERVER_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ConfigLoader::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let config = Arc::new(config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "policy_server=debug,policy_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(cluster = %config.cluster, "policy discovery service starting");

    let store = Arc::new(SqlStore::connect(&config.store.database_url).await?);
    store.initialize_schema().await?;
    info!("policy store schema ready");

    let scheduler = Arc::new(build_scheduler(&config, store.clone()).await?);
    if config.scheduler.purge.enabled {
        spawn_purge_job(config.clone(), store.clone());
    }

    let state = AppState {
        store,
        scheduler,
        logfile: Arc::new(RwLock::new(None)),
    };

    let app = rpc::build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Registers the `network`, `system`, and `admission` discovery workers
/// against the configured cluster source and store, plus their cron
/// cadence.
async fn build_scheduler(config: &Config, store: Arc<SqlStore>) -> anyhow::Result<Scheduler> {
    let mut scheduler = Scheduler::new();

    let cluster_source = Arc::new(StaticClusterSource::new("clusters"));

    let network = Arc::new(NetworkDiscovery::new(
        store.clone(),
        cluster_source.clone(),
        store.clone(),
        RoundConfig {
            cluster: config.cluster.clone(),
            limit: config.network.limit,
            trigger: config.network.trigger,
            ignore_labels: config.ignore_labels.clone(),
        },
    ));
    scheduler.register("network", network, &config.scheduler.network_cron_expr)?;

    let system = Arc::new(SystemDiscovery::new(
        store.clone(),
        store.clone(),
        RoundConfig {
            cluster: config.cluster.clone(),
            limit: config.system.limit,
            trigger: config.system.trigger,
            ignore_labels: config.ignore_labels.clone(),
        },
        config.path_aggregation_threshold,
    ));
    scheduler.register("system", system, &config.scheduler.system_cron_expr)?;

    let templates = config
        .admission_templates
        .iter()
        .map(|t| AdmissionTemplate {
            cluster: t.cluster.clone(),
            namespace: t.namespace.clone(),
            selector: t.selector.clone(),
            target_kind: t.target_kind.clone(),
            pattern: t.pattern.clone(),
        })
        .collect();
    let admission = Arc::new(AdmissionWorker::new(cluster_source, store, templates));
    scheduler.register("admission", admission, &config.scheduler.admission_cron_expr)?;

    Ok(scheduler)
}

/// The purge job runs on its own cadence rather than through the
/// `Scheduler`'s `DiscoveryWorker` trait, since it has no round outcome
/// to report.
fn spawn_purge_job(config: Arc<Config>, store: Arc<SqlStore>) {
    tokio::spawn(async move {
        let Ok(schedule) = cron::Schedule::from_str(&config.scheduler.purge.cron_expr) else {
            warn!(expr = %config.scheduler.purge.cron_expr, "invalid purge cron expression, purge disabled");
            return;
        };
        loop {
            let Some(next) = schedule.upcoming(chrono::Utc).next() else {
                break;
            };
            let now = chrono::Utc::now();
            if next > now {
                let wait = (next - now).to_std().unwrap_or(std::time::Duration::from_secs(0));
                tokio::time::sleep(wait).await;
            }
            let retain_for = chrono::Duration::days(config.scheduler.purge.retain_days);
            match policy_core::scheduler::run_purge_once(store.as_ref(), store.as_ref(), retain_for)
                .await
            {
                Ok((policies, logs)) => info!(policies, logs, "purge completed"),
                Err(err) => warn!(error = %err, "purge failed"),
            }
        }
    });
}
