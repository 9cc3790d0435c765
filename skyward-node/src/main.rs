//! skyward-node: converges a manifest of cloud resources.
//!
//! Loads the desired instances from a JSON manifest, starts the convergence
//! engine against the configured control plane and runs until every
//! instance has settled (Ready or Failed), the settle timeout expires or
//! Ctrl-C is pressed. With `--teardown` the same instances are deleted
//! afterwards, dependents before the resources they reference.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use skyward_engine::manager::ManagerRegistry;
use skyward_engine::{
    ControlPlane, ConvergenceController, Engine, EngineConfig, EnvironmentToken, HttpControlPlane,
    InstanceStore, SimulatedControlPlane,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod agent;
mod manifest;

use agent::NodeAgent;
use manifest::Manifest;

/// Skyward node
#[derive(Parser, Debug)]
#[command(name = "skyward-node", version, about)]
struct Args {
    /// Manifest of desired resources (JSON)
    #[arg(short, long)]
    manifest: PathBuf,

    /// Control-plane base endpoint
    #[arg(long, env = "SKYWARD_ENDPOINT", default_value = skyward_engine::config::DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Subscription scope, used when the manifest names none
    #[arg(long, env = "SKYWARD_SUBSCRIPTION", default_value = "")]
    subscription: String,

    /// Tenant scope
    #[arg(long, env = "SKYWARD_TENANT", default_value = "")]
    tenant: String,

    /// Client identifier, appended to the user agent
    #[arg(long, env = "SKYWARD_CLIENT_ID", default_value = "skyward-node")]
    client_id: String,

    /// Concurrent reconciliation workers
    #[arg(long, env = "SKYWARD_WORKERS", default_value = "4")]
    workers: usize,

    /// Initial operation poll interval in milliseconds
    #[arg(long, env = "SKYWARD_POLL_INTERVAL_MS", default_value = "5000")]
    poll_interval_ms: u64,

    /// Ceiling for consecutive Conflict/Throttled retries
    #[arg(long, env = "SKYWARD_MAX_RETRIES", default_value = "10")]
    max_retries: u32,

    /// Run against the in-memory control plane instead of the endpoint
    #[arg(long)]
    simulate: bool,

    /// Delete every manifest resource after convergence
    #[arg(long)]
    teardown: bool,

    /// Seconds to wait for each phase to settle
    #[arg(long, default_value = "1800")]
    settle_timeout: u64,
}

impl Args {
    fn engine_config(&self, subscription: &str) -> EngineConfig {
        let mut config = EngineConfig {
            base_endpoint: self.endpoint.clone(),
            subscription_id: subscription.to_string(),
            tenant_id: self.tenant.clone(),
            client_id: self.client_id.clone(),
            poll_interval_ms: self.poll_interval_ms,
            max_retries: self.max_retries,
            workers: self.workers,
            ..Default::default()
        };
        if self.simulate {
            config.poll_interval_ms = 50;
            config.max_poll_interval_ms = 200;
            config.base_backoff_ms = 100;
            config.max_backoff_ms = 2_000;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skyward_node=info,skyward_engine=info,audit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let manifest = Manifest::load(&args.manifest, &args.subscription)?;
    let config = args.engine_config(&manifest.subscription);
    config.validate().context("Invalid engine configuration")?;

    let channel: Arc<dyn ControlPlane> = if args.simulate {
        info!("Using simulated control plane");
        Arc::new(SimulatedControlPlane::new().with_latency(2))
    } else {
        info!("Control plane endpoint: {}", config.endpoint());
        Arc::new(
            HttpControlPlane::new(&config, Arc::new(EnvironmentToken::default()))
                .context("Failed to create control-plane client")?,
        )
    };

    let store = Arc::new(InstanceStore::new());
    let managers = ManagerRegistry::standard(channel, &config);
    let controller = Arc::new(ConvergenceController::new(
        &config,
        managers,
        store.clone(),
        store.clone(),
    ));
    let engine = Engine::start(controller, store, config.workers);

    info!(
        manifest = %args.manifest.display(),
        resources = manifest.len(),
        workers = config.workers,
        "Starting skyward-node"
    );

    let agent = NodeAgent::new(engine, manifest, Duration::from_secs(args.settle_timeout));
    agent.run(args.teardown).await?;

    info!("Done");
    Ok(())
}
