//! Pylon - container-cluster control-plane management service

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pylon::admission::{CreateClusterRequest, CreateNodePoolRequest};
use pylon::autoscale::{EvaluatorConfig, StaticLoadSignal};
use pylon::backend::SimulatedBackend;
use pylon::reconcile::EngineConfig;
use pylon::resource::{Autoscaling, ClusterName, ClusterSpec, NodePoolSpec};
use pylon::retry::RetryConfig;
use pylon::server::{ControlPlane, ControlPlaneConfig};

/// Pylon - container-cluster control-plane management service
#[derive(Parser, Debug)]
#[command(name = "pylon", version, about, long_about = None)]
struct Cli {
    /// Reconciliation engine tick interval in milliseconds
    #[arg(long, env = "PYLON_RECONCILE_INTERVAL_MS", default_value = "500")]
    reconcile_interval_ms: u64,

    /// Autoscaler evaluation interval in milliseconds
    #[arg(long, env = "PYLON_AUTOSCALE_INTERVAL_MS", default_value = "10000")]
    autoscale_interval_ms: u64,

    /// Backend apply attempts before an operation aborts
    #[arg(long, env = "PYLON_APPLY_ATTEMPTS", default_value = "3")]
    apply_attempts: u32,

    /// Seed a demo cluster with an autoscaled node pool on startup
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let backend = Arc::new(SimulatedBackend::new());
    let signal = Arc::new(StaticLoadSignal::new());

    let config = ControlPlaneConfig {
        engine: EngineConfig {
            tick_interval: Duration::from_millis(cli.reconcile_interval_ms),
            retry: RetryConfig::with_max_attempts(cli.apply_attempts),
        },
        evaluator: EvaluatorConfig {
            tick_interval: Duration::from_millis(cli.autoscale_interval_ms),
        },
    };

    let mut plane = ControlPlane::new(backend, signal.clone(), config);
    plane.start();

    if cli.demo {
        seed_demo(&plane, &signal).await?;
    }

    tracing::info!("Pylon control plane running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    plane.shutdown().await;
    Ok(())
}

/// Create a demo cluster with an autoscaled pool and a standing load signal
async fn seed_demo(plane: &ControlPlane, signal: &StaticLoadSignal) -> anyhow::Result<()> {
    let router = plane.router();
    let cluster = ClusterName::new("demo", "us-west1", "sandbox")
        .map_err(|e| anyhow::anyhow!("demo cluster name: {e}"))?;

    let op = router
        .create_cluster(CreateClusterRequest {
            name: cluster.clone(),
            spec: ClusterSpec::with_master_version("1.31.2"),
        })
        .map_err(|e| anyhow::anyhow!("demo cluster admission: {e}"))?;
    router
        .wait_operation(&op.id, Duration::from_secs(30))
        .await
        .map_err(|e| anyhow::anyhow!("demo cluster wait: {e}"))?;

    let pool = cluster
        .node_pool("workers")
        .map_err(|e| anyhow::anyhow!("demo pool name: {e}"))?;
    router
        .create_node_pool(CreateNodePoolRequest {
            name: pool.clone(),
            spec: NodePoolSpec {
                autoscaling: Autoscaling::bounds(1, 5),
                ..NodePoolSpec::fixed("n2-standard-4", 2)
            },
        })
        .map_err(|e| anyhow::anyhow!("demo pool admission: {e}"))?;

    // Standing demand above the current size; the evaluator scales the pool
    // up on its next tick
    signal.set_demand(&pool, 4);

    let snapshot = router
        .get_cluster(&cluster)
        .map_err(|e| anyhow::anyhow!("demo cluster read-back: {e}"))?;
    tracing::info!(
        cluster = %cluster,
        pool = %pool,
        snapshot = %serde_json::to_string(&snapshot)?,
        "Demo resources seeded"
    );
    Ok(())
}
