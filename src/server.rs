//! Control-plane assembly
//!
//! Wires the store, tracker, router, reconciliation engine, and autoscaler
//! evaluator together, and owns the worker lifecycle: `start` spawns the
//! engine and evaluator on tokio tasks, `shutdown` cancels them and waits
//! for a clean stop.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admission::Router;
use crate::autoscale::{Evaluator, EvaluatorConfig, LoadSignal};
use crate::backend::InfraBackend;
use crate::operation::OperationTracker;
use crate::reconcile::{EngineConfig, ReconcileEngine};
use crate::store::ResourceStore;

/// Configuration for the assembled control plane
#[derive(Clone, Debug, Default)]
pub struct ControlPlaneConfig {
    /// Reconciliation engine settings
    pub engine: EngineConfig,
    /// Autoscaler evaluator settings
    pub evaluator: EvaluatorConfig,
}

/// The assembled control plane
pub struct ControlPlane {
    router: Arc<Router>,
    engine: Arc<ReconcileEngine>,
    evaluator: Arc<Evaluator>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    /// Assemble a control plane over the given backend and load signal
    pub fn new(
        backend: Arc<dyn InfraBackend>,
        signal: Arc<dyn LoadSignal>,
        config: ControlPlaneConfig,
    ) -> Self {
        let store = Arc::new(ResourceStore::new());
        let tracker = Arc::new(OperationTracker::new());
        let router = Arc::new(Router::new(store.clone(), tracker.clone()));
        let engine = Arc::new(ReconcileEngine::new(
            store.clone(),
            tracker,
            backend,
            config.engine,
        ));
        let evaluator = Arc::new(Evaluator::new(store, router.clone(), signal, config.evaluator));

        Self {
            router,
            engine,
            evaluator,
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// The admission/query surface
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Spawn the reconciliation engine and autoscaler workers
    pub fn start(&mut self) {
        let engine = self.engine.clone();
        let evaluator = self.evaluator.clone();
        self.workers
            .push(tokio::spawn(engine.run(self.shutdown.child_token())));
        self.workers
            .push(tokio::spawn(evaluator.run(self.shutdown.child_token())));
        info!("Control plane workers started");
    }

    /// Stop the workers and wait for them to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        join_all(self.workers).await;
        info!("Control plane shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::CreateClusterRequest;
    use crate::autoscale::StaticLoadSignal;
    use crate::backend::SimulatedBackend;
    use crate::operation::OperationState;
    use crate::resource::{ClusterName, ClusterSpec};
    use std::time::Duration;

    /// Story: the assembled plane converges a creation end to end through
    /// its background workers
    #[tokio::test]
    async fn story_background_workers_converge_a_creation() {
        let mut plane = ControlPlane::new(
            Arc::new(SimulatedBackend::new()),
            Arc::new(StaticLoadSignal::new()),
            ControlPlaneConfig {
                engine: EngineConfig {
                    tick_interval: Duration::from_millis(10),
                    ..EngineConfig::default()
                },
                ..ControlPlaneConfig::default()
            },
        );
        plane.start();
        let router = plane.router();

        let name = ClusterName::new("acme", "us-west1", "prod").unwrap();
        let op = router
            .create_cluster(CreateClusterRequest {
                name: name.clone(),
                spec: ClusterSpec::with_master_version("1.31.2"),
            })
            .unwrap();

        let finished = router
            .wait_operation(&op.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(finished.state, OperationState::Done);

        plane.shutdown().await;
    }
}
