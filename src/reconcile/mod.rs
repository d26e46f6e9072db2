//! Reconciliation engine
//!
//! The engine closes the gap between desired and observed state. It claims
//! pending operations from the tracker (one per resource, guaranteed by the
//! per-resource lock), drives the infrastructure backend with bounded
//! exponential backoff on transient failures, and reports the terminal state
//! back through the tracker. Admission never blocks on any of this: the
//! engine runs on its own tokio task and wakes on admission or on its tick.
//!
//! Failure handling:
//! - Transient backend errors are retried up to the configured attempt
//!   bound; exhaustion aborts the operation and parks the resource in Error
//!   with the detail attached, never a silent drop
//! - Fatal backend errors abort immediately without further attempts
//! - Cancellation is observed between attempts; a cancelled resource reverts
//!   to its last stable state when it has one

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::InfraBackend;
use crate::operation::{Operation, OperationKind, OperationTracker};
use crate::resource::{ClusterName, NodePoolName, ResourceName, ResourceStatus};
use crate::retry::{retry_with_backoff, RetryConfig, RetryError};
use crate::store::ResourceStore;

/// Reconciliation engine configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How often to scan for pending work in the absence of admission wakeups
    pub tick_interval: Duration,
    /// Backoff applied to backend calls
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            retry: RetryConfig::default(),
        }
    }
}

/// Why an operation did not converge
enum Failure {
    /// Cancellation observed between attempts
    Cancelled,
    /// Backend gave up (fatal) or the attempt bound was exhausted
    Backend(String),
    /// The target document disappeared underneath the operation
    Vanished(String),
}

impl<E: std::fmt::Display> From<RetryError<E>> for Failure {
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Cancelled => Self::Cancelled,
            RetryError::Fatal(e) => Self::Backend(e.to_string()),
            RetryError::Exhausted(e) => Self::Backend(format!("retries exhausted: {e}")),
        }
    }
}

/// Drives desired state into the infrastructure backend
pub struct ReconcileEngine {
    store: Arc<ResourceStore>,
    tracker: Arc<OperationTracker>,
    backend: Arc<dyn InfraBackend>,
    config: EngineConfig,
}

impl ReconcileEngine {
    /// Create an engine over the given store, tracker, and backend
    pub fn new(
        store: Arc<ResourceStore>,
        tracker: Arc<OperationTracker>,
        backend: Arc<dyn InfraBackend>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            tracker,
            backend,
            config,
        }
    }

    /// Run the engine until shutdown is requested
    ///
    /// Pending operations on different resources execute concurrently; the
    /// per-resource lock already guarantees no two operations contend for
    /// the same resource.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(tick = ?self.config.tick_interval, "Reconciliation engine started");
        let mut tick = tokio::time::interval(self.config.tick_interval);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.tracker.admitted() => {}
                _ = tick.tick() => {}
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }

            while let Some(op) = self.tracker.claim_pending() {
                let engine = self.clone();
                in_flight.spawn(async move { engine.execute(op).await });
            }
        }

        // Let claimed operations finish; new claims stop with the loop
        while in_flight.join_next().await.is_some() {}
        info!("Reconciliation engine stopped");
    }

    /// Drain all currently pending operations serially
    ///
    /// Deterministic alternative to [`run`](Self::run) for embedding in
    /// tests: returns once every operation that was pending at entry has
    /// reached a terminal state.
    pub async fn step(&self) -> usize {
        let mut processed = 0;
        while let Some(op) = self.tracker.claim_pending() {
            self.execute(op).await;
            processed += 1;
        }
        processed
    }

    #[instrument(skip_all, fields(operation = %op.id, target = %op.target, kind = %op.kind))]
    async fn execute(&self, op: Operation) {
        let cancel = self.tracker.cancellation(&op.id);

        let result = match (&op.target, op.kind) {
            (ResourceName::Cluster(name), OperationKind::Delete) => {
                self.teardown_cluster(name, &cancel).await
            }
            (ResourceName::Cluster(name), _) => self.apply_cluster(name, &op, &cancel).await,
            (ResourceName::NodePool(name), OperationKind::Delete) => {
                self.teardown_node_pool(name, &cancel).await
            }
            (ResourceName::NodePool(name), _) => self.apply_node_pool(name, &op, &cancel).await,
        };

        let outcome = match result {
            Ok(()) => self.tracker.finish(&op.id, None),
            Err(Failure::Cancelled) => {
                info!("Operation cancelled between attempts");
                if let Err(e) = self
                    .store
                    .settle_cancelled(&op.target, "mutation cancelled by caller")
                {
                    debug!(error = %e, "No resource to settle after cancel");
                }
                self.tracker
                    .finish(&op.id, Some("cancelled by caller".to_string()))
            }
            Err(Failure::Backend(detail)) => {
                warn!(detail = %detail, "Operation aborted");
                if let Err(e) = self.store.settle_failed(&op.target, &detail) {
                    debug!(error = %e, "No resource to settle after failure");
                }
                self.tracker.finish(&op.id, Some(detail))
            }
            Err(Failure::Vanished(detail)) => {
                error!(detail = %detail, "Operation target vanished");
                self.tracker.finish(&op.id, Some(detail))
            }
        };

        match outcome {
            Ok(finished) => debug!(state = %finished.state, "Operation finished"),
            Err(e) => error!(error = %e, "Failed to record terminal state"),
        }
    }

    async fn apply_cluster(
        &self,
        name: &ClusterName,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        let current = self
            .store
            .get_cluster(name)
            .map_err(|e| Failure::Vanished(e.to_string()))?;

        // Already converged at this version: duplicate admission or engine
        // restart. No backend call.
        if current.applied_version >= op.target_version {
            debug!("Cluster already converged, skipping backend apply");
            return Ok(());
        }

        let spec = current.spec.clone();
        retry_with_backoff(&self.config.retry, "apply_cluster", cancel, || {
            self.backend.apply_cluster(name, &spec)
        })
        .await?;

        self.store
            .settle_cluster(name, ResourceStatus::Running, None, Some(op.target_version))
            .map_err(|e| Failure::Vanished(e.to_string()))?;
        info!(version = op.target_version, "Cluster converged");
        Ok(())
    }

    async fn teardown_cluster(
        &self,
        name: &ClusterName,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        retry_with_backoff(&self.config.retry, "teardown_cluster", cancel, || {
            self.backend.teardown_cluster(name)
        })
        .await?;

        self.store.remove_cluster(name);
        info!("Cluster deleted");
        Ok(())
    }

    async fn apply_node_pool(
        &self,
        name: &NodePoolName,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        let current = self
            .store
            .get_node_pool(name)
            .map_err(|e| Failure::Vanished(e.to_string()))?;

        if current.applied_version >= op.target_version {
            debug!("Node pool already converged, skipping backend apply");
            return Ok(());
        }

        let spec = current.spec.clone();
        retry_with_backoff(&self.config.retry, "apply_node_pool", cancel, || {
            self.backend.apply_node_pool(name, &spec)
        })
        .await?;

        self.store
            .settle_node_pool(name, ResourceStatus::Running, None, Some(op.target_version))
            .map_err(|e| Failure::Vanished(e.to_string()))?;
        info!(version = op.target_version, nodes = spec.node_count, "Node pool converged");
        Ok(())
    }

    async fn teardown_node_pool(
        &self,
        name: &NodePoolName,
        cancel: &CancellationToken,
    ) -> Result<(), Failure> {
        retry_with_backoff(&self.config.retry, "teardown_node_pool", cancel, || {
            self.backend.teardown_node_pool(name)
        })
        .await?;

        self.store.remove_node_pool(name);
        info!("Node pool deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{
        CreateClusterRequest, CreateNodePoolRequest, DeleteNodePoolRequest, Router,
        UpdateClusterRequest,
    };
    use crate::backend::{BackendError, MockInfraBackend, SimulatedBackend};
    use crate::operation::OperationState;
    use crate::resource::{ClusterSpec, NodePoolSpec};
    use crate::Error;

    struct Harness {
        store: Arc<ResourceStore>,
        tracker: Arc<OperationTracker>,
        router: Router,
        backend: Arc<SimulatedBackend>,
        engine: ReconcileEngine,
    }

    fn harness() -> Harness {
        let store = Arc::new(ResourceStore::new());
        let tracker = Arc::new(OperationTracker::new());
        let backend = Arc::new(SimulatedBackend::new());
        let router = Router::new(store.clone(), tracker.clone());
        let engine = ReconcileEngine::new(
            store.clone(),
            tracker.clone(),
            backend.clone(),
            EngineConfig {
                tick_interval: Duration::from_millis(10),
                retry: RetryConfig {
                    max_attempts: 3,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    backoff_multiplier: 2.0,
                },
            },
        );
        Harness {
            store,
            tracker,
            router,
            backend,
            engine,
        }
    }

    fn cluster_name() -> ClusterName {
        ClusterName::new("acme", "us-west1", "prod").unwrap()
    }

    fn pool_name() -> NodePoolName {
        cluster_name().node_pool("default-pool").unwrap()
    }

    async fn provision_cluster(h: &Harness) {
        h.router
            .create_cluster(CreateClusterRequest {
                name: cluster_name(),
                spec: ClusterSpec::with_master_version("1.31.2"),
            })
            .unwrap();
        assert_eq!(h.engine.step().await, 1);
    }

    /// Story: a created cluster converges to Running with the spec applied
    #[tokio::test]
    async fn story_create_converges_to_running() {
        let h = harness();
        let op = h
            .router
            .create_cluster(CreateClusterRequest {
                name: cluster_name(),
                spec: ClusterSpec::with_master_version("1.31.2"),
            })
            .unwrap();

        h.engine.step().await;

        let finished = h.tracker.get(&op.id).unwrap();
        assert_eq!(finished.state, OperationState::Done);
        assert!(finished.finished_at.is_some());

        let cluster = h.store.get_cluster(&cluster_name()).unwrap();
        assert_eq!(cluster.status, ResourceStatus::Running);
        assert_eq!(cluster.applied_version, 1);
        assert_eq!(
            h.backend
                .applied_cluster(&cluster_name())
                .unwrap()
                .master_version,
            "1.31.2"
        );
    }

    /// Story: transient outages are retried behind the operation, invisibly
    /// to the caller
    #[tokio::test]
    async fn story_transient_failures_retried_to_success() {
        let h = harness();
        h.backend.inject_transient_failures(2);

        h.router
            .create_cluster(CreateClusterRequest {
                name: cluster_name(),
                spec: ClusterSpec::with_master_version("1.31.2"),
            })
            .unwrap();
        h.engine.step().await;

        let cluster = h.store.get_cluster(&cluster_name()).unwrap();
        assert_eq!(cluster.status, ResourceStatus::Running);
        // Two failed attempts plus the one that landed
        assert_eq!(h.backend.apply_calls(), 3);
    }

    /// Story: exhausting the retry bound aborts the operation and parks the
    /// resource in Error until a corrective mutation clears it
    #[tokio::test]
    async fn story_retry_exhaustion_aborts_then_corrective_update_recovers() {
        let h = harness();
        provision_cluster(&h).await;

        // Every attempt of the update fails
        h.backend.inject_transient_failures(3);
        let op = h
            .router
            .update_cluster(UpdateClusterRequest {
                name: cluster_name(),
                spec: ClusterSpec::with_master_version("1.32.0"),
                expected_version: None,
            })
            .unwrap()
            .operation()
            .unwrap();
        h.engine.step().await;

        let aborted = h.tracker.get(&op.id).unwrap();
        assert_eq!(aborted.state, OperationState::Aborted);
        assert!(aborted
            .error_detail
            .as_deref()
            .unwrap()
            .contains("retries exhausted"));

        let cluster = h.store.get_cluster(&cluster_name()).unwrap();
        assert_eq!(cluster.status, ResourceStatus::Error);

        // Corrective update clears the error and converges
        let op = h
            .router
            .update_cluster(UpdateClusterRequest {
                name: cluster_name(),
                spec: ClusterSpec::with_master_version("1.32.0"),
                expected_version: None,
            })
            .unwrap()
            .operation()
            .unwrap();
        h.engine.step().await;

        assert_eq!(h.tracker.get(&op.id).unwrap().state, OperationState::Done);
        let cluster = h.store.get_cluster(&cluster_name()).unwrap();
        assert_eq!(cluster.status, ResourceStatus::Running);
        assert_eq!(cluster.spec.master_version, "1.32.0");
    }

    /// Story: fatal backend errors abort without burning the retry budget
    #[tokio::test]
    async fn story_fatal_error_short_circuits() {
        let h = harness();
        h.backend
            .inject_failure(BackendError::fatal("machine type not offered in region"));

        let op = h
            .router
            .create_cluster(CreateClusterRequest {
                name: cluster_name(),
                spec: ClusterSpec::with_master_version("1.31.2"),
            })
            .unwrap();
        h.engine.step().await;

        let aborted = h.tracker.get(&op.id).unwrap();
        assert_eq!(aborted.state, OperationState::Aborted);
        assert!(aborted
            .error_detail
            .as_deref()
            .unwrap()
            .contains("machine type not offered"));
        // Exactly one attempt
        assert_eq!(h.backend.apply_calls(), 1);
    }

    /// Story: a duplicate of a converged mutation makes no backend call
    #[tokio::test]
    async fn story_converged_resource_is_not_reapplied() {
        let h = harness();
        provision_cluster(&h).await;
        assert_eq!(h.backend.apply_calls(), 1);

        // Same spec again: admission short-circuits, engine never runs
        let admission = h
            .router
            .update_cluster(UpdateClusterRequest {
                name: cluster_name(),
                spec: ClusterSpec::with_master_version("1.31.2"),
                expected_version: None,
            })
            .unwrap();
        assert!(admission.operation().is_none());
        assert_eq!(h.engine.step().await, 0);
        assert_eq!(h.backend.apply_calls(), 1);
    }

    /// Story: deleting a node pool tears down infrastructure and removes the
    /// document
    #[tokio::test]
    async fn story_delete_removes_pool() {
        let h = harness();
        provision_cluster(&h).await;
        h.router
            .create_node_pool(CreateNodePoolRequest {
                name: pool_name(),
                spec: NodePoolSpec::fixed("n2-standard-4", 3),
            })
            .unwrap();
        h.engine.step().await;

        let op = h
            .router
            .delete_node_pool(DeleteNodePoolRequest {
                name: pool_name(),
                expected_version: None,
            })
            .unwrap();
        h.engine.step().await;

        assert_eq!(h.tracker.get(&op.id).unwrap().state, OperationState::Done);
        assert!(matches!(
            h.store.get_node_pool(&pool_name()),
            Err(Error::NotFound(_))
        ));
        assert!(h.backend.applied_node_pool(&pool_name()).is_none());
    }

    /// Story: cancellation between attempts reverts a previously converged
    /// resource to Running
    #[tokio::test]
    async fn story_cancel_mid_retry_reverts_to_last_stable() {
        let h = harness();
        provision_cluster(&h).await;

        // The update will fail transiently forever; cancel after claiming
        h.backend.inject_transient_failures(3);
        let op = h
            .router
            .update_cluster(UpdateClusterRequest {
                name: cluster_name(),
                spec: ClusterSpec::with_master_version("1.32.0"),
                expected_version: None,
            })
            .unwrap()
            .operation()
            .unwrap();

        // Trip the token before the engine touches the operation; the
        // engine checks it ahead of the first attempt
        let claimed = h.tracker.claim_pending().unwrap();
        h.tracker.cancel(&claimed.id).unwrap();
        h.engine.execute(claimed).await;

        let aborted = h.tracker.get(&op.id).unwrap();
        assert_eq!(aborted.state, OperationState::Aborted);
        assert_eq!(
            aborted.error_detail.as_deref(),
            Some("cancelled by caller")
        );

        // The cluster converged at version 1 earlier, so it reverts to
        // Running instead of Error
        let cluster = h.store.get_cluster(&cluster_name()).unwrap();
        assert_eq!(cluster.status, ResourceStatus::Running);
        assert_eq!(cluster.applied_version, 1);
        // No attempt ran
        assert_eq!(h.backend.apply_calls(), 1);
    }

    /// Story: mock-level check that the engine passes the desired spec
    /// through to the backend verbatim
    #[tokio::test]
    async fn story_engine_passes_desired_spec_to_backend() {
        let store = Arc::new(ResourceStore::new());
        let tracker = Arc::new(OperationTracker::new());
        let router = Router::new(store.clone(), tracker.clone());

        let mut mock = MockInfraBackend::new();
        mock.expect_apply_node_pool()
            .withf(|name, spec| name.pool() == "gpu" && spec.node_count == 4)
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_apply_cluster().returning(|_, _| Ok(()));

        let engine = ReconcileEngine::new(
            store.clone(),
            tracker.clone(),
            Arc::new(mock),
            EngineConfig::default(),
        );

        router
            .create_cluster(CreateClusterRequest {
                name: cluster_name(),
                spec: ClusterSpec::with_master_version("1.31.2"),
            })
            .unwrap();
        engine.step().await;

        router
            .create_node_pool(CreateNodePoolRequest {
                name: cluster_name().node_pool("gpu").unwrap(),
                spec: NodePoolSpec::fixed("a2-highgpu-1g", 4),
            })
            .unwrap();
        engine.step().await;
    }
}
