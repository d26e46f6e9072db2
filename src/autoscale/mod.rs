//! Autoscaler policy evaluator
//!
//! Tick-driven, not event-driven: each tick reads every node pool's
//! autoscaling bounds and the observed load signal, clamps the demanded
//! node count into the configured window, and submits any change through
//! the admission router exactly as an external caller would. Going through
//! admission is what keeps the evaluator honest: it obeys the same
//! single-operation-per-resource invariant instead of bypassing the lock.
//!
//! Admission refusals are expected steady-state noise here. A pool with an
//! operation already in flight, or one that moved underneath the tick,
//! simply gets reconsidered on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::admission::{Admission, Router, UpdateNodePoolRequest};
use crate::resource::{NodePoolName, ResourceStatus};
use crate::store::ResourceStore;
use crate::Error;

/// Source of observed load per node pool
///
/// The real signal source (metrics pipeline, scheduler pressure) lives
/// outside the control plane; the evaluator only consumes its verdicts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadSignal: Send + Sync {
    /// Node count the observed load currently calls for, before clamping
    ///
    /// None means no signal is available for this pool; the evaluator
    /// leaves the pool alone.
    async fn observed_demand(&self, pool: &NodePoolName) -> Option<u32>;
}

/// Load signal backed by a settable in-memory table
///
/// Used by tests and local runs; demand stays fixed until overwritten.
#[derive(Default)]
pub struct StaticLoadSignal {
    demands: DashMap<String, u32>,
}

impl StaticLoadSignal {
    /// Create a signal with no demand entries
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the demanded node count for a pool
    pub fn set_demand(&self, pool: &NodePoolName, nodes: u32) {
        self.demands.insert(pool.to_string(), nodes);
    }

    /// Clear the demand entry for a pool
    pub fn clear_demand(&self, pool: &NodePoolName) {
        self.demands.remove(&pool.to_string());
    }
}

#[async_trait]
impl LoadSignal for StaticLoadSignal {
    async fn observed_demand(&self, pool: &NodePoolName) -> Option<u32> {
        self.demands.get(&pool.to_string()).map(|nodes| *nodes)
    }
}

/// Evaluator configuration
#[derive(Clone, Debug)]
pub struct EvaluatorConfig {
    /// Time between evaluation passes
    pub tick_interval: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
        }
    }
}

/// Recomputes node pool sizes from observed load on a fixed tick
pub struct Evaluator {
    store: Arc<ResourceStore>,
    router: Arc<Router>,
    signal: Arc<dyn LoadSignal>,
    config: EvaluatorConfig,
}

impl Evaluator {
    /// Create an evaluator reading pools from the store and mutating
    /// through the router
    pub fn new(
        store: Arc<ResourceStore>,
        router: Arc<Router>,
        signal: Arc<dyn LoadSignal>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            store,
            router,
            signal,
            config,
        }
    }

    /// Run the evaluator until shutdown is requested
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(tick = ?self.config.tick_interval, "Autoscaler evaluator started");
        let mut tick = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            self.tick().await;
        }
        info!("Autoscaler evaluator stopped");
    }

    /// One evaluation pass over every node pool
    ///
    /// Returns the number of mutations issued. Public so tests and
    /// embeddings can drive the evaluator deterministically.
    pub async fn tick(&self) -> usize {
        let mut issued = 0;

        for pool in self.store.node_pools_snapshot() {
            if !pool.spec.autoscaling.enabled {
                continue;
            }
            // Mid-reconciliation or errored pools are left alone; the next
            // tick sees them again once they settle
            if pool.status != ResourceStatus::Running {
                debug!(pool = %pool.name, status = %pool.status, "Skipping unsettled pool");
                continue;
            }
            let Some(demand) = self.signal.observed_demand(&pool.name).await else {
                continue;
            };

            let desired = pool.spec.autoscaling.clamp(demand);
            if desired == pool.spec.node_count {
                continue;
            }

            let mut spec = pool.spec.clone();
            spec.node_count = desired;
            match self.router.update_node_pool(UpdateNodePoolRequest {
                name: pool.name.clone(),
                spec,
                expected_version: Some(pool.version),
            }) {
                Ok(Admission::Accepted(op)) => {
                    info!(
                        pool = %pool.name,
                        demand,
                        desired,
                        previous = pool.spec.node_count,
                        operation = %op.id,
                        "Autoscaling mutation admitted"
                    );
                    issued += 1;
                }
                Ok(Admission::Unchanged(_)) => {}
                Err(Error::FailedPrecondition(reason)) => {
                    debug!(pool = %pool.name, %reason, "Pool busy, retrying next tick");
                }
                Err(Error::VersionConflict { .. }) => {
                    debug!(pool = %pool.name, "Pool moved underneath tick, retrying next tick");
                }
                Err(e) => {
                    warn!(pool = %pool.name, error = %e, "Autoscaling mutation rejected");
                }
            }
        }
        issued
    }
}
