//! Simulated infrastructure backend
//!
//! Keeps a journal of applied specs and counts every call, so tests can
//! assert idempotence (no duplicate applies) and failure handling. Failures
//! are injected through a FIFO queue: each queued error is consumed by one
//! call, after which calls succeed again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{BackendError, InfraBackend};
use crate::resource::{ClusterName, ClusterSpec, NodePoolName, NodePoolSpec};

/// In-memory backend standing in for a real compute provider
#[derive(Default)]
pub struct SimulatedBackend {
    clusters: DashMap<String, ClusterSpec>,
    pools: DashMap<String, NodePoolSpec>,
    injected_failures: Mutex<VecDeque<BackendError>>,
    apply_calls: AtomicU32,
    teardown_calls: AtomicU32,
}

impl SimulatedBackend {
    /// Create a backend with no provisioned state and no injected failures
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error to be returned by the next backend call
    ///
    /// Queued errors are consumed in FIFO order, one per call.
    pub fn inject_failure(&self, error: BackendError) {
        self.injected_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(error);
    }

    /// Queue `count` transient failures
    pub fn inject_transient_failures(&self, count: u32) {
        for _ in 0..count {
            self.inject_failure(BackendError::transient("injected outage"));
        }
    }

    /// Total apply calls observed across both resource kinds
    pub fn apply_calls(&self) -> u32 {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Total teardown calls observed across both resource kinds
    pub fn teardown_calls(&self) -> u32 {
        self.teardown_calls.load(Ordering::SeqCst)
    }

    /// The last spec applied for the given node pool, if any
    pub fn applied_node_pool(&self, name: &NodePoolName) -> Option<NodePoolSpec> {
        self.pools.get(&name.to_string()).map(|spec| spec.clone())
    }

    /// The last spec applied for the given cluster, if any
    pub fn applied_cluster(&self, name: &ClusterName) -> Option<ClusterSpec> {
        self.clusters.get(&name.to_string()).map(|spec| spec.clone())
    }

    fn take_failure(&self) -> Option<BackendError> {
        self.injected_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    fn checkpoint(&self, call: &str) -> Result<(), BackendError> {
        if let Some(error) = self.take_failure() {
            debug!(call = %call, error = %error, "Injected failure consumed");
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl InfraBackend for SimulatedBackend {
    async fn apply_cluster(
        &self,
        name: &ClusterName,
        spec: &ClusterSpec,
    ) -> Result<(), BackendError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.checkpoint("apply_cluster")?;
        self.clusters.insert(name.to_string(), spec.clone());
        debug!(cluster = %name, "Simulated cluster apply");
        Ok(())
    }

    async fn teardown_cluster(&self, name: &ClusterName) -> Result<(), BackendError> {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        self.checkpoint("teardown_cluster")?;
        self.clusters.remove(&name.to_string());
        let prefix = format!("{name}/nodePools/");
        self.pools.retain(|key, _| !key.starts_with(&prefix));
        debug!(cluster = %name, "Simulated cluster teardown");
        Ok(())
    }

    async fn apply_node_pool(
        &self,
        name: &NodePoolName,
        spec: &NodePoolSpec,
    ) -> Result<(), BackendError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.checkpoint("apply_node_pool")?;
        self.pools.insert(name.to_string(), spec.clone());
        debug!(pool = %name, nodes = spec.node_count, "Simulated node pool apply");
        Ok(())
    }

    async fn teardown_node_pool(&self, name: &NodePoolName) -> Result<(), BackendError> {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        self.checkpoint("teardown_node_pool")?;
        self.pools.remove(&name.to_string());
        debug!(pool = %name, "Simulated node pool teardown");
        Ok(())
    }
}
