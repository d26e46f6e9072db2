//! Infrastructure provisioning backend abstraction
//!
//! This module provides a trait-based abstraction for the compute backend
//! the reconciliation engine drives. The engine treats it as an injected
//! capability: apply a desired spec, or tear a resource down. Real transport
//! to a cloud provider lives behind this seam; the crate ships a
//! [`SimulatedBackend`] for tests and local runs.

mod simulated;

pub use simulated::SimulatedBackend;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::resource::{ClusterName, ClusterSpec, NodePoolName, NodePoolSpec};
use crate::retry::Transient;

/// Failure from the infrastructure backend
///
/// The distinction drives the reconciliation engine's retry decision:
/// transient failures are retried with backoff, fatal failures abort the
/// operation immediately.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    /// The backend may succeed on a later attempt (timeout, brief outage)
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Retrying would repeat the same failure (quota, unsupported request)
    #[error("fatal backend failure: {0}")]
    Fatal(String),
}

impl BackendError {
    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a fatal error with the given message
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

impl Transient for BackendError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The compute operations the reconciliation engine drives
///
/// Implementations must be idempotent per call: applying a spec the backend
/// already converged on, or tearing down something already gone, succeeds.
/// The engine relies on this when an aborted operation is retried by a
/// corrective mutation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraBackend: Send + Sync {
    /// Drive cluster infrastructure to the given desired spec
    async fn apply_cluster(
        &self,
        name: &ClusterName,
        spec: &ClusterSpec,
    ) -> Result<(), BackendError>;

    /// Tear down cluster infrastructure, including its node pools
    async fn teardown_cluster(&self, name: &ClusterName) -> Result<(), BackendError>;

    /// Drive node pool infrastructure to the given desired spec
    async fn apply_node_pool(
        &self,
        name: &NodePoolName,
        spec: &NodePoolSpec,
    ) -> Result<(), BackendError>;

    /// Tear down node pool infrastructure
    async fn teardown_node_pool(&self, name: &NodePoolName) -> Result<(), BackendError>;
}
