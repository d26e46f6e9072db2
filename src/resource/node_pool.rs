//! Node pool resource model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::name::NodePoolName;
use super::types::{Autoscaling, NodeManagement, ResourceStatus};
use crate::{Error, Result};

/// Desired specification of a node pool
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodePoolSpec {
    /// Machine type for the pool's nodes (e.g., "n2-standard-4")
    pub machine_type: String,

    /// Desired node count
    ///
    /// When autoscaling is enabled this is the count the evaluator last
    /// decided on; external callers may still set it directly, subject to
    /// the configured bounds.
    pub node_count: u32,

    /// Autoscaling bounds
    #[serde(default)]
    pub autoscaling: Autoscaling,

    /// Node management flags
    #[serde(default)]
    pub management: NodeManagement,
}

impl NodePoolSpec {
    /// A fixed-size pool of the given machine type
    pub fn fixed(machine_type: impl Into<String>, node_count: u32) -> Self {
        Self {
            machine_type: machine_type.into(),
            node_count,
            autoscaling: Autoscaling::default(),
            management: NodeManagement::default(),
        }
    }

    /// Validate the spec's field constraints
    ///
    /// The node count must sit within the autoscaling bounds when autoscaling
    /// is enabled; the evaluator only ever proposes counts inside the window,
    /// and external callers are held to the same rule.
    pub fn validate(&self) -> Result<()> {
        if self.machine_type.is_empty() {
            return Err(Error::invalid_argument("machine_type must not be empty"));
        }
        self.autoscaling.validate()?;
        if self.autoscaling.enabled
            && (self.node_count < self.autoscaling.min_node_count
                || self.node_count > self.autoscaling.max_node_count)
        {
            return Err(Error::invalid_argument(format!(
                "node_count {} outside autoscaling bounds [{}, {}]",
                self.node_count, self.autoscaling.min_node_count, self.autoscaling.max_node_count
            )));
        }
        Ok(())
    }
}

/// A node pool snapshot as returned by the query surface
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct NodePool {
    /// Canonical name
    pub name: NodePoolName,
    /// Desired specification
    pub spec: NodePoolSpec,
    /// Observed status
    pub status: ResourceStatus,
    /// Human-readable detail for the current status, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Version token; increments exactly once per admitted mutation
    pub version: u64,
    /// Version the infrastructure backend last converged on (0 = never)
    pub applied_version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}
