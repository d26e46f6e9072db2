//! Resource model for the Pylon control plane
//!
//! Resources are identified by a single canonical name and carry a desired
//! spec alongside observed status. Specs embed immutable value objects
//! (network policy, autoscaling bounds, node management flags) that are
//! replaced wholesale on update, never partially mutated.

mod cluster;
mod name;
mod node_pool;
mod types;

pub use cluster::{Cluster, ClusterSpec};
pub use name::{ClusterName, NodePoolName, ResourceName};
pub use node_pool::{NodePool, NodePoolSpec};
pub use types::{
    Autoscaling, NetworkPolicy, NetworkPolicyProvider, NodeManagement, ResourceStatus,
};
