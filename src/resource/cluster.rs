//! Cluster resource model

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::name::ClusterName;
use super::types::{NetworkPolicy, ResourceStatus};
use crate::{Error, Result};

/// Desired specification of a cluster
///
/// Owned exclusively by the resource store; mutated only through admitted
/// operations, each of which bumps the version token exactly once.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterSpec {
    /// Control plane version to run (e.g., "1.31.2")
    pub master_version: String,

    /// Cluster-level network policy configuration
    #[serde(default)]
    pub network_policy: NetworkPolicy,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Free-form resource labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ClusterSpec {
    /// A minimal spec running the given control plane version
    pub fn with_master_version(version: impl Into<String>) -> Self {
        Self {
            master_version: version.into(),
            network_policy: NetworkPolicy::default(),
            description: None,
            labels: BTreeMap::new(),
        }
    }

    /// Validate the spec's field constraints
    pub fn validate(&self) -> Result<()> {
        if self.master_version.is_empty() {
            return Err(Error::invalid_argument("master_version must not be empty"));
        }
        Ok(())
    }
}

/// A cluster snapshot as returned by the query surface
///
/// Combines identity, desired spec, observed status, and the concurrency
/// bookkeeping callers need to issue conditional mutations.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Cluster {
    /// Canonical name
    pub name: ClusterName,
    /// Desired specification
    pub spec: ClusterSpec,
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
