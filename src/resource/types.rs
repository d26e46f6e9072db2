//! Supporting types shared by cluster and node pool specs

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Observed lifecycle status of a resource
///
/// Status communicates what the reconciliation engine has actually done,
/// as opposed to the desired spec recorded at admission. Reads are lock-free
/// and may observe a resource mid-reconciliation.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ResourceStatus {
    /// Initial provisioning is in progress
    #[default]
    Provisioning,
    /// Resource is converged and serving
    Running,
    /// An admitted mutation is being driven toward the new desired spec
    Reconciling,
    /// Deletion is in progress; no further mutations are admitted
    Stopping,
    /// The last operation aborted; an explicit corrective mutation clears this
    Error,
}

impl ResourceStatus {
    /// Returns true if the resource admits new mutations in this status
    ///
    /// `Error` admits only corrective mutations, which is enforced at
    /// admission per request kind; `Stopping` admits none.
    pub fn accepts_mutations(&self) -> bool {
        !matches!(self, Self::Stopping)
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "PROVISIONING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Reconciling => write!(f, "RECONCILING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for ResourceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PROVISIONING" => Ok(Self::Provisioning),
            "RUNNING" => Ok(Self::Running),
            "RECONCILING" => Ok(Self::Reconciling),
            "STOPPING" => Ok(Self::Stopping),
            "ERROR" => Ok(Self::Error),
            _ => Err(Error::invalid_argument(format!(
                "invalid status '{s}', expected one of: \
                 PROVISIONING, RUNNING, RECONCILING, STOPPING, ERROR"
            ))),
        }
    }
}

/// Network policy provider
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum NetworkPolicyProvider {
    /// Calico network policy enforcement
    #[default]
    Calico,
    /// Cilium network policy enforcement
    Cilium,
}

impl std::fmt::Display for NetworkPolicyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Calico => write!(f, "calico"),
            Self::Cilium => write!(f, "cilium"),
        }
    }
}

/// Cluster-level network policy configuration
///
/// Replaced wholesale on update, never partially mutated.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NetworkPolicy {
    /// Enforcement provider
    pub provider: NetworkPolicyProvider,
    /// Whether policy enforcement is enabled
    pub enabled: bool,
}

impl NetworkPolicy {
    /// An enabled policy with the given provider
    pub fn enabled(provider: NetworkPolicyProvider) -> Self {
        Self {
            provider,
            enabled: true,
        }
    }
}

/// Node pool autoscaling bounds
///
/// Replaced wholesale on update, never partially mutated.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Autoscaling {
    /// Whether the autoscaler manages this pool's node count
    pub enabled: bool,
    /// Lower bound on the node count
    pub min_node_count: u32,
    /// Upper bound on the node count
    pub max_node_count: u32,
}

impl Autoscaling {
    /// Enabled autoscaling with the given bounds
    pub fn bounds(min_node_count: u32, max_node_count: u32) -> Self {
        Self {
            enabled: true,
            min_node_count,
            max_node_count,
        }
    }

    /// Validate the bounds
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_node_count == 0 {
            return Err(Error::invalid_argument(
                "autoscaling max_node_count must be at least 1",
            ));
        }
        if self.min_node_count > self.max_node_count {
            return Err(Error::invalid_argument(format!(
                "autoscaling min_node_count {} exceeds max_node_count {}",
                self.min_node_count, self.max_node_count
            )));
        }
        Ok(())
    }

    /// Clamp a demanded node count to the configured bounds
    pub fn clamp(&self, demanded: u32) -> u32 {
        demanded.clamp(self.min_node_count, self.max_node_count)
    }
}

/// Node management flags for a pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeManagement {
    /// Automatically repair failed nodes
    pub auto_repair: bool,
    /// Automatically upgrade node software
    pub auto_upgrade: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: statuses parse from their wire form and back
    #[test]
    fn story_status_round_trips_through_strings() {
        for status in [
            ResourceStatus::Provisioning,
            ResourceStatus::Running,
            ResourceStatus::Reconciling,
            ResourceStatus::Stopping,
            ResourceStatus::Error,
        ] {
            let parsed: ResourceStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }

        assert!("running".parse::<ResourceStatus>().is_err());
    }

    /// Story: a stopping resource admits no further mutations
    #[test]
    fn story_stopping_blocks_mutations() {
        assert!(!ResourceStatus::Stopping.accepts_mutations());
        assert!(ResourceStatus::Running.accepts_mutations());
        assert!(ResourceStatus::Error.accepts_mutations());
    }

    /// Story: inverted autoscaling bounds are rejected before admission
    #[test]
    fn story_inverted_autoscaling_bounds_rejected() {
        let err = Autoscaling::bounds(5, 2).validate().unwrap_err();
        assert!(err.to_string().contains("min_node_count 5"));

        assert!(Autoscaling::bounds(1, 3).validate().is_ok());
        assert!(Autoscaling::bounds(2, 2).validate().is_ok());
    }

    /// Story: a zero max is meaningless for an enabled autoscaler
    #[test]
    fn story_zero_max_rejected_when_enabled() {
        let autoscaling = Autoscaling {
            enabled: true,
            min_node_count: 0,
            max_node_count: 0,
        };
        assert!(autoscaling.validate().is_err());

        // Disabled autoscaling skips bounds validation entirely
        let disabled = Autoscaling::default();
        assert!(disabled.validate().is_ok());
    }

    /// Story: demanded counts clamp into the configured window
    #[test]
    fn story_clamping_respects_bounds() {
        let autoscaling = Autoscaling::bounds(1, 3);
        assert_eq!(autoscaling.clamp(0), 1);
        assert_eq!(autoscaling.clamp(2), 2);
        assert_eq!(autoscaling.clamp(5), 3);
    }
}
