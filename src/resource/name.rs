//! Canonical resource names
//!
//! Every resource is identified by exactly one canonical name:
//!
//! - Clusters: `projects/{project}/locations/{location}/clusters/{cluster}`
//! - Node pools: `projects/{project}/locations/{location}/clusters/{cluster}/nodePools/{pool}`
//!
//! Names are parsed and validated once at the edge; the rest of the system
//! passes the typed forms around and never re-splits strings.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Maximum length of a single name segment
const MAX_SEGMENT_LEN: usize = 63;

/// Validate a single name segment: lowercase alphanumeric plus hyphens,
/// starting and ending with an alphanumeric character.
fn validate_segment(segment: &str, field: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::invalid_argument(format!("{field} must not be empty")));
    }
    if segment.len() > MAX_SEGMENT_LEN {
        return Err(Error::invalid_argument(format!(
            "{field} '{segment}' exceeds {MAX_SEGMENT_LEN} characters"
        )));
    }
    let valid_chars = segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars {
        return Err(Error::invalid_argument(format!(
            "{field} '{segment}' may only contain lowercase letters, digits, and hyphens"
        )));
    }
    if segment.starts_with('-') || segment.ends_with('-') {
        return Err(Error::invalid_argument(format!(
            "{field} '{segment}' must not start or end with a hyphen"
        )));
    }
    Ok(())
}

/// Canonical name of a cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterName {
    project: String,
    location: String,
    cluster: String,
}

impl ClusterName {
    /// Create a cluster name from its segments, validating each
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Result<Self> {
        let project = project.into();
        let location = location.into();
        let cluster = cluster.into();
        validate_segment(&project, "project")?;
        validate_segment(&location, "location")?;
        validate_segment(&cluster, "cluster")?;
        Ok(Self {
            project,
            location,
            cluster,
        })
    }

    /// Parse a canonical cluster name string
    pub fn parse(name: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "locations", location, "clusters", cluster] => {
                Self::new(*project, *location, *cluster)
            }
            _ => Err(Error::invalid_argument(format!(
                "'{name}' is not a cluster name \
                 (expected projects/*/locations/*/clusters/*)"
            ))),
        }
    }

    /// The project segment
    pub fn project(&self) -> &str {
        &self.project
    }

    /// The location segment
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The cluster segment
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The parent collection this cluster lives under
    pub fn parent(&self) -> String {
        format!("projects/{}/locations/{}", self.project, self.location)
    }

    /// Name of a node pool under this cluster
    pub fn node_pool(&self, pool: impl Into<String>) -> Result<NodePoolName> {
        NodePoolName::new(self.clone(), pool)
    }
}

impl std::fmt::Display for ClusterName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "projects/{}/locations/{}/clusters/{}",
            self.project, self.location, self.cluster
        )
    }
}

impl std::str::FromStr for ClusterName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Canonical name of a node pool
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodePoolName {
    cluster: ClusterName,
    pool: String,
}

impl NodePoolName {
    /// Create a node pool name under the given cluster, validating the pool segment
    pub fn new(cluster: ClusterName, pool: impl Into<String>) -> Result<Self> {
        let pool = pool.into();
        validate_segment(&pool, "node pool")?;
        Ok(Self { cluster, pool })
    }

    /// Parse a canonical node pool name string
    pub fn parse(name: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "locations", location, "clusters", cluster, "nodePools", pool] => {
                Self::new(ClusterName::new(*project, *location, *cluster)?, *pool)
            }
            _ => Err(Error::invalid_argument(format!(
                "'{name}' is not a node pool name \
                 (expected projects/*/locations/*/clusters/*/nodePools/*)"
            ))),
        }
    }

    /// The parent cluster's name
    pub fn cluster(&self) -> &ClusterName {
        &self.cluster
    }

    /// The pool segment
    pub fn pool(&self) -> &str {
        &self.pool
    }
}

impl std::fmt::Display for NodePoolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/nodePools/{}", self.cluster, self.pool)
    }
}

impl std::str::FromStr for NodePoolName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A reference to either resource kind, used as an operation target
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceName {
    /// A cluster
    Cluster(ClusterName),
    /// A node pool
    NodePool(NodePoolName),
}

impl ResourceName {
    /// Parse a canonical resource name of either kind
    pub fn parse(name: &str) -> Result<Self> {
        if name.contains("/nodePools/") {
            Ok(Self::NodePool(NodePoolName::parse(name)?))
        } else {
            Ok(Self::Cluster(ClusterName::parse(name)?))
        }
    }

    /// The cluster this resource belongs to (itself, for clusters)
    pub fn cluster(&self) -> &ClusterName {
        match self {
            Self::Cluster(name) => name,
            Self::NodePool(name) => name.cluster(),
        }
    }
}

impl From<ClusterName> for ResourceName {
    fn from(name: ClusterName) -> Self {
        Self::Cluster(name)
    }
}

impl From<NodePoolName> for ResourceName {
    fn from(name: NodePoolName) -> Self {
        Self::NodePool(name)
    }
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster(name) => name.fmt(f),
            Self::NodePool(name) => name.fmt(f),
        }
    }
}

// Names serialize as their canonical string form.

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(D::Error::custom)
            }
        }
    };
}

string_serde!(ClusterName);
string_serde!(NodePoolName);
string_serde!(ResourceName);

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: the canonical name round-trips through parse and display
    #[test]
    fn story_cluster_name_round_trips() {
        let name = ClusterName::parse("projects/acme/locations/us-west1/clusters/prod").unwrap();
        assert_eq!(name.project(), "acme");
        assert_eq!(name.location(), "us-west1");
        assert_eq!(name.cluster(), "prod");
        assert_eq!(
            name.to_string(),
            "projects/acme/locations/us-west1/clusters/prod"
        );
        assert_eq!(name.parent(), "projects/acme/locations/us-west1");
    }

    /// Story: node pool names nest under their cluster
    #[test]
    fn story_node_pool_name_round_trips() {
        let name = NodePoolName::parse(
            "projects/acme/locations/us-west1/clusters/prod/nodePools/default-pool",
        )
        .unwrap();
        assert_eq!(name.pool(), "default-pool");
        assert_eq!(name.cluster().cluster(), "prod");
        assert_eq!(
            name.to_string(),
            "projects/acme/locations/us-west1/clusters/prod/nodePools/default-pool"
        );
    }

    /// Story: malformed names are rejected with InvalidArgument, not panics
    #[test]
    fn story_malformed_names_are_invalid_argument() {
        let cases = [
            "",
            "projects/acme",
            "projects/acme/locations/us-west1",
            "projects/acme/locations/us-west1/clusters/",
            "clusters/prod",
            "projects/acme/locations/us-west1/clusters/prod/extra",
            "projects//locations/us-west1/clusters/prod",
        ];
        for case in cases {
            let err = ClusterName::parse(case).unwrap_err();
            assert!(
                matches!(err, Error::InvalidArgument(_)),
                "expected InvalidArgument for {case:?}, got {err:?}"
            );
        }
    }

    /// Story: segments follow DNS-label rules
    #[test]
    fn story_segment_character_rules() {
        assert!(ClusterName::new("acme", "us-west1", "prod-01").is_ok());
        assert!(ClusterName::new("acme", "us-west1", "Prod").is_err());
        assert!(ClusterName::new("acme", "us-west1", "-prod").is_err());
        assert!(ClusterName::new("acme", "us-west1", "prod-").is_err());
        assert!(ClusterName::new("acme", "us_west1", "prod").is_err());
        assert!(ClusterName::new("acme", "us-west1", "a".repeat(64)).is_err());
    }

    /// Story: a mixed reference parses to the right kind
    #[test]
    fn story_resource_name_dispatches_on_kind() {
        let cluster = ResourceName::parse("projects/acme/locations/us-west1/clusters/prod");
        assert!(matches!(cluster, Ok(ResourceName::Cluster(_))));

        let pool =
            ResourceName::parse("projects/acme/locations/us-west1/clusters/prod/nodePools/gpu");
        assert!(matches!(pool, Ok(ResourceName::NodePool(_))));
    }

    /// Story: names serialize as canonical strings for the wire
    #[test]
    fn story_names_serialize_as_strings() {
        let name = ClusterName::parse("projects/acme/locations/us-west1/clusters/prod").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"projects/acme/locations/us-west1/clusters/prod\"");

        let back: ClusterName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }
}
