//! Versioned resource store with optimistic concurrency
//!
//! The store is the sole owner of resource documents. Every admitted
//! mutation replaces the desired spec and bumps the version token exactly
//! once; a `put` carrying a stale expected version fails with
//! `VersionConflict` and never mutates stored state. Reads are lock-free and
//! may observe a resource mid-reconciliation; the status field communicates
//! this.

mod list;

pub use list::{Filter, Page, PageRequest};

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;

use crate::resource::{
    Cluster, ClusterName, ClusterSpec, NodePool, NodePoolName, NodePoolSpec, ResourceName,
    ResourceStatus,
};
use crate::{Error, Result};

use list::PageToken;

/// A stored resource document: desired spec plus observed bookkeeping
#[derive(Clone, Debug)]
struct Document<S> {
    spec: S,
    status: ResourceStatus,
    status_message: Option<String>,
    version: u64,
    applied_version: u64,
    sequence: u64,
    created_at: chrono::DateTime<Utc>,
}

/// One typed table of documents keyed by canonical name
struct Table<K, S> {
    rows: DashMap<K, Document<S>>,
}

impl<K, S> Table<K, S>
where
    K: std::hash::Hash + Eq + Clone + std::fmt::Display,
    S: Clone,
{
    fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    fn insert(&self, key: K, spec: S, sequence: u64) -> Result<()> {
        match self.rows.entry(key) {
            dashmap::Entry::Occupied(entry) => Err(Error::failed_precondition(format!(
                "{} already exists",
                entry.key()
            ))),
            dashmap::Entry::Vacant(entry) => {
                entry.insert(Document {
                    spec,
                    status: ResourceStatus::Provisioning,
                    status_message: None,
                    version: 1,
                    applied_version: 0,
                    sequence,
                    created_at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    fn get(&self, key: &K) -> Result<Document<S>> {
        self.rows
            .get(key)
            .map(|doc| doc.clone())
            .ok_or_else(|| Error::not_found(format!("{key} does not exist")))
    }

    /// Replace the desired spec, bumping the version exactly once
    ///
    /// The expected version, when given, is checked under the row lock so a
    /// stale writer can never get its spec recorded.
    fn put(
        &self,
        key: &K,
        spec: S,
        expected_version: Option<u64>,
        status: ResourceStatus,
    ) -> Result<u64> {
        let mut doc = self
            .rows
            .get_mut(key)
            .ok_or_else(|| Error::not_found(format!("{key} does not exist")))?;
        if let Some(expected) = expected_version {
            if expected != doc.version {
                return Err(Error::version_conflict(expected, doc.version));
            }
        }
        doc.spec = spec;
        doc.version += 1;
        doc.status = status;
        doc.status_message = None;
        Ok(doc.version)
    }

    /// Settle observed state after reconciliation; no version bump
    fn settle(
        &self,
        key: &K,
        status: ResourceStatus,
        status_message: Option<String>,
        applied_version: Option<u64>,
    ) -> Result<()> {
        let mut doc = self
            .rows
            .get_mut(key)
            .ok_or_else(|| Error::not_found(format!("{key} does not exist")))?;
        doc.status = status;
        doc.status_message = status_message;
        if let Some(applied) = applied_version {
            doc.applied_version = applied;
        }
        Ok(())
    }

    /// Settle observed state after an aborted operation
    ///
    /// With `revert` set, a resource that converged at least once goes back
    /// to Running (its infrastructure is still the last applied spec);
    /// otherwise, or when it never converged, it lands in Error.
    fn settle_aborted(&self, key: &K, detail: &str, revert: bool) -> Result<()> {
        let mut doc = self
            .rows
            .get_mut(key)
            .ok_or_else(|| Error::not_found(format!("{key} does not exist")))?;
        doc.status = if revert && doc.applied_version > 0 {
            ResourceStatus::Running
        } else {
            ResourceStatus::Error
        };
        doc.status_message = Some(detail.to_string());
        Ok(())
    }

    fn remove(&self, key: &K) -> bool {
        self.rows.remove(key).is_some()
    }

    /// One deterministic page of rows under the caller's parent predicate
    fn page(
        &self,
        matches_parent: impl Fn(&K) -> bool,
        filter: Option<&Filter>,
        page: &PageRequest,
        ceiling_now: u64,
    ) -> (Vec<(K, Document<S>)>, Option<String>) {
        let (after, ceiling) = match page.token {
            Some(token) => (token.after, token.ceiling),
            None => (0, ceiling_now),
        };

        let mut rows: Vec<(K, Document<S>)> = self
            .rows
            .iter()
            .filter(|entry| {
                let doc = entry.value();
                doc.sequence > after
                    && doc.sequence <= ceiling
                    && matches_parent(entry.key())
                    && filter.map(|f| f.matches(doc.status)).unwrap_or(true)
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        rows.sort_by_key(|(_, doc)| doc.sequence);

        let next = if rows.len() > page.page_size {
            rows.truncate(page.page_size);
            rows.last().map(|(_, doc)| {
                PageToken {
                    after: doc.sequence,
                    ceiling,
                }
                .encode()
            })
        } else {
            None
        };
        (rows, next)
    }
}

/// Durable mapping of canonical resource name to versioned document
///
/// Holds clusters and node pools in separate typed tables that share one
/// creation-sequence counter, which provides the stable list order.
pub struct ResourceStore {
    clusters: Table<ClusterName, ClusterSpec>,
    pools: Table<NodePoolName, NodePoolSpec>,
    sequence: AtomicU64,
}

impl ResourceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            clusters: Table::new(),
            pools: Table::new(),
            sequence: AtomicU64::new(0),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn sequence_ceiling(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Clusters
    // ------------------------------------------------------------------

    /// Record a new cluster document in Provisioning status at version 1
    pub fn insert_cluster(&self, name: &ClusterName, spec: ClusterSpec) -> Result<Cluster> {
        let sequence = self.next_sequence();
        self.clusters.insert(name.clone(), spec, sequence)?;
        self.get_cluster(name)
    }

    /// Fetch a cluster snapshot
    pub fn get_cluster(&self, name: &ClusterName) -> Result<Cluster> {
        let doc = self.clusters.get(name)?;
        Ok(cluster_snapshot(name, doc))
    }

    /// Replace a cluster's desired spec, bumping its version exactly once
    pub fn put_cluster(
        &self,
        name: &ClusterName,
        spec: ClusterSpec,
        expected_version: Option<u64>,
        status: ResourceStatus,
    ) -> Result<u64> {
        self.clusters.put(name, spec, expected_version, status)
    }

    /// Settle a cluster's observed status after reconciliation
    pub fn settle_cluster(
        &self,
        name: &ClusterName,
        status: ResourceStatus,
        status_message: Option<String>,
        applied_version: Option<u64>,
    ) -> Result<()> {
        self.clusters
            .settle(name, status, status_message, applied_version)
    }

    /// Remove a cluster document and all node pool documents under it
    ///
    /// Cascading is what makes cluster teardown complete: pool documents
    /// must not outlive their parent.
    pub fn remove_cluster(&self, name: &ClusterName) -> bool {
        let pools: Vec<NodePoolName> = self
            .pools
            .rows
            .iter()
            .filter(|entry| entry.key().cluster() == name)
            .map(|entry| entry.key().clone())
            .collect();
        for pool in pools {
            self.pools.remove(&pool);
        }
        self.clusters.remove(name)
    }

    /// List clusters under `projects/{project}/locations/{location}`
    pub fn list_clusters(
        &self,
        project: &str,
        location: &str,
        filter: Option<&Filter>,
        page: &PageRequest,
    ) -> Page<Cluster> {
        let (rows, next_page_token) = self.clusters.page(
            |key| key.project() == project && key.location() == location,
            filter,
            page,
            self.sequence_ceiling(),
        );
        Page {
            items: rows
                .into_iter()
                .map(|(name, doc)| cluster_snapshot(&name, doc))
                .collect(),
            next_page_token,
        }
    }

    // ------------------------------------------------------------------
    // Node pools
    // ------------------------------------------------------------------

    /// Record a new node pool document in Provisioning status at version 1
    pub fn insert_node_pool(&self, name: &NodePoolName, spec: NodePoolSpec) -> Result<NodePool> {
        let sequence = self.next_sequence();
        self.pools.insert(name.clone(), spec, sequence)?;
        self.get_node_pool(name)
    }

    /// Fetch a node pool snapshot
    pub fn get_node_pool(&self, name: &NodePoolName) -> Result<NodePool> {
        let doc = self.pools.get(name)?;
        Ok(pool_snapshot(name, doc))
    }

    /// Replace a node pool's desired spec, bumping its version exactly once
    pub fn put_node_pool(
        &self,
        name: &NodePoolName,
        spec: NodePoolSpec,
        expected_version: Option<u64>,
        status: ResourceStatus,
    ) -> Result<u64> {
        self.pools.put(name, spec, expected_version, status)
    }

    /// Settle a node pool's observed status after reconciliation
    pub fn settle_node_pool(
        &self,
        name: &NodePoolName,
        status: ResourceStatus,
        status_message: Option<String>,
        applied_version: Option<u64>,
    ) -> Result<()> {
        self.pools
            .settle(name, status, status_message, applied_version)
    }

    /// Remove a node pool document
    pub fn remove_node_pool(&self, name: &NodePoolName) -> bool {
        self.pools.remove(name)
    }

    /// List node pools under the given cluster
    pub fn list_node_pools(
        &self,
        cluster: &ClusterName,
        filter: Option<&Filter>,
        page: &PageRequest,
    ) -> Page<NodePool> {
        let (rows, next_page_token) = self.pools.page(
            |key| key.cluster() == cluster,
            filter,
            page,
            self.sequence_ceiling(),
        );
        Page {
            items: rows
                .into_iter()
                .map(|(name, doc)| pool_snapshot(&name, doc))
                .collect(),
            next_page_token,
        }
    }

    // ------------------------------------------------------------------
    // Shared settle paths
    // ------------------------------------------------------------------

    /// Settle a resource whose operation aborted after a failed apply
    ///
    /// The resource lands in Error and stays there until an explicit
    /// corrective mutation clears it.
    pub fn settle_failed(&self, target: &ResourceName, detail: &str) -> Result<()> {
        match target {
            ResourceName::Cluster(name) => self.clusters.settle_aborted(name, detail, false),
            ResourceName::NodePool(name) => self.pools.settle_aborted(name, detail, false),
        }
    }

    /// Settle a resource whose operation was cancelled
    ///
    /// Reverts to Running when the resource converged at least once before
    /// (its infrastructure still matches the last applied spec); Error
    /// otherwise.
    pub fn settle_cancelled(&self, target: &ResourceName, detail: &str) -> Result<()> {
        match target {
            ResourceName::Cluster(name) => self.clusters.settle_aborted(name, detail, true),
            ResourceName::NodePool(name) => self.pools.settle_aborted(name, detail, true),
        }
    }

    /// Unpaged scan over every node pool, in creation order
    ///
    /// Internal read for the autoscaler's tick; external callers page
    /// through `list_node_pools` instead.
    pub fn node_pools_snapshot(&self) -> Vec<NodePool> {
        let mut rows: Vec<(NodePoolName, Document<NodePoolSpec>)> = self
            .pools
            .rows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        rows.sort_by_key(|(_, doc)| doc.sequence);
        rows.into_iter()
            .map(|(name, doc)| pool_snapshot(&name, doc))
            .collect()
    }
}

impl Default for ResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

fn cluster_snapshot(name: &ClusterName, doc: Document<ClusterSpec>) -> Cluster {
    Cluster {
        name: name.clone(),
        spec: doc.spec,
        status: doc.status,
        status_message: doc.status_message,
        version: doc.version,
        applied_version: doc.applied_version,
        created_at: doc.created_at,
    }
}

fn pool_snapshot(name: &NodePoolName, doc: Document<NodePoolSpec>) -> NodePool {
    NodePool {
        name: name.clone(),
        spec: doc.spec,
        status: doc.status,
        status_message: doc.status_message,
        version: doc.version,
        applied_version: doc.applied_version,
        created_at: doc.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_name(cluster: &str) -> ClusterName {
        ClusterName::new("acme", "us-west1", cluster).unwrap()
    }

    fn seeded_store(count: usize) -> ResourceStore {
        let store = ResourceStore::new();
        for i in 0..count {
            let name = cluster_name(&format!("cluster-{i:02}"));
            store
                .insert_cluster(&name, ClusterSpec::with_master_version("1.31.2"))
                .unwrap();
        }
        store
    }

    /// Versioning Tests
    ///
    /// Version tokens increment exactly once per mutation and guard
    /// against stale writers.
    mod versioning {
        use super::*;

        /// Story: a fresh document starts at version 1, never applied
        #[test]
        fn story_insert_starts_at_version_one() {
            let store = seeded_store(1);
            let cluster = store.get_cluster(&cluster_name("cluster-00")).unwrap();
            assert_eq!(cluster.version, 1);
            assert_eq!(cluster.applied_version, 0);
            assert_eq!(cluster.status, ResourceStatus::Provisioning);
        }

        /// Story: inserting over an existing name is refused
        #[test]
        fn story_duplicate_insert_fails() {
            let store = seeded_store(1);
            let err = store
                .insert_cluster(
                    &cluster_name("cluster-00"),
                    ClusterSpec::with_master_version("1.31.2"),
                )
                .unwrap_err();
            assert!(matches!(err, Error::FailedPrecondition(_)));
        }

        /// Story: each put bumps the version exactly once
        #[test]
        fn story_put_bumps_version_once() {
            let store = seeded_store(1);
            let name = cluster_name("cluster-00");
            let v2 = store
                .put_cluster(
                    &name,
                    ClusterSpec::with_master_version("1.32.0"),
                    Some(1),
                    ResourceStatus::Reconciling,
                )
                .unwrap();
            assert_eq!(v2, 2);
            let cluster = store.get_cluster(&name).unwrap();
            assert_eq!(cluster.version, 2);
            assert_eq!(cluster.spec.master_version, "1.32.0");
            assert_eq!(cluster.status, ResourceStatus::Reconciling);
        }

        /// Story: a stale expected version fails and mutates nothing
        #[test]
        fn story_stale_put_conflicts_without_mutation() {
            let store = seeded_store(1);
            let name = cluster_name("cluster-00");
            store
                .put_cluster(
                    &name,
                    ClusterSpec::with_master_version("1.32.0"),
                    Some(1),
                    ResourceStatus::Reconciling,
                )
                .unwrap();

            // A writer still holding version 1 collides
            let err = store
                .put_cluster(
                    &name,
                    ClusterSpec::with_master_version("9.9.9"),
                    Some(1),
                    ResourceStatus::Reconciling,
                )
                .unwrap_err();
            assert!(matches!(
                err,
                Error::VersionConflict {
                    expected: 1,
                    found: 2
                }
            ));

            // Stored state is untouched by the failed put
            let cluster = store.get_cluster(&name).unwrap();
            assert_eq!(cluster.version, 2);
            assert_eq!(cluster.spec.master_version, "1.32.0");
        }

        /// Story: settling observed state never bumps the version
        #[test]
        fn story_settle_does_not_bump_version() {
            let store = seeded_store(1);
            let name = cluster_name("cluster-00");
            store
                .settle_cluster(&name, ResourceStatus::Running, None, Some(1))
                .unwrap();
            let cluster = store.get_cluster(&name).unwrap();
            assert_eq!(cluster.version, 1);
            assert_eq!(cluster.applied_version, 1);
            assert_eq!(cluster.status, ResourceStatus::Running);
        }
    }

    /// Pagination Tests
    ///
    /// Walking all pages must yield exactly the item set present at
    /// first-page read time: no duplicates, no omissions, every page within
    /// the requested size.
    mod pagination {
        use super::*;

        fn walk_all(store: &ResourceStore, page_size: u32) -> Vec<String> {
            let mut items = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let page = store.list_clusters(
                    "acme",
                    "us-west1",
                    None,
                    &PageRequest::new(page_size, token.as_deref()).unwrap(),
                );
                assert!(page.items.len() <= page_size as usize);
                items.extend(page.items.iter().map(|c| c.name.to_string()));
                match page.next_page_token {
                    Some(next) => token = Some(next),
                    None => return items,
                }
            }
        }

        /// Story: concatenated pages cover the set exactly once, in order
        #[test]
        fn story_pages_concatenate_without_gaps_or_duplicates() {
            let store = seeded_store(7);
            let items = walk_all(&store, 3);
            assert_eq!(items.len(), 7);
            let expected: Vec<String> = (0..7)
                .map(|i| cluster_name(&format!("cluster-{i:02}")).to_string())
                .collect();
            assert_eq!(items, expected);
        }

        /// Story: an exact-fit final page carries no continuation token
        #[test]
        fn story_exact_fit_page_has_no_next_token() {
            let store = seeded_store(4);
            let page = store.list_clusters(
                "acme",
                "us-west1",
                None,
                &PageRequest::new(4, None).unwrap(),
            );
            assert_eq!(page.items.len(), 4);
            assert!(page.next_page_token.is_none());
        }

        /// Story: items created after the first page are not surfaced mid-walk
        #[test]
        fn story_items_created_mid_walk_are_excluded() {
            let store = seeded_store(5);
            let first = store.list_clusters(
                "acme",
                "us-west1",
                None,
                &PageRequest::new(3, None).unwrap(),
            );
            let token = first.next_page_token.unwrap();

            // A new cluster arrives while the caller holds the token
            store
                .insert_cluster(
                    &cluster_name("late-arrival"),
                    ClusterSpec::with_master_version("1.31.2"),
                )
                .unwrap();

            let second = store.list_clusters(
                "acme",
                "us-west1",
                None,
                &PageRequest::new(3, Some(&token)).unwrap(),
            );
            assert_eq!(second.items.len(), 2);
            assert!(second.next_page_token.is_none());
            assert!(second
                .items
                .iter()
                .all(|c| c.name.cluster() != "late-arrival"));
        }

        /// Story: filters restrict pages to matching status
        #[test]
        fn story_filter_restricts_by_status() {
            let store = seeded_store(3);
            store
                .settle_cluster(
                    &cluster_name("cluster-01"),
                    ResourceStatus::Running,
                    None,
                    Some(1),
                )
                .unwrap();

            let filter = Filter::parse("status=RUNNING").unwrap();
            let page =
                store.list_clusters("acme", "us-west1", Some(&filter), &PageRequest::first());
            assert_eq!(page.items.len(), 1);
            assert_eq!(page.items[0].name.cluster(), "cluster-01");
        }

        /// Story: a foreign parent sees an empty collection, not an error
        #[test]
        fn story_other_parent_is_empty() {
            let store = seeded_store(3);
            let page = store.list_clusters("acme", "eu-west4", None, &PageRequest::first());
            assert!(page.items.is_empty());
            assert!(page.next_page_token.is_none());
        }
    }

    /// Cascade Tests
    mod cascade {
        use super::*;

        /// Story: removing a cluster removes its node pools with it
        #[test]
        fn story_cluster_removal_cascades_to_pools() {
            let store = seeded_store(1);
            let cluster = cluster_name("cluster-00");
            let pool = cluster.node_pool("default-pool").unwrap();
            store
                .insert_node_pool(&pool, NodePoolSpec::fixed("n2-standard-4", 3))
                .unwrap();

            assert!(store.remove_cluster(&cluster));
            assert!(matches!(
                store.get_node_pool(&pool),
                Err(Error::NotFound(_))
            ));
        }
    }
}
