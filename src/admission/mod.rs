//! Request validation and admission
//!
//! The router is the single entry point for mutations and queries. Each
//! mutation request is validated against current resource state; on success
//! the desired spec is recorded with a version bump and a pending operation
//! is registered under the per-resource lock. Rejected requests mutate
//! nothing: the lock guard is acquired before the store is touched and is
//! dropped on any validation failure.
//!
//! The autoscaler evaluator goes through this same surface, so internal
//! mutations obey the same single-operation-per-resource invariant as
//! external callers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::operation::{Operation, OperationId, OperationKind, OperationTracker};
use crate::resource::{
    Autoscaling, Cluster, ClusterName, ClusterSpec, NetworkPolicy, NodeManagement, NodePool,
    NodePoolName, NodePoolSpec, ResourceStatus,
};
use crate::store::{Filter, Page, PageRequest, ResourceStore};
use crate::{Error, Result};

/// Request to create a cluster
#[derive(Clone, Debug)]
pub struct CreateClusterRequest {
    /// Canonical name of the cluster to create
    pub name: ClusterName,
    /// Desired specification
    pub spec: ClusterSpec,
}

/// Request to replace a cluster's desired spec
#[derive(Clone, Debug)]
pub struct UpdateClusterRequest {
    /// Target cluster
    pub name: ClusterName,
    /// New desired specification, replacing the old one wholesale
    pub spec: ClusterSpec,
    /// Version the caller last observed; mismatch fails with VersionConflict
    pub expected_version: Option<u64>,
}

/// Request to delete a cluster and everything under it
#[derive(Clone, Debug)]
pub struct DeleteClusterRequest {
    /// Target cluster
    pub name: ClusterName,
    /// Version the caller last observed
    pub expected_version: Option<u64>,
}

/// Request to replace a cluster's network policy
#[derive(Clone, Debug)]
pub struct SetNetworkPolicyRequest {
    /// Target cluster
    pub name: ClusterName,
    /// New network policy
    pub policy: NetworkPolicy,
    /// Version the caller last observed
    pub expected_version: Option<u64>,
}

/// Request to create a node pool under an existing cluster
#[derive(Clone, Debug)]
pub struct CreateNodePoolRequest {
    /// Canonical name of the pool to create
    pub name: NodePoolName,
    /// Desired specification
    pub spec: NodePoolSpec,
}

/// Request to replace a node pool's desired spec
#[derive(Clone, Debug)]
pub struct UpdateNodePoolRequest {
    /// Target pool
    pub name: NodePoolName,
    /// New desired specification, replacing the old one wholesale
    pub spec: NodePoolSpec,
    /// Version the caller last observed
    pub expected_version: Option<u64>,
}

/// Request to delete a node pool
#[derive(Clone, Debug)]
pub struct DeleteNodePoolRequest {
    /// Target pool
    pub name: NodePoolName,
    /// Version the caller last observed
    pub expected_version: Option<u64>,
}

/// Request to replace a node pool's autoscaling bounds
#[derive(Clone, Debug)]
pub struct SetNodePoolAutoscalingRequest {
    /// Target pool
    pub name: NodePoolName,
    /// New autoscaling bounds
    pub autoscaling: Autoscaling,
    /// Version the caller last observed
    pub expected_version: Option<u64>,
}

/// Request to replace a node pool's management flags
#[derive(Clone, Debug)]
pub struct SetNodePoolManagementRequest {
    /// Target pool
    pub name: NodePoolName,
    /// New management flags
    pub management: NodeManagement,
    /// Version the caller last observed
    pub expected_version: Option<u64>,
}

/// Outcome of an admission call
#[derive(Clone, Debug)]
pub enum Admission<T> {
    /// The mutation was admitted; poll the operation for the result
    Accepted(Operation),
    /// The desired spec already matches and the resource is converged;
    /// no operation was created
    Unchanged(T),
}

impl<T> Admission<T> {
    /// The admitted operation, if one was created
    pub fn operation(self) -> Option<Operation> {
        match self {
            Self::Accepted(op) => Some(op),
            Self::Unchanged(_) => None,
        }
    }
}

/// Validates and admits mutations, and serves the query surface
pub struct Router {
    store: Arc<ResourceStore>,
    tracker: Arc<OperationTracker>,
}

impl Router {
    /// Create a router over the given store and tracker
    pub fn new(store: Arc<ResourceStore>, tracker: Arc<OperationTracker>) -> Self {
        Self { store, tracker }
    }

    // ------------------------------------------------------------------
    // Cluster admission
    // ------------------------------------------------------------------

    /// Admit a cluster creation
    pub fn create_cluster(&self, req: CreateClusterRequest) -> Result<Operation> {
        req.spec.validate()?;
        let guard = self.tracker.acquire(req.name.clone().into())?;
        let cluster = self.store.insert_cluster(&req.name, req.spec)?;
        let op = self
            .tracker
            .register(guard, OperationKind::Create, cluster.version);
        info!(cluster = %req.name, operation = %op.id, "Cluster creation admitted");
        Ok(op)
    }

    /// Admit a cluster spec replacement
    ///
    /// A spec identical to the converged state short-circuits to
    /// `Unchanged` with the current snapshot: retried admissions must not
    /// trigger duplicate infrastructure work.
    pub fn update_cluster(&self, req: UpdateClusterRequest) -> Result<Admission<Cluster>> {
        req.spec.validate()?;
        let guard = self.tracker.acquire(req.name.clone().into())?;
        let current = self.store.get_cluster(&req.name)?;
        check_mutable(&req.name, current.status)?;
        check_expected_version(req.expected_version, current.version)?;
        if converged(&current.spec, &req.spec, &current) {
            debug!(cluster = %req.name, "Update matches converged state, no operation");
            return Ok(Admission::Unchanged(current));
        }
        let version =
            self.store
                .put_cluster(&req.name, req.spec, Some(current.version), ResourceStatus::Reconciling)?;
        let op = self.tracker.register(guard, OperationKind::Update, version);
        info!(cluster = %req.name, operation = %op.id, version, "Cluster update admitted");
        Ok(Admission::Accepted(op))
    }

    /// Admit a network policy replacement
    pub fn set_network_policy(&self, req: SetNetworkPolicyRequest) -> Result<Admission<Cluster>> {
        let guard = self.tracker.acquire(req.name.clone().into())?;
        let current = self.store.get_cluster(&req.name)?;
        check_mutable(&req.name, current.status)?;
        check_not_errored(&req.name, current.status)?;
        check_expected_version(req.expected_version, current.version)?;

        let mut spec = current.spec.clone();
        spec.network_policy = req.policy;
        if converged(&current.spec, &spec, &current) {
            debug!(cluster = %req.name, "Network policy already in effect, no operation");
            return Ok(Admission::Unchanged(current));
        }
        let version =
            self.store
                .put_cluster(&req.name, spec, Some(current.version), ResourceStatus::Reconciling)?;
        let op = self
            .tracker
            .register(guard, OperationKind::SetNetworkPolicy, version);
        info!(cluster = %req.name, operation = %op.id, "Network policy change admitted");
        Ok(Admission::Accepted(op))
    }

    /// Admit a cluster deletion
    ///
    /// Refused while any node pool under the cluster has an operation in
    /// flight; the cascade on teardown must not race child reconciliation.
    pub fn delete_cluster(&self, req: DeleteClusterRequest) -> Result<Operation> {
        let guard = self.tracker.acquire(req.name.clone().into())?;
        let current = self.store.get_cluster(&req.name)?;
        if current.status == ResourceStatus::Stopping {
            return Err(Error::failed_precondition(format!(
                "{} is already being deleted",
                req.name
            )));
        }
        check_expected_version(req.expected_version, current.version)?;
        if self.tracker.has_active_descendant(&req.name) {
            return Err(Error::failed_precondition(format!(
                "{} has node pool operations in flight",
                req.name
            )));
        }
        let version = self.store.put_cluster(
            &req.name,
            current.spec,
            Some(current.version),
            ResourceStatus::Stopping,
        )?;
        let op = self.tracker.register(guard, OperationKind::Delete, version);
        info!(cluster = %req.name, operation = %op.id, "Cluster deletion admitted");
        Ok(op)
    }

    // ------------------------------------------------------------------
    // Node pool admission
    // ------------------------------------------------------------------

    /// Admit a node pool creation under an existing cluster
    pub fn create_node_pool(&self, req: CreateNodePoolRequest) -> Result<Operation> {
        req.spec.validate()?;
        let cluster = self.store.get_cluster(req.name.cluster())?;
        if !matches!(
            cluster.status,
            ResourceStatus::Running | ResourceStatus::Reconciling
        ) {
            return Err(Error::failed_precondition(format!(
                "cluster {} is {} and cannot take new node pools",
                cluster.name, cluster.status
            )));
        }
        let guard = self.tracker.acquire(req.name.clone().into())?;
        let pool = self.store.insert_node_pool(&req.name, req.spec)?;
        let op = self
            .tracker
            .register(guard, OperationKind::Create, pool.version);
        info!(pool = %req.name, operation = %op.id, "Node pool creation admitted");
        Ok(op)
    }

    /// Admit a node pool spec replacement
    ///
    /// This is also the path the autoscaler evaluator takes when it decides
    /// on a new node count.
    pub fn update_node_pool(&self, req: UpdateNodePoolRequest) -> Result<Admission<NodePool>> {
        req.spec.validate()?;
        let guard = self.tracker.acquire(req.name.clone().into())?;
        let current = self.store.get_node_pool(&req.name)?;
        self.check_parent_active(&req.name)?;
        check_mutable(&req.name, current.status)?;
        check_expected_version(req.expected_version, current.version)?;
        if converged_pool(&current.spec, &req.spec, &current) {
            debug!(pool = %req.name, "Update matches converged state, no operation");
            return Ok(Admission::Unchanged(current));
        }
        let version = self.store.put_node_pool(
            &req.name,
            req.spec,
            Some(current.version),
            ResourceStatus::Reconciling,
        )?;
        let op = self.tracker.register(guard, OperationKind::Update, version);
        info!(pool = %req.name, operation = %op.id, version, "Node pool update admitted");
        Ok(Admission::Accepted(op))
    }

    /// Admit an autoscaling bounds replacement
    ///
    /// Only the bounds themselves are validated here; a node count that
    /// falls outside the new window is corrected by the evaluator on its
    /// next tick rather than rejected.
    pub fn set_node_pool_autoscaling(
        &self,
        req: SetNodePoolAutoscalingRequest,
    ) -> Result<Admission<NodePool>> {
        req.autoscaling.validate()?;
        let guard = self.tracker.acquire(req.name.clone().into())?;
        let current = self.store.get_node_pool(&req.name)?;
        self.check_parent_active(&req.name)?;
        check_mutable(&req.name, current.status)?;
        check_not_errored(&req.name, current.status)?;
        check_expected_version(req.expected_version, current.version)?;

        let mut spec = current.spec.clone();
        spec.autoscaling = req.autoscaling;
        if converged_pool(&current.spec, &spec, &current) {
            debug!(pool = %req.name, "Autoscaling already in effect, no operation");
            return Ok(Admission::Unchanged(current));
        }
        let version = self.store.put_node_pool(
            &req.name,
            spec,
            Some(current.version),
            ResourceStatus::Reconciling,
        )?;
        let op = self
            .tracker
            .register(guard, OperationKind::SetAutoscaling, version);
        info!(pool = %req.name, operation = %op.id, "Autoscaling change admitted");
        Ok(Admission::Accepted(op))
    }

    /// Admit a node management flags replacement
    pub fn set_node_pool_management(
        &self,
        req: SetNodePoolManagementRequest,
    ) -> Result<Admission<NodePool>> {
        let guard = self.tracker.acquire(req.name.clone().into())?;
        let current = self.store.get_node_pool(&req.name)?;
        self.check_parent_active(&req.name)?;
        check_mutable(&req.name, current.status)?;
        check_not_errored(&req.name, current.status)?;
        check_expected_version(req.expected_version, current.version)?;

        let mut spec = current.spec.clone();
        spec.management = req.management;
        if converged_pool(&current.spec, &spec, &current) {
            debug!(pool = %req.name, "Management flags already in effect, no operation");
            return Ok(Admission::Unchanged(current));
        }
        let version = self.store.put_node_pool(
            &req.name,
            spec,
            Some(current.version),
            ResourceStatus::Reconciling,
        )?;
        let op = self
            .tracker
            .register(guard, OperationKind::SetManagement, version);
        info!(pool = %req.name, operation = %op.id, "Management change admitted");
        Ok(Admission::Accepted(op))
    }

    /// Admit a node pool deletion
    pub fn delete_node_pool(&self, req: DeleteNodePoolRequest) -> Result<Operation> {
        let guard = self.tracker.acquire(req.name.clone().into())?;
        let current = self.store.get_node_pool(&req.name)?;
        self.check_parent_active(&req.name)?;
        if current.status == ResourceStatus::Stopping {
            return Err(Error::failed_precondition(format!(
                "{} is already being deleted",
                req.name
            )));
        }
        check_expected_version(req.expected_version, current.version)?;
        let version = self.store.put_node_pool(
            &req.name,
            current.spec,
            Some(current.version),
            ResourceStatus::Stopping,
        )?;
        let op = self.tracker.register(guard, OperationKind::Delete, version);
        info!(pool = %req.name, operation = %op.id, "Node pool deletion admitted");
        Ok(op)
    }

    // ------------------------------------------------------------------
    // Query surface
    // ------------------------------------------------------------------

    /// Fetch a cluster snapshot
    pub fn get_cluster(&self, name: &ClusterName) -> Result<Cluster> {
        self.store.get_cluster(name)
    }

    /// List clusters under `projects/{project}/locations/{location}`
    pub fn list_clusters(
        &self,
        parent: &str,
        filter: Option<&str>,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<Page<Cluster>> {
        let (project, location) = parse_location_parent(parent)?;
        let filter = filter.map(Filter::parse).transpose()?;
        let page = PageRequest::new(page_size, page_token)?;
        Ok(self
            .store
            .list_clusters(&project, &location, filter.as_ref(), &page))
    }

    /// Fetch a node pool snapshot
    pub fn get_node_pool(&self, name: &NodePoolName) -> Result<NodePool> {
        self.store.get_node_pool(name)
    }

    /// List node pools under the given cluster name
    pub fn list_node_pools(
        &self,
        parent: &str,
        filter: Option<&str>,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<Page<NodePool>> {
        let cluster = ClusterName::parse(parent)?;
        let filter = filter.map(Filter::parse).transpose()?;
        let page = PageRequest::new(page_size, page_token)?;
        Ok(self.store.list_node_pools(&cluster, filter.as_ref(), &page))
    }

    // ------------------------------------------------------------------
    // Operation surface
    // ------------------------------------------------------------------

    /// Fetch an operation snapshot
    pub fn get_operation(&self, id: &OperationId) -> Result<Operation> {
        self.tracker.get(id)
    }

    /// All operations targeting resources under the given cluster
    pub fn list_operations(&self, cluster: &ClusterName) -> Vec<Operation> {
        self.tracker.list_for_cluster(cluster)
    }

    /// Poll an operation until terminal or the timeout elapses
    pub async fn wait_operation(&self, id: &OperationId, timeout: Duration) -> Result<Operation> {
        self.tracker.wait(id, timeout).await
    }

    /// Refuse pool mutations while the parent cluster is being deleted
    ///
    /// The cascade on cluster teardown must not race a concurrently
    /// admitted pool operation.
    fn check_parent_active(&self, name: &NodePoolName) -> Result<()> {
        let cluster = self.store.get_cluster(name.cluster())?;
        if cluster.status == ResourceStatus::Stopping {
            return Err(Error::failed_precondition(format!(
                "cluster {} is being deleted",
                cluster.name
            )));
        }
        Ok(())
    }

    /// Request cooperative cancellation of an operation
    ///
    /// A pending operation aborts here and now, and its resource settles
    /// back to its last stable state (or Error if it never converged). A
    /// running operation aborts once the engine observes the flag between
    /// retry attempts.
    pub fn cancel_operation(&self, id: &OperationId) -> Result<Operation> {
        let op = self.tracker.cancel(id)?;
        if op.state.is_terminal() {
            // Aborted straight out of Pending; the engine never saw it, so
            // the resource settles here.
            if let Err(e) = self.store.settle_cancelled(&op.target, "mutation cancelled by caller")
            {
                debug!(target = %op.target, error = %e, "No resource to settle after cancel");
            }
        }
        info!(operation = %id, state = %op.state, "Cancellation requested");
        Ok(op)
    }
}

/// Split a `projects/{project}/locations/{location}` parent reference
fn parse_location_parent(parent: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = parent.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "locations", location]
            if !project.is_empty() && !location.is_empty() =>
        {
            Ok((project.to_string(), location.to_string()))
        }
        _ => Err(Error::invalid_argument(format!(
            "'{parent}' is not a location parent (expected projects/*/locations/*)"
        ))),
    }
}

fn check_mutable(name: &impl std::fmt::Display, status: ResourceStatus) -> Result<()> {
    if !status.accepts_mutations() {
        return Err(Error::failed_precondition(format!(
            "{name} is {status} and admits no mutations"
        )));
    }
    Ok(())
}

/// Resources in Error admit only corrective updates and deletes
fn check_not_errored(name: &impl std::fmt::Display, status: ResourceStatus) -> Result<()> {
    if status == ResourceStatus::Error {
        return Err(Error::failed_precondition(format!(
            "{name} is ERROR; issue a corrective update or delete first"
        )));
    }
    Ok(())
}

fn check_expected_version(expected: Option<u64>, found: u64) -> Result<()> {
    match expected {
        Some(expected) if expected != found => Err(Error::version_conflict(expected, found)),
        _ => Ok(()),
    }
}

fn converged(current: &ClusterSpec, desired: &ClusterSpec, snapshot: &Cluster) -> bool {
    current == desired
        && snapshot.status == ResourceStatus::Running
        && snapshot.applied_version == snapshot.version
}

fn converged_pool(current: &NodePoolSpec, desired: &NodePoolSpec, snapshot: &NodePool) -> bool {
    current == desired
        && snapshot.status == ResourceStatus::Running
        && snapshot.applied_version == snapshot.version
}
