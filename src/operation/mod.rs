//! Long-running operation tracking
//!
//! Every admitted mutation becomes an Operation with its own lifecycle,
//! decoupled from the request that created it. The tracker owns two
//! invariants:
//!
//! - At most one non-terminal operation targets a given resource at any
//!   instant. The per-resource lock is acquired when the operation is
//!   registered and released on the terminal transition.
//! - State transitions are monotonic: `Pending -> Running -> {Done, Aborted}`,
//!   with no transition out of a terminal state.
//!
//! Cancellation is cooperative. Cancelling a pending operation aborts it
//! immediately; cancelling a running one trips a token the reconciliation
//! engine checks between retry attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::resource::ResourceName;
use crate::{Error, Result};

/// Handle identifying a tracked operation
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The handle as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What kind of mutation an operation is driving
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum OperationKind {
    /// Resource creation
    Create,
    /// Desired-spec replacement (including node count changes)
    Update,
    /// Resource deletion
    Delete,
    /// Autoscaling bounds replacement
    SetAutoscaling,
    /// Network policy replacement
    SetNetworkPolicy,
    /// Node management flags replacement
    SetManagement,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::SetAutoscaling => "SET_AUTOSCALING",
            Self::SetNetworkPolicy => "SET_NETWORK_POLICY",
            Self::SetManagement => "SET_MANAGEMENT",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    /// Admitted, waiting for the reconciliation engine
    Pending,
    /// Claimed by the reconciliation engine
    Running,
    /// Converged successfully
    Done,
    /// Failed or cancelled; error detail explains why
    Aborted,
}

impl OperationState {
    /// Returns true for the terminal states
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Aborted => "ABORTED",
        };
        write!(f, "{s}")
    }
}

/// A tracked long-running mutation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    /// Operation handle
    pub id: OperationId,
    /// Resource this operation targets
    pub target: ResourceName,
    /// Mutation kind
    pub kind: OperationKind,
    /// Current lifecycle state
    pub state: OperationState,
    /// Version token the operation is driving the resource toward
    pub target_version: u64,
    /// Error detail when aborted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// When the operation was admitted
    pub started_at: DateTime<Utc>,
    /// When the operation reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// RAII guard for the per-resource mutation lock
///
/// Acquired before the store is touched so a rejected admission leaves no
/// trace. Dropping the guard without registering an operation releases the
/// lock.
pub struct AdmissionGuard<'a> {
    tracker: &'a OperationTracker,
    target: ResourceName,
    armed: bool,
}

impl AdmissionGuard<'_> {
    /// The resource this guard locks
    pub fn target(&self) -> &ResourceName {
        &self.target
    }
}

impl std::fmt::Debug for AdmissionGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("target", &self.target)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.locks.remove(&self.target);
        }
    }
}

/// Tracks long-running mutations and serializes them per resource
pub struct OperationTracker {
    ops: DashMap<OperationId, Operation>,
    /// Per-resource mutation lock: present while a guard or a non-terminal
    /// operation holds the resource
    locks: DashMap<ResourceName, Option<OperationId>>,
    cancellations: DashMap<OperationId, CancellationToken>,
    /// Wakes the reconciliation engine when work is admitted
    admitted: Notify,
}

impl OperationTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            ops: DashMap::new(),
            locks: DashMap::new(),
            cancellations: DashMap::new(),
            admitted: Notify::new(),
        }
    }

    /// Acquire the per-resource mutation lock ahead of admission
    ///
    /// Fails with `FailedPrecondition` while another non-terminal operation
    /// (or in-flight admission) holds the resource.
    pub fn acquire(&self, target: ResourceName) -> Result<AdmissionGuard<'_>> {
        match self.locks.entry(target.clone()) {
            dashmap::Entry::Occupied(_) => Err(Error::failed_precondition(format!(
                "an operation is already in flight for {target}"
            ))),
            dashmap::Entry::Vacant(entry) => {
                entry.insert(None);
                Ok(AdmissionGuard {
                    tracker: self,
                    target,
                    armed: true,
                })
            }
        }
    }

    /// Register a pending operation under a held guard
    ///
    /// Consumes the guard; the lock is now owned by the operation and is
    /// released on its terminal transition.
    pub fn register(
        &self,
        mut guard: AdmissionGuard<'_>,
        kind: OperationKind,
        target_version: u64,
    ) -> Operation {
        let op = Operation {
            id: OperationId::generate(),
            target: guard.target.clone(),
            kind,
            state: OperationState::Pending,
            target_version,
            error_detail: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        guard.armed = false;
        self.locks.insert(op.target.clone(), Some(op.id.clone()));
        self.cancellations
            .insert(op.id.clone(), CancellationToken::new());
        self.ops.insert(op.id.clone(), op.clone());
        self.admitted.notify_waiters();
        op
    }

    /// Returns true if any node pool under the given cluster currently
    /// holds the mutation lock
    pub fn has_active_descendant(&self, cluster: &crate::resource::ClusterName) -> bool {
        self.locks.iter().any(|entry| match entry.key() {
            ResourceName::NodePool(pool) => pool.cluster() == cluster,
            ResourceName::Cluster(_) => false,
        })
    }

    /// Fetch an operation snapshot
    pub fn get(&self, id: &OperationId) -> Result<Operation> {
        self.ops
            .get(id)
            .map(|op| op.clone())
            .ok_or_else(|| Error::not_found(format!("operation {id} does not exist")))
    }

    /// All operations targeting resources under the given cluster, oldest first
    pub fn list_for_cluster(&self, cluster: &crate::resource::ClusterName) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .ops
            .iter()
            .filter(|entry| entry.value().target.cluster() == cluster)
            .map(|entry| entry.value().clone())
            .collect();
        ops.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.0.cmp(&b.id.0)));
        ops
    }

    /// Claim the oldest pending operation, transitioning it to Running
    ///
    /// Returns None when nothing is pending. Operations aborted while
    /// pending (cancellation) are skipped naturally since they are terminal.
    pub fn claim_pending(&self) -> Option<Operation> {
        let mut pending: Vec<(DateTime<Utc>, OperationId)> = self
            .ops
            .iter()
            .filter(|entry| entry.value().state == OperationState::Pending)
            .map(|entry| (entry.value().started_at, entry.key().clone()))
            .collect();
        pending.sort();

        for (_, id) in pending {
            if let Some(mut op) = self.ops.get_mut(&id) {
                if op.state == OperationState::Pending {
                    op.state = OperationState::Running;
                    return Some(op.clone());
                }
            }
        }
        None
    }

    /// Wait until an admission wakes the engine
    pub async fn admitted(&self) {
        self.admitted.notified().await;
    }

    /// Record a terminal transition, releasing the per-resource lock
    ///
    /// `error_detail` of None means Done; Some means Aborted with that
    /// detail. Finishing an already-terminal operation is an internal error:
    /// the engine holds the only claim and must transition each operation
    /// exactly once.
    pub fn finish(&self, id: &OperationId, error_detail: Option<String>) -> Result<Operation> {
        let finished = {
            let mut op = self
                .ops
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("operation {id} does not exist")))?;
            if op.state.is_terminal() {
                return Err(Error::internal(format!(
                    "operation {id} already terminal ({})",
                    op.state
                )));
            }
            op.state = match error_detail {
                Some(detail) => {
                    op.error_detail = Some(detail);
                    OperationState::Aborted
                }
                None => OperationState::Done,
            };
            op.finished_at = Some(Utc::now());
            op.clone()
        };

        self.release(&finished.target, id);
        self.cancellations.remove(id);
        Ok(finished)
    }

    /// Request cooperative cancellation
    ///
    /// A pending operation aborts immediately. A running one keeps its
    /// Running state until the engine observes the tripped token between
    /// attempts; the engine then finishes it Aborted. Terminal operations
    /// cannot be cancelled.
    pub fn cancel(&self, id: &OperationId) -> Result<Operation> {
        let state = self.get(id)?.state;
        match state {
            OperationState::Pending => self.finish(id, Some("cancelled by caller".to_string())),
            OperationState::Running => {
                if let Some(token) = self.cancellations.get(id) {
                    token.cancel();
                }
                self.get(id)
            }
            OperationState::Done | OperationState::Aborted => Err(Error::failed_precondition(
                format!("operation {id} is already {state} and cannot be cancelled"),
            )),
        }
    }

    /// The cancellation token for a non-terminal operation
    pub fn cancellation(&self, id: &OperationId) -> CancellationToken {
        self.cancellations
            .get(id)
            .map(|token| token.clone())
            .unwrap_or_default()
    }

    /// Poll an operation until it reaches a terminal state or the timeout
    /// elapses, returning the last known state either way
    ///
    /// Timing out has no side effects: the operation keeps running and can
    /// be waited on again.
    pub async fn wait(&self, id: &OperationId, timeout: Duration) -> Result<Operation> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let op = self.get(id)?;
            if op.state.is_terminal() {
                return Ok(op);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(op);
            }
            let poll = Duration::from_millis(10).min(deadline - now);
            tokio::time::sleep(poll).await;
        }
    }

    fn release(&self, target: &ResourceName, id: &OperationId) {
        // Only the owning operation releases the lock; a later admission may
        // already hold it again.
        self.locks
            .remove_if(target, |_, owner| owner.as_ref() == Some(id));
    }
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new()
    }
}
