//! Pylon - container-cluster control-plane management service
//!
//! Pylon is the server side of a managed-cluster API: it admits typed
//! mutation requests against clusters and node pools, tracks every admitted
//! mutation as an asynchronous long-running operation, and drives declared
//! desired state to convergence through a reconciliation engine backed by a
//! pluggable infrastructure-provisioning capability.
//!
//! # Architecture
//!
//! Control flow through the service:
//! - The admission router validates a request against current resource state
//!   and rejects invalid transitions with no side effects
//! - The resource store records the new desired spec with a version bump
//! - The operation tracker issues an operation handle, acquiring the
//!   per-resource mutation lock
//! - The reconciliation engine asynchronously drives the infrastructure
//!   backend, retrying transient failures with bounded backoff, and reports
//!   terminal state through the tracker
//! - Callers poll the operation until it reaches a terminal state
//!
//! # Modules
//!
//! - [`resource`] - Resource names, specs, and status types
//! - [`store`] - Versioned resource store with optimistic concurrency
//! - [`operation`] - Long-running operation tracking and per-resource locking
//! - [`admission`] - Request validation and the admission/query surface
//! - [`reconcile`] - Reconciliation engine driving desired state
//! - [`autoscale`] - Tick-driven autoscaler policy evaluator
//! - [`backend`] - Infrastructure provisioning backend abstraction
//! - [`server`] - Control-plane assembly and worker lifecycle
//! - [`retry`] - Bounded exponential backoff with jitter
//! - [`error`] - Error types for the service

#![deny(missing_docs)]

pub mod admission;
pub mod autoscale;
pub mod backend;
pub mod error;
pub mod operation;
pub mod reconcile;
pub mod resource;
pub mod retry;
pub mod server;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the default values used throughout Pylon.
// Centralizing them here ensures consistency across server configs and
// test fixtures.

/// Default number of items returned by a list call when the caller passes 0
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Maximum accepted page size for list calls
///
/// Requests above this limit are rejected rather than clamped so that
/// callers learn about the limit instead of silently receiving short pages.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Default number of backend apply attempts before an operation aborts
pub const DEFAULT_APPLY_ATTEMPTS: u32 = 3;
