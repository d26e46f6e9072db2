//! Error types for the Pylon control plane

use thiserror::Error;

/// Main error type for Pylon operations
///
/// Every externally visible failure is one of these structured kinds with a
/// message; internal state is never leaked through error values.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or out-of-range input, rejected before any state change
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown resource or operation handle
    #[error("not found: {0}")]
    NotFound(String),

    /// Valid request against a resource in an incompatible state
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Optimistic-concurrency collision; caller must re-read and retry
    #[error("version conflict: expected version {expected}, found {found}")]
    VersionConflict {
        /// Version the caller expected the resource to be at
        expected: u64,
        /// Version actually stored
        found: u64,
    },

    /// Transient infrastructure failure surfaced to a caller
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Broken internal invariant; indicates a bug, not a caller error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid-argument error with the given message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a failed-precondition error with the given message
    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    /// Create a version-conflict error from the expected and stored versions
    pub fn version_conflict(expected: u64, found: u64) -> Self {
        Self::VersionConflict { expected, found }
    }

    /// Create an unavailable error with the given message
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if the caller can retry after re-reading current state
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::Unavailable(_))
    }
}
