//! Typed error kinds for the ingest, retrieval, store, and maintenance paths.
//!
//! External-service failures with a defined fallback (reranker, entity
//! extractor, date resolver) are recovered locally and surface as degradation
//! flags on the result, not as errors. Failures that compromise consistency
//! fail the operation and roll the transaction back.

use thiserror::Error;

/// Errors from the write path (`add` / `update` / `delete`).
#[derive(Debug, Error)]
pub enum IngestError {
    /// A near-duplicate at or above the block threshold already exists.
    /// Carries the conflicting node id so the caller can force or read it.
    #[error("near-duplicate of existing note {0}")]
    Duplicate(i64),

    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the read path.
#[derive(Debug, Error)]
pub enum RetrieverError {
    #[error("empty query")]
    EmptyQuery,

    /// Enforced by the thin API wrapper, not by the core pipeline.
    #[error("query too long: {len} chars (max {max})")]
    QueryTooLong { len: usize, max: usize },

    /// The total search budget was exhausted before a ranking existed.
    #[error("search timed out")]
    Timeout { phase: Option<&'static str> },

    /// The caller's cancellation token fired between pipeline phases.
    #[error("search cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the persistent graph store and its derived indices.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NotFound(i64),

    #[error("version not found: node {node_id} version {version}")]
    VersionNotFound { node_id: i64, version: u32 },

    /// A derived index refused the write; the transaction was rolled back.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("database I/O failed: {0}")]
    Io(#[from] rusqlite::Error),
}

/// Errors from sleep-time maintenance. A failed step triggers a rollback to
/// the cycle's snapshot.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("sleep step '{step}' failed: {cause}")]
    StepFailed { step: &'static str, cause: String },

    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),
}

impl MaintenanceError {
    pub fn step(step: &'static str, err: impl std::fmt::Display) -> Self {
        Self::StepFailed {
            step,
            cause: err.to_string(),
        }
    }
}
