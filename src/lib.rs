//! # DocBatch
//!
//! A concurrency-bounded batch job execution engine for document operations.
//!
//! ## Overview
//!
//! A caller submits a list of heterogeneous [`batch::Operation`]s (OCR, conversion,
//! optimization, security, workflow steps) against opaque documents. The engine admits
//! them under a concurrency cap, tracks per-operation and per-job progress, retries
//! transient handler failures through a pluggable [`batch::RetryPolicy`], supports
//! cooperative cancellation and resumes a job from only its failed operations.
//!
//! The content transformations themselves are not part of this crate: they are
//! injected as [`batch::OperationHandler`]s keyed by [`batch::OperationKind`].
//!
//! ## Quick Start
//!
//! ```rust
//! use docbatch::batch::{
//!     handler_fn, BatchCoordinator, DocumentRef, HandlerError, JobOptions, Operation,
//!     OperationExecutor, OperationKind,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> docbatch::Result<()> {
//! let executor = OperationExecutor::new().with_handler(
//!     OperationKind::Optimize,
//!     handler_fn(|bytes: bytes::Bytes, _settings: serde_json::Value| async move {
//!         Ok::<_, HandlerError>(json!({ "size": bytes.len() }))
//!     }),
//! );
//!
//! let coordinator = BatchCoordinator::builder().executor(executor).build();
//!
//! let op = Operation::new(
//!     OperationKind::Optimize,
//!     DocumentRef::from_bytes("doc-1", vec![1u8, 2, 3]),
//!     json!({ "level": "high" }),
//! );
//!
//! let report = coordinator.submit(vec![op], JobOptions::default()).await?;
//! assert!(report.success);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`batch`]: gate, retry policy, executor, job registry and the coordinator

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for DocBatch operations
pub type Result<T> = std::result::Result<T, DocBatchError>;

/// Main error type for job-level DocBatch operations
#[derive(Error, Debug)]
pub enum DocBatchError {
    /// Input failed validation before any operation was admitted
    #[error("Validation error: {0}")]
    Validation(String),

    /// Pre-flight resource check reported insufficient resources
    #[error("Insufficient resources: {0}")]
    ResourceExhausted(String),

    /// Illegal job state transition
    #[error("Job {job_id} cannot {action} from state {from}")]
    RegistryState {
        /// Job the transition was attempted on
        job_id: String,
        /// State the job was in
        from: batch::JobState,
        /// What was attempted
        action: String,
    },

    /// Unknown job id
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Per-operation error surfaced at job level
    #[error("Operation error: {0}")]
    Operation(#[from] batch::OperationError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Batch job execution: admission control, retries, job lifecycle
pub mod batch;

/// Install a `tracing` subscriber writing formatted events to stdout.
///
/// `filter` uses the `EnvFilter` directive syntax, e.g. `"docbatch=debug"`. Calling this
/// more than once is harmless; later calls are ignored.
pub fn init_tracing(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .try_init();
}
