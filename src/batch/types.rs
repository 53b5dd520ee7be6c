use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Retry budget given to operations built with [`Operation::new`]
pub const DEFAULT_OPERATION_RETRIES: u32 = 2;

/// Kind of transformation an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// Text recognition
    Ocr,
    /// Format conversion
    Convert,
    /// Size/structure optimization
    Optimize,
    /// Encryption and permission changes
    Security,
    /// A step of a user-defined workflow
    Workflow,
}

impl OperationKind {
    /// Stable upper-case name, also used as a metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Ocr => "OCR",
            OperationKind::Convert => "CONVERT",
            OperationKind::Optimize => "OPTIMIZE",
            OperationKind::Security => "SECURITY",
            OperationKind::Workflow => "WORKFLOW",
        }
    }

    /// Kinds with a high per-operation resource cost get a lower default concurrency cap
    pub fn is_heavy(&self) -> bool {
        matches!(self, OperationKind::Ocr | OperationKind::Security)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory priority. Stored and reported, never used for admission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Background work
    Low,
    /// Default
    #[default]
    Normal,
    /// Interactive work
    High,
}

/// Where the bytes of a document come from
#[derive(Debug, Clone)]
pub enum DocumentSource {
    /// Bytes already held in memory
    Bytes(Bytes),
    /// A file to be read when the operation runs
    Path(PathBuf),
}

/// Reference to the document an operation works on
#[derive(Debug, Clone)]
pub struct DocumentRef {
    /// Document identifier
    pub id: String,
    /// Byte source
    pub source: DocumentSource,
}

impl DocumentRef {
    /// Reference in-memory bytes
    pub fn from_bytes(id: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            source: DocumentSource::Bytes(bytes.into()),
        }
    }

    /// Reference a file on disk
    pub fn from_path(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source: DocumentSource::Path(path.into()),
        }
    }

    /// Whether the reference names something that could be resolved
    pub fn is_resolvable(&self) -> bool {
        if self.id.trim().is_empty() {
            return false;
        }
        match &self.source {
            DocumentSource::Bytes(_) => true,
            DocumentSource::Path(path) => !path.as_os_str().is_empty(),
        }
    }
}

/// One unit of work against one document
#[derive(Debug, Clone)]
pub struct Operation {
    /// Unique identifier within a job
    pub id: String,
    /// Which handler runs this operation
    pub kind: OperationKind,
    /// Document to operate on
    pub document: DocumentRef,
    /// Kind-specific settings, opaque to the engine
    pub settings: Value,
    /// Advisory priority
    pub priority: Priority,
    /// Retries left; decremented on every retried failure
    pub remaining_retries: u32,
}

impl Operation {
    /// Create an operation with a generated id and the default retry budget
    pub fn new(kind: OperationKind, document: DocumentRef, settings: Value) -> Self {
        Self {
            id: new_operation_id(),
            kind,
            document,
            settings,
            priority: Priority::default(),
            remaining_retries: DEFAULT_OPERATION_RETRIES,
        }
    }

    /// Replace the generated id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the advisory priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.remaining_retries = retries;
        self
    }
}

/// Category of a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Operation failed validation before it ran
    Validation,
    /// Resource pre-check refused the job
    ResourceExhausted,
    /// Document bytes could not be resolved
    DocumentUnavailable,
    /// Handler failed after all retries
    Handler,
    /// No handler registered for the operation kind
    UnknownOperationKind,
    /// Never admitted because the job was cancelled or interrupted
    Cancelled,
    /// Unexpected engine failure, e.g. a panicked task
    Internal,
}

/// Success payload or failure description of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The handler produced a payload
    Success {
        /// Handler output
        payload: Value,
    },
    /// The operation failed terminally or never ran
    Failure {
        /// Failure category
        kind: FailureKind,
        /// Failure description
        message: String,
    },
}

/// Normalized result of running one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Operation this result belongs to
    pub operation_id: String,
    /// Success payload or failure description
    pub outcome: Outcome,
    /// Wall-clock time of the final attempt
    pub elapsed: Duration,
    /// Wall-clock time across every attempt, including backoff sleeps
    pub total_elapsed: Duration,
    /// Attempts made in this run; 0 if the operation never started
    pub attempts: u32,
    /// Retry budget left on the operation after this run
    pub remaining_retries: u32,
}

impl OperationResult {
    /// A failure recorded without running the operation
    pub fn not_run(operation: &Operation, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            operation_id: operation.id.clone(),
            outcome: Outcome::Failure {
                kind,
                message: message.into(),
            },
            elapsed: Duration::ZERO,
            total_elapsed: Duration::ZERO,
            attempts: 0,
            remaining_retries: operation.remaining_retries,
        }
    }

    /// Whether the operation succeeded
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    /// Handler payload of a successful operation
    pub fn payload(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Success { payload } => Some(payload),
            Outcome::Failure { .. } => None,
        }
    }

    /// Failure message of a failed operation
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Failure { message, .. } => Some(message),
        }
    }

    /// Failure category of a failed operation
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Registered, not yet validated
    Initializing,
    /// Operations are being admitted
    Running,
    /// Preparing a re-run of failed operations
    Resuming,
    /// No longer admitting; in-flight operations are draining
    Cancelling,
    /// Every operation succeeded
    Completed,
    /// Every operation settled and at least one failed
    CompletedWithErrors,
    /// Setup failed, or operations failed in a resumable job
    Failed,
    /// Cancelled and drained
    Cancelled,
    /// Abandoned mid-run by the host; resumable
    Interrupted,
}

impl JobState {
    /// Upper-case name used in logs, errors and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Initializing => "INITIALIZING",
            JobState::Running => "RUNNING",
            JobState::Resuming => "RESUMING",
            JobState::Cancelling => "CANCELLING",
            JobState::Completed => "COMPLETED",
            JobState::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Interrupted => "INTERRUPTED",
        }
    }

    /// No run is driving the job any more
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::CompletedWithErrors
                | JobState::Failed
                | JobState::Cancelled
                | JobState::Interrupted
        )
    }

    /// Only these states accept a resume request
    pub fn is_resumable(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Interrupted)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, Failed)
                | (Running, Completed)
                | (Running, CompletedWithErrors)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Running, Interrupted)
                | (Resuming, Running)
                | (Resuming, Failed)
                | (Resuming, Cancelling)
                | (Cancelling, Cancelled)
                | (Failed, Resuming)
                | (Interrupted, Resuming)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress counters of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Number of operations in the job
    pub total: usize,
    /// Operations that succeeded
    pub completed: usize,
    /// Operations that failed terminally
    pub failed: usize,
    /// Operations currently past the gate
    pub in_flight: usize,
}

impl JobProgress {
    /// Operations with a recorded result
    pub fn settled(&self) -> usize {
        self.completed + self.failed
    }

    /// Successful operations as a percentage of the total; 0 for an empty job
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }

    /// Projects the remaining time as `elapsed * (1 / ratio - 1)`; 0 until something completed
    pub fn estimate_remaining(&self, elapsed: Duration) -> Duration {
        if self.total == 0 || self.completed == 0 {
            return Duration::ZERO;
        }
        let ratio = self.completed as f64 / self.total as f64;
        let remaining = elapsed.as_secs_f64() * (1.0 / ratio - 1.0);
        Duration::try_from_secs_f64(remaining.max(0.0)).unwrap_or_default()
    }
}

/// Notification fired after an operation's result has been recorded
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Job the operation belongs to
    pub job_id: String,
    /// Operation that just settled
    pub operation_id: String,
    /// Job progress right after the result was recorded
    pub progress: JobProgress,
    /// The recorded result
    pub result: OperationResult,
}

/// Callback for progress updates
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Per-job execution options
#[derive(Clone, Default)]
pub struct JobOptions {
    /// Concurrency cap; `None` picks a default from the operation kinds
    pub max_concurrency: Option<usize>,
    /// Leave the job resumable when operations fail
    pub resumable: bool,
    /// Called after every recorded result
    pub progress_callback: Option<ProgressCallback>,
}

impl JobOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set concurrency limit (number of parallel operations)
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Leave the job resumable when operations fail
    pub fn with_resumable(mut self, resumable: bool) -> Self {
        self.resumable = resumable;
        self
    }

    /// Set progress callback
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("max_concurrency", &self.max_concurrency)
            .field("resumable", &self.resumable)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

/// An operation failure kept in the job's error log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Failed operation
    pub operation_id: String,
    /// Failure message
    pub message: String,
}

/// Snapshot of a job record
#[derive(Debug, Clone)]
pub struct Job {
    /// Job identifier
    pub id: String,
    /// Submission order; index-aligned with `results`
    pub operations: Vec<Operation>,
    /// Lifecycle state
    pub state: JobState,
    /// Progress counters
    pub progress: JobProgress,
    /// `None` marks a pending slot
    pub results: Vec<Option<OperationResult>>,
    /// Append-only
    pub errors: Vec<JobError>,
    /// When the job was submitted
    pub started_at: DateTime<Utc>,
    /// When the job last reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Options given at submission, reused by resumes
    pub options: JobOptions,
    /// Number of runs so far, including resumes
    pub runs: u32,
}

impl Job {
    /// Elapsed wall-clock time, up to `ended_at` once the job has finished
    pub fn elapsed(&self) -> Duration {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    /// Position of an operation in submission order
    pub fn index_of(&self, operation_id: &str) -> Option<usize> {
        self.operations.iter().position(|op| op.id == operation_id)
    }
}

/// What `submit` and `resume` hand back once a run has settled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Job identifier
    pub job_id: String,
    /// Whether the job ended COMPLETED
    pub success: bool,
    /// State of the job when the run settled
    pub state: JobState,
    /// Operations in this run
    pub total_operations: usize,
    /// Operations of this run that succeeded
    pub successful_operations: usize,
    /// Operations of this run that failed
    pub failed_operations: usize,
    /// Wall-clock duration of this run
    pub elapsed: Duration,
    /// Whether [`crate::batch::BatchCoordinator::resume`] will accept the job
    pub resumable: bool,
    /// Failures of this run
    pub errors: Vec<JobError>,
}

/// Read-only view of a job's progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job identifier
    pub job_id: String,
    /// Lifecycle state
    pub state: JobState,
    /// Progress counters
    pub progress: JobProgress,
    /// Successful operations as a percentage of the total
    pub percentage: f64,
    /// Time since submission, or until the job ended
    pub elapsed: Duration,
    /// Projected time until every operation succeeded
    pub estimated_time_remaining: Duration,
    /// Every failure recorded so far
    pub errors: Vec<JobError>,
    /// When the job was submitted
    pub started_at: DateTime<Utc>,
    /// When the job last reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    /// Build a status view of a job snapshot
    pub fn from_job(job: &Job) -> Self {
        let elapsed = job.elapsed();
        Self {
            job_id: job.id.clone(),
            state: job.state,
            progress: job.progress,
            percentage: job.progress.percentage(),
            elapsed,
            estimated_time_remaining: job.progress.estimate_remaining(elapsed),
            errors: job.errors.clone(),
            started_at: job.started_at,
            ended_at: job.ended_at,
        }
    }
}

/// Short listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job identifier
    pub job_id: String,
    /// Lifecycle state
    pub state: JobState,
    /// Progress counters
    pub progress: JobProgress,
    /// When the job was submitted
    pub started_at: DateTime<Utc>,
    /// When the job last reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
}

/// Generate a job id: creation time plus a random suffix
pub fn new_job_id() -> String {
    format!("job_{}_{}", Utc::now().timestamp_millis(), Uuid::new_v4().simple())
}

/// Generate an operation id
pub fn new_operation_id() -> String {
    format!("op_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_empty_progress_has_no_division_by_zero() {
        let progress = JobProgress::default();
        assert_eq!(progress.percentage(), 0.0);
        assert_eq!(progress.estimate_remaining(Duration::from_secs(30)), Duration::ZERO);
    }

    #[test]
    fn test_estimate_remaining_halfway() {
        let progress = JobProgress { total: 4, completed: 2, failed: 0, in_flight: 2 };
        assert_eq!(progress.percentage(), 50.0);
        assert_eq!(progress.estimate_remaining(Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[test]
    fn test_state_machine_rejects_resume_of_completed() {
        assert!(!JobState::Completed.can_transition_to(JobState::Resuming));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Resuming));
        assert!(JobState::Failed.can_transition_to(JobState::Resuming));
        assert!(JobState::Interrupted.can_transition_to(JobState::Resuming));
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = Outcome::Failure { kind: FailureKind::Handler, message: "boom".into() };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value, json!({ "status": "failure", "kind": "handler", "message": "boom" }));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| new_job_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    proptest! {
        #[test]
        fn prop_estimate_is_finite_and_non_negative(
            total in 0usize..1000,
            completed in 0usize..1000,
            elapsed_ms in 0u64..10_000_000,
        ) {
            let completed = completed.min(total);
            let progress = JobProgress { total, completed, failed: 0, in_flight: 0 };
            let pct = progress.percentage();
            prop_assert!((0.0..=100.0).contains(&pct));

            let eta = progress.estimate_remaining(Duration::from_millis(elapsed_ms));
            if completed == total {
                prop_assert_eq!(eta, Duration::ZERO);
            }
            if completed == 0 {
                prop_assert_eq!(eta, Duration::ZERO);
            }
        }
    }
}
