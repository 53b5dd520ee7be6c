//! Batch coordinator: submit, status, cancel and resume.
//!
//! The coordinator validates a submission, runs the resource pre-check, fans the
//! operations out through a per-job [`ConcurrencyGate`], records every result in the
//! [`JobRegistry`] and settles the job once all of them are in.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::batch::executor::{OperationExecutor, DEFAULT_MAX_ATTEMPTS};
use crate::batch::gate::{ConcurrencyGate, DEFAULT_CAPACITY, HEAVY_CAPACITY};
use crate::batch::registry::JobRegistry;
use crate::batch::types::{
    ExecutionReport, FailureKind, Job, JobError, JobOptions, JobState, JobStatus, JobSummary, Operation,
    OperationResult, ProgressCallback, ProgressUpdate,
};
use crate::{DocBatchError, Result};

/// Answer of a [`ResourceChecker`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVerdict {
    /// Whether the operations may start
    pub sufficient: bool,
    /// Reason given when they may not
    pub message: String,
}

impl ResourceVerdict {
    /// Verdict letting the job start
    pub fn sufficient() -> Self {
        Self {
            sufficient: true,
            message: String::new(),
        }
    }

    /// Verdict failing the job with `message`
    pub fn insufficient(message: impl Into<String>) -> Self {
        Self {
            sufficient: false,
            message: message.into(),
        }
    }
}

/// Pre-flight check run before any operation of a job is admitted
#[async_trait]
pub trait ResourceChecker: Send + Sync {
    /// Inspect the operations of a run before any of them is admitted
    async fn check(&self, operations: &[Operation]) -> ResourceVerdict;
}

/// Resource checker that never objects
#[derive(Debug, Clone, Default)]
pub struct AlwaysSufficient;

#[async_trait]
impl ResourceChecker for AlwaysSufficient {
    async fn check(&self, _operations: &[Operation]) -> ResourceVerdict {
        ResourceVerdict::sufficient()
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Concurrency cap when the caller sets none
    pub default_max_concurrency: usize,
    /// Cap when the caller sets none and the job has OCR or security operations
    pub heavy_max_concurrency: usize,
    /// Hard cap on attempts per operation
    pub max_attempts: u32,
    /// How long finished jobs are kept by [`BatchCoordinator::prune_finished`]
    pub retain_finished: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: DEFAULT_CAPACITY,
            heavy_max_concurrency: HEAVY_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retain_finished: Duration::from_secs(3600),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overridden by `DOCBATCH_MAX_CONCURRENCY`, `DOCBATCH_HEAVY_MAX_CONCURRENCY`
    /// and `DOCBATCH_MAX_ATTEMPTS`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = env_number("DOCBATCH_MAX_CONCURRENCY")? {
            config.default_max_concurrency = value;
        }
        if let Some(value) = env_number("DOCBATCH_HEAVY_MAX_CONCURRENCY")? {
            config.heavy_max_concurrency = value;
        }
        if let Some(value) = env_number("DOCBATCH_MAX_ATTEMPTS")? {
            config.max_attempts = u32::try_from(value)
                .map_err(|_| DocBatchError::Validation(format!("DOCBATCH_MAX_ATTEMPTS out of range: {value}")))?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero caps and a zero attempt limit
    pub fn validate(&self) -> Result<()> {
        if self.default_max_concurrency == 0 || self.heavy_max_concurrency == 0 {
            return Err(DocBatchError::Validation("concurrency caps must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(DocBatchError::Validation("max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Effective cap for a job: the caller's, or a default picked from the operation kinds
    pub fn concurrency_for(&self, operations: &[Operation], requested: Option<usize>) -> usize {
        match requested {
            Some(limit) => limit.max(1),
            None if operations.iter().any(|op| op.kind.is_heavy()) => self.heavy_max_concurrency,
            None => self.default_max_concurrency,
        }
    }
}

fn env_number(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| DocBatchError::Validation(format!("{name} is not a number: {raw:?}"))),
        Err(_) => Ok(None),
    }
}

/// Top-level orchestrator for batch jobs
#[derive(Clone)]
pub struct BatchCoordinator {
    registry: Arc<JobRegistry>,
    executor: Arc<OperationExecutor>,
    resources: Arc<dyn ResourceChecker>,
    /// Gates of runs in progress, closed on cancel
    gates: Arc<DashMap<String, ConcurrencyGate>>,
    config: CoordinatorConfig,
}

/// Builder for [`BatchCoordinator`]
#[derive(Default)]
pub struct BatchCoordinatorBuilder {
    executor: Option<OperationExecutor>,
    resources: Option<Arc<dyn ResourceChecker>>,
    registry: Option<Arc<JobRegistry>>,
    config: CoordinatorConfig,
}

impl BatchCoordinatorBuilder {
    /// Executor with the handlers to dispatch to
    pub fn executor(mut self, executor: OperationExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Pre-flight resource check; defaults to [`AlwaysSufficient`]
    pub fn resource_checker(mut self, checker: impl ResourceChecker + 'static) -> Self {
        self.resources = Some(Arc::new(checker));
        self
    }

    /// Share a registry, e.g. with a status endpoint
    pub fn registry(mut self, registry: Arc<JobRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the default configuration
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the coordinator. The executor's attempt cap is lowered to the configured one.
    pub fn build(self) -> BatchCoordinator {
        let executor = self.executor.unwrap_or_default();
        let max_attempts = executor.max_attempts().min(self.config.max_attempts);
        BatchCoordinator {
            registry: self.registry.unwrap_or_default(),
            executor: Arc::new(executor.with_max_attempts(max_attempts)),
            resources: self.resources.unwrap_or_else(|| Arc::new(AlwaysSufficient)),
            gates: Arc::new(DashMap::new()),
            config: self.config,
        }
    }
}

impl BatchCoordinator {
    /// Start building a coordinator
    pub fn builder() -> BatchCoordinatorBuilder {
        BatchCoordinatorBuilder::default()
    }

    /// Registry holding every job of this coordinator
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Active configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Submit a batch and wait until every operation has settled or the job was cancelled.
    ///
    /// Validation and resource failures do not return `Err`: the job is registered,
    /// ends FAILED and the report says so. `Err` means the job could not be registered
    /// or the registry rejected a bookkeeping step.
    #[instrument(skip(self, operations, options), fields(operations = operations.len()))]
    pub async fn submit(&self, operations: Vec<Operation>, options: JobOptions) -> Result<ExecutionReport> {
        let started = Instant::now();
        let mut options = options;
        options.max_concurrency = Some(self.config.concurrency_for(&operations, options.max_concurrency));

        let job_id = self.registry.create(operations, options)?;
        let indices: Vec<usize> = (0..self.registry.get(&job_id)?.operations.len()).collect();
        info!(job_id = %job_id, operations = indices.len(), "Job submitted");

        let report = match self.prepare(&job_id, &indices).await {
            Ok(()) => self.run(&job_id, indices, started).await,
            Err(error) => self.abort_setup(&job_id, &indices, error, started),
        };
        self.release(&job_id, report)
    }

    /// Re-run the failed and never-run operations of a FAILED or INTERRUPTED job.
    ///
    /// Results are merged into the original job record; the report covers this run only.
    /// Rejected with [`DocBatchError::RegistryState`] while the previous run of the job
    /// is still draining.
    #[instrument(skip(self))]
    pub async fn resume(&self, job_id: &str) -> Result<ExecutionReport> {
        let started = Instant::now();
        let indices = self.registry.begin_resume(job_id)?;

        let report = match self.prepare(job_id, &indices).await {
            Ok(()) => self.run(job_id, indices, started).await,
            Err(error) => self.abort_setup(job_id, &indices, error, started),
        };
        self.release(job_id, report)
    }

    /// Hand the job back to the registry once a run's report is final
    fn release(&self, job_id: &str, report: Result<ExecutionReport>) -> Result<ExecutionReport> {
        self.registry.end_run(job_id)?;
        report
    }

    /// Read-only progress snapshot
    pub fn get_status(&self, job_id: &str) -> Result<JobStatus> {
        let job = self.registry.get(job_id)?;
        Ok(JobStatus::from_job(&job))
    }

    /// Stop admitting operations of a RUNNING or RESUMING job.
    ///
    /// Operations already past the gate run to completion; the job ends CANCELLED once
    /// they have. Returns `false` if the job was in any other state.
    #[instrument(skip(self))]
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let cancelled = self.registry.cancel(job_id)?;
        if cancelled {
            if let Some(gate) = self.gates.get(job_id) {
                gate.close();
            }
            warn!(job_id, "Job cancelled; draining in-flight operations");
        }
        Ok(cancelled)
    }

    /// Abandon a RUNNING job, leaving it INTERRUPTED and resumable.
    ///
    /// Like cancel, no new operations are admitted and in-flight ones still record.
    #[instrument(skip(self))]
    pub fn interrupt(&self, job_id: &str) -> Result<bool> {
        let interrupted = self.registry.interrupt(job_id)?;
        if interrupted {
            if let Some(gate) = self.gates.get(job_id) {
                gate.close();
            }
        }
        Ok(interrupted)
    }

    /// Full snapshot of a job, including operations and results
    pub fn job(&self, job_id: &str) -> Result<Job> {
        self.registry.get(job_id)
    }

    /// Summaries of every known job, oldest first
    pub fn list_jobs(&self) -> Vec<JobSummary> {
        self.registry.list()
    }

    /// Drop finished jobs older than the configured retention
    pub fn prune_finished(&self) -> usize {
        self.registry.prune_finished(self.config.retain_finished)
    }

    /// Validate the operations at `indices`, run the resource check and enter RUNNING
    async fn prepare(&self, job_id: &str, indices: &[usize]) -> Result<()> {
        let job = self.registry.get(job_id)?;
        let operations: Vec<Operation> = indices.iter().map(|&i| job.operations[i].clone()).collect();

        validate_operations(&job.operations, &operations)?;

        let verdict = self.resources.check(&operations).await;
        if !verdict.sufficient {
            return Err(DocBatchError::ResourceExhausted(verdict.message));
        }

        self.registry.transition(job_id, JobState::Running)?;
        Ok(())
    }

    /// Fail every operation of the run without starting any of them
    fn abort_setup(
        &self,
        job_id: &str,
        indices: &[usize],
        error: DocBatchError,
        started: Instant,
    ) -> Result<ExecutionReport> {
        let job = self.registry.get(job_id)?;

        // Cancelled while still setting up a resume.
        let (kind, message) = if job.state == JobState::Cancelling {
            (FailureKind::Cancelled, "operation not started: job was cancelled".to_string())
        } else {
            let kind = match &error {
                DocBatchError::Validation(_) => FailureKind::Validation,
                DocBatchError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
                _ => FailureKind::Internal,
            };
            (kind, error.to_string())
        };

        error!(job_id, error = %error, "Job setup failed");

        for &index in indices {
            let result = OperationResult::not_run(&job.operations[index], kind, message.clone());
            self.registry.apply_result(job_id, index, result)?;
        }

        // A cancel can land between the snapshot and here; finish_run settles that case.
        if job.state == JobState::Cancelling || self.registry.transition(job_id, JobState::Failed).is_err() {
            self.registry.finish_run(job_id)?;
        }

        self.report(job_id, indices, started)
    }

    /// Fan the operations at `indices` out through a fresh gate and settle the job
    async fn run(&self, job_id: &str, indices: Vec<usize>, started: Instant) -> Result<ExecutionReport> {
        let job = self.registry.get(job_id)?;
        let capacity = job.options.max_concurrency.unwrap_or(self.config.default_max_concurrency);
        let gate = ConcurrencyGate::new(capacity);
        self.gates.insert(job_id.to_string(), gate.clone());
        info!(job_id, operations = indices.len(), capacity, "Job running");

        let mut tasks = Vec::with_capacity(indices.len());
        for &index in &indices {
            let worker = Worker {
                registry: self.registry.clone(),
                executor: self.executor.clone(),
                gate: gate.clone(),
                callback: job.options.progress_callback.clone(),
                job_id: job_id.to_string(),
                index,
                operation: job.operations[index].clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        let joined = join_all(tasks).await;
        for (&index, outcome) in indices.iter().zip(joined) {
            if let Err(e) = outcome {
                error!(job_id, index, error = %e, "Operation task join error");
                let result = OperationResult::not_run(
                    &job.operations[index],
                    FailureKind::Internal,
                    format!("operation task failed: {e}"),
                );
                // The slot may already hold a result if the progress callback panicked.
                if let Err(e) = self.registry.apply_result(job_id, index, result) {
                    debug!(job_id, index, error = %e, "Join error after result was recorded");
                }
            }
        }

        // Remove only this run's gate.
        self.gates.remove_if(job_id, |_, live| live.same_gate(&gate));
        self.registry.finish_run(job_id)?;
        self.report(job_id, &indices, started)
    }

    fn report(&self, job_id: &str, indices: &[usize], started: Instant) -> Result<ExecutionReport> {
        let job = self.registry.get(job_id)?;

        let mut successful = 0;
        let mut errors = Vec::new();
        for &index in indices {
            match &job.results[index] {
                Some(result) if result.is_success() => successful += 1,
                Some(result) => errors.push(JobError {
                    operation_id: result.operation_id.clone(),
                    message: result.error_message().unwrap_or_default().to_string(),
                }),
                None => errors.push(JobError {
                    operation_id: job.operations[index].id.clone(),
                    message: "operation did not settle".to_string(),
                }),
            }
        }
        let failed = errors.len();

        let report = ExecutionReport {
            job_id: job.id.clone(),
            success: job.state == JobState::Completed,
            state: job.state,
            total_operations: indices.len(),
            successful_operations: successful,
            failed_operations: failed,
            elapsed: started.elapsed(),
            resumable: job.options.resumable && failed > 0 && job.state.is_resumable(),
            errors,
        };

        info!(
            job_id,
            state = %report.state,
            successful = report.successful_operations,
            failed = report.failed_operations,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Job run settled"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("jobs", &self.registry.len())
            .field("active_runs", &self.gates.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Check every operation of a run, plus id uniqueness across the whole job
fn validate_operations(all: &[Operation], run: &[Operation]) -> Result<()> {
    if all.is_empty() {
        return Err(DocBatchError::Validation("no operations submitted".to_string()));
    }

    for operation in run {
        OperationExecutor::validate(operation).map_err(|e| DocBatchError::Validation(e.to_string()))?;
    }

    let mut seen = HashSet::with_capacity(all.len());
    for operation in all {
        if !seen.insert(operation.id.as_str()) {
            return Err(DocBatchError::Validation(format!("duplicate operation id {}", operation.id)));
        }
    }
    Ok(())
}

/// One operation's trip through the gate, the executor and the registry
struct Worker {
    registry: Arc<JobRegistry>,
    executor: Arc<OperationExecutor>,
    gate: ConcurrencyGate,
    callback: Option<ProgressCallback>,
    job_id: String,
    index: usize,
    operation: Operation,
}

impl Worker {
    async fn run(self) {
        let permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                self.skip();
                return;
            }
        };

        match self.registry.admit(&self.job_id, self.index) {
            Ok(true) => {}
            Ok(false) => {
                drop(permit);
                self.skip();
                return;
            }
            Err(e) => {
                error!(job_id = %self.job_id, index = self.index, error = %e, "Admission failed");
                drop(permit);
                let result = OperationResult::not_run(
                    &self.operation,
                    FailureKind::Internal,
                    format!("operation not admitted: {e}"),
                );
                self.record(result);
                return;
            }
        }

        let result = self.executor.execute(self.operation.clone()).await;
        self.record(result);
        // Released only after the result is recorded and in_flight decremented.
        permit.release();
    }

    /// Record an operation the job stopped admitting
    fn skip(&self) {
        debug!(job_id = %self.job_id, operation_id = %self.operation.id, "Operation not admitted");
        let result = OperationResult::not_run(
            &self.operation,
            FailureKind::Cancelled,
            "operation not started: job stopped admitting work",
        );
        self.record(result);
    }

    fn record(&self, result: OperationResult) {
        match self.registry.apply_result(&self.job_id, self.index, result.clone()) {
            Ok(progress) => {
                if let Some(callback) = &self.callback {
                    callback(ProgressUpdate {
                        job_id: self.job_id.clone(),
                        operation_id: self.operation.id.clone(),
                        progress,
                        result,
                    });
                }
            }
            Err(e) => error!(job_id = %self.job_id, index = self.index, error = %e, "Failed to record result"),
        }
    }
}
