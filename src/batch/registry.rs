//! In-memory job registry.
//!
//! The registry is the only place job records are mutated. Each job sits behind its
//! own lock, so completions of one job serialize without touching unrelated jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::batch::metrics;
use crate::batch::types::{
    new_job_id, Job, JobError, JobOptions, JobProgress, JobState, JobSummary, Operation, OperationResult,
};
use crate::{DocBatchError, Result};

/// A job plus bookkeeping that never leaves the registry
#[derive(Debug)]
struct JobRecord {
    job: Job,
    /// Slots currently past the gate
    admitted: Vec<bool>,
    /// A run (submit or resume) owns the job until it calls `end_run`
    run_active: bool,
}

impl JobRecord {
    fn state_error(&self, action: impl Into<String>) -> DocBatchError {
        DocBatchError::RegistryState {
            job_id: self.job.id.clone(),
            from: self.job.state,
            action: action.into(),
        }
    }

    fn check_slot(&self, index: usize) -> Result<()> {
        if index >= self.job.operations.len() {
            return Err(DocBatchError::Internal(format!(
                "job {} has no operation slot {}",
                self.job.id, index
            )));
        }
        Ok(())
    }
}

/// Owns the lifecycle of every submitted job
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Arc<Mutex<JobRecord>>>,
}

impl JobRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in INITIALIZING and return its id.
    ///
    /// The caller owns the job's first run and must hand it back with [`JobRegistry::end_run`].
    pub fn create(&self, operations: Vec<Operation>, options: JobOptions) -> Result<String> {
        let id = new_job_id();
        let total = operations.len();
        let job = Job {
            id: id.clone(),
            operations,
            state: JobState::Initializing,
            progress: JobProgress {
                total,
                ..JobProgress::default()
            },
            results: vec![None; total],
            errors: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            options,
            runs: 1,
        };
        let record = JobRecord {
            job,
            admitted: vec![false; total],
            run_active: true,
        };

        if self.jobs.insert(id.clone(), Arc::new(Mutex::new(record))).is_some() {
            return Err(DocBatchError::Internal(format!("duplicate job id {id}")));
        }

        debug!(job_id = %id, total, "Job registered");
        Ok(id)
    }

    fn record(&self, job_id: &str) -> Result<Arc<Mutex<JobRecord>>> {
        self.jobs
            .get(job_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DocBatchError::JobNotFound(job_id.to_string()))
    }

    /// Snapshot of a job
    pub fn get(&self, job_id: &str) -> Result<Job> {
        let record = self.record(job_id)?;
        let job = record.lock().job.clone();
        Ok(job)
    }

    /// Current state of a job
    pub fn state(&self, job_id: &str) -> Result<JobState> {
        let record = self.record(job_id)?;
        let state = record.lock().job.state;
        Ok(state)
    }

    /// Move a job to `next`, enforcing the state machine. Returns the previous state.
    pub fn transition(&self, job_id: &str, next: JobState) -> Result<JobState> {
        let record = self.record(job_id)?;
        let mut record = record.lock();
        let previous = record.job.state;

        if !previous.can_transition_to(next) {
            warn!(job_id, from = %previous, to = %next, "Rejected job state transition");
            return Err(record.state_error(format!("transition to {next}")));
        }

        record.job.state = next;
        if next.is_terminal() {
            record.job.ended_at = Some(Utc::now());
            metrics::record_job(next);
        } else {
            record.job.ended_at = None;
        }

        info!(job_id, from = %previous, to = %next, "Job state changed");
        Ok(previous)
    }

    /// Mark slot `index` as admitted past the gate.
    ///
    /// Returns `false` when the job no longer admits work (cancelled, interrupted).
    /// The state check and the `in_flight` increment happen under one lock.
    pub fn admit(&self, job_id: &str, index: usize) -> Result<bool> {
        let record = self.record(job_id)?;
        let mut record = record.lock();
        record.check_slot(index)?;

        if record.job.state != JobState::Running {
            debug!(job_id, index, state = %record.job.state, "Admission refused");
            return Ok(false);
        }
        if record.admitted[index] || record.job.results[index].is_some() {
            return Err(DocBatchError::Internal(format!(
                "operation slot {index} of job {job_id} admitted twice"
            )));
        }
        if let Some(cap) = record.job.options.max_concurrency {
            if record.job.progress.in_flight >= cap {
                return Err(DocBatchError::Internal(format!(
                    "job {job_id} would exceed its concurrency cap of {cap}"
                )));
            }
        }

        record.admitted[index] = true;
        record.job.progress.in_flight += 1;
        metrics::operation_admitted();
        Ok(true)
    }

    /// Record the result of slot `index`.
    ///
    /// This is the single mutation path for results and progress counters: one call
    /// releases the in-flight count (if admitted) and bumps `completed` or `failed`.
    pub fn apply_result(&self, job_id: &str, index: usize, result: OperationResult) -> Result<JobProgress> {
        let record = self.record(job_id)?;
        let mut record = record.lock();
        record.check_slot(index)?;

        let operation_id = record.job.operations[index].id.clone();
        if operation_id != result.operation_id {
            return Err(DocBatchError::Internal(format!(
                "result for {} does not belong to slot {} ({})",
                result.operation_id, index, operation_id
            )));
        }
        if record.job.results[index].is_some() {
            return Err(DocBatchError::Internal(format!(
                "result for {operation_id} already recorded in job {job_id}"
            )));
        }

        if record.admitted[index] {
            record.admitted[index] = false;
            record.job.progress.in_flight -= 1;
            metrics::operation_settled();
        }

        match result.error_message() {
            None => record.job.progress.completed += 1,
            Some(message) => {
                let message = message.to_string();
                record.job.progress.failed += 1;
                record.job.errors.push(JobError {
                    operation_id: operation_id.clone(),
                    message,
                });
            }
        }

        record.job.operations[index].remaining_retries = result.remaining_retries;
        record.job.results[index] = Some(result);
        Ok(record.job.progress)
    }

    /// Settle the state of a job whose run has drained.
    ///
    /// CANCELLING becomes CANCELLED. RUNNING becomes COMPLETED when nothing failed,
    /// otherwise FAILED for resumable jobs and COMPLETED_WITH_ERRORS for the rest.
    /// An INTERRUPTED job gets its `ended_at` once drained. Any other state is left
    /// alone. Decided under the job lock, so a concurrent cancel either lands before
    /// (CANCELLED) or is ignored.
    pub fn finish_run(&self, job_id: &str) -> Result<JobState> {
        let record = self.record(job_id)?;
        let mut record = record.lock();
        let previous = record.job.state;

        let next = match previous {
            JobState::Cancelling => JobState::Cancelled,
            JobState::Running if record.job.progress.failed == 0 => JobState::Completed,
            JobState::Running if record.job.options.resumable => JobState::Failed,
            JobState::Running => JobState::CompletedWithErrors,
            JobState::Interrupted if record.job.ended_at.is_none() => JobState::Interrupted,
            other => return Ok(other),
        };

        debug_assert_eq!(record.job.progress.in_flight, 0);
        record.job.state = next;
        record.job.ended_at = Some(Utc::now());
        metrics::record_job(next);

        info!(
            job_id,
            from = %previous,
            to = %next,
            completed = record.job.progress.completed,
            failed = record.job.progress.failed,
            "Job run finished"
        );
        Ok(next)
    }

    /// Hand the job back after a run has settled and its report was taken
    pub fn end_run(&self, job_id: &str) -> Result<()> {
        let record = self.record(job_id)?;
        record.lock().run_active = false;
        debug!(job_id, "Job run released");
        Ok(())
    }

    /// Whether a submit or resume is still driving the job
    pub fn is_run_active(&self, job_id: &str) -> Result<bool> {
        let record = self.record(job_id)?;
        let active = record.lock().run_active;
        Ok(active)
    }

    /// Flip a RUNNING or RESUMING job to CANCELLING. Returns `false` from any other state.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let record = self.record(job_id)?;
        let mut record = record.lock();
        match record.job.state {
            JobState::Running | JobState::Resuming => {
                record.job.state = JobState::Cancelling;
                info!(job_id, "Job cancellation requested");
                Ok(true)
            }
            state => {
                debug!(job_id, state = %state, "Cancel ignored");
                Ok(false)
            }
        }
    }

    /// Mark a RUNNING job as INTERRUPTED; in-flight operations still record their results.
    ///
    /// `ended_at` stays unset until the run drains and calls [`JobRegistry::finish_run`].
    pub fn interrupt(&self, job_id: &str) -> Result<bool> {
        let record = self.record(job_id)?;
        let mut record = record.lock();
        if record.job.state != JobState::Running {
            return Ok(false);
        }
        record.job.state = JobState::Interrupted;
        warn!(job_id, in_flight = record.job.progress.in_flight, "Job interrupted");
        Ok(true)
    }

    /// Prepare a FAILED or INTERRUPTED job for another run.
    ///
    /// Clears every failed slot back to pending, rolls the `failed` counter back
    /// accordingly and moves the job to RESUMING. Returns the indices to re-run:
    /// slots that were pending or failed. Rejected while the previous run is still
    /// draining; on success the caller owns the new run until [`JobRegistry::end_run`].
    pub fn begin_resume(&self, job_id: &str) -> Result<Vec<usize>> {
        let record = self.record(job_id)?;
        let mut record = record.lock();

        if !record.job.state.is_resumable() {
            return Err(record.state_error("resume"));
        }
        if record.job.progress.in_flight > 0 || record.run_active {
            return Err(record.state_error("resume while the previous run is still draining"));
        }

        let mut indices = Vec::new();
        let mut cleared = 0;
        for (index, slot) in record.job.results.iter_mut().enumerate() {
            match slot {
                None => indices.push(index),
                Some(result) if !result.is_success() => {
                    *slot = None;
                    cleared += 1;
                    indices.push(index);
                }
                Some(_) => {}
            }
        }

        record.job.progress.failed -= cleared;
        record.job.state = JobState::Resuming;
        record.job.ended_at = None;
        record.job.runs += 1;
        record.run_active = true;

        info!(job_id, rerun = indices.len(), run = record.job.runs, "Job resuming");
        Ok(indices)
    }

    /// Summaries of every job, oldest first
    pub fn list(&self) -> Vec<JobSummary> {
        let records: Vec<_> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        let mut summaries: Vec<JobSummary> = records
            .iter()
            .map(|record| {
                let record = record.lock();
                JobSummary {
                    job_id: record.job.id.clone(),
                    state: record.job.state,
                    progress: record.job.progress,
                    started_at: record.job.started_at,
                    ended_at: record.job.ended_at,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        summaries
    }

    /// Drop a job that is no longer running
    pub fn remove(&self, job_id: &str) -> Result<Job> {
        let record = self.record(job_id)?;
        {
            let record = record.lock();
            if !record.job.state.is_terminal() || record.job.progress.in_flight > 0 || record.run_active {
                return Err(record.state_error("remove"));
            }
        }
        self.jobs.remove(job_id);
        let job = record.lock().job.clone();
        Ok(job)
    }

    /// Drop finished jobs that ended more than `max_age` ago. Returns how many were removed.
    pub fn prune_finished(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let before = self.jobs.len();
        self.jobs.retain(|_, record| {
            let record = record.lock();
            let expired = record.job.state.is_terminal()
                && record.job.progress.in_flight == 0
                && !record.run_active
                && record.job.ended_at.is_some_and(|ended| ended < cutoff);
            !expired
        });
        let removed = before.saturating_sub(self.jobs.len());
        if removed > 0 {
            info!(removed, "Pruned finished jobs");
        }
        removed
    }

    /// Number of registered jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is registered
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::types::{DocumentRef, FailureKind, OperationKind, Outcome};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn operations(n: usize) -> Vec<Operation> {
        (0..n)
            .map(|i| {
                Operation::new(OperationKind::Convert, DocumentRef::from_bytes(format!("doc-{i}"), vec![0u8]), json!({}))
                    .with_id(format!("op-{i}"))
            })
            .collect()
    }

    fn success(op: &str) -> OperationResult {
        OperationResult {
            operation_id: op.to_string(),
            outcome: Outcome::Success { payload: json!({ "ok": true }) },
            elapsed: Duration::from_millis(1),
            total_elapsed: Duration::from_millis(1),
            attempts: 1,
            remaining_retries: 0,
        }
    }

    fn failure(op: &str) -> OperationResult {
        OperationResult {
            operation_id: op.to_string(),
            outcome: Outcome::Failure { kind: FailureKind::Handler, message: "boom".to_string() },
            elapsed: Duration::from_millis(1),
            total_elapsed: Duration::from_millis(1),
            attempts: 1,
            remaining_retries: 0,
        }
    }

    fn running_job(registry: &JobRegistry, n: usize) -> String {
        let id = registry
            .create(operations(n), JobOptions::default().with_max_concurrency(n.max(1)))
            .unwrap();
        registry.transition(&id, JobState::Running).unwrap();
        id
    }

    #[test]
    fn test_create_starts_initializing_with_pending_slots() {
        let registry = JobRegistry::new();
        let id = registry.create(operations(3), JobOptions::default()).unwrap();
        let job = registry.get(&id).unwrap();

        assert_eq!(job.state, JobState::Initializing);
        assert_eq!(job.results.len(), 3);
        assert!(job.results.iter().all(Option::is_none));
        assert_eq!(job.progress, JobProgress { total: 3, completed: 0, failed: 0, in_flight: 0 });
    }

    #[test]
    fn test_illegal_transition_leaves_state_unchanged() {
        let registry = JobRegistry::new();
        let id = running_job(&registry, 1);
        registry.transition(&id, JobState::Completed).unwrap();

        let err = registry.transition(&id, JobState::Resuming).unwrap_err();
        assert!(matches!(err, DocBatchError::RegistryState { from: JobState::Completed, .. }));
        assert_eq!(registry.state(&id).unwrap(), JobState::Completed);
    }

    #[test]
    fn test_apply_result_updates_counters_atomically() {
        let registry = JobRegistry::new();
        let id = running_job(&registry, 2);

        assert!(registry.admit(&id, 0).unwrap());
        assert!(registry.admit(&id, 1).unwrap());
        assert_eq!(registry.get(&id).unwrap().progress.in_flight, 2);

        let progress = registry.apply_result(&id, 1, failure("op-1")).unwrap();
        assert_eq!(progress, JobProgress { total: 2, completed: 0, failed: 1, in_flight: 1 });

        let progress = registry.apply_result(&id, 0, success("op-0")).unwrap();
        assert_eq!(progress, JobProgress { total: 2, completed: 1, failed: 1, in_flight: 0 });

        let job = registry.get(&id).unwrap();
        assert_eq!(job.errors, vec![JobError { operation_id: "op-1".into(), message: "boom".into() }]);
        assert!(job.results[0].as_ref().unwrap().is_success());
    }

    #[test]
    fn test_result_is_written_once_and_to_the_right_slot() {
        let registry = JobRegistry::new();
        let id = running_job(&registry, 2);

        assert!(registry.apply_result(&id, 0, success("op-1")).is_err());
        registry.apply_result(&id, 0, success("op-0")).unwrap();
        assert!(registry.apply_result(&id, 0, success("op-0")).is_err());
        assert_eq!(registry.get(&id).unwrap().progress.completed, 1);
    }

    #[test]
    fn test_cancel_stops_admission() {
        let registry = JobRegistry::new();
        let id = running_job(&registry, 3);

        assert!(registry.admit(&id, 0).unwrap());
        assert!(registry.cancel(&id).unwrap());
        assert!(!registry.admit(&id, 1).unwrap());
        assert_eq!(registry.state(&id).unwrap(), JobState::Cancelling);

        // in-flight work still records
        registry.apply_result(&id, 0, success("op-0")).unwrap();
        assert_eq!(registry.get(&id).unwrap().progress.in_flight, 0);
    }

    #[test]
    fn test_cancel_is_ignored_outside_running() {
        let registry = JobRegistry::new();
        let id = registry.create(operations(1), JobOptions::default()).unwrap();
        assert!(!registry.cancel(&id).unwrap());
        assert_eq!(registry.state(&id).unwrap(), JobState::Initializing);
    }

    #[test]
    fn test_begin_resume_collects_failed_and_pending_slots() {
        let registry = JobRegistry::new();
        let id = running_job(&registry, 4);
        registry.apply_result(&id, 0, success("op-0")).unwrap();
        registry.apply_result(&id, 1, failure("op-1")).unwrap();
        registry.apply_result(&id, 3, failure("op-3")).unwrap();
        registry.interrupt(&id).unwrap();
        registry.finish_run(&id).unwrap();
        registry.end_run(&id).unwrap();

        let indices = registry.begin_resume(&id).unwrap();
        assert_eq!(indices, vec![1, 2, 3]);

        let job = registry.get(&id).unwrap();
        assert_eq!(job.state, JobState::Resuming);
        assert_eq!(job.progress, JobProgress { total: 4, completed: 1, failed: 0, in_flight: 0 });
        assert_eq!(job.errors.len(), 2, "error log is append-only");
        assert_eq!(job.runs, 2);
        assert!(registry.is_run_active(&id).unwrap());
    }

    #[test]
    fn test_resume_waits_for_previous_run_to_end() {
        let registry = JobRegistry::new();
        let id = running_job(&registry, 2);
        registry.apply_result(&id, 0, success("op-0")).unwrap();
        registry.interrupt(&id).unwrap();

        // nothing in flight, but the interrupted run has not handed the job back
        let err = registry.begin_resume(&id).unwrap_err();
        assert!(matches!(err, DocBatchError::RegistryState { from: JobState::Interrupted, .. }));
        assert_eq!(registry.state(&id).unwrap(), JobState::Interrupted);

        registry.finish_run(&id).unwrap();
        registry.end_run(&id).unwrap();
        assert_eq!(registry.begin_resume(&id).unwrap(), vec![1]);
    }

    #[test]
    fn test_interrupt_sets_ended_at_once_drained() {
        let registry = JobRegistry::new();
        let id = running_job(&registry, 2);
        assert!(registry.admit(&id, 0).unwrap());

        assert!(registry.interrupt(&id).unwrap());
        assert!(!registry.interrupt(&id).unwrap());
        assert_eq!(registry.get(&id).unwrap().ended_at, None);

        registry.apply_result(&id, 0, success("op-0")).unwrap();
        assert_eq!(registry.finish_run(&id).unwrap(), JobState::Interrupted);
        let job = registry.get(&id).unwrap();
        assert!(job.ended_at.is_some());
        assert_eq!(job.progress.in_flight, 0);
    }

    #[test]
    fn test_resume_rejected_unless_failed_or_interrupted() {
        let registry = JobRegistry::new();
        let id = running_job(&registry, 1);
        registry.apply_result(&id, 0, failure("op-0")).unwrap();
        registry.transition(&id, JobState::CompletedWithErrors).unwrap();

        let err = registry.begin_resume(&id).unwrap_err();
        assert!(matches!(err, DocBatchError::RegistryState { .. }));
        assert_eq!(registry.state(&id).unwrap(), JobState::CompletedWithErrors);
    }

    #[test]
    fn test_finish_run_settles_by_outcome() {
        let registry = JobRegistry::new();

        let clean = running_job(&registry, 1);
        registry.apply_result(&clean, 0, success("op-0")).unwrap();
        assert_eq!(registry.finish_run(&clean).unwrap(), JobState::Completed);

        let plain = running_job(&registry, 1);
        registry.apply_result(&plain, 0, failure("op-0")).unwrap();
        assert_eq!(registry.finish_run(&plain).unwrap(), JobState::CompletedWithErrors);

        let resumable = registry
            .create(operations(1), JobOptions::default().with_resumable(true))
            .unwrap();
        registry.transition(&resumable, JobState::Running).unwrap();
        registry.apply_result(&resumable, 0, failure("op-0")).unwrap();
        assert_eq!(registry.finish_run(&resumable).unwrap(), JobState::Failed);

        let cancelled = running_job(&registry, 1);
        registry.cancel(&cancelled).unwrap();
        assert_eq!(registry.finish_run(&cancelled).unwrap(), JobState::Cancelled);
        assert!(registry.get(&cancelled).unwrap().ended_at.is_some());

        // already terminal: untouched
        assert_eq!(registry.finish_run(&clean).unwrap(), JobState::Completed);
    }

    #[test]
    fn test_remove_and_prune_only_touch_finished_jobs() {
        let registry = JobRegistry::new();
        let running = running_job(&registry, 1);
        let finished = running_job(&registry, 1);
        registry.apply_result(&finished, 0, success("op-0")).unwrap();
        registry.transition(&finished, JobState::Completed).unwrap();

        // still owned by its run
        assert_eq!(registry.prune_finished(Duration::ZERO), 0);
        registry.end_run(&finished).unwrap();

        assert!(registry.remove(&running).is_err());
        assert_eq!(registry.prune_finished(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(registry.prune_finished(Duration::ZERO), 1);
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.get(&finished), Err(DocBatchError::JobNotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completions_keep_counters_consistent() {
        let registry = Arc::new(JobRegistry::new());
        let n = 200;
        let id = registry.create(operations(n), JobOptions::default()).unwrap();
        registry.transition(&id, JobState::Running).unwrap();

        let mut handles = Vec::new();
        for index in 0..n {
            let registry = registry.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                assert!(registry.admit(&id, index).unwrap());
                let op = format!("op-{index}");
                let result = if index % 3 == 0 { failure(&op) } else { success(&op) };
                registry.apply_result(&id, index, result).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let job = registry.get(&id).unwrap();
        assert_eq!(job.progress.settled(), n);
        assert_eq!(job.progress.failed, (0..n).filter(|i| i % 3 == 0).count());
        assert_eq!(job.progress.in_flight, 0);
        assert!(job.results.iter().all(Option::is_some));
    }
}
