//! Prometheus metrics for batch execution

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::batch::types::{JobState, OperationKind, Outcome};

lazy_static! {
    /// Settled operations by kind and outcome
    static ref OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "docbatch_operations_total",
        "Total number of settled operations",
        &["kind", "outcome"]
    ).unwrap();

    /// Handler attempts, including retries
    static ref ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "docbatch_operation_attempts_total",
        "Total number of operation attempts",
        &["kind"]
    ).unwrap();

    static ref OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "docbatch_operation_duration_seconds",
        "Duration of the final attempt of an operation in seconds",
        &["kind"],
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    ).unwrap();

    static ref IN_FLIGHT: IntGauge = register_int_gauge!(
        "docbatch_operations_in_flight",
        "Number of operations currently admitted past a concurrency gate"
    ).unwrap();

    /// Jobs reaching a terminal state
    static ref JOBS: IntCounterVec = register_int_counter_vec!(
        "docbatch_jobs_total",
        "Total number of jobs by final state",
        &["state"]
    ).unwrap();
}

pub(crate) fn record_attempt(kind: OperationKind) {
    ATTEMPTS.with_label_values(&[kind.as_str()]).inc();
}

pub(crate) fn record_operation(kind: OperationKind, outcome: &Outcome, elapsed: Duration) {
    let label = match outcome {
        Outcome::Success { .. } => "success",
        Outcome::Failure { .. } => "failure",
    };
    OPERATIONS.with_label_values(&[kind.as_str(), label]).inc();
    OPERATION_DURATION
        .with_label_values(&[kind.as_str()])
        .observe(elapsed.as_secs_f64());
}

pub(crate) fn operation_admitted() {
    IN_FLIGHT.inc();
}

pub(crate) fn operation_settled() {
    IN_FLIGHT.dec();
}

pub(crate) fn record_job(state: JobState) {
    JOBS.with_label_values(&[state.as_str()]).inc();
}

/// Render every registered metric in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
