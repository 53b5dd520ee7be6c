//! Batch processing demo
//!
//! Runs a mixed batch of document operations with a flaky OCR engine, resumes
//! the failed operations once the engine recovers, and cancels a second batch
//! half way through.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use docbatch::batch::{
    gather_metrics, handler_fn, BatchCoordinator, CoordinatorConfig, DefaultRetryPolicy, DocumentRef, HandlerError,
    JobOptions, Operation, OperationExecutor, OperationKind,
};
use docbatch::Result;
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> Result<()> {
    docbatch::init_tracing("docbatch=info");

    println!("📄 Document Batch Demonstration");
    println!("===============================\n");

    let ocr_online = Arc::new(AtomicBool::new(false));
    let ocr_calls = Arc::new(AtomicU32::new(0));

    let online = ocr_online.clone();
    let calls = ocr_calls.clone();
    let executor = OperationExecutor::new()
        .with_handler(
            OperationKind::Ocr,
            handler_fn(move |bytes: Bytes, settings: Value| {
                let online = online.clone();
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    if !online.load(Ordering::SeqCst) && settings["language"] == "de" {
                        return Err(HandlerError::new("language pack 'de' not loaded"));
                    }
                    Ok(json!({ "characters": bytes.len() * 12, "language": settings["language"] }))
                }
            }),
        )
        .with_handler(
            OperationKind::Convert,
            handler_fn(|bytes: Bytes, settings: Value| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, HandlerError>(json!({ "target": settings["target"], "bytes": bytes.len() }))
            }),
        )
        .with_handler(
            OperationKind::Optimize,
            handler_fn(|bytes: Bytes, _settings: Value| async move {
                Ok::<_, HandlerError>(json!({ "before": bytes.len(), "after": bytes.len() / 2 }))
            }),
        )
        .with_retry_policy(
            DefaultRetryPolicy::exponential(Duration::from_millis(10), Duration::from_millis(100)).with_jitter(true),
        );

    let coordinator = BatchCoordinator::builder()
        .executor(executor)
        .config(CoordinatorConfig::from_env()?)
        .build();

    // Batch 1: mixed operations, resumable
    println!("📋 Batch 1: mixed operations");
    println!("----------------------------");

    let mut operations = Vec::new();
    for (i, language) in ["en", "de", "fr", "de"].iter().enumerate() {
        operations.push(
            Operation::new(
                OperationKind::Ocr,
                DocumentRef::from_bytes(format!("scan-{i}"), vec![0u8; 256]),
                json!({ "language": language }),
            )
            .with_retries(1),
        );
    }
    operations.push(Operation::new(
        OperationKind::Convert,
        DocumentRef::from_bytes("report", vec![0u8; 4096]),
        json!({ "target": "docx" }),
    ));
    operations.push(Operation::new(
        OperationKind::Optimize,
        DocumentRef::from_bytes("brochure", vec![0u8; 8192]),
        json!({ "level": "high" }),
    ));

    let options = JobOptions::new().with_resumable(true).with_progress_callback(|update| {
        println!(
            "  {} {} ({}/{} settled)",
            if update.result.is_success() { "✅" } else { "❌" },
            update.operation_id,
            update.progress.settled(),
            update.progress.total
        );
    });

    let report = coordinator.submit(operations, options).await?;
    println!(
        "\n📊 {}: {} ok, {} failed, state {}, resumable {}",
        report.job_id, report.successful_operations, report.failed_operations, report.state, report.resumable
    );
    for error in &report.errors {
        println!("  ⚠️  {}: {}", error.operation_id, error.message);
    }

    if report.resumable {
        println!("\n🔁 Loading language pack and resuming");
        ocr_online.store(true, Ordering::SeqCst);
        let resumed = coordinator.resume(&report.job_id).await?;
        println!(
            "📊 Resume: {} ok, {} failed, state {}",
            resumed.successful_operations, resumed.failed_operations, resumed.state
        );
    }
    println!("🔢 OCR handler calls: {}", ocr_calls.load(Ordering::SeqCst));

    // Batch 2: cancelled while running
    println!("\n📋 Batch 2: cancellation");
    println!("------------------------");

    let operations: Vec<Operation> = (0..10)
        .map(|i| {
            Operation::new(
                OperationKind::Convert,
                DocumentRef::from_bytes(format!("page-{i}"), vec![0u8; 512]),
                json!({ "target": "pdf" }),
            )
        })
        .collect();

    let runner = coordinator.clone();
    let run = tokio::spawn(async move { runner.submit(operations, JobOptions::new().with_max_concurrency(2)).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Some(job) = coordinator.list_jobs().into_iter().rev().find(|job| !job.state.is_terminal()) {
        let status = coordinator.get_status(&job.job_id)?;
        println!("⏱️  {:.0}% done, cancelling", status.percentage);
        coordinator.cancel(&job.job_id)?;
    }

    let report = run.await??;
    println!(
        "📊 {}: {} ok, {} not run, state {}",
        report.job_id, report.successful_operations, report.failed_operations, report.state
    );

    println!("\n📈 Metrics");
    println!("----------");
    for line in gather_metrics().lines().filter(|l| l.starts_with("docbatch_jobs_total")) {
        println!("  {line}");
    }

    Ok(())
}
