//! Single-operation execution.
//!
//! The executor dispatches an operation to the handler registered for its kind,
//! resolves the document bytes, and applies the retry policy on failure in a
//! bounded loop. It never touches job state; the caller records the result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::metrics;
use crate::batch::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::batch::types::{DocumentRef, DocumentSource, FailureKind, Operation, OperationKind, OperationResult, Outcome};

/// Hard cap on attempts per operation, independent of the retry budget
pub const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// Errors raised while executing a single operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// Operation is missing its id, document or settings
    #[error("Validation error: {0}")]
    Validation(String),

    /// Document bytes could not be resolved
    #[error("Document {document_id} unavailable: {message}")]
    DocumentUnavailable {
        /// Document that failed to resolve
        document_id: String,
        /// Resolver's reason
        message: String,
    },

    /// The transformation itself failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// No handler is registered for the operation's kind
    #[error("Unknown operation kind: {0}")]
    UnknownOperationKind(String),
}

impl OperationError {
    /// Only handler failures may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, OperationError::Handler(_))
    }

    /// Category recorded in the operation's result
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            OperationError::Validation(_) => FailureKind::Validation,
            OperationError::DocumentUnavailable { .. } => FailureKind::DocumentUnavailable,
            OperationError::Handler(_) => FailureKind::Handler,
            OperationError::UnknownOperationKind(_) => FailureKind::UnknownOperationKind,
        }
    }
}

/// Failure reported by an [`OperationHandler`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable failure description
    pub message: String,
}

impl HandlerError {
    /// Handler failure with `message`
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A content transformation (OCR, conversion, ...) applied to document bytes
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Transform `document` according to `settings`
    async fn handle(&self, document: Bytes, settings: Value) -> Result<Value, HandlerError>;
}

/// Handler backed by an async closure, see [`handler_fn`]
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as an [`OperationHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Bytes, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(Bytes, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, document: Bytes, settings: Value) -> Result<Value, HandlerError> {
        (self.f)(document, settings).await
    }
}

/// Turns a [`DocumentRef`] into bytes
#[async_trait]
pub trait DocumentResolver: Send + Sync {
    /// Load the bytes behind `document`
    async fn resolve(&self, document: &DocumentRef) -> Result<Bytes, OperationError>;
}

/// Returns in-memory bytes as-is and reads paths from disk
#[derive(Debug, Clone, Default)]
pub struct BytesResolver;

#[async_trait]
impl DocumentResolver for BytesResolver {
    async fn resolve(&self, document: &DocumentRef) -> Result<Bytes, OperationError> {
        match &document.source {
            DocumentSource::Bytes(bytes) => Ok(bytes.clone()),
            DocumentSource::Path(path) => tokio::fs::read(path).await.map(Bytes::from).map_err(|e| {
                OperationError::DocumentUnavailable {
                    document_id: document.id.clone(),
                    message: format!("{}: {}", path.display(), e),
                }
            }),
        }
    }
}

/// Executes operations against injected handlers
pub struct OperationExecutor {
    handlers: HashMap<OperationKind, Arc<dyn OperationHandler>>,
    resolver: Arc<dyn DocumentResolver>,
    retry_policy: Arc<dyn RetryPolicy>,
    max_attempts: u32,
}

impl OperationExecutor {
    /// Executor with no handlers, the [`BytesResolver`] and the [`DefaultRetryPolicy`]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            resolver: Arc::new(BytesResolver),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Register the handler for `kind`, replacing any previous one
    pub fn with_handler(mut self, kind: OperationKind, handler: impl OperationHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Replace the [`BytesResolver`]
    pub fn with_resolver(mut self, resolver: impl DocumentResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Replace the [`DefaultRetryPolicy`]
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    /// Cap total attempts per operation (at least one)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Whether a handler is registered for `kind`
    pub fn has_handler(&self, kind: OperationKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Attempt cap applied to every operation
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Check the shape of an operation; deeper settings validation belongs to handlers
    pub fn validate(operation: &Operation) -> Result<(), OperationError> {
        if operation.id.trim().is_empty() {
            return Err(OperationError::Validation("operation id is empty".to_string()));
        }
        if !operation.document.is_resolvable() {
            return Err(OperationError::Validation(format!(
                "operation {} has no resolvable document",
                operation.id
            )));
        }
        if operation.settings.is_null() {
            return Err(OperationError::Validation(format!("operation {} has no settings", operation.id)));
        }
        Ok(())
    }

    /// Run one operation to a final result, retrying per policy.
    ///
    /// Never fails: every error is encoded in the returned result. `elapsed` covers the
    /// final attempt only, `total_elapsed` every attempt.
    #[instrument(skip(self, operation), fields(operation_id = %operation.id, kind = %operation.kind))]
    pub async fn execute(&self, operation: Operation) -> OperationResult {
        let started = Instant::now();

        if let Err(error) = Self::validate(&operation) {
            return self.finish(&operation, Err(error), 0, Duration::ZERO, started);
        }

        let mut operation = operation;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempt_start = Instant::now();
            debug!(attempt = attempts, remaining_retries = operation.remaining_retries, "Executing operation");

            let result = self.attempt(&operation).await;
            let elapsed = attempt_start.elapsed();
            metrics::record_attempt(operation.kind);

            let error = match result {
                Ok(payload) => return self.finish(&operation, Ok(payload), attempts, elapsed, started),
                Err(error) => error,
            };

            if attempts >= self.max_attempts {
                error!(attempts, error = %error, "Operation hit the attempt cap");
                return self.finish(&operation, Err(error), attempts, elapsed, started);
            }

            let decision = self.retry_policy.should_retry(&operation, &error, attempts);
            if !decision.retry {
                return self.finish(&operation, Err(error), attempts, elapsed, started);
            }

            let Some(mut recovered) = self.retry_policy.recover(&operation, &error) else {
                warn!(error = %error, "Recovery produced no usable operation");
                return self.finish(&operation, Err(error), attempts, elapsed, started);
            };

            // Results are matched back to the job by id.
            recovered.id = operation.id.clone();
            operation = recovered;
            operation.remaining_retries = operation.remaining_retries.saturating_sub(1);
            warn!(
                attempt = attempts,
                remaining_retries = operation.remaining_retries,
                delay_ms = decision.delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying"
            );

            if !decision.delay.is_zero() {
                tokio::time::sleep(decision.delay).await;
            }
        }
    }

    async fn attempt(&self, operation: &Operation) -> Result<Value, OperationError> {
        let handler = self
            .handlers
            .get(&operation.kind)
            .cloned()
            .ok_or_else(|| OperationError::UnknownOperationKind(operation.kind.to_string()))?;

        let bytes = self.resolver.resolve(&operation.document).await?;

        handler
            .handle(bytes, operation.settings.clone())
            .await
            .map_err(|e| OperationError::Handler(e.message))
    }

    fn finish(
        &self,
        operation: &Operation,
        result: Result<Value, OperationError>,
        attempts: u32,
        elapsed: Duration,
        started: Instant,
    ) -> OperationResult {
        let total_elapsed = started.elapsed();
        let outcome = match result {
            Ok(payload) => {
                info!(attempts, duration_ms = elapsed.as_millis() as u64, "Operation completed successfully");
                Outcome::Success { payload }
            }
            Err(error) => {
                error!(attempts, error = %error, "Operation failed");
                Outcome::Failure {
                    kind: error.failure_kind(),
                    message: error.to_string(),
                }
            }
        };

        metrics::record_operation(operation.kind, &outcome, elapsed);

        OperationResult {
            operation_id: operation.id.clone(),
            outcome,
            elapsed,
            total_elapsed,
            attempts,
            remaining_retries: operation.remaining_retries,
        }
    }
}

impl Default for OperationExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::retry::RetryDecision;
    use crate::batch::types::DocumentRef;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn operation(kind: OperationKind, retries: u32) -> Operation {
        Operation::new(kind, DocumentRef::from_bytes("doc-1", vec![7u8; 4]), json!({ "mode": "fast" }))
            .with_retries(retries)
    }

    fn flaky_handler(failures: u32, calls: Arc<AtomicU32>) -> impl OperationHandler {
        handler_fn(move |bytes: Bytes, _settings: Value| {
            let calls = calls.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= failures {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Err(HandlerError::new(format!("transient failure {call}")))
                } else {
                    Ok(json!({ "bytes": bytes.len() }))
                }
            }
        })
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = OperationExecutor::new().with_handler(OperationKind::Convert, flaky_handler(0, calls.clone()));

        let result = executor.execute(operation(OperationKind::Convert, 0)).await;

        assert!(result.is_success());
        assert_eq!(result.payload(), Some(&json!({ "bytes": 4 })));
        assert_eq!(result.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success_and_reports_final_attempt_time() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = OperationExecutor::new().with_handler(OperationKind::Ocr, flaky_handler(2, calls.clone()));

        let result = executor.execute(operation(OperationKind::Ocr, 2)).await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.remaining_retries, 0);
        assert!(result.elapsed < Duration::from_millis(40));
        assert!(result.total_elapsed >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_exhausted_retries_is_terminal_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = OperationExecutor::new().with_handler(OperationKind::Ocr, flaky_handler(10, calls.clone()));

        let result = executor.execute(operation(OperationKind::Ocr, 1)).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Handler));
        assert_eq!(result.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.error_message(), Some("Handler error: transient failure 2"));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_not_retried() {
        let executor = OperationExecutor::new();
        let result = executor.execute(operation(OperationKind::Workflow, 3)).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::UnknownOperationKind));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_document_unavailable() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = OperationExecutor::new().with_handler(OperationKind::Convert, flaky_handler(0, calls.clone()));
        let op = Operation::new(
            OperationKind::Convert,
            DocumentRef::from_path("missing", "/definitely/not/here.pdf"),
            json!({}),
        )
        .with_retries(3);

        let result = executor.execute(op).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::DocumentUnavailable));
        assert_eq!(result.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_null_settings_fail_validation() {
        let executor = OperationExecutor::new();
        let mut op = operation(OperationKind::Convert, 0);
        op.settings = Value::Null;

        let result = executor.execute(op).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Validation));
        assert_eq!(result.attempts, 0);
    }

    #[derive(Debug)]
    struct NoRecovery;

    impl RetryPolicy for NoRecovery {
        fn should_retry(&self, _: &Operation, _: &OperationError, _: u32) -> RetryDecision {
            RetryDecision::retry_after(Duration::ZERO)
        }

        fn recover(&self, _: &Operation, _: &OperationError) -> Option<Operation> {
            None
        }
    }

    #[tokio::test]
    async fn test_failed_recovery_is_terminal_despite_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = OperationExecutor::new()
            .with_handler(OperationKind::Security, flaky_handler(5, calls.clone()))
            .with_retry_policy(NoRecovery);

        let result = executor.execute(operation(OperationKind::Security, 5)).await;

        assert!(!result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug)]
    struct RefillingPolicy;

    impl RetryPolicy for RefillingPolicy {
        fn should_retry(&self, _: &Operation, _: &OperationError, _: u32) -> RetryDecision {
            RetryDecision::retry_after(Duration::ZERO)
        }

        fn recover(&self, operation: &Operation, _: &OperationError) -> Option<Operation> {
            Some(operation.clone().with_retries(u32::MAX))
        }
    }

    #[tokio::test]
    async fn test_attempt_cap_bounds_runaway_policy() {
        let executor = OperationExecutor::new()
            .with_handler(
                OperationKind::Convert,
                handler_fn(|_: Bytes, _: Value| async { Err::<Value, _>(HandlerError::new("never works")) }),
            )
            .with_retry_policy(RefillingPolicy)
            .with_max_attempts(5);

        let result = executor.execute(operation(OperationKind::Convert, 1)).await;

        assert!(!result.is_success());
        assert_eq!(result.attempts, 5);
    }
}
