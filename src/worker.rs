//! Worker loop
//!
//! The worker peer claims eligible operations, hands them to an
//! [`OperationExecutor`], and is the only writer of the results document.
//! Cancellation is cooperative: the queue is re-read after execution and the
//! result of an operation cancelled meanwhile is dropped.

use crate::coordinator::QueueCoordinator;
use crate::error::ApiError;
use crate::mailbox::{OperationResult, ResultError, ResultsDocument};
use crate::operation::{Operation, OperationKind, OperationStatus};
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Successful execution payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    pub message: String,
    pub data: Option<Value>,
}

impl ExecutionOutput {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Why an execution failed, and whether running it again could help.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{code}: {message}")]
pub struct ExecutionFailure {
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
    pub retryable: bool,
}

impl ExecutionFailure {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: true,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::retryable(code, message)
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<anyhow::Error> for ExecutionFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable("EXECUTION_ERROR", format!("{:#}", err))
    }
}

/// Executes operations on the worker side.
///
/// Implementations must not change an operation's id, kind or params.
pub trait OperationExecutor: Send {
    /// Whether this executor can run operations of `kind`.
    fn handles(&self, _kind: OperationKind) -> bool {
        true
    }

    fn execute(&mut self, op: &Operation) -> Result<ExecutionOutput, ExecutionFailure>;
}

/// What one poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Nothing eligible
    Idle,
    Completed { operation_id: String },
    Failed { operation_id: String, retryable: bool },
    /// Cancelled while executing; the result was dropped
    Discarded { operation_id: String },
}

pub struct Worker<E: OperationExecutor> {
    coordinator: QueueCoordinator,
    executor: E,
}

impl<E: OperationExecutor> Worker<E> {
    pub fn new(coordinator: QueueCoordinator, executor: E) -> Self {
        Self {
            coordinator,
            executor,
        }
    }

    pub fn coordinator(&self) -> &QueueCoordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut QueueCoordinator {
        &mut self.coordinator
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn into_parts(self) -> (QueueCoordinator, E) {
        (self.coordinator, self.executor)
    }

    /// Claim, execute and report at most one operation.
    pub fn poll_once(&mut self) -> Result<PollOutcome, ApiError> {
        let executor = &self.executor;
        let Some(op) = self.coordinator.claim_next(|kind| executor.handles(kind))? else {
            return Ok(PollOutcome::Idle);
        };

        debug!(operation_id = %op.id, kind = %op.kind(), "Executing operation");
        let started = Instant::now();
        let outcome = self.executor.execute(&op);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        self.coordinator.refresh()?;
        let cancelled = self
            .coordinator
            .get_operation(&op.id)
            .map_or(true, |current| current.status == OperationStatus::Cancelled);
        if cancelled {
            info!(operation_id = %op.id, "Operation cancelled during execution, discarding result");
            return Ok(PollOutcome::Discarded {
                operation_id: op.id,
            });
        }

        let (result, poll) = match outcome {
            Ok(output) => (
                OperationResult {
                    operation_id: op.id.clone(),
                    success: true,
                    message: output.message,
                    data: output.data,
                    error: None,
                    timestamp: Utc::now(),
                    processing_time_ms: elapsed_ms,
                    retryable: false,
                    conflicts_detected: None,
                },
                PollOutcome::Completed {
                    operation_id: op.id.clone(),
                },
            ),
            Err(failure) => {
                warn!(
                    operation_id = %op.id,
                    code = %failure.code,
                    retryable = failure.retryable,
                    "Operation execution failed"
                );
                let retryable = failure.retryable;
                (
                    OperationResult {
                        operation_id: op.id.clone(),
                        success: false,
                        message: failure.message.clone(),
                        data: None,
                        error: Some(ResultError {
                            code: failure.code,
                            message: failure.message,
                            details: failure.details,
                        }),
                        timestamp: Utc::now(),
                        processing_time_ms: elapsed_ms,
                        retryable,
                        conflicts_detected: None,
                    },
                    PollOutcome::Failed {
                        operation_id: op.id.clone(),
                        retryable,
                    },
                )
            }
        };

        self.write_result(result)?;
        self.coordinator.reconcile_results()?;
        Ok(poll)
    }

    /// Tick the coordinator and run one operation per poll interval until
    /// `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), ApiError>
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.coordinator.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(peer = %self.coordinator.peer(), "Worker loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Worker loop stopping");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.coordinator.tick() {
                        self.coordinator.record_error(&e);
                        continue;
                    }
                    match self.poll_once() {
                        Ok(PollOutcome::Idle) => {}
                        Ok(outcome) => debug!(?outcome, "Worker poll finished"),
                        Err(e) => {
                            error!(error = %e, "Worker poll failed");
                            self.coordinator.record_error(&e);
                        }
                    }
                }
            }
        }
    }

    /// Append to the results document. A corrupt document is restored from
    /// its backup, never replaced by an empty one.
    fn write_result(&self, result: OperationResult) -> Result<(), ApiError> {
        self.coordinator.store().update_versioned(
            self.coordinator.max_commit_attempts(),
            || ResultsDocument::new(Utc::now()),
            |results: &mut ResultsDocument| results.push(result.clone()),
        )?;
        Ok(())
    }
}
