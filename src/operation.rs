//! Operation Model
//!
//! An [`Operation`] is the unit of work exchanged between the client and the
//! worker through the queue document. Its parameters are a tagged union keyed
//! by kind ([`OperationParams`]), so every kind carries exactly its own fields.

pub mod params;
pub mod retry;
pub mod validator;

pub use params::{OperationKind, OperationParams, TaskState};
pub use retry::RetryPolicy;
pub use validator::{OperationValidator, ValidationIssue, ValidationReport};

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Default retry budget for new operations.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Metadata key stamped by the `defer` resolution strategy.
pub const META_DEFERRED_UNTIL: &str = "deferredUntil";
/// Metadata key recording which operation a merge absorbed.
pub const META_MERGED_FROM: &str = "mergedFrom";
/// Metadata key linking a clone to the operation it retries.
pub const META_RETRY_OF: &str = "retryOf";

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 5] = [
        OperationStatus::Pending,
        OperationStatus::InProgress,
        OperationStatus::Completed,
        OperationStatus::Failed,
        OperationStatus::Cancelled,
    ];

    /// Completed and cancelled operations are never mutated again.
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Cancelled)
    }

    /// Pending or in-progress.
    pub fn is_active(self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in-progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown status '{}'", s))
    }
}

/// Priority level for operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    /// One level lower, floored at `Low`.
    pub fn lowered(self) -> Self {
        match self {
            Priority::Urgent => Priority::High,
            Priority::High => Priority::Normal,
            Priority::Normal | Priority::Low => Priority::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Which peer created an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    Client,
    Worker,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Client => "client",
            Origin::Worker => "worker",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Origin::Client => Origin::Worker,
            Origin::Worker => Origin::Client,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work exchanged between the peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Unique identifier, immutable once assigned
    pub id: String,
    /// Kind-specific parameters; the tag is the operation kind
    pub params: OperationParams,
    pub status: OperationStatus,
    #[serde(default)]
    pub priority: Priority,
    pub origin: Origin,
    /// Creation time, also the processing-order tie-breaker
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Mint a fresh operation identifier.
pub fn new_operation_id() -> String {
    format!("op-{}", uuid::Uuid::new_v4().simple())
}

impl Operation {
    /// Create a pending operation stamped with the current time.
    pub fn new(params: OperationParams, origin: Origin) -> Self {
        Self::new_at(params, origin, Utc::now())
    }

    /// Create a pending operation with an explicit creation time.
    pub fn new_at(params: OperationParams, origin: Origin, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: new_operation_id(),
            params,
            status: OperationStatus::Pending,
            priority: Priority::Normal,
            origin,
            timestamp,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error: None,
            result: None,
            dependencies: Vec::new(),
            conflict_ids: Vec::new(),
            estimated_duration_ms: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.params.kind()
    }

    /// Resource path this operation touches.
    pub fn resource_path(&self) -> String {
        self.params.resource_path()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time the operation may not run before, if `defer` stamped one.
    pub fn deferred_until(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get(META_DEFERRED_UNTIL)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn transition_error(&self, to: OperationStatus) -> ApiError {
        ApiError::InvalidTransition {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    /// pending → in-progress
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), ApiError> {
        if self.status != OperationStatus::Pending {
            return Err(self.transition_error(OperationStatus::InProgress));
        }
        self.status = OperationStatus::InProgress;
        self.started_at = Some(now);
        Ok(())
    }

    /// in-progress → completed
    pub fn complete(&mut self, now: DateTime<Utc>, result: Option<Value>) -> Result<(), ApiError> {
        if self.status != OperationStatus::InProgress {
            return Err(self.transition_error(OperationStatus::Completed));
        }
        self.status = OperationStatus::Completed;
        self.completed_at = Some(now);
        self.error = None;
        self.next_retry_at = None;
        self.result = result;
        Ok(())
    }

    /// pending | in-progress → failed, preserving the error verbatim
    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>) -> Result<(), ApiError> {
        if !self.status.is_active() {
            return Err(self.transition_error(OperationStatus::Failed));
        }
        self.status = OperationStatus::Failed;
        self.completed_at = Some(now);
        self.error = Some(error.into());
        Ok(())
    }

    /// Any non-terminal state → cancelled
    pub fn cancel(&mut self, now: DateTime<Utc>, reason: impl Into<String>) -> Result<(), ApiError> {
        if self.status.is_terminal() {
            return Err(self.transition_error(OperationStatus::Cancelled));
        }
        self.status = OperationStatus::Cancelled;
        self.completed_at = Some(now);
        self.error = Some(reason.into());
        self.next_retry_at = None;
        Ok(())
    }

    /// failed → pending, consuming one retry.
    ///
    /// Also accepted on a pending operation (rescheduling). Never exceeds
    /// `max_retries`.
    pub fn reset_for_retry(
        &mut self,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        if !matches!(
            self.status,
            OperationStatus::Failed | OperationStatus::Pending
        ) {
            return Err(self.transition_error(OperationStatus::Pending));
        }
        if self.retry_count >= self.max_retries {
            return Err(ApiError::RetryRejected {
                id: self.id.clone(),
                reason: format!(
                    "retries exhausted ({}/{})",
                    self.retry_count, self.max_retries
                ),
            });
        }
        self.retry_count += 1;
        self.status = OperationStatus::Pending;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        self.next_retry_at = next_retry_at;
        Ok(())
    }

    /// Fresh pending copy with a new id, usable even on terminal operations.
    pub fn clone_for_retry(&self, now: DateTime<Utc>) -> Operation {
        let mut clone = Operation::new_at(self.params.clone(), self.origin, now)
            .with_priority(self.priority)
            .with_dependencies(self.dependencies.clone())
            .with_max_retries(self.max_retries);
        clone.estimated_duration_ms = self.estimated_duration_ms;
        clone
            .metadata
            .insert(META_RETRY_OF.to_string(), Value::String(self.id.clone()));
        clone
    }
}
