//! Operation validation: structural checks, kind-specific parameter checks,
//! and advisory business rules.
//!
//! Errors make an operation unqueueable. Warnings never block anything; they
//! are handed back to whoever enqueued the operation.

use crate::error::ApiError;
use crate::operation::{
    Operation, OperationKind, OperationParams, OperationStatus, Origin, Priority,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

pub const MAX_SPEC_ID_LEN: usize = 50;
pub const MAX_CONTENT_CHARS: usize = 100_000;
pub const LARGE_CONTENT_CHARS: usize = 50_000;
pub const MAX_NAME_CHARS: usize = 200;
pub const MAX_DEPENDENCIES: usize = 10;
pub const STALE_AFTER_HOURS: i64 = 24;
pub const FUTURE_TOLERANCE_SECS: i64 = 60;
pub const LONG_DURATION_MS: u64 = 5 * 60 * 1000;

static OPERATION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{9,127}$").expect("valid regex"));
static SPEC_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*[a-z0-9]$").expect("valid regex"));
static TASK_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+)*$").expect("valid regex"));

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Outcome of validating one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn error(&mut self, field: &str, code: &str, message: impl Into<String>) {
        self.errors.push(ValidationIssue::new(field, code, message));
    }

    fn warn(&mut self, field: &str, code: &str, message: impl Into<String>) {
        self.warnings.push(ValidationIssue::new(field, code, message));
    }

    fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self
    }

    pub fn has_error(&self, code: &str) -> bool {
        self.errors.iter().any(|i| i.code == code)
    }

    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|i| i.code == code)
    }

    /// Warnings on success, a joined `ApiError::Validation` otherwise.
    pub fn into_result(self) -> Result<Vec<ValidationIssue>, ApiError> {
        if self.valid {
            Ok(self.warnings)
        } else {
            let joined = self
                .errors
                .iter()
                .map(|i| format!("{}: {}", i.field, i.message))
                .collect::<Vec<_>>()
                .join("; ");
            Err(ApiError::Validation(joined))
        }
    }
}

/// Validates operations before they reach the queue.
#[derive(Debug, Clone, Default)]
pub struct OperationValidator;

impl OperationValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a typed operation.
    pub fn validate(&self, op: &Operation, now: DateTime<Utc>) -> ValidationReport {
        let mut report = ValidationReport::default();
        self.check_structure(op, &mut report);
        self.check_params(&op.params, &mut report);
        self.check_business_rules(op, now, &mut report);
        report.finish()
    }

    /// Validate an operation as it appears in a mailbox document.
    ///
    /// Enumerations, timestamps and counters are checked on the raw JSON so a
    /// peer gets field-level errors instead of a single decode failure. When
    /// the raw checks pass, the typed checks run as well.
    pub fn validate_value(&self, value: &Value, now: DateTime<Utc>) -> ValidationReport {
        let mut report = ValidationReport::default();
        let Some(obj) = value.as_object() else {
            report.error("operation", "NOT_AN_OBJECT", "operation must be a JSON object");
            return report.finish();
        };

        match obj.get("id").and_then(Value::as_str) {
            Some(id) if OPERATION_ID.is_match(id) => {}
            Some(id) => report.error(
                "id",
                "INVALID_ID",
                format!("'{}' must be 10-128 characters of [A-Za-z0-9_.:-]", id),
            ),
            None => report.error("id", "INVALID_ID", "id is required"),
        }

        let kind = obj
            .get("params")
            .and_then(|p| p.get("kind"))
            .and_then(Value::as_str);
        match kind {
            Some(k) if k.parse::<OperationKind>().is_ok() => {}
            Some(k) => report.error("params.kind", "INVALID_KIND", format!("unknown kind '{}'", k)),
            None => report.error("params.kind", "INVALID_KIND", "kind is required"),
        }

        check_enum::<OperationStatus>(obj.get("status"), "status", "INVALID_STATUS", true, &mut report);
        check_enum::<Priority>(obj.get("priority"), "priority", "INVALID_PRIORITY", false, &mut report);
        check_enum::<Origin>(obj.get("origin"), "origin", "INVALID_ORIGIN", true, &mut report);

        for (field, required) in [
            ("timestamp", true),
            ("startedAt", false),
            ("completedAt", false),
            ("nextRetryAt", false),
        ] {
            match obj.get(field) {
                None | Some(Value::Null) if !required => {}
                Some(Value::String(raw)) if DateTime::parse_from_rfc3339(raw).is_ok() => {}
                Some(other) => report.error(
                    field,
                    "INVALID_TIMESTAMP",
                    format!("{} must be an ISO-8601 timestamp, got {}", field, other),
                ),
                None => report.error(field, "INVALID_TIMESTAMP", format!("{} is required", field)),
            }
        }

        let retry_count = check_counter(obj.get("retryCount"), "retryCount", &mut report);
        let max_retries = check_counter(obj.get("maxRetries"), "maxRetries", &mut report);
        if let (Some(count), Some(max)) = (retry_count, max_retries) {
            if count > max {
                report.error(
                    "retryCount",
                    "RETRY_COUNT_EXCEEDED",
                    format!("retryCount {} exceeds maxRetries {}", count, max),
                );
            }
        }

        if !report.errors.is_empty() {
            return report.finish();
        }

        match serde_json::from_value::<Operation>(value.clone()) {
            Ok(op) => {
                let typed = self.validate(&op, now);
                report.errors.extend(typed.errors);
                report.warnings.extend(typed.warnings);
            }
            Err(e) => report.error("params", "INVALID_PARAMS", e.to_string()),
        }
        report.finish()
    }

    fn check_structure(&self, op: &Operation, report: &mut ValidationReport) {
        if !OPERATION_ID.is_match(&op.id) {
            report.error(
                "id",
                "INVALID_ID",
                format!("'{}' must be 10-128 characters of [A-Za-z0-9_.:-]", op.id),
            );
        }
        if op.retry_count > op.max_retries {
            report.error(
                "retryCount",
                "RETRY_COUNT_EXCEEDED",
                format!(
                    "retryCount {} exceeds maxRetries {}",
                    op.retry_count, op.max_retries
                ),
            );
        }
    }

    fn check_params(&self, params: &OperationParams, report: &mut ValidationReport) {
        if let Some(spec_id) = params.spec_id() {
            check_spec_id(spec_id, report);
        }
        if let Some(content) = params.content() {
            let chars = content.chars().count();
            if chars > MAX_CONTENT_CHARS {
                report.error(
                    "params.content",
                    "CONTENT_TOO_LONG",
                    format!("content has {} characters (max {})", chars, MAX_CONTENT_CHARS),
                );
            } else if chars > LARGE_CONTENT_CHARS {
                report.warn(
                    "params.content",
                    "LARGE_CONTENT",
                    format!("content has {} characters", chars),
                );
            }
        }
        match params {
            OperationParams::CreateSpec { name, .. } => {
                if name.trim().is_empty() {
                    report.error("params.name", "EMPTY_FIELD", "name must not be empty");
                } else if name.chars().count() > MAX_NAME_CHARS {
                    report.error(
                        "params.name",
                        "FIELD_TOO_LONG",
                        format!("name exceeds {} characters", MAX_NAME_CHARS),
                    );
                }
            }
            OperationParams::AddUserStory {
                as_a,
                i_want,
                so_that,
                ..
            } => {
                for (field, value) in [
                    ("params.asA", as_a),
                    ("params.iWant", i_want),
                    ("params.soThat", so_that),
                ] {
                    if value.trim().is_empty() {
                        report.error(field, "EMPTY_FIELD", format!("{} must not be empty", field));
                    }
                }
            }
            OperationParams::UpdateTaskStatus { task_number, .. } => {
                if !TASK_NUMBER.is_match(task_number) {
                    report.error(
                        "params.taskNumber",
                        "INVALID_TASK_NUMBER",
                        format!("'{}' must look like 1 or 2.3.1", task_number),
                    );
                }
            }
            _ => {}
        }
    }

    fn check_business_rules(&self, op: &Operation, now: DateTime<Utc>, report: &mut ValidationReport) {
        if now - op.timestamp > ChronoDuration::hours(STALE_AFTER_HOURS) {
            report.warn(
                "timestamp",
                "STALE_OPERATION",
                format!("operation is older than {} hours", STALE_AFTER_HOURS),
            );
        }
        if op.timestamp - now > ChronoDuration::seconds(FUTURE_TOLERANCE_SECS) {
            report.warn(
                "timestamp",
                "FUTURE_TIMESTAMP",
                "timestamp is more than 60 seconds in the future",
            );
        }
        if op.max_retries > 0 && op.retry_count >= op.max_retries {
            report.warn("retryCount", "RETRIES_EXHAUSTED", "no retries left");
        }
        if op.dependencies.len() > MAX_DEPENDENCIES {
            report.warn(
                "dependencies",
                "TOO_MANY_DEPENDENCIES",
                format!("{} dependencies (advisory max {})", op.dependencies.len(), MAX_DEPENDENCIES),
            );
        }
        let mut seen = HashSet::new();
        for dep in &op.dependencies {
            if dep == &op.id {
                report.error("dependencies", "SELF_DEPENDENCY", "operation depends on itself");
            } else if !seen.insert(dep.as_str()) {
                report.error(
                    "dependencies",
                    "DUPLICATE_DEPENDENCY",
                    format!("dependency '{}' listed twice", dep),
                );
            }
        }
        if op.estimated_duration_ms.map_or(false, |ms| ms > LONG_DURATION_MS) {
            report.warn(
                "estimatedDurationMs",
                "LONG_DURATION",
                "estimated duration exceeds 5 minutes",
            );
        }
    }
}

fn check_spec_id(spec_id: &str, report: &mut ValidationReport) {
    if spec_id.len() > MAX_SPEC_ID_LEN {
        report.error(
            "params.specId",
            "INVALID_SPEC_ID",
            format!("'{}' exceeds {} characters", spec_id, MAX_SPEC_ID_LEN),
        );
    } else if !SPEC_ID.is_match(spec_id) {
        report.error(
            "params.specId",
            "INVALID_SPEC_ID",
            format!("'{}' must be lowercase alphanumerics and dashes", spec_id),
        );
    }
}

fn check_enum<T: serde::de::DeserializeOwned>(
    value: Option<&Value>,
    field: &str,
    code: &str,
    required: bool,
    report: &mut ValidationReport,
) {
    match value {
        None if !required => {}
        None => report.error(field, code, format!("{} is required", field)),
        Some(v) => {
            if serde_json::from_value::<T>(v.clone()).is_err() {
                report.error(field, code, format!("{} has unknown value {}", field, v));
            }
        }
    }
}

fn check_counter(value: Option<&Value>, field: &str, report: &mut ValidationReport) -> Option<u64> {
    match value {
        None => None,
        Some(v) => match v.as_u64() {
            Some(n) => Some(n),
            None => {
                report.error(
                    field,
                    "INVALID_RETRY_COUNT",
                    format!("{} must be a non-negative integer, got {}", field, v),
                );
                None
            }
        },
    }
}
