//! Operation formatters: list, detail, enqueue outcome.

use super::{short_id, to_json};
use crate::cli::parse::OutputFormat;
use crate::coordinator::EnqueueOutcome;
use crate::error::ApiError;
use crate::operation::{Operation, OperationStatus};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde_json::json;

fn status_cell(status: OperationStatus) -> String {
    match status {
        OperationStatus::Pending => status.to_string(),
        OperationStatus::InProgress => status.cyan().to_string(),
        OperationStatus::Completed => status.green().to_string(),
        OperationStatus::Failed => status.red().to_string(),
        OperationStatus::Cancelled => status.dimmed().to_string(),
    }
}

pub fn format_operations(ops: &[&Operation], format: OutputFormat) -> Result<String, ApiError> {
    if format == OutputFormat::Json {
        return to_json(ops);
    }
    if ops.is_empty() {
        return Ok("No operations.".to_string());
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Id", "Kind", "Resource", "Status", "Priority", "Retries", "Created",
    ]);
    for op in ops {
        let mut status = status_cell(op.status);
        if !op.conflict_ids.is_empty() && !op.is_terminal() {
            status.push_str(" ⚠");
        }
        table.add_row(vec![
            short_id(&op.id),
            op.kind().to_string(),
            op.resource_path(),
            status,
            op.priority.to_string(),
            format!("{}/{}", op.retry_count, op.max_retries),
            op.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    Ok(format!("{}\n{} operation(s)", table, ops.len()))
}

pub fn format_operation_detail(op: &Operation, format: OutputFormat) -> Result<String, ApiError> {
    if format == OutputFormat::Json {
        return to_json(op);
    }
    let mut lines = vec![
        format!("{} {}", "Operation".bold(), op.id),
        format!("  kind:      {}", op.kind()),
        format!("  resource:  {}", op.resource_path()),
        format!("  status:    {}", status_cell(op.status)),
        format!("  priority:  {}", op.priority),
        format!("  origin:    {}", op.origin),
        format!("  retries:   {}/{}", op.retry_count, op.max_retries),
        format!("  created:   {}", op.timestamp.to_rfc3339()),
    ];
    if let Some(at) = op.next_retry_at {
        lines.push(format!("  next retry: {}", at.to_rfc3339()));
    }
    if !op.dependencies.is_empty() {
        lines.push(format!("  depends on: {}", op.dependencies.join(", ")));
    }
    if !op.conflict_ids.is_empty() {
        lines.push(format!("  conflicts: {}", op.conflict_ids.join(", ")));
    }
    if let Some(error) = &op.error {
        lines.push(format!("  error:     {}", error.red()));
    }
    Ok(lines.join("\n"))
}

pub fn format_enqueue_outcome(
    outcome: &EnqueueOutcome,
    format: OutputFormat,
) -> Result<String, ApiError> {
    if format == OutputFormat::Json {
        return to_json(&json!({
            "operationId": outcome.operation_id,
            "warnings": outcome.warnings,
            "conflicts": outcome.conflicts,
            "autoResolved": outcome.auto_resolved,
        }));
    }
    let mut lines = vec![format!("Enqueued {}", outcome.operation_id.green())];
    for warning in &outcome.warnings {
        lines.push(format!("  {} {}: {}", "warning".yellow(), warning.field, warning.message));
    }
    for conflict in &outcome.conflicts {
        let state = if outcome.auto_resolved.contains(&conflict.id) {
            "auto-resolved".green().to_string()
        } else {
            "needs attention".yellow().to_string()
        };
        lines.push(format!(
            "  conflict {} ({}): {}",
            conflict.id, conflict.conflict_type, state
        ));
    }
    Ok(lines.join("\n"))
}
