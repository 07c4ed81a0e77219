//! Conflict formatters.

use super::{short_id, to_json};
use crate::cli::parse::OutputFormat;
use crate::conflict::{BatchResolution, Conflict, ResolutionStrategy, Severity};
use crate::error::ApiError;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;

fn severity_cell(severity: Severity) -> String {
    match severity {
        Severity::Low => severity.as_str().to_string(),
        Severity::Medium => severity.as_str().yellow().to_string(),
        Severity::High | Severity::Critical => severity.as_str().red().to_string(),
    }
}

fn strategies(list: &[ResolutionStrategy]) -> String {
    list.iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn format_conflicts(conflicts: &[&Conflict], format: OutputFormat) -> Result<String, ApiError> {
    if format == OutputFormat::Json {
        return to_json(conflicts);
    }
    if conflicts.is_empty() {
        return Ok("No conflicts.".to_string());
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Id", "Type", "Severity", "Resource", "Operations", "State", "Recommended",
    ]);
    for conflict in conflicts {
        let state = match (conflict.resolved, conflict.resolution) {
            (true, Some(strategy)) => format!("resolved ({})", strategy),
            (true, None) => "resolved".to_string(),
            (false, _) if conflict.requires_manual => "manual".yellow().to_string(),
            (false, _) if conflict.auto_resolvable => "auto".to_string(),
            (false, _) => "open".to_string(),
        };
        table.add_row(vec![
            short_id(&conflict.id),
            conflict.conflict_type.to_string(),
            severity_cell(conflict.severity),
            conflict.resource_path.clone(),
            conflict.operation_ids.len().to_string(),
            state,
            strategies(&conflict.recommendations),
        ]);
    }
    Ok(table.to_string())
}

pub fn format_conflict_detail(
    conflict: &Conflict,
    ranked: &[ResolutionStrategy],
    format: OutputFormat,
) -> Result<String, ApiError> {
    if format == OutputFormat::Json {
        return to_json(conflict);
    }
    let mut lines = vec![
        format!("{} {}", "Conflict".bold(), conflict.id),
        format!("  type:        {}", conflict.conflict_type),
        format!("  severity:    {}", severity_cell(conflict.severity)),
        format!("  resource:    {}", conflict.resource_path),
        format!("  detected:    {}", conflict.detected_at.to_rfc3339()),
        format!("  description: {}", conflict.description),
        format!("  operations:  {}", conflict.operation_ids.join(", ")),
        format!("  recommended: {}", strategies(ranked)),
    ];
    if conflict.resolved {
        lines.push(format!(
            "  resolved:    {} by {}",
            conflict
                .resolution
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            conflict.resolved_by.as_deref().unwrap_or("-")
        ));
    }
    Ok(lines.join("\n"))
}

pub fn format_batch_resolution(batch: &BatchResolution) -> String {
    let mut lines = vec![format!(
        "Resolved {} conflict(s), {} unresolved",
        batch.resolved.len(),
        batch.failed.len()
    )];
    for (id, reason) in &batch.failed {
        lines.push(format!("  {} {}: {}", "unresolved".yellow(), id, reason));
    }
    lines.join("\n")
}
