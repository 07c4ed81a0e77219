//! Status formatter.

use super::to_json;
use crate::cli::parse::OutputFormat;
use crate::error::ApiError;
use crate::mailbox::SyncState;
use crate::operation::OperationStatus;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;

fn liveness(online: bool) -> String {
    if online {
        "online".green().to_string()
    } else {
        "offline".red().to_string()
    }
}

pub fn format_status(
    state: &SyncState,
    queue_version: u64,
    format: OutputFormat,
) -> Result<String, ApiError> {
    if format == OutputFormat::Json {
        return to_json(state);
    }
    let mut out = vec![
        format!("{}", "Mailbox status".bold().underline()),
        format!("  queue version:    {}", queue_version),
        format!("  client:           {}", liveness(state.client_online)),
        format!("  worker:           {}", liveness(state.worker_online)),
        format!(
            "  last sync:        {}",
            state
                .last_sync
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        ),
        format!("  active conflicts: {}", state.active_conflicts),
        format!(
            "  throughput:       {:.1}/min, avg {:.0} ms",
            state.performance.throughput_per_minute, state.performance.average_operation_time_ms
        ),
    ];

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Status", "Operations"]);
    for status in OperationStatus::ALL {
        table.add_row(vec![
            status.to_string(),
            state.operation_counts.get(status).to_string(),
        ]);
    }
    out.push(table.to_string());

    if !state.recent_errors.is_empty() {
        out.push(format!("{}", "Recent errors".bold()));
        for error in &state.recent_errors {
            out.push(format!(
                "  {} [{}] {}",
                error.timestamp.format("%H:%M:%S"),
                error.code.red(),
                error.message
            ));
        }
    }
    Ok(out.join("\n"))
}
