//! CLI presentation: text and json formatters per command family.

mod conflicts;
mod operations;
mod status;

pub use conflicts::{format_batch_resolution, format_conflict_detail, format_conflicts};
pub use operations::{format_enqueue_outcome, format_operation_detail, format_operations};
pub use status::format_status;

use crate::error::{ApiError, StorageError};
use serde::Serialize;

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ApiError::StorageError(StorageError::Serialize(e.to_string())))
}

/// Shorten long ids for table cells.
pub(crate) fn short_id(id: &str) -> String {
    const KEEP: usize = 18;
    if id.chars().count() <= KEEP {
        id.to_string()
    } else {
        let head: String = id.chars().take(KEEP).collect();
        format!("{}…", head)
    }
}
