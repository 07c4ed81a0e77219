//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::ApiError;

/// Render an error for stderr: the message, the stable storage code when
/// there is one, and recovery hints.
pub fn map_error(e: &ApiError) -> String {
    match e {
        ApiError::StorageError(storage) => {
            let mut out = format!("error[{}]: {}", storage.code(), storage);
            for hint in storage.recovery_suggestions() {
                out.push_str(&format!("\n  hint: {}", hint));
            }
            out
        }
        ApiError::ConcurrentUpdate { .. } => {
            format!("error: {}\n  hint: the other peer is busy; retry the command", e)
        }
        _ => format!("error: {}", e),
    }
}
