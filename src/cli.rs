//! CLI domain: parse, route, output, and presentation only.
//! No domain orchestration; a single route table dispatches to the coordinator.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands, EnqueueArgs, OutputFormat};
pub use route::{build_operation, RunContext};
