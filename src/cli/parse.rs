//! CLI parse: clap types for opsync. No behavior; definitions only.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// opsync - file-mailbox operation queue shared by a client and a worker
#[derive(Parser, Debug)]
#[command(name = "opsync")]
#[command(about = "Queue, reconcile and resolve operations exchanged through a file mailbox")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory (the mailbox lives under it)
    #[arg(long, global = true, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Disable logging entirely
    #[arg(long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long, global = true)]
    pub log_output: Option<String>,

    /// Log file path (when output is "file")
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue counts, peer liveness and recent errors
    Status {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// List operations in processing order (eligible first)
    List {
        /// Only operations in this status (pending, in-progress, completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Show one operation, or one conflict when the id is a conflict id
    Show {
        id: String,
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    /// Validate and enqueue a new operation
    Enqueue(EnqueueArgs),
    /// Retry a failed operation, or re-queue a completed/cancelled one
    Retry { id: String },
    /// Cancel a pending, in-progress or failed operation
    Cancel {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// List active conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Resolve a conflict with a strategy, or keep only the given operations
    Resolve {
        conflict_id: String,
        /// Strategy (merge, prefer-newer, cancel, defer, ...); defaults to the top recommendation
        #[arg(long, conflicts_with = "keep")]
        strategy: Option<String>,
        /// Operation ids to keep; every other party is cancelled
        #[arg(long, num_args = 1..)]
        keep: Vec<String>,
    },
    /// Resolve every auto-resolvable conflict
    AutoResolve,
    /// Drop resolved conflicts older than the given age
    Cleanup {
        #[arg(long, default_value_t = 24)]
        max_age_hours: i64,
    },
    /// Remove aged completed/cancelled operations nothing depends on
    Compact {
        #[arg(long, default_value_t = 24)]
        max_age_hours: i64,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Run the coordinator loop until interrupted
    Watch {
        /// Poll interval override
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// Operation kind (create-spec, update-requirements, update-design, ...)
    pub kind: String,

    /// Spec identifier (lowercase, dash separated)
    #[arg(long)]
    pub spec: Option<String>,

    /// Document content for update-* kinds
    #[arg(long, conflicts_with = "content_file")]
    pub content: Option<String>,

    /// Read document content from a file
    #[arg(long)]
    pub content_file: Option<PathBuf>,

    /// Expected document version for update-* kinds
    #[arg(long)]
    pub version: Option<u64>,

    /// Spec name for create-spec
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// User story role (add-user-story)
    #[arg(long)]
    pub as_a: Option<String>,

    /// User story goal (add-user-story)
    #[arg(long)]
    pub i_want: Option<String>,

    /// User story benefit (add-user-story)
    #[arg(long)]
    pub so_that: Option<String>,

    /// Acceptance requirement (add-user-story), repeatable
    #[arg(long = "requirement")]
    pub requirements: Vec<String>,

    /// Task number such as 2.1 (update-task-status)
    #[arg(long)]
    pub task: Option<String>,

    /// Task state: not-started, in-progress, completed (update-task-status)
    #[arg(long)]
    pub task_status: Option<String>,

    /// low, normal, high, urgent
    #[arg(long, default_value = "normal")]
    pub priority: String,

    /// Operation ids that must complete first
    #[arg(long = "depends-on")]
    pub depends_on: Vec<String>,

    /// Retry budget; defaults to queue.default_max_retries
    #[arg(long)]
    pub max_retries: Option<u32>,

    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl Commands {
    /// Stable command name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Status { .. } => "status",
            Commands::List { .. } => "list",
            Commands::Show { .. } => "show",
            Commands::Enqueue(_) => "enqueue",
            Commands::Retry { .. } => "retry",
            Commands::Cancel { .. } => "cancel",
            Commands::Conflicts { .. } => "conflicts",
            Commands::Resolve { .. } => "resolve",
            Commands::AutoResolve => "auto-resolve",
            Commands::Cleanup { .. } => "cleanup",
            Commands::Compact { .. } => "compact",
            Commands::Config => "config",
            Commands::Watch { .. } => "watch",
        }
    }
}
