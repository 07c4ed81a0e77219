//! CLI route: single route table and run context. Dispatches to the
//! coordinator and presentation.

use crate::cli::parse::{Commands, EnqueueArgs};
use crate::cli::presentation::{
    format_batch_resolution, format_conflict_detail, format_conflicts, format_enqueue_outcome,
    format_operation_detail, format_operations, format_status,
};
use crate::config::{ConfigLoader, OpsyncConfig};
use crate::conflict::ResolutionStrategy;
use crate::coordinator::QueueCoordinator;
use crate::error::ApiError;
use crate::operation::{
    Operation, OperationKind, OperationParams, OperationStatus, Priority, TaskState,
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

const CLI_RESOLVER: &str = "cli";

/// Runtime context for CLI execution: workspace, loaded config and the coordinator.
pub struct RunContext {
    workspace_root: PathBuf,
    config: OpsyncConfig,
    coordinator: QueueCoordinator,
}

impl RunContext {
    /// Load and validate configuration, then open the mailbox.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ApiError> {
        let config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        Self::with_config(workspace_root, config)
    }

    pub fn with_config(workspace_root: PathBuf, config: OpsyncConfig) -> Result<Self, ApiError> {
        config.ensure_valid()?;
        let coordinator = QueueCoordinator::open(&workspace_root, &config)?;
        Ok(Self {
            workspace_root,
            config,
            coordinator,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn coordinator(&self) -> &QueueCoordinator {
        &self.coordinator
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&mut self, command: &Commands) -> Result<String, ApiError> {
        let started = Instant::now();
        let result = self.execute_inner(command);
        debug!(
            command = command.name(),
            ok = result.is_ok(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        result
    }

    fn execute_inner(&mut self, command: &Commands) -> Result<String, ApiError> {
        match command {
            Commands::Status { format } => {
                self.coordinator.refresh()?;
                let state = self.coordinator.get_sync_state()?;
                format_status(&state, self.coordinator.get_queue().version, *format)
            }
            Commands::List { status, format } => {
                let filter = status
                    .as_deref()
                    .map(str::parse::<OperationStatus>)
                    .transpose()
                    .map_err(ApiError::Validation)?;
                let queue = self.coordinator.refresh()?;
                let mut ops: Vec<&Operation> = queue
                    .operations
                    .iter()
                    .filter(|op| filter.map_or(true, |s| op.status == s))
                    .collect();
                ops.sort_by(|a, b| crate::coordinator::processing_cmp(a, b));
                format_operations(&ops, *format)
            }
            Commands::Show { id, format } => {
                self.coordinator.refresh()?;
                if let Some(op) = self.coordinator.get_operation(id) {
                    return format_operation_detail(op, *format);
                }
                let conflict = self
                    .coordinator
                    .get_conflict_by_id(id)
                    .ok_or_else(|| ApiError::OperationNotFound(id.clone()))?;
                let ranked = self.coordinator.resolver().recommend_strategies(conflict);
                format_conflict_detail(conflict, &ranked, *format)
            }
            Commands::Enqueue(args) => {
                let op = build_operation(args, &self.config)?;
                let outcome = self.coordinator.enqueue(op)?;
                format_enqueue_outcome(&outcome, args.format)
            }
            Commands::Retry { id } => {
                let retry_id = self.coordinator.retry(id)?;
                if &retry_id == id {
                    Ok(format!("Operation {} scheduled for retry", id))
                } else {
                    Ok(format!("Operation {} re-queued as {}", id, retry_id))
                }
            }
            Commands::Cancel { id, reason } => {
                self.coordinator.cancel(id, reason.as_deref())?;
                Ok(format!("Operation {} cancelled", id))
            }
            Commands::Conflicts { all, format } => {
                let queue = self.coordinator.refresh()?;
                let conflicts: Vec<_> = queue
                    .conflicts
                    .iter()
                    .filter(|c| *all || !c.resolved)
                    .collect();
                format_conflicts(&conflicts, *format)
            }
            Commands::Resolve {
                conflict_id,
                strategy,
                keep,
            } => {
                if !keep.is_empty() {
                    self.coordinator
                        .apply_manual_decision(conflict_id, keep, CLI_RESOLVER)?;
                    return Ok(format!(
                        "Conflict {} resolved, kept {}",
                        conflict_id,
                        keep.join(", ")
                    ));
                }
                let strategy = strategy
                    .as_deref()
                    .map(str::parse::<ResolutionStrategy>)
                    .transpose()
                    .map_err(ApiError::Validation)?;
                if self
                    .coordinator
                    .resolve_conflict(conflict_id, strategy, CLI_RESOLVER)?
                {
                    Ok(format!("Conflict {} resolved", conflict_id))
                } else {
                    Ok(format!(
                        "Conflict {} remains open; run `opsync show {}` for recommendations",
                        conflict_id, conflict_id
                    ))
                }
            }
            Commands::AutoResolve => {
                let batch = self.coordinator.auto_resolve_all_conflicts(CLI_RESOLVER)?;
                Ok(format_batch_resolution(&batch))
            }
            Commands::Cleanup { max_age_hours } => {
                let removed = self.coordinator.cleanup_resolved_conflicts(*max_age_hours)?;
                let files = self.coordinator.store().cleanup()?;
                Ok(format!(
                    "Removed {} resolved conflict(s), {} orphaned temp file(s)",
                    removed,
                    files.temp_files.len()
                ))
            }
            Commands::Compact { max_age_hours } => {
                let report = self.coordinator.compact(*max_age_hours)?;
                Ok(format!(
                    "Removed {} operation(s)",
                    report.removed_operations.len()
                ))
            }
            Commands::Config => self.config.to_toml(),
            Commands::Watch { interval_ms } => self.watch(*interval_ms),
        }
    }

    fn watch(&mut self, interval_ms: Option<u64>) -> Result<String, ApiError> {
        if let Some(ms) = interval_ms {
            let mut config = self.config.clone();
            config.coordinator.poll_interval_ms = ms;
            config.ensure_valid()?;
            self.coordinator = QueueCoordinator::open(&self.workspace_root, &config)?;
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ApiError::ConfigError(format!("Failed to start runtime: {}", e)))?;
        info!(workspace = %self.workspace_root.display(), "Watching mailbox, Ctrl-C to stop");
        let coordinator = &mut self.coordinator;
        runtime.block_on(coordinator.run(async {
            let _ = tokio::signal::ctrl_c().await;
        }))?;
        Ok("Stopped watching".to_string())
    }
}

/// Translate `enqueue` arguments into an operation.
pub fn build_operation(args: &EnqueueArgs, config: &OpsyncConfig) -> Result<Operation, ApiError> {
    let kind: OperationKind = args.kind.parse().map_err(ApiError::Validation)?;
    let priority: Priority = args.priority.parse().map_err(ApiError::Validation)?;
    let params = build_params(kind, args)?;
    let max_retries = args
        .max_retries
        .unwrap_or(config.queue.default_max_retries);
    Ok(Operation::new(params, config.mailbox.peer)
        .with_priority(priority)
        .with_dependencies(args.depends_on.clone())
        .with_max_retries(max_retries))
}

fn build_params(kind: OperationKind, args: &EnqueueArgs) -> Result<OperationParams, ApiError> {
    let spec = || required(&args.spec, "--spec", kind);
    Ok(match kind {
        OperationKind::CreateSpec => OperationParams::CreateSpec {
            spec_id: spec()?,
            name: required(&args.name, "--name", kind)?,
            description: args.description.clone(),
        },
        OperationKind::UpdateRequirements => OperationParams::UpdateRequirements {
            spec_id: spec()?,
            content: content(args, kind)?,
            version: args.version,
        },
        OperationKind::UpdateDesign => OperationParams::UpdateDesign {
            spec_id: spec()?,
            content: content(args, kind)?,
            version: args.version,
        },
        OperationKind::UpdateTasks => OperationParams::UpdateTasks {
            spec_id: spec()?,
            content: content(args, kind)?,
            version: args.version,
        },
        OperationKind::AddUserStory => OperationParams::AddUserStory {
            spec_id: spec()?,
            as_a: required(&args.as_a, "--as-a", kind)?,
            i_want: required(&args.i_want, "--i-want", kind)?,
            so_that: required(&args.so_that, "--so-that", kind)?,
            requirements: args.requirements.clone(),
        },
        OperationKind::UpdateTaskStatus => {
            let status: TaskState = required(&args.task_status, "--task-status", kind)?
                .parse()
                .map_err(ApiError::Validation)?;
            OperationParams::UpdateTaskStatus {
                spec_id: spec()?,
                task_number: required(&args.task, "--task", kind)?,
                status,
            }
        }
        OperationKind::DeleteSpec => OperationParams::DeleteSpec { spec_id: spec()? },
        OperationKind::SetCurrentSpec => OperationParams::SetCurrentSpec { spec_id: spec()? },
        OperationKind::SyncStatus => OperationParams::SyncStatus {},
        OperationKind::Heartbeat => OperationParams::Heartbeat {},
    })
}

fn required(value: &Option<String>, flag: &str, kind: OperationKind) -> Result<String, ApiError> {
    value
        .clone()
        .ok_or_else(|| ApiError::Validation(format!("{} requires {}", kind, flag)))
}

fn content(args: &EnqueueArgs, kind: OperationKind) -> Result<String, ApiError> {
    match (&args.content, &args.content_file) {
        (Some(text), _) => Ok(text.clone()),
        (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
            ApiError::Validation(format!("Cannot read content file {:?}: {}", path, e))
        }),
        (None, None) => Err(ApiError::Validation(format!(
            "{} requires --content or --content-file",
            kind
        ))),
    }
}
