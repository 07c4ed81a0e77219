//! Shared test utilities for integration tests

use chrono::{DateTime, Utc};
use opsync::config::OpsyncConfig;
use opsync::coordinator::QueueCoordinator;
use opsync::operation::{Operation, OperationParams, Origin};
use opsync::worker::{ExecutionFailure, ExecutionOutput, OperationExecutor};
use std::sync::{Mutex, MutexGuard};
use tempfile::TempDir;

/// Serializes tests that read or write process environment variables.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Environment overrides restored (and the mutex released) on drop.
pub struct EnvScope {
    saved: Vec<(String, Option<String>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvScope {
    pub fn new(vars: &[(&str, &str)]) -> Self {
        let guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let saved = vars
            .iter()
            .map(|(key, value)| {
                let old = std::env::var(key).ok();
                std::env::set_var(key, value);
                (key.to_string(), old)
            })
            .collect();
        Self {
            saved,
            _guard: guard,
        }
    }
}

impl Drop for EnvScope {
    fn drop(&mut self) {
        for (key, old) in &self.saved {
            match old {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Config for a peer with a short poll interval.
pub fn fast_config(peer: Origin) -> OpsyncConfig {
    let mut config = OpsyncConfig::default();
    config.mailbox.peer = peer;
    config.coordinator.poll_interval_ms = 10;
    config
}

pub fn open_coordinator(temp_dir: &TempDir, config: &OpsyncConfig) -> QueueCoordinator {
    QueueCoordinator::open(temp_dir.path(), config).unwrap()
}

pub fn update_requirements(spec: &str, content: &str, at: DateTime<Utc>) -> Operation {
    Operation::new_at(
        OperationParams::UpdateRequirements {
            spec_id: spec.to_string(),
            content: content.to_string(),
            version: None,
        },
        Origin::Client,
        at,
    )
}

pub fn set_current(spec: &str) -> Operation {
    Operation::new(
        OperationParams::SetCurrentSpec {
            spec_id: spec.to_string(),
        },
        Origin::Client,
    )
}

/// Executor that replays scripted outcomes, then succeeds.
pub struct ScriptedExecutor {
    pub failures: std::collections::VecDeque<ExecutionFailure>,
    pub executed: Vec<String>,
}

impl ScriptedExecutor {
    pub fn succeeding() -> Self {
        Self {
            failures: Default::default(),
            executed: Vec::new(),
        }
    }

    pub fn failing(times: usize, failure: ExecutionFailure) -> Self {
        Self {
            failures: std::iter::repeat(failure).take(times).collect(),
            executed: Vec::new(),
        }
    }
}

impl OperationExecutor for ScriptedExecutor {
    fn execute(&mut self, op: &Operation) -> Result<ExecutionOutput, ExecutionFailure> {
        self.executed.push(op.id.clone());
        match self.failures.pop_front() {
            Some(failure) => Err(failure),
            None => Ok(ExecutionOutput::new(format!("{} applied", op.kind()))
                .with_data(serde_json::json!({ "operationId": op.id }))),
        }
    }
}
