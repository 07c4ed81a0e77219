//! Integration tests for layered configuration and the CLI routes built on it

use super::test_utils::EnvScope;
use clap::Parser;
use opsync::cli::{Cli, RunContext};
use opsync::config::{ConfigLoader, OpsyncConfig, ENV_NAME_VAR};
use opsync::conflict::ResolutionStrategy;
use opsync::error::ApiError;
use opsync::operation::{OperationStatus, Origin};
use std::fs;
use tempfile::TempDir;

fn isolated_env(temp_dir: &TempDir) -> EnvScope {
    let xdg = temp_dir.path().join("xdg");
    let xdg = xdg.to_string_lossy().to_string();
    EnvScope::new(&[("XDG_CONFIG_HOME", xdg.as_str()), (ENV_NAME_VAR, "test")])
}

fn run(ctx: &mut RunContext, args: &[&str]) -> Result<String, ApiError> {
    let mut argv = vec!["opsync"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).unwrap();
    ctx.execute(&cli.command)
}

#[test]
fn test_workspace_file_and_env_layers() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("ws");
    fs::create_dir_all(workspace.join("config")).unwrap();
    fs::write(
        workspace.join("config").join("config.toml"),
        r#"
[mailbox]
peer = "worker"

[queue]
max_live_operations = 10

[storage]
mailbox_dir = ".mailbox"
"#,
    )
    .unwrap();

    let _env = {
        let xdg = temp_dir.path().join("xdg").to_string_lossy().to_string();
        EnvScope::new(&[
            ("XDG_CONFIG_HOME", xdg.as_str()),
            (ENV_NAME_VAR, "test"),
            ("OPSYNC__QUEUE__MAX_LIVE_OPERATIONS", "42"),
        ])
    };
    let config = ConfigLoader::load(&workspace).unwrap();
    assert_eq!(config.mailbox.peer, Origin::Worker);
    assert_eq!(config.queue.max_live_operations, 42);
    assert_eq!(config.storage.mailbox_dir, std::path::PathBuf::from(".mailbox"));
    assert!(config.validate().is_ok());
}

#[test]
fn test_invalid_file_values_fail_validation() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("bad.toml");
    fs::write(
        &file,
        "[queue.retry]\nbase_delay_ms = 60000\n\n[detector]\nsimilarity_threshold = 1.5\n",
    )
    .unwrap();

    let _env = isolated_env(&temp_dir);
    let config = ConfigLoader::load_from_file(&file).unwrap();
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 2);

    let ctx = RunContext::new(temp_dir.path().to_path_buf(), Some(file));
    assert!(matches!(ctx, Err(ApiError::ConfigError(_))));
}

#[test]
fn test_config_command_prints_effective_toml() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("opsync.toml");
    fs::write(&file, "[coordinator]\npoll_interval_ms = 250\n").unwrap();

    let _env = isolated_env(&temp_dir);
    let mut ctx = RunContext::new(temp_dir.path().to_path_buf(), Some(file)).unwrap();
    let rendered = run(&mut ctx, &["config"]).unwrap();
    let parsed: OpsyncConfig = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed.coordinator.poll_interval_ms, 250);
    assert_eq!(parsed.queue, OpsyncConfig::default().queue);
}

#[test]
fn test_resolve_duplicate_through_cli() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = OpsyncConfig::default();
    config.coordinator.auto_resolve = false;
    let mut ctx = RunContext::with_config(temp_dir.path().to_path_buf(), config).unwrap();

    let enqueue = [
        "enqueue",
        "update-design",
        "--spec",
        "spec-a",
        "--content",
        "Same design",
        "--format",
        "json",
    ];
    run(&mut ctx, &enqueue).unwrap();
    let second: serde_json::Value = serde_json::from_str(&run(&mut ctx, &enqueue).unwrap()).unwrap();
    let conflict_id = second["conflicts"][0]["id"].as_str().unwrap().to_string();

    let shown: serde_json::Value =
        serde_json::from_str(&run(&mut ctx, &["show", conflict_id.as_str()]).unwrap()).unwrap();
    assert_eq!(shown["type"], "duplicate");

    let listed: serde_json::Value =
        serde_json::from_str(&run(&mut ctx, &["conflicts", "--format", "json"]).unwrap()).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let out = run(&mut ctx, &["resolve", conflict_id.as_str(), "--strategy", "cancel"]).unwrap();
    assert!(out.contains("resolved"));
    let conflict = ctx.coordinator().get_conflict_by_id(&conflict_id).unwrap();
    assert_eq!(conflict.resolution, Some(ResolutionStrategy::CancelConflicting));
    let cancelled = ctx
        .coordinator()
        .get_queue()
        .operations
        .iter()
        .filter(|op| op.status == OperationStatus::Cancelled)
        .count();
    assert_eq!(cancelled, 1);

    let status: serde_json::Value =
        serde_json::from_str(&run(&mut ctx, &["status", "--format", "json"]).unwrap()).unwrap();
    assert!(status.is_object());

    let unknown = run(&mut ctx, &["resolve", conflict_id.as_str(), "--strategy", "coin-flip"]);
    assert!(matches!(unknown, Err(ApiError::Validation(_))));
}
