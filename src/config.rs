//! Configuration System
//!
//! Layered configuration: built-in defaults, the global file, workspace
//! files, then `OPSYNC__SECTION__KEY` environment variables. Every section
//! validates itself; [`OpsyncConfig::validate`] collects all failures.

use crate::conflict::{DetectorConfig, ResolverConfig};
use crate::coordinator::{CoordinatorConfig, QueueConfig};
use crate::error::ApiError;
use crate::logging::LoggingConfig;
use crate::mailbox::MailboxConfig;
use crate::store::StorageConfig;
use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

mod merge {
    pub mod merge_policy;
}

mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::workspace_file::ENV_NAME_VAR;

/// Prefix of environment overrides, e.g. `OPSYNC__QUEUE__MAX_LIVE_OPERATIONS`.
pub const ENV_PREFIX: &str = "OPSYNC";
pub const ENV_SEPARATOR: &str = "__";

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpsyncConfig {
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A failed check, tagged with the section it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Mailbox(String),
    Queue(String),
    Detector(String),
    Resolver(String),
    Storage(String),
    Coordinator(String),
    Logging(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (section, msg) = match self {
            ValidationError::Mailbox(msg) => ("mailbox", msg),
            ValidationError::Queue(msg) => ("queue", msg),
            ValidationError::Detector(msg) => ("detector", msg),
            ValidationError::Resolver(msg) => ("resolver", msg),
            ValidationError::Storage(msg) => ("storage", msg),
            ValidationError::Coordinator(msg) => ("coordinator", msg),
            ValidationError::Logging(msg) => ("logging", msg),
        };
        write!(f, "[{}] {}", section, msg)
    }
}

impl std::error::Error for ValidationError {}

impl OpsyncConfig {
    /// Validate every section, reporting all failures at once.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let checks = [
            self.mailbox.validate().map_err(ValidationError::Mailbox),
            self.queue.validate().map_err(ValidationError::Queue),
            self.detector.validate().map_err(ValidationError::Detector),
            self.resolver.validate().map_err(ValidationError::Resolver),
            self.storage.validate().map_err(ValidationError::Storage),
            self.coordinator.validate().map_err(ValidationError::Coordinator),
            self.logging.validate().map_err(ValidationError::Logging),
        ];
        let errors: Vec<ValidationError> = checks.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> Result<String, ApiError> {
        toml::to_string_pretty(self)
            .map_err(|e| ApiError::ConfigError(format!("Failed to render configuration: {}", e)))
    }

    /// [`validate`](Self::validate), folded into one `ApiError`.
    pub fn ensure_valid(&self) -> Result<(), ApiError> {
        self.validate().map_err(|errors| {
            let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ApiError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                msgs.join("\n")
            ))
        })
    }
}

/// Builds an [`OpsyncConfig`] from the configured layers.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults → global file → workspace files → environment.
    pub fn load(workspace_root: &Path) -> Result<OpsyncConfig, ConfigError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        builder.add_source(env_source()).build()?.try_deserialize()
    }

    /// Defaults → the given file → environment. Used by `--config`.
    pub fn load_from_file(path: &Path) -> Result<OpsyncConfig, ConfigError> {
        merge::merge_policy::builder_with_defaults()?
            .add_source(File::from(path.to_path_buf()).required(true))
            .add_source(env_source())
            .build()?
            .try_deserialize()
    }

    /// Defaults only, ignoring files and environment.
    pub fn defaults() -> Result<OpsyncConfig, ConfigError> {
        merge::merge_policy::builder_with_defaults()?
            .build()?
            .try_deserialize()
    }

    pub fn global_config_path() -> Option<PathBuf> {
        sources::global_file::global_config_path()
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
