//! Built-in defaults, the lowest layer of the merge.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError};

/// Create a builder seeded with the defaults every other layer overrides.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("mailbox.peer", "client")?
        .set_default("storage.mailbox_dir", ".opsync")?
        .set_default("storage.queue_file", "queue.json")?
        .set_default("storage.sync_state_file", "sync-state.json")?
        .set_default("storage.results_file", "results.json")?
        .set_default("coordinator.poll_interval_ms", 1000)
}
