//! Configuration and settings management
//!
//! Loads settings from environment variables and layered config files.

use crate::registry::RegistryConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Telegram user id allowed to run admin commands
    pub admin_user_id: i64,

    /// Private source channel the bot watches for media posts
    pub private_channel_id: i64,

    /// Public channel where deep-link posts are published and whose
    /// membership gates downloads
    pub public_channel_id: i64,

    /// Bot username used to build `t.me/<bot>?start=<key>` links
    pub bot_username: String,

    /// Hours a link stays valid after creation
    #[serde(default = "default_file_ttl_hours")]
    pub file_ttl_hours: u64,

    /// Admitted requests per user per trailing hour
    #[serde(default = "default_rate_limit_per_user")]
    pub rate_limit_per_user: usize,

    /// Run an expiry sweep every this many insertions
    #[serde(default = "default_cleanup_every_n_requests")]
    pub cleanup_every_n_requests: u64,

    /// Prune expired records right after the snapshot is loaded
    #[serde(default = "default_auto_cleanup_on_start")]
    pub auto_cleanup_on_start: bool,

    /// Snapshot file path
    #[serde(default = "default_storage_file")]
    pub storage_file: String,

    /// Seconds between periodic snapshot saves
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

const fn default_file_ttl_hours() -> u64 {
    48
}

const fn default_rate_limit_per_user() -> usize {
    10
}

const fn default_cleanup_every_n_requests() -> u64 {
    50
}

const fn default_auto_cleanup_on_start() -> bool {
    true
}

fn default_storage_file() -> String {
    "storage.json".to_string()
}

const fn default_snapshot_interval_secs() -> u64 {
    300
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or a required setting is
    /// missing.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name("config/default").required(false))
            // Add in the current environment file
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Add in a local configuration file
            // This file shouldn't be checked into git
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from the environment (with a prefix of APP)
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Also add settings from environment variables directly.
            // Environment::default() auto-converts UPPER_SNAKE_CASE to
            // snake_case; ignore_empty treats empty env vars as unset.
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Registry parameters derived from the settings.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            ttl: Duration::from_secs(self.file_ttl_hours * 3600),
            rate_limit: self.rate_limit_per_user,
            prune_every: self.cleanup_every_n_requests,
        }
    }

    /// Snapshot cadence as a duration.
    #[must_use]
    pub const fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}
