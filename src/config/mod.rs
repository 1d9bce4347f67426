//! Configuration management for EventLoom
//!
//! This module provides configuration loading, saving, and global state
//! management. Configuration is loaded from `~/.eventloom/config.json` with
//! environment variable overrides.

mod types;

pub use types::*;

use crate::error::{LoomError, Result};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::RwLock;

/// Global configuration instance
static CONFIG: OnceCell<RwLock<Config>> = OnceCell::new();

impl Config {
    /// Returns the EventLoom configuration directory path (~/.eventloom)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".eventloom")
    }

    /// Returns the path to the config file (~/.eventloom/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    /// Environment variables can override config values using the pattern:
    /// `EVENTLOOM_SECTION_KEY`
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("EVENTLOOM_STORAGE_ROOT") {
            self.storage.root = val;
        }
        if let Ok(val) = std::env::var("EVENTLOOM_STREAM_CACHE_SIZE") {
            if let Ok(v) = val.parse() {
                self.stream.cache_size = v;
            }
        }
        if let Ok(val) = std::env::var("EVENTLOOM_BROKER_TOPIC_PREFIX") {
            self.broker.topic_prefix = val;
        }
        if let Ok(val) = std::env::var("EVENTLOOM_BROKER_CONSUMER_GROUP_PREFIX") {
            self.broker.consumer_group_prefix = val;
        }
        if let Ok(val) = std::env::var("EVENTLOOM_BROKER_FLUSH_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.broker.flush_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("EVENTLOOM_MANAGER_MAX_CONCURRENT_CONVERSATIONS") {
            if let Ok(v) = val.parse() {
                self.manager.max_concurrent_conversations = v;
            }
        }
        if let Ok(val) = std::env::var("EVENTLOOM_MANAGER_CLOSE_DELAY_SECS") {
            if let Ok(v) = val.parse() {
                self.manager.close_delay_secs = v;
            }
        }
        if let Ok(val) = std::env::var("EVENTLOOM_MANAGER_REAP_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                self.manager.reap_interval_secs = v;
            }
        }
        if let Ok(val) = std::env::var("EVENTLOOM_CONDENSER_MAX_TOKENS") {
            if let Ok(v) = val.parse() {
                self.condenser.max_tokens_before_condensing = v;
            }
        }
        if let Ok(val) = std::env::var("EVENTLOOM_CONDENSER_BROWSER_ATTENTION_WINDOW") {
            if let Ok(v) = val.parse() {
                self.condenser.browser_attention_window = v;
            }
        }
        if let Ok(val) = std::env::var("EVENTLOOM_LOGGING_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("EVENTLOOM_LOGGING_FORMAT") {
            self.logging.format = val;
        }
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::path())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Initialize the global configuration.
    ///
    /// This should be called once at startup. Subsequent calls will return
    /// an error if the config is already initialized.
    pub fn init() -> Result<()> {
        let config = Self::load()?;
        CONFIG
            .set(RwLock::new(config))
            .map_err(|_| LoomError::Config("Configuration already initialized".to_string()))
    }

    /// Initialize the global configuration with a specific config.
    ///
    /// Useful for testing or custom initialization.
    pub fn init_with(config: Config) -> Result<()> {
        CONFIG
            .set(RwLock::new(config))
            .map_err(|_| LoomError::Config("Configuration already initialized".to_string()))
    }

    /// Get a clone of the current global configuration.
    ///
    /// Returns default configuration if not yet initialized.
    pub fn get() -> Config {
        CONFIG
            .get()
            .and_then(|lock| lock.read().ok())
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Update the global configuration.
    ///
    /// Returns an error if the config hasn't been initialized yet.
    pub fn update<F>(f: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        let lock = CONFIG
            .get()
            .ok_or_else(|| LoomError::Config("Configuration not initialized".to_string()))?;
        let mut guard = lock
            .write()
            .map_err(|_| LoomError::Config("Failed to acquire config write lock".to_string()))?;
        f(&mut guard);
        Ok(())
    }

    /// Returns the expanded storage root (resolves ~ to home directory)
    pub fn storage_root(&self) -> PathBuf {
        expand_home(&self.storage.root)
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
