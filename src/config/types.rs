//! Configuration type definitions for EventLoom
//!
//! All types implement serde traits for JSON serialization and have sensible
//! defaults, so a missing config file or a partial one is always usable.

use serde::{Deserialize, Serialize};

use crate::condenser::SummaryFailurePolicy;

/// Main configuration struct for EventLoom
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend configuration
    pub storage: StorageConfig,
    /// Event stream configuration (paging)
    pub stream: StreamConfig,
    /// Broker configuration for distributed deployments
    pub broker: BrokerConfig,
    /// Conversation manager configuration (limits, timers)
    pub manager: ManagerConfig,
    /// Condenser pipeline configuration
    pub condenser: CondenserConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the local file store; `~` expands to the home dir.
    pub root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "~/.eventloom/sessions".to_string(),
        }
    }
}

// ============================================================================
// Stream Configuration
// ============================================================================

/// Event stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Events per archived page.
    pub cache_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            cache_size: crate::events::store::DEFAULT_CACHE_SIZE,
        }
    }
}

// ============================================================================
// Broker Configuration
// ============================================================================

/// Broker configuration for distributed deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Prefix of the per-category event topics.
    pub topic_prefix: String,
    /// Prefix of the per-category consumer groups.
    pub consumer_group_prefix: String,
    /// Publish/flush timeout in milliseconds.
    pub flush_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "eventloom".to_string(),
            consumer_group_prefix: "eventloom-consumers".to_string(),
            flush_timeout_ms: 2_000,
        }
    }
}

// ============================================================================
// Manager Configuration
// ============================================================================

/// Conversation manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum concurrent agent loops per user; 0 means unlimited.
    pub max_concurrent_conversations: usize,
    /// Seconds a non-running session may sit idle with no connections before
    /// the reaper closes it.
    pub close_delay_secs: u64,
    /// Seconds between reaper sweeps.
    pub reap_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_conversations: 3,
            close_delay_secs: 300,
            reap_interval_secs: 15,
        }
    }
}

// ============================================================================
// Condenser Configuration
// ============================================================================

/// Condenser pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CondenserConfig {
    /// Token ceiling for the rolling token-length stage.
    pub max_tokens_before_condensing: u64,
    /// Browser observations kept verbatim.
    pub browser_attention_window: usize,
    /// What to do when a summarization call fails.
    pub summary_failure_policy: SummaryFailurePolicy,
    /// Timeout for one summarization call, in seconds.
    pub summarize_timeout_secs: u64,
}

impl Default for CondenserConfig {
    fn default() -> Self {
        Self {
            max_tokens_before_condensing: 60_000,
            browser_attention_window: 3,
            summary_failure_policy: SummaryFailurePolicy::KeepUnsummarized,
            summarize_timeout_secs: 60,
        }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter: trace, debug, info, warn, error.
    pub level: String,
    /// Output format: "pretty" or "json".
    pub format: String,
    /// Optional log file path; stderr when unset.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}
