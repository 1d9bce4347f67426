//! Tracing setup for the event-log core.
//!
//! One process-wide subscriber, configured from [`LoggingConfig`]: compact
//! text for terminals, JSON lines when a log aggregator ingests the output,
//! optionally appended to a file. A `RUST_LOG` environment filter takes
//! precedence over the configured level.

use crate::config::LoggingConfig;

/// Install the global subscriber. Call once, before the first event stream or
/// manager is constructed; a second call panics inside tracing.
pub fn init_logging(cfg: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    match (cfg.format.as_str(), &cfg.file) {
        ("json", Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("failed to open log file");
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(move || file.try_clone().expect("file writer"))
                .init();
        }
        ("json", None) => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        // Anything else renders compact text on stderr.
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .compact()
                .init();
        }
    }
}

/// Tracing event carrying a `component` field.
///
/// The stream, the consumer pool and the manager each log under their own
/// component name, so one subsystem can be isolated in a shared log:
///
/// ```
/// # use eventloom::log_component;
/// log_component!(debug, "stream", "page archived");
/// log_component!(warn, "manager", "session idle", sid = "abc", idle_secs = 120u64);
/// ```
#[macro_export]
macro_rules! log_component {
    ($level:ident, $component:expr, $msg:expr) => {
        tracing::$level!(component = $component, $msg)
    };
    ($level:ident, $component:expr, $msg:expr, $($key:ident = $val:expr),+ $(,)?) => {
        tracing::$level!(component = $component, $($key = $val,)+ $msg)
    };
}

#[cfg(test)]
mod tests {
    use crate::config::LoggingConfig;

    #[test]
    fn test_default_logging_config() {
        let cfg = LoggingConfig::default();
        assert_eq!(cfg.format, "pretty");
        assert_eq!(cfg.level, "info");
        assert!(cfg.file.is_none());
    }

    #[test]
    fn test_logging_config_partial_uses_defaults() {
        let cfg: LoggingConfig = serde_json::from_str(r#"{"level":"trace"}"#).unwrap();
        assert_eq!(cfg.format, "pretty");
        assert!(cfg.file.is_none());
        assert_eq!(cfg.level, "trace");
    }

    #[test]
    fn test_logging_config_roundtrip() {
        let cfg = LoggingConfig {
            format: "json".to_string(),
            file: Some("/tmp/eventloom.log".to_string()),
            level: "debug".to_string(),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let restored: LoggingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.format, "json");
        assert_eq!(restored.file.as_deref(), Some("/tmp/eventloom.log"));
    }
}
