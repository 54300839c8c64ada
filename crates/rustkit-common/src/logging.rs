//! Logging configuration and setup.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Crates whose events are shown when no filter is given.
const DEFAULT_TARGETS: &[&str] = &["rustkit_sw", "rustkit_common", "sw_cache"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level for the cache crates.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include source file location.
    pub include_location: bool,
    /// Include span events (enter, exit).
    pub include_span_events: bool,
    /// Custom filter string (e.g., "rustkit_sw=debug,rusqlite=warn").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Configuration for a `-v` count: 0 warn, 1 info, 2 debug, 3+ trace.
    pub fn for_verbosity(verbosity: u8) -> Self {
        let level = match verbosity {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self {
            level,
            include_location: verbosity >= 3,
            ..Default::default()
        }
    }

    /// Create a production configuration.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Set a custom filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Filter directives used when neither `filter` nor `RUST_LOG` is set.
    fn default_directives(&self) -> String {
        DEFAULT_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, self.level))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_directives());
        match &self.filter {
            Some(custom) => EnvFilter::try_new(custom).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Install a global subscriber writing to stderr.
///
/// Stdout is left to the program's own output. Fails if a global subscriber
/// is already installed.
pub fn init_logging(config: LogConfig) -> Result<(), TryInitError> {
    let filter = config.env_filter();

    let span_events = if config.include_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    match config.format {
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Compact);
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(LogConfig::for_verbosity(0).level, Level::WARN);
        assert_eq!(LogConfig::for_verbosity(1).level, Level::INFO);
        assert_eq!(LogConfig::for_verbosity(2).level, Level::DEBUG);
        let trace = LogConfig::for_verbosity(7);
        assert_eq!(trace.level, Level::TRACE);
        assert!(trace.include_location);
    }

    #[test]
    fn test_default_directives() {
        let config = LogConfig::for_verbosity(2);
        assert_eq!(
            config.default_directives(),
            "rustkit_sw=DEBUG,rustkit_common=DEBUG,sw_cache=DEBUG"
        );
    }

    #[test]
    fn test_log_config_with_filter() {
        let config = LogConfig::default().with_filter("rustkit_sw=debug");
        assert_eq!(config.filter, Some("rustkit_sw=debug".to_string()));
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging(LogConfig::default());
        assert!(init_logging(LogConfig::default()).is_err());
    }
}
