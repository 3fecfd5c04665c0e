//! Structured logging setup.
//!
//! Console output is pretty-printed by default; JSON output is available for
//! batch deployments where logs are shipped elsewhere. `RUST_LOG` always
//! takes precedence over the configured level.

use std::env;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Configuration for logging initialization.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Minimum level for the epicflow crates.
    pub level: Level,
    /// Emit JSON lines instead of human-readable output.
    pub use_json: bool,
    /// Include the module target in each record.
    pub include_target: bool,
    /// Include file and line number.
    pub include_location: bool,
    /// Include thread ids and names. Useful when several observations run concurrently.
    pub include_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            use_json: false,
            include_target: true,
            include_location: false,
            include_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    /// Default configuration at `level`.
    #[must_use]
    pub fn with_level(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Switches JSON output on or off.
    #[must_use]
    pub fn with_json(mut self, use_json: bool) -> Self {
        self.use_json = use_json;
        self
    }

    /// JSON output with full metadata.
    #[must_use]
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            use_json: true,
            include_target: true,
            include_location: true,
            include_thread_ids: true,
        }
    }

    fn filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            for crate_name in ["epicflow", "epicflow_cli"] {
                if let Ok(directive) = format!("{crate_name}={}", self.level).parse() {
                    filter = filter.add_directive(directive);
                }
            }
        }
        filter
    }
}

/// Parses a level name, falling back to `INFO`.
#[must_use]
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(config.filter());
        let result = if config.use_json {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_thread_ids(config.include_thread_ids)
                        .with_thread_names(config.include_thread_ids),
                )
                .try_init()
        } else {
            registry
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_thread_ids(config.include_thread_ids)
                        .with_thread_names(config.include_thread_ids),
                )
                .try_init()
        };
        if let Err(e) = result {
            eprintln!("epicflow: logging already initialized: {e}");
        }
    });
}

/// Initializes from `EPICFLOW_LOG_LEVEL` and `EPICFLOW_LOG_JSON`.
pub fn init_from_env() {
    let level = env::var("EPICFLOW_LOG_LEVEL").map_or(Level::INFO, |v| parse_level(&v));
    let use_json = env::var("EPICFLOW_LOG_JSON")
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false);
    init_logging(&LoggingConfig::with_level(level).with_json(use_json));
}
