//! Logging configuration and initialization
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the embedding application through the `init_*` functions here. Device
//! verbosity levels map onto [`LogLevel`] via [`LogLevel::from_verbose`].
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "debug,denoiseforge=trace")
//! - `DENOISE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `DENOISE_LOG_FORMAT`: Output format ("human" or "json")
//! - `DENOISE_LOG_FILE`: Optional file path for log output (JSON format)

use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Default log level when no environment variable is set
const DEFAULT_LOG_LEVEL: LogLevel = LogLevel::Warn;

/// Environment variable for log level override
const LOG_LEVEL_ENV: &str = "DENOISE_LOG_LEVEL";

/// Environment variable for log format (json/human)
const LOG_FORMAT_ENV: &str = "DENOISE_LOG_FORMAT";

/// Environment variable for log file path
const LOG_FILE_ENV: &str = "DENOISE_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Invalid log level string provided
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    /// Invalid log format string provided
    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),

    /// Failed to create log file directory
    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    /// Failed to open log file
    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),

    /// Another global subscriber is already installed
    #[error("failed to install subscriber: {0}")]
    SubscriberInstallFailed(String),
}

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level (default)
    #[default]
    Warn,
    /// Info level
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    /// Map a device verbosity level onto a log level
    ///
    /// 0 keeps warnings only, 1 adds the device banner, 2 adds commit and
    /// tiling plans, 3 and above traces every tile and op submission.
    pub fn from_verbose(verbose: u32) -> Self {
        match verbose {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to EnvFilter string
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable colored output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Log level to use
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Whether to include file/line in logs
    pub with_file_info: bool,
    /// Whether to include span events
    pub with_span_events: bool,
    /// Optional file path for log output
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Create a new default logging configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Set the log format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable file/line information
    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    /// Set the log file path for output
    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }
}

/// Initialize logging with default configuration.
///
/// Uses the `DENOISE_LOG_LEVEL` and `DENOISE_LOG_FORMAT` environment variables
/// if set, otherwise defaults to `warn` level and human-readable format.
///
/// This function is idempotent - calling it multiple times will only
/// initialize the subscriber once.
///
/// # Environment Variables
///
/// - `DENOISE_LOG_LEVEL`: Set the default log level (default: "warn").
///   Examples: "error", "warn", "info", "debug", "trace"
///
/// - `DENOISE_LOG_FORMAT`: Set output format (default: "human").
///   - "human": Colored, human-readable output
///   - "json": JSON-formatted output for log aggregation
///
/// # Example
///
/// ```ignore
/// denoiseforge::logging::init_logging_default();
/// tracing::info!("denoiser started");
/// ```
pub fn init_logging_default() {
    init_logging_from_env().ok();
}

/// Initialize logging from environment variables.
///
/// Reads the following environment variables:
/// - `RUST_LOG`: Standard tracing filter
/// - `DENOISE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
/// - `DENOISE_LOG_FORMAT`: Output format ("human" or "json")
/// - `DENOISE_LOG_FILE`: Optional file path for log output (JSON format)
///
/// Falls back to defaults if not set.
///
/// This function is idempotent.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    TRACING_INITIALIZED.get_or_init(|| {
        let log_level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::from_str(&s))
            .unwrap_or(DEFAULT_LOG_LEVEL);

        let log_format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::from_str(&s))
            .unwrap_or(LogFormat::Human);

        let log_file = std::env::var(LOG_FILE_ENV)
            .ok()
            .map(PathBuf::from);

        let mut config = LoggingConfig::new()
            .with_level(log_level)
            .with_format(log_format);

        if let Some(file) = log_file {
            config = config.with_log_file(file);
        }

        // Ignore errors during initialization
        let _ = init_with_config_internal(&config);
    });
    Ok(())
}

/// Initialize logging with a custom configuration.
///
/// This function is idempotent.
pub fn init_with_config(config: &LoggingConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        let _ = init_with_config_internal(config);
    });
}

/// Internal initialization that can return errors
fn init_with_config_internal(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;

    let console: BoxedLayer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(false)
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .with_span_events(span_events(config.with_span_events))
            .boxed(),
        LogFormat::Human => fmt::layer()
            .with_target(true)
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .with_span_events(span_events(config.with_span_events))
            .boxed(),
    };

    let mut layers = vec![console];

    // The file sink is always JSON regardless of the console format
    if let Some(path) = &config.log_file {
        let file = open_log_file(path)?;
        layers.push(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_span_events(span_events(config.with_span_events))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| LoggingError::SubscriberInstallFailed(e.to_string()))
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn open_log_file(log_path: &Path) -> Result<std::fs::File, LoggingError> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| LoggingError::FileOpenFailed(e.to_string()))
}

/// Build the environment filter for log level.
/// Tries RUST_LOG first (standard tracing convention), then DENOISE_LOG_LEVEL.
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    // Try RUST_LOG first (standard tracing convention)
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log)
            .map_err(|e| LoggingError::InvalidLogLevel(e.to_string()));
    }

    if let Ok(env_level) = std::env::var(LOG_LEVEL_ENV) {
        if let Some(level) = LogLevel::from_str(&env_level) {
            return Ok(EnvFilter::new(level.as_filter_str()));
        }
    }

    // Use default level
    Ok(EnvFilter::new(default_level.as_filter_str()))
}

/// Check if tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

/// Initialize logging at the level implied by a device verbosity setting.
///
/// Has no effect when a subscriber was already installed through this module.
pub fn init_for_verbose(verbose: u32) {
    let config = LoggingConfig::new().with_level(LogLevel::from_verbose(verbose));
    init_with_config(&config);
}
