use crate::{FleetResult, LogLevel};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logging configuration structure
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub target: LogTarget,
    pub format: LogFormat,
    pub include_thread_ids: bool,
    pub include_file_locations: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            target: LogTarget::Stdout,
            format: LogFormat::Compact,
            include_thread_ids: false,
            include_file_locations: false,
        }
    }
}

/// Log output target
#[derive(Debug, Clone, Copy)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

/// Log format options
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

/// Initialize the logging framework with the specified configuration.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn initialize_logging(config: LoggingConfig) -> FleetResult<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level_str = match config.level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        EnvFilter::new(level_str)
    });

    let use_stderr = matches!(config.target, LogTarget::Stderr);
    let fmt_layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(move || writer(use_stderr))
            .with_thread_ids(config.include_thread_ids)
            .with_file(config.include_file_locations)
            .with_line_number(config.include_file_locations)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(move || writer(use_stderr))
            .with_thread_ids(config.include_thread_ids)
            .with_file(config.include_file_locations)
            .with_line_number(config.include_file_locations)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(move || writer(use_stderr))
            .with_thread_ids(config.include_thread_ids)
            .with_file(config.include_file_locations)
            .with_line_number(config.include_file_locations)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::debug!("Logging initialized with level: {}", config.level);
    Ok(())
}

fn writer(use_stderr: bool) -> Box<dyn std::io::Write> {
    if use_stderr {
        Box::new(std::io::stderr())
    } else {
        Box::new(std::io::stdout())
    }
}

/// Initialize logging with default configuration
pub fn initialize_default_logging() -> FleetResult<()> {
    initialize_logging(LoggingConfig::default())
}
