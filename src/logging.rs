//! Structured logging for statechain
//!
//! All logs use structured fields so cache behaviour can be followed across a
//! run, and filtered by environment or stage.
//!
//! # Log Format Conventions
//!
//! - `env`: Environment identity (`host:path`, or just `path` when local)
//! - `operation`: The cached operation (e.g., "sh", "write_file")
//! - `stage`: Stage name
//! - `function`: Memoized function key
//! - `status`: The lookup outcome ("hit", "miss", "stored", "error", "drift")
//! - `hash`: Chain hash (shortened)
//! - `key`: Stage or function cache key
//!
//! # Examples
//!
//! ```rust,ignore
//! use tracing::info;
//!
//! // Operation replayed from cache
//! info!(
//!     env = %identity,
//!     operation = "sh",
//!     status = "hit",
//!     hash = short(&hash, 12),
//!     "Skipping sh"
//! );
//! ```

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Formatter that shows "statechain" instead of the full module path
struct StatechainFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for StatechainFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:5}(statechain)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(statechain): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default for development)
    Pretty,
    /// Compact format (for CI)
    Compact,
    /// JSON format (for log aggregation systems)
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }

    /// Parse from environment variable (STATECHAIN_LOG_FORMAT)
    pub fn from_env() -> Option<Self> {
        std::env::var("STATECHAIN_LOG_FORMAT")
            .ok()
            .and_then(|value| Self::parse(&value))
    }

    /// Pretty for dev, compact when running under CI
    pub fn default_for_env() -> Self {
        if std::env::var("CI").is_ok() {
            Self::Compact
        } else {
            Self::Pretty
        }
    }
}

/// Initialize the global tracing subscriber from the environment alone
pub fn init() {
    init_with(None, None);
}

/// Initialize the global tracing subscriber
///
/// Environment variables win over the configured values.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "debug", "info", "warn")
/// - `STATECHAIN_LOG_FORMAT`: Set format ("pretty", "compact", "json")
/// - `CI`: If set, defaults to compact format
///
/// # Examples
///
/// ```bash
/// # Watch every cache lookup
/// RUST_LOG=statechain=debug statechain fingerprint ./data
///
/// # JSON format for log shipping
/// STATECHAIN_LOG_FORMAT=json statechain cache stats ./state.json
/// ```
pub fn init_with(level: Option<&str>, format: Option<LogFormat>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let format = LogFormat::from_env()
        .or(format)
        .unwrap_or_else(LogFormat::default_for_env);

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(StatechainFormatter { with_ansi: true })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(StatechainFormatter { with_ansi: false })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .with_writer(io::stderr)
                    .json(),
            )
            .try_init(),
    };

    // A host application may already own the global subscriber
    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {}", e);
    }
}

/// Standard field names for consistent logging
#[allow(dead_code)]
pub mod fields {
    /// Environment identity
    pub const ENV: &str = "env";
    /// Operation name (e.g., "sh", "write_file")
    pub const OPERATION: &str = "operation";
    /// Stage name
    pub const STAGE: &str = "stage";
    /// Memoized function key
    pub const FUNCTION: &str = "function";
    /// Status (e.g., "hit", "miss", "drift")
    pub const STATUS: &str = "status";
    /// Chain hash
    pub const HASH: &str = "hash";
    /// Stage or function cache key
    pub const KEY: &str = "key";
}

/// Built-in operation names
pub mod operations {
    pub const SH: &str = "sh";
    pub const WRITE_FILE: &str = "write_file";
    pub const COPY_FROM: &str = "copy_from";
}

/// Status values for consistent logging
pub mod status {
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const STORED: &str = "stored";
    pub const ERROR: &str = "error";
    pub const DRIFT: &str = "drift";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_format() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("compact"), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("fancy"), None);
    }

    #[test]
    #[serial]
    fn test_format_from_env() {
        std::env::set_var("STATECHAIN_LOG_FORMAT", "json");
        assert_eq!(LogFormat::from_env(), Some(LogFormat::Json));

        std::env::remove_var("STATECHAIN_LOG_FORMAT");
        assert_eq!(LogFormat::from_env(), None);
    }
}
