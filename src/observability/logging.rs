//! Structured logging using the tracing crate
//!
//! Session transitions, reconnect attempts and command retries are logged
//! with the client id attached, so one broker session can be followed
//! through interleaved output.
//!
//! `LOG_FORMAT` picks `json` (default, for log shippers), `pretty` or
//! `compact`. `LOG_LEVEL` takes ERROR through TRACE and falls back to INFO.
//! `LOG_SPANS=true` adds span enter/exit events. A set `RUST_LOG` wins over
//! all of the filtering done here, including the caps on rumqttc and rustls.
//!
//! ## Examples
//!
//! ```bash
//! LOG_FORMAT=json LOG_LEVEL=INFO miraie-mqtt watch --device home/ac-1
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG miraie-mqtt send --device home/ac-1 --set ps=on
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    /// Single-line output for terminals
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Dependencies whose chatter is capped at warn
const QUIET_DEPENDENCIES: [&str; 3] = ["rumqttc=warn", "rustls=warn", "tokio=warn"];

/// Parse a `LOG_LEVEL` value, defaulting to INFO
pub fn parse_level(value: &str) -> Level {
    match value.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "INFO" => Level::INFO,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Parse a `LOG_SPANS` value; only "true" (any case) enables span events
pub fn parse_spans_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration.
///
/// A second call is a no-op, so tests and the CLI may both initialize.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let mut filter = EnvFilter::new(level.to_string());

    // Reduce noise from dependencies
    for directive in QUIET_DEPENDENCIES {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Allow RUST_LOG to override
    if let Ok(rust_log) = env::var("RUST_LOG") {
        filter = EnvFilter::new(rust_log);
    }

    let subscriber = tracing_subscriber::registry().with(filter);
    let spans = span_events(include_spans);

    let result = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(spans))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(spans))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(spans),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

/// Initialize logging from environment variables.
///
/// `level_override` wins over `LOG_LEVEL` (the CLI passes one for `-v`).
pub fn init_default_logging(level_override: Option<Level>) {
    let level = level_override.unwrap_or_else(|| {
        parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()))
    });

    let format = env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let include_spans = parse_spans_flag(&env::var("LOG_SPANS").unwrap_or_default());

    init_logging(level, LogFormat::parse(&format), include_spans);
}

/// Create a session lifecycle span (connect, reconnect, disconnect)
#[macro_export]
macro_rules! session_span {
    ($($field:tt)*) => {
        tracing::info_span!("session", $($field)*)
    };
}

/// Create an outbound command span
#[macro_export]
macro_rules! command_span {
    ($($field:tt)*) => {
        tracing::info_span!("command", $($field)*)
    };
}

// Re-export macros for convenience
pub use {command_span, session_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse_case_insensitive() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("CoMpAcT"), LogFormat::Compact);
    }

    #[test]
    fn test_log_format_parse_invalid_defaults_to_json() {
        assert_eq!(LogFormat::parse("invalid"), LogFormat::Json);
        assert_eq!(LogFormat::parse(""), LogFormat::Json);
        assert_eq!(LogFormat::parse("yaml"), LogFormat::Json);
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Info", Level::INFO),
            ("DEBUG", Level::DEBUG),
            ("trace", Level::TRACE),
            ("invalid", Level::INFO),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "Failed for input: {input}");
        }
    }

    #[test]
    fn test_parse_spans_flag() {
        assert!(parse_spans_flag("true"));
        assert!(parse_spans_flag("TRUE"));
        assert!(!parse_spans_flag(""));
        assert!(!parse_spans_flag("yes"));
        assert!(!parse_spans_flag("1"));
    }

    #[test]
    fn test_span_events_selection() {
        assert_eq!(span_events(false), FmtSpan::NONE);
        assert_eq!(span_events(true), FmtSpan::NEW | FmtSpan::CLOSE);
    }
}
