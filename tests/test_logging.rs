//! Tests for logging configuration and format parsing
//!
//! Tests the pure parsing helpers plus the guarantee that initializing
//! logging more than once is harmless.

use miraie_mqtt::observability::logging::{parse_level, parse_spans_flag, LogFormat};
use miraie_mqtt::observability::{init_logging, session_span};
use tracing::Level;

#[test]
fn test_log_format_parse_variants() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Unknown formats fall back to JSON for log shippers
    for input in ["", "xml", "yaml", "123"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input {input:?}");
    }
}

#[test]
fn test_log_level_parsing() {
    assert_eq!(parse_level("debug"), Level::DEBUG);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_spans_flag() {
    assert!(parse_spans_flag("true"));
    assert!(parse_spans_flag("TRUE"));
    assert!(!parse_spans_flag("1"));
}

#[test]
fn test_repeated_initialization_is_harmless() {
    init_logging(Level::DEBUG, LogFormat::Compact, false);
    init_logging(Level::INFO, LogFormat::Json, true);

    let span = session_span!(client_id = "test-client", operation = "connect");
    let _entered = span.enter();
    tracing::info!("logging still works after re-initialization");
}
