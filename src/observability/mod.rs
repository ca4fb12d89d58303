//! Observability: structured logging and per-session metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{MetricsSnapshot, SessionMetrics};

// Span macros for structured logging
pub use logging::{command_span, session_span};
