//! Testing utilities and mock implementations
//!
//! An in-memory broker and listener doubles for exercising the session
//! manager without a real MQTT broker.

pub mod mocks;

pub use mocks::*;
