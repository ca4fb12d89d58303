//! MirAIe MQTT - resilient broker session manager
//!
//! Keeps a long-lived, authenticated MQTT session to the MirAIe cloud broker
//! so that device state updates flow to registered listeners and control
//! commands reach devices, across broker restarts, network loss and token
//! expiry.
//!
//! # Overview
//!
//! - [`transport`] - Connector/link abstraction and the `rumqttc` implementation
//! - [`session`] - State machine, topic registry, liveness monitor, router and dispatcher
//! - [`protocol`] - Device topics, JSON payload codec and the control envelope
//! - [`config`] - TOML configuration with environment-sourced credentials
//! - [`observability`] - Structured logging and per-session metrics
//! - [`testing`] - In-memory broker and listener doubles
//!
//! # Quick Start
//!
//! ```rust
//! use miraie_mqtt::protocol::{ControlPayload, DeviceTopic};
//!
//! let device = DeviceTopic::new("home-id/ac-1").unwrap();
//! assert_eq!(device.control(), "home-id/ac-1/control");
//!
//! let command = ControlPayload::new()
//!     .assignment("acmd=cool")
//!     .unwrap()
//!     .assignment("actmp=24")
//!     .unwrap()
//!     .build();
//! assert_eq!(command["acmd"], "cool");
//! assert_eq!(command["actmp"], 24);
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, ClientResult};
pub use protocol::{ControlPayload, DeviceTopic, Payload};
pub use session::{CommandOutcome, SessionConfig, SessionManager, SessionState, StateListener};
pub use transport::{Credentials, Endpoint, MqttConnector};
