//! Resilient broker session
//!
//! # Architecture
//!
//! - [`state`] - Pure session states, transitions, backoff and configuration
//! - [`registry`] - Topic to listener registry
//! - [`liveness`] - Staleness verdicts plus the periodic monitor and alive-check tasks
//! - [`router`] - Inbound frame decoding and listener dispatch
//! - [`dispatcher`] - Serialized, bounded-retry publishing
//! - [`manager`] - [`SessionManager`], the public handle coordinating all of the above
//!
//! # Usage
//!
//! ```rust,no_run
//! use miraie_mqtt::protocol::{ControlPayload, DeviceTopic};
//! use miraie_mqtt::session::{ListenerError, SessionConfig, SessionManager};
//! use miraie_mqtt::transport::{Credentials, MqttConnector};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let session = SessionManager::new(SessionConfig::default(), MqttConnector::new());
//! let device = DeviceTopic::new("home-id/ac-1")?;
//!
//! session
//!     .subscribe(device.state(), |topic: String, payload: serde_json::Value| async move {
//!         println!("{topic}: {payload}");
//!         Ok::<(), ListenerError>(())
//!     })
//!     .await?;
//!
//! session
//!     .connect_with_retry(Credentials::new("home-id", "access-token"), None)
//!     .await;
//! session.wait_for_connection(Duration::from_secs(10)).await?;
//!
//! let command = ControlPayload::new().field("ps", "on").build();
//! assert!(session.publish(&device.control(), &command).await);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

pub mod dispatcher;
pub mod liveness;
pub mod manager;
pub mod registry;
pub mod router;
pub mod state;

pub use dispatcher::{CommandOutcome, OutboundCommand, RetryDecision, RetryPolicy};
pub use liveness::{HealthMetrics, LivenessMonitor, LivenessVerdict};
pub use manager::SessionManager;
pub use registry::{ListenerError, ListenerHandle, StateListener, TopicRegistry};
pub use router::{Delivery, MessageRouter, RouteDecision};
pub use state::{
    next_state, ReconnectPolicy, SessionConfig, SessionEvent, SessionInfo, SessionState,
};
