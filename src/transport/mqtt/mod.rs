//! MQTT transport built on `rumqttc`
//!
//! # Architecture
//!
//! - [`connection`] - Pure option construction from a connect request
//! - [`message_handler`] - Pure routing of event-loop events
//! - [`client`] - Impure connector, link and event pump
//!
//! # Usage
//!
//! ```rust,no_run
//! use miraie_mqtt::transport::{ConnectRequest, Connector, Credentials, Endpoint, MqttConnector};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let endpoint = Endpoint::parse("mqtts://mqtt.miraie.in:8883")?;
//! let credentials = Credentials::new("home-id", "access-token");
//! let opened = MqttConnector::new()
//!     .open(ConnectRequest {
//!         endpoint: &endpoint,
//!         client_id: "miraie-mqtt-example",
//!         credentials: &credentials,
//!         keep_alive: Duration::from_secs(60),
//!     })
//!     .await?;
//! opened.link.subscribe("home-id/ac-1/state").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnector, MqttLink};
pub use connection::configure_mqtt_options;
pub use message_handler::{EventRoute, MessageHandler};
