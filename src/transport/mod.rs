//! Transport abstraction for the session manager
//!
//! The session layer never talks to a socket directly. It asks a [`Connector`]
//! to open a connection and receives an [`OpenedLink`]: a [`Link`] handle for
//! outbound operations plus the single-consumer stream of inbound frames.
//! A new `open` always yields a new stream; streams are never restarted.

pub mod mqtt;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub use mqtt::{MqttConnector, MqttLink};

/// Default broker endpoint for MirAIe devices
pub const DEFAULT_BROKER_URL: &str = "mqtts://mqtt.miraie.in:8883";

/// Inbound frame as delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub topic: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Inbound frame stream. An `Err` item or channel closure ends the stream.
pub type FrameStream = mpsc::Receiver<Result<Frame, TransportError>>;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),
    #[error("Send failed")]
    SendFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}

/// Broker endpoint: host, port and whether TLS is used
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, use_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls,
        }
    }

    /// Parse an `mqtt://` or `mqtts://` URL; the port defaults per scheme.
    pub fn parse(broker_url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(broker_url)
            .map_err(|_| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;

        let use_tls = match url.scheme() {
            "mqtts" | "ssl" => true,
            "mqtt" | "tcp" => false,
            _ => return Err(TransportError::InvalidBrokerUrl(broker_url.to_string())),
        };

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;
        let port = url.port().unwrap_or(if use_tls { 8883 } else { 1883 });

        Ok(Self::new(host, port, use_tls))
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("mqtt.miraie.in", 8883, true)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Broker credentials: home identifier and short-lived access token
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Everything a connector needs to open one connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'a> {
    pub endpoint: &'a Endpoint,
    pub client_id: &'a str,
    pub credentials: &'a Credentials,
    pub keep_alive: Duration,
}

/// A freshly opened connection and its inbound frames
pub struct OpenedLink {
    pub link: Arc<dyn Link>,
    pub frames: FrameStream,
}

impl fmt::Debug for OpenedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedLink")
            .field("alive", &self.link.is_alive())
            .finish_non_exhaustive()
    }
}

/// Opens connections to the broker
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection. Resolves once the broker has accepted the session.
    async fn open(&self, request: ConnectRequest<'_>) -> Result<OpenedLink, TransportError>;
}

/// Outbound half of an open connection
///
/// `Ok` from `subscribe`, `unsubscribe` or `send` means the request was
/// accepted for transmission on this connection, not that the broker
/// acknowledged it. With the MQTT connector the request has been queued for
/// the event loop; a connection that dies before flushing it surfaces as an
/// error on the frame stream, not on the call.
#[async_trait]
pub trait Link: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Queue one publish at the session QoS
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether the underlying connection still reports itself alive
    fn is_alive(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse_mqtts_default_port() {
        let endpoint = Endpoint::parse("mqtts://mqtt.miraie.in").unwrap();
        assert_eq!(endpoint, Endpoint::new("mqtt.miraie.in", 8883, true));
    }

    #[test]
    fn test_endpoint_parse_plain_with_port() {
        let endpoint = Endpoint::parse("mqtt://localhost:1884").unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 1884);
        assert!(!endpoint.use_tls);
    }

    #[test]
    fn test_endpoint_parse_rejects_unknown_scheme() {
        let result = Endpoint::parse("http://mqtt.miraie.in");
        assert!(matches!(result, Err(TransportError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_endpoint_parse_rejects_garbage() {
        assert!(Endpoint::parse("not a url").is_err());
    }

    #[test]
    fn test_endpoint_display_round_trips() {
        let endpoint = Endpoint::default();
        assert_eq!(endpoint.to_string(), DEFAULT_BROKER_URL);
        assert_eq!(Endpoint::parse(&endpoint.to_string()).unwrap(), endpoint);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials::new("home-42", "eyJhbGciOi.secret");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("home-42"));
        assert!(!debug.contains("secret"));
    }
}
