//! Pure MQTT option construction
//!
//! Builds `rumqttc` options from a [`ConnectRequest`] without touching the
//! network, so option handling can be tested in isolation.

use crate::transport::{ConnectRequest, TransportError};
use rumqttc::{MqttOptions, QoS, Transport as RumqttcTransport};
use std::time::Duration;

/// QoS used for every subscribe and publish
pub const SESSION_QOS: QoS = QoS::AtLeastOnce;

/// Capacity of the request channel between the client handle and event loop
pub const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Largest inbound packet accepted from the broker
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Smallest keep-alive interval `rumqttc` accepts without complaint
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Pure function to configure MQTT options for one connection attempt
pub fn configure_mqtt_options(request: &ConnectRequest<'_>) -> Result<MqttOptions, TransportError> {
    if request.endpoint.host.is_empty() {
        return Err(TransportError::InvalidBrokerUrl(request.endpoint.to_string()));
    }

    let mut mqtt_options = MqttOptions::new(
        request.client_id,
        request.endpoint.host.clone(),
        request.endpoint.port,
    );

    if request.endpoint.use_tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Home identifier as username, access token as password
    mqtt_options.set_credentials(
        request.credentials.username(),
        request.credentials.password(),
    );

    mqtt_options.set_keep_alive(request.keep_alive.max(MIN_KEEP_ALIVE));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    Ok(mqtt_options)
}
