//! Pure routing of `rumqttc` events
//!
//! Maps raw event-loop output onto the few outcomes the event pump cares
//! about, so the pump itself stays a thin loop.

use crate::transport::Frame;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet};

/// Routing decision for a single event-loop event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAccepted,
    /// Broker answered CONNECT with a refusal code
    ConnectionRefused(String),
    /// Application message to forward
    Message(Frame),
    /// Broker closed the session
    DisconnectedByBroker,
    /// Our own DISCONNECT went out; the pump should stop
    LocalDisconnect,
    /// Keep-alive, acks and other housekeeping
    Infrastructure,
}

/// Pure event routing for the MQTT event pump
pub struct MessageHandler;

impl MessageHandler {
    /// Route an event-loop event (pure function)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => match &ack.code {
                ConnectReturnCode::Success => EventRoute::ConnectionAccepted,
                code => EventRoute::ConnectionRefused(format!("{code:?}")),
            },
            Event::Incoming(Packet::Publish(publish)) => EventRoute::Message(Frame::new(
                publish.topic.clone(),
                publish.payload.clone(),
            )),
            Event::Incoming(Packet::Disconnect) => EventRoute::DisconnectedByBroker,
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::LocalDisconnect,
            _ => EventRoute::Infrastructure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish, QoS};

    #[test]
    fn test_route_connack_success() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::ConnectionAccepted
        );
    }

    #[test]
    fn test_route_connack_refused() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        )));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::ConnectionRefused(code) if code.contains("NotAuthorized")
        ));
    }

    #[test]
    fn test_route_publish_becomes_frame() {
        let publish = Publish::new("home/ac-1/state", QoS::AtLeastOnce, r#"{"ps":"on"}"#);
        let event = Event::Incoming(Packet::Publish(publish));

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::Message(frame) => {
                assert_eq!(frame.topic, "home/ac-1/state");
                assert_eq!(&frame.payload[..], br#"{"ps":"on"}"#);
            }
            other => panic!("Expected message route, got {other:?}"),
        }
    }

    #[test]
    fn test_route_disconnects() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::DisconnectedByBroker
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::LocalDisconnect
        );
    }

    #[test]
    fn test_route_ping_is_infrastructure() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::Infrastructure
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::Infrastructure
        );
    }
}
