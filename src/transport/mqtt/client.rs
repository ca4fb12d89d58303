//! Impure MQTT connector and link built on `rumqttc`
//!
//! `open` drives the event loop until CONNACK, then hands the event loop to a
//! pump task that forwards application messages as frames. The pump ends the
//! frame stream on the first connection error instead of letting `rumqttc`
//! reconnect on its own; reconnection is owned by the session layer.

use super::connection::{configure_mqtt_options, REQUEST_CHANNEL_CAPACITY, SESSION_QOS};
use super::message_handler::{EventRoute, MessageHandler};
use crate::transport::{ConnectRequest, Connector, Frame, Link, OpenedLink, TransportError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Inbound frames buffered between the pump and the router
const FRAME_BUFFER: usize = 64;

/// Grace period for the pump to observe our DISCONNECT before it is aborted
const PUMP_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Opens MQTT connections with `rumqttc`
#[derive(Debug, Clone, Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }

    /// Poll the event loop until the broker answers CONNECT
    async fn await_connack(event_loop: &mut EventLoop) -> Result<(), TransportError> {
        loop {
            let event = event_loop
                .poll()
                .await
                .map_err(|e| TransportError::ConnectionFailed(Box::new(e)))?;

            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAccepted => return Ok(()),
                EventRoute::ConnectionRefused(code) => {
                    return Err(TransportError::ConnectionRefused(code));
                }
                EventRoute::DisconnectedByBroker => {
                    return Err(TransportError::Closed(
                        "Broker disconnected during handshake".to_string(),
                    ));
                }
                _ => trace!("Pre-CONNACK event: {:?}", event),
            }
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn open(&self, request: ConnectRequest<'_>) -> Result<OpenedLink, TransportError> {
        let options = configure_mqtt_options(&request)?;
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        debug!(endpoint = %request.endpoint, client_id = request.client_id, "Opening MQTT connection");
        Self::await_connack(&mut event_loop).await?;
        info!(endpoint = %request.endpoint, "MQTT broker accepted connection");

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let alive = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(pump_events(event_loop, frames_tx, Arc::clone(&alive)));

        let link = MqttLink {
            client,
            alive,
            pump: Mutex::new(Some(pump)),
        };

        Ok(OpenedLink {
            link: Arc::new(link),
            frames: frames_rx,
        })
    }
}

/// Forward application messages until the connection fails or is closed
async fn pump_events(
    mut event_loop: EventLoop,
    frames: mpsc::Sender<Result<Frame, TransportError>>,
    alive: Arc<AtomicBool>,
) {
    loop {
        match event_loop.poll().await {
            Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                EventRoute::Message(frame) => {
                    if frames.send(Ok(frame)).await.is_err() {
                        debug!("Frame receiver dropped, stopping event pump");
                        break;
                    }
                }
                EventRoute::DisconnectedByBroker => {
                    warn!("Broker closed the MQTT session");
                    let _ = frames
                        .send(Err(TransportError::Closed(
                            "Broker sent DISCONNECT".to_string(),
                        )))
                        .await;
                    break;
                }
                EventRoute::LocalDisconnect => {
                    debug!("DISCONNECT sent, stopping event pump");
                    break;
                }
                EventRoute::ConnectionRefused(code) => {
                    let _ = frames
                        .send(Err(TransportError::ConnectionRefused(code)))
                        .await;
                    break;
                }
                EventRoute::ConnectionAccepted | EventRoute::Infrastructure => {
                    trace!("MQTT event: {:?}", event);
                }
            },
            Err(e) => {
                warn!("MQTT event loop error: {}", e);
                alive.store(false, Ordering::SeqCst);
                let _ = frames
                    .send(Err(TransportError::ConnectionFailed(Box::new(e))))
                    .await;
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
}

/// Outbound handle to one `rumqttc` connection
pub struct MqttLink {
    client: AsyncClient,
    alive: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MqttLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttLink")
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

// Requests are handed to the event loop; SUBACK and PUBACK are not awaited
#[async_trait]
impl Link for MqttLink {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, SESSION_QOS)
            .await
            .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed("Event pump stopped".to_string()));
        }

        self.client
            .publish(topic, SESSION_QOS, false, payload)
            .await
            .map_err(|e| TransportError::SendFailed(Box::new(e)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(mut handle) = self.pump.lock().await.take() else {
            return Ok(());
        };

        if self.alive.load(Ordering::SeqCst) {
            if let Err(e) = self.client.try_disconnect() {
                debug!("DISCONNECT could not be queued: {}", e);
            }
        }

        match tokio::time::timeout(PUMP_SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => debug!("Event pump shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event pump ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event pump didn't shut down gracefully, forcing abort");
                handle.abort();
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.get_mut().take() {
            handle.abort();
        }
    }
}
