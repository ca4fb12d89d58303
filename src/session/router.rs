//! Inbound message routing
//!
//! One router task per connection consumes the frame stream, decodes each
//! payload and hands it to the registered listener. Every topic gets its own
//! delivery worker, so messages for a topic arrive in order while a slow or
//! failing listener never stalls the stream or other topics.

use super::manager::SessionInner;
use super::registry::{ListenerHandle, TopicRegistry};
use crate::observability::SessionMetrics;
use crate::protocol::{decode_payload, DecodeError, Payload};
use crate::transport::{Frame, FrameStream};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

/// Decoded messages waiting for the listener of one topic
const DELIVERY_QUEUE_CAPACITY: usize = 64;

/// A decoded message bound to its listener
pub struct Delivery {
    pub topic: String,
    pub payload: Payload,
    pub listener: ListenerHandle,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// What to do with one inbound frame
#[derive(Debug)]
pub enum RouteDecision {
    Deliver(Delivery),
    /// Decoded, but no listener is registered for the topic
    Unregistered { topic: String },
    Malformed { topic: String, error: DecodeError },
}

/// Pure frame routing
pub struct MessageRouter;

impl MessageRouter {
    /// Decode a frame and find its listener (pure function)
    pub fn route(frame: Frame, registry: &TopicRegistry) -> RouteDecision {
        let payload = match decode_payload(&frame.payload) {
            Ok(payload) => payload,
            Err(error) => {
                return RouteDecision::Malformed {
                    topic: frame.topic,
                    error,
                }
            }
        };

        match registry.listener_for(&frame.topic) {
            Some(listener) => RouteDecision::Deliver(Delivery {
                topic: frame.topic,
                payload,
                listener,
            }),
            None => RouteDecision::Unregistered { topic: frame.topic },
        }
    }
}

/// Listener workers for one connection, one per topic. Teardown aborts and
/// awaits them so no listener runs for a connection that is gone.
pub(super) struct DeliveryWorkers {
    workers: Mutex<JoinSet<()>>,
}

impl DeliveryWorkers {
    pub(super) fn new() -> Self {
        Self {
            workers: Mutex::new(JoinSet::new()),
        }
    }

    fn spawn(&self, worker: impl Future<Output = ()> + Send + 'static) {
        lock(&self.workers).spawn(worker);
    }

    /// Abort every worker and wait until all of them have stopped
    pub(super) async fn shutdown(&self) {
        let mut workers = std::mem::replace(&mut *lock(&self.workers), JoinSet::new());
        workers.shutdown().await;
    }

    pub(super) fn abort_all(&self) {
        lock(&self.workers).abort_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-topic delivery queues owned by one router task
struct TopicQueues {
    senders: HashMap<String, mpsc::Sender<Delivery>>,
    workers: Arc<DeliveryWorkers>,
    metrics: Arc<SessionMetrics>,
    listener_timeout: Duration,
}

impl TopicQueues {
    /// Queue a delivery behind earlier ones for the same topic. Never waits:
    /// a full queue drops the message.
    fn enqueue(&mut self, delivery: Delivery) {
        let sender = match self.senders.entry(delivery.topic.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (sender, queue) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
                self.workers.spawn(deliver(
                    queue,
                    Arc::clone(&self.metrics),
                    self.listener_timeout,
                ));
                entry.insert(sender)
            }
        };

        match sender.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(delivery)) => {
                self.metrics.listener_failed();
                warn!(topic = %delivery.topic, "Listener is falling behind, dropping message");
            }
            Err(TrySendError::Closed(delivery)) => {
                debug!(topic = %delivery.topic, "Delivery worker stopped, dropping message");
            }
        }
    }
}

/// Router task for one connection. Ends when the stream yields an error or
/// closes; a natural end is reported back so the session can reconnect.
pub(super) async fn run_router(
    session: Weak<SessionInner>,
    epoch: u64,
    mut frames: FrameStream,
    workers: Arc<DeliveryWorkers>,
) {
    let Some(mut queues) = session.upgrade().map(|s| TopicQueues {
        senders: HashMap::new(),
        workers,
        metrics: Arc::clone(&s.metrics),
        listener_timeout: s.config.operation_timeout,
    }) else {
        return;
    };

    let reason = loop {
        let item = frames.recv().await;
        let Some(session) = session.upgrade() else {
            return;
        };

        let frame = match item {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break e.to_string(),
            None => break "inbound stream closed".to_string(),
        };

        session.touch_inbound();
        session.metrics.message_received();

        let decision = {
            let registry = session.registry.read().await;
            MessageRouter::route(frame, &registry)
        };

        match decision {
            RouteDecision::Deliver(delivery) => {
                let _ = session.inbound.send(delivery.topic.clone());
                queues.enqueue(delivery);
            }
            RouteDecision::Unregistered { topic } => {
                debug!("No listener for topic {}, dropping message", topic);
                let _ = session.inbound.send(topic);
            }
            RouteDecision::Malformed { topic, error } => {
                session.metrics.decode_failed();
                warn!(topic = %topic, "Dropping message: {}", error);
            }
        }
    };

    // Workers drain what is already queued, then stop
    drop(queues);
    if let Some(session) = session.upgrade() {
        session.on_stream_ended(epoch, reason);
    }
}

/// Invoke listeners for one topic in arrival order. Each call runs in its
/// own task, bounded by `listener_timeout`, so a panic or a hung listener is
/// contained and reported like an error.
async fn deliver(
    mut queue: mpsc::Receiver<Delivery>,
    metrics: Arc<SessionMetrics>,
    listener_timeout: Duration,
) {
    while let Some(Delivery {
        topic,
        payload,
        listener,
    }) = queue.recv().await
    {
        let call_topic = topic.clone();
        let mut call = JoinSet::new();
        call.spawn(async move { listener.on_message(&call_topic, &payload).await });

        // Dropping `call` aborts a listener that overran its deadline
        match tokio::time::timeout(listener_timeout, call.join_next()).await {
            Ok(Some(Ok(Ok(())))) => trace!(topic = %topic, "Listener completed"),
            Ok(Some(Ok(Err(e)))) => {
                metrics.listener_failed();
                warn!(topic = %topic, "Listener returned an error: {}", e);
            }
            Ok(Some(Err(e))) => {
                metrics.listener_failed();
                error!(topic = %topic, "Listener panicked: {}", e);
            }
            Ok(None) => {}
            Err(_) => {
                metrics.listener_failed();
                warn!(
                    topic = %topic,
                    timeout_ms = listener_timeout.as_millis() as u64,
                    "Listener timed out, abandoning call"
                );
            }
        }
    }
}
