//! Mock implementations for testing
//!
//! [`MockConnector`] is an in-memory broker: it opens links, tracks the
//! broker-side subscription set, records published messages and can be told
//! to refuse connections, fail or stall sends and drop the connection.
//! Listener mocks record, fail or panic on delivery.

use crate::protocol::Payload;
use crate::session::{ListenerError, StateListener};
use crate::transport::{ConnectRequest, Connector, Frame, Link, OpenedLink, TransportError};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

pub type PublishedMessage = (String, Vec<u8>);

const MOCK_FRAME_BUFFER: usize = 64;

/// Current and peak number of concurrent operations
#[derive(Debug, Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight(Arc<Gauge>);

impl InFlight {
    fn enter(gauge: &Arc<Gauge>) -> Self {
        let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(gauge))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ActiveLink {
    id: u64,
    frames: mpsc::Sender<Result<Frame, TransportError>>,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct BrokerState {
    fail_opens: u32,
    open_delay: Option<Duration>,
    open_attempts: Vec<Instant>,
    next_link_id: u64,
    current: Option<ActiveLink>,
    opened_links: usize,
    closed_links: usize,
    subscriptions: BTreeSet<String>,
    subscribe_calls: usize,
    fail_subscribes: bool,
    sent: Vec<PublishedMessage>,
    fail_sends: u32,
    hang_sends: bool,
    send_delay: Option<Duration>,
    /// Command topic to reply topic and payload; `None` echoes the command
    replies: HashMap<String, (String, Option<Vec<u8>>)>,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory broker and connector
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<BrokerState>>,
    opens: Arc<Gauge>,
    sends: Arc<Gauge>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_opens(&self, count: u32) {
        lock(&self.state).fail_opens = count;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        lock(&self.state).open_delay = Some(delay);
    }

    /// When each `open` call started
    pub fn open_attempts(&self) -> Vec<Instant> {
        lock(&self.state).open_attempts.clone()
    }

    pub fn max_concurrent_opens(&self) -> usize {
        self.opens.peak.load(Ordering::SeqCst)
    }

    pub fn opened_links(&self) -> usize {
        lock(&self.state).opened_links
    }

    pub fn closed_links(&self) -> usize {
        lock(&self.state).closed_links
    }

    /// Broker-side subscriptions of the current connection, sorted
    pub fn active_subscriptions(&self) -> Vec<String> {
        lock(&self.state).subscriptions.iter().cloned().collect()
    }

    pub fn subscribe_calls(&self) -> usize {
        lock(&self.state).subscribe_calls
    }

    pub fn fail_subscribes(&self, fail: bool) {
        lock(&self.state).fail_subscribes = fail;
    }

    pub fn sent_messages(&self) -> Vec<PublishedMessage> {
        lock(&self.state).sent.clone()
    }

    /// Fail the next `count` sends
    pub fn fail_next_sends(&self, count: u32) {
        lock(&self.state).fail_sends = count;
    }

    /// Make sends never complete
    pub fn hang_sends(&self, hang: bool) {
        lock(&self.state).hang_sends = hang;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        lock(&self.state).send_delay = Some(delay);
    }

    pub fn max_concurrent_sends(&self) -> usize {
        self.sends.peak.load(Ordering::SeqCst)
    }

    /// Answer every send to `command_topic` with `payload` on `reply_topic`
    pub fn reply_on(&self, command_topic: &str, reply_topic: &str, payload: impl Into<Vec<u8>>) {
        lock(&self.state).replies.insert(
            command_topic.to_string(),
            (reply_topic.to_string(), Some(payload.into())),
        );
    }

    /// Republish every send to `command_topic` unchanged on `reply_topic`,
    /// the way a device reflects an applied command in its state
    pub fn echo_on(&self, command_topic: &str, reply_topic: &str) {
        lock(&self.state)
            .replies
            .insert(command_topic.to_string(), (reply_topic.to_string(), None));
    }

    /// Deliver a frame as the broker would. Returns false when there is no
    /// connection or the topic is not subscribed on it.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let state = lock(&self.state);
        match &state.current {
            Some(active) if state.subscriptions.contains(topic) => active
                .frames
                .try_send(Ok(Frame::new(topic, payload.into())))
                .is_ok(),
            _ => false,
        }
    }

    /// Reset the current connection: the stream yields an error and closes
    pub fn drop_connection(&self) {
        let mut state = lock(&self.state);
        if let Some(active) = state.current.take() {
            active.alive.store(false, Ordering::SeqCst);
            let _ = active.frames.try_send(Err(TransportError::Closed(
                "connection reset by mock broker".to_string(),
            )));
        }
        state.subscriptions.clear();
    }

    /// Make the current link report itself dead while its stream stays open
    pub fn mark_link_dead(&self) {
        if let Some(active) = &lock(&self.state).current {
            active.alive.store(false, Ordering::SeqCst);
        }
    }

    /// Whether the broker holds an open connection
    pub fn is_connected(&self) -> bool {
        lock(&self.state).current.is_some()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, request: ConnectRequest<'_>) -> Result<OpenedLink, TransportError> {
        let _in_flight = InFlight::enter(&self.opens);

        let delay = {
            let mut state = lock(&self.state);
            state.open_attempts.push(Instant::now());
            state.open_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(TransportError::ConnectionRefused(format!(
                "mock broker refused {}",
                request.client_id
            )));
        }

        if let Some(previous) = state.current.take() {
            previous.alive.store(false, Ordering::SeqCst);
        }

        state.next_link_id += 1;
        state.opened_links += 1;
        state.subscriptions.clear();

        let id = state.next_link_id;
        let (frames_tx, frames_rx) = mpsc::channel(MOCK_FRAME_BUFFER);
        let alive = Arc::new(AtomicBool::new(true));
        state.current = Some(ActiveLink {
            id,
            frames: frames_tx,
            alive: Arc::clone(&alive),
        });

        let link = MockLink {
            id,
            state: Arc::clone(&self.state),
            sends: Arc::clone(&self.sends),
            alive,
        };

        Ok(OpenedLink {
            link: Arc::new(link),
            frames: frames_rx,
        })
    }
}

/// Link handed out by [`MockConnector`]
pub struct MockLink {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    sends: Arc<Gauge>,
    alive: Arc<AtomicBool>,
}

impl MockLink {
    fn ensure_current(&self) -> Result<(), TransportError> {
        let state = lock(&self.state);
        match &state.current {
            Some(active) if active.id == self.id => Ok(()),
            _ => Err(TransportError::Closed("mock link is closed".to_string())),
        }
    }
}

#[async_trait]
impl Link for MockLink {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_current()?;
        let mut state = lock(&self.state);
        state.subscribe_calls += 1;
        if state.fail_subscribes {
            return Err(TransportError::SubscriptionFailed(
                format!("mock broker rejected {topic}").into(),
            ));
        }
        state.subscriptions.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_current()?;
        lock(&self.state).subscriptions.remove(topic);
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let _in_flight = InFlight::enter(&self.sends);
        self.ensure_current()?;

        let (hang, delay) = {
            let state = lock(&self.state);
            (state.hang_sends, state.send_delay)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(TransportError::SendFailed("mock send failure".into()));
        }

        if let Some((reply_topic, reply)) = state.replies.get(topic).cloned() {
            let reply = reply.unwrap_or_else(|| payload.clone());
            if let Some(active) = &state.current {
                if state.subscriptions.contains(&reply_topic) {
                    let _ = active.frames.try_send(Ok(Frame::new(reply_topic, reply)));
                }
            }
        }
        state.sent.push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.alive.store(false, Ordering::SeqCst);

        let mut state = lock(&self.state);
        if state.current.as_ref().is_some_and(|active| active.id == self.id) {
            state.current = None;
            state.subscriptions.clear();
            state.closed_links += 1;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Records every delivery
#[derive(Clone)]
pub struct RecordingListener {
    received: Arc<Mutex<Vec<(String, Payload)>>>,
    count: Arc<watch::Sender<usize>>,
}

impl Default for RecordingListener {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingListener {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            received: Arc::default(),
            count: Arc::new(count),
        }
    }

    pub fn received(&self) -> Vec<(String, Payload)> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until at least `count` messages have been delivered
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|seen| *seen >= count))
            .await
            .is_ok_and(|result| result.is_ok())
    }
}

#[async_trait]
impl StateListener for RecordingListener {
    async fn on_message(&self, topic: &str, payload: &Payload) -> Result<(), ListenerError> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), payload.clone()));
        self.count.send_modify(|count| *count += 1);
        Ok(())
    }
}

/// Always returns an error
#[derive(Clone, Default)]
pub struct FailingListener {
    calls: Arc<AtomicUsize>,
}

impl FailingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateListener for FailingListener {
    async fn on_message(&self, topic: &str, _payload: &Payload) -> Result<(), ListenerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ListenerError::new(format!("mock listener rejected {topic}")))
    }
}

/// Panics on every delivery
#[derive(Clone, Default)]
pub struct PanickingListener;

#[async_trait]
impl StateListener for PanickingListener {
    async fn on_message(&self, topic: &str, _payload: &Payload) -> Result<(), ListenerError> {
        panic!("mock listener panicked on {topic}");
    }
}
