//! Session manager: public handle and I/O coordination
//!
//! Owns the connection slot, the background tasks and the reentrancy guard,
//! and drives the pure state machine in [`super::state`]. Exactly one
//! connect or reconnect sequence runs at a time; concurrent triggers are
//! dropped rather than queued.

use super::dispatcher::{self, CommandOutcome};
use super::liveness::{self, HealthMetrics, LivenessMonitor, LivenessVerdict};
use super::registry::{StateListener, TopicRegistry};
use super::router::{self, DeliveryWorkers};
use super::state::{
    log_state_transition, next_state, SessionConfig, SessionEvent, SessionInfo, SessionState,
};
use crate::error::{redact_secrets, ClientError, ClientResult};
use crate::observability::{MetricsSnapshot, SessionMetrics};
use crate::protocol::{validate_topic, Payload};
use crate::transport::{ConnectRequest, Connector, Credentials, FrameStream, Link, OpenedLink};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Inbound topic announcements kept for confirmation waiters
const INBOUND_ANNOUNCE_CAPACITY: usize = 64;

/// Handle to a resilient broker session. Clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

pub(super) struct SessionInner {
    pub(super) config: SessionConfig,
    client_id: String,
    connector: Arc<dyn Connector>,
    pub(super) registry: RwLock<TopicRegistry>,
    state_tx: watch::Sender<SessionState>,
    info: Mutex<SessionInfo>,
    link: Mutex<Option<Arc<dyn Link>>>,
    tasks: Mutex<ConnectionTasks>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    credentials: Mutex<Option<Credentials>>,
    connect_in_flight: AtomicBool,
    /// Held by every connect attempt and by disconnect
    lifecycle: tokio::sync::Mutex<()>,
    shutdown: AtomicBool,
    epoch: AtomicU64,
    pub(super) command_lock: tokio::sync::Mutex<()>,
    pub(super) metrics: Arc<SessionMetrics>,
    pub(super) inbound: broadcast::Sender<String>,
}

/// Tasks bound to one connection
#[derive(Default)]
struct ConnectionTasks {
    router: Option<JoinHandle<()>>,
    deliveries: Option<Arc<DeliveryWorkers>>,
    alive_check: Option<JoinHandle<()>>,
}

/// Reentrancy guard held for a whole connect or reconnect sequence
pub(super) struct ConnectGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ConnectGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionManager {
    /// Create a session. Nothing connects until `connect` or `connect_with_retry`.
    /// Timer settings that cannot run are replaced with defaults.
    pub fn new(config: SessionConfig, connector: impl Connector) -> Self {
        let config = config.sanitized();
        let client_id = format!("{}-{}", config.client_id_prefix, Uuid::new_v4().simple());
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (inbound, _) = broadcast::channel(INBOUND_ANNOUNCE_CAPACITY);

        let inner = SessionInner {
            config,
            client_id,
            connector: Arc::new(connector),
            registry: RwLock::new(TopicRegistry::new()),
            state_tx,
            info: Mutex::new(SessionInfo::default()),
            link: Mutex::new(None),
            tasks: Mutex::new(ConnectionTasks::default()),
            monitor: Mutex::new(None),
            credentials: Mutex::new(None),
            connect_in_flight: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            shutdown: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            command_lock: tokio::sync::Mutex::new(()),
            metrics: Arc::new(SessionMetrics::new()),
            inbound,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Client identity presented to the broker, stable for this manager
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Observe state transitions
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn health(&self) -> HealthMetrics {
        let info = lock(&self.inner.info).clone();
        LivenessMonitor::calculate_health_metrics(
            &info,
            &self.inner.state(),
            Instant::now(),
            self.inner.config.stale_threshold(),
        )
    }

    /// Topics currently in the registry, sorted
    pub async fn registered_topics(&self) -> Vec<String> {
        self.inner.registry.read().await.topics()
    }

    /// Single connection attempt. Returns false if it fails or another
    /// attempt is already in flight.
    pub async fn connect(&self, credentials: Credentials) -> bool {
        let inner = &self.inner;
        inner.shutdown.store(false, Ordering::SeqCst);
        inner.remember(credentials.clone());

        let Some(_guard) = ConnectGuard::acquire(&inner.connect_in_flight) else {
            debug!("Connection attempt already in progress, skipping");
            return false;
        };

        let span = crate::session_span!(client_id = %inner.client_id, operation = "connect");
        match inner.attempt_connect(&credentials).instrument(span).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %redact_secrets(&e.to_string()), "Failed to connect to broker");
                false
            }
        }
    }

    /// Connect with exponential backoff. `max_retries` defaults to the
    /// configured reconnect attempts.
    pub async fn connect_with_retry(&self, credentials: Credentials, max_retries: Option<u32>) -> bool {
        let inner = &self.inner;
        inner.shutdown.store(false, Ordering::SeqCst);
        inner.remember(credentials.clone());

        let span = crate::session_span!(client_id = %inner.client_id, operation = "connect_with_retry");
        inner.reconnect(credentials, max_retries).instrument(span).await
    }

    /// Stop the monitor, cancel connection tasks and close the transport
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        info!(client_id = %inner.client_id, "Disconnecting from broker");
        inner.shutdown.store(true, Ordering::SeqCst);

        let monitor = lock(&inner.monitor).take();
        if let Some(handle) = monitor {
            handle.abort();
            let _ = handle.await;
            debug!("Connection monitor stopped");
        }

        let _lifecycle = inner.lifecycle.lock().await;
        inner.teardown().await;
        inner.metrics.connection_closed();
        inner.apply(SessionEvent::Shutdown);
        info!("Disconnected from broker");
    }

    /// Wait until the session is connected or `timeout` elapses
    pub async fn wait_for_connection(&self, timeout: Duration) -> ClientResult<()> {
        self.inner.wait_until_connected(timeout).await
    }

    /// Register a listener for `topic`, replacing any existing one. When
    /// connected the topic is subscribed immediately; otherwise on the next
    /// successful connect.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        listener: impl StateListener + 'static,
    ) -> ClientResult<()> {
        let topic = topic.into();
        validate_topic(&topic)?;
        let inner = &self.inner;

        let connected = {
            let mut registry = inner.registry.write().await;
            if registry.register(topic.clone(), Arc::new(listener)).is_some() {
                debug!("Replaced listener for topic: {}", topic);
            }
            inner.is_connected()
        };

        if !connected {
            debug!("Not connected, topic {} will be subscribed on connect", topic);
            return Ok(());
        }

        let Some(link) = inner.current_link() else {
            return Ok(());
        };

        if let Err(reason) = inner.subscribe_on(&link, &topic).await {
            error!(topic = %topic, "Subscription failed, forcing reconnect: {}", reason);
            inner.metrics.subscription_failed();
            inner.degrade(SessionEvent::ConnectionLost(format!(
                "subscribe to {topic} failed: {reason}"
            )));
            inner.schedule_reconnect(Duration::ZERO);
        }

        Ok(())
    }

    /// Remove the listener for `topic` and unsubscribe on a best-effort basis
    pub async fn unsubscribe(&self, topic: &str) {
        let inner = &self.inner;

        let connected = {
            let mut registry = inner.registry.write().await;
            if registry.unregister(topic).is_none() {
                debug!("Topic {} was not registered", topic);
            }
            inner.is_connected()
        };

        if !connected {
            return;
        }

        if let Some(link) = inner.current_link() {
            match tokio::time::timeout(inner.config.operation_timeout, link.unsubscribe(topic)).await
            {
                Ok(Ok(())) => debug!("Unsubscribed from topic: {}", topic),
                Ok(Err(e)) => warn!("Error unsubscribing from {}: {}", topic, e),
                Err(_) => warn!("Timed out unsubscribing from {}", topic),
            }
        }
    }

    /// Publish a JSON payload. Never panics and never hangs past the
    /// configured bounds.
    ///
    /// `true` means the transport accepted the message for sending on a
    /// live connection. It is not a broker acknowledgement; use
    /// [`publish_and_confirm`](Self::publish_and_confirm) to wait for the
    /// device to report the change.
    pub async fn publish(&self, topic: &str, payload: &Payload) -> bool {
        let span = crate::command_span!(topic = %topic);
        dispatcher::publish(&self.inner, topic, payload)
            .instrument(span)
            .await
    }

    /// Publish, then wait up to `wait` for the next frame on `confirm_topic`
    pub async fn publish_and_confirm(
        &self,
        topic: &str,
        payload: &Payload,
        confirm_topic: &str,
        wait: Duration,
    ) -> CommandOutcome {
        let span = crate::command_span!(topic = %topic, confirm_topic = %confirm_topic);
        dispatcher::publish_and_confirm(&self.inner, topic, payload, confirm_topic, wait)
            .instrument(span)
            .await
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("client_id", &self.inner.client_id)
            .field("endpoint", &self.inner.config.endpoint)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl SessionInner {
    pub(super) fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub(super) fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    pub(super) fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(super) fn reconnect_in_flight(&self) -> bool {
        self.connect_in_flight.load(Ordering::SeqCst)
    }

    pub(super) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// An explicit caller request re-enables internal reconnects
    pub(super) fn clear_shutdown(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
    }

    pub(super) fn current_link(&self) -> Option<Arc<dyn Link>> {
        lock(&self.link).clone()
    }

    pub(super) fn stored_credentials(&self) -> Option<Credentials> {
        lock(&self.credentials).clone()
    }

    fn remember(&self, credentials: Credentials) {
        *lock(&self.credentials) = Some(credentials);
    }

    /// Record inbound activity; resets the stale clock
    pub(super) fn touch_inbound(&self) {
        lock(&self.info).touch(Instant::now());
    }

    pub(super) fn apply(&self, event: SessionEvent) {
        self.state_tx.send_modify(|state| {
            let next = next_state(state, event);
            log_state_transition(state, &next);
            *state = next;
        });
    }

    /// Mark a connected session suspect
    pub(super) fn degrade(&self, event: SessionEvent) {
        if self.is_connected() {
            self.metrics.connection_lost();
        }
        self.apply(event);
    }

    pub(super) async fn wait_until_connected(&self, timeout: Duration) -> ClientResult<()> {
        let mut states = self.state_tx.subscribe();
        let connected = async {
            states
                .wait_for(SessionState::is_connected)
                .await
                .map(|_| ())
        };

        match tokio::time::timeout(timeout, connected).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::ShutdownRequested),
            Err(_) => Err(ClientError::timeout("wait_for_connection", timeout)),
        }
    }

    /// Run a reconnect sequence unless one is already in flight
    pub(super) async fn reconnect(
        self: &Arc<Self>,
        credentials: Credentials,
        max_attempts: Option<u32>,
    ) -> bool {
        let Some(guard) = ConnectGuard::acquire(&self.connect_in_flight) else {
            debug!("Reconnection already in progress, skipping");
            return false;
        };
        self.run_sequence(guard, credentials, max_attempts).await
    }

    async fn run_sequence(
        self: &Arc<Self>,
        _guard: ConnectGuard<'_>,
        credentials: Credentials,
        max_attempts: Option<u32>,
    ) -> bool {
        let policy = &self.config.reconnect;
        let max_attempts = max_attempts.unwrap_or(policy.max_attempts).max(1);

        for attempt in 1..=max_attempts {
            if self.shutdown_requested() {
                info!("Shutdown requested, abandoning reconnection");
                return false;
            }

            if attempt > 1 {
                let delay = policy.backoff_delay(attempt - 1);
                self.apply(SessionEvent::RetryScheduled(attempt));
                info!(
                    "Waiting {:?} before connection attempt {}/{}",
                    delay, attempt, max_attempts
                );
                tokio::time::sleep(delay).await;
            }

            match self.attempt_connect(&credentials).await {
                Ok(()) => return true,
                Err(ClientError::ShutdownRequested) => return false,
                Err(e) => warn!(
                    attempt,
                    max_attempts,
                    error = %redact_secrets(&e.to_string()),
                    "Connection attempt failed"
                ),
            }
        }

        error!("Failed to connect after {} attempts", max_attempts);
        self.apply(SessionEvent::RetriesExhausted);
        false
    }

    /// One attempt: tear down, open, restore subscriptions, start tasks
    async fn attempt_connect(self: &Arc<Self>, credentials: &Credentials) -> ClientResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.shutdown_requested() {
            return Err(ClientError::ShutdownRequested);
        }

        self.apply(SessionEvent::ConnectRequested);
        self.metrics.connection_attempt();
        self.teardown().await;

        let request = ConnectRequest {
            endpoint: &self.config.endpoint,
            client_id: &self.client_id,
            credentials,
            keep_alive: self.config.keep_alive,
        };

        let opened = match tokio::time::timeout(self.config.connect_timeout, self.connector.open(request)).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                self.fail_connect(e.to_string());
                return Err(e.into());
            }
            Err(_) => {
                self.fail_connect(format!("timed out after {:?}", self.config.connect_timeout));
                return Err(ClientError::ConnectTimeout(self.config.connect_timeout));
            }
        };

        let OpenedLink { link, frames } = opened;
        *lock(&self.link) = Some(Arc::clone(&link));

        // Registrations wait until the sweep has finished and the state is
        // Connected, so none can slip between the two.
        let registry = self.registry.read().await;
        let topics = registry.topics();
        if !topics.is_empty() {
            info!("Resubscribing to {} topics", topics.len());
        }

        for topic in &topics {
            if let Err(reason) = self.subscribe_on(&link, topic).await {
                drop(registry);
                self.metrics.subscription_failed();
                self.teardown().await;
                self.fail_connect(format!("resubscribe to {topic} failed"));
                return Err(ClientError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason,
                });
            }
        }

        if self.shutdown_requested() {
            drop(registry);
            self.teardown().await;
            self.apply(SessionEvent::Shutdown);
            return Err(ClientError::ShutdownRequested);
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.info).on_connected(Instant::now());
        self.start_connection_tasks(epoch, link, frames);
        self.apply(SessionEvent::TransportOpened);
        drop(registry);

        self.metrics.connection_established();
        self.ensure_monitor();
        info!(
            client_id = %self.client_id,
            endpoint = %self.config.endpoint,
            "Connected to broker"
        );
        Ok(())
    }

    fn fail_connect(&self, reason: String) {
        self.metrics.connection_failed();
        self.apply(SessionEvent::ConnectFailed(reason));
    }

    async fn subscribe_on(&self, link: &Arc<dyn Link>, topic: &str) -> Result<(), String> {
        match tokio::time::timeout(self.config.operation_timeout, link.subscribe(topic)).await {
            Ok(Ok(())) => {
                debug!("Subscribed to topic: {}", topic);
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.config.operation_timeout)),
        }
    }

    fn start_connection_tasks(self: &Arc<Self>, epoch: u64, link: Arc<dyn Link>, frames: FrameStream) {
        let deliveries = Arc::new(DeliveryWorkers::new());
        let router = tokio::spawn(router::run_router(
            Arc::downgrade(self),
            epoch,
            frames,
            Arc::clone(&deliveries),
        ));
        let alive_check = tokio::spawn(liveness::run_alive_check(
            Arc::downgrade(self),
            epoch,
            link,
            self.config.alive_check_interval,
        ));

        let mut tasks = lock(&self.tasks);
        tasks.router = Some(router);
        tasks.deliveries = Some(deliveries);
        tasks.alive_check = Some(alive_check);
    }

    /// Start the periodic connection monitor if it is not running
    fn ensure_monitor(self: &Arc<Self>) {
        let mut monitor = lock(&self.monitor);
        if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        *monitor = Some(tokio::spawn(liveness::run_monitor(
            Arc::downgrade(self),
            self.config.monitor_interval,
        )));
        debug!("Connection monitor started");
    }

    /// Cancel and await connection tasks, then close the transport.
    /// The router and its listener workers are gone before any new
    /// transport is opened.
    pub(super) async fn teardown(&self) {
        let (router, deliveries, alive_check) = {
            let mut tasks = lock(&self.tasks);
            (tasks.router.take(), tasks.deliveries.take(), tasks.alive_check.take())
        };

        for handle in [router, alive_check].into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(deliveries) = deliveries {
            deliveries.shutdown().await;
        }

        let link = lock(&self.link).take();
        if let Some(link) = link {
            match tokio::time::timeout(self.config.operation_timeout, link.close()).await {
                Ok(Ok(())) => debug!("Previous connection closed"),
                Ok(Err(e)) => debug!("Error closing previous connection: {}", e),
                Err(_) => warn!("Timed out closing previous connection"),
            }
        }
    }

    /// Called by the router when its stream ends on its own
    pub(super) fn on_stream_ended(self: &Arc<Self>, epoch: u64, reason: String) {
        if epoch != self.current_epoch() || !self.is_connected() {
            debug!("Ignoring end of superseded stream: {}", reason);
            return;
        }

        warn!("Inbound stream ended: {}", reason);
        self.degrade(SessionEvent::ConnectionLost(reason));
        self.schedule_reconnect(self.config.reconnect_delay_after_loss);
    }

    /// Run a reconnect sequence in the background after `delay`
    pub(super) fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.shutdown_requested() {
                return;
            }
            let Some(credentials) = inner.stored_credentials() else {
                warn!("No credentials stored, cannot reconnect");
                return;
            };
            let Some(guard) = ConnectGuard::acquire(&inner.connect_in_flight) else {
                debug!("Reconnection already in progress");
                return;
            };
            inner.run_sequence(guard, credentials, None).await;
        });
    }

    /// One liveness check, run on every monitor tick
    pub(super) async fn check_connection_status(self: &Arc<Self>) {
        if self.shutdown_requested() {
            return;
        }

        let state = self.state();
        let idle = lock(&self.info).idle_for(Instant::now());
        let credentials = self.stored_credentials();
        let threshold = self.config.stale_threshold();

        let verdict = LivenessMonitor::assess(
            &state,
            self.reconnect_in_flight(),
            credentials.is_some(),
            idle,
            threshold,
        );

        match (verdict, credentials) {
            (LivenessVerdict::Reconnect, Some(credentials)) => {
                info!("Connection monitor found session {:?}, reconnecting", state);
                self.reconnect(credentials, None).await;
            }
            (LivenessVerdict::Stale { idle }, Some(credentials)) => {
                let Some(guard) = ConnectGuard::acquire(&self.connect_in_flight) else {
                    return;
                };
                warn!(
                    idle_secs = idle.as_secs(),
                    threshold_secs = threshold.as_secs(),
                    "Connection may be stale, forcing reconnect"
                );
                self.metrics.stale_detected();
                self.degrade(SessionEvent::StaleDetected(idle));
                self.teardown().await;
                self.run_sequence(guard, credentials, None).await;
            }
            (LivenessVerdict::Healthy, _) => debug!("Connection healthy"),
            _ => {}
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let monitor = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);

        for handle in [monitor, tasks.router.take(), tasks.alive_check.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        if let Some(deliveries) = tasks.deliveries.take() {
            deliveries.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_guard_is_exclusive() {
        let flag = AtomicBool::new(false);

        let first = ConnectGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(ConnectGuard::acquire(&flag).is_none());

        drop(first);
        assert!(ConnectGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_connect_guard_released_on_drop() {
        let flag = AtomicBool::new(false);
        {
            let _guard = ConnectGuard::acquire(&flag);
            assert!(flag.load(Ordering::SeqCst));
        }
        assert!(!flag.load(Ordering::SeqCst));
    }
}
