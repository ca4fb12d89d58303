//! Pure session state management
//!
//! The session state enum, the events that move it, the reconnect backoff
//! policy and the runtime configuration. Nothing here performs I/O.

use crate::transport::Endpoint;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Lifecycle state of the broker session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No connection and no attempt in progress
    Idle,
    /// A transport open is in flight
    Connecting,
    /// Connected, subscriptions restored, router running
    Connected,
    /// Connection is suspect (send failure, stale, stream ended)
    Degraded(String),
    /// Waiting out the backoff before the given attempt
    Reconnecting { attempt: u32 },
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// Events that drive [`SessionState`] transitions
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectRequested,
    TransportOpened,
    ConnectFailed(String),
    ConnectionLost(String),
    StaleDetected(Duration),
    SendFailed(String),
    RetryScheduled(u32),
    RetriesExhausted,
    Shutdown,
}

/// Determine next state after a session event (pure function)
pub fn next_state(current: &SessionState, event: SessionEvent) -> SessionState {
    match event {
        SessionEvent::ConnectRequested => SessionState::Connecting,
        SessionEvent::TransportOpened => SessionState::Connected,
        SessionEvent::ConnectFailed(_) | SessionEvent::RetriesExhausted | SessionEvent::Shutdown => {
            SessionState::Idle
        }
        SessionEvent::ConnectionLost(reason) | SessionEvent::SendFailed(reason) => {
            if current.is_connected() {
                SessionState::Degraded(reason)
            } else {
                current.clone()
            }
        }
        SessionEvent::StaleDetected(idle) => {
            SessionState::Degraded(format!("no inbound traffic for {}s", idle.as_secs()))
        }
        SessionEvent::RetryScheduled(attempt) => SessionState::Reconnecting { attempt },
    }
}

/// Log a state transition (pure logging function)
pub fn log_state_transition(from: &SessionState, to: &SessionState) {
    match (from, to) {
        (SessionState::Connecting, SessionState::Connected) => {
            info!("Broker session established");
        }
        (SessionState::Connected, SessionState::Degraded(reason)) => {
            warn!("Broker session degraded: {}", reason);
        }
        (_, SessionState::Reconnecting { attempt }) => {
            info!("Scheduling reconnection attempt {}", attempt);
        }
        (SessionState::Connecting, SessionState::Idle) => {
            error!("Connection attempt failed");
        }
        _ if from == to => {}
        _ => {
            info!("Session state: {:?} -> {:?}", from, to);
        }
    }
}

/// Exponential reconnect backoff: `min(base * 2^(n-1), ceiling)` after `n` failures
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Attempts per reconnect sequence
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub ceiling: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            ceiling: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(failures - 1);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }

    /// Total backoff time a full sequence of `attempts` can spend waiting
    pub fn worst_case_wait(&self, attempts: u32) -> Duration {
        (1..attempts).map(|failures| self.backoff_delay(failures)).sum()
    }
}

/// Runtime session configuration, fixed at construction
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Bound on each subscribe, unsubscribe and publish attempt
    pub operation_timeout: Duration,
    pub monitor_interval: Duration,
    pub alive_check_interval: Duration,
    pub stale_multiplier: f64,
    pub reconnect: ReconnectPolicy,
    pub publish_reconnect_attempts: u32,
    pub publish_retries: u32,
    pub publish_retry_delay: Duration,
    pub reconnect_delay_after_loss: Duration,
}

impl SessionConfig {
    /// Inbound silence after which a connection is considered stale
    pub fn stale_threshold(&self) -> Duration {
        Duration::try_from_secs_f64(self.keep_alive.as_secs_f64() * self.stale_multiplier)
            .unwrap_or(Duration::MAX)
    }

    /// Replace values the background timers cannot run with: zero periods
    /// and a stale multiplier that is not a finite number above 1.0.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();

        if self.monitor_interval.is_zero() {
            warn!(
                "monitor_interval is zero, using {:?}",
                defaults.monitor_interval
            );
            self.monitor_interval = defaults.monitor_interval;
        }
        if self.alive_check_interval.is_zero() {
            warn!(
                "alive_check_interval is zero, using {:?}",
                defaults.alive_check_interval
            );
            self.alive_check_interval = defaults.alive_check_interval;
        }
        if !self.stale_multiplier.is_finite() || self.stale_multiplier <= 1.0 {
            warn!(
                "stale_multiplier {} is not above 1.0, using {}",
                self.stale_multiplier, defaults.stale_multiplier
            );
            self.stale_multiplier = defaults.stale_multiplier;
        }
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            client_id_prefix: "miraie-mqtt".to_string(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(30),
            alive_check_interval: Duration::from_secs(30),
            stale_multiplier: 1.5,
            reconnect: ReconnectPolicy::default(),
            publish_reconnect_attempts: 2,
            publish_retries: 3,
            publish_retry_delay: Duration::from_millis(500),
            reconnect_delay_after_loss: Duration::from_secs(1),
        }
    }
}

/// Mutable bookkeeping for the current session
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub last_connected: Option<Instant>,
    /// Last inbound frame, successful send or confirmed alive-check
    pub last_inbound: Option<Instant>,
    /// Successful connects after the first one
    pub reconnect_count: u32,
}

impl SessionInfo {
    pub fn on_connected(&mut self, now: Instant) {
        if self.last_connected.is_some() {
            self.reconnect_count += 1;
        }
        self.last_connected = Some(now);
        self.last_inbound = Some(now);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_inbound = Some(now);
    }

    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.last_inbound.map(|t| now.saturating_duration_since(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_connect_cycle_transitions() {
        let connecting = next_state(&SessionState::Idle, SessionEvent::ConnectRequested);
        assert_eq!(connecting, SessionState::Connecting);

        let connected = next_state(&connecting, SessionEvent::TransportOpened);
        assert!(connected.is_connected());

        let degraded = next_state(&connected, SessionEvent::ConnectionLost("eof".to_string()));
        assert_eq!(degraded, SessionState::Degraded("eof".to_string()));

        let reconnecting = next_state(&degraded, SessionEvent::RetryScheduled(2));
        assert_eq!(reconnecting, SessionState::Reconnecting { attempt: 2 });

        let idle = next_state(&reconnecting, SessionEvent::RetriesExhausted);
        assert_eq!(idle, SessionState::Idle);
    }

    #[test]
    fn test_loss_only_degrades_a_connected_session() {
        let state = next_state(
            &SessionState::Connecting,
            SessionEvent::SendFailed("timeout".to_string()),
        );
        assert_eq!(state, SessionState::Connecting);

        let state = next_state(&SessionState::Idle, SessionEvent::ConnectionLost("eof".to_string()));
        assert_eq!(state, SessionState::Idle);
    }

    #[test]
    fn test_stale_detection_degrades() {
        let state = next_state(
            &SessionState::Connected,
            SessionEvent::StaleDetected(Duration::from_secs(95)),
        );
        assert!(matches!(state, SessionState::Degraded(reason) if reason.contains("95s")));
    }

    #[test]
    fn test_shutdown_returns_to_idle() {
        assert_eq!(
            next_state(&SessionState::Connected, SessionEvent::Shutdown),
            SessionState::Idle
        );
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            ceiling: Duration::from_secs(60),
        };

        let delays: Vec<u64> = (1..=8).map(|n| policy.backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.backoff_delay(0), Duration::ZERO);
    }

    #[test]
    fn test_default_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=6).map(|n| policy.backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60]);
    }

    #[test]
    fn test_backoff_survives_huge_failure_counts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff_delay(u32::MAX), policy.ceiling);
    }

    #[test]
    fn test_worst_case_wait() {
        let policy = ReconnectPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            ceiling: Duration::from_secs(60),
        };
        assert_eq!(policy.worst_case_wait(4), Duration::from_secs(1 + 2 + 4));
        assert_eq!(policy.worst_case_wait(1), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(
            base in 1u64..30,
            ceiling in 30u64..600,
            failures in 1u32..64,
        ) {
            let policy = ReconnectPolicy {
                max_attempts: 10,
                base_delay: Duration::from_secs(base),
                ceiling: Duration::from_secs(ceiling),
            };
            let current = policy.backoff_delay(failures);
            let next = policy.backoff_delay(failures + 1);

            prop_assert!(current <= policy.ceiling);
            prop_assert!(next >= current);
        }
    }

    #[test]
    fn test_stale_threshold() {
        let config = SessionConfig {
            keep_alive: Duration::from_secs(10),
            stale_multiplier: 1.5,
            ..SessionConfig::default()
        };
        assert_eq!(config.stale_threshold(), Duration::from_secs(15));
    }

    #[test]
    fn test_sanitized_replaces_unusable_timer_values() {
        let config = SessionConfig {
            monitor_interval: Duration::ZERO,
            alive_check_interval: Duration::ZERO,
            stale_multiplier: f64::INFINITY,
            ..SessionConfig::default()
        }
        .sanitized();

        assert_eq!(config.monitor_interval, Duration::from_secs(30));
        assert_eq!(config.alive_check_interval, Duration::from_secs(30));
        assert_eq!(config.stale_multiplier, 1.5);
        assert_eq!(config.stale_threshold(), Duration::from_secs(90));
    }

    #[test]
    fn test_sanitized_keeps_valid_values() {
        let config = SessionConfig {
            monitor_interval: Duration::from_secs(7),
            alive_check_interval: Duration::from_secs(3),
            stale_multiplier: 2.0,
            ..SessionConfig::default()
        }
        .sanitized();

        assert_eq!(config.monitor_interval, Duration::from_secs(7));
        assert_eq!(config.alive_check_interval, Duration::from_secs(3));
        assert_eq!(config.stale_multiplier, 2.0);
    }

    #[test]
    fn test_stale_threshold_saturates_instead_of_panicking() {
        let config = SessionConfig {
            stale_multiplier: f64::NAN,
            ..SessionConfig::default()
        };
        assert_eq!(config.stale_threshold(), Duration::MAX);
    }

    #[test]
    fn test_session_info_tracks_reconnects() {
        let start = Instant::now();
        let mut info = SessionInfo::default();

        info.on_connected(start);
        assert_eq!(info.reconnect_count, 0);
        assert_eq!(info.idle_for(start), Some(Duration::ZERO));

        info.on_connected(start + Duration::from_secs(5));
        assert_eq!(info.reconnect_count, 1);

        info.touch(start + Duration::from_secs(8));
        assert_eq!(
            info.idle_for(start + Duration::from_secs(10)),
            Some(Duration::from_secs(2))
        );
    }
}
