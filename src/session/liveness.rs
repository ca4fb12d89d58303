//! Liveness monitoring
//!
//! Pure assessment of session health plus the two background loops that
//! drive it: the periodic connection monitor and the per-connection
//! alive-check.

use super::manager::SessionInner;
use super::state::{SessionEvent, SessionInfo, SessionState};
use crate::transport::Link;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Outcome of one liveness check
#[derive(Debug, Clone, PartialEq)]
pub enum LivenessVerdict {
    /// Connected and traffic is recent
    Healthy,
    /// Not connected and nothing is trying to fix that
    Reconnect,
    /// Connected but silent for longer than the stale threshold
    Stale { idle: Duration },
    /// Nothing to do: a sequence is in flight or there are no credentials
    Standby,
}

/// Connection health snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    pub time_since_last_inbound: Option<Duration>,
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

/// Pure liveness decisions
pub struct LivenessMonitor;

impl LivenessMonitor {
    /// Decide what the monitor should do (pure function)
    pub fn assess(
        state: &SessionState,
        reconnect_in_flight: bool,
        has_credentials: bool,
        idle: Option<Duration>,
        stale_threshold: Duration,
    ) -> LivenessVerdict {
        if reconnect_in_flight {
            return LivenessVerdict::Standby;
        }

        match state {
            SessionState::Connected => match idle {
                Some(idle) if idle > stale_threshold => LivenessVerdict::Stale { idle },
                _ => LivenessVerdict::Healthy,
            },
            SessionState::Idle | SessionState::Degraded(_) if has_credentials => {
                LivenessVerdict::Reconnect
            }
            _ => LivenessVerdict::Standby,
        }
    }

    /// Calculate health metrics (pure function)
    pub fn calculate_health_metrics(
        info: &SessionInfo,
        state: &SessionState,
        now: Instant,
        stale_threshold: Duration,
    ) -> HealthMetrics {
        let connected = state.is_connected();
        let idle = info.idle_for(now);

        HealthMetrics {
            uptime: info
                .last_connected
                .filter(|_| connected)
                .map(|t| now.saturating_duration_since(t)),
            time_since_last_inbound: idle,
            reconnect_count: info.reconnect_count,
            is_healthy: connected && idle.map_or(true, |idle| idle <= stale_threshold),
        }
    }
}

/// Periodic connection monitor. Runs until the session is dropped or the
/// task is aborted by `disconnect`.
pub(super) async fn run_monitor(session: Weak<SessionInner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(session) = session.upgrade() else {
            debug!("Session dropped, stopping connection monitor");
            break;
        };
        session.check_connection_status().await;
    }
}

/// Per-connection alive-check. A link that still reports itself alive
/// counts as inbound activity; one that does not marks the session suspect.
pub(super) async fn run_alive_check(
    session: Weak<SessionInner>,
    epoch: u64,
    link: Arc<dyn Link>,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(session) = session.upgrade() else {
            break;
        };
        if session.current_epoch() != epoch || !session.is_connected() {
            break;
        }

        if link.is_alive() {
            trace!("Alive check passed");
            session.touch_inbound();
        } else {
            warn!("Transport no longer alive, marking session suspect");
            session.degrade(SessionEvent::ConnectionLost("alive check failed".to_string()));
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(90);

    #[test]
    fn test_idle_session_with_credentials_reconnects() {
        let verdict = LivenessMonitor::assess(&SessionState::Idle, false, true, None, THRESHOLD);
        assert_eq!(verdict, LivenessVerdict::Reconnect);

        let degraded = SessionState::Degraded("send failed".to_string());
        let verdict = LivenessMonitor::assess(&degraded, false, true, None, THRESHOLD);
        assert_eq!(verdict, LivenessVerdict::Reconnect);
    }

    #[test]
    fn test_no_credentials_means_standby() {
        let verdict = LivenessMonitor::assess(&SessionState::Idle, false, false, None, THRESHOLD);
        assert_eq!(verdict, LivenessVerdict::Standby);
    }

    #[test]
    fn test_in_flight_sequence_is_left_alone() {
        for state in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Reconnecting { attempt: 3 },
            SessionState::Connected,
        ] {
            let verdict = LivenessMonitor::assess(
                &state,
                true,
                true,
                Some(Duration::from_secs(600)),
                THRESHOLD,
            );
            assert_eq!(verdict, LivenessVerdict::Standby, "state {state:?}");
        }
    }

    #[test]
    fn test_stale_only_past_threshold() {
        let at_threshold =
            LivenessMonitor::assess(&SessionState::Connected, false, true, Some(THRESHOLD), THRESHOLD);
        assert_eq!(at_threshold, LivenessVerdict::Healthy);

        let idle = THRESHOLD + Duration::from_secs(1);
        let past = LivenessMonitor::assess(&SessionState::Connected, false, true, Some(idle), THRESHOLD);
        assert_eq!(past, LivenessVerdict::Stale { idle });
    }

    #[test]
    fn test_health_metrics_for_connected_session() {
        let start = Instant::now();
        let mut info = SessionInfo::default();
        info.on_connected(start);
        info.touch(start + Duration::from_secs(20));

        let health = LivenessMonitor::calculate_health_metrics(
            &info,
            &SessionState::Connected,
            start + Duration::from_secs(30),
            THRESHOLD,
        );

        assert_eq!(health.uptime, Some(Duration::from_secs(30)));
        assert_eq!(health.time_since_last_inbound, Some(Duration::from_secs(10)));
        assert_eq!(health.reconnect_count, 0);
        assert!(health.is_healthy);
    }

    #[test]
    fn test_health_metrics_when_disconnected() {
        let start = Instant::now();
        let mut info = SessionInfo::default();
        info.on_connected(start);

        let health = LivenessMonitor::calculate_health_metrics(
            &info,
            &SessionState::Degraded("eof".to_string()),
            start + Duration::from_secs(5),
            THRESHOLD,
        );

        assert!(health.uptime.is_none());
        assert!(!health.is_healthy);
    }

    #[test]
    fn test_health_metrics_flags_stale_connection() {
        let start = Instant::now();
        let mut info = SessionInfo::default();
        info.on_connected(start);

        let health = LivenessMonitor::calculate_health_metrics(
            &info,
            &SessionState::Connected,
            start + THRESHOLD + Duration::from_secs(1),
            THRESHOLD,
        );

        assert!(!health.is_healthy);
    }
}
