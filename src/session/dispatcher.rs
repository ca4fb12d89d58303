//! Outbound command dispatch
//!
//! Publishes are serialized, bounded in time and retried with a linear
//! delay. A publish on a disconnected session first tries a short
//! reconnect, or waits for the one already in flight.

use super::manager::SessionInner;
use super::state::{SessionConfig, SessionEvent};
use crate::error::{redact_secrets, ClientError, ClientResult};
use crate::protocol::{encode_payload, validate_topic, Payload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// An outbound message and its attempt bookkeeping
#[derive(Debug, Clone)]
pub struct OutboundCommand {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Attempts started so far
    pub attempt: u32,
    /// Deadline of the current attempt
    pub deadline: Option<Instant>,
}

impl OutboundCommand {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            attempt: 0,
            deadline: None,
        }
    }

    /// Start the next attempt and return its deadline
    pub fn begin_attempt(&mut self, timeout: Duration) -> Instant {
        self.attempt += 1;
        let deadline = Instant::now() + timeout;
        self.deadline = Some(deadline);
        deadline
    }
}

/// Send retry policy: fixed attempt budget, linearly growing delay
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_attempts: config.publish_retries.max(1),
            delay: config.publish_retry_delay,
        }
    }

    /// Decide what follows failed attempt number `attempt` (pure function)
    pub fn after_failure(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                delay: self.delay.saturating_mul(attempt),
            }
        }
    }
}

/// Result of a publish that waits for a state update
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Sent, and a frame arrived on the confirmation topic
    Confirmed { latency: Duration },
    /// Sent, but nothing arrived on the confirmation topic in time
    Unconfirmed,
    Failed,
}

impl CommandOutcome {
    pub fn was_sent(&self) -> bool {
        !matches!(self, CommandOutcome::Failed)
    }
}

pub(super) async fn publish(session: &Arc<SessionInner>, topic: &str, payload: &Payload) -> bool {
    if let Err(e) = validate_topic(topic) {
        error!("Refusing to publish: {}", e);
        session.metrics.publish_failed();
        return false;
    }

    let body = match encode_payload(payload) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to encode payload: {}", e);
            session.metrics.publish_failed();
            return false;
        }
    };

    let _permit = session.command_lock.lock().await;

    if !session.is_connected() && !ensure_connected(session).await {
        error!(topic, "Not connected and reconnection failed, cannot publish");
        session.metrics.publish_failed();
        return false;
    }

    let policy = RetryPolicy::from_config(&session.config);
    let mut command = OutboundCommand::new(topic, body);

    loop {
        let deadline = command.begin_attempt(session.config.operation_timeout);
        match send_attempt(session, &command, deadline).await {
            Ok(()) => {
                session.touch_inbound();
                session.metrics.message_published();
                debug!(topic, attempt = command.attempt, "Published message");
                return true;
            }
            Err(e) => {
                let reason = redact_secrets(&e.to_string());
                warn!(topic, attempt = command.attempt, error = %reason, "Publish attempt failed");
                session.degrade(SessionEvent::SendFailed(format!("publish to {topic} failed: {reason}")));

                match policy.after_failure(command.attempt) {
                    RetryDecision::Retry { delay } => tokio::time::sleep(delay).await,
                    RetryDecision::GiveUp => {
                        error!(topic, attempts = command.attempt, "Giving up on publish");
                        session.metrics.publish_failed();
                        return false;
                    }
                }
            }
        }
    }
}

async fn send_attempt(
    session: &SessionInner,
    command: &OutboundCommand,
    deadline: Instant,
) -> ClientResult<()> {
    let link = session
        .current_link()
        .ok_or_else(|| ClientError::NotConnected {
            state: session.state(),
        })?;

    match tokio::time::timeout_at(deadline, link.send(&command.topic, command.payload.clone())).await {
        Ok(result) => result.map_err(ClientError::from),
        Err(_) => Err(ClientError::timeout("publish", session.config.operation_timeout)),
    }
}

/// Get the session connected before a publish, within a bounded time
async fn ensure_connected(session: &Arc<SessionInner>) -> bool {
    session.clear_shutdown();

    if session.reconnect_in_flight() {
        info!("Reconnection in progress, waiting before publish");
        return session
            .wait_until_connected(session.config.connect_timeout)
            .await
            .is_ok();
    }

    let Some(credentials) = session.stored_credentials() else {
        warn!("No credentials stored, cannot reconnect for publish");
        return false;
    };

    warn!("Not connected, attempting reconnection before publish");
    session
        .reconnect(credentials, Some(session.config.publish_reconnect_attempts))
        .await
}

pub(super) async fn publish_and_confirm(
    session: &Arc<SessionInner>,
    topic: &str,
    payload: &Payload,
    confirm_topic: &str,
    wait: Duration,
) -> CommandOutcome {
    // Subscribe before sending so a fast reply cannot be missed
    let mut inbound = session.inbound.subscribe();
    let sent_at = Instant::now();

    if !publish(session, topic, payload).await {
        return CommandOutcome::Failed;
    }

    let confirmation = async {
        loop {
            match inbound.recv().await {
                Ok(seen) if seen == confirm_topic => return true,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Confirmation waiter skipped {} announcements", skipped);
                }
                Err(RecvError::Closed) => return false,
            }
        }
    };

    match tokio::time::timeout(wait, confirmation).await {
        Ok(true) => {
            let latency = sent_at.elapsed();
            info!(latency_ms = latency.as_millis() as u64, "Command confirmed");
            CommandOutcome::Confirmed { latency }
        }
        _ => {
            warn!(confirm_topic, "No state update received after command");
            CommandOutcome::Unconfirmed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_linearly() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        };

        assert_eq!(
            policy.after_failure(1),
            RetryDecision::Retry {
                delay: Duration::from_millis(500)
            }
        );
        assert_eq!(
            policy.after_failure(2),
            RetryDecision::Retry {
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(policy.after_failure(3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_policy_from_config_keeps_at_least_one_attempt() {
        let config = SessionConfig {
            publish_retries: 0,
            ..SessionConfig::default()
        };

        let policy = RetryPolicy::from_config(&config);

        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.after_failure(1), RetryDecision::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_attempt_sets_deadline() {
        let mut command = OutboundCommand::new("home/ac/control", b"{}".to_vec());
        assert_eq!(command.attempt, 0);

        let deadline = command.begin_attempt(Duration::from_secs(5));

        assert_eq!(command.attempt, 1);
        assert_eq!(command.deadline, Some(deadline));
        assert_eq!(deadline - Instant::now(), Duration::from_secs(5));
    }

    #[test]
    fn test_outcome_was_sent() {
        assert!(CommandOutcome::Unconfirmed.was_sent());
        assert!(CommandOutcome::Confirmed {
            latency: Duration::from_millis(80)
        }
        .was_sent());
        assert!(!CommandOutcome::Failed.was_sent());
    }
}
