//! Topic canonicalization and validation for MirAIe device topics
//!
//! Devices publish state on `<device>/state` and accept commands on
//! `<device>/control`, where `<device>` is the base topic returned by the
//! MirAIe home API.

use thiserror::Error;

/// Largest topic length the MQTT wire format can carry
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Collapse duplicate slashes and strip a trailing slash.
///
/// Leading slashes are kept as given: MirAIe topics have none, and a topic
/// with a leading slash is a different topic on the broker.
pub fn canonicalize_topic(topic: &str) -> String {
    let mut result = topic.to_string();

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

/// Validate a topic for registration or publishing.
///
/// Delivery is exact-match, so wildcard filters are rejected.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(TopicError::NullCharacter);
    }
    if let Some(wildcard) = topic.chars().find(|c| *c == '+' || *c == '#') {
        return Err(TopicError::Wildcard(wildcard));
    }

    Ok(())
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic is {0} bytes, longer than the MQTT limit")]
    TooLong(usize),
    #[error("Topic contains a NUL character")]
    NullCharacter,
    #[error("Topic contains wildcard '{0}'; only exact topics are supported")]
    Wildcard(char),
}

/// Topic builder for one MirAIe device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceTopic {
    base: String,
}

impl DeviceTopic {
    pub fn new(base: &str) -> Result<Self, TopicError> {
        let base = canonicalize_topic(base);
        validate_topic(&base)?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Build the command topic: `{base}/control`
    pub fn control(&self) -> String {
        format!("{}/control", self.base)
    }

    /// Build the state topic: `{base}/state`
    pub fn state(&self) -> String {
        format!("{}/state", self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn canonicalize_topic_is_idempotent(topic in ".*") {
            let first = canonicalize_topic(&topic);
            let second = canonicalize_topic(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn canonicalize_topic_no_consecutive_slashes(topic in ".*") {
            let result = canonicalize_topic(&topic);
            prop_assert!(!result.contains("//"), "No consecutive slashes allowed: {}", result);
        }

        #[test]
        fn canonicalize_topic_no_trailing_slash(topic in ".*") {
            let result = canonicalize_topic(&topic);
            if result.len() > 1 {
                prop_assert!(!result.ends_with('/'), "No trailing slash: {}", result);
            }
        }

        #[test]
        fn plain_topics_validate(topic in "[a-zA-Z0-9_-]{1,16}(/[a-zA-Z0-9_-]{1,16}){0,4}") {
            prop_assert!(validate_topic(&topic).is_ok());
        }
    }

    #[test]
    fn test_canonicalize_examples() {
        assert_eq!(canonicalize_topic("home//ac-1/"), "home/ac-1");
        assert_eq!(canonicalize_topic("home/ac-1"), "home/ac-1");
        assert_eq!(canonicalize_topic("/"), "/");
        assert_eq!(canonicalize_topic(""), "");
    }

    #[test]
    fn test_validate_topic_rejections() {
        assert_eq!(validate_topic(""), Err(TopicError::Empty));
        assert_eq!(validate_topic("home/+/state"), Err(TopicError::Wildcard('+')));
        assert_eq!(validate_topic("home/#"), Err(TopicError::Wildcard('#')));
        assert_eq!(validate_topic("home/\0"), Err(TopicError::NullCharacter));

        let long = "a".repeat(MAX_TOPIC_LEN + 1);
        assert_eq!(validate_topic(&long), Err(TopicError::TooLong(MAX_TOPIC_LEN + 1)));
    }

    #[test]
    fn test_device_topic_builders() {
        let device = DeviceTopic::new("5f3a/home-7/ac-1/").unwrap();

        assert_eq!(device.base(), "5f3a/home-7/ac-1");
        assert_eq!(device.control(), "5f3a/home-7/ac-1/control");
        assert_eq!(device.state(), "5f3a/home-7/ac-1/state");
    }

    #[test]
    fn test_device_topic_rejects_wildcards() {
        assert!(DeviceTopic::new("home/+").is_err());
        assert!(DeviceTopic::new("").is_err());
    }
}
