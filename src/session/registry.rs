//! Topic registry: which listener receives which topic
//!
//! The registry is the source of truth for subscriptions. After every
//! successful connect the session re-subscribes exactly the registered
//! topics, so the broker-side set converges on this one.

use crate::protocol::Payload;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a listener; logged and counted, never propagated
#[derive(Debug, Error)]
#[error("Listener failed: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Receives decoded messages for one topic
#[async_trait]
pub trait StateListener: Send + Sync {
    async fn on_message(&self, topic: &str, payload: &Payload) -> Result<(), ListenerError>;
}

#[async_trait]
impl<F, Fut> StateListener for F
where
    F: Fn(String, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    async fn on_message(&self, topic: &str, payload: &Payload) -> Result<(), ListenerError> {
        (self)(topic.to_string(), payload.clone()).await
    }
}

/// Shared handle to a registered listener
pub type ListenerHandle = Arc<dyn StateListener>;

/// Topic to listener map; at most one listener per topic
#[derive(Default)]
pub struct TopicRegistry {
    entries: HashMap<String, ListenerHandle>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, returning the one it replaced
    pub fn register(&mut self, topic: impl Into<String>, listener: ListenerHandle) -> Option<ListenerHandle> {
        self.entries.insert(topic.into(), listener)
    }

    pub fn unregister(&mut self, topic: &str) -> Option<ListenerHandle> {
        self.entries.remove(topic)
    }

    pub fn listener_for(&self, topic: &str) -> Option<ListenerHandle> {
        self.entries.get(topic).cloned()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    /// Registered topics in sorted order
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.entries.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl StateListener for Counting {
        async fn on_message(&self, _topic: &str, _payload: &Payload) -> Result<(), ListenerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_register_replaces_existing_listener() {
        let mut registry = TopicRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));

        assert!(registry
            .register("home/ac/state", Arc::new(Counting(first.clone())))
            .is_none());
        let replaced = registry.register("home/ac/state", Arc::new(Counting(first)));

        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_removes_entry() {
        let mut registry = TopicRegistry::new();
        registry.register("a", Arc::new(Counting(Arc::default())));

        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_topics_sorted() {
        let mut registry = TopicRegistry::new();
        for topic in ["c/state", "a/state", "b/state"] {
            registry.register(topic, Arc::new(Counting(Arc::default())));
        }

        assert_eq!(registry.topics(), vec!["a/state", "b/state", "c/state"]);
        assert!(registry.contains("b/state"));
        assert!(!registry.contains("d/state"));
    }

    #[tokio::test]
    async fn test_closure_listener() {
        // Arrange
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let listener = move |topic: String, payload: Payload| {
            let counter = counter.clone();
            async move {
                assert_eq!(topic, "home/ac/state");
                assert_eq!(payload["ps"], "on");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ListenerError>(())
            }
        };
        let mut registry = TopicRegistry::new();
        registry.register("home/ac/state", Arc::new(listener));

        // Act
        let handle = registry.listener_for("home/ac/state").unwrap();
        handle
            .on_message("home/ac/state", &json!({"ps": "on"}))
            .await
            .unwrap();

        // Assert
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
