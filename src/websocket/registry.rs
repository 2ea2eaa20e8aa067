//! Durable subscription registry.
//!
//! Records which (topic, handler) pairs the application wants, independent of
//! whether a broker session is currently live. The connection manager replays
//! this set onto every new session, so no desired subscription is lost across
//! a disconnect/reconnect cycle.

use super::dispatch::MessageHandler;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Result of removing a (topic, handler) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    /// Whether a matching entry was found and removed.
    pub removed: bool,
    /// Whether the topic now has no handlers left at all.
    pub topic_now_empty: bool,
}

pub struct SubscriptionRegistry {
    inner: Mutex<HashMap<String, Vec<MessageHandler>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<MessageHandler>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a (topic, handler) pair. The same handler may be added more than
    /// once and is then delivered once per registration until removed as many
    /// times. Returns true when this is the first handler for the topic.
    pub fn add(&self, topic: &str, handler: MessageHandler) -> bool {
        let mut map = self.lock();
        let handlers = map.entry(topic.to_string()).or_default();
        handlers.push(handler);
        handlers.len() == 1
    }

    /// Removes the first entry for `topic` matching `handler` by `Arc`
    /// pointer identity. Only the exact pair is removed, never other handlers
    /// on the same topic.
    pub fn remove(&self, topic: &str, handler: &MessageHandler) -> RemoveOutcome {
        let mut map = self.lock();
        let Some(handlers) = map.get_mut(topic) else {
            return RemoveOutcome {
                removed: false,
                topic_now_empty: false,
            };
        };
        let Some(pos) = handlers.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return RemoveOutcome {
                removed: false,
                topic_now_empty: false,
            };
        };
        handlers.remove(pos);
        let topic_now_empty = handlers.is_empty();
        if topic_now_empty {
            map.remove(topic);
        }
        RemoveOutcome {
            removed: true,
            topic_now_empty,
        }
    }

    /// Handlers for a topic in registration order, snapshotted for dispatch.
    /// Filtering happens here: a removed handler is simply no longer in the
    /// snapshot, whether or not the transport-level unsubscribe was sent.
    pub fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        self.lock()
            .get(topic)
            .map(|handlers| handlers.iter().map(Arc::clone).collect())
            .unwrap_or_default()
    }

    /// Distinct topics with at least one registered handler, for replay.
    pub fn topics(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.lock().get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Drops every registered pair, for full teardown.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::dispatch::Payload;

    fn noop_handler() -> MessageHandler {
        Arc::new(|_: Payload| {})
    }

    #[test]
    fn add_reports_first_handler_for_topic() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.add("/topic/orderUpdates", noop_handler()));
        assert!(!registry.add("/topic/orderUpdates", noop_handler()));
        assert!(registry.add("/topic/incompleteOrders", noop_handler()));
        assert_eq!(registry.handler_count("/topic/orderUpdates"), 2);
    }

    #[test]
    fn remove_matches_by_identity_not_shape() {
        let registry = SubscriptionRegistry::new();
        let h1 = noop_handler();
        let h2 = noop_handler();
        registry.add("/topic/orderUpdates", Arc::clone(&h1));
        registry.add("/topic/orderUpdates", Arc::clone(&h2));

        // h1 and h2 are behaviorally identical closures but distinct Arcs.
        let outcome = registry.remove("/topic/orderUpdates", &h1);
        assert!(outcome.removed);
        assert!(!outcome.topic_now_empty);

        let remaining = registry.handlers_for("/topic/orderUpdates");
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &h2));
    }

    #[test]
    fn double_registration_removes_one_at_a_time() {
        let registry = SubscriptionRegistry::new();
        let h = noop_handler();
        registry.add("/topic/orderUpdates", Arc::clone(&h));
        registry.add("/topic/orderUpdates", Arc::clone(&h));

        assert!(registry.remove("/topic/orderUpdates", &h).removed);
        assert_eq!(registry.handler_count("/topic/orderUpdates"), 1);

        let outcome = registry.remove("/topic/orderUpdates", &h);
        assert!(outcome.removed);
        assert!(outcome.topic_now_empty);
        assert!(registry.topics().is_empty());
    }

    #[test]
    fn remove_of_unknown_pair_is_a_noop() {
        let registry = SubscriptionRegistry::new();
        registry.add("/topic/orderUpdates", noop_handler());
        let stranger = noop_handler();
        let outcome = registry.remove("/topic/orderUpdates", &stranger);
        assert!(!outcome.removed);
        assert_eq!(registry.handler_count("/topic/orderUpdates"), 1);
    }

    #[test]
    fn topics_lists_distinct_destinations() {
        let registry = SubscriptionRegistry::new();
        registry.add("/topic/orderUpdates", noop_handler());
        registry.add("/topic/orderUpdates", noop_handler());
        registry.add("/topic/incompleteOrders", noop_handler());
        let mut topics = registry.topics();
        topics.sort();
        assert_eq!(topics, vec!["/topic/incompleteOrders", "/topic/orderUpdates"]);
    }
}
