//! Event dispatch: lifecycle fanout and inbound message delivery.
//!
//! Lifecycle listeners are kept per event kind in registration order and
//! removed by the id handed out at registration, so a consumer can always
//! take back exactly the listeners it added and nothing else.

use log::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Payload delivered to topic handlers.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Message body parsed as JSON.
    Json(Value),
    /// Raw body, delivered when the message body is not valid JSON.
    Raw(String),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            Payload::Json(_) => None,
            Payload::Raw(body) => Some(body),
        }
    }
}

/// Handler for data messages on a topic. Identity is `Arc` pointer identity:
/// unsubscribing requires the same `Arc` that was subscribed.
pub type MessageHandler = Arc<dyn Fn(Payload) + Send + Sync>;

/// Listener for connection lifecycle events.
pub type LifecycleListener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// A connection lifecycle transition, as opposed to a data message.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Connected,
    Disconnected,
    Error(String),
}

impl LifecycleEvent {
    pub fn kind(&self) -> LifecycleKind {
        match self {
            LifecycleEvent::Connected => LifecycleKind::Connect,
            LifecycleEvent::Disconnected => LifecycleKind::Disconnect,
            LifecycleEvent::Error(_) => LifecycleKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    Connect,
    Disconnect,
    Error,
}

/// Token identifying a registered lifecycle listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type ListenerList = Vec<(ListenerId, LifecycleListener)>;

pub struct Dispatcher {
    lifecycle: Mutex<HashMap<LifecycleKind, ListenerList>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            lifecycle: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<LifecycleKind, ListenerList>> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_listener(&self, kind: LifecycleKind, listener: LifecycleListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().entry(kind).or_default().push((id, listener));
        id
    }

    /// Removes the listener with the given id. Returns false if it was
    /// already gone.
    pub fn remove_listener(&self, kind: LifecycleKind, id: ListenerId) -> bool {
        let mut map = self.lock();
        match map.get_mut(&kind) {
            Some(listeners) => {
                let before = listeners.len();
                listeners.retain(|(lid, _)| *lid != id);
                listeners.len() != before
            }
            None => false,
        }
    }

    pub fn listener_count(&self, kind: LifecycleKind) -> usize {
        self.lock().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Removes every listener of every kind, for full teardown.
    pub fn clear_listeners(&self) {
        self.lock().clear();
    }

    /// Invokes every listener registered for the event's kind, in
    /// registration order. Listeners run outside the internal lock so they
    /// may themselves add or remove listeners.
    pub fn emit_lifecycle(&self, event: &LifecycleEvent) {
        let listeners: Vec<LifecycleListener> = self
            .lock()
            .get(&event.kind())
            .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default();
        trace!(
            "Emitting {:?} to {} listener(s)",
            event.kind(),
            listeners.len()
        );
        for listener in listeners {
            listener(event);
        }
    }

    /// Delivers a data message body to the given handlers in order.
    ///
    /// The body is parsed as JSON when possible; otherwise the raw body is
    /// delivered instead. Losing the notification entirely is worse than
    /// handing the consumer an unparsed payload.
    pub fn dispatch_message(&self, topic: &str, body: &str, handlers: &[MessageHandler]) {
        if handlers.is_empty() {
            trace!("No handlers registered for {}", topic);
            return;
        }
        let payload = match serde_json::from_str::<Value>(body) {
            Ok(value) => Payload::Json(value),
            Err(e) => {
                warn!(
                    "Failed to parse message on {} as JSON ({}); delivering raw body",
                    topic, e
                );
                Payload::Raw(body.to_string())
            }
        };
        for handler in handlers {
            handler(payload.clone());
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
