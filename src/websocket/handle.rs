//! Consumer-facing handle over the shared realtime client.
//!
//! A view (or any other consumer) attaches a handle, reads `is_connected`
//! reactively and subscribes to topics through it. Dropping the handle takes
//! back exactly the lifecycle listeners it registered, so a discarded
//! consumer can never be called into again.

use super::client::RealtimeClient;
use super::dispatch::{LifecycleEvent, LifecycleKind, LifecycleListener, ListenerId, MessageHandler};
use crate::error::Result;
use log::*;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

pub struct RealtimeHandle {
    client: RealtimeClient,
    connected_rx: watch::Receiver<bool>,
    listener_ids: [(LifecycleKind, ListenerId); 3],
}

impl RealtimeHandle {
    /// Attaches to the shared client: registers lifecycle listeners that
    /// drive the `is_connected` binding, then ensures a connection attempt is
    /// underway. The binding reflects the present state immediately, not an
    /// assumed disconnected one.
    pub async fn attach(client: &RealtimeClient) -> Self {
        let (tx, rx) = watch::channel(client.is_connected());
        let tx = Arc::new(tx);

        let on_connect: LifecycleListener = {
            let tx = Arc::clone(&tx);
            Arc::new(move |_: &LifecycleEvent| {
                let _ = tx.send(true);
            })
        };
        let on_disconnect: LifecycleListener = {
            let tx = Arc::clone(&tx);
            Arc::new(move |_: &LifecycleEvent| {
                let _ = tx.send(false);
            })
        };
        let on_error: LifecycleListener = {
            let tx = Arc::clone(&tx);
            Arc::new(move |event: &LifecycleEvent| {
                if let LifecycleEvent::Error(detail) = event {
                    warn!("Broker error: {}", detail);
                }
                let _ = tx.send(false);
            })
        };

        let listener_ids = [
            (
                LifecycleKind::Connect,
                client.on_lifecycle(LifecycleKind::Connect, on_connect),
            ),
            (
                LifecycleKind::Disconnect,
                client.on_lifecycle(LifecycleKind::Disconnect, on_disconnect),
            ),
            (
                LifecycleKind::Error,
                client.on_lifecycle(LifecycleKind::Error, on_error),
            ),
        ];

        // A transition between seeding the channel and registering the
        // listeners above would be missed; re-sync now that they are in place.
        tx.send_if_modified(|value| {
            let current = client.is_connected();
            if *value != current {
                *value = current;
                true
            } else {
                false
            }
        });

        let handle = Self {
            client: client.clone(),
            connected_rx: rx,
            listener_ids,
        };
        client.connect().await;
        handle
    }

    /// Current connection state of the shared client.
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Waits until the connection state differs from its value at the time
    /// of the call, then returns the new value. Notifications that re-assert
    /// the current state are skipped.
    pub async fn changed(&mut self) -> bool {
        let seen = *self.connected_rx.borrow_and_update();
        loop {
            // The senders live in the listeners this handle owns, so the
            // channel cannot close while the handle is alive.
            let _ = self.connected_rx.changed().await;
            let current = *self.connected_rx.borrow_and_update();
            if current != seen {
                return current;
            }
        }
    }

    pub fn client(&self) -> &RealtimeClient {
        &self.client
    }

    pub async fn subscribe(&self, topic: &str, handler: MessageHandler) {
        self.client.subscribe(topic, handler).await;
    }

    pub async fn unsubscribe(&self, topic: &str, handler: &MessageHandler) {
        self.client.unsubscribe(topic, handler).await;
    }

    pub async fn emit(&self, topic: &str, payload: &Value) -> Result<()> {
        self.client.emit(topic, payload).await
    }
}

impl Drop for RealtimeHandle {
    fn drop(&mut self) {
        // Only this handle's listeners; other consumers of the same client
        // keep theirs.
        for (kind, id) in self.listener_ids {
            self.client.remove_lifecycle(kind, id);
        }
    }
}
