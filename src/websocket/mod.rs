//! Realtime order event stream client.
//!
//! One shared STOMP-over-WebSocket session to the platform's broker, with:
//!
//! - Automatic reconnection with capped exponential backoff and a retry budget
//! - A durable subscription registry replayed after every reconnect
//! - Ordered per-topic dispatch with parse-or-degrade JSON delivery
//! - A consumer handle exposing a reactive `is_connected` binding with
//!   guaranteed listener cleanup on drop
//!
//! # Usage
//!
//! ```no_run
//! use order_stream_rs::websocket::{
//!     MessageHandler, RealtimeClient, RealtimeConfig, RealtimeHandle, TOPIC_ORDER_UPDATES,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     // One client for the whole application, passed to consumers by clone.
//!     let client = RealtimeClient::new(RealtimeConfig::default());
//!
//!     let handle = RealtimeHandle::attach(&client).await;
//!
//!     let on_update: MessageHandler = Arc::new(|payload| {
//!         println!("order update: {:?}", payload);
//!     });
//!     handle.subscribe(TOPIC_ORDER_UPDATES, Arc::clone(&on_update)).await;
//!
//!     tokio::signal::ctrl_c().await.expect("Failed to listen for ctrl+c");
//!     handle.unsubscribe(TOPIC_ORDER_UPDATES, &on_update).await;
//!     client.disconnect().await;
//! }
//! ```
//!
//! # Reconnection behavior
//!
//! After a drop or a failed connect the client retries automatically: the
//! delay starts at the configured floor (default 1s) and doubles up to the
//! ceiling (default 30s), for at most `max_reconnect_attempts` (default 5)
//! consecutive attempts. A successful connect resets the budget and replays
//! every pending subscription onto the new session; once the budget is spent
//! the client stays disconnected until an explicit `connect()`.
//!
//! # Error handling
//!
//! Nothing here throws into consumer code during steady-state operation.
//! Transport and protocol failures surface as `Error` lifecycle events; a
//! message body that fails to parse as JSON is delivered raw rather than
//! dropped.

pub mod client;
pub mod dispatch;
pub mod handle;
pub mod registry;

pub use client::{
    ConnectionState, RealtimeClient, RealtimeConfig, ReconnectPolicy, DEFAULT_BROKER_URL,
    TOPIC_INCOMPLETE_ORDERS, TOPIC_ORDER_UPDATES,
};
pub use dispatch::{
    Dispatcher, LifecycleEvent, LifecycleKind, LifecycleListener, ListenerId, MessageHandler,
    Payload,
};
pub use handle::RealtimeHandle;
pub use registry::{RemoveOutcome, SubscriptionRegistry};
