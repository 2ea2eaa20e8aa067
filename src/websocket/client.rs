use crate::error::{Result, StreamError};
use crate::stomp::{self, Frame};
use futures_util::{SinkExt, StreamExt};
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use super::dispatch::{
    Dispatcher, LifecycleEvent, LifecycleKind, LifecycleListener, ListenerId, MessageHandler,
};
use super::registry::SubscriptionRegistry;

/// Default broker entry point (the backend's WebSocket upgrade endpoint).
pub const DEFAULT_BROKER_URL: &str = "ws://localhost:8080/ws";

/// Topic carrying newly placed / incomplete orders.
pub const TOPIC_INCOMPLETE_ORDERS: &str = "/topic/incompleteOrders";
/// Topic carrying order status updates.
pub const TOPIC_ORDER_UPDATES: &str = "/topic/orderUpdates";

const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_FLOOR: Duration = Duration::from_secs(1);
const DEFAULT_RECONNECT_DELAY_CEILING: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Broker WebSocket URL.
    pub url: String,
    /// Automatic reconnection attempts before the client parks disconnected.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnection attempt.
    pub reconnect_delay_floor: Duration,
    /// Upper bound the doubling backoff delay never exceeds.
    pub reconnect_delay_ceiling: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BROKER_URL.to_string(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_floor: DEFAULT_RECONNECT_DELAY_FLOOR,
            reconnect_delay_ceiling: DEFAULT_RECONNECT_DELAY_CEILING,
        }
    }
}

/// Exponential backoff with a cap and a retry budget.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    floor: Duration,
    ceiling: Duration,
    max_attempts: u32,
    attempts: u32,
    delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(floor: Duration, ceiling: Duration, max_attempts: u32) -> Self {
        Self {
            floor,
            ceiling,
            max_attempts,
            attempts: 0,
            delay: floor,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Consumes one attempt from the budget and returns the delay to wait
    /// before it, doubling the stored delay up to the ceiling. Returns `None`
    /// once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.ceiling);
        Some(delay)
    }

    /// Back to a full budget and the floor delay. Called on successful
    /// connect and on explicit disconnect.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = self.floor;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Why a live session ended.
enum SessionEnd {
    Closed,
    Error(String),
}

struct Inner {
    state: ConnectionState,
    /// Incremented on every connect() and disconnect(); callbacks from a
    /// session carrying a stale epoch are ignored.
    epoch: u64,
    session_task: Option<JoinHandle<()>>,
    writer: Option<mpsc::Sender<Message>>,
    /// Topics with an active SUBSCRIBE on the current session, and the STOMP
    /// subscription id each was wired with. Per-session state.
    live_subs: HashMap<String, String>,
    next_sub_id: u64,
    policy: ReconnectPolicy,
    reconnect_timer: Option<JoinHandle<()>>,
}

/// Shared realtime client: one broker session for the whole application.
///
/// Cloning is cheap and every clone drives the same connection, registry and
/// listener set. Construct once at startup and pass clones to consumers.
#[derive(Clone)]
pub struct RealtimeClient {
    config: Arc<RealtimeConfig>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<SubscriptionRegistry>,
    connected: Arc<AtomicBool>,
    inner: Arc<Mutex<Inner>>,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig) -> Self {
        let policy = ReconnectPolicy::new(
            config.reconnect_delay_floor,
            config.reconnect_delay_ceiling,
            config.max_reconnect_attempts,
        );
        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(Dispatcher::new()),
            registry: Arc::new(SubscriptionRegistry::new()),
            connected: Arc::new(AtomicBool::new(false)),
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                epoch: 0,
                session_task: None,
                writer: None,
                live_subs: HashMap::new(),
                next_sub_id: 0,
                policy,
                reconnect_timer: None,
            })),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().await.policy.attempts()
    }

    /// Whether a backoff timer is currently waiting to fire.
    pub async fn has_pending_reconnect(&self) -> bool {
        self.inner
            .lock()
            .await
            .reconnect_timer
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    // --- Lifecycle listeners -------------------------------------------------

    pub fn on_lifecycle(&self, kind: LifecycleKind, listener: LifecycleListener) -> ListenerId {
        self.dispatcher.add_listener(kind, listener)
    }

    pub fn remove_lifecycle(&self, kind: LifecycleKind, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(kind, id)
    }

    pub fn lifecycle_listener_count(&self, kind: LifecycleKind) -> usize {
        self.dispatcher.listener_count(kind)
    }

    // --- Connection management ----------------------------------------------

    /// Opens the broker session. Idempotent: a call while already connecting
    /// or connected does nothing. Connection failures never surface here;
    /// they are reported through the `Error` lifecycle event and feed the
    /// reconnection procedure.
    pub async fn connect(&self) {
        self.connect_impl().await
    }

    // Boxed to break the async recursion cycle
    // (connect -> run_session -> schedule_reconnect -> connect).
    fn connect_impl(&self) -> futures_util::future::BoxFuture<'_, ()> {
        Box::pin(async move {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Disconnected {
                trace!("connect() ignored: already {:?}", inner.state);
                return;
            }
            if let Some(timer) = inner.reconnect_timer.take() {
                timer.abort();
            }
            inner.state = ConnectionState::Connecting;
            inner.epoch += 1;
            inner.epoch
        };

        let client = self.clone();
        let task = tokio::spawn(async move {
            client.run_session(epoch).await;
        });

        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch {
            inner.session_task = Some(task);
        } else {
            task.abort();
        }
        })
    }

    /// Tears the session down and parks the client. Resets the retry budget
    /// and cancels any pending reconnection; the only other attempts-reset
    /// path is a successful connect.
    pub async fn disconnect(&self) {
        let (writer, task, timer, was_live) = {
            let mut inner = self.inner.lock().await;
            // Stale out any in-flight session callbacks.
            inner.epoch += 1;
            let was_live = inner.state != ConnectionState::Disconnected;
            inner.state = ConnectionState::Disconnected;
            inner.policy.reset();
            inner.live_subs.clear();
            (
                inner.writer.take(),
                inner.session_task.take(),
                inner.reconnect_timer.take(),
                was_live,
            )
        };
        self.connected.store(false, Ordering::SeqCst);

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(tx) = writer {
            // Graceful teardown; the writer task drains these before exiting.
            let _ = tx
                .send(Message::Text(stomp::disconnect_frame().encode()))
                .await;
            let _ = tx.send(Message::Close(None)).await;
        }
        if let Some(task) = task {
            task.abort();
        }
        if was_live {
            self.dispatcher.emit_lifecycle(&LifecycleEvent::Disconnected);
        }
        info!("Disconnected from broker");
    }

    /// Full teardown: disconnects like [`disconnect`](Self::disconnect), then
    /// drops every registered subscription and lifecycle listener. The
    /// `Disconnected` event still reaches listeners before they are dropped.
    /// The client can be reused afterwards and starts from a clean slate.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.registry.clear();
        self.dispatcher.clear_listeners();
    }

    async fn run_session(self, epoch: u64) {
        info!("Connecting to broker at {}", self.config.url);
        let url = match Url::parse(&self.config.url) {
            Ok(url) => url,
            Err(e) => {
                self.fail_session(epoch, StreamError::UrlParseError(e).to_string())
                    .await;
                return;
            }
        };

        let (ws_stream, response) = match connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(e) => {
                self.fail_session(epoch, format!("WebSocket connection failed: {}", e))
                    .await;
                return;
            }
        };
        trace!("WebSocket handshake complete: {:?}", response.status());

        let (mut write, mut read) = ws_stream.split();

        let host = url.host_str().unwrap_or("localhost").to_string();
        if let Err(e) = write
            .send(Message::Text(stomp::connect_frame(&host).encode()))
            .await
        {
            self.fail_session(epoch, format!("failed to send CONNECT: {}", e))
                .await;
            return;
        }

        // Await the broker's CONNECTED before exposing the session.
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match Frame::parse(&text) {
                    Ok(Some(frame)) if frame.command == "CONNECTED" => break,
                    Ok(Some(frame)) if frame.command == "ERROR" => {
                        let detail = frame
                            .get_header("message")
                            .unwrap_or(frame.body.as_str())
                            .to_string();
                        self.fail_session(epoch, format!("broker rejected connect: {}", detail))
                            .await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        self.fail_session(epoch, e.to_string()).await;
                        return;
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    self.fail_session(
                        epoch,
                        "connection closed during STOMP handshake".to_string(),
                    )
                    .await;
                    return;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.fail_session(epoch, format!("WebSocket read error: {}", e))
                        .await;
                    return;
                }
            }
        }

        // Writer task: drains the outbound channel into the sink.
        let (tx, mut rx) = mpsc::channel::<Message>(32);
        let writer_handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    error!("WebSocket send error: {}. Stopping writer task.", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
            trace!("Writer task finished");
        });

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                // Superseded while handshaking.
                writer_handle.abort();
                return;
            }
            inner.state = ConnectionState::Connected;
            inner.writer = Some(tx.clone());
            inner.live_subs.clear();
            inner.policy.reset();
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("Broker session established");
        self.dispatcher.emit_lifecycle(&LifecycleEvent::Connected);

        // Replay runs before the reader loop consumes anything, so every
        // pending subscription is live before the first MESSAGE arrives.
        self.replay_subscriptions(epoch).await;

        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match Frame::parse(&text) {
                    Ok(Some(frame)) => match frame.command.as_str() {
                        "MESSAGE" => {
                            let topic = frame.get_header("destination").unwrap_or("").to_string();
                            let handlers = self.registry.handlers_for(&topic);
                            self.dispatcher
                                .dispatch_message(&topic, &frame.body, &handlers);
                        }
                        "ERROR" => {
                            let detail = frame
                                .get_header("message")
                                .unwrap_or(frame.body.as_str())
                                .to_string();
                            break SessionEnd::Error(detail);
                        }
                        "RECEIPT" => {
                            trace!("Receipt: {:?}", frame.get_header("receipt-id"));
                        }
                        other => trace!("Ignoring {} frame", other),
                    },
                    Ok(None) => {} // heart-beat
                    Err(e) => warn!("Dropping unparseable frame: {}", e),
                },
                Some(Ok(Message::Ping(data))) => {
                    if tx.send(Message::Pong(data)).await.is_err() {
                        break SessionEnd::Error("writer channel closed".to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => break SessionEnd::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => break SessionEnd::Error(format!("WebSocket read error: {}", e)),
            }
        };
        writer_handle.abort();
        self.end_session(epoch, reason).await;
    }

    /// Construction or handshake failure: never propagates, reports via the
    /// error lifecycle channel and feeds the reconnection procedure.
    async fn fail_session(&self, epoch: u64, detail: String) {
        error!("Broker connection failed: {}", detail);
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.writer = None;
            inner.live_subs.clear();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.dispatcher
            .emit_lifecycle(&LifecycleEvent::Error(detail));
        self.schedule_reconnect(epoch).await;
    }

    /// A previously live session ended (peer close or transport error).
    async fn end_session(&self, epoch: u64, reason: SessionEnd) {
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                // Torn down by disconnect() or superseded by a newer connect.
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.writer = None;
            inner.live_subs.clear();
        }
        self.connected.store(false, Ordering::SeqCst);
        match reason {
            SessionEnd::Closed => {
                info!("Broker session closed");
                self.dispatcher.emit_lifecycle(&LifecycleEvent::Disconnected);
            }
            SessionEnd::Error(detail) => {
                error!("Broker session error: {}", detail);
                self.dispatcher
                    .emit_lifecycle(&LifecycleEvent::Error(detail));
            }
        }
        self.schedule_reconnect(epoch).await;
    }

    async fn schedule_reconnect(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.state != ConnectionState::Disconnected {
            return;
        }
        match inner.policy.next_delay() {
            Some(delay) => {
                warn!(
                    "Reconnecting (attempt {}/{}) in {:?}",
                    inner.policy.attempts(),
                    self.config.max_reconnect_attempts,
                    delay
                );
                let client = self.clone();
                let timer = tokio::spawn(async move {
                    sleep(delay).await;
                    {
                        let mut inner = client.inner.lock().await;
                        if inner.epoch != epoch {
                            return;
                        }
                        inner.reconnect_timer = None;
                    }
                    client.connect().await;
                });
                inner.reconnect_timer = Some(timer);
            }
            None => {
                error!(
                    "Max reconnect attempts ({}) reached; staying disconnected",
                    self.config.max_reconnect_attempts
                );
            }
        }
    }

    // --- Subscriptions -------------------------------------------------------

    /// Registers a handler for a topic. Wires a live subscription immediately
    /// when connected; otherwise the pair stays pending and is wired by the
    /// replay step of the next successful connect. An idle disconnected
    /// client is connected on first use.
    pub async fn subscribe(&self, topic: &str, handler: MessageHandler) {
        self.registry.add(topic, handler);

        enum Action {
            None,
            Wire { id: String, tx: mpsc::Sender<Message> },
            Connect,
        }

        let action = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnectionState::Connected => {
                    if inner.live_subs.contains_key(topic) {
                        Action::None
                    } else if let Some(tx) = inner.writer.clone() {
                        let id = format!("sub-{}", inner.next_sub_id);
                        inner.next_sub_id += 1;
                        inner.live_subs.insert(topic.to_string(), id.clone());
                        Action::Wire { id, tx }
                    } else {
                        Action::None
                    }
                }
                // Replay wires the pair once the in-flight connect succeeds.
                ConnectionState::Connecting => Action::None,
                ConnectionState::Disconnected => {
                    // Auto-connect only an idle client; one parked after
                    // budget exhaustion waits for an explicit connect().
                    if inner.policy.attempts() == 0 && inner.reconnect_timer.is_none() {
                        Action::Connect
                    } else {
                        Action::None
                    }
                }
            }
        };

        match action {
            Action::None => {}
            Action::Wire { id, tx } => {
                let frame = stomp::subscribe_frame(&id, topic).encode();
                if let Err(e) = tx.send(Message::Text(frame)).await {
                    warn!("Failed to send SUBSCRIBE for {}: {}", topic, e);
                }
            }
            Action::Connect => self.connect().await,
        }
    }

    /// Removes the exact (topic, handler) pair. Delivery to the handler stops
    /// immediately via dispatch-time filtering; the transport-level
    /// UNSUBSCRIBE is only sent once the topic has no handlers left.
    pub async fn unsubscribe(&self, topic: &str, handler: &MessageHandler) {
        let outcome = self.registry.remove(topic, handler);
        if !outcome.removed || !outcome.topic_now_empty {
            return;
        }

        let wire = {
            let mut inner = self.inner.lock().await;
            if inner.state == ConnectionState::Connected {
                match (inner.live_subs.remove(topic), inner.writer.clone()) {
                    (Some(id), Some(tx)) => Some((id, tx)),
                    _ => None,
                }
            } else {
                None
            }
        };
        if let Some((id, tx)) = wire {
            let frame = stomp::unsubscribe_frame(&id).encode();
            if let Err(e) = tx.send(Message::Text(frame)).await {
                warn!("Failed to send UNSUBSCRIBE for {}: {}", topic, e);
            }
        }
    }

    /// Wires one live subscription per distinct pending topic onto the new
    /// session. The live set was cleared when the previous session died, so
    /// nothing is double-wired.
    async fn replay_subscriptions(&self, epoch: u64) {
        let topics = self.registry.topics();
        if topics.is_empty() {
            return;
        }
        info!("Replaying {} topic subscription(s)", topics.len());
        for topic in topics {
            let wire = {
                let mut inner = self.inner.lock().await;
                if inner.epoch != epoch || inner.state != ConnectionState::Connected {
                    return;
                }
                if inner.live_subs.contains_key(&topic) {
                    None
                } else if let Some(tx) = inner.writer.clone() {
                    let id = format!("sub-{}", inner.next_sub_id);
                    inner.next_sub_id += 1;
                    inner.live_subs.insert(topic.clone(), id.clone());
                    Some((id, tx))
                } else {
                    None
                }
            };
            if let Some((id, tx)) = wire {
                let frame = stomp::subscribe_frame(&id, &topic).encode();
                if let Err(e) = tx.send(Message::Text(frame)).await {
                    error!(
                        "Failed to send resubscription for {}: {}. Aborting replay.",
                        topic, e
                    );
                    return;
                }
            }
        }
    }

    // --- Publish -------------------------------------------------------------

    /// Publishes a JSON payload to a topic. A publish while disconnected is
    /// dropped with a warning rather than queued or failed.
    pub async fn emit(&self, topic: &str, payload: &Value) -> Result<()> {
        let tx = {
            let inner = self.inner.lock().await;
            if inner.state == ConnectionState::Connected {
                inner.writer.clone()
            } else {
                None
            }
        };
        let Some(tx) = tx else {
            warn!("emit to {} dropped: not connected", topic);
            return Ok(());
        };
        let body = serde_json::to_string(payload)?;
        tx.send(Message::Text(stomp::send_frame(topic, body).encode()))
            .await
            .map_err(|e| StreamError::WebsocketError(format!("Failed to send message: {}", e)))
    }

    // --- Well-known order topics ---------------------------------------------

    pub async fn subscribe_new_orders(&self, handler: MessageHandler) {
        self.subscribe(TOPIC_INCOMPLETE_ORDERS, handler).await;
    }

    pub async fn subscribe_order_updates(&self, handler: MessageHandler) {
        self.subscribe(TOPIC_ORDER_UPDATES, handler).await;
    }

    pub async fn unsubscribe_new_orders(&self, handler: &MessageHandler) {
        self.unsubscribe(TOPIC_INCOMPLETE_ORDERS, handler).await;
    }

    pub async fn unsubscribe_order_updates(&self, handler: &MessageHandler) {
        self.unsubscribe(TOPIC_ORDER_UPDATES, handler).await;
    }
}
