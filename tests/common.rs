// tests/common.rs
//
// In-process mock STOMP broker for integration tests: binds a local
// websocket listener, accepts sequential client sessions (so reconnects land
// on the same broker), answers the STOMP handshake and reports everything the
// client does as observable events.

use futures_util::{SinkExt, StreamExt};
use order_stream_rs::stomp::Frame;
use std::sync::Once;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Test-driven actions on the broker side of the current session.
#[derive(Debug)]
pub enum BrokerCommand {
    /// Deliver a MESSAGE frame to every subscriber of the destination.
    Publish { destination: String, body: String },
    /// Send a broker-level ERROR frame.
    Error { detail: String },
    /// Drop the socket without a Close frame (abrupt disconnect).
    Abort,
}

/// Client activity observed by the broker.
#[derive(Debug, PartialEq, Eq)]
pub enum BrokerEvent {
    /// STOMP handshake completed (CONNECT answered with CONNECTED).
    Connected,
    Subscribed { id: String, destination: String },
    Unsubscribed { id: String },
    /// Client published via SEND.
    Sent { destination: String, body: String },
    /// Session ended (DISCONNECT, Close or socket drop).
    Disconnected,
}

pub struct MockBroker {
    pub url: String,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
    cmds: mpsc::UnboundedSender<BrokerCommand>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock broker");
        let url = format!(
            "ws://{}/ws",
            listener.local_addr().expect("local addr unavailable")
        );
        let (event_tx, events) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_broker(listener, event_tx, cmd_rx));
        Self {
            url,
            events,
            cmds: cmd_tx,
            _task: task,
        }
    }

    pub fn publish(&self, destination: &str, body: &str) {
        self.cmds
            .send(BrokerCommand::Publish {
                destination: destination.to_string(),
                body: body.to_string(),
            })
            .expect("broker task gone");
    }

    pub fn error(&self, detail: &str) {
        self.cmds
            .send(BrokerCommand::Error {
                detail: detail.to_string(),
            })
            .expect("broker task gone");
    }

    pub fn abort(&self) {
        self.cmds.send(BrokerCommand::Abort).expect("broker task gone");
    }

    /// Next observed event, bounded so a broken test fails instead of hanging.
    pub async fn next_event(&mut self) -> BrokerEvent {
        timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for broker event")
            .expect("broker event channel closed")
    }

    /// Asserts no event arrives within the window.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(event) = timeout(window, self.events.recv()).await {
            panic!("expected no broker event, got {:?}", event);
        }
    }

    /// Skips events until a SUBSCRIBE for the destination is seen.
    pub async fn await_subscription(&mut self, destination: &str) -> String {
        loop {
            if let BrokerEvent::Subscribed {
                id,
                destination: dest,
            } = self.next_event().await
            {
                if dest == destination {
                    return id;
                }
            }
        }
    }
}

async fn run_broker(
    listener: TcpListener,
    event_tx: mpsc::UnboundedSender<BrokerEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<BrokerCommand>,
) {
    let mut next_message_id = 0u64;
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(ws) = accept_async(stream).await else {
            continue;
        };
        let (mut write, mut read) = ws.split();
        // (subscription id, destination) wired in this session.
        let mut subs: Vec<(String, String)> = Vec::new();
        let mut session_reported = false;

        loop {
            tokio::select! {
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(Some(frame)) = Frame::parse(&text) else {
                            continue;
                        };
                        match frame.command.as_str() {
                            "CONNECT" => {
                                let connected =
                                    Frame::new("CONNECTED").header("version", "1.2");
                                if write
                                    .send(Message::Text(connected.encode()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                let _ = event_tx.send(BrokerEvent::Connected);
                            }
                            "SUBSCRIBE" => {
                                let id =
                                    frame.get_header("id").unwrap_or_default().to_string();
                                let destination = frame
                                    .get_header("destination")
                                    .unwrap_or_default()
                                    .to_string();
                                subs.push((id.clone(), destination.clone()));
                                let _ = event_tx
                                    .send(BrokerEvent::Subscribed { id, destination });
                            }
                            "UNSUBSCRIBE" => {
                                let id =
                                    frame.get_header("id").unwrap_or_default().to_string();
                                subs.retain(|(sub_id, _)| *sub_id != id);
                                let _ = event_tx.send(BrokerEvent::Unsubscribed { id });
                            }
                            "SEND" => {
                                let destination = frame
                                    .get_header("destination")
                                    .unwrap_or_default()
                                    .to_string();
                                let _ = event_tx.send(BrokerEvent::Sent {
                                    destination,
                                    body: frame.body.clone(),
                                });
                            }
                            "DISCONNECT" => {
                                session_reported = true;
                                let _ = event_tx.send(BrokerEvent::Disconnected);
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        if !session_reported {
                            let _ = event_tx.send(BrokerEvent::Disconnected);
                        }
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => {
                        if !session_reported {
                            let _ = event_tx.send(BrokerEvent::Disconnected);
                        }
                        break;
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(BrokerCommand::Publish { destination, body }) => {
                        for (id, dest) in &subs {
                            if *dest != destination {
                                continue;
                            }
                            next_message_id += 1;
                            let msg = Frame::new("MESSAGE")
                                .header("destination", &destination)
                                .header("subscription", id)
                                .header("message-id", &next_message_id.to_string())
                                .with_body(body.clone());
                            if write.send(Message::Text(msg.encode())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(BrokerCommand::Error { detail }) => {
                        let frame = Frame::new("ERROR")
                            .header("message", &detail)
                            .with_body(detail.clone());
                        let _ = write.send(Message::Text(frame.encode())).await;
                    }
                    Some(BrokerCommand::Abort) => {
                        // Drop the socket with no Close frame; reconnects land
                        // on the outer accept loop.
                        break;
                    }
                    None => return,
                },
            }
        }
    }
}
