// WebSocket relay — NIP-01 over tokio-tungstenite
//
// One background task owns the socket. Callers talk to it through a command
// channel; replies come back on oneshot channels (OK, EOSE) or on per-REQ
// event channels. When the socket dies the task exits, every pending reply
// is dropped, and the next call reconnects.

use super::transport::{PublishAck, RelayTransport, TransportError};
use crate::event::{Event, Filter};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 256;
const SUBSCRIPTION_BUFFER: usize = 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages a relay sends us
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// ["EVENT", sub_id, event]
    Event(String, Event),
    /// ["OK", event_id, accepted, message]
    Ok(String, bool, String),
    /// ["EOSE", sub_id]
    Eose(String),
    /// ["CLOSED", sub_id, message]
    Closed(String, String),
    /// ["NOTICE", message]
    Notice(String),
}

impl RelayMessage {
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| TransportError::Protocol(format!("invalid JSON: {}", e)))?;
        let items = value
            .as_array()
            .ok_or_else(|| TransportError::Protocol("relay message is not an array".to_string()))?;
        let label = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Protocol("missing message label".to_string()))?;

        let text_at = |index: usize| -> Result<String, TransportError> {
            items
                .get(index)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    TransportError::Protocol(format!("{}: missing field {}", label, index))
                })
        };

        match label {
            "EVENT" => {
                let sub_id = text_at(1)?;
                let raw = items
                    .get(2)
                    .cloned()
                    .ok_or_else(|| TransportError::Protocol("EVENT: missing event".to_string()))?;
                let event: Event = serde_json::from_value(raw)
                    .map_err(|e| TransportError::Protocol(format!("EVENT: {}", e)))?;
                Ok(RelayMessage::Event(sub_id, event))
            }
            "OK" => {
                let accepted = items
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| TransportError::Protocol("OK: missing flag".to_string()))?;
                let message = text_at(3).unwrap_or_default();
                Ok(RelayMessage::Ok(text_at(1)?, accepted, message))
            }
            "EOSE" => Ok(RelayMessage::Eose(text_at(1)?)),
            "CLOSED" => Ok(RelayMessage::Closed(text_at(1)?, text_at(2).unwrap_or_default())),
            "NOTICE" => Ok(RelayMessage::Notice(text_at(1)?)),
            other => Err(TransportError::Protocol(format!(
                "unknown message type {}",
                other
            ))),
        }
    }
}

enum Command {
    Publish {
        event: Event,
        reply: oneshot::Sender<PublishAck>,
    },
    Req {
        sub_id: String,
        filter: Filter,
        sink: mpsc::Sender<Event>,
        eose: Option<oneshot::Sender<()>>,
    },
    Close {
        sub_id: String,
    },
    Shutdown,
}

struct Subscription {
    sink: mpsc::Sender<Event>,
    eose: Option<oneshot::Sender<()>>,
}

struct Connection {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// A relay reached over WebSocket.
pub struct WebSocketRelay {
    url: String,
    timeout: Duration,
    connection: Mutex<Option<Connection>>,
    next_sub: AtomicU64,
}

impl WebSocketRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            connection: Mutex::new(None),
            next_sub: AtomicU64::new(1),
        }
    }

    /// Command channel of a live connection, dialing if there is none
    async fn commands(&self) -> Result<mpsc::Sender<Command>, TransportError> {
        let mut connection = self.connection.lock().await;
        if let Some(live) = connection.as_ref() {
            if !live.commands.is_closed() {
                return Ok(live.commands.clone());
            }
        }

        let (socket, _) = tokio::time::timeout(self.timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(format!("connecting to {}", self.url)))?
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {}", self.url, e)))?;

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(run_connection(self.url.clone(), socket, rx));
        info!("Connected to relay {}", self.url);
        *connection = Some(Connection {
            commands: tx.clone(),
            task,
        });
        Ok(tx)
    }

    fn next_sub_id(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.next_sub.fetch_add(1, Ordering::Relaxed))
    }
}

async fn send_frame<S>(write: &mut S, frame: Value) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    write.send(Message::Text(frame.to_string())).await.is_ok()
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn run_connection(url: String, socket: Socket, mut commands: mpsc::Receiver<Command>) {
    let (mut write, mut read) = socket.split();
    let mut pending: HashMap<String, oneshot::Sender<PublishAck>> = HashMap::new();
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Publish { event, reply }) => {
                    let id = event.id.clone();
                    if !send_frame(&mut write, json!(["EVENT", event])).await {
                        break;
                    }
                    pending.insert(id, reply);
                }
                Some(Command::Req { sub_id, filter, sink, eose }) => {
                    if !send_frame(&mut write, json!(["REQ", sub_id, filter])).await {
                        break;
                    }
                    subscriptions.insert(sub_id, Subscription { sink, eose });
                }
                Some(Command::Close { sub_id }) => {
                    if subscriptions.remove(&sub_id).is_some()
                        && !send_frame(&mut write, json!(["CLOSE", sub_id])).await
                    {
                        break;
                    }
                }
                Some(Command::Shutdown) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let message = match RelayMessage::parse(&text) {
                        Ok(message) => message,
                        Err(e) => {
                            debug!("Ignoring frame from {}: {}", url, e);
                            continue;
                        }
                    };
                    match message {
                        RelayMessage::Event(sub_id, event) => {
                            let Some(subscription) = subscriptions.get(&sub_id) else {
                                continue;
                            };
                            match subscription.sink.try_send(event) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(event)) => {
                                    debug!("Subscriber on {} is behind, dropping {}", url, event.id);
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    subscriptions.remove(&sub_id);
                                    if !send_frame(&mut write, json!(["CLOSE", sub_id])).await {
                                        break;
                                    }
                                }
                            }
                        }
                        RelayMessage::Ok(event_id, accepted, message) => {
                            if let Some(reply) = pending.remove(&event_id) {
                                let _ = reply.send(PublishAck { accepted, message });
                            }
                        }
                        RelayMessage::Eose(sub_id) => {
                            if let Some(eose) = subscriptions
                                .get_mut(&sub_id)
                                .and_then(|s| s.eose.take())
                            {
                                let _ = eose.send(());
                            }
                        }
                        RelayMessage::Closed(sub_id, reason) => {
                            debug!("Relay {} closed {}: {}", url, sub_id, reason);
                            subscriptions.remove(&sub_id);
                        }
                        RelayMessage::Notice(notice) => {
                            debug!("Notice from {}: {}", url, notice);
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Relay {} connection error: {}", url, e);
                    break;
                }
            }
        }
    }
    info!("Disconnected from relay {}", url);
}

#[async_trait]
impl RelayTransport for WebSocketRelay {
    fn url(&self) -> String {
        self.url.clone()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.commands().await.map(|_| ())
    }

    async fn publish(&self, event: &Event) -> Result<PublishAck, TransportError> {
        let commands = self.commands().await?;
        let (reply, ack) = oneshot::channel();
        commands
            .send(Command::Publish {
                event: event.clone(),
                reply,
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        match tokio::time::timeout(self.timeout, ack).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(format!("no OK for {}", event.id))),
        }
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Event>, TransportError> {
        let commands = self.commands().await?;
        let sub_id = self.next_sub_id("q");
        let (sink, mut rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (eose_tx, mut eose_rx) = oneshot::channel();
        commands
            .send(Command::Req {
                sub_id: sub_id.clone(),
                filter: filter.clone(),
                sink,
                eose: Some(eose_tx),
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        let mut events = Vec::new();
        let collected = tokio::time::timeout(self.timeout, async {
            loop {
                tokio::select! {
                    biased;
                    received = rx.recv() => match received {
                        Some(event) => events.push(event),
                        None => return Err(TransportError::Closed),
                    },
                    eose = &mut eose_rx => {
                        return eose.map_err(|_| TransportError::Closed);
                    }
                }
            }
        })
        .await;

        let _ = commands.send(Command::Close { sub_id }).await;
        match collected {
            Ok(Ok(())) => {
                while let Ok(event) = rx.try_recv() {
                    events.push(event);
                }
                Ok(events)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout("no EOSE from relay".to_string())),
        }
    }

    async fn subscribe(&self, filter: &Filter) -> Result<mpsc::Receiver<Event>, TransportError> {
        let commands = self.commands().await?;
        let (sink, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        commands
            .send(Command::Req {
                sub_id: self.next_sub_id("s"),
                filter: filter.clone(),
                sink,
                eose: None,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(rx)
    }

    async fn disconnect(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            let _ = connection.commands.send(Command::Shutdown).await;
            if tokio::time::timeout(self.timeout, connection.task)
                .await
                .is_err()
            {
                debug!("Relay task for {} did not stop in time", self.url);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn event(n: u64) -> Event {
        let pubkey = "cd".repeat(32);
        let tags = vec![vec!["stream".to_string(), "s".to_string()]];
        let content = n.to_string();
        Event {
            id: Event::compute_id(&pubkey, n, 4100, &tags, &content).unwrap(),
            pubkey,
            created_at: n,
            kind: 4100,
            tags,
            content,
            sig: "00".repeat(64),
        }
    }

    /// Minimal relay: stores EVENTs, answers REQ with everything stored
    /// followed by EOSE.
    async fn spawn_test_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    let mut stored: Vec<Value> = Vec::new();
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let frame: Value = serde_json::from_str(&text).unwrap();
                        match frame[0].as_str() {
                            Some("EVENT") => {
                                stored.push(frame[1].clone());
                                let ok = json!(["OK", frame[1]["id"], true, ""]);
                                ws.send(Message::Text(ok.to_string())).await.unwrap();
                            }
                            Some("REQ") => {
                                let sub_id = frame[1].clone();
                                for e in &stored {
                                    let out = json!(["EVENT", sub_id, e]);
                                    ws.send(Message::Text(out.to_string())).await.unwrap();
                                }
                                let eose = json!(["EOSE", sub_id]);
                                ws.send(Message::Text(eose.to_string())).await.unwrap();
                            }
                            _ => {}
                        }
                    }
                });
            }
        });

        format!("ws://{}", addr)
    }

    #[test]
    fn test_parse_event_message() {
        let e = event(1);
        let text = json!(["EVENT", "sub1", e]).to_string();
        assert_eq!(
            RelayMessage::parse(&text).unwrap(),
            RelayMessage::Event("sub1".to_string(), e)
        );
    }

    #[test]
    fn test_parse_ok_message() {
        let msg = RelayMessage::parse(r#"["OK","abc",false,"blocked: spam"]"#).unwrap();
        assert_eq!(
            msg,
            RelayMessage::Ok("abc".to_string(), false, "blocked: spam".to_string())
        );
        let msg = RelayMessage::parse(r#"["OK","abc",true]"#).unwrap();
        assert_eq!(msg, RelayMessage::Ok("abc".to_string(), true, String::new()));
    }

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(
            RelayMessage::parse(r#"["EOSE","q1"]"#).unwrap(),
            RelayMessage::Eose("q1".to_string())
        );
        assert_eq!(
            RelayMessage::parse(r#"["CLOSED","q1","error: shutting down"]"#).unwrap(),
            RelayMessage::Closed("q1".to_string(), "error: shutting down".to_string())
        );
        assert_eq!(
            RelayMessage::parse(r#"["NOTICE","hello"]"#).unwrap(),
            RelayMessage::Notice("hello".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RelayMessage::parse("not json").is_err());
        assert!(RelayMessage::parse(r#"{"a":1}"#).is_err());
        assert!(RelayMessage::parse(r#"["AUTH","challenge"]"#).is_err());
        assert!(RelayMessage::parse(r#"["EVENT","sub1",{"id":1}]"#).is_err());
    }

    #[tokio::test]
    async fn test_publish_and_query_over_websocket() {
        let url = spawn_test_relay().await;
        let relay = WebSocketRelay::with_timeout(url, Duration::from_secs(2));

        relay.connect().await.unwrap();
        let ack = relay.publish(&event(1)).await.unwrap();
        assert!(ack.accepted);
        relay.publish(&event(2)).await.unwrap();

        let events = relay.query(&Filter::new()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], event(1));

        relay.disconnect().await;
        // Reconnects on demand
        assert!(relay.publish(&event(3)).await.unwrap().accepted);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = WebSocketRelay::with_timeout(format!("ws://{}", addr), Duration::from_secs(1));
        assert!(matches!(
            relay.connect().await,
            Err(TransportError::ConnectFailed(_))
        ));
        assert_eq!(relay.url(), format!("ws://{}", addr));
    }
}
