//! WebSocket transport against a `syncline-server` relay.
//!
//! One socket carries every channel. Requests are correlated by `request_id`;
//! inbound broadcast frames go to the fast path and changefeed frames to the
//! authoritative path of the channel's attached sink. When the socket drops,
//! every attached channel receives `Inbound::Closed` and the next `open`
//! dials a fresh connection.

use crate::lookup::BulkLookup;
use crate::transport::{ChannelTransport, Inbound, InboundSender, PageFetcher};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use syncline_core::{
    errors::SyncError,
    models::{AuthorProfile, ChannelId, DeliveryPath, EventDraft, EventPage, RawEvent, SyncCursor},
    protocol::{ClientMessage, ServerMessage},
    SyncResult,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const PING_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const OUTGOING_BUFFER: usize = 100;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Connection {
    generation: u64,
    outgoing: mpsc::Sender<ClientMessage>,
}

struct WsInner {
    url: String,
    request_timeout: Duration,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    sinks: DashMap<ChannelId, InboundSender>,
    pending: DashMap<Uuid, oneshot::Sender<ServerMessage>>,
}

#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

impl WebSocketTransport {
    /// No connection is made until the first request.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_request_timeout(url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(WsInner {
                url: url.into(),
                request_timeout,
                connection: Mutex::new(None),
                generation: AtomicU64::new(0),
                sinks: DashMap::new(),
                pending: DashMap::new(),
            }),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner
            .connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|connection| !connection.outgoing.is_closed())
    }

    async fn ensure_connected(&self) -> SyncResult<mpsc::Sender<ClientMessage>> {
        let mut connection = self.inner.connection.lock().await;
        if let Some(existing) = connection.as_ref() {
            if !existing.outgoing.is_closed() {
                return Ok(existing.outgoing.clone());
            }
        }

        tracing::info!("Connecting to {}", self.inner.url);
        let timeout = self.inner.request_timeout;
        let (socket, _) = tokio::time::timeout(timeout, connect_async(self.inner.url.as_str()))
            .await
            .map_err(|_| SyncError::Timeout(timeout))?
            .map_err(|e| SyncError::Network(e.to_string()))?;

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (write, read) = socket.split();
        let (outgoing, queue) = mpsc::channel::<ClientMessage>(OUTGOING_BUFFER);

        tokio::spawn(write_loop(write, queue));
        tokio::spawn(read_loop(Arc::downgrade(&self.inner), read, generation));

        *connection = Some(Connection {
            generation,
            outgoing: outgoing.clone(),
        });
        tracing::info!("Connected to {} (connection {})", self.inner.url, generation);
        Ok(outgoing)
    }

    async fn send(&self, message: ClientMessage) -> SyncResult<()> {
        let outgoing = self.ensure_connected().await?;
        outgoing
            .send(message)
            .await
            .map_err(|_| SyncError::ConnectionClosed)
    }

    async fn request(&self, message: ClientMessage) -> SyncResult<ServerMessage> {
        let request_id = message
            .request_id()
            .ok_or_else(|| SyncError::Protocol("message carries no request id".to_string()))?;
        let outgoing = self.ensure_connected().await?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id, tx);
        if outgoing.send(message).await.is_err() {
            self.inner.pending.remove(&request_id);
            return Err(SyncError::ConnectionClosed);
        }

        let timeout = self.inner.request_timeout;
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(SyncError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.remove(&request_id);
                return Err(SyncError::Timeout(timeout));
            }
        };

        match response {
            ServerMessage::Error { code, message, .. } => Err(code.into_error(message)),
            other => Ok(other),
        }
    }

    /// Submit a new entity to the feed. The confirmed event also arrives on
    /// the changefeed of every subscriber.
    pub async fn publish(&self, channel: &ChannelId, draft: EventDraft) -> SyncResult<RawEvent> {
        let response = self
            .request(ClientMessage::Publish {
                request_id: Uuid::new_v4(),
                channel: channel.clone(),
                draft,
            })
            .await?;
        expect_published(response)
    }

    pub async fn edit(
        &self,
        channel: &ChannelId,
        entity_id: &str,
        fields: serde_json::Value,
    ) -> SyncResult<RawEvent> {
        let response = self
            .request(ClientMessage::Edit {
                request_id: Uuid::new_v4(),
                channel: channel.clone(),
                entity_id: entity_id.to_string(),
                fields,
            })
            .await?;
        expect_published(response)
    }

    /// Soft delete; the entity stays in the feed with `deleted_at` set.
    pub async fn delete(&self, channel: &ChannelId, entity_id: &str) -> SyncResult<RawEvent> {
        let response = self
            .request(ClientMessage::Delete {
                request_id: Uuid::new_v4(),
                channel: channel.clone(),
                entity_id: entity_id.to_string(),
            })
            .await?;
        expect_published(response)
    }
}

fn expect_published(response: ServerMessage) -> SyncResult<RawEvent> {
    match response {
        ServerMessage::Published { event, .. } => Ok(event),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(message: &ServerMessage) -> SyncError {
    SyncError::Protocol(format!("unexpected response: {:?}", message))
}

impl WsInner {
    fn route(&self, message: ServerMessage) {
        match message {
            ServerMessage::Broadcast { channel, event } => self.push(
                &channel,
                Inbound::Event {
                    path: DeliveryPath::Fast,
                    event,
                },
            ),
            ServerMessage::Change { channel, event } => self.push(
                &channel,
                Inbound::Event {
                    path: DeliveryPath::Authoritative,
                    event,
                },
            ),
            ServerMessage::Pong => {}
            other => match other.request_id() {
                Some(request_id) => match self.pending.remove(&request_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(other);
                    }
                    None => tracing::debug!("Dropping late response {}", request_id),
                },
                None => tracing::warn!("Server message without a request: {:?}", other),
            },
        }
    }

    fn push(&self, channel: &ChannelId, inbound: Inbound) {
        let gone = self
            .sinks
            .get(channel)
            .map(|sink| sink.send(inbound).is_err())
            .unwrap_or(false);
        if gone {
            self.sinks.remove(channel);
        }
    }

    async fn connection_lost(&self, generation: u64, reason: &str) {
        {
            let mut connection = self.connection.lock().await;
            match connection.as_ref() {
                Some(current) if current.generation == generation => *connection = None,
                _ => return,
            }
        }
        tracing::warn!("Connection {} lost: {}", generation, reason);

        // Dropping the waiters fails their requests with ConnectionClosed
        self.pending.clear();
        for sink in self.sinks.iter() {
            let _ = sink.value().send(Inbound::Closed {
                reason: reason.to_string(),
            });
        }
    }
}

async fn write_loop(mut write: SplitSink<Socket, Message>, mut queue: mpsc::Receiver<ClientMessage>) {
    let mut heartbeat = tokio::time::interval(PING_INTERVAL);
    heartbeat.tick().await;

    loop {
        let message = tokio::select! {
            next = queue.recv() => match next {
                Some(message) => message,
                None => break,
            },
            _ = heartbeat.tick() => ClientMessage::Ping,
        };
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode outgoing message: {}", e);
                continue;
            }
        };
        if let Err(e) = write.send(Message::Text(text)).await {
            tracing::warn!("WebSocket write failed: {}", e);
            break;
        }
    }
    let _ = write.close().await;
}

async fn read_loop(inner: Weak<WsInner>, mut read: SplitStream<Socket>, generation: u64) {
    let mut reason = "closed by server".to_string();
    while let Some(frame) = read.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                reason = e.to_string();
                break;
            }
        };
        let message = match serde_json::from_str::<ServerMessage>(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Ignoring malformed server frame: {}", e);
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.route(message);
    }

    if let Some(inner) = inner.upgrade() {
        inner.connection_lost(generation, &reason).await;
    }
}

impl ChannelTransport for WebSocketTransport {
    fn open<'a>(&'a self, channel: &'a ChannelId) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            let response = self
                .request(ClientMessage::Subscribe {
                    request_id: Uuid::new_v4(),
                    channel: channel.clone(),
                })
                .await?;
            match response {
                ServerMessage::Subscribed { .. } => Ok(()),
                other => Err(unexpected(&other)),
            }
        })
    }

    fn close<'a>(&'a self, channel: &'a ChannelId) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            if !self.is_connected().await {
                return Ok(());
            }
            self.send(ClientMessage::Unsubscribe {
                channel: channel.clone(),
            })
            .await
        })
    }

    fn attach(&self, channel: &ChannelId, sink: InboundSender) {
        self.inner.sinks.insert(channel.clone(), sink);
    }

    fn detach(&self, channel: &ChannelId) {
        self.inner.sinks.remove(channel);
    }

    fn send_broadcast<'a>(
        &'a self,
        channel: &'a ChannelId,
        event: RawEvent,
    ) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            self.send(ClientMessage::Broadcast {
                channel: channel.clone(),
                event,
            })
            .await
        })
    }
}

impl PageFetcher for WebSocketTransport {
    fn fetch_page<'a>(
        &'a self,
        channel: &'a ChannelId,
        since: SyncCursor,
        limit: usize,
    ) -> BoxFuture<'a, SyncResult<EventPage>> {
        Box::pin(async move {
            let response = self
                .request(ClientMessage::FetchSince {
                    request_id: Uuid::new_v4(),
                    channel: channel.clone(),
                    since,
                    limit,
                })
                .await?;
            match response {
                ServerMessage::Page { page, .. } => Ok(page),
                other => Err(unexpected(&other)),
            }
        })
    }
}

impl BulkLookup<String, AuthorProfile> for WebSocketTransport {
    fn lookup(&self, keys: Vec<String>) -> BoxFuture<'_, SyncResult<HashMap<String, AuthorProfile>>> {
        Box::pin(async move {
            let response = self
                .request(ClientMessage::Lookup {
                    request_id: Uuid::new_v4(),
                    keys,
                })
                .await?;
            match response {
                ServerMessage::Profiles { profiles, .. } => Ok(profiles
                    .into_iter()
                    .map(|profile| (profile.id.clone(), profile))
                    .collect()),
                other => Err(unexpected(&other)),
            }
        })
    }
}
