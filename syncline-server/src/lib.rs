pub mod feed;
pub mod relay;
pub mod websocket;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use syncline_core::{models::ChannelId, protocol::ServerMessage};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

// Connected sockets: connection id -> outgoing queue
pub type ClientRegistry = DashMap<Uuid, mpsc::Sender<ServerMessage>>;

// Which connections subscribe to which channel
pub type ChannelSubscribers = DashMap<ChannelId, HashSet<Uuid>>;

pub struct AppState {
    pub feed: Arc<feed::FeedStore>,
    pub clients: ClientRegistry,
    pub subscriptions: ChannelSubscribers,
}

impl AppState {
    pub fn new(feed: feed::FeedStore) -> Self {
        Self {
            feed: Arc::new(feed),
            clients: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Outgoing queues of every connection subscribed to `channel`.
    pub fn subscribers(&self, channel: &ChannelId) -> Vec<(Uuid, mpsc::Sender<ServerMessage>)> {
        let Some(ids) = self.subscriptions.get(channel) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.clients.get(id).map(|tx| (*id, tx.value().clone())))
            .collect()
    }

    pub fn subscribe(&self, channel: &ChannelId, connection_id: Uuid) {
        self.subscriptions
            .entry(channel.clone())
            .or_default()
            .insert(connection_id);
    }

    pub fn unsubscribe(&self, channel: &ChannelId, connection_id: Uuid) {
        let emptied = match self.subscriptions.get_mut(channel) {
            Some(mut ids) => {
                ids.remove(&connection_id);
                ids.is_empty()
            }
            None => false,
        };
        if emptied {
            self.subscriptions.remove_if(channel, |_, ids| ids.is_empty());
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(|| async { "OK" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| websocket::handle_websocket(socket, state))
}
