use crate::feed::FeedError;
use crate::AppState;
use std::collections::HashSet;
use std::sync::Arc;
use syncline_core::{
    errors::SyncError,
    models::{ChannelId, RawEvent},
    protocol::{ClientMessage, ErrorCode, ServerMessage},
    SyncResult,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-connection message handler.
pub struct RelayHandler {
    connection_id: Uuid,
    tx: mpsc::Sender<ServerMessage>,
    state: Arc<AppState>,
    channels: HashSet<ChannelId>,
}

impl RelayHandler {
    pub fn new(connection_id: Uuid, tx: mpsc::Sender<ServerMessage>, state: Arc<AppState>) -> Self {
        Self {
            connection_id,
            tx,
            state,
            channels: HashSet::new(),
        }
    }

    pub fn channels(&self) -> &HashSet<ChannelId> {
        &self.channels
    }

    pub async fn handle_message(&mut self, msg: ClientMessage) -> SyncResult<()> {
        match msg {
            ClientMessage::Subscribe {
                request_id,
                channel,
            } => {
                if let Err(e) = self.state.feed.check_access(&channel) {
                    tracing::warn!("SERVER: {} refused {}: {}", self.connection_id, channel, e);
                    return self.send_error(Some(request_id), &e).await;
                }
                self.state.subscribe(&channel, self.connection_id);
                self.channels.insert(channel.clone());
                tracing::info!("SERVER: {} subscribed to {}", self.connection_id, channel);
                self.send(ServerMessage::Subscribed {
                    request_id,
                    channel,
                })
                .await
            }

            ClientMessage::Unsubscribe { channel } => {
                self.state.unsubscribe(&channel, self.connection_id);
                self.channels.remove(&channel);
                tracing::info!("SERVER: {} unsubscribed from {}", self.connection_id, channel);
                Ok(())
            }

            ClientMessage::Broadcast { channel, event } => {
                if !self.channels.contains(&channel) {
                    tracing::warn!(
                        "SERVER: {} broadcast to {} without subscribing",
                        self.connection_id,
                        channel
                    );
                    return Ok(());
                }
                // The sender gets its own echo like everyone else
                self.fan_out(&channel, ServerMessage::Broadcast {
                    channel: channel.clone(),
                    event,
                })
                .await;
                Ok(())
            }

            ClientMessage::Publish {
                request_id,
                channel,
                draft,
            } => {
                let result = self.state.feed.publish(&channel, draft);
                self.respond_with_change(request_id, channel, result).await
            }

            ClientMessage::Edit {
                request_id,
                channel,
                entity_id,
                fields,
            } => {
                let result = self.state.feed.edit(&channel, &entity_id, fields);
                self.respond_with_change(request_id, channel, result).await
            }

            ClientMessage::Delete {
                request_id,
                channel,
                entity_id,
            } => {
                let result = self.state.feed.delete(&channel, &entity_id);
                self.respond_with_change(request_id, channel, result).await
            }

            ClientMessage::FetchSince {
                request_id,
                channel,
                since,
                limit,
            } => match self.state.feed.since(&channel, since, limit) {
                Ok(page) => {
                    tracing::debug!(
                        "SERVER: {} fetched {} event(s) of {} after {}",
                        self.connection_id,
                        page.events.len(),
                        channel,
                        since
                    );
                    self.send(ServerMessage::Page { request_id, page }).await
                }
                Err(e) => self.send_error(Some(request_id), &e).await,
            },

            ClientMessage::Lookup { request_id, keys } => {
                let profiles = self.state.feed.lookup(&keys);
                tracing::debug!(
                    "SERVER: lookup of {} key(s) found {}",
                    keys.len(),
                    profiles.len()
                );
                self.send(ServerMessage::Profiles {
                    request_id,
                    profiles,
                })
                .await
            }

            ClientMessage::Ping => self.send(ServerMessage::Pong).await,
        }
    }

    /// Drop every subscription held by this connection.
    pub fn cleanup(&mut self) {
        for channel in self.channels.drain() {
            self.state.unsubscribe(&channel, self.connection_id);
        }
        self.state.clients.remove(&self.connection_id);
    }

    async fn respond_with_change(
        &self,
        request_id: Uuid,
        channel: ChannelId,
        result: Result<RawEvent, FeedError>,
    ) -> SyncResult<()> {
        let event = match result {
            Ok(event) => event,
            Err(e) => return self.send_error(Some(request_id), &e).await,
        };
        self.send(ServerMessage::Published {
            request_id,
            event: event.clone(),
        })
        .await?;
        self.fan_out(&channel, ServerMessage::Change { channel: channel.clone(), event })
            .await;
        Ok(())
    }

    async fn fan_out(&self, channel: &ChannelId, message: ServerMessage) {
        let subscribers = self.state.subscribers(channel);
        let mut dead = Vec::new();
        for (id, tx) in &subscribers {
            if tx.send(message.clone()).await.is_err() {
                dead.push(*id);
            }
        }
        tracing::debug!(
            "SERVER: fan-out on {} reached {}/{} subscriber(s)",
            channel,
            subscribers.len() - dead.len(),
            subscribers.len()
        );
        for id in dead {
            tracing::warn!("SERVER: dropping dead connection {} from {}", id, channel);
            self.state.unsubscribe(channel, id);
            self.state.clients.remove(&id);
        }
    }

    async fn send(&self, message: ServerMessage) -> SyncResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| SyncError::ConnectionClosed)
    }

    async fn send_error(&self, request_id: Option<Uuid>, error: &FeedError) -> SyncResult<()> {
        self.send(ServerMessage::Error {
            request_id,
            code: error.code(),
            message: error.to_string(),
        })
        .await
    }

    pub async fn send_invalid(&self, message: String) -> SyncResult<()> {
        self.send(ServerMessage::Error {
            request_id: None,
            code: ErrorCode::InvalidRequest,
            message,
        })
        .await
    }
}
