use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::SyncError;
use crate::models::{AuthorProfile, ChannelId, EventDraft, EventPage, RawEvent, SyncCursor};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Channel membership
    Subscribe {
        request_id: Uuid,
        channel: ChannelId,
    },
    Unsubscribe {
        channel: ChannelId,
    },

    // Fast path
    Broadcast {
        channel: ChannelId,
        event: RawEvent,
    },

    // Writes against the authoritative feed
    Publish {
        request_id: Uuid,
        channel: ChannelId,
        draft: EventDraft,
    },
    Edit {
        request_id: Uuid,
        channel: ChannelId,
        entity_id: String,
        fields: serde_json::Value,
    },
    Delete {
        request_id: Uuid,
        channel: ChannelId,
        entity_id: String,
    },

    // Catch-up and lookups
    FetchSince {
        request_id: Uuid,
        channel: ChannelId,
        since: SyncCursor,
        limit: usize,
    },
    Lookup {
        request_id: Uuid,
        keys: Vec<String>,
    },

    // Heartbeat
    Ping,
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            ClientMessage::Subscribe { request_id, .. }
            | ClientMessage::Publish { request_id, .. }
            | ClientMessage::Edit { request_id, .. }
            | ClientMessage::Delete { request_id, .. }
            | ClientMessage::FetchSince { request_id, .. }
            | ClientMessage::Lookup { request_id, .. } => Some(*request_id),
            ClientMessage::Unsubscribe { .. } | ClientMessage::Broadcast { .. } | ClientMessage::Ping => {
                None
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        request_id: Uuid,
        channel: ChannelId,
    },

    // Inbound events
    Broadcast {
        channel: ChannelId,
        event: RawEvent,
    },
    Change {
        channel: ChannelId,
        event: RawEvent,
    },

    // Responses
    Published {
        request_id: Uuid,
        event: RawEvent,
    },
    Page {
        request_id: Uuid,
        page: EventPage,
    },
    Profiles {
        request_id: Uuid,
        profiles: Vec<AuthorProfile>,
    },

    Error {
        request_id: Option<Uuid>,
        code: ErrorCode,
        message: String,
    },

    Pong,
}

impl ServerMessage {
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            ServerMessage::Subscribed { request_id, .. }
            | ServerMessage::Published { request_id, .. }
            | ServerMessage::Page { request_id, .. }
            | ServerMessage::Profiles { request_id, .. } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            ServerMessage::Broadcast { .. } | ServerMessage::Change { .. } | ServerMessage::Pong => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PermissionDenied,
    NotFound,
    InvalidRequest,
    ServerError,
}

impl ErrorCode {
    pub fn into_error(self, message: String) -> SyncError {
        match self {
            ErrorCode::PermissionDenied => SyncError::PermissionDenied(message),
            ErrorCode::NotFound => SyncError::NotFound(message),
            ErrorCode::InvalidRequest => SyncError::Protocol(message),
            // Server-side failures are worth retrying.
            ErrorCode::ServerError => SyncError::Network(message),
        }
    }
}
