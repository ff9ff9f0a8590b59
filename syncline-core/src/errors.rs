use std::time::Duration;
use thiserror::Error;

use crate::models::{ChannelId, ChannelStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network is offline")]
    Offline,

    #[error("Channel not registered: {0}")]
    ChannelNotRegistered(ChannelId),

    #[error("Channel {channel} is already {status}")]
    ChannelActive {
        channel: ChannelId,
        status: ChannelStatus,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to acquire lock: {0}")]
    LockError(String),

    #[error("Thread safety violation: process_events() must be called on the registration thread")]
    ThreadSafetyViolation,

    #[error("No callbacks registered yet")]
    NoCallbacksRegistered,
}

impl SyncError {
    /// Transient failures are retried by the backoff policies; everything else is
    /// terminal for the operation that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Timeout(_) | SyncError::ConnectionClosed
        )
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, SyncError::PermissionDenied(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for SyncError {
    fn from(err: uuid::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
