//! Syncline - realtime channel synchronization
//!
//! This crate provides a unified API for the Syncline sync system.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use syncline::{ChannelSession, MemoryStore, NetworkMonitor, SyncConfig, SyncContext, WebSocketTransport};
//!
//! let transport = WebSocketTransport::new("wss://relay/ws");
//! let ctx = SyncContext::new(SyncConfig::from_env(), Arc::new(NetworkMonitor::default()), Arc::new(transport.clone()));
//! let session = ChannelSession::subscribe(
//!     &ctx,
//!     "room-1".into(),
//!     Arc::new(transport.clone()),
//!     Arc::new(transport),
//!     Arc::new(MemoryStore::new()),
//! )
//! .await?;
//! ```

// Re-export client types
pub use syncline_client::{
    CatchUpReport, ChannelSession, ChannelTransport, EventDispatcher, LocalStore, MemoryStore,
    NetworkMonitor, PageFetcher, SyncContext, SyncEvent, WebSocketTransport,
};

// Re-export server types
pub use syncline_server::AppState as Server;

// Re-export core types that external applications may need
pub use syncline_core::config::SyncConfig;
pub use syncline_core::errors::SyncError;
pub use syncline_core::models::{ChannelId, ChannelStatus, DeliveryPath, RawEvent, SyncCursor};
pub use syncline_core::protocol::{ClientMessage, ServerMessage};
pub use syncline_core::SyncResult;
