//! Collaborator seams between the sync core and whatever carries the bytes.

use futures_util::future::BoxFuture;
use syncline_core::{
    models::{ChannelId, DeliveryPath, EventPage, RawEvent, SyncCursor},
    SyncResult,
};
use tokio::sync::mpsc;

/// What a transport pushes into a channel's sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event { path: DeliveryPath, event: RawEvent },
    /// The underlying connection dropped.
    Closed { reason: String },
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

pub trait ChannelTransport: Send + Sync {
    /// Open or re-open the channel.
    fn open<'a>(&'a self, channel: &'a ChannelId) -> BoxFuture<'a, SyncResult<()>>;

    fn close<'a>(&'a self, channel: &'a ChannelId) -> BoxFuture<'a, SyncResult<()>>;

    /// Route both inbound paths for `channel` into `sink`. Replaces any
    /// previous sink for the channel.
    fn attach(&self, channel: &ChannelId, sink: InboundSender);

    fn detach(&self, channel: &ChannelId);

    /// Best-effort fast-path echo of a locally originated event.
    fn send_broadcast<'a>(
        &'a self,
        channel: &'a ChannelId,
        event: RawEvent,
    ) -> BoxFuture<'a, SyncResult<()>>;
}

pub trait PageFetcher: Send + Sync {
    /// Events strictly after `since`, oldest first, at most `limit` of them.
    fn fetch_page<'a>(
        &'a self,
        channel: &'a ChannelId,
        since: SyncCursor,
        limit: usize,
    ) -> BoxFuture<'a, SyncResult<EventPage>>;
}
