//! Incremental catch-up after a (re)connect.
//!
//! Pages are fetched forward from the last known cursor until a short page,
//! `has_more == false`, or the per-pass event cap. Each page is retried with
//! exponential backoff on transient failures only.

use crate::registry::ChannelRegistry;
use crate::store::LocalStore;
use crate::transport::PageFetcher;
use backon::{ExponentialBuilder, Retryable};
use std::sync::Arc;
use std::time::Duration;
use syncline_core::{
    config::CatchUpConfig,
    errors::SyncError,
    models::{ChannelId, EventPage, RawEvent, SyncCursor},
    SyncResult,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CatchUpBatch {
    /// Fetched events, oldest first.
    pub events: Vec<RawEvent>,
    pub since: SyncCursor,
    /// Cursor of the last fetched event, or `since` if nothing was fetched.
    pub cursor: SyncCursor,
    pub pages: usize,
    /// The event cap stopped the pass while the feed still had more.
    pub truncated: bool,
    /// A page after the first failed; `events` holds what came before it.
    pub degraded: Option<SyncError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatchUpOutcome {
    /// Incremental catch-up is not possible; reload the channel's full state.
    FullResyncRequired { reason: String },
    Fetched(CatchUpBatch),
}

pub struct CatchUpEngine {
    fetcher: Arc<dyn PageFetcher>,
    config: CatchUpConfig,
}

impl CatchUpEngine {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: CatchUpConfig) -> Self {
        Self { fetcher, config }
    }

    /// Where a new subscription resumes: the registry cursor when there is
    /// one, else the newest cursor the local store holds.
    pub fn starting_cursor(
        registry: &ChannelRegistry,
        store: &dyn LocalStore,
        channel: &ChannelId,
    ) -> Option<SyncCursor> {
        registry
            .cursor(channel)
            .or_else(|| store.newest_cursor(channel))
    }

    pub async fn run(
        &self,
        channel: &ChannelId,
        since: Option<SyncCursor>,
    ) -> SyncResult<CatchUpOutcome> {
        let Some(since) = since else {
            tracing::info!("CHANNEL {}: no sync cursor, full resync required", channel);
            return Ok(CatchUpOutcome::FullResyncRequired {
                reason: "no sync cursor available".to_string(),
            });
        };

        let mut batch = CatchUpBatch {
            events: Vec::new(),
            since,
            cursor: since,
            pages: 0,
            truncated: false,
            degraded: None,
        };

        loop {
            let remaining = self.config.max_events.saturating_sub(batch.events.len());
            if remaining == 0 {
                batch.truncated = true;
                tracing::warn!(
                    "CHANNEL {}: catch-up stopped at {} events, older gaps may remain",
                    channel,
                    self.config.max_events
                );
                break;
            }
            let limit = self.config.page_size.min(remaining);

            let page = match self.fetch_page(channel, batch.cursor, limit).await {
                Ok(page) => page,
                Err(err) if batch.pages == 0 => {
                    if err.is_transient() {
                        tracing::warn!(
                            "CHANNEL {}: catch-up failed before any page: {}",
                            channel,
                            err
                        );
                        return Ok(CatchUpOutcome::FullResyncRequired {
                            reason: err.to_string(),
                        });
                    }
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        "CHANNEL {}: catch-up degraded after {} page(s): {}",
                        channel,
                        batch.pages,
                        err
                    );
                    batch.degraded = Some(err);
                    break;
                }
            };

            batch.pages += 1;
            let EventPage {
                events: mut page_events,
                has_more,
            } = page;
            let full_page = page_events.len() >= limit;
            page_events.truncate(limit);
            if let Some(last) = page_events.last() {
                batch.cursor = batch.cursor.max(last.cursor);
            }
            let fetched = page_events.len();
            batch.events.extend(page_events);

            if !full_page || !has_more || fetched == 0 {
                break;
            }
        }

        tracing::info!(
            "CHANNEL {}: caught up {} event(s) in {} page(s), {} -> {}",
            channel,
            batch.events.len(),
            batch.pages,
            batch.since,
            batch.cursor
        );
        Ok(CatchUpOutcome::Fetched(batch))
    }

    async fn fetch_page(
        &self,
        channel: &ChannelId,
        since: SyncCursor,
        limit: usize,
    ) -> SyncResult<EventPage> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.retry_delay())
            .with_max_delay(self.config.retry_delay() * 16)
            .with_max_times(self.config.page_retries)
            .with_jitter();

        (|| self.fetcher.fetch_page(channel, since, limit))
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(|err: &SyncError| err.is_transient())
            .notify(|err: &SyncError, delay: Duration| {
                tracing::warn!(
                    "CHANNEL {}: page after {} failed, retrying in {:?}: {}",
                    channel,
                    since,
                    delay,
                    err
                );
            })
            .await
    }
}
