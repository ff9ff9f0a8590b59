//! In-memory authoritative feed backing the relay.
//!
//! Every write appends a change event with a fresh cursor. Cursors are handed
//! out from one process-wide counter, so each channel's log is strictly
//! increasing and a page "since" any cursor is a simple filter.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use syncline_core::{
    models::{AuthorProfile, ChannelId, EventDraft, EventPage, RawEvent, SyncCursor},
    protocol::ErrorCode,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("Access to channel {0} is denied")]
    ChannelDenied(ChannelId),

    #[error("Entity {entity_id} not found in channel {channel}")]
    EntityNotFound { channel: ChannelId, entity_id: String },

    #[error("Entity {0} is deleted")]
    EntityDeleted(String),
}

impl FeedError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FeedError::ChannelDenied(_) => ErrorCode::PermissionDenied,
            FeedError::EntityNotFound { .. } => ErrorCode::NotFound,
            FeedError::EntityDeleted(_) => ErrorCode::InvalidRequest,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelLog {
    changes: Vec<RawEvent>,
    /// Latest state and revision number per entity.
    latest: HashMap<String, (RawEvent, u32)>,
}

pub struct FeedStore {
    channels: DashMap<ChannelId, ChannelLog>,
    next_cursor: AtomicI64,
    profiles: DashMap<String, AuthorProfile>,
    denied: HashSet<ChannelId>,
}

impl FeedStore {
    pub fn new(denied: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            channels: DashMap::new(),
            next_cursor: AtomicI64::new(1),
            profiles: DashMap::new(),
            denied: denied.into_iter().collect(),
        }
    }

    pub fn check_access(&self, channel: &ChannelId) -> Result<(), FeedError> {
        if self.denied.contains(channel) {
            return Err(FeedError::ChannelDenied(channel.clone()));
        }
        Ok(())
    }

    pub fn register_profile(&self, profile: AuthorProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn publish(&self, channel: &ChannelId, draft: EventDraft) -> Result<RawEvent, FeedError> {
        self.check_access(channel)?;
        let mut log = self.channels.entry(channel.clone()).or_default();
        let cursor = self.take_cursor();
        let event = RawEvent::insert(Uuid::new_v4().to_string(), cursor, draft.fields)
            .with_author(draft.author_id)
            .with_local_id(draft.local_id)
            .with_match_key(draft.match_key);

        log.latest
            .insert(event.entity_id.clone(), (event.clone(), 1));
        log.changes.push(event.clone());
        tracing::debug!("Channel {}: published {} at {}", channel, event.entity_id, cursor);
        Ok(event)
    }

    pub fn edit(
        &self,
        channel: &ChannelId,
        entity_id: &str,
        fields: serde_json::Value,
    ) -> Result<RawEvent, FeedError> {
        self.revise(channel, entity_id, |event| {
            if event.is_deleted() {
                return Err(FeedError::EntityDeleted(event.entity_id.clone()));
            }
            event.fields = fields;
            Ok(())
        })
    }

    /// Soft delete. Deleting twice is not an error; it yields another revision.
    pub fn delete(&self, channel: &ChannelId, entity_id: &str) -> Result<RawEvent, FeedError> {
        self.revise(channel, entity_id, |event| {
            event.deleted_at = Some(Utc::now());
            Ok(())
        })
    }

    fn revise<F>(&self, channel: &ChannelId, entity_id: &str, change: F) -> Result<RawEvent, FeedError>
    where
        F: FnOnce(&mut RawEvent) -> Result<(), FeedError>,
    {
        self.check_access(channel)?;
        let not_found = || FeedError::EntityNotFound {
            channel: channel.clone(),
            entity_id: entity_id.to_string(),
        };
        let mut log = self.channels.get_mut(channel).ok_or_else(not_found)?;
        let (current, revision) = log.latest.get(entity_id).cloned().ok_or_else(not_found)?;

        let mut next = current;
        change(&mut next)?;
        let revision = revision + 1;
        let cursor = self.take_cursor();
        let mut event = RawEvent::update(entity_id, cursor, format!("v{}", revision), next.fields);
        event.author_id = next.author_id;
        event.deleted_at = next.deleted_at;

        log.latest
            .insert(entity_id.to_string(), (event.clone(), revision));
        log.changes.push(event.clone());
        tracing::debug!("Channel {}: {} revised to v{}", channel, entity_id, revision);
        Ok(event)
    }

    /// Changes strictly after `since`, oldest first.
    pub fn since(
        &self,
        channel: &ChannelId,
        since: SyncCursor,
        limit: usize,
    ) -> Result<EventPage, FeedError> {
        self.check_access(channel)?;
        let Some(log) = self.channels.get(channel) else {
            return Ok(EventPage::default());
        };
        let start = log.changes.partition_point(|event| event.cursor <= since);
        let tail = &log.changes[start..];
        let events: Vec<RawEvent> = tail.iter().take(limit).cloned().collect();
        Ok(EventPage {
            has_more: tail.len() > events.len(),
            events,
        })
    }

    /// Known profiles for `keys`; unknown keys are left out.
    pub fn lookup(&self, keys: &[String]) -> Vec<AuthorProfile> {
        keys.iter()
            .filter_map(|key| self.profiles.get(key).map(|profile| profile.value().clone()))
            .collect()
    }

    fn take_cursor(&self) -> SyncCursor {
        SyncCursor::new(self.next_cursor.fetch_add(1, Ordering::AcqRel))
    }
}

impl Default for FeedStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
