use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use syncline_core::models::{AuthorDisplay, AuthorProfile, ChannelId, StoredEvent, SyncCursor};

/// The caller-owned view the coordinator writes into.
///
/// Implementations are expected to be cheap and non-blocking; the coordinator
/// calls them while holding its per-channel lock.
pub trait LocalStore: Send + Sync {
    /// Add an event from a remote party. One row per entity id.
    fn insert(&self, channel: &ChannelId, event: StoredEvent);

    /// Replace the optimistic entry `local_id` with its confirmed copy.
    fn promote(&self, channel: &ChannelId, local_id: &str, event: StoredEvent);

    /// Apply an edit or soft delete. Returns false when the entity is unknown.
    fn update(&self, channel: &ChannelId, event: StoredEvent) -> bool;

    fn patch_author(&self, channel: &ChannelId, entity_id: &str, author: AuthorDisplay);

    /// Author metadata already available locally, if any.
    fn known_author(&self, author_id: &str) -> Option<AuthorProfile>;

    /// Cursor of the confirmed row held for `entity_id`.
    fn entity_cursor(&self, channel: &ChannelId, entity_id: &str) -> Option<SyncCursor>;

    /// Newest confirmed cursor held for the channel.
    fn newest_cursor(&self, channel: &ChannelId) -> Option<SyncCursor>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticEntry {
    pub local_id: String,
    pub fields: serde_json::Value,
    pub author: AuthorDisplay,
}

#[derive(Debug, Default)]
struct ChannelData {
    confirmed: HashMap<String, StoredEvent>,
    optimistic: HashMap<String, OptimisticEntry>,
}

/// In-memory `LocalStore`, suitable for tests and small embedded views.
#[derive(Debug, Default)]
pub struct MemoryStore {
    channels: Mutex<HashMap<ChannelId, ChannelData>>,
    authors: Mutex<HashMap<String, AuthorProfile>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelData>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn authors(&self) -> MutexGuard<'_, HashMap<String, AuthorProfile>> {
        self.authors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Show a local write before the feed has confirmed it.
    pub fn add_optimistic(
        &self,
        channel: &ChannelId,
        local_id: impl Into<String>,
        fields: serde_json::Value,
        author: AuthorDisplay,
    ) {
        let local_id = local_id.into();
        self.channels()
            .entry(channel.clone())
            .or_default()
            .optimistic
            .insert(
                local_id.clone(),
                OptimisticEntry {
                    local_id,
                    fields,
                    author,
                },
            );
    }

    pub fn remember_author(&self, profile: AuthorProfile) {
        self.authors().insert(profile.id.clone(), profile);
    }

    /// Confirmed events ordered by cursor.
    pub fn events(&self, channel: &ChannelId) -> Vec<StoredEvent> {
        let channels = self.channels();
        let mut events: Vec<StoredEvent> = channels
            .get(channel)
            .map(|data| data.confirmed.values().cloned().collect())
            .unwrap_or_default();
        events.sort_by(|a, b| a.cursor.cmp(&b.cursor).then_with(|| a.entity_id.cmp(&b.entity_id)));
        events
    }

    pub fn optimistic(&self, channel: &ChannelId) -> Vec<OptimisticEntry> {
        self.channels()
            .get(channel)
            .map(|data| data.optimistic.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, channel: &ChannelId, entity_id: &str) -> Option<StoredEvent> {
        self.channels()
            .get(channel)
            .and_then(|data| data.confirmed.get(entity_id).cloned())
    }

    pub fn len(&self, channel: &ChannelId) -> usize {
        self.channels()
            .get(channel)
            .map(|data| data.confirmed.len())
            .unwrap_or(0)
    }
}

fn keep_settled_author(incoming: &mut StoredEvent, previous: &AuthorDisplay) {
    if !incoming.author.is_settled() && previous.is_settled() {
        incoming.author = previous.clone();
    }
}

impl LocalStore for MemoryStore {
    fn insert(&self, channel: &ChannelId, mut event: StoredEvent) {
        let mut channels = self.channels();
        let data = channels.entry(channel.clone()).or_default();
        if let Some(existing) = data.confirmed.get(&event.entity_id) {
            keep_settled_author(&mut event, &existing.author);
        }
        data.confirmed.insert(event.entity_id.clone(), event);
    }

    fn promote(&self, channel: &ChannelId, local_id: &str, mut event: StoredEvent) {
        let mut channels = self.channels();
        let data = channels.entry(channel.clone()).or_default();
        if let Some(placeholder) = data.optimistic.remove(local_id) {
            keep_settled_author(&mut event, &placeholder.author);
        }
        if let Some(existing) = data.confirmed.get(&event.entity_id) {
            keep_settled_author(&mut event, &existing.author);
        }
        data.confirmed.insert(event.entity_id.clone(), event);
    }

    fn update(&self, channel: &ChannelId, mut event: StoredEvent) -> bool {
        let mut channels = self.channels();
        let Some(existing) = channels
            .get_mut(channel)
            .and_then(|data| data.confirmed.get_mut(&event.entity_id))
        else {
            return false;
        };
        keep_settled_author(&mut event, &existing.author);
        *existing = event;
        true
    }

    fn patch_author(&self, channel: &ChannelId, entity_id: &str, author: AuthorDisplay) {
        if let AuthorDisplay::Resolved(profile) = &author {
            self.remember_author(profile.clone());
        }
        let mut channels = self.channels();
        if let Some(event) = channels
            .get_mut(channel)
            .and_then(|data| data.confirmed.get_mut(entity_id))
        {
            if author.is_settled() || !event.author.is_settled() {
                event.author = author;
            }
        }
    }

    fn known_author(&self, author_id: &str) -> Option<AuthorProfile> {
        self.authors().get(author_id).cloned()
    }

    fn entity_cursor(&self, channel: &ChannelId, entity_id: &str) -> Option<SyncCursor> {
        self.channels()
            .get(channel)
            .and_then(|data| data.confirmed.get(entity_id))
            .map(|event| event.cursor)
    }

    fn newest_cursor(&self, channel: &ChannelId) -> Option<SyncCursor> {
        self.channels()
            .get(channel)
            .and_then(|data| data.confirmed.values().map(|event| event.cursor).max())
    }
}
