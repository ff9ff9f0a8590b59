use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

use crate::fingerprint;

/// One logical realtime stream, e.g. a single chat room's feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Totally ordered sync position. Feeds hand out either a sequence number or
/// epoch milliseconds; both fit and both compare numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(i64);

impl SyncCursor {
    pub const fn new(position: i64) -> Self {
        Self(position)
    }

    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_millis())
    }

    pub fn position(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Insert,
    Update,
}

/// Which delivery path an event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryPath {
    /// Low-latency broadcast, best effort.
    Fast,
    /// Durable changefeed and catch-up pages; the source of truth.
    Authoritative,
}

/// Stable de-duplication key: `<kind>:<entity_id>[:<version>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventIdentity(String);

impl EventIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event payload as delivered by either path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub entity_id: String,
    pub kind: EventKind,
    pub cursor: SyncCursor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    /// Caller-assigned id echoed back for locally originated writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_key: Option<String>,
    #[serde(default)]
    pub fields: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RawEvent {
    pub fn insert(entity_id: impl Into<String>, cursor: SyncCursor, fields: serde_json::Value) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind: EventKind::Insert,
            cursor,
            version: None,
            author_id: None,
            local_id: None,
            match_key: None,
            fields,
            deleted_at: None,
        }
    }

    pub fn update(
        entity_id: impl Into<String>,
        cursor: SyncCursor,
        version: impl Into<String>,
        fields: serde_json::Value,
    ) -> Self {
        Self {
            kind: EventKind::Update,
            version: Some(version.into()),
            ..Self::insert(entity_id, cursor, fields)
        }
    }

    pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = Some(author_id.into());
        self
    }

    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    pub fn with_match_key(mut self, match_key: impl Into<String>) -> Self {
        self.match_key = Some(match_key.into());
        self
    }

    pub fn identity(&self) -> EventIdentity {
        match self.kind {
            EventKind::Insert => EventIdentity(format!("{}:{}", self.kind, self.entity_id)),
            EventKind::Update => {
                let version = self
                    .version
                    .clone()
                    .unwrap_or_else(|| self.cursor.to_string());
                EventIdentity(format!("{}:{}:{}", self.kind, self.entity_id, version))
            }
        }
    }

    /// The key used to pair this event with a pending local write. An explicit
    /// key wins; otherwise it is derived from author and content.
    pub fn effective_match_key(&self) -> Option<String> {
        if let Some(key) = &self.match_key {
            return Some(key.clone());
        }
        let author = self.author_id.as_deref()?;
        let content = self.fields.get("content")?;
        Some(fingerprint::match_key(author, content))
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthorProfile {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl AuthorProfile {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }
}

/// Display metadata attached to a stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthorDisplay {
    /// No author on the event.
    None,
    /// Lookup in flight; render a neutral placeholder.
    Placeholder,
    Resolved(AuthorProfile),
    /// The subject no longer exists.
    Unknown,
    /// Lookup failed transiently; a later lookup may succeed.
    Unavailable,
}

impl AuthorDisplay {
    pub fn is_settled(&self) -> bool {
        matches!(self, AuthorDisplay::Resolved(_) | AuthorDisplay::Unknown)
    }
}

/// Normalized form handed to the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub entity_id: String,
    pub cursor: SyncCursor,
    pub version: Option<String>,
    pub author_id: Option<String>,
    pub author: AuthorDisplay,
    pub fields: serde_json::Value,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredEvent {
    pub fn from_raw(event: &RawEvent, author: AuthorDisplay) -> Self {
        Self {
            entity_id: event.entity_id.clone(),
            cursor: event.cursor,
            version: event.version.clone(),
            author_id: event.author_id.clone(),
            author,
            fields: event.fields.clone(),
            deleted_at: event.deleted_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PendingState {
    Sending,
    Sent,
    Error,
}

/// Ledger entry for an optimistic write that the authoritative path has not yet confirmed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOperation {
    pub local_id: String,
    pub match_key: String,
    pub created_at: DateTime<Utc>,
    pub state: PendingState,
}

impl PendingOperation {
    pub fn new(local_id: impl Into<String>, match_key: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            match_key: match_key.into(),
            created_at: Utc::now(),
            state: PendingState::Sending,
        }
    }
}

/// One page returned by a catch-up fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventPage {
    pub events: Vec<RawEvent>,
    pub has_more: bool,
}

/// A write submitted to the feed; the feed assigns entity id and cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventDraft {
    pub local_id: String,
    pub match_key: String,
    pub author_id: String,
    pub fields: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_identity_formats() {
        let insert = RawEvent::insert("m1", SyncCursor::new(10), json!({"content": "hi"}));
        assert_eq!(insert.identity().as_str(), "insert:m1");

        let update = RawEvent::update("m1", SyncCursor::new(11), "v2", json!({"content": "hey"}));
        assert_eq!(update.identity().as_str(), "update:m1:v2");

        let mut unversioned = update.clone();
        unversioned.version = None;
        assert_eq!(unversioned.identity().as_str(), "update:m1:11");
    }

    #[test]
    fn test_cursor_ordering() {
        assert!(SyncCursor::new(100) < SyncCursor::new(101));
        let earlier = SyncCursor::from_timestamp(Utc::now() - chrono::Duration::seconds(5));
        let later = SyncCursor::from_timestamp(Utc::now());
        assert!(earlier < later);
    }

    #[test]
    fn test_effective_match_key() {
        let explicit = RawEvent::insert("m1", SyncCursor::new(1), json!({"content": "hello"}))
            .with_match_key("hello@userA@t0");
        assert_eq!(explicit.effective_match_key().as_deref(), Some("hello@userA@t0"));

        let derived = RawEvent::insert("m2", SyncCursor::new(2), json!({"content": "hello"}))
            .with_author("userA");
        assert_eq!(
            derived.effective_match_key(),
            Some(fingerprint::match_key("userA", &json!("hello")))
        );

        let anonymous = RawEvent::insert("m3", SyncCursor::new(3), json!({"content": "hello"}));
        assert_eq!(anonymous.effective_match_key(), None);
    }

    #[test]
    fn test_raw_event_wire_shape() {
        let event = RawEvent::insert("m1", SyncCursor::new(7), json!({"content": "x"}))
            .with_author("u1");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "insert");
        assert_eq!(value["cursor"], 7);
        assert!(value.get("local_id").is_none());

        let parsed: RawEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ChannelStatus::Reconnecting.to_string(), "reconnecting");
        let parsed: ChannelStatus = "connected".parse().unwrap();
        assert_eq!(parsed, ChannelStatus::Connected);
    }
}
