//! Applies events from both delivery paths to the local store exactly once.
//!
//! Decision order for an incoming event:
//!
//! 1. Already applied through the authoritative path, or through the fast path
//!    and arriving again on the fast path: duplicate, dropped.
//! 2. Applied through the fast path and now arriving authoritatively: the
//!    confirmed fields overwrite the fast copy. Field values are only ever
//!    taken from the authoritative path once it has spoken.
//! 3. Pairs with a pending local write that is still sending and arrived on the
//!    fast path: our own echo, dropped without marking it processed so the
//!    confirmation can still promote.
//! 4. Pairs with any other pending local write: promoted in place.
//! 5. Otherwise inserted (or updated, for edits and soft deletes).
//!
//! An event older than the row already stored for its entity never overwrites
//! it (steps 2 and 5); it is only marked processed. Catch-up pages can land
//! after live events they predate.
//!
//! Author metadata that is not known locally renders as a placeholder and is
//! patched in once the lookup cache resolves it.

use crate::dedup::ProcessedEvents;
use crate::ledger::PendingLedger;
use crate::lookup::{LookupCache, Resolved};
use crate::registry::ChannelRegistry;
use crate::store::LocalStore;
use std::sync::Arc;
use syncline_core::{
    config::DedupConfig,
    models::{
        AuthorDisplay, AuthorProfile, ChannelId, DeliveryPath, EventIdentity, EventKind,
        PendingOperation, PendingState, RawEvent, StoredEvent,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Duplicate,
    EchoSuppressed { local_id: String },
    Promoted { local_id: String },
    Inserted,
    Updated,
    /// Authoritative copy of an event first seen on the fast path.
    Reconciled,
    /// The store already holds a newer revision of the entity.
    Superseded,
}

impl Applied {
    /// Whether the local store was touched.
    pub fn changed_store(&self) -> bool {
        !matches!(
            self,
            Applied::Duplicate | Applied::EchoSuppressed { .. } | Applied::Superseded
        )
    }
}

pub struct DeliveryCoordinator {
    channel: ChannelId,
    registry: Arc<ChannelRegistry>,
    store: Arc<dyn LocalStore>,
    authors: LookupCache<String, AuthorProfile>,
    processed: ProcessedEvents,
    ledger: PendingLedger,
}

impl DeliveryCoordinator {
    pub fn new(
        channel: ChannelId,
        registry: Arc<ChannelRegistry>,
        store: Arc<dyn LocalStore>,
        authors: LookupCache<String, AuthorProfile>,
        dedup: &DedupConfig,
    ) -> Self {
        Self {
            channel,
            registry,
            store,
            authors,
            processed: ProcessedEvents::from_config(dedup),
            ledger: PendingLedger::new(),
        }
    }

    pub fn apply(&mut self, path: DeliveryPath, event: RawEvent) -> Applied {
        let identity = event.identity();

        match self.processed.lookup(&identity) {
            Some(DeliveryPath::Authoritative) => return self.duplicate(&identity, path),
            Some(DeliveryPath::Fast) if path == DeliveryPath::Fast => {
                return self.duplicate(&identity, path)
            }
            Some(DeliveryPath::Fast) => {
                if self.is_superseded(&event) {
                    return self.superseded(identity, path, &event);
                }
                let stored = StoredEvent::from_raw(&event, self.author_display(&event));
                if !self.store.update(&self.channel, stored.clone()) {
                    self.store.insert(&self.channel, stored);
                }
                tracing::debug!("CHANNEL {}: {} confirmed", self.channel, identity);
                self.finish(identity, path, &event);
                return Applied::Reconciled;
            }
            None => {}
        }

        if let Some(pending) = self.ledger.find_for(&event) {
            let local_id = pending.local_id.clone();
            if path == DeliveryPath::Fast && pending.state == PendingState::Sending {
                tracing::debug!(
                    "CHANNEL {}: dropping fast echo of own write {}",
                    self.channel,
                    local_id
                );
                return Applied::EchoSuppressed { local_id };
            }

            self.ledger.remove(&local_id);
            let stored = StoredEvent::from_raw(&event, self.author_display(&event));
            self.store.promote(&self.channel, &local_id, stored);
            tracing::debug!(
                "CHANNEL {}: promoted {} as {}",
                self.channel,
                local_id,
                event.entity_id
            );
            self.finish(identity, path, &event);
            return Applied::Promoted { local_id };
        }

        if self.is_superseded(&event) {
            return self.superseded(identity, path, &event);
        }
        let stored = StoredEvent::from_raw(&event, self.author_display(&event));
        let applied = match event.kind {
            EventKind::Insert => {
                self.store.insert(&self.channel, stored);
                Applied::Inserted
            }
            EventKind::Update => {
                if self.store.update(&self.channel, stored.clone()) {
                    Applied::Updated
                } else {
                    // Edit for an entity we never saw; keep it rather than lose it
                    self.store.insert(&self.channel, stored);
                    Applied::Inserted
                }
            }
        };
        tracing::debug!("CHANNEL {}: {} via {} path", self.channel, identity, path);
        self.finish(identity, path, &event);
        applied
    }

    fn duplicate(&self, identity: &EventIdentity, path: DeliveryPath) -> Applied {
        tracing::debug!(
            "CHANNEL {}: duplicate {} via {} path",
            self.channel,
            identity,
            path
        );
        Applied::Duplicate
    }

    fn is_superseded(&self, event: &RawEvent) -> bool {
        self.store
            .entity_cursor(&self.channel, &event.entity_id)
            .is_some_and(|stored| stored > event.cursor)
    }

    fn superseded(
        &mut self,
        identity: EventIdentity,
        path: DeliveryPath,
        event: &RawEvent,
    ) -> Applied {
        tracing::debug!(
            "CHANNEL {}: {} is older than the stored {}, skipped",
            self.channel,
            identity,
            event.entity_id
        );
        self.finish(identity, path, event);
        Applied::Superseded
    }

    fn finish(&mut self, identity: EventIdentity, path: DeliveryPath, event: &RawEvent) {
        self.processed.mark(identity, path);
        // Only the authoritative path's ordering is persisted
        if path == DeliveryPath::Authoritative {
            self.registry.advance_cursor(&self.channel, event.cursor);
        }
    }

    fn author_display(&self, event: &RawEvent) -> AuthorDisplay {
        let Some(author_id) = event.author_id.clone() else {
            return AuthorDisplay::None;
        };
        if let Some(profile) = self.store.known_author(&author_id) {
            return AuthorDisplay::Resolved(profile);
        }
        match self.authors.peek(&author_id) {
            Some(Resolved::Found(profile)) => return AuthorDisplay::Resolved(profile),
            Some(Resolved::NotFound) => return AuthorDisplay::Unknown,
            Some(Resolved::Unavailable) | None => {}
        }

        let authors = self.authors.clone();
        let store = Arc::clone(&self.store);
        let channel = self.channel.clone();
        let entity_id = event.entity_id.clone();
        tokio::spawn(async move {
            let display = match authors.resolve(author_id).await {
                Resolved::Found(profile) => AuthorDisplay::Resolved(profile),
                Resolved::NotFound => AuthorDisplay::Unknown,
                Resolved::Unavailable => AuthorDisplay::Unavailable,
            };
            store.patch_author(&channel, &entity_id, display);
        });
        AuthorDisplay::Placeholder
    }

    pub fn record_pending(&mut self, operation: PendingOperation) {
        tracing::debug!(
            "CHANNEL {}: pending write {}",
            self.channel,
            operation.local_id
        );
        self.ledger.record(operation);
    }

    pub fn mark_sent(&mut self, local_id: &str) -> bool {
        self.ledger.set_state(local_id, PendingState::Sent)
    }

    pub fn mark_failed(&mut self, local_id: &str) -> bool {
        self.ledger.set_state(local_id, PendingState::Error)
    }

    pub fn discard_pending(&mut self, local_id: &str) -> Option<PendingOperation> {
        self.ledger.remove(local_id)
    }

    pub fn pending(&self) -> Vec<PendingOperation> {
        self.ledger.iter().cloned().collect()
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }
}
