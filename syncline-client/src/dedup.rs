//! Bounded record of event identities that have already been applied.
//!
//! Entries expire after a TTL and the oldest are evicted past capacity. The
//! order queue may hold stale ("ghost") keys for identities that were marked
//! again later; those are recognised by sequence number and skipped.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use syncline_core::config::DedupConfig;
use syncline_core::models::{DeliveryPath, EventIdentity};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Mark {
    path: DeliveryPath,
    seq: u64,
}

pub struct ProcessedEvents {
    entries: HashMap<EventIdentity, Mark>,
    order: VecDeque<(EventIdentity, Instant, u64)>,
    next_seq: u64,
    capacity: usize,
    ttl: Duration,
}

impl ProcessedEvents {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.capacity, config.ttl())
    }

    /// The strongest path this identity has been applied through, if any.
    pub fn lookup(&mut self, identity: &EventIdentity) -> Option<DeliveryPath> {
        self.prune(Instant::now());
        self.entries.get(identity).map(|mark| mark.path)
    }

    /// Record an application. A fast mark is upgraded by an authoritative one,
    /// never the reverse.
    pub fn mark(&mut self, identity: EventIdentity, path: DeliveryPath) {
        let now = Instant::now();
        self.prune(now);

        let seq = self.next_seq;
        self.next_seq += 1;
        let mark = self.entries.entry(identity.clone()).or_insert(Mark { path, seq });
        if path == DeliveryPath::Authoritative {
            mark.path = DeliveryPath::Authoritative;
        }
        mark.seq = seq;
        self.order.push_back((identity, now, seq));

        while self.entries.len() > self.capacity {
            let Some((key, _, seq)) = self.order.pop_front() else {
                break;
            };
            self.forget_if_current(&key, seq);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        while let Some((_, at, _)) = self.order.front() {
            if now.duration_since(*at) < self.ttl {
                break;
            }
            if let Some((key, _, seq)) = self.order.pop_front() {
                self.forget_if_current(&key, seq);
            }
        }
    }

    fn forget_if_current(&mut self, key: &EventIdentity, seq: u64) {
        if self.entries.get(key).is_some_and(|mark| mark.seq == seq) {
            self.entries.remove(key);
        }
    }
}
