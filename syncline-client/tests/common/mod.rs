#![allow(dead_code)]

use futures_util::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use syncline_client::{
    BulkLookup, ChannelSession, ChannelTransport, Inbound, InboundSender, MemoryStore,
    NetworkMonitor, PageFetcher, SyncContext, SyncEvent,
};
use syncline_core::{
    config::{ReconnectConfig, SyncConfig},
    errors::SyncError,
    models::{AuthorProfile, ChannelId, DeliveryPath, EventPage, RawEvent, SyncCursor},
    SyncResult,
};
use tokio::sync::Semaphore;

/// Transport and feed double. `open` consumes scripted results and succeeds
/// once the script runs out; pages are served from an in-memory event log.
#[derive(Default)]
pub struct ScriptedTransport {
    open_script: Mutex<VecDeque<SyncResult<()>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    sinks: Mutex<HashMap<ChannelId, InboundSender>>,
    log: Mutex<Vec<RawEvent>>,
    page_calls: AtomicUsize,
    page_gate: Mutex<Option<Arc<Semaphore>>>,
    broadcasts: Mutex<Vec<RawEvent>>,
    fail_broadcasts: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_opens(&self, count: usize, error: SyncError) {
        let mut script = self.open_script.lock().unwrap();
        for _ in 0..count {
            script.push_back(Err(error.clone()));
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn append(&self, event: RawEvent) {
        self.log.lock().unwrap().push(event);
    }

    /// Hold every page fetch until [`Self::release_pages`].
    pub fn hold_pages(&self) {
        *self.page_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_pages(&self) {
        if let Some(gate) = self.page_gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn set_broadcast_failing(&self, failing: bool) {
        self.fail_broadcasts.store(failing, Ordering::SeqCst);
    }

    pub fn broadcasts(&self) -> Vec<RawEvent> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn is_attached(&self, channel: &ChannelId) -> bool {
        self.sinks.lock().unwrap().contains_key(channel)
    }

    /// Push something down a channel's sink as the network would.
    pub fn push(&self, channel: &ChannelId, message: Inbound) -> bool {
        match self.sinks.lock().unwrap().get(channel) {
            Some(sink) => sink.send(message).is_ok(),
            None => false,
        }
    }

    pub fn push_event(&self, channel: &ChannelId, path: DeliveryPath, event: RawEvent) -> bool {
        self.push(channel, Inbound::Event { path, event })
    }

    pub fn drop_connection(&self, channel: &ChannelId) -> bool {
        self.push(
            channel,
            Inbound::Closed {
                reason: "connection reset".to_string(),
            },
        )
    }
}

impl ChannelTransport for ScriptedTransport {
    fn open<'a>(&'a self, _channel: &'a ChannelId) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.open_script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        })
    }

    fn close<'a>(&'a self, _channel: &'a ChannelId) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn attach(&self, channel: &ChannelId, sink: InboundSender) {
        self.sinks.lock().unwrap().insert(channel.clone(), sink);
    }

    fn detach(&self, channel: &ChannelId) {
        self.sinks.lock().unwrap().remove(channel);
    }

    fn send_broadcast<'a>(
        &'a self,
        channel: &'a ChannelId,
        event: RawEvent,
    ) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            if self.fail_broadcasts.load(Ordering::SeqCst) {
                return Err(SyncError::Network("broadcast refused".into()));
            }
            self.broadcasts.lock().unwrap().push(event.clone());
            self.push_event(channel, DeliveryPath::Fast, event);
            Ok(())
        })
    }
}

impl PageFetcher for ScriptedTransport {
    fn fetch_page<'a>(
        &'a self,
        _channel: &'a ChannelId,
        since: SyncCursor,
        limit: usize,
    ) -> BoxFuture<'a, SyncResult<EventPage>> {
        Box::pin(async move {
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.page_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|_| SyncError::ConnectionClosed)?;
            }

            let log = self.log.lock().unwrap();
            let mut after: Vec<RawEvent> = log
                .iter()
                .filter(|event| event.cursor > since)
                .cloned()
                .collect();
            after.sort_by_key(|event| event.cursor);
            let has_more = after.len() > limit;
            after.truncate(limit);
            Ok(EventPage {
                events: after,
                has_more,
            })
        })
    }
}

/// Author directory that counts its batch requests.
#[derive(Default)]
pub struct Directory {
    profiles: Mutex<HashMap<String, AuthorProfile>>,
    pub batches: AtomicUsize,
}

impl Directory {
    pub fn with_profiles(ids: &[&str]) -> Arc<Self> {
        let directory = Self::default();
        {
            let mut profiles = directory.profiles.lock().unwrap();
            for id in ids {
                profiles.insert(id.to_string(), AuthorProfile::new(*id, id.to_uppercase()));
            }
        }
        Arc::new(directory)
    }
}

impl BulkLookup<String, AuthorProfile> for Directory {
    fn lookup(&self, keys: Vec<String>) -> BoxFuture<'_, SyncResult<HashMap<String, AuthorProfile>>> {
        Box::pin(async move {
            self.batches.fetch_add(1, Ordering::SeqCst);
            let profiles = self.profiles.lock().unwrap();
            Ok(keys
                .into_iter()
                .filter_map(|key| profiles.get(&key).cloned().map(|profile| (key, profile)))
                .collect())
        })
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        reconnect: ReconnectConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: 5,
            connect_timeout_ms: 15_000,
        },
        ..SyncConfig::default()
    }
}

pub struct Harness {
    pub ctx: Arc<SyncContext>,
    pub network: Arc<NetworkMonitor>,
    pub directory: Arc<Directory>,
}

impl Harness {
    pub fn new() -> Self {
        let network = Arc::new(NetworkMonitor::new(true));
        let directory = Directory::with_profiles(&["userA", "userB"]);
        let ctx = SyncContext::new(test_config(), network.clone(), directory.clone());
        Self {
            ctx,
            network,
            directory,
        }
    }

    pub async fn subscribe(
        &self,
        channel: &str,
        transport: &Arc<ScriptedTransport>,
        store: &Arc<MemoryStore>,
    ) -> SyncResult<ChannelSession> {
        ChannelSession::subscribe(
            &self.ctx,
            ChannelId::from(channel),
            transport.clone(),
            transport.clone(),
            store.clone(),
        )
        .await
    }
}

/// Let spawned tasks run; advances the paused clock by `by`.
pub async fn settle(by: Duration) {
    tokio::time::sleep(by).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Capture every sync event; drain with `ctx.events().process_events()`.
pub fn record_events(ctx: &SyncContext) -> Arc<Mutex<Vec<SyncEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    ctx.events()
        .register_callback(move |event| sink.lock().unwrap().push(event))
        .unwrap();
    seen
}
