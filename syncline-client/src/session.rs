use crate::catch_up::{CatchUpEngine, CatchUpOutcome};
use crate::coordinator::{Applied, DeliveryCoordinator};
use crate::events::{EventDispatcher, SyncEvent};
use crate::lookup::{BulkLookup, LookupCache};
use crate::network::NetworkMonitor;
use crate::registry::{ChannelRegistry, ChannelState};
use crate::scheduler::{ReconnectOutcome, ReconnectScheduler, Reconnector};
use crate::store::LocalStore;
use crate::transport::{ChannelTransport, Inbound, InboundReceiver, PageFetcher};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use syncline_core::{
    config::SyncConfig,
    errors::SyncError,
    models::{
        AuthorProfile, ChannelId, ChannelStatus, DeliveryPath, PendingOperation, RawEvent,
        SyncCursor,
    },
    SyncResult,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Services shared by every channel session in a process.
pub struct SyncContext {
    config: SyncConfig,
    registry: Arc<ChannelRegistry>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventDispatcher>,
    scheduler: Arc<ReconnectScheduler>,
    authors: LookupCache<String, AuthorProfile>,
    network_watch: JoinHandle<()>,
}

impl SyncContext {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: SyncConfig,
        network: Arc<NetworkMonitor>,
        author_source: Arc<dyn BulkLookup<String, AuthorProfile>>,
    ) -> Arc<Self> {
        let registry = Arc::new(ChannelRegistry::new());
        let events = Arc::new(EventDispatcher::new());
        let scheduler = Arc::new(ReconnectScheduler::new(
            registry.clone(),
            network.clone(),
            events.clone(),
            config.reconnect.clone(),
        ));
        let network_watch = scheduler.spawn_network_watch();
        let authors = LookupCache::from_config(author_source, &config.lookup);

        Arc::new(Self {
            config,
            registry,
            network,
            events,
            scheduler,
            authors,
            network_watch,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn scheduler(&self) -> &Arc<ReconnectScheduler> {
        &self.scheduler
    }

    pub fn authors(&self) -> &LookupCache<String, AuthorProfile> {
        &self.authors
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        self.network_watch.abort();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatchUpReport {
    Merged {
        fetched: usize,
        applied: usize,
        truncated: bool,
        degraded: Option<String>,
    },
    FullResyncRequired {
        reason: String,
    },
    /// The connection the pass started under is gone; nothing was applied.
    Discarded,
}

struct SessionInner {
    channel: ChannelId,
    ctx: Arc<SyncContext>,
    transport: Arc<dyn ChannelTransport>,
    coordinator: Mutex<DeliveryCoordinator>,
    catch_up: CatchUpEngine,
    pump: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl SessionInner {
    fn coordinator(&self) -> MutexGuard<'_, DeliveryCoordinator> {
        self.coordinator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, path: DeliveryPath, event: RawEvent) -> Applied {
        self.coordinator().apply(path, event)
    }

    async fn run_catch_up(&self) -> SyncResult<CatchUpReport> {
        let channel = &self.channel;
        let registry = &self.ctx.registry;
        let state = registry
            .state(channel)
            .ok_or_else(|| SyncError::ChannelNotRegistered(channel.clone()))?;
        if state.status != ChannelStatus::Connected {
            return Ok(CatchUpReport::Discarded);
        }
        let epoch = state.epoch;

        // Live events cannot move this past the gap until the pass has merged
        let since = state.last_sync_cursor;
        if let Some(since) = since {
            self.ctx.events.emit(SyncEvent::CatchUpStarted {
                channel: channel.clone(),
                since,
            });
        }
        let outcome = self.catch_up.run(channel, since).await;

        let still_current = registry
            .state(channel)
            .is_some_and(|now| now.status == ChannelStatus::Connected && now.epoch == epoch);
        if !still_current {
            tracing::info!("CHANNEL {}: discarding catch-up from a stale connection", channel);
            return Ok(CatchUpReport::Discarded);
        }

        match outcome {
            Err(err) => {
                self.ctx.events.emit(SyncEvent::SyncError {
                    channel: channel.clone(),
                    message: err.to_string(),
                });
                Err(err)
            }
            Ok(CatchUpOutcome::FullResyncRequired { reason }) => {
                // The caller reloads the channel; live events take it from here
                registry.finish_catch_up(channel, epoch);
                self.ctx.events.emit(SyncEvent::FullResyncRequired {
                    channel: channel.clone(),
                    reason: reason.clone(),
                });
                Ok(CatchUpReport::FullResyncRequired { reason })
            }
            Ok(CatchUpOutcome::Fetched(batch)) => {
                let fetched = batch.events.len();
                let applied = {
                    let mut coordinator = self.coordinator();
                    batch
                        .events
                        .into_iter()
                        .map(|event| coordinator.apply(DeliveryPath::Authoritative, event))
                        .filter(Applied::changed_store)
                        .count()
                };
                registry.record_catch_up(channel, epoch, batch.cursor);
                if batch.degraded.is_none() && !batch.truncated {
                    registry.finish_catch_up(channel, epoch);
                }

                let degraded = batch.degraded.map(|err| err.to_string());
                match &degraded {
                    Some(reason) => self.ctx.events.emit(SyncEvent::CatchUpDegraded {
                        channel: channel.clone(),
                        applied,
                        reason: reason.clone(),
                    }),
                    None => self.ctx.events.emit(SyncEvent::CatchUpCompleted {
                        channel: channel.clone(),
                        applied,
                        truncated: batch.truncated,
                    }),
                }
                Ok(CatchUpReport::Merged {
                    fetched,
                    applied,
                    truncated: batch.truncated,
                    degraded,
                })
            }
        }
    }

    /// Synchronous part of unsubscribing. Runs at most once.
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ctx.scheduler.unregister(&self.channel);
        self.ctx.registry.unregister(&self.channel);
        self.transport.detach(&self.channel);
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            pump.abort();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Bridges the scheduler back to a session without keeping it alive.
struct SessionLink {
    session: Weak<SessionInner>,
}

impl Reconnector for SessionLink {
    fn reconnect<'a>(&'a self, channel: &'a ChannelId) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            let inner = self
                .session
                .upgrade()
                .ok_or_else(|| SyncError::ChannelNotRegistered(channel.clone()))?;
            inner.transport.open(channel).await
        })
    }

    fn connected(&self, channel: &ChannelId) {
        let Some(inner) = self.session.upgrade() else {
            return;
        };
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.run_catch_up().await {
                tracing::warn!("CHANNEL {}: catch-up failed: {}", channel, err);
            }
        });
    }
}

async fn pump(session: Weak<SessionInner>, mut inbound: InboundReceiver) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        match message {
            Inbound::Event { path, event } => {
                inner.deliver(path, event);
            }
            Inbound::Closed { reason } => {
                tracing::warn!("CHANNEL {}: transport closed: {}", inner.channel, reason);
                inner.ctx.scheduler.notify_disconnected(&inner.channel);
            }
        }
    }
}

/// One subscribed channel: its transport, local store and delivery pipeline.
///
/// Cloning is cheap; the channel is torn down when the last clone is dropped
/// or on [`ChannelSession::unsubscribe`].
#[derive(Clone)]
pub struct ChannelSession {
    inner: Arc<SessionInner>,
}

impl ChannelSession {
    /// Register `channel`, wire its inbound paths and make the first connect
    /// attempt when online. A rejected first connect unregisters the channel
    /// again and returns the error; transient failures are left to the
    /// scheduler.
    pub async fn subscribe(
        ctx: &Arc<SyncContext>,
        channel: ChannelId,
        transport: Arc<dyn ChannelTransport>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn LocalStore>,
    ) -> SyncResult<Self> {
        if !ctx.registry.register(&channel) {
            return Err(SyncError::InvalidState(format!(
                "channel {} is already subscribed",
                channel
            )));
        }
        tracing::info!("CHANNEL {}: subscribing", channel);
        if let Some(cursor) = CatchUpEngine::starting_cursor(&ctx.registry, store.as_ref(), &channel)
        {
            ctx.registry.seed_cursor(&channel, cursor);
        }

        let coordinator = DeliveryCoordinator::new(
            channel.clone(),
            ctx.registry.clone(),
            store,
            ctx.authors.clone(),
            &ctx.config.dedup,
        );
        let inner = Arc::new(SessionInner {
            channel: channel.clone(),
            ctx: Arc::clone(ctx),
            transport: transport.clone(),
            coordinator: Mutex::new(coordinator),
            catch_up: CatchUpEngine::new(fetcher, ctx.config.catch_up.clone()),
            pump: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        });

        let (sink, inbound) = mpsc::unbounded_channel();
        transport.attach(&channel, sink);
        ctx.scheduler.register(
            channel.clone(),
            Arc::new(SessionLink {
                session: Arc::downgrade(&inner),
            }),
        );
        let handle = tokio::spawn(pump(Arc::downgrade(&inner), inbound));
        *inner
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        let session = Self { inner };
        if ctx.network.is_online() {
            match ctx.scheduler.attempt_reconnect(&channel).await {
                Ok(outcome) => {
                    tracing::debug!("CHANNEL {}: initial connect {:?}", channel, outcome);
                }
                Err(err) => {
                    tracing::error!("CHANNEL {}: subscribe rejected: {}", channel, err);
                    session.inner.teardown();
                    return Err(err);
                }
            }
        }
        Ok(session)
    }

    pub fn channel(&self) -> &ChannelId {
        &self.inner.channel
    }

    pub fn status(&self) -> Option<ChannelStatus> {
        self.inner.ctx.registry.status(&self.inner.channel)
    }

    pub fn state(&self) -> Option<ChannelState> {
        self.inner.ctx.registry.state(&self.inner.channel)
    }

    pub fn cursor(&self) -> Option<SyncCursor> {
        self.inner.ctx.registry.cursor(&self.inner.channel)
    }

    /// Operator-triggered reconnect.
    pub async fn reconnect(&self) -> SyncResult<ReconnectOutcome> {
        self.inner
            .ctx
            .scheduler
            .attempt_manual_reconnect(&self.inner.channel)
            .await
    }

    /// Run a catch-up pass now. Normally triggered by every successful connect.
    pub async fn catch_up(&self) -> SyncResult<CatchUpReport> {
        self.inner.run_catch_up().await
    }

    /// Feed an event in directly, as a transport would.
    pub fn deliver(&self, path: DeliveryPath, event: RawEvent) -> Applied {
        self.inner.deliver(path, event)
    }

    pub fn record_pending(&self, operation: PendingOperation) {
        self.inner.coordinator().record_pending(operation);
    }

    pub fn mark_sent(&self, local_id: &str) -> bool {
        self.inner.coordinator().mark_sent(local_id)
    }

    pub fn mark_failed(&self, local_id: &str) -> bool {
        self.inner.coordinator().mark_failed(local_id)
    }

    pub fn discard_pending(&self, local_id: &str) -> Option<PendingOperation> {
        self.inner.coordinator().discard_pending(local_id)
    }

    pub fn pending(&self) -> Vec<PendingOperation> {
        self.inner.coordinator().pending()
    }

    /// Record `operation` and echo `event` on the fast path, tagged with the
    /// operation's local id and match key. A failed send leaves the entry in
    /// the `error` state.
    pub async fn send_broadcast(
        &self,
        operation: PendingOperation,
        event: RawEvent,
    ) -> SyncResult<()> {
        let local_id = operation.local_id.clone();
        let event = event
            .with_local_id(operation.local_id.clone())
            .with_match_key(operation.match_key.clone());
        self.record_pending(operation);

        match self
            .inner
            .transport
            .send_broadcast(&self.inner.channel, event)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(
                    "CHANNEL {}: broadcast of {} failed: {}",
                    self.inner.channel,
                    local_id,
                    err
                );
                self.mark_failed(&local_id);
                Err(err)
            }
        }
    }

    pub async fn unsubscribe(self) -> SyncResult<()> {
        tracing::info!("CHANNEL {}: unsubscribing", self.inner.channel);
        self.inner.teardown();
        self.inner.transport.close(&self.inner.channel).await
    }
}
