//! Reconnection scheduling.
//!
//! The scheduler owns every backoff timer. A channel's reconnect attempts are
//! serialized through an in-flight set, so a timer firing during a manual
//! reconnect (or a network-online sweep) is skipped rather than doubled up.

use crate::events::{EventDispatcher, SyncEvent};
use crate::network::NetworkMonitor;
use crate::registry::ChannelRegistry;
use dashmap::{DashMap, DashSet};
use futures_util::future::BoxFuture;
use rand::Rng;
use std::sync::{Arc, Weak};
use std::time::Duration;
use syncline_core::{
    config::ReconnectConfig,
    errors::SyncError,
    models::{ChannelId, ChannelStatus},
    SyncResult,
};
use tokio::task::JoinHandle;

/// Transport-specific connect callback, supplied by whoever owns the channel.
pub trait Reconnector: Send + Sync {
    fn reconnect<'a>(&'a self, channel: &'a ChannelId) -> BoxFuture<'a, SyncResult<()>>;

    /// Called after the registry has recorded the successful connect.
    fn connected(&self, _channel: &ChannelId) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay())
    }

    /// `min(base * 2^retry, cap)`, without jitter.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let multiplier = 1u64.checked_shl(retry_count.min(63)).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(cap_ms))
    }

    /// Uniform in `[0, delay / 2)`.
    pub fn jitter<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let half = (delay.as_nanos() / 2) as u64;
        if half == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rng.gen_range(0..half))
    }

    pub fn delay<R: Rng>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(retry_count);
        base + self.jitter(base, rng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectOutcome {
    Connected,
    RetryScheduled { delay: Duration },
    Exhausted { attempts: u32 },
    Offline,
    /// Another attempt for the channel was already running.
    Skipped,
    /// The channel was unregistered while the attempt was in flight.
    Abandoned,
}

pub struct ReconnectScheduler {
    registry: Arc<ChannelRegistry>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventDispatcher>,
    config: ReconnectConfig,
    backoff: BackoffPolicy,
    reconnectors: DashMap<ChannelId, Arc<dyn Reconnector>>,
    timers: DashMap<ChannelId, JoinHandle<()>>,
    in_flight: DashSet<ChannelId>,
}

struct InFlightGuard<'a> {
    set: &'a DashSet<ChannelId>,
    channel: &'a ChannelId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(self.channel);
    }
}

impl ReconnectScheduler {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventDispatcher>,
        config: ReconnectConfig,
    ) -> Self {
        let backoff = BackoffPolicy::from_config(&config);
        Self {
            registry,
            network,
            events,
            config,
            backoff,
            reconnectors: DashMap::new(),
            timers: DashMap::new(),
            in_flight: DashSet::new(),
        }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn register(&self, channel: ChannelId, reconnector: Arc<dyn Reconnector>) {
        self.reconnectors.insert(channel, reconnector);
    }

    /// Drops the callback and any pending timer. An attempt already in flight
    /// finishes but its result is ignored.
    pub fn unregister(&self, channel: &ChannelId) {
        self.reconnectors.remove(channel);
        self.cancel_timer(channel);
    }

    pub fn cancel_timer(&self, channel: &ChannelId) -> bool {
        match self.timers.remove(channel) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_pending_timer(&self, channel: &ChannelId) -> bool {
        self.timers.contains_key(channel)
    }

    pub fn should_reconnect(&self, channel: &ChannelId) -> bool {
        let Some(state) = self.registry.state(channel) else {
            return false;
        };
        if state.status != ChannelStatus::Disconnected {
            return false;
        }
        if state.retry_count >= self.config.max_retries {
            return false;
        }
        if let Some(last_attempt) = state.last_attempt_at {
            if last_attempt.elapsed() < self.backoff.base_delay(state.retry_count) {
                return false;
            }
        }
        self.network.is_online()
    }

    /// Fire an attempt in the background if the gating rules allow one.
    pub fn schedule(self: &Arc<Self>, channel: &ChannelId) -> bool {
        if !self.should_reconnect(channel) {
            return false;
        }
        let scheduler = Arc::clone(self);
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(err) = scheduler.attempt_reconnect(&channel).await {
                tracing::warn!("CHANNEL {}: reconnect failed: {}", channel, err);
            }
        });
        true
    }

    /// The transport reported a dropped connection.
    pub fn notify_disconnected(self: &Arc<Self>, channel: &ChannelId) -> bool {
        if self.registry.status(channel) != Some(ChannelStatus::Connected) {
            return false;
        }
        if self
            .registry
            .set_status(channel, ChannelStatus::Disconnected)
            .is_err()
        {
            return false;
        }
        tracing::warn!("CHANNEL {}: connection lost", channel);
        self.events.emit(SyncEvent::ConnectionLost {
            channel: channel.clone(),
        });
        self.schedule(channel)
    }

    pub fn attempt_reconnect<'a>(
        self: &'a Arc<Self>,
        channel: &'a ChannelId,
    ) -> BoxFuture<'a, SyncResult<ReconnectOutcome>> {
        Box::pin(async move {
            if !self.in_flight.insert(channel.clone()) {
                tracing::debug!("CHANNEL {}: attempt already in flight", channel);
                return Ok(ReconnectOutcome::Skipped);
            }
            let outcome = {
                let _guard = InFlightGuard {
                    set: &self.in_flight,
                    channel,
                };
                self.run_attempt(channel).await?
            };

            if let ReconnectOutcome::RetryScheduled { delay } = outcome {
                self.schedule_retry(channel.clone(), delay);
            }
            Ok(outcome)
        })
    }

    async fn run_attempt(&self, channel: &ChannelId) -> SyncResult<ReconnectOutcome> {
        let reconnector = self
            .reconnectors
            .get(channel)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SyncError::ChannelNotRegistered(channel.clone()))?;

        if !self.network.is_online() {
            self.registry
                .set_status(channel, ChannelStatus::Disconnected)?;
            return Ok(ReconnectOutcome::Offline);
        }

        let attempt = self.registry.begin_attempt(channel)?;
        tracing::info!("CHANNEL {}: connect attempt {}", channel, attempt);
        self.events.emit(SyncEvent::ConnectionAttempted {
            channel: channel.clone(),
            attempt,
        });

        let timeout = self.config.connect_timeout();
        let result = match tokio::time::timeout(timeout, reconnector.reconnect(channel)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(timeout)),
        };

        if !self.registry.contains(channel) || !self.reconnectors.contains_key(channel) {
            tracing::debug!("CHANNEL {}: unregistered during attempt", channel);
            return Ok(ReconnectOutcome::Abandoned);
        }

        match result {
            Ok(()) => {
                self.registry.set_status(channel, ChannelStatus::Connected)?;
                tracing::info!("CHANNEL {}: connected after {} attempt(s)", channel, attempt);
                self.events.emit(SyncEvent::ConnectionSucceeded {
                    channel: channel.clone(),
                });
                reconnector.connected(channel);
                Ok(ReconnectOutcome::Connected)
            }
            Err(err) if err.is_transient() => {
                tracing::warn!("CHANNEL {}: attempt {} failed: {}", channel, attempt, err);
                if !self.network.is_online() {
                    self.registry
                        .set_status(channel, ChannelStatus::Disconnected)?;
                    return Ok(ReconnectOutcome::Offline);
                }
                if attempt < self.config.max_retries {
                    let delay = {
                        let mut rng = rand::thread_rng();
                        self.backoff.delay(attempt, &mut rng)
                    };
                    tracing::info!("CHANNEL {}: next attempt in {:?}", channel, delay);
                    return Ok(ReconnectOutcome::RetryScheduled { delay });
                }

                self.registry
                    .set_status(channel, ChannelStatus::Disconnected)?;
                tracing::error!(
                    "CHANNEL {}: giving up after {} attempts",
                    channel,
                    attempt
                );
                self.events.emit(SyncEvent::RetriesExhausted {
                    channel: channel.clone(),
                    attempts: attempt,
                });
                Ok(ReconnectOutcome::Exhausted { attempts: attempt })
            }
            Err(err) => {
                // Rejections stay outside the transient retry budget
                self.registry.refund_attempt(channel)?;
                self.registry
                    .set_status(channel, ChannelStatus::Disconnected)?;
                tracing::error!("CHANNEL {}: connect rejected: {}", channel, err);
                self.events.emit(SyncEvent::ConnectionRejected {
                    channel: channel.clone(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, channel: ChannelId, delay: Duration) {
        let scheduler = Arc::clone(self);
        let key = channel.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.timers.remove(&channel);

            if !scheduler.network.is_online() {
                let _ = scheduler
                    .registry
                    .set_status(&channel, ChannelStatus::Disconnected);
                return;
            }
            if let Err(err) = scheduler.attempt_reconnect(&channel).await {
                tracing::warn!("CHANNEL {}: scheduled reconnect failed: {}", channel, err);
            }
        });
        if let Some(previous) = self.timers.insert(key, handle) {
            previous.abort();
        }
    }

    /// Operator-triggered reconnect. Clears the retry budget and makes one attempt.
    pub async fn attempt_manual_reconnect(
        self: &Arc<Self>,
        channel: &ChannelId,
    ) -> SyncResult<ReconnectOutcome> {
        let status = self
            .registry
            .status(channel)
            .ok_or_else(|| SyncError::ChannelNotRegistered(channel.clone()))?;
        if !self.network.is_online() {
            return Err(SyncError::Offline);
        }
        if status != ChannelStatus::Disconnected {
            return Err(SyncError::ChannelActive {
                channel: channel.clone(),
                status,
            });
        }

        tracing::info!("CHANNEL {}: manual reconnect", channel);
        self.registry.reset_retries(channel)?;
        self.cancel_timer(channel);
        self.attempt_reconnect(channel).await
    }

    pub fn handle_network_change(self: &Arc<Self>, online: bool) {
        if !online {
            let channels: Vec<ChannelId> =
                self.timers.iter().map(|entry| entry.key().clone()).collect();
            for channel in channels {
                self.cancel_timer(&channel);
            }
            for channel in self.registry.channels() {
                let was_connected =
                    self.registry.status(&channel) == Some(ChannelStatus::Connected);
                if self
                    .registry
                    .set_status(&channel, ChannelStatus::Disconnected)
                    .is_ok()
                    && was_connected
                {
                    self.events.emit(SyncEvent::ConnectionLost {
                        channel: channel.clone(),
                    });
                }
            }
            return;
        }

        for channel in self.registry.channels_with_status(ChannelStatus::Disconnected) {
            if !self.reconnectors.contains_key(&channel) {
                continue;
            }
            if self.registry.reset_retries(&channel).is_err() {
                continue;
            }
            let _ = self
                .registry
                .set_status(&channel, ChannelStatus::Reconnecting);
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = scheduler.attempt_reconnect(&channel).await {
                    tracing::warn!("CHANNEL {}: reconnect after online failed: {}", channel, err);
                }
            });
        }
    }

    /// Follow the network monitor until the scheduler is dropped.
    pub fn spawn_network_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut rx = self.network.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                let Some(scheduler) = weak.upgrade() else {
                    break;
                };
                scheduler.handle_network_change(online);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
        error: SyncError,
    }

    impl Flaky {
        fn new(failures: u32, error: SyncError) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                error,
            })
        }
    }

    impl Reconnector for Flaky {
        fn reconnect<'a>(&'a self, _channel: &'a ChannelId) -> BoxFuture<'a, SyncResult<()>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    return Err(self.error.clone());
                }
                Ok(())
            })
        }
    }

    fn setup(online: bool) -> (Arc<ReconnectScheduler>, Arc<ChannelRegistry>, Arc<NetworkMonitor>) {
        let registry = Arc::new(ChannelRegistry::new());
        let network = Arc::new(NetworkMonitor::new(online));
        let scheduler = Arc::new(ReconnectScheduler::new(
            registry.clone(),
            network.clone(),
            Arc::new(EventDispatcher::new()),
            ReconnectConfig::default(),
        ));
        (scheduler, registry, network)
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut previous = Duration::ZERO;
        for retry in 0..40 {
            let delay = policy.base_delay(retry);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(3), Duration::from_secs(8));
        assert_eq!(policy.base_delay(5), Duration::from_secs(30));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_below_half() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 0..8 {
            let base = policy.base_delay(retry);
            for _ in 0..50 {
                let jitter = policy.jitter(base, &mut rng);
                assert!(jitter < base / 2);
            }
        }
        assert_eq!(policy.jitter(Duration::ZERO, &mut rng), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_reconnect_gating() {
        let (scheduler, registry, network) = setup(true);
        let channel = ChannelId::from("room");
        registry.register(&channel);
        assert!(scheduler.should_reconnect(&channel));

        registry.begin_attempt(&channel).unwrap();
        assert!(!scheduler.should_reconnect(&channel), "reconnecting");

        registry
            .set_status(&channel, ChannelStatus::Disconnected)
            .unwrap();
        assert!(!scheduler.should_reconnect(&channel), "inside backoff window");

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(scheduler.should_reconnect(&channel));

        network.set_online(false);
        assert!(!scheduler.should_reconnect(&channel), "offline");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_retry_count() {
        let (scheduler, registry, _network) = setup(true);
        let channel = ChannelId::from("room");
        registry.register(&channel);
        let flaky = Flaky::new(2, SyncError::Network("reset".into()));
        scheduler.register(channel.clone(), flaky.clone());

        let outcome = scheduler.attempt_reconnect(&channel).await.unwrap();
        assert!(matches!(outcome, ReconnectOutcome::RetryScheduled { .. }));
        assert_eq!(registry.status(&channel), Some(ChannelStatus::Reconnecting));
        assert!(scheduler.has_pending_timer(&channel));

        // Two timer-driven retries: one failure, then success
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        let state = registry.state(&channel).unwrap();
        assert_eq!(state.status, ChannelStatus::Connected);
        assert_eq!(state.retry_count, 0);
        assert!(!scheduler.has_pending_timer(&channel));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_is_not_retried() {
        let (scheduler, registry, _network) = setup(true);
        let channel = ChannelId::from("private");
        registry.register(&channel);
        let flaky = Flaky::new(10, SyncError::PermissionDenied("private".into()));
        scheduler.register(channel.clone(), flaky.clone());

        let err = scheduler.attempt_reconnect(&channel).await.unwrap_err();
        assert!(err.is_permission());
        assert_eq!(registry.status(&channel), Some(ChannelStatus::Disconnected));
        assert!(!scheduler.has_pending_timer(&channel));
        assert_eq!(registry.state(&channel).unwrap().retry_count, 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_keeps_transient_budget() {
        let (scheduler, registry, _network) = setup(true);
        let channel = ChannelId::from("room");
        registry.register(&channel);

        // One transient failure already spent
        registry.begin_attempt(&channel).unwrap();
        registry
            .set_status(&channel, ChannelStatus::Disconnected)
            .unwrap();
        scheduler.register(
            channel.clone(),
            Flaky::new(1, SyncError::PermissionDenied("room".into())),
        );

        let err = scheduler.attempt_reconnect(&channel).await.unwrap_err();
        assert!(err.is_permission());
        assert_eq!(registry.state(&channel).unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_refusals() {
        let (scheduler, registry, network) = setup(true);
        let channel = ChannelId::from("room");
        registry.register(&channel);
        scheduler.register(channel.clone(), Flaky::new(0, SyncError::ConnectionClosed));

        registry.set_status(&channel, ChannelStatus::Connected).unwrap();
        assert!(matches!(
            scheduler.attempt_manual_reconnect(&channel).await,
            Err(SyncError::ChannelActive {
                status: ChannelStatus::Connected,
                ..
            })
        ));

        registry
            .set_status(&channel, ChannelStatus::Disconnected)
            .unwrap();
        network.set_online(false);
        assert_eq!(
            scheduler.attempt_manual_reconnect(&channel).await,
            Err(SyncError::Offline)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_channel_abandons_attempt() {
        let (scheduler, registry, _network) = setup(true);
        let channel = ChannelId::from("room");
        registry.register(&channel);

        struct Slow(Arc<ChannelRegistry>);
        impl Reconnector for Slow {
            fn reconnect<'a>(&'a self, channel: &'a ChannelId) -> BoxFuture<'a, SyncResult<()>> {
                Box::pin(async move {
                    self.0.unregister(channel);
                    Ok(())
                })
            }
        }
        scheduler.register(channel.clone(), Arc::new(Slow(registry.clone())));

        let outcome = scheduler.attempt_reconnect(&channel).await.unwrap();
        assert_eq!(outcome, ReconnectOutcome::Abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_connect_times_out() {
        let (scheduler, registry, _network) = setup(true);
        let channel = ChannelId::from("room");
        registry.register(&channel);

        struct Hang;
        impl Reconnector for Hang {
            fn reconnect<'a>(&'a self, _channel: &'a ChannelId) -> BoxFuture<'a, SyncResult<()>> {
                Box::pin(futures_util::future::pending::<SyncResult<()>>())
            }
        }
        scheduler.register(channel.clone(), Arc::new(Hang));

        let outcome = scheduler.attempt_reconnect(&channel).await.unwrap();
        assert!(matches!(outcome, ReconnectOutcome::RetryScheduled { .. }));
        assert_eq!(registry.state(&channel).unwrap().retry_count, 1);
        scheduler.unregister(&channel);
        assert!(!scheduler.has_pending_timer(&channel));
    }
}
