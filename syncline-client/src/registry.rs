use dashmap::DashMap;
use std::sync::Mutex;
use syncline_core::{
    errors::SyncError,
    models::{ChannelId, ChannelStatus, SyncCursor},
    SyncResult,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Per-channel connection state. Lives from first subscribe until unsubscribe and
/// survives reconnect cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelState {
    pub status: ChannelStatus,
    pub retry_count: u32,
    pub last_attempt_at: Option<Instant>,
    pub last_sync_cursor: Option<SyncCursor>,
    /// Bumped on every transition into `Connected`.
    pub epoch: u64,
    /// Set on every transition into `Connected` and cleared once that
    /// connection's catch-up pass has merged. Live events never move the
    /// cursor while it is set.
    pub catch_up_pending: bool,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            status: ChannelStatus::Disconnected,
            retry_count: 0,
            last_attempt_at: None,
            last_sync_cursor: None,
            epoch: 0,
            catch_up_pending: false,
        }
    }

    fn bump_cursor(&mut self, cursor: SyncCursor) -> bool {
        match self.last_sync_cursor {
            Some(current) if current >= cursor => false,
            _ => {
                self.last_sync_cursor = Some(cursor);
                true
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub channel: ChannelId,
    pub status: ChannelStatus,
}

pub struct ChannelRegistry {
    channels: DashMap<ChannelId, ChannelState>,
    observers: Mutex<Vec<mpsc::UnboundedSender<StatusChange>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Returns false when the channel was already registered.
    pub fn register(&self, channel: &ChannelId) -> bool {
        if self.channels.contains_key(channel) {
            return false;
        }
        let inserted = match self.channels.entry(channel.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ChannelState::new());
                true
            }
        };
        if inserted {
            tracing::info!("CHANNEL {}: registered", channel);
            self.notify(StatusChange {
                channel: channel.clone(),
                status: ChannelStatus::Disconnected,
            });
        }
        inserted
    }

    pub fn unregister(&self, channel: &ChannelId) -> Option<ChannelState> {
        let removed = self.channels.remove(channel).map(|(_, state)| state);
        if removed.is_some() {
            tracing::info!("CHANNEL {}: unregistered", channel);
        }
        removed
    }

    pub fn contains(&self, channel: &ChannelId) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn status(&self, channel: &ChannelId) -> Option<ChannelStatus> {
        self.channels.get(channel).map(|state| state.status)
    }

    pub fn state(&self, channel: &ChannelId) -> Option<ChannelState> {
        self.channels.get(channel).map(|state| state.clone())
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn channels_with_status(&self, status: ChannelStatus) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Moving to `Connected` is the only transition that clears the retry
    /// counter and the last attempt time.
    pub fn set_status(&self, channel: &ChannelId, status: ChannelStatus) -> SyncResult<()> {
        let changed = {
            let mut state = self
                .channels
                .get_mut(channel)
                .ok_or_else(|| SyncError::ChannelNotRegistered(channel.clone()))?;
            let previous = state.status;
            state.status = status;
            if status == ChannelStatus::Connected {
                state.retry_count = 0;
                state.last_attempt_at = None;
                if previous != ChannelStatus::Connected {
                    state.epoch += 1;
                    state.catch_up_pending = true;
                }
            }
            previous != status
        };

        if changed {
            tracing::info!("CHANNEL {}: status -> {}", channel, status);
            self.notify(StatusChange {
                channel: channel.clone(),
                status,
            });
        }
        Ok(())
    }

    /// Mark a connect attempt as started; returns the new retry count.
    pub fn begin_attempt(&self, channel: &ChannelId) -> SyncResult<u32> {
        let (retry_count, changed) = {
            let mut state = self
                .channels
                .get_mut(channel)
                .ok_or_else(|| SyncError::ChannelNotRegistered(channel.clone()))?;
            let changed = state.status != ChannelStatus::Reconnecting;
            state.status = ChannelStatus::Reconnecting;
            state.retry_count += 1;
            state.last_attempt_at = Some(Instant::now());
            (state.retry_count, changed)
        };

        if changed {
            self.notify(StatusChange {
                channel: channel.clone(),
                status: ChannelStatus::Reconnecting,
            });
        }
        Ok(retry_count)
    }

    /// Give back the retry slot taken by [`Self::begin_attempt`]; returns the
    /// restored count.
    pub fn refund_attempt(&self, channel: &ChannelId) -> SyncResult<u32> {
        let mut state = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| SyncError::ChannelNotRegistered(channel.clone()))?;
        state.retry_count = state.retry_count.saturating_sub(1);
        Ok(state.retry_count)
    }

    pub fn reset_retries(&self, channel: &ChannelId) -> SyncResult<()> {
        let mut state = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| SyncError::ChannelNotRegistered(channel.clone()))?;
        state.retry_count = 0;
        state.last_attempt_at = None;
        Ok(())
    }

    /// Move the cursor forward for a live authoritative event.
    ///
    /// Ignored unless the channel is connected and caught up: the cursor has to
    /// stay where the last gap began until a catch-up pass has covered it.
    /// Older or equal cursors are ignored too.
    pub fn advance_cursor(&self, channel: &ChannelId, cursor: SyncCursor) -> bool {
        let Some(mut state) = self.channels.get_mut(channel) else {
            return false;
        };
        if state.status != ChannelStatus::Connected || state.catch_up_pending {
            return false;
        }
        state.bump_cursor(cursor)
    }

    /// Set the resume point of a channel that has no cursor yet.
    pub fn seed_cursor(&self, channel: &ChannelId, cursor: SyncCursor) -> bool {
        let Some(mut state) = self.channels.get_mut(channel) else {
            return false;
        };
        if state.last_sync_cursor.is_some() {
            return false;
        }
        state.last_sync_cursor = Some(cursor);
        true
    }

    /// Record the cursor a catch-up pass of connection `epoch` reached.
    /// Returns false when that connection is no longer current.
    pub fn record_catch_up(&self, channel: &ChannelId, epoch: u64, cursor: SyncCursor) -> bool {
        let Some(mut state) = self.channels.get_mut(channel) else {
            return false;
        };
        if state.status != ChannelStatus::Connected || state.epoch != epoch {
            return false;
        }
        state.bump_cursor(cursor);
        true
    }

    /// Connection `epoch` has no gap left; live events may move the cursor again.
    pub fn finish_catch_up(&self, channel: &ChannelId, epoch: u64) -> bool {
        let Some(mut state) = self.channels.get_mut(channel) else {
            return false;
        };
        if state.status != ChannelStatus::Connected || state.epoch != epoch {
            return false;
        }
        state.catch_up_pending = false;
        true
    }

    pub fn cursor(&self, channel: &ChannelId) -> Option<SyncCursor> {
        self.channels
            .get(channel)
            .and_then(|state| state.last_sync_cursor)
    }

    /// Subscribe to status changes. The receiver is primed with the current
    /// status of every known channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut observers = self
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in self.channels.iter() {
            let _ = tx.send(StatusChange {
                channel: entry.key().clone(),
                status: entry.status,
            });
        }
        observers.push(tx);
        rx
    }

    fn notify(&self, change: StatusChange) {
        let mut observers = self
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observers.retain(|observer| observer.send(change.clone()).is_ok());
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
