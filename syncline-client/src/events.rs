//! Notification hub for connection and catch-up activity.
//!
//! Events can be emitted from any task or thread. They are queued and only
//! delivered when `process_events()` is called, always on the thread that
//! registered the first callback, so application callbacks never race each other.
//!
//! # Event categories
//!
//! - Connection: `ConnectionAttempted`, `ConnectionSucceeded`, `ConnectionLost`,
//!   `ConnectionRejected`, `RetriesExhausted`
//! - Catch-up: `CatchUpStarted`, `CatchUpCompleted`, `CatchUpDegraded`,
//!   `FullResyncRequired`
//! - Errors: `SyncError`

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread::{self, ThreadId};
use strum::Display;
use syncline_core::{errors::SyncError, models::ChannelId, models::SyncCursor, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    ConnectionAttempted,
    ConnectionSucceeded,
    ConnectionLost,
    /// Terminal connect failure, e.g. permission denied.
    ConnectionRejected,
    /// Automatic reconnection gave up after the configured number of attempts.
    RetriesExhausted,
    CatchUpStarted,
    CatchUpCompleted,
    /// Catch-up merged a partial result after a later page failed.
    CatchUpDegraded,
    /// Incremental catch-up is impossible; the caller must reload full state.
    FullResyncRequired,
    SyncError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectionAttempted { channel: ChannelId, attempt: u32 },
    ConnectionSucceeded { channel: ChannelId },
    ConnectionLost { channel: ChannelId },
    ConnectionRejected { channel: ChannelId, reason: String },
    RetriesExhausted { channel: ChannelId, attempts: u32 },
    CatchUpStarted { channel: ChannelId, since: SyncCursor },
    CatchUpCompleted {
        channel: ChannelId,
        applied: usize,
        truncated: bool,
    },
    CatchUpDegraded {
        channel: ChannelId,
        applied: usize,
        reason: String,
    },
    FullResyncRequired { channel: ChannelId, reason: String },
    SyncError { channel: ChannelId, message: String },
}

impl SyncEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            SyncEvent::ConnectionAttempted { .. } => EventType::ConnectionAttempted,
            SyncEvent::ConnectionSucceeded { .. } => EventType::ConnectionSucceeded,
            SyncEvent::ConnectionLost { .. } => EventType::ConnectionLost,
            SyncEvent::ConnectionRejected { .. } => EventType::ConnectionRejected,
            SyncEvent::RetriesExhausted { .. } => EventType::RetriesExhausted,
            SyncEvent::CatchUpStarted { .. } => EventType::CatchUpStarted,
            SyncEvent::CatchUpCompleted { .. } => EventType::CatchUpCompleted,
            SyncEvent::CatchUpDegraded { .. } => EventType::CatchUpDegraded,
            SyncEvent::FullResyncRequired { .. } => EventType::FullResyncRequired,
            SyncEvent::SyncError { .. } => EventType::SyncError,
        }
    }

    pub fn channel(&self) -> &ChannelId {
        match self {
            SyncEvent::ConnectionAttempted { channel, .. }
            | SyncEvent::ConnectionSucceeded { channel }
            | SyncEvent::ConnectionLost { channel }
            | SyncEvent::ConnectionRejected { channel, .. }
            | SyncEvent::RetriesExhausted { channel, .. }
            | SyncEvent::CatchUpStarted { channel, .. }
            | SyncEvent::CatchUpCompleted { channel, .. }
            | SyncEvent::CatchUpDegraded { channel, .. }
            | SyncEvent::FullResyncRequired { channel, .. }
            | SyncEvent::SyncError { channel, .. } => channel,
        }
    }
}

struct CallbackEntry {
    callback: Box<dyn Fn(SyncEvent) + Send>,
    event_filter: Option<EventType>,
}

/// Thread-safe event dispatcher.
///
/// ```rust,no_run
/// use syncline_client::events::{EventDispatcher, SyncEvent};
///
/// let dispatcher = EventDispatcher::new();
/// dispatcher
///     .register_callback(|event| {
///         if let SyncEvent::RetriesExhausted { channel, attempts } = event {
///             println!("{} gave up after {} attempts", channel, attempts);
///         }
///     })
///     .unwrap();
///
/// // In the application's main loop
/// let processed = dispatcher.process_events().unwrap();
/// # let _ = processed;
/// ```
pub struct EventDispatcher {
    callbacks: Mutex<Vec<CallbackEntry>>,
    has_callbacks: AtomicBool,
    event_queue: Mutex<mpsc::Receiver<SyncEvent>>,
    event_sender: mpsc::Sender<SyncEvent>,
    queued: AtomicUsize,
    callback_thread_id: Mutex<Option<ThreadId>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            callbacks: Mutex::new(Vec::new()),
            has_callbacks: AtomicBool::new(false),
            event_queue: Mutex::new(receiver),
            event_sender: sender,
            queued: AtomicUsize::new(0),
            callback_thread_id: Mutex::new(None),
        }
    }

    fn ensure_callback_thread(&self) -> SyncResult<()> {
        let mut thread_id = self
            .callback_thread_id
            .lock()
            .map_err(|_| SyncError::LockError("thread ID".into()))?;
        if thread_id.is_none() {
            *thread_id = Some(thread::current().id());
            tracing::info!(
                "Sync event callbacks will be processed on thread: {:?}",
                thread::current().id()
            );
        }
        Ok(())
    }

    pub fn register_callback<F>(&self, callback: F) -> SyncResult<()>
    where
        F: Fn(SyncEvent) + Send + 'static,
    {
        self.push_callback(Box::new(callback), None)
    }

    /// Register a callback that only receives events of `event_filter`'s type.
    pub fn register_callback_filtered<F>(&self, callback: F, event_filter: EventType) -> SyncResult<()>
    where
        F: Fn(SyncEvent) + Send + 'static,
    {
        self.push_callback(Box::new(callback), Some(event_filter))
    }

    fn push_callback(
        &self,
        callback: Box<dyn Fn(SyncEvent) + Send>,
        event_filter: Option<EventType>,
    ) -> SyncResult<()> {
        self.ensure_callback_thread()?;

        let mut callbacks = self
            .callbacks
            .lock()
            .map_err(|_| SyncError::LockError("callbacks".into()))?;
        callbacks.push(CallbackEntry {
            callback,
            event_filter,
        });
        self.has_callbacks.store(true, Ordering::Release);
        Ok(())
    }

    /// Queue an event. Dropped when nobody has registered interest yet.
    pub fn emit(&self, event: SyncEvent) {
        tracing::debug!("CHANNEL {}: event {}", event.channel(), event.event_type());
        if !self.has_callbacks.load(Ordering::Acquire) {
            return;
        }
        if self.event_sender.send(event).is_err() {
            tracing::error!("Failed to queue sync event - receiver may have been dropped");
            return;
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
    }

    /// Deliver every queued event. Must run on the thread that registered callbacks.
    pub fn process_events(&self) -> SyncResult<usize> {
        {
            let thread_id = self
                .callback_thread_id
                .lock()
                .map_err(|_| SyncError::LockError("thread ID".into()))?;
            match *thread_id {
                Some(expected) if thread::current().id() != expected => {
                    return Err(SyncError::ThreadSafetyViolation);
                }
                Some(_) => {}
                None => return Err(SyncError::NoCallbacksRegistered),
            }
        }

        let drained: Vec<SyncEvent> = {
            let receiver = self
                .event_queue
                .lock()
                .map_err(|_| SyncError::LockError("event queue".into()))?;
            receiver.try_iter().collect()
        };
        self.queued.fetch_sub(drained.len(), Ordering::AcqRel);

        let callbacks = self
            .callbacks
            .lock()
            .map_err(|_| SyncError::LockError("callbacks".into()))?;
        for event in &drained {
            let event_type = event.event_type();
            for entry in callbacks.iter() {
                if entry.event_filter.is_some_and(|filter| filter != event_type) {
                    continue;
                }
                (entry.callback)(event.clone());
            }
        }

        Ok(drained.len())
    }

    pub fn pending_event_count(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
