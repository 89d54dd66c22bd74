//! Per-client session state.
//!
//! A [`Session`] is shared between the RPC path (which flips `initialized` and
//! produces events) and at most one SSE stream (which consumes them). Flags are
//! atomics so neither side serializes the other; the event queue and the replay
//! history each sit behind their own short-lived lock.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// An entry in a session's event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedEvent {
    /// A JSON payload to push to the client.
    Message(String),
    /// The session was closed; the consumer must stop.
    Terminate,
}

/// Server-side state for one logical client connection.
#[derive(Debug)]
pub struct Session {
    id: String,
    project_path: String,
    initialized: AtomicBool,
    closed: AtomicBool,
    stream_attached: AtomicBool,
    last_activity_ms: AtomicI64,
    event_counter: AtomicU64,
    dropped_events: AtomicU64,
    queue: Mutex<VecDeque<QueuedEvent>>,
    queue_capacity: usize,
    queue_notify: Notify,
    history: Mutex<BTreeMap<u64, String>>,
    history_capacity: usize,
}

impl Session {
    /// Create a session bound to a normalized project path.
    pub fn new(
        id: impl Into<String>,
        project_path: impl Into<String>,
        queue_capacity: usize,
        history_capacity: usize,
    ) -> Self {
        let queue_capacity = queue_capacity.max(1);
        Self {
            id: id.into(),
            project_path: project_path.into(),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stream_attached: AtomicBool::new(false),
            last_activity_ms: AtomicI64::new(now_ms()),
            event_counter: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::with_capacity(queue_capacity.min(64))),
            queue_capacity,
            queue_notify: Notify::new(),
            history: Mutex::new(BTreeMap::new()),
            history_capacity: history_capacity.max(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The project path this session was created for. Never changes.
    pub fn project_path(&self) -> &str {
        &self.project_path
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
        self.touch();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ===== Stream attachment =====

    /// Claim the session's single stream slot.
    ///
    /// Returns `false` if another stream holds it or the session is closed.
    pub fn attach_stream(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        if self
            .stream_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // close() may have run between the check and the swap.
        if self.is_closed() {
            self.stream_attached.store(false, Ordering::Release);
            return false;
        }
        self.touch();
        true
    }

    pub fn detach_stream(&self) {
        self.stream_attached.store(false, Ordering::Release);
    }

    pub fn stream_attached(&self) -> bool {
        self.stream_attached.load(Ordering::Acquire)
    }

    // ===== Lifecycle =====

    /// Close the session. Idempotent.
    ///
    /// Force-detaches any stream and queues [`QueuedEvent::Terminate`] so a
    /// consumer blocked in [`poll_event`](Self::poll_event) wakes up.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.detach_stream();
        self.push_evicting(QueuedEvent::Terminate);
    }

    // ===== Event queue =====

    /// Queue a payload for the attached (or next) stream. Never blocks.
    ///
    /// When the queue is full the oldest pending event is evicted and counted
    /// as dropped. Returns `false` only when the session is closed.
    pub fn offer_event(&self, payload: impl Into<String>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.push_evicting(QueuedEvent::Message(payload.into()));
        self.touch();
        true
    }

    fn push_evicting(&self, event: QueuedEvent) {
        {
            let mut queue = self.lock_queue();
            if queue.len() >= self.queue_capacity {
                queue.pop_front();
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.queue_notify.notify_one();
    }

    /// Wait up to `timeout` for the next queued event.
    pub async fn poll_event(&self, timeout: Duration) -> Option<QueuedEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let next = self.lock_queue().pop_front();
            if next.is_some() {
                return next;
            }
            if tokio::time::timeout_at(deadline, self.queue_notify.notified())
                .await
                .is_err()
            {
                return self.lock_queue().pop_front();
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    // ===== Event ids and replay history =====

    /// Allocate the next event id. Strictly increasing, starting at 1.
    pub fn next_event_id(&self) -> u64 {
        self.event_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Remember a delivered event for reconnect replay.
    pub fn record_event(&self, event_id: u64, payload: impl Into<String>) {
        let mut history = self.lock_history();
        history.insert(event_id, payload.into());
        while history.len() > self.history_capacity {
            history.pop_first();
        }
    }

    /// Events strictly after `last_event_id`, ascending.
    ///
    /// `None` means the client asked for no replay and yields nothing.
    pub fn events_after(&self, last_event_id: Option<u64>) -> Vec<(u64, String)> {
        let Some(last) = last_event_id else {
            return Vec::new();
        };
        self.lock_history()
            .range((Bound::Excluded(last), Bound::Unbounded))
            .map(|(id, payload)| (*id, payload.clone()))
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.lock_history().len()
    }

    // ===== Activity =====

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Release);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    /// Whether more than `timeout` has elapsed since the last activity.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        let idle = now_ms().saturating_sub(self.last_activity_ms());
        idle > i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX)
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity_ms(&self, millis: i64) {
        self.last_activity_ms.store(millis, Ordering::Release);
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<QueuedEvent>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_history(&self) -> MutexGuard<'_, BTreeMap<u64, String>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
