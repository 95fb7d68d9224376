//! Bounded, concurrency-safe holders for the most recent instrument readings.
//!
//! Two variants back the per-instrument hand-off point between a sampling
//! worker (single writer) and the aggregator (reader):
//!
//! - [`LatestStore`]: a drain-to-latest queue. Writes never block and never
//!   fail; overflow evicts the oldest entry. Reads drain the backlog down to
//!   the newest value and keep it as a stale fallback, so once a single
//!   reading has arrived the store never reports "unavailable" again.
//! - [`FrameRing`]: a fixed-capacity ring with peek-last semantics for bulky
//!   frame payloads where only the newest entry ever matters.
//!
//! Absence is a normal state, not an error: an empty store just means the
//! instrument has not produced anything yet (or briefly outpaced nothing).
//! Both stores also publish the owning worker's availability flag, which the
//! aggregator reads and never writes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

struct LatestInner<T> {
    queue: VecDeque<T>,
    last_valid: Option<T>,
}

/// Drain-to-latest bounded store with a last-known-good fallback.
pub struct LatestStore<T> {
    inner: Mutex<LatestInner<T>>,
    capacity: usize,
    available: AtomicBool,
}

impl<T: Clone> LatestStore<T> {
    /// Create a store holding at most `capacity` unread entries.
    ///
    /// `capacity` of zero is promoted to one; a store that can hold nothing
    /// cannot satisfy the latest-value contract.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LatestInner {
                queue: VecDeque::with_capacity(capacity.max(1)),
                last_valid: None,
            }),
            capacity: capacity.max(1),
            available: AtomicBool::new(false),
        }
    }

    /// Store a reading. Never blocks the writer and never fails; when the
    /// backlog is full the single oldest unread entry is discarded first.
    pub fn put(&self, value: T) {
        let mut inner = self.lock();
        if inner.queue.len() == self.capacity {
            inner.queue.pop_front();
        }
        inner.queue.push_back(value);
    }

    /// Non-blocking read of the most recent reading.
    ///
    /// Drains the backlog down to its newest entry, remembers it as the
    /// stale fallback, and returns it. Returns the fallback when the live
    /// queue is momentarily empty, and `None` only if nothing has ever been
    /// written.
    pub fn latest(&self) -> Option<T> {
        let mut inner = self.lock();
        if let Some(newest) = inner.queue.pop_back() {
            inner.queue.clear();
            inner.last_valid = Some(newest);
        }
        inner.last_valid.clone()
    }

    /// Drain the backlog in arrival order (oldest first), at most
    /// `capacity` entries. The newest drained entry becomes the stale
    /// fallback for subsequent [`latest`](Self::latest) calls.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.lock();
        let drained: Vec<T> = inner.queue.drain(..).collect();
        if let Some(newest) = drained.last() {
            inner.last_valid = Some(newest.clone());
        }
        drained
    }

    /// Number of unread entries currently queued.
    pub fn backlog(&self) -> usize {
        self.lock().queue.len()
    }

    /// Publish the owning worker's connection state.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Connection state as last published by the owning worker.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LatestInner<T>> {
        // A poisoned store mutex means a writer panicked mid-put; the queue
        // itself is still structurally sound, so keep serving readers.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Fixed-capacity ring buffer with peek-last semantics.
///
/// Used for frame channels where the reader only ever wants the newest
/// payload but a short tail is kept for snapshot policies.
pub struct FrameRing<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    available: AtomicBool,
}

impl<T: Clone> FrameRing<T> {
    /// Create a ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            available: AtomicBool::new(false),
        }
    }

    /// Push an entry, evicting the oldest when full. Never blocks.
    pub fn push(&self, value: T) {
        let mut ring = self.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(value);
    }

    /// Clone of the newest entry without consuming it.
    pub fn peek_last(&self) -> Option<T> {
        self.lock().back().cloned()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the ring currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Publish the owning worker's connection state.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Connection state as last published by the owning worker.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
