//! Bounded stream queue and chunk pool for data-on-demand acquisition.
//!
//! This crate provides the two buffering primitives that sit between the
//! acquisition side of a device and each of its consumers:
//!
//! - [`StreamQueue<T>`]: a bounded FIFO with a pluggable full-queue policy,
//!   blocking pop with timeout, and a one-shot terminal status used for
//!   cancellation. One queue instance belongs to exactly one consumer plus
//!   the single producer task that feeds it.
//! - [`ChunkPool`]: pre-allocated byte buffers with automatic return on drop
//!   via `bytes::Bytes`, so steady-state continuous acquisition does not
//!   allocate per chunk.
//!
//! # Cancellation Model
//!
//! `cancel(code)` installs a permanent terminal status and wakes every
//! blocked `pop()`. From that point on the queue is inert: every `pop()`
//! returns [`PopError::Terminated`] with the same code, `push()` returns
//! `false` without side effects, and queued entries are discarded. The only
//! way back is `reset()`, which the owning client calls on (re)open.
//!
//! # Example
//!
//! ```
//! use dod_queue::{OverflowPolicy, StreamQueue};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let queue = StreamQueue::new(4, OverflowPolicy::KeepOld);
//! assert!(queue.push(1u32));
//! let entry = queue.pop(Duration::from_millis(10)).await.unwrap();
//! assert_eq!(entry, 1);
//! # });
//! ```

pub mod chunk_pool;

pub use chunk_pool::{ChunkPool, PooledChunk};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

/// Behavior of [`StreamQueue::push`] when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Keep the queued entries; the incoming entry is dropped and counted
    /// as rejected. Favors consumers that must not lose history.
    #[default]
    KeepOld,
    /// Evict the oldest queued entry to make room for the incoming one;
    /// the evicted entry is counted as rejected. Favors consumers that
    /// only care about the freshest data.
    KeepNew,
}

/// Terminal status installed by [`StreamQueue::cancel`].
///
/// The code is opaque to the queue; callers map their own error taxonomy
/// onto it and back. Once installed it is returned by every subsequent
/// `pop()` until `reset()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TerminalCode(pub i32);

impl TerminalCode {
    /// Orderly shutdown by the owning client.
    pub const CLOSED: TerminalCode = TerminalCode(1);
}

impl fmt::Display for TerminalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors returned by [`StreamQueue::pop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PopError {
    /// The timeout elapsed with the queue still empty and open.
    #[error("pop timed out with the queue still empty")]
    Timeout,
    /// The queue was cancelled; the same code is returned forever.
    #[error("queue terminated with code {0}")]
    Terminated(TerminalCode),
}

/// Error returned by [`StreamQueue::set_capacity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue still holds entries or a terminal status; reset it first")]
pub struct ResizeError;

/// Monotonic queue statistics, reset only by [`StreamQueue::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Entries accepted into the queue since the last reset.
    pub total: u64,
    /// Entries dropped since the last reset: incoming entries refused under
    /// [`OverflowPolicy::KeepOld`], or queued entries evicted under
    /// [`OverflowPolicy::KeepNew`].
    pub rejected: u64,
}

struct QueueState<T> {
    entries: VecDeque<T>,
    capacity: usize,
    terminal: Option<TerminalCode>,
}

/// Bounded FIFO of `{data, meta}` entries between one producer and one
/// consumer, with a configurable full-queue policy.
///
/// All methods take `&self`; the queue is shared as `Arc<StreamQueue<T>>`
/// between the producing task and the consuming client.
pub struct StreamQueue<T> {
    state: Mutex<QueueState<T>>,
    /// Signalled once per push, broadcast on cancel.
    available: Notify,
    policy: OverflowPolicy,
    total: AtomicU64,
    rejected: AtomicU64,
}

impl<T> StreamQueue<T> {
    /// Create a queue holding at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                terminal: None,
            }),
            available: Notify::new(),
            policy,
            total: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Enqueue an entry, applying the overflow policy when full.
    ///
    /// Returns `true` if the entry was enqueued. A `false` return means the
    /// entry was dropped: either the queue is full under
    /// [`OverflowPolicy::KeepOld`] (counted as rejected), or the queue has
    /// been cancelled (not counted; pushes after cancellation have no
    /// side effect).
    pub fn push(&self, entry: T) -> bool {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return false;
        }

        if state.entries.len() < state.capacity {
            state.entries.push_back(entry);
            self.total.fetch_add(1, Ordering::Relaxed);
            drop(state);
            self.available.notify_one();
            return true;
        }

        match self.policy {
            OverflowPolicy::KeepOld => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
            OverflowPolicy::KeepNew => {
                state.entries.pop_front();
                state.entries.push_back(entry);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.total.fetch_add(1, Ordering::Relaxed);
                drop(state);
                self.available.notify_one();
                true
            }
        }
    }

    /// Dequeue the oldest entry, waiting up to `timeout` for one to arrive.
    ///
    /// Returns [`PopError::Timeout`] if the queue stays empty, or
    /// [`PopError::Terminated`] once the queue has been cancelled. A
    /// concurrent [`cancel`](Self::cancel) unblocks the wait promptly via a
    /// broadcast wake; there is no polling loop behind this.
    pub async fn pop(&self, timeout: Duration) -> Result<T, PopError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for notification before checking state so a push or
            // cancel between the check and the await cannot be missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(code) = state.terminal {
                    return Err(PopError::Terminated(code));
                }
                if let Some(entry) = state.entries.pop_front() {
                    if !state.entries.is_empty() {
                        // Pass the wakeup along in case several pops raced.
                        self.available.notify_one();
                    }
                    return Ok(entry);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PopError::Timeout);
            }
        }
    }

    /// Install a terminal status and wake every blocked `pop()`.
    ///
    /// Queued entries are discarded; the first cancel wins and later calls
    /// are no-ops. The queue stays terminated until [`reset`](Self::reset).
    pub fn cancel(&self, code: TerminalCode) {
        let dropped;
        {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(code);
            dropped = state.entries.len();
            state.entries.clear();
        }
        self.available.notify_waiters();
        debug!(code = code.0, dropped, "stream queue cancelled");
    }

    /// Clear entries, terminal status and statistics.
    ///
    /// Called by the owning client on (re)open; not valid mid-stream.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.terminal = None;
        self.total.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }

    /// Change the capacity of an idle queue.
    ///
    /// Only valid while the queue holds no entries and no terminal status,
    /// i.e. between a `reset()` and the next session. Mid-stream resizes
    /// are refused so a consumer never observes its bound changing.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), ResizeError> {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        let mut state = self.state.lock();
        if !state.entries.is_empty() || state.terminal.is_some() {
            return Err(ResizeError);
        }
        state.capacity = capacity;
        Ok(())
    }

    /// Number of entries currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the queue currently holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Maximum number of entries the queue will hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// The terminal code, if the queue has been cancelled.
    #[must_use]
    pub fn terminal(&self) -> Option<TerminalCode> {
        self.state.lock().terminal
    }

    /// The configured full-queue policy.
    #[must_use]
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Snapshot of the monotonic counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            total: self.total.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

}

impl<T> fmt::Debug for StreamQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamQueue")
            .field("len", &state.entries.len())
            .field("capacity", &state.capacity)
            .field("terminal", &state.terminal)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_push_pop_fifo_order() {
        let queue = StreamQueue::new(4, OverflowPolicy::KeepOld);
        for i in 0..4 {
            assert!(queue.push(i));
        }
        for i in 0..4 {
            let entry = queue.pop(Duration::from_millis(10)).await.unwrap();
            assert_eq!(entry, i);
        }
    }

    #[tokio::test]
    async fn test_keep_old_drops_incoming() {
        let queue = StreamQueue::new(4, OverflowPolicy::KeepOld);
        for i in 1..=4 {
            assert!(queue.push(i));
        }
        assert!(!queue.push(5));

        let stats = queue.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.rejected, 1);

        // The original four entries are unchanged.
        let mut contents = Vec::new();
        while let Ok(entry) = queue.pop(Duration::from_millis(1)).await {
            contents.push(entry);
        }
        assert_eq!(contents, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_keep_new_evicts_oldest() {
        let queue = StreamQueue::new(4, OverflowPolicy::KeepNew);
        for i in 1..=4 {
            assert!(queue.push(i));
        }
        assert!(queue.push(5));

        let stats = queue.stats();
        assert_eq!(stats.rejected, 1);

        let mut contents = Vec::new();
        while let Ok(entry) = queue.pop(Duration::from_millis(1)).await {
            contents.push(entry);
        }
        assert_eq!(contents, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue: StreamQueue<u32> = StreamQueue::new(2, OverflowPolicy::KeepOld);
        let err = queue.pop(Duration::from_millis(5)).await.unwrap_err();
        assert_eq!(err, PopError::Timeout);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_concurrent_pop() {
        let queue: Arc<StreamQueue<u32>> = Arc::new(StreamQueue::new(2, OverflowPolicy::KeepOld));

        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(Duration::from_secs(30)).await })
        };

        // Give the popper time to park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.cancel(TerminalCode(42));

        let result = popper.await.unwrap();
        assert_eq!(result, Err(PopError::Terminated(TerminalCode(42))));

        // The terminal code repeats on every subsequent pop.
        for _ in 0..3 {
            let err = queue.pop(Duration::from_millis(1)).await.unwrap_err();
            assert_eq!(err, PopError::Terminated(TerminalCode(42)));
        }
    }

    #[tokio::test]
    async fn test_first_cancel_wins() {
        let queue: StreamQueue<u32> = StreamQueue::new(2, OverflowPolicy::KeepOld);
        queue.cancel(TerminalCode(7));
        queue.cancel(TerminalCode(8));
        let err = queue.pop(Duration::from_millis(1)).await.unwrap_err();
        assert_eq!(err, PopError::Terminated(TerminalCode(7)));
    }

    #[tokio::test]
    async fn test_push_after_cancel_has_no_effect() {
        let queue = StreamQueue::new(2, OverflowPolicy::KeepOld);
        queue.push(1);
        queue.cancel(TerminalCode::CLOSED);

        assert!(!queue.push(2));
        let stats = queue.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.rejected, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_terminal_and_stats() {
        let queue = StreamQueue::new(2, OverflowPolicy::KeepOld);
        queue.push(1);
        queue.push(2);
        queue.push(3); // rejected
        queue.cancel(TerminalCode(9));

        queue.reset();
        assert_eq!(queue.stats(), QueueStats::default());
        assert!(queue.terminal().is_none());
        assert!(queue.push(10));
        assert_eq!(queue.pop(Duration::from_millis(1)).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_resize_refused_while_active() {
        let queue = StreamQueue::new(2, OverflowPolicy::KeepOld);
        queue.push(1);
        assert!(queue.set_capacity(8).is_err());

        queue.reset();
        assert!(queue.set_capacity(8).is_ok());
        assert_eq!(queue.capacity(), 8);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue: Arc<StreamQueue<u32>> = Arc::new(StreamQueue::new(2, OverflowPolicy::KeepOld));

        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(99);

        let entry = popper.await.unwrap().unwrap();
        assert_eq!(entry, 99);
    }
}
