//! Pre-allocated chunk buffers for steady-state acquisition.
//!
//! A continuous acquisition session copies atom runs out of the device ring
//! and fans them out to one stream queue per consumer. Allocating a fresh
//! `Vec<u8>` per run would put the allocator on the hot path, so the pump
//! draws fixed-size buffers from a [`ChunkPool`] instead. A filled buffer is
//! frozen into [`bytes::Bytes`] for zero-copy sharing across queues; when
//! the last `Bytes` clone drops, the buffer returns to the pool.
//!
//! Backpressure falls out of the pool size: when every chunk is in flight,
//! `try_acquire` fails and the pump must wait or drop, which is exactly the
//! overflow decision the queue policies already encode.

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::trace;

/// Errors returned by the acquire methods of [`ChunkPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkPoolError {
    /// Every chunk is currently in flight.
    #[error("chunk pool exhausted")]
    Exhausted,
    /// The timeout elapsed before a chunk was returned.
    #[error("timed out waiting for a free chunk")]
    AcquireTimeout,
}

/// Point-in-time counters for a [`ChunkPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPoolStats {
    /// Chunks currently available for acquisition.
    pub available: usize,
    /// Total chunks owned by the pool.
    pub total: usize,
    /// Size of each chunk in bytes.
    pub chunk_size: usize,
    /// Chunks handed out since the pool was created.
    pub total_acquires: u64,
    /// Chunks returned since the pool was created.
    pub total_returns: u64,
}

struct PoolInner {
    free: SegQueue<Vec<u8>>,
    /// One permit per free chunk; acquire paths consume a permit, drop
    /// paths add one back.
    semaphore: Semaphore,
    chunk_size: usize,
    total: usize,
    available: AtomicUsize,
    total_acquires: AtomicU64,
    total_returns: AtomicU64,
}

impl PoolInner {
    fn return_chunk(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.free.push(buffer);
        self.available.fetch_add(1, Ordering::Relaxed);
        self.total_returns.fetch_add(1, Ordering::Relaxed);
        self.semaphore.add_permits(1);
    }
}

/// Fixed-size pool of reusable chunk buffers.
///
/// Cloning the pool is cheap; all clones share the same free list.
#[derive(Clone)]
pub struct ChunkPool {
    inner: Arc<PoolInner>,
}

impl ChunkPool {
    /// Create a pool of `count` chunks of `chunk_size` bytes each.
    ///
    /// All buffers are allocated up front.
    ///
    /// # Panics
    ///
    /// Panics if `count` or `chunk_size` is 0.
    #[must_use]
    pub fn new(count: usize, chunk_size: usize) -> Self {
        assert!(count > 0, "chunk pool must hold at least one chunk");
        assert!(chunk_size > 0, "chunk size must be greater than 0");

        let free = SegQueue::new();
        for _ in 0..count {
            free.push(Vec::with_capacity(chunk_size));
        }

        Self {
            inner: Arc::new(PoolInner {
                free,
                semaphore: Semaphore::new(count),
                chunk_size,
                total: count,
                available: AtomicUsize::new(count),
                total_acquires: AtomicU64::new(0),
                total_returns: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a chunk without waiting.
    pub fn try_acquire(&self) -> Result<PooledChunk, ChunkPoolError> {
        let permit = self
            .inner
            .semaphore
            .try_acquire()
            .map_err(|_| ChunkPoolError::Exhausted)?;
        permit.forget();
        Ok(self.take_free())
    }

    /// Acquire a chunk, waiting until one is returned.
    pub async fn acquire(&self) -> PooledChunk {
        // The semaphore is never closed, so acquire can only fail if the
        // pool itself has been dropped, which the Arc prevents.
        if let Ok(permit) = self.inner.semaphore.acquire().await {
            permit.forget();
        }
        self.take_free()
    }

    /// Acquire a chunk, waiting up to `timeout` for one to be returned.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledChunk, ChunkPoolError> {
        match tokio::time::timeout(timeout, self.inner.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(self.take_free())
            }
            Ok(Err(_)) | Err(_) => Err(ChunkPoolError::AcquireTimeout),
        }
    }

    fn take_free(&self) -> PooledChunk {
        // A permit has been consumed, so the free list cannot be empty.
        let buffer = match self.inner.free.pop() {
            Some(buffer) => buffer,
            None => Vec::with_capacity(self.inner.chunk_size),
        };
        self.inner.available.fetch_sub(1, Ordering::Relaxed);
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
        trace!(
            available = self.inner.available.load(Ordering::Relaxed),
            "chunk acquired"
        );
        PooledChunk {
            buffer: Some(buffer),
            len: 0,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Size of each chunk in bytes.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Chunks currently available for acquisition.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    /// Snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> ChunkPoolStats {
        ChunkPoolStats {
            available: self.inner.available.load(Ordering::Relaxed),
            total: self.inner.total,
            chunk_size: self.inner.chunk_size,
            total_acquires: self.inner.total_acquires.load(Ordering::Relaxed),
            total_returns: self.inner.total_returns.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("total", &self.inner.total)
            .field("chunk_size", &self.inner.chunk_size)
            .field("available", &self.available())
            .finish()
    }
}

/// A chunk on loan from a [`ChunkPool`].
///
/// Returns to the pool on drop, or transfers ownership into `Bytes` via
/// [`freeze`](Self::freeze).
pub struct PooledChunk {
    /// `None` only after `freeze` has taken the buffer.
    buffer: Option<Vec<u8>>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PooledChunk {
    /// Fill the chunk from `src`, replacing any previous contents.
    ///
    /// # Panics
    ///
    /// Panics if `src` is longer than the chunk capacity.
    pub fn copy_from_slice(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.pool.chunk_size,
            "source of {} bytes exceeds chunk size {}",
            src.len(),
            self.pool.chunk_size
        );
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.clear();
            buffer.extend_from_slice(src);
            self.len = src.len();
        }
    }

    /// Resize the chunk to `len` bytes (zero-filling any growth) and borrow
    /// the contents mutably, so callers can fill the chunk in place instead
    /// of staging through a temporary buffer.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the chunk capacity.
    pub fn resize(&mut self, len: usize) -> &mut [u8] {
        assert!(
            len <= self.pool.chunk_size,
            "requested {} bytes exceeds chunk size {}",
            len,
            self.pool.chunk_size
        );
        let buffer = self.buffer.get_or_insert_with(Vec::new);
        buffer.resize(len, 0);
        self.len = len;
        &mut buffer[..len]
    }

    /// The filled portion of the chunk.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self.buffer.as_ref() {
            Some(buffer) => &buffer[..self.len.min(buffer.len())],
            None => &[],
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no bytes have been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity of the underlying buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.chunk_size
    }

    /// Convert the chunk into shareable [`Bytes`] without copying.
    ///
    /// The returned `Bytes` can be cloned into any number of stream queues;
    /// the buffer returns to the pool when the last clone drops.
    #[must_use]
    pub fn freeze(mut self) -> Bytes {
        let buffer = self.buffer.take().unwrap_or_default();
        let owner = ChunkOwner {
            buffer,
            len: self.len,
            pool: Arc::clone(&self.pool),
        };
        Bytes::from_owner(owner)
    }
}

impl Drop for PooledChunk {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.return_chunk(buffer);
        }
    }
}

impl std::fmt::Debug for PooledChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledChunk")
            .field("len", &self.len)
            .field("capacity", &self.pool.chunk_size)
            .finish()
    }
}

/// Owner type behind [`PooledChunk::freeze`]; returns the buffer to the
/// pool when the last `Bytes` clone drops.
struct ChunkOwner {
    buffer: Vec<u8>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl AsRef<[u8]> for ChunkOwner {
    fn as_ref(&self) -> &[u8] {
        &self.buffer[..self.len.min(self.buffer.len())]
    }
}

impl Drop for ChunkOwner {
    fn drop(&mut self) {
        self.pool.return_chunk(std::mem::take(&mut self.buffer));
    }
}
