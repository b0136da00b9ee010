#![allow(unsafe_code)]
//! Atom-granular circular acquisition buffer.
//!
//! The hardware drain appends fixed-size atoms at a monotonically increasing
//! write position; position controllers resolve requests into absolute atom
//! positions and copy validated ranges out. The buffer never blocks the
//! writer: when readers fall behind, their data is overwritten and the read
//! fails validation instead.
//!
//! # Addressing
//!
//! Positions count atoms since the acquisition started and never wrap. The
//! physical slot of a position is `position & (capacity - 1)`, which is why
//! the capacity must be a power of two ([`RingIndex`] enforces this).
//!
//! # Thread Safety
//!
//! - **Writes**: a single [`RingWriter`] owns the mutation path; it is not
//!   cloneable and `write_atoms` takes `&mut self`.
//! - **Reads**: lock-free. Readers load the write position with `Acquire`
//!   ordering, copy, then re-validate: a range the writer lapped during the
//!   copy is reported as overwritten rather than returned torn.
//! - **Dead zone**: the slots immediately behind the write position are
//!   treated as unreadable because an in-flight burst may still be landing
//!   there. Validation checks the dead zone before anything else.

use crate::error::{DodError, DodResult};
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// =============================================================================
// Index Arithmetic
// =============================================================================

/// Power-of-two modular index over absolute atom positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingIndex {
    capacity: u64,
    mask: u64,
}

impl RingIndex {
    /// Build an index for a power-of-two capacity.
    pub fn new(capacity: u64) -> DodResult<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(DodError::InvalidArgument(format!(
                "ring capacity must be a nonzero power of two, got {capacity}"
            )));
        }
        Ok(Self {
            capacity,
            mask: capacity - 1,
        })
    }

    /// Capacity in atoms.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Physical slot of an absolute position.
    #[must_use]
    pub fn physical(&self, position: u64) -> u64 {
        position & self.mask
    }

    /// Atoms from a position's physical slot to the wrap point.
    #[must_use]
    pub fn to_wrap(&self, position: u64) -> u64 {
        self.capacity - self.physical(position)
    }
}

// =============================================================================
// Read Validation
// =============================================================================

/// Outcome of checking a read range against the current write position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCheck {
    /// The whole range is written and outside the dead zone.
    Ready,
    /// The range extends past the write frontier by `gap` atoms.
    TooEarly {
        /// Atoms still missing before the range completes.
        gap: u64,
    },
    /// The start of the range has been overwritten or sits in the dead zone.
    Overwritten,
}

// =============================================================================
// Buffer
// =============================================================================

/// Shared circular buffer of acquisition atoms.
///
/// Created together with its single [`RingWriter`] by [`CircularBuffer::new`].
/// Share the `Arc` freely with readers; hand the writer to the drain loop.
pub struct CircularBuffer {
    index: RingIndex,
    atom_size: usize,
    dead_zone: u64,
    slab: Box<[UnsafeCell<u8>]>,
    /// Atoms written since the start, published with `Release` after the
    /// copy so readers never observe a position ahead of its data.
    write_pos: AtomicU64,
    advanced: Notify,
}

impl std::fmt::Debug for CircularBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircularBuffer")
            .field("capacity", &self.index.capacity())
            .field("atom_size", &self.atom_size)
            .field("dead_zone", &self.dead_zone)
            .field("write_pos", &self.write_position())
            .finish()
    }
}

// SAFETY: the slab is only mutated through the single RingWriter, which takes
// `&mut self`, and every mutation is published by a Release store of
// `write_pos`. Readers load `write_pos` with Acquire before touching slab
// bytes and re-validate after copying, so a racing overwrite is detected and
// the torn copy discarded rather than returned.
unsafe impl Send for CircularBuffer {}

// SAFETY: see the Send impl; the same writer/reader discipline makes shared
// references across threads safe.
unsafe impl Sync for CircularBuffer {}

impl CircularBuffer {
    /// Allocate a buffer of `capacity` atoms of `atom_size` bytes each.
    ///
    /// `dead_zone` atoms behind the write position are unreadable; it must be
    /// smaller than the capacity and at least as large as the biggest burst
    /// the drain will land in one transfer.
    pub fn new(
        capacity: u64,
        atom_size: usize,
        dead_zone: u64,
    ) -> DodResult<(Arc<Self>, RingWriter)> {
        let index = RingIndex::new(capacity)?;
        if atom_size == 0 {
            return Err(DodError::InvalidArgument("atom size must be nonzero".into()));
        }
        if dead_zone >= capacity {
            return Err(DodError::InvalidArgument(format!(
                "dead zone {dead_zone} must be smaller than the capacity {capacity}"
            )));
        }
        let byte_len = usize::try_from(capacity)
            .ok()
            .and_then(|atoms| atoms.checked_mul(atom_size))
            .ok_or_else(|| {
                DodError::InvalidArgument(format!(
                    "{capacity} atoms of {atom_size} bytes exceed the address space"
                ))
            })?;

        let slab: Box<[UnsafeCell<u8>]> = (0..byte_len).map(|_| UnsafeCell::new(0)).collect();
        let ring = Arc::new(Self {
            index,
            atom_size,
            dead_zone,
            slab,
            write_pos: AtomicU64::new(0),
            advanced: Notify::new(),
        });
        let writer = RingWriter {
            ring: Arc::clone(&ring),
        };
        Ok((ring, writer))
    }

    /// Capacity in atoms.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.index.capacity()
    }

    /// Size of one atom in bytes.
    #[must_use]
    pub fn atom_size(&self) -> usize {
        self.atom_size
    }

    /// Width of the unreadable zone behind the write position, in atoms.
    #[must_use]
    pub fn dead_zone(&self) -> u64 {
        self.dead_zone
    }

    /// The modular index over this buffer's capacity.
    #[must_use]
    pub fn index(&self) -> RingIndex {
        self.index
    }

    /// Atoms written since the acquisition started.
    #[must_use]
    pub fn write_position(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Atoms from `position` to the wrap point. A burst transfer must not
    /// cross the wrap, so the drain caps each transfer at this value.
    #[must_use]
    pub fn contiguous_free(&self, position: u64) -> u64 {
        self.index.to_wrap(position)
    }

    /// Check `count` atoms starting at `position` against the current write
    /// position.
    #[must_use]
    pub fn validate_read(&self, position: u64, count: u64) -> ReadCheck {
        self.check(position, count, self.write_position())
    }

    /// Validation against an explicit write position. `u128` arithmetic so
    /// positions near `u64::MAX` cannot wrap the comparison.
    fn check(&self, position: u64, count: u64, write: u64) -> ReadCheck {
        let pos = u128::from(position);
        let end = pos + u128::from(count);
        let write = u128::from(write);
        // The oldest readable atom is write + dead_zone - capacity; anything
        // older is overwritten or about to be. Checked first: a lapped reader
        // must see Overwritten, not TooEarly.
        if pos + u128::from(self.index.capacity()) < write + u128::from(self.dead_zone) {
            return ReadCheck::Overwritten;
        }
        if end > write {
            let gap = u64::try_from(end - write).unwrap_or(u64::MAX);
            return ReadCheck::TooEarly { gap };
        }
        ReadCheck::Ready
    }

    /// Copy `count` atoms starting at `position` into `dst`.
    ///
    /// `dst` must be exactly `count * atom_size` bytes. Fails with
    /// [`DodError::Retry`] when the range is not fully written yet and
    /// [`DodError::NoData`] when it has been overwritten, including the case
    /// where the writer lapped the range while the copy was in flight.
    pub fn read_into(&self, position: u64, count: u64, dst: &mut [u8]) -> DodResult<()> {
        let byte_len = usize::try_from(count)
            .ok()
            .and_then(|atoms| atoms.checked_mul(self.atom_size))
            .ok_or_else(|| DodError::InvalidArgument("read size exceeds the address space".into()))?;
        if dst.len() != byte_len {
            return Err(DodError::InvalidArgument(format!(
                "destination is {} bytes but {count} atoms need {byte_len}",
                dst.len()
            )));
        }
        if count > self.index.capacity() {
            return Err(DodError::InvalidArgument(format!(
                "read of {count} atoms exceeds the capacity {}",
                self.index.capacity()
            )));
        }
        if count == 0 {
            return Ok(());
        }
        match self.validate_read(position, count) {
            ReadCheck::Ready => {}
            ReadCheck::TooEarly { .. } => return Err(DodError::Retry),
            ReadCheck::Overwritten => return Err(DodError::NoData),
        }

        let offset = self.index.physical(position) as usize * self.atom_size;
        let first = byte_len.min(self.slab.len() - offset);
        // SAFETY: offset < slab.len() because the physical slot is reduced
        // modulo the capacity, and first is capped at slab.len() - offset, so
        // both source ranges stay inside the slab. dst is exactly byte_len
        // bytes (checked above) and does not alias the slab.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base_ptr().add(offset), dst.as_mut_ptr(), first);
            if first < byte_len {
                std::ptr::copy_nonoverlapping(
                    self.base_ptr(),
                    dst.as_mut_ptr().add(first),
                    byte_len - first,
                );
            }
        }

        // Loads may reorder past the copy on weakly ordered machines; fence
        // before re-reading the write position.
        fence(Ordering::SeqCst);
        match self.validate_read(position, count) {
            ReadCheck::Overwritten => Err(DodError::NoData),
            _ => Ok(()),
        }
    }

    /// Wait until the write position reaches `target` atoms.
    ///
    /// Fails with [`DodError::Timeout`] when the writer does not get there
    /// within `timeout`.
    pub async fn wait_for_position(&self, target: u64, timeout: Duration) -> DodResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so an advance between the
            // check and the await is not lost.
            let notified = self.advanced.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.write_position() >= target {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(DodError::Timeout);
            }
        }
    }

    fn base_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.slab.as_ptr())
    }
}

// =============================================================================
// Writer
// =============================================================================

/// The single mutation handle for a [`CircularBuffer`].
///
/// Exactly one exists per buffer; it is deliberately not `Clone`.
#[derive(Debug)]
pub struct RingWriter {
    ring: Arc<CircularBuffer>,
}

impl RingWriter {
    /// The buffer this writer appends to.
    #[must_use]
    pub fn ring(&self) -> &Arc<CircularBuffer> {
        &self.ring
    }

    /// Append whole atoms and publish the new write position.
    ///
    /// `data` must be a multiple of the atom size and at most one capacity's
    /// worth of atoms. Returns the write position after the append.
    pub fn write_atoms(&mut self, data: &[u8]) -> DodResult<u64> {
        let atom_size = self.ring.atom_size;
        if data.len() % atom_size != 0 {
            return Err(DodError::InvalidArgument(format!(
                "{} bytes is not a whole number of {atom_size}-byte atoms",
                data.len()
            )));
        }
        let count = (data.len() / atom_size) as u64;
        if count > self.ring.index.capacity() {
            return Err(DodError::InvalidArgument(format!(
                "write of {count} atoms exceeds the capacity {}",
                self.ring.index.capacity()
            )));
        }
        // Relaxed: this writer is the only mutator of write_pos.
        let pos = self.ring.write_pos.load(Ordering::Relaxed);
        let next = pos.checked_add(count).ok_or_else(|| {
            DodError::OutOfRange("write position overflows the atom counter".into())
        })?;

        if !data.is_empty() {
            let offset = self.ring.index.physical(pos) as usize * atom_size;
            let first = data.len().min(self.ring.slab.len() - offset);
            // SAFETY: offset is inside the slab (physical slot times the atom
            // size), first is capped at the bytes remaining before the wrap,
            // and the remainder lands at the slab start. data does not alias
            // the slab.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    self.ring.base_ptr().add(offset),
                    first,
                );
                if first < data.len() {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr().add(first),
                        self.ring.base_ptr(),
                        data.len() - first,
                    );
                }
            }
        }

        // Release publishes the copied bytes together with the new position.
        self.ring.write_pos.store(next, Ordering::Release);
        self.ring.advanced.notify_waiters();
        Ok(next)
    }

    /// Drop all content and restart the position counter at zero.
    ///
    /// Used when the acquisition re-anchors; readers holding old positions
    /// must be reset through the device epoch, not through the ring.
    pub fn clear(&mut self) {
        self.ring.write_pos.store(0, Ordering::Release);
        self.ring.advanced.notify_waiters();
    }
}
