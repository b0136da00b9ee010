//! Position controllers: request resolution against the acquisition buffer.
//!
//! A [`PositionController`] turns a [`PositionRequest`] into a validated
//! absolute atom position plus canonical metadata, or a precise failure.
//! Three variants cover the device families:
//!
//! - [`SimpleController`]: flat region, position-only addressing.
//! - [`CircularController`]: free-running circular history addressed by
//!   absolute position, frontier, machine time, or next event.
//! - [`SegmentedController`]: arm/trigger segments; requests address data
//!   relative to the committed trigger of the current segment.
//!
//! Controllers for event modes are cloned per client so one client's event
//! consumption never starves another's. All live instances, clones
//! included, sit in a [`ControllerRegistry`] so a timebase change can
//! broadcast disable/reset/enable to every one of them.

mod circular;
mod segmented;
mod simple;

pub use circular::CircularController;
pub use segmented::SegmentedController;
pub use simple::SimpleController;

use crate::error::{DodError, DodResult};
use crate::meta::ChunkMeta;
use crate::profile::DeviceProfile;
use crate::ring::{CircularBuffer, ReadCheck};
use crate::timebase::TimebaseConverter;
use crate::trigger::{TriggerEvent, TriggerLog};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;

// =============================================================================
// Requests
// =============================================================================

/// How a request addresses the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Absolute atom position (segment-relative on segmented buffers).
    Position,
    /// The most recent fully written data.
    Now,
    /// A machine-time value to be converted to a position.
    ByLmt,
    /// Anchor each read at the next qualifying event, repeatedly.
    OnEvent,
    /// Anchor one read at the next qualifying event.
    SingleEvent,
}

impl AccessMode {
    /// Whether resolution waits for an event rather than addressing
    /// already-known positions.
    #[must_use]
    pub fn is_event_driven(&self) -> bool {
        matches!(self, Self::OnEvent | Self::SingleEvent)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Position => "position",
            Self::Now => "now",
            Self::ByLmt => "by_lmt",
            Self::OnEvent => "on_event",
            Self::SingleEvent => "single_event",
        };
        f.write_str(name)
    }
}

/// One resolution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRequest {
    /// Addressing mode.
    pub mode: AccessMode,
    /// Mode-dependent input: an atom position for `Position`, an LMT value
    /// for `ByLmt`, ignored otherwise.
    pub position: u64,
    /// Signed offset in atoms applied after the mode resolves a base.
    pub offset: i64,
    /// Atoms the caller intends to read at the resolved position.
    pub read_size: usize,
}

/// A successfully resolved request.
#[derive(Debug, Clone)]
pub struct ResolvedPosition {
    /// Sample-clock time of the first atom.
    pub lmt: u64,
    /// Absolute atom position of the first atom, validated readable at
    /// resolution time.
    pub absolute_position: u64,
    /// Canonical metadata for the chunk a read at this position produces.
    pub meta: ChunkMeta,
}

// =============================================================================
// Controller Trait
// =============================================================================

/// Resolves requests into validated buffer positions.
#[async_trait]
pub trait PositionController: Send + Sync {
    /// Resolve `request` into an absolute position.
    ///
    /// Blocks (bounded by the controller's timeout) for event-driven modes
    /// and for data that is not fully written yet. Synchronous modes return
    /// [`DodError::Retry`] instead of blocking on unwritten data.
    async fn get_position(&self, request: &PositionRequest) -> DodResult<ResolvedPosition>;

    /// Re-anchor the controller at `start_lmt` and clear any half-consumed
    /// event state.
    fn reset(&self, start_lmt: u64);

    /// Enable or disable resolution. Disabled controllers fail with
    /// [`DodError::Retry`] and wake any parked waiter.
    fn set_enabled(&self, enabled: bool);

    /// Whether resolution is currently enabled.
    fn is_enabled(&self) -> bool;

    /// Permanently stop the controller and wake any parked waiter; all
    /// later calls fail with [`DodError::Closed`].
    fn stop(&self);

    /// Largest read size a request may carry.
    fn max_read_size(&self) -> usize;

    /// An independent copy sharing configuration but no mutable state.
    ///
    /// The caller is responsible for registering the clone so broadcasts
    /// reach it.
    fn clone_controller(&self) -> Arc<dyn PositionController>;

    /// Feed a decoded hardware event into the controller's sequencing
    /// state. Controllers without event state ignore it.
    fn handle_event(&self, event: &TriggerEvent) {
        let _ = event;
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Tracks every live controller so timebase transitions can be broadcast.
///
/// Holds weak references; dropped controllers are pruned on the next
/// broadcast or release.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: Mutex<Vec<Weak<dyn PositionController>>>,
}

impl ControllerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a controller.
    pub fn register(&self, controller: &Arc<dyn PositionController>) {
        self.controllers.lock().push(Arc::downgrade(controller));
    }

    /// Stop tracking a controller, pruning dead entries along the way.
    pub fn release(&self, controller: &Arc<dyn PositionController>) {
        let target = Arc::as_ptr(controller).cast::<()>();
        self.controllers.lock().retain(|weak| match weak.upgrade() {
            Some(live) => Arc::as_ptr(&live).cast::<()>() != target,
            None => false,
        });
    }

    /// Enable or disable every live controller.
    pub fn broadcast_enable(&self, enabled: bool) {
        for controller in self.live() {
            controller.set_enabled(enabled);
        }
    }

    /// Re-anchor every live controller.
    pub fn broadcast_reset(&self, start_lmt: u64) {
        for controller in self.live() {
            controller.reset(start_lmt);
        }
    }

    /// Feed an event into every live controller.
    pub fn broadcast_event(&self, event: &TriggerEvent) {
        for controller in self.live() {
            controller.handle_event(event);
        }
    }

    /// Number of controllers still alive.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    fn live(&self) -> Vec<Arc<dyn PositionController>> {
        let mut list = self.controllers.lock();
        list.retain(|weak| weak.strong_count() > 0);
        list.iter().filter_map(Weak::upgrade).collect()
    }
}

impl fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("live", &self.live_count())
            .finish()
    }
}

// =============================================================================
// Shared Configuration
// =============================================================================

/// Resolution limits and clock constants, fixed at device bring-up.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// Budget for one `get_position` call, covering event and data waits.
    pub timeout: Duration,
    /// Largest gap past the write frontier a request may wait on; anything
    /// further fails with `NoData` immediately.
    pub max_look_ahead: u64,
    /// Largest read size a request may carry, in atoms.
    pub max_read_size: usize,
    /// Sample-clock ticks between consecutive atoms.
    pub atom_period_lmt: u64,
}

/// Read-only collaborators shared by all controllers of one device.
///
/// Cloning shares the `Arc`s; per-controller mutable state lives in the
/// controller variants themselves.
#[derive(Debug, Clone)]
pub struct ControllerShared {
    /// Timebase conversion constants.
    pub timebase: Arc<TimebaseConverter>,
    /// The acquisition buffer requests resolve against.
    pub ring: Arc<CircularBuffer>,
    /// Decoded hardware events.
    pub trigger_log: Arc<TriggerLog>,
    /// The device family being served.
    pub profile: DeviceProfile,
    /// Resolution limits.
    pub settings: ControllerSettings,
}

// =============================================================================
// Shared Controller State
// =============================================================================

/// Enabled/stopped flags plus the wake channel for parked waiters.
pub(crate) struct ControlState {
    enabled: AtomicBool,
    stopped: AtomicBool,
    wake: Notify,
}

impl ControlState {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// The error a call must fail with right now, if any. Stopped wins over
    /// disabled.
    pub(crate) fn bail(&self) -> Option<DodError> {
        if self.stopped.load(Ordering::Acquire) {
            Some(DodError::Closed)
        } else if !self.enabled.load(Ordering::Acquire) {
            Some(DodError::Retry)
        } else {
            None
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.wake.notify_waiters();
        }
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }
}

/// Duration left until `deadline`, or [`DodError::Timeout`] when exhausted.
pub(crate) fn remaining_until(deadline: tokio::time::Instant) -> DodResult<Duration> {
    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    if remaining.is_zero() {
        Err(DodError::Timeout)
    } else {
        Ok(remaining)
    }
}

/// Validate a request's read size against the configured maximum and the
/// ring's readable window, returning it as an atom count.
pub(crate) fn check_read_size(shared: &ControllerShared, read_size: usize) -> DodResult<u64> {
    if read_size == 0 || read_size > shared.settings.max_read_size {
        return Err(DodError::InvalidArgument(format!(
            "read size {read_size} outside 1..={}",
            shared.settings.max_read_size
        )));
    }
    let window = read_size as u64;
    let readable = shared.ring.capacity() - shared.ring.dead_zone();
    if window > readable {
        return Err(DodError::InvalidArgument(format!(
            "read of {window} atoms exceeds the {readable} readable atoms"
        )));
    }
    Ok(window)
}

/// Apply a signed atom offset to an unsigned base position.
pub(crate) fn apply_offset(base: u64, offset: i64) -> DodResult<u64> {
    let shifted = i128::from(base) + i128::from(offset);
    u64::try_from(shifted).map_err(|_| {
        DodError::OutOfRange(format!(
            "offset {offset} moves position {base} outside the buffer"
        ))
    })
}

/// Drive a resolved position through ring validation.
///
/// `wait` selects the behavior on not-yet-written data: event-driven modes
/// park on the ring (bounded by `deadline`), synchronous modes fail with
/// [`DodError::Retry`] so the caller can poll. Gaps beyond the configured
/// look-ahead and overwritten ranges fail with [`DodError::NoData`].
pub(crate) async fn settle_position(
    shared: &ControllerShared,
    control: &ControlState,
    position: u64,
    count: u64,
    wait: bool,
    deadline: tokio::time::Instant,
) -> DodResult<()> {
    let end = position.checked_add(count).ok_or_else(|| {
        DodError::OutOfRange("read range overflows the position counter".into())
    })?;
    loop {
        match shared.ring.validate_read(position, count) {
            ReadCheck::Ready => return Ok(()),
            ReadCheck::Overwritten => return Err(DodError::NoData),
            ReadCheck::TooEarly { gap } => {
                if gap > shared.settings.max_look_ahead {
                    return Err(DodError::NoData);
                }
                if !wait {
                    return Err(DodError::Retry);
                }
                let remaining = remaining_until(deadline)?;
                tokio::select! {
                    res = shared.ring.wait_for_position(end, remaining) => res?,
                    () = control.woken() => {
                        if let Some(err) = control.bail() {
                            return Err(err);
                        }
                    }
                }
            }
        }
    }
}
