//! Device assembly and shared addressing state.
//!
//! A [`DeviceContext`] owns everything one instrument exposes to its
//! clients: the timebase, the acquisition ring, the trigger log, the
//! controller registry, and the two background tasks that keep them fed
//! (the FIFO drain loop and the hardware event pump). Clients are cheap
//! handles minted with [`DeviceContext::client`]; the context lives behind
//! an `Arc` and is shared by all of them.
//!
//! Synchronous reads from every client go through one device-global read
//! gate. The gate serializes position resolution against the shared cursor
//! and lets an out-of-band [`set_position_request`](DeviceContext::set_position_request)
//! land atomically between two reads instead of in the middle of one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dod_core::config::DeviceConfig;
use dod_core::position::{
    AccessMode, CircularController, ControllerRegistry, ControllerSettings, ControllerShared,
    PositionController, PositionRequest, SegmentedController,
};
use dod_core::timebase::TimebaseConverter;
use dod_core::trigger::TriggerLog;
use dod_core::{CircularBuffer, DeviceProfile, DodError, DodResult};
use dod_hardware::bus::{regs, BurstPort, InterruptSource, RegisterBus};
use dod_hardware::drain::{DrainConfig, DrainStatus, FifoDrainLoop};
use dod_hardware::events::{EventPump, EventPumpConfig, EventWorker};

/// Hardware trigger history depth. Deep enough to survive a burst of
/// events between two event-mode resolutions.
const TRIGGER_LOG_DEPTH: usize = 64;

// =============================================================================
// Hardware Handles
// =============================================================================

/// The three hardware faces one instrument presents.
///
/// Production wires these to the register BAR, the DMA engine and the
/// interrupt block of a physical board; tests pass three clones of a
/// `MockBpm`.
#[derive(Clone)]
pub struct HardwareHandles {
    /// Memory-mapped control and status registers.
    pub bus: Arc<dyn RegisterBus>,
    /// FIFO depth, data waits and DMA transfers.
    pub port: Arc<dyn BurstPort>,
    /// Latched hardware event source.
    pub interrupts: Arc<dyn InterruptSource>,
}

impl std::fmt::Debug for HardwareHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareHandles").finish_non_exhaustive()
    }
}

// =============================================================================
// Addressing State
// =============================================================================

/// An out-of-band repositioning request, applied to the next read.
#[derive(Debug, Clone, Copy)]
struct PendingSeek {
    mode: AccessMode,
    position: u64,
}

/// Where the next sequential read continues from, tagged with the
/// addressing epoch it was produced under. A machine-time re-anchor bumps
/// the epoch, so a stale cursor fails the read instead of silently
/// addressing the wrong data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CursorMark {
    pub(crate) position: u64,
    pub(crate) epoch: u64,
}

/// State behind the device-global read gate.
#[derive(Debug, Default)]
pub(crate) struct ReadCursor {
    pub(crate) mark: Option<CursorMark>,
}

/// Background tasks of a started device.
#[derive(Debug, Default)]
struct TaskSet {
    drain: Option<JoinHandle<DodResult<u64>>>,
    pump: Option<EventPump>,
}

// =============================================================================
// Device Context
// =============================================================================

/// One acquisition device: core state, hardware handles and background
/// tasks, shared by every client of the instrument.
pub struct DeviceContext {
    name: String,
    profile: DeviceProfile,
    timebase: Arc<TimebaseConverter>,
    ring: Arc<CircularBuffer>,
    trigger_log: Arc<TriggerLog>,
    registry: Arc<ControllerRegistry>,
    shared: ControllerShared,
    main_controller: Arc<dyn PositionController>,
    hardware: HardwareHandles,
    queue: dod_core::config::QueueSection,
    drain_status: Arc<DrainStatus>,
    drain: Mutex<Option<FifoDrainLoop>>,
    tasks: Mutex<TaskSet>,
    /// Serializes synchronous reads device-wide and guards their cursor.
    read_gate: tokio::sync::Mutex<ReadCursor>,
    pending: Mutex<Option<PendingSeek>>,
    epoch: AtomicU64,
}

impl DeviceContext {
    /// Assemble a device from its configuration and hardware handles.
    ///
    /// Reads the identification register, claims the acquisition engine via
    /// the control register and builds the full core stack. Background
    /// tasks are not running yet; call [`start`](Self::start) from within a
    /// runtime to spawn them.
    pub fn open(config: &DeviceConfig, hardware: HardwareHandles) -> DodResult<Arc<Self>> {
        let profile = config.device.profile;
        let ident = hardware.bus.read_register(regs::IDENT)?;
        info!(
            device = %config.device.name,
            %profile,
            ident = format_args!("{ident:#010x}"),
            "opening device"
        );

        let decimation = u64::from(config.timebase.decimation_for(profile));
        let timebase = Arc::new(TimebaseConverter::new(
            config.timebase.lst_frequency_hz,
            config.timebase.lmt_frequency_hz,
            decimation,
            config.timebase.ratio(),
        )?);
        let (ring, writer) = CircularBuffer::new(
            config.buffer.capacity_atoms,
            profile.atom_size(),
            config.buffer.dead_zone_for(profile),
        )?;
        let trigger_log = Arc::new(TriggerLog::new(TRIGGER_LOG_DEPTH));
        let registry = Arc::new(ControllerRegistry::new());

        let shared = ControllerShared {
            timebase: Arc::clone(&timebase),
            ring: Arc::clone(&ring),
            trigger_log: Arc::clone(&trigger_log),
            profile,
            settings: ControllerSettings {
                timeout: config.controller.timeout,
                max_look_ahead: config.controller.max_look_ahead,
                max_read_size: config.controller.max_read_size,
                atom_period_lmt: decimation.max(1),
            },
        };
        let main_controller: Arc<dyn PositionController> = if profile.uses_segmented_addressing() {
            SegmentedController::new(shared.clone())
        } else {
            CircularController::new(shared.clone())
        };
        registry.register(&main_controller);

        let (drain, drain_status) = FifoDrainLoop::new(
            Arc::clone(&hardware.port),
            writer,
            DrainConfig {
                burst_capacity: config.drain.burst_capacity,
                poll_interval: config.drain.poll_interval,
                max_idle_polls: config.drain.max_idle_polls,
                predecimate: config.drain.predecimate,
                decimation: config.timebase.decimation_for(profile),
                atom_size: profile.atom_size(),
            },
        )?;
        hardware.bus.write_register(regs::CONTROL, regs::CONTROL_ACQUIRE)?;

        Ok(Arc::new(Self {
            name: config.device.name.clone(),
            profile,
            timebase,
            ring,
            trigger_log,
            registry,
            shared,
            main_controller,
            hardware,
            queue: config.queue.clone(),
            drain_status,
            drain: Mutex::new(Some(drain)),
            tasks: Mutex::new(TaskSet::default()),
            read_gate: tokio::sync::Mutex::new(ReadCursor::default()),
            pending: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }))
    }

    /// Spawn the drain loop and the event pump. Must run inside a Tokio
    /// runtime. A second call fails with `InvalidArgument`.
    pub fn start(&self) -> DodResult<()> {
        let drain = self
            .drain
            .lock()
            .take()
            .ok_or_else(|| DodError::InvalidArgument("device already started".into()))?;
        let worker = EventWorker::new(
            Arc::clone(&self.timebase),
            Arc::clone(&self.trigger_log),
            Arc::clone(&self.registry),
            self.profile,
        );
        let mut tasks = self.tasks.lock();
        tasks.drain = Some(tokio::spawn(drain.run()));
        tasks.pump = Some(worker.spawn(
            Arc::clone(&self.hardware.interrupts),
            EventPumpConfig::default(),
        ));
        info!(device = %self.name, "acquisition started");
        Ok(())
    }

    /// Stop both background tasks and wait for them. Idempotent; a device
    /// that was never started returns immediately.
    pub async fn shutdown(&self) {
        let (drain, pump) = {
            let mut tasks = self.tasks.lock();
            (tasks.drain.take(), tasks.pump.take())
        };
        self.drain_status.request_stop();
        if let Some(pump) = pump {
            pump.shutdown().await;
        }
        if let Some(handle) = drain {
            match handle.await {
                Ok(Ok(atoms)) => info!(device = %self.name, atoms, "drain loop stopped"),
                Ok(Err(err)) => warn!(device = %self.name, %err, "drain loop ended with error"),
                Err(err) => warn!(device = %self.name, %err, "drain task join failed"),
            }
        }
    }

    /// Mint a client handle for this device.
    #[must_use]
    pub fn client(self: &Arc<Self>) -> crate::client::DodClient {
        crate::client::DodClient::new(Arc::clone(self))
    }

    // =========================================================================
    // Addressing
    // =========================================================================

    /// Queue an out-of-band repositioning request. The next synchronous
    /// read resolves from `(mode, position)` instead of continuing from the
    /// cursor; only the latest request survives until then.
    pub fn set_position_request(&self, mode: AccessMode, position: u64) {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            debug!(device = %self.name, "replacing unconsumed position request");
        }
        *pending = Some(PendingSeek { mode, position });
    }

    /// Pause every controller ahead of a machine-time change. Waiters park
    /// until [`complete_time_change`](Self::complete_time_change) re-enables
    /// them.
    pub fn announce_time_change(&self) {
        self.registry.broadcast_enable(false);
        debug!(device = %self.name, "time change announced, controllers paused");
    }

    /// Re-anchor machine time at `anchor_lmt`, bump the addressing epoch
    /// and resume the controllers. Cursors and in-flight reads from before
    /// the change fail with `StalePosition`.
    pub fn complete_time_change(&self, anchor_lmt: u64) {
        *self.pending.lock() = None;
        self.registry.broadcast_reset(anchor_lmt);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.registry.broadcast_enable(true);
        info!(device = %self.name, anchor_lmt, epoch, "machine time re-anchored");
    }

    /// Current addressing epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Build the request for a synchronous read, consuming any pending
    /// repositioning. Precedence: pending request, explicit position, then
    /// the sequential cursor. The session offset shifts fresh resolutions
    /// only; a cursor continuation already sits past the previous chunk, so
    /// re-applying the offset would shear consecutive reads apart. A cursor
    /// from an older epoch fails with `StalePosition` and the caller
    /// recovers by seeking explicitly.
    pub(crate) fn resolve_read_start(
        &self,
        cursor: &ReadCursor,
        explicit: Option<u64>,
        session_mode: AccessMode,
        session_offset: i64,
        read_size: usize,
        epoch: u64,
    ) -> DodResult<PositionRequest> {
        if let Some(seek) = self.pending.lock().take() {
            debug!(device = %self.name, mode = %seek.mode, position = seek.position, "applying position request");
            return Ok(PositionRequest {
                mode: seek.mode,
                position: seek.position,
                offset: session_offset,
                read_size,
            });
        }
        if let Some(position) = explicit {
            return Ok(PositionRequest {
                mode: session_mode,
                position,
                offset: session_offset,
                read_size,
            });
        }
        match cursor.mark {
            Some(mark) if mark.epoch == epoch => Ok(PositionRequest {
                mode: AccessMode::Position,
                position: mark.position,
                offset: 0,
                read_size,
            }),
            Some(_) => Err(DodError::StalePosition),
            None => Ok(PositionRequest {
                mode: session_mode,
                position: 0,
                offset: session_offset,
                read_size,
            }),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Configured device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device family being served.
    #[must_use]
    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// The acquisition ring.
    #[must_use]
    pub fn ring(&self) -> &Arc<CircularBuffer> {
        &self.ring
    }

    /// Decoded hardware event history.
    #[must_use]
    pub fn trigger_log(&self) -> &Arc<TriggerLog> {
        &self.trigger_log
    }

    /// Timebase conversion constants.
    #[must_use]
    pub fn timebase(&self) -> &Arc<TimebaseConverter> {
        &self.timebase
    }

    /// Registry of live position controllers.
    #[must_use]
    pub fn registry(&self) -> &Arc<ControllerRegistry> {
        &self.registry
    }

    /// Drain loop status flags.
    #[must_use]
    pub fn drain_status(&self) -> &Arc<DrainStatus> {
        &self.drain_status
    }

    pub(crate) fn settings(&self) -> &ControllerSettings {
        &self.shared.settings
    }

    pub(crate) fn queue_section(&self) -> &dod_core::config::QueueSection {
        &self.queue
    }

    pub(crate) fn main_controller(&self) -> &Arc<dyn PositionController> {
        &self.main_controller
    }

    pub(crate) fn read_gate(&self) -> &tokio::sync::Mutex<ReadCursor> {
        &self.read_gate
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("name", &self.name)
            .field("profile", &self.profile)
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
