//! Collaborator traits for the acquisition hardware.
//!
//! A device driver provides three narrow capabilities: register access
//! ([`RegisterBus`]), burst-FIFO data transfer ([`BurstPort`]) and event
//! line polling ([`InterruptSource`]). The drain loop and event pump are
//! written against these traits; [`crate::mock`] provides deterministic
//! in-memory implementations for tests and demos.

use async_trait::async_trait;
use dod_core::DodResult;
use tokio::time::Instant;

/// Well-known register offsets shared by the instrument family.
pub mod regs {
    /// Identity word, constant per firmware build.
    pub const IDENT: u32 = 0x00;
    /// Acquisition control word.
    pub const CONTROL: u32 = 0x04;
    /// Latched status word.
    pub const STATUS: u32 = 0x08;

    /// `CONTROL` bit: run the acquisition path.
    pub const CONTROL_ACQUIRE: u32 = 0x1;

    /// `STATUS` bit: at least one atom is waiting in the burst FIFO.
    pub const STATUS_DATA_READY: u32 = 0x1;
    /// `STATUS` bit: the burst FIFO overflowed since the last transfer.
    pub const STATUS_OVERRUN: u32 = 0x2;
}

/// Memory-mapped register access. All calls are non-blocking.
pub trait RegisterBus: Send + Sync {
    /// Read one register word.
    fn read_register(&self, offset: u32) -> DodResult<u32>;

    /// Write one register word.
    fn write_register(&self, offset: u32, value: u32) -> DodResult<()>;
}

/// Outcome of one DMA burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaCompletion {
    /// Atoms actually moved, possibly fewer than asked for.
    pub transferred_atoms: u64,
    /// The FIFO overflowed since the previous transfer and atoms were
    /// lost. The data delivered by this completion is still intact.
    pub overrun: bool,
}

/// Burst-FIFO data path between the acquisition front end and memory.
#[async_trait]
pub trait BurstPort: Send + Sync {
    /// Atoms ready for transfer, after any producer-side decimation.
    fn fifo_depth(&self) -> DodResult<u64>;

    /// Park until data is likely available or `deadline` passes. Returns
    /// without error in both cases; the caller re-checks the depth.
    async fn wait_data(&self, deadline: Instant) -> DodResult<()>;

    /// Move up to `count` atoms into `dst`. `dst` must hold `count`
    /// whole atoms.
    async fn start_dma(&self, count: u64, dst: &mut [u8]) -> DodResult<DmaCompletion>;

    /// Keep one atom in `n`, discard the rest, in the producer before the
    /// FIFO. `1` disables thinning.
    fn set_predecimation(&self, n: u32) -> DodResult<()>;
}

/// One undecoded event as read from the interrupt status registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    /// Event code as latched by hardware.
    pub code: u8,
    /// Sample-clock time the event line fired.
    pub lmt: u64,
}

/// Event line access. Polled, never blocking.
pub trait InterruptSource: Send + Sync {
    /// Drain all events latched since the previous poll, oldest first.
    fn poll_events(&self) -> DodResult<Vec<RawEvent>>;
}
