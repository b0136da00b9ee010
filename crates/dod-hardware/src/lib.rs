//! `dod-hardware`
//!
//! The hardware-facing edge of the data-on-demand acquisition stack:
//! collaborator traits for register, DMA and event access ([`bus`]), the
//! burst-FIFO drain loop that is the single producer into the circular
//! buffer ([`drain`]), the two-half event pump that turns latched
//! interrupts into timestamped trigger-log entries ([`events`]), and a
//! deterministic in-memory device for tests and demos ([`mock`]).
//!
//! Real drivers implement [`RegisterBus`], [`BurstPort`] and
//! [`InterruptSource`] for their bus (PCIe BAR, /dev/uio, ...) and hand
//! them to [`FifoDrainLoop`] and [`EventWorker`]; everything above those
//! traits is hardware-independent.

pub mod bus;
pub mod drain;
pub mod events;
pub mod mock;

pub use bus::{BurstPort, DmaCompletion, InterruptSource, RawEvent, RegisterBus};
pub use drain::{DrainConfig, DrainReport, DrainRequest, DrainStatus, FifoDrainLoop};
pub use events::{EventPump, EventPumpConfig, EventStats, EventWorker};
pub use mock::{DataPattern, MockBpm, MockBpmBuilder};
