//! `dod-core`
//!
//! Core types and algorithms for data-on-demand (DoD) beam-position
//! acquisition: the timebase conversion algebra, the time-indexed circular
//! buffer, the hardware trigger log, and the position-controller family that
//! turns an access-mode request into a validated absolute buffer offset.
//!
//! ## Addressing Model
//!
//! Hardware samples beam position into a fixed-size ring of atoms at a
//! decimated clock rate. Consumers do not receive a push stream; they ask a
//! [`position::PositionController`] for a slice by absolute position, by
//! machine time, by "now", or relative to a hardware trigger, and either get
//! a validated offset back or a precise reason why not ([`DodError`]).
//!
//! ## Key Types
//!
//! - [`timebase::TimebaseConverter`]: pure conversions between the four time
//!   representations (ST/MT/LST/LMT) and buffer-offset arithmetic
//! - [`ring::CircularBuffer`]: single-writer atom ring with a monotonic
//!   absolute write counter and read validation
//! - [`trigger::TriggerLog`]: fixed-depth ring of timestamped hardware events
//! - [`position`]: the Simple/Circular/Segmented controller family plus the
//!   registry that lets a timebase change reach every live clone
//! - [`config::DeviceConfig`]: TOML schema for assembling a device
//!
//! ## Example
//!
//! ```rust,no_run
//! use dod_core::timebase::{ClockRatio, TimebaseConverter};
//! # fn example() -> dod_core::DodResult<()> {
//! let tb = TimebaseConverter::new(125_000_000, 125_000_000, 64, ClockRatio::unity())?;
//! let lmt = tb.mt_to_lmt(1_000)?;
//! assert_eq!(tb.lmt_to_mt(lmt), 1_000);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod meta;
pub mod position;
pub mod profile;
pub mod ring;
pub mod timebase;
pub mod trigger;

pub use config::{load_device_config, DeviceConfig};
pub use error::{DodError, DodResult};
pub use meta::{Chunk, ChunkMeta, MetaId};
pub use profile::DeviceProfile;
pub use ring::{CircularBuffer, ReadCheck, RingIndex, RingWriter};
pub use timebase::{ClockRatio, St, TimebaseConverter, Timestamp};
pub use trigger::{EventKind, TriggerEvent, TriggerLog};
