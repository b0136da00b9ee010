//! Device-family profiles.
//!
//! One instrument core serves several hardware families that differ in atom
//! layout, trigger wiring, and buffer addressing. [`DeviceProfile`] collects
//! those differences behind enum dispatch so the drain loop, controllers,
//! and event worker stay family-agnostic.

use crate::trigger::EventKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hardware family an acquisition device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceProfile {
    /// Bunch-by-bunch feedback processor. Packs 5 samples per hardware atom
    /// but addresses data in 4-sample logical atoms, and acquires in
    /// arm/trigger segments.
    Bbfp,
    /// Digital pulse processor. Single-pass trigger acquisition.
    Dpp,
    /// Electron beam position processor. Time-addressed circular history.
    Ebpp,
    /// Hadron beam position processor. Segmented acquisition at a coarse
    /// decimation.
    Hbpp,
}

impl DeviceProfile {
    /// Size of one hardware atom in bytes.
    #[must_use]
    pub fn atom_size(&self) -> usize {
        match self {
            Self::Bbfp => 20,
            Self::Dpp => 8,
            Self::Ebpp => 32,
            Self::Hbpp => 16,
        }
    }

    /// Samples packed into one hardware atom.
    #[must_use]
    pub fn samples_per_atom(&self) -> u32 {
        match self {
            Self::Bbfp => 5,
            _ => 1,
        }
    }

    /// Samples in one logical atom as consumers address them. Differs from
    /// [`samples_per_atom`](Self::samples_per_atom) only on families that
    /// repack on readout.
    #[must_use]
    pub fn logical_atom_samples(&self) -> u32 {
        match self {
            Self::Bbfp => 4,
            _ => 1,
        }
    }

    /// Default width of the ring's unreadable zone behind the write
    /// position, in atoms, for a given ring capacity.
    #[must_use]
    pub fn dead_zone(&self, capacity: u64) -> u64 {
        let zone = match self {
            Self::Bbfp => capacity / 16,
            _ => 64,
        };
        zone.clamp(1, capacity.saturating_sub(1).max(1))
    }

    /// Whether `kind` is an acquisition trigger for this family.
    ///
    /// Clock anchor events re-anchor the timebase and are never acquisition
    /// triggers for any family.
    #[must_use]
    pub fn valid_trigger(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Sc | EventKind::Mc => false,
            EventKind::Arm => matches!(self, Self::Bbfp | Self::Hbpp),
            EventKind::Trigger => true,
        }
    }

    /// Whether this family addresses its buffer through arm/trigger
    /// segments rather than a free-running circular history.
    #[must_use]
    pub fn uses_segmented_addressing(&self) -> bool {
        matches!(self, Self::Bbfp | Self::Hbpp)
    }

    /// Default decimation factor when the configuration does not set one.
    #[must_use]
    pub fn default_decimation(&self) -> u32 {
        match self {
            Self::Hbpp => 64,
            _ => 1,
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bbfp => "bbfp",
            Self::Dpp => "dpp",
            Self::Ebpp => "ebpp",
            Self::Hbpp => "hbpp",
        };
        f.write_str(name)
    }
}
