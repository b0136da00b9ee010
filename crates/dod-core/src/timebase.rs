//! Timebase conversion algebra.
//!
//! The instrument juggles four time representations:
//!
//! - **ST**: system (wall-clock) time since the Unix epoch
//! - **MT**: machine time, a revolution/cycle count
//! - **LST**: ST scaled onto the hardware system clock (ticks)
//! - **LMT**: MT scaled onto the hardware sample clock, `lmt = mt * decimation`
//!
//! [`TimebaseConverter`] maps between them and turns an LMT value into an
//! absolute atom position in the circular buffer. All conversions use `u128`
//! intermediates and fail with [`DodError::OutOfRange`] rather than wrap:
//! the safe ST range is about `u64::MAX / lst_frequency_hz` seconds from the
//! epoch (~1.47e11 s at 125 MHz), and LST↔LMT deltas are bounded by
//! frequency-pair constants computed once at construction.
//!
//! LST↔LMT conversions are anchored: the delta to the anchor's corresponding
//! field is taken **unsigned** with the sign tracked separately, scaled by
//! the frequency pair trimmed by a [`ClockRatio`], and the sign re-applied
//! with checked arithmetic. A delta that exceeds the pair bound, or a result
//! that would move past zero or past `u64::MAX`, is `OutOfRange`.

use crate::error::{DodError, DodResult};
use crate::ring::RingIndex;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

const NANOS_PER_SEC: u128 = 1_000_000_000;

// =============================================================================
// Time Representations
// =============================================================================

/// System (wall-clock) time since the Unix epoch.
///
/// Kept as seconds + nanoseconds rather than a single nanosecond count so
/// the full conversion range (~1.47e11 s at 125 MHz) stays representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct St {
    /// Whole seconds since the Unix epoch.
    pub secs: u64,
    /// Nanoseconds within the second, always below 1e9.
    pub nanos: u32,
}

impl St {
    /// Build an ST value, carrying surplus nanoseconds into the seconds.
    #[must_use]
    pub fn new(secs: u64, nanos: u32) -> Self {
        let carry = u64::from(nanos) / NANOS_PER_SEC as u64;
        Self {
            secs: secs.saturating_add(carry),
            nanos: (u64::from(nanos) % NANOS_PER_SEC as u64) as u32,
        }
    }

    /// Interpret a UTC datetime as ST. Times before the epoch have no ST
    /// representation and yield `None`.
    #[must_use]
    pub fn from_datetime(dt: DateTime<Utc>) -> Option<Self> {
        let secs = u64::try_from(dt.timestamp()).ok()?;
        Some(Self::new(secs, dt.timestamp_subsec_nanos()))
    }

    /// The UTC datetime this ST value denotes, where chrono can represent it.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.secs).ok()?;
        Utc.timestamp_opt(secs, self.nanos).single()
    }
}

impl fmt::Display for St {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.9fZ")),
            None => write!(f, "{}.{:09}s", self.secs, self.nanos),
        }
    }
}

/// The canonical timestamp quad carried by trigger events and anchors.
///
/// Invariants, enforced by [`TimebaseConverter::timestamp`]:
/// `lmt == mt * decimation` and `lst == st_to_lst(st)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Wall-clock time.
    pub st: St,
    /// Machine cycle count.
    pub mt: u64,
    /// ST scaled onto the system clock.
    pub lst: u64,
    /// MT scaled onto the sample clock.
    pub lmt: u64,
}

/// Trim ratio applied on top of the nominal frequency pair when converting
/// LST↔LMT, tracking the actual machine clock against its nominal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockRatio {
    /// Trim numerator, applied on the LMT side.
    pub numerator: u64,
    /// Trim denominator, applied on the LST side.
    pub denominator: u64,
}

impl ClockRatio {
    /// The identity trim (nominal clocks).
    #[must_use]
    pub fn unity() -> Self {
        Self {
            numerator: 1,
            denominator: 1,
        }
    }
}

impl Default for ClockRatio {
    fn default() -> Self {
        Self::unity()
    }
}

// =============================================================================
// Converter
// =============================================================================

/// Pure conversion functions over configured clock constants.
///
/// Holds no mutable state; share it as `Arc<TimebaseConverter>` between the
/// controllers and the event worker.
#[derive(Debug, Clone)]
pub struct TimebaseConverter {
    lst_frequency_hz: u64,
    lmt_frequency_hz: u64,
    decimation: u64,
    ratio: ClockRatio,
    /// `lmt_frequency_hz * ratio.numerator`: the LMT side of the pair.
    lmt_scale: u64,
    /// `lst_frequency_hz * ratio.denominator`: the LST side of the pair.
    lst_scale: u64,
    max_lst_delta: u64,
    max_lmt_delta: u64,
    max_st_secs: u64,
}

impl TimebaseConverter {
    /// Build a converter for a clock pair.
    ///
    /// Fails with `InvalidArgument` when a frequency or ratio term is zero,
    /// `decimation` is zero, or a frequency-ratio product overflows `u64`.
    pub fn new(
        lst_frequency_hz: u64,
        lmt_frequency_hz: u64,
        decimation: u64,
        ratio: ClockRatio,
    ) -> DodResult<Self> {
        if lst_frequency_hz == 0 || lmt_frequency_hz == 0 {
            return Err(DodError::InvalidArgument(
                "clock frequencies must be nonzero".into(),
            ));
        }
        if decimation == 0 {
            return Err(DodError::InvalidArgument(
                "decimation must be at least 1".into(),
            ));
        }
        if ratio.numerator == 0 || ratio.denominator == 0 {
            return Err(DodError::InvalidArgument(
                "clock ratio terms must be nonzero".into(),
            ));
        }
        let lmt_scale = lmt_frequency_hz
            .checked_mul(ratio.numerator)
            .ok_or_else(|| {
                DodError::InvalidArgument("lmt frequency * ratio numerator overflows u64".into())
            })?;
        let lst_scale = lst_frequency_hz
            .checked_mul(ratio.denominator)
            .ok_or_else(|| {
                DodError::InvalidArgument("lst frequency * ratio denominator overflows u64".into())
            })?;

        Ok(Self {
            lst_frequency_hz,
            lmt_frequency_hz,
            decimation,
            ratio,
            lmt_scale,
            lst_scale,
            max_lst_delta: pair_bound(lst_scale, lmt_scale),
            max_lmt_delta: pair_bound(lmt_scale, lst_scale),
            max_st_secs: u64::MAX / lst_frequency_hz,
        })
    }

    /// System clock frequency in Hz.
    #[must_use]
    pub fn lst_frequency_hz(&self) -> u64 {
        self.lst_frequency_hz
    }

    /// Sample clock frequency in Hz.
    #[must_use]
    pub fn lmt_frequency_hz(&self) -> u64 {
        self.lmt_frequency_hz
    }

    /// Configured decimation factor.
    #[must_use]
    pub fn decimation(&self) -> u64 {
        self.decimation
    }

    /// Configured clock trim.
    #[must_use]
    pub fn ratio(&self) -> ClockRatio {
        self.ratio
    }

    /// Largest ST seconds value any conversion accepts.
    #[must_use]
    pub fn max_st_secs(&self) -> u64 {
        self.max_st_secs
    }

    /// Largest LST delta to an anchor that [`lst_to_lmt`](Self::lst_to_lmt)
    /// accepts.
    #[must_use]
    pub fn max_lst_delta(&self) -> u64 {
        self.max_lst_delta
    }

    /// Largest LMT delta to an anchor that [`lmt_to_lst`](Self::lmt_to_lst)
    /// accepts.
    #[must_use]
    pub fn max_lmt_delta(&self) -> u64 {
        self.max_lmt_delta
    }

    // -------------------------------------------------------------------------
    // ST ↔ LST
    // -------------------------------------------------------------------------

    /// Scale wall-clock time onto the system clock.
    ///
    /// Sub-tick nanoseconds floor to the containing tick; the granularity is
    /// `1e9 / lst_frequency_hz` ns (8 ns at 125 MHz).
    pub fn st_to_lst(&self, st: St) -> DodResult<u64> {
        let whole = u128::from(st.secs) * u128::from(self.lst_frequency_hz);
        let frac = u128::from(st.nanos) * u128::from(self.lst_frequency_hz) / NANOS_PER_SEC;
        let total = whole + frac;
        u64::try_from(total).map_err(|_| {
            DodError::OutOfRange(format!(
                "st {}s exceeds the {}s conversion bound",
                st.secs, self.max_st_secs
            ))
        })
    }

    /// Scale a system-clock tick count back to wall-clock time.
    #[must_use]
    pub fn lst_to_st(&self, lst: u64) -> St {
        let secs = lst / self.lst_frequency_hz;
        let rem = lst % self.lst_frequency_hz;
        let nanos = (u128::from(rem) * NANOS_PER_SEC / u128::from(self.lst_frequency_hz)) as u32;
        St { secs, nanos }
    }

    // -------------------------------------------------------------------------
    // MT ↔ LMT
    // -------------------------------------------------------------------------

    /// Scale machine time onto the sample clock: `lmt = mt * decimation`.
    pub fn mt_to_lmt(&self, mt: u64) -> DodResult<u64> {
        mt.checked_mul(self.decimation).ok_or_else(|| {
            DodError::OutOfRange(format!(
                "mt {mt} * decimation {} overflows u64",
                self.decimation
            ))
        })
    }

    /// Scale a sample-clock count back to machine time (integer division).
    #[must_use]
    pub fn lmt_to_mt(&self, lmt: u64) -> u64 {
        lmt / self.decimation
    }

    // -------------------------------------------------------------------------
    // LST ↔ LMT (anchored)
    // -------------------------------------------------------------------------

    /// Convert a system-clock value to a sample-clock value via an anchor
    /// where both are known.
    pub fn lst_to_lmt(&self, lst: u64, anchor: &Timestamp) -> DodResult<u64> {
        let (delta, negative) = unsigned_delta(lst, anchor.lst);
        if delta > self.max_lst_delta {
            return Err(DodError::OutOfRange(format!(
                "lst delta {delta} exceeds the pair bound {}",
                self.max_lst_delta
            )));
        }
        let scaled = scale(delta, self.lmt_scale, self.lst_scale);
        apply_sign(anchor.lmt, scaled, negative)
    }

    /// Convert a sample-clock value to a system-clock value via an anchor
    /// where both are known.
    pub fn lmt_to_lst(&self, lmt: u64, anchor: &Timestamp) -> DodResult<u64> {
        let (delta, negative) = unsigned_delta(lmt, anchor.lmt);
        if delta > self.max_lmt_delta {
            return Err(DodError::OutOfRange(format!(
                "lmt delta {delta} exceeds the pair bound {}",
                self.max_lmt_delta
            )));
        }
        let scaled = scale(delta, self.lst_scale, self.lmt_scale);
        apply_sign(anchor.lst, scaled, negative)
    }

    // -------------------------------------------------------------------------
    // Buffer positions
    // -------------------------------------------------------------------------

    /// Absolute atom position of an LMT value in a buffer that started at
    /// `start_lmt` with one atom every `atom_period_lmt` ticks.
    ///
    /// Rounds to the nearest atom (add half a period, then floor), because
    /// one atom can span several logical samples.
    pub fn absolute_position(
        &self,
        lmt: u64,
        start_lmt: u64,
        atom_period_lmt: u64,
    ) -> DodResult<u64> {
        if atom_period_lmt == 0 {
            return Err(DodError::InvalidArgument(
                "atom period must be nonzero".into(),
            ));
        }
        if lmt < start_lmt {
            return Err(DodError::OutOfRange(format!(
                "lmt {lmt} precedes the buffer start {start_lmt}"
            )));
        }
        let delta = u128::from(lmt - start_lmt);
        let rounded = (delta + u128::from(atom_period_lmt / 2)) / u128::from(atom_period_lmt);
        u64::try_from(rounded)
            .map_err(|_| DodError::OutOfRange("atom position overflows u64".into()))
    }

    /// Physical ring index of an LMT value: [`absolute_position`] reduced
    /// modulo the ring capacity.
    ///
    /// [`absolute_position`]: Self::absolute_position
    pub fn buffer_offset(
        &self,
        lmt: u64,
        start_lmt: u64,
        atom_period_lmt: u64,
        index: &RingIndex,
    ) -> DodResult<u64> {
        Ok(index.physical(self.absolute_position(lmt, start_lmt, atom_period_lmt)?))
    }

    /// LMT value of an absolute atom position, the inverse of
    /// [`absolute_position`](Self::absolute_position).
    pub fn lmt_of_position(
        &self,
        position: u64,
        start_lmt: u64,
        atom_period_lmt: u64,
    ) -> DodResult<u64> {
        position
            .checked_mul(atom_period_lmt)
            .and_then(|ticks| start_lmt.checked_add(ticks))
            .ok_or_else(|| DodError::OutOfRange("position lmt overflows u64".into()))
    }

    /// Assemble a [`Timestamp`] quad from its independent halves, deriving
    /// the scaled fields so the invariants hold by construction.
    pub fn timestamp(&self, st: St, mt: u64) -> DodResult<Timestamp> {
        Ok(Timestamp {
            st,
            mt,
            lst: self.st_to_lst(st)?,
            lmt: self.mt_to_lmt(mt)?,
        })
    }
}

/// Largest delta on the `from` side that scales to at most `u64::MAX` on the
/// `to` side.
fn pair_bound(from_scale: u64, to_scale: u64) -> u64 {
    let bound = u128::from(u64::MAX) * u128::from(from_scale) / u128::from(to_scale);
    u64::try_from(bound).unwrap_or(u64::MAX)
}

/// Delta between a value and its anchor, with the direction kept out of the
/// arithmetic. Never a signed subtraction.
fn unsigned_delta(value: u64, anchor: u64) -> (u64, bool) {
    if value >= anchor {
        (value - anchor, false)
    } else {
        (anchor - value, true)
    }
}

/// Scale a delta by `to_scale / from_scale`. The caller has already checked
/// the pair bound, so the result fits `u64`.
fn scale(delta: u64, to_scale: u64, from_scale: u64) -> u64 {
    let scaled = u128::from(delta) * u128::from(to_scale) / u128::from(from_scale);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

fn apply_sign(anchor_value: u64, scaled: u64, negative: bool) -> DodResult<u64> {
    let moved = if negative {
        anchor_value.checked_sub(scaled)
    } else {
        anchor_value.checked_add(scaled)
    };
    moved.ok_or_else(|| {
        DodError::OutOfRange(format!(
            "delta {scaled} from anchor {anchor_value} leaves the counter range"
        ))
    })
}
