//! Error taxonomy for the acquisition core.
//!
//! Every fallible operation in the crate family returns [`DodError`]. The
//! taxonomy deliberately separates outcomes that look similar to a caller but
//! demand different handling:
//!
//! - **`Retry` vs `NoData`**: both mean "that slice is not readable", but
//!   `Retry` means the requested instant is slightly ahead of the write
//!   frontier and the same request will succeed once the buffer advances,
//!   while `NoData` means the instant is permanently unavailable (already
//!   overwritten, or too far ahead to ever be worth waiting for).
//! - **`Timeout` vs `Deadlock`**: `Timeout` is a bounded wait elapsing with
//!   no qualifying event or data, a normal outcome for event-driven reads.
//!   `Deadlock` is the drain loop's forward-progress bound firing and signals
//!   hardware malfunction, never normal control flow.
//! - **`Closed` vs `Terminated`**: `Closed` is the orderly shutdown path;
//!   `Terminated` carries the terminal code a queue was cancelled with, which
//!   may encode any fatal error the producer hit.
//!
//! Propagation policy: validation and arithmetic errors go straight to the
//! caller and are never retried internally; only the explicitly bounded waits
//! (drain, event wait, queue pop) retry inside their deadline. `Overrun` is
//! sticky on the producer side and surfaced as metadata on the next
//! successful read rather than aborting the stream.

use dod_queue::{PopError, TerminalCode};
use thiserror::Error;

/// Convenience alias for results using the acquisition error type.
pub type DodResult<T> = std::result::Result<T, DodError>;

/// Primary error type for the acquisition core.
#[derive(Error, Debug)]
pub enum DodError {
    /// Malformed request: bad mode for the controller, zero or oversized
    /// read, misaligned byte count, or a position outside the addressable
    /// range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A timebase delta exceeds the safe conversion bound for the configured
    /// clock pair, or re-applying the delta sign would move past zero or
    /// past `u64::MAX`. Conversions fail rather than silently wrap.
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// The requested instant is slightly ahead of the write frontier.
    /// Safe to resubmit once the buffer has advanced.
    #[error("Requested data not yet written; retry after the buffer advances")]
    Retry,

    /// The requested instant is permanently unavailable: already overwritten,
    /// inside the dead zone for good, or further ahead of the frontier than
    /// the configured look-ahead allows.
    #[error("Requested data is not available")]
    NoData,

    /// Sequencing violation, e.g. a trigger-relative request resolving before
    /// the most recent ARM. The controller state machine is left exactly as
    /// it was before the rejected call.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A bounded wait elapsed with no qualifying event or data.
    #[error("Timed out waiting for qualifying event or data")]
    Timeout,

    /// The drain loop's retry bound was exceeded with the hardware FIFO
    /// still empty. Treated as a hardware-fault signal, not control flow;
    /// the caller may reset the device and retry.
    #[error("Deadlock: no hardware progress after {polls} polls")]
    Deadlock {
        /// Idle polls performed before giving up.
        polls: u32,
    },

    /// The producer outran a consumer path and data was lost. The stream
    /// continues; the loss is also reported as chunk metadata.
    #[error("Hardware overrun: data was lost")]
    Overrun,

    /// Operation attempted on a closed client or stopped controller.
    #[error("Operation on a closed handle")]
    Closed,

    /// Operation attempted after cancellation; carries the terminal code the
    /// queue was cancelled with.
    #[error("Stream terminated with code {0}")]
    Terminated(i32),

    /// Hardware-level fault reported by a collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer atoms than requested were transferred. Reads never silently
    /// truncate; a short result is always reported as this error.
    #[error("Incomplete transfer: wanted {wanted} atoms, got {got}")]
    Incomplete {
        /// Atoms requested.
        wanted: usize,
        /// Atoms actually transferred.
        got: usize,
    },

    /// The device addressing epoch changed while the read was in flight.
    /// The caller must resubmit against the new reference rather than
    /// receive mixed-epoch data.
    #[error("Position reference changed during the read")]
    StalePosition,
}

// =============================================================================
// Terminal-code mapping
// =============================================================================

/// Queue terminal code for orderly shutdown.
pub const TERM_CLOSED: TerminalCode = TerminalCode::CLOSED;
/// Queue terminal code for a hardware overrun that ended the stream.
pub const TERM_OVERRUN: TerminalCode = TerminalCode(2);
/// Queue terminal code for the drain forward-progress bound firing.
pub const TERM_DEADLOCK: TerminalCode = TerminalCode(3);
/// Queue terminal code for a hardware I/O fault.
pub const TERM_IO: TerminalCode = TerminalCode(4);
/// Queue terminal code for data that became permanently unavailable.
pub const TERM_NO_DATA: TerminalCode = TerminalCode(5);

impl DodError {
    /// Terminal code to cancel a stream queue with when this error ends a
    /// continuous acquisition.
    #[must_use]
    pub fn terminal_code(&self) -> TerminalCode {
        match self {
            DodError::Closed => TERM_CLOSED,
            DodError::Overrun => TERM_OVERRUN,
            DodError::Deadlock { .. } => TERM_DEADLOCK,
            DodError::Io(_) => TERM_IO,
            DodError::NoData => TERM_NO_DATA,
            DodError::Terminated(code) => TerminalCode(*code),
            // Everything else ends the stream for an unclassified reason.
            _ => TerminalCode(0),
        }
    }

    /// Reconstruct the error a terminal code stands for.
    #[must_use]
    pub fn from_terminal(code: TerminalCode) -> Self {
        match code {
            TERM_CLOSED => DodError::Closed,
            TERM_OVERRUN => DodError::Overrun,
            other => DodError::Terminated(other.0),
        }
    }
}

impl From<PopError> for DodError {
    fn from(err: PopError) -> Self {
        match err {
            PopError::Timeout => DodError::Timeout,
            PopError::Terminated(code) => DodError::from_terminal(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DodError::Incomplete { wanted: 32, got: 7 };
        assert_eq!(err.to_string(), "Incomplete transfer: wanted 32 atoms, got 7");
    }

    #[test]
    fn test_terminal_round_trip() {
        let err = DodError::Overrun;
        let code = err.terminal_code();
        assert!(matches!(DodError::from_terminal(code), DodError::Overrun));

        let closed = DodError::from_terminal(DodError::Closed.terminal_code());
        assert!(matches!(closed, DodError::Closed));
    }

    #[test]
    fn test_pop_error_conversion() {
        assert!(matches!(DodError::from(PopError::Timeout), DodError::Timeout));
        assert!(matches!(
            DodError::from(PopError::Terminated(TerminalCode(9))),
            DodError::Terminated(9)
        ));
        assert!(matches!(
            DodError::from(PopError::Terminated(TERM_CLOSED)),
            DodError::Closed
        ));
    }
}
