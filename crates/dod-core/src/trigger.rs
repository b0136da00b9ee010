//! Fixed-depth log of timestamped hardware events.
//!
//! The event worker appends every decoded hardware event here; position
//! controllers query it for the most recent event of a kind or park on
//! [`TriggerLog::wait_matching`] until a qualifying one arrives. The log
//! holds only the last `depth` events, so "latest of kind" is last-write-wins
//! and older occurrences are not queryable.

use crate::error::{DodError, DodResult};
use crate::timebase::Timestamp;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::Notify;

/// Kinds of hardware events the instrument decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// System-clock anchor event; re-anchors the ST↔LST pairing.
    Sc,
    /// Machine-clock anchor event; re-anchors the MT↔LMT pairing.
    Mc,
    /// Arms a segmented acquisition.
    Arm,
    /// Fires an armed segmented acquisition, or anchors an event-mode read.
    Trigger,
}

impl EventKind {
    /// Stable numeric code carried in chunk metadata.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Sc => 1,
            Self::Mc => 2,
            Self::Arm => 3,
            Self::Trigger => 4,
        }
    }

    /// Decode the hardware event code. Unknown codes yield `None`.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Sc),
            2 => Some(Self::Mc),
            3 => Some(Self::Arm),
            4 => Some(Self::Trigger),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sc => "sc",
            Self::Mc => "mc",
            Self::Arm => "arm",
            Self::Trigger => "trigger",
        };
        f.write_str(name)
    }
}

/// One decoded hardware event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    /// Canonical timestamp quad captured when the event fired.
    pub timestamp: Timestamp,
    /// Decoded kind.
    pub kind: EventKind,
    /// Log sequence number, assigned on append, starting at 1.
    pub seq: u64,
}

struct LogState {
    events: VecDeque<TriggerEvent>,
    next_seq: u64,
}

/// Bounded ring of the most recent events.
pub struct TriggerLog {
    state: Mutex<LogState>,
    inserted: Notify,
    depth: usize,
}

impl TriggerLog {
    /// Create a log keeping the most recent `depth` events.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is 0.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "trigger log depth must be at least 1");
        Self {
            state: Mutex::new(LogState {
                events: VecDeque::with_capacity(depth),
                next_seq: 1,
            }),
            inserted: Notify::new(),
            depth,
        }
    }

    /// Append an event, evicting the oldest entry when the log is full.
    /// Returns the sequence number assigned to the event.
    pub fn append(&self, timestamp: Timestamp, kind: EventKind) -> u64 {
        let seq = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            if state.events.len() == self.depth {
                state.events.pop_front();
            }
            state.events.push_back(TriggerEvent {
                timestamp,
                kind,
                seq,
            });
            seq
        };
        self.inserted.notify_waiters();
        seq
    }

    /// Most recent event of `kind` still in the log.
    #[must_use]
    pub fn latest(&self, kind: EventKind) -> Option<TriggerEvent> {
        let state = self.state.lock();
        state.events.iter().rev().find(|e| e.kind == kind).copied()
    }

    /// Most recent event of any kind.
    #[must_use]
    pub fn latest_any(&self) -> Option<TriggerEvent> {
        let state = self.state.lock();
        state.events.back().copied()
    }

    /// Sequence number of the most recently appended event, 0 when none.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        let state = self.state.lock();
        state.next_seq - 1
    }

    /// Wait for the oldest logged event with a sequence number greater than
    /// `after_seq` that satisfies `filter`.
    ///
    /// Returns the oldest such event so a consumer stepping its `after_seq`
    /// forward sees every qualifying event still in the log, in order. Fails
    /// with [`DodError::Timeout`] when none arrives in time.
    pub async fn wait_matching<F>(
        &self,
        after_seq: u64,
        timeout: Duration,
        filter: F,
    ) -> DodResult<TriggerEvent>
    where
        F: Fn(&TriggerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before scanning so an append between the scan
            // and the await is not lost.
            let notified = self.inserted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.find_after(after_seq, &filter) {
                return Ok(event);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(DodError::Timeout);
            }
        }
    }

    fn find_after<F>(&self, after_seq: u64, filter: &F) -> Option<TriggerEvent>
    where
        F: Fn(&TriggerEvent) -> bool,
    {
        let state = self.state.lock();
        state
            .events
            .iter()
            .find(|e| e.seq > after_seq && filter(e))
            .copied()
    }

    /// Number of events currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Whether the log holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }

    /// Drop all events. Sequence numbers keep counting from where they were.
    pub fn clear(&self) {
        self.state.lock().events.clear();
    }
}

impl fmt::Debug for TriggerLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TriggerLog")
            .field("depth", &self.depth)
            .field("len", &state.events.len())
            .field("next_seq", &state.next_seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ts(lmt: u64) -> Timestamp {
        Timestamp {
            lmt,
            ..Timestamp::default()
        }
    }

    #[test]
    fn test_event_codes_round_trip() {
        for kind in [EventKind::Sc, EventKind::Mc, EventKind::Arm, EventKind::Trigger] {
            assert_eq!(EventKind::from_code(kind.code() as u8), Some(kind));
        }
        assert_eq!(EventKind::from_code(0), None);
        assert_eq!(EventKind::from_code(9), None);
    }

    #[test]
    fn test_latest_is_last_write_wins() {
        let log = TriggerLog::new(8);
        log.append(ts(100), EventKind::Trigger);
        log.append(ts(200), EventKind::Arm);
        log.append(ts(300), EventKind::Trigger);

        assert_eq!(log.latest(EventKind::Trigger).unwrap().timestamp.lmt, 300);
        assert_eq!(log.latest(EventKind::Arm).unwrap().timestamp.lmt, 200);
        assert_eq!(log.latest(EventKind::Sc), None);
        assert_eq!(log.latest_any().unwrap().timestamp.lmt, 300);
    }

    #[test]
    fn test_depth_evicts_oldest() {
        let log = TriggerLog::new(2);
        log.append(ts(1), EventKind::Arm);
        log.append(ts(2), EventKind::Trigger);
        log.append(ts(3), EventKind::Trigger);

        assert_eq!(log.len(), 2);
        // The arm at lmt 1 has been evicted and is no longer queryable.
        assert_eq!(log.latest(EventKind::Arm), None);
        assert_eq!(log.latest(EventKind::Trigger).unwrap().timestamp.lmt, 3);
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let log = TriggerLog::new(2);
        assert_eq!(log.last_seq(), 0);
        assert_eq!(log.append(ts(1), EventKind::Arm), 1);
        assert_eq!(log.append(ts(2), EventKind::Trigger), 2);
        log.clear();
        // Clearing forgets events but not the counter.
        assert_eq!(log.append(ts(3), EventKind::Arm), 3);
        assert_eq!(log.last_seq(), 3);
    }

    #[tokio::test]
    async fn test_wait_matching_returns_oldest_qualifying() {
        let log = TriggerLog::new(8);
        log.append(ts(1), EventKind::Arm);
        log.append(ts(2), EventKind::Trigger);
        log.append(ts(3), EventKind::Trigger);

        let event = log
            .wait_matching(1, Duration::from_millis(10), |e| {
                e.kind == EventKind::Trigger
            })
            .await
            .unwrap();
        assert_eq!(event.seq, 2);

        let event = log
            .wait_matching(event.seq, Duration::from_millis(10), |e| {
                e.kind == EventKind::Trigger
            })
            .await
            .unwrap();
        assert_eq!(event.seq, 3);
    }

    #[tokio::test]
    async fn test_wait_matching_wakes_on_append() {
        let log = Arc::new(TriggerLog::new(8));
        let waiter = {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                log.wait_matching(0, Duration::from_secs(1), |e| {
                    e.kind == EventKind::Trigger
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append(ts(5), EventKind::Arm);
        log.append(ts(6), EventKind::Trigger);

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Trigger);
        assert_eq!(event.timestamp.lmt, 6);
    }

    #[tokio::test]
    async fn test_wait_matching_times_out() {
        let log = TriggerLog::new(8);
        log.append(ts(1), EventKind::Arm);
        let err = log
            .wait_matching(0, Duration::from_millis(10), |e| {
                e.kind == EventKind::Trigger
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::Timeout));
    }
}
