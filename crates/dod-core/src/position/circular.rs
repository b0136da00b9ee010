//! Time-based controller over the free-running circular history.
//!
//! Resolution happens in three steps: the mode picks a base position
//! (absolute, frontier, machine time, or the next qualifying event), the
//! signed offset shifts it in atoms, and ring validation decides whether
//! the window is readable. Event-driven modes park on the trigger log and
//! then on the ring until the window fills; synchronous modes never block
//! on unwritten data and return `Retry` instead.

use super::{
    apply_offset, check_read_size, remaining_until, settle_position, AccessMode, ControlState,
    ControllerShared, PositionController, PositionRequest, ResolvedPosition,
};
use crate::error::DodResult;
use crate::meta::{ChunkMeta, MetaId};
use crate::trigger::TriggerEvent;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Controller for circular, time-addressed acquisition buffers.
pub struct CircularController {
    shared: ControllerShared,
    /// Sample-clock time of absolute position 0.
    start_lmt: AtomicU64,
    /// Log sequence of the last event this instance consumed. Per-instance
    /// so clones consume events independently.
    last_event_seq: AtomicU64,
    control: ControlState,
}

impl CircularController {
    /// Controller anchored at LMT 0, consuming only events logged after
    /// creation.
    #[must_use]
    pub fn new(shared: ControllerShared) -> Arc<Self> {
        let last_seq = shared.trigger_log.last_seq();
        Arc::new(Self {
            shared,
            start_lmt: AtomicU64::new(0),
            last_event_seq: AtomicU64::new(last_seq),
            control: ControlState::new(true),
        })
    }

    /// Current anchor: the LMT value of absolute position 0.
    #[must_use]
    pub fn start_lmt(&self) -> u64 {
        self.start_lmt.load(Ordering::Acquire)
    }

    /// Park until a qualifying event newer than this instance's cursor
    /// arrives. The event is consumed immediately so a later validation
    /// failure does not replay it.
    async fn next_event(&self, deadline: tokio::time::Instant) -> DodResult<TriggerEvent> {
        let profile = self.shared.profile;
        loop {
            if let Some(err) = self.control.bail() {
                return Err(err);
            }
            let remaining = remaining_until(deadline)?;
            let after = self.last_event_seq.load(Ordering::Acquire);
            tokio::select! {
                res = self.shared.trigger_log.wait_matching(after, remaining, |e| {
                    profile.valid_trigger(e.kind)
                }) => {
                    let event = res?;
                    self.last_event_seq.fetch_max(event.seq, Ordering::AcqRel);
                    return Ok(event);
                }
                () = self.control.woken() => {}
            }
        }
    }
}

#[async_trait]
impl PositionController for CircularController {
    async fn get_position(&self, request: &PositionRequest) -> DodResult<ResolvedPosition> {
        if let Some(err) = self.control.bail() {
            return Err(err);
        }
        let window = check_read_size(&self.shared, request.read_size)?;
        let settings = self.shared.settings;
        let deadline = tokio::time::Instant::now() + settings.timeout;
        let start = self.start_lmt();

        let mut event_kind = None;
        let base = match request.mode {
            AccessMode::Position => request.position,
            AccessMode::Now => self.shared.ring.write_position().saturating_sub(window),
            AccessMode::ByLmt => self.shared.timebase.absolute_position(
                request.position,
                start,
                settings.atom_period_lmt,
            )?,
            AccessMode::OnEvent | AccessMode::SingleEvent => {
                let event = self.next_event(deadline).await?;
                event_kind = Some(event.kind);
                self.shared.timebase.absolute_position(
                    event.timestamp.lmt,
                    start,
                    settings.atom_period_lmt,
                )?
            }
        };
        let position = apply_offset(base, request.offset)?;

        settle_position(
            &self.shared,
            &self.control,
            position,
            window,
            request.mode.is_event_driven(),
            deadline,
        )
        .await?;

        let lmt = self
            .shared
            .timebase
            .lmt_of_position(position, start, settings.atom_period_lmt)?;
        let mut meta = ChunkMeta::new();
        meta.set(MetaId::Lmt, lmt as i64)
            .set(MetaId::AbsolutePosition, position as i64)
            .set(MetaId::AtomCount, request.read_size as i64);
        if let Some(kind) = event_kind {
            meta.set(MetaId::EventKind, kind.code());
        }
        Ok(ResolvedPosition {
            lmt,
            absolute_position: position,
            meta,
        })
    }

    fn reset(&self, start_lmt: u64) {
        self.start_lmt.store(start_lmt, Ordering::Release);
        // Events logged before the re-anchor address the old timebase.
        self.last_event_seq
            .store(self.shared.trigger_log.last_seq(), Ordering::Release);
    }

    fn set_enabled(&self, enabled: bool) {
        self.control.set_enabled(enabled);
    }

    fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    fn stop(&self) {
        self.control.stop();
    }

    fn max_read_size(&self) -> usize {
        self.shared.settings.max_read_size
    }

    fn clone_controller(&self) -> Arc<dyn PositionController> {
        Arc::new(Self {
            shared: self.shared.clone(),
            start_lmt: AtomicU64::new(self.start_lmt()),
            last_event_seq: AtomicU64::new(self.shared.trigger_log.last_seq()),
            control: ControlState::new(self.control.is_enabled()),
        })
    }
}

impl std::fmt::Debug for CircularController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircularController")
            .field("start_lmt", &self.start_lmt())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DodError;
    use crate::profile::DeviceProfile;
    use crate::ring::{CircularBuffer, RingWriter};
    use crate::timebase::{ClockRatio, St, TimebaseConverter, Timestamp};
    use crate::trigger::{EventKind, TriggerLog};
    use std::time::Duration;

    const PERIOD: u64 = 10;

    struct Fixture {
        controller: Arc<CircularController>,
        writer: RingWriter,
        log: Arc<TriggerLog>,
    }

    fn fixture(capacity: u64, dead_zone: u64, max_look_ahead: u64) -> Fixture {
        let timebase =
            Arc::new(TimebaseConverter::new(1_000, 1_000, 1, ClockRatio::unity()).unwrap());
        let (ring, writer) = CircularBuffer::new(capacity, 1, dead_zone).unwrap();
        let log = Arc::new(TriggerLog::new(16));
        let shared = ControllerShared {
            timebase,
            ring,
            trigger_log: Arc::clone(&log),
            profile: DeviceProfile::Ebpp,
            settings: super::super::ControllerSettings {
                timeout: Duration::from_millis(200),
                max_look_ahead,
                max_read_size: 4_096,
                atom_period_lmt: PERIOD,
            },
        };
        Fixture {
            controller: CircularController::new(shared),
            writer,
            log,
        }
    }

    fn request(mode: AccessMode, position: u64, offset: i64, read_size: usize) -> PositionRequest {
        PositionRequest {
            mode,
            position,
            offset,
            read_size,
        }
    }

    fn event_ts(lmt: u64) -> Timestamp {
        Timestamp {
            st: St::new(0, 0),
            mt: lmt,
            lst: 0,
            lmt,
        }
    }

    #[tokio::test]
    async fn test_position_mode_validation_outcomes() {
        let mut fx = fixture(1_024, 64, 0);
        fx.writer.write_atoms(&vec![0u8; 1_000]).unwrap();
        fx.writer.write_atoms(&vec![0u8; 1_000]).unwrap();

        // Lapped history.
        let err = fx
            .controller
            .get_position(&request(AccessMode::Position, 500, 0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::NoData));

        // Fully written window.
        let resolved = fx
            .controller
            .get_position(&request(AccessMode::Position, 1_990, 0, 10))
            .await
            .unwrap();
        assert_eq!(resolved.absolute_position, 1_990);
        assert_eq!(resolved.lmt, 19_900);
        assert_eq!(resolved.meta.get(MetaId::AtomCount), Some(10));

        // Nine atoms short of the frontier with zero look-ahead.
        let err = fx
            .controller
            .get_position(&request(AccessMode::Position, 1_999, 0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::NoData));
    }

    #[tokio::test]
    async fn test_look_ahead_turns_no_data_into_retry() {
        let mut fx = fixture(1_024, 64, 16);
        fx.writer.write_atoms(&vec![0u8; 1_000]).unwrap();
        fx.writer.write_atoms(&vec![0u8; 1_000]).unwrap();

        let err = fx
            .controller
            .get_position(&request(AccessMode::Position, 1_999, 0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::Retry));
    }

    #[tokio::test]
    async fn test_by_lmt_respects_anchor() {
        let mut fx = fixture(1_024, 4, 0);
        fx.controller.reset(1_000);
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();

        let resolved = fx
            .controller
            .get_position(&request(AccessMode::ByLmt, 1_000 + 50 * PERIOD, 0, 10))
            .await
            .unwrap();
        assert_eq!(resolved.absolute_position, 50);
        assert_eq!(resolved.lmt, 1_500);

        // Machine time before the anchor has no position.
        let err = fx
            .controller
            .get_position(&request(AccessMode::ByLmt, 900, 0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::OutOfRange(_)));
    }

    #[tokio::test]
    async fn test_now_reads_back_from_frontier() {
        let mut fx = fixture(1_024, 4, 0);
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();

        let resolved = fx
            .controller
            .get_position(&request(AccessMode::Now, 0, 0, 10))
            .await
            .unwrap();
        assert_eq!(resolved.absolute_position, 90);
        assert_eq!(resolved.lmt, 900);
    }

    #[tokio::test]
    async fn test_offset_shifts_and_bounds() {
        let mut fx = fixture(1_024, 4, 0);
        fx.writer.write_atoms(&vec![0u8; 120]).unwrap();

        let resolved = fx
            .controller
            .get_position(&request(AccessMode::Position, 100, -30, 10))
            .await
            .unwrap();
        assert_eq!(resolved.absolute_position, 70);

        let err = fx
            .controller
            .get_position(&request(AccessMode::Position, 10, -11, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::OutOfRange(_)));
    }

    #[tokio::test]
    async fn test_on_event_anchors_at_trigger() {
        let mut fx = fixture(1_024, 4, 0);
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();

        let controller = Arc::clone(&fx.controller);
        let resolver = tokio::spawn(async move {
            controller
                .get_position(&request(AccessMode::OnEvent, 0, 0, 10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The clock anchor is not a valid acquisition trigger and must be
        // skipped.
        fx.log.append(event_ts(100), EventKind::Sc);
        fx.log.append(event_ts(80 * PERIOD), EventKind::Trigger);

        let resolved = resolver.await.unwrap().unwrap();
        assert_eq!(resolved.absolute_position, 80);
        assert_eq!(resolved.lmt, 800);
        assert_eq!(
            resolved.meta.get(MetaId::EventKind),
            Some(EventKind::Trigger.code())
        );
    }

    #[tokio::test]
    async fn test_events_are_consumed_in_order() {
        let mut fx = fixture(1_024, 4, 0);
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();
        fx.log.append(event_ts(10 * PERIOD), EventKind::Trigger);
        fx.log.append(event_ts(20 * PERIOD), EventKind::Trigger);

        let first = fx
            .controller
            .get_position(&request(AccessMode::SingleEvent, 0, 0, 5))
            .await
            .unwrap();
        let second = fx
            .controller
            .get_position(&request(AccessMode::SingleEvent, 0, 0, 5))
            .await
            .unwrap();
        assert_eq!(first.absolute_position, 10);
        assert_eq!(second.absolute_position, 20);
    }

    #[tokio::test]
    async fn test_event_mode_waits_for_data_to_land() {
        let mut fx = fixture(1_024, 4, 32);
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();
        fx.log.append(event_ts(95 * PERIOD), EventKind::Trigger);

        let controller = Arc::clone(&fx.controller);
        let resolver = tokio::spawn(async move {
            controller
                .get_position(&request(AccessMode::OnEvent, 0, 0, 10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.writer.write_atoms(&vec![0u8; 10]).unwrap();

        let resolved = resolver.await.unwrap().unwrap();
        assert_eq!(resolved.absolute_position, 95);
    }

    #[tokio::test]
    async fn test_event_wait_times_out() {
        let fx = fixture(1_024, 4, 0);
        let err = fx
            .controller
            .get_position(&request(AccessMode::OnEvent, 0, 0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::Timeout));
    }

    #[tokio::test]
    async fn test_disable_and_stop_wake_parked_waiters() {
        let fx = fixture(1_024, 4, 0);
        let controller = Arc::clone(&fx.controller);
        let parked = tokio::spawn(async move {
            controller
                .get_position(&request(AccessMode::OnEvent, 0, 0, 10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.controller.set_enabled(false);
        assert!(matches!(parked.await.unwrap(), Err(DodError::Retry)));

        fx.controller.set_enabled(true);
        let controller = Arc::clone(&fx.controller);
        let parked = tokio::spawn(async move {
            controller
                .get_position(&request(AccessMode::OnEvent, 0, 0, 10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.controller.stop();
        assert!(matches!(parked.await.unwrap(), Err(DodError::Closed)));
    }

    #[tokio::test]
    async fn test_clone_consumes_events_independently() {
        let mut fx = fixture(1_024, 4, 0);
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();
        let clone = fx.controller.clone_controller();
        fx.log.append(event_ts(30 * PERIOD), EventKind::Trigger);

        // Both instances see the same event; neither steals it from the
        // other.
        let a = fx
            .controller
            .get_position(&request(AccessMode::SingleEvent, 0, 0, 5))
            .await
            .unwrap();
        let b = clone
            .get_position(&request(AccessMode::SingleEvent, 0, 0, 5))
            .await
            .unwrap();
        assert_eq!(a.absolute_position, 30);
        assert_eq!(b.absolute_position, 30);
    }

    #[tokio::test]
    async fn test_reset_discards_stale_events() {
        let mut fx = fixture(1_024, 4, 0);
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();
        fx.log.append(event_ts(30 * PERIOD), EventKind::Trigger);
        fx.controller.reset(0);

        // The pre-reset trigger is not replayed.
        let err = fx
            .controller
            .get_position(&request(AccessMode::SingleEvent, 0, 0, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::Timeout));
    }

    #[tokio::test]
    async fn test_read_size_guards() {
        let fx = fixture(64, 16, 0);
        let err = fx
            .controller
            .get_position(&request(AccessMode::Position, 0, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::InvalidArgument(_)));
        // 49 atoms exceed the 48 readable (capacity minus dead zone).
        let err = fx
            .controller
            .get_position(&request(AccessMode::Position, 0, 0, 49))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::InvalidArgument(_)));
    }
}
