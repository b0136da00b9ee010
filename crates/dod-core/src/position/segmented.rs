//! Event-anchored controller for segmented acquisition buffers.
//!
//! Segmented families acquire in arm/trigger pairs: an ARM event starts a
//! segment, the next TRIGGER commits it. The committed segment carries the
//! trigger's atom-aligned base offset from the arm plus the alignment
//! residue, and requests address data relative to that base. Reading before
//! the arm point is refused with `PermissionDenied`; whether such history
//! could ever be served is unresolved, so the refusal is deliberate and
//! leaves the sequencing state untouched.
//!
//! Out-of-sequence events (a trigger while unarmed, a second arm while
//! armed, a trigger stamped before its arm) are logged and ignored; the
//! machine only moves on the expected kind.

use super::{
    apply_offset, check_read_size, settle_position, AccessMode, ControlState, ControllerShared,
    PositionController, PositionRequest, ResolvedPosition,
};
use crate::error::{DodError, DodResult};
use crate::meta::{ChunkMeta, MetaId};
use crate::trigger::{EventKind, TriggerEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Where the sequencing machine is in the arm/trigger alternation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Waiting for an ARM to start a segment.
    ExpectArm,
    /// Armed; waiting for the TRIGGER that commits the segment.
    ExpectTrigger,
}

/// One committed arm/trigger pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Sample-clock time of the arm.
    pub arm_lmt: u64,
    /// Sample-clock time of the trigger.
    pub trigger_lmt: u64,
    /// Trigger offset from the arm, rounded up to a whole atom period.
    pub base_offset_lmt: u64,
    /// Ticks between the trigger and its atom-aligned base,
    /// `base_offset_lmt - (trigger_lmt - arm_lmt)`.
    pub residue_lmt: u64,
    /// Commit number, starting at 1.
    pub seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct Machine {
    state: SegmentState,
    /// Arm time while waiting for the trigger.
    armed_at: Option<u64>,
    current: Option<Segment>,
    commits: u64,
}

impl Machine {
    fn new() -> Self {
        Self {
            state: SegmentState::ExpectArm,
            armed_at: None,
            current: None,
            commits: 0,
        }
    }
}

/// Controller for arm/trigger segmented acquisition.
pub struct SegmentedController {
    shared: ControllerShared,
    machine: Mutex<Machine>,
    committed: Notify,
    start_lmt: AtomicU64,
    /// Commit number of the last segment this instance consumed in an
    /// event-driven read. Per-instance so clones consume independently.
    last_segment_seq: AtomicU64,
    control: ControlState,
}

impl SegmentedController {
    /// Controller anchored at LMT 0 with an idle sequencing machine.
    #[must_use]
    pub fn new(shared: ControllerShared) -> Arc<Self> {
        Arc::new(Self {
            shared,
            machine: Mutex::new(Machine::new()),
            committed: Notify::new(),
            start_lmt: AtomicU64::new(0),
            last_segment_seq: AtomicU64::new(0),
            control: ControlState::new(true),
        })
    }

    /// Current anchor: the LMT value of absolute position 0.
    #[must_use]
    pub fn start_lmt(&self) -> u64 {
        self.start_lmt.load(Ordering::Acquire)
    }

    /// Where the sequencing machine currently is.
    #[must_use]
    pub fn segment_state(&self) -> SegmentState {
        self.machine.lock().state
    }

    /// Segments committed since creation. Survives [`reset`] so commit
    /// numbers never repeat.
    ///
    /// [`reset`]: PositionController::reset
    #[must_use]
    pub fn committed_count(&self) -> u64 {
        self.machine.lock().commits
    }

    /// The most recently committed segment, if any.
    #[must_use]
    pub fn current_segment(&self) -> Option<Segment> {
        self.machine.lock().current
    }

    fn apply_event(&self, event: &TriggerEvent) {
        let lmt = event.timestamp.lmt;
        let committed = {
            let mut machine = self.machine.lock();
            match (machine.state, event.kind) {
                (SegmentState::ExpectArm, EventKind::Arm) => {
                    machine.armed_at = Some(lmt);
                    machine.state = SegmentState::ExpectTrigger;
                    false
                }
                (SegmentState::ExpectTrigger, EventKind::Trigger) => {
                    self.try_commit(&mut machine, lmt)
                }
                (_, EventKind::Sc | EventKind::Mc) => false,
                (state, kind) => {
                    debug!(%kind, ?state, "out-of-sequence event ignored");
                    false
                }
            }
        };
        if committed {
            self.committed.notify_waiters();
        }
    }

    /// Commit the armed segment at `trigger_lmt`. The machine stays armed
    /// when the trigger is stamped before its arm.
    fn try_commit(&self, machine: &mut Machine, trigger_lmt: u64) -> bool {
        let Some(arm_lmt) = machine.armed_at else {
            debug!("trigger with no recorded arm ignored");
            return false;
        };
        if trigger_lmt < arm_lmt {
            debug!(trigger_lmt, arm_lmt, "trigger precedes its arm, ignored");
            return false;
        }
        let period = self.shared.settings.atom_period_lmt;
        let delta = trigger_lmt - arm_lmt;
        let Some(base) = atom_aligned(delta, period) else {
            warn!(delta, period, "arm-to-trigger span cannot be atom-aligned");
            return false;
        };
        machine.commits += 1;
        machine.current = Some(Segment {
            arm_lmt,
            trigger_lmt,
            base_offset_lmt: base,
            residue_lmt: base - delta,
            seq: machine.commits,
        });
        machine.state = SegmentState::ExpectArm;
        machine.armed_at = None;
        true
    }

    /// Effective target LMT for an atom index relative to the segment's
    /// trigger base. Indices reaching back before the arm are refused.
    fn segment_target(&self, segment: &Segment, atom_index: i128) -> DodResult<u64> {
        let period = i128::from(self.shared.settings.atom_period_lmt);
        let rel = i128::from(segment.base_offset_lmt) + atom_index * period;
        if rel < 0 {
            return Err(DodError::PermissionDenied(format!(
                "target precedes the arm at lmt {}",
                segment.arm_lmt
            )));
        }
        u64::try_from(i128::from(segment.arm_lmt) + rel)
            .map_err(|_| DodError::OutOfRange("segment target overflows the counter".into()))
    }

    /// Park until a segment newer than this instance's cursor commits, then
    /// consume it.
    async fn next_segment(&self, deadline: tokio::time::Instant) -> DodResult<Segment> {
        loop {
            if let Some(err) = self.control.bail() {
                return Err(err);
            }
            // Register interest before checking so a commit between the
            // check and the await is not lost.
            let notified = self.committed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let cursor = self.last_segment_seq.load(Ordering::Acquire);
            let fresh = self.machine.lock().current.filter(|s| s.seq > cursor);
            if let Some(segment) = fresh {
                self.last_segment_seq.fetch_max(segment.seq, Ordering::AcqRel);
                return Ok(segment);
            }
            tokio::select! {
                res = tokio::time::timeout_at(deadline, notified) => {
                    if res.is_err() {
                        return Err(DodError::Timeout);
                    }
                }
                () = self.control.woken() => {}
            }
        }
    }
}

/// `delta` rounded up to a whole number of atom periods.
fn atom_aligned(delta: u64, period: u64) -> Option<u64> {
    if period == 0 {
        return None;
    }
    let atoms = delta.checked_add(period - 1)? / period;
    atoms.checked_mul(period)
}

#[async_trait]
impl PositionController for SegmentedController {
    async fn get_position(&self, request: &PositionRequest) -> DodResult<ResolvedPosition> {
        if let Some(err) = self.control.bail() {
            return Err(err);
        }
        let window = check_read_size(&self.shared, request.read_size)?;
        let settings = self.shared.settings;
        let deadline = tokio::time::Instant::now() + settings.timeout;
        let start = self.start_lmt();

        let (position, segment) = match request.mode {
            AccessMode::Now => {
                let base = self.shared.ring.write_position().saturating_sub(window);
                (apply_offset(base, request.offset)?, None)
            }
            AccessMode::Position => {
                let segment = self.current_segment().ok_or(DodError::NoData)?;
                let index = i128::from(request.position) + i128::from(request.offset);
                let target = self.segment_target(&segment, index)?;
                let abs = self.shared.timebase.absolute_position(
                    target,
                    start,
                    settings.atom_period_lmt,
                )?;
                (abs, Some(segment))
            }
            AccessMode::ByLmt => {
                let segment = self.current_segment().ok_or(DodError::NoData)?;
                let period = i128::from(settings.atom_period_lmt);
                let target = i128::from(request.position) + i128::from(request.offset) * period;
                if target < i128::from(segment.arm_lmt) {
                    return Err(DodError::PermissionDenied(format!(
                        "lmt target precedes the arm at lmt {}",
                        segment.arm_lmt
                    )));
                }
                let target = u64::try_from(target).map_err(|_| {
                    DodError::OutOfRange("lmt target overflows the counter".into())
                })?;
                let abs = self.shared.timebase.absolute_position(
                    target,
                    start,
                    settings.atom_period_lmt,
                )?;
                (abs, Some(segment))
            }
            AccessMode::OnEvent | AccessMode::SingleEvent => {
                let segment = self.next_segment(deadline).await?;
                let target = self.segment_target(&segment, i128::from(request.offset))?;
                let abs = self.shared.timebase.absolute_position(
                    target,
                    start,
                    settings.atom_period_lmt,
                )?;
                (abs, Some(segment))
            }
        };

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
        if let Some(segment) = segment {
            meta.set(MetaId::TriggerResidue, segment.residue_lmt as i64);
            if request.mode.is_event_driven() {
                meta.set(MetaId::EventKind, EventKind::Trigger.code());
            }
        }
        Ok(ResolvedPosition {
            lmt,
            absolute_position: position,
            meta,
        })
    }

    fn reset(&self, start_lmt: u64) {
        {
            let mut machine = self.machine.lock();
            machine.state = SegmentState::ExpectArm;
            machine.armed_at = None;
            machine.current = None;
        }
        self.start_lmt.store(start_lmt, Ordering::Release);
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
        let machine = *self.machine.lock();
        Arc::new(Self {
            shared: self.shared.clone(),
            machine: Mutex::new(machine),
            committed: Notify::new(),
            start_lmt: AtomicU64::new(self.start_lmt()),
            // A clone only consumes segments committed after the clone.
            last_segment_seq: AtomicU64::new(machine.commits),
            control: ControlState::new(self.control.is_enabled()),
        })
    }

    fn handle_event(&self, event: &TriggerEvent) {
        self.apply_event(event);
    }
}

impl std::fmt::Debug for SegmentedController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let machine = self.machine.lock();
        f.debug_struct("SegmentedController")
            .field("state", &machine.state)
            .field("commits", &machine.commits)
            .field("start_lmt", &self.start_lmt())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::DeviceProfile;
    use crate::ring::{CircularBuffer, RingWriter};
    use crate::timebase::{ClockRatio, TimebaseConverter, Timestamp};
    use crate::trigger::TriggerLog;
    use std::time::Duration;

    const PERIOD: u64 = 10;

    struct Fixture {
        controller: Arc<SegmentedController>,
        writer: RingWriter,
    }

    fn fixture() -> Fixture {
        let timebase =
            Arc::new(TimebaseConverter::new(1_000, 1_000, 1, ClockRatio::unity()).unwrap());
        let (ring, writer) = CircularBuffer::new(1_024, 1, 4).unwrap();
        let shared = ControllerShared {
            timebase,
            ring,
            trigger_log: Arc::new(TriggerLog::new(16)),
            profile: DeviceProfile::Bbfp,
            settings: super::super::ControllerSettings {
                timeout: Duration::from_millis(200),
                max_look_ahead: 32,
                max_read_size: 4_096,
                atom_period_lmt: PERIOD,
            },
        };
        Fixture {
            controller: SegmentedController::new(shared),
            writer,
        }
    }

    fn event(kind: EventKind, lmt: u64) -> TriggerEvent {
        TriggerEvent {
            timestamp: Timestamp {
                lmt,
                ..Timestamp::default()
            },
            kind,
            seq: 0,
        }
    }

    fn feed(controller: &SegmentedController, kind: EventKind, lmt: u64) {
        controller.handle_event(&event(kind, lmt));
    }

    fn request(mode: AccessMode, position: u64, offset: i64, read_size: usize) -> PositionRequest {
        PositionRequest {
            mode,
            position,
            offset,
            read_size,
        }
    }

    #[test]
    fn test_arm_trigger_pairs_commit() {
        let fx = fixture();
        feed(&fx.controller, EventKind::Arm, 100);
        assert_eq!(fx.controller.segment_state(), SegmentState::ExpectTrigger);
        feed(&fx.controller, EventKind::Trigger, 250);
        feed(&fx.controller, EventKind::Arm, 400);
        feed(&fx.controller, EventKind::Trigger, 460);

        assert_eq!(fx.controller.committed_count(), 2);
        assert_eq!(fx.controller.segment_state(), SegmentState::ExpectArm);
        let segment = fx.controller.current_segment().unwrap();
        assert_eq!(segment.arm_lmt, 400);
        assert_eq!(segment.trigger_lmt, 460);
        assert_eq!(segment.base_offset_lmt, 60);
        assert_eq!(segment.residue_lmt, 0);
        assert_eq!(segment.seq, 2);
    }

    #[test]
    fn test_unaligned_trigger_rounds_up_with_residue() {
        let fx = fixture();
        feed(&fx.controller, EventKind::Arm, 100);
        feed(&fx.controller, EventKind::Trigger, 113);

        let segment = fx.controller.current_segment().unwrap();
        assert_eq!(segment.base_offset_lmt, 20);
        assert_eq!(segment.residue_lmt, 7);
    }

    #[test]
    fn test_double_trigger_commits_nothing() {
        let fx = fixture();
        feed(&fx.controller, EventKind::Trigger, 100);
        feed(&fx.controller, EventKind::Trigger, 200);

        assert_eq!(fx.controller.committed_count(), 0);
        assert_eq!(fx.controller.segment_state(), SegmentState::ExpectArm);
        assert!(fx.controller.current_segment().is_none());
    }

    #[test]
    fn test_trigger_before_arm_keeps_machine_armed() {
        let fx = fixture();
        feed(&fx.controller, EventKind::Arm, 500);
        feed(&fx.controller, EventKind::Trigger, 300);
        assert_eq!(fx.controller.committed_count(), 0);
        assert_eq!(fx.controller.segment_state(), SegmentState::ExpectTrigger);

        // A later trigger still commits against the standing arm.
        feed(&fx.controller, EventKind::Trigger, 600);
        assert_eq!(fx.controller.committed_count(), 1);
    }

    #[test]
    fn test_second_arm_while_armed_is_ignored() {
        let fx = fixture();
        feed(&fx.controller, EventKind::Arm, 100);
        feed(&fx.controller, EventKind::Arm, 200);
        feed(&fx.controller, EventKind::Trigger, 250);

        let segment = fx.controller.current_segment().unwrap();
        assert_eq!(segment.arm_lmt, 100);
        assert_eq!(segment.base_offset_lmt, 150);
    }

    #[test]
    fn test_clock_anchors_do_not_sequence() {
        let fx = fixture();
        feed(&fx.controller, EventKind::Arm, 100);
        feed(&fx.controller, EventKind::Sc, 150);
        feed(&fx.controller, EventKind::Mc, 160);
        assert_eq!(fx.controller.segment_state(), SegmentState::ExpectTrigger);
        feed(&fx.controller, EventKind::Trigger, 200);
        assert_eq!(fx.controller.committed_count(), 1);
    }

    #[tokio::test]
    async fn test_position_addresses_relative_to_trigger_base() {
        let mut fx = fixture();
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();
        feed(&fx.controller, EventKind::Arm, 200);
        feed(&fx.controller, EventKind::Trigger, 230);

        let resolved = fx
            .controller
            .get_position(&request(AccessMode::Position, 5, 0, 10))
            .await
            .unwrap();
        // arm 200 + base 30 + 5 atoms of 10 ticks = lmt 280 = atom 28.
        assert_eq!(resolved.absolute_position, 28);
        assert_eq!(resolved.lmt, 280);
        assert_eq!(resolved.meta.get(MetaId::TriggerResidue), Some(0));
    }

    #[tokio::test]
    async fn test_no_committed_segment_is_no_data() {
        let fx = fixture();
        let err = fx
            .controller
            .get_position(&request(AccessMode::Position, 0, 0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::NoData));
    }

    #[tokio::test]
    async fn test_reading_before_arm_is_permission_denied() {
        let mut fx = fixture();
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();
        feed(&fx.controller, EventKind::Arm, 200);
        feed(&fx.controller, EventKind::Trigger, 230);

        // Offset -3 atoms lands exactly on the arm; -4 reaches before it.
        let ok = fx
            .controller
            .get_position(&request(AccessMode::Position, 0, -3, 10))
            .await
            .unwrap();
        assert_eq!(ok.absolute_position, 20);

        let err = fx
            .controller
            .get_position(&request(AccessMode::Position, 0, -4, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::PermissionDenied(_)));
        // The refusal leaves the machine untouched.
        assert_eq!(fx.controller.committed_count(), 1);
        assert_eq!(fx.controller.segment_state(), SegmentState::ExpectArm);
    }

    #[tokio::test]
    async fn test_by_lmt_checks_the_arm_boundary() {
        let mut fx = fixture();
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();
        feed(&fx.controller, EventKind::Arm, 200);
        feed(&fx.controller, EventKind::Trigger, 230);

        let resolved = fx
            .controller
            .get_position(&request(AccessMode::ByLmt, 240, 0, 10))
            .await
            .unwrap();
        assert_eq!(resolved.absolute_position, 24);

        let err = fx
            .controller
            .get_position(&request(AccessMode::ByLmt, 190, 0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_on_event_resolves_the_commit() {
        let mut fx = fixture();
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();

        let controller = Arc::clone(&fx.controller);
        let resolver = tokio::spawn(async move {
            controller
                .get_position(&request(AccessMode::OnEvent, 0, 0, 10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        feed(&fx.controller, EventKind::Arm, 100);
        feed(&fx.controller, EventKind::Trigger, 113);

        let resolved = resolver.await.unwrap().unwrap();
        // arm 100 + base 20 = lmt 120 = atom 12.
        assert_eq!(resolved.absolute_position, 12);
        assert_eq!(resolved.meta.get(MetaId::TriggerResidue), Some(7));
        assert_eq!(
            resolved.meta.get(MetaId::EventKind),
            Some(EventKind::Trigger.code())
        );
    }

    #[tokio::test]
    async fn test_on_event_consumes_each_commit_once() {
        let mut fx = fixture();
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();
        feed(&fx.controller, EventKind::Arm, 100);
        feed(&fx.controller, EventKind::Trigger, 120);

        fx.controller
            .get_position(&request(AccessMode::SingleEvent, 0, 0, 10))
            .await
            .unwrap();
        let err = fx
            .controller
            .get_position(&request(AccessMode::SingleEvent, 0, 0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DodError::Timeout));
    }

    #[tokio::test]
    async fn test_reset_clears_half_consumed_state() {
        let fx = fixture();
        feed(&fx.controller, EventKind::Arm, 100);
        fx.controller.reset(0);

        assert_eq!(fx.controller.segment_state(), SegmentState::ExpectArm);
        // The post-reset trigger has no arm to pair with.
        feed(&fx.controller, EventKind::Trigger, 300);
        assert_eq!(fx.controller.committed_count(), 0);
        assert!(fx.controller.current_segment().is_none());
    }

    #[tokio::test]
    async fn test_clone_starts_after_existing_commits() {
        let mut fx = fixture();
        fx.writer.write_atoms(&vec![0u8; 100]).unwrap();
        feed(&fx.controller, EventKind::Arm, 100);
        feed(&fx.controller, EventKind::Trigger, 120);

        let clone = fx.controller.clone_controller();
        let waiter = Arc::clone(&clone);
        let resolver = tokio::spawn(async move {
            waiter
                .get_position(&request(AccessMode::OnEvent, 0, 0, 10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The pre-clone commit is not consumed; only a fresh pair resolves.
        clone.handle_event(&event(EventKind::Arm, 300));
        clone.handle_event(&event(EventKind::Trigger, 320));

        let resolved = resolver.await.unwrap().unwrap();
        assert_eq!(resolved.absolute_position, 32);
        // The clone sequences on its own machine; the original is untouched.
        assert_eq!(fx.controller.committed_count(), 1);
    }
}
