//! Event pump: from latched interrupt registers to the trigger log.
//!
//! Split in two halves around a bounded queue, mirroring an ISR top half
//! and its worker. The top half polls the [`InterruptSource`] on a fixed
//! cadence and never blocks; when the queue is full, excess events are
//! dropped and counted. The bottom half decodes each [`RawEvent`], stamps
//! a full [`Timestamp`] quad, appends to the [`TriggerLog`] and broadcasts
//! to the controller registry.
//!
//! SC and MC sync events re-anchor machine time: controllers are disabled,
//! reset so absolute position 0 coincides with the sync event, and
//! re-enabled. Requests racing the re-anchor observe `Retry`.

use crate::bus::{InterruptSource, RawEvent};
use chrono::Utc;
use dod_core::position::ControllerRegistry;
use dod_core::{DeviceProfile, EventKind, St, TimebaseConverter, Timestamp, TriggerEvent, TriggerLog};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cadence and queue sizing for the event pump.
#[derive(Debug, Clone, Copy)]
pub struct EventPumpConfig {
    /// Interval between interrupt register polls.
    pub poll_interval: Duration,
    /// Bounded queue depth between the halves.
    pub queue_capacity: usize,
}

impl Default for EventPumpConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            queue_capacity: 64,
        }
    }
}

/// Counters shared by both halves.
#[derive(Debug, Default)]
pub struct EventStats {
    processed: AtomicU64,
    dropped_full: AtomicU64,
    unknown: AtomicU64,
    poll_errors: AtomicU64,
}

impl EventStats {
    /// Events decoded, logged and broadcast.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Events shed because the queue was full.
    #[must_use]
    pub fn dropped_full(&self) -> u64 {
        self.dropped_full.load(Ordering::Relaxed)
    }

    /// Events with a code no [`EventKind`] decodes.
    #[must_use]
    pub fn unknown_codes(&self) -> u64 {
        self.unknown.load(Ordering::Relaxed)
    }

    /// Failed interrupt register polls.
    #[must_use]
    pub fn poll_errors(&self) -> u64 {
        self.poll_errors.load(Ordering::Relaxed)
    }
}

/// Decodes, stamps and distributes hardware events.
pub struct EventWorker {
    timebase: Arc<TimebaseConverter>,
    trigger_log: Arc<TriggerLog>,
    registry: Arc<ControllerRegistry>,
    profile: DeviceProfile,
    stats: Arc<EventStats>,
}

impl EventWorker {
    /// Worker wired to the device's log, registry and timebase.
    #[must_use]
    pub fn new(
        timebase: Arc<TimebaseConverter>,
        trigger_log: Arc<TriggerLog>,
        registry: Arc<ControllerRegistry>,
        profile: DeviceProfile,
    ) -> Self {
        Self {
            timebase,
            trigger_log,
            registry,
            profile,
            stats: Arc::new(EventStats::default()),
        }
    }

    /// Start both halves against an interrupt source.
    pub fn spawn(self, source: Arc<dyn InterruptSource>, config: EventPumpConfig) -> EventPump {
        let (tx, mut rx) = mpsc::channel::<RawEvent>(config.queue_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let stats = Arc::clone(&self.stats);

        let top_stop = Arc::clone(&stop);
        let top_wake = Arc::clone(&wake);
        let top_stats = Arc::clone(&self.stats);
        let top = tokio::spawn(async move {
            while !top_stop.load(Ordering::Acquire) {
                match source.poll_events() {
                    Ok(events) => {
                        for raw in events {
                            if tx.try_send(raw).is_err() {
                                top_stats.dropped_full.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(err) => {
                        top_stats.poll_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(%err, "event line poll failed");
                    }
                }
                tokio::select! {
                    () = tokio::time::sleep(config.poll_interval) => {}
                    () = top_wake.notified() => {}
                }
            }
            // tx drops here; the bottom half ends once it has drained.
        });

        let worker = self;
        let bottom = tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                worker.process(raw);
            }
            debug!("event worker drained");
        });

        EventPump {
            stop,
            wake,
            top,
            bottom,
            stats,
        }
    }

    /// Shared counters, also available through [`EventPump::stats`].
    #[must_use]
    pub fn stats(&self) -> Arc<EventStats> {
        Arc::clone(&self.stats)
    }

    fn process(&self, raw: RawEvent) {
        let Some(kind) = EventKind::from_code(raw.code) else {
            self.stats.unknown.fetch_add(1, Ordering::Relaxed);
            warn!(code = raw.code, lmt = raw.lmt, "unknown event code dropped");
            return;
        };
        if matches!(kind, EventKind::Arm | EventKind::Trigger) && !self.profile.valid_trigger(kind)
        {
            debug!(%kind, "event not used by this profile");
            return;
        }

        let timestamp = self.stamp(raw.lmt);
        if matches!(kind, EventKind::Sc | EventKind::Mc) {
            // Re-anchor: position 0 now coincides with the sync event.
            self.registry.broadcast_enable(false);
            self.registry.broadcast_reset(raw.lmt);
            self.registry.broadcast_enable(true);
            info!(%kind, lmt = raw.lmt, "machine time re-anchored on sync event");
        }

        let seq = self.trigger_log.append(timestamp, kind);
        let event = TriggerEvent {
            timestamp,
            kind,
            seq,
        };
        self.registry.broadcast_event(&event);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Full timestamp quad for an event at `lmt`: wall clock now, its
    /// system sample count, and the machine-time pair.
    fn stamp(&self, lmt: u64) -> Timestamp {
        let st = St::from_datetime(Utc::now()).unwrap_or_default();
        let lst = self.timebase.st_to_lst(st).unwrap_or_default();
        Timestamp {
            st,
            mt: self.timebase.lmt_to_mt(lmt),
            lst,
            lmt,
        }
    }
}

/// Handle on a running event pump.
pub struct EventPump {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    top: JoinHandle<()>,
    bottom: JoinHandle<()>,
    stats: Arc<EventStats>,
}

impl EventPump {
    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> &EventStats {
        &self.stats
    }

    /// Stop both halves and wait for queued events to finish processing.
    pub async fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify_waiters();
        if let Err(err) = self.top.await {
            warn!(%err, "event top half ended abnormally");
        }
        if let Err(err) = self.bottom.await {
            warn!(%err, "event worker ended abnormally");
        }
    }
}

impl std::fmt::Debug for EventPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPump")
            .field("processed", &self.stats.processed())
            .field("dropped_full", &self.stats.dropped_full())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBpm;
    use dod_core::position::{
        CircularController, ControllerSettings, ControllerShared, PositionController,
        SegmentedController,
    };
    use dod_core::{CircularBuffer, ClockRatio};

    struct Fixture {
        mock: Arc<MockBpm>,
        worker: EventWorker,
        log: Arc<TriggerLog>,
        registry: Arc<ControllerRegistry>,
        shared: ControllerShared,
    }

    fn fixture(profile: DeviceProfile) -> Fixture {
        let timebase =
            Arc::new(TimebaseConverter::new(1_000, 1_000, 1, ClockRatio::unity()).unwrap());
        let (ring, _writer) = CircularBuffer::new(64, 1, 2).unwrap();
        let log = Arc::new(TriggerLog::new(16));
        let registry = Arc::new(ControllerRegistry::new());
        let shared = ControllerShared {
            timebase: Arc::clone(&timebase),
            ring,
            trigger_log: Arc::clone(&log),
            profile,
            settings: ControllerSettings {
                timeout: Duration::from_millis(100),
                max_look_ahead: 0,
                max_read_size: 64,
                atom_period_lmt: 10,
            },
        };
        let worker = EventWorker::new(
            timebase,
            Arc::clone(&log),
            Arc::clone(&registry),
            profile,
        );
        Fixture {
            mock: MockBpm::builder().build(),
            worker,
            log,
            registry,
            shared,
        }
    }

    fn pump_config() -> EventPumpConfig {
        EventPumpConfig {
            poll_interval: Duration::from_millis(1),
            queue_capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_pump_decodes_stamps_and_logs() {
        let fx = fixture(DeviceProfile::Ebpp);
        fx.mock.push_event(4, 500);

        let pump = fx.worker.spawn(fx.mock.clone(), pump_config());
        tokio::time::sleep(Duration::from_millis(20)).await;
        pump.shutdown().await;

        let event = fx.log.latest(EventKind::Trigger).unwrap();
        assert_eq!(event.timestamp.lmt, 500);
        assert_eq!(event.timestamp.mt, 500);
        assert!(event.timestamp.st.secs > 0);
    }

    #[tokio::test]
    async fn test_sync_event_reanchors_live_controllers() {
        let fx = fixture(DeviceProfile::Ebpp);
        let controller = CircularController::new(fx.shared.clone());
        let as_dyn: Arc<dyn PositionController> = controller.clone();
        fx.registry.register(&as_dyn);

        fx.mock.push_event(1, 9_000);
        let pump = fx.worker.spawn(fx.mock.clone(), pump_config());
        tokio::time::sleep(Duration::from_millis(20)).await;
        pump.shutdown().await;

        assert_eq!(controller.start_lmt(), 9_000);
        assert!(controller.is_enabled());
        assert!(fx.log.latest(EventKind::Sc).is_some());
    }

    #[tokio::test]
    async fn test_segmented_machine_fed_through_pump() {
        let fx = fixture(DeviceProfile::Bbfp);
        let controller = SegmentedController::new(fx.shared.clone());
        let as_dyn: Arc<dyn PositionController> = controller.clone();
        fx.registry.register(&as_dyn);

        fx.mock.push_event(3, 100);
        fx.mock.push_event(4, 130);
        let pump = fx.worker.spawn(fx.mock.clone(), pump_config());
        tokio::time::sleep(Duration::from_millis(20)).await;
        pump.shutdown().await;

        assert_eq!(controller.committed_count(), 1);
        let segment = controller.current_segment().unwrap();
        assert_eq!(segment.base_offset_lmt, 30);
    }

    #[tokio::test]
    async fn test_unknown_code_is_counted_and_dropped() {
        let fx = fixture(DeviceProfile::Ebpp);
        fx.mock.push_event(99, 5);

        let pump = fx.worker.spawn(fx.mock.clone(), pump_config());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pump.stats().unknown_codes(), 1);
        assert_eq!(pump.stats().processed(), 0);
        pump.shutdown().await;

        assert!(fx.log.is_empty());
    }

    #[tokio::test]
    async fn test_profile_filters_foreign_trigger_kinds() {
        // EBPP never arms; ARM events are dropped before the log.
        let fx = fixture(DeviceProfile::Ebpp);
        fx.mock.push_event(3, 100);
        fx.mock.push_event(4, 200);

        let pump = fx.worker.spawn(fx.mock.clone(), pump_config());
        tokio::time::sleep(Duration::from_millis(20)).await;
        pump.shutdown().await;

        assert_eq!(fx.log.len(), 1);
        assert!(fx.log.latest(EventKind::Arm).is_none());
        assert!(fx.log.latest(EventKind::Trigger).is_some());
    }
}
