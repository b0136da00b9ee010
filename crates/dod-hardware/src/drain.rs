//! Burst-FIFO drain loop: the single producer that moves acquisition data
//! from hardware into the circular buffer.
//!
//! One [`FifoDrainLoop::drain`] call moves a requested number of atoms.
//! Each transfer attempt first waits (bounded by `poll_interval`) for burst
//! data, then moves `min(remaining, burst_capacity, ring contiguous free)`
//! atoms. Consecutive empty polls are counted; reaching `max_idle_polls`
//! fails with [`DodError::Deadlock`], the forward-progress bound for a data
//! path that should never fall silent.
//!
//! A hardware overrun does not abort the producer: the flag is latched on
//! the shared [`DrainStatus`] and the current transfer stops, so consumers
//! see the loss on their next completed read instead of losing the device.

use crate::bus::BurstPort;
use dod_core::{DodError, DodResult, RingWriter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tuning for one drain loop, assembled from the `[drain]` config section
/// and the device profile.
#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Largest burst per DMA, in atoms.
    pub burst_capacity: usize,
    /// Bound for one wait-for-data step.
    pub poll_interval: Duration,
    /// Consecutive empty polls before the loop gives up.
    pub max_idle_polls: u32,
    /// Thin the stream in the drain loop instead of in the producer.
    pub predecimate: bool,
    /// Samples per machine-time tick; `1` means no thinning.
    pub decimation: u32,
    /// Bytes per atom.
    pub atom_size: usize,
}

/// Shared view of a running drain loop.
#[derive(Debug)]
pub struct DrainStatus {
    overrun: AtomicBool,
    drained: AtomicU64,
    stop: AtomicBool,
}

impl DrainStatus {
    fn new() -> Self {
        Self {
            overrun: AtomicBool::new(false),
            drained: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        }
    }

    /// Consume the sticky overrun flag. Returns whether an overrun happened
    /// since the last call.
    pub fn take_overrun(&self) -> bool {
        self.overrun.swap(false, Ordering::AcqRel)
    }

    /// Peek at the sticky overrun flag without consuming it.
    #[must_use]
    pub fn overrun_pending(&self) -> bool {
        self.overrun.load(Ordering::Acquire)
    }

    /// Atoms published to the ring since the loop started.
    #[must_use]
    pub fn drained_atoms(&self) -> u64 {
        self.drained.load(Ordering::Acquire)
    }

    /// Ask the loop to end after the current transfer attempt.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn flag_overrun(&self) {
        self.overrun.store(true, Ordering::Release);
    }

    fn add_drained(&self, atoms: u64) {
        self.drained.fetch_add(atoms, Ordering::AcqRel);
    }
}

/// What one [`FifoDrainLoop::drain`] call should move.
#[derive(Debug, Clone, Copy)]
pub struct DrainRequest {
    /// Atoms to publish to the ring before returning.
    pub atoms: u64,
}

/// What one [`FifoDrainLoop::drain`] call actually moved.
#[derive(Debug, Clone, Copy)]
pub struct DrainReport {
    /// Atoms published to the ring.
    pub transferred_atoms: u64,
    /// A hardware overrun was latched during this call.
    pub overrun: bool,
}

/// Owns the burst port and the ring writer; the only place data enters
/// the ring.
pub struct FifoDrainLoop {
    port: Arc<dyn BurstPort>,
    writer: RingWriter,
    config: DrainConfig,
    status: Arc<DrainStatus>,
    staging: Vec<u8>,
    /// Phase within the current decimation group, carried across bursts
    /// so thinning alignment holds at chunk boundaries.
    dec_offset: u64,
}

impl FifoDrainLoop {
    /// Wire a drain loop to its port and ring. Configures producer-side
    /// decimation unless `predecimate` asks for loop-side thinning.
    pub fn new(
        port: Arc<dyn BurstPort>,
        writer: RingWriter,
        config: DrainConfig,
    ) -> DodResult<(Self, Arc<DrainStatus>)> {
        if config.burst_capacity == 0 || config.atom_size == 0 || config.decimation == 0 {
            return Err(DodError::InvalidArgument(
                "drain geometry terms must be nonzero".into(),
            ));
        }
        if config.max_idle_polls == 0 {
            return Err(DodError::InvalidArgument(
                "max idle polls must be nonzero".into(),
            ));
        }
        let producer_decimation = if config.predecimate {
            1
        } else {
            config.decimation
        };
        port.set_predecimation(producer_decimation)?;

        let staging = vec![0u8; config.burst_capacity * config.atom_size];
        let status = Arc::new(DrainStatus::new());
        let drain = Self {
            port,
            writer,
            config,
            status: Arc::clone(&status),
            staging,
            dec_offset: 0,
        };
        Ok((drain, status))
    }

    /// Move `request.atoms` atoms into the ring.
    ///
    /// Returns early with a partial report when a stop is requested or an
    /// overrun latches. Fails with [`DodError::Deadlock`] after exactly
    /// `max_idle_polls` consecutive empty polls.
    pub async fn drain(&mut self, request: &DrainRequest) -> DodResult<DrainReport> {
        let mut transferred: u64 = 0;
        let mut idle_polls: u32 = 0;
        let mut saw_overrun = false;

        while transferred < request.atoms {
            if self.status.stop_requested() {
                break;
            }
            let deadline = Instant::now() + self.config.poll_interval;
            self.port.wait_data(deadline).await?;

            let depth = self.port.fifo_depth()?;
            if depth == 0 {
                idle_polls += 1;
                if idle_polls >= self.config.max_idle_polls {
                    return Err(DodError::Deadlock { polls: idle_polls });
                }
                continue;
            }
            idle_polls = 0;

            let ring = self.writer.ring();
            let contiguous = ring.contiguous_free(ring.write_position());
            let burst = (request.atoms - transferred)
                .min(depth)
                .min(self.config.burst_capacity as u64)
                .min(contiguous);
            let bytes = (burst as usize) * self.config.atom_size;
            let completion = self.port.start_dma(burst, &mut self.staging[..bytes]).await?;

            if completion.overrun {
                saw_overrun = true;
                self.status.flag_overrun();
                warn!(
                    transferred = completion.transferred_atoms,
                    "burst FIFO overran, atoms lost upstream of this transfer"
                );
            }

            let got = completion.transferred_atoms.min(burst);
            if got > 0 {
                let published = self.publish(got as usize)?;
                transferred += published;
                self.status.add_drained(published);
            }
            if completion.overrun {
                break;
            }
        }

        Ok(DrainReport {
            transferred_atoms: transferred,
            overrun: saw_overrun,
        })
    }

    /// Drain continuously in bursts until a stop is requested. Returns the
    /// total atom count on a clean stop.
    ///
    /// The front end produces at a fixed decimated rate, so prolonged
    /// silence is a data-path fault and ends the loop with
    /// [`DodError::Deadlock`].
    pub async fn run(mut self) -> DodResult<u64> {
        info!(
            burst = self.config.burst_capacity,
            decimation = self.config.decimation,
            predecimate = self.config.predecimate,
            "drain loop running"
        );
        loop {
            if self.status.stop_requested() {
                let drained = self.status.drained_atoms();
                info!(drained, "drain loop stopped");
                return Ok(drained);
            }
            let report = self
                .drain(&DrainRequest {
                    atoms: self.config.burst_capacity as u64,
                })
                .await?;
            if report.overrun {
                debug!("continuing after latched overrun");
            }
        }
    }

    /// Write `atoms` staged atoms to the ring, thinning first when the
    /// loop does the decimation. Returns atoms actually published.
    fn publish(&mut self, atoms: usize) -> DodResult<u64> {
        let atom_size = self.config.atom_size;
        let step = u64::from(self.config.decimation);
        if !self.config.predecimate || step <= 1 {
            self.writer.write_atoms(&self.staging[..atoms * atom_size])?;
            return Ok(atoms as u64);
        }

        let mut kept = 0usize;
        for i in 0..atoms {
            if self.dec_offset == 0 {
                let src = i * atom_size;
                self.staging.copy_within(src..src + atom_size, kept * atom_size);
                kept += 1;
            }
            self.dec_offset = (self.dec_offset + 1) % step;
        }
        if kept > 0 {
            self.writer.write_atoms(&self.staging[..kept * atom_size])?;
        }
        Ok(kept as u64)
    }
}

impl std::fmt::Debug for FifoDrainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoDrainLoop")
            .field("config", &self.config)
            .field("drained", &self.status.drained_atoms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DataPattern, MockBpm};
    use dod_core::CircularBuffer;

    fn config(atom_size: usize) -> DrainConfig {
        DrainConfig {
            burst_capacity: 8,
            poll_interval: Duration::from_millis(1),
            max_idle_polls: 5,
            predecimate: false,
            decimation: 1,
            atom_size,
        }
    }

    #[tokio::test]
    async fn test_drain_moves_available_atoms_into_ring() {
        let mock = MockBpm::builder()
            .atom_size(4)
            .pattern(DataPattern::Counter)
            .build();
        let (ring, writer) = CircularBuffer::new(64, 4, 2).unwrap();
        let (mut drain, _status) = FifoDrainLoop::new(mock.clone(), writer, config(4)).unwrap();

        mock.feed_atoms(10);
        let report = drain.drain(&DrainRequest { atoms: 10 }).await.unwrap();
        assert_eq!(report.transferred_atoms, 10);
        assert!(!report.overrun);
        assert_eq!(ring.write_position(), 10);

        // Counter pattern: atom n is filled with byte (n % 251).
        let mut data = vec![0u8; 3 * 4];
        ring.read_into(4, 3, &mut data).unwrap();
        assert_eq!(data, [4, 4, 4, 4, 5, 5, 5, 5, 6, 6, 6, 6]);
    }

    #[tokio::test]
    async fn test_drain_waits_for_late_data() {
        let mock = MockBpm::builder().atom_size(1).build();
        let (_ring, writer) = CircularBuffer::new(64, 1, 2).unwrap();
        let mut cfg = config(1);
        cfg.max_idle_polls = 200;
        let (mut drain, _status) = FifoDrainLoop::new(mock.clone(), writer, cfg).unwrap();

        mock.feed_atoms(3);
        let feeder = mock.clone();
        let handle = tokio::spawn(async move {
            drain.drain(&DrainRequest { atoms: 6 }).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        feeder.feed_atoms(3);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.transferred_atoms, 6);
    }

    #[tokio::test]
    async fn test_deadlock_after_exact_idle_bound() {
        let mock = MockBpm::builder().atom_size(1).build();
        let (_ring, writer) = CircularBuffer::new(64, 1, 2).unwrap();
        let (mut drain, _status) = FifoDrainLoop::new(mock.clone(), writer, config(1)).unwrap();

        let err = drain.drain(&DrainRequest { atoms: 1 }).await.unwrap_err();
        assert!(matches!(err, DodError::Deadlock { polls: 5 }), "{err:?}");
        assert_eq!(mock.depth_probes(), 5);
    }

    #[tokio::test]
    async fn test_loop_side_decimation_carries_phase_across_bursts() {
        let mock = MockBpm::builder()
            .atom_size(1)
            .pattern(DataPattern::Counter)
            .build();
        let (ring, writer) = CircularBuffer::new(64, 1, 2).unwrap();
        let mut cfg = config(1);
        cfg.predecimate = true;
        cfg.decimation = 4;
        let (mut drain, _status) = FifoDrainLoop::new(mock.clone(), writer, cfg).unwrap();
        // Loop-side thinning leaves the producer running undecimated.
        assert_eq!(mock.predecimation(), 1);

        // Twelve source atoms fed in two batches of six: kept atoms are
        // source indexes 0, 4 and 8, with index 8 in the second batch.
        mock.feed_atoms(6);
        drain.drain(&DrainRequest { atoms: 2 }).await.unwrap();
        mock.feed_atoms(6);
        drain.drain(&DrainRequest { atoms: 1 }).await.unwrap();

        assert_eq!(ring.write_position(), 3);
        let mut data = vec![0u8; 3];
        ring.read_into(0, 3, &mut data).unwrap();
        assert_eq!(data, [0, 4, 8]);
    }

    #[tokio::test]
    async fn test_producer_side_decimation_is_programmed_once() {
        let mock = MockBpm::builder().atom_size(1).build();
        let (_ring, writer) = CircularBuffer::new(64, 1, 2).unwrap();
        let mut cfg = config(1);
        cfg.decimation = 64;
        let _ = FifoDrainLoop::new(mock.clone(), writer, cfg).unwrap();
        assert_eq!(mock.predecimation(), 64);
    }

    #[tokio::test]
    async fn test_overrun_latches_sticky_and_stops_the_transfer() {
        let mock = MockBpm::builder().atom_size(1).build();
        let (_ring, writer) = CircularBuffer::new(64, 1, 2).unwrap();
        let (mut drain, status) = FifoDrainLoop::new(mock.clone(), writer, config(1)).unwrap();

        mock.feed_atoms(4);
        mock.flag_overrun();
        let report = drain.drain(&DrainRequest { atoms: 8 }).await.unwrap();
        assert!(report.overrun);
        assert_eq!(report.transferred_atoms, 4);

        assert!(status.overrun_pending());
        assert!(status.take_overrun());
        assert!(!status.take_overrun(), "flag consumed once");
    }

    // The auto-fed mock keeps `run` supplied with data, so the spawned task
    // never parks; a second worker thread keeps the test body runnable.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_ends_cleanly_on_stop_request() {
        let mock = MockBpm::builder().atom_size(1).auto_feed(4).build();
        let (_ring, writer) = CircularBuffer::new(256, 1, 2).unwrap();
        let (drain, status) = FifoDrainLoop::new(mock, writer, config(1)).unwrap();

        let handle = tokio::spawn(drain.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        status.request_stop();
        let drained = handle.await.unwrap().unwrap();
        assert!(drained > 0);
    }
}
