//! Deterministic in-memory hardware for tests and demos.
//!
//! [`MockBpm`] implements all three collaborator traits against a model of
//! the burst FIFO: tests feed atoms and events explicitly, or let
//! `auto_feed` top the FIFO up on every depth probe for continuous runs.
//! Atom contents are reproducible, either a counter pattern keyed to the
//! absolute atom index or seeded noise.

use crate::bus::{regs, BurstPort, DmaCompletion, InterruptSource, RawEvent, RegisterBus};
use async_trait::async_trait;
use dod_core::{DodError, DodResult};
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Identity word reported by the mock, ASCII "BPM" plus a revision.
pub const MOCK_IDENT: u32 = 0x4250_4D01;

/// How the mock fills atom payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataPattern {
    /// Every byte of atom `n` is `n % 251`. Lets a test check data against
    /// the absolute position it was read from.
    Counter,
    /// Seeded ChaCha8 bytes. Realistic-looking and reproducible.
    #[default]
    Noise,
}

struct MockState {
    available: u64,
    next_atom: u64,
    pending_overrun: bool,
    events: VecDeque<RawEvent>,
    predecimation: u32,
    registers: HashMap<u32, u32>,
    rng: ChaCha8Rng,
}

/// Builder for [`MockBpm`].
#[derive(Debug, Clone)]
pub struct MockBpmBuilder {
    seed: Option<u64>,
    atom_size: usize,
    auto_feed: u64,
    pattern: DataPattern,
}

impl Default for MockBpmBuilder {
    fn default() -> Self {
        Self {
            seed: None,
            atom_size: 8,
            auto_feed: 0,
            pattern: DataPattern::default(),
        }
    }
}

impl MockBpmBuilder {
    /// Seed for the noise generator. Unseeded mocks draw from the OS.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Bytes per atom.
    #[must_use]
    pub fn atom_size(mut self, atom_size: usize) -> Self {
        self.atom_size = atom_size;
        self
    }

    /// Atoms added to the FIFO on every depth probe. Zero means tests feed
    /// explicitly.
    #[must_use]
    pub fn auto_feed(mut self, atoms: u64) -> Self {
        self.auto_feed = atoms;
        self
    }

    /// Payload fill pattern.
    #[must_use]
    pub fn pattern(mut self, pattern: DataPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Build the mock.
    #[must_use]
    pub fn build(self) -> Arc<MockBpm> {
        let rng = match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Arc::new(MockBpm {
            atom_size: self.atom_size.max(1),
            auto_feed: self.auto_feed,
            pattern: self.pattern,
            state: Mutex::new(MockState {
                available: 0,
                next_atom: 0,
                pending_overrun: false,
                events: VecDeque::new(),
                predecimation: 1,
                registers: HashMap::new(),
                rng,
            }),
            fed: Notify::new(),
            depth_probes: AtomicU64::new(0),
            dma_transfers: AtomicU64::new(0),
        })
    }
}

/// In-memory beam position monitor front end.
pub struct MockBpm {
    atom_size: usize,
    auto_feed: u64,
    pattern: DataPattern,
    state: Mutex<MockState>,
    fed: Notify,
    depth_probes: AtomicU64,
    dma_transfers: AtomicU64,
}

impl MockBpm {
    /// Start building a mock.
    #[must_use]
    pub fn builder() -> MockBpmBuilder {
        MockBpmBuilder::default()
    }

    /// Put `atoms` atoms into the FIFO and wake any data waiter.
    pub fn feed_atoms(&self, atoms: u64) {
        self.state.lock().available += atoms;
        self.fed.notify_waiters();
    }

    /// Latch one event for the next [`InterruptSource::poll_events`].
    pub fn push_event(&self, code: u8, lmt: u64) {
        self.state.lock().events.push_back(RawEvent { code, lmt });
    }

    /// Mark the FIFO as having overflowed; reported by the next transfer.
    pub fn flag_overrun(&self) {
        self.state.lock().pending_overrun = true;
    }

    /// Depth probes seen so far.
    #[must_use]
    pub fn depth_probes(&self) -> u64 {
        self.depth_probes.load(Ordering::Relaxed)
    }

    /// DMA transfers started so far.
    #[must_use]
    pub fn dma_count(&self) -> u64 {
        self.dma_transfers.load(Ordering::Relaxed)
    }

    /// Currently programmed producer decimation.
    #[must_use]
    pub fn predecimation(&self) -> u32 {
        self.state.lock().predecimation
    }
}

impl RegisterBus for MockBpm {
    fn read_register(&self, offset: u32) -> DodResult<u32> {
        let state = self.state.lock();
        match offset {
            regs::IDENT => Ok(MOCK_IDENT),
            regs::STATUS => {
                let mut word = 0;
                if state.available > 0 {
                    word |= regs::STATUS_DATA_READY;
                }
                if state.pending_overrun {
                    word |= regs::STATUS_OVERRUN;
                }
                Ok(word)
            }
            other => Ok(state.registers.get(&other).copied().unwrap_or(0)),
        }
    }

    fn write_register(&self, offset: u32, value: u32) -> DodResult<()> {
        self.state.lock().registers.insert(offset, value);
        Ok(())
    }
}

#[async_trait]
impl BurstPort for MockBpm {
    fn fifo_depth(&self) -> DodResult<u64> {
        self.depth_probes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if self.auto_feed > 0 {
            state.available += self.auto_feed;
        }
        Ok(state.available)
    }

    async fn wait_data(&self, deadline: Instant) -> DodResult<()> {
        // Register interest before re-checking so a feed between the check
        // and the await is not lost.
        let notified = self.fed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.state.lock().available > 0 || self.auto_feed > 0 {
            return Ok(());
        }
        let _ = tokio::time::timeout_at(deadline, notified).await;
        Ok(())
    }

    async fn start_dma(&self, count: u64, dst: &mut [u8]) -> DodResult<DmaCompletion> {
        self.dma_transfers.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let take = count.min(state.available);
        let bytes = (take as usize) * self.atom_size;
        if dst.len() < bytes {
            return Err(DodError::InvalidArgument(format!(
                "dma destination holds {} bytes, {} atoms need {}",
                dst.len(),
                take,
                bytes
            )));
        }
        for i in 0..take as usize {
            let atom = &mut dst[i * self.atom_size..(i + 1) * self.atom_size];
            match self.pattern {
                DataPattern::Counter => atom.fill((state.next_atom % 251) as u8),
                DataPattern::Noise => state.rng.fill_bytes(atom),
            }
            state.next_atom += 1;
        }
        state.available -= take;
        let overrun = std::mem::take(&mut state.pending_overrun);
        Ok(DmaCompletion {
            transferred_atoms: take,
            overrun,
        })
    }

    fn set_predecimation(&self, n: u32) -> DodResult<()> {
        if n == 0 {
            return Err(DodError::InvalidArgument(
                "predecimation of zero would discard the whole stream".into(),
            ));
        }
        self.state.lock().predecimation = n;
        Ok(())
    }
}

impl InterruptSource for MockBpm {
    fn poll_events(&self) -> DodResult<Vec<RawEvent>> {
        let mut state = self.state.lock();
        Ok(state.events.drain(..).collect())
    }
}

impl std::fmt::Debug for MockBpm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockBpm")
            .field("atom_size", &self.atom_size)
            .field("available", &state.available)
            .field("next_atom", &state.next_atom)
            .field("pattern", &self.pattern)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_counter_pattern_tracks_absolute_atom_index() {
        let mock = MockBpm::builder()
            .atom_size(2)
            .pattern(DataPattern::Counter)
            .build();
        mock.feed_atoms(3);

        let mut buf = vec![0u8; 6];
        let completion = mock.start_dma(3, &mut buf).await.unwrap();
        assert_eq!(completion.transferred_atoms, 3);
        assert_eq!(buf, [0, 0, 1, 1, 2, 2]);

        // The index keeps counting across transfers.
        mock.feed_atoms(1);
        let mut buf = vec![0u8; 2];
        mock.start_dma(1, &mut buf).await.unwrap();
        assert_eq!(buf, [3, 3]);
    }

    #[tokio::test]
    async fn test_noise_pattern_is_reproducible_per_seed() {
        let mut first = vec![0u8; 16];
        let mut second = vec![0u8; 16];
        for buf in [&mut first, &mut second] {
            let mock = MockBpm::builder().seed(7).atom_size(8).build();
            mock.feed_atoms(2);
            mock.start_dma(2, buf).await.unwrap();
        }
        assert_eq!(first, second);
        assert_ne!(first, vec![0u8; 16]);
    }

    #[tokio::test]
    async fn test_status_register_reflects_fifo_state() {
        let mock = MockBpm::builder().atom_size(1).build();
        assert_eq!(mock.read_register(regs::IDENT).unwrap(), MOCK_IDENT);
        assert_eq!(mock.read_register(regs::STATUS).unwrap(), 0);

        mock.feed_atoms(1);
        mock.flag_overrun();
        let status = mock.read_register(regs::STATUS).unwrap();
        assert_eq!(
            status,
            regs::STATUS_DATA_READY | regs::STATUS_OVERRUN
        );

        let mut buf = vec![0u8; 1];
        let completion = mock.start_dma(1, &mut buf).await.unwrap();
        assert!(completion.overrun);
        assert_eq!(mock.read_register(regs::STATUS).unwrap(), 0);
    }

    #[test]
    fn test_events_drain_on_poll() {
        let mock = MockBpm::builder().build();
        mock.push_event(3, 100);
        mock.push_event(4, 130);

        let events = mock.poll_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], RawEvent { code: 3, lmt: 100 });
        assert!(mock.poll_events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_data_wakes_on_feed() {
        let mock = MockBpm::builder().atom_size(1).build();
        let waiter = mock.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            waiter
                .wait_data(Instant::now() + Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        mock.feed_atoms(1);
        handle.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
