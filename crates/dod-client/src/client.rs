//! Client session handles.
//!
//! A [`DodClient`] is one consumer's view of a device: open it in one of
//! the five addressing modes, read chunks, close it. Synchronous modes
//! (`Position`, `Now`, `ByLmt`) resolve and copy inline under the
//! device-global read gate. Event modes (`OnEvent`, `SingleEvent`) get a
//! private controller clone and a reader pump that stages chunks into the
//! client's stream queue; `read` then pops the queue.
//!
//! A client handle is single-shot: after [`close`](DodClient::close) every
//! operation fails with `Closed`. Mint a fresh handle from the device to
//! start over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use dod_core::error::TERM_CLOSED;
use dod_core::position::{AccessMode, PositionController, PositionRequest};
use dod_core::{Chunk, DodError, DodResult, MetaId};
use dod_queue::{ChunkPool, QueueStats, StreamQueue};

use crate::device::{CursorMark, DeviceContext};
use crate::pump::{run_pump, Dispatch, PumpContext};

// =============================================================================
// Session
// =============================================================================

/// State of one open client, from `open` to `close`.
struct Session {
    mode: AccessMode,
    read_size: usize,
    offset: i64,
    controller: Arc<dyn PositionController>,
    /// The controller is a private clone registered by this session and
    /// must be stopped and released on close. Synchronous sessions borrow
    /// the device's shared controller instead and must leave it running.
    owns_clone: bool,
    pump: Option<JoinHandle<()>>,
}

// =============================================================================
// Client
// =============================================================================

/// One consumer's handle onto a [`DeviceContext`].
pub struct DodClient {
    device: Arc<DeviceContext>,
    queue: Arc<StreamQueue<Chunk>>,
    pool: Arc<ChunkPool>,
    dispatch: Mutex<Option<Arc<dyn Dispatch>>>,
    session: Mutex<Option<Session>>,
    closed: AtomicBool,
}

impl DodClient {
    pub(crate) fn new(device: Arc<DeviceContext>) -> Self {
        let queue_cfg = device.queue_section();
        let queue = Arc::new(StreamQueue::new(
            queue_cfg.capacity,
            queue_cfg.policy.into(),
        ));
        let chunk_bytes = device.settings().max_read_size * device.profile().atom_size();
        let pool = Arc::new(ChunkPool::new(queue_cfg.chunk_count, chunk_bytes));
        Self {
            device,
            queue,
            pool,
            dispatch: Mutex::new(None),
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Install the per-chunk upcall. Takes effect for sessions opened
    /// afterwards.
    pub fn set_dispatch(&self, dispatch: Arc<dyn Dispatch>) {
        *self.dispatch.lock() = Some(dispatch);
    }

    /// Open a session in `mode`, reading `read_size` atoms per chunk at a
    /// signed atom `offset` from each resolved base.
    ///
    /// The read size is clamped to the controller's limit. Event modes
    /// spawn the reader pump and must be opened inside a Tokio runtime. A
    /// second open on the same handle fails with `InvalidArgument`.
    pub fn open(&self, mode: AccessMode, read_size: usize, offset: i64) -> DodResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DodError::Closed);
        }
        if read_size == 0 {
            return Err(DodError::InvalidArgument("read size must be nonzero".into()));
        }
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(DodError::InvalidArgument("client is already open".into()));
        }

        let (controller, owns_clone): (Arc<dyn PositionController>, bool) =
            if mode.is_event_driven() {
                let clone = self.device.main_controller().clone_controller();
                self.device.registry().register(&clone);
                (clone, true)
            } else {
                (Arc::clone(self.device.main_controller()), false)
            };
        let effective = read_size.min(controller.max_read_size());
        if effective < read_size {
            debug!(read_size, clamped = effective, "read size clamped to controller limit");
        }

        self.queue.reset();
        let pump = if mode.is_event_driven() {
            let ctx = PumpContext {
                device: Arc::clone(&self.device),
                controller: Arc::clone(&controller),
                queue: Arc::clone(&self.queue),
                pool: Arc::clone(&self.pool),
                dispatch: self.dispatch.lock().clone(),
                request: PositionRequest {
                    mode,
                    position: 0,
                    offset,
                    read_size: effective,
                },
                single: matches!(mode, AccessMode::SingleEvent),
            };
            Some(tokio::spawn(run_pump(ctx)))
        } else {
            None
        };

        *session = Some(Session {
            mode,
            read_size: effective,
            offset,
            controller,
            owns_clone,
            pump,
        });
        debug!(device = %self.device.name(), %mode, read_size = effective, offset, "client opened");
        Ok(())
    }

    /// Read one chunk.
    ///
    /// Event modes pop the next staged chunk, waiting up to the controller
    /// timeout. Synchronous modes resolve and copy inline: `position` seeks
    /// explicitly in the session's mode, `None` continues from where the
    /// previous read ended, and a queued
    /// [`set_position_request`](DeviceContext::set_position_request)
    /// overrides both. The chunk's metadata carries the addressing epoch it
    /// was resolved under; if the device re-anchors machine time mid-read
    /// the result is discarded and the read fails with `StalePosition`.
    pub async fn read(&self, position: Option<u64>) -> DodResult<Chunk> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DodError::Closed);
        }
        let (mode, read_size, offset, controller) = {
            let session = self.session.lock();
            let session = session
                .as_ref()
                .ok_or_else(|| DodError::InvalidArgument("client is not open".into()))?;
            (
                session.mode,
                session.read_size,
                session.offset,
                Arc::clone(&session.controller),
            )
        };
        let atom_size = self.device.profile().atom_size();

        if mode.is_event_driven() {
            let chunk = self
                .queue
                .pop(self.device.settings().timeout)
                .await
                .map_err(DodError::from)?;
            ensure_complete(read_size, &chunk, atom_size)?;
            return Ok(chunk);
        }

        let mut gate = self.device.read_gate().lock().await;
        let epoch = self.device.epoch();
        let request =
            self.device
                .resolve_read_start(&gate, position, mode, offset, read_size, epoch)?;
        let resolved = controller.get_position(&request).await?;

        let bytes = read_size * atom_size;
        let mut buf = self
            .pool
            .acquire_timeout(self.device.settings().timeout)
            .await
            .map_err(|err| {
                debug!(%err, "no free chunk for synchronous read");
                DodError::Retry
            })?;
        self.device.ring().read_into(
            resolved.absolute_position,
            read_size as u64,
            buf.resize(bytes),
        )?;
        if self.device.epoch() != epoch {
            return Err(DodError::StalePosition);
        }

        let end = resolved
            .absolute_position
            .checked_add(read_size as u64)
            .ok_or_else(|| DodError::OutOfRange("read end overflows the position space".into()))?;
        gate.mark = Some(CursorMark {
            position: end,
            epoch,
        });

        let mut meta = resolved.meta;
        meta.set(MetaId::Epoch, epoch as i64);
        if self.device.drain_status().take_overrun() {
            meta.set(MetaId::Overrun, 1);
        }
        Ok(Chunk::new(buf.freeze(), meta))
    }

    /// Close the session: stop a privately owned controller clone, wait
    /// for the reader pump, cancel the stream queue and release the clone
    /// from the registry. Idempotent; every later operation on this handle
    /// fails with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let session = self.session.lock().take();
        if let Some(session) = session {
            if session.owns_clone {
                session.controller.stop();
            }
            if let Some(pump) = session.pump {
                if let Err(err) = pump.await {
                    warn!(%err, "reader pump join failed");
                }
            }
            self.queue.cancel(TERM_CLOSED);
            if session.owns_clone {
                self.device.registry().release(&session.controller);
            }
            debug!(device = %self.device.name(), mode = %session.mode, "client closed");
        }
    }

    /// Whether a session is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.session.lock().is_some()
    }

    /// Addressing mode of the open session, if any.
    #[must_use]
    pub fn mode(&self) -> Option<AccessMode> {
        self.session.lock().as_ref().map(|session| session.mode)
    }

    /// Counters of this client's stream queue.
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// The device this client reads from.
    #[must_use]
    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }
}

impl Drop for DodClient {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(session) = self.session.get_mut().take() {
            if session.owns_clone {
                session.controller.stop();
                self.device.registry().release(&session.controller);
            }
            self.queue.cancel(TERM_CLOSED);
            warn!(mode = %session.mode, "client dropped while open, pump left to wind down");
        }
    }
}

impl std::fmt::Debug for DodClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DodClient")
            .field("device", &self.device.name())
            .field("mode", &self.mode())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Fail a delivery that carries fewer atoms than the session asked for.
/// Short chunks are never returned as success.
pub(crate) fn ensure_complete(wanted: usize, chunk: &Chunk, atom_size: usize) -> DodResult<()> {
    let got = chunk.data.len() / atom_size.max(1);
    if got < wanted {
        return Err(DodError::Incomplete { wanted, got });
    }
    Ok(())
}
