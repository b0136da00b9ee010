//! Reader pump for event-driven sessions.
//!
//! Event modes do not read inline. At open the client spawns one pump task
//! that resolves each event through the session's private controller
//! clone, copies the addressed window out of the ring into a pooled chunk,
//! and pushes the chunk onto the session's [`StreamQueue`]. The client's
//! `read` then just pops the queue. The pump runs until the session is
//! closed or the device fails in a way that cannot be retried, at which
//! point it cancels the queue with the matching terminal code.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use dod_core::error::TERM_CLOSED;
use dod_core::position::{PositionController, PositionRequest};
use dod_core::{Chunk, DodError, MetaId};
use dod_queue::{ChunkPool, StreamQueue};

use crate::device::DeviceContext;

/// Pause between attempts while the controllers are disabled for a
/// machine-time change.
const RETRY_PAUSE: Duration = Duration::from_millis(1);

/// Per-chunk upcall, invoked by the pump once per drained chunk, after the
/// ring copy and before the queue push.
///
/// Runs on the pump task. Implementations must not block; a slow dispatch
/// stalls the whole session.
pub trait Dispatch: Send + Sync {
    /// Observe one chunk before it is queued.
    fn dispatch(&self, chunk: &Chunk);
}

/// Everything one pump task needs, captured at open.
pub(crate) struct PumpContext {
    pub(crate) device: Arc<DeviceContext>,
    pub(crate) controller: Arc<dyn PositionController>,
    pub(crate) queue: Arc<StreamQueue<Chunk>>,
    pub(crate) pool: Arc<ChunkPool>,
    pub(crate) dispatch: Option<Arc<dyn Dispatch>>,
    pub(crate) request: PositionRequest,
    /// Stop after the first delivered chunk.
    pub(crate) single: bool,
}

/// Drive one event-driven session until close or a terminal error.
///
/// Retryable conditions keep the loop alive: a resolution timeout means no
/// event arrived within the budget, `Retry` means the device is paused or
/// briefly unreadable, and `NoData` means the event's window was already
/// lapped. A terminal error cancels the queue with its code so blocked and
/// future pops observe why the stream ended.
pub(crate) async fn run_pump(ctx: PumpContext) {
    let atom_size = ctx.device.profile().atom_size();
    let bytes = ctx.request.read_size * atom_size;
    let acquire_budget = ctx.device.settings().timeout;

    loop {
        let epoch = ctx.device.epoch();
        let resolved = match ctx.controller.get_position(&ctx.request).await {
            Ok(resolved) => resolved,
            Err(DodError::Timeout) => continue,
            Err(DodError::Retry) => {
                tokio::time::sleep(RETRY_PAUSE).await;
                continue;
            }
            Err(DodError::NoData) => {
                debug!("event window no longer addressable, skipping");
                continue;
            }
            Err(DodError::Closed) => {
                ctx.queue.cancel(TERM_CLOSED);
                break;
            }
            Err(err) => {
                warn!(%err, "reader pump stopping");
                ctx.queue.cancel(err.terminal_code());
                break;
            }
        };

        // Consumer holds every pooled chunk: the event is dropped rather
        // than the pump blocking past its budget.
        let mut buf = match ctx.pool.acquire_timeout(acquire_budget).await {
            Ok(buf) => buf,
            Err(err) => {
                debug!(%err, position = resolved.absolute_position, "no free chunk, event dropped");
                continue;
            }
        };
        match ctx.device.ring().read_into(
            resolved.absolute_position,
            ctx.request.read_size as u64,
            buf.resize(bytes),
        ) {
            Ok(()) => {}
            Err(DodError::NoData | DodError::Retry) => {
                debug!(position = resolved.absolute_position, "window lapped before copy");
                continue;
            }
            Err(err) => {
                warn!(%err, "ring read failed, reader pump stopping");
                ctx.queue.cancel(err.terminal_code());
                break;
            }
        }
        if ctx.device.epoch() != epoch {
            debug!("addressing epoch changed mid-read, chunk dropped");
            continue;
        }

        let mut meta = resolved.meta;
        meta.set(MetaId::Epoch, epoch as i64);
        if ctx.device.drain_status().take_overrun() {
            meta.set(MetaId::Overrun, 1);
        }
        let chunk = Chunk::new(buf.freeze(), meta);
        if let Some(dispatch) = &ctx.dispatch {
            dispatch.dispatch(&chunk);
        }
        if !ctx.queue.push(chunk) {
            debug!("stream queue full, chunk rejected");
        }
        if ctx.single {
            break;
        }
    }
}
