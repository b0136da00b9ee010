//! Position-only controller over a flat region.
//!
//! The degenerate member of the family: no timebase, no events, no ring
//! semantics. Requests address a fixed region of `size` atoms; the effective
//! position is clamped so the read window always fits. Used for device
//! regions that are plain snapshots rather than live circular history.

use super::{
    apply_offset, AccessMode, ControlState, PositionController, PositionRequest, ResolvedPosition,
};
use crate::error::{DodError, DodResult};
use crate::meta::{ChunkMeta, MetaId};
use async_trait::async_trait;
use std::sync::Arc;

/// Controller for a flat, fully readable region.
pub struct SimpleController {
    size: u64,
    max_read_size: usize,
    control: ControlState,
}

impl SimpleController {
    /// Controller over a region of `size` atoms, accepting reads up to
    /// `max_read_size` atoms.
    #[must_use]
    pub fn new(size: u64, max_read_size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            max_read_size,
            control: ControlState::new(true),
        })
    }

    /// Region size in atoms.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[async_trait]
impl PositionController for SimpleController {
    async fn get_position(&self, request: &PositionRequest) -> DodResult<ResolvedPosition> {
        if let Some(err) = self.control.bail() {
            return Err(err);
        }
        if request.mode != AccessMode::Position {
            return Err(DodError::InvalidArgument(format!(
                "flat regions support position addressing only, got {}",
                request.mode
            )));
        }
        if request.read_size == 0 || request.read_size > self.max_read_size {
            return Err(DodError::InvalidArgument(format!(
                "read size {} outside 1..={}",
                request.read_size, self.max_read_size
            )));
        }
        let window = request.read_size as u64;
        if window > self.size {
            return Err(DodError::InvalidArgument(format!(
                "read of {window} atoms exceeds the region size {}",
                self.size
            )));
        }

        // Clamp rather than fail: the region edges are legitimate targets
        // and a request sliding off either end reads the nearest window.
        let shifted = apply_offset(request.position, request.offset).unwrap_or(0);
        let position = shifted.min(self.size - window);

        let mut meta = ChunkMeta::new();
        meta.set(MetaId::AbsolutePosition, position as i64)
            .set(MetaId::AtomCount, request.read_size as i64);
        Ok(ResolvedPosition {
            lmt: 0,
            absolute_position: position,
            meta,
        })
    }

    fn reset(&self, _start_lmt: u64) {}

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
        self.max_read_size
    }

    fn clone_controller(&self) -> Arc<dyn PositionController> {
        Arc::new(Self {
            size: self.size,
            max_read_size: self.max_read_size,
            control: ControlState::new(self.control.is_enabled()),
        })
    }
}

impl std::fmt::Debug for SimpleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleController")
            .field("size", &self.size)
            .field("max_read_size", &self.max_read_size)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(position: u64, offset: i64, read_size: usize) -> PositionRequest {
        PositionRequest {
            mode: AccessMode::Position,
            position,
            offset,
            read_size,
        }
    }

    #[tokio::test]
    async fn test_resolves_in_range_position() {
        let controller = SimpleController::new(1_000, 256);
        let resolved = controller.get_position(&request(100, 20, 64)).await.unwrap();
        assert_eq!(resolved.absolute_position, 120);
        assert_eq!(resolved.lmt, 0);
        assert_eq!(resolved.meta.get(MetaId::AtomCount), Some(64));
    }

    #[tokio::test]
    async fn test_clamps_to_region_edges() {
        let controller = SimpleController::new(1_000, 256);
        // Past the end: slides back so the window fits.
        let resolved = controller
            .get_position(&request(990, 100, 64))
            .await
            .unwrap();
        assert_eq!(resolved.absolute_position, 1_000 - 64);
        // Before the start: clamps to zero.
        let resolved = controller.get_position(&request(5, -500, 64)).await.unwrap();
        assert_eq!(resolved.absolute_position, 0);
    }

    #[tokio::test]
    async fn test_rejects_foreign_modes_and_oversized_windows() {
        let controller = SimpleController::new(100, 256);
        let mut req = request(0, 0, 10);
        req.mode = AccessMode::Now;
        assert!(matches!(
            controller.get_position(&req).await,
            Err(DodError::InvalidArgument(_))
        ));
        assert!(matches!(
            controller.get_position(&request(0, 0, 101)).await,
            Err(DodError::InvalidArgument(_))
        ));
        assert!(matches!(
            controller.get_position(&request(0, 0, 0)).await,
            Err(DodError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_and_stopped() {
        let controller = SimpleController::new(100, 64);
        controller.set_enabled(false);
        assert!(matches!(
            controller.get_position(&request(0, 0, 10)).await,
            Err(DodError::Retry)
        ));
        controller.set_enabled(true);
        controller.stop();
        assert!(matches!(
            controller.get_position(&request(0, 0, 10)).await,
            Err(DodError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_clone_carries_no_mutable_state() {
        let controller = SimpleController::new(100, 64);
        let clone = controller.clone_controller();
        controller.stop();
        // The original is closed; the clone still resolves.
        assert!(clone.get_position(&request(0, 0, 10)).await.is_ok());
    }
}
