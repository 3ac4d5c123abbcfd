//! Capture Buffer Queues
//!
//! Ownership bookkeeping between the video-buffer framework and the capture
//! hardware:
//! - DMA memory model shared by the CPU and the simulated engine
//! - Framework buffers and the fixed hardware slot table (at most 4 slots)
//! - FIFO idle/busy queues over arena indices

mod buffer;
mod dma;
mod fifo;
mod manager;

pub use buffer::{CaptureBuffer, HardwareBufferSlot, Plane, PlaneAddrs, VideoBuffer};
pub use dma::{DmaMemory, DmaRegion};
pub use fifo::IndexFifo;
pub use manager::{Drain, DrainTicket, QueueManager, Queued};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Arena index of a framework buffer
pub type BufferId = usize;

/// Maximum number of hardware slots the capture engine can address
pub const MAX_HW_SLOTS: usize = 4;

/// DMA start alignment required by the capture engine (bytes)
pub const DMA_ALIGN: u64 = 8;

/// Extra bytes reserved per buffer so every plane can be shifted to an
/// aligned start without running past the end of the allocation
pub const ALIGN_PADDING: usize = 3 * DMA_ALIGN as usize;

/// Queue and buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("DMA access out of range: {addr:#x}+{len}")]
    DmaOutOfRange { addr: u64, len: usize },

    #[error("DMA memory exhausted: requested {requested} bytes, {available} available")]
    DmaExhausted { requested: usize, available: usize },

    #[error("Unknown buffer index {0}")]
    UnknownBuffer(BufferId),

    #[error("Buffer {index} too small: {len} bytes, need {needed}")]
    BufferTooSmall { index: BufferId, len: usize, needed: usize },

    #[error("Not enough queued buffers: need {needed}, have {queued}")]
    NotEnoughBuffers { needed: usize, queued: usize },

    #[error("Slot count {0} exceeds hardware limit")]
    TooManySlots(usize),

    #[error("Queue partition violated: {0}")]
    Partition(String),
}

/// Byte sizes of the luma plane and of each chroma plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneLayout {
    pub y_size: usize,
    pub uv_size: usize,
}

impl PlaneLayout {
    /// Create a layout from plane sizes
    pub fn new(y_size: usize, uv_size: usize) -> Self {
        Self { y_size, uv_size }
    }

    /// Bytes the engine writes for one frame (Y + U + V)
    pub fn bytes_used(&self) -> usize {
        self.y_size + 2 * self.uv_size
    }

    /// Allocation size a framework buffer must provide
    pub fn buffer_size(&self) -> usize {
        self.bytes_used() + ALIGN_PADDING
    }

    /// Offset of a plane from the buffer start
    pub fn offset(&self, plane: Plane) -> usize {
        match plane {
            Plane::Y => 0,
            Plane::U => self.y_size,
            Plane::V => self.y_size + self.uv_size,
        }
    }

    /// Size of a plane
    pub fn size(&self, plane: Plane) -> usize {
        match plane {
            Plane::Y => self.y_size,
            Plane::U | Plane::V => self.uv_size,
        }
    }
}

/// Round an address up to the DMA alignment
pub fn align_up(addr: u64) -> u64 {
    (addr + DMA_ALIGN - 1) & !(DMA_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_layout_offsets() {
        let layout = PlaneLayout::new(720 * 480, 720 * 480 / 2);
        assert_eq!(layout.offset(Plane::U), 345_600);
        assert_eq!(layout.offset(Plane::V), 345_600 + 172_800);
        assert_eq!(layout.bytes_used(), 720 * 480 + 2 * (720 * 480 / 2));
        assert_eq!(layout.buffer_size(), layout.bytes_used() + ALIGN_PADDING);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0x1000), 0x1000);
        assert_eq!(align_up(0x1001), 0x1008);
        assert_eq!(align_up(0x1007), 0x1008);
    }
}
