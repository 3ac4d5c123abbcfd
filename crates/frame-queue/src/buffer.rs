//! Framework buffers and hardware slots

use crate::{align_up, BufferId, DmaRegion, PlaneLayout, QueueError};

/// Image plane of a planar YUV frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    Y,
    U,
    V,
}

impl Plane {
    /// Planes in memory order
    pub const ALL: [Plane; 3] = [Plane::Y, Plane::U, Plane::V];

    fn idx(self) -> usize {
        match self {
            Plane::Y => 0,
            Plane::U => 1,
            Plane::V => 2,
        }
    }
}

/// One address per plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneAddrs {
    pub y: u64,
    pub u: u64,
    pub v: u64,
}

impl PlaneAddrs {
    /// Plane starts for a buffer beginning at `base`
    pub fn from_base(base: u64, layout: &PlaneLayout) -> Self {
        Self {
            y: base + layout.offset(Plane::Y) as u64,
            u: base + layout.offset(Plane::U) as u64,
            v: base + layout.offset(Plane::V) as u64,
        }
    }

    pub fn get(&self, plane: Plane) -> u64 {
        match plane {
            Plane::Y => self.y,
            Plane::U => self.u,
            Plane::V => self.v,
        }
    }

    fn map(&self, f: impl Fn(u64) -> u64) -> Self {
        Self {
            y: f(self.y),
            u: f(self.u),
            v: f(self.v),
        }
    }
}

/// Buffer descriptor handed over by the video-buffer framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoBuffer {
    /// Framework index
    pub index: BufferId,
    /// Bus address of the first byte
    pub dma_addr: u64,
    /// CPU address of the first byte
    pub vaddr: u64,
    /// Allocation length
    pub len: usize,
}

impl VideoBuffer {
    /// Describe a DMA allocation as framework buffer `index`
    pub fn from_region(index: BufferId, region: DmaRegion) -> Self {
        Self {
            index,
            dma_addr: region.phys,
            vaddr: region.virt,
            len: region.len,
        }
    }
}

/// Driver view of a framework buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureBuffer {
    pub index: BufferId,
    pub len: usize,
    /// Plane bus addresses derived from the base DMA address
    pub phys: PlaneAddrs,
    /// Plane CPU addresses derived from the base CPU address
    pub virt: PlaneAddrs,
}

impl CaptureBuffer {
    /// Compute plane addresses for `vb` under the current frame layout
    pub fn bind(vb: &VideoBuffer, layout: &PlaneLayout) -> Result<Self, QueueError> {
        let needed = layout.buffer_size();
        if vb.len < needed {
            return Err(QueueError::BufferTooSmall {
                index: vb.index,
                len: vb.len,
                needed,
            });
        }
        Ok(Self {
            index: vb.index,
            len: vb.len,
            phys: PlaneAddrs::from_base(vb.dma_addr, layout),
            virt: PlaneAddrs::from_base(vb.vaddr, layout),
        })
    }
}

/// One entry of the engine's slot table.
///
/// The engine only writes to 8-byte aligned addresses. Aligned planes are laid
/// out from the aligned buffer start, each plane beginning at the next aligned
/// address past the previous one, so the engine's writes never overlap and
/// every aligned plane sits at or above its natural start. Planes whose
/// natural start differs are moved back into place by the deferred consumer,
/// in Y, U, V order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareBufferSlot {
    /// Slot number (0..4), the bit position in the status nibble
    pub index: usize,
    /// Backing framework buffer
    pub buffer: BufferId,
    /// Natural plane CPU addresses
    pub virt: PlaneAddrs,
    /// Aligned plane CPU addresses
    pub aligned_virt: PlaneAddrs,
    /// Aligned plane bus addresses, programmed into the engine
    pub aligned_phys: PlaneAddrs,
    need_align: [bool; 3],
    /// Set by the interrupt path; cleared when the buffer is queued again
    pub full: bool,
}

impl HardwareBufferSlot {
    /// Build slot `index` on top of `buf` for frames of `layout`
    pub fn materialize(index: usize, buf: &CaptureBuffer, layout: &PlaneLayout) -> Self {
        let y = align_up(buf.virt.y);
        let u = y + align_up(layout.y_size as u64);
        let v = u + align_up(layout.uv_size as u64);
        let aligned_virt = PlaneAddrs { y, u, v };
        let aligned_phys = aligned_virt.map(|addr| buf.phys.y + (addr - buf.virt.y));
        let mut need_align = [false; 3];
        for plane in Plane::ALL {
            need_align[plane.idx()] = aligned_virt.get(plane) != buf.virt.get(plane);
        }
        Self {
            index,
            buffer: buf.index,
            virt: buf.virt,
            aligned_virt,
            aligned_phys,
            need_align,
            full: false,
        }
    }

    /// Whether `plane` lands at a shifted address and must be moved back
    pub fn needs_align(&self, plane: Plane) -> bool {
        self.need_align[plane.idx()]
    }

    /// Address the engine writes `plane` to
    pub fn hw_addr(&self, plane: Plane) -> u64 {
        self.aligned_phys.get(plane)
    }
}
