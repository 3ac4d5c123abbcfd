//! Coherent DMA memory model
//!
//! One contiguous region seen at two addresses: the bus (physical) address
//! the capture engine writes to, and the CPU (virtual) address the driver
//! copies through. Clones share the same backing store.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{QueueError, DMA_ALIGN};

/// Default bus address of the simulated DDR window
pub const DEFAULT_PHYS_BASE: u64 = 0x8000_0000;

/// Default CPU address of the simulated DDR window
pub const DEFAULT_VIRT_BASE: u64 = 0x1000_0000;

struct DmaInner {
    bytes: Vec<u8>,
    next: usize,
}

/// Shared DMA memory with a bump allocator
#[derive(Clone)]
pub struct DmaMemory {
    inner: Arc<Mutex<DmaInner>>,
    phys_base: u64,
    virt_base: u64,
    size: usize,
}

/// One allocation inside [`DmaMemory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    pub phys: u64,
    pub virt: u64,
    pub len: usize,
}

impl DmaMemory {
    /// Create a zeroed region at the default bus/CPU windows
    pub fn new(size: usize) -> Self {
        Self::with_bases(size, DEFAULT_PHYS_BASE, DEFAULT_VIRT_BASE)
    }

    /// Create a zeroed region at explicit bus/CPU bases
    pub fn with_bases(size: usize, phys_base: u64, virt_base: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DmaInner {
                bytes: vec![0; size],
                next: 0,
            })),
            phys_base,
            virt_base,
            size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DmaInner> {
        // A panic while holding the lock leaves plain bytes behind, still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Total size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocate `len` bytes starting `skew` bytes past an aligned boundary.
    ///
    /// A non-zero skew produces the unaligned buffers some allocators hand
    /// out, which the engine cannot target directly.
    pub fn alloc(&self, len: usize, skew: usize) -> Result<DmaRegion, QueueError> {
        let mut inner = self.lock();
        let align = DMA_ALIGN as usize;
        let start = (inner.next + align - 1) / align * align + skew;
        let available = self.size.saturating_sub(start);
        if len > available {
            return Err(QueueError::DmaExhausted {
                requested: len,
                available,
            });
        }
        inner.next = start + len;
        Ok(DmaRegion {
            phys: self.phys_base + start as u64,
            virt: self.virt_base + start as u64,
            len,
        })
    }

    /// Translate a CPU address to a bus address
    pub fn virt_to_phys(&self, virt: u64) -> u64 {
        virt - self.virt_base + self.phys_base
    }

    fn range(&self, base: u64, addr: u64, len: usize) -> Result<std::ops::Range<usize>, QueueError> {
        let err = QueueError::DmaOutOfRange { addr, len };
        let start = addr.checked_sub(base).ok_or(err.clone())? as usize;
        let end = start.checked_add(len).ok_or(err.clone())?;
        if end > self.size {
            return Err(err);
        }
        Ok(start..end)
    }

    /// Fill bytes at a bus address (engine side)
    pub fn fill_phys(&self, phys: u64, len: usize, value: u8) -> Result<(), QueueError> {
        let range = self.range(self.phys_base, phys, len)?;
        self.lock().bytes[range].fill(value);
        Ok(())
    }

    /// Write bytes at a bus address (engine side)
    pub fn write_phys(&self, phys: u64, data: &[u8]) -> Result<(), QueueError> {
        let range = self.range(self.phys_base, phys, data.len())?;
        self.lock().bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Read bytes at a CPU address
    pub fn read_virt(&self, virt: u64, len: usize) -> Result<Vec<u8>, QueueError> {
        let range = self.range(self.virt_base, virt, len)?;
        Ok(self.lock().bytes[range].to_vec())
    }

    /// Write bytes at a CPU address
    pub fn write_virt(&self, virt: u64, data: &[u8]) -> Result<(), QueueError> {
        let range = self.range(self.virt_base, virt, data.len())?;
        self.lock().bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Move `len` bytes between CPU addresses; the ranges may overlap
    pub fn move_virt(&self, src: u64, dst: u64, len: usize) -> Result<(), QueueError> {
        let from = self.range(self.virt_base, src, len)?;
        let to = self.range(self.virt_base, dst, len)?;
        self.lock().bytes.copy_within(from, to.start);
        Ok(())
    }
}

impl std::fmt::Debug for DmaMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaMemory")
            .field("phys_base", &format_args!("{:#x}", self.phys_base))
            .field("virt_base", &format_args!("{:#x}", self.virt_base))
            .field("size", &self.size)
            .finish()
    }
}
