//! Register access backends

use core::ptr::NonNull;
use core::slice;
use std::sync::Arc;

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tracing::error;

/// 32-bit register window
///
/// Implementations must tolerate concurrent callers: the interrupt handler
/// and process context both touch the block, as on real hardware.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

impl<T: RegisterIo + ?Sized> RegisterIo for Arc<T> {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

/// Memory-mapped register window
pub struct MmioRegisterBlock {
    base: NonNull<ReadWrite<u32>>,
    words: usize,
}

// SAFETY: the block only performs volatile word accesses, which the device
// accepts from any CPU.
unsafe impl Send for MmioRegisterBlock {}
unsafe impl Sync for MmioRegisterBlock {}

impl MmioRegisterBlock {
    /// Wrap a mapped window of `len` bytes.
    ///
    /// # Safety
    ///
    /// `base` must point to `len` bytes of mapped device (or otherwise
    /// exclusively owned) memory that stays valid for the life of the block.
    pub unsafe fn new(base: *mut u32, len: usize) -> Option<Self> {
        NonNull::new(base.cast::<ReadWrite<u32>>()).map(|base| Self {
            base,
            words: len / 4,
        })
    }

    fn registers(&self) -> &[ReadWrite<u32>] {
        // SAFETY: `new` guarantees `words` registers behind `base`.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.words) }
    }

    fn register(&self, offset: usize) -> Option<&ReadWrite<u32>> {
        let reg = if offset % 4 == 0 {
            self.registers().get(offset / 4)
        } else {
            None
        };
        if reg.is_none() {
            error!("Register access outside window: {:#x}", offset);
        }
        reg
    }
}

impl RegisterIo for MmioRegisterBlock {
    fn read32(&self, offset: usize) -> u32 {
        self.register(offset).map_or(0, |reg| reg.get())
    }

    fn write32(&self, offset: usize, value: u32) {
        if let Some(reg) = self.register(offset) {
            reg.set(value);
        }
    }
}
