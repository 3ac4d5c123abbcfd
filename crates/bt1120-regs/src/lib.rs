//! BT1120 Capture Engine Registers
//!
//! Register-level protocol of the BT1120 video capture block:
//! - Bit-exact register map declared with `tock-registers` bitfields
//! - Typed operations (input/output format, crop, scale, buffer addresses,
//!   interrupt mask, refresh)
//! - Two-stage scale step calculation and filter coefficient tables
//! - An MMIO backend and an in-process simulated register block
//!
//! Writes to configuration registers are staged; nothing reaches the engine
//! until [`Bt1120Regs::refresh`] is issued.

pub mod format;
pub mod io;
pub mod map;
mod ops;
pub mod scale;
pub mod sim;
pub mod window;

pub use format::{BitSwap, BitWidth, CaptureFrame, CropRect, InputConfig, PixelFormat, SyncMode};
pub use io::{MmioRegisterBlock, RegisterIo};
pub use map::Bank;
pub use ops::Bt1120Regs;
pub use scale::{AxisStep, ScaleParams};
pub use sim::{FrameOutcome, SimBt1120};
pub use window::CropWindow;

use thiserror::Error;

/// Register-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegError {
    #[error("Scale rejected: destination {dst:?} exceeds source {src:?}")]
    ScaleRejected { src: (u32, u32), dst: (u32, u32) },

    #[error("Zero-sized extent")]
    ZeroExtent,

    #[error("Scale {src:?} -> {dst:?} needs decimation {decimation}, engine limit is {max}")]
    DecimationOverflow {
        src: (u32, u32),
        dst: (u32, u32),
        decimation: u32,
        max: u32,
    },

    #[error("Slot count {0} outside 1..=4")]
    SlotCount(usize),
}
