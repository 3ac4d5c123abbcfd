//! Register map
//!
//! Offsets are relative to the capture block base. Bit positions inside
//! CTRL, INT_EN/INT_STAT and DDR_STAT are the engine's wire contract.

use tock_registers::fields::Field;
use tock_registers::{register_bitfields, LocalRegisterCopy, RegisterLongName};

/// Control: run, mix, input, output format, scale/crop enable
pub const CTRL: usize = 0x000;
/// Interrupt enable
pub const INT_EN: usize = 0x004;
/// Interrupt status, write 1 to clear
pub const INT_STAT: usize = 0x008;
/// Output frame size
pub const FRAME_SIZE: usize = 0x00C;
/// Slot-full status (write 1 to clear) and per-bank channel disables
pub const DDR_STAT: usize = 0x010;
/// Number of slots in use, zero based
pub const BUF_CFG: usize = 0x014;
/// FIFO watermark gating
pub const FIFO_GATE: usize = 0x018;
/// Crop window, horizontal
pub const CROP_X: usize = 0x01C;
/// Crop window, vertical
pub const CROP_Y: usize = 0x020;
/// Scaler source size
pub const SCALE_SRC: usize = 0x024;
/// Scaler destination size
pub const SCALE_DST: usize = 0x028;
/// Scaler decimation steps
pub const SCALE_DEC: usize = 0x02C;
/// Scaler fractional step, horizontal
pub const SCALE_STEP_H: usize = 0x030;
/// Scaler fractional step, vertical
pub const SCALE_STEP_V: usize = 0x034;
/// Register latch
pub const UPDATE: usize = 0x038;
/// Stop request/acknowledge handshake
pub const STOP_CTRL: usize = 0x03C;
/// Block reset
pub const RESET_CTRL: usize = 0x040;
/// Detected input size (read only)
pub const IN_SIZE: usize = 0x044;
/// Raw bank: 4 slots x (Y, U, V, reserved)
pub const RAW_ADDR_BASE: usize = 0x100;
/// Scaled bank: 4 slots x (Y, U, V, reserved)
pub const SCALE_ADDR_BASE: usize = 0x140;
/// Zoom (interpolation) coefficients
pub const ZOOM_COEF_BASE: usize = 0x200;
/// Scale (decimation) coefficients
pub const SCALE_COEF_BASE: usize = 0x300;
/// Size of the register window
pub const REG_SPACE: usize = 0x400;

const SLOT_STRIDE: usize = 0x10;

register_bitfields! {u32,
    /// CTRL
    pub ctrl [
        RUN OFFSET(0) NUMBITS(1) [],
        /// One enable bit per mix source
        MIX_EN OFFSET(4) NUMBITS(3) [],
        SYNC OFFSET(8) NUMBITS(1) [
            Embedded = 0,
            External = 1
        ],
        BIT_WIDTH OFFSET(9) NUMBITS(1) [
            Bits8 = 0,
            Bits16 = 1
        ],
        BIT_SWAP OFFSET(12) NUMBITS(4) [],
        OUT_FMT OFFSET(16) NUMBITS(1) [
            Yuv420 = 0,
            Yuv422 = 1
        ],
        SCALE_EN OFFSET(24) NUMBITS(1) [],
        CROP_EN OFFSET(28) NUMBITS(1) [],
        DONE_HOLD OFFSET(29) NUMBITS(1) []
    ],

    /// INT_EN / INT_STAT
    pub irq [
        FRAME_DONE OFFSET(0) NUMBITS(1) [],
        FIELD_ERR OFFSET(1) NUMBITS(1) [],
        SIZE_CHANGE OFFSET(4) NUMBITS(1) [],
        CROP_ERR OFFSET(5) NUMBITS(1) [],
        FIFO_SCALE_V OFFSET(8) NUMBITS(1) [],
        FIFO_SCALE_U OFFSET(12) NUMBITS(1) [],
        FIFO_SCALE_Y OFFSET(16) NUMBITS(1) [],
        FIFO_RAW_V OFFSET(20) NUMBITS(1) [],
        FIFO_RAW_U OFFSET(24) NUMBITS(1) [],
        FIFO_RAW_Y OFFSET(28) NUMBITS(1) [],
        SCALE_BUF_FULL OFFSET(30) NUMBITS(1) [],
        RAW_BUF_FULL OFFSET(31) NUMBITS(1) []
    ],

    /// DDR_STAT
    pub ddr [
        RAW_FULL OFFSET(0) NUMBITS(4) [],
        SCALE_FULL OFFSET(8) NUMBITS(4) [],
        SCALE_CHAN_DISABLE OFFSET(24) NUMBITS(3) [],
        RAW_CHAN_DISABLE OFFSET(27) NUMBITS(3) []
    ],

    /// BUF_CFG
    pub buf_cfg [
        COUNT_MINUS_ONE OFFSET(0) NUMBITS(2) []
    ],

    /// FRAME_SIZE, SCALE_SRC, SCALE_DST and IN_SIZE
    pub size [
        WIDTH OFFSET(0) NUMBITS(16) [],
        HEIGHT OFFSET(16) NUMBITS(16) []
    ],

    /// CROP_X / CROP_Y
    pub crop [
        BEGIN OFFSET(0) NUMBITS(16) [],
        END OFFSET(16) NUMBITS(16) []
    ],

    /// SCALE_DEC
    pub scale_dec [
        DEC_H OFFSET(0) NUMBITS(4) [],
        DEC_V OFFSET(8) NUMBITS(4) []
    ],

    /// SCALE_STEP_H / SCALE_STEP_V
    pub scale_step [
        STEP OFFSET(0) NUMBITS(20) []
    ],

    /// FIFO_GATE
    pub fifo_gate [
        Y_WATERMARK OFFSET(0) NUMBITS(8) [],
        UV_WATERMARK OFFSET(8) NUMBITS(8) [],
        GATE_EN OFFSET(31) NUMBITS(1) []
    ],

    /// UPDATE
    pub update [
        REFRESH OFFSET(0) NUMBITS(1) []
    ],

    /// STOP_CTRL
    pub stop_ctrl [
        WAIT OFFSET(0) NUMBITS(1) [],
        DONE OFFSET(4) NUMBITS(1) []
    ],

    /// RESET_CTRL
    pub reset_ctrl [
        RESET OFFSET(0) NUMBITS(1) []
    ]
}

/// In-place bits of `field`
pub const fn bits<L: RegisterLongName>(field: Field<u32, L>) -> u32 {
    field.mask << field.shift
}

/// Everything except FIELD_ERR, which fires constantly on some sources
pub const INT_ENABLE_MASK: u32 = bits(irq::FRAME_DONE)
    | bits(irq::SIZE_CHANGE)
    | bits(irq::CROP_ERR)
    | bits(irq::FIFO_SCALE_V)
    | bits(irq::FIFO_SCALE_U)
    | bits(irq::FIFO_SCALE_Y)
    | bits(irq::FIFO_RAW_V)
    | bits(irq::FIFO_RAW_U)
    | bits(irq::FIFO_RAW_Y)
    | bits(irq::SCALE_BUF_FULL)
    | bits(irq::RAW_BUF_FULL);

/// FIFO overflow bits with their names, scaled path first
pub const FIFO_OVERFLOW: [(Field<u32, irq::Register>, &str); 6] = [
    (irq::FIFO_SCALE_U, "scaled U"),
    (irq::FIFO_SCALE_V, "scaled V"),
    (irq::FIFO_SCALE_Y, "scaled Y"),
    (irq::FIFO_RAW_U, "raw U"),
    (irq::FIFO_RAW_V, "raw V"),
    (irq::FIFO_RAW_Y, "raw Y"),
];

/// DDR_STAT bits that are write-1-to-clear status
pub const DDR_STATUS_MASK: u32 = bits(ddr::RAW_FULL) | bits(ddr::SCALE_FULL);
/// DDR_STAT bits that are plain configuration
pub const DDR_CHAN_MASK: u32 = bits(ddr::SCALE_CHAN_DISABLE) | bits(ddr::RAW_CHAN_DISABLE);
/// All three planes of a bank disabled
pub const ALL_PLANES: u32 = 0b111;

/// Watermarks at zero with gating off
pub const FIFO_NO_GATE: u32 = 0;

/// Largest decimation count the scaler accepts
pub const MAX_DECIMATION: u32 = scale_dec::DEC_H.mask;

/// Pack a width/height pair into a size register
pub fn pack_size(width: u32, height: u32) -> u32 {
    (size::WIDTH.val(width) + size::HEIGHT.val(height)).value
}

/// Split a size register into width and height
pub fn unpack_size(reg: u32) -> (u32, u32) {
    let reg = LocalRegisterCopy::<u32, size::Register>::new(reg);
    (reg.read(size::WIDTH), reg.read(size::HEIGHT))
}

/// DMA address bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    /// Unscaled output
    Raw,
    /// Scaler output
    Scaled,
}

impl Bank {
    pub fn for_scale(scale_enabled: bool) -> Self {
        if scale_enabled {
            Bank::Scaled
        } else {
            Bank::Raw
        }
    }

    /// Slot-full nibble inside DDR_STAT
    pub fn status_field(self) -> Field<u32, ddr::Register> {
        match self {
            Bank::Raw => ddr::RAW_FULL,
            Bank::Scaled => ddr::SCALE_FULL,
        }
    }

    /// Buffer-full interrupt bit
    pub fn buf_full_irq(self) -> Field<u32, irq::Register> {
        match self {
            Bank::Raw => irq::RAW_BUF_FULL,
            Bank::Scaled => irq::SCALE_BUF_FULL,
        }
    }

    pub fn chan_disable_field(self) -> Field<u32, ddr::Register> {
        match self {
            Bank::Raw => ddr::RAW_CHAN_DISABLE,
            Bank::Scaled => ddr::SCALE_CHAN_DISABLE,
        }
    }

    /// Register offset of a plane address for `slot`
    pub fn addr_reg(self, slot: usize, plane: frame_queue::Plane) -> usize {
        let base = match self {
            Bank::Raw => RAW_ADDR_BASE,
            Bank::Scaled => SCALE_ADDR_BASE,
        };
        let plane_off = match plane {
            frame_queue::Plane::Y => 0x0,
            frame_queue::Plane::U => 0x4,
            frame_queue::Plane::V => 0x8,
        };
        base + slot * SLOT_STRIDE + plane_off
    }
}
