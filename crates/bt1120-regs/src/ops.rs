//! Typed register operations

use frame_queue::{HardwareBufferSlot, Plane, MAX_HW_SLOTS};
use tock_registers::fields::FieldValue;
use tock_registers::{LocalRegisterCopy, RegisterLongName};
use tracing::{debug, trace};

use crate::map::{self, buf_cfg, crop, ctrl, ddr, irq, scale_dec, scale_step, stop_ctrl};
use crate::scale::{self, ScaleParams};
use crate::{Bank, CaptureFrame, CropWindow, InputConfig, PixelFormat, RegError, RegisterIo};
use crate::{BitWidth, SyncMode};

/// Register-level driver for one capture block
pub struct Bt1120Regs<R> {
    io: R,
}

impl<R: RegisterIo> Bt1120Regs<R> {
    pub fn new(io: R) -> Self {
        Self { io }
    }

    /// Underlying register window
    pub fn io(&self) -> &R {
        &self.io
    }

    fn read(&self, offset: usize) -> u32 {
        self.io.read32(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        trace!("W {:#05x} <- {:#010x}", offset, value);
        self.io.write32(offset, value);
    }

    /// Read-modify-write the fields in `value`, leaving the rest alone
    fn modify<L: RegisterLongName>(&self, offset: usize, value: FieldValue<u32, L>) {
        let mut reg = LocalRegisterCopy::<u32, L>::new(self.read(offset));
        reg.modify(value);
        self.write(offset, reg.get());
    }

    /// Write the fields in `value`, zeroing the rest
    fn write_fields<L: RegisterLongName>(&self, offset: usize, value: FieldValue<u32, L>) {
        self.write(offset, value.value);
    }

    /// Update DDR_STAT channel fields. Slot-status bits are written as
    /// zero so no slot is released.
    fn modify_channels(&self, value: FieldValue<u32, ddr::Register>) {
        let chan = self.read(map::DDR_STAT) & map::DDR_CHAN_MASK;
        let mut reg = LocalRegisterCopy::<u32, ddr::Register>::new(chan);
        reg.modify(value);
        self.write(map::DDR_STAT, reg.get());
    }

    /// Program sync mode, sample width, bit swap and the mix source
    pub fn set_input(&self, input: &InputConfig) {
        let mix = 1u32 << (input.mix_index as u32).min(2);
        let sync = match input.sync {
            SyncMode::External => ctrl::SYNC::External,
            SyncMode::Embedded => ctrl::SYNC::Embedded,
        };
        let width = match input.bit_width {
            BitWidth::Bits8 => ctrl::BIT_WIDTH::Bits8,
            BitWidth::Bits16 => ctrl::BIT_WIDTH::Bits16,
        };
        let swap = ctrl::BIT_SWAP.val(input.bit_swap.field_value());
        self.modify(map::CTRL, ctrl::MIX_EN.val(mix) + sync + width + swap);
    }

    /// Select the output format, enable the raw channel, size the frame and
    /// disable FIFO gating
    pub fn set_output(&self, format: PixelFormat, width: u32, height: u32) {
        let out = match format {
            PixelFormat::Yuv422p => ctrl::OUT_FMT::Yuv422,
            PixelFormat::Yuv420p => ctrl::OUT_FMT::Yuv420,
        };
        self.modify(map::CTRL, out);
        self.modify_channels(
            ddr::RAW_CHAN_DISABLE.val(0) + ddr::SCALE_CHAN_DISABLE.val(map::ALL_PLANES),
        );
        self.write(map::FRAME_SIZE, map::pack_size(width, height));
        self.write(map::FIFO_GATE, map::FIFO_NO_GATE);
    }

    /// Program the crop window (when enabled) and the crop-enable bit
    pub fn set_crop(&self, frame: &CaptureFrame) {
        if frame.enable_crop {
            let w = CropWindow::from_rect(&frame.crop);
            debug!(
                "Crop window x {}..={} y {}..={}",
                w.x_begin, w.x_end, w.y_begin, w.y_end
            );
            self.write_fields(map::CROP_X, crop::BEGIN.val(w.x_begin) + crop::END.val(w.x_end));
            self.write_fields(map::CROP_Y, crop::BEGIN.val(w.y_begin) + crop::END.val(w.y_end));
        }
        self.modify(map::CTRL, ctrl::CROP_EN.val(frame.enable_crop as u32));
    }

    /// Program the scaler.
    ///
    /// With scaling off, clears the enable bit and returns `Ok(None)`. An
    /// upscale request is rejected and leaves scaling disabled.
    pub fn set_scale(
        &self,
        frame: &CaptureFrame,
        sensor_width: u32,
        sensor_height: u32,
    ) -> Result<Option<ScaleParams>, RegError> {
        if !frame.enable_scale {
            self.modify(map::CTRL, ctrl::SCALE_EN::CLEAR);
            return Ok(None);
        }

        let src = frame.source_extent(sensor_width, sensor_height);
        let params = match scale::plan(src, (frame.width, frame.height)) {
            Ok(params) => params,
            Err(e) => {
                self.modify(map::CTRL, ctrl::SCALE_EN::CLEAR);
                return Err(e);
            }
        };

        debug!(
            "Scale {:?} -> {:?}: h dec {} step {}, v dec {} step {}",
            params.src,
            params.dst,
            params.horizontal.decimation,
            params.horizontal.step,
            params.vertical.decimation,
            params.vertical.step
        );
        self.write(map::SCALE_SRC, map::pack_size(params.src.0, params.src.1));
        self.write(map::SCALE_DST, map::pack_size(params.dst.0, params.dst.1));
        self.write_fields(
            map::SCALE_DEC,
            scale_dec::DEC_H.val(params.horizontal.decimation)
                + scale_dec::DEC_V.val(params.vertical.decimation),
        );
        self.write_fields(map::SCALE_STEP_H, scale_step::STEP.val(params.horizontal.step));
        self.write_fields(map::SCALE_STEP_V, scale_step::STEP.val(params.vertical.step));
        self.modify(map::CTRL, ctrl::SCALE_EN::SET);
        Ok(Some(params))
    }

    /// Program the slot count, the plane addresses of the active bank and
    /// the channel disables so exactly one bank runs
    pub fn set_output_addr(
        &self,
        slots: &[HardwareBufferSlot],
        scale_enabled: bool,
    ) -> Result<(), RegError> {
        if slots.is_empty() || slots.len() > MAX_HW_SLOTS {
            return Err(RegError::SlotCount(slots.len()));
        }
        let bank = Bank::for_scale(scale_enabled);
        self.modify(map::BUF_CFG, buf_cfg::COUNT_MINUS_ONE.val(slots.len() as u32 - 1));
        for slot in slots {
            for plane in Plane::ALL {
                // Bus addresses are 32-bit on this engine.
                self.write(bank.addr_reg(slot.index, plane), slot.hw_addr(plane) as u32);
            }
        }
        let (scale_off, raw_off) = if scale_enabled {
            (0, map::ALL_PLANES)
        } else {
            (map::ALL_PLANES, 0)
        };
        self.modify_channels(
            ddr::SCALE_CHAN_DISABLE.val(scale_off) + ddr::RAW_CHAN_DISABLE.val(raw_off),
        );
        Ok(())
    }

    /// Load the zoom and scale filter tables
    pub fn load_coefficients(&self) {
        for (i, word) in scale::zoom_coefficients().iter().enumerate() {
            self.write(map::ZOOM_COEF_BASE + i * 4, *word);
        }
        for (i, word) in scale::scale_coefficients().iter().enumerate() {
            self.write(map::SCALE_COEF_BASE + i * 4, *word);
        }
    }

    pub fn set_interrupt_enable(&self) {
        self.write(map::INT_EN, map::INT_ENABLE_MASK);
    }

    pub fn set_interrupt_disable(&self) {
        self.write(map::INT_EN, 0);
    }

    /// Enabled interrupt mask as programmed
    pub fn interrupt_mask(&self) -> u32 {
        self.read(map::INT_EN)
    }

    pub fn set_done_hold(&self, hold: bool) {
        self.modify(map::CTRL, ctrl::DONE_HOLD.val(hold as u32));
    }

    pub fn set_run(&self, run: bool) {
        self.modify(map::CTRL, ctrl::RUN.val(run as u32));
    }

    /// Latch every staged write; takes effect at the next frame boundary
    pub fn refresh(&self) {
        self.write_fields(map::UPDATE, map::update::REFRESH::SET);
    }

    pub fn int_status(&self) -> u32 {
        self.read(map::INT_STAT)
    }

    /// Status bits that are set and enabled
    pub fn pending_interrupts(&self) -> LocalRegisterCopy<u32, irq::Register> {
        LocalRegisterCopy::new(self.int_status() & self.interrupt_mask())
    }

    /// Clear interrupt status bits (write 1 to clear)
    pub fn ack_interrupt(&self, bits: FieldValue<u32, irq::Register>) {
        self.write_fields(map::INT_STAT, bits);
    }

    pub fn ddr_status(&self) -> u32 {
        self.read(map::DDR_STAT)
    }

    /// Slot-full bits of `bank`, shifted down to bit 0
    pub fn slot_status(&self, bank: Bank) -> u32 {
        bank.status_field().read(self.ddr_status())
    }

    /// Write 1 to the slot-status bits in `bits`, keeping the channel
    /// configuration as staged
    fn clear_status(&self, bits: FieldValue<u32, ddr::Register>) {
        self.modify_channels(bits);
    }

    /// Hand slot `index` back to the engine in both banks
    pub fn release_slot(&self, index: usize) {
        let bit = 1 << index;
        self.clear_status(ddr::RAW_FULL.val(bit) + ddr::SCALE_FULL.val(bit));
    }

    /// Free the slots of `bank` whose bit is set in `mask`; frames still in
    /// them are lost
    pub fn release_slots(&self, bank: Bank, mask: u32) {
        let field = bank.status_field();
        self.clear_status(field.val(mask & field.mask));
    }

    /// Force every slot of `bank` free
    pub fn force_release(&self, bank: Bank) {
        self.release_slots(bank, bank.status_field().mask);
    }

    /// Input size measured by the engine
    pub fn input_size(&self) -> (u32, u32) {
        map::unpack_size(self.read(map::IN_SIZE))
    }

    pub fn request_stop(&self) {
        self.write_fields(map::STOP_CTRL, stop_ctrl::WAIT::SET);
    }

    pub fn clear_stop_request(&self) {
        self.write(map::STOP_CTRL, 0);
    }

    pub fn is_stopped(&self) -> bool {
        stop_ctrl::DONE.is_set(self.read(map::STOP_CTRL))
    }

    pub fn assert_reset(&self) {
        self.write_fields(map::RESET_CTRL, map::reset_ctrl::RESET::SET);
    }

    pub fn deassert_reset(&self) {
        self.write(map::RESET_CTRL, 0);
    }
}
