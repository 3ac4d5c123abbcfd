//! Simulated capture block
//!
//! Register file with the engine's two-phase update: configuration writes
//! land in a shadow copy and only reach the active copy on a refresh. Status
//! registers (INT_STAT, the DDR_STAT slot bits, STOP_CTRL, IN_SIZE) are live.
//! The engine side writes frames into [`DmaMemory`] at the latched slot
//! addresses and raises interrupt status like the real block.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use frame_queue::{DmaMemory, Plane, PlaneLayout};
use tock_registers::fields::FieldValue;
use tock_registers::LocalRegisterCopy;
use tracing::{trace, warn};

use crate::map::{self, buf_cfg, ctrl, irq, reset_ctrl, stop_ctrl, update};
use crate::{Bank, PixelFormat, RegisterIo};

const WORDS: usize = map::REG_SPACE / 4;
const WRITE_LOG_DEPTH: usize = 4096;

/// What the engine did with one incoming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Engine not running (run bit not latched)
    Idle,
    /// Frame written to `slot`
    Captured { slot: usize, sequence: u32 },
    /// Every slot of the bank was full; buffer-full raised, frame lost
    Dropped,
}

struct SimState {
    shadow: Vec<u32>,
    active: Vec<u32>,
    int_stat: u32,
    slot_stat: u32,
    in_size: u32,
    stop_wait: bool,
    stopped: bool,
    stop_stall: bool,
    reset: bool,
    staged: usize,
    refreshes: usize,
    next_slot: usize,
    sequence: u32,
    dropped: u64,
    log: VecDeque<(usize, u32)>,
}

impl SimState {
    fn new() -> Self {
        Self {
            shadow: vec![0; WORDS],
            active: vec![0; WORDS],
            int_stat: 0,
            slot_stat: 0,
            in_size: 0,
            stop_wait: false,
            stopped: false,
            stop_stall: false,
            reset: false,
            staged: 0,
            refreshes: 0,
            next_slot: 0,
            sequence: 0,
            dropped: 0,
            log: VecDeque::with_capacity(WRITE_LOG_DEPTH),
        }
    }

    fn reset_block(&mut self) {
        self.shadow.fill(0);
        self.active.fill(0);
        self.int_stat = 0;
        self.slot_stat = 0;
        self.stop_wait = false;
        self.stopped = false;
        self.staged = 0;
        self.next_slot = 0;
    }

    fn active(&self, offset: usize) -> u32 {
        self.active[offset / 4]
    }

    fn stage(&mut self, offset: usize, value: u32) {
        self.shadow[offset / 4] = value;
        self.staged += 1;
    }
}

/// In-process model of the BT1120 capture block
pub struct SimBt1120 {
    state: Mutex<SimState>,
    memory: DmaMemory,
}

impl SimBt1120 {
    /// Create a block whose engine writes into `memory`
    pub fn new(memory: DmaMemory) -> Self {
        Self {
            state: Mutex::new(SimState::new()),
            memory,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn memory(&self) -> &DmaMemory {
        &self.memory
    }

    /// Configuration writes not yet latched by a refresh
    pub fn staged_writes(&self) -> usize {
        self.lock().staged
    }

    /// Number of refreshes issued since creation
    pub fn refresh_count(&self) -> usize {
        self.lock().refreshes
    }

    /// Recent register writes, oldest first
    pub fn write_log(&self) -> Vec<(usize, u32)> {
        self.lock().log.iter().copied().collect()
    }

    pub fn clear_write_log(&self) {
        self.lock().log.clear();
    }

    /// Latched (engine-visible) value of a register
    pub fn active_reg(&self, offset: usize) -> u32 {
        self.lock().active(offset)
    }

    /// Raw slot-full bits
    pub fn slot_status(&self) -> u32 {
        self.lock().slot_stat
    }

    /// Frames lost to buffer-full since creation
    pub fn dropped_frames(&self) -> u64 {
        self.lock().dropped
    }

    /// Make the stop handshake never complete
    pub fn set_stop_stall(&self, stall: bool) {
        self.lock().stop_stall = stall;
    }

    /// Whether the interrupt line is asserted
    pub fn irq_asserted(&self) -> bool {
        let st = self.lock();
        st.int_stat & st.active(map::INT_EN) != 0
    }

    /// Set interrupt status bits directly (FIFO overflow, crop error, ...)
    pub fn raise(&self, bits: FieldValue<u32, irq::Register>) {
        self.lock().int_stat |= bits.value;
    }

    /// Report a new measured input size
    pub fn set_input_size(&self, width: u32, height: u32) {
        let mut st = self.lock();
        let packed = map::pack_size(width, height);
        if st.in_size != packed {
            st.in_size = packed;
            st.int_stat |= map::bits(irq::SIZE_CHANGE);
        }
    }

    /// Deliver one frame from the sensor.
    ///
    /// Luma bytes ramp from `luma` (wrapping) so misplaced data is visible;
    /// both chroma planes are filled with `chroma`.
    pub fn capture_frame(&self, luma: u8, chroma: u8) -> FrameOutcome {
        let mut st = self.lock();
        let control = LocalRegisterCopy::<u32, ctrl::Register>::new(st.active(map::CTRL));
        if !control.is_set(ctrl::RUN) {
            return FrameOutcome::Idle;
        }

        let bank = Bank::for_scale(control.is_set(ctrl::SCALE_EN));
        let disabled = bank
            .chan_disable_field()
            .read(st.active(map::DDR_STAT));
        if disabled == map::ALL_PLANES {
            return FrameOutcome::Idle;
        }

        let count = buf_cfg::COUNT_MINUS_ONE.read(st.active(map::BUF_CFG)) as usize + 1;
        let status = bank.status_field().read(st.slot_stat);
        let start = st.next_slot % count;
        let Some(slot) = (0..count)
            .map(|i| (start + i) % count)
            .find(|&i| status & (1 << i) == 0)
        else {
            st.int_stat |= map::bits(bank.buf_full_irq());
            st.dropped += 1;
            return FrameOutcome::Dropped;
        };

        let (width, height) = match bank {
            Bank::Raw => map::unpack_size(st.active(map::FRAME_SIZE)),
            Bank::Scaled => map::unpack_size(st.active(map::SCALE_DST)),
        };
        let format = if control.matches_all(ctrl::OUT_FMT::Yuv422) {
            PixelFormat::Yuv422p
        } else {
            PixelFormat::Yuv420p
        };
        let layout = PlaneLayout::new(
            width as usize * height as usize,
            format.chroma_size(width, height),
        );

        for plane in Plane::ALL {
            let addr = st.active(bank.addr_reg(slot, plane)) as u64;
            let len = layout.size(plane);
            let written = match plane {
                Plane::Y => {
                    let ramp: Vec<u8> = (0..len).map(|i| luma.wrapping_add(i as u8)).collect();
                    self.memory.write_phys(addr, &ramp)
                }
                Plane::U | Plane::V => self.memory.fill_phys(addr, len, chroma),
            };
            if let Err(e) = written {
                warn!("Engine write to slot {} {:?} failed: {}", slot, plane, e);
                st.dropped += 1;
                return FrameOutcome::Dropped;
            }
        }

        st.slot_stat |= bank.status_field().val(1 << slot).value;
        st.int_stat |= map::bits(irq::FRAME_DONE);
        st.next_slot = (slot + 1) % count;
        st.sequence = st.sequence.wrapping_add(1);
        trace!("Engine filled slot {} ({:?})", slot, bank);
        FrameOutcome::Captured {
            slot,
            sequence: st.sequence,
        }
    }
}

impl RegisterIo for SimBt1120 {
    fn read32(&self, offset: usize) -> u32 {
        if offset % 4 != 0 || offset >= map::REG_SPACE {
            return 0;
        }
        let st = self.lock();
        match offset {
            map::INT_STAT => st.int_stat,
            map::DDR_STAT => st.slot_stat | (st.shadow[offset / 4] & map::DDR_CHAN_MASK),
            map::STOP_CTRL => {
                (stop_ctrl::WAIT.val(st.stop_wait as u32) + stop_ctrl::DONE.val(st.stopped as u32))
                    .value
            }
            map::RESET_CTRL => reset_ctrl::RESET.val(st.reset as u32).value,
            map::IN_SIZE => st.in_size,
            map::UPDATE => 0,
            _ => st.shadow[offset / 4],
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        if offset % 4 != 0 || offset >= map::REG_SPACE {
            warn!("Write outside register window: {:#x}", offset);
            return;
        }
        let mut st = self.lock();
        if st.log.len() == WRITE_LOG_DEPTH {
            st.log.pop_front();
        }
        st.log.push_back((offset, value));

        match offset {
            map::INT_STAT => st.int_stat &= !value,
            map::DDR_STAT => {
                st.slot_stat &= !(value & map::DDR_STATUS_MASK);
                let chan = value & map::DDR_CHAN_MASK;
                if st.shadow[offset / 4] & map::DDR_CHAN_MASK != chan {
                    st.stage(offset, chan);
                }
            }
            map::UPDATE => {
                if update::REFRESH.is_set(value) {
                    st.active = st.shadow.clone();
                    st.staged = 0;
                    st.refreshes += 1;
                }
            }
            map::STOP_CTRL => {
                st.stop_wait = stop_ctrl::WAIT.is_set(value);
                st.stopped = st.stop_wait && !st.stop_stall;
            }
            map::RESET_CTRL => {
                let asserted = reset_ctrl::RESET.is_set(value);
                if asserted && !st.reset {
                    st.reset_block();
                }
                st.reset = asserted;
            }
            map::IN_SIZE => {}
            _ => st.stage(offset, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bt1120Regs;
    use std::sync::Arc;

    fn block() -> Arc<SimBt1120> {
        Arc::new(SimBt1120::new(DmaMemory::new(1 << 16)))
    }

    #[test]
    fn test_writes_are_staged_until_refresh() {
        let sim = block();
        let regs = Bt1120Regs::new(sim.clone());
        regs.set_run(true);
        assert_eq!(sim.staged_writes(), 1);
        assert_eq!(ctrl::RUN.read(sim.active_reg(map::CTRL)), 0);

        regs.refresh();
        assert_eq!(sim.staged_writes(), 0);
        assert_eq!(sim.refresh_count(), 1);
        assert_eq!(ctrl::RUN.read(sim.active_reg(map::CTRL)), 1);
    }

    #[test]
    fn test_int_stat_write_one_to_clear() {
        let sim = block();
        sim.raise(irq::FRAME_DONE::SET + irq::CROP_ERR::SET);
        sim.write32(map::INT_STAT, map::bits(irq::CROP_ERR));
        assert_eq!(sim.read32(map::INT_STAT), map::bits(irq::FRAME_DONE));
    }

    #[test]
    fn test_release_keeps_channel_config() {
        let sim = block();
        let regs = Bt1120Regs::new(sim.clone());
        regs.set_output(PixelFormat::Yuv420p, 8, 8);
        regs.refresh();
        let before = sim.staged_writes();
        regs.release_slot(1);
        assert_eq!(sim.staged_writes(), before);
        assert_eq!(map::ddr::SCALE_CHAN_DISABLE.read(regs.ddr_status()), 0b111);
    }

    #[test]
    fn test_stop_handshake_and_stall() {
        let sim = block();
        let regs = Bt1120Regs::new(sim.clone());
        regs.request_stop();
        assert!(regs.is_stopped());
        regs.clear_stop_request();
        assert!(!regs.is_stopped());

        sim.set_stop_stall(true);
        regs.request_stop();
        assert!(!regs.is_stopped());
    }

    #[test]
    fn test_reset_clears_registers() {
        let sim = block();
        let regs = Bt1120Regs::new(sim.clone());
        regs.set_run(true);
        regs.refresh();
        sim.raise(irq::FRAME_DONE::SET);
        regs.assert_reset();
        regs.deassert_reset();
        assert_eq!(sim.active_reg(map::CTRL), 0);
        assert_eq!(regs.int_status(), 0);
    }

    #[test]
    fn test_idle_engine_ignores_frames() {
        let sim = block();
        assert_eq!(sim.capture_frame(1, 2), FrameOutcome::Idle);
    }

    #[test]
    fn test_size_change_raises_once() {
        let sim = block();
        sim.set_input_size(1280, 720);
        assert!(irq::SIZE_CHANGE.is_set(sim.read32(map::INT_STAT)));
        sim.write32(map::INT_STAT, map::bits(irq::SIZE_CHANGE));
        sim.set_input_size(1280, 720);
        assert_eq!(sim.read32(map::INT_STAT), 0);
        assert_eq!(Bt1120Regs::new(sim).input_size(), (1280, 720));
    }

    #[test]
    fn test_partial_release_leaves_other_slots_full() {
        let sim = block();
        let regs = Bt1120Regs::new(sim.clone());
        let frame = crate::CaptureFrame::new(8, 2, PixelFormat::Yuv420p);
        let mut qm = frame_queue::QueueManager::new(frame.layout());
        for i in 0..2 {
            let region = sim.memory.alloc(frame.layout().buffer_size(), 0).unwrap();
            qm.bind_buffer_to_queue(&frame_queue::VideoBuffer::from_region(i, region))
                .unwrap();
        }
        let slots = qm.materialize_hardware_slots(2).unwrap().to_vec();
        regs.set_output(PixelFormat::Yuv420p, 8, 2);
        regs.set_output_addr(&slots, false).unwrap();
        regs.set_run(true);
        regs.refresh();

        assert!(matches!(sim.capture_frame(1, 2), FrameOutcome::Captured { slot: 0, .. }));
        assert!(matches!(sim.capture_frame(3, 4), FrameOutcome::Captured { slot: 1, .. }));
        assert_eq!(sim.capture_frame(5, 6), FrameOutcome::Dropped);

        regs.release_slots(Bank::Raw, 0b10);
        assert_eq!(sim.slot_status(), 0b01);
        assert!(matches!(sim.capture_frame(7, 8), FrameOutcome::Captured { slot: 1, .. }));
        assert_eq!(sim.capture_frame(9, 10), FrameOutcome::Dropped);
    }
}
