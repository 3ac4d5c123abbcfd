//! Interrupt path and deferred buffer completion
//!
//! The handler runs in interrupt context: it decodes status, moves filled
//! slots to the busy queue and wakes the deferred worker. Plane moves and
//! buffer completion happen in the worker.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bt1120_regs::map::{self, irq};
use bt1120_regs::{Bank, RegisterIo};
use frame_queue::{BufferId, Drain, Plane};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::device::CaptureDevice;
use crate::platform::{IrqHandler, IrqReturn};
use crate::sink::{BufferState, CompletedBuffer};

/// Result of one deferred-consumer pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// No completed slot waiting
    Empty,
    /// Busy entry was stale; its buffer went back to idle
    Race,
    /// Buffer handed to the framework
    Delivered { index: BufferId },
}

impl<R: RegisterIo + 'static> CaptureDevice<R> {
    /// Top half. Returns [`IrqReturn::None`] when no enabled status bit is
    /// set, so the shared line can try the next handler.
    pub fn handle_interrupt(&self) -> IrqReturn {
        let status = self.regs.pending_interrupts();
        if status.get() == 0 {
            self.stats.spurious();
            return IrqReturn::None;
        }
        self.stats.interrupt();
        trace!("IRQ status {:#010x}", status.get());

        if status.is_set(irq::FRAME_DONE) {
            let completed = self.collect_filled_slots();
            self.regs.ack_interrupt(irq::FRAME_DONE::SET);
            if completed > 0 {
                self.work.notify_one();
            }
        }

        if status.is_set(irq::SIZE_CHANGE) {
            let (width, height) = self.regs.input_size();
            warn!("Input size changed to {}x{}", width, height);
            self.regs.ack_interrupt(irq::SIZE_CHANGE::SET);
        }

        if status.is_set(irq::CROP_ERR) {
            warn!("Crop window outside input frame");
            self.regs.ack_interrupt(irq::CROP_ERR::SET);
        }

        for (field, name) in map::FIFO_OVERFLOW {
            if status.is_set(field) {
                warn!("{} FIFO overflow", name);
                self.stats.fifo_overflow();
                self.regs.ack_interrupt(field.val(1));
            }
        }

        for bank in [Bank::Scaled, Bank::Raw] {
            let full = bank.buf_full_irq();
            if status.is_set(full) {
                self.relieve_bank(bank);
                self.regs.ack_interrupt(full.val(1));
            }
        }

        IrqReturn::Handled
    }

    /// Buffer-full backpressure. Frames waiting in the busy queue are
    /// discarded and their slots handed back to the engine; the slot being
    /// copied out and those the framework holds stay full.
    fn relieve_bank(&self, bank: Bank) {
        let mut st = self.stream();
        let discarded = st.queues.discard_busy();
        let pinned = st.queues.pinned_slots();
        self.regs.release_slots(bank, !pinned);
        st.sequence = st.sequence.wrapping_add(1);
        drop(st);
        self.stats.bank_overflow();
        error!(
            "{:?} bank full, dropped {} waiting frames (pinned {:#06b})",
            bank,
            discarded.len(),
            pinned
        );
    }

    /// Move every slot the engine reports full onto the busy queue
    fn collect_filled_slots(&self) -> usize {
        let mut st = self.stream();
        if !st.streaming {
            return 0;
        }
        let ready = self.regs.slot_status(Bank::for_scale(st.scale_enabled));
        let mut completed = 0;
        for index in 0..st.slot_count {
            if ready & (1 << index) != 0 && st.queues.complete_slot(index) {
                let sequence = st.sequence;
                st.slot_sequence[index] = sequence;
                st.sequence = sequence.wrapping_add(1);
                completed += 1;
                trace!("Slot {} filled (seq {})", index, sequence);
            }
        }
        completed
    }

    /// Bottom half: deliver the oldest completed slot.
    ///
    /// Planes the engine wrote at a shifted address are moved back into
    /// place first, then the buffer is completed. The slot stays full, with
    /// its status bit set, until the framework queues the buffer again.
    pub fn update_video_buf(&self) -> ConsumeOutcome {
        let (ticket, layout, sequence) = {
            let mut st = self.stream();
            match st.queues.begin_drain() {
                Drain::Empty => return ConsumeOutcome::Empty,
                Drain::Race { slot } => {
                    warn!("Busy slot {} not marked full, skipped", slot);
                    self.stats.queue_race();
                    return ConsumeOutcome::Race;
                }
                Drain::Ready(ticket) => {
                    let sequence = st.slot_sequence[ticket.slot.index];
                    (ticket, st.queues.layout(), sequence)
                }
            }
        };

        let slot = &ticket.slot;
        // Aligned copies never sit below their natural start, so moving in
        // Y, U, V order never overwrites a plane still to be moved.
        for plane in Plane::ALL {
            if !slot.needs_align(plane) {
                continue;
            }
            let moved = self.memory.move_virt(
                slot.aligned_virt.get(plane),
                slot.virt.get(plane),
                layout.size(plane),
            );
            if let Err(e) = moved {
                warn!("Slot {} {:?} realign failed: {}", slot.index, plane, e);
            }
        }

        let index = self.stream().queues.finish_drain(&ticket);
        self.sink.buffer_done(CompletedBuffer {
            index,
            state: BufferState::Done,
            bytes_used: layout.bytes_used(),
            sequence,
        });
        self.stats.frame_done();
        trace!("Buffer {} done (slot {}, seq {})", index, slot.index, sequence);
        ConsumeOutcome::Delivered { index }
    }

    /// Run the consumer until no completed slot is left. Wakeups coalesce,
    /// so one pass has to cover every slot completed since the last one.
    pub fn drain_completed(&self) -> usize {
        self.stats.deferred_run();
        let mut delivered = 0;
        loop {
            match self.update_video_buf() {
                ConsumeOutcome::Empty => break,
                ConsumeOutcome::Race => {}
                ConsumeOutcome::Delivered { .. } => delivered += 1,
            }
        }
        delivered
    }

    /// Start the deferred worker on the current tokio runtime
    pub fn spawn_deferred_worker(self: &Arc<Self>) -> JoinHandle<()> {
        self.worker_stop.store(false, Ordering::Release);
        let dev = Arc::clone(self);
        tokio::spawn(async move {
            debug!("Deferred worker started");
            loop {
                dev.work.notified().await;
                if dev.worker_stop.load(Ordering::Acquire) {
                    break;
                }
                dev.drain_completed();
            }
            info!("Deferred worker stopped");
        })
    }

    pub fn stop_deferred_worker(&self) {
        self.worker_stop.store(true, Ordering::Release);
        self.work.notify_one();
    }
}

impl<R: RegisterIo + 'static> IrqHandler for CaptureDevice<R> {
    fn handle_irq(&self) -> IrqReturn {
        self.handle_interrupt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{vga, Rig};
    use crate::CaptureState;
    use crate::sensor::SensorFormat;
    use bt1120_regs::FrameOutcome;
    use proptest::prelude::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_end_to_end_single_frame() {
        let mut rig = Rig::ready(vga(), 720, 480, 3, 0).await;
        assert_eq!(rig.dev.idle_buffers(), vec![0, 1, 2]);
        rig.dev.start_streaming().await.unwrap();
        assert_eq!(rig.dev.state().await, CaptureState::Run);

        assert!(matches!(
            rig.sim.capture_frame(0x10, 0x80),
            FrameOutcome::Captured { slot: 0, .. }
        ));
        assert_eq!(rig.line.dispatch(), IrqReturn::Handled);
        assert_eq!(rig.dev.busy_slots(), vec![0]);
        assert_eq!(rig.dev.idle_buffers(), vec![1, 2]);
        assert!(rig.dev.slot(0).unwrap().full);
        rig.dev.check_queues().unwrap();

        assert_eq!(rig.dev.update_video_buf(), ConsumeOutcome::Delivered { index: 0 });
        let done = rig.rx.try_recv().unwrap();
        assert_eq!(done.index, 0);
        assert_eq!(done.state, BufferState::Done);
        assert_eq!(done.bytes_used, 720 * 480 + 2 * (720 * 480 / 2));
        assert_eq!(done.sequence, 0);

        // With the framework: slot still full, engine still kept off it
        assert_eq!(rig.dev.idle_buffers(), vec![1, 2]);
        assert!(rig.dev.busy_slots().is_empty());
        assert!(rig.dev.slot(0).unwrap().full);
        assert_eq!(rig.dev.delivered_buffers(), vec![0]);
        assert_eq!(rig.sim.slot_status(), 0b001);
        rig.dev.check_queues().unwrap();
        assert_eq!(rig.dev.stats().frames_done, 1);

        rig.requeue(0);
        assert_eq!(rig.dev.idle_buffers(), vec![1, 2, 0]);
        assert!(!rig.dev.slot(0).unwrap().full);
        assert!(rig.dev.delivered_buffers().is_empty());
        assert_eq!(rig.sim.slot_status(), 0);
        rig.dev.check_queues().unwrap();
    }

    #[tokio::test]
    async fn test_one_completion_per_queue_cycle() {
        let mut rig = Rig::ready(vga(), 720, 480, 2, 0).await;
        rig.dev.start_streaming().await.unwrap();

        rig.sim.capture_frame(0x10, 0x80);
        rig.line.dispatch();
        assert_eq!(rig.dev.drain_completed(), 1);

        // Buffer 0 is with the framework: the engine must not write it
        let mut outcomes = Vec::new();
        for i in 0..4u8 {
            outcomes.push(rig.sim.capture_frame(i, 0x80));
            rig.line.dispatch();
            rig.dev.check_queues().unwrap();
        }
        assert!(outcomes
            .iter()
            .all(|o| !matches!(o, FrameOutcome::Captured { slot: 0, .. })));
        let luma = rig.mem.read_virt(rig.bufs[0].vaddr, 16).unwrap();
        assert_eq!(luma, (0x10u8..0x20).collect::<Vec<_>>());

        rig.dev.stop_streaming().await.unwrap();
        let completions = rig.drain_rx();
        for index in 0..2 {
            let count = completions.iter().filter(|b| b.index == index).count();
            assert_eq!(count, 1, "buffer {} completed {} times", index, count);
        }
        assert_eq!(completions[0].index, 0);
        assert_eq!(completions[0].state, BufferState::Done);
        assert_eq!(completions[1].index, 1);
        assert_eq!(completions[1].state, BufferState::Error);

        // Queued again after stop, buffer 0 streams like any other
        rig.requeue(0);
        rig.requeue(1);
        rig.dev.start_streaming().await.unwrap();
        assert_eq!(rig.dev.idle_buffers(), vec![0, 1]);
        rig.dev.check_queues().unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_before_requeue_does_not_redeliver() {
        let mut rig = Rig::ready(vga(), 720, 480, 3, 0).await;
        rig.dev.start_streaming().await.unwrap();

        rig.sim.capture_frame(0x01, 0x80);
        rig.line.dispatch();
        assert_eq!(rig.dev.update_video_buf(), ConsumeOutcome::Delivered { index: 0 });
        assert_eq!(rig.rx.try_recv().unwrap().index, 0);

        // Slot 0's status bit is still set while the next frame completes
        assert!(matches!(
            rig.sim.capture_frame(0x02, 0x80),
            FrameOutcome::Captured { slot: 1, .. }
        ));
        rig.sim.raise(irq::FRAME_DONE::SET);
        assert_eq!(rig.line.dispatch(), IrqReturn::Handled);
        assert_eq!(rig.dev.busy_slots(), vec![1]);
        rig.dev.check_queues().unwrap();

        assert_eq!(rig.dev.drain_completed(), 1);
        let delivered = rig.drain_rx();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].index, 1);
        assert_eq!(delivered[0].sequence, 1);

        // Queueing buffer 0 frees its slot in one step
        rig.requeue(0);
        assert_eq!(rig.sim.slot_status() & 0b001, 0);
        assert!(!rig.dev.slot(0).unwrap().full);
        rig.dev.check_queues().unwrap();
        assert!(matches!(
            rig.sim.capture_frame(0x03, 0x80),
            FrameOutcome::Captured { slot: 2, .. }
        ));
        assert!(matches!(
            rig.sim.capture_frame(0x04, 0x80),
            FrameOutcome::Captured { slot: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_odd_plane_sizes_realign_without_overlap() {
        let modes = vec![SensorFormat::new(642, 481)];
        let mut rig = Rig::ready(modes, 642, 481, 2, 3).await;
        rig.dev.start_streaming().await.unwrap();
        let slot = rig.dev.slot(0).unwrap();
        for plane in Plane::ALL {
            assert!(slot.needs_align(plane));
        }

        rig.sim.capture_frame(0x30, 0x66);
        rig.line.dispatch();
        assert_eq!(rig.dev.update_video_buf(), ConsumeOutcome::Delivered { index: 0 });
        rig.rx.try_recv().unwrap();

        let y_size = 642 * 481;
        let uv_size = y_size / 2;
        let luma = rig.mem.read_virt(slot.virt.y, y_size).unwrap();
        assert!(luma
            .iter()
            .enumerate()
            .all(|(i, &b)| b == 0x30u8.wrapping_add(i as u8)));
        let chroma = rig.mem.read_virt(slot.virt.u, 2 * uv_size).unwrap();
        assert!(chroma.iter().all(|&b| b == 0x66));
    }

    #[tokio::test]
    async fn test_unaligned_buffer_is_realigned() {
        let mut rig = Rig::ready(vga(), 720, 480, 2, 3).await;
        rig.dev.start_streaming().await.unwrap();
        let slot = rig.dev.slot(0).unwrap();
        assert!(slot.needs_align(Plane::Y));
        assert_ne!(slot.aligned_virt.y, slot.virt.y);
        assert_eq!(slot.aligned_virt.y % frame_queue::DMA_ALIGN, 0);

        rig.sim.capture_frame(0x20, 0x55);
        rig.line.dispatch();
        assert!(matches!(rig.dev.update_video_buf(), ConsumeOutcome::Delivered { index: 0 }));
        rig.rx.try_recv().unwrap();

        let luma = rig.mem.read_virt(slot.virt.y, 720 * 480).unwrap();
        assert!(luma
            .iter()
            .enumerate()
            .all(|(i, &b)| b == 0x20u8.wrapping_add(i as u8)));
        let u = rig.mem.read_virt(slot.virt.u, 720 * 480 / 2).unwrap();
        assert!(u.iter().all(|&b| b == 0x55));
        let v = rig.mem.read_virt(slot.virt.v, 720 * 480 / 2).unwrap();
        assert!(v.iter().all(|&b| b == 0x55));
    }

    #[tokio::test]
    async fn test_aligned_buffer_needs_no_move() {
        let mut rig = Rig::ready(vga(), 720, 480, 2, 0).await;
        rig.dev.start_streaming().await.unwrap();
        let slot = rig.dev.slot(0).unwrap();
        for plane in Plane::ALL {
            assert!(!slot.needs_align(plane));
            assert_eq!(slot.aligned_virt.get(plane), slot.virt.get(plane));
        }

        rig.sim.capture_frame(0x01, 0x7f);
        rig.line.dispatch();
        rig.dev.update_video_buf();
        rig.rx.try_recv().unwrap();
        let luma = rig.mem.read_virt(slot.virt.y, 16).unwrap();
        assert_eq!(luma, (0x01u8..0x11).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stalled_consumer_loss_is_bounded() {
        let mut rig = Rig::ready(vga(), 720, 480, 3, 0).await;
        rig.dev.start_streaming().await.unwrap();

        let mut outcomes = Vec::new();
        for i in 0..12u8 {
            outcomes.push(rig.sim.capture_frame(i, 0x80));
            rig.line.dispatch();
            rig.dev.check_queues().unwrap();
        }

        let dropped = outcomes
            .iter()
            .filter(|o| **o == FrameOutcome::Dropped)
            .count();
        assert_eq!(dropped, 3);
        assert!(outcomes
            .windows(2)
            .all(|w| !(w[0] == FrameOutcome::Dropped && w[1] == FrameOutcome::Dropped)));
        let mut since_drop = 0;
        for o in &outcomes {
            match o {
                FrameOutcome::Dropped => since_drop = 0,
                _ => {
                    since_drop += 1;
                    assert!(since_drop <= 3);
                }
            }
        }
        assert_eq!(rig.dev.stats().bank_overflows, 3);

        // Each overflow discarded the frames waiting behind the stalled
        // consumer; the next frame streams again with a visible gap
        assert_eq!(rig.dev.drain_completed(), 0);
        assert_eq!(rig.dev.idle_buffers().len(), 3);
        rig.sim.capture_frame(12, 0x80);
        rig.line.dispatch();
        assert_eq!(rig.dev.drain_completed(), 1);
        let delivered = rig.drain_rx();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].state, BufferState::Done);
        assert_eq!(delivered[0].sequence, 12);
        rig.dev.check_queues().unwrap();
    }

    #[tokio::test]
    async fn test_sequence_gap_after_overflow() {
        let mut rig = Rig::ready(vga(), 720, 480, 2, 0).await;
        rig.dev.start_streaming().await.unwrap();
        rig.sim.capture_frame(0, 0);
        rig.line.dispatch();
        assert_eq!(rig.dev.drain_completed(), 1);
        assert_eq!(rig.rx.try_recv().unwrap().sequence, 0);
        rig.requeue(0);

        // Slot 1 fills, slot 0 fills, then the bank overflows
        for i in 1..4u8 {
            rig.sim.capture_frame(i, 0);
            rig.line.dispatch();
        }
        assert_eq!(rig.dev.stats().bank_overflows, 1);
        assert!(rig.dev.busy_slots().is_empty());
        assert_eq!(rig.dev.drain_completed(), 0);

        rig.sim.capture_frame(9, 0);
        rig.line.dispatch();
        rig.dev.drain_completed();
        assert_eq!(rig.rx.try_recv().unwrap().sequence, 4);
        rig.dev.check_queues().unwrap();
    }

    #[tokio::test]
    async fn test_advisory_bits_are_acknowledged() {
        let rig = Rig::ready(vga(), 720, 480, 2, 0).await;
        rig.dev.start_streaming().await.unwrap();
        rig.sim
            .raise(irq::FIFO_RAW_Y::SET + irq::FIFO_SCALE_U::SET + irq::CROP_ERR::SET);
        rig.sim.set_input_size(1280, 720);
        assert_eq!(rig.line.dispatch(), IrqReturn::Handled);
        assert_eq!(rig.dev.regs().int_status(), 0);
        assert_eq!(rig.dev.stats().fifo_overflows, 2);
        assert!(rig.dev.busy_slots().is_empty());
    }

    #[tokio::test]
    async fn test_masked_status_is_not_ours() {
        let rig = Rig::ready(vga(), 720, 480, 2, 0).await;
        rig.dev.start_streaming().await.unwrap();
        rig.sim.raise(irq::FIELD_ERR::SET);
        assert_eq!(rig.line.dispatch(), IrqReturn::None);
        assert_eq!(rig.dev.stats().spurious, 1);
    }

    #[tokio::test]
    async fn test_race_entry_goes_back_to_idle() {
        let rig = Rig::ready(vga(), 720, 480, 2, 0).await;
        rig.dev.start_streaming().await.unwrap();
        {
            let mut st = rig.dev.stream();
            assert_eq!(st.queues.idle_pop(), Some(0));
            assert_eq!(st.queues.idle_pop(), Some(1));
            st.queues.idle_add(0);
            st.queues.busy_add(1);
        }
        assert_eq!(rig.dev.update_video_buf(), ConsumeOutcome::Race);
        assert_eq!(rig.dev.stats().queue_races, 1);
        assert_eq!(rig.dev.idle_buffers().len(), 2);
        rig.dev.check_queues().unwrap();
    }

    #[tokio::test]
    async fn test_worker_delivers_frames() {
        let mut rig = Rig::ready(vga(), 720, 480, 3, 0).await;
        let worker = rig.dev.spawn_deferred_worker();
        rig.dev.start_streaming().await.unwrap();

        for i in 0..5u8 {
            rig.sim.capture_frame(i, 0x80);
            rig.line.dispatch();
            let done = tokio::time::timeout(Duration::from_secs(1), rig.rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(done.state, BufferState::Done);
            assert_eq!(done.sequence, i as u32);
            rig.requeue(done.index);
        }

        rig.dev.stop_deferred_worker();
        worker.await.unwrap();
        rig.dev.stop_streaming().await.unwrap();
        assert_eq!(rig.dev.stats().frames_done, 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_queues_stay_partitioned(ops in proptest::collection::vec(0u8..4, 1..48)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let rig = Rig::ready(vec![SensorFormat::new(64, 48)], 64, 48, 3, 5).await;
                rig.dev.start_streaming().await.unwrap();
                for (i, op) in ops.iter().enumerate() {
                    match op {
                        0 => {
                            rig.sim.capture_frame(i as u8, 0x80);
                        }
                        1 => {
                            rig.line.dispatch();
                        }
                        2 => {
                            rig.dev.update_video_buf();
                        }
                        _ => {
                            if let Some(&index) = rig.dev.delivered_buffers().first() {
                                rig.requeue(index);
                            }
                        }
                    }
                    rig.dev.check_queues().unwrap();
                    for index in rig.dev.delivered_buffers() {
                        assert!(rig.dev.slot(index).unwrap().full);
                        assert_ne!(rig.sim.slot_status() & (1 << index), 0);
                    }
                }
            });
        }
    }
}
