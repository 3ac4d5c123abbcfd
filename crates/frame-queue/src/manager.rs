//! Idle/busy queue manager
//!
//! Arena of framework buffers plus the hardware slot table, with two FIFOs
//! over arena indices:
//! - idle: framework buffers owned by the driver and available to the engine
//! - busy: hardware slots the engine has filled, waiting for the consumer
//!
//! While armed, every slot is in exactly one of {idle, busy, in-flight,
//! framework}. A slot handed to the framework stays full until the framework
//! queues its buffer again, so the engine never writes into it meanwhile.

use tracing::{debug, trace};

use crate::{
    BufferId, CaptureBuffer, HardwareBufferSlot, IndexFifo, PlaneLayout, QueueError, VideoBuffer,
    MAX_HW_SLOTS,
};

/// A busy slot taken out for draining
#[derive(Debug, Clone)]
pub struct DrainTicket {
    /// Snapshot of the slot at the time it was taken
    pub slot: HardwareBufferSlot,
}

/// Result of trying to take the next busy slot
#[derive(Debug, Clone)]
pub enum Drain {
    /// Busy queue empty
    Empty,
    /// Busy entry was not marked full; its buffer went back to idle
    Race { slot: usize },
    /// Slot ready for copy-out
    Ready(DrainTicket),
}

/// Where a queued framework buffer ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queued {
    /// Bound and appended to the idle queue
    Idle,
    /// Buffer backs `slot`, which was waiting on the framework; the slot is
    /// free again and the engine may be told so
    Rearmed { slot: usize },
    /// Already owned by the driver; nothing changed
    AlreadyQueued,
}

/// Buffer and slot ownership bookkeeping
#[derive(Debug, Default)]
pub struct QueueManager {
    layout: PlaneLayout,
    buffers: Vec<Option<CaptureBuffer>>,
    slots: Vec<HardwareBufferSlot>,
    idle: IndexFifo,
    busy: IndexFifo,
    in_flight: Option<usize>,
    /// Slots whose buffer is with the framework
    delivered: [bool; MAX_HW_SLOTS],
    armed: bool,
}

impl QueueManager {
    /// Create an empty manager for frames with `layout`
    pub fn new(layout: PlaneLayout) -> Self {
        Self {
            layout,
            idle: IndexFifo::with_capacity(MAX_HW_SLOTS),
            busy: IndexFifo::with_capacity(MAX_HW_SLOTS),
            ..Default::default()
        }
    }

    pub fn layout(&self) -> PlaneLayout {
        self.layout
    }

    /// Change the frame layout; applies to buffers bound afterwards
    pub fn set_layout(&mut self, layout: PlaneLayout) {
        self.layout = layout;
    }

    /// Whether a buffer is currently owned by the driver side
    pub fn is_queued(&self, id: BufferId) -> bool {
        if self.idle.contains(id) {
            return true;
        }
        self.slots.iter().any(|slot| {
            slot.buffer == id
                && (self.busy.contains(slot.index) || self.in_flight == Some(slot.index))
        })
    }

    /// Slot backed by `id` that is waiting for the framework to queue it
    pub fn delivered_slot(&self, id: BufferId) -> Option<usize> {
        if !self.armed {
            return None;
        }
        self.slots
            .iter()
            .find(|slot| slot.buffer == id && self.delivered[slot.index])
            .map(|slot| slot.index)
    }

    /// Buffers currently handed to the framework, in slot order
    pub fn delivered_buffers(&self) -> Vec<BufferId> {
        self.slots
            .iter()
            .filter(|slot| self.delivered[slot.index])
            .map(|slot| slot.buffer)
            .collect()
    }

    /// Take a buffer from the framework.
    ///
    /// A buffer backing a delivered slot re-arms that slot; the caller must
    /// release the slot's engine status bit in the same critical section.
    /// Any other buffer gets its plane addresses computed and goes to the
    /// idle queue.
    pub fn bind_buffer_to_queue(&mut self, vb: &VideoBuffer) -> Result<Queued, QueueError> {
        if self.is_queued(vb.index) {
            trace!("Buffer {} already queued", vb.index);
            return Ok(Queued::AlreadyQueued);
        }
        if let Some(index) = self.delivered_slot(vb.index) {
            self.delivered[index] = false;
            if let Some(slot) = self.slots.get_mut(index) {
                slot.full = false;
            }
            self.idle.push(vb.index);
            trace!("Buffer {} re-arms slot {}", vb.index, index);
            return Ok(Queued::Rearmed { slot: index });
        }
        let buf = CaptureBuffer::bind(vb, &self.layout)?;
        if self.buffers.len() <= vb.index {
            self.buffers.resize(vb.index + 1, None);
        }
        self.buffers[vb.index] = Some(buf);
        self.idle_add(vb.index);
        Ok(Queued::Idle)
    }

    pub fn buffer(&self, id: BufferId) -> Option<&CaptureBuffer> {
        self.buffers.get(id).and_then(Option::as_ref)
    }

    pub fn idle_add(&mut self, id: BufferId) {
        self.idle.push(id);
    }

    pub fn idle_pop(&mut self) -> Option<BufferId> {
        self.idle.pop()
    }

    pub fn busy_add(&mut self, slot: usize) {
        self.busy.push(slot);
    }

    pub fn busy_pop(&mut self) -> Option<usize> {
        self.busy.pop()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn busy_len(&self) -> usize {
        self.busy.len()
    }

    /// Idle buffer ids, head first
    pub fn idle_ids(&self) -> Vec<BufferId> {
        self.idle.iter().collect()
    }

    /// Busy slot indices, head first
    pub fn busy_slots(&self) -> Vec<usize> {
        self.busy.iter().collect()
    }

    pub fn slots(&self) -> &[HardwareBufferSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&HardwareBufferSlot> {
        self.slots.get(index)
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Slots the engine must not be handed back even under backpressure:
    /// the one being copied out and those with the framework. Bit `i` is
    /// slot `i`.
    pub fn pinned_slots(&self) -> u32 {
        let mut mask = 0;
        for slot in &self.slots {
            if self.delivered[slot.index] || self.in_flight == Some(slot.index) {
                mask |= 1 << slot.index;
            }
        }
        mask
    }

    /// Build the hardware slot table from the first `count` idle buffers.
    ///
    /// Buffers keep their idle-queue order; slot `i` is backed by the `i`-th
    /// buffer popped.
    pub fn materialize_hardware_slots(
        &mut self,
        count: usize,
    ) -> Result<&[HardwareBufferSlot], QueueError> {
        if count == 0 || count > MAX_HW_SLOTS {
            return Err(QueueError::TooManySlots(count));
        }
        if self.idle.len() < count {
            return Err(QueueError::NotEnoughBuffers {
                needed: count,
                queued: self.idle.len(),
            });
        }

        let mut slots = Vec::with_capacity(count);
        let mut popped = Vec::with_capacity(count);
        for index in 0..count {
            let Some(id) = self.idle.pop() else {
                break;
            };
            let buf = self.buffer(id).ok_or(QueueError::UnknownBuffer(id))?;
            let slot = HardwareBufferSlot::materialize(index, buf, &self.layout);
            debug!(
                "Slot {} -> buffer {} (Y {:#x}, align Y/U/V {}/{}/{})",
                index,
                id,
                slot.aligned_phys.y,
                slot.needs_align(crate::Plane::Y),
                slot.needs_align(crate::Plane::U),
                slot.needs_align(crate::Plane::V),
            );
            slots.push(slot);
            popped.push(id);
        }

        // Popped buffers go back in the order they left.
        let rest = self.idle.drain();
        for id in popped.into_iter().chain(rest) {
            self.idle.push(id);
        }

        self.slots = slots;
        self.busy.drain();
        self.in_flight = None;
        self.delivered = [false; MAX_HW_SLOTS];
        self.armed = true;
        Ok(&self.slots)
    }

    /// Interrupt-side completion of slot `index`.
    ///
    /// Marks the slot full and moves it from idle to busy. Returns `false`
    /// when the slot is unknown or already full, which includes slots still
    /// with the framework.
    pub fn complete_slot(&mut self, index: usize) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        if slot.full {
            return false;
        }
        slot.full = true;
        let buffer = slot.buffer;
        self.idle.remove(buffer);
        self.busy.push(index);
        true
    }

    /// Take the next busy slot for copy-out
    pub fn begin_drain(&mut self) -> Drain {
        let Some(index) = self.busy.pop() else {
            return Drain::Empty;
        };
        let Some(slot) = self.slots.get(index) else {
            return Drain::Race { slot: index };
        };
        if !slot.full {
            let buffer = slot.buffer;
            self.idle.push(buffer);
            return Drain::Race { slot: index };
        }
        self.in_flight = Some(index);
        Drain::Ready(DrainTicket { slot: slot.clone() })
    }

    /// Finish a drain: the slot stays full and its buffer passes to the
    /// framework. Returns the backing buffer id.
    pub fn finish_drain(&mut self, ticket: &DrainTicket) -> BufferId {
        let index = ticket.slot.index;
        if self.in_flight == Some(index) {
            self.in_flight = None;
        }
        if self.armed && index < MAX_HW_SLOTS {
            self.delivered[index] = true;
        }
        ticket.slot.buffer
    }

    /// Stop tracking framework-held slots and mark every slot empty
    fn disarm(&mut self) {
        self.armed = false;
        self.delivered = [false; MAX_HW_SLOTS];
        for slot in &mut self.slots {
            slot.full = false;
        }
    }

    /// Drop every frame waiting in the busy queue: the slots become empty
    /// and their buffers go back to idle. Returns the slots emptied.
    pub fn discard_busy(&mut self) -> Vec<usize> {
        let busy = self.busy.drain();
        for &index in &busy {
            if let Some(slot) = self.slots.get_mut(index) {
                slot.full = false;
                let buffer = slot.buffer;
                self.idle.push(buffer);
            }
        }
        busy
    }

    /// Empty the idle queue, returning the buffers to hand back
    pub fn drain_idle(&mut self) -> Vec<BufferId> {
        self.disarm();
        self.idle.drain()
    }

    /// Empty the busy queue, returning the backing buffers to hand back
    pub fn drain_busy(&mut self) -> Vec<BufferId> {
        self.disarm();
        let mut ids = Vec::with_capacity(self.busy.len());
        for index in self.busy.drain() {
            if let Some(slot) = self.slots.get(index) {
                ids.push(slot.buffer);
            }
        }
        ids
    }

    /// Put every busy slot's buffer back on the idle queue without handing
    /// it out, and disarm until slots are rebuilt (suspend). Buffers with
    /// the framework stay there.
    pub fn requeue_busy(&mut self) -> usize {
        let busy = self.busy.drain();
        for &index in &busy {
            if let Some(slot) = self.slots.get(index) {
                let buffer = slot.buffer;
                self.idle.push(buffer);
            }
        }
        self.disarm();
        busy.len()
    }

    /// Forget every buffer and slot (device close)
    pub fn release_all(&mut self) {
        self.idle.drain();
        self.busy.drain();
        self.slots.clear();
        self.buffers.clear();
        self.in_flight = None;
        self.delivered = [false; MAX_HW_SLOTS];
        self.armed = false;
    }

    /// Check the ownership partition between idle, busy, in-flight and the
    /// framework
    pub fn check_partition(&self) -> Result<(), QueueError> {
        let ids = self.idle_ids();
        for (i, id) in ids.iter().enumerate() {
            if ids[i + 1..].contains(id) {
                return Err(QueueError::Partition(format!("buffer {} queued twice", id)));
            }
        }
        let busy = self.busy_slots();
        for (i, index) in busy.iter().enumerate() {
            if busy[i + 1..].contains(index) {
                return Err(QueueError::Partition(format!("slot {} busy twice", index)));
            }
        }

        for slot in &self.slots {
            let delivered = self.delivered[slot.index];
            let places = [
                self.idle.contains(slot.buffer),
                self.busy.contains(slot.index),
                self.in_flight == Some(slot.index),
                delivered,
            ];
            let count = places.iter().filter(|&&p| p).count();
            if count > 1 || (self.armed && count == 0) {
                return Err(QueueError::Partition(format!(
                    "slot {} in {} places (idle/busy/in-flight/framework = {:?})",
                    slot.index, count, places
                )));
            }
            if delivered && !slot.full {
                return Err(QueueError::Partition(format!(
                    "slot {} with the framework but not full",
                    slot.index
                )));
            }
        }
        Ok(())
    }
}
