//! Capture counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running counters, mirrored to the `metrics` facade
#[derive(Debug, Default)]
pub struct CaptureStats {
    interrupts: AtomicU64,
    spurious: AtomicU64,
    frames_done: AtomicU64,
    bank_overflows: AtomicU64,
    fifo_overflows: AtomicU64,
    queue_races: AtomicU64,
    deferred_runs: AtomicU64,
}

/// Point-in-time copy of [`CaptureStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub interrupts: u64,
    pub spurious: u64,
    pub frames_done: u64,
    pub bank_overflows: u64,
    pub fifo_overflows: u64,
    pub queue_races: u64,
    pub deferred_runs: u64,
}

impl CaptureStats {
    pub(crate) fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn spurious(&self) {
        self.spurious.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_done(&self) {
        self.frames_done.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("bt1120_frames_done").increment(1);
    }

    pub(crate) fn bank_overflow(&self) {
        self.bank_overflows.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("bt1120_frames_dropped").increment(1);
    }

    pub(crate) fn fifo_overflow(&self) {
        self.fifo_overflows.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("bt1120_fifo_overflow").increment(1);
    }

    pub(crate) fn queue_race(&self) {
        self.queue_races.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("bt1120_queue_race").increment(1);
    }

    pub(crate) fn deferred_run(&self) {
        self.deferred_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            interrupts: self.interrupts.load(Ordering::Relaxed),
            spurious: self.spurious.load(Ordering::Relaxed),
            frames_done: self.frames_done.load(Ordering::Relaxed),
            bank_overflows: self.bank_overflows.load(Ordering::Relaxed),
            fifo_overflows: self.fifo_overflows.load(Ordering::Relaxed),
            queue_races: self.queue_races.load(Ordering::Relaxed),
            deferred_runs: self.deferred_runs.load(Ordering::Relaxed),
        }
    }
}
