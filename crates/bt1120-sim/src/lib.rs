//! BT1120 Capture Simulator
//!
//! Wires the capture core to simulated hardware and streams frames through
//! the full path: engine -> interrupt -> busy queue -> deferred worker ->
//! framework sink.

pub mod config;

pub use config::SimConfig;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bt1120_capture::{
    BufferState, CaptureDevice, CaptureError, CompletedBuffer, SharedIrqLine, SimClock,
    StaticSensor, StatsSnapshot, VideoBuffer,
};
use bt1120_regs::{FrameOutcome, SimBt1120};
use frame_queue::{DmaMemory, DmaRegion, QueueError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Simulator errors
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Buffer allocation error: {0}")]
    Queue(#[from] QueueError),

    #[error("Frame dump failed: {0}")]
    Dump(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimReport {
    pub frames_offered: u32,
    pub frames_captured: u32,
    pub frames_dropped: u32,
    pub buffers_done: usize,
    pub buffers_returned: usize,
    /// Sequence numbers skipped between delivered buffers
    pub sequence_gaps: u32,
    pub stats: StatsSnapshot,
}

/// Initialize logging, as JSON lines when `json` is set
pub fn init_logging(json: bool) {
    let builder = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true);

    let installed = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    if installed.is_err() {
        warn!("Tracing subscriber already installed");
    }
}

/// Run one capture session as described by `config`
pub async fn run(config: &SimConfig) -> Result<SimReport, SimError> {
    let frame_bytes = config.width as usize * config.height as usize * 2;
    let memory = DmaMemory::new((config.buffers.max(1) + 1) * (frame_bytes + 4096));
    let sim = Arc::new(SimBt1120::new(memory.clone()));
    let sensor = Arc::new(StaticSensor::new(
        config.sensor_name.clone(),
        config.sensor_modes.clone(),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dev = CaptureDevice::new(
        sim.clone(),
        memory.clone(),
        sensor,
        Arc::new(SimClock::default()),
        Arc::new(tx),
        config.capture.clone(),
    );
    let line = SharedIrqLine::new();
    line.register("bt1120", dev.clone());

    dev.open().await?;
    let frame = dev.set_format(config.width, config.height, config.format).await?;
    let frame = match config.crop {
        Some(crop) => dev.set_crop(Some(crop)).await?,
        None => frame,
    };
    let setup = dev.queue_setup(config.buffers).await?;
    let mut regions: HashMap<usize, DmaRegion> = HashMap::new();
    for index in 0..setup.num_buffers {
        let region = memory.alloc(setup.plane_size, config.buffer_skew)?;
        dev.buf_queue(&VideoBuffer::from_region(index, region))?;
        regions.insert(index, region);
    }
    info!(
        "{} buffers of {} bytes, output {}x{} {:?}",
        setup.num_buffers, setup.plane_size, frame.width, frame.height, frame.format
    );

    sim.set_stop_stall(config.stop_stall);
    let worker = (!config.stall_consumer).then(|| dev.spawn_deferred_worker());
    if let Err(e) = dev.start_streaming().await {
        dev.stop_deferred_worker();
        dev.close().await?;
        return Err(e.into());
    }

    let mut report = SimReport::default();
    let mut sink = Delivery {
        dev: &dev,
        memory: &memory,
        regions: &regions,
        width: frame.width,
        height: frame.height,
        dump_dir: config.dump_dir.as_deref(),
        last_sequence: None,
    };
    let mut ticker = tokio::time::interval(Duration::from_millis(config.frame_interval_ms.max(1)));
    for n in 0..config.frames {
        ticker.tick().await;
        report.frames_offered += 1;
        match sim.capture_frame((n as u8).wrapping_mul(8), 0x80) {
            FrameOutcome::Captured { .. } => report.frames_captured += 1,
            FrameOutcome::Dropped => report.frames_dropped += 1,
            FrameOutcome::Idle => warn!("Engine idle at frame {}", n),
        }
        line.dispatch();
        tokio::task::yield_now().await;
        sink.collect(&mut rx, &mut report)?;
    }

    dev.drain_completed();
    if let Some(worker) = worker {
        dev.stop_deferred_worker();
        if let Err(e) = worker.await {
            warn!("Deferred worker ended abnormally: {}", e);
        }
    }
    sink.collect(&mut rx, &mut report)?;

    dev.stop_streaming().await?;
    while let Ok(buf) = rx.try_recv() {
        if buf.state == BufferState::Error {
            report.buffers_returned += 1;
        }
    }
    report.stats = dev.stats();
    dev.close().await?;

    info!(
        "Offered {}, captured {}, dropped {}, delivered {}",
        report.frames_offered, report.frames_captured, report.frames_dropped, report.buffers_done
    );
    Ok(report)
}

/// Framework side: takes completed buffers and queues them again
struct Delivery<'a> {
    dev: &'a CaptureDevice<Arc<SimBt1120>>,
    memory: &'a DmaMemory,
    regions: &'a HashMap<usize, DmaRegion>,
    width: u32,
    height: u32,
    dump_dir: Option<&'a Path>,
    last_sequence: Option<u32>,
}

impl Delivery<'_> {
    /// Account for every buffer completed so far. Each one is dumped, then
    /// queued again so the engine can reuse it.
    fn collect(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<CompletedBuffer>,
        report: &mut SimReport,
    ) -> Result<(), SimError> {
        while let Ok(buf) = rx.try_recv() {
            if buf.state != BufferState::Done {
                continue;
            }
            report.buffers_done += 1;
            if let Some(last) = self.last_sequence {
                report.sequence_gaps += buf.sequence.saturating_sub(last.wrapping_add(1));
            }
            self.last_sequence = Some(buf.sequence);
            let Some(region) = self.regions.get(&buf.index) else {
                warn!("Completed buffer {} was never allocated", buf.index);
                continue;
            };
            if let Some(dir) = self.dump_dir {
                self.dump_luma(region, &buf, dir)?;
            }
            self.dev
                .buf_queue(&VideoBuffer::from_region(buf.index, *region))?;
        }
        Ok(())
    }

    /// Save the Y plane of a delivered buffer as an 8-bit grayscale PNG
    fn dump_luma(&self, region: &DmaRegion, buf: &CompletedBuffer, dir: &Path) -> Result<(), SimError> {
        std::fs::create_dir_all(dir)?;
        let luma = self
            .memory
            .read_virt(region.virt, self.width as usize * self.height as usize)?;
        let Some(img) = image::GrayImage::from_raw(self.width, self.height, luma) else {
            warn!("Buffer {} too short for a {}x{} dump", buf.index, self.width, self.height);
            return Ok(());
        };
        img.save(dir.join(format!("frame_{:05}.png", buf.sequence)))?;
        Ok(())
    }
}
