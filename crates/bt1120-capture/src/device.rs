//! Capture device: stream state machine and framework callbacks

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

use bt1120_regs::{scale, Bank, Bt1120Regs, CaptureFrame, CropRect, PixelFormat, RegisterIo};
use frame_queue::{
    BufferId, DmaMemory, HardwareBufferSlot, QueueManager, Queued, VideoBuffer, MAX_HW_SLOTS,
};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::platform::ClockControl;
use crate::sensor::{SensorFormat, SensorSubdev};
use crate::sink::{BufferSink, BufferState, CompletedBuffer};
use crate::stats::{CaptureStats, StatsSnapshot};
use crate::{CaptureConfig, CaptureError, CaptureState};

/// Fewest buffers the engine can stream with
pub const MIN_BUFFERS: usize = 2;

/// Answer to the framework's queue-setup callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSetup {
    pub num_buffers: usize,
    pub num_planes: usize,
    /// Y + U + V plus alignment padding
    pub plane_size: usize,
}

/// State owned by the control paths, behind the device lock
struct Control {
    open: bool,
    state: CaptureState,
    frame: CaptureFrame,
    sensor_format: SensorFormat,
    /// Streaming when suspended; resume restarts the engine
    resume_streaming: bool,
}

/// State shared with the interrupt and deferred paths
pub(crate) struct Streaming {
    pub(crate) queues: QueueManager,
    pub(crate) reqbufs_count: usize,
    /// Slots in the table programmed at the last start
    pub(crate) slot_count: usize,
    pub(crate) scale_enabled: bool,
    pub(crate) streaming: bool,
    /// Sequence number of the next captured frame
    pub(crate) sequence: u32,
    /// Sequence number of the frame each slot holds
    pub(crate) slot_sequence: [u32; MAX_HW_SLOTS],
}

/// BT1120 capture device
pub struct CaptureDevice<R: RegisterIo + 'static> {
    pub(crate) regs: Bt1120Regs<R>,
    pub(crate) memory: DmaMemory,
    pub(crate) sink: Arc<dyn BufferSink>,
    pub(crate) stream: Mutex<Streaming>,
    pub(crate) work: Notify,
    pub(crate) worker_stop: AtomicBool,
    pub(crate) stats: CaptureStats,
    sensor: Arc<dyn SensorSubdev>,
    clock: Arc<dyn ClockControl>,
    config: CaptureConfig,
    control: tokio::sync::Mutex<Control>,
}

impl<R: RegisterIo + 'static> CaptureDevice<R> {
    pub fn new(
        io: R,
        memory: DmaMemory,
        sensor: Arc<dyn SensorSubdev>,
        clock: Arc<dyn ClockControl>,
        sink: Arc<dyn BufferSink>,
        config: CaptureConfig,
    ) -> Arc<Self> {
        let frame = CaptureFrame::default();
        Arc::new(Self {
            regs: Bt1120Regs::new(io),
            memory,
            sink,
            stream: Mutex::new(Streaming {
                queues: QueueManager::new(frame.layout()),
                reqbufs_count: 0,
                slot_count: 0,
                scale_enabled: false,
                streaming: false,
                sequence: 0,
                slot_sequence: [0; MAX_HW_SLOTS],
            }),
            work: Notify::new(),
            worker_stop: AtomicBool::new(false),
            stats: CaptureStats::default(),
            sensor,
            clock,
            config,
            control: tokio::sync::Mutex::new(Control {
                open: false,
                state: CaptureState::Ready,
                frame,
                sensor_format: SensorFormat::new(frame.width, frame.height),
                resume_streaming: false,
            }),
        })
    }

    pub(crate) fn stream(&self) -> MutexGuard<'_, Streaming> {
        self.stream.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register-level access to the capture block
    pub fn regs(&self) -> &Bt1120Regs<R> {
        &self.regs
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Power up the block and negotiate the default format with the sensor
    pub async fn open(&self) -> Result<(), CaptureError> {
        let mut ctl = self.control.lock().await;
        if ctl.open {
            return Ok(());
        }
        self.clock.enable()?;
        let mut frame = ctl.frame;
        let achieved = match self.sensor.set_format(SensorFormat::new(frame.width, frame.height)) {
            Ok(achieved) => achieved,
            Err(e) => {
                self.clock.disable();
                return Err(e);
            }
        };
        if Self::decide_scale(&mut frame, achieved).is_err() {
            // Sensor smaller than the current format: capture it as is.
            frame = CaptureFrame::new(achieved.width, achieved.height, frame.format);
        }
        ctl.frame = frame;
        ctl.sensor_format = achieved;
        self.stream().queues.set_layout(frame.layout());
        ctl.open = true;
        ctl.state = CaptureState::Ready;
        info!("BT1120 opened, sensor {}", self.sensor.name());
        Ok(())
    }

    /// Stop streaming if needed, forget all buffers and gate the clock
    pub async fn close(&self) -> Result<(), CaptureError> {
        let mut ctl = self.control.lock().await;
        if !ctl.open {
            return Ok(());
        }
        if ctl.state.is_running() {
            self.stop_locked(&mut ctl);
        }
        {
            let mut st = self.stream();
            st.queues.release_all();
            st.reqbufs_count = 0;
            st.slot_count = 0;
        }
        self.clock.disable();
        ctl.open = false;
        ctl.resume_streaming = false;
        ctl.state = CaptureState::Ready;
        info!("BT1120 closed");
        Ok(())
    }

    pub async fn state(&self) -> CaptureState {
        self.control.lock().await.state
    }

    pub async fn format(&self) -> CaptureFrame {
        self.control.lock().await.frame
    }

    /// Active crop rectangle, if cropping is enabled
    pub async fn crop(&self) -> Option<CropRect> {
        let ctl = self.control.lock().await;
        ctl.frame.enable_crop.then_some(ctl.frame.crop)
    }

    /// Size the sensor actually produces
    pub async fn sensor_format(&self) -> SensorFormat {
        self.control.lock().await.sensor_format
    }

    /// Supported output formats
    pub fn enum_formats(&self) -> &'static [PixelFormat] {
        &PixelFormat::ALL
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn idle_buffers(&self) -> Vec<BufferId> {
        self.stream().queues.idle_ids()
    }

    pub fn busy_slots(&self) -> Vec<usize> {
        self.stream().queues.busy_slots()
    }

    /// Buffers delivered and not yet queued again
    pub fn delivered_buffers(&self) -> Vec<BufferId> {
        self.stream().queues.delivered_buffers()
    }

    pub fn slot(&self, index: usize) -> Option<HardwareBufferSlot> {
        self.stream().queues.slot(index).cloned()
    }

    /// Verify the idle/busy ownership partition
    pub fn check_queues(&self) -> Result<(), CaptureError> {
        Ok(self.stream().queues.check_partition()?)
    }

    /// Work out the frame a format request would produce, without applying
    /// it. Scaling is switched on when the sensor cannot deliver the
    /// requested size directly.
    pub async fn try_format(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<CaptureFrame, CaptureError> {
        let ctl = self.control.lock().await;
        if !ctl.open {
            return Err(CaptureError::NotOpen);
        }
        let achieved = self.sensor.try_format(SensorFormat::new(width, height))?;
        Self::negotiate(&ctl.frame, width, height, format, achieved)
    }

    /// Apply a new output format; refused while streaming
    pub async fn set_format(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<CaptureFrame, CaptureError> {
        let mut ctl = self.control.lock().await;
        if !ctl.open {
            return Err(CaptureError::NotOpen);
        }
        if ctl.state.is_running() {
            return Err(CaptureError::Busy);
        }
        let candidate = self.sensor.try_format(SensorFormat::new(width, height))?;
        let frame = Self::negotiate(&ctl.frame, width, height, format, candidate)?;
        let achieved = self.sensor.set_format(SensorFormat::new(width, height))?;

        ctl.sensor_format = achieved;
        ctl.frame = frame;
        self.stream().queues.set_layout(frame.layout());
        info!(
            "Format {}x{} {:?} (sensor {}x{}, scale {}, crop {})",
            frame.width,
            frame.height,
            frame.format,
            achieved.width,
            achieved.height,
            frame.enable_scale,
            frame.enable_crop
        );
        Ok(frame)
    }

    fn negotiate(
        current: &CaptureFrame,
        width: u32,
        height: u32,
        format: PixelFormat,
        sensor: SensorFormat,
    ) -> Result<CaptureFrame, CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidFormat(format!("{}x{}", width, height)));
        }
        if width % 2 != 0 {
            return Err(CaptureError::InvalidFormat(format!(
                "width {} must be even",
                width
            )));
        }
        let mut frame = CaptureFrame::new(width, height, format);
        if current.enable_crop && current.crop.fits(sensor.width, sensor.height) {
            frame.crop = current.crop;
            frame.enable_crop = true;
        }
        Self::decide_scale(&mut frame, sensor)?;
        Ok(frame)
    }

    fn decide_scale(frame: &mut CaptureFrame, sensor: SensorFormat) -> Result<(), CaptureError> {
        let src = frame.source_extent(sensor.width, sensor.height);
        frame.enable_scale = src != (frame.width, frame.height);
        if frame.enable_scale {
            scale::plan(src, (frame.width, frame.height))?;
        }
        Ok(())
    }

    /// Set or clear the crop rectangle; refused while streaming
    pub async fn set_crop(&self, crop: Option<CropRect>) -> Result<CaptureFrame, CaptureError> {
        let mut ctl = self.control.lock().await;
        if !ctl.open {
            return Err(CaptureError::NotOpen);
        }
        if ctl.state.is_running() {
            return Err(CaptureError::Busy);
        }
        let sensor = ctl.sensor_format;
        let mut frame = ctl.frame;
        match crop {
            Some(rect) => {
                if rect.width == 0 || rect.height == 0 {
                    return Err(CaptureError::InvalidCrop(format!("{:?} is empty", rect)));
                }
                if !rect.fits(sensor.width, sensor.height) {
                    return Err(CaptureError::InvalidCrop(format!(
                        "{:?} outside sensor {}x{}",
                        rect, sensor.width, sensor.height
                    )));
                }
                frame.crop = rect;
                frame.enable_crop = true;
            }
            None => {
                frame.crop = CropRect::default();
                frame.enable_crop = false;
            }
        }
        Self::decide_scale(&mut frame, sensor)?;
        ctl.frame = frame;
        debug!("Crop {:?}, scale {}", crop, frame.enable_scale);
        Ok(frame)
    }

    /// Queue-setup callback: buffer count and size for the current format
    pub async fn queue_setup(&self, requested: usize) -> Result<QueueSetup, CaptureError> {
        let ctl = self.control.lock().await;
        if !ctl.open {
            return Err(CaptureError::NotOpen);
        }
        if ctl.state.is_running() {
            return Err(CaptureError::Busy);
        }
        let wanted = if requested == 0 {
            self.config.default_buffers
        } else {
            requested
        };
        let num_buffers = wanted.clamp(MIN_BUFFERS, MAX_HW_SLOTS);
        let layout = ctl.frame.layout();

        let mut st = self.stream();
        st.queues.release_all();
        st.queues.set_layout(layout);
        st.reqbufs_count = num_buffers;
        debug!(
            "Queue setup: {} buffers of {} bytes (requested {})",
            num_buffers,
            layout.buffer_size(),
            requested
        );
        Ok(QueueSetup {
            num_buffers,
            num_planes: 1,
            plane_size: layout.buffer_size(),
        })
    }

    /// Buffer-queue callback.
    ///
    /// A buffer backing a slot delivered earlier hands that slot back to the
    /// engine: the status bit is released, then the slot re-armed, both under
    /// the stream lock so the interrupt path never sees one without the
    /// other. Any other buffer gets its plane addresses computed and waits on
    /// the idle queue.
    pub fn buf_queue(&self, vb: &VideoBuffer) -> Result<(), CaptureError> {
        let mut st = self.stream();
        if let Some(slot) = st.queues.delivered_slot(vb.index) {
            self.regs.release_slot(slot);
        }
        match st.queues.bind_buffer_to_queue(vb)? {
            Queued::Idle => {}
            Queued::Rearmed { slot } => trace!("Buffer {} back in slot {}", vb.index, slot),
            Queued::AlreadyQueued => debug!("Buffer {} already owned by the driver", vb.index),
        }
        Ok(())
    }

    /// Start-streaming callback.
    ///
    /// Builds the slot table, resets and fully reprograms the block, then
    /// starts the sensor. On failure every queued buffer goes back to the
    /// framework as `Queued` and the state is unchanged.
    pub async fn start_streaming(&self) -> Result<(), CaptureError> {
        let mut ctl = self.control.lock().await;
        if !ctl.open {
            return Err(CaptureError::NotOpen);
        }
        if !ctl.state.can_start() {
            return Err(CaptureError::InvalidState {
                state: ctl.state,
                op: "start_streaming",
            });
        }

        if let Err(e) = self.arm_and_run(&ctl).await {
            error!("Stream start failed: {}", e);
            self.return_all(BufferState::Queued);
            return Err(e);
        }
        ctl.state = CaptureState::Run;
        info!("Streaming {}x{}", ctl.frame.width, ctl.frame.height);
        Ok(())
    }

    /// Stop-streaming callback: hand every buffer back as `Error`, quiesce
    /// the engine and latch it
    pub async fn stop_streaming(&self) -> Result<(), CaptureError> {
        let mut ctl = self.control.lock().await;
        if !ctl.state.is_running() {
            return Err(CaptureError::InvalidState {
                state: ctl.state,
                op: "stop_streaming",
            });
        }
        self.stop_locked(&mut ctl);
        Ok(())
    }

    /// Platform suspend: stop the engine, keep the buffers, gate the clock
    pub async fn suspend(&self) -> Result<(), CaptureError> {
        let mut ctl = self.control.lock().await;
        if !ctl.open {
            return Ok(());
        }
        ctl.resume_streaming = ctl.state.is_running();
        if ctl.resume_streaming {
            if let Err(e) = self.wait_stopped().await {
                warn!("Suspending without stop acknowledge: {}", e);
            }
            self.regs.clear_stop_request();
            let requeued = {
                let mut st = self.stream();
                st.streaming = false;
                st.queues.requeue_busy()
            };
            self.quiesce();
            if let Err(e) = self.sensor.set_stream(false) {
                warn!("Sensor stream off failed: {}", e);
            }
            ctl.state = CaptureState::Stop;
            debug!("Suspend requeued {} busy slots", requeued);
        }
        self.clock.disable();
        info!("BT1120 suspended");
        Ok(())
    }

    /// Platform resume: ungate the clock and, if the device was streaming,
    /// run the full start sequence again
    pub async fn resume(&self) -> Result<(), CaptureError> {
        let mut ctl = self.control.lock().await;
        if !ctl.open {
            return Ok(());
        }
        self.clock.enable()?;
        if std::mem::take(&mut ctl.resume_streaming) {
            if let Err(e) = self.arm_and_run(&ctl).await {
                error!("Resume failed: {}", e);
                self.return_all(BufferState::Error);
                return Err(e);
            }
            ctl.state = CaptureState::Run;
        }
        info!("BT1120 resumed");
        Ok(())
    }

    /// Build the slot table from the idle queue, program the block and turn
    /// the sensor on
    async fn arm_and_run(&self, ctl: &Control) -> Result<(), CaptureError> {
        let (slots, scale_enabled) = {
            let mut st = self.stream();
            // Buffers the framework kept across a suspend are not in the
            // table until the next start.
            let requested = if st.reqbufs_count == 0 {
                MAX_HW_SLOTS
            } else {
                st.reqbufs_count
            };
            let count = requested.min(st.queues.idle_len());
            if count < MIN_BUFFERS {
                return Err(frame_queue::QueueError::NotEnoughBuffers {
                    needed: MIN_BUFFERS,
                    queued: st.queues.idle_len(),
                }
                .into());
            }
            let slots = st.queues.materialize_hardware_slots(count)?.to_vec();
            st.slot_count = count;
            st.scale_enabled = ctl.frame.enable_scale;
            st.sequence = 0;
            st.slot_sequence = [0; MAX_HW_SLOTS];
            st.streaming = true;
            (slots, st.scale_enabled)
        };

        let started = match self.hw_init(&ctl.frame, ctl.sensor_format, &slots, scale_enabled).await {
            Ok(()) => self.sensor.set_stream(true),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            self.stream().streaming = false;
            return Err(e);
        }
        Ok(())
    }

    /// Reset the block and run the full programming sequence, ending with
    /// a single refresh
    pub(crate) async fn hw_init(
        &self,
        frame: &CaptureFrame,
        sensor: SensorFormat,
        slots: &[HardwareBufferSlot],
        scale_enabled: bool,
    ) -> Result<(), CaptureError> {
        self.hw_reset().await?;

        self.regs.load_coefficients();
        self.regs.set_input(&self.config.input);
        self.regs.set_output(frame.format, frame.width, frame.height);
        self.regs.set_crop(frame);
        let programmed = self
            .regs
            .set_scale(frame, sensor.width, sensor.height)
            .and_then(|_| self.regs.set_output_addr(slots, scale_enabled));
        if let Err(e) = programmed {
            self.regs.set_run(false);
            self.regs.refresh();
            return Err(e.into());
        }
        self.regs.set_interrupt_enable();
        self.regs.set_done_hold(true);
        self.regs.set_run(true);
        self.regs.refresh();
        Ok(())
    }

    /// Stop handshake followed by a reset pulse. A missing stop
    /// acknowledge still pulses reset, then fails the caller.
    async fn hw_reset(&self) -> Result<(), CaptureError> {
        let stopped = self.wait_stopped().await;
        self.regs.clear_stop_request();
        self.regs.assert_reset();
        sleep(self.config.reset_pulse()).await;
        self.regs.deassert_reset();
        stopped
    }

    /// Request a stop and poll for the acknowledge, bounded by
    /// `stop_poll_count` polls and the matching deadline
    async fn wait_stopped(&self) -> Result<(), CaptureError> {
        self.regs.request_stop();
        let timeout = self.config.stop_timeout();
        let deadline = Instant::now() + timeout;
        let mut polls = 0;
        loop {
            if self.regs.is_stopped() {
                debug!("Engine stopped after {} polls", polls);
                return Ok(());
            }
            polls += 1;
            if polls >= self.config.stop_poll_count || Instant::now() >= deadline {
                error!("Engine stop not acknowledged after {} polls", polls);
                return Err(CaptureError::StopTimeout(timeout.as_millis() as u64));
            }
            sleep(self.config.stop_poll_interval()).await;
        }
    }

    fn stop_locked(&self, ctl: &mut Control) {
        let returned = self.return_all(BufferState::Error);
        self.quiesce();
        if let Err(e) = self.sensor.set_stream(false) {
            warn!("Sensor stream off failed: {}", e);
        }
        ctl.state = CaptureState::Stop;
        info!("Stream stopped, {} buffers returned", returned);
    }

    /// Disable interrupts, free both banks and clear run, in one latch
    fn quiesce(&self) {
        self.regs.set_interrupt_disable();
        self.regs.force_release(Bank::Raw);
        self.regs.force_release(Bank::Scaled);
        self.regs.set_run(false);
        self.regs.refresh();
    }

    /// Hand every idle and busy buffer back to the framework. Buffers the
    /// framework already holds are not completed again.
    fn return_all(&self, state: BufferState) -> usize {
        let ids = {
            let mut st = self.stream();
            st.streaming = false;
            let mut ids = st.queues.drain_idle();
            ids.extend(st.queues.drain_busy());
            ids
        };
        for &index in &ids {
            self.sink.buffer_done(CompletedBuffer {
                index,
                state,
                bytes_used: 0,
                sequence: 0,
            });
        }
        ids.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::platform::{SharedIrqLine, SimClock};
    use crate::sensor::StaticSensor;
    use bt1120_regs::map::{self, ctrl, irq};
    use bt1120_regs::{RegError, SimBt1120};
    use frame_queue::QueueError;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub(crate) struct Rig {
        pub dev: Arc<CaptureDevice<Arc<SimBt1120>>>,
        pub sim: Arc<SimBt1120>,
        pub mem: DmaMemory,
        pub clock: Arc<SimClock>,
        pub sensor: Arc<StaticSensor>,
        pub line: SharedIrqLine,
        pub rx: mpsc::UnboundedReceiver<CompletedBuffer>,
        /// Buffers handed to `buf_queue` by [`Rig::ready`]
        pub bufs: Vec<VideoBuffer>,
    }

    impl Rig {
        pub fn new(modes: Vec<SensorFormat>) -> Self {
            let mem = DmaMemory::new(8 << 20);
            let sim = Arc::new(SimBt1120::new(mem.clone()));
            let clock = Arc::new(SimClock::default());
            let sensor = Arc::new(StaticSensor::new("test", modes));
            let (tx, rx) = mpsc::unbounded_channel();
            let dev = CaptureDevice::new(
                sim.clone(),
                mem.clone(),
                sensor.clone(),
                clock.clone(),
                Arc::new(tx),
                CaptureConfig::default(),
            );
            let line = SharedIrqLine::new();
            line.register("bt1120", dev.clone());
            Self {
                dev,
                sim,
                mem,
                clock,
                sensor,
                line,
                rx,
                bufs: Vec::new(),
            }
        }

        /// Open, set up `count` buffers and queue them, each skewed by
        /// `skew` bytes from an aligned start
        pub async fn ready(
            modes: Vec<SensorFormat>,
            width: u32,
            height: u32,
            count: usize,
            skew: usize,
        ) -> Self {
            let mut rig = Self::new(modes);
            rig.dev.open().await.unwrap();
            rig.dev
                .set_format(width, height, PixelFormat::Yuv422p)
                .await
                .unwrap();
            let setup = rig.dev.queue_setup(count).await.unwrap();
            for i in 0..setup.num_buffers {
                let region = rig.mem.alloc(setup.plane_size, skew).unwrap();
                let vb = VideoBuffer::from_region(i, region);
                rig.dev.buf_queue(&vb).unwrap();
                rig.bufs.push(vb);
            }
            rig
        }

        /// Queue buffer `index` again, as the framework does after the
        /// application is done with it
        pub fn requeue(&self, index: BufferId) {
            self.dev.buf_queue(&self.bufs[index]).unwrap();
        }

        pub fn drain_rx(&mut self) -> Vec<CompletedBuffer> {
            let mut out = Vec::new();
            while let Ok(b) = self.rx.try_recv() {
                out.push(b);
            }
            out
        }
    }

    pub(crate) fn vga() -> Vec<SensorFormat> {
        vec![SensorFormat::new(720, 480), SensorFormat::new(1920, 1080)]
    }

    #[tokio::test]
    async fn test_open_enables_clock() {
        let rig = Rig::new(vga());
        assert!(matches!(
            rig.dev.queue_setup(3).await,
            Err(CaptureError::NotOpen)
        ));
        rig.dev.open().await.unwrap();
        assert!(rig.clock.is_enabled());
        assert_eq!(rig.dev.state().await, CaptureState::Ready);
        rig.dev.close().await.unwrap();
        assert!(!rig.clock.is_enabled());
    }

    #[tokio::test]
    async fn test_queue_setup_sizes() {
        let rig = Rig::new(vga());
        rig.dev.open().await.unwrap();
        rig.dev.set_format(720, 480, PixelFormat::Yuv422p).await.unwrap();
        let setup = rig.dev.queue_setup(0).await.unwrap();
        assert_eq!(setup.num_buffers, 3);
        assert_eq!(setup.num_planes, 1);
        assert_eq!(
            setup.plane_size,
            720 * 480 * 2 + frame_queue::ALIGN_PADDING
        );
        assert_eq!(rig.dev.queue_setup(9).await.unwrap().num_buffers, MAX_HW_SLOTS);
        assert_eq!(rig.dev.queue_setup(1).await.unwrap().num_buffers, MIN_BUFFERS);
    }

    #[tokio::test]
    async fn test_format_decides_scaling() {
        let rig = Rig::new(vga());
        rig.dev.open().await.unwrap();

        let direct = rig.dev.set_format(720, 480, PixelFormat::Yuv420p).await.unwrap();
        assert!(!direct.enable_scale);

        let scaled = rig.dev.set_format(640, 360, PixelFormat::Yuv420p).await.unwrap();
        assert!(scaled.enable_scale);
        assert_eq!(rig.dev.sensor_format().await, SensorFormat::new(720, 480));
        assert_eq!(rig.sensor.current(), Some(SensorFormat::new(720, 480)));
    }

    #[tokio::test]
    async fn test_upscale_rejected_at_negotiation() {
        let rig = Rig::new(vec![SensorFormat::new(640, 480)]);
        rig.dev.open().await.unwrap();
        let before = rig.dev.format().await;
        assert!(matches!(
            rig.dev.set_format(1280, 720, PixelFormat::Yuv422p).await,
            Err(CaptureError::Register(RegError::ScaleRejected { .. }))
        ));
        assert_eq!(rig.dev.format().await, before);
        assert!(matches!(
            rig.dev.try_format(1280, 720, PixelFormat::Yuv422p).await,
            Err(CaptureError::Register(_))
        ));
    }

    #[tokio::test]
    async fn test_downscale_past_decimation_limit_rejected() {
        let rig = Rig::new(vec![SensorFormat::new(2592, 1944)]);
        rig.dev.open().await.unwrap();
        let before = rig.dev.format().await;
        assert!(matches!(
            rig.dev.set_format(32, 24, PixelFormat::Yuv420p).await,
            Err(CaptureError::Register(RegError::DecimationOverflow { max: 15, .. }))
        ));
        assert_eq!(rig.dev.format().await, before);

        let frame = rig.dev.set_format(256, 192, PixelFormat::Yuv420p).await.unwrap();
        assert!(frame.enable_scale);
    }

    #[tokio::test]
    async fn test_crop_validation() {
        let rig = Rig::new(vga());
        rig.dev.open().await.unwrap();
        rig.dev.set_format(320, 240, PixelFormat::Yuv420p).await.unwrap();

        let frame = rig
            .dev
            .set_crop(Some(CropRect::new(40, 20, 640, 400)))
            .await
            .unwrap();
        assert!(frame.enable_crop && frame.enable_scale);
        assert_eq!(rig.dev.crop().await, Some(CropRect::new(40, 20, 640, 400)));

        assert!(matches!(
            rig.dev.set_crop(Some(CropRect::new(600, 0, 200, 100))).await,
            Err(CaptureError::InvalidCrop(_))
        ));
        assert!(matches!(
            rig.dev.set_crop(Some(CropRect::new(0, 0, 100, 100))).await,
            Err(CaptureError::Register(RegError::ScaleRejected { .. }))
        ));

        rig.dev.set_crop(None).await.unwrap();
        assert_eq!(rig.dev.crop().await, None);
    }

    #[tokio::test]
    async fn test_start_requires_buffers() {
        let mut rig = Rig::new(vga());
        rig.dev.open().await.unwrap();
        rig.dev.queue_setup(3).await.unwrap();
        let region = rig.mem.alloc(1 << 20, 0).unwrap();
        rig.dev.buf_queue(&VideoBuffer::from_region(0, region)).unwrap();

        assert!(matches!(
            rig.dev.start_streaming().await,
            Err(CaptureError::Queue(QueueError::NotEnoughBuffers { .. }))
        ));
        assert_eq!(rig.dev.state().await, CaptureState::Ready);
        let returned = rig.drain_rx();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].state, BufferState::Queued);
    }

    #[tokio::test]
    async fn test_start_programs_and_latches_once() {
        let rig = Rig::ready(vga(), 720, 480, 3, 0).await;
        let refreshes = rig.sim.refresh_count();
        rig.sim.clear_write_log();

        rig.dev.start_streaming().await.unwrap();
        assert_eq!(rig.dev.state().await, CaptureState::Run);
        assert!(rig.sensor.is_streaming());

        assert_eq!(rig.sim.refresh_count(), refreshes + 1);
        assert_eq!(rig.sim.staged_writes(), 0);
        let log = rig.sim.write_log();
        assert_eq!(log.last(), Some(&(map::UPDATE, 1)));

        let control = rig.sim.active_reg(map::CTRL);
        assert_eq!(ctrl::RUN.read(control), 1);
        assert_eq!(ctrl::DONE_HOLD.read(control), 1);
        assert_eq!(ctrl::OUT_FMT.read(control), 1);
        assert_eq!(rig.sim.active_reg(map::INT_EN), map::INT_ENABLE_MASK);
        assert!(!irq::FIELD_ERR.is_set(rig.sim.active_reg(map::INT_EN)));

        assert!(matches!(
            rig.dev.start_streaming().await,
            Err(CaptureError::InvalidState { state: CaptureState::Run, .. })
        ));
        assert!(matches!(
            rig.dev.set_format(720, 480, PixelFormat::Yuv420p).await,
            Err(CaptureError::Busy)
        ));
    }

    #[tokio::test]
    async fn test_stop_returns_buffers_and_latches_once() {
        let mut rig = Rig::ready(vga(), 720, 480, 3, 0).await;
        rig.dev.start_streaming().await.unwrap();
        rig.sim.capture_frame(0, 0x80);
        rig.line.dispatch();
        let refreshes = rig.sim.refresh_count();

        rig.dev.stop_streaming().await.unwrap();
        assert_eq!(rig.dev.state().await, CaptureState::Stop);
        assert_eq!(rig.sim.refresh_count(), refreshes + 1);
        assert_eq!(rig.sim.staged_writes(), 0);
        assert_eq!(ctrl::RUN.read(rig.sim.active_reg(map::CTRL)), 0);
        assert_eq!(rig.sim.active_reg(map::INT_EN), 0);
        assert_eq!(rig.sim.slot_status(), 0);
        assert!(!rig.sensor.is_streaming());

        let mut returned = rig.drain_rx();
        assert!(returned.iter().all(|b| b.state == BufferState::Error));
        returned.sort_by_key(|b| b.index);
        assert_eq!(
            returned.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(rig.dev.idle_buffers().is_empty());
        assert!(rig.dev.busy_slots().is_empty());
        assert!(rig.dev.stop_streaming().await.is_err());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut rig = Rig::ready(vga(), 720, 480, 2, 0).await;
        rig.dev.start_streaming().await.unwrap();
        rig.dev.stop_streaming().await.unwrap();
        let returned = rig.drain_rx();
        for b in &returned {
            let region = rig.mem.alloc(rig.dev.format().await.layout().buffer_size(), 0).unwrap();
            rig.dev.buf_queue(&VideoBuffer::from_region(b.index, region)).unwrap();
        }
        rig.dev.start_streaming().await.unwrap();
        assert_eq!(rig.dev.state().await, CaptureState::Run);
        rig.dev.check_queues().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_timeout_bounded_and_propagated() {
        let mut rig = Rig::ready(vga(), 720, 480, 3, 0).await;
        rig.sim.set_stop_stall(true);

        let started = tokio::time::Instant::now();
        let result = rig.dev.start_streaming().await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(CaptureError::StopTimeout(500))));
        assert!(elapsed <= Duration::from_millis(500), "took {:?}", elapsed);
        assert!(elapsed >= Duration::from_millis(400), "took {:?}", elapsed);
        assert_eq!(rig.dev.state().await, CaptureState::Ready);
        assert_eq!(rig.sim.staged_writes(), 0);
        assert_eq!(ctrl::RUN.read(rig.sim.active_reg(map::CTRL)), 0);

        let returned = rig.drain_rx();
        assert_eq!(returned.len(), 3);
        assert!(returned.iter().all(|b| b.state == BufferState::Queued));
    }

    #[tokio::test]
    async fn test_suspend_resume_restarts_engine() {
        let mut rig = Rig::ready(vga(), 720, 480, 3, 0).await;
        rig.dev.start_streaming().await.unwrap();
        rig.sim.capture_frame(0, 0x80);
        rig.line.dispatch();
        assert_eq!(rig.dev.busy_slots(), vec![0]);

        rig.dev.suspend().await.unwrap();
        assert_eq!(rig.dev.state().await, CaptureState::Stop);
        assert!(!rig.clock.is_enabled());
        assert!(!rig.sensor.is_streaming());
        assert_eq!(ctrl::RUN.read(rig.sim.active_reg(map::CTRL)), 0);
        assert!(rig.drain_rx().is_empty());
        assert_eq!(rig.dev.idle_buffers().len(), 3);

        rig.dev.resume().await.unwrap();
        assert_eq!(rig.dev.state().await, CaptureState::Run);
        assert!(rig.clock.is_enabled());
        assert_eq!(rig.clock.enable_count(), 2);
        assert_eq!(ctrl::RUN.read(rig.sim.active_reg(map::CTRL)), 1);
        assert_eq!(rig.sim.staged_writes(), 0);
        rig.dev.check_queues().unwrap();
    }

    #[tokio::test]
    async fn test_suspend_resume_when_idle() {
        let rig = Rig::new(vga());
        rig.dev.open().await.unwrap();
        rig.dev.suspend().await.unwrap();
        rig.dev.resume().await.unwrap();
        assert_eq!(rig.dev.state().await, CaptureState::Ready);
        assert!(rig.clock.is_enabled());
    }

    #[tokio::test]
    async fn test_scaled_stream_uses_scaled_bank() {
        let rig = Rig::ready(vga(), 640, 360, 2, 0).await;
        rig.dev.start_streaming().await.unwrap();
        let d = rig.sim.active_reg(map::DDR_STAT);
        assert_eq!(bt1120_regs::map::ddr::SCALE_CHAN_DISABLE.read(d), 0);
        assert_eq!(bt1120_regs::map::ddr::RAW_CHAN_DISABLE.read(d), 0b111);
        assert_eq!(ctrl::SCALE_EN.read(rig.sim.active_reg(map::CTRL)), 1);
    }
}
