//! BT1120 Video Capture Core
//!
//! Bridges the BT1120 capture engine to a video-buffer framework:
//! - READY -> RUN -> STOP stream state machine with full reprogramming on
//!   every start
//! - Format/crop negotiation against a sensor sub-device, deciding when the
//!   scaler is needed
//! - Interrupt handler that moves filled slots to the busy queue
//! - Deferred consumer that realigns plane data and completes buffers
//! - Suspend/resume with clock gating

pub mod config;
mod device;
mod irq;
pub mod platform;
pub mod sensor;
pub mod sink;
pub mod state;
pub mod stats;

pub use config::CaptureConfig;
pub use device::{CaptureDevice, QueueSetup, MIN_BUFFERS};
pub use irq::ConsumeOutcome;
pub use platform::{ClockControl, IrqHandler, IrqReturn, SharedIrqLine, SimClock};
pub use sensor::{SensorFormat, SensorSubdev, StaticSensor};
pub use sink::{BufferSink, BufferState, CompletedBuffer};
pub use state::CaptureState;
pub use stats::{CaptureStats, StatsSnapshot};

pub use bt1120_regs::{CaptureFrame, CropRect, PixelFormat};
pub use frame_queue::VideoBuffer;

use bt1120_regs::RegError;
use frame_queue::QueueError;
use thiserror::Error;

/// Capture error types
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Device not open")]
    NotOpen,

    #[error("Operation {op} not allowed in state {state:?}")]
    InvalidState { state: CaptureState, op: &'static str },

    #[error("Device busy: streaming")]
    Busy,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid crop: {0}")]
    InvalidCrop(String),

    #[error("Capture engine did not stop within {0}ms")]
    StopTimeout(u64),

    #[error("Sensor error: {0}")]
    Sensor(String),

    #[error("Clock error: {0}")]
    Clock(String),

    #[error("Register error: {0}")]
    Register(#[from] RegError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
