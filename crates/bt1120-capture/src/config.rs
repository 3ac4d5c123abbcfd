//! Capture configuration

use std::time::Duration;

use bt1120_regs::InputConfig;
use serde::{Deserialize, Serialize};

/// Capture core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Input sync, sample width, bit swap and mix source
    pub input: InputConfig,

    /// Stop-acknowledge polls before giving up
    pub stop_poll_count: u32,

    /// Delay between stop-acknowledge polls (milliseconds)
    pub stop_poll_interval_ms: u64,

    /// Reset pulse width (milliseconds)
    pub reset_pulse_ms: u64,

    /// Buffer count used when the framework asks for none
    pub default_buffers: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            input: InputConfig::default(),
            stop_poll_count: 50,
            stop_poll_interval_ms: 10,
            reset_pulse_ms: 1,
            default_buffers: 3,
        }
    }
}

impl CaptureConfig {
    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    /// Upper bound of the stop handshake (500 ms by default)
    pub fn stop_timeout(&self) -> Duration {
        self.stop_poll_interval() * self.stop_poll_count
    }

    pub fn reset_pulse(&self) -> Duration {
        Duration::from_millis(self.reset_pulse_ms)
    }
}
