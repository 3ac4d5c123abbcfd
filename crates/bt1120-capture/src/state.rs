//! Stream state

use serde::Serialize;

/// Capture stream state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CaptureState {
    /// Opened, not streaming yet
    #[default]
    Ready,
    /// Engine programmed and running
    Run,
    /// Stream stopped or device suspended
    Stop,
}

impl CaptureState {
    /// Whether stream-on is accepted from this state
    pub fn can_start(&self) -> bool {
        matches!(self, CaptureState::Ready | CaptureState::Stop)
    }

    pub fn is_running(&self) -> bool {
        *self == CaptureState::Run
    }
}
