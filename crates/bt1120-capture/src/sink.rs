//! Buffer completion towards the video-buffer framework

use tokio::sync::mpsc;
use tracing::warn;

use frame_queue::BufferId;

/// State a buffer is returned in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Filled with a frame
    Done,
    /// Returned without data (stream stopped)
    Error,
    /// Returned unused because stream-on failed
    Queued,
}

/// Buffer handed back to the framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedBuffer {
    pub index: BufferId,
    pub state: BufferState,
    /// Payload bytes (Y + U + V), zero unless `Done`
    pub bytes_used: usize,
    /// Frame sequence number, gaps mean dropped frames
    pub sequence: u32,
}

/// Receiver of completed buffers
pub trait BufferSink: Send + Sync {
    fn buffer_done(&self, buffer: CompletedBuffer);
}

impl BufferSink for mpsc::UnboundedSender<CompletedBuffer> {
    fn buffer_done(&self, buffer: CompletedBuffer) {
        if self.send(buffer).is_err() {
            warn!("Buffer {} completed with no consumer", buffer.index);
        }
    }
}
