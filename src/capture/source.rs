//! Boundary to the hardware that fills buffers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::frame::{Frame, PixelFormat, StreamId, StreamType};
use crate::Result;

/// Invoked from the source's own thread for every filled buffer.
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Stream parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub stream_type: StreamType,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
}

/// Hardware buffer source.
///
/// Buffers are addressed by `(stream, buf_idx)`. Every method must be callable
/// from any thread; `queue_buffer` in particular is called from the channel
/// workers and from whatever thread drops the last reference to a buffer.
pub trait BufferSource: Send + Sync {
    fn configure(&self, stream: StreamId, config: &StreamConfig) -> Result<()>;

    /// Map `count` buffers and hand them all to the hardware.
    fn register_buffers(&self, stream: StreamId, count: u32) -> Result<()>;

    fn unregister_buffers(&self, stream: StreamId) -> Result<()>;

    fn stream_on(&self, stream: StreamId, callback: FrameCallback) -> Result<()>;

    fn stream_off(&self, stream: StreamId) -> Result<()>;

    /// Give a consumed buffer back to the hardware.
    fn queue_buffer(&self, stream: StreamId, buf_idx: u32) -> Result<()>;
}

/// Opportunistic (ZSL) background capture control on the camera backend.
pub trait SnapshotControl: Send + Sync {
    fn start_zsl_snapshot(&self) -> Result<()>;
    fn stop_zsl_snapshot(&self) -> Result<()>;
}
