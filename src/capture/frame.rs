use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier of a channel (a group of bundled streams).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Identifier of one capture stream, unique across all channels of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Streams are numbered per channel; the channel id lives in the high bits.
    pub fn new(channel: ChannelId, index: u32) -> Self {
        Self((channel.0 << 8) | (index & 0xff))
    }

    pub fn channel(&self) -> ChannelId {
        ChannelId(self.0 >> 8)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// What a stream produces. Only `Metadata` changes how the bundle queue
/// treats its buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Preview,
    Postview,
    Video,
    Snapshot,
    Raw,
    Metadata,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
    Nv21,
    Raw10,
    /// Opaque byte blob, used by metadata streams
    Blob,
}

impl PixelFormat {
    /// Bytes needed for one `width` x `height` image.
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        let px = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => px * 3,
            PixelFormat::Yuyv4 => px * 2,
            PixelFormat::Nv12 | PixelFormat::Nv21 => px * 3 / 2,
            PixelFormat::Raw10 => px * 10 / 8,
            PixelFormat::Mjpeg | PixelFormat::Blob => px,
        }
    }

    /// Plane layout for a tightly packed image.
    pub fn planes(&self, width: u32, height: u32) -> Vec<PlaneInfo> {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                let luma = width * height;
                vec![
                    PlaneInfo {
                        offset: 0,
                        length: luma,
                        stride: width,
                    },
                    PlaneInfo {
                        offset: luma,
                        length: luma / 2,
                        stride: width,
                    },
                ]
            }
            _ => vec![PlaneInfo {
                offset: 0,
                length: self.frame_len(width, height) as u32,
                stride: width,
            }],
        }
    }
}

/// One plane inside a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    pub offset: u32,
    pub length: u32,
    pub stride: u32,
}

/// Result of a prepare-snapshot sequence reported through metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepSnapshotState {
    /// The flash has to fire; a later frame must be used.
    NeedFutureFrame,
    /// Any frame from now on is usable.
    NoFutureFrame,
}

/// Hints carried by a metadata buffer that steer bundle matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHints {
    /// False when the hardware produced the buffer without usable content.
    pub valid: bool,
    pub prep_snapshot_done: Option<PrepSnapshotState>,
    /// Inclusive `(min, max)` sequence range of frames worth bundling.
    pub good_frame_range: Option<(u32, u32)>,
    /// The snapshot stream is cropped at 1x zoom in this frame.
    pub crop_1x: bool,
}

impl Default for MetadataHints {
    fn default() -> Self {
        Self {
            valid: true,
            prep_snapshot_done: None,
            good_frame_range: None,
            crop_1x: false,
        }
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub stream_type: StreamType,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<PlaneInfo>,
}

/// One filled hardware buffer with zero-copy payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream: StreamId,
    /// Sequence number shared by all streams for the same sensor frame.
    pub frame_idx: u32,
    /// Slot in the producing stream's buffer pool.
    pub buf_idx: u32,
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,
    pub meta: Arc<FrameMetadata>,
    /// Only set on metadata streams
    pub hints: Option<MetadataHints>,
    pub timestamp: Instant,
}

/// Receives buffers handed back by consumers.
pub trait BufferReturn: Send + Sync {
    fn return_buffer(&self, stream: StreamId, buf_idx: u32, generation: u32);
}

/// Ownership token for one buffer on loan from a stream.
///
/// Not `Clone`: whoever holds the record holds the right to return it. The
/// buffer goes back to its producer exactly once, either through
/// [`BufferRecord::release`] or when the record is dropped.
pub struct BufferRecord {
    frame: Frame,
    generation: u32,
    owner: Weak<dyn BufferReturn>,
}

impl BufferRecord {
    pub fn new(frame: Frame, generation: u32, owner: Weak<dyn BufferReturn>) -> Self {
        Self {
            frame,
            generation,
            owner,
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn stream(&self) -> StreamId {
        self.frame.stream
    }

    pub fn frame_idx(&self) -> u32 {
        self.frame.frame_idx
    }

    pub fn stream_type(&self) -> StreamType {
        self.frame.meta.stream_type
    }

    /// Hand the buffer back to its producer now.
    pub fn release(self) {}
}

impl Drop for BufferRecord {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.return_buffer(self.frame.stream, self.frame.buf_idx, self.generation);
        }
    }
}

impl fmt::Debug for BufferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRecord")
            .field("stream", &self.frame.stream)
            .field("frame_idx", &self.frame.frame_idx)
            .field("buf_idx", &self.frame.buf_idx)
            .finish()
    }
}
