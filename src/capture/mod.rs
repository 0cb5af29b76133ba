pub mod frame;
pub mod source;
pub mod stream;
pub mod virtual_source;

pub use frame::{
    BufferRecord, BufferReturn, ChannelId, Frame, FrameMetadata, MetadataHints, PixelFormat,
    PlaneInfo, PrepSnapshotState, StreamId, StreamType,
};
pub use source::{BufferSource, FrameCallback, SnapshotControl, StreamConfig};
pub use stream::{FrameSink, Stream, StreamState};
pub use virtual_source::{SourceStats, VirtualSource};
