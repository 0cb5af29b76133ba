pub mod stats;
pub mod superbuf;

pub use stats::{ChannelStats, StatsSnapshot};
pub use superbuf::{
    Bundle, BundleAttr, BundlePriority, CaptureFlags, EnqueueOutcome, NotifyMode, SuperbufQueue,
};
