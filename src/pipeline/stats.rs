//! Per-channel bundling counters

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Counters bumped on the matching and dispatch threads, read from anywhere.
/// Each bump is mirrored to the `metrics` facade labelled with the channel.
pub struct ChannelStats {
    channel: String,
    counters: CachePadded<Counters>,
}

#[derive(Default)]
struct Counters {
    bufs_received: AtomicU64,
    bufs_rejected: AtomicU64,
    bufs_stale: AtomicU64,
    bundles_matched: AtomicU64,
    bundles_evicted: AtomicU64,
    bundles_overflowed: AtomicU64,
    bundles_skipped: AtomicU64,
    bundles_flushed: AtomicU64,
    bundles_delivered: AtomicU64,
}

/// Point-in-time copy of [`ChannelStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bufs_received: u64,
    /// Not from a bundled stream, or a bad metadata buffer.
    pub bufs_rejected: u64,
    /// Older than the expected frame id.
    pub bufs_stale: u64,
    pub bundles_matched: u64,
    /// Unmatched bundles dropped to bound memory or because a newer one matched.
    pub bundles_evicted: u64,
    /// Matched bundles released above the water mark.
    pub bundles_overflowed: u64,
    /// Matched bundles released beyond look-back on a burst request.
    pub bundles_skipped: u64,
    pub bundles_flushed: u64,
    pub bundles_delivered: u64,
}

macro_rules! bump {
    ($name:ident, $metric:literal) => {
        pub(crate) fn $name(&self, n: u64) {
            self.counters.$name.fetch_add(n, Ordering::Relaxed);
            metrics::counter!($metric, "channel" => self.channel.clone()).increment(n);
        }
    };
}

impl ChannelStats {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            counters: CachePadded::new(Counters::default()),
        }
    }

    bump!(bufs_received, "bundlecore_bufs_received_total");
    bump!(bufs_rejected, "bundlecore_bufs_rejected_total");
    bump!(bufs_stale, "bundlecore_bufs_stale_total");
    bump!(bundles_matched, "bundlecore_bundles_matched_total");
    bump!(bundles_evicted, "bundlecore_bundles_evicted_total");
    bump!(bundles_overflowed, "bundlecore_bundles_overflowed_total");
    bump!(bundles_skipped, "bundlecore_bundles_skipped_total");
    bump!(bundles_flushed, "bundlecore_bundles_flushed_total");
    bump!(bundles_delivered, "bundlecore_bundles_delivered_total");

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            bufs_received: c.bufs_received.load(Ordering::Relaxed),
            bufs_rejected: c.bufs_rejected.load(Ordering::Relaxed),
            bufs_stale: c.bufs_stale.load(Ordering::Relaxed),
            bundles_matched: c.bundles_matched.load(Ordering::Relaxed),
            bundles_evicted: c.bundles_evicted.load(Ordering::Relaxed),
            bundles_overflowed: c.bundles_overflowed.load(Ordering::Relaxed),
            bundles_skipped: c.bundles_skipped.load(Ordering::Relaxed),
            bundles_flushed: c.bundles_flushed.load(Ordering::Relaxed),
            bundles_delivered: c.bundles_delivered.load(Ordering::Relaxed),
        }
    }
}
