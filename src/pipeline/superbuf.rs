//! Superbuf queue: groups buffers from several streams into bundles keyed
//! by frame sequence number.
//!
//! Nodes sit in a `VecDeque` in the order their key was first seen (unmatched
//! nodes are kept sorted among themselves), with a key set alongside so a
//! sequence number can never own two nodes. Buffers leave the queue either
//! inside a delivered [`Bundle`] or by being dropped, which hands them back
//! to their stream.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::capture::{BufferRecord, ChannelId, MetadataHints, PrepSnapshotState, StreamId};
use crate::pipeline::ChannelStats;
use crate::utils::seq_cmp;

/// How far ahead the expected frame id jumps while waiting for the hardware
/// to report which frames are usable.
const MAX_FUTURE_FRAME_OFFSET: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyMode {
    /// Deliver only as many bundles as were requested.
    #[default]
    Burst,
    /// Deliver every matched bundle as soon as it completes.
    Continuous,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundlePriority {
    #[default]
    Normal,
    Low,
}

/// Bundling policy of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAttr {
    pub notify_mode: NotifyMode,
    /// Matched bundles kept before the oldest is released.
    pub water_mark: u32,
    /// Matched bundles kept when a burst is requested.
    pub look_back: u32,
    /// Added to a matched frame id to get the next acceptable one.
    pub post_frame_skip: u32,
    /// Unmatched bundles kept before the oldest is evicted.
    pub max_unmatched_frames: u32,
    pub priority: BundlePriority,
}

impl Default for BundleAttr {
    fn default() -> Self {
        Self {
            notify_mode: NotifyMode::Burst,
            water_mark: 2,
            look_back: 2,
            post_frame_skip: 0,
            max_unmatched_frames: 3,
            priority: BundlePriority::Normal,
        }
    }
}

/// Capture modes that move the expected frame id around.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureFlags {
    pub need_led_flash: bool,
    pub bracketing_3a: bool,
    pub flash_bracketing: bool,
    pub zoom_1x_requested: bool,
}

/// A complete set of buffers sharing one frame id, one per bundled stream.
#[derive(Debug)]
pub struct Bundle {
    pub channel: ChannelId,
    pub frame_idx: u32,
    pub buffers: Vec<BufferRecord>,
}

impl Bundle {
    pub fn buffer(&self, stream: StreamId) -> Option<&BufferRecord> {
        self.buffers.iter().find(|b| b.stream() == stream)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Return every buffer to its stream.
    pub fn release(self) {}
}

/// What `enqueue` did with a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The buffer completed its bundle.
    Matched,
    /// The buffer waits in an unmatched bundle.
    Pending,
    /// The buffer replaced one already in the same slot.
    Replaced,
    /// Older than the expected frame id; returned.
    Stale,
    /// Older than every pending bundle while the unmatched limit is hit; returned.
    Dropped,
    /// Unknown stream or unusable metadata; returned.
    Rejected,
}

struct SuperbufNode {
    frame_idx: u32,
    slots: Vec<Option<BufferRecord>>,
    matched: bool,
}

impl SuperbufNode {
    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

pub struct SuperbufQueue {
    channel: ChannelId,
    streams: Vec<StreamId>,
    metadata_stream: Option<StreamId>,
    attr: BundleAttr,
    nodes: VecDeque<SuperbufNode>,
    keys: HashSet<u32>,
    match_cnt: usize,
    expected_frame_id: u32,
    expected_without_flash: u32,
    flags: CaptureFlags,
    stats: Arc<ChannelStats>,
}

impl SuperbufQueue {
    /// `streams` fixes the slot order of every bundle.
    pub fn new(
        channel: ChannelId,
        streams: Vec<StreamId>,
        metadata_stream: Option<StreamId>,
        attr: BundleAttr,
        stats: Arc<ChannelStats>,
    ) -> Self {
        Self {
            channel,
            streams,
            metadata_stream,
            attr,
            nodes: VecDeque::new(),
            keys: HashSet::new(),
            match_cnt: 0,
            expected_frame_id: 0,
            expected_without_flash: 0,
            flags: CaptureFlags::default(),
            stats,
        }
    }

    pub fn attr(&self) -> &BundleAttr {
        &self.attr
    }

    pub fn set_notify_mode(&mut self, mode: NotifyMode) {
        self.attr.notify_mode = mode;
    }

    pub fn expected_frame_id(&self) -> u32 {
        self.expected_frame_id
    }

    pub fn flags(&self) -> &CaptureFlags {
        &self.flags
    }

    pub fn flags_mut(&mut self) -> &mut CaptureFlags {
        &mut self.flags
    }

    /// Number of bundles, matched or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn matched_count(&self) -> usize {
        self.match_cnt
    }

    /// Keys in queue order.
    pub fn frame_ids(&self) -> Vec<u32> {
        self.nodes.iter().map(|n| n.frame_idx).collect()
    }

    /// Match one incoming buffer. Buffers that are not kept are dropped here,
    /// which returns them to their stream.
    pub fn enqueue(&mut self, buf: BufferRecord) -> EnqueueOutcome {
        let Some(slot) = self.streams.iter().position(|s| *s == buf.stream()) else {
            warn!(channel = %self.channel, stream = %buf.stream(), "buffer from stream not bundled");
            self.stats.bufs_rejected(1);
            return EnqueueOutcome::Rejected;
        };
        self.stats.bufs_received(1);
        let frame_idx = buf.frame_idx();

        if self.metadata_stream == Some(buf.stream()) {
            let hints = buf.frame().hints.unwrap_or_default();
            if !hints.valid {
                trace!(channel = %self.channel, frame_idx, "invalid metadata returned");
                self.stats.bufs_rejected(1);
                return EnqueueOutcome::Rejected;
            }
            if !self.apply_metadata(frame_idx, &hints) {
                self.stats.bufs_rejected(1);
                return EnqueueOutcome::Rejected;
            }
        }

        if seq_cmp(frame_idx, self.expected_frame_id) == Ordering::Less {
            trace!(
                channel = %self.channel,
                frame_idx,
                expected = self.expected_frame_id,
                "stale buffer returned"
            );
            self.stats.bufs_stale(1);
            return EnqueueOutcome::Stale;
        }

        if self.keys.contains(&frame_idx) {
            return self.fill_existing(slot, buf);
        }

        let mut unmatched = 0usize;
        let mut oldest_older = None;
        let mut insert_before = None;
        for (pos, node) in self.nodes.iter().enumerate() {
            if node.matched {
                continue;
            }
            unmatched += 1;
            match seq_cmp(node.frame_idx, frame_idx) {
                Ordering::Less if oldest_older.is_none() => oldest_older = Some(pos),
                Ordering::Greater if insert_before.is_none() => insert_before = Some(pos),
                _ => {}
            }
        }

        if unmatched > self.attr.max_unmatched_frames as usize {
            let Some(oldest) = oldest_older else {
                debug!(channel = %self.channel, frame_idx, "older than every pending bundle, returned");
                return EnqueueOutcome::Dropped;
            };
            if let Some(evicted) = self.remove_at(oldest) {
                debug!(channel = %self.channel, frame_idx = evicted.frame_idx, "evicting oldest unmatched bundle");
                self.stats.bundles_evicted(1);
            }
            insert_before = insert_before.map(|p| if p > oldest { p - 1 } else { p });
        }

        let mut slots: Vec<Option<BufferRecord>> = (0..self.streams.len()).map(|_| None).collect();
        slots[slot] = Some(buf);
        let mut node = SuperbufNode {
            frame_idx,
            slots,
            matched: false,
        };

        let outcome = if node.is_complete() {
            node.matched = true;
            self.expected_frame_id = frame_idx.wrapping_add(self.attr.post_frame_skip);
            self.match_cnt += 1;
            self.stats.bundles_matched(1);
            EnqueueOutcome::Matched
        } else {
            EnqueueOutcome::Pending
        };

        match insert_before {
            Some(pos) => self.nodes.insert(pos, node),
            None => self.nodes.push_back(node),
        }
        self.keys.insert(frame_idx);
        outcome
    }

    fn fill_existing(&mut self, slot: usize, buf: BufferRecord) -> EnqueueOutcome {
        let frame_idx = buf.frame_idx();
        let Some(pos) = self.nodes.iter().position(|n| n.frame_idx == frame_idx) else {
            // key index out of sync; rebuild it rather than losing the buffer
            error!(channel = %self.channel, frame_idx, "key index out of sync");
            self.keys = self.nodes.iter().map(|n| n.frame_idx).collect();
            return self.enqueue(buf);
        };

        let node = &mut self.nodes[pos];
        if node.slots[slot].is_some() {
            warn!(
                channel = %self.channel,
                stream = %buf.stream(),
                frame_idx,
                "same stream already in bundle, replacing"
            );
            node.slots[slot] = Some(buf);
            return EnqueueOutcome::Replaced;
        }
        node.slots[slot] = Some(buf);
        if !node.is_complete() {
            return EnqueueOutcome::Pending;
        }

        node.matched = true;
        if self.flags.flash_bracketing {
            self.expected_frame_id = self.expected_without_flash;
            self.flags.flash_bracketing = false;
        } else {
            self.expected_frame_id = frame_idx.wrapping_add(self.attr.post_frame_skip);
        }
        self.match_cnt += 1;
        self.stats.bundles_matched(1);

        // older unmatched bundles can no longer complete in order
        let keys = &mut self.keys;
        let mut idx = 0;
        let mut released = 0;
        self.nodes.retain(|n| {
            let stale = idx < pos && !n.matched && seq_cmp(n.frame_idx, frame_idx) == Ordering::Less;
            idx += 1;
            if stale {
                keys.remove(&n.frame_idx);
                released += 1;
            }
            !stale
        });
        if released > 0 {
            debug!(channel = %self.channel, frame_idx, released, "released older unmatched bundles");
            self.stats.bundles_evicted(released);
        }
        EnqueueOutcome::Matched
    }

    fn remove_at(&mut self, pos: usize) -> Option<SuperbufNode> {
        let node = self.nodes.remove(pos)?;
        self.keys.remove(&node.frame_idx);
        if node.matched {
            self.match_cnt -= 1;
        }
        Some(node)
    }

    /// Take the oldest matched bundle.
    pub fn dequeue_matched(&mut self) -> Option<Bundle> {
        let pos = self.nodes.iter().position(|n| n.matched)?;
        let node = self.remove_at(pos)?;
        Some(Bundle {
            channel: self.channel,
            frame_idx: node.frame_idx,
            buffers: node.slots.into_iter().flatten().collect(),
        })
    }

    fn release_matched_above(&mut self, limit: usize) -> u64 {
        let mut released = 0;
        while self.match_cnt > limit {
            match self.dequeue_matched() {
                Some(bundle) => {
                    bundle.release();
                    released += 1;
                }
                None => break,
            }
        }
        released
    }

    /// Keep at most `water_mark` matched bundles. No-op in continuous mode.
    pub fn release_overflow(&mut self) -> u64 {
        if self.attr.notify_mode == NotifyMode::Continuous {
            return 0;
        }
        let released = self.release_matched_above(self.attr.water_mark as usize);
        if released > 0 {
            trace!(channel = %self.channel, released, "water mark overflow");
            self.stats.bundles_overflowed(released);
        }
        released
    }

    /// Keep at most `look_back` matched bundles ahead of a burst request.
    /// No-op in continuous mode.
    pub fn skip_to_look_back(&mut self) -> u64 {
        if self.attr.notify_mode == NotifyMode::Continuous {
            return 0;
        }
        let released = self.release_matched_above(self.attr.look_back as usize);
        if released > 0 {
            debug!(channel = %self.channel, released, "skipped bundles beyond look-back");
            self.stats.bundles_skipped(released);
        }
        released
    }

    /// Release every bundle, matched or not.
    pub fn flush(&mut self) -> u64 {
        let released = self.nodes.len() as u64;
        self.nodes.clear();
        self.keys.clear();
        self.match_cnt = 0;
        if released > 0 {
            debug!(channel = %self.channel, released, "flushed queue");
            self.stats.bundles_flushed(released);
        }
        released
    }

    /// Release every matched bundle and keep the partial ones.
    pub fn flush_matched(&mut self) -> u64 {
        let mut released = 0;
        while let Some(bundle) = self.dequeue_matched() {
            bundle.release();
            released += 1;
        }
        if released > 0 {
            self.stats.bundles_flushed(released);
        }
        released
    }

    /// Release everything and refuse frames older than `frame_idx`.
    pub fn flush_up_to(&mut self, frame_idx: u32) -> u64 {
        self.expected_frame_id = frame_idx;
        self.flush()
    }

    /// Apply metadata hints. Returns false when the buffer must be returned.
    fn apply_metadata(&mut self, frame_idx: u32, hints: &MetadataHints) -> bool {
        if hints.prep_snapshot_done.is_some() && hints.good_frame_range.is_some() {
            error!(
                channel = %self.channel,
                frame_idx,
                "prep-snapshot-done and good frame range set together"
            );
            return false;
        }

        if self.flags.zoom_1x_requested {
            if hints.crop_1x {
                self.flags.zoom_1x_requested = false;
                self.expected_frame_id = frame_idx.wrapping_add(1);
            } else {
                self.expected_frame_id = self.expected_frame_id.wrapping_add(MAX_FUTURE_FRAME_OFFSET);
                self.flush_matched();
            }
            return true;
        }

        match (hints.prep_snapshot_done, hints.good_frame_range) {
            (Some(PrepSnapshotState::NeedFutureFrame), _) => {
                self.expected_frame_id = self.expected_frame_id.wrapping_add(MAX_FUTURE_FRAME_OFFSET);
                self.flush();
                self.flags.need_led_flash = true;
            }
            (Some(PrepSnapshotState::NoFutureFrame), _) => self.flags.need_led_flash = false,
            (None, Some(_)) => {}
            (None, None) if self.flags.bracketing_3a => {
                self.flush_matched();
                self.expected_frame_id = self.expected_frame_id.wrapping_add(MAX_FUTURE_FRAME_OFFSET);
            }
            (None, None) => {}
        }

        if let Some((min, max)) = hints.good_frame_range {
            if seq_cmp(min, self.expected_frame_id) == Ordering::Greater {
                debug!(channel = %self.channel, min, expected = self.expected_frame_id, "good range starts ahead");
            }
            self.expected_frame_id = min;
            if self.flags.flash_bracketing {
                // min is the frame lit by the flash, max the one without
                self.expected_without_flash = max;
            } else {
                self.flags.bracketing_3a = false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{
        BufferReturn, Frame, FrameMetadata, PixelFormat, StreamType,
    };
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    const CH: ChannelId = ChannelId(1);
    const A: StreamId = StreamId(0x100);
    const B: StreamId = StreamId(0x101);
    const META: StreamId = StreamId(0x102);

    /// Counts how often each (stream, buf_idx) came back.
    #[derive(Default)]
    struct Returns(Mutex<HashMap<(StreamId, u32), u32>>);

    impl BufferReturn for Returns {
        fn return_buffer(&self, stream: StreamId, buf_idx: u32, _generation: u32) {
            *self.0.lock().unwrap().entry((stream, buf_idx)).or_default() += 1;
        }
    }

    impl Returns {
        fn count(&self, stream: StreamId, buf_idx: u32) -> u32 {
            self.0.lock().unwrap().get(&(stream, buf_idx)).copied().unwrap_or(0)
        }

        fn total(&self) -> u32 {
            self.0.lock().unwrap().values().sum()
        }
    }

    struct Harness {
        returns: Arc<Returns>,
        owner: Arc<dyn BufferReturn>,
        next_buf: u32,
    }

    impl Harness {
        fn new() -> Self {
            let returns = Arc::new(Returns::default());
            let owner: Arc<dyn BufferReturn> = returns.clone();
            Self {
                returns,
                owner,
                next_buf: 0,
            }
        }

        /// A record whose buf_idx is unique within the test.
        fn buf(&mut self, stream: StreamId, frame_idx: u32) -> BufferRecord {
            self.buf_with(stream, frame_idx, None)
        }

        fn buf_with(&mut self, stream: StreamId, frame_idx: u32, hints: Option<MetadataHints>) -> BufferRecord {
            self.next_buf += 1;
            let stream_type = if stream == META {
                StreamType::Metadata
            } else {
                StreamType::Preview
            };
            let frame = Frame {
                stream,
                frame_idx,
                buf_idx: self.next_buf,
                data: Bytes::new(),
                meta: Arc::new(FrameMetadata {
                    stream_type,
                    width: 2,
                    height: 2,
                    format: PixelFormat::Nv12,
                    planes: Vec::new(),
                }),
                hints,
                timestamp: Instant::now(),
            };
            BufferRecord::new(frame, 0, Arc::downgrade(&self.owner))
        }

        fn last_buf(&self) -> u32 {
            self.next_buf
        }
    }

    fn queue(streams: &[StreamId], attr: BundleAttr) -> SuperbufQueue {
        let meta = streams.iter().copied().find(|s| *s == META);
        SuperbufQueue::new(CH, streams.to_vec(), meta, attr, Arc::new(ChannelStats::new("test")))
    }

    #[test]
    fn test_two_streams_match_in_order() {
        let mut h = Harness::new();
        let attr = BundleAttr {
            water_mark: 2,
            look_back: 1,
            ..Default::default()
        };
        let mut q = queue(&[A, B], attr);

        assert_eq!(q.enqueue(h.buf(A, 1)), EnqueueOutcome::Pending);
        assert_eq!(q.enqueue(h.buf(B, 1)), EnqueueOutcome::Matched);
        assert_eq!(q.enqueue(h.buf(A, 2)), EnqueueOutcome::Pending);
        assert_eq!(q.enqueue(h.buf(B, 2)), EnqueueOutcome::Matched);
        assert_eq!(q.enqueue(h.buf(A, 3)), EnqueueOutcome::Pending);
        assert_eq!(q.release_overflow(), 0);

        let first = q.dequeue_matched().unwrap();
        assert_eq!(first.frame_idx, 1);
        assert_eq!(first.len(), 2);
        assert!(first.buffers.iter().all(|b| b.frame_idx() == 1));
        let second = q.dequeue_matched().unwrap();
        assert_eq!(second.frame_idx, 2);
        assert!(q.dequeue_matched().is_none());

        assert_eq!(q.frame_ids(), vec![3]);
        assert_eq!(h.returns.total(), 0);
    }

    #[test]
    fn test_single_stream_matches_immediately() {
        let mut h = Harness::new();
        let mut q = queue(&[B], BundleAttr::default());

        assert_eq!(q.enqueue(h.buf(B, 5)), EnqueueOutcome::Matched);
        assert_eq!(q.matched_count(), 1);
        let bundle = q.dequeue_matched().unwrap();
        assert_eq!(bundle.frame_idx, 5);
        assert_eq!(bundle.buffer(B).unwrap().frame_idx(), 5);
    }

    #[test]
    fn test_stale_buffer_returned_once() {
        let mut h = Harness::new();
        let attr = BundleAttr {
            post_frame_skip: 2,
            ..Default::default()
        };
        let mut q = queue(&[A], attr);

        q.enqueue(h.buf(A, 5));
        assert_eq!(q.expected_frame_id(), 7);
        assert_eq!(q.enqueue(h.buf(A, 6)), EnqueueOutcome::Stale);
        let stale = h.last_buf();
        assert_eq!(h.returns.count(A, stale), 1);
        assert_eq!(q.frame_ids(), vec![5]);
    }

    #[test]
    fn test_water_mark_bounds_matched_bundles() {
        let mut h = Harness::new();
        let attr = BundleAttr {
            water_mark: 2,
            ..Default::default()
        };
        let mut q = queue(&[A], attr);

        for idx in 1..=5 {
            q.enqueue(h.buf(A, idx));
            q.release_overflow();
            assert!(q.matched_count() <= 2);
        }
        assert_eq!(q.frame_ids(), vec![4, 5]);
        // buffers 1..=3 went back
        assert_eq!(h.returns.total(), 3);
        for buf in 1..=3 {
            assert_eq!(h.returns.count(A, buf), 1);
        }
    }

    #[test]
    fn test_continuous_mode_ignores_water_mark() {
        let mut h = Harness::new();
        let attr = BundleAttr {
            notify_mode: NotifyMode::Continuous,
            water_mark: 1,
            look_back: 0,
            ..Default::default()
        };
        let mut q = queue(&[A], attr);
        for idx in 1..=4 {
            q.enqueue(h.buf(A, idx));
        }
        assert_eq!(q.release_overflow(), 0);
        assert_eq!(q.skip_to_look_back(), 0);
        assert_eq!(q.matched_count(), 4);
    }

    #[test]
    fn test_skip_keeps_look_back() {
        let mut h = Harness::new();
        let attr = BundleAttr {
            water_mark: 5,
            look_back: 1,
            ..Default::default()
        };
        let mut q = queue(&[A], attr);
        for idx in 1..=4 {
            q.enqueue(h.buf(A, idx));
        }
        assert_eq!(q.skip_to_look_back(), 3);
        assert_eq!(q.frame_ids(), vec![4]);
    }

    #[test]
    fn test_evicts_oldest_unmatched_above_limit() {
        let mut h = Harness::new();
        let attr = BundleAttr {
            max_unmatched_frames: 1,
            ..Default::default()
        };
        let mut q = queue(&[A, B], attr);

        q.enqueue(h.buf(A, 1));
        let first = h.last_buf();
        q.enqueue(h.buf(A, 2));
        q.enqueue(h.buf(A, 3));

        assert_eq!(q.frame_ids(), vec![2, 3]);
        assert_eq!(h.returns.count(A, first), 1);
        assert_eq!(h.returns.total(), 1);
    }

    #[test]
    fn test_drops_incoming_older_than_all_pending() {
        let mut h = Harness::new();
        let attr = BundleAttr {
            max_unmatched_frames: 0,
            ..Default::default()
        };
        let mut q = queue(&[A, B], attr);

        q.enqueue(h.buf(A, 5));
        assert_eq!(q.enqueue(h.buf(A, 4)), EnqueueOutcome::Dropped);
        assert_eq!(h.returns.count(A, h.last_buf()), 1);
        assert_eq!(q.frame_ids(), vec![5]);
    }

    #[test]
    fn test_unmatched_nodes_stay_sorted() {
        let mut h = Harness::new();
        let mut q = queue(&[A, B], BundleAttr::default());

        q.enqueue(h.buf(A, 3));
        q.enqueue(h.buf(A, 1));
        q.enqueue(h.buf(B, 2));
        assert_eq!(q.frame_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_match_releases_older_unmatched() {
        let mut h = Harness::new();
        let mut q = queue(&[A, B], BundleAttr::default());

        q.enqueue(h.buf(A, 1));
        let older = h.last_buf();
        q.enqueue(h.buf(A, 2));
        assert_eq!(q.enqueue(h.buf(B, 2)), EnqueueOutcome::Matched);

        assert_eq!(q.frame_ids(), vec![2]);
        assert_eq!(h.returns.count(A, older), 1);
        assert_eq!(q.expected_frame_id(), 2);
    }

    #[test]
    fn test_duplicate_slot_replaces_and_returns_old() {
        let mut h = Harness::new();
        let mut q = queue(&[A, B], BundleAttr::default());

        q.enqueue(h.buf(A, 1));
        let first = h.last_buf();
        assert_eq!(q.enqueue(h.buf(A, 1)), EnqueueOutcome::Replaced);
        let second = h.last_buf();
        assert_eq!(h.returns.count(A, first), 1);

        q.enqueue(h.buf(B, 1));
        let bundle = q.dequeue_matched().unwrap();
        assert_eq!(bundle.buffer(A).unwrap().frame().buf_idx, second);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_unknown_stream_rejected() {
        let mut h = Harness::new();
        let mut q = queue(&[A], BundleAttr::default());
        assert_eq!(q.enqueue(h.buf(B, 1)), EnqueueOutcome::Rejected);
        assert_eq!(h.returns.total(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn test_rollover_is_not_stale() {
        let mut h = Harness::new();
        let mut q = queue(&[A], BundleAttr::default());

        q.enqueue(h.buf(A, u32::MAX));
        assert_eq!(q.enqueue(h.buf(A, 1)), EnqueueOutcome::Matched);
        assert_eq!(q.dequeue_matched().unwrap().frame_idx, u32::MAX);
        assert_eq!(q.dequeue_matched().unwrap().frame_idx, 1);
    }

    #[test]
    fn test_flush_returns_everything_once() {
        let mut h = Harness::new();
        let mut q = queue(&[A, B], BundleAttr::default());
        q.enqueue(h.buf(A, 1));
        q.enqueue(h.buf(B, 1));
        q.enqueue(h.buf(A, 2));
        q.enqueue(h.buf(B, 2));
        q.enqueue(h.buf(A, 3));

        assert_eq!(q.flush(), 3);
        assert_eq!(h.returns.total(), 5);
        assert!(q.is_empty());
        assert_eq!(q.matched_count(), 0);
    }

    #[test]
    fn test_flush_up_to_moves_expected() {
        let mut h = Harness::new();
        let mut q = queue(&[A], BundleAttr::default());
        q.enqueue(h.buf(A, 1));
        q.flush_up_to(10);
        assert_eq!(q.enqueue(h.buf(A, 9)), EnqueueOutcome::Stale);
        assert_eq!(q.enqueue(h.buf(A, 10)), EnqueueOutcome::Matched);
    }

    #[test]
    fn test_invalid_metadata_returned() {
        let mut h = Harness::new();
        let mut q = queue(&[A, META], BundleAttr::default());
        let hints = MetadataHints {
            valid: false,
            ..Default::default()
        };
        assert_eq!(q.enqueue(h.buf_with(META, 1, Some(hints))), EnqueueOutcome::Rejected);
        assert_eq!(h.returns.total(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn test_conflicting_metadata_rejected() {
        let mut h = Harness::new();
        let mut q = queue(&[A, META], BundleAttr::default());
        let hints = MetadataHints {
            prep_snapshot_done: Some(PrepSnapshotState::NoFutureFrame),
            good_frame_range: Some((3, 4)),
            ..Default::default()
        };
        assert_eq!(q.enqueue(h.buf_with(META, 1, Some(hints))), EnqueueOutcome::Rejected);
        assert_eq!(q.expected_frame_id(), 0);
    }

    #[test]
    fn test_good_frame_range_sets_expected() {
        let mut h = Harness::new();
        let mut q = queue(&[A, META], BundleAttr::default());
        q.flags_mut().bracketing_3a = true;

        q.enqueue(h.buf(A, 4));
        let hints = MetadataHints {
            good_frame_range: Some((6, 8)),
            ..Default::default()
        };
        // the metadata frame itself is older than the range
        assert_eq!(q.enqueue(h.buf_with(META, 5, Some(hints))), EnqueueOutcome::Stale);
        assert_eq!(q.expected_frame_id(), 6);
        assert!(!q.flags().bracketing_3a);
        assert_eq!(q.enqueue(h.buf(A, 5)), EnqueueOutcome::Stale);
    }

    #[test]
    fn test_need_future_frame_flushes_and_requests_flash() {
        let mut h = Harness::new();
        let mut q = queue(&[A, META], BundleAttr::default());
        q.enqueue(h.buf(A, 1));
        q.enqueue(h.buf(META, 1));
        assert_eq!(q.matched_count(), 1);

        let hints = MetadataHints {
            prep_snapshot_done: Some(PrepSnapshotState::NeedFutureFrame),
            ..Default::default()
        };
        q.enqueue(h.buf_with(META, 2, Some(hints)));
        assert!(q.flags().need_led_flash);
        assert_eq!(q.expected_frame_id(), 101);
        assert!(q.is_empty());
        assert_eq!(h.returns.total(), 3);
    }

    #[test]
    fn test_zoom_1x_waits_for_uncropped_frame() {
        let mut h = Harness::new();
        let mut q = queue(&[A, META], BundleAttr::default());
        q.flags_mut().zoom_1x_requested = true;

        // cropped frame: jump ahead
        q.enqueue(h.buf(META, 1));
        assert_eq!(q.expected_frame_id(), 100);
        assert!(q.flags().zoom_1x_requested);

        let hints = MetadataHints {
            crop_1x: true,
            ..Default::default()
        };
        q.enqueue(h.buf_with(META, 120, Some(hints)));
        assert!(!q.flags().zoom_1x_requested);
        assert_eq!(q.expected_frame_id(), 121);
    }

    #[test]
    fn test_flash_bracketing_moves_to_frame_without_flash() {
        let mut h = Harness::new();
        let mut q = queue(&[A, META], BundleAttr::default());
        q.flags_mut().flash_bracketing = true;

        let hints = MetadataHints {
            good_frame_range: Some((3, 6)),
            ..Default::default()
        };
        q.enqueue(h.buf_with(META, 3, Some(hints)));
        assert_eq!(q.expected_frame_id(), 3);
        assert_eq!(q.enqueue(h.buf(A, 3)), EnqueueOutcome::Matched);
        assert_eq!(q.expected_frame_id(), 6);
        assert!(!q.flags().flash_bracketing);
    }
}
