//! In-process buffer source that fabricates frames on a timer.
//!
//! Every stream gets a ring of free buffer indices. A frame is emitted by
//! popping a free index and handing it to the stream callback; the index only
//! comes back through `queue_buffer`, just like a driver that owns its queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::{debug, info, trace, warn};

use super::frame::{Frame, FrameMetadata, MetadataHints, StreamId, StreamType};
use super::source::{BufferSource, FrameCallback, SnapshotControl, StreamConfig};
use crate::utils::lock;
use crate::{Error, Result};

/// Per-stream counters kept by the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub delivered: u64,
    pub requeued: u64,
    /// Frames skipped because every buffer was on loan
    pub starved: u64,
    /// Buffers queued while already owned by the source
    pub double_queued: u64,
    /// Buffers still on loan when the stream was switched off
    pub outstanding_at_stream_off: u64,
}

struct VirtualStream {
    config: StreamConfig,
    meta: Arc<FrameMetadata>,
    payload: Bytes,
    /// Present while buffers are registered
    free: Option<HeapRb<u32>>,
    callback: Option<FrameCallback>,
    stats: SourceStats,
}

#[derive(Default)]
struct SourceInner {
    streams: Mutex<HashMap<StreamId, VirtualStream>>,
    scripted_hints: Mutex<VecDeque<MetadataHints>>,
    frame_counter: AtomicU32,
    zsl_active: AtomicBool,
    zsl_starts: AtomicU64,
}

impl SourceInner {
    fn emit(&self, stream: StreamId, frame_idx: u32, hints: Option<MetadataHints>) -> Result<bool> {
        let (frame, callback) = {
            let mut streams = lock(&self.streams);
            let vs = streams.get_mut(&stream).ok_or(Error::UnknownStream(stream))?;
            let callback = vs
                .callback
                .clone()
                .ok_or_else(|| Error::Hardware(format!("stream {stream} is not streaming")))?;
            let Some(buf_idx) = vs.free.as_mut().and_then(|ring| ring.try_pop()) else {
                vs.stats.starved += 1;
                trace!(%stream, frame_idx, "no free buffer, frame skipped");
                return Ok(false);
            };
            vs.stats.delivered += 1;

            let hints = match vs.config.stream_type {
                StreamType::Metadata => Some(hints.unwrap_or_default()),
                _ => None,
            };
            let frame = Frame {
                stream,
                frame_idx,
                buf_idx,
                data: vs.payload.clone(),
                meta: vs.meta.clone(),
                hints,
                timestamp: Instant::now(),
            };
            (frame, callback)
        };

        callback(frame);
        Ok(true)
    }

    fn tick(&self) -> u32 {
        let frame_idx = self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let mut live: Vec<(StreamId, StreamType)> = lock(&self.streams)
            .iter()
            .filter(|(_, vs)| vs.callback.is_some())
            .map(|(id, vs)| (*id, vs.config.stream_type))
            .collect();
        live.sort_by_key(|(id, _)| *id);

        for (stream, stream_type) in live {
            let hints = match stream_type {
                StreamType::Metadata => lock(&self.scripted_hints).pop_front(),
                _ => None,
            };
            if let Err(e) = self.emit(stream, frame_idx, hints) {
                // stream went off between the snapshot and now
                trace!(%stream, "emit skipped: {e}");
            }
        }
        frame_idx
    }
}

struct Pacer {
    stop: flume::Sender<()>,
    thread: JoinHandle<()>,
}

/// Software stand-in for the camera hardware.
#[derive(Default)]
pub struct VirtualSource {
    inner: Arc<SourceInner>,
    pacer: Mutex<Option<Pacer>>,
}

impl VirtualSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the next free buffer of `stream` and deliver it. `Ok(false)`
    /// means every buffer was on loan and the frame was dropped.
    pub fn emit(&self, stream: StreamId, frame_idx: u32, hints: Option<MetadataHints>) -> Result<bool> {
        self.inner.emit(stream, frame_idx, hints)
    }

    /// Emit one frame on every streaming stream, all sharing the next
    /// sequence number. Returns that sequence number.
    pub fn tick(&self) -> u32 {
        self.inner.tick()
    }

    /// Hints for the next metadata frames produced by [`tick`](Self::tick).
    pub fn push_metadata_hints(&self, hints: MetadataHints) {
        lock(&self.inner.scripted_hints).push_back(hints);
    }

    pub fn start_pacing(&self, fps: u32) -> Result<()> {
        let mut pacer = lock(&self.pacer);
        if pacer.is_some() {
            return Ok(());
        }
        let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        let (stop, stop_rx) = flume::bounded::<()>(1);
        let inner = self.inner.clone();
        let thread = thread::Builder::new()
            .name("virtual-source".into())
            .spawn(move || {
                // Runs until the stop sender sends or goes away.
                while let Err(flume::RecvTimeoutError::Timeout) = stop_rx.recv_timeout(period) {
                    inner.tick();
                }
            })
            .map_err(|e| Error::Hardware(format!("failed to spawn pacer: {e}")))?;
        info!(fps, "virtual source pacing");
        *pacer = Some(Pacer { stop, thread });
        Ok(())
    }

    pub fn stop_pacing(&self) {
        let Some(pacer) = lock(&self.pacer).take() else {
            return;
        };
        let _ = pacer.stop.send(());
        if pacer.thread.join().is_err() {
            warn!("pacer thread panicked");
        }
        debug!("virtual source paused");
    }

    pub fn stats(&self, stream: StreamId) -> Option<SourceStats> {
        lock(&self.inner.streams).get(&stream).map(|vs| vs.stats)
    }

    /// Buffers currently owned by the source for `stream`.
    pub fn free_buffers(&self, stream: StreamId) -> Option<usize> {
        lock(&self.inner.streams)
            .get(&stream)
            .and_then(|vs| vs.free.as_ref().map(|ring| ring.occupied_len()))
    }

    pub fn zsl_active(&self) -> bool {
        self.inner.zsl_active.load(Ordering::Acquire)
    }

    pub fn zsl_starts(&self) -> u64 {
        self.inner.zsl_starts.load(Ordering::Relaxed)
    }
}

impl BufferSource for VirtualSource {
    fn configure(&self, stream: StreamId, config: &StreamConfig) -> Result<()> {
        let mut streams = lock(&self.inner.streams);
        if streams.get(&stream).is_some_and(|vs| vs.free.is_some()) {
            return Err(Error::Hardware(format!("stream {stream} has registered buffers")));
        }
        let meta = FrameMetadata {
            stream_type: config.stream_type,
            width: config.width,
            height: config.height,
            format: config.format,
            planes: config.format.planes(config.width, config.height),
        };
        let payload = Bytes::from(vec![0u8; config.format.frame_len(config.width, config.height)]);
        streams.insert(
            stream,
            VirtualStream {
                config: config.clone(),
                meta: Arc::new(meta),
                payload,
                free: None,
                callback: None,
                stats: SourceStats::default(),
            },
        );
        Ok(())
    }

    fn register_buffers(&self, stream: StreamId, count: u32) -> Result<()> {
        if count == 0 {
            return Err(Error::Hardware(format!("stream {stream}: zero buffers requested")));
        }
        let mut streams = lock(&self.inner.streams);
        let vs = streams.get_mut(&stream).ok_or(Error::UnknownStream(stream))?;
        let mut ring = HeapRb::new(count as usize);
        for idx in 0..count {
            let _ = ring.try_push(idx);
        }
        vs.config.buffer_count = count;
        vs.free = Some(ring);
        debug!(%stream, count, "buffers registered");
        Ok(())
    }

    fn unregister_buffers(&self, stream: StreamId) -> Result<()> {
        let mut streams = lock(&self.inner.streams);
        let vs = streams.get_mut(&stream).ok_or(Error::UnknownStream(stream))?;
        if vs.callback.is_some() {
            return Err(Error::Hardware(format!("stream {stream} is still streaming")));
        }
        vs.free = None;
        Ok(())
    }

    fn stream_on(&self, stream: StreamId, callback: FrameCallback) -> Result<()> {
        let mut streams = lock(&self.inner.streams);
        let vs = streams.get_mut(&stream).ok_or(Error::UnknownStream(stream))?;
        if vs.free.is_none() {
            return Err(Error::Hardware(format!("stream {stream} has no buffers")));
        }
        vs.callback = Some(callback);
        Ok(())
    }

    fn stream_off(&self, stream: StreamId) -> Result<()> {
        let mut streams = lock(&self.inner.streams);
        let vs = streams.get_mut(&stream).ok_or(Error::UnknownStream(stream))?;
        vs.callback = None;
        let owned = vs.free.as_ref().map_or(0, |ring| ring.occupied_len()) as u64;
        vs.stats.outstanding_at_stream_off = vs.config.buffer_count as u64 - owned;
        Ok(())
    }

    fn queue_buffer(&self, stream: StreamId, buf_idx: u32) -> Result<()> {
        let mut streams = lock(&self.inner.streams);
        let vs = streams.get_mut(&stream).ok_or(Error::UnknownStream(stream))?;
        let count = vs.config.buffer_count;
        let ring = vs
            .free
            .as_mut()
            .ok_or_else(|| Error::Hardware(format!("stream {stream} has no buffers")))?;
        if buf_idx >= count {
            return Err(Error::Hardware(format!("stream {stream}: buffer {buf_idx} out of range")));
        }
        if ring.iter().any(|&idx| idx == buf_idx) {
            vs.stats.double_queued += 1;
            warn!(%stream, buf_idx, "buffer queued twice");
            return Err(Error::Hardware(format!("stream {stream}: buffer {buf_idx} already queued")));
        }
        let _ = ring.try_push(buf_idx);
        vs.stats.requeued += 1;
        Ok(())
    }
}

impl SnapshotControl for VirtualSource {
    fn start_zsl_snapshot(&self) -> Result<()> {
        self.inner.zsl_active.store(true, Ordering::Release);
        self.inner.zsl_starts.fetch_add(1, Ordering::Relaxed);
        info!("zsl snapshot started");
        Ok(())
    }

    fn stop_zsl_snapshot(&self) -> Result<()> {
        self.inner.zsl_active.store(false, Ordering::Release);
        info!("zsl snapshot stopped");
        Ok(())
    }
}

impl Drop for VirtualSource {
    fn drop(&mut self) {
        self.stop_pacing();
    }
}
