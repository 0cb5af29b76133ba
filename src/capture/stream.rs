//! One capture stream: lifecycle state machine, buffer pool bookkeeping and
//! routing of filled buffers to the channels that consume them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwapOption;
use tracing::{debug, info, instrument, trace, warn};

use super::frame::{BufferRecord, BufferReturn, Frame, StreamId, StreamType};
use super::source::{BufferSource, FrameCallback, StreamConfig};
use crate::utils::lock;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Inactive,
    /// Acquired by a channel, not yet configured
    Initialized,
    Configured,
    /// Buffer pool allocated
    Buffered,
    /// Buffers mapped and handed to the hardware
    Registered,
    Active,
    /// Reserved; never entered, every event is rejected.
    Paused,
}

impl StreamState {
    pub fn name(&self) -> &'static str {
        match self {
            StreamState::Inactive => "inactive",
            StreamState::Initialized => "initialized",
            StreamState::Configured => "configured",
            StreamState::Buffered => "buffered",
            StreamState::Registered => "registered",
            StreamState::Active => "active",
            StreamState::Paused => "paused",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Destination for filled buffers, normally a channel's matching worker.
pub struct FrameSink {
    name: String,
    deliver: Box<dyn Fn(BufferRecord) -> Result<()> + Send + Sync>,
}

impl FrameSink {
    pub fn new(
        name: impl Into<String>,
        deliver: impl Fn(BufferRecord) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            deliver: Box::new(deliver),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// On error the record has already been dropped, so the buffer is back
    /// with its stream.
    pub fn deliver(&self, rec: BufferRecord) -> Result<()> {
        (self.deliver)(rec)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BufferSlot {
    in_hardware: bool,
    /// Outstanding records for this buffer
    refs: u32,
}

struct BufferPool {
    generation: u32,
    slots: Vec<BufferSlot>,
}

struct StreamFsm {
    state: StreamState,
    config: Option<StreamConfig>,
}

pub struct Stream {
    id: StreamId,
    source: Arc<dyn BufferSource>,
    me: Weak<Stream>,
    fsm: Mutex<StreamFsm>,
    streaming: AtomicBool,
    /// Guarded separately from the lifecycle so buffer returns never wait on
    /// a start or stop in progress.
    pool: Mutex<Option<BufferPool>>,
    generations: AtomicU32,
    bundled: ArcSwapOption<FrameSink>,
    linked: ArcSwapOption<FrameSink>,
}

impl Stream {
    pub fn new(id: StreamId, source: Arc<dyn BufferSource>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            source,
            me: me.clone(),
            fsm: Mutex::new(StreamFsm {
                state: StreamState::Inactive,
                config: None,
            }),
            streaming: AtomicBool::new(false),
            pool: Mutex::new(None),
            generations: AtomicU32::new(0),
            bundled: ArcSwapOption::empty(),
            linked: ArcSwapOption::empty(),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        lock(&self.fsm).state
    }

    pub fn config(&self) -> Option<StreamConfig> {
        lock(&self.fsm).config.clone()
    }

    pub fn stream_type(&self) -> Option<StreamType> {
        lock(&self.fsm).config.as_ref().map(|c| c.stream_type)
    }

    pub fn buffer_count(&self) -> u32 {
        lock(&self.fsm).config.as_ref().map_or(0, |c| c.buffer_count)
    }

    /// True while the owning channel routes this stream into its bundle.
    pub fn is_bundled(&self) -> bool {
        self.bundled.load().is_some()
    }

    /// True while another channel also consumes this stream.
    pub fn is_linked(&self) -> bool {
        self.linked.load().is_some()
    }

    pub fn set_bundle_sink(&self, sink: Option<Arc<FrameSink>>) {
        self.bundled.store(sink);
    }

    pub fn set_linked_sink(&self, sink: Option<Arc<FrameSink>>) {
        self.linked.store(sink);
    }

    pub fn acquire(&self) -> Result<()> {
        let mut fsm = lock(&self.fsm);
        match fsm.state {
            StreamState::Inactive => {
                fsm.state = StreamState::Initialized;
                Ok(())
            }
            s => Err(Error::invalid(s.name(), "acquire")),
        }
    }

    pub fn release(&self) -> Result<()> {
        let mut fsm = lock(&self.fsm);
        match fsm.state {
            StreamState::Initialized | StreamState::Configured => {
                fsm.state = StreamState::Inactive;
                fsm.config = None;
                Ok(())
            }
            s => Err(Error::invalid(s.name(), "release")),
        }
    }

    #[instrument(skip(self, config), fields(stream = %self.id))]
    pub fn configure(&self, config: StreamConfig) -> Result<()> {
        let mut fsm = lock(&self.fsm);
        match fsm.state {
            StreamState::Initialized | StreamState::Configured => {
                self.source.configure(self.id, &config)?;
                debug!(
                    stream_type = ?config.stream_type,
                    width = config.width,
                    height = config.height,
                    buffers = config.buffer_count,
                    "stream configured"
                );
                fsm.config = Some(config);
                fsm.state = StreamState::Configured;
                Ok(())
            }
            s => Err(Error::invalid(s.name(), "configure")),
        }
    }

    pub fn get_buffers(&self) -> Result<()> {
        let mut fsm = lock(&self.fsm);
        match (fsm.state, fsm.config.as_ref()) {
            (StreamState::Configured, Some(config)) => {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                *lock(&self.pool) = Some(BufferPool {
                    generation,
                    slots: vec![BufferSlot::default(); config.buffer_count as usize],
                });
                fsm.state = StreamState::Buffered;
                Ok(())
            }
            (s, _) => Err(Error::invalid(s.name(), "get-buffers")),
        }
    }

    pub fn put_buffers(&self) -> Result<()> {
        let mut fsm = lock(&self.fsm);
        match fsm.state {
            StreamState::Buffered => {
                if let Some(pool) = lock(&self.pool).take() {
                    let lent = pool.slots.iter().filter(|s| s.refs > 0).count();
                    if lent > 0 {
                        debug!(stream = %self.id, lent, "dropping pool with buffers still on loan");
                    }
                }
                fsm.state = StreamState::Configured;
                Ok(())
            }
            s => Err(Error::invalid(s.name(), "put-buffers")),
        }
    }

    pub fn register_buffers(&self) -> Result<()> {
        let mut fsm = lock(&self.fsm);
        match fsm.state {
            StreamState::Buffered => {
                let count = fsm.config.as_ref().map_or(0, |c| c.buffer_count);
                self.source.register_buffers(self.id, count)?;
                if let Some(pool) = lock(&self.pool).as_mut() {
                    for slot in &mut pool.slots {
                        *slot = BufferSlot {
                            in_hardware: true,
                            refs: 0,
                        };
                    }
                }
                fsm.state = StreamState::Registered;
                Ok(())
            }
            s => Err(Error::invalid(s.name(), "register-buffers")),
        }
    }

    pub fn unregister_buffers(&self) -> Result<()> {
        let mut fsm = lock(&self.fsm);
        match fsm.state {
            StreamState::Registered => {
                self.source.unregister_buffers(self.id)?;
                if let Some(pool) = lock(&self.pool).as_mut() {
                    for slot in &mut pool.slots {
                        slot.in_hardware = false;
                    }
                }
                fsm.state = StreamState::Buffered;
                Ok(())
            }
            s => Err(Error::invalid(s.name(), "unregister-buffers")),
        }
    }

    #[instrument(skip(self), fields(stream = %self.id))]
    pub fn start(&self) -> Result<()> {
        let mut fsm = lock(&self.fsm);
        match fsm.state {
            StreamState::Registered => {
                let me = self.me.clone();
                let callback: FrameCallback = Arc::new(move |frame| {
                    if let Some(stream) = me.upgrade() {
                        stream.on_frame(frame);
                    }
                });
                self.streaming.store(true, Ordering::Release);
                if let Err(e) = self.source.stream_on(self.id, callback) {
                    self.streaming.store(false, Ordering::Release);
                    return Err(e);
                }
                fsm.state = StreamState::Active;
                info!("stream on");
                Ok(())
            }
            s => Err(Error::invalid(s.name(), "start")),
        }
    }

    #[instrument(skip(self), fields(stream = %self.id))]
    pub fn stop(&self) -> Result<()> {
        let mut fsm = lock(&self.fsm);
        match fsm.state {
            StreamState::Active => {
                self.streaming.store(false, Ordering::Release);
                if let Err(e) = self.source.stream_off(self.id) {
                    self.streaming.store(true, Ordering::Release);
                    return Err(e);
                }
                fsm.state = StreamState::Registered;
                info!("stream off");
                Ok(())
            }
            s => Err(Error::invalid(s.name(), "stop")),
        }
    }

    /// Buffers currently owned by the hardware.
    pub fn queued_buffer_count(&self) -> Result<u32> {
        let state = self.state();
        match state {
            StreamState::Buffered | StreamState::Registered | StreamState::Active => {
                Ok(lock(&self.pool)
                    .as_ref()
                    .map_or(0, |p| p.slots.iter().filter(|s| s.in_hardware).count() as u32))
            }
            s => Err(Error::invalid(s.name(), "queued-buffer-count")),
        }
    }

    /// Walk back to `Configured` from wherever the stream is. Errors are
    /// logged and skipped.
    pub fn teardown(&self) {
        if self.state() == StreamState::Active {
            if let Err(e) = self.stop() {
                warn!(stream = %self.id, "stream off failed: {e}");
            }
        }
        if self.state() == StreamState::Registered {
            if let Err(e) = self.unregister_buffers() {
                warn!(stream = %self.id, "unregister buffers failed: {e}");
            }
        }
        if self.state() == StreamState::Buffered {
            if let Err(e) = self.put_buffers() {
                warn!(stream = %self.id, "put buffers failed: {e}");
            }
        }
    }

    /// Data-ready path, called on the source's thread.
    fn on_frame(&self, frame: Frame) {
        let buf_idx = frame.buf_idx;
        if !self.streaming.load(Ordering::Acquire) {
            self.requeue(buf_idx);
            return;
        }

        let sinks = [self.bundled.load_full(), self.linked.load_full()];
        let consumers = sinks.iter().flatten().count() as u32;
        if consumers == 0 {
            trace!(stream = %self.id, frame_idx = frame.frame_idx, "no consumer, requeue");
            self.requeue(buf_idx);
            return;
        }

        let generation = {
            let mut pool = lock(&self.pool);
            match pool.as_mut() {
                None => {
                    trace!(stream = %self.id, buf_idx, "no buffer pool, requeue");
                    None
                }
                Some(pool) => match pool.slots.get_mut(buf_idx as usize) {
                    None => {
                        warn!(stream = %self.id, buf_idx, "buffer index out of range");
                        None
                    }
                    Some(slot) => {
                        slot.in_hardware = false;
                        slot.refs = consumers;
                        Some(pool.generation)
                    }
                },
            }
        };
        let Some(generation) = generation else {
            self.requeue(buf_idx);
            return;
        };

        let owner: Weak<dyn BufferReturn> = self.me.clone();
        for sink in sinks.into_iter().flatten() {
            let rec = BufferRecord::new(frame.clone(), generation, owner.clone());
            if let Err(e) = sink.deliver(rec) {
                debug!(stream = %self.id, sink = sink.name(), "delivery failed: {e}");
            }
        }
    }

    fn requeue(&self, buf_idx: u32) {
        if let Err(e) = self.source.queue_buffer(self.id, buf_idx) {
            debug!(stream = %self.id, buf_idx, "queue buffer failed: {e}");
        }
    }
}

impl BufferReturn for Stream {
    fn return_buffer(&self, stream: StreamId, buf_idx: u32, generation: u32) {
        debug_assert_eq!(stream, self.id);
        let requeue = {
            let mut pool = lock(&self.pool);
            let Some(pool) = pool.as_mut() else {
                return;
            };
            if pool.generation != generation {
                trace!(stream = %self.id, buf_idx, "return from an earlier buffer pool ignored");
                return;
            }
            let Some(slot) = pool.slots.get_mut(buf_idx as usize) else {
                return;
            };
            if slot.refs == 0 {
                warn!(stream = %self.id, buf_idx, "buffer returned more often than lent");
                return;
            }
            slot.refs -= 1;
            let requeue = slot.refs == 0 && self.streaming.load(Ordering::Acquire);
            if requeue {
                slot.in_hardware = true;
            }
            requeue
        };

        if requeue {
            if let Err(e) = self.source.queue_buffer(self.id, buf_idx) {
                warn!(stream = %self.id, buf_idx, "queue buffer failed: {e}");
                if let Some(pool) = lock(&self.pool).as_mut() {
                    if let Some(slot) = pool.slots.get_mut(buf_idx as usize) {
                        slot.in_hardware = false;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("bundled", &self.is_bundled())
            .field("linked", &self.is_linked())
            .finish()
    }
}
