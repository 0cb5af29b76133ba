//! A channel bundles several streams and delivers matched bundles to one
//! callback.
//!
//! Control goes through [`Channel::handle_event`], a `(state, event)` match
//! that either performs a transition or answers `InvalidOperation` without
//! touching anything. While active, buffers from every bundled stream are
//! posted to a matching worker that owns the superbuf queue; matched
//! bundles travel on to a dispatch worker that runs the callback.

mod matcher;

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument, warn};

use crate::capture::{
    BufferSource, ChannelId, FrameSink, SnapshotControl, Stream, StreamConfig, StreamId,
    StreamType,
};
use crate::config::ChannelConfig;
use crate::pipeline::{Bundle, BundleAttr, ChannelStats, NotifyMode, StatsSnapshot, SuperbufQueue};
use crate::utils::lock;
use crate::worker::CommandWorker;
use crate::{Error, Result};

use matcher::{Dispatcher, MatchCommand, Matcher};

/// Receives every delivered bundle on the channel's dispatch thread.
/// Dropping the bundle hands its buffers back. The callback must not call
/// back into the same channel synchronously.
pub type BundleCallback = Arc<dyn Fn(Bundle) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    NotUsed,
    Stopped,
    Active,
    /// Reserved, never entered by a public event.
    Paused,
}

impl ChannelState {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelState::NotUsed => "not-used",
            ChannelState::Stopped => "stopped",
            ChannelState::Active => "active",
            ChannelState::Paused => "paused",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capture modes that reshape which frames are worth bundling. Each toggle
/// flushes the queue first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvancedCapture {
    AeBracketing(bool),
    AfBracketing(bool),
    MtfBracketing(bool),
    FlashBracketing(bool),
    Zoom1x(bool),
}

#[derive(Debug)]
pub enum ChannelEvent {
    AddStream,
    /// Reference a stream owned by another channel.
    LinkStream(Arc<Stream>),
    DeleteStream(StreamId),
    ConfigureStream {
        stream: StreamId,
        config: StreamConfig,
    },
    GetBundleInfo,
    Start,
    Stop,
    RequestSuperBuf(u32),
    CancelRequest,
    FlushQueue(u32),
    ConfigNotify(NotifyMode),
    StartZslSnapshot,
    StopZslSnapshot,
    AdvancedCapture(AdvancedCapture),
    QueuedBufferCount(StreamId),
    Delete,
}

impl ChannelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::AddStream => "add-stream",
            ChannelEvent::LinkStream(_) => "link-stream",
            ChannelEvent::DeleteStream(_) => "delete-stream",
            ChannelEvent::ConfigureStream { .. } => "configure-stream",
            ChannelEvent::GetBundleInfo => "get-bundle-info",
            ChannelEvent::Start => "start",
            ChannelEvent::Stop => "stop",
            ChannelEvent::RequestSuperBuf(_) => "request-super-buf",
            ChannelEvent::CancelRequest => "cancel-request",
            ChannelEvent::FlushQueue(_) => "flush-queue",
            ChannelEvent::ConfigNotify(_) => "config-notify",
            ChannelEvent::StartZslSnapshot => "start-zsl-snapshot",
            ChannelEvent::StopZslSnapshot => "stop-zsl-snapshot",
            ChannelEvent::AdvancedCapture(_) => "advanced-capture",
            ChannelEvent::QueuedBufferCount(_) => "queued-buffer-count",
            ChannelEvent::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelReply {
    Done,
    Stream(StreamId),
    Streams(Vec<StreamId>),
    Count(u32),
}

enum Member {
    Owned(Arc<Stream>),
    Linked(Arc<Stream>),
}

impl Member {
    fn stream(&self) -> &Arc<Stream> {
        match self {
            Member::Owned(s) | Member::Linked(s) => s,
        }
    }

    fn is_metadata(&self) -> bool {
        self.stream().stream_type() == Some(StreamType::Metadata)
    }
}

/// Everything that only exists while the channel is active.
struct ActiveParts {
    queue: Arc<Mutex<SuperbufQueue>>,
    matcher: CommandWorker<MatchCommand>,
    dispatcher: CommandWorker<Bundle>,
}

struct ChannelInner {
    state: ChannelState,
    members: Vec<Member>,
    active: Option<ActiveParts>,
}

pub struct Channel {
    id: ChannelId,
    source: Arc<dyn BufferSource>,
    snapshot: Option<Arc<dyn SnapshotControl>>,
    callback: BundleCallback,
    attr: BundleAttr,
    max_streams: usize,
    stats: Arc<ChannelStats>,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    pub fn new(
        id: ChannelId,
        config: &ChannelConfig,
        source: Arc<dyn BufferSource>,
        callback: BundleCallback,
    ) -> Self {
        Self {
            id,
            source,
            snapshot: None,
            callback,
            attr: config.bundle,
            max_streams: config.max_streams,
            stats: Arc::new(ChannelStats::new(id.to_string())),
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Stopped,
                members: Vec::new(),
                active: None,
            }),
        }
    }

    /// Backend used to start and stop opportunistic snapshot capture.
    pub fn with_snapshot_control(mut self, snapshot: Arc<dyn SnapshotControl>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_bundle_attr(mut self, attr: BundleAttr) -> Self {
        self.attr = attr;
        self
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner).state
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        lock(&self.inner)
            .members
            .iter()
            .map(Member::stream)
            .find(|s| s.id() == id)
            .cloned()
    }

    /// Frame ids currently held by the superbuf queue, in queue order.
    pub fn queued_frame_ids(&self) -> Option<Vec<u32>> {
        lock(&self.inner)
            .active
            .as_ref()
            .map(|a| lock(&a.queue).frame_ids())
    }

    pub fn handle_event(&self, evt: ChannelEvent) -> Result<ChannelReply> {
        let mut inner = lock(&self.inner);
        let state = inner.state;
        let event = evt.name();

        let result = match (state, evt) {
            (ChannelState::Stopped, ChannelEvent::AddStream) => {
                self.add_stream(&mut inner).map(ChannelReply::Stream)
            }
            (ChannelState::Stopped, ChannelEvent::LinkStream(stream)) => {
                self.link_stream(&mut inner, stream).map(ChannelReply::Stream)
            }
            (ChannelState::Stopped, ChannelEvent::DeleteStream(id)) => {
                self.delete_stream(&mut inner, id).map(|_| ChannelReply::Done)
            }
            (ChannelState::Stopped, ChannelEvent::ConfigureStream { stream, config }) => {
                match inner.members.iter().find(|m| m.stream().id() == stream) {
                    Some(Member::Owned(s)) => s.configure(config).map(|_| ChannelReply::Done),
                    Some(Member::Linked(_)) => Err(Error::invalid(state.name(), event)),
                    None => Err(Error::UnknownStream(stream)),
                }
            }
            (ChannelState::Stopped, ChannelEvent::GetBundleInfo) => Ok(ChannelReply::Streams(
                inner
                    .members
                    .iter()
                    .filter(|m| matches!(m, Member::Owned(_)) && !m.is_metadata())
                    .map(|m| m.stream().id())
                    .collect(),
            )),
            (ChannelState::Stopped, ChannelEvent::Start) => {
                self.start(&mut inner).map(|_| ChannelReply::Done)
            }
            (ChannelState::Stopped, ChannelEvent::Delete) => {
                for member in inner.members.drain(..) {
                    if let Member::Owned(s) = member {
                        s.teardown();
                        if let Err(e) = s.release() {
                            warn!(channel = %self.id, stream = %s.id(), "release failed: {e}");
                        }
                    }
                }
                inner.state = ChannelState::NotUsed;
                info!(channel = %self.id, "channel deleted");
                Ok(ChannelReply::Done)
            }
            (ChannelState::Stopped | ChannelState::Active, ChannelEvent::QueuedBufferCount(id)) => {
                match inner.members.iter().find(|m| m.stream().id() == id) {
                    Some(m) => m.stream().queued_buffer_count().map(ChannelReply::Count),
                    None => Err(Error::UnknownStream(id)),
                }
            }
            (ChannelState::Active, ChannelEvent::Stop) => {
                self.stop(&mut inner);
                Ok(ChannelReply::Done)
            }
            (ChannelState::Active, ChannelEvent::RequestSuperBuf(n)) => {
                post(&inner, MatchCommand::Request(n))
            }
            (ChannelState::Active, ChannelEvent::CancelRequest) => {
                post(&inner, MatchCommand::Request(0))
            }
            (ChannelState::Active, ChannelEvent::FlushQueue(frame_idx)) => {
                post(&inner, MatchCommand::FlushQueue(frame_idx))
            }
            (ChannelState::Active, ChannelEvent::ConfigNotify(mode)) => {
                post(&inner, MatchCommand::ConfigNotify(mode))
            }
            (ChannelState::Active, ChannelEvent::StartZslSnapshot) => {
                post(&inner, MatchCommand::StartZsl)
            }
            (ChannelState::Active, ChannelEvent::StopZslSnapshot) => {
                post(&inner, MatchCommand::StopZsl)
            }
            (ChannelState::Active, ChannelEvent::AdvancedCapture(advanced)) => {
                post(&inner, MatchCommand::Advanced(advanced))
            }
            (state, _) => Err(Error::invalid(state.name(), event)),
        };

        if let Err(e) = &result {
            warn!(channel = %self.id, state = %state, event, "{e}");
        }
        result
    }

    pub fn add_stream_handle(&self) -> Result<StreamId> {
        match self.handle_event(ChannelEvent::AddStream)? {
            ChannelReply::Stream(id) => Ok(id),
            _ => Err(Error::invalid(self.state().name(), "add-stream")),
        }
    }

    pub fn link(&self, stream: Arc<Stream>) -> Result<StreamId> {
        match self.handle_event(ChannelEvent::LinkStream(stream))? {
            ChannelReply::Stream(id) => Ok(id),
            _ => Err(Error::invalid(self.state().name(), "link-stream")),
        }
    }

    pub fn configure_stream(&self, stream: StreamId, config: StreamConfig) -> Result<()> {
        self.handle_event(ChannelEvent::ConfigureStream { stream, config })
            .map(drop)
    }

    pub fn bundle_info(&self) -> Result<Vec<StreamId>> {
        match self.handle_event(ChannelEvent::GetBundleInfo)? {
            ChannelReply::Streams(ids) => Ok(ids),
            _ => Err(Error::invalid(self.state().name(), "get-bundle-info")),
        }
    }

    pub fn start_bundle(&self) -> Result<()> {
        self.handle_event(ChannelEvent::Start).map(drop)
    }

    pub fn stop_bundle(&self) -> Result<()> {
        self.handle_event(ChannelEvent::Stop).map(drop)
    }

    pub fn request_super_buf(&self, count: u32) -> Result<()> {
        self.handle_event(ChannelEvent::RequestSuperBuf(count))
            .map(drop)
    }

    pub fn cancel_super_buf_request(&self) -> Result<()> {
        self.handle_event(ChannelEvent::CancelRequest).map(drop)
    }

    pub fn flush_queue(&self, frame_idx: u32) -> Result<()> {
        self.handle_event(ChannelEvent::FlushQueue(frame_idx))
            .map(drop)
    }

    pub fn queued_buffer_count(&self, stream: StreamId) -> Result<u32> {
        match self.handle_event(ChannelEvent::QueuedBufferCount(stream))? {
            ChannelReply::Count(n) => Ok(n),
            _ => Err(Error::invalid(self.state().name(), "queued-buffer-count")),
        }
    }

    fn add_stream(&self, inner: &mut ChannelInner) -> Result<StreamId> {
        if inner.members.len() >= self.max_streams {
            return Err(Error::StreamLimit);
        }
        // lowest index no member holds; ids of deleted streams come back
        let id = (0..=0xff)
            .map(|index| StreamId::new(self.id, index))
            .find(|id| !inner.members.iter().any(|m| m.stream().id() == *id))
            .ok_or(Error::StreamLimit)?;
        let stream = Stream::new(id, self.source.clone());
        stream.acquire()?;
        inner.members.push(Member::Owned(stream));
        debug!(channel = %self.id, stream = %id, "stream added");
        Ok(id)
    }

    fn link_stream(&self, inner: &mut ChannelInner, stream: Arc<Stream>) -> Result<StreamId> {
        let id = stream.id();
        if inner.members.iter().any(|m| m.stream().id() == id) {
            return Ok(id);
        }
        if inner.members.len() >= self.max_streams {
            return Err(Error::StreamLimit);
        }
        inner.members.push(Member::Linked(stream));
        debug!(channel = %self.id, stream = %id, "stream linked");
        Ok(id)
    }

    fn delete_stream(&self, inner: &mut ChannelInner, id: StreamId) -> Result<()> {
        let pos = inner
            .members
            .iter()
            .position(|m| m.stream().id() == id)
            .ok_or(Error::UnknownStream(id))?;
        if let Member::Owned(s) = &inner.members[pos] {
            s.teardown();
            s.release()?;
        }
        inner.members.remove(pos);
        debug!(channel = %self.id, stream = %id, "stream deleted");
        Ok(())
    }

    /// Metadata first, so hints are in place before the first image frame.
    fn start_order(members: &[Member]) -> Vec<&Member> {
        let mut ordered: Vec<&Member> = members.iter().collect();
        ordered.sort_by_key(|m| !m.is_metadata());
        ordered
    }

    #[instrument(skip_all, fields(channel = %self.id))]
    fn start(&self, inner: &mut ChannelInner) -> Result<()> {
        let ordered = Self::start_order(&inner.members);
        let slots: Vec<StreamId> = ordered.iter().map(|m| m.stream().id()).collect();
        let metadata_stream = ordered
            .iter()
            .find(|m| matches!(m, Member::Owned(_)) && m.is_metadata())
            .map(|m| m.stream().id());

        let queue = Arc::new(Mutex::new(SuperbufQueue::new(
            self.id,
            slots,
            metadata_stream,
            self.attr,
            self.stats.clone(),
        )));
        let mut dispatcher = CommandWorker::spawn(
            "bundle-dispatch",
            Dispatcher::new(self.callback.clone(), self.stats.clone()),
        )?;
        let mut matcher = CommandWorker::spawn(
            "bundle-match",
            Matcher::new(
                self.id,
                queue.clone(),
                dispatcher.handle(),
                self.snapshot.clone(),
            ),
        )?;

        let handle = matcher.handle();
        let sink = Arc::new(FrameSink::new(self.id.to_string(), move |rec| {
            handle.submit(MatchCommand::Buffer(rec))
        }));

        for (i, member) in ordered.iter().enumerate() {
            let started = match member {
                Member::Linked(s) => {
                    s.set_linked_sink(Some(sink.clone()));
                    Ok(())
                }
                Member::Owned(s) => {
                    s.set_bundle_sink(Some(sink.clone()));
                    s.get_buffers()
                        .and_then(|_| s.register_buffers())
                        .and_then(|_| s.start())
                }
            };

            if let Err(e) = started {
                let stream = member.stream().id();
                warn!(%stream, "stream failed to start, rolling back: {e}");
                for done in &ordered[..=i] {
                    match done {
                        Member::Linked(s) => s.set_linked_sink(None),
                        Member::Owned(s) => {
                            s.set_bundle_sink(None);
                            s.teardown();
                        }
                    }
                }
                matcher.shutdown();
                dispatcher.shutdown();
                lock(&queue).flush();
                return Err(Error::StreamStartFailed {
                    stream,
                    reason: e.to_string(),
                });
            }
        }

        inner.active = Some(ActiveParts {
            queue,
            matcher,
            dispatcher,
        });
        inner.state = ChannelState::Active;
        info!(streams = inner.members.len(), "channel started");
        Ok(())
    }

    #[instrument(skip_all, fields(channel = %self.id))]
    fn stop(&self, inner: &mut ChannelInner) {
        for member in &inner.members {
            match member {
                Member::Owned(s) => s.set_bundle_sink(None),
                Member::Linked(s) => s.set_linked_sink(None),
            }
        }

        if let Some(mut active) = inner.active.take() {
            active.matcher.shutdown();
            active.dispatcher.shutdown();
            // streams are still on, so flushed buffers go back to the hardware
            lock(&active.queue).flush();
        }

        let mut ordered = Self::start_order(&inner.members);
        ordered.reverse();
        for member in ordered {
            if let Member::Owned(s) = member {
                s.teardown();
            }
        }

        inner.state = ChannelState::Stopped;
        info!("channel stopped");
    }
}

fn post(inner: &ChannelInner, cmd: MatchCommand) -> Result<ChannelReply> {
    let active = inner
        .active
        .as_ref()
        .ok_or(Error::invalid(inner.state.name(), "post"))?;
    active.matcher.submit(cmd)?;
    Ok(ChannelReply::Done)
}

impl Drop for Channel {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        if inner.state == ChannelState::Active {
            self.stop(&mut inner);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
