//! The two per-channel workers: the matcher feeds the superbuf queue and
//! decides what to deliver, the dispatcher runs the bundle callback.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace, warn};

use super::{AdvancedCapture, BundleCallback};
use crate::capture::{BufferRecord, ChannelId, SnapshotControl};
use crate::pipeline::{Bundle, ChannelStats, NotifyMode, SuperbufQueue};
use crate::utils::lock;
use crate::worker::{CommandHandler, WorkerHandle};

/// Work items for the matching worker.
#[derive(Debug)]
pub(crate) enum MatchCommand {
    Buffer(BufferRecord),
    /// Deliver this many bundles. Zero cancels an outstanding request.
    Request(u32),
    FlushQueue(u32),
    ConfigNotify(NotifyMode),
    StartZsl,
    StopZsl,
    Advanced(AdvancedCapture),
}

pub(crate) struct Matcher {
    channel: ChannelId,
    queue: Arc<Mutex<SuperbufQueue>>,
    dispatch: WorkerHandle<Bundle>,
    snapshot: Option<Arc<dyn SnapshotControl>>,
    pending: u32,
    zsl_started: bool,
    zsl_manual: bool,
}

impl Matcher {
    pub(crate) fn new(
        channel: ChannelId,
        queue: Arc<Mutex<SuperbufQueue>>,
        dispatch: WorkerHandle<Bundle>,
        snapshot: Option<Arc<dyn SnapshotControl>>,
    ) -> Self {
        Self {
            channel,
            queue,
            dispatch,
            snapshot,
            pending: 0,
            zsl_started: false,
            zsl_manual: false,
        }
    }

    fn start_zsl(&self) {
        match &self.snapshot {
            Some(snapshot) => {
                if let Err(e) = snapshot.start_zsl_snapshot() {
                    warn!(channel = %self.channel, "start zsl snapshot failed: {e}");
                }
            }
            None => debug!(channel = %self.channel, "no snapshot control, zsl start ignored"),
        }
    }

    fn stop_zsl(&self) {
        if let Some(snapshot) = &self.snapshot {
            if let Err(e) = snapshot.stop_zsl_snapshot() {
                warn!(channel = %self.channel, "stop zsl snapshot failed: {e}");
            }
        }
    }
}

impl CommandHandler<MatchCommand> for Matcher {
    fn handle(&mut self, cmd: MatchCommand) {
        let mut queue = lock(&self.queue);

        match cmd {
            MatchCommand::Buffer(rec) => {
                let outcome = queue.enqueue(rec);
                trace!(channel = %self.channel, ?outcome, "enqueue");
            }
            MatchCommand::Request(n) => {
                self.pending = n;
                queue.skip_to_look_back();

                let flags = *queue.flags();
                if self.pending > 0
                    && (flags.need_led_flash || flags.bracketing_3a)
                    && !self.zsl_manual
                    && !self.zsl_started
                {
                    info!(channel = %self.channel, "flash or bracketing needed, start zsl snapshot");
                    self.start_zsl();
                    self.zsl_started = true;
                    queue.flags_mut().need_led_flash = false;
                } else if self.pending == 0 && self.zsl_started && !self.zsl_manual {
                    info!(channel = %self.channel, "request cancelled, stop zsl snapshot");
                    self.stop_zsl();
                    self.zsl_started = false;
                    let flags = queue.flags_mut();
                    flags.need_led_flash = false;
                    flags.bracketing_3a = false;
                }
            }
            MatchCommand::StartZsl => {
                self.zsl_manual = true;
                self.start_zsl();
            }
            MatchCommand::StopZsl => {
                self.zsl_manual = false;
                self.stop_zsl();
            }
            MatchCommand::ConfigNotify(mode) => queue.set_notify_mode(mode),
            MatchCommand::FlushQueue(frame_idx) => {
                queue.flush_up_to(frame_idx);
                return;
            }
            MatchCommand::Advanced(advanced) => {
                queue.flush();
                let flags = queue.flags_mut();
                match advanced {
                    AdvancedCapture::AeBracketing(on)
                    | AdvancedCapture::AfBracketing(on)
                    | AdvancedCapture::MtfBracketing(on) => flags.bracketing_3a = on,
                    AdvancedCapture::FlashBracketing(on) => flags.flash_bracketing = on,
                    AdvancedCapture::Zoom1x(on) => flags.zoom_1x_requested = on,
                }
                debug!(channel = %self.channel, ?advanced, "advanced capture");
            }
        }

        queue.release_overflow();

        let continuous = queue.attr().notify_mode == NotifyMode::Continuous;
        while self.pending > 0 || continuous {
            let Some(bundle) = queue.dequeue_matched() else {
                break;
            };
            if !continuous {
                self.pending -= 1;
                if self.pending == 0 && self.zsl_started && !self.zsl_manual {
                    info!(channel = %self.channel, "received all requested frames, stop zsl snapshot");
                    self.stop_zsl();
                    self.zsl_started = false;
                }
            }
            trace!(channel = %self.channel, frame_idx = bundle.frame_idx, pending = self.pending, "dispatch");
            // a refused bundle is dropped inside submit and its buffers go home
            if let Err(e) = self.dispatch.submit(bundle) {
                debug!(channel = %self.channel, "bundle not dispatched: {e}");
            }
        }
    }
}

/// Runs the user callback, one bundle at a time, off the matching thread.
pub(crate) struct Dispatcher {
    callback: BundleCallback,
    stats: Arc<ChannelStats>,
}

impl Dispatcher {
    pub(crate) fn new(callback: BundleCallback, stats: Arc<ChannelStats>) -> Self {
        Self { callback, stats }
    }
}

impl CommandHandler<Bundle> for Dispatcher {
    fn handle(&mut self, bundle: Bundle) {
        self.stats.bundles_delivered(1);
        (self.callback)(bundle);
    }

    fn discard(&mut self, bundle: Bundle) {
        trace!(channel = %bundle.channel, frame_idx = bundle.frame_idx, "bundle dropped on stop");
        bundle.release();
    }
}
