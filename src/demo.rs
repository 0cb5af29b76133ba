//! Hardware glue for the demo binary: a preview channel and a ZSL snapshot
//! channel over one virtual source.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use bundlecore::capture::{
    ChannelId, PixelFormat, StreamConfig, StreamId, StreamType, VirtualSource,
};
use bundlecore::channel::{Channel, ChannelState};
use bundlecore::device::{DeviceEvent, EventSender, HardwareOps};
use bundlecore::pipeline::{Bundle, BundleAttr, NotifyMode};
use bundlecore::{Config, Error, Result};

const PREVIEW_CHANNEL: ChannelId = ChannelId(0);
const SNAPSHOT_CHANNEL: ChannelId = ChannelId(1);

pub struct DemoHardware {
    source: Arc<VirtualSource>,
    preview: Arc<Channel>,
    snapshot: Arc<Channel>,
    snapshot_stream: StreamId,
    events: EventSender,
    fps: u32,
    burst: u32,
    /// Snapshot bundles still expected for the running capture
    remaining: u32,
    preview_frames: u64,
}

/// Channel handles for reporting after the device owns the hardware.
pub struct Channels {
    pub preview: Arc<Channel>,
    pub snapshot: Arc<Channel>,
}

impl DemoHardware {
    pub fn new(config: &Config, source: Arc<VirtualSource>, events: EventSender) -> Result<Self> {
        let sim = &config.simulation;
        let callback = events.bundle_callback();

        let preview_attr = BundleAttr {
            notify_mode: NotifyMode::Continuous,
            ..config.channel.bundle
        };
        let preview = Arc::new(
            Channel::new(PREVIEW_CHANNEL, &config.channel, source.clone(), callback.clone())
                .with_bundle_attr(preview_attr),
        );
        let snapshot = Arc::new(
            Channel::new(SNAPSHOT_CHANNEL, &config.channel, source.clone(), callback)
                .with_snapshot_control(source.clone()),
        );

        let image = |stream_type| StreamConfig {
            stream_type,
            width: sim.width,
            height: sim.height,
            format: sim.format,
            buffer_count: sim.buffer_count,
        };

        let preview_stream = preview.add_stream_handle()?;
        preview.configure_stream(preview_stream, image(StreamType::Preview))?;

        let metadata_stream = snapshot.add_stream_handle()?;
        snapshot.configure_stream(
            metadata_stream,
            StreamConfig {
                stream_type: StreamType::Metadata,
                width: 256,
                height: 1,
                format: PixelFormat::Blob,
                buffer_count: sim.buffer_count,
            },
        )?;
        let snapshot_stream = snapshot.add_stream_handle()?;
        snapshot.configure_stream(snapshot_stream, image(StreamType::Snapshot))?;

        let shared = preview
            .stream(preview_stream)
            .ok_or(Error::UnknownStream(preview_stream))?;
        snapshot.link(shared)?;

        Ok(Self {
            source,
            preview,
            snapshot,
            snapshot_stream,
            events,
            fps: sim.fps,
            burst: sim.burst.max(1),
            remaining: 0,
            preview_frames: 0,
        })
    }

    pub fn channels(&self) -> Channels {
        Channels {
            preview: self.preview.clone(),
            snapshot: self.snapshot.clone(),
        }
    }

    fn stop_channels(&mut self) {
        self.source.stop_pacing();
        for channel in [&self.snapshot, &self.preview] {
            if channel.state() == ChannelState::Active {
                if let Err(e) = channel.stop_bundle() {
                    warn!(channel = %channel.id(), "stop failed: {e}");
                }
            }
        }
    }

    fn on_snapshot(&mut self, bundle: Bundle) -> Result<()> {
        if self.remaining == 0 {
            debug!(frame_idx = bundle.frame_idx, "unsolicited snapshot bundle");
            return Ok(());
        }
        self.remaining -= 1;
        info!(
            frame_idx = bundle.frame_idx,
            streams = bundle.len(),
            remaining = self.remaining,
            "snapshot bundle"
        );

        // stand-in for the encoder
        let image = bundle
            .buffer(self.snapshot_stream)
            .map(|rec| rec.frame().data.clone())
            .unwrap_or_else(Bytes::new);
        drop(bundle);
        self.events.post(DeviceEvent::JpegDone(Some(image)))?;
        if self.remaining == 0 {
            self.events.post(DeviceEvent::SnapshotDone)?;
        }
        Ok(())
    }
}

impl HardwareOps for DemoHardware {
    fn prepare_preview(&mut self) -> Result<()> {
        self.preview.start_bundle()?;
        if let Err(e) = self.snapshot.start_bundle() {
            self.stop_channels();
            return Err(e);
        }
        Ok(())
    }

    fn unprepare_preview(&mut self) {
        self.stop_channels();
    }

    fn start_preview(&mut self) -> Result<()> {
        self.source.start_pacing(self.fps)
    }

    fn stop_preview(&mut self) -> Result<()> {
        self.stop_channels();
        info!(frames = self.preview_frames, "preview stopped");
        Ok(())
    }

    fn start_recording(&mut self) -> Result<()> {
        Err(Error::Hardware("no video stream configured".into()))
    }

    fn stop_recording(&mut self) -> Result<()> {
        Ok(())
    }

    fn take_picture(&mut self) -> Result<()> {
        self.remaining = self.burst;
        self.snapshot.request_super_buf(self.burst)
    }

    fn cancel_picture(&mut self) -> Result<()> {
        self.remaining = 0;
        if self.snapshot.state() == ChannelState::Active {
            self.snapshot.cancel_super_buf_request()?;
        }
        Ok(())
    }

    fn is_zsl_mode(&self) -> bool {
        true
    }

    fn process_bundle(&mut self, bundle: Bundle) -> Result<()> {
        match bundle.channel {
            SNAPSHOT_CHANNEL => self.on_snapshot(bundle),
            _ => {
                self.preview_frames += 1;
                if self.preview_frames % u64::from(self.fps.max(1)) == 0 {
                    debug!(frames = self.preview_frames, frame_idx = bundle.frame_idx, "preview");
                }
                Ok(())
            }
        }
    }
}
