//! The device-wide state machine, run on the device worker thread.
//!
//! Every (state, request) and (state, event) pair lands in an explicit match
//! arm. Arms that do not apply answer `InvalidOperation`; an API caller is
//! always answered, the only deferred answer being prepare-snapshot, which
//! completes when the hardware reports the preparation done.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::atomic::AtomicCell;
use tracing::{debug, error, info, trace, warn};

use super::event::{
    ApiRequest, ApiResult, DeviceEvent, GenericCommand, InternalEvent, MsgType, Notification,
    NotifyCallback, WindowId,
};
use super::ops::HardwareOps;
use crate::worker::CommandHandler;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    /// Preview prepared, waiting for a display window
    PreviewReady,
    Previewing,
    /// Waiting for the hardware to finish preparing a snapshot
    PreparingCapture,
    /// Non-ZSL capture, preview stopped
    Capturing,
    Recording,
    RecordingCapturing,
    PreviewCapturing,
}

impl DeviceState {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceState::Idle => "idle",
            DeviceState::PreviewReady => "preview-ready",
            DeviceState::Previewing => "previewing",
            DeviceState::PreparingCapture => "preparing-capture",
            DeviceState::Capturing => "capturing",
            DeviceState::Recording => "recording",
            DeviceState::RecordingCapturing => "recording-capturing",
            DeviceState::PreviewCapturing => "preview-capturing",
        }
    }

    pub fn is_preview_running(&self) -> bool {
        matches!(
            self,
            DeviceState::Previewing
                | DeviceState::PreparingCapture
                | DeviceState::Recording
                | DeviceState::RecordingCapturing
                | DeviceState::PreviewCapturing
        )
    }

    pub fn is_capture_running(&self) -> bool {
        matches!(
            self,
            DeviceState::Capturing | DeviceState::RecordingCapturing | DeviceState::PreviewCapturing
        )
    }

    fn is_recording(&self) -> bool {
        matches!(self, DeviceState::Recording | DeviceState::RecordingCapturing)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State readable from any thread without going through the worker.
pub(crate) struct SharedState {
    pub(crate) state: AtomicCell<DeviceState>,
    pub(crate) dead: AtomicBool,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            state: AtomicCell::new(DeviceState::Idle),
            dead: AtomicBool::new(false),
        }
    }
}

pub(crate) type Reply = flume::Sender<Result<ApiResult>>;

pub(crate) enum DeviceCommand {
    /// Travels on the high lane.
    Api { request: ApiRequest, reply: Reply },
    Event(DeviceEvent),
}

pub(crate) struct StateMachine<H: HardwareOps> {
    ops: H,
    state: DeviceState,
    shared: Arc<SharedState>,
    callbacks: Option<NotifyCallback>,
    msg_enabled: MsgType,
    window: Option<WindowId>,
    pending_prepare: Option<Reply>,
    dead: bool,
}

fn done() -> Result<ApiResult> {
    Ok(ApiResult::Done)
}

impl<H: HardwareOps> StateMachine<H> {
    pub(crate) fn new(ops: H, shared: Arc<SharedState>) -> Self {
        Self {
            ops,
            state: DeviceState::Idle,
            shared,
            callbacks: None,
            msg_enabled: MsgType::empty(),
            window: None,
            pending_prepare: None,
            dead: false,
        }
    }

    fn set_state(&mut self, next: DeviceState) {
        if next != self.state {
            info!(from = %self.state, to = %next, "device state");
            self.state = next;
            self.shared.state.store(next);
        }
    }

    fn invalid(&self, event: &'static str) -> Error {
        Error::invalid(self.state.name(), event)
    }

    fn notify(&self, msg: MsgType, notification: Notification) {
        if !self.msg_enabled.contains(msg) {
            return;
        }
        if let Some(cb) = &self.callbacks {
            cb(notification);
        }
    }

    fn on_api(&mut self, request: ApiRequest, reply: Reply) {
        let name = request.name();
        if self.dead && !matches!(request, ApiRequest::Release) {
            let _ = reply.send(Err(Error::Fatal("camera daemon died".into())));
            return;
        }

        let prepare = matches!(request, ApiRequest::PrepareSnapshot);
        let result = match self.state {
            DeviceState::Idle => self.api_idle(request),
            DeviceState::PreviewReady => self.api_preview_ready(request),
            DeviceState::Previewing => self.api_previewing(request),
            DeviceState::PreparingCapture => Err(self.invalid(name)),
            DeviceState::Capturing => self.api_capturing(request),
            DeviceState::Recording => self.api_recording(request),
            DeviceState::RecordingCapturing => self.api_recording_capturing(request),
            DeviceState::PreviewCapturing => self.api_preview_capturing(request),
        };

        match &result {
            Ok(_) => debug!(api = name, state = %self.state, "api done"),
            Err(e) => warn!(api = name, state = %self.state, "api failed: {e}"),
        }

        if prepare && result.is_ok() && self.state == DeviceState::PreparingCapture {
            self.pending_prepare = Some(reply);
            return;
        }
        // the caller may have timed out and gone away
        let _ = reply.send(result);
    }

    /// Requests answered the same way in every state that does not
    /// special-case them.
    fn common_api(&mut self, request: ApiRequest) -> Result<ApiResult> {
        match request {
            ApiRequest::SetCallbacks(callbacks) => {
                self.callbacks = callbacks;
                done()
            }
            ApiRequest::EnableMsgType(msg) => {
                self.msg_enabled.insert(msg);
                done()
            }
            ApiRequest::DisableMsgType(msg) => {
                self.msg_enabled.remove(msg);
                done()
            }
            ApiRequest::MsgTypeEnabled(msg) => Ok(ApiResult::Enabled(self.msg_enabled.contains(msg))),
            ApiRequest::SetParameters(params) => {
                self.ops.update_parameters(&params)?;
                self.ops.commit_parameters()?;
                done()
            }
            ApiRequest::GetParameters => Ok(ApiResult::Parameters(self.ops.parameters())),
            ApiRequest::PutParameters(params) => self.ops.put_parameters(params).and_then(|_| done()),
            ApiRequest::PreviewEnabled => Ok(ApiResult::Enabled(
                self.state.is_preview_running() || self.state == DeviceState::PreviewReady,
            )),
            ApiRequest::RecordingEnabled => Ok(ApiResult::Enabled(self.state.is_recording())),
            ApiRequest::StoreMetadataInBuffers(enable) => {
                self.ops.store_metadata_in_buffers(enable)?;
                done()
            }
            ApiRequest::StartAutoFocus => self.ops.auto_focus().and_then(|_| done()),
            ApiRequest::StopAutoFocus => self.ops.cancel_auto_focus().and_then(|_| done()),
            ApiRequest::SendCommand(cmd) => self.ops.send_command(&cmd).and_then(|_| done()),
            ApiRequest::RegisterFaceImage(image) => {
                self.ops.register_face_image(&image).map(ApiResult::Handle)
            }
            ApiRequest::Dump => self.ops.dump().and_then(|_| done()),
            other => Err(self.invalid(other.name())),
        }
    }

    /// Prepare and start the preview; falls back to idle on failure.
    fn restart_preview(&mut self) -> Result<()> {
        let started = self
            .ops
            .prepare_preview()
            .and_then(|_| self.ops.start_preview());
        if let Err(e) = started {
            self.ops.unprepare_preview();
            self.set_state(DeviceState::Idle);
            return Err(e);
        }
        Ok(())
    }

    fn api_idle(&mut self, request: ApiRequest) -> Result<ApiResult> {
        match request {
            ApiRequest::SetPreviewWindow(window) => {
                self.ops.set_preview_window(window)?;
                self.window = window;
                done()
            }
            ApiRequest::StartPreview if self.window.is_none() => {
                self.ops.prepare_preview()?;
                self.set_state(DeviceState::PreviewReady);
                done()
            }
            ApiRequest::StartPreview | ApiRequest::StartNoDisplayPreview => {
                self.restart_preview()?;
                self.set_state(DeviceState::Previewing);
                done()
            }
            ApiRequest::StopPreview | ApiRequest::StartAutoFocus | ApiRequest::CancelPicture => done(),
            ApiRequest::Release => self.ops.release().and_then(|_| done()),
            ApiRequest::StartRecording
            | ApiRequest::StopRecording
            | ApiRequest::ReleaseRecordingFrame(_)
            | ApiRequest::PrepareSnapshot
            | ApiRequest::TakePicture => Err(self.invalid(request.name())),
            other => self.common_api(other),
        }
    }

    fn api_preview_ready(&mut self, request: ApiRequest) -> Result<ApiResult> {
        match request {
            ApiRequest::SetPreviewWindow(window) => {
                self.ops.set_preview_window(window)?;
                self.window = window;
                if window.is_some() {
                    if let Err(e) = self.ops.start_preview() {
                        self.ops.unprepare_preview();
                        self.set_state(DeviceState::Idle);
                        return Err(e);
                    }
                    self.set_state(DeviceState::Previewing);
                }
                done()
            }
            ApiRequest::SetParameters(params) => {
                if self.ops.update_parameters(&params)? {
                    self.ops.unprepare_preview();
                    self.ops.commit_parameters()?;
                    if let Err(e) = self.ops.prepare_preview() {
                        self.set_state(DeviceState::Idle);
                        return Err(e);
                    }
                } else {
                    self.ops.commit_parameters()?;
                }
                done()
            }
            ApiRequest::StartPreview => done(),
            ApiRequest::StopPreview => {
                self.ops.unprepare_preview();
                self.set_state(DeviceState::Idle);
                done()
            }
            ApiRequest::StartNoDisplayPreview
            | ApiRequest::StartRecording
            | ApiRequest::StopRecording
            | ApiRequest::PrepareSnapshot
            | ApiRequest::TakePicture
            | ApiRequest::CancelPicture
            | ApiRequest::ReleaseRecordingFrame(_)
            | ApiRequest::Release => Err(self.invalid(request.name())),
            other => self.common_api(other),
        }
    }

    fn api_previewing(&mut self, request: ApiRequest) -> Result<ApiResult> {
        match request {
            ApiRequest::SetParameters(params) => {
                if self.ops.update_parameters(&params)? {
                    self.ops.stop_preview()?;
                    self.ops.commit_parameters()?;
                    self.restart_preview()?;
                } else {
                    self.ops.commit_parameters()?;
                }
                done()
            }
            ApiRequest::StartPreview | ApiRequest::StartNoDisplayPreview => done(),
            ApiRequest::StopPreview => {
                let stopped = self.ops.stop_preview();
                self.set_state(DeviceState::Idle);
                stopped.and_then(|_| done())
            }
            ApiRequest::StartRecording => {
                self.ops.start_recording()?;
                self.set_state(DeviceState::Recording);
                done()
            }
            ApiRequest::PrepareSnapshot => {
                self.ops.prepare_for_snapshot()?;
                self.set_state(DeviceState::PreparingCapture);
                done()
            }
            ApiRequest::TakePicture => {
                if self.ops.recording_hint() {
                    self.set_state(DeviceState::PreviewCapturing);
                    if let Err(e) = self.ops.take_live_snapshot() {
                        self.set_state(DeviceState::Previewing);
                        return Err(e);
                    }
                } else if self.ops.is_zsl_mode() || self.ops.is_longshot_enabled() {
                    self.set_state(DeviceState::PreviewCapturing);
                    if let Err(e) = self.ops.take_picture() {
                        self.set_state(DeviceState::Previewing);
                        return Err(e);
                    }
                } else {
                    self.set_state(DeviceState::Capturing);
                    if let Err(e) = self.ops.take_picture() {
                        self.set_state(DeviceState::Idle);
                        return Err(e);
                    }
                }
                done()
            }
            ApiRequest::SendCommand(cmd) => {
                if self.ops.send_command(&cmd)? {
                    self.ops.stop_preview()?;
                    self.restart_preview()?;
                }
                done()
            }
            ApiRequest::SetPreviewWindow(_)
            | ApiRequest::CancelPicture
            | ApiRequest::StopRecording
            | ApiRequest::ReleaseRecordingFrame(_)
            | ApiRequest::Release => Err(self.invalid(request.name())),
            other => self.common_api(other),
        }
    }

    fn api_capturing(&mut self, request: ApiRequest) -> Result<ApiResult> {
        match request {
            ApiRequest::StopPreview | ApiRequest::CancelPicture => {
                let cancelled = self.ops.cancel_picture();
                self.set_state(DeviceState::Idle);
                cancelled.and_then(|_| done())
            }
            ApiRequest::SendCommand(cmd) => {
                self.ops.send_command(&cmd)?;
                if cmd == GenericCommand::LongshotOff {
                    self.set_state(DeviceState::Previewing);
                }
                done()
            }
            ApiRequest::TakePicture if self.ops.is_longshot_enabled() => {
                self.ops.long_shot().and_then(|_| done())
            }
            ApiRequest::SetPreviewWindow(_)
            | ApiRequest::TakePicture
            | ApiRequest::PrepareSnapshot
            | ApiRequest::StartRecording
            | ApiRequest::StopRecording
            | ApiRequest::ReleaseRecordingFrame(_)
            | ApiRequest::StartPreview
            | ApiRequest::StartNoDisplayPreview
            | ApiRequest::Release => Err(self.invalid(request.name())),
            other => self.common_api(other),
        }
    }

    fn api_recording(&mut self, request: ApiRequest) -> Result<ApiResult> {
        match request {
            // a preview restart request during recording is accepted and ignored
            ApiRequest::StartPreview | ApiRequest::SetPreviewWindow(_) => done(),
            ApiRequest::StartRecording => done(),
            ApiRequest::TakePicture => {
                self.set_state(DeviceState::RecordingCapturing);
                if let Err(e) = self.ops.take_live_snapshot() {
                    self.set_state(DeviceState::Recording);
                    return Err(e);
                }
                done()
            }
            ApiRequest::StopRecording => {
                let stopped = self.ops.stop_recording();
                self.set_state(DeviceState::Previewing);
                stopped.and_then(|_| done())
            }
            ApiRequest::StopPreview => {
                let recording = self.ops.stop_recording();
                let preview = self.ops.stop_preview();
                self.set_state(DeviceState::Idle);
                recording.and(preview).and_then(|_| done())
            }
            ApiRequest::ReleaseRecordingFrame(handle) => {
                self.ops.release_recording_frame(handle).and_then(|_| done())
            }
            ApiRequest::PrepareSnapshot => self.ops.prepare_for_snapshot().and_then(|_| done()),
            ApiRequest::CancelPicture | ApiRequest::StartNoDisplayPreview | ApiRequest::Release => {
                Err(self.invalid(request.name()))
            }
            other => self.common_api(other),
        }
    }

    fn api_recording_capturing(&mut self, request: ApiRequest) -> Result<ApiResult> {
        match request {
            ApiRequest::StopRecording => {
                let cancelled = self.ops.cancel_live_snapshot();
                let stopped = self.ops.stop_recording();
                self.set_state(DeviceState::Previewing);
                cancelled.and(stopped).and_then(|_| done())
            }
            ApiRequest::CancelPicture => {
                let cancelled = self.ops.cancel_live_snapshot();
                self.set_state(DeviceState::Recording);
                cancelled.and_then(|_| done())
            }
            ApiRequest::StopPreview => {
                let cancelled = self.ops.cancel_live_snapshot();
                let recording = self.ops.stop_recording();
                let preview = self.ops.stop_preview();
                self.set_state(DeviceState::Idle);
                cancelled.and(recording).and(preview).and_then(|_| done())
            }
            ApiRequest::ReleaseRecordingFrame(handle) => {
                self.ops.release_recording_frame(handle).and_then(|_| done())
            }
            ApiRequest::SetPreviewWindow(_)
            | ApiRequest::StartRecording
            | ApiRequest::StartPreview
            | ApiRequest::StartNoDisplayPreview
            | ApiRequest::PrepareSnapshot
            | ApiRequest::TakePicture
            | ApiRequest::Release => Err(self.invalid(request.name())),
            other => self.common_api(other),
        }
    }

    /// Cancel whichever kind of capture runs beside the preview.
    fn cancel_preview_capture(&mut self) -> Result<()> {
        if self.ops.is_zsl_mode() || self.ops.is_longshot_enabled() {
            self.ops.cancel_picture()
        } else {
            self.ops.cancel_live_snapshot()
        }
    }

    fn api_preview_capturing(&mut self, request: ApiRequest) -> Result<ApiResult> {
        match request {
            ApiRequest::StopPreview => {
                let cancelled = self.cancel_preview_capture();
                let stopped = self.ops.stop_preview();
                self.set_state(DeviceState::Idle);
                cancelled.and(stopped).and_then(|_| done())
            }
            ApiRequest::CancelPicture => {
                let cancelled = self.cancel_preview_capture();
                self.set_state(DeviceState::Previewing);
                cancelled.and_then(|_| done())
            }
            ApiRequest::SendCommand(cmd) => {
                self.ops.send_command(&cmd)?;
                if cmd == GenericCommand::LongshotOff {
                    self.set_state(DeviceState::Previewing);
                }
                done()
            }
            ApiRequest::StartRecording
                if !self.ops.is_zsl_mode() && !self.ops.is_longshot_enabled() =>
            {
                self.ops.start_recording()?;
                self.set_state(DeviceState::RecordingCapturing);
                done()
            }
            ApiRequest::TakePicture if self.ops.is_longshot_enabled() => {
                self.ops.long_shot().and_then(|_| done())
            }
            ApiRequest::ReleaseRecordingFrame(handle) => {
                self.ops.release_recording_frame(handle).and_then(|_| done())
            }
            ApiRequest::SetPreviewWindow(_)
            | ApiRequest::StartRecording
            | ApiRequest::TakePicture
            | ApiRequest::StartPreview
            | ApiRequest::StartNoDisplayPreview
            | ApiRequest::PrepareSnapshot
            | ApiRequest::StopRecording
            | ApiRequest::Release => Err(self.invalid(request.name())),
            other => self.common_api(other),
        }
    }

    fn on_event(&mut self, evt: DeviceEvent) -> Result<()> {
        let name = evt.name();
        match (self.state, evt) {
            (_, DeviceEvent::DaemonDied) => {
                self.daemon_died();
                Ok(())
            }
            (state, DeviceEvent::BundleReady(bundle))
                if state.is_preview_running() || state.is_capture_running() =>
            {
                self.ops.process_bundle(bundle)
            }
            (_, DeviceEvent::BundleReady(bundle)) => {
                trace!(frame_idx = bundle.frame_idx, "late bundle dropped");
                Ok(())
            }
            (DeviceState::PreparingCapture, DeviceEvent::Internal(InternalEvent::PrepSnapshotDone(s))) => {
                let processed = self.ops.process_prep_snapshot_done(s);
                self.set_state(DeviceState::Previewing);
                if let Some(reply) = self.pending_prepare.take() {
                    let _ = reply.send(processed.clone().map(|_| ApiResult::Done));
                }
                processed
            }
            (_, DeviceEvent::Internal(InternalEvent::PrepSnapshotDone(_))) => {
                debug!(state = %self.state, "prep-snapshot-done outside a prepare, ignored");
                Ok(())
            }
            (state, DeviceEvent::Internal(internal))
                if state.is_preview_running() || state.is_capture_running() =>
            {
                self.on_internal(internal)
            }
            (
                DeviceState::Capturing | DeviceState::RecordingCapturing | DeviceState::PreviewCapturing,
                DeviceEvent::JpegDone(image),
            ) => self.on_jpeg(image),
            (DeviceState::Capturing | DeviceState::PreviewCapturing, DeviceEvent::ReprocessStageDone) => {
                if self.ops.is_longshot_enabled() {
                    self.ops.play_shutter();
                    self.notify(MsgType::SHUTTER, Notification::Shutter);
                }
                Ok(())
            }
            (DeviceState::Capturing, DeviceEvent::StopCaptureChannel) => {
                let restart = self.ops.is_preview_restart_enabled();
                self.ops.stop_capture_channel(restart)?;
                if restart {
                    self.ops.prepare_preview()?;
                    self.ops.start_preview()?;
                }
                Ok(())
            }
            (DeviceState::Capturing, DeviceEvent::SnapshotDone) => {
                let cancelled = self.ops.cancel_picture();
                if self.ops.is_preview_restart_enabled() {
                    self.set_state(DeviceState::Previewing);
                } else {
                    self.set_state(DeviceState::Idle);
                }
                cancelled
            }
            (DeviceState::RecordingCapturing, DeviceEvent::SnapshotDone) => {
                let cancelled = self.ops.cancel_live_snapshot();
                self.set_state(DeviceState::Recording);
                cancelled
            }
            (DeviceState::PreviewCapturing, DeviceEvent::SnapshotDone) => {
                let cancelled = self.cancel_preview_capture();
                self.set_state(DeviceState::Previewing);
                cancelled
            }
            (state, DeviceEvent::Thermal(level))
                if state != DeviceState::PreviewReady && state != DeviceState::PreparingCapture =>
            {
                self.ops.update_thermal_level(level)
            }
            (state, _) => Err(Error::invalid(state.name(), name)),
        }
    }

    fn on_internal(&mut self, internal: InternalEvent) -> Result<()> {
        match internal {
            InternalEvent::FocusUpdate(state) => {
                self.ops.process_focus(state)?;
                self.notify(MsgType::FOCUS, Notification::Focus(state));
            }
            InternalEvent::FaceDetection { faces } => {
                self.ops.process_face_detection(faces)?;
                self.notify(MsgType::PREVIEW_METADATA, Notification::Faces { count: faces });
            }
            InternalEvent::Histogram(bins) => self.ops.process_histogram(&bins)?,
            InternalEvent::CropInfo { zoom } => {
                self.ops.process_zoom(zoom)?;
                self.notify(MsgType::ZOOM, Notification::Zoom { level: zoom });
            }
            InternalEvent::AsdUpdate { scene } => self.ops.process_asd(scene)?,
            InternalEvent::AwbUpdate { cct } => self.ops.process_awb(cct)?,
            InternalEvent::PrepSnapshotDone(_) => {}
        }
        Ok(())
    }

    fn on_jpeg(&mut self, image: Option<Bytes>) -> Result<()> {
        self.ops.process_jpeg(image.as_ref())?;
        match image {
            Some(data) => self.notify(MsgType::COMPRESSED_IMAGE, Notification::CompressedImage(data)),
            None => self.notify(
                MsgType::ERROR,
                Notification::Error(Error::Hardware("jpeg encoding failed".into())),
            ),
        }
        Ok(())
    }

    /// Best-effort stop of everything the current state keeps running.
    fn teardown(&mut self) {
        let steps: Vec<(&str, Result<()>)> = match self.state {
            DeviceState::Idle => Vec::new(),
            DeviceState::PreviewReady => {
                self.ops.unprepare_preview();
                Vec::new()
            }
            DeviceState::Previewing | DeviceState::PreparingCapture => {
                vec![("stop-preview", self.ops.stop_preview())]
            }
            DeviceState::Capturing => vec![("cancel-picture", self.ops.cancel_picture())],
            DeviceState::Recording => vec![
                ("stop-recording", self.ops.stop_recording()),
                ("stop-preview", self.ops.stop_preview()),
            ],
            DeviceState::RecordingCapturing => vec![
                ("cancel-live-snapshot", self.ops.cancel_live_snapshot()),
                ("stop-recording", self.ops.stop_recording()),
                ("stop-preview", self.ops.stop_preview()),
            ],
            DeviceState::PreviewCapturing => vec![
                ("cancel-picture", self.cancel_preview_capture()),
                ("stop-preview", self.ops.stop_preview()),
            ],
        };
        for (step, result) in steps {
            if let Err(e) = result {
                warn!(step, state = %self.state, "teardown failed: {e}");
            }
        }
    }

    fn daemon_died(&mut self) {
        error!(state = %self.state, "camera daemon died");
        self.dead = true;
        self.teardown();
        self.set_state(DeviceState::Idle);
        let fatal = Error::Fatal("camera daemon died".into());
        if let Some(reply) = self.pending_prepare.take() {
            let _ = reply.send(Err(fatal.clone()));
        }
        // delivered whatever the message mask says
        if let Some(cb) = &self.callbacks {
            cb(Notification::Error(fatal));
        }
        self.shared.dead.store(true, Ordering::Release);
    }
}

impl<H: HardwareOps> CommandHandler<DeviceCommand> for StateMachine<H> {
    fn handle(&mut self, cmd: DeviceCommand) {
        match cmd {
            DeviceCommand::Api { request, reply } => self.on_api(request, reply),
            DeviceCommand::Event(evt) => {
                let name = evt.name();
                if let Err(e) = self.on_event(evt) {
                    warn!(event = name, state = %self.state, "event failed: {e}");
                }
            }
        }
    }

    fn discard(&mut self, cmd: DeviceCommand) {
        if let DeviceCommand::Api { request, reply } = cmd {
            debug!(api = request.name(), "device closing, request dropped");
            let _ = reply.send(Err(Error::WorkerStopped("device")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ChannelId, PrepSnapshotState};
    use crate::device::event::{FocusState, ThermalLevel};
    use crate::pipeline::Bundle;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockOps {
        log: Arc<Mutex<Vec<&'static str>>>,
        zsl: bool,
        fail_start_preview: bool,
    }

    impl MockOps {
        fn push(&self, op: &'static str) {
            self.log.lock().unwrap().push(op);
        }
    }

    impl HardwareOps for MockOps {
        fn prepare_preview(&mut self) -> Result<()> {
            self.push("prepare");
            Ok(())
        }
        fn unprepare_preview(&mut self) {
            self.push("unprepare");
        }
        fn start_preview(&mut self) -> Result<()> {
            self.push("start-preview");
            if self.fail_start_preview {
                return Err(Error::Hardware("no sensor".into()));
            }
            Ok(())
        }
        fn stop_preview(&mut self) -> Result<()> {
            self.push("stop-preview");
            Ok(())
        }
        fn start_recording(&mut self) -> Result<()> {
            self.push("start-recording");
            Ok(())
        }
        fn stop_recording(&mut self) -> Result<()> {
            self.push("stop-recording");
            Ok(())
        }
        fn take_picture(&mut self) -> Result<()> {
            self.push("take-picture");
            Ok(())
        }
        fn cancel_picture(&mut self) -> Result<()> {
            self.push("cancel-picture");
            Ok(())
        }
        fn is_zsl_mode(&self) -> bool {
            self.zsl
        }
        fn process_focus(&mut self, _state: FocusState) -> Result<()> {
            self.push("focus");
            Ok(())
        }
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn machine(ops: MockOps) -> (StateMachine<MockOps>, Arc<SharedState>, Log) {
        let log = ops.log.clone();
        let shared = Arc::new(SharedState::default());
        (StateMachine::new(ops, shared.clone()), shared, log)
    }

    fn call(sm: &mut StateMachine<MockOps>, request: ApiRequest) -> Result<ApiResult> {
        let (tx, rx) = flume::bounded(1);
        sm.handle(DeviceCommand::Api { request, reply: tx });
        rx.try_recv().unwrap()
    }

    fn to_previewing(sm: &mut StateMachine<MockOps>) {
        call(sm, ApiRequest::StartNoDisplayPreview).unwrap();
        assert_eq!(sm.state, DeviceState::Previewing);
    }

    const STATES: [DeviceState; 8] = [
        DeviceState::Idle,
        DeviceState::PreviewReady,
        DeviceState::Previewing,
        DeviceState::PreparingCapture,
        DeviceState::Capturing,
        DeviceState::Recording,
        DeviceState::RecordingCapturing,
        DeviceState::PreviewCapturing,
    ];

    /// A machine driven into `state` through the public requests.
    fn machine_in(state: DeviceState) -> StateMachine<MockOps> {
        let (mut sm, _, _) = machine(MockOps {
            zsl: state == DeviceState::PreviewCapturing,
            ..Default::default()
        });
        match state {
            DeviceState::Idle => {}
            DeviceState::PreviewReady => {
                call(&mut sm, ApiRequest::StartPreview).unwrap();
            }
            DeviceState::Previewing => to_previewing(&mut sm),
            DeviceState::PreparingCapture => {
                to_previewing(&mut sm);
                let (tx, _rx) = flume::bounded(1);
                sm.handle(DeviceCommand::Api {
                    request: ApiRequest::PrepareSnapshot,
                    reply: tx,
                });
            }
            DeviceState::Capturing | DeviceState::PreviewCapturing => {
                to_previewing(&mut sm);
                call(&mut sm, ApiRequest::TakePicture).unwrap();
            }
            DeviceState::Recording => {
                to_previewing(&mut sm);
                call(&mut sm, ApiRequest::StartRecording).unwrap();
            }
            DeviceState::RecordingCapturing => {
                to_previewing(&mut sm);
                call(&mut sm, ApiRequest::StartRecording).unwrap();
                call(&mut sm, ApiRequest::TakePicture).unwrap();
            }
        }
        assert_eq!(sm.state, state);
        sm
    }

    fn every_request() -> Vec<ApiRequest> {
        vec![
            ApiRequest::SetPreviewWindow(Some(WindowId(1))),
            ApiRequest::SetCallbacks(None),
            ApiRequest::EnableMsgType(MsgType::FOCUS),
            ApiRequest::DisableMsgType(MsgType::FOCUS),
            ApiRequest::MsgTypeEnabled(MsgType::FOCUS),
            ApiRequest::SetParameters("zoom=2".into()),
            ApiRequest::GetParameters,
            ApiRequest::PutParameters(String::new()),
            ApiRequest::StartPreview,
            ApiRequest::StartNoDisplayPreview,
            ApiRequest::StopPreview,
            ApiRequest::PreviewEnabled,
            ApiRequest::StoreMetadataInBuffers(true),
            ApiRequest::StartRecording,
            ApiRequest::StopRecording,
            ApiRequest::RecordingEnabled,
            ApiRequest::ReleaseRecordingFrame(3),
            ApiRequest::PrepareSnapshot,
            ApiRequest::TakePicture,
            ApiRequest::CancelPicture,
            ApiRequest::StartAutoFocus,
            ApiRequest::StopAutoFocus,
            ApiRequest::SendCommand(GenericCommand::Other {
                cmd: 1,
                arg1: 0,
                arg2: 0,
            }),
            ApiRequest::RegisterFaceImage(Bytes::new()),
            ApiRequest::Release,
            ApiRequest::Dump,
        ]
    }

    fn every_event() -> Vec<DeviceEvent> {
        vec![
            DeviceEvent::Internal(InternalEvent::FocusUpdate(FocusState::Focused)),
            DeviceEvent::Internal(InternalEvent::PrepSnapshotDone(
                PrepSnapshotState::NoFutureFrame,
            )),
            DeviceEvent::Internal(InternalEvent::FaceDetection { faces: 2 }),
            DeviceEvent::Internal(InternalEvent::Histogram(vec![0; 4])),
            DeviceEvent::Internal(InternalEvent::CropInfo { zoom: 3 }),
            DeviceEvent::Internal(InternalEvent::AsdUpdate { scene: 1 }),
            DeviceEvent::Internal(InternalEvent::AwbUpdate { cct: 5000 }),
            DeviceEvent::DaemonDied,
            DeviceEvent::ReprocessStageDone,
            DeviceEvent::JpegDone(None),
            DeviceEvent::SnapshotDone,
            DeviceEvent::Thermal(ThermalLevel::Moderate),
            DeviceEvent::StopCaptureChannel,
            DeviceEvent::BundleReady(Bundle {
                channel: ChannelId(0),
                frame_idx: 1,
                buffers: Vec::new(),
            }),
        ]
    }

    #[test]
    fn test_every_request_gets_one_reply_in_every_state() {
        for state in STATES {
            for request in every_request() {
                let name = request.name();
                let mut sm = machine_in(state);
                let (tx, rx) = flume::unbounded();
                sm.handle(DeviceCommand::Api { request, reply: tx });
                let replies: Vec<_> = rx.try_iter().collect();

                if state == DeviceState::Previewing && name == "prepare-snapshot" {
                    assert!(replies.is_empty(), "prepare answered before done");
                    assert_eq!(sm.state, DeviceState::PreparingCapture);
                    continue;
                }
                assert_eq!(replies.len(), 1, "{name} in {state}");
                if let Err(Error::InvalidOperation { .. }) = &replies[0] {
                    assert_eq!(sm.state, state, "rejected {name} moved {state}");
                }
            }
        }
    }

    #[test]
    fn test_every_event_in_every_state() {
        for state in STATES {
            for evt in every_event() {
                let name = evt.name();
                let mut sm = machine_in(state);
                let result = sm.on_event(evt);

                if let Err(Error::InvalidOperation { .. }) = &result {
                    assert_eq!(sm.state, state, "rejected {name} moved {state}");
                }
                if name == "daemon-died" {
                    assert_eq!(sm.state, DeviceState::Idle);
                }
                if name == "focus-update" && state.is_preview_running() {
                    assert_eq!(result, Ok(()), "focus update refused in {state}");
                }
            }
        }
    }

    #[test]
    fn test_focus_update_while_preparing_capture() {
        let mut sm = machine_in(DeviceState::PreparingCapture);
        assert_eq!(
            sm.on_event(DeviceEvent::Internal(InternalEvent::FocusUpdate(
                FocusState::Focused
            ))),
            Ok(())
        );
        assert_eq!(sm.state, DeviceState::PreparingCapture);
        assert_eq!(sm.ops.log.lock().unwrap().last(), Some(&"focus"));
    }

    #[test]
    fn test_daemon_died_stops_running_hardware() {
        let cases = [
            (DeviceState::PreviewReady, vec!["unprepare"]),
            (DeviceState::PreparingCapture, vec!["stop-preview"]),
            (DeviceState::Capturing, vec!["cancel-picture"]),
            (
                DeviceState::RecordingCapturing,
                vec!["cancel-picture", "stop-recording", "stop-preview"],
            ),
            (DeviceState::PreviewCapturing, vec!["cancel-picture", "stop-preview"]),
        ];
        for (state, expected) in cases {
            let mut sm = machine_in(state);
            let log = sm.ops.log.clone();
            log.lock().unwrap().clear();

            sm.on_event(DeviceEvent::DaemonDied).unwrap();
            assert_eq!(*log.lock().unwrap(), expected, "teardown from {state}");
            assert_eq!(sm.state, DeviceState::Idle);

            // nothing left to stop on release
            call(&mut sm, ApiRequest::Release).unwrap();
            assert_eq!(*log.lock().unwrap(), expected);
        }
    }

    #[test]
    fn test_preview_waits_for_window() {
        let (mut sm, shared, log) = machine(MockOps::default());

        call(&mut sm, ApiRequest::StartPreview).unwrap();
        assert_eq!(shared.state.load(), DeviceState::PreviewReady);
        assert_eq!(
            call(&mut sm, ApiRequest::PreviewEnabled).unwrap(),
            ApiResult::Enabled(true)
        );

        call(&mut sm, ApiRequest::SetPreviewWindow(Some(WindowId(7)))).unwrap();
        assert_eq!(shared.state.load(), DeviceState::Previewing);

        call(&mut sm, ApiRequest::StopPreview).unwrap();
        assert_eq!(shared.state.load(), DeviceState::Idle);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["prepare", "start-preview", "stop-preview"]
        );
    }

    #[test]
    fn test_failed_preview_start_unprepares() {
        let (mut sm, _, log) = machine(MockOps {
            fail_start_preview: true,
            ..Default::default()
        });

        let err = call(&mut sm, ApiRequest::StartNoDisplayPreview).unwrap_err();
        assert_eq!(err, Error::Hardware("no sensor".into()));
        assert_eq!(sm.state, DeviceState::Idle);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["prepare", "start-preview", "unprepare"]
        );
    }

    #[test]
    fn test_invalid_api_leaves_state() {
        let (mut sm, _, _) = machine(MockOps::default());
        assert_eq!(
            call(&mut sm, ApiRequest::TakePicture),
            Err(Error::invalid("idle", "take-picture"))
        );
        assert_eq!(sm.state, DeviceState::Idle);

        to_previewing(&mut sm);
        assert_eq!(
            call(&mut sm, ApiRequest::Release),
            Err(Error::invalid("previewing", "release"))
        );
        assert_eq!(sm.state, DeviceState::Previewing);
    }

    #[test]
    fn test_prepare_snapshot_reply_deferred() {
        let (mut sm, _, _) = machine(MockOps::default());
        to_previewing(&mut sm);

        let (tx, rx) = flume::bounded(1);
        sm.handle(DeviceCommand::Api {
            request: ApiRequest::PrepareSnapshot,
            reply: tx,
        });
        assert_eq!(sm.state, DeviceState::PreparingCapture);
        assert!(rx.try_recv().is_err());

        assert_eq!(
            call(&mut sm, ApiRequest::TakePicture),
            Err(Error::invalid("preparing-capture", "take-picture"))
        );

        sm.handle(DeviceCommand::Event(DeviceEvent::Internal(
            InternalEvent::PrepSnapshotDone(PrepSnapshotState::NoFutureFrame),
        )));
        assert_eq!(rx.try_recv().unwrap(), Ok(ApiResult::Done));
        assert_eq!(sm.state, DeviceState::Previewing);
    }

    #[test]
    fn test_daemon_died_fails_pending_and_later_calls() {
        let (mut sm, shared, _) = machine(MockOps::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: NotifyCallback = Arc::new(move |n| sink.lock().unwrap().push(n));
        call(&mut sm, ApiRequest::SetCallbacks(Some(cb))).unwrap();
        to_previewing(&mut sm);

        let (tx, rx) = flume::bounded(1);
        sm.handle(DeviceCommand::Api {
            request: ApiRequest::PrepareSnapshot,
            reply: tx,
        });
        sm.handle(DeviceCommand::Event(DeviceEvent::DaemonDied));

        assert!(rx.try_recv().unwrap().unwrap_err().is_fatal());
        assert_eq!(shared.state.load(), DeviceState::Idle);
        assert!(shared.dead.load(Ordering::Acquire));
        // error notifications bypass the message mask
        assert!(matches!(
            seen.lock().unwrap().as_slice(),
            [Notification::Error(Error::Fatal(_))]
        ));

        assert!(call(&mut sm, ApiRequest::StartPreview).unwrap_err().is_fatal());
        assert_eq!(call(&mut sm, ApiRequest::Release), Ok(ApiResult::Done));
    }

    #[test]
    fn test_non_zsl_capture_round_trip() {
        let (mut sm, _, log) = machine(MockOps::default());
        to_previewing(&mut sm);

        call(&mut sm, ApiRequest::TakePicture).unwrap();
        assert_eq!(sm.state, DeviceState::Capturing);
        assert!(sm.state.is_capture_running());
        assert!(!sm.state.is_preview_running());

        sm.handle(DeviceCommand::Event(DeviceEvent::SnapshotDone));
        assert_eq!(sm.state, DeviceState::Previewing);
        assert_eq!(log.lock().unwrap().last(), Some(&"cancel-picture"));
    }

    #[test]
    fn test_zsl_capture_keeps_preview() {
        let (mut sm, _, _) = machine(MockOps {
            zsl: true,
            ..Default::default()
        });
        to_previewing(&mut sm);

        call(&mut sm, ApiRequest::TakePicture).unwrap();
        assert_eq!(sm.state, DeviceState::PreviewCapturing);
        assert!(sm.state.is_preview_running());

        // recording is refused while a zsl capture runs
        assert_eq!(
            call(&mut sm, ApiRequest::StartRecording),
            Err(Error::invalid("preview-capturing", "start-recording"))
        );
        call(&mut sm, ApiRequest::CancelPicture).unwrap();
        assert_eq!(sm.state, DeviceState::Previewing);
    }

    #[test]
    fn test_recording_live_snapshot() {
        let (mut sm, _, log) = machine(MockOps::default());
        to_previewing(&mut sm);
        call(&mut sm, ApiRequest::StartRecording).unwrap();
        assert_eq!(
            call(&mut sm, ApiRequest::RecordingEnabled),
            Ok(ApiResult::Enabled(true))
        );

        call(&mut sm, ApiRequest::TakePicture).unwrap();
        assert_eq!(sm.state, DeviceState::RecordingCapturing);
        sm.handle(DeviceCommand::Event(DeviceEvent::SnapshotDone));
        assert_eq!(sm.state, DeviceState::Recording);

        call(&mut sm, ApiRequest::StopRecording).unwrap();
        assert_eq!(sm.state, DeviceState::Previewing);
        assert_eq!(log.lock().unwrap().last(), Some(&"stop-recording"));
    }

    #[test]
    fn test_jpeg_notification_respects_mask() {
        let (mut sm, _, _) = machine(MockOps::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: NotifyCallback = Arc::new(move |n| sink.lock().unwrap().push(n));
        call(&mut sm, ApiRequest::SetCallbacks(Some(cb))).unwrap();
        to_previewing(&mut sm);
        call(&mut sm, ApiRequest::TakePicture).unwrap();

        sm.handle(DeviceCommand::Event(DeviceEvent::JpegDone(Some(
            Bytes::from_static(b"jpeg"),
        ))));
        assert!(seen.lock().unwrap().is_empty());

        call(&mut sm, ApiRequest::EnableMsgType(MsgType::COMPRESSED_IMAGE)).unwrap();
        sm.handle(DeviceCommand::Event(DeviceEvent::JpegDone(Some(
            Bytes::from_static(b"jpeg"),
        ))));
        assert!(matches!(
            seen.lock().unwrap().as_slice(),
            [Notification::CompressedImage(data)] if *data == b"jpeg"[..]
        ));
    }

    #[test]
    fn test_event_in_wrong_state_is_rejected() {
        let (mut sm, _, log) = machine(MockOps::default());
        assert_eq!(
            sm.on_event(DeviceEvent::SnapshotDone),
            Err(Error::invalid("idle", "snapshot-done"))
        );
        assert_eq!(
            sm.on_event(DeviceEvent::Thermal(ThermalLevel::Critical)),
            Ok(())
        );
        assert_eq!(sm.state, DeviceState::Idle);
        assert!(log.lock().unwrap().is_empty());
    }
}
