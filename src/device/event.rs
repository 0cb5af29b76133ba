//! Requests, events and notifications exchanged with the device state machine.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use bytes::Bytes;

use crate::capture::PrepSnapshotState;
use crate::pipeline::Bundle;
use crate::Error;

/// Message classes a client can subscribe to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MsgType(u32);

impl MsgType {
    pub const ERROR: Self = Self(0x0001);
    pub const SHUTTER: Self = Self(0x0002);
    pub const FOCUS: Self = Self(0x0004);
    pub const ZOOM: Self = Self(0x0008);
    pub const PREVIEW_FRAME: Self = Self(0x0010);
    pub const VIDEO_FRAME: Self = Self(0x0020);
    pub const POSTVIEW_FRAME: Self = Self(0x0040);
    pub const RAW_IMAGE: Self = Self(0x0080);
    pub const COMPRESSED_IMAGE: Self = Self(0x0100);
    pub const RAW_IMAGE_NOTIFY: Self = Self(0x0200);
    pub const PREVIEW_METADATA: Self = Self(0x0400);
    pub const FOCUS_MOVE: Self = Self(0x0800);
    pub const ALL: Self = Self(0xffff);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set. An empty mask is never contained.
    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for MsgType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Opaque handle of a display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusState {
    Focused,
    NotFocused,
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThermalLevel {
    Normal,
    Light,
    Moderate,
    Critical,
}

/// Vendor commands passed through `send-command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenericCommand {
    LongshotOn,
    LongshotOff,
    Other { cmd: i32, arg1: i32, arg2: i32 },
}

/// Asynchronous messages to the client.
#[derive(Debug, Clone)]
pub enum Notification {
    Error(Error),
    Shutter,
    Focus(FocusState),
    Zoom { level: u32 },
    Faces { count: u32 },
    CompressedImage(Bytes),
}

pub type NotifyCallback = Arc<dyn Fn(Notification) + Send + Sync>;

/// Synchronous API calls. Each one gets exactly one [`ApiResult`] or error.
pub enum ApiRequest {
    SetPreviewWindow(Option<WindowId>),
    SetCallbacks(Option<NotifyCallback>),
    EnableMsgType(MsgType),
    DisableMsgType(MsgType),
    MsgTypeEnabled(MsgType),
    SetParameters(String),
    GetParameters,
    PutParameters(String),
    StartPreview,
    StartNoDisplayPreview,
    StopPreview,
    PreviewEnabled,
    StoreMetadataInBuffers(bool),
    StartRecording,
    StopRecording,
    RecordingEnabled,
    ReleaseRecordingFrame(u64),
    PrepareSnapshot,
    TakePicture,
    CancelPicture,
    StartAutoFocus,
    StopAutoFocus,
    SendCommand(GenericCommand),
    RegisterFaceImage(Bytes),
    Release,
    Dump,
}

impl ApiRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ApiRequest::SetPreviewWindow(_) => "set-preview-window",
            ApiRequest::SetCallbacks(_) => "set-callbacks",
            ApiRequest::EnableMsgType(_) => "enable-msg-type",
            ApiRequest::DisableMsgType(_) => "disable-msg-type",
            ApiRequest::MsgTypeEnabled(_) => "msg-type-enabled",
            ApiRequest::SetParameters(_) => "set-parameters",
            ApiRequest::GetParameters => "get-parameters",
            ApiRequest::PutParameters(_) => "put-parameters",
            ApiRequest::StartPreview => "start-preview",
            ApiRequest::StartNoDisplayPreview => "start-no-display-preview",
            ApiRequest::StopPreview => "stop-preview",
            ApiRequest::PreviewEnabled => "preview-enabled",
            ApiRequest::StoreMetadataInBuffers(_) => "store-metadata-in-buffers",
            ApiRequest::StartRecording => "start-recording",
            ApiRequest::StopRecording => "stop-recording",
            ApiRequest::RecordingEnabled => "recording-enabled",
            ApiRequest::ReleaseRecordingFrame(_) => "release-recording-frame",
            ApiRequest::PrepareSnapshot => "prepare-snapshot",
            ApiRequest::TakePicture => "take-picture",
            ApiRequest::CancelPicture => "cancel-picture",
            ApiRequest::StartAutoFocus => "start-auto-focus",
            ApiRequest::StopAutoFocus => "stop-auto-focus",
            ApiRequest::SendCommand(_) => "send-command",
            ApiRequest::RegisterFaceImage(_) => "register-face-image",
            ApiRequest::Release => "release",
            ApiRequest::Dump => "dump",
        }
    }
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiResult {
    Done,
    Enabled(bool),
    Parameters(String),
    Handle(u64),
}

#[derive(Debug)]
pub enum InternalEvent {
    FocusUpdate(FocusState),
    PrepSnapshotDone(PrepSnapshotState),
    FaceDetection { faces: u32 },
    Histogram(Vec<u32>),
    CropInfo { zoom: u32 },
    AsdUpdate { scene: u32 },
    AwbUpdate { cct: u32 },
}

/// Asynchronous input from the hardware, the encoder and the channels.
#[derive(Debug)]
pub enum DeviceEvent {
    Internal(InternalEvent),
    DaemonDied,
    ReprocessStageDone,
    /// `None` when encoding failed.
    JpegDone(Option<Bytes>),
    SnapshotDone,
    Thermal(ThermalLevel),
    StopCaptureChannel,
    BundleReady(Bundle),
}

impl DeviceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceEvent::Internal(InternalEvent::FocusUpdate(_)) => "focus-update",
            DeviceEvent::Internal(InternalEvent::PrepSnapshotDone(_)) => "prep-snapshot-done",
            DeviceEvent::Internal(InternalEvent::FaceDetection { .. }) => "face-detection",
            DeviceEvent::Internal(InternalEvent::Histogram(_)) => "histogram",
            DeviceEvent::Internal(InternalEvent::CropInfo { .. }) => "crop-info",
            DeviceEvent::Internal(InternalEvent::AsdUpdate { .. }) => "asd-update",
            DeviceEvent::Internal(InternalEvent::AwbUpdate { .. }) => "awb-update",
            DeviceEvent::DaemonDied => "daemon-died",
            DeviceEvent::ReprocessStageDone => "reprocess-stage-done",
            DeviceEvent::JpegDone(_) => "jpeg-done",
            DeviceEvent::SnapshotDone => "snapshot-done",
            DeviceEvent::Thermal(_) => "thermal",
            DeviceEvent::StopCaptureChannel => "stop-capture-channel",
            DeviceEvent::BundleReady(_) => "bundle-ready",
        }
    }
}
