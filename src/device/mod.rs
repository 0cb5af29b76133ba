//! Device layer: a single worker thread owns the hardware and serializes
//! synchronous API calls (high lane) against asynchronous events (normal lane).

pub mod event;
pub mod ops;
mod state_machine;

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::{debug, info};

pub use event::{
    ApiRequest, ApiResult, DeviceEvent, FocusState, GenericCommand, InternalEvent, MsgType,
    Notification, NotifyCallback, ThermalLevel, WindowId,
};
pub use ops::HardwareOps;
pub use state_machine::DeviceState;

use crate::channel::BundleCallback;
use crate::config::DeviceConfig;
use crate::worker::{CommandWorker, Lane, WorkerHandle};
use crate::{Error, Result};
use state_machine::{DeviceCommand, SharedState, StateMachine};

const WORKER_NAME: &str = "device";

/// Posts asynchronous events into a device. Handed to the hardware while it
/// is built, so channels can be wired to report bundles back.
#[derive(Clone, Default)]
pub struct EventSender {
    worker: Arc<ArcSwapOption<WorkerHandle<DeviceCommand>>>,
}

impl EventSender {
    pub fn post(&self, evt: DeviceEvent) -> Result<()> {
        match self.worker.load_full() {
            Some(handle) => handle.submit_to(Lane::Normal, DeviceCommand::Event(evt)),
            None => Err(Error::WorkerStopped(WORKER_NAME)),
        }
    }

    /// A channel callback turning every bundle into a `BundleReady` event.
    pub fn bundle_callback(&self) -> BundleCallback {
        let sender = self.clone();
        Arc::new(move |bundle| {
            if let Err(e) = sender.post(DeviceEvent::BundleReady(bundle)) {
                debug!("bundle not posted to device: {e}");
            }
        })
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("attached", &self.worker.load().is_some())
            .finish()
    }
}

pub struct Device {
    worker: CommandWorker<DeviceCommand>,
    events: EventSender,
    shared: Arc<SharedState>,
    timeout: Option<Duration>,
}

impl Device {
    /// Builds the hardware with an event sender wired to this device, then
    /// starts the state machine thread in `Idle`.
    pub fn new<H, F>(config: &DeviceConfig, build: F) -> Result<Self>
    where
        H: HardwareOps,
        F: FnOnce(EventSender) -> Result<H>,
    {
        let events = EventSender::default();
        let ops = build(events.clone())?;

        let shared = Arc::new(SharedState::default());
        let worker = CommandWorker::spawn(WORKER_NAME, StateMachine::new(ops, shared.clone()))?;
        events.worker.store(Some(Arc::new(worker.handle())));

        let timeout = (config.api_timeout_ms > 0).then(|| Duration::from_millis(config.api_timeout_ms));
        info!(?timeout, "device opened");
        Ok(Self {
            worker,
            events,
            shared,
            timeout,
        })
    }

    /// Runs one API request on the state machine and waits for its answer.
    pub fn call(&self, request: ApiRequest) -> Result<ApiResult> {
        let (reply, rx) = flume::bounded(1);
        self.worker
            .submit_to(Lane::High, DeviceCommand::Api { request, reply })?;
        match self.timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                flume::RecvTimeoutError::Timeout => Error::Timeout,
                flume::RecvTimeoutError::Disconnected => Error::WorkerStopped(WORKER_NAME),
            })?,
            None => rx.recv().map_err(|_| Error::WorkerStopped(WORKER_NAME))?,
        }
    }

    pub fn post_event(&self, evt: DeviceEvent) -> Result<()> {
        self.events.post(evt)
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn state(&self) -> DeviceState {
        self.shared.state.load()
    }

    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Acquire)
    }

    pub fn is_preview_ready(&self) -> bool {
        self.state() == DeviceState::PreviewReady
    }

    pub fn is_preview_running(&self) -> bool {
        self.state().is_preview_running()
    }

    pub fn is_capture_running(&self) -> bool {
        self.state().is_capture_running()
    }

    pub fn is_non_zsl_capture_running(&self) -> bool {
        self.state() == DeviceState::Capturing
    }

    fn run(&self, request: ApiRequest) -> Result<()> {
        self.call(request).map(|_| ())
    }

    fn enabled(&self, request: ApiRequest) -> Result<bool> {
        match self.call(request)? {
            ApiResult::Enabled(on) => Ok(on),
            other => Err(Error::Hardware(format!("unexpected reply {other:?}"))),
        }
    }

    pub fn set_callbacks(&self, callbacks: Option<NotifyCallback>) -> Result<()> {
        self.run(ApiRequest::SetCallbacks(callbacks))
    }

    pub fn enable_msg_type(&self, msg: MsgType) -> Result<()> {
        self.run(ApiRequest::EnableMsgType(msg))
    }

    pub fn disable_msg_type(&self, msg: MsgType) -> Result<()> {
        self.run(ApiRequest::DisableMsgType(msg))
    }

    pub fn msg_type_enabled(&self, msg: MsgType) -> Result<bool> {
        self.enabled(ApiRequest::MsgTypeEnabled(msg))
    }

    pub fn set_preview_window(&self, window: Option<WindowId>) -> Result<()> {
        self.run(ApiRequest::SetPreviewWindow(window))
    }

    pub fn set_parameters(&self, params: impl Into<String>) -> Result<()> {
        self.run(ApiRequest::SetParameters(params.into()))
    }

    pub fn parameters(&self) -> Result<String> {
        match self.call(ApiRequest::GetParameters)? {
            ApiResult::Parameters(params) => Ok(params),
            other => Err(Error::Hardware(format!("unexpected reply {other:?}"))),
        }
    }

    pub fn start_preview(&self) -> Result<()> {
        self.run(ApiRequest::StartPreview)
    }

    pub fn start_no_display_preview(&self) -> Result<()> {
        self.run(ApiRequest::StartNoDisplayPreview)
    }

    pub fn stop_preview(&self) -> Result<()> {
        self.run(ApiRequest::StopPreview)
    }

    pub fn preview_enabled(&self) -> Result<bool> {
        self.enabled(ApiRequest::PreviewEnabled)
    }

    pub fn start_recording(&self) -> Result<()> {
        self.run(ApiRequest::StartRecording)
    }

    pub fn stop_recording(&self) -> Result<()> {
        self.run(ApiRequest::StopRecording)
    }

    pub fn recording_enabled(&self) -> Result<bool> {
        self.enabled(ApiRequest::RecordingEnabled)
    }

    /// Blocks until the hardware reports the preparation finished.
    pub fn prepare_snapshot(&self) -> Result<()> {
        self.run(ApiRequest::PrepareSnapshot)
    }

    pub fn take_picture(&self) -> Result<()> {
        self.run(ApiRequest::TakePicture)
    }

    pub fn cancel_picture(&self) -> Result<()> {
        self.run(ApiRequest::CancelPicture)
    }

    pub fn send_command(&self, cmd: GenericCommand) -> Result<()> {
        self.run(ApiRequest::SendCommand(cmd))
    }

    pub fn release(&self) -> Result<()> {
        self.run(ApiRequest::Release)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.events.worker.store(None);
        self.worker.shutdown();
        debug!("device closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::capture::PrepSnapshotState;

    #[derive(Default)]
    struct Fake {
        pictures: Arc<Mutex<u32>>,
    }

    impl HardwareOps for Fake {
        fn prepare_preview(&mut self) -> Result<()> {
            Ok(())
        }
        fn start_preview(&mut self) -> Result<()> {
            Ok(())
        }
        fn stop_preview(&mut self) -> Result<()> {
            Ok(())
        }
        fn start_recording(&mut self) -> Result<()> {
            Ok(())
        }
        fn stop_recording(&mut self) -> Result<()> {
            Ok(())
        }
        fn take_picture(&mut self) -> Result<()> {
            *self.pictures.lock().unwrap() += 1;
            Ok(())
        }
        fn cancel_picture(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_zsl_mode(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_api_round_trip() {
        let pictures = Arc::new(Mutex::new(0));
        let counter = pictures.clone();
        let device = Device::new(&DeviceConfig::default(), move |_| {
            Ok(Fake { pictures: counter })
        })
        .unwrap();

        assert_eq!(device.state(), DeviceState::Idle);
        device.start_no_display_preview().unwrap();
        assert!(device.is_preview_running());
        assert!(device.preview_enabled().unwrap());

        device.take_picture().unwrap();
        assert_eq!(device.state(), DeviceState::PreviewCapturing);
        assert!(device.is_capture_running());
        assert!(!device.is_non_zsl_capture_running());
        assert_eq!(*pictures.lock().unwrap(), 1);
    }

    #[test]
    fn test_prepare_completes_on_event() {
        let device = Device::new(&DeviceConfig::default(), |_| Ok(Fake::default())).unwrap();
        device.start_no_display_preview().unwrap();
        let events = device.events();

        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            events
                .post(DeviceEvent::Internal(InternalEvent::PrepSnapshotDone(
                    PrepSnapshotState::NeedFutureFrame,
                )))
                .unwrap();
        });
        device.prepare_snapshot().unwrap();
        poster.join().unwrap();
        assert_eq!(device.state(), DeviceState::Previewing);
    }

    #[test]
    fn test_prepare_times_out() {
        let config = DeviceConfig { api_timeout_ms: 30 };
        let device = Device::new(&config, |_| Ok(Fake::default())).unwrap();
        device.start_no_display_preview().unwrap();

        assert_eq!(device.prepare_snapshot(), Err(Error::Timeout));
        assert_eq!(device.state(), DeviceState::PreparingCapture);
    }

    #[test]
    fn test_sender_detached_after_drop() {
        let device = Device::new(&DeviceConfig::default(), |_| Ok(Fake::default())).unwrap();
        let events = device.events();
        drop(device);
        assert_eq!(
            events.post(DeviceEvent::SnapshotDone),
            Err(Error::WorkerStopped("device"))
        );
    }

    #[test]
    fn test_build_failure_propagates() {
        let result = Device::new(&DeviceConfig::default(), |_| -> Result<Fake> {
            Err(Error::Hardware("no camera".into()))
        });
        assert_eq!(result.err(), Some(Error::Hardware("no camera".into())));
    }
}
