//! The hardware side of the device state machine.

use bytes::Bytes;
use tracing::trace;

use super::event::{FocusState, GenericCommand, ThermalLevel, WindowId};
use crate::capture::PrepSnapshotState;
use crate::pipeline::Bundle;
use crate::Result;

/// Operations the state machine drives. Implementations own the channels
/// and streams; every method runs on the device worker thread, one at a time.
///
/// Only the preview, capture and recording primitives are mandatory. The
/// rest default to accepting the request and doing nothing.
pub trait HardwareOps: Send + 'static {
    fn prepare_preview(&mut self) -> Result<()>;
    fn unprepare_preview(&mut self) {}
    fn start_preview(&mut self) -> Result<()>;
    fn stop_preview(&mut self) -> Result<()>;

    fn set_preview_window(&mut self, _window: Option<WindowId>) -> Result<()> {
        Ok(())
    }

    fn start_recording(&mut self) -> Result<()>;
    fn stop_recording(&mut self) -> Result<()>;

    fn release_recording_frame(&mut self, _handle: u64) -> Result<()> {
        Ok(())
    }

    fn store_metadata_in_buffers(&mut self, _enable: bool) -> Result<()> {
        Ok(())
    }

    fn prepare_for_snapshot(&mut self) -> Result<()> {
        Ok(())
    }

    fn take_picture(&mut self) -> Result<()>;
    fn cancel_picture(&mut self) -> Result<()>;

    /// Snapshot taken from the running preview or video stream.
    fn take_live_snapshot(&mut self) -> Result<()> {
        self.take_picture()
    }

    fn cancel_live_snapshot(&mut self) -> Result<()> {
        self.cancel_picture()
    }

    fn long_shot(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop_capture_channel(&mut self, _restart_preview: bool) -> Result<()> {
        Ok(())
    }

    fn auto_focus(&mut self) -> Result<()> {
        Ok(())
    }

    fn cancel_auto_focus(&mut self) -> Result<()> {
        Ok(())
    }

    /// Returns true when the preview has to be restarted for the command to
    /// take effect.
    fn send_command(&mut self, _cmd: &GenericCommand) -> Result<bool> {
        Ok(false)
    }

    /// Stage new parameters. Returns true when they only apply after a
    /// preview restart.
    fn update_parameters(&mut self, _params: &str) -> Result<bool> {
        Ok(false)
    }

    fn commit_parameters(&mut self) -> Result<()> {
        Ok(())
    }

    fn parameters(&self) -> String {
        String::new()
    }

    fn put_parameters(&mut self, _params: String) -> Result<()> {
        Ok(())
    }

    fn register_face_image(&mut self, _image: &Bytes) -> Result<u64> {
        Ok(0)
    }

    fn update_thermal_level(&mut self, _level: ThermalLevel) -> Result<()> {
        Ok(())
    }

    fn dump(&self) -> Result<()> {
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_zsl_mode(&self) -> bool {
        false
    }

    fn is_longshot_enabled(&self) -> bool {
        false
    }

    /// Pictures are taken as live snapshots while this is set.
    fn recording_hint(&self) -> bool {
        false
    }

    fn is_preview_restart_enabled(&self) -> bool {
        true
    }

    fn process_focus(&mut self, _state: FocusState) -> Result<()> {
        Ok(())
    }

    fn process_prep_snapshot_done(&mut self, _state: PrepSnapshotState) -> Result<()> {
        Ok(())
    }

    fn process_face_detection(&mut self, _faces: u32) -> Result<()> {
        Ok(())
    }

    fn process_histogram(&mut self, _bins: &[u32]) -> Result<()> {
        Ok(())
    }

    fn process_zoom(&mut self, _zoom: u32) -> Result<()> {
        Ok(())
    }

    fn process_asd(&mut self, _scene: u32) -> Result<()> {
        Ok(())
    }

    fn process_awb(&mut self, _cct: u32) -> Result<()> {
        Ok(())
    }

    fn process_jpeg(&mut self, _image: Option<&Bytes>) -> Result<()> {
        Ok(())
    }

    fn play_shutter(&mut self) {}

    /// Takes ownership of a delivered bundle. Dropping it returns the buffers.
    fn process_bundle(&mut self, bundle: Bundle) -> Result<()> {
        trace!(channel = %bundle.channel, frame_idx = bundle.frame_idx, "bundle released unused");
        Ok(())
    }
}
