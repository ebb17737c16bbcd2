// SPDX-License-Identifier: GPL-3.0-only

//! The client-facing session surface
//!
//! One [`CameraSession`] per opened sensor. Every operation the client can
//! call lives here; the session translates it into pipeline-core state
//! changes under the processing lock, pausing the capture loop around
//! stream teardown and holding the callback gate across transitions so
//! the client never observes a half-applied state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::capture::{CaptureLoop, CaptureTuning, PipelineCore};
use crate::errors::{HalError, HalResult};
use crate::hw::{
    CaptureDevice, ExifComposer, FrameAllocator, ImageCompressor, PreviewWindow, ScalerPath,
};
use crate::params::ParameterTable;
use crate::picture::{PictureExecutor, PictureJob};
use crate::profile::DeviceProfile;
use crate::sink::{CallbackGate, CameraSink, SinkDispatcher};
use crate::types::MessageKind;

/// Classic camera service command codes the session understands
pub const CMD_START_FACE_DETECTION: i32 = 6;
pub const CMD_STOP_FACE_DETECTION: i32 = 7;

/// Everything a session needs besides the profile and the sink
///
/// Production wires the V4L2 device with the software conversion stack;
/// tests substitute the mocks piecewise.
pub struct Collaborators {
    pub device: Box<dyn CaptureDevice>,
    pub allocator: Box<dyn FrameAllocator>,
    pub compressor: Box<dyn ImageCompressor>,
    pub composer: Box<dyn ExifComposer>,
    pub preview_path: Box<dyn ScalerPath>,
    pub recording_path: Box<dyn ScalerPath>,
}

pub struct CameraSession {
    profile: &'static DeviceProfile,
    core: Arc<Mutex<PipelineCore>>,
    capture: CaptureLoop,
    executor: Arc<PictureExecutor>,
    messages: Arc<AtomicU32>,
    gate: CallbackGate,
    tuning: CaptureTuning,
    closed: bool,
}

impl CameraSession {
    /// Open a session: seed the parameter table from the profile, force
    /// the preset onto the hardware and park the capture loop
    pub fn open(
        profile: &'static DeviceProfile,
        collaborators: Collaborators,
        sink: Arc<dyn CameraSink>,
        tuning: CaptureTuning,
    ) -> HalResult<Self> {
        info!(sensor = profile.name, facing = %profile.facing, "opening camera session");

        let messages = Arc::new(AtomicU32::new(MessageKind::ALL.0));
        let gate = CallbackGate::new();
        let dispatcher = SinkDispatcher::new(sink, Arc::clone(&messages), gate.clone());

        let mut core = PipelineCore::new(
            profile,
            collaborators.device,
            collaborators.preview_path,
            collaborators.recording_path,
            dispatcher.clone(),
            tuning,
        )?;
        {
            let _hold = gate.hold();
            core.apply_parameters(true)?;
        }
        let core = Arc::new(Mutex::new(core));

        let executor = Arc::new(PictureExecutor::new(
            dispatcher.clone(),
            collaborators.compressor,
            collaborators.composer,
            collaborators.allocator,
        ));

        let job_executor = Arc::clone(&executor);
        let job_core = Arc::clone(&core);
        let on_picture: Arc<dyn Fn(PictureJob) + Send + Sync> = Arc::new(move |job| {
            job_executor.submit(job, Arc::clone(&job_core));
        });
        let capture = CaptureLoop::spawn(Arc::clone(&core), dispatcher, on_picture, tuning)?;

        Ok(Self {
            profile,
            core,
            capture,
            executor,
            messages,
            gate,
            tuning,
            closed: false,
        })
    }

    pub fn profile(&self) -> &'static DeviceProfile {
        self.profile
    }

    fn core(&self) -> MutexGuard<'_, PipelineCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach or detach the client's display surface
    pub fn set_preview_window(&self, window: Option<Box<dyn PreviewWindow>>) {
        self.core().set_window(window);
    }

    pub fn enable_messages(&self, mask: MessageKind) {
        self.messages.fetch_or(mask.0, Ordering::SeqCst);
    }

    pub fn disable_messages(&self, mask: MessageKind) {
        self.messages.fetch_and(!mask.0, Ordering::SeqCst);
    }

    pub fn message_enabled(&self, mask: MessageKind) -> bool {
        MessageKind(self.messages.load(Ordering::SeqCst)).contains(mask)
    }

    pub fn preview_running(&self) -> bool {
        self.core().preview_enabled()
    }

    pub fn recording_running(&self) -> bool {
        self.core().recording_enabled()
    }

    pub fn start_preview(&self) -> HalResult<()> {
        let _hold = self.gate.hold();
        self.core().start_preview()?;
        self.capture.resume();
        Ok(())
    }

    pub fn stop_preview(&self) {
        if !self.preview_running() {
            return;
        }
        let _hold = self.gate.hold();
        if self.recording_running() {
            // Preview cannot outlive the capture stream; recording goes too
            warn!("stopping preview tears down the live recording");
            self.core().stop_recording();
        }
        if let Err(err) = self.capture.pause() {
            warn!(%err, "capture loop missed the pause bound");
        }
        self.core().stop_preview();
    }

    /// Switch recording deliveries between pixel and buffer-coordinate
    /// payloads; refused while a recording is live
    pub fn store_meta_data_in_buffers(&self, enabled: bool) -> HalResult<()> {
        self.core().set_metadata_recording(enabled)
    }

    pub fn start_recording(&self) -> HalResult<()> {
        let _hold = self.gate.hold();
        self.core().start_recording()
    }

    pub fn stop_recording(&self) {
        let _hold = self.gate.hold();
        self.core().stop_recording();
    }

    /// Hand a delivered recording slot back to the conversion path
    pub fn release_recording_frame(&self) {
        self.core().release_recording_frame();
    }

    pub fn auto_focus(&self) -> HalResult<()> {
        self.core().auto_focus()
    }

    pub fn cancel_auto_focus(&self) -> HalResult<()> {
        self.core().cancel_auto_focus()
    }

    /// Arm the next transfer to carry a still
    ///
    /// A trigger while one is already in flight is a no-op; the client
    /// has a picture coming either way.
    pub fn take_picture(&self) -> HalResult<()> {
        let _hold = self.gate.hold();
        if self.executor.is_running() {
            debug!("picture in flight, ignoring trigger");
            return Ok(());
        }
        self.core().arm_picture()
    }

    pub fn cancel_picture(&self) {
        self.core().disarm_picture();
    }

    /// Merge a flattened parameter string and push the result
    ///
    /// When the client omits the GPS timestamp the location keys collapse
    /// to the -1 sentinel so stale coordinates never reach the EXIF
    /// writer. A geometry change under a live stream renegotiates the
    /// capture node with the loop paused.
    pub fn set_parameters(&self, raw: &str) -> HalResult<()> {
        let _hold = self.gate.hold();
        let mut incoming = ParameterTable::parse(raw);
        if incoming.get("gps-timestamp").is_none() {
            incoming.set("gps-timestamp", "-1");
            incoming.set("gps-latitude", "-1");
            incoming.set("gps-longitude", "-1");
            incoming.set("gps-altitude", "-1");
        }

        let needs_restart = {
            let mut core = self.core();
            core.merge_parameters(&incoming);
            core.apply_parameters(false)?;
            core.needs_restart()
        };
        if needs_restart {
            if let Err(err) = self.capture.pause() {
                warn!(%err, "capture loop missed the pause bound");
            }
            self.core().restart_streaming()?;
            self.capture.resume();
        }
        Ok(())
    }

    pub fn get_parameters(&self) -> String {
        self.core().flatten_parameters()
    }

    /// Service command surface; only the face-detection pair is wired
    pub fn send_command(&self, command: i32, _arg1: i32, _arg2: i32) -> HalResult<()> {
        match command {
            CMD_START_FACE_DETECTION => self.core().set_face_detection(true),
            CMD_STOP_FACE_DETECTION => self.core().set_face_detection(false),
            other => Err(HalError::Unsupported(format!("command {other}"))),
        }
    }

    /// Tear the session down: recording, preview, picture thread, loop
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(sensor = self.profile.name, "closing camera session");
        let _hold = self.gate.hold();
        if !self.executor.wait_idle(self.tuning.stop_wait) {
            warn!("picture thread missed the stop bound");
        }
        if let Err(err) = self.capture.pause() {
            warn!(%err, "capture loop missed the pause bound");
        }
        self.core().shutdown();
        if let Err(err) = self.capture.stop() {
            warn!(%err, "capture loop did not stop cleanly");
        }
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exif::SoftwareExif;
    use crate::hw::HeapAllocator;
    use crate::hw::mock::MockCaptureDevice;
    use crate::media::{SoftwareCompressor, SoftwareScaler};
    use crate::profile;
    use crate::sink::RecordingSink;

    fn collaborators(device: MockCaptureDevice) -> Collaborators {
        Collaborators {
            device: Box::new(device),
            allocator: Box::new(HeapAllocator),
            compressor: Box::new(SoftwareCompressor),
            composer: Box::new(SoftwareExif::new()),
            preview_path: Box::new(SoftwareScaler::new()),
            recording_path: Box::new(SoftwareScaler::new()),
        }
    }

    fn open(device: MockCaptureDevice) -> (CameraSession, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let session = CameraSession::open(
            profile::by_name("s5c73m3").unwrap(),
            collaborators(device),
            Arc::clone(&sink) as Arc<dyn CameraSink>,
            CaptureTuning::default(),
        )
        .unwrap();
        (session, sink)
    }

    #[test]
    fn open_publishes_the_profile_preset() {
        let device = MockCaptureDevice::new();
        let (session, sink) = open(device);
        let flat = session.get_parameters();
        assert!(flat.contains("preview-size=960x720"));
        assert!(flat.contains("picture-size=3264x2448"));
        assert!(flat.contains("flash-mode=off"));
        // The forced preset apply was gated, nothing leaked to the client
        assert!(sink.events().is_empty());
        session.close();
    }

    #[test]
    fn preview_lifecycle() {
        let device = MockCaptureDevice::new();
        let (session, _sink) = open(device.clone());

        assert!(!session.preview_running());
        session.start_preview().unwrap();
        assert!(session.preview_running());
        assert!(device.is_streaming());
        // A second start is the client's error
        assert!(session.start_preview().is_err());

        session.stop_preview();
        assert!(!session.preview_running());
        assert!(!device.is_streaming());
        session.close();
    }

    #[test]
    fn recording_requires_preview() {
        let device = MockCaptureDevice::new();
        let (session, _sink) = open(device);
        assert!(session.start_recording().is_err());

        session.start_preview().unwrap();
        session.start_recording().unwrap();
        assert!(session.recording_running());
        // Payload mode is frozen while live
        assert!(session.store_meta_data_in_buffers(true).is_err());
        session.stop_recording();
        assert!(session.store_meta_data_in_buffers(true).is_ok());
        session.close();
    }

    #[test]
    fn message_masks_toggle() {
        let device = MockCaptureDevice::new();
        let (session, _sink) = open(device);
        assert!(session.message_enabled(MessageKind::SHUTTER));
        session.disable_messages(MessageKind::SHUTTER | MessageKind::FOCUS);
        assert!(!session.message_enabled(MessageKind::SHUTTER));
        assert!(session.message_enabled(MessageKind::COMPRESSED_IMAGE));
        session.enable_messages(MessageKind::SHUTTER);
        assert!(session.message_enabled(MessageKind::SHUTTER));
        session.close();
    }

    #[test]
    fn missing_gps_timestamp_collapses_location_keys() {
        let device = MockCaptureDevice::new();
        let (session, _sink) = open(device);
        session
            .set_parameters("gps-latitude=48.1;gps-longitude=11.5")
            .unwrap();
        let flat = session.get_parameters();
        assert!(flat.contains("gps-timestamp=-1"));
        assert!(flat.contains("gps-latitude=-1"));
        assert!(flat.contains("gps-longitude=-1"));

        session
            .set_parameters("gps-timestamp=1714000000;gps-latitude=48.1")
            .unwrap();
        let flat = session.get_parameters();
        assert!(flat.contains("gps-timestamp=1714000000"));
        assert!(flat.contains("gps-latitude=48.1"));
        session.close();
    }

    #[test]
    fn geometry_change_renegotiates_a_live_stream() {
        let device = MockCaptureDevice::new();
        let (session, _sink) = open(device.clone());
        session.start_preview().unwrap();

        session.set_parameters("preview-size=320x240").unwrap();
        assert_eq!(
            device.current_config().map(|config| config.geometry),
            Some(crate::types::Geometry::new(320, 240))
        );
        assert!(device.is_streaming());
        session.close();
    }

    #[test]
    fn invalid_parameter_rolls_back_and_errors() {
        let device = MockCaptureDevice::new();
        let (session, _sink) = open(device);
        let before = session.get_parameters();
        assert!(session.set_parameters("preview-size=-3x-4").is_err());
        let after = session.get_parameters();
        // The offending key was rolled back to the last accepted value
        assert_eq!(
            before.contains("preview-size=960x720"),
            after.contains("preview-size=960x720")
        );
        session.close();
    }

    #[test]
    fn face_detection_commands_reach_the_device() {
        let device = MockCaptureDevice::new();
        let (session, _sink) = open(device.clone());
        session.send_command(CMD_START_FACE_DETECTION, 0, 0).unwrap();
        assert_eq!(
            device.last_control(crate::hw::ControlId::FaceDetection),
            Some(crate::hw::FACE_DETECTION_ON)
        );
        session.send_command(CMD_STOP_FACE_DETECTION, 0, 0).unwrap();
        assert_eq!(
            device.last_control(crate::hw::ControlId::FaceDetection),
            Some(crate::hw::FACE_DETECTION_OFF)
        );
        assert!(session.send_command(99, 0, 0).is_err());
        session.close();
    }

    #[test]
    fn take_picture_needs_a_running_preview() {
        let device = MockCaptureDevice::new();
        let (session, _sink) = open(device.clone());
        assert!(session.take_picture().is_err());

        session.start_preview().unwrap();
        session.take_picture().unwrap();
        assert_eq!(device.last_control(crate::hw::ControlId::HybridCapture), Some(1));
        session.cancel_picture();
        session.close();
    }
}
