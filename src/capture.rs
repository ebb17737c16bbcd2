// SPDX-License-Identifier: GPL-3.0-only

//! Capture pipeline core and the long-lived capture loop
//!
//! [`PipelineCore`] owns the capture node and every per-frame collaborator;
//! all of its state sits behind one processing mutex so the control surface
//! and the loop never interleave inside an iteration. The loop itself is a
//! long-lived thread paused and resumed through [`CaptureGate`] rather than
//! respawned across preview transitions; shutdown is a condvar handshake
//! with a bounded wait.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::demux;
use crate::errors::{HalError, HalResult, HardwareError};
use crate::focus::{ContinuousFocus, SingleShotFocus};
use crate::hw::{
    AEAWB_UNLOCKED, CaptureConfig, CaptureDevice, ControlId, FACE_DETECTION_OFF, FACE_DETECTION_ON,
    FOCUS_REQUEST_OFF, PreviewWindow, ScalerConfig, ScalerPath, pack_focus_request,
};
use crate::layout::{self, InterleavedLayout};
use crate::params::{ParameterEngine, ParameterTable};
use crate::picture::PictureJob;
use crate::profile::DeviceProfile;
use crate::sink::{DataKind, NotifyKind, SinkDispatcher};
use crate::types::{
    BufferDescriptor, Geometry, MessageKind, PixelFormat, RecordingAddresses, SinkPayload,
};

/// Consecutive empty dequeues after a successful poll before the loop
/// declares the node wedged
const MAX_DEQUEUE_MISSES: u32 = 10;

/// Loop pacing and stop bounds, sourced from the runtime configuration
#[derive(Debug, Clone, Copy)]
pub struct CaptureTuning {
    /// Ring depth requested from the driver
    pub buffers: u32,
    /// Per-iteration frame wait; expiry is a no-op iteration
    pub frame_wait: Duration,
    /// Bound on pause/stop handshakes with the loop thread
    pub stop_wait: Duration,
}

impl Default for CaptureTuning {
    fn default() -> Self {
        Self {
            buffers: 6,
            frame_wait: Duration::from_millis(100),
            stop_wait: Duration::from_secs(2),
        }
    }
}

/// Everything one capture iteration touches, behind the processing lock
pub struct PipelineCore {
    profile: &'static DeviceProfile,
    device: Box<dyn CaptureDevice>,
    engine: ParameterEngine,
    layout: Option<&'static InterleavedLayout>,
    dispatcher: SinkDispatcher,
    preview_path: Box<dyn ScalerPath>,
    recording_path: Box<dyn ScalerPath>,
    window: Option<Box<dyn PreviewWindow>>,
    tuning: CaptureTuning,

    streaming: bool,
    active: Option<CaptureConfig>,
    ring: u32,

    preview_enabled: bool,
    preview_started: bool,
    recording_enabled: bool,
    recording_started: bool,
    recording_metadata: bool,
    picture_armed: bool,

    single_shot: SingleShotFocus,
    continuous: ContinuousFocus,

    // Scratch reused across iterations
    frame: Vec<u8>,
    yuv: Vec<u8>,
    jpeg: Vec<u8>,
    converted: Vec<u8>,

    dequeue_misses: u32,
}

impl PipelineCore {
    pub fn new(
        profile: &'static DeviceProfile,
        device: Box<dyn CaptureDevice>,
        preview_path: Box<dyn ScalerPath>,
        recording_path: Box<dyn ScalerPath>,
        dispatcher: SinkDispatcher,
        tuning: CaptureTuning,
    ) -> HalResult<Self> {
        let layout = match profile.interleaved_layout {
            Some(name) => Some(layout::lookup(name).ok_or_else(|| {
                HalError::Unsupported(format!("no interleaved layout registered as '{name}'"))
            })?),
            None => None,
        };
        if profile.hybrid && layout.is_none() {
            return Err(HalError::Unsupported(format!(
                "hybrid sensor {} without a transfer layout",
                profile.name
            )));
        }
        Ok(Self {
            profile,
            device,
            engine: ParameterEngine::new(profile),
            layout,
            dispatcher,
            preview_path,
            recording_path,
            window: None,
            tuning,
            streaming: false,
            active: None,
            ring: 0,
            preview_enabled: false,
            preview_started: false,
            recording_enabled: false,
            recording_started: false,
            recording_metadata: false,
            picture_armed: false,
            single_shot: SingleShotFocus::default(),
            continuous: ContinuousFocus::default(),
            frame: Vec::new(),
            yuv: Vec::new(),
            jpeg: Vec::new(),
            converted: Vec::new(),
            dequeue_misses: 0,
        })
    }

    pub fn profile(&self) -> &'static DeviceProfile {
        self.profile
    }

    pub fn set_window(&mut self, window: Option<Box<dyn PreviewWindow>>) {
        self.window = window;
        // A new surface wants its own configure call
        self.preview_started = false;
    }

    pub fn merge_parameters(&mut self, incoming: &ParameterTable) {
        self.engine.merge(incoming);
    }

    pub fn apply_parameters(&mut self, force: bool) -> HalResult<()> {
        self.engine.apply(force, self.device.as_mut())
    }

    pub fn flatten_parameters(&self) -> String {
        self.engine.table().flatten()
    }

    pub fn preview_enabled(&self) -> bool {
        self.preview_enabled
    }

    pub fn recording_enabled(&self) -> bool {
        self.recording_enabled
    }

    pub fn metadata_recording(&self) -> bool {
        self.recording_metadata
    }

    /// The geometry/format the capture node should be running right now
    fn desired_config(&self) -> CaptureConfig {
        let geometry = self.engine.state().preview_geometry;
        CaptureConfig {
            geometry,
            format: self.profile.capture_format,
            mbus: self.profile.mbus_for(geometry),
        }
    }

    /// A parameter change moved the capture geometry under a live stream
    pub fn needs_restart(&self) -> bool {
        self.streaming && self.active != Some(self.desired_config())
    }

    fn start_streaming(&mut self) -> HalResult<()> {
        let config = self.desired_config();
        if config.geometry.is_zero() {
            return Err(HalError::InvalidArgument(format!(
                "degenerate capture geometry {}",
                config.geometry
            )));
        }
        info!(
            sensor = self.profile.name,
            geometry = %config.geometry,
            "starting capture stream"
        );

        if self.profile.hybrid {
            self.write_control(ControlId::HybridMode, 1);
        }
        self.device.configure(&config)?;
        self.write_control(ControlId::Cacheable, 1);
        if !self.profile.managed_isp {
            // Without this the driver drops the trailing metadata block
            self.write_control(ControlId::EmbeddedData, 1);
        }

        let granted = self.device.request_buffers(self.tuning.buffers)?;
        if granted == 0 {
            return Err(HardwareError::Buffer("driver granted an empty ring".into()).into());
        }
        if granted < self.tuning.buffers {
            debug!(requested = self.tuning.buffers, granted, "driver shrank the ring");
        }
        self.ring = granted;

        let fps = self.engine.state().preview_fps;
        if fps > 0 {
            self.device.set_frame_rate(fps)?;
        }
        for index in 0..granted {
            self.device.queue_buffer(index)?;
        }

        self.write_control(ControlId::Rotation, self.profile.rotation);
        self.write_control(ControlId::HorizontalFlip, self.profile.hflip);
        self.write_control(ControlId::VerticalFlip, self.profile.vflip);

        self.device.stream_on()?;

        // Scene modes only latch on a running stream
        if let Some(scene) = self.engine.state().scene_mode {
            self.write_control(ControlId::SceneMode, scene as i32);
        }
        if self.profile.managed_isp && self.profile.params.max_detected_faces > 0 {
            self.write_control(ControlId::FaceDetectionCommand, FACE_DETECTION_ON);
        }

        self.streaming = true;
        self.active = Some(config);
        self.dequeue_misses = 0;
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if !self.streaming {
            return;
        }
        info!(sensor = self.profile.name, "stopping capture stream");
        if self.profile.hybrid {
            self.write_control(ControlId::HybridMode, 0);
        }
        if self.profile.managed_isp && self.profile.params.max_detected_faces > 0 {
            self.write_control(ControlId::FaceDetectionCommand, FACE_DETECTION_OFF);
        }
        if let Err(err) = self.device.stream_off() {
            warn!(%err, "stream off failed");
        }
        self.streaming = false;
        self.active = None;
        self.stop_preview_path();
        self.stop_recording_path();
    }

    /// Bring the stream in line with the desired geometry
    fn ensure_streaming(&mut self) -> HalResult<()> {
        if self.streaming && self.active == Some(self.desired_config()) {
            return Ok(());
        }
        self.stop_streaming();
        self.start_streaming()
    }

    /// Tear down and renegotiate under a paused loop
    pub fn restart_streaming(&mut self) -> HalResult<()> {
        self.stop_streaming();
        self.start_streaming()
    }

    pub fn start_preview(&mut self) -> HalResult<()> {
        if self.preview_enabled {
            return Err(HalError::Other("preview already running".into()));
        }
        self.ensure_streaming()?;
        self.preview_enabled = true;
        Ok(())
    }

    pub fn stop_preview(&mut self) {
        self.preview_enabled = false;
        self.stop_preview_path();
        if !self.recording_enabled {
            self.stop_streaming();
        }
    }

    pub fn start_recording(&mut self) -> HalResult<()> {
        if !self.streaming {
            return Err(HalError::Other("recording requires a running preview".into()));
        }
        self.recording_enabled = true;
        Ok(())
    }

    pub fn stop_recording(&mut self) {
        self.recording_enabled = false;
        self.stop_recording_path();
    }

    pub fn release_recording_frame(&mut self) {
        if !self.recording_started {
            return;
        }
        if let Err(err) = self.recording_path.release() {
            warn!(%err, "recording slot release failed");
        }
    }

    /// Switch the recording payload between pixels and buffer coordinates
    pub fn set_metadata_recording(&mut self, enabled: bool) -> HalResult<()> {
        if self.recording_enabled {
            return Err(HalError::InvalidArgument(
                "cannot change recording payload mode while recording".into(),
            ));
        }
        self.recording_metadata = enabled;
        Ok(())
    }

    pub fn auto_focus(&mut self) -> HalResult<()> {
        let geometry = self.engine.state().preview_geometry;
        self.device
            .set_control(ControlId::FocusRequest, pack_focus_request(geometry))?;
        if self.profile.af_codes.is_some() {
            self.single_shot.engage();
        } else {
            // Fixed-focus sensors never report a status; converge at once
            self.dispatcher.notify(NotifyKind::Focus, 1, 0);
        }
        Ok(())
    }

    pub fn cancel_auto_focus(&mut self) -> HalResult<()> {
        self.write_control(ControlId::FocusRequest, FOCUS_REQUEST_OFF);
        if self.single_shot.reset() {
            self.write_control(ControlId::AeAwbLock, AEAWB_UNLOCKED);
        }
        Ok(())
    }

    /// Arm the next transfer to carry a still; idempotent while armed
    pub fn arm_picture(&mut self) -> HalResult<()> {
        if self.picture_armed {
            return Ok(());
        }
        if !self.streaming {
            return Err(HalError::Other("picture requires a running preview".into()));
        }
        if self.profile.hybrid {
            // The legacy trigger must be clear before the hybrid one arms
            self.device.set_control(ControlId::Capture, 0)?;
            self.device.set_control(ControlId::HybridCapture, 1)?;
        }
        self.picture_armed = true;
        Ok(())
    }

    pub fn disarm_picture(&mut self) {
        self.picture_armed = false;
    }

    /// Completion hook from the picture thread: the AE/AWB lock is
    /// released exactly once per still, success or failure
    pub fn finish_picture(&mut self) {
        self.picture_armed = false;
        self.write_control(ControlId::AeAwbLock, AEAWB_UNLOCKED);
    }

    pub fn set_face_detection(&mut self, enabled: bool) -> HalResult<()> {
        if self.profile.params.max_detected_faces <= 0 {
            return Err(HalError::Unsupported(format!(
                "{} does not detect faces",
                self.profile.name
            )));
        }
        let id = if self.profile.managed_isp {
            ControlId::FaceDetectionCommand
        } else {
            ControlId::FaceDetection
        };
        let value = if enabled { FACE_DETECTION_ON } else { FACE_DETECTION_OFF };
        self.device.set_control(id, value)?;
        Ok(())
    }

    /// Drop everything the loop still holds; close-time cleanup
    pub fn shutdown(&mut self) {
        self.recording_enabled = false;
        self.preview_enabled = false;
        self.picture_armed = false;
        self.stop_streaming();
    }

    fn write_control(&mut self, id: ControlId, value: i32) {
        if let Err(err) = self.device.set_control(id, value) {
            warn!(control = ?id, value, %err, "control write refused");
        }
    }

    /// One loop iteration: wait, dequeue, route, requeue
    ///
    /// Frame-local problems (decode violations, a refused window push) are
    /// logged and swallowed; only hardware faults bubble up and park the
    /// loop. Returns a picture job when an armed still completed.
    pub fn process_one(&mut self) -> HalResult<Option<PictureJob>> {
        if !self.streaming {
            return Ok(None);
        }
        if !self.device.wait_frame(self.tuning.frame_wait)? {
            // Timeout is a quiet sensor, not an error
            return Ok(None);
        }
        let Some(index) = self.device.dequeue_buffer()? else {
            self.dequeue_misses += 1;
            if self.dequeue_misses > MAX_DEQUEUE_MISSES {
                return Err(HardwareError::Buffer(format!(
                    "no buffer after {} polled iterations",
                    self.dequeue_misses
                ))
                .into());
            }
            return Ok(None);
        };
        self.dequeue_misses = 0;

        self.device.read_frame(index, &mut self.frame)?;
        let routed = if self.profile.hybrid {
            self.route_hybrid(index)
        } else {
            self.route_direct(index)
        };

        self.device.queue_buffer(index)?;
        routed
    }

    fn route_hybrid(&mut self, index: u32) -> HalResult<Option<PictureJob>> {
        let layout = self.layout.ok_or_else(|| {
            HalError::Unsupported(format!("{} has no transfer layout", self.profile.name))
        })?;
        let geometry = self.engine.state().preview_geometry;
        let max_faces = self.profile.params.max_detected_faces.max(0) as usize;

        let descriptor = match demux::demultiplex(
            layout,
            &self.frame,
            geometry,
            max_faces,
            &mut self.yuv,
            &mut self.jpeg,
        ) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                // One bad transfer never takes the stream down
                warn!(%err, "dropping undecodable transfer");
                return Ok(None);
            }
        };

        self.observe_focus(descriptor.auto_focus_status);

        // Either way the scanlines are UYVY; without a decoded still the
        // whole transfer is one plain frame instead of the demuxed copy
        let yuv_len = if descriptor.decoded {
            descriptor.yuv_length
        } else {
            self.yuv.clear();
            self.yuv.extend_from_slice(&self.frame);
            self.yuv.len()
        };

        self.deliver_preview(index, geometry, PixelFormat::Uyvy, yuv_len)?;
        if !descriptor.faces.is_empty() {
            self.deliver_faces(index, geometry, descriptor.faces.clone());
        }
        self.deliver_recording(index, geometry, PixelFormat::Uyvy, yuv_len)?;

        if self.picture_armed && descriptor.decoded {
            self.picture_armed = false;
            let state = self.engine.state();
            let job = PictureJob {
                yuv: Some(self.yuv[..yuv_len].to_vec()),
                yuv_geometry: geometry,
                yuv_format: PixelFormat::Uyvy,
                jpeg: (descriptor.jpeg_length > 0)
                    .then(|| self.jpeg[..descriptor.jpeg_length].to_vec()),
                picture_geometry: state.picture_geometry,
                jpeg_quality: state.jpeg_quality.clamp(1, 100) as u8,
                thumbnail_geometry: state.thumbnail_geometry,
                thumbnail_quality: state.thumbnail_quality.clamp(1, 100) as u8,
                exif: descriptor.exif,
                gps: state.gps,
                maker: "SAMSUNG",
                model: self.profile.name,
                orientation: self.profile.orientation,
            };
            return Ok(Some(job));
        }
        Ok(None)
    }

    fn route_direct(&mut self, index: u32) -> HalResult<Option<PictureJob>> {
        let geometry = self.engine.state().preview_geometry;
        let format = self.profile.capture_format;
        let frame_len = self.frame.len();

        self.yuv.clear();
        self.yuv.extend_from_slice(&self.frame);

        self.deliver_preview(index, geometry, format, frame_len)?;
        if self.profile.params.max_detected_faces > 0
            && self.dispatcher.is_enabled(MessageKind::PREVIEW_METADATA)
        {
            let max_faces = self.profile.params.max_detected_faces as usize;
            match self.device.read_faces(max_faces) {
                Ok(faces) if !faces.is_empty() => self.deliver_faces(index, geometry, faces),
                Ok(_) => {}
                Err(err) => debug!(%err, "face readout failed"),
            }
        }
        self.deliver_recording(index, geometry, format, frame_len)?;

        if self.picture_armed {
            self.picture_armed = false;
            let state = self.engine.state();
            let job = PictureJob {
                yuv: Some(self.yuv[..frame_len].to_vec()),
                yuv_geometry: geometry,
                yuv_format: format,
                jpeg: None,
                picture_geometry: state.picture_geometry,
                jpeg_quality: state.jpeg_quality.clamp(1, 100) as u8,
                thumbnail_geometry: state.thumbnail_geometry,
                thumbnail_quality: state.thumbnail_quality.clamp(1, 100) as u8,
                exif: Default::default(),
                gps: state.gps,
                maker: "SAMSUNG",
                model: self.profile.name,
                orientation: self.profile.orientation,
            };
            return Ok(Some(job));
        }
        Ok(None)
    }

    fn observe_focus(&mut self, raw: u8) {
        let Some(codes) = self.profile.af_codes else {
            return;
        };
        let continuous_mode = self
            .engine
            .state()
            .focus_mode
            .map(|mode| mode.is_continuous())
            .unwrap_or(false);

        if continuous_mode {
            if let Some((kind, arg)) = self.continuous.observe(codes.continuous(raw)) {
                self.dispatcher.notify(kind, arg, 0);
            }
        } else if self.continuous.is_moving() {
            // Mode changed mid-movement; swallow the stale settle edge
            self.continuous.reset();
        }

        if self.single_shot.is_engaged() {
            let outcome = self.single_shot.observe(codes.single_shot(raw));
            if let Some((kind, arg)) = outcome.notify {
                self.dispatcher.notify(kind, arg, 0);
            }
            if outcome.release_locks {
                self.write_control(ControlId::AeAwbLock, AEAWB_UNLOCKED);
            }
        }
    }

    fn deliver_preview(
        &mut self,
        index: u32,
        source: Geometry,
        source_format: PixelFormat,
        source_len: usize,
    ) -> HalResult<()> {
        if !self.preview_enabled {
            return Ok(());
        }
        let state = self.engine.state();
        let target = state.preview_geometry;
        let target_format = state.preview_format;

        if !self.preview_started {
            // The conversion path starts lazily on the first frame so a
            // late-attached window still gets configured
            if let Some(window) = self.window.as_mut() {
                window.configure(self.ring, target, target_format)?;
            }
            self.preview_path.start(&ScalerConfig {
                source,
                source_format,
                target,
                target_format,
                buffers: self.ring,
            })?;
            self.preview_started = true;
        }

        self.preview_path.push(&self.yuv[..source_len], &mut self.converted)?;
        if let Some(window) = self.window.as_mut() {
            if let Err(err) = window.push(&self.converted) {
                debug!(%err, "preview window refused the frame");
            }
        }
        if self.dispatcher.is_enabled(MessageKind::PREVIEW_FRAME) {
            let descriptor = BufferDescriptor::bytes(
                Arc::from(self.converted.as_slice()),
                index as usize,
                target,
                target_format,
            );
            self.dispatcher.data(DataKind::PreviewFrame, &descriptor);
        }
        // The client copy is done either way, hand the slot straight back
        self.preview_path.release()?;
        Ok(())
    }

    fn deliver_faces(&mut self, index: u32, geometry: Geometry, faces: Vec<crate::types::FaceRecord>) {
        let descriptor = BufferDescriptor {
            payload: SinkPayload::Faces(faces),
            index: index as usize,
            geometry,
            format: self.engine.state().preview_format,
        };
        self.dispatcher.data(DataKind::PreviewMetadata, &descriptor);
    }

    fn deliver_recording(
        &mut self,
        index: u32,
        source: Geometry,
        source_format: PixelFormat,
        source_len: usize,
    ) -> HalResult<()> {
        if !self.recording_enabled {
            return Ok(());
        }
        let state = self.engine.state();
        let target = state.recording_geometry;
        let target_format = state.recording_format;

        if !self.recording_started {
            self.recording_path.start(&ScalerConfig {
                source,
                source_format,
                target,
                target_format,
                buffers: self.ring,
            })?;
            self.recording_started = true;
        }

        let slot = self.recording_path.push(&self.yuv[..source_len], &mut self.converted)?;
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as i64)
            .unwrap_or(0);

        let descriptor = if self.recording_metadata {
            // Buffer coordinates instead of pixels; the encoder maps the
            // slot itself
            let addresses = RecordingAddresses {
                kind: 0,
                index: slot,
                y: 0,
                cbcr: target_format.chroma_offset(target).unwrap_or(0),
            };
            BufferDescriptor {
                payload: SinkPayload::Addresses(addresses),
                index: slot as usize,
                geometry: target,
                format: target_format,
            }
        } else {
            BufferDescriptor::bytes(
                Arc::from(self.converted.as_slice()),
                slot as usize,
                target,
                target_format,
            )
        };

        if !self.dispatcher.data_timestamp(timestamp_ns, DataKind::VideoFrame, &descriptor) {
            // Masked or gated; nobody will ever release this slot
            self.recording_path.release()?;
        }
        Ok(())
    }

    fn stop_preview_path(&mut self) {
        if self.preview_started {
            self.preview_path.stop();
            self.preview_started = false;
        }
    }

    fn stop_recording_path(&mut self) {
        if self.recording_started {
            self.recording_path.stop();
            self.recording_started = false;
        }
    }
}

#[derive(Debug)]
struct GateState {
    /// Loop may run iterations
    running: bool,
    /// Thread should stay alive at all
    alive: bool,
    /// Thread is parked in the wait, confirmed quiescent
    idle: bool,
}

/// Pause/resume/stop handshake between the control surface and the loop
#[derive(Debug)]
pub struct CaptureGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl CaptureGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                running: false,
                alive: true,
                idle: true,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The long-lived capture thread and its gate
pub struct CaptureLoop {
    gate: Arc<CaptureGate>,
    stop_wait: Duration,
    handle: Option<JoinHandle<()>>,
}

impl CaptureLoop {
    /// Spawn the thread parked; [`resume`](Self::resume) releases it
    pub fn spawn(
        core: Arc<Mutex<PipelineCore>>,
        dispatcher: SinkDispatcher,
        on_picture: Arc<dyn Fn(PictureJob) + Send + Sync>,
        tuning: CaptureTuning,
    ) -> HalResult<Self> {
        let gate = Arc::new(CaptureGate::new());
        let thread_gate = Arc::clone(&gate);
        let handle = thread::Builder::new()
            .name("capture-loop".into())
            .spawn(move || run_loop(core, thread_gate, dispatcher, on_picture))
            .map_err(|err| HalError::Io(err.to_string()))?;
        Ok(Self {
            gate,
            stop_wait: tuning.stop_wait,
            handle: Some(handle),
        })
    }

    /// Let iterations run
    pub fn resume(&self) {
        let mut state = self.gate.lock();
        state.running = true;
        self.gate.cond.notify_all();
    }

    /// Park the loop and wait until the in-flight iteration drained
    pub fn pause(&self) -> HalResult<()> {
        let mut state = self.gate.lock();
        state.running = false;
        self.gate.cond.notify_all();
        let deadline = Instant::now() + self.stop_wait;
        while !state.idle {
            let now = Instant::now();
            if now >= deadline {
                return Err(HalError::ThreadStopTimeout("capture-loop".into()));
            }
            let (next, _) = self
                .gate
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }
        Ok(())
    }

    /// Tear the thread down; bounded, best effort
    pub fn stop(&mut self) -> HalResult<()> {
        {
            let mut state = self.gate.lock();
            state.running = false;
            state.alive = false;
            self.gate.cond.notify_all();
        }
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // The thread exits as soon as it sees !alive; give it the same
        // bound as a pause before joining
        {
            let mut state = self.gate.lock();
            let deadline = Instant::now() + self.stop_wait;
            while !state.idle {
                let now = Instant::now();
                if now >= deadline {
                    warn!("capture loop missed its stop bound, joining anyway");
                    break;
                }
                let (next, _) = self
                    .gate
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                state = next;
            }
        }
        if handle.join().is_err() {
            error!("capture loop panicked");
            return Err(HalError::Other("capture loop panicked".into()));
        }
        Ok(())
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_loop(
    core: Arc<Mutex<PipelineCore>>,
    gate: Arc<CaptureGate>,
    dispatcher: SinkDispatcher,
    on_picture: Arc<dyn Fn(PictureJob) + Send + Sync>,
) {
    debug!("capture loop up");
    loop {
        {
            let mut state = gate.lock();
            while state.alive && !state.running {
                if !state.idle {
                    state.idle = true;
                    gate.cond.notify_all();
                }
                state = gate
                    .cond
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if !state.alive {
                state.idle = true;
                gate.cond.notify_all();
                break;
            }
            state.idle = false;
        }

        let iteration = {
            let mut core = core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            core.process_one()
        };
        match iteration {
            Ok(Some(job)) => on_picture(job),
            Ok(None) => {}
            Err(err) => {
                // Hardware fault: report once and park until the control
                // surface restarts the stream
                error!(%err, "capture iteration failed, parking the loop");
                dispatcher.notify(NotifyKind::Error, 0, 0);
                let mut state = gate.lock();
                state.running = false;
            }
        }
    }
    debug!("capture loop down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::{CollectingWindow, InterleavedFrameBuilder, MockCaptureDevice};
    use crate::layout::S5C73M3_V1;
    use crate::media::SoftwareScaler;
    use crate::profile;
    use crate::sink::{CameraSink, RecordingSink};
    use crate::types::FaceRecord;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dispatcher(sink: Arc<RecordingSink>) -> SinkDispatcher {
        SinkDispatcher::new(
            sink as Arc<dyn CameraSink>,
            Arc::new(AtomicU32::new(MessageKind::ALL.0)),
            crate::sink::CallbackGate::new(),
        )
    }

    fn hybrid_core(device: MockCaptureDevice, sink: Arc<RecordingSink>) -> PipelineCore {
        let mut core = PipelineCore::new(
            profile::by_name("s5c73m3").unwrap(),
            Box::new(device),
            Box::new(SoftwareScaler::new()),
            Box::new(SoftwareScaler::new()),
            dispatcher(sink),
            CaptureTuning::default(),
        )
        .unwrap();
        // Shrink the preview so synthetic transfers stay small
        let mut small = ParameterTable::new();
        small.set("preview-size", "64x8");
        core.merge_parameters(&small);
        core
    }

    fn hybrid_frame(decoded: bool) -> Vec<u8> {
        let mut builder = InterleavedFrameBuilder::new(&S5C73M3_V1, Geometry::new(64, 8));
        if decoded {
            builder = builder
                .decoded(true)
                .jpeg_after_row(0, vec![0xff, 0xd8, 1, 2, 3])
                .trailing_jpeg(vec![4, 5, 0xff, 0xd9]);
        }
        builder.build()
    }

    #[test]
    fn preview_frames_reach_window_and_sink() {
        let device = MockCaptureDevice::new();
        let sink = Arc::new(RecordingSink::new());
        let mut core = hybrid_core(device.clone(), Arc::clone(&sink));
        core.apply_parameters(true).unwrap();

        let window = CollectingWindow::new();
        core.set_window(Some(Box::new(window.clone())));
        core.start_preview().unwrap();
        assert!(device.is_streaming());

        device.push_frame(hybrid_frame(false));
        assert!(core.process_one().unwrap().is_none());

        assert_eq!(window.frame_count(), 1);
        assert_eq!(sink.data_count(DataKind::PreviewFrame), 1);
        // Slot went back to the ring
        assert_eq!(device.pending_frames(), 0);
    }

    #[test]
    fn undecoded_transfer_forwards_the_raw_frame() {
        let device = MockCaptureDevice::new();
        let sink = Arc::new(RecordingSink::new());
        let mut core = hybrid_core(device.clone(), Arc::clone(&sink));
        core.apply_parameters(true).unwrap();
        core.start_preview().unwrap();

        // No still in the transfer: the whole buffer is the preview frame
        device.push_frame(hybrid_frame(false));
        assert!(core.process_one().unwrap().is_none());
        assert_eq!(sink.data_count(DataKind::PreviewFrame), 1);

        // A decoded transfer then rides the same conversion path
        device.push_frame(hybrid_frame(true));
        assert!(core.process_one().unwrap().is_none());
        assert_eq!(sink.data_count(DataKind::PreviewFrame), 2);
        assert_eq!(sink.notify_count(NotifyKind::Error), 0);
    }

    #[test]
    fn decoded_transfer_yields_one_picture_job() {
        let device = MockCaptureDevice::new();
        let sink = Arc::new(RecordingSink::new());
        let mut core = hybrid_core(device.clone(), Arc::clone(&sink));
        core.apply_parameters(true).unwrap();
        core.start_preview().unwrap();
        core.arm_picture().unwrap();
        assert_eq!(device.last_control(ControlId::HybridCapture), Some(1));

        // Undecoded transfer first: no job yet
        device.push_frame(hybrid_frame(false));
        assert!(core.process_one().unwrap().is_none());

        device.push_frame(hybrid_frame(true));
        let job = core.process_one().unwrap().expect("armed still");
        assert!(job.jpeg.is_some());
        assert_eq!(job.yuv_geometry, Geometry::new(64, 8));

        // Disarmed after the job; the next decoded transfer is plain preview
        device.push_frame(hybrid_frame(true));
        assert!(core.process_one().unwrap().is_none());
    }

    #[test]
    fn undecodable_transfer_is_dropped_not_fatal() {
        let device = MockCaptureDevice::new();
        let sink = Arc::new(RecordingSink::new());
        let mut core = hybrid_core(device.clone(), Arc::clone(&sink));
        core.apply_parameters(true).unwrap();
        core.start_preview().unwrap();

        device.push_frame(vec![0u8; 64]); // far too short
        assert!(core.process_one().unwrap().is_none());
        assert_eq!(sink.data_count(DataKind::PreviewFrame), 0);

        // The ring recovered, a good transfer still flows
        device.push_frame(hybrid_frame(false));
        assert!(core.process_one().unwrap().is_none());
        assert_eq!(sink.data_count(DataKind::PreviewFrame), 1);
    }

    #[test]
    fn face_records_flow_as_preview_metadata() {
        let device = MockCaptureDevice::new();
        let sink = Arc::new(RecordingSink::new());
        let mut core = hybrid_core(device.clone(), Arc::clone(&sink));
        core.apply_parameters(true).unwrap();
        core.start_preview().unwrap();

        let face = FaceRecord {
            rect: [-100, -100, 100, 100],
            score: 51,
            id: 1,
        };
        device.push_frame(
            InterleavedFrameBuilder::new(&S5C73M3_V1, Geometry::new(64, 8))
                .face(face)
                .build(),
        );
        core.process_one().unwrap();
        assert_eq!(sink.data_count(DataKind::PreviewMetadata), 1);
    }

    #[test]
    fn metadata_recording_delivers_addresses() {
        let device = MockCaptureDevice::new();
        let sink = Arc::new(RecordingSink::new());
        let mut core = hybrid_core(device.clone(), Arc::clone(&sink));
        core.apply_parameters(true).unwrap();
        core.set_metadata_recording(true).unwrap();
        core.start_preview().unwrap();
        core.start_recording().unwrap();
        // Mode flips are rejected while live
        assert!(core.set_metadata_recording(false).is_err());

        device.push_frame(hybrid_frame(false));
        core.process_one().unwrap();

        let events = sink.events();
        let video = events
            .iter()
            .find_map(|event| match event {
                crate::sink::SinkEvent::DataTimestamp { kind, buffer, .. }
                    if *kind == DataKind::VideoFrame =>
                {
                    Some(buffer.clone())
                }
                _ => None,
            })
            .expect("video frame delivered");
        assert!(matches!(video.payload, SinkPayload::Addresses(_)));
        core.release_recording_frame();
    }

    #[test]
    fn masked_recording_releases_the_slot_itself() {
        let device = MockCaptureDevice::new();
        let sink = Arc::new(RecordingSink::new());
        let messages = Arc::new(AtomicU32::new(
            (MessageKind::ALL.0) & !MessageKind::VIDEO_FRAME.0,
        ));
        let dispatcher = SinkDispatcher::new(
            Arc::clone(&sink) as Arc<dyn CameraSink>,
            messages,
            crate::sink::CallbackGate::new(),
        );
        let mut core = PipelineCore::new(
            profile::by_name("s5c73m3").unwrap(),
            Box::new(device.clone()),
            Box::new(SoftwareScaler::new()),
            Box::new(SoftwareScaler::new()),
            dispatcher,
            CaptureTuning::default(),
        )
        .unwrap();
        let mut small = ParameterTable::new();
        small.set("preview-size", "64x8");
        core.merge_parameters(&small);
        core.apply_parameters(true).unwrap();
        core.start_preview().unwrap();
        core.start_recording().unwrap();

        // Two frames in a row only work if the path released its slots
        device.push_frame(hybrid_frame(false));
        core.process_one().unwrap();
        device.push_frame(hybrid_frame(false));
        core.process_one().unwrap();
        assert_eq!(sink.data_count(DataKind::VideoFrame), 0);
    }

    #[test]
    fn focus_cycle_notifies_through_the_sink() {
        let device = MockCaptureDevice::new();
        let sink = Arc::new(RecordingSink::new());
        let mut core = hybrid_core(device.clone(), Arc::clone(&sink));
        core.apply_parameters(true).unwrap();
        core.start_preview().unwrap();
        core.auto_focus().unwrap();

        device.push_frame(
            InterleavedFrameBuilder::new(&S5C73M3_V1, Geometry::new(64, 8))
                .auto_focus_status(crate::focus::S5C73M3_AF_FOCUSING)
                .build(),
        );
        core.process_one().unwrap();
        device.push_frame(
            InterleavedFrameBuilder::new(&S5C73M3_V1, Geometry::new(64, 8))
                .auto_focus_status(crate::focus::S5C73M3_AF_FOCUSED)
                .build(),
        );
        core.process_one().unwrap();

        assert_eq!(sink.notify_count(NotifyKind::Focus), 1);
        // Converging released the exposure locks
        assert_eq!(device.last_control(ControlId::AeAwbLock), Some(AEAWB_UNLOCKED));
    }

    #[test]
    fn stream_restart_follows_geometry_change() {
        let device = MockCaptureDevice::new();
        let sink = Arc::new(RecordingSink::new());
        let mut core = hybrid_core(device.clone(), Arc::clone(&sink));
        core.apply_parameters(true).unwrap();
        core.start_preview().unwrap();
        assert!(!core.needs_restart());

        let mut change = ParameterTable::new();
        change.set("preview-size", "320x240");
        core.merge_parameters(&change);
        core.apply_parameters(false).unwrap();
        assert!(core.needs_restart());

        core.restart_streaming().unwrap();
        assert!(!core.needs_restart());
        assert_eq!(
            device.current_config().map(|config| config.geometry),
            Some(Geometry::new(320, 240))
        );
    }

    #[test]
    fn loop_parks_until_resumed_and_stops_cleanly() {
        let device = MockCaptureDevice::new();
        let sink = Arc::new(RecordingSink::new());
        let core = Arc::new(Mutex::new(hybrid_core(device.clone(), Arc::clone(&sink))));
        {
            let mut core = core.lock().unwrap();
            core.apply_parameters(true).unwrap();
            core.start_preview().unwrap();
        }

        let jobs = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&jobs);
        let mut capture = CaptureLoop::spawn(
            Arc::clone(&core),
            dispatcher(Arc::new(RecordingSink::new())),
            Arc::new(move |_job| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            CaptureTuning {
                stop_wait: Duration::from_secs(2),
                ..CaptureTuning::default()
            },
        )
        .unwrap();

        capture.resume();
        {
            let mut core = core.lock().unwrap();
            core.arm_picture().unwrap();
        }
        device.push_frame(hybrid_frame(true));
        let deadline = Instant::now() + Duration::from_secs(2);
        while jobs.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(jobs.load(Ordering::SeqCst), 1);

        capture.pause().unwrap();
        capture.stop().unwrap();
    }
}
