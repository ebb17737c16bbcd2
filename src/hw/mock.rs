// SPDX-License-Identifier: GPL-3.0-only

//! Synthetic collaborator implementations
//!
//! Everything here behaves like the real hardware as far as the session
//! core can tell: scripted transfers come back through the ring, control
//! writes are recorded for inspection, and [`InterleavedFrameBuilder`]
//! assembles byte-exact hybrid transfers for the demultiplexer. Used by
//! the test suites and by the diagnostic CLI's synthetic stream mode.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::errors::{HalError, HalResult, HardwareError};
use crate::hw::{
    CaptureConfig, CaptureDevice, ControlId, FrameAllocator, FrameMemory, HeapAllocator,
    PreviewWindow,
};
use crate::layout::InterleavedLayout;
use crate::types::{FaceRecord, Geometry, PartialExif, PixelFormat};

#[derive(Default)]
struct MockDeviceState {
    config: Option<CaptureConfig>,
    streaming: bool,
    buffers: u32,
    buffer_len: usize,
    frame_rate: i32,
    queued: VecDeque<u32>,
    ring: HashMap<u32, Vec<u8>>,
    scripted: VecDeque<Vec<u8>>,
    controls: Vec<(ControlId, i32)>,
    control_state: HashMap<ControlId, i32>,
    failing: HashSet<ControlId>,
    faces: Vec<FaceRecord>,
}

/// Capture node double serving scripted transfers
///
/// Clone handles share state, so a test can keep one handle for
/// inspection while the session owns the other.
#[derive(Clone, Default)]
pub struct MockCaptureDevice {
    inner: Arc<Mutex<MockDeviceState>>,
}

impl MockCaptureDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockDeviceState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Script one transfer; served in push order
    pub fn push_frame(&self, frame: Vec<u8>) {
        let mut state = self.state();
        state.buffer_len = state.buffer_len.max(frame.len());
        state.scripted.push_back(frame);
    }

    /// Future writes to `id` fail with a control-write error
    pub fn fail_control(&self, id: ControlId) {
        self.state().failing.insert(id);
    }

    /// Face records served to `read_faces`
    pub fn set_faces(&self, faces: Vec<FaceRecord>) {
        self.state().faces = faces;
    }

    /// Every control write so far, in order
    pub fn control_writes(&self) -> Vec<(ControlId, i32)> {
        self.state().controls.clone()
    }

    pub fn control_write_count(&self, id: ControlId) -> usize {
        self.state().controls.iter().filter(|(written, _)| *written == id).count()
    }

    /// Most recent value written to `id`
    pub fn last_control(&self, id: ControlId) -> Option<i32> {
        self.state().control_state.get(&id).copied()
    }

    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    pub fn current_config(&self) -> Option<CaptureConfig> {
        self.state().config
    }

    /// Transfers scripted but not yet served
    pub fn pending_frames(&self) -> usize {
        self.state().scripted.len()
    }
}

impl CaptureDevice for MockCaptureDevice {
    fn configure(&mut self, config: &CaptureConfig) -> Result<(), HardwareError> {
        self.state().config = Some(*config);
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, HardwareError> {
        let mut state = self.state();
        state.buffers = count;
        state.queued.clear();
        state.ring.clear();
        Ok(count)
    }

    fn buffer_length(&self) -> Result<usize, HardwareError> {
        let state = self.state();
        if state.buffer_len == 0 {
            let config = state
                .config
                .ok_or_else(|| HardwareError::Buffer("no format negotiated".into()))?;
            return Ok(config.format.buffer_length(config.geometry));
        }
        Ok(state.buffer_len)
    }

    fn queue_buffer(&mut self, index: u32) -> Result<(), HardwareError> {
        let mut state = self.state();
        if index >= state.buffers {
            return Err(HardwareError::Buffer(format!(
                "queue index {index} beyond ring of {}",
                state.buffers
            )));
        }
        state.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<Option<u32>, HardwareError> {
        let mut state = self.state();
        if !state.streaming || state.scripted.is_empty() {
            return Ok(None);
        }
        let Some(slot) = state.queued.pop_front() else {
            return Ok(None);
        };
        let frame = state.scripted.pop_front().unwrap_or_default();
        state.ring.insert(slot, frame);
        Ok(Some(slot))
    }

    fn wait_frame(&mut self, _timeout: Duration) -> Result<bool, HardwareError> {
        let state = self.state();
        Ok(state.streaming && !state.scripted.is_empty() && !state.queued.is_empty())
    }

    fn read_frame(&mut self, index: u32, out: &mut Vec<u8>) -> Result<usize, HardwareError> {
        let state = self.state();
        let frame = state
            .ring
            .get(&index)
            .ok_or_else(|| HardwareError::Buffer(format!("ring slot {index} holds no frame")))?;
        out.clear();
        out.extend_from_slice(frame);
        Ok(frame.len())
    }

    fn stream_on(&mut self) -> Result<(), HardwareError> {
        self.state().streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<(), HardwareError> {
        let mut state = self.state();
        state.streaming = false;
        state.queued.clear();
        Ok(())
    }

    fn set_frame_rate(&mut self, fps: i32) -> Result<(), HardwareError> {
        self.state().frame_rate = fps;
        Ok(())
    }

    fn set_control(&mut self, id: ControlId, value: i32) -> Result<(), HardwareError> {
        let mut state = self.state();
        if state.failing.contains(&id) {
            return Err(HardwareError::ControlWrite(format!("{id:?} refused")));
        }
        state.controls.push((id, value));
        state.control_state.insert(id, value);
        Ok(())
    }

    fn get_control(&mut self, id: ControlId) -> Result<i32, HardwareError> {
        Ok(self.state().control_state.get(&id).copied().unwrap_or(0))
    }

    fn read_faces(&mut self, max_faces: usize) -> Result<Vec<FaceRecord>, HardwareError> {
        let state = self.state();
        Ok(state.faces.iter().take(max_faces).copied().collect())
    }
}

/// Allocator that starts failing after a scripted number of successes
#[derive(Debug)]
pub struct FailingAllocator {
    remaining: usize,
    heap: HeapAllocator,
}

impl FailingAllocator {
    /// Succeed `successes` times, then fail every allocation
    pub fn fail_after(successes: usize) -> Self {
        Self {
            remaining: successes,
            heap: HeapAllocator,
        }
    }
}

impl FrameAllocator for FailingAllocator {
    fn allocate(&mut self, chunk_len: usize, count: usize) -> HalResult<FrameMemory> {
        if self.remaining == 0 {
            return Err(HalError::ResourceAcquisition(format!(
                "scripted failure for {chunk_len} x {count}"
            )));
        }
        self.remaining -= 1;
        self.heap.allocate(chunk_len, count)
    }
}

#[derive(Default)]
struct WindowState {
    configured: Option<(u32, Geometry, PixelFormat)>,
    frames: usize,
    last_len: usize,
}

/// Preview surface double counting pushed frames
#[derive(Clone, Default)]
pub struct CollectingWindow {
    inner: Arc<Mutex<WindowState>>,
}

impl CollectingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, WindowState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn frame_count(&self) -> usize {
        self.state().frames
    }

    pub fn last_frame_len(&self) -> usize {
        self.state().last_len
    }

    pub fn configured(&self) -> Option<(u32, Geometry, PixelFormat)> {
        self.state().configured
    }
}

impl PreviewWindow for CollectingWindow {
    fn configure(&mut self, buffers: u32, geometry: Geometry, format: PixelFormat) -> HalResult<()> {
        self.state().configured = Some((buffers, geometry, format));
        Ok(())
    }

    fn push(&mut self, frame: &[u8]) -> HalResult<()> {
        let mut state = self.state();
        state.frames += 1;
        state.last_len = frame.len();
        Ok(())
    }
}

/// Assembles byte-exact hybrid transfers for a layout descriptor
///
/// Scanline `i` is filled with the byte value `i`, so walk order is easy
/// to assert. The first scanline always starts at offset zero; compressed
/// chunks are placed in the gap after the row they were attached to, with
/// any trailing chunk between the last row and the pointer array.
pub struct InterleavedFrameBuilder {
    layout: &'static InterleavedLayout,
    geometry: Geometry,
    decoded: bool,
    auto_focus_status: u8,
    faces: Vec<FaceRecord>,
    exif: PartialExif,
    gaps: BTreeMap<usize, Vec<u8>>,
    trailing: Vec<u8>,
}

impl InterleavedFrameBuilder {
    pub fn new(layout: &'static InterleavedLayout, geometry: Geometry) -> Self {
        Self {
            layout,
            geometry,
            decoded: false,
            auto_focus_status: 0,
            faces: Vec::new(),
            exif: PartialExif::default(),
            gaps: BTreeMap::new(),
            trailing: Vec::new(),
        }
    }

    pub fn decoded(mut self, decoded: bool) -> Self {
        self.decoded = decoded;
        self
    }

    pub fn auto_focus_status(mut self, raw: u8) -> Self {
        self.auto_focus_status = raw;
        self
    }

    pub fn face(mut self, face: FaceRecord) -> Self {
        self.faces.push(face);
        self
    }

    pub fn exif(mut self, exif: PartialExif) -> Self {
        self.exif = exif;
        self
    }

    /// Place compressed bytes in the gap following scanline `row`
    pub fn jpeg_after_row(mut self, row: usize, bytes: Vec<u8>) -> Self {
        self.gaps.entry(row).or_default().extend_from_slice(&bytes);
        self
    }

    /// Place compressed bytes after the last scanline
    pub fn trailing_jpeg(mut self, bytes: Vec<u8>) -> Self {
        self.trailing.extend_from_slice(&bytes);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let rows = self.geometry.height as usize;
        let line_size = self.geometry.width as usize * 2;

        let mut region = Vec::new();
        let mut offsets = Vec::with_capacity(rows);
        for row in 0..rows {
            offsets.push(region.len() as u32);
            region.resize(region.len() + line_size, row as u8);
            if let Some(gap) = self.gaps.get(&row) {
                region.extend_from_slice(gap);
            }
        }
        region.extend_from_slice(&self.trailing);

        let pointer_offset = region.len() as u32;
        let pointer_size = (rows * 4) as u32;

        let mut frame = region;
        for offset in &offsets {
            frame.extend_from_slice(&offset.to_be_bytes());
        }

        let block_at = frame.len();
        frame.resize(block_at + self.layout.metadata_reserve, 0);
        let block = &mut frame[block_at..];

        block[self.layout.decoded_flag] = self.decoded as u8;
        block[self.layout.af_status] = self.auto_focus_status;
        block[self.layout.pointer_array..self.layout.pointer_array + 4]
            .copy_from_slice(&pointer_offset.to_be_bytes());
        block[self.layout.pointer_array + 4..self.layout.pointer_array + 8]
            .copy_from_slice(&pointer_size.to_be_bytes());

        block[self.layout.face_count] = self.faces.len() as u8;
        let mut at = self.layout.face_records;
        for face in &self.faces {
            for component in face.rect {
                block[at..at + 2].copy_from_slice(&(component as u16).to_le_bytes());
                at += 2;
            }
            block[at..at + 2].copy_from_slice(&(face.score as u16).to_le_bytes());
            block[at + 2..at + 4].copy_from_slice(&(face.id as u16).to_le_bytes());
            at += self.layout.face_record_len - 8;
        }

        block[self.layout.exif_flash] = self.exif.flash;
        block[self.layout.exif_iso..self.layout.exif_iso + 2]
            .copy_from_slice(&self.exif.iso.to_le_bytes());
        block[self.layout.exif_brightness] = self.exif.brightness;
        block[self.layout.exif_exposure_bias..self.layout.exif_exposure_bias + 2]
            .copy_from_slice(&(self.exif.exposure_bias as u16).to_le_bytes());
        block[self.layout.exif_exposure_time..self.layout.exif_exposure_time + 2]
            .copy_from_slice(&self.exif.exposure_time_den.to_le_bytes());

        frame
    }
}
