// SPDX-License-Identifier: GPL-3.0-only

//! Hardware and memory collaborator interfaces
//!
//! The session core talks to everything outside the process through the
//! traits in this module: the capture node, the resizing engine, shared
//! memory, the still encoder, the EXIF writer and the client's display
//! surface. [`v4l2`] implements them against real video nodes, [`mock`]
//! provides synthetic stand-ins for tests and the diagnostic CLI.

pub mod mock;
pub mod v4l2;

use std::time::Duration;

use crate::errors::{HalError, HalResult, HardwareError};
use crate::types::{FaceRecord, Geometry, GpsFix, PartialExif, PixelFormat};

/// Hardware controls the session writes, named by role
///
/// The numeric control IDs differ per driver generation; the V4L2 backend
/// owns that mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlId {
    JpegQuality,
    /// Packed still resolution, `(width << 16) | height`
    JpegResolution,
    /// Camera/movie sensor scenario
    SensorMode,
    /// ISP firmware format scenario (managed-ISP sensors)
    FormatScenario,
    /// ISP firmware running scenario (managed-ISP sensors)
    ScenarioMode,
    ObjectPositionX,
    ObjectPositionY,
    Zoom,
    SceneMode,
    FlashMode,
    /// Combined AE/AWB lock, bit 0 locks AE, bit 1 locks AWB
    AeAwbLock,
    FocusMode,
    Brightness,
    Antibanding,
    WhiteBalance,
    Effect,
    Iso,
    AntiShake,
    /// Interleaved transfer mode on the hybrid sensor
    HybridMode,
    /// Arms the next interleaved transfer to carry a decoded still
    HybridCapture,
    /// Legacy plain-capture trigger, cleared before arming hybrid capture
    Capture,
    /// Packed focus request, see [`pack_focus_request`]
    FocusRequest,
    FaceDetection,
    /// ISP firmware face-detection command (managed-ISP sensors)
    FaceDetectionCommand,
    Cacheable,
    /// Must be set for the driver to append the metadata block
    EmbeddedData,
    Rotation,
    HorizontalFlip,
    VerticalFlip,
}

/// AE unlocked, AWB unlocked
pub const AEAWB_UNLOCKED: i32 = 0;

pub const FOCUS_REQUEST_OFF: i32 = 0;
pub const FOCUS_REQUEST_ON: i32 = 1;

pub const FACE_DETECTION_OFF: i32 = 0;
pub const FACE_DETECTION_ON: i32 = 1;

/// Pack a focus request with the active preview geometry
///
/// The firmware derives its touch grid from the preview size carried in
/// the upper bits of the request word.
pub fn pack_focus_request(geometry: Geometry) -> i32 {
    FOCUS_REQUEST_ON
        | ((geometry.width as i32 & 0xfff) << 20)
        | ((geometry.height as i32 & 0xfff) << 8)
}

/// Capture-node format negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub geometry: Geometry,
    pub format: PixelFormat,
    /// Sensor-bus geometry when the ISP wants a different window
    pub mbus: Option<Geometry>,
}

/// The capture video node
///
/// One instance per open session. All calls come from either the control
/// thread or the capture loop, serialized by the session's processing
/// lock.
pub trait CaptureDevice: Send {
    /// Negotiate pixel format and resolution
    fn configure(&mut self, config: &CaptureConfig) -> Result<(), HardwareError>;

    /// Ask for a buffer ring; the driver may grant fewer slots
    fn request_buffers(&mut self, count: u32) -> Result<u32, HardwareError>;

    /// Byte length of one ring slot, valid after `request_buffers`
    fn buffer_length(&self) -> Result<usize, HardwareError>;

    fn queue_buffer(&mut self, index: u32) -> Result<(), HardwareError>;

    /// Non-blocking dequeue; `Ok(None)` when no frame is ready yet
    fn dequeue_buffer(&mut self) -> Result<Option<u32>, HardwareError>;

    /// Bounded wait for a frame; `Ok(false)` on timeout
    fn wait_frame(&mut self, timeout: Duration) -> Result<bool, HardwareError>;

    /// Copy the transfer in ring slot `index` into `out`
    fn read_frame(&mut self, index: u32, out: &mut Vec<u8>) -> Result<usize, HardwareError>;

    fn stream_on(&mut self) -> Result<(), HardwareError>;

    fn stream_off(&mut self) -> Result<(), HardwareError>;

    fn set_frame_rate(&mut self, fps: i32) -> Result<(), HardwareError>;

    fn set_control(&mut self, id: ControlId, value: i32) -> Result<(), HardwareError>;

    fn get_control(&mut self, id: ControlId) -> Result<i32, HardwareError>;

    /// Hardware face-detection records for the current frame
    /// (managed-ISP sensors publish these through an extended control)
    fn read_faces(&mut self, max_faces: usize) -> Result<Vec<FaceRecord>, HardwareError>;
}

/// One conversion job through the resizing/format engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalerConfig {
    pub source: Geometry,
    pub source_format: PixelFormat,
    pub target: Geometry,
    pub target_format: PixelFormat,
    /// Ring depth on the output side
    pub buffers: u32,
}

/// Scaling and format-conversion path feeding preview and recording
///
/// Mirrors the hardware's start/push/release/stop discipline: a pushed
/// frame occupies an output slot until the consumer releases it.
pub trait ScalerPath: Send {
    fn start(&mut self, config: &ScalerConfig) -> Result<(), HardwareError>;

    /// Convert one frame; the result lands in `out` and occupies the
    /// returned output slot
    fn push(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<u32, HardwareError>;

    /// Hand the oldest outstanding output slot back to the engine
    fn release(&mut self) -> Result<(), HardwareError>;

    fn stop(&mut self);
}

/// Shared block handed out by a [`FrameAllocator`]
#[derive(Debug)]
pub struct FrameMemory {
    data: Vec<u8>,
    chunk_len: usize,
    count: usize,
}

impl FrameMemory {
    pub fn new(chunk_len: usize, count: usize) -> Self {
        Self {
            data: vec![0; chunk_len * count],
            chunk_len,
            count,
        }
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn chunk(&self, index: usize) -> &[u8] {
        let start = index * self.chunk_len;
        &self.data[start..start + self.chunk_len]
    }

    pub fn chunk_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.chunk_len;
        &mut self.data[start..start + self.chunk_len]
    }

    /// Take the backing storage, consuming the block
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Shared-memory pool collaborator
///
/// Allocation failure is the resource-acquisition error path: callers must
/// drop whatever they already acquired for the same job and surface one
/// error notification.
pub trait FrameAllocator: Send {
    fn allocate(&mut self, chunk_len: usize, count: usize) -> HalResult<FrameMemory>;
}

/// Plain heap-backed allocator, the default
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl FrameAllocator for HeapAllocator {
    fn allocate(&mut self, chunk_len: usize, count: usize) -> HalResult<FrameMemory> {
        if chunk_len == 0 || count == 0 {
            return Err(HalError::ResourceAcquisition(format!(
                "refusing empty allocation ({chunk_len} x {count})"
            )));
        }
        Ok(FrameMemory::new(chunk_len, count))
    }
}

/// Still-image encode job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeRequest {
    pub source: Geometry,
    pub source_format: PixelFormat,
    /// Output geometry; the encoder scales when it differs from the source
    pub target: Geometry,
    pub quality: u8,
}

/// Still encoder collaborator
pub trait ImageCompressor: Send {
    fn encode(&mut self, request: &EncodeRequest, data: &[u8], out: &mut Vec<u8>) -> HalResult<()>;
}

/// Input to EXIF segment assembly
#[derive(Debug, Clone, Copy)]
pub struct ExifRequest<'a> {
    /// Final picture geometry
    pub geometry: Geometry,
    /// Sensor-reported exposure fields
    pub exif: &'a PartialExif,
    /// Location fix to emit as a GPS IFD, when set
    pub gps: Option<GpsFix>,
    /// Encoded thumbnail to embed, if one was produced
    pub thumbnail: Option<&'a [u8]>,
    pub maker: &'a str,
    pub model: &'a str,
    /// Sensor mounting orientation, degrees
    pub orientation: i32,
}

/// EXIF writer collaborator
pub trait ExifComposer: Send {
    /// Build the APP1 segment spliced between the JPEG start marker and
    /// the picture body
    fn compose(&mut self, request: &ExifRequest<'_>) -> HalResult<Vec<u8>>;
}

/// Client-owned display surface for preview frames
pub trait PreviewWindow: Send {
    fn configure(&mut self, buffers: u32, geometry: Geometry, format: PixelFormat) -> HalResult<()>;

    fn push(&mut self, frame: &[u8]) -> HalResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn focus_request_packs_preview_geometry() {
        let packed = pack_focus_request(Geometry::new(960, 720));
        assert_eq!(packed & 0xff, FOCUS_REQUEST_ON);
        assert_eq!((packed >> 20) & 0xfff, 960);
        assert_eq!((packed >> 8) & 0xfff, 720);
    }

    #[test]
    fn frame_memory_chunks_do_not_overlap() {
        let mut memory = FrameMemory::new(4, 3);
        memory.chunk_mut(1).copy_from_slice(&[1, 1, 1, 1]);
        assert_eq!(memory.chunk(0), &[0, 0, 0, 0]);
        assert_eq!(memory.chunk(1), &[1, 1, 1, 1]);
        assert_eq!(memory.chunk(2), &[0, 0, 0, 0]);
    }

    #[test]
    fn heap_allocator_rejects_empty_requests() {
        let mut allocator = HeapAllocator;
        assert!(allocator.allocate(0, 4).is_err());
        assert!(allocator.allocate(16, 2).is_ok());
    }
}
