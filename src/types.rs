// SPDX-License-Identifier: GPL-3.0-only
// Shared types for the HAL core

//! Shared types for capture buffers, decoded frames and sink payloads

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Width/height pair in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse a `WxH` size string
    pub fn parse(value: &str) -> Option<Self> {
        let (w, h) = value.trim().split_once('x')?;
        Some(Self {
            width: w.parse().ok()?,
            height: h.parse().ok()?,
        })
    }

    pub fn pixels(&self) -> u32 {
        self.width * self.height
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel formats the capture and output paths deal in
///
/// Plane sizes for the 4:2:0 formats are page-aligned separately, matching
/// what the sensor DMA actually writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Semi-planar 4:2:0, Y plane + interleaved VU (the default preview format)
    Nv21,
    /// Semi-planar 4:2:0 with UV chroma order, what the video encoder consumes
    Nv12,
    /// Planar 4:2:0, separate Y, U, V planes
    Yuv420p,
    /// Packed 4:2:2, Y0 U Y1 V
    Yuyv,
    /// Packed 4:2:2, U Y0 V Y1 (front sensor output)
    Uyvy,
    /// 16-bit RGB
    Rgb565,
    /// 32-bit RGB
    Rgb32,
    /// Compressed still image
    Jpeg,
    /// Hybrid sensor transfer: YUYV scanlines interleaved with JPEG bytes
    Interleaved,
}

/// Plane alignment used by the sensor DMA engine
const PLANE_ALIGN: u32 = 0x1000;

pub(crate) fn align_plane(value: u32) -> u32 {
    (value + PLANE_ALIGN - 1) & !(PLANE_ALIGN - 1)
}

impl PixelFormat {
    /// Parse a textual parameter-table format token
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "yuv420sp" => Some(Self::Nv21),
            "yuv420p" => Some(Self::Yuv420p),
            "yuv422i-yuyv" => Some(Self::Yuyv),
            "uyvy422i" => Some(Self::Uyvy),
            "rgb565" => Some(Self::Rgb565),
            "rgb8888" => Some(Self::Rgb32),
            "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    /// The parameter-table token for this format
    ///
    /// NV12 reports the same token as NV21: the table only ever advertises
    /// `yuv420sp`, the UV ordering is an encoder-side distinction.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Nv21 | Self::Nv12 => "yuv420sp",
            Self::Yuv420p => "yuv420p",
            Self::Yuyv => "yuv422i-yuyv",
            Self::Uyvy => "uyvy422i",
            Self::Rgb565 => "rgb565",
            Self::Rgb32 => "rgb8888",
            Self::Jpeg => "jpeg",
            Self::Interleaved => "interleaved",
        }
    }

    /// Byte length of one frame at the given geometry
    ///
    /// 4:2:0 formats align each plane to the DMA page size; packed formats
    /// are a plain width*height*bpp product. JPEG and interleaved transfers
    /// have no intrinsic length, callers size those from the profile.
    pub fn buffer_length(&self, geometry: Geometry) -> usize {
        let pixels = geometry.pixels();
        match self {
            Self::Nv21 | Self::Nv12 => (align_plane(pixels) + align_plane(pixels / 2)) as usize,
            Self::Yuv420p => (align_plane(pixels) + align_plane(pixels / 4) * 2) as usize,
            Self::Yuyv | Self::Uyvy | Self::Rgb565 => (pixels * 2) as usize,
            Self::Rgb32 => (pixels * 4) as usize,
            Self::Jpeg | Self::Interleaved => (pixels * 2) as usize,
        }
    }

    /// Offset of the chroma plane within a frame, for planar formats
    pub fn chroma_offset(&self, geometry: Geometry) -> Option<u32> {
        match self {
            Self::Nv21 | Self::Nv12 | Self::Yuv420p => Some(align_plane(geometry.pixels())),
            _ => None,
        }
    }
}

/// Detected-face rectangle, confidence score and tracking id
///
/// Rectangle components are in the sensor's [-1000, 1000] coordinate space,
/// ordered left, top, right, bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaceRecord {
    pub rect: [i16; 4],
    pub score: i16,
    pub id: i16,
}

/// Client-supplied location fix, attached to stills while set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    /// Signed decimal degrees
    pub latitude: f64,
    /// Signed decimal degrees
    pub longitude: f64,
    /// Meters, negative below sea level
    pub altitude: f64,
    /// UTC seconds
    pub timestamp: i64,
}

/// EXIF fields the sensor embeds in the interleaved metadata block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartialExif {
    /// Flash fired flag as reported by the sensor
    pub flash: u8,
    pub iso: u16,
    pub brightness: u8,
    pub exposure_bias: i16,
    /// Denominator of the 1/x exposure time
    pub exposure_time_den: u16,
}

/// Result of demultiplexing one hybrid capture buffer
#[derive(Debug, Clone, Default)]
pub struct FrameDescriptor {
    /// Total YUV bytes copied out (scanlines * width * 2)
    pub yuv_length: usize,
    /// Total compressed-picture bytes copied out
    pub jpeg_length: usize,
    /// Sensor reported a fully decoded still in this transfer
    pub decoded: bool,
    /// Raw auto-focus status code from the metadata block
    pub auto_focus_status: u8,
    pub faces: Vec<FaceRecord>,
    pub exif: PartialExif,
}

/// Metadata-mode recording payload: buffer coordinates instead of pixels
///
/// Serialized little-endian in field order, sized to what the encoder
/// expects for a camera-source metadata buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordingAddresses {
    /// Metadata buffer type, 0 for camera source
    pub kind: u32,
    pub index: u32,
    /// Physical/shared address of the Y plane
    pub y: u32,
    /// Physical/shared address of the CbCr plane
    pub cbcr: u32,
}

impl RecordingAddresses {
    pub const ENCODED_LEN: usize = 16;

    /// Serialize into the recording sink's wire layout
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.kind.to_le_bytes());
        out[4..8].copy_from_slice(&self.index.to_le_bytes());
        out[8..12].copy_from_slice(&self.y.to_le_bytes());
        out[12..16].copy_from_slice(&self.cbcr.to_le_bytes());
        out
    }
}

/// Payload variants carried by a sink delivery
#[derive(Debug, Clone)]
pub enum SinkPayload {
    /// Pixel or compressed bytes
    Bytes(Arc<[u8]>),
    /// Metadata-mode recording coordinates
    Addresses(RecordingAddresses),
    /// Face-detection records for the frame
    Faces(Vec<FaceRecord>),
}

impl SinkPayload {
    /// Byte length of the payload as delivered
    pub fn len(&self) -> usize {
        match self {
            SinkPayload::Bytes(data) => data.len(),
            SinkPayload::Addresses(_) => RecordingAddresses::ENCODED_LEN,
            SinkPayload::Faces(faces) => faces.len() * std::mem::size_of::<FaceRecord>(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The one descriptor every sink receives, regardless of output path
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub payload: SinkPayload,
    /// Hardware buffer index this payload originated from
    pub index: usize,
    pub geometry: Geometry,
    pub format: PixelFormat,
}

impl BufferDescriptor {
    pub fn bytes(data: Arc<[u8]>, index: usize, geometry: Geometry, format: PixelFormat) -> Self {
        Self {
            payload: SinkPayload::Bytes(data),
            index,
            geometry,
            format,
        }
    }
}

/// Client notification classes, maskable through the session surface
///
/// Values match the classic Android camera message bits so a shim layer can
/// pass masks through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKind(pub u32);

impl MessageKind {
    pub const ERROR: MessageKind = MessageKind(0x0001);
    pub const SHUTTER: MessageKind = MessageKind(0x0002);
    pub const FOCUS: MessageKind = MessageKind(0x0004);
    pub const ZOOM: MessageKind = MessageKind(0x0008);
    pub const PREVIEW_FRAME: MessageKind = MessageKind(0x0010);
    pub const VIDEO_FRAME: MessageKind = MessageKind(0x0020);
    pub const POSTVIEW_FRAME: MessageKind = MessageKind(0x0040);
    pub const RAW_IMAGE: MessageKind = MessageKind(0x0080);
    pub const COMPRESSED_IMAGE: MessageKind = MessageKind(0x0100);
    pub const RAW_IMAGE_NOTIFY: MessageKind = MessageKind(0x0200);
    pub const PREVIEW_METADATA: MessageKind = MessageKind(0x0400);
    pub const FOCUS_MOVE: MessageKind = MessageKind(0x0800);
    pub const ALL: MessageKind = MessageKind(0x0FFF);
    pub const NONE: MessageKind = MessageKind(0);

    pub fn contains(&self, other: MessageKind) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MessageKind) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: MessageKind) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for MessageKind {
    type Output = MessageKind;

    fn bitor(self, rhs: MessageKind) -> MessageKind {
        MessageKind(self.0 | rhs.0)
    }
}

/// Which way a sensor faces, for the enumeration surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraFacing {
    Back,
    Front,
}

impl std::fmt::Display for CameraFacing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraFacing::Back => write!(f, "back"),
            CameraFacing::Front => write!(f, "front"),
        }
    }
}
