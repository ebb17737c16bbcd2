// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 implementation of the capture-node trait
//!
//! The node is opened through the `v4l` crate for capability discovery;
//! everything past that goes through raw ioctls, because the ring
//! discipline the sensors want (explicit qbuf/dqbuf with the trailing
//! metadata block intact) does not fit the crate's stream abstraction.
//! Control IDs live in the driver's private block and are mapped from the
//! role-named [`ControlId`] here.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use v4l::Device;

use crate::errors::HardwareError;
use crate::hw::{CaptureConfig, CaptureDevice, ControlId};
use crate::types::{FaceRecord, PixelFormat};

const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// Driver fourcc for each pixel format we negotiate
fn pixel_fourcc(format: PixelFormat) -> u32 {
    match format {
        PixelFormat::Nv21 => fourcc(b'N', b'V', b'2', b'1'),
        PixelFormat::Nv12 => fourcc(b'N', b'V', b'1', b'2'),
        PixelFormat::Yuv420p => fourcc(b'Y', b'U', b'1', b'2'),
        PixelFormat::Yuyv => fourcc(b'Y', b'U', b'Y', b'V'),
        PixelFormat::Uyvy => fourcc(b'U', b'Y', b'V', b'Y'),
        PixelFormat::Rgb565 => fourcc(b'R', b'G', b'B', b'P'),
        PixelFormat::Rgb32 => fourcc(b'R', b'G', b'B', b'4'),
        PixelFormat::Jpeg => fourcc(b'J', b'P', b'E', b'G'),
        // Vendor fourcc for the hybrid interleaved transfer
        PixelFormat::Interleaved => fourcc(b'I', b'T', b'L', b'V'),
    }
}

/// The driver's private control block
///
/// These sit above `V4L2_CID_PRIVATE_BASE` in the vendor kernel; the
/// role-to-id mapping is the only place the raw numbers appear.
mod cid {
    const BASE: u32 = 0x0800_0000;

    pub const JPEG_QUALITY: u32 = BASE + 0x11;
    pub const JPEG_RESOLUTION: u32 = BASE + 0x12;
    pub const SENSOR_MODE: u32 = BASE + 0x20;
    pub const FORMAT_SCENARIO: u32 = BASE + 0x21;
    pub const SCENARIO_MODE: u32 = BASE + 0x22;
    pub const OBJECT_POSITION_X: u32 = BASE + 0x30;
    pub const OBJECT_POSITION_Y: u32 = BASE + 0x31;
    pub const ZOOM: u32 = BASE + 0x32;
    pub const SCENE_MODE: u32 = BASE + 0x33;
    pub const FLASH_MODE: u32 = BASE + 0x34;
    pub const AEAWB_LOCK: u32 = BASE + 0x35;
    pub const FOCUS_MODE: u32 = BASE + 0x36;
    pub const BRIGHTNESS: u32 = BASE + 0x37;
    pub const ANTIBANDING: u32 = BASE + 0x38;
    pub const WHITE_BALANCE: u32 = BASE + 0x39;
    pub const EFFECT: u32 = BASE + 0x3a;
    pub const ISO: u32 = BASE + 0x3b;
    pub const ANTI_SHAKE: u32 = BASE + 0x3c;
    pub const HYBRID_MODE: u32 = BASE + 0x40;
    pub const HYBRID_CAPTURE: u32 = BASE + 0x41;
    pub const CAPTURE: u32 = BASE + 0x42;
    pub const FOCUS_REQUEST: u32 = BASE + 0x43;
    pub const FACE_DETECTION: u32 = BASE + 0x44;
    pub const FACE_DETECTION_CMD: u32 = BASE + 0x45;
    pub const FACE_DETECTION_DATA: u32 = BASE + 0x46;
    pub const CACHEABLE: u32 = BASE + 0x50;
    pub const EMBEDDED_DATA: u32 = BASE + 0x51;
    pub const ROTATION: u32 = BASE + 0x52;
    pub const HFLIP: u32 = BASE + 0x53;
    pub const VFLIP: u32 = BASE + 0x54;
}

fn control_cid(id: ControlId) -> u32 {
    match id {
        ControlId::JpegQuality => cid::JPEG_QUALITY,
        ControlId::JpegResolution => cid::JPEG_RESOLUTION,
        ControlId::SensorMode => cid::SENSOR_MODE,
        ControlId::FormatScenario => cid::FORMAT_SCENARIO,
        ControlId::ScenarioMode => cid::SCENARIO_MODE,
        ControlId::ObjectPositionX => cid::OBJECT_POSITION_X,
        ControlId::ObjectPositionY => cid::OBJECT_POSITION_Y,
        ControlId::Zoom => cid::ZOOM,
        ControlId::SceneMode => cid::SCENE_MODE,
        ControlId::FlashMode => cid::FLASH_MODE,
        ControlId::AeAwbLock => cid::AEAWB_LOCK,
        ControlId::FocusMode => cid::FOCUS_MODE,
        ControlId::Brightness => cid::BRIGHTNESS,
        ControlId::Antibanding => cid::ANTIBANDING,
        ControlId::WhiteBalance => cid::WHITE_BALANCE,
        ControlId::Effect => cid::EFFECT,
        ControlId::Iso => cid::ISO,
        ControlId::AntiShake => cid::ANTI_SHAKE,
        ControlId::HybridMode => cid::HYBRID_MODE,
        ControlId::HybridCapture => cid::HYBRID_CAPTURE,
        ControlId::Capture => cid::CAPTURE,
        ControlId::FocusRequest => cid::FOCUS_REQUEST,
        ControlId::FaceDetection => cid::FACE_DETECTION,
        ControlId::FaceDetectionCommand => cid::FACE_DETECTION_CMD,
        ControlId::Cacheable => cid::CACHEABLE,
        ControlId::EmbeddedData => cid::EMBEDDED_DATA,
        ControlId::Rotation => cid::ROTATION,
        ControlId::HorizontalFlip => cid::HFLIP,
        ControlId::VerticalFlip => cid::VFLIP,
    }
}

// VIDIOC request plumbing, the kernel's _IOC encoding
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, nr: u64, size: u64) -> u64 {
    (dir << 30) | (size << 16) | ((b'V' as u64) << 8) | nr
}

const fn iowr(nr: u64, size: usize) -> u64 {
    ioc(IOC_READ | IOC_WRITE, nr, size as u64)
}

const fn iow(nr: u64, size: usize) -> u64 {
    ioc(IOC_WRITE, nr, size as u64)
}

const BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const MEMORY_MMAP: u32 = 1;
const FIELD_NONE: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PixFormat {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
}

#[repr(C)]
union FormatUnion {
    pix: PixFormat,
    raw: [u8; 200],
}

#[repr(C)]
struct Format {
    type_: u32,
    fmt: FormatUnion,
}

#[repr(C)]
#[derive(Default)]
struct RequestBuffers {
    count: u32,
    type_: u32,
    memory: u32,
    reserved: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Timecode {
    type_: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
union BufferM {
    offset: u32,
    userptr: libc::c_ulong,
    fd: i32,
}

#[repr(C)]
struct Buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: Timecode,
    sequence: u32,
    memory: u32,
    m: BufferM,
    length: u32,
    reserved2: u32,
    reserved: u32,
}

impl Buffer {
    fn zeroed(index: u32) -> Self {
        Self {
            index,
            type_: BUF_TYPE_VIDEO_CAPTURE,
            bytesused: 0,
            flags: 0,
            field: 0,
            timestamp: libc::timeval { tv_sec: 0, tv_usec: 0 },
            timecode: Timecode::default(),
            sequence: 0,
            memory: MEMORY_MMAP,
            m: BufferM { offset: 0 },
            length: 0,
            reserved2: 0,
            reserved: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Fract {
    numerator: u32,
    denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CaptureParm {
    capability: u32,
    capturemode: u32,
    timeperframe: Fract,
    extendedmode: u32,
    readbuffers: u32,
    reserved: [u32; 4],
}

#[repr(C)]
union ParmUnion {
    capture: CaptureParm,
    raw: [u8; 200],
}

#[repr(C)]
struct StreamParm {
    type_: u32,
    parm: ParmUnion,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Control {
    id: u32,
    value: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
union ExtControlValue {
    value: i32,
    value64: i64,
    ptr: *mut libc::c_void,
}

#[repr(C)]
struct ExtControl {
    id: u32,
    size: u32,
    reserved2: [u32; 1],
    value: ExtControlValue,
}

#[repr(C)]
struct ExtControls {
    which: u32,
    count: u32,
    error_idx: u32,
    reserved: [u32; 2],
    controls: *mut ExtControl,
}

const VIDIOC_S_FMT: u64 = iowr(5, std::mem::size_of::<Format>());
const VIDIOC_REQBUFS: u64 = iowr(8, std::mem::size_of::<RequestBuffers>());
const VIDIOC_QUERYBUF: u64 = iowr(9, std::mem::size_of::<Buffer>());
const VIDIOC_QBUF: u64 = iowr(15, std::mem::size_of::<Buffer>());
const VIDIOC_DQBUF: u64 = iowr(17, std::mem::size_of::<Buffer>());
const VIDIOC_STREAMON: u64 = iow(18, std::mem::size_of::<i32>());
const VIDIOC_STREAMOFF: u64 = iow(19, std::mem::size_of::<i32>());
const VIDIOC_S_PARM: u64 = iowr(22, std::mem::size_of::<StreamParm>());
const VIDIOC_G_CTRL: u64 = iowr(27, std::mem::size_of::<Control>());
const VIDIOC_S_CTRL: u64 = iowr(28, std::mem::size_of::<Control>());
const VIDIOC_G_EXT_CTRLS: u64 = iowr(71, std::mem::size_of::<ExtControls>());

/// One mmapped ring slot
struct MappedSlot {
    ptr: *mut libc::c_void,
    len: usize,
    /// Bytes the driver reported used on the last dequeue
    used: usize,
}

// The mapping is private to this device and only touched under the
// session's processing lock
unsafe impl Send for MappedSlot {}

impl Drop for MappedSlot {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

/// Capture node backed by a real video device
pub struct V4l2CaptureDevice {
    device: Device,
    slots: Vec<MappedSlot>,
    streaming: bool,
}

impl V4l2CaptureDevice {
    pub fn open(path: &Path) -> Result<Self, HardwareError> {
        let device = Device::with_path(path)
            .map_err(|err| HardwareError::Open(format!("{}: {err}", path.display())))?;
        match device.query_caps() {
            Ok(caps) => info!(node = %path.display(), card = %caps.card, "opened capture node"),
            Err(err) => debug!(node = %path.display(), %err, "capability query failed"),
        }
        Ok(Self {
            device,
            slots: Vec::new(),
            streaming: false,
        })
    }

    fn fd(&self) -> i32 {
        self.device.handle().fd()
    }

    fn ioctl<T>(&self, request: u64, argument: &mut T) -> std::io::Result<()> {
        let result = unsafe { libc::ioctl(self.fd(), request as _, argument as *mut T) };
        if result < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn unmap_ring(&mut self) {
        self.slots.clear();
    }
}

impl CaptureDevice for V4l2CaptureDevice {
    fn configure(&mut self, config: &CaptureConfig) -> Result<(), HardwareError> {
        // The ISP may want a wider sensor-bus window than the client size
        let geometry = config.mbus.unwrap_or(config.geometry);
        let mut format = Format {
            type_: BUF_TYPE_VIDEO_CAPTURE,
            fmt: FormatUnion { raw: [0; 200] },
        };
        format.fmt.pix = PixFormat {
            width: geometry.width,
            height: geometry.height,
            pixelformat: pixel_fourcc(config.format),
            field: FIELD_NONE,
            bytesperline: 0,
            sizeimage: config.format.buffer_length(config.geometry) as u32,
            colorspace: 0,
            priv_: 0,
        };
        self.ioctl(VIDIOC_S_FMT, &mut format)
            .map_err(|err| HardwareError::Format(format!("{} {}: {err}", config.geometry, config.format.token())))?;
        let negotiated = unsafe { format.fmt.pix };
        debug!(
            requested = %config.geometry,
            bus = %geometry,
            sizeimage = negotiated.sizeimage,
            "format negotiated"
        );
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, HardwareError> {
        self.unmap_ring();
        let mut request = RequestBuffers {
            count,
            type_: BUF_TYPE_VIDEO_CAPTURE,
            memory: MEMORY_MMAP,
            reserved: [0; 2],
        };
        self.ioctl(VIDIOC_REQBUFS, &mut request)
            .map_err(|err| HardwareError::Buffer(format!("reqbufs {count}: {err}")))?;

        for index in 0..request.count {
            let mut buffer = Buffer::zeroed(index);
            self.ioctl(VIDIOC_QUERYBUF, &mut buffer)
                .map_err(|err| HardwareError::Buffer(format!("querybuf {index}: {err}")))?;
            let offset = unsafe { buffer.m.offset };
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    buffer.length as usize,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self.fd(),
                    offset as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                self.unmap_ring();
                return Err(HardwareError::Buffer(format!(
                    "mmap slot {index}: {}",
                    std::io::Error::last_os_error()
                )));
            }
            self.slots.push(MappedSlot {
                ptr,
                len: buffer.length as usize,
                used: 0,
            });
        }
        Ok(request.count)
    }

    fn buffer_length(&self) -> Result<usize, HardwareError> {
        self.slots
            .first()
            .map(|slot| slot.len)
            .ok_or_else(|| HardwareError::Buffer("no ring mapped".into()))
    }

    fn queue_buffer(&mut self, index: u32) -> Result<(), HardwareError> {
        let mut buffer = Buffer::zeroed(index);
        self.ioctl(VIDIOC_QBUF, &mut buffer)
            .map_err(|err| HardwareError::Buffer(format!("qbuf {index}: {err}")))
    }

    fn dequeue_buffer(&mut self) -> Result<Option<u32>, HardwareError> {
        let mut buffer = Buffer::zeroed(0);
        buffer.index = 0;
        match self.ioctl(VIDIOC_DQBUF, &mut buffer) {
            Ok(()) => {
                if let Some(slot) = self.slots.get_mut(buffer.index as usize) {
                    slot.used = buffer.bytesused as usize;
                }
                Ok(Some(buffer.index))
            }
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => Ok(None),
            Err(err) => Err(HardwareError::Buffer(format!("dqbuf: {err}"))),
        }
    }

    fn wait_frame(&mut self, timeout: Duration) -> Result<bool, HardwareError> {
        let mut fds = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ready = unsafe { libc::poll(&mut fds, 1, millis) };
        if ready < 0 {
            return Err(HardwareError::Buffer(format!(
                "poll: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(ready > 0 && fds.revents & libc::POLLIN != 0)
    }

    fn read_frame(&mut self, index: u32, out: &mut Vec<u8>) -> Result<usize, HardwareError> {
        let slot = self
            .slots
            .get(index as usize)
            .ok_or_else(|| HardwareError::Buffer(format!("slot {index} not mapped")))?;
        let len = if slot.used > 0 { slot.used.min(slot.len) } else { slot.len };
        out.clear();
        out.extend_from_slice(unsafe { std::slice::from_raw_parts(slot.ptr as *const u8, len) });
        Ok(len)
    }

    fn stream_on(&mut self) -> Result<(), HardwareError> {
        let mut type_: i32 = BUF_TYPE_VIDEO_CAPTURE as i32;
        self.ioctl(VIDIOC_STREAMON, &mut type_)
            .map_err(|err| HardwareError::Stream(format!("stream on: {err}")))?;
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<(), HardwareError> {
        let mut type_: i32 = BUF_TYPE_VIDEO_CAPTURE as i32;
        self.ioctl(VIDIOC_STREAMOFF, &mut type_)
            .map_err(|err| HardwareError::Stream(format!("stream off: {err}")))?;
        self.streaming = false;
        self.unmap_ring();
        Ok(())
    }

    fn set_frame_rate(&mut self, fps: i32) -> Result<(), HardwareError> {
        if fps <= 0 {
            return Err(HardwareError::Format(format!("frame rate {fps}")));
        }
        let mut parm = StreamParm {
            type_: BUF_TYPE_VIDEO_CAPTURE,
            parm: ParmUnion { raw: [0; 200] },
        };
        parm.parm.capture = CaptureParm {
            timeperframe: Fract {
                numerator: 1,
                denominator: fps as u32,
            },
            ..CaptureParm::default()
        };
        self.ioctl(VIDIOC_S_PARM, &mut parm)
            .map_err(|err| HardwareError::Format(format!("frame rate {fps}: {err}")))
    }

    fn set_control(&mut self, id: ControlId, value: i32) -> Result<(), HardwareError> {
        let mut control = Control {
            id: control_cid(id),
            value,
        };
        self.ioctl(VIDIOC_S_CTRL, &mut control)
            .map_err(|err| HardwareError::ControlWrite(format!("{id:?}={value}: {err}")))
    }

    fn get_control(&mut self, id: ControlId) -> Result<i32, HardwareError> {
        let mut control = Control {
            id: control_cid(id),
            value: 0,
        };
        self.ioctl(VIDIOC_G_CTRL, &mut control)
            .map_err(|err| HardwareError::ControlWrite(format!("{id:?}: {err}")))?;
        Ok(control.value)
    }

    fn read_faces(&mut self, max_faces: usize) -> Result<Vec<FaceRecord>, HardwareError> {
        if max_faces == 0 {
            return Ok(Vec::new());
        }
        // One leading count byte, then packed little-endian records
        const RECORD_LEN: usize = 12;
        let mut raw = vec![0u8; 1 + max_faces * RECORD_LEN];
        let mut control = ExtControl {
            id: cid::FACE_DETECTION_DATA,
            size: raw.len() as u32,
            reserved2: [0; 1],
            value: ExtControlValue {
                ptr: raw.as_mut_ptr() as *mut libc::c_void,
            },
        };
        let mut controls = ExtControls {
            which: 0,
            count: 1,
            error_idx: 0,
            reserved: [0; 2],
            controls: &mut control,
        };
        if let Err(err) = self.ioctl(VIDIOC_G_EXT_CTRLS, &mut controls) {
            warn!(%err, "face data readout failed");
            return Ok(Vec::new());
        }

        let count = (raw[0] as usize).min(max_faces);
        let mut faces = Vec::with_capacity(count);
        for index in 0..count {
            let at = 1 + index * RECORD_LEN;
            let record = &raw[at..at + RECORD_LEN];
            let field =
                |offset: usize| i16::from_le_bytes([record[offset], record[offset + 1]]);
            faces.push(FaceRecord {
                rect: [field(0), field(2), field(4), field(6)],
                score: field(8),
                id: field(10),
            });
        }
        Ok(faces)
    }
}

impl Drop for V4l2CaptureDevice {
    fn drop(&mut self) {
        if self.streaming {
            let _ = self.stream_off();
        }
        self.unmap_ring();
    }
}
