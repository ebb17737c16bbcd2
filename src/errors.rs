// SPDX-License-Identifier: MPL-2.0

//! Error types for the camera HAL

use std::fmt;

/// Result type alias using HalError
pub type HalResult<T> = Result<T, HalError>;

/// Main HAL error type
#[derive(Debug, Clone)]
pub enum HalError {
    /// Malformed or out-of-range parameter value; the offending key has
    /// been rolled back to its last accepted value
    InvalidArgument(String),
    /// Hardware access errors
    Hardware(HardwareError),
    /// Interleaved-frame decode violations (per-frame, non-fatal)
    Decode(DecodeError),
    /// Shared-memory or buffer pool acquisition failed
    ResourceAcquisition(String),
    /// A worker thread did not confirm exit within the stop bound
    ThreadStopTimeout(String),
    /// Operation not supported by the active device profile
    Unsupported(String),
    /// Filesystem/configuration errors
    Io(String),
    /// Generic error with message
    Other(String),
}

/// Hardware access errors
#[derive(Debug, Clone)]
pub enum HardwareError {
    /// Video node could not be opened
    Open(String),
    /// Format negotiation rejected
    Format(String),
    /// A control write was refused by the driver
    ControlWrite(String),
    /// Buffer request/queue/dequeue failed
    Buffer(String),
    /// Stream on/off failed
    Stream(String),
}

/// Interleaved-frame decode violations
#[derive(Debug, Clone)]
pub enum DecodeError {
    /// Pointer array smaller than one entry per image row
    PointerArrayTooSmall { size: u32, required: u32 },
    /// A scanline offset or array bound points past the end of the buffer
    OffsetOutOfBounds { offset: u32, limit: u32 },
    /// First compressed gap does not start with the JPEG SOI marker
    MissingJpegMarker,
    /// Capture buffer too short to hold the trailing metadata block
    ShortBuffer { len: usize, required: usize },
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            HalError::Hardware(e) => write!(f, "Hardware error: {}", e),
            HalError::Decode(e) => write!(f, "Frame decode error: {}", e),
            HalError::ResourceAcquisition(msg) => write!(f, "Resource acquisition failed: {}", msg),
            HalError::ThreadStopTimeout(name) => {
                write!(f, "Thread '{}' did not stop within the bound", name)
            }
            HalError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            HalError::Io(msg) => write!(f, "I/O error: {}", msg),
            HalError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareError::Open(msg) => write!(f, "Failed to open node: {}", msg),
            HardwareError::Format(msg) => write!(f, "Format negotiation failed: {}", msg),
            HardwareError::ControlWrite(msg) => write!(f, "Control write failed: {}", msg),
            HardwareError::Buffer(msg) => write!(f, "Buffer operation failed: {}", msg),
            HardwareError::Stream(msg) => write!(f, "Stream toggle failed: {}", msg),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::PointerArrayTooSmall { size, required } => {
                write!(f, "Pointer array size {} below required {}", size, required)
            }
            DecodeError::OffsetOutOfBounds { offset, limit } => {
                write!(f, "Scanline offset {:#x} beyond buffer end {:#x}", offset, limit)
            }
            DecodeError::MissingJpegMarker => write!(f, "First gap lacks JPEG SOI marker"),
            DecodeError::ShortBuffer { len, required } => {
                write!(f, "Buffer length {} below metadata minimum {}", len, required)
            }
        }
    }
}

impl std::error::Error for HalError {}
impl std::error::Error for HardwareError {}
impl std::error::Error for DecodeError {}

// Conversions from sub-errors to HalError
impl From<HardwareError> for HalError {
    fn from(err: HardwareError) -> Self {
        HalError::Hardware(err)
    }
}

impl From<DecodeError> for HalError {
    fn from(err: DecodeError) -> Self {
        HalError::Decode(err)
    }
}

impl From<String> for HalError {
    fn from(msg: String) -> Self {
        HalError::Other(msg)
    }
}

impl From<&str> for HalError {
    fn from(msg: &str) -> Self {
        HalError::Other(msg.to_string())
    }
}

// Conversions for I/O errors
impl From<std::io::Error> for HalError {
    fn from(err: std::io::Error) -> Self {
        HalError::Io(err.to_string())
    }
}

impl From<std::io::Error> for HardwareError {
    fn from(err: std::io::Error) -> Self {
        HardwareError::Open(err.to_string())
    }
}
