// SPDX-License-Identifier: GPL-3.0-only

//! Camera HAL core for hybrid interleaved-sensor devices
//!
//! Drives the S5C73M3-class sensor pair: a rear hybrid sensor that
//! interleaves preview scanlines with compressed still bytes in a single
//! transfer, and a front sensor running behind the ISP firmware. The crate
//! demultiplexes the hybrid transfers in software, reconciles the textual
//! parameter table against the hardware, and feeds previews, recordings
//! and stills to a client sink.
//!
//! # Architecture
//!
//! - [`session`]: the client-facing surface, one [`session::CameraSession`]
//!   per opened sensor
//! - [`capture`]: the long-lived capture loop and the pipeline core behind
//!   the processing lock
//! - [`demux`]: splits one interleaved transfer into scanlines, still
//!   bytes and the trailing metadata block
//! - [`params`]: parameter table, typed state cache and the delta engine
//!   pushing changes to the hardware
//! - [`picture`]: single-flight still assembly (encode, thumbnail, EXIF
//!   splice)
//! - [`hw`]: collaborator traits, the V4L2 backend and the test doubles
//! - [`profile`]: static capability tables for the supported sensors

pub mod capture;
pub mod config;
pub mod demux;
pub mod errors;
pub mod exif;
pub mod focus;
pub mod hw;
pub mod layout;
pub mod media;
pub mod params;
pub mod picture;
pub mod profile;
pub mod session;
pub mod sink;
pub mod types;

pub use config::HalConfig;
pub use errors::{HalError, HalResult};
pub use profile::DeviceProfile;
pub use session::{CameraSession, Collaborators};
pub use types::{Geometry, MessageKind, PixelFormat};
