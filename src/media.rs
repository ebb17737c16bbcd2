// SPDX-License-Identifier: GPL-3.0-only

//! Software pixel conversion, scaling and JPEG compression
//!
//! The production output paths run through a memory-to-memory resizer
//! node; this module is the CPU implementation behind the same traits,
//! used by sessions without a resizer, by the still pipeline and by the
//! diagnostic CLI. The RGB expansion uses the usual fixed-point BT.601
//! coefficients.

use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use tracing::debug;

use crate::errors::{HalError, HalResult, HardwareError};
use crate::hw::{EncodeRequest, ImageCompressor, ScalerConfig, ScalerPath};
use crate::types::{Geometry, PixelFormat, align_plane};

/// Byte positions of the four samples inside a packed 4:2:2 macropixel
#[derive(Debug, Clone, Copy)]
struct PackedLayout {
    y0: usize,
    u: usize,
    y1: usize,
    v: usize,
}

const YUYV: PackedLayout = PackedLayout {
    y0: 0,
    u: 1,
    y1: 2,
    v: 3,
};

const UYVY: PackedLayout = PackedLayout {
    y0: 1,
    u: 0,
    y1: 3,
    v: 2,
};

fn packed_layout(format: PixelFormat) -> Option<PackedLayout> {
    match format {
        PixelFormat::Yuyv => Some(YUYV),
        PixelFormat::Uyvy => Some(UYVY),
        _ => None,
    }
}

/// Nearest-neighbor scale of a packed 4:2:2 frame
///
/// Samples whole macropixels so the chroma siting never shifts.
fn scale_packed(src: &[u8], from: Geometry, to: Geometry) -> Vec<u8> {
    let mut out = vec![0u8; (to.pixels() * 2) as usize];
    let from_pairs = (from.width / 2) as usize;
    let to_pairs = (to.width / 2) as usize;
    for row in 0..to.height as usize {
        let src_line = (row * from.height as usize / to.height as usize) * from.width as usize * 2;
        let out_line = row * to.width as usize * 2;
        for pair in 0..to_pairs {
            let src_pair = src_line + (pair * from_pairs / to_pairs) * 4;
            let out_pair = out_line + pair * 4;
            out[out_pair..out_pair + 4].copy_from_slice(&src[src_pair..src_pair + 4]);
        }
    }
    out
}

/// Convert one packed 4:2:2 sensor frame to the requested output format,
/// scaling first when the geometries differ
pub fn convert_frame(
    src: &[u8],
    src_format: PixelFormat,
    from: Geometry,
    dst_format: PixelFormat,
    to: Geometry,
    out: &mut Vec<u8>,
) -> HalResult<()> {
    let Some(layout) = packed_layout(src_format) else {
        return Err(HalError::Unsupported(format!(
            "conversion from {}",
            src_format.token()
        )));
    };
    if from.is_zero() || to.is_zero() {
        return Err(HalError::Other(format!(
            "degenerate conversion {from} -> {to}"
        )));
    }
    let needed = (from.pixels() * 2) as usize;
    if src.len() < needed {
        return Err(HalError::Other(format!(
            "short source frame, {} bytes for {from}",
            src.len()
        )));
    }

    let scaled;
    let data = if from == to {
        &src[..needed]
    } else {
        scaled = scale_packed(&src[..needed], from, to);
        scaled.as_slice()
    };

    if dst_format == src_format {
        out.clear();
        out.extend_from_slice(data);
        return Ok(());
    }

    match dst_format {
        PixelFormat::Nv21 => packed_to_semiplanar(data, layout, to, true, out),
        PixelFormat::Nv12 => packed_to_semiplanar(data, layout, to, false, out),
        PixelFormat::Yuv420p => packed_to_planar(data, layout, to, out),
        // The two packed orders differ by a byte swap in each sample pair
        PixelFormat::Yuyv | PixelFormat::Uyvy => {
            out.clear();
            out.reserve(data.len());
            for pair in data.chunks_exact(2) {
                out.push(pair[1]);
                out.push(pair[0]);
            }
        }
        PixelFormat::Rgb565 => packed_to_rgb565(data, layout, to, out),
        PixelFormat::Rgb32 => packed_to_rgb32(data, layout, to, out),
        PixelFormat::Jpeg | PixelFormat::Interleaved => {
            return Err(HalError::Unsupported(format!(
                "conversion to {}",
                dst_format.token()
            )));
        }
    }
    Ok(())
}

/// Downsample packed 4:2:2 into an aligned semi-planar 4:2:0 frame
///
/// Chroma comes from the even rows, odd rows only contribute luma.
fn packed_to_semiplanar(
    src: &[u8],
    layout: PackedLayout,
    geometry: Geometry,
    v_first: bool,
    out: &mut Vec<u8>,
) {
    let width = geometry.width as usize;
    let format = if v_first {
        PixelFormat::Nv21
    } else {
        PixelFormat::Nv12
    };
    out.clear();
    out.resize(format.buffer_length(geometry), 0);
    let chroma_plane = align_plane(geometry.pixels()) as usize;

    for row in 0..geometry.height as usize {
        let line = &src[row * width * 2..][..width * 2];
        let luma_line = row * width;
        let chroma_line = chroma_plane + (row / 2) * width;
        for (pair, macro_px) in line.chunks_exact(4).enumerate() {
            let x = pair * 2;
            out[luma_line + x] = macro_px[layout.y0];
            out[luma_line + x + 1] = macro_px[layout.y1];
            if row % 2 == 0 {
                let (first, second) = if v_first {
                    (macro_px[layout.v], macro_px[layout.u])
                } else {
                    (macro_px[layout.u], macro_px[layout.v])
                };
                out[chroma_line + x] = first;
                out[chroma_line + x + 1] = second;
            }
        }
    }
}

/// Downsample packed 4:2:2 into an aligned three-plane 4:2:0 frame
fn packed_to_planar(src: &[u8], layout: PackedLayout, geometry: Geometry, out: &mut Vec<u8>) {
    let width = geometry.width as usize;
    out.clear();
    out.resize(PixelFormat::Yuv420p.buffer_length(geometry), 0);
    let u_plane = align_plane(geometry.pixels()) as usize;
    let v_plane = u_plane + align_plane(geometry.pixels() / 4) as usize;

    for row in 0..geometry.height as usize {
        let line = &src[row * width * 2..][..width * 2];
        let luma_line = row * width;
        let chroma_line = (row / 2) * (width / 2);
        for (pair, macro_px) in line.chunks_exact(4).enumerate() {
            let x = pair * 2;
            out[luma_line + x] = macro_px[layout.y0];
            out[luma_line + x + 1] = macro_px[layout.y1];
            if row % 2 == 0 {
                out[u_plane + chroma_line + pair] = macro_px[layout.u];
                out[v_plane + chroma_line + pair] = macro_px[layout.v];
            }
        }
    }
}

/// Expand one macropixel into two RGB pixels
#[inline]
fn expand_pair(macro_px: &[u8], layout: PackedLayout) -> ([u8; 3], [u8; 3]) {
    let u = macro_px[layout.u] as i32 - 128;
    let v = macro_px[layout.v] as i32 - 128;

    let r_v = (179 * v) >> 7;
    let g_u = (44 * u) >> 7;
    let g_v = (91 * v) >> 7;
    let b_u = (227 * u) >> 7;

    let y1 = ((macro_px[layout.y0] as i32 - 16) * 149) >> 7;
    let y2 = ((macro_px[layout.y1] as i32 - 16) * 149) >> 7;

    (
        [
            (y1 + r_v).clamp(0, 255) as u8,
            (y1 - g_u - g_v).clamp(0, 255) as u8,
            (y1 + b_u).clamp(0, 255) as u8,
        ],
        [
            (y2 + r_v).clamp(0, 255) as u8,
            (y2 - g_u - g_v).clamp(0, 255) as u8,
            (y2 + b_u).clamp(0, 255) as u8,
        ],
    )
}

fn packed_to_rgb565(src: &[u8], layout: PackedLayout, geometry: Geometry, out: &mut Vec<u8>) {
    out.clear();
    out.reserve((geometry.pixels() * 2) as usize);
    for macro_px in src.chunks_exact(4) {
        let (first, second) = expand_pair(macro_px, layout);
        for [r, g, b] in [first, second] {
            let packed = ((r as u16 & 0xf8) << 8) | ((g as u16 & 0xfc) << 3) | (b as u16 >> 3);
            out.extend_from_slice(&packed.to_le_bytes());
        }
    }
}

fn packed_to_rgb32(src: &[u8], layout: PackedLayout, geometry: Geometry, out: &mut Vec<u8>) {
    out.clear();
    out.reserve((geometry.pixels() * 4) as usize);
    for macro_px in src.chunks_exact(4) {
        let (first, second) = expand_pair(macro_px, layout);
        for [r, g, b] in [first, second] {
            out.extend_from_slice(&[r, g, b, 0xff]);
        }
    }
}

/// Expand a frame into an [`RgbImage`]
///
/// Accepts the packed 4:2:2 sensor formats and the semi-planar preview
/// formats, which covers the still pipeline and CLI decode.
pub fn frame_to_rgb(data: &[u8], format: PixelFormat, geometry: Geometry) -> HalResult<RgbImage> {
    if geometry.is_zero() {
        return Err(HalError::Other(format!("degenerate frame {geometry}")));
    }
    let width = geometry.width as usize;
    let height = geometry.height as usize;
    let mut rgb = vec![0u8; width * height * 3];

    match format {
        PixelFormat::Yuyv | PixelFormat::Uyvy => {
            let layout = if format == PixelFormat::Yuyv {
                YUYV
            } else {
                UYVY
            };
            let needed = width * height * 2;
            if data.len() < needed {
                return Err(HalError::Other(format!(
                    "short frame, {} bytes for {geometry}",
                    data.len()
                )));
            }
            for (row, line) in data[..needed].chunks_exact(width * 2).enumerate() {
                for (pair, macro_px) in line.chunks_exact(4).enumerate() {
                    let (first, second) = expand_pair(macro_px, layout);
                    let at = (row * width + pair * 2) * 3;
                    rgb[at..at + 3].copy_from_slice(&first);
                    rgb[at + 3..at + 6].copy_from_slice(&second);
                }
            }
        }
        PixelFormat::Nv21 | PixelFormat::Nv12 => {
            let chroma_plane = align_plane(geometry.pixels()) as usize;
            let needed = chroma_plane + width * (height + 1) / 2;
            if data.len() < needed {
                return Err(HalError::Other(format!(
                    "short frame, {} bytes for {geometry}",
                    data.len()
                )));
            }
            for row in 0..height {
                for x in (0..width).step_by(2) {
                    let luma = row * width + x;
                    let chroma = chroma_plane + (row / 2) * width + (x / 2) * 2;
                    let (u, v) = if format == PixelFormat::Nv21 {
                        (data[chroma + 1], data[chroma])
                    } else {
                        (data[chroma], data[chroma + 1])
                    };
                    let macro_px = [data[luma], u, data[luma + 1], v];
                    let (first, second) = expand_pair(&macro_px, YUYV);
                    let at = luma * 3;
                    rgb[at..at + 3].copy_from_slice(&first);
                    rgb[at + 3..at + 6].copy_from_slice(&second);
                }
            }
        }
        other => {
            return Err(HalError::Unsupported(format!(
                "RGB expansion from {}",
                other.token()
            )));
        }
    }

    RgbImage::from_raw(geometry.width, geometry.height, rgb)
        .ok_or_else(|| HalError::Other("RGB buffer size mismatch".into()))
}

/// CPU stand-in for the resizer node
///
/// Keeps the hardware's slot discipline so callers exercise the same
/// bookkeeping against it as against a real memory-to-memory device.
#[derive(Debug, Default)]
pub struct SoftwareScaler {
    config: Option<ScalerConfig>,
    next_slot: u32,
    outstanding: u32,
}

impl SoftwareScaler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScalerPath for SoftwareScaler {
    fn start(&mut self, config: &ScalerConfig) -> Result<(), HardwareError> {
        if config.buffers == 0 {
            return Err(HardwareError::Buffer("zero-depth output ring".to_owned()));
        }
        debug!(
            "scaler path: {} {} -> {} {}, {} slots",
            config.source,
            config.source_format.token(),
            config.target,
            config.target_format.token(),
            config.buffers
        );
        self.config = Some(*config);
        self.next_slot = 0;
        self.outstanding = 0;
        Ok(())
    }

    fn push(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<u32, HardwareError> {
        let Some(config) = self.config else {
            return Err(HardwareError::Stream("scaler path not started".to_owned()));
        };
        if self.outstanding >= config.buffers {
            return Err(HardwareError::Buffer(
                "all scaler output slots in flight".to_owned(),
            ));
        }
        convert_frame(
            data,
            config.source_format,
            config.source,
            config.target_format,
            config.target,
            out,
        )
        .map_err(|err| HardwareError::Buffer(err.to_string()))?;
        let slot = self.next_slot;
        self.next_slot = (self.next_slot + 1) % config.buffers;
        self.outstanding += 1;
        Ok(slot)
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        if self.outstanding == 0 {
            return Err(HardwareError::Buffer(
                "no scaler output slot in flight".to_owned(),
            ));
        }
        self.outstanding -= 1;
        Ok(())
    }

    fn stop(&mut self) {
        self.config = None;
        self.next_slot = 0;
        self.outstanding = 0;
    }
}

/// JPEG compression through the `image` crate
///
/// Scales to the target geometry when the request asks for it, so the
/// still pipeline only ever deals in encode requests.
#[derive(Debug, Default)]
pub struct SoftwareCompressor;

impl ImageCompressor for SoftwareCompressor {
    fn encode(&mut self, request: &EncodeRequest, data: &[u8], out: &mut Vec<u8>) -> HalResult<()> {
        let rgb = frame_to_rgb(data, request.source_format, request.source)?;
        let rgb = if request.source == request.target {
            rgb
        } else {
            imageops::resize(
                &rgb,
                request.target.width,
                request.target.height,
                FilterType::Triangle,
            )
        };

        out.clear();
        let encoder = JpegEncoder::new_with_quality(&mut *out, request.quality);
        rgb.write_with_encoder(encoder)
            .map_err(|err| HalError::Other(format!("JPEG encode failed: {err}")))?;
        Ok(())
    }
}
