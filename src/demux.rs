// SPDX-License-Identifier: GPL-3.0-only

//! Demultiplexer for hybrid interleaved sensor transfers
//!
//! A hybrid transfer packs fixed-width YUV preview scanlines and the bytes
//! of a compressed still image into one buffer, followed by a metadata
//! block. A pointer array (one big-endian offset per image row) says where
//! each scanline starts; everything between one scanline's end and the next
//! scanline's start is compressed-picture data. The walk below separates
//! the two streams and pulls the face records and partial EXIF fields out
//! of the metadata block.
//!
//! Decode failures are per-frame: the caller drops the frame and keeps
//! streaming.

use crate::errors::DecodeError;
use crate::layout::InterleavedLayout;
use crate::types::{FaceRecord, FrameDescriptor, Geometry, PartialExif};
use tracing::trace;

/// JPEG start-of-image marker bytes
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

fn read_u16_lsb(block: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([block[offset], block[offset + 1]])
}

fn read_u32_be(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Split one hybrid transfer into YUV scanlines, compressed-picture bytes
/// and the decoded metadata
///
/// `yuv_out` and `jpeg_out` are cleared and refilled so the caller can
/// reuse their allocations across frames. Face records are extracted even
/// for transfers the sensor did not mark as decoded; the picture walk and
/// EXIF fields only exist on decoded transfers.
pub fn demultiplex(
    layout: &InterleavedLayout,
    data: &[u8],
    geometry: Geometry,
    max_faces: usize,
    yuv_out: &mut Vec<u8>,
    jpeg_out: &mut Vec<u8>,
) -> Result<FrameDescriptor, DecodeError> {
    yuv_out.clear();
    jpeg_out.clear();

    let base = layout
        .metadata_base(data.len())
        .ok_or(DecodeError::ShortBuffer {
            len: data.len(),
            required: layout.metadata_reserve,
        })?;
    // Registered layouts keep every field inside the reserved block
    debug_assert!(layout.pointer_array + 8 <= layout.metadata_reserve);
    let block = &data[base..];

    let decoded = block[layout.decoded_flag] != 0;
    let auto_focus_status = block[layout.af_status];

    let mut descriptor = FrameDescriptor {
        decoded,
        auto_focus_status,
        ..FrameDescriptor::default()
    };

    let face_count = block[layout.face_count] as usize;
    if face_count > 0 && face_count < max_faces {
        let mut offset = layout.face_records;
        for _ in 0..face_count {
            descriptor.faces.push(FaceRecord {
                rect: [
                    read_u16_lsb(block, offset) as i16,
                    read_u16_lsb(block, offset + 2) as i16,
                    read_u16_lsb(block, offset + 4) as i16,
                    read_u16_lsb(block, offset + 6) as i16,
                ],
                score: read_u16_lsb(block, offset + 8) as i16,
                id: read_u16_lsb(block, offset + 10) as i16,
            });
            offset += layout.face_record_len;
        }
    }

    if !decoded {
        return Ok(descriptor);
    }

    descriptor.exif = PartialExif {
        flash: block[layout.exif_flash],
        iso: read_u16_lsb(block, layout.exif_iso),
        brightness: block[layout.exif_brightness],
        exposure_bias: read_u16_lsb(block, layout.exif_exposure_bias) as i16,
        exposure_time_den: read_u16_lsb(block, layout.exif_exposure_time),
    };

    // The pointer array marks the end of the interleaved region
    let pointer_offset = u32::from_be_bytes([
        block[layout.pointer_array],
        block[layout.pointer_array + 1],
        block[layout.pointer_array + 2],
        block[layout.pointer_array + 3],
    ]) as usize;
    let pointer_size = u32::from_be_bytes([
        block[layout.pointer_array + 4],
        block[layout.pointer_array + 5],
        block[layout.pointer_array + 6],
        block[layout.pointer_array + 7],
    ]) as usize;
    let interleaved_size = pointer_offset;

    trace!(
        pointer_offset = format_args!("{:#x}", pointer_offset),
        pointer_size = format_args!("{:#x}", pointer_size),
        "interleaved pointer array"
    );

    let required = geometry.height as usize * 4;
    if pointer_size < required {
        return Err(DecodeError::PointerArrayTooSmall {
            size: pointer_size as u32,
            required: required as u32,
        });
    }
    if pointer_offset > data.len() || pointer_size > data.len() {
        return Err(DecodeError::OffsetOutOfBounds {
            offset: pointer_offset.max(pointer_size) as u32,
            limit: data.len() as u32,
        });
    }

    let line_size = geometry.width as usize * 2;
    yuv_out.reserve(geometry.height as usize * line_size);

    let mut jpeg_started = false;
    let mut last_offset = 0usize;
    let mut walked = 0usize;

    while walked < pointer_size {
        let entry = read_u32_be(data, pointer_offset + walked).ok_or(
            DecodeError::OffsetOutOfBounds {
                offset: (pointer_offset + walked) as u32,
                limit: data.len() as u32,
            },
        )? as usize;

        if entry > data.len() - line_size {
            return Err(DecodeError::OffsetOutOfBounds {
                offset: entry as u32,
                limit: (data.len() - line_size) as u32,
            });
        }

        let gap_start = last_offset + line_size;
        if entry > gap_start {
            if !jpeg_started {
                if data[gap_start..gap_start + 2] != JPEG_SOI {
                    return Err(DecodeError::MissingJpegMarker);
                }
                jpeg_started = true;
            }
            jpeg_out.extend_from_slice(&data[gap_start..entry]);
        }

        yuv_out.extend_from_slice(&data[entry..entry + line_size]);
        last_offset = entry;
        walked += 4;
    }

    // Anything left before the pointer array is still picture data
    let tail_start = last_offset + line_size;
    if interleaved_size > tail_start {
        jpeg_out.extend_from_slice(&data[tail_start..interleaved_size]);
    }

    descriptor.yuv_length = yuv_out.len();
    descriptor.jpeg_length = jpeg_out.len();

    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::InterleavedFrameBuilder;
    use crate::layout::S5C73M3_V1;

    const GEOMETRY: Geometry = Geometry::new(64, 8);

    fn soi_chunk(len: usize) -> Vec<u8> {
        let mut chunk = vec![0xAB; len];
        chunk[0] = 0xFF;
        chunk[1] = 0xD8;
        chunk
    }

    #[test]
    fn splits_scanlines_and_picture_gaps() {
        let frame = InterleavedFrameBuilder::new(&S5C73M3_V1, GEOMETRY)
            .decoded(true)
            .jpeg_after_row(0, soi_chunk(96))
            .jpeg_after_row(3, vec![0x11; 40])
            .trailing_jpeg(vec![0x22; 24])
            .build();

        let mut yuv = Vec::new();
        let mut jpeg = Vec::new();
        let descriptor =
            demultiplex(&S5C73M3_V1, &frame, GEOMETRY, 16, &mut yuv, &mut jpeg).unwrap();

        assert!(descriptor.decoded);
        assert_eq!(descriptor.yuv_length, 8 * 64 * 2);
        assert_eq!(descriptor.jpeg_length, 96 + 40 + 24);
        assert_eq!(yuv.len(), descriptor.yuv_length);
        assert_eq!(&jpeg[0..2], &JPEG_SOI);
        // Scanline payload survives the walk in row order
        assert!(yuv[0..4].iter().all(|&b| b == 0));
        assert!(yuv[7 * 128..7 * 128 + 4].iter().all(|&b| b == 7));
    }

    #[test]
    fn transfer_without_still_yields_no_picture() {
        let frame = InterleavedFrameBuilder::new(&S5C73M3_V1, GEOMETRY)
            .decoded(false)
            .auto_focus_status(3)
            .build();

        let mut yuv = Vec::new();
        let mut jpeg = Vec::new();
        let descriptor =
            demultiplex(&S5C73M3_V1, &frame, GEOMETRY, 16, &mut yuv, &mut jpeg).unwrap();

        assert!(!descriptor.decoded);
        assert_eq!(descriptor.auto_focus_status, 3);
        assert_eq!(descriptor.yuv_length, 0);
        assert_eq!(descriptor.jpeg_length, 0);
    }

    #[test]
    fn faces_are_read_even_without_a_decoded_still() {
        let frame = InterleavedFrameBuilder::new(&S5C73M3_V1, GEOMETRY)
            .decoded(false)
            .face(FaceRecord {
                rect: [-100, -50, 100, 50],
                score: 80,
                id: 1,
            })
            .face(FaceRecord {
                rect: [0, 0, 200, 200],
                score: 55,
                id: 2,
            })
            .build();

        let mut yuv = Vec::new();
        let mut jpeg = Vec::new();
        let descriptor =
            demultiplex(&S5C73M3_V1, &frame, GEOMETRY, 16, &mut yuv, &mut jpeg).unwrap();

        assert_eq!(descriptor.faces.len(), 2);
        assert_eq!(descriptor.faces[0].rect, [-100, -50, 100, 50]);
        assert_eq!(descriptor.faces[0].score, 80);
        assert_eq!(descriptor.faces[1].id, 2);
    }

    #[test]
    fn face_count_at_or_above_the_limit_is_dropped() {
        let mut builder = InterleavedFrameBuilder::new(&S5C73M3_V1, GEOMETRY).decoded(false);
        for id in 0..3 {
            builder = builder.face(FaceRecord {
                rect: [0, 0, 10, 10],
                score: 50,
                id,
            });
        }
        let frame = builder.build();

        let mut yuv = Vec::new();
        let mut jpeg = Vec::new();
        let descriptor =
            demultiplex(&S5C73M3_V1, &frame, GEOMETRY, 3, &mut yuv, &mut jpeg).unwrap();
        assert!(descriptor.faces.is_empty());
    }

    #[test]
    fn exif_fields_come_from_the_metadata_block() {
        let exif = PartialExif {
            flash: 1,
            iso: 400,
            brightness: 12,
            exposure_bias: -2,
            exposure_time_den: 30,
        };
        let frame = InterleavedFrameBuilder::new(&S5C73M3_V1, GEOMETRY)
            .decoded(true)
            .exif(exif)
            .jpeg_after_row(0, soi_chunk(16))
            .build();

        let mut yuv = Vec::new();
        let mut jpeg = Vec::new();
        let descriptor =
            demultiplex(&S5C73M3_V1, &frame, GEOMETRY, 16, &mut yuv, &mut jpeg).unwrap();
        assert_eq!(descriptor.exif, exif);
    }

    #[test]
    fn undersized_pointer_array_is_rejected() {
        let mut frame = InterleavedFrameBuilder::new(&S5C73M3_V1, GEOMETRY)
            .decoded(true)
            .jpeg_after_row(0, soi_chunk(16))
            .build();

        let base = frame.len() - S5C73M3_V1.metadata_reserve;
        let size_at = base + S5C73M3_V1.pointer_array + 4;
        frame[size_at..size_at + 4].copy_from_slice(&8u32.to_be_bytes());

        let mut yuv = Vec::new();
        let mut jpeg = Vec::new();
        let err = demultiplex(&S5C73M3_V1, &frame, GEOMETRY, 16, &mut yuv, &mut jpeg)
            .unwrap_err();
        assert!(matches!(err, DecodeError::PointerArrayTooSmall { size: 8, .. }));
    }

    #[test]
    fn scanline_offset_past_the_buffer_is_rejected() {
        let frame = InterleavedFrameBuilder::new(&S5C73M3_V1, GEOMETRY)
            .decoded(true)
            .jpeg_after_row(0, soi_chunk(16))
            .build();

        // Corrupt the third pointer entry to point past the transfer
        let base = frame.len() - S5C73M3_V1.metadata_reserve;
        let pointer_offset = u32::from_be_bytes(
            frame[base + S5C73M3_V1.pointer_array..base + S5C73M3_V1.pointer_array + 4]
                .try_into()
                .unwrap(),
        ) as usize;
        let mut frame = frame;
        let entry_at = pointer_offset + 2 * 4;
        frame[entry_at..entry_at + 4].copy_from_slice(&(u32::MAX / 2).to_be_bytes());

        let mut yuv = Vec::new();
        let mut jpeg = Vec::new();
        let err = demultiplex(&S5C73M3_V1, &frame, GEOMETRY, 16, &mut yuv, &mut jpeg)
            .unwrap_err();
        assert!(matches!(err, DecodeError::OffsetOutOfBounds { .. }));
    }

    #[test]
    fn first_gap_must_carry_the_soi_marker() {
        let frame = InterleavedFrameBuilder::new(&S5C73M3_V1, GEOMETRY)
            .decoded(true)
            .jpeg_after_row(0, vec![0x00, 0x01, 0x02, 0x03])
            .build();

        let mut yuv = Vec::new();
        let mut jpeg = Vec::new();
        let err = demultiplex(&S5C73M3_V1, &frame, GEOMETRY, 16, &mut yuv, &mut jpeg)
            .unwrap_err();
        assert!(matches!(err, DecodeError::MissingJpegMarker));
    }

    #[test]
    fn short_transfer_is_rejected() {
        let mut yuv = Vec::new();
        let mut jpeg = Vec::new();
        let err = demultiplex(&S5C73M3_V1, &[0u8; 64], GEOMETRY, 16, &mut yuv, &mut jpeg)
            .unwrap_err();
        assert!(matches!(err, DecodeError::ShortBuffer { len: 64, .. }));
    }

    #[test]
    fn output_buffers_are_reused_across_frames() {
        let frame = InterleavedFrameBuilder::new(&S5C73M3_V1, GEOMETRY)
            .decoded(true)
            .jpeg_after_row(1, soi_chunk(32))
            .build();

        let mut yuv = vec![0xEE; 4096];
        let mut jpeg = vec![0xEE; 4096];
        let descriptor =
            demultiplex(&S5C73M3_V1, &frame, GEOMETRY, 16, &mut yuv, &mut jpeg).unwrap();
        assert_eq!(yuv.len(), descriptor.yuv_length);
        assert_eq!(jpeg.len(), descriptor.jpeg_length);
    }
}
