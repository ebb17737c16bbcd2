// SPDX-License-Identifier: GPL-3.0-only

//! Software EXIF segment writer
//!
//! Builds the APP1 segment the picture pipeline splices between the JPEG
//! start marker and the picture body: a little-endian TIFF block with one
//! primary IFD (maker, model, orientation, capture datetime), an Exif
//! sub-IFD carrying the sensor-reported exposure fields, and a thumbnail
//! IFD pointing at the embedded thumbnail JPEG.

use chrono::{DateTime, Local, Timelike, Utc};

use crate::errors::{HalError, HalResult};
use crate::hw::{ExifComposer, ExifRequest};
use crate::types::GpsFix;

const MARKER_APP1: [u8; 2] = [0xff, 0xe1];
const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";

// APP1 payload ceiling: the two length bytes count themselves
const SEGMENT_CAPACITY: usize = 0xffff - 2;

// TIFF field types
const BYTE: u16 = 1;
const ASCII: u16 = 2;
const SHORT: u16 = 3;
const LONG: u16 = 4;
const RATIONAL: u16 = 5;
const SRATIONAL: u16 = 10;

// Tags used by the primary IFD
const TAG_MAKE: u16 = 0x010f;
const TAG_MODEL: u16 = 0x0110;
const TAG_ORIENTATION: u16 = 0x0112;
const TAG_DATETIME: u16 = 0x0132;
const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_GPS_IFD: u16 = 0x8825;

// Tags used by the GPS IFD
const TAG_GPS_LATITUDE_REF: u16 = 0x0001;
const TAG_GPS_LATITUDE: u16 = 0x0002;
const TAG_GPS_LONGITUDE_REF: u16 = 0x0003;
const TAG_GPS_LONGITUDE: u16 = 0x0004;
const TAG_GPS_ALTITUDE_REF: u16 = 0x0005;
const TAG_GPS_ALTITUDE: u16 = 0x0006;
const TAG_GPS_TIMESTAMP: u16 = 0x0007;
const TAG_GPS_DATESTAMP: u16 = 0x001d;

// Tags used by the Exif sub-IFD
const TAG_EXPOSURE_TIME: u16 = 0x829a;
const TAG_ISO: u16 = 0x8827;
const TAG_BRIGHTNESS: u16 = 0x9203;
const TAG_EXPOSURE_BIAS: u16 = 0x9204;
const TAG_FLASH: u16 = 0x9209;
const TAG_PIXEL_X: u16 = 0xa002;
const TAG_PIXEL_Y: u16 = 0xa003;

// Tags used by the thumbnail IFD
const TAG_COMPRESSION: u16 = 0x0103;
const TAG_JPEG_OFFSET: u16 = 0x0201;
const TAG_JPEG_LENGTH: u16 = 0x0202;

const COMPRESSION_JPEG: u16 = 6;

/// One IFD entry, either inline (value fits the 4-byte slot) or pointing
/// at an out-of-line blob placed after the entry table
struct Entry {
    tag: u16,
    kind: u16,
    count: u32,
    payload: Payload,
}

enum Payload {
    Inline([u8; 4]),
    Blob(Vec<u8>),
}

impl Entry {
    fn byte(tag: u16, value: u8) -> Self {
        Self {
            tag,
            kind: BYTE,
            count: 1,
            payload: Payload::Inline([value, 0, 0, 0]),
        }
    }

    fn short(tag: u16, value: u16) -> Self {
        let mut slot = [0u8; 4];
        slot[0..2].copy_from_slice(&value.to_le_bytes());
        Self {
            tag,
            kind: SHORT,
            count: 1,
            payload: Payload::Inline(slot),
        }
    }

    fn long(tag: u16, value: u32) -> Self {
        Self {
            tag,
            kind: LONG,
            count: 1,
            payload: Payload::Inline(value.to_le_bytes()),
        }
    }

    fn ascii(tag: u16, text: &str) -> Self {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        let count = bytes.len() as u32;
        let payload = if bytes.len() <= 4 {
            let mut slot = [0u8; 4];
            slot[..bytes.len()].copy_from_slice(&bytes);
            Payload::Inline(slot)
        } else {
            Payload::Blob(bytes)
        };
        Self {
            tag,
            kind: ASCII,
            count,
            payload,
        }
    }

    fn rational(tag: u16, numerator: u32, denominator: u32) -> Self {
        let mut blob = Vec::with_capacity(8);
        blob.extend_from_slice(&numerator.to_le_bytes());
        blob.extend_from_slice(&denominator.to_le_bytes());
        Self {
            tag,
            kind: RATIONAL,
            count: 1,
            payload: Payload::Blob(blob),
        }
    }

    fn rationals(tag: u16, values: &[(u32, u32)]) -> Self {
        let mut blob = Vec::with_capacity(values.len() * 8);
        for (numerator, denominator) in values {
            blob.extend_from_slice(&numerator.to_le_bytes());
            blob.extend_from_slice(&denominator.to_le_bytes());
        }
        Self {
            tag,
            kind: RATIONAL,
            count: values.len() as u32,
            payload: Payload::Blob(blob),
        }
    }

    fn srational(tag: u16, numerator: i32, denominator: i32) -> Self {
        let mut blob = Vec::with_capacity(8);
        blob.extend_from_slice(&numerator.to_le_bytes());
        blob.extend_from_slice(&denominator.to_le_bytes());
        Self {
            tag,
            kind: SRATIONAL,
            count: 1,
            payload: Payload::Blob(blob),
        }
    }

    fn blob_len(&self) -> usize {
        match &self.payload {
            Payload::Inline(_) => 0,
            // Blobs are padded to even lengths so later offsets stay aligned
            Payload::Blob(blob) => blob.len() + (blob.len() & 1),
        }
    }
}

/// Bytes one IFD occupies: entry table, next-IFD pointer, blob area
fn ifd_len(entries: &[Entry]) -> usize {
    2 + entries.len() * 12 + 4 + entries.iter().map(Entry::blob_len).sum::<usize>()
}

/// Append one IFD at the current end of `tiff`
fn append_ifd(tiff: &mut Vec<u8>, entries: &[Entry], next_ifd: u32) {
    let mut blob_offset = tiff.len() + 2 + entries.len() * 12 + 4;
    tiff.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for entry in entries {
        tiff.extend_from_slice(&entry.tag.to_le_bytes());
        tiff.extend_from_slice(&entry.kind.to_le_bytes());
        tiff.extend_from_slice(&entry.count.to_le_bytes());
        match &entry.payload {
            Payload::Inline(slot) => tiff.extend_from_slice(slot),
            Payload::Blob(_) => {
                tiff.extend_from_slice(&(blob_offset as u32).to_le_bytes());
                blob_offset += entry.blob_len();
            }
        }
    }
    tiff.extend_from_slice(&next_ifd.to_le_bytes());
    for entry in entries {
        if let Payload::Blob(blob) = &entry.payload {
            tiff.extend_from_slice(blob);
            if blob.len() & 1 == 1 {
                tiff.push(0);
            }
        }
    }
}

/// Decimal degrees to the three EXIF rationals: degrees, minutes,
/// centiseconds of arc
fn degrees_minutes_seconds(decimal: f64) -> [(u32, u32); 3] {
    let value = decimal.abs();
    let degrees = value.floor();
    let minutes = ((value - degrees) * 60.0).floor();
    let seconds = (value - degrees) * 3600.0 - minutes * 60.0;
    [
        (degrees as u32, 1),
        (minutes as u32, 1),
        ((seconds * 100.0).round() as u32, 100),
    ]
}

fn gps_ifd_entries(fix: &GpsFix) -> Vec<Entry> {
    let time = DateTime::<Utc>::from_timestamp(fix.timestamp, 0)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    vec![
        Entry::ascii(
            TAG_GPS_LATITUDE_REF,
            if fix.latitude < 0.0 { "S" } else { "N" },
        ),
        Entry::rationals(TAG_GPS_LATITUDE, &degrees_minutes_seconds(fix.latitude)),
        Entry::ascii(
            TAG_GPS_LONGITUDE_REF,
            if fix.longitude < 0.0 { "W" } else { "E" },
        ),
        Entry::rationals(TAG_GPS_LONGITUDE, &degrees_minutes_seconds(fix.longitude)),
        Entry::byte(TAG_GPS_ALTITUDE_REF, u8::from(fix.altitude < 0.0)),
        Entry::rational(
            TAG_GPS_ALTITUDE,
            (fix.altitude.abs() * 100.0).round() as u32,
            100,
        ),
        Entry::rationals(
            TAG_GPS_TIMESTAMP,
            &[(time.hour(), 1), (time.minute(), 1), (time.second(), 1)],
        ),
        Entry::ascii(TAG_GPS_DATESTAMP, &time.format("%Y:%m:%d").to_string()),
    ]
}

/// Display orientation in degrees to the EXIF orientation code
fn orientation_code(degrees: i32) -> u16 {
    match degrees.rem_euclid(360) {
        90 => 6,
        180 => 3,
        270 => 8,
        _ => 1,
    }
}

/// Builds APP1 segments from the sensor's partial metadata
///
/// The datetime field is taken from the local clock at compose time; tests
/// only assert its shape, not its value.
#[derive(Debug, Default)]
pub struct SoftwareExif;

impl SoftwareExif {
    pub fn new() -> Self {
        Self
    }
}

impl ExifComposer for SoftwareExif {
    fn compose(&mut self, request: &ExifRequest<'_>) -> HalResult<Vec<u8>> {
        let datetime = Local::now().format("%Y:%m:%d %H:%M:%S").to_string();

        let exif_entries = vec![
            Entry::rational(
                TAG_EXPOSURE_TIME,
                1,
                u32::from(request.exif.exposure_time_den.max(1)),
            ),
            Entry::short(TAG_ISO, request.exif.iso),
            Entry::srational(TAG_BRIGHTNESS, i32::from(request.exif.brightness), 1),
            // The sensor reports the bias in tenths of an EV step
            Entry::srational(TAG_EXPOSURE_BIAS, i32::from(request.exif.exposure_bias), 10),
            Entry::short(TAG_FLASH, u16::from(request.exif.flash)),
            Entry::long(TAG_PIXEL_X, request.geometry.width),
            Entry::long(TAG_PIXEL_Y, request.geometry.height),
        ];

        // The primary IFD starts right after the 8-byte TIFF header; the
        // sub-IFD, the GPS IFD (when a fix is set) and the thumbnail IFD
        // follow back to back, so every offset is known before emission
        let ifd0_start = 8u32;
        let mut ifd0_entries = vec![
            Entry::ascii(TAG_MAKE, request.maker),
            Entry::ascii(TAG_MODEL, request.model),
            Entry::short(TAG_ORIENTATION, orientation_code(request.orientation)),
            Entry::ascii(TAG_DATETIME, &datetime),
        ];
        let gps_entries = request.gps.map(|fix| gps_ifd_entries(&fix));
        let pointer_slots = 12 * (1 + usize::from(gps_entries.is_some()));
        let exif_ifd_start = ifd0_start as usize + ifd_len(&ifd0_entries) + pointer_slots;
        ifd0_entries.push(Entry::long(TAG_EXIF_IFD, exif_ifd_start as u32));

        let mut next_free = exif_ifd_start + ifd_len(&exif_entries);
        if let Some(entries) = &gps_entries {
            ifd0_entries.push(Entry::long(TAG_GPS_IFD, next_free as u32));
            next_free += ifd_len(entries);
        }
        let thumbnail_ifd_start = next_free;

        let mut tiff = Vec::with_capacity(512);
        tiff.extend_from_slice(b"II");
        tiff.extend_from_slice(&42u16.to_le_bytes());
        tiff.extend_from_slice(&ifd0_start.to_le_bytes());

        let next_ifd = if request.thumbnail.is_some() {
            thumbnail_ifd_start as u32
        } else {
            0
        };
        append_ifd(&mut tiff, &ifd0_entries, next_ifd);
        append_ifd(&mut tiff, &exif_entries, 0);
        if let Some(entries) = &gps_entries {
            append_ifd(&mut tiff, entries, 0);
        }

        if let Some(thumbnail) = request.thumbnail {
            let thumbnail_entries = vec![
                Entry::short(TAG_COMPRESSION, COMPRESSION_JPEG),
                Entry::long(
                    TAG_JPEG_OFFSET,
                    (thumbnail_ifd_start + ifd_len(&[
                        Entry::short(TAG_COMPRESSION, COMPRESSION_JPEG),
                        Entry::long(TAG_JPEG_OFFSET, 0),
                        Entry::long(TAG_JPEG_LENGTH, 0),
                    ])) as u32,
                ),
                Entry::long(TAG_JPEG_LENGTH, thumbnail.len() as u32),
            ];
            append_ifd(&mut tiff, &thumbnail_entries, 0);
            tiff.extend_from_slice(thumbnail);
        }

        let payload_len = EXIF_HEADER.len() + tiff.len();
        if payload_len > SEGMENT_CAPACITY {
            return Err(HalError::Other(format!(
                "EXIF segment of {payload_len} bytes exceeds the APP1 capacity"
            )));
        }

        let mut segment = Vec::with_capacity(4 + payload_len);
        segment.extend_from_slice(&MARKER_APP1);
        segment.extend_from_slice(&((payload_len + 2) as u16).to_be_bytes());
        segment.extend_from_slice(EXIF_HEADER);
        segment.extend_from_slice(&tiff);
        Ok(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Geometry, GpsFix, PartialExif};

    fn request<'a>(exif: &'a PartialExif, thumbnail: Option<&'a [u8]>) -> ExifRequest<'a> {
        ExifRequest {
            geometry: Geometry::new(3264, 2448),
            exif,
            gps: None,
            thumbnail,
            maker: "SAMSUNG",
            model: "S5C73M3",
            orientation: 90,
        }
    }

    fn u16_at(tiff: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([tiff[offset], tiff[offset + 1]])
    }

    fn u32_at(tiff: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([
            tiff[offset],
            tiff[offset + 1],
            tiff[offset + 2],
            tiff[offset + 3],
        ])
    }

    /// Walk an IFD and return (tag, type, count, value-slot) tuples
    fn entries_at(tiff: &[u8], offset: usize) -> Vec<(u16, u16, u32, u32)> {
        let count = u16_at(tiff, offset) as usize;
        (0..count)
            .map(|i| {
                let base = offset + 2 + i * 12;
                (
                    u16_at(tiff, base),
                    u16_at(tiff, base + 2),
                    u32_at(tiff, base + 4),
                    u32_at(tiff, base + 8),
                )
            })
            .collect()
    }

    #[test]
    fn segment_wraps_a_little_endian_tiff_block() {
        let exif = PartialExif::default();
        let segment = SoftwareExif::new().compose(&request(&exif, None)).unwrap();

        assert_eq!(&segment[0..2], &MARKER_APP1);
        let declared = u16::from_be_bytes([segment[2], segment[3]]) as usize;
        assert_eq!(declared, segment.len() - 2);
        assert_eq!(&segment[4..10], EXIF_HEADER);
        assert_eq!(&segment[10..12], b"II");
        assert_eq!(u16_at(&segment[10..], 2), 42);
    }

    #[test]
    fn primary_ifd_carries_identity_and_points_at_exif_ifd() {
        let exif = PartialExif {
            iso: 200,
            ..PartialExif::default()
        };
        let segment = SoftwareExif::new().compose(&request(&exif, None)).unwrap();
        let tiff = &segment[10..];

        let ifd0 = entries_at(tiff, 8);
        assert_eq!(ifd0.len(), 5);
        assert_eq!(ifd0[0].0, TAG_MAKE);
        assert_eq!(ifd0[2], (TAG_ORIENTATION, SHORT, 1, 6));
        // DateTime is always the 20-byte "YYYY:MM:DD HH:MM:SS\0" shape
        assert_eq!(ifd0[3].1, ASCII);
        assert_eq!(ifd0[3].2, 20);

        let exif_ifd = ifd0[4];
        assert_eq!(exif_ifd.0, TAG_EXIF_IFD);
        let sub = entries_at(tiff, exif_ifd.3 as usize);
        assert!(sub.iter().any(|e| *e == (TAG_ISO, SHORT, 1, 200)));
        assert!(sub.iter().any(|e| e.0 == TAG_PIXEL_X && e.3 == 3264));
    }

    #[test]
    fn thumbnail_ifd_points_at_the_embedded_bytes() {
        let exif = PartialExif::default();
        let thumb = [0xffu8, 0xd8, 0xaa, 0xbb, 0xff, 0xd9];
        let segment = SoftwareExif::new()
            .compose(&request(&exif, Some(&thumb)))
            .unwrap();
        let tiff = &segment[10..];

        let ifd0 = entries_at(tiff, 8);
        let next_ifd = {
            let table_end = 8 + 2 + ifd0.len() * 12;
            u32_at(tiff, table_end) as usize
        };
        assert_ne!(next_ifd, 0);

        let ifd1 = entries_at(tiff, next_ifd);
        let offset = ifd1
            .iter()
            .find(|e| e.0 == TAG_JPEG_OFFSET)
            .map(|e| e.3 as usize)
            .unwrap();
        let length = ifd1
            .iter()
            .find(|e| e.0 == TAG_JPEG_LENGTH)
            .map(|e| e.3 as usize)
            .unwrap();
        assert_eq!(length, thumb.len());
        assert_eq!(&tiff[offset..offset + length], &thumb);
    }

    #[test]
    fn gps_fix_emits_a_gps_ifd() {
        let exif = PartialExif::default();
        let mut request = request(&exif, None);
        request.gps = Some(GpsFix {
            latitude: 48.25,
            longitude: -11.5,
            altitude: 520.0,
            timestamp: 1_714_000_000,
        });
        let segment = SoftwareExif::new().compose(&request).unwrap();
        let tiff = &segment[10..];

        let ifd0 = entries_at(tiff, 8);
        let gps_pointer = ifd0
            .iter()
            .find(|e| e.0 == TAG_GPS_IFD)
            .expect("GPS IFD pointer");
        assert_eq!(gps_pointer.1, LONG);

        let gps = entries_at(tiff, gps_pointer.3 as usize);
        // "N\0" inline in the value slot
        let lat_ref = gps.iter().find(|e| e.0 == TAG_GPS_LATITUDE_REF).unwrap();
        assert_eq!(lat_ref.3 & 0xff, u32::from(b'N'));
        let lon_ref = gps.iter().find(|e| e.0 == TAG_GPS_LONGITUDE_REF).unwrap();
        assert_eq!(lon_ref.3 & 0xff, u32::from(b'W'));

        // 48.25 degrees is 48 deg 15 min 0 sec
        let latitude = gps.iter().find(|e| e.0 == TAG_GPS_LATITUDE).unwrap();
        assert_eq!(latitude.2, 3);
        let blob = latitude.3 as usize;
        assert_eq!(u32_at(tiff, blob), 48);
        assert_eq!(u32_at(tiff, blob + 8), 15);
        assert_eq!(u32_at(tiff, blob + 16), 0);

        assert!(gps.iter().any(|e| e.0 == TAG_GPS_TIMESTAMP && e.2 == 3));
        assert!(gps.iter().any(|e| e.0 == TAG_GPS_DATESTAMP));
    }

    #[test]
    fn no_fix_means_no_gps_ifd() {
        let exif = PartialExif::default();
        let segment = SoftwareExif::new().compose(&request(&exif, None)).unwrap();
        let ifd0 = entries_at(&segment[10..], 8);
        assert!(ifd0.iter().all(|e| e.0 != TAG_GPS_IFD));
    }

    #[test]
    fn orientation_degrees_map_to_exif_codes() {
        assert_eq!(orientation_code(0), 1);
        assert_eq!(orientation_code(90), 6);
        assert_eq!(orientation_code(180), 3);
        assert_eq!(orientation_code(270), 8);
        assert_eq!(orientation_code(-90), 8);
    }

    #[test]
    fn oversized_thumbnail_is_rejected() {
        let exif = PartialExif::default();
        let thumb = vec![0u8; 0x10000];
        let result = SoftwareExif::new().compose(&request(&exif, Some(&thumb)));
        assert!(result.is_err());
    }

    #[test]
    fn exposure_time_defends_against_zero_denominator() {
        let exif = PartialExif {
            exposure_time_den: 0,
            ..PartialExif::default()
        };
        // Must not panic or emit a 1/0 rational
        let segment = SoftwareExif::new().compose(&request(&exif, None)).unwrap();
        let tiff = &segment[10..];
        let ifd0 = entries_at(tiff, 8);
        let sub_offset = ifd0.last().unwrap().3 as usize;
        let sub = entries_at(tiff, sub_offset);
        let exposure = sub.iter().find(|e| e.0 == TAG_EXPOSURE_TIME).unwrap();
        let blob = exposure.3 as usize;
        assert_eq!(u32_at(tiff, blob + 4), 1);
    }
}
