// SPDX-License-Identifier: GPL-3.0-only

//! Named layout descriptors for hybrid interleaved sensor transfers
//!
//! Each sensor firmware revision that packs preview scanlines and a
//! compressed still into one transfer gets a versioned descriptor here.
//! The demultiplexer walk is generic over the descriptor, so supporting a
//! new revision means registering a table, not touching the algorithm.
//!
//! All field offsets are relative to the metadata block that starts at
//! `buffer_len - metadata_reserve`.

/// Field offsets for one interleaved transfer revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterleavedLayout {
    /// Registry name, `<sensor>.<revision>`
    pub name: &'static str,
    /// Bytes reserved for the metadata block at the end of the transfer
    pub metadata_reserve: usize,
    /// Decoded-still flag, one byte
    pub decoded_flag: usize,
    /// Raw auto-focus status, one byte
    pub af_status: usize,
    /// Scanline pointer-array offset, big-endian u32; the array size
    /// follows as a second big-endian u32
    pub pointer_array: usize,
    /// Number of detected faces, one byte
    pub face_count: usize,
    /// First face record; records are `face_record_len` bytes apart
    pub face_records: usize,
    pub face_record_len: usize,
    /// EXIF flash fired, one byte
    pub exif_flash: usize,
    /// EXIF ISO rating, u16 least-significant byte first
    pub exif_iso: usize,
    /// EXIF brightness numerator, one byte
    pub exif_brightness: usize,
    /// EXIF exposure bias numerator, u16 least-significant byte first
    pub exif_exposure_bias: usize,
    /// EXIF exposure-time denominator, u16 least-significant byte first
    pub exif_exposure_time: usize,
}

impl InterleavedLayout {
    /// Offset of the metadata block within a transfer of `buffer_len` bytes
    ///
    /// Returns None when the transfer cannot hold the block.
    pub fn metadata_base(&self, buffer_len: usize) -> Option<usize> {
        buffer_len.checked_sub(self.metadata_reserve)
    }
}

/// S5C73M3 ISP firmware layout
///
/// Offsets were established experimentally against the shipped firmware;
/// the metadata block occupies the last 0x1000 bytes of the transfer.
pub const S5C73M3_V1: InterleavedLayout = InterleavedLayout {
    name: "s5c73m3.v1",
    metadata_reserve: 0x1000,
    decoded_flag: 4046,
    af_status: 50,
    pointer_array: 4084,
    face_count: 108,
    face_records: 110,
    face_record_len: 12,
    exif_flash: 4,
    exif_iso: 8,
    exif_brightness: 12,
    exif_exposure_bias: 16,
    exif_exposure_time: 24,
};

/// Registered layouts, looked up by profile
const LAYOUTS: &[&InterleavedLayout] = &[&S5C73M3_V1];

/// Find a registered layout by name
pub fn lookup(name: &str) -> Option<&'static InterleavedLayout> {
    LAYOUTS.iter().copied().find(|layout| layout.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_registered_layouts() {
        assert_eq!(lookup("s5c73m3.v1"), Some(&S5C73M3_V1));
        assert_eq!(lookup("s5c73m3.v2"), None);
    }

    #[test]
    fn metadata_base_requires_room_for_the_block() {
        assert_eq!(S5C73M3_V1.metadata_base(0x2000), Some(0x1000));
        assert_eq!(S5C73M3_V1.metadata_base(0x800), None);
    }
}
