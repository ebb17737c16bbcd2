// SPDX-License-Identifier: GPL-3.0-only

//! Immutable device profiles
//!
//! One profile per sensor, holding the capability tables and default
//! parameter values the session seeds its parameter engine from. Profiles
//! are plain static data; a session borrows one at open time and never
//! mutates it.

use serde::Serialize;

use crate::focus::{self, AfCodeMap};
use crate::types::{CameraFacing, Geometry, PixelFormat};

/// Sensor-bus resolution override for ISP-managed sensors
///
/// The ISP wants the full sensor window for some output sizes, so the
/// negotiated bus geometry can differ from the requested one.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MbusResolution {
    pub size: Geometry,
    pub mbus: Geometry,
}

/// Still-capture resolution used while a given recording size is active
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VideoSnapshotResolution {
    pub recording: Geometry,
    pub snapshot: Geometry,
}

/// Exposure metering window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Metering {
    Center,
    Spot,
    Matrix,
}

/// Default parameter values and capability strings for one sensor
///
/// Fields mirror the textual parameter table one to one; `None` means the
/// key is not published for this sensor at all.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProfileParams {
    pub preview_size_values: &'static str,
    pub preview_size: &'static str,
    pub preview_format_values: &'static str,
    pub preview_format: &'static str,
    pub preview_frame_rate_values: &'static str,
    pub preview_frame_rate: i32,
    pub preview_fps_range_values: &'static str,
    pub preview_fps_range: &'static str,

    pub picture_size_values: &'static str,
    pub picture_size: &'static str,
    pub picture_format_values: &'static str,
    pub picture_format: &'static str,
    pub jpeg_thumbnail_size_values: &'static str,
    pub jpeg_thumbnail_width: i32,
    pub jpeg_thumbnail_height: i32,
    pub jpeg_thumbnail_quality: i32,
    pub jpeg_quality: i32,

    pub video_snapshot_supported: bool,
    pub full_video_snap_supported: bool,

    pub recording_size: &'static str,
    pub recording_size_values: &'static str,
    pub recording_format: &'static str,

    pub focus_mode: &'static str,
    pub focus_mode_values: &'static str,
    pub focus_distances: &'static str,
    pub focus_areas: Option<&'static str>,
    pub max_num_focus_areas: i32,

    pub max_detected_faces: i32,

    pub zoom_supported: bool,
    pub smooth_zoom_supported: bool,
    pub zoom_ratios: Option<&'static str>,
    pub zoom: i32,
    pub max_zoom: i32,

    pub auto_exposure_lock_supported: bool,
    pub auto_exposure_lock: bool,
    pub auto_white_balance_lock_supported: bool,
    pub auto_white_balance_lock: bool,

    pub flash_mode: Option<&'static str>,
    pub flash_mode_values: Option<&'static str>,

    pub exposure_compensation: i32,
    pub exposure_compensation_step: f32,
    pub min_exposure_compensation: i32,
    pub max_exposure_compensation: i32,

    pub whitebalance: &'static str,
    pub whitebalance_values: &'static str,

    pub antibanding: Option<&'static str>,
    pub antibanding_values: Option<&'static str>,

    pub scene_mode: Option<&'static str>,
    pub scene_mode_values: Option<&'static str>,

    pub effect: &'static str,
    pub effect_values: &'static str,

    pub iso: &'static str,
    pub iso_values: &'static str,

    pub image_stabilization: &'static str,
    pub image_stabilization_values: &'static str,
}

/// Everything the session needs to know about one sensor
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeviceProfile {
    pub name: &'static str,
    pub facing: CameraFacing,
    /// Clockwise mounting angle of the sensor, degrees
    pub orientation: i32,
    pub rotation: i32,
    pub hflip: i32,
    pub vflip: i32,
    /// Format the capture node delivers
    pub capture_format: PixelFormat,
    /// Format still pictures leave the pipeline in
    pub picture_format: PixelFormat,
    /// Sensor interleaves preview scanlines and still bytes in one
    /// transfer, demultiplexed in software
    pub hybrid: bool,
    /// Sensor runs behind the ISP firmware and takes scenario commands
    /// instead of direct mode controls
    pub managed_isp: bool,
    /// Registry name of the interleaved transfer layout, hybrid only
    pub interleaved_layout: Option<&'static str>,
    /// Raw auto-focus code translation for this sensor family
    #[serde(skip)]
    pub af_codes: Option<&'static AfCodeMap>,
    pub focal_length: f32,
    pub horizontal_view_angle: f32,
    pub vertical_view_angle: f32,
    pub metering: Metering,
    pub params: ProfileParams,
    pub mbus_resolutions: &'static [MbusResolution],
    pub videosnapshot_resolutions: &'static [VideoSnapshotResolution],
}

impl DeviceProfile {
    /// Bus geometry negotiated for a capture size, when the ISP overrides it
    pub fn mbus_for(&self, size: Geometry) -> Option<Geometry> {
        self.mbus_resolutions
            .iter()
            .find(|entry| entry.size == size)
            .map(|entry| entry.mbus)
    }

    /// Still size to use while recording at `recording`, hybrid sensors only
    pub fn videosnapshot_for(&self, recording: Geometry) -> Option<Geometry> {
        self.videosnapshot_resolutions
            .iter()
            .find(|entry| entry.recording == recording)
            .map(|entry| entry.snapshot)
    }
}

const fn mbus(w: u32, h: u32, mw: u32, mh: u32) -> MbusResolution {
    MbusResolution {
        size: Geometry::new(w, h),
        mbus: Geometry::new(mw, mh),
    }
}

const fn snapshot(rw: u32, rh: u32, sw: u32, sh: u32) -> VideoSnapshotResolution {
    VideoSnapshotResolution {
        recording: Geometry::new(rw, rh),
        snapshot: Geometry::new(sw, sh),
    }
}

static S5K6A3_MBUS_RESOLUTIONS: [MbusResolution; 8] = [
    mbus(1280, 720, 1344, 756),
    mbus(1280, 960, 1392, 1044),
    mbus(960, 720, 1392, 1044),
    mbus(640, 480, 1392, 1044),
    mbus(320, 240, 1392, 1044),
    mbus(1392, 1392, 1392, 1392),
    mbus(704, 704, 1392, 1392),
    mbus(320, 320, 1392, 1392),
];

static S5C73M3_VIDEOSNAPSHOT_RESOLUTIONS: [VideoSnapshotResolution; 7] = [
    snapshot(1920, 1080, 3264, 1836),
    snapshot(1280, 720, 3264, 1836),
    snapshot(720, 480, 3264, 2176),
    snapshot(640, 480, 3264, 2488),
    snapshot(352, 288, 3264, 2488),
    snapshot(320, 240, 3264, 2488),
    snapshot(176, 144, 3264, 2488),
];

/// Rear hybrid sensor: interleaves preview and still bytes in one transfer
pub static S5C73M3: DeviceProfile = DeviceProfile {
    name: "S5C73M3",
    facing: CameraFacing::Back,
    orientation: 90,
    rotation: 0,
    hflip: 0,
    vflip: 0,
    capture_format: PixelFormat::Interleaved,
    picture_format: PixelFormat::Jpeg,
    hybrid: true,
    managed_isp: false,
    interleaved_layout: Some("s5c73m3.v1"),
    af_codes: Some(&focus::S5C73M3_AF_CODES),
    focal_length: 3.7,
    horizontal_view_angle: 63.0,
    vertical_view_angle: 49.3,
    metering: Metering::Center,
    params: ProfileParams {
        preview_size_values: "960x720,1280x720,1184x666,960x640,704x576,640x480,352x288,320x240",
        preview_size: "960x720",
        preview_format_values: "yuv420sp,yuv420p,rgb565",
        preview_format: "yuv420sp",
        preview_frame_rate_values: "30,20,15",
        preview_frame_rate: 30,
        preview_fps_range_values: "(15000,15000),(15000,30000),(30000,30000)",
        preview_fps_range: "15000,30000",

        picture_size_values: "640x480,1024x768,1280x720,1600x1200,2560x1920,3264x2448,2048x1536,3264x1836,2048x1152,3264x2176",
        picture_size: "3264x2448",
        picture_format_values: "jpeg",
        picture_format: "jpeg",
        jpeg_thumbnail_size_values: "160x120,160x90,144x96",
        jpeg_thumbnail_width: 160,
        jpeg_thumbnail_height: 120,
        jpeg_thumbnail_quality: 100,
        jpeg_quality: 90,

        video_snapshot_supported: true,
        full_video_snap_supported: false,

        recording_size: "1280x720",
        recording_size_values: "1280x720,1920x1080,720x480,640x480,352x288,320x240,176x144",
        recording_format: "yuv420sp",

        focus_mode: "auto",
        focus_mode_values: "auto,infinity,macro,fixed,continuous-picture,continuous-video",
        focus_distances: "0.15,1.20,Infinity",
        focus_areas: Some("(0,0,0,0,0)"),
        max_num_focus_areas: 1,

        max_detected_faces: 15,

        zoom_supported: true,
        smooth_zoom_supported: false,
        zoom_ratios: Some("100,102,104,109,111,113,119,121,124,131,134,138,146,150,155,159,165,170,182,189,200,213,222,232,243,255,283,300,319,364,400"),
        zoom: 0,
        max_zoom: 30,

        auto_exposure_lock_supported: true,
        auto_exposure_lock: false,
        auto_white_balance_lock_supported: true,
        auto_white_balance_lock: false,

        flash_mode: Some("off"),
        flash_mode_values: Some("off,auto,on,torch"),

        exposure_compensation: 0,
        exposure_compensation_step: 0.5,
        min_exposure_compensation: -4,
        max_exposure_compensation: 4,

        whitebalance: "auto",
        whitebalance_values: "auto,incandescent,fluorescent,daylight,cloudy-daylight",

        antibanding: Some("auto"),
        antibanding_values: Some("off,auto,50hz,60hz"),

        scene_mode: Some("auto"),
        scene_mode_values: Some("auto,portrait,landscape,night,beach,snow,sunset,fireworks,action,party,candlelight,dusk-dawn,fall-color,text,back-light,high-sensitivity"),

        effect: "none",
        effect_values: "none,mono,negative,sepia,solarize,posterize,washed,vintage-warm,vintage-cold,point-blue,point-red-yellow,point-green",

        iso: "auto",
        iso_values: "auto,ISO100,ISO200,ISO400,ISO800",

        image_stabilization: "off",
        image_stabilization_values: "on,off",
    },
    mbus_resolutions: &[],
    videosnapshot_resolutions: &S5C73M3_VIDEOSNAPSHOT_RESOLUTIONS,
};

/// Front sensor behind the ISP firmware, plain UYVY stream
pub static S5K6A3: DeviceProfile = DeviceProfile {
    name: "S5K6A3",
    facing: CameraFacing::Front,
    orientation: 270,
    rotation: 0,
    hflip: 0,
    vflip: 0,
    capture_format: PixelFormat::Uyvy,
    picture_format: PixelFormat::Jpeg,
    hybrid: false,
    managed_isp: true,
    interleaved_layout: None,
    af_codes: None,
    focal_length: 2.73,
    horizontal_view_angle: 52.58,
    vertical_view_angle: 52.58,
    metering: Metering::Center,
    params: ProfileParams {
        preview_size_values: "1280x720,960x720,640x480,320x240,704x704,320x320",
        preview_size: "960x720",
        preview_format_values: "yuv420sp,yuv420p,rgb565",
        preview_format: "yuv420sp",
        preview_frame_rate_values: "30,20,15,8",
        preview_frame_rate: 30,
        preview_fps_range_values: "(8000,8000),(15000,15000),(15000,30000),(30000,30000)",
        preview_fps_range: "15000,30000",

        picture_size_values: "1280x960,1392x1392,640x480,1280x720,720x480,320x240",
        picture_size: "1280x960",
        picture_format_values: "jpeg",
        picture_format: "jpeg",
        jpeg_thumbnail_size_values: "160x120,160x160,160x90,144x96",
        jpeg_thumbnail_width: 160,
        jpeg_thumbnail_height: 120,
        jpeg_thumbnail_quality: 100,
        jpeg_quality: 90,

        video_snapshot_supported: true,
        full_video_snap_supported: true,

        recording_size: "1280x720",
        recording_size_values: "1280x720,720x480,640x480,352x288,320x320,320x240,176x144",
        recording_format: "yuv420sp",

        focus_mode: "fixed",
        focus_mode_values: "infinity,fixed",
        focus_distances: "0.20,0.25,Infinity",
        focus_areas: None,
        max_num_focus_areas: 0,

        max_detected_faces: 5,

        zoom_supported: false,
        smooth_zoom_supported: false,
        zoom_ratios: None,
        zoom: 0,
        max_zoom: 0,

        auto_exposure_lock_supported: false,
        auto_exposure_lock: false,
        auto_white_balance_lock_supported: false,
        auto_white_balance_lock: false,

        flash_mode: None,
        flash_mode_values: None,

        exposure_compensation: 0,
        exposure_compensation_step: 0.5,
        min_exposure_compensation: -4,
        max_exposure_compensation: 4,

        whitebalance: "auto",
        whitebalance_values: "auto,incandescent,fluorescent,daylight,cloudy-daylight",

        antibanding: None,
        antibanding_values: None,

        scene_mode: None,
        scene_mode_values: None,

        effect: "none",
        effect_values: "none,mono,negative,sepia,solarize,posterize,washed,vintage-warm,vintage-cold,point-blue,point-red-yellow,point-green",

        iso: "auto",
        iso_values: "auto",

        image_stabilization: "off",
        image_stabilization_values: "off",
    },
    mbus_resolutions: &S5K6A3_MBUS_RESOLUTIONS,
    videosnapshot_resolutions: &[],
};

static PROFILES: [&DeviceProfile; 2] = [&S5C73M3, &S5K6A3];

/// All registered device profiles, in enumeration order
pub fn profiles() -> &'static [&'static DeviceProfile] {
    &PROFILES
}

/// Profile for the given enumeration index
pub fn by_index(id: usize) -> Option<&'static DeviceProfile> {
    PROFILES.get(id).copied()
}

/// Profile by sensor name, case-insensitive
pub fn by_name(name: &str) -> Option<&'static DeviceProfile> {
    PROFILES
        .iter()
        .copied()
        .find(|profile| profile.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_is_stable() {
        assert_eq!(profiles().len(), 2);
        assert_eq!(by_index(0).map(|p| p.name), Some("S5C73M3"));
        assert_eq!(by_index(1).map(|p| p.name), Some("S5K6A3"));
        assert!(by_index(2).is_none());
    }

    #[test]
    fn hybrid_profile_has_a_registered_layout() {
        let profile = by_name("s5c73m3").unwrap();
        assert!(profile.hybrid);
        let layout = profile.interleaved_layout.unwrap();
        assert!(crate::layout::lookup(layout).is_some());
    }

    #[test]
    fn videosnapshot_follows_recording_size() {
        let profile = by_index(0).unwrap();
        assert_eq!(
            profile.videosnapshot_for(Geometry::new(1920, 1080)),
            Some(Geometry::new(3264, 1836))
        );
        assert_eq!(profile.videosnapshot_for(Geometry::new(123, 45)), None);
    }

    #[test]
    fn front_sensor_negotiates_wider_bus_sizes() {
        let profile = by_index(1).unwrap();
        assert_eq!(
            profile.mbus_for(Geometry::new(1280, 720)),
            Some(Geometry::new(1344, 756))
        );
        assert_eq!(profile.mbus_for(Geometry::new(960, 720)), Some(Geometry::new(1392, 1044)));
    }
}
