// SPDX-License-Identifier: GPL-3.0-only

//! Reconciles the parameter table against the hardware
//!
//! [`ParameterEngine::apply`] walks the table group by group, latching
//! geometry for the capture pipeline and pushing only the controls whose
//! value actually changed (or everything, when forced after a profile
//! seed). A rejected value rolls its key back to the last accepted one
//! and aborts the walk; groups already applied stay applied.

use tracing::{debug, error};

use super::state::{
    Antibanding, Effect, FlashMode, FocusMode, IsoValue, IspScenario, ParameterState, SceneMode,
    SensorMode, Stabilization, WhiteBalance,
};
use super::{ParameterTable, leading_int, parse_dimensions};
use crate::errors::{HalError, HalResult};
use crate::hw::{CaptureDevice, ControlId};
use crate::profile::DeviceProfile;
use crate::types::{Geometry, GpsFix, PixelFormat};

pub struct ParameterEngine {
    profile: &'static DeviceProfile,
    table: ParameterTable,
    state: ParameterState,
    raw_focus_areas: String,
    raw_flash_mode: String,
    raw_focus_mode: String,
}

impl ParameterEngine {
    /// Seed the table with the profile's published preset
    pub fn new(profile: &'static DeviceProfile) -> Self {
        let (table, raw_focus_areas) = seed(profile);
        Self {
            profile,
            table,
            state: ParameterState::default(),
            raw_focus_areas,
            raw_flash_mode: String::new(),
            raw_focus_mode: String::new(),
        }
    }

    pub fn table(&self) -> &ParameterTable {
        &self.table
    }

    pub fn state(&self) -> &ParameterState {
        &self.state
    }

    pub fn profile(&self) -> &'static DeviceProfile {
        self.profile
    }

    /// Overlay incoming pairs; interpretation waits for the next apply
    pub fn merge(&mut self, incoming: &ParameterTable) {
        self.table.merge_from(incoming);
    }

    fn parse_gps_fix(&self) -> Option<GpsFix> {
        let timestamp = self
            .table
            .get("gps-timestamp")
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|timestamp| *timestamp > 0)?;
        let latitude = self.table.get_float("gps-latitude")?;
        let longitude = self.table.get_float("gps-longitude")?;
        let altitude = self.table.get_float("gps-altitude").unwrap_or(0.0);
        Some(GpsFix {
            latitude: f64::from(latitude),
            longitude: f64::from(longitude),
            altitude: f64::from(altitude),
            timestamp,
        })
    }

    /// Push the table to the hardware
    ///
    /// Control writes the driver refuses are logged and skipped; only a
    /// value the table itself cannot carry aborts with a rollback.
    pub fn apply(&mut self, force: bool, device: &mut dyn CaptureDevice) -> HalResult<()> {
        // An off-center focus area or a scene mode can decide flash and
        // focus before their own keys are read
        let mut flash_candidate: Option<FlashMode> = None;
        let mut focus_candidate: Option<FocusMode> = None;

        // Preview
        let (mut preview_width, mut preview_height) = (0i32, 0i32);
        if let Some((w, h)) = self.table.get("preview-size").map(parse_dimensions) {
            if w < 0 && h < 0 {
                let last = self.state.preview_geometry.to_string();
                self.table.set("preview-size", &last);
                return Err(HalError::InvalidArgument(format!("preview-size {w}x{h}")));
            }
            preview_width = w;
            preview_height = h;
            if w > 0 && w as u32 != self.state.preview_geometry.width {
                self.state.preview_geometry.width = w as u32;
            }
            if h > 0 && h as u32 != self.state.preview_geometry.height {
                self.state.preview_geometry.height = h as u32;
            }
        }

        if let Some(token) = self.table.get("preview-format") {
            self.state.preview_format = preview_format_from_token(token);
        }

        self.state.preview_fps = self
            .table
            .get_int("preview-frame-rate")
            .filter(|fps| *fps > 0)
            .unwrap_or(0);

        // Picture
        if let Some(token) = self.table.get("picture-format") {
            if token != "jpeg" {
                error!("unsupported picture format: {token}");
            }
            self.state.picture_format = PixelFormat::Jpeg;
        }

        if let Some(width) = self.table.get_int("jpeg-thumbnail-width").filter(|v| *v > 0) {
            self.state.thumbnail_geometry.width = width as u32;
        }
        if let Some(height) = self.table.get_int("jpeg-thumbnail-height").filter(|v| *v > 0) {
            self.state.thumbnail_geometry.height = height as u32;
        }
        if let Some(quality) = self.table.get_int("jpeg-thumbnail-quality").filter(|v| *v > 0) {
            self.state.thumbnail_quality = quality;
        }

        let jpeg_quality = self.table.get_int("jpeg-quality").unwrap_or(-1);
        if (0..=100).contains(&jpeg_quality) && (jpeg_quality != self.state.jpeg_quality || force)
        {
            self.state.jpeg_quality = jpeg_quality;
            write_control(device, ControlId::JpegQuality, jpeg_quality, "jpeg quality");
        }

        // Location: latched for still EXIF, never written to the sensor.
        // The -1 timestamp sentinel (or any unreadable fix) clears it.
        self.state.gps = self.parse_gps_fix();

        // Recording
        let (recording_width, recording_height) = self
            .table
            .get("video-size")
            .or_else(|| self.table.get("preview-size"))
            .map(parse_dimensions)
            .unwrap_or((0, 0));
        if recording_width > 0 && recording_width as u32 != self.state.recording_geometry.width {
            self.state.recording_geometry.width = recording_width as u32;
        }
        if recording_height > 0 && recording_height as u32 != self.state.recording_geometry.height
        {
            self.state.recording_geometry.height = recording_height as u32;
        }

        if let Some(token) = self.table.get("video-frame-format") {
            self.state.recording_format = recording_format_from_token(token);
        }

        let movie = self.table.get("recording-hint") == Some("true");
        let sensor_mode = if movie { SensorMode::Movie } else { SensorMode::Camera };
        let scenario = if movie { IspScenario::PreviewVideo } else { IspScenario::PreviewStill };

        if movie {
            // Re-pick the preview size sharing the recording aspect ratio
            if recording_width != 0 && recording_height != 0 {
                if let Some(values) = self.table.get("preview-size-values") {
                    for entry in values.split(',') {
                        let (w, h) = parse_dimensions(entry);
                        if h == 0 {
                            continue;
                        }
                        if (recording_width * h) / recording_height == w {
                            preview_width = w;
                            preview_height = h;
                            break;
                        }
                    }
                }
            }
            if preview_width > 0 && preview_width as u32 != self.state.preview_geometry.width {
                self.state.preview_geometry.width = preview_width as u32;
            }
            if preview_height > 0 && preview_height as u32 != self.state.preview_geometry.height {
                self.state.preview_geometry.height = preview_height as u32;
            }
        }

        // Picture size; a movie hint swaps in the video-snapshot size
        if let Some((parsed_width, parsed_height)) =
            self.table.get("picture-size").map(parse_dimensions)
        {
            let (mut picture_width, mut picture_height) = (parsed_width, parsed_height);
            if sensor_mode == SensorMode::Movie
                && !self.profile.videosnapshot_resolutions.is_empty()
            {
                if self.profile.managed_isp {
                    picture_width = self.state.recording_geometry.width as i32;
                    picture_height = self.state.recording_geometry.height as i32;
                } else if let Some(snapshot) =
                    self.profile.videosnapshot_for(self.state.recording_geometry)
                {
                    picture_width = snapshot.width as i32;
                    picture_height = snapshot.height as i32;
                }
            }

            if picture_width > 0
                && picture_height > 0
                && (picture_width as u32 != self.state.picture_geometry.width
                    || picture_height as u32 != self.state.picture_geometry.height)
            {
                self.state.picture_geometry =
                    Geometry::new(picture_width as u32, picture_height as u32);
                if !self.profile.managed_isp {
                    let packed = (picture_width & 0xffff) << 16 | (picture_height & 0xffff);
                    write_control(device, ControlId::JpegResolution, packed, "jpeg resolution");
                }
            }
        }

        // Mode switches are edge-triggered; force does not replay them
        if sensor_mode != self.state.sensor_mode {
            self.state.sensor_mode = sensor_mode;
            write_control(device, ControlId::SensorMode, sensor_mode as i32, "sensor mode");
        }
        if self.profile.managed_isp && scenario != self.state.scenario {
            self.state.scenario = scenario;
            write_control(device, ControlId::FormatScenario, scenario as i32, "format scenario");
        }

        // Focus areas
        if let Some(areas) = self.table.get("focus-areas").map(str::to_owned) {
            match parse_focus_area(&areas) {
                None => error!("unable to scan focus areas: {areas}"),
                Some((left, top, right, bottom, weight)) => {
                    if !focus_area_is_valid(left, top, right, bottom, weight)
                        || areas.contains("),(")
                    {
                        let last = self.raw_focus_areas.clone();
                        self.table.set("focus-areas", &last);
                        return Err(HalError::InvalidArgument(format!("focus-areas {areas}")));
                    }
                    if (left != 0 || right != 0) && (top != 0 || bottom != 0) {
                        self.raw_focus_areas.clear();
                        self.raw_focus_areas.push_str(&areas);

                        let focus_x = (((left + right) / 2) + 1000) * preview_width / 2000;
                        let focus_y = (((top + bottom) / 2) + 1000) * preview_height / 2000;

                        if focus_x != self.state.focus_position.0 || force {
                            self.state.focus_position.0 = focus_x;
                            write_control(
                                device,
                                ControlId::ObjectPositionX,
                                focus_x,
                                "object x position",
                            );
                        }
                        if focus_y != self.state.focus_position.1 || force {
                            self.state.focus_position.1 = focus_y;
                            write_control(
                                device,
                                ControlId::ObjectPositionY,
                                focus_y,
                                "object y position",
                            );
                        }

                        // The stock app parks the area back at dead center
                        // after every shot; only a real touch changes mode
                        if !(focus_x == preview_width / 2 && focus_y == preview_height / 2) {
                            focus_candidate = Some(FocusMode::Touch);
                        }
                    }
                }
            }
        }

        // Zoom
        if self.table.get("zoom-supported") == Some("true") {
            let zoom = self.table.get_int("zoom").unwrap_or(-1);
            let max_zoom = self.table.get_int("max-zoom").unwrap_or(-1);
            if zoom >= 0 && zoom <= max_zoom {
                if zoom != self.state.zoom || force {
                    self.state.zoom = zoom;
                    write_control(device, ControlId::Zoom, zoom, "camera zoom");
                }
            } else if zoom > max_zoom {
                self.table.set_int("zoom", max_zoom);
                return Err(HalError::InvalidArgument(format!(
                    "zoom {zoom} beyond {max_zoom}"
                )));
            }
        }

        // Scene mode
        if let Some(token) = self.table.get("scene-mode") {
            let scene = SceneMode::from_token(token);
            if scene.wants_auto_flash() {
                flash_candidate = Some(FlashMode::Auto);
            }
            if self.state.scene_mode != Some(scene) || force {
                self.state.scene_mode = Some(scene);
                write_control(device, ControlId::SceneMode, scene as i32, "scene mode");
            }
            if scene != SceneMode::None && flash_candidate.is_none() && focus_candidate.is_none()
            {
                flash_candidate = Some(FlashMode::Off);
                focus_candidate = Some(FocusMode::Auto);
            }
        }

        // Flash
        if let Some(token) = self.table.get("flash-mode").map(str::to_owned) {
            let flash = match flash_candidate {
                Some(flash) => flash,
                None => match FlashMode::from_token(&token) {
                    Some(flash) => flash,
                    None => {
                        let last = self.raw_flash_mode.clone();
                        self.table.set("flash-mode", &last);
                        return Err(HalError::InvalidArgument(format!("flash-mode {token}")));
                    }
                },
            };
            if self.state.flash_mode != Some(flash) || force {
                self.state.flash_mode = Some(flash);
                self.raw_flash_mode.clear();
                self.raw_flash_mode.push_str(&token);
                write_control(device, ControlId::FlashMode, flash as i32, "flash mode");
            }
        }

        // Exposure and white balance locks only reach the firmware while
        // flash is latched off
        let ae_lock = self.table.get("auto-exposure-lock-supported") == Some("true")
            && self.table.get("auto-exposure-lock") == Some("true");
        let awb_lock = self.table.get("auto-whitebalance-lock-supported") == Some("true")
            && self.table.get("auto-whitebalance-lock") == Some("true");
        if (ae_lock != self.state.ae_lock || awb_lock != self.state.awb_lock || force)
            && self.state.flash_mode == Some(FlashMode::Off)
        {
            self.state.ae_lock = ae_lock;
            self.state.awb_lock = awb_lock;
            let aeawb = i32::from(ae_lock) | i32::from(awb_lock) << 1;
            write_control(device, ControlId::AeAwbLock, aeawb, "exposure lock");
        }

        // Focus mode
        if let Some(token) = self.table.get("focus-mode").map(str::to_owned) {
            let mode = match focus_candidate {
                Some(mode) => mode,
                None => match FocusMode::from_token(&token) {
                    Some(mode) => mode,
                    None => {
                        let last = self.raw_focus_mode.clone();
                        self.table.set("focus-mode", &last);
                        return Err(HalError::InvalidArgument(format!("focus-mode {token}")));
                    }
                },
            };
            if self.state.focus_mode != Some(mode) || force {
                write_control(device, ControlId::FocusMode, mode as i32, "focus mode");
            }
            self.state.focus_mode = Some(mode);
            self.raw_focus_mode.clear();
            self.raw_focus_mode.push_str(&token);
        }

        // Exposure compensation
        if let (Some(exposure), Some(min), Some(max)) = (
            self.table.get_int("exposure-compensation"),
            self.table.get_int("min-exposure-compensation"),
            self.table.get_int("max-exposure-compensation"),
        ) {
            if exposure >= min
                && exposure <= max
                && (exposure != self.state.exposure_compensation || force)
            {
                self.state.exposure_compensation = exposure;
                write_control(device, ControlId::Brightness, exposure, "exposure compensation");
            }
        }

        // Antibanding
        if let Some(token) = self.table.get("antibanding") {
            let antibanding = Antibanding::from_token(token);
            if self.state.antibanding != Some(antibanding) || force {
                self.state.antibanding = Some(antibanding);
                write_control(device, ControlId::Antibanding, antibanding as i32, "antibanding");
            }
        }

        // White balance
        if let Some(token) = self.table.get("whitebalance") {
            let white_balance = WhiteBalance::from_token(token);
            if self.state.white_balance != Some(white_balance) || force {
                self.state.white_balance = Some(white_balance);
                write_control(
                    device,
                    ControlId::WhiteBalance,
                    white_balance as i32,
                    "whitebalance",
                );
            }
        }

        // Effect
        if let Some(token) = self.table.get("effect") {
            let effect = Effect::from_token(token);
            if self.state.effect != Some(effect) || force {
                self.state.effect = Some(effect);
                write_control(device, ControlId::Effect, effect as i32, "effect");
            }
        }

        // ISO
        if let Some(token) = self.table.get("iso") {
            let iso = IsoValue::from_token(token);
            if self.state.iso != Some(iso) || force {
                self.state.iso = Some(iso);
                write_control(device, ControlId::Iso, iso as i32, "iso");
            }
        }

        // Anti-shake
        if let Some(token) = self.table.get("image-stabilization") {
            let stabilization = Stabilization::from_token(token);
            if self.state.stabilization != Some(stabilization) || force {
                self.state.stabilization = Some(stabilization);
                write_control(
                    device,
                    ControlId::AntiShake,
                    stabilization as i32,
                    "image stabilization",
                );
            }
        }

        debug!(
            preview = %self.state.preview_geometry,
            picture = %self.state.picture_geometry,
            recording = %self.state.recording_geometry,
            "parameters applied"
        );

        Ok(())
    }
}

fn write_control(device: &mut dyn CaptureDevice, id: ControlId, value: i32, what: &str) {
    if let Err(err) = device.set_control(id, value) {
        error!("unable to set {what}: {err}");
    }
}

fn preview_format_from_token(token: &str) -> PixelFormat {
    match token {
        "yuv420sp" => PixelFormat::Nv21,
        "yuv420p" => PixelFormat::Yuv420p,
        "rgb565" => PixelFormat::Rgb565,
        "rgb8888" => PixelFormat::Rgb32,
        _ => {
            error!("unsupported preview format: {token}");
            PixelFormat::Nv21
        }
    }
}

/// The encoder consumes NV12, so the semi-planar token maps differently
/// than it does for preview
fn recording_format_from_token(token: &str) -> PixelFormat {
    match token {
        "yuv420sp" => PixelFormat::Nv12,
        "yuv420p" => PixelFormat::Yuv420p,
        "rgb565" => PixelFormat::Rgb565,
        "rgb8888" => PixelFormat::Rgb32,
        _ => {
            error!("unsupported recording format: {token}");
            PixelFormat::Nv12
        }
    }
}

/// Scan the leading `(l,t,r,b,w)` tuple; trailing text is tolerated here
/// and the multi-area case is rejected by the caller
fn parse_focus_area(raw: &str) -> Option<(i32, i32, i32, i32, i32)> {
    let inner = raw.trim().strip_prefix('(')?;
    let mut parts = inner.splitn(5, ',');
    let left = leading_int(parts.next()?)?;
    let top = leading_int(parts.next()?)?;
    let right = leading_int(parts.next()?)?;
    let bottom = leading_int(parts.next()?)?;
    let weight = leading_int(parts.next()?)?;
    Some((left, top, right, bottom, weight))
}

fn focus_area_is_valid(left: i32, top: i32, right: i32, bottom: i32, weight: i32) -> bool {
    if left == 0 && top == 0 && right == 0 && bottom == 0 && weight == 0 {
        // All zeros clears the area
        return true;
    }
    if left < -1000 || top < -1000 || right > 1000 || bottom > 1000 {
        return false;
    }
    if left >= right || top >= bottom {
        return false;
    }
    // A defined area needs a weight between 1 and 1000
    if (left != 0 || right != 0) && !(1..=1000).contains(&weight) {
        return false;
    }
    true
}

fn seed(profile: &'static DeviceProfile) -> (ParameterTable, String) {
    let params = &profile.params;
    let mut table = ParameterTable::new();
    let mut raw_focus_areas = String::new();

    table.set("preferred-preview-size-for-video", params.preview_size);

    table.set("preview-size-values", params.preview_size_values);
    table.set("preview-size", params.preview_size);
    table.set("preview-format-values", params.preview_format_values);
    table.set("preview-format", params.preview_format);
    table.set("preview-frame-rate-values", params.preview_frame_rate_values);
    table.set_int("preview-frame-rate", params.preview_frame_rate);
    table.set("preview-fps-range-values", params.preview_fps_range_values);
    table.set("preview-fps-range", params.preview_fps_range);

    table.set("picture-size-values", params.picture_size_values);
    table.set("picture-size", params.picture_size);
    table.set("picture-format-values", params.picture_format_values);
    table.set("picture-format", params.picture_format);
    table.set("jpeg-thumbnail-size-values", params.jpeg_thumbnail_size_values);
    table.set_int("jpeg-thumbnail-width", params.jpeg_thumbnail_width);
    table.set_int("jpeg-thumbnail-height", params.jpeg_thumbnail_height);
    table.set_int("jpeg-thumbnail-quality", params.jpeg_thumbnail_quality);
    table.set_int("jpeg-quality", params.jpeg_quality);

    if params.video_snapshot_supported {
        table.set("video-snapshot-supported", "true");
    }
    if params.full_video_snap_supported {
        table.set("full-video-snap-supported", "true");
    }

    table.set("video-size", params.recording_size);
    table.set("video-size-values", params.recording_size_values);
    table.set("video-frame-format", params.recording_format);

    table.set("focus-mode", params.focus_mode);
    table.set("focus-mode-values", params.focus_mode_values);
    table.set("focus-distances", params.focus_distances);
    if params.max_num_focus_areas > 0 {
        if let Some(areas) = params.focus_areas {
            table.set("focus-areas", areas);
            raw_focus_areas.push_str(areas);
        }
        table.set_int("max-num-focus-areas", params.max_num_focus_areas);
    }

    table.set_int("max-num-detected-faces-hw", params.max_detected_faces);

    if params.zoom_supported {
        table.set("zoom-supported", "true");
        if params.smooth_zoom_supported {
            table.set("smooth-zoom-supported", "true");
        }
        if let Some(ratios) = params.zoom_ratios {
            table.set("zoom-ratios", ratios);
        }
        table.set_int("zoom", params.zoom);
        table.set_int("max-zoom", params.max_zoom);
    } else {
        table.set("zoom-supported", "false");
    }

    if params.auto_exposure_lock_supported {
        table.set("auto-exposure-lock-supported", "true");
        table.set(
            "auto-exposure-lock",
            if params.auto_exposure_lock { "true" } else { "false" },
        );
    }
    if params.auto_white_balance_lock_supported {
        table.set("auto-whitebalance-lock-supported", "true");
        table.set(
            "auto-whitebalance-lock",
            if params.auto_white_balance_lock { "true" } else { "false" },
        );
    }

    if let Some(mode) = params.flash_mode {
        table.set("flash-mode", mode);
    }
    if let Some(values) = params.flash_mode_values {
        table.set("flash-mode-values", values);
    }

    table.set_int("exposure-compensation", params.exposure_compensation);
    table.set_float("exposure-compensation-step", params.exposure_compensation_step);
    table.set_int("min-exposure-compensation", params.min_exposure_compensation);
    table.set_int("max-exposure-compensation", params.max_exposure_compensation);

    if let Some(antibanding) = params.antibanding {
        table.set("antibanding", antibanding);
    }
    if let Some(values) = params.antibanding_values {
        table.set("antibanding-values", values);
    }

    table.set("whitebalance", params.whitebalance);
    table.set("whitebalance-values", params.whitebalance_values);

    if let Some(scene) = params.scene_mode {
        table.set("scene-mode", scene);
    }
    if let Some(values) = params.scene_mode_values {
        table.set("scene-mode-values", values);
    }

    table.set("effect", params.effect);
    table.set("effect-values", params.effect_values);

    table.set("iso", params.iso);
    table.set("iso-values", params.iso_values);

    table.set("image-stabilization", params.image_stabilization);
    table.set("image-stabilization-values", params.image_stabilization_values);

    table.set_float("focal-length", profile.focal_length);
    table.set_float("horizontal-view-angle", profile.horizontal_view_angle);
    table.set_float("vertical-view-angle", profile.vertical_view_angle);

    (table, raw_focus_areas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::MockCaptureDevice;
    use crate::profile::{S5C73M3, S5K6A3};

    fn applied_engine(profile: &'static DeviceProfile) -> (ParameterEngine, MockCaptureDevice) {
        let mut engine = ParameterEngine::new(profile);
        let device = MockCaptureDevice::new();
        let mut handle = device.clone();
        engine.apply(true, &mut handle).unwrap();
        (engine, device)
    }

    #[test]
    fn preset_defaults_reach_the_hardware() {
        let (engine, device) = applied_engine(&S5C73M3);

        assert_eq!(device.last_control(ControlId::JpegQuality), Some(90));
        assert_eq!(device.last_control(ControlId::FlashMode), Some(FlashMode::Off as i32));
        assert_eq!(device.last_control(ControlId::FocusMode), Some(FocusMode::Auto as i32));
        assert_eq!(device.last_control(ControlId::SceneMode), Some(SceneMode::None as i32));
        assert_eq!(
            device.last_control(ControlId::WhiteBalance),
            Some(WhiteBalance::Auto as i32)
        );
        assert_eq!(device.last_control(ControlId::Zoom), Some(0));
        assert_eq!(device.last_control(ControlId::AeAwbLock), Some(0));
        // Still mode is the latched default, so no switch is written
        assert_eq!(device.control_write_count(ControlId::SensorMode), 0);

        assert_eq!(engine.state().preview_geometry, Geometry::new(960, 720));
        assert_eq!(engine.state().picture_geometry, Geometry::new(3264, 2448));
        assert_eq!(engine.state().recording_geometry, Geometry::new(1280, 720));
        assert_eq!(engine.state().jpeg_quality, 90);
        assert_eq!(engine.state().preview_fps, 30);
    }

    #[test]
    fn gps_fix_is_latched_and_cleared_by_the_sentinel() {
        let (mut engine, device) = applied_engine(&S5C73M3);
        let mut handle = device.clone();
        assert!(engine.state().gps.is_none());

        let mut incoming = ParameterTable::new();
        incoming.set("gps-timestamp", "1714000000");
        incoming.set("gps-latitude", "48.25");
        incoming.set("gps-longitude", "-11.5");
        incoming.set("gps-altitude", "520");
        engine.merge(&incoming);
        engine.apply(false, &mut handle).unwrap();

        let fix = engine.state().gps.expect("fix latched");
        assert_eq!(fix.timestamp, 1714000000);
        assert_eq!(fix.latitude, 48.25);
        assert_eq!(fix.longitude, -11.5);

        let mut clear = ParameterTable::new();
        clear.set("gps-timestamp", "-1");
        clear.set("gps-latitude", "-1");
        clear.set("gps-longitude", "-1");
        clear.set("gps-altitude", "-1");
        engine.merge(&clear);
        engine.apply(false, &mut handle).unwrap();
        assert!(engine.state().gps.is_none());
    }

    #[test]
    fn unchanged_table_writes_nothing() {
        let (mut engine, device) = applied_engine(&S5C73M3);
        let before = device.control_writes().len();

        let mut handle = device.clone();
        engine.apply(false, &mut handle).unwrap();
        assert_eq!(device.control_writes().len(), before);
    }

    #[test]
    fn zoom_above_max_resets_and_errors() {
        let (mut engine, device) = applied_engine(&S5C73M3);

        engine.merge(&ParameterTable::parse("zoom=55"));
        let mut handle = device.clone();
        let err = engine.apply(false, &mut handle).unwrap_err();
        assert!(matches!(err, HalError::InvalidArgument(_)));
        assert_eq!(engine.table().get("zoom"), Some("30"));
        assert_ne!(device.last_control(ControlId::Zoom), Some(55));

        // The clamped table is valid again on the next pass
        engine.apply(false, &mut handle).unwrap();
        assert_eq!(device.last_control(ControlId::Zoom), Some(30));
    }

    #[test]
    fn portrait_scene_couples_flash_to_auto() {
        let (mut engine, device) = applied_engine(&S5C73M3);

        engine.merge(&ParameterTable::parse("scene-mode=portrait"));
        let mut handle = device.clone();
        engine.apply(false, &mut handle).unwrap();

        assert_eq!(device.last_control(ControlId::SceneMode), Some(SceneMode::Portrait as i32));
        assert_eq!(device.last_control(ControlId::FlashMode), Some(FlashMode::Auto as i32));
        // Portrait does not steal the focus mode
        assert_eq!(engine.state().focus_mode, Some(FocusMode::Auto));
    }

    #[test]
    fn other_scenes_force_flash_off_and_focus_auto() {
        let (mut engine, device) = applied_engine(&S5C73M3);

        engine.merge(&ParameterTable::parse("scene-mode=sunset;flash-mode=on"));
        let mut handle = device.clone();
        engine.apply(false, &mut handle).unwrap();

        assert_eq!(device.last_control(ControlId::SceneMode), Some(SceneMode::Sunset as i32));
        assert_eq!(device.last_control(ControlId::FlashMode), Some(FlashMode::Off as i32));
        assert_eq!(engine.state().focus_mode, Some(FocusMode::Auto));
    }

    #[test]
    fn off_center_focus_area_selects_touch_mode() {
        let (mut engine, device) = applied_engine(&S5C73M3);

        engine.merge(&ParameterTable::parse("focus-areas=(-200,-200,-100,-100,500)"));
        let mut handle = device.clone();
        engine.apply(false, &mut handle).unwrap();

        assert_eq!(device.last_control(ControlId::ObjectPositionX), Some(408));
        assert_eq!(device.last_control(ControlId::ObjectPositionY), Some(306));
        assert_eq!(device.last_control(ControlId::FocusMode), Some(FocusMode::Touch as i32));
        assert_eq!(engine.state().focus_mode, Some(FocusMode::Touch));
    }

    #[test]
    fn all_zero_focus_area_is_always_accepted() {
        let (mut engine, device) = applied_engine(&S5C73M3);

        engine.merge(&ParameterTable::parse("focus-areas=(0,0,0,0,0)"));
        let mut handle = device.clone();
        engine.apply(false, &mut handle).unwrap();
        assert_eq!(engine.state().focus_mode, Some(FocusMode::Auto));
    }

    #[test]
    fn invalid_focus_area_rolls_back() {
        let (mut engine, device) = applied_engine(&S5C73M3);

        engine.merge(&ParameterTable::parse("focus-areas=(500,500,100,100,10)"));
        let mut handle = device.clone();
        let err = engine.apply(false, &mut handle).unwrap_err();
        assert!(matches!(err, HalError::InvalidArgument(_)));
        assert_eq!(engine.table().get("focus-areas"), Some("(0,0,0,0,0)"));
    }

    #[test]
    fn multiple_focus_areas_are_rejected() {
        let (mut engine, device) = applied_engine(&S5C73M3);

        engine.merge(&ParameterTable::parse(
            "focus-areas=(-100,-100,100,100,500),(0,0,50,50,200)",
        ));
        let mut handle = device.clone();
        assert!(engine.apply(false, &mut handle).is_err());
        assert_eq!(engine.table().get("focus-areas"), Some("(0,0,0,0,0)"));
    }

    #[test]
    fn unknown_flash_mode_rolls_back() {
        let (mut engine, device) = applied_engine(&S5C73M3);

        engine.merge(&ParameterTable::parse("flash-mode=strobe"));
        let mut handle = device.clone();
        let err = engine.apply(false, &mut handle).unwrap_err();
        assert!(matches!(err, HalError::InvalidArgument(_)));
        assert_eq!(engine.table().get("flash-mode"), Some("off"));
    }

    #[test]
    fn recording_hint_repicks_preview_aspect() {
        let (mut engine, device) = applied_engine(&S5C73M3);

        engine.merge(&ParameterTable::parse("recording-hint=true;video-size=1920x1080"));
        let mut handle = device.clone();
        engine.apply(false, &mut handle).unwrap();

        assert_eq!(engine.state().preview_geometry, Geometry::new(1280, 720));
        assert_eq!(engine.state().recording_geometry, Geometry::new(1920, 1080));
        // Video snapshots fall back to the nearest published still size
        assert_eq!(engine.state().picture_geometry, Geometry::new(3264, 1836));
        assert_eq!(device.last_control(ControlId::SensorMode), Some(SensorMode::Movie as i32));
        let packed = (3264 & 0xffff) << 16 | (1836 & 0xffff);
        assert_eq!(device.last_control(ControlId::JpegResolution), Some(packed));
    }

    #[test]
    fn front_profile_skips_absent_groups() {
        let (engine, device) = applied_engine(&S5K6A3);

        assert_eq!(device.control_write_count(ControlId::FlashMode), 0);
        assert_eq!(device.control_write_count(ControlId::SceneMode), 0);
        assert_eq!(device.control_write_count(ControlId::Zoom), 0);
        assert_eq!(device.control_write_count(ControlId::Antibanding), 0);
        // Without a flash latch the exposure lock write stays suppressed
        assert_eq!(device.control_write_count(ControlId::AeAwbLock), 0);
        // The managed ISP negotiates still size itself
        assert_eq!(device.control_write_count(ControlId::JpegResolution), 0);
        assert_eq!(device.last_control(ControlId::FocusMode), Some(FocusMode::Fixed as i32));
        assert_eq!(engine.state().picture_geometry, Geometry::new(1280, 960));
    }

    #[test]
    fn recording_format_token_selects_nv12() {
        let (mut engine, device) = applied_engine(&S5C73M3);
        assert_eq!(engine.state().recording_format, PixelFormat::Nv12);

        engine.merge(&ParameterTable::parse("video-frame-format=yuv420p"));
        let mut handle = device.clone();
        engine.apply(false, &mut handle).unwrap();
        assert_eq!(engine.state().recording_format, PixelFormat::Yuv420p);
    }
}
