// SPDX-License-Identifier: GPL-3.0-only

//! Typed firmware values behind the textual tokens
//!
//! Every enum here carries the integer the driver expects for its
//! control, and a token parser for the table value that selects it.
//! Parsers that fall back silently mirror the firmware's tolerance;
//! the two that return `None` (flash and focus mode) are the ones the
//! session rejects with a rollback.

use crate::types::{Geometry, GpsFix, PixelFormat};

/// Still versus movie sensor operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SensorMode {
    Camera = 0,
    Movie = 1,
}

/// Scenario hint for the managed ISP firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum IspScenario {
    PreviewStill = 0,
    PreviewVideo = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FocusMode {
    Auto = 0,
    Infinity = 1,
    Macro = 2,
    Fixed = 3,
    FaceDetect = 4,
    ContinuousVideo = 5,
    ContinuousPicture = 6,
    /// Selected implicitly by an off-center focus area
    Touch = 7,
}

impl FocusMode {
    /// `None` marks a token the firmware has no mode for
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "auto" => Some(Self::Auto),
            "infinity" => Some(Self::Infinity),
            "macro" => Some(Self::Macro),
            "fixed" => Some(Self::Fixed),
            "facedetect" => Some(Self::FaceDetect),
            "continuous-video" => Some(Self::ContinuousVideo),
            "continuous-picture" => Some(Self::ContinuousPicture),
            _ => None,
        }
    }

    pub fn is_continuous(self) -> bool {
        matches!(self, Self::ContinuousVideo | Self::ContinuousPicture)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FlashMode {
    Off = 1,
    Auto = 2,
    On = 3,
    Torch = 4,
}

impl FlashMode {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "off" => Some(Self::Off),
            "auto" => Some(Self::Auto),
            "on" => Some(Self::On),
            "torch" => Some(Self::Torch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SceneMode {
    None = 1,
    Portrait = 2,
    NightShot = 3,
    BackLight = 4,
    Landscape = 5,
    Sports = 6,
    PartyIndoor = 7,
    BeachSnow = 8,
    Sunset = 9,
    DuskDawn = 10,
    FallColor = 11,
    Fireworks = 12,
    Text = 13,
    CandleLight = 14,
    LowLight = 15,
}

impl SceneMode {
    /// Unknown tokens fall back to `None`, like the firmware default
    pub fn from_token(token: &str) -> Self {
        match token {
            "portrait" => Self::Portrait,
            "landscape" => Self::Landscape,
            "night" => Self::NightShot,
            "beach" | "snow" => Self::BeachSnow,
            "sunset" => Self::Sunset,
            "fireworks" => Self::Fireworks,
            "action" => Self::Sports,
            "party" => Self::PartyIndoor,
            "candlelight" => Self::CandleLight,
            "dusk-dawn" => Self::DuskDawn,
            "fall-color" => Self::FallColor,
            "back-light" => Self::BackLight,
            "text" => Self::Text,
            "high-sensitivity" => Self::LowLight,
            _ => Self::None,
        }
    }

    /// Modes that force flash to auto when selected
    pub fn wants_auto_flash(self) -> bool {
        matches!(self, Self::Portrait | Self::PartyIndoor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WhiteBalance {
    Auto = 1,
    Sunny = 2,
    Cloudy = 3,
    Tungsten = 4,
    Fluorescent = 5,
}

impl WhiteBalance {
    pub fn from_token(token: &str) -> Self {
        match token {
            "incandescent" => Self::Tungsten,
            "fluorescent" => Self::Fluorescent,
            "daylight" => Self::Sunny,
            "cloudy-daylight" => Self::Cloudy,
            _ => Self::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Antibanding {
    Auto = 0,
    FiftyHz = 1,
    SixtyHz = 2,
    Off = 3,
}

impl Antibanding {
    pub fn from_token(token: &str) -> Self {
        match token {
            "50hz" => Self::FiftyHz,
            "60hz" => Self::SixtyHz,
            "off" => Self::Off,
            _ => Self::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Effect {
    None = 1,
    Mono = 2,
    Negative = 3,
    Sepia = 4,
    Aqua = 5,
    Solarize = 6,
    Posterize = 7,
    Washed = 8,
    Sketch = 9,
    VintageWarm = 10,
    VintageCold = 11,
    PointBlue = 12,
    PointRedYellow = 13,
    PointGreen = 14,
}

impl Effect {
    /// `auto` selects no effect, same as `none`
    pub fn from_token(token: &str) -> Self {
        match token {
            "mono" => Self::Mono,
            "negative" => Self::Negative,
            "sepia" => Self::Sepia,
            "aqua" => Self::Aqua,
            "solarize" => Self::Solarize,
            "posterize" => Self::Posterize,
            "washed" => Self::Washed,
            "sketch" => Self::Sketch,
            "vintage-warm" => Self::VintageWarm,
            "vintage-cold" => Self::VintageCold,
            "point-blue" => Self::PointBlue,
            "point-red-yellow" => Self::PointRedYellow,
            "point-green" => Self::PointGreen,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum IsoValue {
    Auto = 0,
    Iso50 = 1,
    Iso100 = 2,
    Iso200 = 3,
    Iso400 = 4,
    Iso800 = 5,
}

impl IsoValue {
    pub fn from_token(token: &str) -> Self {
        match token {
            "ISO50" => Self::Iso50,
            "ISO100" => Self::Iso100,
            "ISO200" => Self::Iso200,
            "ISO400" => Self::Iso400,
            "ISO800" => Self::Iso800,
            _ => Self::Auto,
        }
    }
}

/// Still-image anti-shake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Stabilization {
    Off = 0,
    StillOn = 1,
}

impl Stabilization {
    pub fn from_token(token: &str) -> Self {
        if token == "on" { Self::StillOn } else { Self::Off }
    }
}

/// Last values pushed to (or latched for) the hardware
///
/// `Option` fields start out never-applied; groups the firmware leaves
/// untouched until a matching key shows up stay `None`, which is what
/// keeps the exposure lock write suppressed on sensors without flash.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterState {
    pub preview_geometry: Geometry,
    pub preview_format: PixelFormat,
    pub preview_fps: i32,

    pub picture_geometry: Geometry,
    pub picture_format: PixelFormat,
    pub thumbnail_geometry: Geometry,
    pub thumbnail_quality: i32,
    pub jpeg_quality: i32,

    pub recording_geometry: Geometry,
    pub recording_format: PixelFormat,

    pub sensor_mode: SensorMode,
    pub scenario: IspScenario,

    pub focus_position: (i32, i32),
    pub focus_mode: Option<FocusMode>,
    pub zoom: i32,
    pub ae_lock: bool,
    pub awb_lock: bool,
    pub flash_mode: Option<FlashMode>,
    pub exposure_compensation: i32,
    pub antibanding: Option<Antibanding>,
    pub white_balance: Option<WhiteBalance>,
    pub scene_mode: Option<SceneMode>,
    pub effect: Option<Effect>,
    pub iso: Option<IsoValue>,
    pub stabilization: Option<Stabilization>,

    /// Location fix for still EXIF; cleared by the timestamp sentinel
    pub gps: Option<GpsFix>,
}

impl Default for ParameterState {
    fn default() -> Self {
        Self {
            preview_geometry: Geometry::new(0, 0),
            preview_format: PixelFormat::Nv21,
            preview_fps: 0,
            picture_geometry: Geometry::new(0, 0),
            picture_format: PixelFormat::Jpeg,
            thumbnail_geometry: Geometry::new(0, 0),
            thumbnail_quality: 0,
            jpeg_quality: 0,
            recording_geometry: Geometry::new(0, 0),
            recording_format: PixelFormat::Nv12,
            sensor_mode: SensorMode::Camera,
            scenario: IspScenario::PreviewStill,
            focus_position: (0, 0),
            focus_mode: None,
            zoom: 0,
            ae_lock: false,
            awb_lock: false,
            flash_mode: None,
            exposure_compensation: 0,
            antibanding: None,
            white_balance: None,
            scene_mode: None,
            effect: None,
            iso: None,
            stabilization: None,
            gps: None,
        }
    }
}
