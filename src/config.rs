// SPDX-License-Identifier: GPL-3.0-only

//! Runtime configuration
//!
//! Deployment-specific knobs that do not belong in a device profile: which
//! video nodes back the sensors and how the capture loop paces itself.
//! Loaded from a JSON file under the user configuration directory; a
//! missing file is the default configuration, a malformed one is reported
//! and ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capture::CaptureTuning;
use crate::types::CameraFacing;

const CONFIG_DIR: &str = "camhal";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HalConfig {
    /// Video node backing the rear sensor
    pub rear_node: PathBuf,
    /// Video node backing the front sensor
    pub front_node: PathBuf,
    /// Ring depth requested from the driver
    pub capture_buffers: u32,
    /// Per-iteration frame wait, milliseconds
    pub frame_wait_ms: u64,
    /// Bound on thread pause/stop handshakes, milliseconds
    pub stop_wait_ms: u64,
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            rear_node: PathBuf::from("/dev/video0"),
            front_node: PathBuf::from("/dev/video1"),
            capture_buffers: 6,
            frame_wait_ms: 100,
            stop_wait_ms: 2000,
        }
    }
}

impl HalConfig {
    /// Load from the user configuration directory
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            debug!("no configuration directory, using defaults");
            return Self::default();
        };
        Self::load_from(&path)
    }

    /// Load from an explicit file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no configuration file, using defaults");
                return Self::default();
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "configuration unreadable, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(config) => {
                debug!(path = %path.display(), "configuration loaded");
                config
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "configuration malformed, using defaults");
                Self::default()
            }
        }
    }

    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|base| base.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn node_for(&self, facing: CameraFacing) -> &Path {
        match facing {
            CameraFacing::Back => &self.rear_node,
            CameraFacing::Front => &self.front_node,
        }
    }

    pub fn tuning(&self) -> CaptureTuning {
        CaptureTuning {
            buffers: self.capture_buffers.max(1),
            frame_wait: Duration::from_millis(self.frame_wait_ms.max(1)),
            stop_wait: Duration::from_millis(self.stop_wait_ms.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = HalConfig::default();
        assert_eq!(config.node_for(CameraFacing::Back), Path::new("/dev/video0"));
        assert_eq!(config.node_for(CameraFacing::Front), Path::new("/dev/video1"));
        let tuning = config.tuning();
        assert_eq!(tuning.buffers, 6);
        assert_eq!(tuning.frame_wait, Duration::from_millis(100));
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let config: HalConfig = serde_json::from_str(r#"{"capture_buffers": 4}"#).unwrap();
        assert_eq!(config.capture_buffers, 4);
        assert_eq!(config.frame_wait_ms, 100);
        assert_eq!(config.rear_node, PathBuf::from("/dev/video0"));
    }

    #[test]
    fn missing_file_is_the_default() {
        let config = HalConfig::load_from(Path::new("/nonexistent/camhal.json"));
        assert_eq!(config, HalConfig::default());
    }

    #[test]
    fn round_trips_through_json() {
        let config = HalConfig {
            rear_node: PathBuf::from("/dev/video9"),
            stop_wait_ms: 500,
            ..HalConfig::default()
        };
        let raw = serde_json::to_string(&config).unwrap();
        let back: HalConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn degenerate_tuning_values_are_clamped() {
        let config: HalConfig =
            serde_json::from_str(r#"{"capture_buffers": 0, "frame_wait_ms": 0}"#).unwrap();
        let tuning = config.tuning();
        assert_eq!(tuning.buffers, 1);
        assert_eq!(tuning.frame_wait, Duration::from_millis(1));
    }
}
