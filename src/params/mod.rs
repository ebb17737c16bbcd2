// SPDX-License-Identifier: GPL-3.0-only

//! Textual parameter table and the engine that pushes it to hardware
//!
//! Settings travel as a flat `key=value;key=value` string. The table
//! keeps every pair verbatim in insertion order so a flattened round
//! trip returns exactly what was stored; interpretation only happens
//! when [`ParameterEngine::apply`] walks the table and reconciles it
//! against the latched hardware state.

mod engine;
mod state;

pub use engine::ParameterEngine;
pub use state::{
    Antibanding, Effect, FlashMode, FocusMode, IsoValue, IspScenario, ParameterState, SceneMode,
    SensorMode, Stabilization, WhiteBalance,
};

/// Ordered `key=value` store backing the textual parameter protocol
///
/// Keys keep their first-insertion position when overwritten, matching
/// what callers expect from repeated get/set round trips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterTable {
    entries: Vec<(String, String)>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `key=value;key=value` string; malformed segments are skipped
    pub fn parse(raw: &str) -> Self {
        let mut table = Self::new();
        for pair in raw.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            table.set(key, value.trim());
        }
        table
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Leading-integer read, tolerating trailing garbage
    pub fn get_int(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(leading_int)
    }

    pub fn get_float(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Insert or overwrite in place, keeping the key's position
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1.clear();
            entry.1.push_str(value);
        } else {
            self.entries.push((key.to_owned(), value.to_owned()));
        }
    }

    pub fn set_int(&mut self, key: &str, value: i32) {
        self.set(key, &value.to_string());
    }

    pub fn set_float(&mut self, key: &str, value: f32) {
        self.set(key, &value.to_string());
    }

    /// Overlay every pair from `incoming` onto this table
    pub fn merge_from(&mut self, incoming: &ParameterTable) {
        for (key, value) in &incoming.entries {
            self.set(key, value);
        }
    }

    /// Flatten back to the wire form
    pub fn flatten(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Parse the leading signed integer of a string, `atoi` style
pub(crate) fn leading_int(raw: &str) -> Option<i32> {
    let raw = raw.trim_start();
    let bytes = raw.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }
    let digits = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits {
        return None;
    }
    raw[..end].parse().ok()
}

/// Parse a `WxH` token, leaving a side at zero when it does not scan
pub(crate) fn parse_dimensions(raw: &str) -> (i32, i32) {
    match raw.split_once('x') {
        Some((w, h)) => (
            leading_int(w).unwrap_or(0),
            leading_int(h).unwrap_or(0),
        ),
        None => (leading_int(raw).unwrap_or(0), 0),
    }
}
