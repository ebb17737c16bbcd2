// SPDX-License-Identifier: GPL-3.0-only

//! Auto-focus state machines
//!
//! The sensor reports one raw focus code per frame inside the interleaved
//! metadata block. Raw codes are translated to a canonical status through a
//! per-sensor table, then fed to two independent machines: the single-shot
//! machine backing an explicit focus request, and the continuous tracker
//! that mirrors lens movement for the client.
//!
//! The machines are pure: they return what should happen (notification,
//! lock release) and the capture loop performs the side effects.

use crate::sink::NotifyKind;

/// Canonical per-frame auto-focus status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfStatus {
    /// Lens is moving
    InProgress,
    /// Converged on a focused position
    Success,
    /// Gave up without converging
    Fail,
    /// Sensor restarted its cycle, ignore this frame
    Restart,
}

// S5C73M3 firmware status codes
pub const S5C73M3_CAF_FOCUSING: u8 = 1;
pub const S5C73M3_CAF_SEARCHING_DIR: u8 = 2;
pub const S5C73M3_AF_FOCUSING: u8 = 3;
pub const S5C73M3_CAF_FOCUSED: u8 = 4;
pub const S5C73M3_AF_FOCUSED: u8 = 5;
pub const S5C73M3_CAF_UNFOCUSED: u8 = 6;
pub const S5C73M3_AF_UNFOCUSED: u8 = 7;
pub const S5C73M3_AF_INVALID: u8 = 8;

/// Raw code translation for one sensor family
///
/// Codes absent from a table fall back to [`AfStatus::Restart`]. The
/// single-shot and continuous machines read the same raw byte but classify
/// it differently: a continuous-mode "unfocused" only restarts the tracker
/// while it fails an explicit request.
#[derive(Debug, Clone, Copy)]
pub struct AfCodeMap {
    pub single: &'static [(u8, AfStatus)],
    pub continuous: &'static [(u8, AfStatus)],
}

impl AfCodeMap {
    pub fn single_shot(&self, raw: u8) -> AfStatus {
        translate(self.single, raw)
    }

    pub fn continuous(&self, raw: u8) -> AfStatus {
        translate(self.continuous, raw)
    }
}

fn translate(table: &[(u8, AfStatus)], raw: u8) -> AfStatus {
    table
        .iter()
        .find(|(code, _)| *code == raw)
        .map(|(_, status)| *status)
        .unwrap_or(AfStatus::Restart)
}

pub static S5C73M3_AF_CODES: AfCodeMap = AfCodeMap {
    single: &[
        (S5C73M3_CAF_FOCUSING, AfStatus::InProgress),
        (S5C73M3_CAF_SEARCHING_DIR, AfStatus::InProgress),
        (S5C73M3_AF_FOCUSING, AfStatus::InProgress),
        (S5C73M3_CAF_FOCUSED, AfStatus::Success),
        (S5C73M3_AF_FOCUSED, AfStatus::Success),
        (S5C73M3_CAF_UNFOCUSED, AfStatus::Fail),
        (S5C73M3_AF_UNFOCUSED, AfStatus::Fail),
    ],
    continuous: &[
        (S5C73M3_CAF_FOCUSING, AfStatus::InProgress),
        (S5C73M3_CAF_SEARCHING_DIR, AfStatus::InProgress),
        (S5C73M3_CAF_FOCUSED, AfStatus::Success),
    ],
};

/// What one observed status asks the caller to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FocusOutcome {
    /// Notification to push through the sink dispatcher
    pub notify: Option<(NotifyKind, i32)>,
    /// The AE/AWB lock should be released now
    pub release_locks: bool,
}

/// Single-shot focus cycle backing an explicit focus request
///
/// Engaged by the focus-request control write, fed one status per frame
/// while engaged. A Success or Fail after the lens started moving emits
/// exactly one focus notification, then the machine resets to idle.
#[derive(Debug, Default)]
pub struct SingleShotFocus {
    engaged: bool,
    moving: bool,
}

impl SingleShotFocus {
    /// Arm the machine after the hardware accepted a focus request
    pub fn engage(&mut self) {
        self.engaged = true;
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    /// Feed one frame's canonical status
    pub fn observe(&mut self, status: AfStatus) -> FocusOutcome {
        let mut outcome = FocusOutcome::default();
        if !self.engaged {
            return outcome;
        }

        match status {
            AfStatus::Success => {
                if self.moving {
                    outcome.notify = Some((NotifyKind::Focus, 1));
                    outcome.release_locks = self.reset();
                }
            }
            AfStatus::Fail => {
                if self.moving {
                    outcome.notify = Some((NotifyKind::Focus, 0));
                    outcome.release_locks = self.reset();
                }
            }
            AfStatus::InProgress => self.moving = true,
            AfStatus::Restart => {}
        }

        outcome
    }

    /// Close out the cycle without a notification, the cancel path
    ///
    /// Returns true when a cycle was actually live, in which case the
    /// caller releases the AE/AWB lock.
    pub fn reset(&mut self) -> bool {
        if !self.engaged {
            return false;
        }
        self.engaged = false;
        self.moving = false;
        true
    }
}

/// Continuous tracker, independent of the single-shot machine
///
/// Mirrors lens movement to the client: one notification when the lens
/// starts moving, one when it converges. Armed by the continuous focus
/// modes; the capture loop resets it whenever another mode is active so a
/// stale movement flag cannot leak across mode changes.
#[derive(Debug, Default)]
pub struct ContinuousFocus {
    moving: bool,
}

impl ContinuousFocus {
    /// Feed one frame's canonical status
    pub fn observe(&mut self, status: AfStatus) -> Option<(NotifyKind, i32)> {
        match status {
            AfStatus::InProgress if !self.moving => {
                self.moving = true;
                Some((NotifyKind::FocusMove, 1))
            }
            AfStatus::Success if self.moving => {
                self.moving = false;
                Some((NotifyKind::FocusMove, 0))
            }
            _ => None,
        }
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }

    /// Forget any in-flight movement without notifying
    pub fn reset(&mut self) {
        self.moving = false;
    }
}
