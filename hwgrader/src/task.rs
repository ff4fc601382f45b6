/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Core task data structures shared by the engine and the result transport.
//!
//! ```text
//! grading service ──(input files, secret)──► HardwareEngine ──(OutputBundle)──► ResultTransport
//!                                               │
//!                                          EngineStatus  IDLE ⇄ TESTING
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ── Engine status ─────────────────────────────────────────────────────────────

/// Testbed availability as reported to the grading service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EngineStatus {
    /// Ready to accept a task.
    #[default]
    Idle = 0,
    /// A task is in progress; new requests are refused.
    Testing = 1,
}

impl EngineStatus {
    /// Wire spelling used by the grading service.
    pub fn as_str(self) -> &'static str {
        match self {
            EngineStatus::Idle => "IDLE",
            EngineStatus::Testing => "TESTING",
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        if v == EngineStatus::Testing as u8 {
            EngineStatus::Testing
        } else {
            EngineStatus::Idle
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Deadline ──────────────────────────────────────────────────────────────────

/// Deadline applied when a request carries none.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(600);

/// Interpret a deadline given in (possibly fractional) seconds.
///
/// Absent, non-finite, zero and negative values all fall back to
/// [`DEFAULT_DEADLINE`].
pub fn deadline_from_secs(secs: Option<f64>) -> Duration {
    match secs {
        Some(s) if s.is_finite() && s > 0.0 => {
            Duration::try_from_secs_f64(s).unwrap_or(DEFAULT_DEADLINE)
        }
        _ => DEFAULT_DEADLINE,
    }
}

/// Same rule for an already typed duration: zero means "use the default".
pub fn effective_deadline(deadline: Option<Duration>) -> Duration {
    match deadline {
        Some(d) if !d.is_zero() => d,
        _ => DEFAULT_DEADLINE,
    }
}

// ── Output bundle ─────────────────────────────────────────────────────────────

/// Result artifacts of one task, as handed to the result transport.
///
/// `files` maps each required output name to its path in the backup
/// directory; names the devices never produced are listed in `missing`
/// instead.  Iteration order is by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputBundle {
    pub files: BTreeMap<String, PathBuf>,
    pub missing: Vec<String>,
}

impl OutputBundle {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
