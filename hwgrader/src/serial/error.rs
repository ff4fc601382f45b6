/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use thiserror::Error;

/// Failures of a [`SerialTransceiver`](super::SerialTransceiver).
///
/// None of these are fatal to the process.  `DeviceUnavailable` puts the
/// transceiver (and usually its device) into a degraded state for the rest of
/// the task; `NotOpen` and `Io` are routine during reset windows.
#[derive(Debug, Error)]
pub enum SerialError {
    /// The device path could not be opened.
    #[error("serial device '{path}' unavailable: {reason}")]
    DeviceUnavailable { path: String, reason: String },

    /// A write was attempted while the port is closed.
    #[error("serial device '{path}' is not open")]
    NotOpen { path: String },

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}
