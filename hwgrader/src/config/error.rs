/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use thiserror::Error;

/// Invalid testbed configuration.  Always fatal at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("testbed declares no devices")]
    NoDevices,

    /// `device_order` names a device that is not configured.
    #[error("device_order names unknown device '{0}'")]
    UnknownDevice(String),

    #[error("device_order lists '{0}' more than once")]
    DuplicateDevice(String),

    /// A configured device is absent from `device_order`.
    #[error("device '{0}' is missing from device_order")]
    UnorderedDevice(String),

    /// A file name carries a path component or is empty.
    #[error("'{0}' is not a bare file name")]
    InvalidFileName(String),

    #[error("file '{0}' is listed more than once")]
    DuplicateFile(String),

    #[error("file '{0}' is both a required input and a required output")]
    InputOutputOverlap(String),

    /// A device reads a file the grading service never supplies.
    #[error("device '{device}' reads '{file}', which is not a required input")]
    UndeclaredInput { device: String, file: String },

    /// A device would overwrite a supplied input.
    #[error("device '{device}' writes '{file}', which is a required input")]
    OutputShadowsInput { device: String, file: String },

    #[error("devices '{first}' and '{second}' both write '{file}'")]
    SharedOutput {
        first: String,
        second: String,
        file: String,
    },

    /// Kind-specific parameters are unusable.
    #[error("device '{device}': {reason}")]
    Device { device: String, reason: String },
}
