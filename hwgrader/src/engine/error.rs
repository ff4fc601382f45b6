/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Errors returned by [`HardwareEngine`](super::HardwareEngine) entry points.
//!
//! Only request validation and construction can fail.  Failures inside a
//! running task (device errors, missing outputs, transport errors) are
//! logged and never surface here; the task always ends back in `IDLE`.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A task is already running.  Not fatal; retry once the engine reports
    /// `IDLE`.
    #[error("engine is busy with another task")]
    Busy,

    /// A required input file was not supplied.
    #[error("required input file '{name}' is missing")]
    MissingInput { name: String },

    /// A supplied file is not in the required input set.
    #[error("input file '{name}' is not expected by this testbed")]
    UnexpectedInput { name: String },

    /// The task workspace could not be prepared.
    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    /// Invalid testbed configuration at construction.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
