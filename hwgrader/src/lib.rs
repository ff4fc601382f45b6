/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! hwgrader – hardware-in-the-loop grading engine
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── protocol/       – 9-byte tester frames, stream resynchronisation
//! ├── serial/         – UART transceiver with background reader thread
//! ├── device/         – Device lifecycle trait, DeviceSpec factory, drivers
//! ├── engine/         – IDLE/TESTING state machine, terminate procedure,
//! │                     termination channel, workspace + backups
//! ├── task            – EngineStatus, deadlines, OutputBundle
//! ├── transport/      – ResultTransport trait, HTTP and logging transports
//! └── config/         – YAML testbed configuration
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod protocol;
pub mod serial;
pub mod task;
pub mod transport;
