/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Test hardware abstraction.
//!
//! Every piece of hardware on a testbed implements [`Device`], a four-phase
//! lifecycle driven by the engine:
//!
//! ```text
//!   on_before_execution ──► on_execute ──► on_terminate ──► on_reset_after_execution
//!   (sequential, ordered)   (concurrent)   (sequential)     (sequential, ordered)
//! ```
//!
//! The engine only ever sees `Arc<dyn Device>`; it never branches on the
//! concrete kind.  Concrete drivers are selected from configuration through
//! the tagged [`DeviceSpec`] enum, which doubles as the constructor registry.
//!
//! Devices may ask for early termination through the
//! [`TerminationNotifier`] in their [`DeviceContext`]; they never talk to
//! each other.

pub mod dut_console;
pub mod echo;
pub mod mbed;
pub mod power_meter;
pub mod remote_board;
pub mod serial_tester;

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::TerminationNotifier;
use crate::serial::SerialError;

use dut_console::{DutConsole, DutConsoleConfig};
use echo::{Echo, EchoConfig};
use mbed::{FirmwareSource, Mbed, MbedConfig};
use power_meter::{PowerMeter, PowerMeterConfig};
use remote_board::{RemoteBoard, RemoteBoardConfig};
use serial_tester::{SerialTester, SerialTesterConfig};

// ── Device contract ───────────────────────────────────────────────────────────

/// Lifecycle contract shared by all test hardware.
///
/// Methods take `&self` because `on_terminate` is called from the engine's
/// terminator while `on_execute` may still be blocking on another thread.
/// Implementations keep their mutable state behind locks or atomics.
///
/// Errors are reported to the engine, logged there, and never abort the
/// lifecycle of other devices.
pub trait Device: Send + Sync {
    /// Prepare the hardware for a run (open ports, flash firmware, connect
    /// sockets).  Called once per task, before `on_execute`.  May block for
    /// seconds.
    fn on_before_execution(&self) -> Result<(), DeviceError>;

    /// Active part of the run.  Must return promptly once `on_terminate` has
    /// been called.  Results go to the device's own output artifacts.
    fn on_execute(&self) -> Result<(), DeviceError>;

    /// Stop the run and flush / close every output artifact the device owns
    /// so it can be read afterwards.
    fn on_terminate(&self) -> Result<(), DeviceError>;

    /// Post-task cleanup after outputs have been harvested.
    fn on_reset_after_execution(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Errors raised by device lifecycle phases.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error("{path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An input artifact could not be interpreted.
    #[error("malformed input {file}:{line}: {reason}")]
    MalformedInput {
        file: String,
        line: usize,
        reason: String,
    },

    /// An external program (ssh, scp, mount, ...) exited unsuccessfully.
    #[error("command `{command}` failed: {status}")]
    Command { command: String, status: String },

    /// A bench instrument replied with something unexpected.
    #[error("instrument protocol error: {0}")]
    Instrument(String),
}

impl DeviceError {
    pub(crate) fn file(path: &Path, source: std::io::Error) -> Self {
        DeviceError::File {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ── External programs ─────────────────────────────────────────────────────────

/// Run `cmd` to completion with stdin closed.
pub(crate) fn run_command(mut cmd: Command) -> Result<(), DeviceError> {
    let display = format!("{cmd:?}");
    let status = cmd.stdin(Stdio::null()).status()?;
    check_status(&display, status)
}

pub(crate) fn check_status(command: &str, status: ExitStatus) -> Result<(), DeviceError> {
    if status.success() {
        Ok(())
    } else {
        Err(DeviceError::Command {
            command: command.to_string(),
            status: status.to_string(),
        })
    }
}

// ── StopSignal ────────────────────────────────────────────────────────────────

/// Per-device stop flag with wake-up.
///
/// `on_terminate` calls [`stop`](Self::stop); `on_execute` loops use
/// [`wait_timeout`](Self::wait_timeout) instead of `thread::sleep` so they
/// return as soon as the flag is raised.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-arm for a new task.
    pub fn reset(&self) {
        *self.stopped.lock() = false;
    }

    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep up to `timeout`, waking early on `stop()`.  Returns `true` if
    /// the signal is raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cv.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }

    /// Block until `stop()` is called.
    pub fn wait(&self) {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            self.cv.wait(&mut stopped);
        }
    }
}

// ── Construction context ──────────────────────────────────────────────────────

/// Everything a device receives from the engine at construction.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    /// Shared per-task file workspace.
    pub workspace: PathBuf,
    /// Capability to request engine-wide termination.
    pub notifier: TerminationNotifier,
}

impl DeviceContext {
    /// Absolute path of a workspace file.
    pub fn file(&self, name: &str) -> PathBuf {
        self.workspace.join(name)
    }
}

// ── DeviceSpec (kind tag → constructor) ───────────────────────────────────────

/// Configuration of one device, tagged by `kind` in YAML.
///
/// ```yaml
/// devices:
///   tester:
///     kind: serial_tester
///     usb_path: /dev/ttyACM0
///     input_waveform_file: waveform.txt
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceSpec {
    Echo(EchoConfig),
    SerialTester(SerialTesterConfig),
    DutConsole(DutConsoleConfig),
    RemoteBoard(RemoteBoardConfig),
    PowerMeter(PowerMeterConfig),
    Mbed(MbedConfig),
}

impl DeviceSpec {
    /// The `kind` tag as written in YAML.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceSpec::Echo(_) => "echo",
            DeviceSpec::SerialTester(_) => "serial_tester",
            DeviceSpec::DutConsole(_) => "dut_console",
            DeviceSpec::RemoteBoard(_) => "remote_board",
            DeviceSpec::PowerMeter(_) => "power_meter",
            DeviceSpec::Mbed(_) => "mbed",
        }
    }

    /// Workspace files this device reads.
    pub fn input_files(&self) -> Vec<&str> {
        match self {
            DeviceSpec::Echo(c) => vec![c.input_file.as_str()],
            DeviceSpec::SerialTester(c) => vec![c.input_waveform_file.as_str()],
            DeviceSpec::DutConsole(_) => Vec::new(),
            DeviceSpec::RemoteBoard(c) => c.uploads.iter().map(|u| u.file.as_str()).collect(),
            DeviceSpec::PowerMeter(_) => Vec::new(),
            DeviceSpec::Mbed(c) => {
                let mut files: Vec<&str> = c.stream_input.iter().map(String::as_str).collect();
                if let FirmwareSource::Workspace { binary_name } = &c.firmware {
                    files.push(binary_name.as_str());
                }
                files
            }
        }
    }

    /// Workspace files this device writes.
    pub fn output_files(&self) -> Vec<&str> {
        match self {
            DeviceSpec::Echo(c) => vec![c.output_file.as_str()],
            DeviceSpec::SerialTester(c) => c.output_waveform_file.iter().map(String::as_str).collect(),
            DeviceSpec::DutConsole(c) => vec![c.log_file.as_str()],
            DeviceSpec::RemoteBoard(c) => c.downloads.iter().map(|d| d.file.as_str()).collect(),
            DeviceSpec::PowerMeter(c) => vec![c.output_energy_file.as_str()],
            DeviceSpec::Mbed(c) => c.serial_output.iter().map(String::as_str).collect(),
        }
    }

    /// Construct the driver.
    ///
    /// # Errors
    /// [`ConfigError::Device`] if the kind-specific parameters are unusable.
    pub fn build(&self, name: &str, ctx: &DeviceContext) -> Result<Arc<dyn Device>, ConfigError> {
        let device: Arc<dyn Device> = match self {
            DeviceSpec::Echo(c) => Arc::new(Echo::new(name, c, ctx)),
            DeviceSpec::SerialTester(c) => Arc::new(
                SerialTester::new(name, c, ctx).map_err(|e| ConfigError::Device {
                    device: name.to_string(),
                    reason: e.to_string(),
                })?,
            ),
            DeviceSpec::DutConsole(c) => Arc::new(DutConsole::new(name, c, ctx)),
            DeviceSpec::RemoteBoard(c) => Arc::new(RemoteBoard::new(name, c, ctx)),
            DeviceSpec::PowerMeter(c) => Arc::new(PowerMeter::new(name, c, ctx)),
            DeviceSpec::Mbed(c) => Arc::new(Mbed::new(name, c, ctx)),
        };
        Ok(device)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
