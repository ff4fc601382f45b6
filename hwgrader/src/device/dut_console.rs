/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Raw logger for the DUT's own UART console.
//!
//! Whatever the student's firmware prints is copied byte for byte into the
//! log file, up to `log_size` bytes.  Bytes beyond the cap are read and
//! dropped so the DUT never blocks on a full TX buffer.

use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Deserialize;
use serialport::SerialPort;
use tracing::{debug, info, warn};

use super::{Device, DeviceContext, DeviceError, StopSignal};
use crate::serial::{open_port, SerialSettings};

fn default_baud() -> u32 {
    115_200
}

fn default_log_size() -> u64 {
    1_000_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DutConsoleConfig {
    pub dev_path: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    pub log_file: String,
    /// Maximum number of bytes kept in the log.
    #[serde(default = "default_log_size")]
    pub log_size: u64,
}

/// Capped byte sink.
#[derive(Debug)]
pub(super) struct CappedLog<W> {
    out: W,
    written: u64,
    cap: u64,
}

impl<W: Write> CappedLog<W> {
    pub(super) fn new(out: W, cap: u64) -> Self {
        Self { out, written: 0, cap }
    }

    pub(super) fn written(&self) -> u64 {
        self.written
    }

    pub(super) fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }

    /// Append as much of `bytes` as fits.  Returns the number kept.
    pub(super) fn append(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        let room = self.cap.saturating_sub(self.written);
        let keep = bytes.len().min(usize::try_from(room).unwrap_or(usize::MAX));
        if keep > 0 {
            self.out.write_all(&bytes[..keep])?;
            self.written += keep as u64;
        }
        Ok(keep)
    }
}

pub struct DutConsole {
    name: String,
    settings: SerialSettings,
    log_path: PathBuf,
    log_size: u64,
    stop: StopSignal,
    port: Mutex<Option<Box<dyn SerialPort>>>,
    log: Mutex<Option<CappedLog<BufWriter<File>>>>,
}

impl DutConsole {
    pub fn new(name: &str, config: &DutConsoleConfig, ctx: &DeviceContext) -> Self {
        Self {
            name: name.to_string(),
            settings: SerialSettings::new(&config.dev_path, config.baud),
            log_path: ctx.file(&config.log_file),
            log_size: config.log_size,
            stop: StopSignal::new(),
            port: Mutex::new(None),
            log: Mutex::new(None),
        }
    }

    /// Copy bytes from `port` into the log until stopped.
    fn pump(&self, port: &mut dyn SerialPort) -> Result<(), DeviceError> {
        let mut buf = [0u8; 256];
        while !self.stop.is_stopped() {
            let n = match port.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                continue;
            }
            let mut guard = self.log.lock();
            let Some(log) = guard.as_mut() else {
                break;
            };
            log.append(&buf[..n])
                .map_err(|e| DeviceError::file(&self.log_path, e))?;
        }
        Ok(())
    }
}

impl Device for DutConsole {
    fn on_before_execution(&self) -> Result<(), DeviceError> {
        self.stop.reset();

        let file = File::create(&self.log_path).map_err(|e| DeviceError::file(&self.log_path, e))?;
        *self.log.lock() = Some(CappedLog::new(BufWriter::new(file), self.log_size));

        match open_port(&self.settings) {
            Ok(port) => {
                info!(device = %self.name, path = %self.settings.path, "DUT console open");
                *self.port.lock() = Some(port);
            }
            Err(e) => {
                warn!(device = %self.name, error = %e, "DUT console unavailable, log stays empty");
            }
        }
        Ok(())
    }

    fn on_execute(&self) -> Result<(), DeviceError> {
        // Taken for the duration of the run so on_terminate never waits on
        // a blocked read.
        let Some(mut port) = self.port.lock().take() else {
            return Ok(());
        };
        let result = self.pump(port.as_mut());
        *self.port.lock() = Some(port);
        result
    }

    fn on_terminate(&self) -> Result<(), DeviceError> {
        self.stop.stop();
        if let Some(mut log) = self.log.lock().take() {
            debug!(device = %self.name, bytes = log.written(), "closing DUT log");
            log.flush()
                .map_err(|e| DeviceError::file(&self.log_path, e))?;
        }
        Ok(())
    }

    fn on_reset_after_execution(&self) -> Result<(), DeviceError> {
        if self.port.lock().take().is_some() {
            info!(device = %self.name, "DUT console closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::termination_channel;

    #[test]
    fn capped_log_truncates_at_limit() {
        let mut log = CappedLog::new(Vec::new(), 5);
        assert_eq!(log.append(b"abc").unwrap(), 3);
        assert_eq!(log.append(b"defg").unwrap(), 2);
        assert_eq!(log.append(b"h").unwrap(), 0);
        assert_eq!(log.out, b"abcde");
    }

    #[test]
    fn missing_console_leaves_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let (notifier, _rx) = termination_channel();
        let ctx = DeviceContext {
            workspace: dir.path().to_path_buf(),
            notifier,
        };
        let config = DutConsoleConfig {
            dev_path: "/nonexistent/ttyUSB-hwgrader".into(),
            baud: default_baud(),
            log_file: "dut.log".into(),
            log_size: default_log_size(),
        };
        let dev = DutConsole::new("dut", &config, &ctx);

        dev.on_before_execution().unwrap();
        dev.on_execute().unwrap();
        dev.on_terminate().unwrap();
        dev.on_reset_after_execution().unwrap();

        let log = std::fs::read(dir.path().join("dut.log")).unwrap();
        assert!(log.is_empty());
    }
}
