/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! File-echo simulator.
//!
//! Copies its input file to its output file one line at a time, pausing
//! `line_interval_ms` before each line.  A line reading `TERMINATE` is
//! echoed and then ends the whole task early.  Useful for exercising a
//! testbed without any hardware attached.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use super::{Device, DeviceContext, DeviceError, StopSignal};
use crate::engine::TerminationNotifier;

/// Line that makes the simulator request termination.
pub const TERMINATE_MARKER: &str = "TERMINATE";

fn default_line_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EchoConfig {
    pub input_file: String,
    pub output_file: String,
    /// Pause before each echoed line.
    #[serde(default = "default_line_interval_ms")]
    pub line_interval_ms: u64,
    /// Request termination when the input runs out.
    #[serde(default)]
    pub terminate_on_eof: bool,
}

pub struct Echo {
    name: String,
    input_path: PathBuf,
    output_path: PathBuf,
    line_interval: Duration,
    terminate_on_eof: bool,
    notifier: TerminationNotifier,
    stop: StopSignal,
    output: Mutex<Option<BufWriter<File>>>,
}

impl Echo {
    pub fn new(name: &str, config: &EchoConfig, ctx: &DeviceContext) -> Self {
        Self {
            name: name.to_string(),
            input_path: ctx.file(&config.input_file),
            output_path: ctx.file(&config.output_file),
            line_interval: Duration::from_millis(config.line_interval_ms),
            terminate_on_eof: config.terminate_on_eof,
            notifier: ctx.notifier.clone(),
            stop: StopSignal::new(),
            output: Mutex::new(None),
        }
    }

    fn write_line(&self, line: &str) -> Result<bool, DeviceError> {
        let mut guard = self.output.lock();
        let Some(out) = guard.as_mut() else {
            return Ok(false);
        };
        writeln!(out, "{line}")
            .and_then(|_| out.flush())
            .map_err(|e| DeviceError::file(&self.output_path, e))?;
        Ok(true)
    }
}

impl Device for Echo {
    fn on_before_execution(&self) -> Result<(), DeviceError> {
        self.stop.reset();
        *self.output.lock() = None;
        Ok(())
    }

    fn on_execute(&self) -> Result<(), DeviceError> {
        let input =
            File::open(&self.input_path).map_err(|e| DeviceError::file(&self.input_path, e))?;

        {
            // Checked under the output lock: on_terminate raises the flag
            // before taking the writer, so a writer stored here is always
            // seen by it.
            let mut guard = self.output.lock();
            if self.stop.is_stopped() {
                return Ok(());
            }
            let out = File::create(&self.output_path)
                .map_err(|e| DeviceError::file(&self.output_path, e))?;
            *guard = Some(BufWriter::new(out));
        }

        for line in BufReader::new(input).lines() {
            if self.stop.wait_timeout(self.line_interval) {
                debug!(device = %self.name, "stopped while echoing");
                return Ok(());
            }
            let line = line.map_err(|e| DeviceError::file(&self.input_path, e))?;
            if !self.write_line(&line)? {
                return Ok(());
            }
            if line.trim() == TERMINATE_MARKER {
                info!(device = %self.name, "termination marker echoed");
                self.notifier.device_finished(&self.name);
                return Ok(());
            }
        }

        if self.terminate_on_eof && !self.stop.is_stopped() {
            info!(device = %self.name, "input exhausted");
            self.notifier.device_finished(&self.name);
        }
        Ok(())
    }

    fn on_terminate(&self) -> Result<(), DeviceError> {
        self.stop.stop();
        if let Some(mut out) = self.output.lock().take() {
            out.flush()
                .map_err(|e| DeviceError::file(&self.output_path, e))?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{termination_channel, TerminateTrigger};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn echo(dir: &std::path::Path, interval_ms: u64) -> (Echo, crate::engine::TriggerReceiver) {
        let (notifier, rx) = termination_channel();
        let ctx = DeviceContext {
            workspace: dir.to_path_buf(),
            notifier,
        };
        let config = EchoConfig {
            input_file: "in.txt".into(),
            output_file: "out.txt".into(),
            line_interval_ms: interval_ms,
            terminate_on_eof: false,
        };
        (Echo::new("echo", &config, &ctx), rx)
    }

    #[tokio::test]
    async fn echoes_until_marker_and_requests_termination() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), "hello\nworld\nTERMINATE\nignored\n").unwrap();
        let (dev, mut rx) = echo(dir.path(), 1);

        dev.on_before_execution().unwrap();
        dev.on_execute().unwrap();
        dev.on_terminate().unwrap();

        assert_eq!(
            rx.recv().await,
            Some(TerminateTrigger::Device("echo".into()))
        );
        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(out, "hello\nworld\nTERMINATE\n");
    }

    #[test]
    fn terminate_interrupts_slow_echo() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), "a\nb\n").unwrap();
        let (dev, _rx) = echo(dir.path(), 10_000);
        let dev = Arc::new(dev);
        dev.on_before_execution().unwrap();

        let runner = {
            let dev = Arc::clone(&dev);
            thread::spawn(move || dev.on_execute())
        };
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        dev.on_terminate().unwrap();
        runner.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn missing_input_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (dev, _rx) = echo(dir.path(), 1);
        dev.on_before_execution().unwrap();
        assert!(matches!(dev.on_execute(), Err(DeviceError::File { .. })));
        dev.on_terminate().unwrap();
    }
}
