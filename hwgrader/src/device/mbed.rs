/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Mbed-style DUT programmed over USB mass storage.
//!
//! Flashing is a file copy: the board exposes a drive at `mount_path`, and
//! an image copied there is programmed once the drive is unmounted and
//! mounted again.  Prepare flashes an optional blank image followed by the
//! testing image, then opens the board's UART.
//!
//! During execution the DUT's UART output is logged, and an optional stream
//! input is written to the board in timed chunks.  When
//! `expected_output_bytes` is set, reaching that many logged bytes asks the
//! engine to terminate.
//!
//! # Stream input
//! ```text
//! 2            number of samples
//! 0.5 1.0 2.5  three f32 per sample, sent little-endian
//! -1 0 0.25
//! 2            number of send events
//! 12 0.5       bytes to send, then seconds to wait
//! 12 0.0
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serialport::SerialPort;
use tracing::{debug, info, warn};

use super::dut_console::CappedLog;
use super::{run_command, Device, DeviceContext, DeviceError, StopSignal};
use crate::engine::TerminationNotifier;
use crate::serial::{open_port, SerialSettings};

/// Upper bound on stale bytes drained after opening the UART.
const DRAIN_LIMIT: usize = 4096;

/// Pause after a zero-length read.
const IDLE_READ: Duration = Duration::from_millis(5);

fn default_baud() -> u32 {
    115_200
}

fn default_log_size() -> u64 {
    1_000_000
}

fn default_settle_ms() -> u64 {
    3_000
}

fn default_mount() -> String {
    "mount".to_string()
}

fn default_umount() -> String {
    "umount".to_string()
}

/// Where the testing image comes from.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareSource {
    /// Uploaded with the task.
    Workspace { binary_name: String },
    /// Fixed image on the host.
    Host { binary_path: PathBuf },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MbedConfig {
    /// Block device of the board's USB drive, e.g. `/dev/sdb`.
    pub dev_path: String,
    pub mount_path: PathBuf,
    /// The board's UART.
    pub usb_path: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Flashed before the testing image to clear the previous program.
    #[serde(default)]
    pub blank_firmware_path: Option<PathBuf>,
    pub firmware: FirmwareSource,
    /// Workspace file receiving the UART log.  Without it the output is
    /// read and dropped.
    #[serde(default)]
    pub serial_output: Option<String>,
    #[serde(default = "default_log_size")]
    pub log_size: u64,
    /// Workspace file streamed to the board during execution.
    #[serde(default)]
    pub stream_input: Option<String>,
    /// Log size at which the run is complete.
    #[serde(default)]
    pub expected_output_bytes: Option<u64>,
    /// Wait after each step of a flash.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_mount")]
    pub mount_program: String,
    #[serde(default = "default_umount")]
    pub umount_program: String,
}

// ── Stream input ──────────────────────────────────────────────────────────────

/// Bytes to send and how to pace them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamPlan {
    pub bytes: Vec<u8>,
    /// `(byte count, pause after the chunk)` in send order.
    pub events: Vec<(usize, Duration)>,
}

/// Line-by-line reader that tracks 1-based line numbers for errors.
struct LineReader<'a> {
    path: &'a Path,
    lines: Vec<&'a str>,
    pos: usize,
}

impl<'a> LineReader<'a> {
    fn next(&mut self, what: &str) -> Result<(usize, &'a str), DeviceError> {
        let line = self
            .lines
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.bad(self.pos + 1, format!("missing {what}")))?;
        self.pos += 1;
        Ok((self.pos, line.trim()))
    }

    fn bad(&self, line: usize, reason: String) -> DeviceError {
        DeviceError::MalformedInput {
            file: self.path.display().to_string(),
            line,
            reason,
        }
    }
}

/// Parse a stream input file.
///
/// # Errors
/// [`DeviceError::MalformedInput`] naming the first bad line (1-based).
pub fn parse_stream_input(path: &Path) -> Result<StreamPlan, DeviceError> {
    let text = fs::read_to_string(path).map_err(|e| DeviceError::file(path, e))?;
    let mut reader = LineReader {
        path,
        lines: text.lines().collect(),
        pos: 0,
    };

    let (no, line) = reader.next("sample count")?;
    let samples: usize = line
        .parse()
        .map_err(|_| reader.bad(no, format!("bad sample count `{line}`")))?;

    let mut plan = StreamPlan::default();
    for _ in 0..samples {
        let (no, line) = reader.next("sample")?;
        let values = line
            .split_whitespace()
            .map(str::parse::<f32>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| reader.bad(no, e.to_string()))?;
        if values.len() != 3 {
            return Err(reader.bad(no, format!("expected 3 values, found {}", values.len())));
        }
        for v in values {
            plan.bytes.extend_from_slice(&v.to_le_bytes());
        }
    }

    let (no, line) = reader.next("event count")?;
    let events: usize = line
        .parse()
        .map_err(|_| reader.bad(no, format!("bad event count `{line}`")))?;
    for _ in 0..events {
        let (no, line) = reader.next("send event")?;
        let mut terms = line.split_whitespace();
        let count = terms.next().and_then(|t| t.parse::<usize>().ok());
        let wait = terms
            .next()
            .and_then(|t| t.parse::<f64>().ok())
            .filter(|w| w.is_finite() && *w >= 0.0);
        match (count, wait) {
            (Some(count), Some(wait)) => plan.events.push((count, Duration::from_secs_f64(wait))),
            _ => {
                return Err(reader.bad(no, format!("expected `<bytes> <seconds>`, found `{line}`")))
            }
        }
    }
    Ok(plan)
}

// ── Mbed ──────────────────────────────────────────────────────────────────────

pub struct Mbed {
    name: String,
    config: MbedConfig,
    settings: SerialSettings,
    firmware_path: PathBuf,
    output_path: Option<PathBuf>,
    stream_path: Option<PathBuf>,
    notifier: TerminationNotifier,
    stop: StopSignal,
    completion_sent: AtomicBool,
    plan: Mutex<StreamPlan>,
    port: Mutex<Option<Box<dyn SerialPort>>>,
    log: Mutex<Option<CappedLog<Box<dyn Write + Send>>>>,
}

impl Mbed {
    pub fn new(name: &str, config: &MbedConfig, ctx: &DeviceContext) -> Self {
        let firmware_path = match &config.firmware {
            FirmwareSource::Workspace { binary_name } => ctx.file(binary_name),
            FirmwareSource::Host { binary_path } => binary_path.clone(),
        };
        Self {
            name: name.to_string(),
            config: config.clone(),
            settings: SerialSettings::new(&config.usb_path, config.baud),
            firmware_path,
            output_path: config.serial_output.as_deref().map(|f| ctx.file(f)),
            stream_path: config.stream_input.as_deref().map(|f| ctx.file(f)),
            notifier: ctx.notifier.clone(),
            stop: StopSignal::new(),
            completion_sent: AtomicBool::new(false),
            plan: Mutex::new(StreamPlan::default()),
            port: Mutex::new(None),
            log: Mutex::new(None),
        }
    }

    fn settle(&self) {
        thread::sleep(Duration::from_millis(self.config.settle_ms));
    }

    /// Unmount and mount the board's drive so the copied image is
    /// programmed.
    ///
    /// # Errors
    /// Only a failed mount; unmounting an already unmounted drive is
    /// expected to fail and is just logged.
    fn remount(&self) -> Result<(), DeviceError> {
        let mut umount = Command::new(&self.config.umount_program);
        umount.arg(&self.config.dev_path);
        if let Err(e) = run_command(umount) {
            debug!(device = %self.name, error = %e, "unmount failed");
        }
        self.settle();

        let mut mount = Command::new(&self.config.mount_program);
        mount.arg(&self.config.dev_path).arg(&self.config.mount_path);
        run_command(mount)?;
        self.settle();
        Ok(())
    }

    /// Program `image`: clear the drive, copy, remount.
    fn flash(&self, image: &Path, label: &str) -> Result<(), DeviceError> {
        let mount = &self.config.mount_path;
        info!(device = %self.name, image = %image.display(), label, "programming firmware");

        for entry in fs::read_dir(mount).map_err(|e| DeviceError::file(mount, e))? {
            let path = entry.map_err(|e| DeviceError::file(mount, e))?.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| DeviceError::file(&path, e))?;
        }
        self.settle();

        let file_name = image.file_name().ok_or_else(|| {
            DeviceError::file(image, std::io::Error::new(ErrorKind::InvalidInput, "not a file"))
        })?;
        fs::copy(image, mount.join(file_name)).map_err(|e| DeviceError::file(image, e))?;
        self.settle();

        self.remount()
    }

    /// Open the UART and throw away what the board printed while booting.
    fn open_console(&self) -> Option<Box<dyn SerialPort>> {
        let mut port = match open_port(&self.settings) {
            Ok(port) => port,
            Err(e) => {
                warn!(device = %self.name, error = %e, "DUT UART unavailable, output stays empty");
                return None;
            }
        };
        let mut drained = 0;
        let mut byte = [0u8; 1];
        while drained < DRAIN_LIMIT {
            match port.read(&mut byte) {
                Ok(1) => drained += 1,
                _ => break,
            }
        }
        info!(device = %self.name, path = %self.settings.path, drained, "DUT UART open");
        Some(port)
    }

    /// Copy DUT output into the log until stopped.
    fn pump<R: Read + ?Sized>(&self, port: &mut R) -> Result<(), DeviceError> {
        let mut buf = [0u8; 256];
        while !self.stop.is_stopped() {
            let n = match port.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                self.stop.wait_timeout(IDLE_READ);
                continue;
            }

            let written = {
                let mut guard = self.log.lock();
                let Some(log) = guard.as_mut() else {
                    break;
                };
                log.append(&buf[..n]).map_err(DeviceError::Io)?;
                log.written()
            };
            if let Some(expected) = self.config.expected_output_bytes {
                if written >= expected && !self.completion_sent.swap(true, Ordering::AcqRel) {
                    info!(device = %self.name, bytes = written, "expected output received");
                    self.notifier.device_finished(&self.name);
                }
            }
        }
        Ok(())
    }

    /// Send the stream input chunk by chunk.  Write failures end the
    /// stream but not the run.
    fn stream<W: Write + ?Sized>(&self, port: &mut W, plan: &StreamPlan) {
        let mut sent = 0usize;
        for &(count, pause) in &plan.events {
            if self.stop.is_stopped() {
                return;
            }
            let end = (sent + count).min(plan.bytes.len());
            if let Err(e) = port.write_all(&plan.bytes[sent..end]).and_then(|_| port.flush()) {
                warn!(device = %self.name, error = %e, "stream write failed");
                return;
            }
            sent = end;
            debug!(device = %self.name, sent, total = plan.bytes.len(), "stream chunk sent");
            if self.stop.wait_timeout(pause) {
                return;
            }
        }
    }
}

impl Device for Mbed {
    fn on_before_execution(&self) -> Result<(), DeviceError> {
        self.stop.reset();
        self.completion_sent.store(false, Ordering::Release);

        *self.plan.lock() = match &self.stream_path {
            Some(path) => parse_stream_input(path)?,
            None => StreamPlan::default(),
        };

        if let Some(blank) = &self.config.blank_firmware_path {
            self.flash(blank, "blank")?;
        }
        self.flash(&self.firmware_path, "testing")?;

        let sink: Box<dyn Write + Send> = match &self.output_path {
            Some(path) => Box::new(BufWriter::new(
                File::create(path).map_err(|e| DeviceError::file(path, e))?,
            )),
            None => Box::new(std::io::sink()),
        };
        let cap = self.config.expected_output_bytes.unwrap_or(self.config.log_size);
        *self.log.lock() = Some(CappedLog::new(sink, cap));

        *self.port.lock() = self.open_console();
        Ok(())
    }

    fn on_execute(&self) -> Result<(), DeviceError> {
        let Some(mut port) = self.port.lock().take() else {
            return Ok(());
        };
        let plan = std::mem::take(&mut *self.plan.lock());

        let result = match port.try_clone() {
            Ok(mut reader) => thread::scope(|s| {
                let pump = s.spawn(|| self.pump(reader.as_mut()));
                self.stream(port.as_mut(), &plan);
                pump.join().unwrap_or_else(|_| {
                    Err(DeviceError::Io(std::io::Error::other("UART reader panicked")))
                })
            }),
            Err(e) => Err(DeviceError::Io(e.into())),
        };

        *self.port.lock() = Some(port);
        result
    }

    fn on_terminate(&self) -> Result<(), DeviceError> {
        self.stop.stop();
        if let Some(mut log) = self.log.lock().take() {
            debug!(device = %self.name, bytes = log.written(), "closing DUT log");
            log.flush().map_err(DeviceError::Io)?;
        }
        Ok(())
    }

    fn on_reset_after_execution(&self) -> Result<(), DeviceError> {
        if self.port.lock().take().is_some() {
            info!(device = %self.name, "DUT UART closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{termination_channel, TerminateTrigger, TriggerReceiver};
    use std::io::Cursor;

    const STREAM: &str = "2\n0.5 1.0 2.5\n-1 0 0.25\n2\n12 0.5\n12 0\n";

    struct Rig {
        dir: tempfile::TempDir,
        config: MbedConfig,
    }

    impl Rig {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mount = dir.path().join("mnt");
            fs::create_dir_all(&mount).unwrap();
            fs::create_dir_all(dir.path().join("files")).unwrap();
            fs::write(dir.path().join("blank.bin"), b"blank").unwrap();
            fs::write(dir.path().join("files/student.bin"), b"student").unwrap();

            let config = MbedConfig {
                dev_path: "/dev/sd-hwgrader".into(),
                mount_path: mount,
                usb_path: "/nonexistent/ttyACM-hwgrader".into(),
                baud: default_baud(),
                blank_firmware_path: Some(dir.path().join("blank.bin")),
                firmware: FirmwareSource::Workspace {
                    binary_name: "student.bin".into(),
                },
                serial_output: Some("dut.log".into()),
                log_size: default_log_size(),
                stream_input: None,
                expected_output_bytes: None,
                settle_ms: 0,
                mount_program: "true".into(),
                umount_program: "true".into(),
            };
            Self { dir, config }
        }

        fn workspace(&self) -> PathBuf {
            self.dir.path().join("files")
        }

        fn build(&self) -> (Mbed, TriggerReceiver) {
            let (notifier, rx) = termination_channel();
            let ctx = DeviceContext {
                workspace: self.workspace(),
                notifier,
            };
            (Mbed::new("mbed", &self.config, &ctx), rx)
        }
    }

    #[test]
    fn stream_input_packs_samples_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        fs::write(&path, STREAM).unwrap();

        let plan = parse_stream_input(&path).unwrap();
        assert_eq!(plan.bytes.len(), 24);
        assert_eq!(&plan.bytes[..4], &0.5f32.to_le_bytes());
        assert_eq!(&plan.bytes[12..16], &(-1.0f32).to_le_bytes());
        assert_eq!(
            plan.events,
            vec![(12, Duration::from_millis(500)), (12, Duration::ZERO)]
        );
    }

    #[test]
    fn stream_input_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        fs::write(&path, "1\n0.5 x 2\n0\n").unwrap();
        match parse_stream_input(&path) {
            Err(DeviceError::MalformedInput { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected: {other:?}"),
        }

        fs::write(&path, "1\n0.5 1 2\n").unwrap();
        match parse_stream_input(&path) {
            Err(DeviceError::MalformedInput { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn prepare_leaves_only_testing_image_on_drive() {
        let rig = Rig::new();
        fs::write(rig.config.mount_path.join("old.bin"), b"old").unwrap();
        let (dev, _rx) = rig.build();

        dev.on_before_execution().unwrap();
        let mut on_drive: Vec<_> = fs::read_dir(&rig.config.mount_path)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        on_drive.sort();
        assert_eq!(on_drive, vec!["student.bin"]);

        // No UART: execution ends at once and the log stays empty.
        dev.on_execute().unwrap();
        dev.on_terminate().unwrap();
        dev.on_reset_after_execution().unwrap();
        assert!(fs::read(rig.workspace().join("dut.log")).unwrap().is_empty());
    }

    #[test]
    fn failed_mount_fails_prepare() {
        let mut rig = Rig::new();
        rig.config.mount_program = "false".into();
        let (dev, _rx) = rig.build();
        assert!(matches!(
            dev.on_before_execution(),
            Err(DeviceError::Command { .. })
        ));
    }

    #[test]
    fn missing_stream_input_fails_before_flashing() {
        let mut rig = Rig::new();
        rig.config.stream_input = Some("absent.txt".into());
        let (dev, _rx) = rig.build();
        assert!(matches!(dev.on_before_execution(), Err(DeviceError::File { .. })));
        assert_eq!(fs::read_dir(&rig.config.mount_path).unwrap().count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expected_output_requests_termination_once() {
        let mut rig = Rig::new();
        rig.config.expected_output_bytes = Some(6);
        let (dev, mut rx) = rig.build();
        dev.on_before_execution().unwrap();
        let dev = std::sync::Arc::new(dev);

        let pump = {
            let dev = std::sync::Arc::clone(&dev);
            tokio::task::spawn_blocking(move || {
                let mut dut = Cursor::new(b"hello world".to_vec());
                dev.pump(&mut dut)
            })
        };

        assert_eq!(rx.recv().await, Some(TerminateTrigger::Device("mbed".into())));
        dev.on_terminate().unwrap();
        pump.await.unwrap().unwrap();

        assert_eq!(rx.drain(), 0);
        assert_eq!(fs::read(rig.workspace().join("dut.log")).unwrap(), b"hello ");
    }

    #[test]
    fn stream_paces_chunks_and_stops_early() {
        let rig = Rig::new();
        let (dev, _rx) = rig.build();
        let plan = StreamPlan {
            bytes: (0u8..10).collect(),
            events: vec![(4, Duration::ZERO), (4, Duration::ZERO), (4, Duration::ZERO)],
        };

        let mut sent = Vec::new();
        dev.stream(&mut sent, &plan);
        assert_eq!(sent, (0u8..10).collect::<Vec<_>>());

        dev.stop.stop();
        let mut after_stop = Vec::new();
        dev.stream(&mut after_stop, &plan);
        assert!(after_stop.is_empty());
    }
}
