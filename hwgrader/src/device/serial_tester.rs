/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Serial-driven waveform tester (microcontroller board on a USB UART).
//!
//! # Files
//! Input waveform: free-form metadata, a `==` separator line, then one
//! `type,time,value` line per packet to stream.
//!
//! Output waveform, written on terminate:
//! ```text
//! Period: 12.034512
//! Tick frequency: 3000.000000
//! Display start
//! DUT0,0,1
//! Display end
//! ==
//! 68, 1200, 1
//! ...
//! ```
//!
//! # Protocol
//! Prepare sends [`CMD_RESET_TESTER`] and waits for the board to settle.
//! Bytes received before execution starts are discarded.
//! Every packet the tester sends back is recorded, except
//! [`CMD_TEST_COMPLETE`](crate::protocol::CMD_TEST_COMPLETE), which asks the
//! engine to terminate.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Device, DeviceContext, DeviceError, StopSignal};
use crate::engine::TerminationNotifier;
use crate::protocol::{Packet, CMD_RESET_TESTER};
use crate::serial::{PacketHandler, SerialError, SerialSettings, SerialTransceiver};

/// Line separating waveform metadata from packet lines.
const METADATA_END: &str = "==";

fn default_baud() -> u32 {
    460_800
}

fn default_settle_ms() -> u64 {
    1_000
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SerialTesterConfig {
    pub usb_path: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    pub input_waveform_file: String,
    /// Where to write the recorded waveform.  Nothing is written when absent.
    #[serde(default)]
    pub output_waveform_file: Option<String>,
    pub output_metadata: OutputMetadata,
    /// Wait after the reset command before streaming.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

/// Header copied into the output waveform.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputMetadata {
    pub tick_frequency: f64,
    #[serde(default)]
    pub pins: Vec<PinLabel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PinLabel {
    pub label: String,
    pub indexes: Vec<u32>,
}

impl OutputMetadata {
    /// Header lines; the first one is the period placeholder filled in on
    /// terminate.
    fn header_lines(&self) -> Vec<String> {
        let mut lines = vec![
            String::new(),
            format!("Tick frequency: {:.6}", self.tick_frequency),
            "Display start".to_string(),
        ];
        for pin in &self.pins {
            let indexes: Vec<String> = pin.indexes.iter().map(u32::to_string).collect();
            lines.push(format!("{},{}", pin.label, indexes.join(",")));
        }
        lines.push("Display end".to_string());
        lines.push(METADATA_END.to_string());
        lines
    }
}

// ── Recording ─────────────────────────────────────────────────────────────────

/// Output lines accumulated by the packet handler.
#[derive(Debug, Default)]
struct Recording {
    lines: Vec<String>,
    /// Set once the output file is written; later packets are ignored.
    finalized: bool,
}

/// Handler run on the transceiver's reader thread.
fn packet_handler(
    name: String,
    notifier: TerminationNotifier,
    stop: Arc<StopSignal>,
    recording: Arc<Mutex<Recording>>,
) -> PacketHandler {
    Arc::new(move |packet: Packet| {
        if packet.is_test_complete() {
            info!(device = %name, "test-complete packet received");
            stop.stop();
            notifier.device_finished(&name);
            return;
        }

        let mut rec = recording.lock();
        if !rec.finalized {
            rec.lines.push(format!(
                "{}, {}, {}",
                packet.command, packet.time, packet.value
            ));
        }
    })
}

// ── Waveform input ────────────────────────────────────────────────────────────

/// Parse the packet section of an input waveform file.
///
/// Everything up to the first `==` line is metadata and skipped.  A file
/// without a separator therefore yields no packets.
pub fn parse_waveform(path: &Path) -> Result<Vec<Packet>, DeviceError> {
    let content = fs::read_to_string(path).map_err(|e| DeviceError::file(path, e))?;
    let file = path.display().to_string();

    let mut lines = content.lines().enumerate();
    for (_, line) in lines.by_ref() {
        if line.trim() == METADATA_END {
            break;
        }
    }

    let mut packets = Vec::new();
    for (idx, line) in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let malformed = |reason: String| DeviceError::MalformedInput {
            file: file.clone(),
            line: idx + 1,
            reason,
        };

        let terms: Vec<&str> = line.split(',').map(str::trim).collect();
        let [cmd, time, value] = terms[..] else {
            return Err(malformed(format!("expected 3 fields, got {}", terms.len())));
        };
        let cmd: u8 = cmd
            .parse()
            .map_err(|e| malformed(format!("packet type '{cmd}': {e}")))?;
        let time: u64 = time
            .parse()
            .map_err(|e| malformed(format!("time '{time}': {e}")))?;
        let value: u64 = value
            .parse()
            .map_err(|e| malformed(format!("value '{value}': {e}")))?;

        packets.push(Packet::try_new(cmd, time, value).map_err(|e| malformed(e.to_string()))?);
    }

    Ok(packets)
}

// ── SerialTester ──────────────────────────────────────────────────────────────

pub struct SerialTester {
    name: String,
    input_path: PathBuf,
    output_path: Option<PathBuf>,
    metadata: OutputMetadata,
    settle: Duration,
    transceiver: SerialTransceiver,
    stop: Arc<StopSignal>,
    recording: Arc<Mutex<Recording>>,
    waveform: Mutex<Vec<Packet>>,
    started_at: Mutex<Option<Instant>>,
}

impl SerialTester {
    /// # Errors
    /// Only if the transceiver's reader thread cannot be spawned.
    pub fn new(
        name: &str,
        config: &SerialTesterConfig,
        ctx: &DeviceContext,
    ) -> Result<Self, SerialError> {
        let stop = Arc::new(StopSignal::new());
        let recording = Arc::new(Mutex::new(Recording::default()));
        let handler = packet_handler(
            name.to_string(),
            ctx.notifier.clone(),
            Arc::clone(&stop),
            Arc::clone(&recording),
        );
        let transceiver =
            SerialTransceiver::new(SerialSettings::new(&config.usb_path, config.baud), handler)?;

        Ok(Self {
            name: name.to_string(),
            input_path: ctx.file(&config.input_waveform_file),
            output_path: config.output_waveform_file.as_deref().map(|f| ctx.file(f)),
            metadata: config.output_metadata.clone(),
            settle: Duration::from_millis(config.settle_ms),
            transceiver,
            stop,
            recording,
            waveform: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
        })
    }
}

impl Device for SerialTester {
    fn on_before_execution(&self) -> Result<(), DeviceError> {
        self.stop.reset();
        *self.started_at.lock() = None;
        *self.recording.lock() = Recording {
            lines: self.metadata.header_lines(),
            finalized: false,
        };

        match self.transceiver.open() {
            Ok(()) => {
                if let Err(e) = self.transceiver.send_command(CMD_RESET_TESTER) {
                    warn!(device = %self.name, error = %e, "reset command not sent");
                }
                debug!(device = %self.name, settle_ms = self.settle.as_millis() as u64, "waiting for tester reset");
                self.stop.wait_timeout(self.settle);
            }
            Err(e) => {
                warn!(device = %self.name, error = %e, "tester unavailable, continuing degraded");
            }
        }

        let packets = parse_waveform(&self.input_path)?;
        info!(device = %self.name, packets = packets.len(), "waveform loaded");
        *self.waveform.lock() = packets;
        Ok(())
    }

    fn on_execute(&self) -> Result<(), DeviceError> {
        // Whatever the tester sent while resetting belongs to no task.
        if self.transceiver.is_open() {
            self.transceiver.discard_input();
            self.transceiver.start_listening();
        }
        *self.started_at.lock() = Some(Instant::now());
        let packets = std::mem::take(&mut *self.waveform.lock());

        let mut sent = 0usize;
        for packet in &packets {
            if self.stop.is_stopped() {
                break;
            }
            self.transceiver.send_packet(packet)?;
            sent += 1;
        }

        debug!(device = %self.name, sent, total = packets.len(), "waveform streamed");
        Ok(())
    }

    fn on_terminate(&self) -> Result<(), DeviceError> {
        self.stop.stop();
        self.transceiver.stop_listening();

        let elapsed = self
            .started_at
            .lock()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let mut rec = self.recording.lock();
        if rec.finalized {
            return Ok(());
        }
        rec.finalized = true;
        if let Some(first) = rec.lines.first_mut() {
            *first = format!("Period: {elapsed:.6}");
        }

        if let Some(path) = &self.output_path {
            fs::write(path, rec.lines.join("\n")).map_err(|e| DeviceError::file(path, e))?;
            info!(device = %self.name, lines = rec.lines.len(), "output waveform written");
        }
        Ok(())
    }

    fn on_reset_after_execution(&self) -> Result<(), DeviceError> {
        self.transceiver.close();
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{termination_channel, TerminateTrigger};
    use crate::protocol::CMD_TEST_COMPLETE;

    const WAVEFORM: &str = "Period: 1.0\nTick frequency: 3000\n==\n68, 100, 1\n65,200,2\n\n";

    fn config() -> SerialTesterConfig {
        SerialTesterConfig {
            usb_path: "/nonexistent/ttyACM-hwgrader".into(),
            baud: default_baud(),
            input_waveform_file: "waveform.txt".into(),
            output_waveform_file: Some("waveform_out.txt".into()),
            output_metadata: OutputMetadata {
                tick_frequency: 3000.0,
                pins: vec![PinLabel {
                    label: "DUT0".into(),
                    indexes: vec![0, 1],
                }],
            },
            settle_ms: 0,
        }
    }

    #[test]
    fn parse_waveform_skips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.txt");
        fs::write(&path, WAVEFORM).unwrap();

        let packets = parse_waveform(&path).unwrap();
        assert_eq!(
            packets,
            vec![Packet::new(68, 100, 1), Packet::new(65, 200, 2)]
        );
    }

    #[test]
    fn parse_waveform_reports_bad_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.txt");
        fs::write(&path, "==\n68,1,1\n68,1\n").unwrap();

        match parse_waveform(&path) {
            Err(DeviceError::MalformedInput { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_waveform_rejects_out_of_range_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.txt");
        fs::write(&path, "==\n68,1,70000\n").unwrap();
        assert!(matches!(
            parse_waveform(&path),
            Err(DeviceError::MalformedInput { .. })
        ));
    }

    #[test]
    fn header_lists_pins_between_display_markers() {
        let lines = config().output_metadata.header_lines();
        assert_eq!(
            lines,
            vec![
                "",
                "Tick frequency: 3000.000000",
                "Display start",
                "DUT0,0,1",
                "Display end",
                "==",
            ]
        );
    }

    #[tokio::test]
    async fn handler_records_samples_and_signals_completion() {
        let (notifier, mut rx) = termination_channel();
        let stop = Arc::new(StopSignal::new());
        let recording = Arc::new(Mutex::new(Recording::default()));
        let handler = packet_handler(
            "tester".into(),
            notifier,
            Arc::clone(&stop),
            Arc::clone(&recording),
        );

        handler(Packet::new(b'D', 10, 3));
        assert!(!stop.is_stopped());
        handler(Packet::command(CMD_TEST_COMPLETE));

        assert!(stop.is_stopped());
        assert_eq!(recording.lock().lines, vec!["68, 10, 3"]);
        assert_eq!(
            rx.recv().await,
            Some(TerminateTrigger::Device("tester".into()))
        );
    }

    #[test]
    fn unavailable_port_still_produces_output_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("waveform.txt"), WAVEFORM).unwrap();
        let (notifier, _rx) = termination_channel();
        let ctx = DeviceContext {
            workspace: dir.path().to_path_buf(),
            notifier,
        };
        let dev = SerialTester::new("tester", &config(), &ctx).unwrap();

        dev.on_before_execution().unwrap();
        assert!(!dev.transceiver.is_listening());
        assert!(matches!(
            dev.on_execute(),
            Err(DeviceError::Serial(SerialError::NotOpen { .. }))
        ));
        dev.on_terminate().unwrap();
        dev.on_terminate().unwrap();
        dev.on_reset_after_execution().unwrap();

        let out = fs::read_to_string(dir.path().join("waveform_out.txt")).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("Period: "));
        assert_eq!(lines[1], "Tick frequency: 3000.000000");
        assert_eq!(lines[3], "DUT0,0,1");
        assert_eq!(*lines.last().unwrap(), "==");
    }
}
