/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! UART transceiver for framed tester traffic.
//!
//! A [`SerialTransceiver`] owns one serial device path.  Three things are
//! controlled independently:
//!
//! | Knob | Effect |
//! |---|---|
//! | `open()` / `close()` | acquire / release the OS handle |
//! | `start_listening()` / `stop_listening()` | enable / suspend packet dispatch |
//! | lifetime (`new` … `Drop`) | background reader thread |
//!
//! Keeping "listening" apart from "open" lets a device quiesce its packet
//! stream across a hardware reset without closing the port.
//!
//! # Degraded mode
//! If the device path cannot be opened, `open()` returns
//! [`SerialError::DeviceUnavailable`] and the transceiver stays "not ready":
//! writes return [`SerialError::NotOpen`] after logging, nothing panics, and
//! the reader thread keeps idling.

pub mod error;

pub use error::SerialError;

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, warn};

use crate::protocol::{command_frame, FrameAssembler, Packet};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Read timeout on the port.  Short so the reader notices `close()` and
/// `stop_listening()` quickly.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Sleep between polls while the port is closed or not listening.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Bytes requested per read call.
const READ_CHUNK: usize = 64;

// ── Settings ──────────────────────────────────────────────────────────────────

/// Port parameters.  Framing is always 8N1 without flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl SerialSettings {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Open `settings.path` as 8N1 with no flow control and discard any stale
/// input.
///
/// # Errors
/// [`SerialError::DeviceUnavailable`] if the path cannot be opened.
pub fn open_port(settings: &SerialSettings) -> Result<Box<dyn SerialPort>, SerialError> {
    let port = serialport::new(&settings.path, settings.baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(settings.read_timeout)
        .open()
        .map_err(|e| SerialError::DeviceUnavailable {
            path: settings.path.clone(),
            reason: e.to_string(),
        })?;

    if let Err(e) = port.clear(ClearBuffer::Input) {
        warn!(path = %settings.path, error = %e, "could not discard stale input");
    }
    Ok(port)
}

/// Callback invoked on the reader thread for every decoded packet.
pub type PacketHandler = Arc<dyn Fn(Packet) + Send + Sync>;

// ── Shared state ──────────────────────────────────────────────────────────────

/// State shared between the owning handle and the reader thread.
///
/// The port is split into two handles (`try_clone`) so a blocking read never
/// holds up a write.
struct Shared {
    path: String,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    assembler: Mutex<FrameAssembler>,
    listening: AtomicBool,
    alive: AtomicBool,
    handler: PacketHandler,
}

// ── SerialTransceiver ─────────────────────────────────────────────────────────

/// One serial connection with a background packet reader.
pub struct SerialTransceiver {
    settings: SerialSettings,
    shared: Arc<Shared>,
    reader_thread: Option<thread::JoinHandle<()>>,
}

impl SerialTransceiver {
    /// Create a closed transceiver and start its reader thread.
    ///
    /// # Errors
    /// Only if the OS refuses to spawn the thread.
    pub fn new(settings: SerialSettings, handler: PacketHandler) -> Result<Self, SerialError> {
        let shared = Arc::new(Shared {
            path: settings.path.clone(),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            assembler: Mutex::new(FrameAssembler::new()),
            listening: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            handler,
        });

        let thread_shared = Arc::clone(&shared);
        let reader_thread = thread::Builder::new()
            .name(format!("uart-rx:{}", settings.path))
            .spawn(move || read_loop(thread_shared))?;

        Ok(Self {
            settings,
            shared,
            reader_thread: Some(reader_thread),
        })
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Open the port (8N1, no flow control) and discard stale input.
    ///
    /// Calling `open()` on an already open transceiver is a no-op.
    ///
    /// # Errors
    /// [`SerialError::DeviceUnavailable`] if the path cannot be opened.  The
    /// failure is logged; the transceiver stays in its "not ready" state.
    pub fn open(&self) -> Result<(), SerialError> {
        if self.is_open() {
            return Ok(());
        }

        let port = open_port(&self.settings).map_err(|e| {
            warn!(path = %self.settings.path, error = %e, "UART device unable to open");
            e
        })?;
        self.attach(port)?;

        info!(
            path = %self.settings.path,
            baud = self.settings.baud_rate,
            "UART open"
        );
        Ok(())
    }

    /// Install an already opened port, split into reader and writer handles.
    fn attach(&self, port: Box<dyn SerialPort>) -> Result<(), SerialError> {
        let reader = port
            .try_clone()
            .map_err(|e| self.unavailable(e.to_string()))?;

        self.shared.assembler.lock().reset();
        *self.shared.reader.lock() = Some(reader);
        *self.shared.writer.lock() = Some(port);
        Ok(())
    }

    /// Drop everything received so far: bytes queued in the OS and any
    /// partial frame.  Used before listening starts so traffic from a
    /// hardware reset is never dispatched.
    pub fn discard_input(&self) {
        if let Some(port) = self.shared.writer.lock().as_ref() {
            if let Err(e) = port.clear(ClearBuffer::Input) {
                warn!(path = %self.settings.path, error = %e, "could not discard pending input");
            }
        }
        self.shared.assembler.lock().reset();
    }

    /// Flush and release the port.  Safe on a closed or never-opened
    /// transceiver.
    pub fn close(&self) {
        let writer = self.shared.writer.lock().take();
        let reader = self.shared.reader.lock().take();

        if let Some(mut port) = writer {
            if let Err(e) = port.flush() {
                warn!(path = %self.settings.path, error = %e, "flush on close failed");
            }
            let discarded = self.shared.assembler.lock().discarded();
            info!(path = %self.settings.path, discarded, "UART closed");
        }
        drop(reader);
    }

    pub fn is_open(&self) -> bool {
        self.shared.writer.lock().is_some()
    }

    /// Resume packet dispatch.
    pub fn start_listening(&self) {
        self.shared.listening.store(true, Ordering::Release);
    }

    /// Suspend packet dispatch without closing the port.
    pub fn stop_listening(&self) {
        self.shared.listening.store(false, Ordering::Release);
    }

    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::Acquire)
    }

    /// Write raw bytes and flush.
    ///
    /// # Errors
    /// [`SerialError::NotOpen`] when the port is not open, [`SerialError::Io`]
    /// when the OS write fails.  Both are logged here; callers typically just
    /// stop streaming.
    pub fn write(&self, bytes: &[u8]) -> Result<(), SerialError> {
        let mut guard = self.shared.writer.lock();
        let Some(port) = guard.as_mut() else {
            warn!(path = %self.settings.path, "UART not open, dropping write");
            return Err(SerialError::NotOpen {
                path: self.settings.path.clone(),
            });
        };

        port.write_all(bytes)
            .and_then(|_| port.flush())
            .map_err(|e| {
                warn!(path = %self.settings.path, error = %e, "UART write failed");
                SerialError::Io(e)
            })?;
        debug!(path = %self.settings.path, len = bytes.len(), "UART write");
        Ok(())
    }

    /// Send one parameter-less command frame.
    pub fn send_command(&self, code: u8) -> Result<(), SerialError> {
        self.write(&command_frame(code))
    }

    /// Send one packet.
    pub fn send_packet(&self, packet: &Packet) -> Result<(), SerialError> {
        self.write(&packet.to_frame())
    }

    fn unavailable(&self, reason: String) -> SerialError {
        warn!(path = %self.settings.path, reason = %reason, "UART device unable to open");
        SerialError::DeviceUnavailable {
            path: self.settings.path.clone(),
            reason,
        }
    }
}

impl Drop for SerialTransceiver {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
        if let Some(handle) = self.reader_thread.take() {
            if handle.join().is_err() {
                warn!(path = %self.settings.path, "UART reader thread panicked");
            }
        }
        self.close();
    }
}

// ── Reader thread ─────────────────────────────────────────────────────────────

/// Body of the reader thread.  Runs until the owning transceiver is dropped.
fn read_loop(shared: Arc<Shared>) {
    let mut chunk = [0u8; READ_CHUNK];
    debug!(path = %shared.path, "UART reader started");

    while shared.alive.load(Ordering::Acquire) {
        if !shared.listening.load(Ordering::Acquire) {
            thread::sleep(IDLE_POLL);
            continue;
        }

        let read = {
            let mut guard = shared.reader.lock();
            match guard.as_mut() {
                None => None,
                Some(port) => match port.read(&mut chunk) {
                    Ok(n) => Some(n),
                    Err(e) if e.kind() == ErrorKind::TimedOut => Some(0),
                    Err(e) => {
                        warn!(path = %shared.path, error = %e, "UART read failed");
                        None
                    }
                },
            }
        };

        match read {
            None => thread::sleep(IDLE_POLL),
            Some(0) => {}
            Some(n) => {
                // Re-check: a stop_listening() during the read suppresses
                // dispatch of what was just read.
                if !shared.listening.load(Ordering::Acquire) {
                    continue;
                }
                let mut assembler = shared.assembler.lock();
                assembler.push(&chunk[..n], |packet| (shared.handler)(packet));
            }
        }
    }

    debug!(path = %shared.path, "UART reader stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn missing_port() -> SerialTransceiver {
        let handler: PacketHandler = Arc::new(|_| {});
        SerialTransceiver::new(
            SerialSettings::new("/nonexistent/tty-hwgrader-test", 115_200),
            handler,
        )
        .unwrap()
    }

    #[test]
    fn new_transceiver_is_closed_and_not_listening() {
        let t = missing_port();
        assert!(!t.is_open());
        assert!(!t.is_listening());
        assert_eq!(t.settings().baud_rate, 115_200);
    }

    #[test]
    fn open_missing_device_reports_unavailable() {
        let t = missing_port();
        let err = t.open().unwrap_err();
        assert!(matches!(err, SerialError::DeviceUnavailable { .. }), "{err}");
        assert!(!t.is_open());
    }

    #[test]
    fn write_when_not_ready_returns_not_open() {
        let t = missing_port();
        let _ = t.open();
        assert!(matches!(
            t.send_command(crate::protocol::CMD_RESET_TESTER),
            Err(SerialError::NotOpen { .. })
        ));
        assert!(matches!(t.write(b"abc"), Err(SerialError::NotOpen { .. })));
    }

    #[test]
    fn close_is_idempotent_on_never_opened_port() {
        let t = missing_port();
        t.close();
        t.close();
        assert!(!t.is_open());
    }

    #[test]
    fn listening_flag_toggles_independently_of_open() {
        let t = missing_port();
        t.start_listening();
        assert!(t.is_listening());
        assert!(!t.is_open());
        t.stop_listening();
        assert!(!t.is_listening());
    }

    #[test]
    fn drop_stops_reader_thread_promptly() {
        let t = missing_port();
        t.start_listening();
        let started = Instant::now();
        drop(t);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    // ── Pseudo-terminal loopback ──────────────────────────────────────────────

    #[cfg(unix)]
    mod loopback {
        use super::*;
        use crate::protocol::CMD_TEST_COMPLETE;
        use serialport::TTYPort;

        type Received = Arc<Mutex<Vec<Packet>>>;

        /// A transceiver attached to the slave side of a pty pair.  The
        /// master side plays the tester.
        fn attached() -> (SerialTransceiver, TTYPort, Received) {
            let (master, slave) = TTYPort::pair().unwrap();
            let received: Received = Arc::default();
            let sink = Arc::clone(&received);
            let handler: PacketHandler = Arc::new(move |p| sink.lock().push(p));

            let path = slave.name().unwrap_or_else(|| "pty".to_string());
            let t = SerialTransceiver::new(SerialSettings::new(path, 115_200), handler).unwrap();
            t.attach(Box::new(slave)).unwrap();
            assert!(t.is_open());
            (t, master, received)
        }

        fn wait_until(cond: impl Fn() -> bool) -> bool {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if cond() {
                    return true;
                }
                thread::sleep(Duration::from_millis(10));
            }
            cond()
        }

        #[test]
        fn corrupted_frame_then_valid_frame_dispatches_one_packet() {
            let (t, mut master, received) = attached();
            t.start_listening();

            let mut bytes = Packet::new(b'D', 7, 1).to_frame().to_vec();
            bytes[8] = b'X';
            bytes.extend_from_slice(&Packet::new(b'D', 0x0102_0304, 42).to_frame());
            master.write_all(&bytes).unwrap();
            master.flush().unwrap();

            assert!(wait_until(|| !received.lock().is_empty()));
            thread::sleep(Duration::from_millis(100));
            assert_eq!(*received.lock(), vec![Packet::new(b'D', 0x0102_0304, 42)]);
        }

        #[test]
        fn nothing_is_dispatched_after_stop_listening() {
            let (t, mut master, received) = attached();
            t.start_listening();
            master.write_all(&Packet::new(b'D', 1, 1).to_frame()).unwrap();
            master.flush().unwrap();
            assert!(wait_until(|| received.lock().len() == 1));

            t.stop_listening();
            master.write_all(&Packet::new(b'D', 2, 2).to_frame()).unwrap();
            master.flush().unwrap();
            thread::sleep(Duration::from_millis(300));
            assert_eq!(*received.lock(), vec![Packet::new(b'D', 1, 1)]);
        }

        #[test]
        fn input_before_listening_can_be_discarded() {
            let (t, mut master, received) = attached();
            master.write_all(&command_frame(CMD_TEST_COMPLETE)).unwrap();
            master.flush().unwrap();
            thread::sleep(Duration::from_millis(100));

            t.discard_input();
            t.start_listening();
            master.write_all(&Packet::new(b'D', 5, 6).to_frame()).unwrap();
            master.flush().unwrap();

            assert!(wait_until(|| !received.lock().is_empty()));
            thread::sleep(Duration::from_millis(100));
            assert_eq!(*received.lock(), vec![Packet::new(b'D', 5, 6)]);
        }

        #[test]
        fn writes_reach_the_other_end() {
            let (t, mut master, _received) = attached();
            t.send_command(crate::protocol::CMD_RESET_TESTER).unwrap();

            let mut frame = [0u8; crate::protocol::FRAME_LEN];
            master.read_exact(&mut frame).unwrap();
            assert_eq!(frame, command_frame(crate::protocol::CMD_RESET_TESTER));
        }
    }
}
