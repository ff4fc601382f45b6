/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Framed serial protocol spoken with the tester hardware.
//!
//! Every unit on the wire is a fixed 9-byte frame:
//!
//! ```text
//! offset  0     1        2..6            6..8           8
//!        ┌───┬─────────┬───────────────┬──────────────┬───┐
//!        │'S'│ command │ time (u32 LE) │ value (u16 LE)│'E'│
//!        └───┴─────────┴───────────────┴──────────────┴───┘
//! ```
//!
//! The link is a raw byte stream with no length prefix, so a reader that
//! starts mid-frame, or sees a corrupted byte, has to find its way back to a
//! frame boundary.  [`FrameAssembler`] does that: it buffers incoming bytes,
//! decodes whole frames, and on a [`FramingError`] skips ahead to the next
//! start delimiter instead of giving up.

pub mod error;

pub use error::{EncodingError, FramingError};

use tracing::{trace, warn};

// ── Constants ─────────────────────────────────────────────────────────────────

/// First byte of every frame.
pub const START_DELIM: u8 = b'S';

/// Last byte of every frame.
pub const STOP_DELIM: u8 = b'E';

/// Total frame size in bytes.
pub const FRAME_LEN: usize = 9;

/// Command: reset the tester board.
pub const CMD_RESET_TESTER: u8 = b'R';

/// Command: reset the device under test.
pub const CMD_RESET_DUT: u8 = b'U';

/// Command: enable the tester's analog front-end.
pub const CMD_ENABLE_ANALOG: u8 = b'O';

/// Packet type reserved for "test complete".  A device that receives it asks
/// the engine to terminate the task.
pub const CMD_TEST_COMPLETE: u8 = b'E';

// ── Packet ────────────────────────────────────────────────────────────────────

/// One decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Packet {
    /// Packet type / command code.
    pub command: u8,
    /// Tester tick timestamp.
    pub time: u32,
    /// Sample or parameter value.
    pub value: u16,
}

impl Packet {
    pub fn new(command: u8, time: u32, value: u16) -> Self {
        Self {
            command,
            time,
            value,
        }
    }

    /// Build a packet from wide integers, checking the wire widths.
    pub fn try_new(command: u8, time: u64, value: u64) -> Result<Self, EncodingError> {
        let time = u32::try_from(time).map_err(|_| EncodingError::TimeOutOfRange(time))?;
        let value = u16::try_from(value).map_err(|_| EncodingError::ValueOutOfRange(value))?;
        Ok(Self::new(command, time, value))
    }

    /// A parameter-less command: time and value are zero-filled.
    pub fn command(code: u8) -> Self {
        Self::new(code, 0, 0)
    }

    /// Returns `true` for the reserved "test complete" packet type.
    pub fn is_test_complete(&self) -> bool {
        self.command == CMD_TEST_COMPLETE
    }

    /// Serialise into a wire frame.  Infallible because the field types
    /// already match the wire widths.
    pub fn to_frame(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = START_DELIM;
        frame[1] = self.command;
        frame[2..6].copy_from_slice(&self.time.to_le_bytes());
        frame[6..8].copy_from_slice(&self.value.to_le_bytes());
        frame[8] = STOP_DELIM;
        frame
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Encode `(command, time, value)` into a frame.
///
/// `time` and `value` are accepted as wide integers so callers parsing text
/// input can hand them over unchecked.
///
/// # Errors
/// [`EncodingError`] if `time` exceeds 32 bits or `value` exceeds 16 bits.
pub fn encode(command: u8, time: u64, value: u64) -> Result<[u8; FRAME_LEN], EncodingError> {
    Packet::try_new(command, time, value).map(|p| p.to_frame())
}

/// Decode exactly one frame.
///
/// # Errors
/// [`FramingError`] when the slice is not [`FRAME_LEN`] bytes long or the
/// delimiters do not match.  The caller is expected to resynchronise.
pub fn decode(frame: &[u8]) -> Result<Packet, FramingError> {
    if frame.len() != FRAME_LEN {
        return Err(FramingError::BadLength { len: frame.len() });
    }
    if frame[0] != START_DELIM {
        return Err(FramingError::BadStart { found: frame[0] });
    }
    if frame[FRAME_LEN - 1] != STOP_DELIM {
        return Err(FramingError::BadStop {
            found: frame[FRAME_LEN - 1],
        });
    }

    let time = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
    let value = u16::from_le_bytes([frame[6], frame[7]]);
    Ok(Packet::new(frame[1], time, value))
}

/// Frame for a parameter-less command (`time` and `value` zero-filled).
pub fn command_frame(code: u8) -> [u8; FRAME_LEN] {
    Packet::command(code).to_frame()
}

// ── FrameAssembler ────────────────────────────────────────────────────────────

/// Incremental frame decoder for a byte stream.
///
/// Bytes are appended with [`push`](Self::push); every complete frame found
/// at the head of the buffer is handed to the callback.  A window that fails
/// to decode is dropped up to the next start delimiter candidate, so a single
/// corrupted frame costs at most its own bytes.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    /// Total bytes discarded while resynchronising.
    discarded: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and dispatch every decodable frame to `on_packet`.
    ///
    /// Returns the number of packets dispatched by this call.
    pub fn push<F>(&mut self, bytes: &[u8], mut on_packet: F) -> usize
    where
        F: FnMut(Packet),
    {
        self.buf.extend_from_slice(bytes);
        let mut dispatched = 0;

        while self.buf.len() >= FRAME_LEN {
            match decode(&self.buf[..FRAME_LEN]) {
                Ok(packet) => {
                    trace!(?packet, "frame decoded");
                    self.buf.drain(..FRAME_LEN);
                    on_packet(packet);
                    dispatched += 1;
                }
                Err(e) => {
                    let skip = self.resync_offset();
                    warn!(error = %e, skipped = skip, "bad frame, resynchronising");
                    self.buf.drain(..skip);
                    self.discarded += skip as u64;
                }
            }
        }

        dispatched
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Bytes currently waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Bytes thrown away since construction.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Offset of the next start delimiter after position 0, or the whole
    /// buffer if there is none.
    fn resync_offset(&self) -> usize {
        self.buf[1..]
            .iter()
            .position(|&b| b == START_DELIM)
            .map(|p| p + 1)
            .unwrap_or(self.buf.len())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
