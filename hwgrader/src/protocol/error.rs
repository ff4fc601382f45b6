/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Error types for the framed UART protocol.
//!
//! * [`FramingError`]: a 9-byte window did not look like a frame.  Always
//!   recoverable: the receive loop resynchronises and keeps going.
//! * [`EncodingError`]: a caller tried to put a value on the wire that does
//!   not fit its field.

use thiserror::Error;

use super::{FRAME_LEN, START_DELIM, STOP_DELIM};

/// A received byte window could not be decoded as a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Fewer or more than [`FRAME_LEN`] bytes were handed to `decode`.
    #[error("frame must be {} bytes, got {len}", FRAME_LEN)]
    BadLength { len: usize },

    /// First byte is not the start delimiter.
    #[error("expected start delimiter {:#04x}, found {found:#04x}", START_DELIM)]
    BadStart { found: u8 },

    /// Last byte is not the stop delimiter.
    #[error("expected stop delimiter {:#04x}, found {found:#04x}", STOP_DELIM)]
    BadStop { found: u8 },
}

/// A packet field is out of range for its wire width.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    /// `time` does not fit in 4 bytes.
    #[error("time {0} exceeds the 32-bit time field")]
    TimeOutOfRange(u64),

    /// `value` does not fit in 2 bytes.
    #[error("value {0} exceeds the 16-bit value field")]
    ValueOutOfRange(u64),
}
