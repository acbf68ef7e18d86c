//! SLCAN (Lawicel) adapter line protocol.
//!
//! The adapter speaks one ASCII command per line, terminated by a carriage
//! return. Transmitted and received CAN frames share the same text format:
//!
//! ```text
//! +-----+----------------------+-----+---------------------+----+
//! | Tag |          ID          | DLC |        Data         | CR |
//! +-----+----------------------+-----+---------------------+----+
//! | T/R | 8 hex digits (29 bit)| 1   | 2 hex digits / byte | \r |
//! | t/r | 3 hex digits (11 bit)| 1   | 2 hex digits / byte | \r |
//! +-----+----------------------+-----+---------------------+----+
//! ```
//!
//! `R`/`r` are remote-request frames and never carry data. The adapter
//! acknowledges commands with a bare CR (or `z`/`Z` after a transmit) and
//! rejects them with BEL (`0x07`).

use std::fmt;

use thiserror::Error;

use crate::frame::{CanFrame, MAX_DATA_LEN};

/// Line terminator used in both directions.
pub const LINE_TERMINATOR: u8 = b'\r';

/// Byte the adapter sends instead of a line to reject a command.
const BELL: u8 = 0x07;

/// Marker the decoder substitutes for [`BELL`] before splitting lines.
const NAK_MARKER: u8 = b'=';

const EXTENDED_ID_DIGITS: usize = 8;
const BASIC_ID_DIGITS: usize = 3;

/// Longest line the adapter can send, without terminator: an extended
/// frame with eight data bytes.
pub const MAX_LINE_LEN: usize = 1 + EXTENDED_ID_DIGITS + 1 + 2 * MAX_DATA_LEN;

/// CAN bus bitrates selectable with the `Sn` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bitrate {
    /// 10 kbit/s (`S0`).
    Kbit10,
    /// 20 kbit/s (`S1`).
    Kbit20,
    /// 50 kbit/s (`S2`).
    Kbit50,
    /// 100 kbit/s (`S3`).
    Kbit100,
    /// 125 kbit/s (`S4`).
    Kbit125,
    /// 250 kbit/s (`S5`), the Märklin bus rate.
    #[default]
    Kbit250,
    /// 500 kbit/s (`S6`).
    Kbit500,
    /// 800 kbit/s (`S7`).
    Kbit800,
    /// 1000 kbit/s (`S8`).
    Kbit1000,
}

impl Bitrate {
    /// All bitrates in command-code order.
    pub const ALL: [Self; 9] = [
        Self::Kbit10,
        Self::Kbit20,
        Self::Kbit50,
        Self::Kbit100,
        Self::Kbit125,
        Self::Kbit250,
        Self::Kbit500,
        Self::Kbit800,
        Self::Kbit1000,
    ];

    /// ASCII digit following `S` in the bitrate command.
    pub fn code(self) -> char {
        match self {
            Self::Kbit10 => '0',
            Self::Kbit20 => '1',
            Self::Kbit50 => '2',
            Self::Kbit100 => '3',
            Self::Kbit125 => '4',
            Self::Kbit250 => '5',
            Self::Kbit500 => '6',
            Self::Kbit800 => '7',
            Self::Kbit1000 => '8',
        }
    }

    /// Bitrate in kbit/s.
    pub fn kbps(self) -> u32 {
        match self {
            Self::Kbit10 => 10,
            Self::Kbit20 => 20,
            Self::Kbit50 => 50,
            Self::Kbit100 => 100,
            Self::Kbit125 => 125,
            Self::Kbit250 => 250,
            Self::Kbit500 => 500,
            Self::Kbit800 => 800,
            Self::Kbit1000 => 1000,
        }
    }

    /// Look up a bitrate by its value in kbit/s.
    pub fn from_kbps(kbps: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.kbps() == kbps)
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} kbit/s", self.kbps())
    }
}

/// Adapter control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterCommand {
    /// `Sn`: select the CAN bitrate (channel must be closed).
    SetBitrate(Bitrate),
    /// `X1`/`X0`: enable or disable auto-poll of received frames.
    AutoPoll(bool),
    /// `O`: open the CAN channel.
    Open,
    /// `C`: close the CAN channel.
    Close,
    /// Empty line, used to flush partial input on the adapter.
    Empty,
}

impl AdapterCommand {
    /// Command text without the line terminator.
    pub fn text(self) -> String {
        match self {
            Self::SetBitrate(bitrate) => format!("S{}", bitrate.code()),
            Self::AutoPoll(enabled) => format!("X{}", u8::from(enabled)),
            Self::Open => "O".to_string(),
            Self::Close => "C".to_string(),
            Self::Empty => String::new(),
        }
    }
}

/// The clean open sequence: close, four empty lines, auto-poll on, open.
pub const OPEN_SEQUENCE: [AdapterCommand; 7] = [
    AdapterCommand::Close,
    AdapterCommand::Empty,
    AdapterCommand::Empty,
    AdapterCommand::Empty,
    AdapterCommand::Empty,
    AdapterCommand::AutoPoll(true),
    AdapterCommand::Open,
];

/// Encode a frame as an adapter line (without terminator).
pub fn encode_frame(frame: &CanFrame) -> String {
    let tag = match (frame.is_extended(), frame.is_remote()) {
        (true, false) => 'T',
        (true, true) => 'R',
        (false, false) => 't',
        (false, true) => 'r',
    };

    let mut line = String::with_capacity(1 + EXTENDED_ID_DIGITS + 1 + 2 * MAX_DATA_LEN);
    line.push(tag);
    if frame.is_extended() {
        line.push_str(&format!("{:08X}", frame.id()));
    } else {
        line.push_str(&format!("{:03X}", frame.id()));
    }

    if frame.is_remote() {
        line.push('0');
    } else {
        line.push_str(&format!("{:X}", frame.len()));
        line.push_str(&frame.data_hex());
    }

    line
}

/// Append the line terminator to a line of text.
pub fn to_wire(line: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(LINE_TERMINATOR);
    bytes
}

/// Something the adapter told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEvent {
    /// Positive acknowledgement (bare CR, `z` or `Z`).
    Ack,
    /// Negative acknowledgement (BEL).
    Nak,
    /// A frame received from the bus.
    Frame(CanFrame),
}

/// A malformed frame line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The line is shorter than tag + identifier + length digit.
    #[error("line {0:?} is too short for a CAN frame")]
    TooShort(String),

    /// Identifier, length or data contain a non-hex character.
    #[error("line {0:?} contains an invalid hex digit")]
    InvalidHex(String),

    /// The length digit is larger than 8.
    #[error("line {line:?} declares {declared} data bytes")]
    InvalidLength {
        /// Offending line.
        line: String,
        /// Declared data length.
        declared: usize,
    },

    /// The data part does not hold exactly `2 * length` hex digits.
    #[error("line {line:?} declares {declared} data bytes but carries {actual} hex digits")]
    LengthMismatch {
        /// Offending line.
        line: String,
        /// Declared data length.
        declared: usize,
        /// Number of hex digits present.
        actual: usize,
    },

    /// No terminator within [`MAX_LINE_LEN`] bytes. The rest of the line is dropped.
    #[error("line starting {0:?} runs past {max} bytes", max = MAX_LINE_LEN)]
    TooLong(String),
}

/// Streaming decoder for adapter output.
///
/// Bytes may arrive split at arbitrary points; incomplete lines are held
/// back until their terminator arrives. Each complete line yields at most one
/// event or error, and a malformed line never affects the ones after it.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    /// Skipping the rest of an overlong line.
    overflowed: bool,
}

impl LineDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Feed a chunk of raw bytes and return the results of every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<AdapterEvent, DecodeError>> {
        let mut results = Vec::new();

        for &byte in chunk {
            match byte {
                BELL => {
                    self.pending.push(NAK_MARKER);
                    self.complete_line(&mut results);
                },
                LINE_TERMINATOR => self.complete_line(&mut results),
                b'\n' => {},
                _ if self.overflowed => {},
                _ if self.pending.len() == MAX_LINE_LEN => {
                    let start = String::from_utf8_lossy(&self.pending).into_owned();
                    results.push(Err(DecodeError::TooLong(start)));
                    self.pending.clear();
                    self.overflowed = true;
                },
                _ => self.pending.push(byte),
            }
        }

        results
    }

    fn complete_line(&mut self, results: &mut Vec<Result<AdapterEvent, DecodeError>>) {
        let line = std::mem::take(&mut self.pending);
        if std::mem::take(&mut self.overflowed) {
            return;
        }
        if let Some(result) = decode_line(&line) {
            results.push(result);
        }
    }
}

/// Classify one complete line. Returns `None` for lines that carry nothing of interest.
pub fn decode_line(line: &[u8]) -> Option<Result<AdapterEvent, DecodeError>> {
    match line {
        [] | [b'z' | b'Z'] => Some(Ok(AdapterEvent::Ack)),
        [NAK_MARKER] => Some(Ok(AdapterEvent::Nak)),
        [b'T' | b'R', ..] => Some(parse_frame(line, EXTENDED_ID_DIGITS).map(AdapterEvent::Frame)),
        [b't' | b'r', ..] => Some(parse_frame(line, BASIC_ID_DIGITS).map(AdapterEvent::Frame)),
        _ => None,
    }
}

fn parse_frame(line: &[u8], id_digits: usize) -> Result<CanFrame, DecodeError> {
    let text = || String::from_utf8_lossy(line).into_owned();

    let header_len = 1 + id_digits + 1;
    if line.len() < header_len {
        return Err(DecodeError::TooShort(text()));
    }

    let extended = id_digits == EXTENDED_ID_DIGITS;
    let remote = matches!(line[0], b'R' | b'r');

    let id = line[1..=id_digits]
        .iter()
        .try_fold(0u32, |acc, &c| hex_value(c).map(|v| (acc << 4) | u32::from(v)))
        .ok_or_else(|| DecodeError::InvalidHex(text()))?;

    let declared =
        usize::from(hex_value(line[header_len - 1]).ok_or_else(|| DecodeError::InvalidHex(text()))?);
    if declared > MAX_DATA_LEN {
        return Err(DecodeError::InvalidLength {
            line: text(),
            declared,
        });
    }

    let mut data = [0u8; MAX_DATA_LEN];
    let mut len = 0;
    if !remote && declared > 0 {
        let hex = &line[header_len..];
        if hex.len() != declared * 2 {
            return Err(DecodeError::LengthMismatch {
                line: text(),
                declared,
                actual: hex.len(),
            });
        }
        for (slot, pair) in data.iter_mut().zip(hex.chunks_exact(2)) {
            let high = hex_value(pair[0]).ok_or_else(|| DecodeError::InvalidHex(text()))?;
            let low = hex_value(pair[1]).ok_or_else(|| DecodeError::InvalidHex(text()))?;
            *slot = (high << 4) | low;
        }
        len = declared;
    }

    CanFrame::with_format(id, &data[..len], extended, remote).ok_or_else(|| DecodeError::InvalidLength {
        line: text(),
        declared,
    })
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
