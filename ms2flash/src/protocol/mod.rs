//! Protocol implementations.

pub mod crc;
pub mod maerklin;
pub mod slcan;

// Re-export common types
pub use crc::{CRC16_SEED, crc16_ccitt};
pub use maerklin::{Command, DeviceId, OWN_HASH};
pub use slcan::{AdapterCommand, AdapterEvent, Bitrate, DecodeError, LineDecoder};
