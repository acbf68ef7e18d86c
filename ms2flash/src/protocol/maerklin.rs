//! Märklin CAN application protocol vocabulary.
//!
//! Every frame is extended. The 29-bit identifier carries the command in
//! its upper bits and the sender's 16-bit address hash in the lower half:
//!
//! ```text
//! +----------------------+----------------------+
//! |  Command (bits 16+)  |  Address hash (0-15) |
//! +----------------------+----------------------+
//! ```
//!
//! This module only knows how frames look. Sequencing lives in
//! [`crate::session`].

use std::fmt;

use byteorder::{BigEndian, WriteBytesExt};

use crate::frame::{CanFrame, MAX_DATA_LEN, hex_string};

/// Address hash we use when acting as the master controller.
pub const OWN_HASH: u16 = 0x4711;

/// Address of the raw data-chunk frames during a block transfer.
pub const DATA_CHUNK_ADDRESS: u16 = 0x0300;

/// Address of the Gleisbox power-on command.
pub const POWER_ON_ADDRESS: u16 = 0x0301;

/// Byte 7 values of a bootloader response that mean "bootloader entered".
pub const ENTERED_BOOTLOADER_CODES: [u8; 2] = [0x10, 0x32];

/// Byte 4 values of a bootloader response that reject a block.
pub const NAK_CODES: [u8; 2] = [0xF1, 0xF2];

/// Marker of a block-id request (and its echo).
pub const BLOCK_ID_MARKER: u8 = 0x44;

/// Marker of a block checksum trailer (and the device's block acknowledgement).
pub const BLOCK_DATA_MARKER: u8 = 0x88;

/// Marker telling the device that the last block has been written.
pub const END_OF_UPDATE_MARKER: u8 = 0xF5;

/// Marker requesting a soft reset.
pub const SOFT_RESET_MARKER: u8 = 0x11;

/// Query payload asking for the staged config data to be streamed.
pub const CONFIG_SENTINEL: [u8; 8] = [0x66; 8];

/// Suffix shared by all version-info request names.
pub const VERSION_TAG_SUFFIX: &str = "ver";

/// Ping response payload announcing a CS2 master controller.
pub const MASTER_ANNOUNCEMENT: [u8; 8] = [b'C', b'S', b'-', b'2', b' ', b' ', 0xFF, 0xFF];

/// Protocol commands (upper bits of the identifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// System command; used here as device reset.
    Reset = 0x0000_0000,
    /// Participant ping.
    Ping = 0x0030_0000,
    /// Ping response.
    PingResponse = 0x0031_0000,
    /// Bootloader command.
    Bootloader = 0x0036_0000,
    /// Bootloader response.
    BootloaderResponse = 0x0037_0000,
    /// Config data query.
    ConfigDataQuery = 0x0040_0000,
    /// Config data query response.
    ConfigDataQueryResponse = 0x0041_0000,
    /// Config data stream.
    ConfigDataStream = 0x0042_0000,
    /// Config data stream response.
    ConfigDataStreamResponse = 0x0043_0000,
}

impl Command {
    const ALL: [Self; 9] = [
        Self::Reset,
        Self::Ping,
        Self::PingResponse,
        Self::Bootloader,
        Self::BootloaderResponse,
        Self::ConfigDataQuery,
        Self::ConfigDataQueryResponse,
        Self::ConfigDataStream,
        Self::ConfigDataStreamResponse,
    ];

    /// Identifier for this command sent from `hash`.
    pub fn id(self, hash: u16) -> u32 {
        self as u32 | u32::from(hash)
    }

    /// Decode the command part of an identifier.
    pub fn from_id(id: u32) -> Option<Self> {
        let bits = id & 0xFFFF_0000;
        Self::ALL.into_iter().find(|c| *c as u32 == bits)
    }
}

/// 4-byte unique id of a device, learned from its ping response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceId(pub [u8; 4]);

impl DeviceId {
    /// Take the id from the first four payload bytes.
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        data.get(..4)?.try_into().ok().map(Self)
    }

    /// Raw bytes.
    pub fn bytes(self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_string(&self.0))
    }
}

fn addressed<const N: usize>(device: DeviceId, tail: [u8; N]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + N);
    data.extend_from_slice(&device.0);
    data.extend_from_slice(&tail);
    data
}

fn frame(id: u32, data: &[u8]) -> CanFrame {
    // Builders below never exceed eight payload bytes.
    CanFrame::new(id, &data[..data.len().min(MAX_DATA_LEN)])
        .unwrap_or_else(|| CanFrame::from_array(id, []))
}

/// Discovery ping sent from `hash`.
pub fn ping(hash: u16) -> CanFrame {
    CanFrame::from_array(Command::Ping.id(hash), [])
}

/// Announce ourselves as CS2 master controller.
pub fn announce_master() -> CanFrame {
    CanFrame::from_array(Command::PingResponse.id(OWN_HASH), MASTER_ANNOUNCEMENT)
}

/// Reset `device` so that it comes up in its bootloader.
pub fn reset(device: DeviceId) -> CanFrame {
    frame(Command::Reset.id(OWN_HASH), &addressed(device, [0x80, 0xFF]))
}

/// Empty bootloader command, sent right after the reset.
pub fn bootloader_entry() -> CanFrame {
    CanFrame::from_array(Command::Bootloader.id(OWN_HASH), [])
}

/// Power on a Gleisbox 60113 so that it answers the ping.
pub fn power_on() -> CanFrame {
    CanFrame::from_array(
        Command::Bootloader.id(POWER_ON_ADDRESS),
        [0x00, 0x00, 0x00, 0x00, SOFT_RESET_MARKER],
    )
}

/// Ask `device` to accept block `block`.
pub fn request_block(device: DeviceId, block: u8) -> CanFrame {
    frame(
        Command::Bootloader.id(OWN_HASH),
        &addressed(device, [BLOCK_ID_MARKER, block]),
    )
}

/// Payload the device echoes when it accepts block `block`.
pub fn block_id_ack(device: DeviceId, block: u8) -> Vec<u8> {
    addressed(device, [BLOCK_ID_MARKER, block])
}

/// One raw 8-byte piece of a block; `index` counts pieces within the block.
pub fn data_chunk(index: u8, chunk: &[u8]) -> CanFrame {
    let id = Command::Bootloader.id(DATA_CHUNK_ADDRESS) + u32::from(index);
    frame(id, chunk)
}

/// Checksum trailer closing a block.
pub fn block_trailer(device: DeviceId, crc: [u8; 2]) -> CanFrame {
    frame(
        Command::Bootloader.id(OWN_HASH),
        &addressed(device, [BLOCK_DATA_MARKER, crc[0], crc[1]]),
    )
}

/// Tell `device` that all blocks have been written.
pub fn end_of_update(device: DeviceId) -> CanFrame {
    frame(
        Command::Bootloader.id(OWN_HASH),
        &addressed(device, [END_OF_UPDATE_MARKER]),
    )
}

/// Soft reset of `device` after an update.
pub fn soft_reset(device: DeviceId) -> CanFrame {
    frame(
        Command::Bootloader.id(OWN_HASH),
        &addressed(device, [SOFT_RESET_MARKER]),
    )
}

/// Header of a config data stream: big-endian length and checksum.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn stream_header(hash: u16, len: u32, crc: [u8; 2]) -> CanFrame {
    let mut data = Vec::with_capacity(6);
    data.write_u32::<BigEndian>(len).unwrap();
    data.extend_from_slice(&crc);
    frame(Command::ConfigDataStream.id(hash), &data)
}

/// One 8-byte piece of a config data stream, zero-filled if short.
pub fn stream_data(hash: u16, chunk: &[u8]) -> CanFrame {
    let mut data = [0u8; MAX_DATA_LEN];
    let n = chunk.len().min(MAX_DATA_LEN);
    data[..n].copy_from_slice(&chunk[..n]);
    CanFrame::from_array(Command::ConfigDataStream.id(hash), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: DeviceId = DeviceId([0x4D, 0x54, 0x12, 0x34]);

    #[test]
    fn test_command_ids() {
        assert_eq!(Command::Ping.id(OWN_HASH), 0x0030_4711);
        assert_eq!(Command::Bootloader.id(0x0301), 0x0036_0301);
        assert_eq!(Command::from_id(0x0037_BEEF), Some(Command::BootloaderResponse));
        assert_eq!(Command::from_id(0x0000_4711), Some(Command::Reset));
        assert_eq!(Command::from_id(0x0016_4711), None);
    }

    #[test]
    fn test_device_id() {
        assert_eq!(DeviceId::from_payload(&[0x4D, 0x54, 0x12, 0x34, 4, 33]), Some(DEVICE));
        assert_eq!(DeviceId::from_payload(&[1, 2, 3]), None);
        assert_eq!(DEVICE.to_string(), "4D541234");
    }

    #[test]
    fn test_reset_and_bootloader_frames() {
        let reset = reset(DEVICE);
        assert_eq!(reset.id(), 0x0000_4711);
        assert_eq!(reset.data(), &[0x4D, 0x54, 0x12, 0x34, 0x80, 0xFF]);

        let entry = bootloader_entry();
        assert_eq!(entry.id(), 0x0036_4711);
        assert!(entry.is_empty());
    }

    #[test]
    fn test_power_on_frame() {
        let frame = power_on();
        assert_eq!(frame.id(), 0x0036_0301);
        assert_eq!(frame.data(), &[0, 0, 0, 0, 0x11]);
    }

    #[test]
    fn test_block_frames() {
        let request = request_block(DEVICE, 0x07);
        assert_eq!(request.id(), 0x0036_4711);
        assert_eq!(request.data(), &[0x4D, 0x54, 0x12, 0x34, 0x44, 0x07]);
        assert_eq!(block_id_ack(DEVICE, 0x07), request.data());

        let chunk = data_chunk(5, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(chunk.id(), 0x0036_0305);
        assert_eq!(chunk.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        let trailer = block_trailer(DEVICE, [0xAB, 0xCD]);
        assert_eq!(trailer.data(), &[0x4D, 0x54, 0x12, 0x34, 0x88, 0xAB, 0xCD]);
    }

    #[test]
    fn test_stream_frames() {
        let header = stream_header(0xBEEF, 0x0000_0410, [0x12, 0x34]);
        assert_eq!(header.id(), 0x0042_BEEF);
        assert_eq!(header.data(), &[0x00, 0x00, 0x04, 0x10, 0x12, 0x34]);

        let data = stream_data(0xBEEF, b"abc");
        assert_eq!(data.data(), &[b'a', b'b', b'c', 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_master_announcement() {
        let frame = announce_master();
        assert_eq!(frame.id(), 0x0031_4711);
        assert_eq!(&frame.data()[..4], b"CS-2");
    }
}
