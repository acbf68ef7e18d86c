//! CAN frame value type.

use std::fmt;

/// Maximum payload length of a classic CAN frame.
pub const MAX_DATA_LEN: usize = 8;

/// A single classic CAN frame.
///
/// Frames are small `Copy` values. The payload is stored inline and the
/// bytes past `len` are always zero, so the derived equality compares
/// exactly the identifier, the flags and the used payload bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanFrame {
    id: u32,
    data: [u8; MAX_DATA_LEN],
    len: u8,
    extended: bool,
    remote: bool,
}

impl CanFrame {
    /// Create an extended data frame. Returns `None` if `data` exceeds 8 bytes.
    pub fn new(id: u32, data: &[u8]) -> Option<Self> {
        Self::with_format(id, data, true, false)
    }

    /// Create an extended data frame from a fixed-size payload.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_array<const N: usize>(id: u32, data: [u8; N]) -> Self {
        const { assert!(N <= MAX_DATA_LEN) };

        let mut buf = [0u8; MAX_DATA_LEN];
        buf[..N].copy_from_slice(&data);
        Self {
            id,
            data: buf,
            len: N as u8,
            extended: true,
            remote: false,
        }
    }

    /// Create a remote-request frame. Remote frames never carry payload.
    pub fn remote(id: u32, extended: bool) -> Self {
        Self {
            id,
            data: [0; MAX_DATA_LEN],
            len: 0,
            extended,
            remote: true,
        }
    }

    /// Create a frame with explicit format flags.
    ///
    /// Returns `None` if `data` is longer than 8 bytes, or if a remote
    /// frame is requested with a non-empty payload.
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_format(id: u32, data: &[u8], extended: bool, remote: bool) -> Option<Self> {
        if data.len() > MAX_DATA_LEN || (remote && !data.is_empty()) {
            return None;
        }

        let mut buf = [0u8; MAX_DATA_LEN];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            data: buf,
            len: data.len() as u8,
            extended,
            remote,
        })
    }

    /// Return a copy of this frame carrying a different identifier.
    #[must_use]
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Raw identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Upper 16 bits of the identifier (the command part).
    pub fn command_bits(&self) -> u32 {
        self.id & 0xFFFF_0000
    }

    /// Lower 16 bits of the identifier (the sender's address hash).
    #[allow(clippy::cast_possible_truncation)]
    pub fn address_hash(&self) -> u16 {
        (self.id & 0xFFFF) as u16
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this frame uses a 29-bit identifier.
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Whether this is a remote transmission request.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Payload rendered as uppercase hex pairs without separators.
    pub fn data_hex(&self) -> String {
        hex_string(self.data())
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        if self.remote {
            write!(f, " RTR")
        } else {
            write!(f, " [{}] {}", self.len, self.data_hex())
        }
    }
}

/// Render bytes as uppercase hex pairs.
pub fn hex_string(bytes: &[u8]) -> String {
    use fmt::Write as _;

    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
            let _ = write!(out, "{b:02X}");
            out
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_oversized_payload() {
        assert!(CanFrame::new(0x1, &[0; 9]).is_none());
        assert!(CanFrame::new(0x1, &[0; 8]).is_some());
    }

    #[test]
    fn test_remote_with_payload_rejected() {
        assert!(CanFrame::with_format(0x1, &[1], true, true).is_none());
        let remote = CanFrame::remote(0x123, false);
        assert!(remote.is_remote());
        assert!(remote.is_empty());
    }

    #[test]
    fn test_equality_uses_all_fields() {
        let a = CanFrame::from_array(0x0036_4711, [1, 2, 3]);
        let b = CanFrame::new(0x0036_4711, &[1, 2, 3]).unwrap();
        assert_eq!(a, b);

        assert_ne!(a, CanFrame::new(0x0036_4711, &[1, 2, 3, 0]).unwrap());
        assert_ne!(a, CanFrame::with_format(0x0036_4711, &[1, 2, 3], false, false).unwrap());
        assert_ne!(a, a.with_id(0x0037_4711));
    }

    #[test]
    fn test_id_parts() {
        let frame = CanFrame::from_array(0x0031_BEEF, []);
        assert_eq!(frame.command_bits(), 0x0031_0000);
        assert_eq!(frame.address_hash(), 0xBEEF);
    }

    #[test]
    fn test_display() {
        let frame = CanFrame::from_array(0x0036_4711, [0xDE, 0xAD, 0x00]);
        assert_eq!(frame.to_string(), "00364711 [3] DEAD00");
        assert_eq!(CanFrame::remote(0x7FF, false).to_string(), "7FF RTR");
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&[]), "");
        assert_eq!(hex_string(&[0x0A, 0xFF]), "0AFF");
    }
}
