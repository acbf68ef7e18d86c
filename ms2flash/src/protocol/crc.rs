//! CRC16-CCITT checksum.
//!
//! Polynomial `0x1021`, MSB-first, no reflection, no final XOR. Every
//! firmware block and every config stream is checked with the `0xFFFF`
//! seed ([`CRC16_SEED`]), i.e. the CRC-16/CCITT-FALSE variant.

/// CCITT generator polynomial.
const CRC16_POLY: u16 = 0x1021;

/// Seed used for every checksum exchanged with the devices.
pub const CRC16_SEED: u16 = 0xFFFF;

const CRC16_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        #[allow(clippy::cast_possible_truncation)]
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute CRC16-CCITT over `data` starting from `seed`.
pub fn crc16_ccitt(seed: u16, data: &[u8]) -> u16 {
    data.iter().fold(seed, |crc, &byte| {
        let index = usize::from((crc >> 8) ^ u16::from(byte));
        (crc << 8) ^ CRC16_TABLE[index]
    })
}

/// Checksum of `data` with the device seed, as it appears on the wire (big-endian).
pub fn block_checksum(data: &[u8]) -> [u8; 2] {
    crc16_ccitt(CRC16_SEED, data).to_be_bytes()
}
