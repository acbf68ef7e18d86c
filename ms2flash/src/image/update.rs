//! Update files prepared for block transfer.
//!
//! Every file is padded before transfer: its length is rounded up to the
//! entry's fill granularity using the entry's padding byte. Blocks are then
//! addressed from the top of the padded buffer down to zero:
//!
//! ```text
//! 0            bs           2*bs          total*bs        padded
//! +------------+------------+-- ... --+---------------------+
//! |  block 0   |  block 1   |         | tail block (<= bs)  |
//! +------------+------------+-- ... --+---------------------+
//! ```

use std::fmt::Write as _;

use log::debug;

use crate::error::{Error, Result};
use crate::target::{FileDescriptor, VersionKind};

/// Size of the trailing footer of a database file.
pub const FOOTER_LEN: usize = 64;

/// Granularity (and zero fill) of generated version text.
pub const VERSION_TEXT_GRANULARITY: usize = 8;

/// Round `bytes` up to a multiple of `fill` using `byte` as filler.
///
/// A buffer whose length already is a multiple of `fill` is returned as is.
pub fn pad(bytes: &[u8], fill: usize, byte: u8) -> Vec<u8> {
    let mut padded = bytes.to_vec();
    if fill > 1 {
        let target = bytes.len().div_ceil(fill) * fill;
        padded.resize(target, byte);
    }
    padded
}

/// Index of the highest block of a padded buffer.
///
/// Blocks are numbered from 0, so this is one less than the number of
/// blocks. An empty buffer has no blocks and yields 0 as well.
pub fn block_count(padded_len: usize, block_size: usize) -> usize {
    padded_len.saturating_sub(1) / block_size.max(1)
}

/// A loaded and padded update file.
#[derive(Debug, Clone)]
pub struct UpdateImage {
    descriptor: FileDescriptor,
    raw: Vec<u8>,
    padded: Vec<u8>,
    total_blocks: usize,
}

impl UpdateImage {
    /// Pad `raw` according to `descriptor`.
    pub fn new(descriptor: FileDescriptor, raw: Vec<u8>) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidImage(format!("{} is empty", descriptor.file_name)));
        }

        let padded = pad(&raw, descriptor.fill_granularity, descriptor.padding_byte);
        let total_blocks = block_count(padded.len(), descriptor.block_size);
        debug!(
            "Loaded {} ({} bytes, {} padded, {} blocks)",
            descriptor.file_name,
            raw.len(),
            padded.len(),
            total_blocks + 1
        );

        Ok(Self {
            descriptor,
            raw,
            padded,
            total_blocks,
        })
    }

    /// Descriptor this image was prepared for.
    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    /// File bytes after padding.
    pub fn padded(&self) -> &[u8] {
        &self.padded
    }

    /// Index of the highest block.
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Version pair stored at the descriptor's version field offset.
    pub fn version(&self) -> Result<(u8, u8)> {
        let offset = self.descriptor.version_field_offset;
        match self.raw.get(offset..offset + 2) {
            Some(&[high, low]) => Ok((high, low)),
            _ => Err(Error::InvalidImage(format!(
                "{} is too short for a version field at offset {offset}",
                self.descriptor.file_name
            ))),
        }
    }

    /// Version as `"high.low"`, the form devices report in their ping response.
    pub fn version_string(&self) -> Result<String> {
        let (high, low) = self.version()?;
        Ok(format!("{high}.{low}"))
    }

    /// Full block at `index`, or `None` if it extends past the padded data.
    pub fn block(&self, index: usize) -> Option<&[u8]> {
        let bs = self.descriptor.block_size;
        let start = index.checked_mul(bs)?;
        self.padded.get(start..start.checked_add(bs)?)
    }

    /// The last, possibly short, block.
    pub fn tail_block(&self) -> &[u8] {
        let start = self.total_blocks * self.descriptor.block_size;
        &self.padded[start.min(self.padded.len())..]
    }

    /// Block at `index` clipped to the available data. Empty past the end.
    pub fn slice_block(&self, index: usize) -> &[u8] {
        let bs = self.descriptor.block_size;
        let start = index.saturating_mul(bs).min(self.padded.len());
        let end = start.saturating_add(bs).min(self.padded.len());
        &self.padded[start..end]
    }
}

/// Build the version text a device receives for `descriptor`.
pub fn version_info(descriptor: &FileDescriptor, raw: &[u8]) -> Result<String> {
    let mut text = String::new();
    match descriptor.version_kind {
        VersionKind::Plain => {
            let offset = descriptor.version_field_offset;
            let Some(&[high, low]) = raw.get(offset..offset + 2) else {
                return Err(Error::InvalidImage(format!(
                    "{} is too short for a version field at offset {offset}",
                    descriptor.file_name
                )));
            };
            let _ = writeln!(text, " .vhigh={high}");
            let _ = writeln!(text, " .vlow={low}");
            let _ = writeln!(text, " .bytes={}", raw.len());
        },
        VersionKind::DatabaseFooter => {
            if raw.len() < FOOTER_LEN {
                return Err(Error::InvalidImage(format!(
                    "{} is shorter than its {FOOTER_LEN} byte footer",
                    descriptor.file_name
                )));
            }
            let footer = &raw[raw.len() - FOOTER_LEN..];
            let _ = writeln!(text, " .version={}", footer_number(footer, 16, 3)?);
            let _ = writeln!(text, " .monat={}", footer_number(footer, 12, 2)?);
            let _ = writeln!(text, " .jahr={}", footer_number(footer, 7, 4)?);
            let _ = writeln!(text, " .anzahl={}", (raw.len() / FOOTER_LEN) - 1);
        },
    }
    Ok(text)
}

fn footer_number(footer: &[u8], offset: usize, len: usize) -> Result<u16> {
    let field = &footer[offset..offset + len];
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "footer field at offset {offset} is not a number: {:?}",
                String::from_utf8_lossy(field)
            ))
        })
}
