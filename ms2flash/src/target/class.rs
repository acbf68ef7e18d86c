//! Device classes and their file descriptor tables.
//!
//! Each device class owns a fixed table of files it can receive. Entry 0 is
//! always the firmware image; the remaining MS2 entries are companion data
//! files served on request after the firmware update.

use std::fmt;

/// How the version of a file is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VersionKind {
    /// Binary (high, low) pair at a fixed offset.
    Plain,
    /// ASCII digit fields in the trailing 64-byte footer.
    DatabaseFooter,
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::DatabaseFooter => write!(f, "db-footer"),
        }
    }
}

/// Static description of one transferable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileDescriptor {
    /// Name the device uses to request the file data.
    pub short_name: &'static str,
    /// Name the device uses to request the version info.
    pub version_tag: &'static str,
    /// File name inside the firmware directory.
    pub file_name: &'static str,
    /// Where the version lives.
    pub version_kind: VersionKind,
    /// Transfer block size in bytes.
    pub block_size: usize,
    /// Added to every block index sent to the bootloader.
    pub block_offset: u8,
    /// Padded length is rounded up to a multiple of this.
    pub fill_granularity: usize,
    /// Byte used for padding.
    pub padding_byte: u8,
    /// Offset of the (high, low) version pair for [`VersionKind::Plain`].
    pub version_field_offset: usize,
}

impl FileDescriptor {
    #[allow(clippy::too_many_arguments)]
    const fn plain(
        short_name: &'static str,
        version_tag: &'static str,
        file_name: &'static str,
        block_size: usize,
        block_offset: u8,
        fill_granularity: usize,
        padding_byte: u8,
        version_field_offset: usize,
    ) -> Self {
        Self {
            short_name,
            version_tag,
            file_name,
            version_kind: VersionKind::Plain,
            block_size,
            block_offset,
            fill_granularity,
            padding_byte,
            version_field_offset,
        }
    }

    /// Data file served by the MS2 in config mode.
    const fn data(
        short_name: &'static str,
        version_tag: &'static str,
        file_name: &'static str,
    ) -> Self {
        Self::plain(short_name, version_tag, file_name, 1024, 0, 8, 0x00, 0)
    }
}

/// Files of a Gleisbox 60113.
pub const GB2_FILES: &[FileDescriptor] = &[FileDescriptor::plain(
    "gbs2",
    "gb2",
    "016-gb2.bin",
    512,
    2,
    512,
    0xFF,
    6,
)];

/// Files of a Mobile Station 2.
pub const MS2_FILES: &[FileDescriptor] = &[
    FileDescriptor::plain("ms2", "ms2ver", "050-ms2.bin", 1024, 4, 1024, 0xFF, 252),
    FileDescriptor::plain("gb2", "gb2ver", "016-gb2.bin", 1024, 0, 8, 0x00, 6),
    FileDescriptor {
        version_kind: VersionKind::DatabaseFooter,
        ..FileDescriptor::data("lokdb", "ldbver", "flashdb.ms2")
    },
    FileDescriptor::data("lang", "langver", "lang.ms2"),
    FileDescriptor::data("mfxdefs", "mfxver", "mfxdefs.ms2"),
    FileDescriptor::data("mfxbin", "mfxbver", "mfxdefs.bin"),
    FileDescriptor::data("ms2x", "ms2xver", "051-ms2.bin"),
];

/// Supported device classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceClass {
    /// Mobile Station 2 (60653 / 60657).
    #[default]
    Ms2,
    /// Gleisbox 60113.
    Gb2,
}

impl DeviceClass {
    /// Class code found in byte 0 of the ping response.
    pub fn code(self) -> u8 {
        match self {
            Self::Ms2 => 0x4D,
            Self::Gb2 => 0x47,
        }
    }

    /// Parse a class name as given on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "ms2" => Some(Self::Ms2),
            "gb2" | "gbs2" | "gleisbox" => Some(Self::Gb2),
            _ => None,
        }
    }

    /// File descriptor table.
    pub fn files(self) -> &'static [FileDescriptor] {
        match self {
            Self::Ms2 => MS2_FILES,
            Self::Gb2 => GB2_FILES,
        }
    }

    /// Firmware entry (always entry 0).
    pub fn firmware(self) -> &'static FileDescriptor {
        &self.files()[0]
    }

    /// Whether the device asks for data files after its firmware update.
    pub fn supports_config_sync(self) -> bool {
        matches!(self, Self::Ms2)
    }

    /// Whether the device must be powered on before it answers a ping.
    pub fn needs_power_on(self) -> bool {
        matches!(self, Self::Gb2)
    }

    /// Find the entry whose version tag equals `name`.
    pub fn find_version_tag(self, name: &str) -> Option<usize> {
        self.files().iter().position(|f| f.version_tag == name)
    }

    /// Find the entry whose short name equals `name`.
    pub fn find_short_name(self, name: &str) -> Option<usize> {
        self.files().iter().position(|f| f.short_name == name)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ms2 => write!(f, "MS2"),
            Self::Gb2 => write!(f, "GB2"),
        }
    }
}
