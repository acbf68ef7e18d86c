//! Update file loading and preparation.

pub mod source;
pub mod update;

pub use source::{DirectorySource, FileSource, MemorySource};
pub use update::{UpdateImage, block_count, pad, version_info};
