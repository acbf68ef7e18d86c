//! Target device support.

pub mod class;

pub use class::{DeviceClass, FileDescriptor, GB2_FILES, MS2_FILES, VersionKind};
