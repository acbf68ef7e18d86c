//! Where update files come from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};

/// Loader for update files by file name.
pub trait FileSource {
    /// Load the complete contents of `name`.
    fn load(&mut self, name: &str) -> Result<Vec<u8>>;
}

/// Files resolved against a base directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    base: PathBuf,
}

impl DirectorySource {
    /// Use `base` as firmware directory. The directory must exist.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        if !base.is_dir() {
            return Err(Error::Config(format!(
                "firmware directory not found: {}",
                base.display()
            )));
        }
        Ok(Self { base })
    }

    /// Base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Full path of `name`.
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }
}

impl FileSource for DirectorySource {
    fn load(&mut self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_of(name);
        debug!("Reading {}", path.display());
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Config(format!("file not found: {}", path.display()))
            } else {
                Error::Io(e)
            }
        })
    }
}

/// Files held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.files.insert(name.into(), data);
        self
    }
}

impl FileSource for MemorySource {
    fn load(&mut self, name: &str) -> Result<Vec<u8>> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("file not found: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_source_loads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lang.ms2"), b"hallo").unwrap();

        let mut source = DirectorySource::new(dir.path()).unwrap();
        assert_eq!(source.load("lang.ms2").unwrap(), b"hallo");
        assert!(matches!(source.load("missing.bin"), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_directory_is_config_error() {
        let result = DirectorySource::new("/definitely/not/here/ms2flash");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_memory_source() {
        let mut source = MemorySource::new().with_file("a.bin", vec![1, 2]);
        assert_eq!(source.load("a.bin").unwrap(), vec![1, 2]);
        assert!(source.load("b.bin").is_err());
    }
}
