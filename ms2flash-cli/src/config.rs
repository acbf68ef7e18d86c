//! Configuration file support for ms2flash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MS2FLASH_*)
//! 3. Local config file (./ms2flash.toml)
//! 4. Global config file (~/.config/ms2flash/config.toml)

use directories::{ProjectDirs, UserDirs};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG: &str = "ms2flash.toml";

/// USB device identification for adapter matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection to the SLCAN adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Serial baud rate.
    pub baud: Option<u32>,
    /// CAN bitrate in kbit/s.
    pub bitrate: Option<u32>,
    /// Adapters remembered for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Update settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Default device class ("ms2" or "gb2").
    pub device: Option<String>,
    /// Directory holding firmware and data files.
    pub firmware_dir: Option<PathBuf>,
    /// Update even if the device reports the same version.
    #[serde(default)]
    pub force: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Adapter connection.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Update settings.
    #[serde(default)]
    pub update: UpdateConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {e}", path.display()))?;
        let config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {e}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ms2flash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Where CS2 update files usually live: `<Documents>/MaerklinCS2/CS2/update`.
    pub fn default_firmware_dir() -> Option<PathBuf> {
        UserDirs::new()
            .and_then(|dirs| dirs.document_dir().map(Path::to_path_buf))
            .map(|docs| docs.join("MaerklinCS2").join("CS2").join("update"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        let conn = other.connection;
        if conn.port.is_some() {
            self.connection.port = conn.port;
        }
        if conn.baud.is_some() {
            self.connection.baud = conn.baud;
        }
        if conn.bitrate.is_some() {
            self.connection.bitrate = conn.bitrate;
        }
        for device in conn.usb_device {
            if !self.connection.usb_device.contains(&device) {
                self.connection.usb_device.push(device);
            }
        }

        if other.update.device.is_some() {
            self.update.device = other.update.device;
        }
        if other.update.firmware_dir.is_some() {
            self.update.firmware_dir = other.update.firmware_dir;
        }
        if other.update.force {
            self.update.force = true;
        }
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.connection.usb_device.contains(&device) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_CONFIG)
        } else if let Some(global) = Self::global_config_path() {
            if let Some(dir) = global.parent() {
                fs::create_dir_all(dir)?;
            }
            global
        } else {
            PathBuf::from(LOCAL_CONFIG)
        };

        // Keep whatever else is in the file
        let mut on_disk = Self::load_from_file(&path).unwrap_or_default();
        on_disk.connection.usb_device.push(device.clone());
        fs::write(&path, toml::to_string_pretty(&on_disk)?)?;
        info!("Saved USB device to {}", path.display());

        self.connection.usb_device.push(device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.port.is_none());
        assert!(config.connection.bitrate.is_none());
        assert!(config.connection.usb_device.is_empty());
        assert!(config.update.device.is_none());
        assert!(!config.update.force);
    }

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x16D0,
            pid: 0x117E,
        };
        assert!(device.matches(0x16D0, 0x117E));
        assert!(!device.matches(0x16D0, 0x117F));
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[connection]
port = "/dev/ttyACM0"
bitrate = 250

[[connection.usb_device]]
vid = 0x16D0
pid = 0x117E

[update]
device = "gb2"
firmware_dir = "/srv/cs2/update"
force = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.bitrate, Some(250));
        assert_eq!(config.connection.usb_device.len(), 1);
        assert_eq!(config.update.device.as_deref(), Some("gb2"));
        assert_eq!(
            config.update.firmware_dir,
            Some(PathBuf::from("/srv/cs2/update"))
        );
        assert!(config.update.force);
    }

    #[test]
    fn test_parse_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.port.is_none());
        assert!(config.update.firmware_dir.is_none());
    }

    #[test]
    fn test_merge_local_overrides_global() {
        let mut base = Config::default();
        base.connection.port = Some("/dev/ttyUSB0".to_string());
        base.update.device = Some("ms2".to_string());

        let mut local = Config::default();
        local.connection.port = Some("/dev/ttyACM1".to_string());

        base.merge(local);
        assert_eq!(base.connection.port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(base.update.device.as_deref(), Some("ms2"));
    }

    #[test]
    fn test_merge_usb_devices_deduplicated() {
        let device = UsbDevice {
            vid: 0x0403,
            pid: 0xFFA8,
        };
        let mut base = Config::default();
        base.connection.usb_device.push(device.clone());

        let mut other = Config::default();
        other.connection.usb_device.push(device);
        other.connection.usb_device.push(UsbDevice { vid: 1, pid: 2 });

        base.merge(other);
        assert_eq!(base.connection.usb_device.len(), 2);
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[update]\nforce = true\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert!(config.update.force);
    }

    #[test]
    fn test_load_from_path_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[update\nforce = ").unwrap();

        assert!(Config::load_from_path(&path).is_err());
    }

    #[test]
    fn test_serialize_roundtrip_keeps_sections() {
        let mut config = Config::default();
        config.update.device = Some("ms2".to_string());
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("[update]"));
        assert!(text.contains("device = \"ms2\""));
    }
}
