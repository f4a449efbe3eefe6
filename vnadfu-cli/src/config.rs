//! Configuration file support for vnadfu.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (VNADFU_*)
//! 3. Local config file (./vnadfu.toml)
//! 4. Global config file (~/.config/vnadfu/config.toml)
//!
//! USB devices the user chose to remember live in a separate `ports.toml`
//! next to the global config.

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = "vnadfu.toml";

/// USB device identification for port matching.
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

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Default flash destination, as a hex string ("0x08004000").
    pub address: Option<String>,
    /// Pause after the parser flush, in milliseconds.
    pub settle_delay_ms: Option<u64>,
    /// Handshake status read limit, in milliseconds.
    pub handshake_timeout_ms: Option<u64>,
    /// Reboot into the application after flashing.
    pub reboot: Option<bool>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash settings.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Remembered USB devices treated as known during port selection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Remembered devices file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PortsFile {
    #[serde(default)]
    usb_device: Vec<UsbDevice>,
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

        if let Some(ports_path) = Self::ports_file_path() {
            config.merge_remembered_ports(&ports_path);
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Devices remembered in the global `ports.toml` still count as known.
    pub fn load_from_path(path: &Path) -> Self {
        Self::load_explicit(path, Self::ports_file_path().as_deref())
    }

    fn load_explicit(path: &Path, ports_path: Option<&Path>) -> Self {
        let mut config = if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        };

        if let Some(ports_path) = ports_path {
            config.merge_remembered_ports(ports_path);
        }
        config
    }

    fn merge_remembered_ports(&mut self, ports_path: &Path) {
        let Some(ports) = load_toml::<PortsFile>(ports_path) else {
            return;
        };
        debug!("Loaded remembered ports from {}", ports_path.display());
        for device in ports.usb_device {
            if !self.usb_device.contains(&device) {
                self.usb_device.push(device);
            }
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        load_toml(path)
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "vnadfu").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    fn ports_file_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("ports.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        if other.flash.address.is_some() {
            self.flash.address = other.flash.address;
        }
        if other.flash.settle_delay_ms.is_some() {
            self.flash.settle_delay_ms = other.flash.settle_delay_ms;
        }
        if other.flash.handshake_timeout_ms.is_some() {
            self.flash.handshake_timeout_ms = other.flash.handshake_timeout_ms;
        }
        if other.flash.reboot.is_some() {
            self.flash.reboot = other.flash.reboot;
        }

        for device in other.usb_device {
            if !self.usb_device.contains(&device) {
                self.usb_device.push(device);
            }
        }
    }

    /// Check if a USB VID/PID was remembered.
    pub fn knows_usb_device(&self, vid: u16, pid: u16) -> bool {
        self.usb_device.iter().any(|d| d.matches(vid, pid))
    }

    /// Save a USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        if self.knows_usb_device(vid, pid) {
            return Ok(());
        }

        let dir = Self::global_config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        fs::create_dir_all(&dir)?;
        let path = dir.join("ports.toml");

        let mut ports = load_toml::<PortsFile>(&path).unwrap_or_default();
        let device = UsbDevice { vid, pid };
        if !ports.usb_device.contains(&device) {
            ports.usb_device.push(device.clone());
        }

        fs::write(&path, toml::to_string_pretty(&ports)?)?;
        info!("Saved USB device to {}", path.display());

        self.usb_device.push(device);
        Ok(())
    }
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(value) => Some(value),
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
