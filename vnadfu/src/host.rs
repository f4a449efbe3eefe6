//! Serial port discovery and classification.
//!
//! Ports are classified by USB VID/PID so the CLI can pick the analyzer
//! without asking. The analyzer enumerates with its own CDC VID/PID; older
//! boards show up as an STM32 virtual COM port or as a USB-UART bridge.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Known USB device kinds a VNA can appear as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// The analyzer's own USB CDC interface.
    Analyzer,
    /// STM32 USB CDC virtual COM port.
    StmVirtualCom,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI USB-to-Serial converter.
    Ftdi,
    /// Unknown device.
    Unknown,
}

const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x04B4, &[0x0008], DeviceKind::Analyzer),
    (0x0483, &[0x5740], DeviceKind::StmVirtualCom),
    (0x1A86, &[0x7523, 0x7522, 0x5523, 0x55D4], DeviceKind::Ch340),
    (0x10C4, &[0xEA60, 0xEA70], DeviceKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6014, 0x6015], DeviceKind::Ftdi),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Analyzer => "VNA",
            Self::StmVirtualCom => "STM32 VCP",
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the VID/PID matched a known device.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A serial port found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Whether this port is most likely the analyzer itself.
    #[must_use]
    pub fn is_likely_analyzer(&self) -> bool {
        matches!(self.device, DeviceKind::Analyzer | DeviceKind::StmVirtualCom)
    }
}

/// List every serial port on the host.
#[cfg(feature = "native")]
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|info| {
            let mut detected = DetectedPort {
                name: info.port_name,
                device: DeviceKind::Unknown,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            };

            if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                detected.device = DeviceKind::from_vid_pid(usb.vid, usb.pid);
                trace!(
                    "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                    detected.name, usb.vid, usb.pid, detected.device
                );
                detected.vid = Some(usb.vid);
                detected.pid = Some(usb.pid);
                detected.manufacturer = usb.manufacturer;
                detected.product = usb.product;
                detected.serial = usb.serial_number;
            }
            detected
        })
        .collect()
}

/// List every serial port on the host (no native serial support).
#[cfg(not(feature = "native"))]
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the best port among `ports`.
///
/// Prefers the analyzer's own interface, then an STM32 virtual COM port,
/// then any known bridge, then the first port listed.
pub fn select_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports
        .iter()
        .find(|p| p.device == DeviceKind::Analyzer)
        .or_else(|| ports.iter().find(|p| p.is_likely_analyzer()))
        .or_else(|| ports.iter().find(|p| p.device.is_known()))
        .or_else(|| ports.first())
}

/// Discover ports and pick the best candidate.
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = discover_ports();
    let port = select_port(&ports).cloned().ok_or(Error::DeviceNotFound)?;

    #[cfg(feature = "native")]
    info!("Auto-detected {} port: {}", port.device.name(), port.name);

    Ok(port)
}
