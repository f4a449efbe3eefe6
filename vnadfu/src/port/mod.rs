//! Byte transport to the bootloader.
//!
//! Everything above this module talks to a [`Port`], never to a concrete
//! serial driver. The unit tests plug in a simulated bootloader through the
//! same trait.
//!
//! ```rust,no_run
//! use vnadfu::port::Port;
//!
//! fn poke<P: Port>(port: &mut P) -> vnadfu::Result<()> {
//!     port.drain()?;
//!     port.write_all_bytes(&[0x10, 0xf3])?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use {
    crate::error::Result,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

#[cfg(feature = "native")]
pub use native::NativePort;

/// Baud rate the bootloader listens at.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Driver read timeout used unless configured otherwise.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Settings for opening a serial link.
///
/// The link is always 8 data bits, no parity, one stop bit and no flow
/// control; only the values below vary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate. USB CDC devices ignore it, UART bridges do not.
    pub baud_rate: u32,
    /// Per-read timeout of the driver.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Configuration for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Duplex byte stream to a device.
///
/// A port has one owner at a time: the [`DfuDevice`] while idle, the upload
/// thread while a session runs. Implementations need `Send`, not `Sync`.
///
/// [`DfuDevice`]: crate::device::DfuDevice
pub trait Port: Read + Write + Send {
    /// Port name/path.
    fn name(&self) -> &str;

    /// Throw away bytes received but not yet read.
    fn drain(&mut self) -> Result<()>;

    /// Release the port. A second call is a no-op; I/O afterwards fails
    /// with `NotConnected`.
    fn close(&mut self) -> Result<()>;

    /// Whether [`close`](Self::close) has not been called yet.
    fn is_open(&self) -> bool;

    /// Write and flush `buf`.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf)?;
        self.flush()?;
        Ok(())
    }
}
