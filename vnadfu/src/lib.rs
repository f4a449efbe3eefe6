//! # vnadfu
//!
//! A library for updating vector network analyzer firmware over the
//! serial DFU bootloader.
//!
//! The bootloader exposes a handful of byte-addressed registers. Firmware is
//! written by setting the flash destination register and then streaming
//! chunks into a write FIFO, with a small window of unacknowledged writes
//! kept in flight.
//!
//! - [`protocol`]: register and FIFO command framing
//! - [`upload`]: background streaming with flow control and progress
//! - [`device`]: handshake and connection lifecycle
//! - [`host`]: serial port discovery
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use vnadfu::{DfuDevice, DfuOptions, NoProgress, ReaderSource};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = vnadfu::auto_detect_port()?;
//!     let mut dev = DfuDevice::open_native(&port.name, DfuOptions::default())?;
//!
//!     let image = std::fs::File::open("firmware.bin")?;
//!     dev.upload(0x0800_4000, ReaderSource::new(image), NoProgress)?;
//!     dev.reboot()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod host;
pub mod port;
pub mod protocol;
pub mod upload;

#[cfg(test)]
mod testutil;

#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    device::{DfuDevice, DfuOptions},
    error::{Error, Result},
    host::{DetectedPort, DeviceKind, auto_detect_port, discover_ports},
    port::{Port, SerialConfig},
    protocol::{Register, fifo::MAX_CHUNK},
    upload::{
        ACK_WINDOW, NoProgress, PROGRESS_INTERVAL, Progress, ProgressSink, ReaderSource,
        UploadOptions, UploadOutcome, UploadSummary,
    },
};
