//! Error types for vnadfu.

use std::io;
use thiserror::Error;

/// Result type for vnadfu operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for vnadfu operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The serial port could not be opened.
    #[cfg(feature = "native")]
    #[error("Failed to open {port}: {source}")]
    Open {
        /// Port name/path that was requested.
        port: String,
        /// Underlying serial port error.
        #[source]
        source: serialport::Error,
    },

    /// No serial port was found to talk to.
    #[error("No serial port found")]
    DeviceNotFound,

    /// I/O error on the transport (failed or short write, failed read).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port control error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The device returned zero bytes where a reply was owed.
    #[error("Connection closed by device")]
    ConnectionClosed,

    /// No reply arrived before the deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The handshake register did not read back the DFU sentinel.
    #[error("Device is not in DFU mode ({})", describe_reply(.reply))]
    NotInDfuMode {
        /// Byte read from the status register, if any arrived.
        reply: Option<u8>,
    },

    /// A FIFO write was asked to carry more than 255 bytes.
    #[error("Chunk of {len} bytes exceeds the 255 byte FIFO frame limit")]
    ChunkTooLarge {
        /// Offending chunk length.
        len: usize,
    },

    /// An upload session is already running on this connection.
    #[error("An upload session is already active")]
    SessionAlreadyActive,

    /// `end_upload` was called without a matching `begin_upload`.
    #[error("No upload session is active")]
    NoActiveSession,

    /// The connection has been closed.
    #[error("Connection is closed")]
    Closed,

    /// The chunk source failed to produce data.
    #[error("Firmware source error: {0}")]
    Source(#[source] io::Error),

    /// The background upload thread panicked.
    #[error("Upload task panicked")]
    TaskPanicked,
}

#[allow(clippy::ref_option)]
fn describe_reply(reply: &Option<u8>) -> String {
    match reply {
        Some(byte) => format!("status register read 0x{byte:02X}"),
        None => "no status reply".to_string(),
    }
}

impl Error {
    /// Whether this error came from the device link rather than the caller.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout(_) => true,
            #[cfg(feature = "native")]
            Self::Open { .. } | Self::Serial(_) => true,
            _ => false,
        }
    }

    /// Whether this error is a caller-side misuse of the API.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::ChunkTooLarge { .. }
                | Self::SessionAlreadyActive
                | Self::NoActiveSession
                | Self::Closed
        )
    }
}
