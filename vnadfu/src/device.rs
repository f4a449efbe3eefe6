//! DFU connection lifecycle.
//!
//! A [`DfuDevice`] wraps a port that has passed the DFU handshake. While an
//! upload is running the port belongs to the upload thread, so register
//! access is refused until [`DfuDevice::end_upload`] hands it back.
//!
//! ## Example
//!
//! ```rust,no_run
//! use vnadfu::{DfuDevice, DfuOptions, Progress, ReaderSource};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut dev = DfuDevice::open_native("/dev/ttyACM0", DfuOptions::default())?;
//!
//!     let image = std::fs::read("firmware.bin")?;
//!     dev.begin_upload(0x0800_4000, ReaderSource::from_bytes(image), |p: Progress| {
//!         if let Progress::Sent(bytes) = p {
//!             println!("{bytes} bytes");
//!         }
//!     })?;
//!     let summary = dev.end_upload()?;
//!     println!("Wrote {} bytes", summary.bytes_sent);
//!
//!     dev.reboot()?;
//!     Ok(())
//! }
//! ```

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::{self, DFU_MODE_MAGIC, REBOOT_MAGIC, Register},
        upload::{self, ProgressSink, UploadOptions, UploadOutcome, UploadSession},
    },
    log::{debug, error, info, warn},
    std::{
        io, mem, thread,
        time::{Duration, Instant},
    },
};

#[cfg(feature = "native")]
use crate::port::{NativePort, SerialConfig};

/// Zero bytes written on open to flush a half-received command.
///
/// Longer than any command frame, so the parser always ends up idle.
pub const PARSER_FLUSH_LEN: usize = 64;

/// Default wait between the parser flush and the status read.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Default limit on the handshake status read.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection settings.
#[derive(Debug, Clone)]
pub struct DfuOptions {
    /// Baud rate for native ports.
    pub baud_rate: u32,
    /// Per-read driver timeout for native ports.
    pub read_timeout: Duration,
    /// Pause after the parser flush for stray replies to arrive.
    pub settle_delay: Duration,
    /// How long to wait for the status register during the handshake.
    pub handshake_timeout: Duration,
    /// Upload tunables.
    pub upload: UploadOptions,
}

impl Default for DfuOptions {
    fn default() -> Self {
        Self {
            baud_rate: crate::port::DEFAULT_BAUD,
            read_timeout: crate::port::DEFAULT_READ_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            upload: UploadOptions::default(),
        }
    }
}

impl DfuOptions {
    /// Set the baud rate.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the settle delay.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the upload tunables.
    #[must_use]
    pub fn with_upload(mut self, upload: UploadOptions) -> Self {
        self.upload = upload;
        self
    }
}

enum Link<P> {
    Open(P),
    Streaming(UploadSession<P>),
    Closed,
}

/// Connection to a device running the DFU bootloader.
pub struct DfuDevice<P: Port> {
    link: Link<P>,
    name: String,
    options: DfuOptions,
}

impl<P: Port> DfuDevice<P> {
    /// Take ownership of `port` and verify the device is in DFU mode.
    ///
    /// The port is closed before returning an error.
    pub fn open(mut port: P, options: DfuOptions) -> Result<Self> {
        let name = port.name().to_string();
        info!("Connecting to {name}");

        if let Err(e) = handshake(&mut port, &options) {
            if let Err(close_err) = port.close() {
                debug!("Closing {name} after failed handshake: {close_err}");
            }
            return Err(e);
        }

        info!("Device on {name} is in DFU mode");
        Ok(Self {
            link: Link::Open(port),
            name,
            options,
        })
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection settings.
    pub fn options(&self) -> &DfuOptions {
        &self.options
    }

    /// Whether the connection is still usable.
    pub fn is_open(&self) -> bool {
        !matches!(self.link, Link::Closed)
    }

    /// Whether an upload session is running or waiting to be collected.
    pub fn is_uploading(&self) -> bool {
        matches!(self.link, Link::Streaming(_))
    }

    /// Whether the active upload has stopped, so `end_upload` will not block.
    pub fn is_upload_finished(&self) -> bool {
        match &self.link {
            Link::Streaming(session) => session.is_finished(),
            _ => false,
        }
    }

    fn port(&mut self) -> Result<&mut P> {
        match &mut self.link {
            Link::Open(port) => Ok(port),
            Link::Streaming(_) => Err(Error::SessionAlreadyActive),
            Link::Closed => Err(Error::Closed),
        }
    }

    /// Read an 8-bit register.
    pub fn read_register(&mut self, addr: u8) -> Result<u8> {
        protocol::read_register(self.port()?, addr)
    }

    /// Write an 8-bit register.
    pub fn write_register(&mut self, addr: u8, val: u8) -> Result<()> {
        protocol::write_register(self.port()?, addr, val)
    }

    /// Write a 32-bit register.
    pub fn write_register32(&mut self, addr: u8, val: u32) -> Result<()> {
        protocol::write_register32(self.port()?, addr, val)
    }

    /// Set the argument the application receives after reboot.
    pub fn set_user_argument(&mut self, arg: u32) -> Result<()> {
        debug!("User argument 0x{arg:08X}");
        self.write_register32(Register::UserArgument.addr(), arg)
    }

    /// Leave DFU mode and start the application.
    ///
    /// The device drops off the bus right after, so [`close`](Self::close)
    /// is the only useful call that follows.
    pub fn reboot(&mut self) -> Result<()> {
        info!("Rebooting device on {}", self.name);
        self.write_register(Register::Reboot.addr(), REBOOT_MAGIC)
    }

    /// Wait for the running upload and take its outcome.
    ///
    /// Blocks until the upload thread has returned. The port comes back to
    /// the connection whatever the outcome, unless the thread panicked.
    pub fn end_upload(&mut self) -> UploadOutcome {
        match mem::replace(&mut self.link, Link::Closed) {
            Link::Streaming(session) => match session.join() {
                Ok((port, outcome)) => {
                    self.link = Link::Open(port);
                    outcome
                },
                Err(e) => {
                    error!("Upload thread on {} panicked, connection lost", self.name);
                    Err(e)
                },
            },
            other => {
                self.link = other;
                Err(Error::NoActiveSession)
            },
        }
    }

    /// Close the connection. Calling it again does nothing.
    ///
    /// A running upload is waited for first and its outcome discarded.
    pub fn close(&mut self) {
        let port = match mem::replace(&mut self.link, Link::Closed) {
            Link::Open(port) => Some(port),
            Link::Streaming(session) => {
                warn!("Closing {} with an upload in flight, waiting for it", self.name);
                session.join().ok().map(|(port, _)| port)
            },
            Link::Closed => None,
        };

        if let Some(mut port) = port {
            match port.close() {
                Ok(()) => debug!("Closed {}", self.name),
                Err(e) => debug!("Error closing {}: {e}", self.name),
            }
        }
    }
}

impl<P: Port + 'static> DfuDevice<P> {
    /// Start streaming firmware to flash address `dst_addr`.
    ///
    /// The destination register is written before this returns; a failure
    /// there is reported here and no session starts. After that, chunks are
    /// pulled from `source` on a background thread and `sink` receives
    /// progress until a final [`Progress::Finished`](crate::Progress::Finished).
    pub fn begin_upload<S, K>(&mut self, dst_addr: u32, source: S, sink: K) -> Result<()>
    where
        S: Iterator<Item = io::Result<Vec<u8>>> + Send + 'static,
        K: ProgressSink + 'static,
    {
        let mut port = match mem::replace(&mut self.link, Link::Closed) {
            Link::Open(port) => port,
            other => {
                let err = if matches!(other, Link::Streaming(_)) {
                    Error::SessionAlreadyActive
                } else {
                    Error::Closed
                };
                self.link = other;
                return Err(err);
            },
        };

        info!("Uploading to 0x{dst_addr:08X}");
        let dst_reg = Register::FlashAddress.addr();
        if let Err(e) = protocol::write_register32(&mut port, dst_reg, dst_addr) {
            self.link = Link::Open(port);
            return Err(e);
        }

        let session = upload::spawn(port, source, sink, self.options.upload.clone())?;
        self.link = Link::Streaming(session);
        Ok(())
    }

    /// Run a whole upload and wait for it.
    pub fn upload<S, K>(&mut self, dst_addr: u32, source: S, sink: K) -> UploadOutcome
    where
        S: Iterator<Item = io::Result<Vec<u8>>> + Send + 'static,
        K: ProgressSink + 'static,
    {
        self.begin_upload(dst_addr, source, sink)?;
        self.end_upload()
    }
}

#[cfg(feature = "native")]
impl DfuDevice<NativePort> {
    /// Open a serial port by name and perform the handshake.
    pub fn open_native(port_name: &str, options: DfuOptions) -> Result<Self> {
        let config =
            SerialConfig::new(port_name, options.baud_rate).with_timeout(options.read_timeout);
        let port = NativePort::open(&config)?;
        Self::open(port, options)
    }
}

impl<P: Port> Drop for DfuDevice<P> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reset the device's command parser and check the DFU status register.
fn handshake<P: Port>(port: &mut P, options: &DfuOptions) -> Result<()> {
    // Only the status read decides the outcome
    if let Err(e) = port.write_all_bytes(&[0u8; PARSER_FLUSH_LEN]) {
        debug!("Parser flush on {} failed: {e}", port.name());
    }
    discard_input(port);
    thread::sleep(options.settle_delay);
    discard_input(port);

    let deadline = Instant::now() + options.handshake_timeout;
    match protocol::read_register_until(port, Register::DfuStatus.addr(), Some(deadline)) {
        Ok(DFU_MODE_MAGIC) => Ok(()),
        Ok(reply) => {
            warn!("Status register reads 0x{reply:02X}, expected 0x{DFU_MODE_MAGIC:02X}");
            Err(Error::NotInDfuMode { reply: Some(reply) })
        },
        Err(e) => {
            warn!("No valid status reply: {e}");
            Err(Error::NotInDfuMode { reply: None })
        },
    }
}

fn discard_input<P: Port>(port: &mut P) {
    if let Err(e) = port.drain() {
        debug!("Drain on {} failed: {e}", port.name());
    }
}
