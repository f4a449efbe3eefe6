//! [`Port`] over the `serialport` crate (Linux, macOS, Windows).

use {
    crate::{
        error::{Error, Result},
        port::{Port, SerialConfig},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits},
    std::io::{self, Read, Write},
};

/// Serial port opened through the operating system driver.
pub struct NativePort {
    inner: Option<Box<dyn SerialPort>>,
    name: String,
}

impl NativePort {
    /// Open the port described by `config` as 8N1 without flow control.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!("Opening {} at {} baud", config.port_name, config.baud_rate);

        let inner = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()
            .map_err(|source| Error::Open {
                port: config.port_name.clone(),
                source,
            })?;

        Ok(Self {
            inner: Some(inner),
            name: config.port_name.clone(),
        })
    }

    fn handle(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn drain(&mut self) -> Result<()> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(());
        };
        if let Ok(pending @ 1..) = inner.bytes_to_read() {
            trace!("Discarding {pending} stale bytes on {}", self.name);
        }
        inner.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle closes the descriptor
        if self.inner.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?.flush()
    }
}
