//! DFU register-access protocol.
//!
//! The bootloader speaks a tiny command set over the serial link. Every
//! command starts with an opcode byte; only register reads and FIFO writes
//! produce a reply.
//!
//! ```text
//! +--------+-------------------------------+-------------+
//! | Opcode | Layout                        | Reply       |
//! +--------+-------------------------------+-------------+
//! |  0x10  | 0x10 addr                     | 1 byte      |
//! |  0x20  | 0x20 addr val                 | -           |
//! |  0x22  | 0x22 addr v0 v1 v2 v3  (LE)   | -           |
//! |  0x28  | 0x28 0xe4 len data... 0x0d    | 1 ack byte  |
//! +--------+-------------------------------+-------------+
//! ```

pub mod fifo;

use {
    crate::error::{Error, Result},
    byteorder::{ByteOrder, LittleEndian},
    log::trace,
    std::{
        io::{ErrorKind, Read, Write},
        time::Instant,
    },
};

/// Value of [`Register::DfuStatus`] while the bootloader is running.
pub const DFU_MODE_MAGIC: u8 = 0xff;

/// Value written to [`Register::Reboot`] to leave DFU mode.
pub const REBOOT_MAGIC: u8 = 0x5e;

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Read an 8-bit register.
    ReadRegister = 0x10,
    /// Write an 8-bit register.
    WriteRegister = 0x20,
    /// Write a 32-bit register.
    WriteRegister32 = 0x22,
    /// Append bytes to a FIFO register.
    WriteFifo = 0x28,
}

impl Opcode {
    /// Parse an opcode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::ReadRegister),
            0x20 => Some(Self::WriteRegister),
            0x22 => Some(Self::WriteRegister32),
            0x28 => Some(Self::WriteFifo),
            _ => None,
        }
    }
}

/// Well-known bootloader registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    /// Flash destination address for the next FIFO stream (32-bit write).
    FlashAddress = 0xe0,
    /// Flash write FIFO, only addressed through [`Opcode::WriteFifo`].
    WriteFifo = 0xe4,
    /// Opaque argument handed to the application after reboot (32-bit write).
    UserArgument = 0xe8,
    /// Reboot trigger, expects [`REBOOT_MAGIC`].
    Reboot = 0xef,
    /// Reads [`DFU_MODE_MAGIC`] when the bootloader is active.
    DfuStatus = 0xf3,
}

impl Register {
    /// Register address byte.
    #[must_use]
    pub fn addr(self) -> u8 {
        self as u8
    }

    /// Look up a well-known register by address.
    pub fn from_addr(addr: u8) -> Option<Self> {
        match addr {
            0xe0 => Some(Self::FlashAddress),
            0xe4 => Some(Self::WriteFifo),
            0xe8 => Some(Self::UserArgument),
            0xef => Some(Self::Reboot),
            0xf3 => Some(Self::DfuStatus),
            _ => None,
        }
    }
}

impl From<Register> for u8 {
    fn from(reg: Register) -> Self {
        reg.addr()
    }
}

/// Build a register read command.
#[must_use]
pub fn read_register_frame(addr: u8) -> [u8; 2] {
    [Opcode::ReadRegister as u8, addr]
}

/// Build an 8-bit register write command.
#[must_use]
pub fn write_register_frame(addr: u8, val: u8) -> [u8; 3] {
    [Opcode::WriteRegister as u8, addr, val]
}

/// Build a 32-bit register write command.
#[must_use]
pub fn write_register32_frame(addr: u8, val: u32) -> [u8; 6] {
    let mut frame = [Opcode::WriteRegister32 as u8, addr, 0, 0, 0, 0];
    LittleEndian::write_u32(&mut frame[2..], val);
    frame
}

fn send<P: Write + ?Sized>(port: &mut P, frame: &[u8]) -> Result<()> {
    trace!("-> {frame:02X?}");
    port.write_all(frame)?;
    port.flush()?;
    Ok(())
}

/// Read one reply byte.
///
/// Driver read timeouts are retried; with `deadline` set, they turn into
/// [`Error::Timeout`] once it passes. A zero-length read means the device
/// went away.
pub(crate) fn read_byte<P: Read + ?Sized>(port: &mut P, deadline: Option<Instant>) -> Result<u8> {
    let mut buf = [0u8; 1];
    loop {
        match port.read(&mut buf) {
            Ok(1) => return Ok(buf[0]),
            Ok(_) => return Err(Error::ConnectionClosed),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(Error::Timeout("no reply from device".into()));
                }
            },
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Read an 8-bit register.
pub fn read_register<P: Read + Write + ?Sized>(port: &mut P, addr: u8) -> Result<u8> {
    read_register_until(port, addr, None)
}

/// Read an 8-bit register, giving up at `deadline`.
pub(crate) fn read_register_until<P: Read + Write + ?Sized>(
    port: &mut P,
    addr: u8,
    deadline: Option<Instant>,
) -> Result<u8> {
    send(port, &read_register_frame(addr))?;
    let val = read_byte(port, deadline)?;
    trace!("<- reg 0x{addr:02X} = 0x{val:02X}");
    Ok(val)
}

/// Write an 8-bit register.
pub fn write_register<P: Write + ?Sized>(port: &mut P, addr: u8, val: u8) -> Result<()> {
    send(port, &write_register_frame(addr, val))
}

/// Write a 32-bit register.
pub fn write_register32<P: Write + ?Sized>(port: &mut P, addr: u8, val: u32) -> Result<()> {
    send(port, &write_register32_frame(addr, val))
}
