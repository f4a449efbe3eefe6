//! Write-FIFO framing.
//!
//! Firmware bytes reach flash through the [`Register::WriteFifo`] register.
//! Each frame carries at most [`MAX_CHUNK`] bytes and is answered by exactly
//! one acknowledgement byte once the device has accepted it.
//!
//! ```text
//! +------+------+-----+------------------+------+
//! | 0x28 | 0xe4 | len |   data (len)     | 0x0d |
//! +------+------+-----+------------------+------+
//! ```

use {
    super::{Opcode, Register, read_byte},
    crate::error::{Error, Result},
    log::trace,
    std::io::{Read, Write},
};

/// Largest payload a single FIFO frame can carry.
pub const MAX_CHUNK: usize = 255;

/// Trailing byte of every FIFO frame.
pub const FRAME_TERMINATOR: u8 = 0x0d;

/// Build a FIFO write frame for `data`.
#[allow(clippy::cast_possible_truncation)]
pub fn fifo_frame(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > MAX_CHUNK {
        return Err(Error::ChunkTooLarge { len: data.len() });
    }

    let mut frame = Vec::with_capacity(data.len() + 4);
    frame.push(Opcode::WriteFifo as u8);
    frame.push(Register::WriteFifo.addr());
    // Checked against MAX_CHUNK above
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    frame.push(FRAME_TERMINATOR);
    Ok(frame)
}

/// Send one chunk as a single framed write.
pub fn send_chunk<P: Write + ?Sized>(port: &mut P, data: &[u8]) -> Result<()> {
    let frame = fifo_frame(data)?;
    trace!("-> fifo {} bytes", data.len());
    port.write_all(&frame)?;
    port.flush()?;
    Ok(())
}

/// Consume one acknowledgement byte. Blocks until it arrives.
pub fn wait_ack<P: Read + ?Sized>(port: &mut P) -> Result<()> {
    let ack = read_byte(port, None)?;
    trace!("<- ack 0x{ack:02X}");
    Ok(())
}
