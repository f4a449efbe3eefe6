//! Simulated DFU bootloader for unit tests.
//!
//! `SimDevice` implements [`Port`] and decodes everything the host writes.
//! Register reads are answered from a register map, FIFO frames are recorded
//! and acknowledged either immediately or when a test releases them. A
//! cloneable [`SimHandle`] keeps the device observable after the port has
//! been moved into an upload thread.

use {
    crate::{
        error::Result,
        port::Port,
        protocol::{Opcode, fifo::FRAME_TERMINATOR},
    },
    std::{
        collections::{HashMap, VecDeque},
        io::{self, Read, Write},
        mem,
        sync::{Arc, Condvar, Mutex, MutexGuard},
        time::{Duration, Instant},
    },
};

/// Byte the simulator returns as a FIFO acknowledgement.
const ACK_BYTE: u8 = 0x06;

/// One decoded host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SimWrite {
    Reg8(u8, u8),
    Reg32(u8, u32),
    Fifo(Vec<u8>),
}

#[derive(Default)]
struct State {
    registers: HashMap<u8, u8>,
    rx: Vec<u8>,
    /// Reply bytes, flagged when they are FIFO acks.
    tx: VecDeque<(u8, bool)>,
    writes: Vec<SimWrite>,
    zero_bytes: usize,
    withheld_acks: usize,
    manual_acks: bool,
    unacked: usize,
    max_unacked: usize,
    hang_up_after: Option<usize>,
    hung_up: bool,
    silent: bool,
    fail_writes: bool,
    fail_next_write: bool,
    closed: bool,
    close_calls: usize,
    drains: usize,
}

impl State {
    fn fifo_count(&self) -> usize {
        self.writes
            .iter()
            .filter(|w| matches!(w, SimWrite::Fifo(_)))
            .count()
    }

    fn parse(&mut self) {
        loop {
            let Some(&op) = self.rx.first() else {
                return;
            };
            let used = match Opcode::from_byte(op) {
                Some(Opcode::ReadRegister) if self.rx.len() >= 2 => {
                    let addr = self.rx[1];
                    if !self.hung_up && !self.silent {
                        let val = self.registers.get(&addr).copied().unwrap_or(0);
                        self.tx.push_back((val, false));
                    }
                    2
                },
                Some(Opcode::WriteRegister) if self.rx.len() >= 3 => {
                    let (addr, val) = (self.rx[1], self.rx[2]);
                    self.registers.insert(addr, val);
                    self.writes.push(SimWrite::Reg8(addr, val));
                    3
                },
                Some(Opcode::WriteRegister32) if self.rx.len() >= 6 => {
                    let addr = self.rx[1];
                    let val =
                        u32::from_le_bytes([self.rx[2], self.rx[3], self.rx[4], self.rx[5]]);
                    self.writes.push(SimWrite::Reg32(addr, val));
                    6
                },
                Some(Opcode::WriteFifo) if self.rx.len() >= 3 => {
                    let len = usize::from(self.rx[2]);
                    let total = len + 4;
                    if self.rx.len() < total {
                        return;
                    }
                    assert_eq!(self.rx[1], 0xe4, "FIFO frame addressed to wrong register");
                    assert_eq!(self.rx[total - 1], FRAME_TERMINATOR, "FIFO frame not terminated");
                    self.writes.push(SimWrite::Fifo(self.rx[3..3 + len].to_vec()));
                    self.accept_frame();
                    total
                },
                // Incomplete command, wait for more bytes
                Some(_) => return,
                None if op == 0x00 => {
                    self.zero_bytes += 1;
                    1
                },
                None => 1,
            };
            self.rx.drain(..used);
        }
    }

    fn accept_frame(&mut self) {
        self.unacked += 1;
        self.max_unacked = self.max_unacked.max(self.unacked);

        if self
            .hang_up_after
            .is_some_and(|n| self.fifo_count() >= n)
        {
            self.hung_up = true;
            return;
        }
        if self.manual_acks {
            self.withheld_acks += 1;
        } else {
            self.tx.push_back((ACK_BYTE, true));
        }
    }
}

/// Cloneable view onto a [`SimDevice`].
#[derive(Clone)]
pub(crate) struct SimHandle {
    shared: Arc<(Mutex<State>, Condvar)>,
}

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.0.lock().unwrap()
    }

    fn notify(&self) {
        self.shared.1.notify_all();
    }

    pub(crate) fn set_register(&self, addr: u8, val: u8) {
        self.state().registers.insert(addr, val);
    }

    /// Reads return end-of-stream once pending replies are consumed.
    pub(crate) fn hang_up(&self) {
        self.state().hung_up = true;
        self.notify();
    }

    /// Stop answering after `frames` FIFO writes.
    pub(crate) fn hang_up_after(&self, frames: usize) {
        self.state().hang_up_after = Some(frames);
    }

    /// Never reply; reads keep timing out.
    pub(crate) fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Make every write accept zero bytes.
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Make only the next write accept zero bytes.
    pub(crate) fn fail_next_write(&self) {
        self.state().fail_next_write = true;
    }

    /// Hold FIFO acks back until [`release_acks`](Self::release_acks).
    pub(crate) fn withhold_acks(&self) {
        self.state().manual_acks = true;
    }

    /// Release up to `n` withheld acks.
    pub(crate) fn release_acks(&self, n: usize) {
        let mut state = self.state();
        let n = n.min(state.withheld_acks);
        state.withheld_acks -= n;
        for _ in 0..n {
            state.tx.push_back((ACK_BYTE, true));
        }
        drop(state);
        self.notify();
    }

    /// Release everything withheld and acknowledge future frames at once.
    pub(crate) fn resume_acks(&self) {
        let mut state = self.state();
        state.manual_acks = false;
        let n = std::mem::take(&mut state.withheld_acks);
        for _ in 0..n {
            state.tx.push_back((ACK_BYTE, true));
        }
        drop(state);
        self.notify();
    }

    /// Queue bytes the host did not ask for.
    pub(crate) fn push_stale(&self, bytes: &[u8]) {
        self.state()
            .tx
            .extend(bytes.iter().map(|&b| (b, false)));
    }

    pub(crate) fn writes(&self) -> Vec<SimWrite> {
        self.state().writes.clone()
    }

    pub(crate) fn fifo_chunks(&self) -> Vec<Vec<u8>> {
        self.state()
            .writes
            .iter()
            .filter_map(|w| match w {
                SimWrite::Fifo(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn unacked(&self) -> usize {
        self.state().unacked
    }

    pub(crate) fn max_unacked(&self) -> usize {
        self.state().max_unacked
    }

    pub(crate) fn zero_bytes(&self) -> usize {
        self.state().zero_bytes
    }

    pub(crate) fn drains(&self) -> usize {
        self.state().drains
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.state().close_calls
    }

    /// Block until the device has seen `n` FIFO frames.
    pub(crate) fn wait_for_fifo_writes(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        while state.fifo_count() < n {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .1
                .wait_timeout(state, deadline - now)
                .unwrap()
                .0;
        }
        true
    }
}

/// Simulated bootloader port.
pub(crate) struct SimDevice {
    handle: SimHandle,
    timeout: Duration,
}

impl SimDevice {
    /// A device sitting in DFU mode that acknowledges every FIFO frame.
    pub(crate) fn new() -> Self {
        let mut state = State::default();
        state.registers.insert(0xf3, 0xff);
        Self {
            handle: SimHandle {
                shared: Arc::new((Mutex::new(state), Condvar::new())),
            },
            timeout: Duration::from_millis(20),
        }
    }

    /// A device whose status register reads `status`.
    pub(crate) fn with_status(status: u8) -> Self {
        let dev = Self::new();
        dev.handle.set_register(0xf3, status);
        dev
    }

    pub(crate) fn handle(&self) -> SimHandle {
        self.handle.clone()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "port closed")
}

impl Read for SimDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (lock, cvar) = &*self.handle.shared;
        let mut state = lock.lock().unwrap();
        if state.closed {
            return Err(not_connected());
        }
        if state.tx.is_empty() && !state.hung_up {
            state = cvar.wait_timeout(state, self.timeout).unwrap().0;
        }
        if let Some((byte, is_ack)) = state.tx.pop_front() {
            if is_ack {
                state.unacked -= 1;
            }
            buf[0] = byte;
            return Ok(1);
        }
        if state.hung_up {
            return Ok(0);
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Write for SimDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.handle.state();
        if state.closed {
            return Err(not_connected());
        }
        if state.fail_writes || mem::take(&mut state.fail_next_write) {
            return Ok(0);
        }
        state.rx.extend_from_slice(buf);
        state.parse();
        drop(state);
        self.handle.notify();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimDevice {
    fn name(&self) -> &str {
        "sim"
    }

    fn drain(&mut self) -> Result<()> {
        let mut state = self.handle.state();
        state.drains += 1;
        state.tx.retain(|&(_, is_ack)| is_ack);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.handle.state();
        state.close_calls += 1;
        state.closed = true;
        drop(state);
        self.handle.notify();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.handle.state().closed
    }
}
