//! I2C transport and the register read/write helpers.
//!
//! Every transfer goes through [`I2cTransport::transfer`], which reports how
//! many of the chained messages the bus completed. The helpers only succeed
//! when all of their messages went through.

use std::fmt;

use itertools::Itertools;
use log::{error, trace};
use thiserror::Error;

/// Single-byte brightness control register.
pub const REG_CTRL_8: u8 = 0x03;
/// 16-bit control register. Reserved, nothing writes it.
pub const REG_CTRL_16: u8 = 0x02;

/// Register address, sent high byte first when two bytes wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAddr {
    OneByte(u8),
    TwoByte(u16),
}

impl RegAddr {
    /// Address width in bytes.
    pub fn width(&self) -> usize {
        match self {
            RegAddr::OneByte(_) => 1,
            RegAddr::TwoByte(_) => 2,
        }
    }

    fn extend_into(&self, buf: &mut Vec<u8>) {
        match *self {
            RegAddr::OneByte(reg) => buf.push(reg),
            RegAddr::TwoByte(reg) => buf.extend_from_slice(&reg.to_be_bytes()),
        }
    }

    fn to_bytes(self) -> ([u8; 2], usize) {
        match self {
            RegAddr::OneByte(reg) => ([reg, 0], 1),
            RegAddr::TwoByte(reg) => (reg.to_be_bytes(), 2),
        }
    }
}

impl fmt::Display for RegAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegAddr::OneByte(reg) => write!(f, "0x{reg:02X}"),
            RegAddr::TwoByte(reg) => write!(f, "0x{reg:04X}"),
        }
    }
}

/// One leg of a combined transfer.
#[derive(Debug)]
pub enum Message<'a> {
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

pub trait I2cTransport {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs `msgs` as one combined transaction against `addr` and returns
    /// the number of messages completed.
    fn transfer(&mut self, addr: u16, msgs: &mut [Message<'_>]) -> Result<usize, Self::Error>;
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("bus error: {0}")]
    Bus(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("{completed} of {expected} messages completed")]
    Incomplete { completed: usize, expected: usize },
    #[error("failed to allocate {0} byte transfer buffer")]
    Alloc(usize),
}

/// A bus handle bound to one slave address.
#[derive(Debug)]
pub struct I2cClient<T> {
    bus: T,
    addr: u16,
}

impl<T: I2cTransport> I2cClient<T> {
    pub fn new(bus: T, addr: u16) -> Self {
        Self { bus, addr }
    }

    pub fn addr(&self) -> u16 {
        self.addr
    }

    /// Writes the register address, then reads `buf.len()` bytes back in the
    /// same transaction.
    pub fn read(&mut self, reg: RegAddr, buf: &mut [u8]) -> Result<(), TransferError> {
        let len = buf.len();
        let (addr, addr_len) = reg.to_bytes();
        let mut msgs = [Message::Write(&addr[..addr_len]), Message::Read(buf)];

        self.run(&mut msgs).inspect_err(|e| {
            error!("I2C read 0x{:02x}: {reg}, {len} bytes failed: {e}", self.addr);
        })
    }

    /// Sends `reg` followed by `data` as a single message.
    pub fn write(&mut self, reg: RegAddr, data: &[u8]) -> Result<(), TransferError> {
        let addr = self.addr;
        self.write_frame(reg, data).inspect_err(|e| {
            error!("I2C write 0x{addr:02x}: {reg}, {} bytes failed: {e}", data.len());
        })
    }

    fn write_frame(&mut self, reg: RegAddr, data: &[u8]) -> Result<(), TransferError> {
        let mut frame = alloc_frame(reg.width() + data.len())?;
        reg.extend_into(&mut frame);
        frame.extend_from_slice(data);

        trace!(
            "I2C write to 0x{:02x}: [{:02x}]",
            self.addr,
            frame.iter().format(" ")
        );
        self.run(&mut [Message::Write(&frame)])
    }

    fn run(&mut self, msgs: &mut [Message<'_>]) -> Result<(), TransferError> {
        let expected = msgs.len();
        let completed = self
            .bus
            .transfer(self.addr, msgs)
            .map_err(|e| TransferError::Bus(Box::new(e)))?;
        if completed != expected {
            return Err(TransferError::Incomplete {
                completed,
                expected,
            });
        }
        Ok(())
    }
}

fn alloc_frame(len: usize) -> Result<Vec<u8>, TransferError> {
    #[cfg(test)]
    if mock::alloc_refused(len) {
        return Err(TransferError::Alloc(len));
    }
    let mut frame = Vec::new();
    frame
        .try_reserve_exact(len)
        .map_err(|_| TransferError::Alloc(len))?;
    Ok(frame)
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{
        cell::Cell,
        sync::{Arc, Mutex, Once},
    };

    use log::{Level, LevelFilter, Log, Metadata, Record};

    use super::{I2cTransport, Message};

    thread_local! {
        static ALLOC_LIMIT: Cell<Option<usize>> = const { Cell::new(None) };
    }

    /// Makes transfer buffers larger than `limit` fail to allocate on the
    /// calling thread.
    pub fn refuse_allocations_over(limit: usize) {
        ALLOC_LIMIT.with(|l| l.set(Some(limit)));
    }

    pub fn alloc_refused(len: usize) -> bool {
        ALLOC_LIMIT.with(|l| l.get()).is_some_and(|limit| len > limit)
    }

    static LOGS: Mutex<Vec<String>> = Mutex::new(Vec::new());

    struct Capture;

    impl Log for Capture {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= Level::Warn
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                LOGS.lock().unwrap().push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    static CAPTURE: Capture = Capture;

    /// Routes warnings and errors into an in-memory list for the rest of the
    /// test run.
    pub fn capture_logs() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = log::set_logger(&CAPTURE);
            log::set_max_level(LevelFilter::Warn);
        });
    }

    /// Captured messages containing `needle`.
    pub fn logs_containing(needle: &str) -> Vec<String> {
        LOGS.lock()
            .unwrap()
            .iter()
            .filter(|line| line.contains(needle))
            .cloned()
            .collect()
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Recorded {
        Write(Vec<u8>),
        Read(usize),
    }

    #[derive(Debug, thiserror::Error)]
    #[error("simulated bus fault")]
    pub struct Fault;

    #[derive(Debug, Clone, Copy)]
    pub enum Outcome {
        /// Complete every message.
        Ok,
        /// Report this many messages completed.
        Short(usize),
        Fail,
    }

    /// Records every transfer; shared so tests can inspect it after the bus
    /// has been moved into a client.
    #[derive(Debug, Clone)]
    pub struct MockBus {
        pub transfers: Arc<Mutex<Vec<(u16, Vec<Recorded>)>>>,
        pub outcome: Arc<Mutex<Outcome>>,
        pub read_data: Vec<u8>,
    }

    impl MockBus {
        pub fn new() -> Self {
            Self {
                transfers: Arc::new(Mutex::new(Vec::new())),
                outcome: Arc::new(Mutex::new(Outcome::Ok)),
                read_data: Vec::new(),
            }
        }

        pub fn with_outcome(outcome: Outcome) -> Self {
            let bus = Self::new();
            *bus.outcome.lock().unwrap() = outcome;
            bus
        }

        pub fn set_outcome(&self, outcome: Outcome) {
            *self.outcome.lock().unwrap() = outcome;
        }

        pub fn transfers(&self) -> Vec<(u16, Vec<Recorded>)> {
            self.transfers.lock().unwrap().clone()
        }
    }

    impl I2cTransport for MockBus {
        type Error = Fault;

        fn transfer(&mut self, addr: u16, msgs: &mut [Message<'_>]) -> Result<usize, Fault> {
            let recorded = msgs
                .iter_mut()
                .map(|msg| match msg {
                    Message::Write(data) => Recorded::Write(data.to_vec()),
                    Message::Read(buf) => {
                        for (dst, src) in buf.iter_mut().zip(self.read_data.iter()) {
                            *dst = *src;
                        }
                        Recorded::Read(buf.len())
                    }
                })
                .collect();
            self.transfers.lock().unwrap().push((addr, recorded));

            match *self.outcome.lock().unwrap() {
                Outcome::Ok => Ok(msgs.len()),
                Outcome::Short(n) => Ok(n),
                Outcome::Fail => Err(Fault),
            }
        }
    }
}
