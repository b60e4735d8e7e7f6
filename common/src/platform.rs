//! Seams between the update core and the hardware it runs on.

use std::{thread, time::Duration, time::Instant};

use crate::error::{FlashError, TransportError};

pub trait Clock {
    fn now_ms(&self) -> u64;
    /// Blocks the calling task. On esp-idf this is a FreeRTOS delay, so it
    /// doubles as the cooperative yield point.
    fn delay_ms(&self, ms: u64);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn delay_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

pub trait Restart {
    fn restart(&self) -> !;
}

/// Small reserved region of non-volatile storage, EEPROM style.
pub trait PersistentBlock {
    type Error: std::fmt::Display;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Self::Error>;
    fn commit(&mut self) -> Result<(), Self::Error>;
}

pub trait Network {
    fn is_connected(&mut self) -> bool;
    fn reconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    /// Connection is still open but nothing is buffered right now.
    Idle,
    Eof,
}

pub trait Connection {
    fn status(&self) -> u16;
    fn content_length(&self) -> Option<u64>;
    fn is_open(&self) -> bool;
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, TransportError>;
}

/// Opens one GET request per call; every retry gets a fresh connection.
pub trait Transport {
    type Connection: Connection;

    fn open(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Self::Connection, TransportError>;
}

pub trait FlashTransaction {
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError>;
    fn finalize(self) -> Result<(), FlashError>;
    fn abort(self);
}

pub trait FirmwareFlash {
    type Transaction<'a>: FlashTransaction
    where
        Self: 'a;

    fn begin(&mut self, size: u64) -> Result<Self::Transaction<'_>, FlashError>;
}
