//! In-memory stand-ins for the platform traits.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
};

use crate::{
    error::{FlashError, TransportError},
    platform::{
        Clock, Connection, FirmwareFlash, FlashTransaction, Network, PersistentBlock,
        ReadOutcome, Restart, Transport,
    },
};

#[derive(Debug, Clone, Default)]
pub struct FakeClock {
    now: Rc<Cell<u64>>,
    delayed: Rc<Cell<u64>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_delay_ms(&self) -> u64 {
        self.delayed.get()
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn delay_ms(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
        self.delayed.set(self.delayed.get() + ms);
    }
}

#[derive(Debug, Clone)]
pub struct FakeNetwork {
    connected: Rc<Cell<bool>>,
    heal_on_reconnect: bool,
    reconnects: Rc<Cell<u32>>,
}

impl FakeNetwork {
    pub fn up() -> Self {
        Self {
            connected: Rc::new(Cell::new(true)),
            heal_on_reconnect: false,
            reconnects: Rc::default(),
        }
    }

    pub fn down() -> Self {
        Self {
            connected: Rc::new(Cell::new(false)),
            heal_on_reconnect: false,
            reconnects: Rc::default(),
        }
    }

    pub fn down_until_reconnect() -> Self {
        Self {
            heal_on_reconnect: true,
            ..Self::down()
        }
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.get()
    }
}

impl Network for FakeNetwork {
    fn is_connected(&mut self) -> bool {
        self.connected.get()
    }

    fn reconnect(&mut self) {
        self.reconnects.set(self.reconnects.get() + 1);
        if self.heal_on_reconnect {
            self.connected.set(true);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Data(Vec<u8>),
    Idle,
    Eof,
}

/// Replays a fixed response. Once the steps run out the connection stays open
/// and idle, which is what a peer that silently stopped sending looks like.
#[derive(Debug, Clone)]
pub struct ScriptedConnection {
    status: u16,
    content_length: Option<u64>,
    steps: VecDeque<Step>,
    open: bool,
}

impl ScriptedConnection {
    pub fn new(status: u16, content_length: Option<u64>, steps: Vec<Step>) -> Self {
        Self {
            status,
            content_length,
            steps: steps.into(),
            open: true,
        }
    }

    pub fn ok(body: Vec<u8>) -> Self {
        let len = body.len() as u64;
        Self::new(200, Some(len), vec![Step::Data(body), Step::Eof])
    }

    pub fn status(status: u16) -> Self {
        Self::new(status, None, vec![Step::Eof])
    }
}

impl Connection for ScriptedConnection {
    fn status(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, TransportError> {
        match self.steps.pop_front() {
            Some(Step::Data(mut data)) => {
                let read = data.len().min(buf.len());
                buf[..read].copy_from_slice(&data[..read]);
                if read < data.len() {
                    self.steps.push_front(Step::Data(data.split_off(read)));
                }
                Ok(ReadOutcome::Data(read))
            }
            Some(Step::Idle) | None => Ok(ReadOutcome::Idle),
            Some(Step::Eof) => {
                self.open = false;
                Ok(ReadOutcome::Eof)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    responses: Rc<RefCell<VecDeque<Result<ScriptedConnection, TransportError>>>>,
    requests: Rc<RefCell<Vec<Request>>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<ScriptedConnection, TransportError>>) -> Self {
        Self {
            responses: Rc::new(RefCell::new(responses.into())),
            requests: Rc::default(),
        }
    }

    pub fn opened(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.borrow().clone()
    }
}

impl Transport for ScriptedTransport {
    type Connection = ScriptedConnection;

    fn open(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<ScriptedConnection, TransportError> {
        self.requests.borrow_mut().push(Request {
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Open("script exhausted".into())))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryBlock {
    bytes: Vec<u8>,
    commits: u32,
    fail_reads: bool,
}

impl MemoryBlock {
    pub fn new(size: usize) -> Self {
        Self::filled(size, 0)
    }

    pub fn filled(size: usize, byte: u8) -> Self {
        Self {
            bytes: vec![byte; size],
            commits: 0,
            fail_reads: false,
        }
    }

    pub fn fail_reads(&mut self) {
        self.fail_reads = true;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn commits(&self) -> u32 {
        self.commits
    }
}

impl PersistentBlock for MemoryBlock {
    type Error = String;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), String> {
        if self.fail_reads {
            return Err("read failed".into());
        }
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), String> {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), String> {
        self.commits += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FlashLog {
    pub begun: Vec<u64>,
    pub written: Vec<u8>,
    pub finalized: u32,
    pub aborted: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingFlash {
    log: Rc<RefCell<FlashLog>>,
    capacity: Option<u64>,
    fail_finalize: bool,
}

impl RecordingFlash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn failing_finalize() -> Self {
        Self {
            fail_finalize: true,
            ..Self::default()
        }
    }

    pub fn log(&self) -> std::cell::Ref<'_, FlashLog> {
        self.log.borrow()
    }
}

pub struct RecordingTransaction {
    log: Rc<RefCell<FlashLog>>,
    fail_finalize: bool,
}

impl FlashTransaction for RecordingTransaction {
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        self.log.borrow_mut().written.extend_from_slice(data);
        Ok(data.len())
    }

    fn finalize(self) -> Result<(), FlashError> {
        if self.fail_finalize {
            return Err(FlashError::Finalize("image validation failed".into()));
        }
        self.log.borrow_mut().finalized += 1;
        Ok(())
    }

    fn abort(self) {
        self.log.borrow_mut().aborted += 1;
    }
}

impl FirmwareFlash for RecordingFlash {
    type Transaction<'a> = RecordingTransaction;

    fn begin(&mut self, size: u64) -> Result<RecordingTransaction, FlashError> {
        if let Some(capacity) = self.capacity.filter(|capacity| size > *capacity) {
            return Err(FlashError::TooLarge { size, capacity });
        }

        let mut log = self.log.borrow_mut();
        log.begun.push(size);
        log.written.clear();
        Ok(RecordingTransaction {
            log: self.log.clone(),
            fail_finalize: self.fail_finalize,
        })
    }
}

/// Panic payload standing in for a device reset.
#[derive(Debug)]
pub struct RestartRequested;

#[derive(Debug, Clone, Default)]
pub struct PanicRestart {
    count: Rc<Cell<u32>>,
}

impl PanicRestart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }
}

impl Restart for PanicRestart {
    fn restart(&self) -> ! {
        self.count.set(self.count.get() + 1);
        panic::panic_any(RestartRequested)
    }
}

/// Runs `f` and reports whether it ended in a restart. Any other panic is
/// propagated.
pub fn catch_restart<R>(f: impl FnOnce() -> R) -> Result<R, RestartRequested> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<RestartRequested>() {
            Ok(restart) => Err(*restart),
            Err(other) => panic::resume_unwind(other),
        },
    }
}
