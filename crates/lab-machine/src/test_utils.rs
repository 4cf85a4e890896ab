//! Scripted channel and host for tests.
//!
//! [`MockChannel`] is a cloneable in-memory session: one clone is handed to a
//! [`Channel`], the other stays with the test to queue output and inspect
//! what was written. [`MockHost`] is a [`Host`] built on top of it which
//! records every clone it hands out.

use std::cell::{Cell, RefCell, RefMut};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::channel::{Channel, ChannelIo};
use crate::error::{MachineError, Result};
use crate::machine::{Host, Machine, RefCount, borrow_channel};

/// Longest a mock read sleeps when nothing is queued.
const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct MockState {
    output: VecDeque<u8>,
    input: Vec<u8>,
    echo: bool,
    eof: bool,
    closes: usize,
}

/// In-memory channel backend.
#[derive(Debug, Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    /// Create a silent mock channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock channel that echoes everything written, like a terminal.
    #[must_use]
    pub fn echoing() -> Self {
        let mock = Self::new();
        mock.lock().echo = true;
        mock
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue output to be read.
    pub fn queue_output(&self, s: &str) {
        self.lock().output.extend(s.as_bytes());
    }

    /// Everything written so far.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.lock().input.clone()
    }

    /// Everything written so far, as a string.
    #[must_use]
    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    /// Signal end of stream once queued output is drained.
    pub fn signal_eof(&self) {
        self.lock().eof = true;
    }

    /// Number of times the backend was closed.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.lock().closes
    }
}

impl ChannelIo for MockChannel {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        if state.closes > 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock channel closed"));
        }
        state.input.extend_from_slice(data);
        if state.echo {
            state.output.extend(data);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<usize> {
        {
            let mut state = self.lock();
            if !state.output.is_empty() {
                let n = state.output.len();
                buf.extend(state.output.drain(..));
                return Ok(n);
            }
            if state.eof {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        std::thread::sleep(timeout.min(IDLE_POLL));
        Ok(0)
    }

    fn close(&mut self) -> io::Result<()> {
        self.lock().closes += 1;
        Ok(())
    }
}

/// Shared record of what happened to a [`MockHost`] and its clones.
#[derive(Debug, Default)]
pub struct MockRecord {
    clones: RefCell<Vec<MockChannel>>,
    destroys: Cell<usize>,
}

impl MockRecord {
    /// Backends of every clone handed out, in order.
    #[must_use]
    pub fn clones(&self) -> Vec<MockChannel> {
        self.clones.borrow().clone()
    }

    /// Number of `destroy` calls across the host and its clones.
    #[must_use]
    pub fn destroys(&self) -> usize {
        self.destroys.get()
    }
}

/// A host backed by [`MockChannel`]s.
#[derive(Debug)]
pub struct MockHost {
    name: String,
    username: String,
    refs: RefCount,
    channel: RefCell<Channel>,
    backend: MockChannel,
    record: Rc<MockRecord>,
}

impl MockHost {
    /// Create a host named `name` logged in as `username`.
    #[must_use]
    pub fn new(name: impl Into<String>, username: impl Into<String>) -> Self {
        Self::with_record(name.into(), username.into(), Rc::default())
    }

    fn with_record(name: String, username: String, record: Rc<MockRecord>) -> Self {
        let backend = MockChannel::echoing();
        let mut channel = Channel::new(name.clone(), backend.clone());
        channel.set_timeout(Duration::from_millis(500));
        Self {
            name,
            username,
            refs: RefCount::new(),
            channel: RefCell::new(channel),
            backend,
            record,
        }
    }

    /// Backend of this host's own channel.
    #[must_use]
    pub fn backend(&self) -> &MockChannel {
        &self.backend
    }

    /// Record shared with every clone.
    #[must_use]
    pub fn record(&self) -> Rc<MockRecord> {
        Rc::clone(&self.record)
    }
}

impl Machine for MockHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn refs(&self) -> &RefCount {
        &self.refs
    }

    fn destroy(&self) -> Result<()> {
        self.record.destroys.set(self.record.destroys.get() + 1);
        borrow_channel(&self.channel, &self.name)?
            .close()
            .map_err(MachineError::from)
    }
}

impl Host for MockHost {
    fn username(&self) -> &str {
        &self.username
    }

    fn channel(&self) -> Result<RefMut<'_, Channel>> {
        borrow_channel(&self.channel, &self.name)
    }

    fn clone_host(&self) -> Result<Box<dyn Host>> {
        let clone = Self::with_record(
            self.name.clone(),
            self.username.clone(),
            Rc::clone(&self.record),
        );
        self.record.clones.borrow_mut().push(clone.backend.clone());
        Ok(Box::new(clone))
    }
}
