//! The machine this process runs on.
//!
//! A [`LocalHost`] is a local shell in a pseudo-terminal. It is the upstream
//! host an [`SshMachine`](super::ssh::SshMachine) tunnels through when none
//! is given.

use std::cell::{OnceCell, RefCell, RefMut};
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};

use crate::channel::{Channel, ChannelIo};
use crate::config::{
    DEFAULT_TERM, DEFAULT_TERMINAL_HEIGHT, DEFAULT_TERMINAL_WIDTH, EnvOverrides, LocalHostConfig,
    local_username,
};
use crate::error::{MachineError, Result};
use crate::machine::{Host, Machine, RefCount, borrow_channel};

/// Name of the local machine.
pub const LOCAL_NAME: &str = "local";

const READ_CHUNK: usize = 4096;

thread_local! {
    static DEFAULT_LOCAL: OnceCell<&'static LocalHost> = const { OnceCell::new() };
}

/// The default local machine of the calling thread.
///
/// Created on first use and never destroyed. Connectors borrow it; none of
/// them own it. Machines are not `Send`, so every thread gets its own.
pub fn acquire_local() -> Result<&'static LocalHost> {
    DEFAULT_LOCAL.with(|cell| {
        if let Some(host) = cell.get() {
            return Ok(*host);
        }
        let config = LocalHostConfig::default().with_overrides(&EnvOverrides::from_env());
        let host: &'static LocalHost = Box::leak(Box::new(LocalHost::spawn(config)?));
        tracing::debug!("Created default local machine");
        Ok(*cell.get_or_init(|| host))
    })
}

/// A local shell.
#[derive(Debug)]
pub struct LocalHost {
    config: LocalHostConfig,
    username: String,
    refs: RefCount,
    channel: RefCell<Channel>,
}

impl LocalHost {
    /// Spawn a shell as described by `config`.
    pub fn spawn(config: LocalHostConfig) -> Result<Self> {
        let io = PtyIo::spawn(&config)?;
        let mut channel = Channel::new(LOCAL_NAME, io);
        channel.set_timeout(config.channel_timeout);
        Ok(Self {
            config,
            username: local_username(),
            refs: RefCount::new(),
            channel: RefCell::new(channel),
        })
    }

    /// The configuration this shell was spawned with.
    #[must_use]
    pub const fn config(&self) -> &LocalHostConfig {
        &self.config
    }
}

impl Machine for LocalHost {
    fn name(&self) -> &str {
        LOCAL_NAME
    }

    fn refs(&self) -> &RefCount {
        &self.refs
    }

    fn destroy(&self) -> Result<()> {
        borrow_channel(&self.channel, LOCAL_NAME)?
            .close()
            .map_err(MachineError::from)
    }
}

impl Host for LocalHost {
    fn username(&self) -> &str {
        &self.username
    }

    fn channel(&self) -> Result<RefMut<'_, Channel>> {
        borrow_channel(&self.channel, LOCAL_NAME)
    }

    fn clone_host(&self) -> Result<Box<dyn Host>> {
        Ok(Box::new(Self::spawn(self.config.clone())?))
    }
}

/// Channel backend of a shell in a pseudo-terminal.
///
/// The child process belongs to the backend, so it lives as long as the
/// channel holding it, whichever machine that is.
struct PtyIo {
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    output: Receiver<Vec<u8>>,
    _master: Box<dyn MasterPty + Send>,
}

impl PtyIo {
    fn spawn(config: &LocalHostConfig) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_TERMINAL_HEIGHT,
                cols: DEFAULT_TERMINAL_WIDTH,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MachineError::config(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(&config.shell);
        cmd.args(&config.args);
        cmd.env("TERM", DEFAULT_TERM);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| MachineError::config(format!("failed to spawn {}: {e}", config.shell)))?;
        tracing::info!(shell = %config.shell, pid = ?child.process_id(), "Spawned local shell");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| MachineError::config(format!("failed to clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| MachineError::config(format!("failed to take pty writer: {e}")))?;

        Ok(Self {
            child,
            writer,
            output: pump(reader),
            _master: pair.master,
        })
    }
}

/// Move blocking pty reads to a thread. The receiver disconnects on EOF.
fn pump(mut reader: Box<dyn Read + Send>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

impl ChannelIo for PtyIo {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn read(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<usize> {
        let first = match self.output.recv_timeout(timeout) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) => return Ok(0),
            Err(RecvTimeoutError::Disconnected) => return Err(io::ErrorKind::UnexpectedEof.into()),
        };
        let start = buf.len();
        buf.extend_from_slice(&first);
        while let Ok(chunk) = self.output.try_recv() {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.len() - start)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_none() {
            self.child.kill()?;
        }
        let status = self.child.wait()?;
        tracing::debug!(exit_code = status.exit_code(), "Local shell exited");
        Ok(())
    }
}
