//! Exclusive-ownership session channels.
//!
//! A [`Channel`] wraps one live bidirectional session (an SSH session channel,
//! a local pseudo-terminal, ...) behind the blocking [`ChannelIo`] trait.
//! Exactly one owner holds the session at a time. [`Channel::take`] hands the
//! session to a new `Channel` and leaves the origin behind as an empty shell
//! that rejects every further operation.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use crate::error::ChannelError;

/// Default timeout for blocking channel reads.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result type for channel operations.
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Blocking byte-stream backend of a channel.
///
/// Implementations are driven from a single thread. They must not buffer
/// writes beyond the call.
pub trait ChannelIo {
    /// Write all of `data` to the session.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Append whatever arrives within `timeout` to `buf`.
    ///
    /// Returns the number of bytes appended, `0` if nothing arrived in time.
    /// End of stream is reported as [`io::ErrorKind::UnexpectedEof`].
    fn read(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<usize>;

    /// Release the session. Called at most once.
    fn close(&mut self) -> io::Result<()>;
}

/// Ownership state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Holds a live session.
    Open,
    /// The session was handed to another channel.
    Taken,
    /// The session was closed.
    Closed,
}

/// Exclusive handle to a live session.
pub struct Channel {
    label: String,
    io: Option<Box<dyn ChannelIo>>,
    state: ChannelState,
    pending: Vec<u8>,
    timeout: Duration,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.label)
            .field("state", &self.state)
            .field("pending_len", &self.pending.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Channel {
    /// Wrap a live session.
    #[must_use]
    pub fn new(label: impl Into<String>, io: impl ChannelIo + 'static) -> Self {
        Self {
            label: label.into(),
            io: Some(Box::new(io)),
            state: ChannelState::Open,
            pending: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Label used in logs and errors, usually the owning machine's name.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current ownership state.
    #[must_use]
    pub const fn state(&self) -> ChannelState {
        self.state
    }

    /// Check if this channel still holds its session.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Timeout for blocking reads.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set the timeout for blocking reads.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Relabel the channel, e.g. after it was handed to a new machine.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    fn io(&mut self) -> ChannelResult<&mut Box<dyn ChannelIo>> {
        match self.state {
            ChannelState::Open => {}
            ChannelState::Taken => return Err(ChannelError::taken(&self.label)),
            ChannelState::Closed => return Err(ChannelError::closed(&self.label)),
        }
        self.io
            .as_mut()
            .ok_or_else(|| ChannelError::closed(&self.label))
    }

    fn map_io(label: &str, err: io::Error) -> ChannelError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ChannelError::closed(label)
        } else {
            ChannelError::io(label, err)
        }
    }

    /// Send raw bytes.
    pub fn send(&mut self, data: &[u8]) -> ChannelResult<()> {
        let label = self.label.clone();
        self.io()?
            .write(data)
            .map_err(|e| Self::map_io(&label, e))
    }

    /// Send `line` followed by a newline.
    ///
    /// With `read_back` the call returns only after the echo of `line` was
    /// read from the channel, so the echo does not show up in later reads.
    pub fn sendline(&mut self, line: &str, read_back: bool) -> ChannelResult<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.send(&data)?;
        if read_back {
            self.read_back(line.as_bytes())?;
        }
        Ok(())
    }

    /// Read whatever arrives within `timeout`.
    ///
    /// Returns buffered data first. An empty result means nothing arrived.
    pub fn read(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>> {
        if !self.pending.is_empty() {
            return Ok(std::mem::take(&mut self.pending));
        }
        let label = self.label.clone();
        let mut buf = Vec::new();
        self.io()?
            .read(&mut buf, timeout)
            .map_err(|e| Self::map_io(&label, e))?;
        Ok(buf)
    }

    /// Read until `needle` was received.
    ///
    /// Returns everything up to and including `needle`. Bytes after it stay
    /// buffered for the next read.
    pub fn read_until(&mut self, needle: &[u8], timeout: Duration) -> ChannelResult<Vec<u8>> {
        self.read_matching(timeout, |haystack| {
            find(haystack, needle).map(|start| start + needle.len())
        })
    }

    /// Consume the echo of a line that was just sent.
    ///
    /// Terminals insert carriage returns when they wrap long lines, so those
    /// are ignored while matching.
    fn read_back(&mut self, line: &[u8]) -> ChannelResult<()> {
        let timeout = self.timeout;
        self.read_matching(timeout, |haystack| find_echo(haystack, line))
            .map(drop)
    }

    fn read_matching<F>(&mut self, timeout: Duration, mut matcher: F) -> ChannelResult<Vec<u8>>
    where
        F: FnMut(&[u8]) -> Option<usize>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(end) = matcher(&self.pending) {
                let rest = self.pending.split_off(end);
                return Ok(std::mem::replace(&mut self.pending, rest));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::timeout(
                    &self.label,
                    timeout,
                    std::mem::take(&mut self.pending),
                ));
            }

            let label = self.label.clone();
            let mut chunk = Vec::new();
            self.io()?
                .read(&mut chunk, remaining)
                .map_err(|e| Self::map_io(&label, e))?;
            self.pending.extend_from_slice(&chunk);
        }
    }

    /// Hand the session to a new channel.
    ///
    /// This channel keeps its label but can no longer be used: every
    /// operation fails with [`ChannelError::Taken`].
    pub fn take(&mut self) -> ChannelResult<Self> {
        self.io()?;
        let io = self.io.take().ok_or_else(|| ChannelError::closed(&self.label))?;
        self.state = ChannelState::Taken;
        tracing::debug!(channel = %self.label, "Channel taken");
        Ok(Self {
            label: self.label.clone(),
            io: Some(io),
            state: ChannelState::Open,
            pending: std::mem::take(&mut self.pending),
            timeout: self.timeout,
        })
    }

    /// Close the session.
    ///
    /// Closing a channel that was taken or already closed does nothing.
    pub fn close(&mut self) -> ChannelResult<()> {
        if self.state != ChannelState::Open {
            return Ok(());
        }
        self.state = ChannelState::Closed;
        self.pending.clear();
        match self.io.take() {
            Some(mut io) => io.close().map_err(|e| Self::map_io(&self.label, e)),
            None => Ok(()),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(channel = %self.label, error = %e, "Failed to close channel");
        }
    }
}

/// Position of the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// End offset of the first echo of `needle` in `haystack`.
///
/// Terminals wrapping a long echoed line insert a carriage return, sometimes
/// preceded by a padding space or followed by the character before the wrap
/// again. Those are skipped.
fn find_echo(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    let Some(&first) = needle.first() else {
        return Some(0);
    };
    (0..haystack.len())
        .filter(|&start| haystack[start] == first)
        .find_map(|start| echo_end(haystack, start, needle, None))
}

fn echo_end(haystack: &[u8], pos: usize, needle: &[u8], prev: Option<u8>) -> Option<usize> {
    let rest = haystack.get(pos..).unwrap_or_default();
    let Some((&expected, remaining)) = needle.split_first() else {
        return Some(match (rest, prev) {
            ([b'\r', next, ..], Some(last)) if *next == last => pos + 2,
            _ => pos,
        });
    };

    if rest.first() == Some(&expected) {
        if let Some(end) = echo_end(haystack, pos + 1, remaining, Some(expected)) {
            return Some(end);
        }
    }
    match rest {
        [b' ', b'\r', ..] => echo_end(haystack, pos + 2, needle, prev),
        [b'\r', next, ..] if Some(*next) == prev => echo_end(haystack, pos + 2, needle, prev)
            .or_else(|| echo_end(haystack, pos + 1, needle, prev)),
        [b'\r', ..] => echo_end(haystack, pos + 1, needle, prev),
        _ => None,
    }
}
