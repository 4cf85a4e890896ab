//! Handing a machine's shell to the user.
//!
//! [`Interactive::interactive`] connects the controlling terminal to a
//! machine's channel until the user presses `Ctrl-]`, then makes sure the
//! shell still answers before returning.

use std::io::{self, Write};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;

use crate::channel::Channel;
use crate::error::{ChannelError, MachineError, Result};
use crate::machine::Host;

/// Key that ends an interactive session.
pub const ESCAPE_KEY: &str = "Ctrl-]";

/// Printed by the shell once it is back under program control.
const REACQUIRE_MARKER: &str = "LABMACHINE_REACQUIRED";

/// Split so the echo of the command does not contain the marker.
const REACQUIRE_COMMAND: &str = "echo LAB\"\"MACHINE_REACQUIRED";

/// How long one pass of the pump waits for output.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Interactive access to a machine's shell.
pub trait Interactive {
    /// Pass the controlling terminal through to the machine's channel.
    ///
    /// Blocks until the user presses `Ctrl-]`. Fails with
    /// [`MachineError::InteractiveSessionLost`] if the shell does not respond
    /// afterwards.
    fn interactive(&self) -> Result<()>;
}

impl<H: Host + ?Sized> Interactive for H {
    fn interactive(&self) -> Result<()> {
        let mut channel = self.channel()?;
        tracing::info!(machine = %self.name(), "Entering interactive session, press {ESCAPE_KEY} to leave");

        let pumped = {
            let _raw = RawMode::enable()?;
            pump(&mut channel)
        };
        match pumped {
            Ok(()) => {}
            Err(MachineError::Channel(e)) => {
                return Err(MachineError::interactive_lost(self.name(), e.to_string()));
            }
            Err(e) => return Err(e),
        }

        tracing::info!(machine = %self.name(), "Leaving interactive session");
        reacquire(&mut channel, self.name())
    }
}

/// Raw terminal mode for the lifetime of the guard.
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().map_err(|e| MachineError::io_context("enabling raw mode", e))?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            tracing::warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

fn pump(channel: &mut Channel) -> Result<()> {
    let mut stdout = io::stdout();
    loop {
        let output = channel.read(POLL_INTERVAL)?;
        if !output.is_empty() {
            stdout
                .write_all(&output)
                .and_then(|()| stdout.flush())
                .map_err(|e| MachineError::io_context("writing to terminal", e))?;
        }

        while event::poll(Duration::ZERO).map_err(|e| MachineError::io_context("polling terminal", e))? {
            let input = match event::read().map_err(|e| MachineError::io_context("reading terminal", e))? {
                Event::Key(key) if key.kind != KeyEventKind::Release => {
                    if is_escape(&key) {
                        return Ok(());
                    }
                    key_bytes(&key)
                }
                Event::Paste(text) => Some(text.into_bytes()),
                _ => None,
            };
            if let Some(bytes) = input {
                channel.send(&bytes)?;
            }
        }
    }
}

/// Check that the shell answers again after an interactive session.
pub fn reacquire(channel: &mut Channel, machine: &str) -> Result<()> {
    let timeout = channel.timeout();
    let answered = channel
        .sendline(REACQUIRE_COMMAND, false)
        .and_then(|()| channel.read_until(REACQUIRE_MARKER.as_bytes(), timeout));
    match answered {
        Ok(_) => Ok(()),
        Err(e @ (ChannelError::Timeout { .. } | ChannelError::Closed { .. })) => {
            Err(MachineError::interactive_lost(machine, e.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Check if `key` ends the interactive session.
///
/// Some terminals report `Ctrl-]` as `Ctrl-5`.
#[must_use]
pub fn is_escape(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char(']' | '5'))
}

/// Bytes a terminal sends for `key`.
#[must_use]
pub fn key_bytes(key: &KeyEvent) -> Option<Vec<u8>> {
    let seq = |s: &str| Some(s.as_bytes().to_vec());
    match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => control_byte(c).map(|b| vec![b]),
        KeyCode::Char(c) => {
            let mut bytes = Vec::with_capacity(5);
            if key.modifiers.contains(KeyModifiers::ALT) {
                bytes.push(0x1b);
            }
            let mut utf8 = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            Some(bytes)
        }
        KeyCode::Enter => seq("\r"),
        KeyCode::Tab => seq("\t"),
        KeyCode::BackTab => seq("\x1b[Z"),
        KeyCode::Backspace => Some(vec![0x7f]),
        KeyCode::Esc => Some(vec![0x1b]),
        KeyCode::Up => seq("\x1b[A"),
        KeyCode::Down => seq("\x1b[B"),
        KeyCode::Right => seq("\x1b[C"),
        KeyCode::Left => seq("\x1b[D"),
        KeyCode::Home => seq("\x1b[H"),
        KeyCode::End => seq("\x1b[F"),
        KeyCode::Insert => seq("\x1b[2~"),
        KeyCode::Delete => seq("\x1b[3~"),
        KeyCode::PageUp => seq("\x1b[5~"),
        KeyCode::PageDown => seq("\x1b[6~"),
        KeyCode::F(n @ 1..=4) => Some(vec![0x1b, b'O', b'P' + n - 1]),
        _ => None,
    }
}

fn control_byte(c: char) -> Option<u8> {
    match c {
        'a'..='z' | 'A'..='Z' => Some(c.to_ascii_lowercase() as u8 - b'a' + 1),
        '@' | ' ' | '2' => Some(0x00),
        '[' | '3' => Some(0x1b),
        '\\' | '4' => Some(0x1c),
        ']' | '5' => Some(0x1d),
        '^' | '6' => Some(0x1e),
        '_' | '7' => Some(0x1f),
        _ => None,
    }
}
