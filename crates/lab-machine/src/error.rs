//! Error types for lab-machine.
//!
//! Every failure propagates synchronously to the caller of the operation that
//! caused it. Nothing in this crate retries or silently swallows an error,
//! except cleanup in `Drop` implementations which logs instead.

use std::time::Duration;

use thiserror::Error;

/// Maximum number of pending bytes to show in a timeout message.
const MAX_PENDING_DISPLAY: usize = 200;

/// Render the tail of the bytes that were read before a timeout.
fn format_pending(pending: &[u8]) -> String {
    if pending.is_empty() {
        return "(nothing received)".to_string();
    }
    let start = pending.len().saturating_sub(MAX_PENDING_DISPLAY);
    let tail = String::from_utf8_lossy(&pending[start..]);
    if start > 0 {
        format!("... {tail:?} ({} bytes total)", pending.len())
    } else {
        format!("{tail:?}")
    }
}

/// The main error type for machine operations.
#[derive(Debug, Error)]
pub enum MachineError {
    /// Dialing or handshaking with a remote endpoint failed.
    #[error("failed to connect to {host}:{port}: {reason}")]
    Connection {
        /// The host that could not be reached.
        host: String,
        /// The port that was used.
        port: u16,
        /// The reason for the failure.
        reason: String,
    },

    /// Every configured authentication method was rejected.
    #[error("authentication failed for user '{user}': {reason}")]
    Authentication {
        /// The user that failed to authenticate.
        user: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The server's host key was unknown or did not match.
    #[error("host key verification failed for {host}: {reason}")]
    HostKey {
        /// The host whose key verification failed.
        host: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A private key is bound to a different host than the one using it.
    #[error(
        "private key {path} lives on '{key_host}' but was requested for '{target_host}'"
    )]
    CredentialMismatch {
        /// Host the key file lives on.
        key_host: String,
        /// Host the resolution was performed for.
        target_host: String,
        /// Path of the key on `key_host`.
        path: String,
    },

    /// A sentinel variant reached code that has to handle every real variant.
    #[error("unhandled variant: {what}")]
    UnhandledVariant {
        /// Description of the value that could not be handled.
        what: String,
    },

    /// The machine does not support the requested operation.
    #[error("{operation} is not supported by machine '{machine}'")]
    UnsupportedOperation {
        /// The operation that was attempted.
        operation: String,
        /// Name of the machine.
        machine: String,
    },

    /// An interactive session ended and the shell could not be reacquired.
    #[error("lost the shell of '{machine}' after interactive session: {reason}")]
    InteractiveSessionLost {
        /// Name of the machine.
        machine: String,
        /// Why reacquiring failed.
        reason: String,
    },

    /// A scope was exited more often than it was entered.
    #[error("scope of machine '{machine}' exited without a matching enter")]
    ScopeUnderflow {
        /// Name of the machine.
        machine: String,
    },

    /// The machine's channel is already borrowed by another caller.
    #[error("channel of machine '{machine}' is already in use")]
    ChannelBusy {
        /// Name of the machine.
        machine: String,
    },

    /// Channel I/O failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// An I/O error occurred with additional context.
    #[error("{context}: {source}")]
    IoWithContext {
        /// What operation was being performed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a [`Channel`](crate::channel::Channel).
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel's session was handed off to another owner.
    #[error("channel '{label}' was taken and can no longer be used")]
    Taken {
        /// Label of the channel.
        label: String,
    },

    /// The remote end closed the channel.
    #[error("channel '{label}' is closed")]
    Closed {
        /// Label of the channel.
        label: String,
    },

    /// Expected data did not arrive in time.
    #[error("timeout after {duration:?} on channel '{label}', received {}", format_pending(pending))]
    Timeout {
        /// Label of the channel.
        label: String,
        /// The timeout that elapsed.
        duration: Duration,
        /// Bytes that were read before giving up.
        pending: Vec<u8>,
    },

    /// Reading or writing the underlying stream failed.
    #[error("I/O error on channel '{label}': {source}")]
    Io {
        /// Label of the channel.
        label: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The backend (SSH library, pty) reported an error.
    #[error("channel '{label}' backend error: {reason}")]
    Backend {
        /// Label of the channel.
        label: String,
        /// The reason for the failure.
        reason: String,
    },
}

/// Result type alias for lab-machine operations.
pub type Result<T> = std::result::Result<T, MachineError>;

impl MachineError {
    /// Create a connection error.
    pub fn connection(host: impl Into<String>, port: u16, reason: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            port,
            reason: reason.into(),
        }
    }

    /// Create an authentication error.
    pub fn authentication(user: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Authentication {
            user: user.into(),
            reason: reason.into(),
        }
    }

    /// Create a host key verification error.
    pub fn host_key(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HostKey {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a credential mismatch error.
    pub fn credential_mismatch(
        key_host: impl Into<String>,
        target_host: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::CredentialMismatch {
            key_host: key_host.into(),
            target_host: target_host.into(),
            path: path.into(),
        }
    }

    /// Create an unhandled variant error.
    pub fn unhandled_variant(what: impl Into<String>) -> Self {
        Self::UnhandledVariant { what: what.into() }
    }

    /// Create an unsupported operation error.
    pub fn unsupported(operation: impl Into<String>, machine: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
            machine: machine.into(),
        }
    }

    /// Create an interactive session lost error.
    pub fn interactive_lost(machine: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InteractiveSessionLost {
            machine: machine.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an I/O error with context.
    pub fn io_context(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoWithContext {
            context: context.into(),
            source,
        }
    }

    /// Check if this is a connection-level failure.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Authentication { .. } | Self::HostKey { .. }
        )
    }

    /// Check if this error signals a programming error rather than a runtime condition.
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::UnhandledVariant { .. }
                | Self::ScopeUnderflow { .. }
                | Self::Channel(ChannelError::Taken { .. })
        )
    }
}

impl ChannelError {
    /// Create a taken error.
    pub fn taken(label: impl Into<String>) -> Self {
        Self::Taken {
            label: label.into(),
        }
    }

    /// Create a closed error.
    pub fn closed(label: impl Into<String>) -> Self {
        Self::Closed {
            label: label.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(label: impl Into<String>, duration: Duration, pending: Vec<u8>) -> Self {
        Self::Timeout {
            label: label.into(),
            duration,
            pending,
        }
    }

    /// Create an I/O error.
    pub fn io(label: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            label: label.into(),
            source,
        }
    }

    /// Create a backend error.
    pub fn backend(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Backend {
            label: label.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
