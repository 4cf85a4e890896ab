//! lab-machine: connection lifecycle for nested lab machines
//!
//! A *machine* is a reference-counted handle to a shell on some endpoint:
//! this computer, a lab host dialed over SSH, or a board that is only
//! reachable by running `ssh` on one of those. Machines are entered as
//! scopes; the outermost exit tears the connection down.
//!
//! # Example
//!
//! ```no_run
//! use lab_machine::{Host, LabHost, LabHostConfig, Machine, SshConnectorConfig, SshMachine};
//!
//! # fn main() -> lab_machine::Result<()> {
//! let lab = LabHost::connect(LabHostConfig::new("lab.example.com").username("ci"))?;
//! let lab_scope = lab.enter();
//!
//! let board = SshMachine::connect(SshConnectorConfig::new("board-1").username("root"), Some(&lab))?;
//! let board_scope = board.enter();
//! board.channel()?.sendline("uname -a", true)?;
//!
//! board_scope.exit()?;
//! lab_scope.exit()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod config;
pub mod connector;
pub mod error;
pub mod interactive;
pub mod logging;
pub mod machine;
pub mod shell;
pub mod transport;

pub use auth::{Authenticator, Credentials, KeySource, RemotePath};
pub use channel::{Channel, ChannelIo, ChannelState};
pub use config::{
    EnvOverrides, LabHostConfig, LocalHostConfig, LogFormat, LoggingConfig, MachinesFile,
    SshConnectorConfig,
};
pub use connector::lab::LabHost;
pub use connector::local::{LOCAL_NAME, LocalHost, acquire_local};
pub use connector::ssh::{SshMachine, tunnel_command};
pub use error::{ChannelError, MachineError, Result};
pub use interactive::Interactive;
pub use machine::{Host, Machine, RefCount, Scope};

// Test utilities
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(any(test, feature = "test-utils"))]
pub use test_utils::{MockChannel, MockHost, MockRecord};
