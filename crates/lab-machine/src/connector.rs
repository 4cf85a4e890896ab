//! Ways of obtaining a machine's channel.
//!
//! - [`lab::LabHost`] dials a host directly over SSH.
//! - [`ssh::SshMachine`] runs `ssh` on an already connected host.
//! - [`local::LocalHost`] is a shell on this machine.

pub mod lab;
pub mod local;
pub mod ssh;
