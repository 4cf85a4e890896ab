//! Directly dialed lab hosts.

use std::cell::{RefCell, RefMut};
use std::path::PathBuf;
use std::rc::Rc;

use crate::channel::Channel;
use crate::config::LabHostConfig;
use crate::connector::local::LOCAL_NAME;
use crate::error::{MachineError, Result};
use crate::machine::{Host, Machine, RefCount, borrow_channel};
use crate::transport::{SYSTEM_KNOWN_HOSTS, Transport, TransportParams, user_known_hosts};

/// A host reached over its own SSH connection.
///
/// The connection carries a shell session as the machine's channel. More
/// sessions can be opened on it with [`LabHost::open_session`], and
/// [`Host::clone_host`] yields sibling machines over the same connection.
/// Only the machine that dialed the connection closes it.
#[derive(Debug)]
pub struct LabHost {
    config: Rc<LabHostConfig>,
    transport: Rc<Transport>,
    root: bool,
    refs: RefCount,
    channel: RefCell<Channel>,
}

impl LabHost {
    /// Dial the host described by `config`.
    ///
    /// Credentials are resolved for this process's machine, so a private
    /// key bound to another machine fails with
    /// [`MachineError::CredentialMismatch`] before anything is dialed.
    pub fn connect(config: LabHostConfig) -> Result<Self> {
        let credentials = config.authenticator.resolve(Some(LOCAL_NAME))?;

        let known_hosts = vec![
            config.known_hosts.clone().unwrap_or_else(user_known_hosts),
            PathBuf::from(SYSTEM_KNOWN_HOSTS),
        ];
        let transport = Transport::connect(
            &TransportParams {
                host: &config.hostname,
                port: config.port,
                username: &config.username,
                known_hosts,
                connect_timeout: config.connect_timeout,
            },
            &credentials,
        )?;

        let config = Rc::new(config);
        let channel = match open_shell(&transport, &config) {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close) = transport.close() {
                    tracing::debug!(error = %close, "Disconnect after failed session setup");
                }
                return Err(e);
            }
        };

        Ok(Self {
            config,
            transport,
            root: true,
            refs: RefCount::new(),
            channel: RefCell::new(channel),
        })
    }

    /// Host this machine is connected to.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    /// Port this machine is connected to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Check if the connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Open another shell session over this machine's connection.
    pub fn open_session(&self) -> Result<Channel> {
        open_shell(&self.transport, &self.config)
    }
}

fn open_shell(transport: &Rc<Transport>, config: &LabHostConfig) -> Result<Channel> {
    let mut channel = transport.open_session(config.machine_name(), &config.term)?;
    channel.set_timeout(config.channel_timeout);
    Ok(channel)
}

impl Machine for LabHost {
    fn name(&self) -> &str {
        self.config.machine_name()
    }

    fn refs(&self) -> &RefCount {
        &self.refs
    }

    fn destroy(&self) -> Result<()> {
        let closed = borrow_channel(&self.channel, self.name())?
            .close()
            .map_err(MachineError::from);
        if self.root {
            self.transport.close()?;
        }
        closed
    }
}

impl Host for LabHost {
    fn username(&self) -> &str {
        &self.config.username
    }

    fn channel(&self) -> Result<RefMut<'_, Channel>> {
        borrow_channel(&self.channel, self.name())
    }

    fn clone_host(&self) -> Result<Box<dyn Host>> {
        let channel = self.open_session()?;
        Ok(Box::new(Self {
            config: Rc::clone(&self.config),
            transport: Rc::clone(&self.transport),
            root: false,
            refs: RefCount::new(),
            channel: RefCell::new(channel),
        }))
    }
}
