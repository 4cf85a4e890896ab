//! Machines reached by running `ssh` on another machine.
//!
//! An [`SshMachine`] does not dial anything itself. It clones an already
//! connected upstream host, types an `ssh` command into the clone's shell and
//! takes over the clone's channel, which from then on talks to the new
//! machine. Chaining these reaches hosts only visible from inside a lab.

use std::cell::{RefCell, RefMut};
use std::fmt;

use crate::auth::{Authenticator, Credentials};
use crate::channel::Channel;
use crate::config::SshConnectorConfig;
use crate::connector::local::acquire_local;
use crate::error::{MachineError, Result};
use crate::machine::{Host, Machine, RefCount, Scope, borrow_channel};

const REDACTED: &str = "<redacted>";

/// A machine tunneled through an upstream host.
///
/// The upstream host is borrowed, never destroyed by this machine.
pub struct SshMachine<'h> {
    config: SshConnectorConfig,
    host: &'h dyn Host,
    username: String,
    refs: RefCount,
    channel: RefCell<Channel>,
}

impl fmt::Debug for SshMachine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshMachine")
            .field("name", &self.name())
            .field("host", &self.host.name())
            .field("username", &self.username)
            .field("channel", &self.channel)
            .finish()
    }
}

/// The upstream host to tunnel through: `host`, or the default local machine.
///
/// The default local machine is per thread, see
/// [`acquire_local`](crate::connector::local::acquire_local). Every thread
/// tunneling without an explicit host starts its own local shell, which
/// lives until the process exits.
pub fn upstream(host: Option<&dyn Host>) -> Result<&dyn Host> {
    match host {
        Some(host) => Ok(host),
        None => Ok(acquire_local()?),
    }
}

/// Arguments of the `ssh` invocation run on the machine named `runner`.
///
/// Private keys are resolved for `runner`, the machine the client runs on.
/// Passwords are never part of the arguments: `sshpass -e` reads them from
/// the `SSHPASS` environment variable.
pub fn tunnel_command(
    config: &SshConnectorConfig,
    username: &str,
    runner: &str,
) -> Result<Vec<String>> {
    let mut args: Vec<String> = match config.authenticator.resolve(Some(runner))? {
        Credentials::Ambient => vec!["ssh".into(), "-o".into(), "BatchMode=yes".into()],
        Credentials::KeyFile(key) => vec![
            "ssh".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-i".into(),
            key,
        ],
        Credentials::Password(_) => vec!["sshpass".into(), "-e".into(), "ssh".into()],
    };

    if config.ignore_hostkey {
        args.extend(
            ["-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null"]
                .map(String::from),
        );
    }
    args.push("-p".into());
    args.push(config.port.to_string());
    for option in &config.ssh_config {
        args.push("-o".into());
        args.push(option.clone());
    }
    args.push(format!("{username}@{}", config.hostname));
    Ok(args)
}

impl<'h> SshMachine<'h> {
    /// Connect through `host`, or the default local machine if `None`.
    ///
    /// Only issues the `ssh` command. Unreachable hosts, rejected keys and
    /// failed logins show up once the channel is used.
    pub fn connect(config: SshConnectorConfig, host: Option<&'h dyn Host>) -> Result<Self> {
        let host = upstream(host)?;
        let username = config
            .username
            .clone()
            .unwrap_or_else(|| host.username().to_string());

        let clone = host.clone_host()?;
        let scope = Scope::enter(&*clone);
        let mut channel = tunnel(&*clone, &config, &username)?;
        scope.exit()?;

        channel.set_label(config.machine_name());
        channel.set_timeout(config.channel_timeout);
        tracing::debug!(
            machine = %config.machine_name(),
            host = %host.name(),
            "Tunneled through upstream host"
        );

        Ok(Self {
            config,
            host,
            username,
            refs: RefCount::new(),
            channel: RefCell::new(channel),
        })
    }

    /// The upstream host.
    #[must_use]
    pub fn host(&self) -> &'h dyn Host {
        self.host
    }

    /// The configuration this machine was connected with.
    #[must_use]
    pub const fn config(&self) -> &SshConnectorConfig {
        &self.config
    }
}

/// Start the ssh client on `runner` and take its channel.
fn tunnel(runner: &dyn Host, config: &SshConnectorConfig, username: &str) -> Result<Channel> {
    let args = tunnel_command(config, username, runner.name())?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut command = runner.escape(&args);
    let mut logged = command.clone();
    if let Authenticator::Password { password } = &config.authenticator {
        command = format!("SSHPASS={} {command}", runner.escape(&[password.as_str()]));
        logged = format!("SSHPASS={REDACTED} {logged}");
    }
    tracing::info!(machine = %runner.name(), command = %logged, "command");

    let mut channel = runner.channel()?;
    channel.sendline(&format!("{command}; exit"), true)?;
    Ok(channel.take()?)
}

impl Machine for SshMachine<'_> {
    fn name(&self) -> &str {
        self.config.machine_name()
    }

    fn refs(&self) -> &RefCount {
        &self.refs
    }

    fn destroy(&self) -> Result<()> {
        borrow_channel(&self.channel, self.name())?
            .close()
            .map_err(MachineError::from)
    }
}

impl Host for SshMachine<'_> {
    fn username(&self) -> &str {
        &self.username
    }

    fn escape(&self, args: &[&str]) -> String {
        self.host.escape(args)
    }

    fn channel(&self) -> Result<RefMut<'_, Channel>> {
        borrow_channel(&self.channel, self.name())
    }

    fn clone_host(&self) -> Result<Box<dyn Host>> {
        Err(MachineError::unsupported("clone", self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockHost;

    fn args(config: &SshConnectorConfig) -> Vec<String> {
        tunnel_command(config, "user", "lab").unwrap()
    }

    #[test]
    fn default_command() {
        assert_eq!(
            args(&SshConnectorConfig::new("host")),
            ["ssh", "-o", "BatchMode=yes", "-p", "22", "user@host"]
        );
    }

    #[test]
    fn options_keep_their_order() {
        let config = SshConnectorConfig::new("board")
            .port(2222)
            .ssh_option("ProxyJump=foo@example.com")
            .ssh_option("ConnectTimeout=5")
            .ignore_hostkey(true);
        assert_eq!(
            args(&config),
            [
                "ssh",
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-p",
                "2222",
                "-o",
                "ProxyJump=foo@example.com",
                "-o",
                "ConnectTimeout=5",
                "user@board",
            ]
        );
    }

    #[test]
    fn private_key_is_passed() {
        let config = SshConnectorConfig::new("board")
            .authenticator(Authenticator::private_key("/home/user/.ssh/id_board"));
        assert_eq!(
            args(&config),
            [
                "ssh",
                "-o",
                "BatchMode=yes",
                "-i",
                "/home/user/.ssh/id_board",
                "-p",
                "22",
                "user@board"
            ]
        );
    }

    #[test]
    fn key_must_live_on_the_runner() {
        let config = SshConnectorConfig::new("board")
            .authenticator(Authenticator::remote_private_key("lab", "/home/user/.ssh/id_board"));
        assert!(args(&config).contains(&"/home/user/.ssh/id_board".to_string()));

        let err = tunnel_command(&config, "user", "other").unwrap_err();
        assert!(matches!(err, MachineError::CredentialMismatch { .. }));
    }

    #[test]
    fn password_uses_sshpass() {
        let config =
            SshConnectorConfig::new("board").authenticator(Authenticator::password("hunter2"));
        assert_eq!(
            args(&config),
            ["sshpass", "-e", "ssh", "-p", "22", "user@board"]
        );
    }

    #[test]
    fn password_is_passed_in_the_environment() {
        let lab = MockHost::new("lab", "user");
        let config =
            SshConnectorConfig::new("board").authenticator(Authenticator::password("hunter2"));
        SshMachine::connect(config, Some(&lab)).unwrap();
        assert_eq!(
            lab.record().clones()[0].written_str(),
            "SSHPASS=hunter2 sshpass -e ssh -p 22 'user@board'; exit\n"
        );
    }

    #[test]
    fn undefined_authenticator_is_unhandled() {
        let config = SshConnectorConfig::new("board").authenticator(Authenticator::Undefined);
        let err = tunnel_command(&config, "user", "lab").unwrap_err();
        assert!(matches!(err, MachineError::UnhandledVariant { .. }));
    }

    #[test]
    fn connect_sends_command_on_a_clone() {
        let lab = MockHost::new("lab", "user");
        let board = SshMachine::connect(SshConnectorConfig::new("host"), Some(&lab)).unwrap();

        let record = lab.record();
        let clones = record.clones();
        assert_eq!(clones.len(), 1);
        assert_eq!(clones[0].written_str(), "ssh -o BatchMode=yes -p 22 'user@host'; exit\n");

        // The upstream host's own channel is untouched.
        assert!(lab.backend().written().is_empty());
        assert!(lab.channel().unwrap().is_live());

        // The clone is gone, its session lives on in the new machine.
        assert_eq!(record.destroys(), 1);
        assert_eq!(clones[0].close_count(), 0);
        assert_eq!(board.name(), "host");
        assert_eq!(board.username(), "user");
        assert_eq!(board.channel().unwrap().label(), "host");

        board.channel().unwrap().send(b"uname\n").unwrap();
        assert!(clones[0].written_str().ends_with("uname\n"));

        let scope = board.enter();
        scope.exit().unwrap();
        assert_eq!(clones[0].close_count(), 1);
        assert_eq!(record.destroys(), 1);
    }

    #[test]
    fn username_overrides_upstream_user() {
        let lab = MockHost::new("lab", "ci");
        let config = SshConnectorConfig::new("board").username("root").port(2022);
        let board = SshMachine::connect(config, Some(&lab)).unwrap();
        assert_eq!(board.username(), "root");
        assert_eq!(
            lab.record().clones()[0].written_str(),
            "ssh -o BatchMode=yes -p 2022 'root@board'; exit\n"
        );
    }

    #[test]
    fn failed_command_still_discards_clone() {
        let lab = MockHost::new("lab", "user");
        let config = SshConnectorConfig::new("board").authenticator(Authenticator::Undefined);
        let err = SshMachine::connect(config, Some(&lab)).unwrap_err();

        assert!(err.is_contract_violation());
        let record = lab.record();
        assert_eq!(record.destroys(), 1);
        assert!(record.clones()[0].written().is_empty());
        assert_eq!(record.clones()[0].close_count(), 1);
    }

    #[test]
    fn tunneled_machine_cannot_be_cloned() {
        let lab = MockHost::new("lab", "user");
        let board = SshMachine::connect(SshConnectorConfig::new("board"), Some(&lab)).unwrap();
        let Err(err) = board.clone_host() else {
            panic!("tunneled machine was cloned");
        };
        assert!(matches!(err, MachineError::UnsupportedOperation { .. }));
        assert_eq!(lab.record().clones().len(), 1);
    }

    #[test]
    fn chains_through_tunneled_machines() {
        let lab = MockHost::new("lab", "user");
        let jump = SshMachine::connect(SshConnectorConfig::new("jump"), Some(&lab)).unwrap();
        // Tunneling needs a clone of the upstream host, which a tunneled
        // machine cannot provide.
        let err = SshMachine::connect(SshConnectorConfig::new("board"), Some(&jump)).unwrap_err();
        assert!(matches!(err, MachineError::UnsupportedOperation { .. }));
    }

    #[test]
    fn default_upstream_is_local() {
        let local = acquire_local().unwrap();
        let host = upstream(None).unwrap();
        assert!(std::ptr::addr_eq(host, local as &dyn Host));

        let lab = MockHost::new("lab", "user");
        assert_eq!(upstream(Some(&lab)).unwrap().name(), "lab");
    }
}
