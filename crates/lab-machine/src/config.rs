//! Machine descriptions and environment overrides.
//!
//! Every connector takes a plain config struct. The structs deserialize from
//! TOML so a whole lab can be described in one file:
//!
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [[lab]]
//! hostname = "lab.example.com"
//! username = "ci"
//! authenticator = { kind = "private_key", key = "/home/ci/.ssh/id_ed25519" }
//!
//! [[ssh]]
//! hostname = "board-1"
//! username = "root"
//! ssh_config = ["ConnectTimeout=5"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Authenticator;
use crate::channel::DEFAULT_TIMEOUT;
use crate::error::{MachineError, Result};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default timeout for dialing a remote endpoint.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default local shell program.
pub const DEFAULT_SHELL: &str = "bash";

/// Prefix of the environment variables read by [`EnvOverrides`].
pub const ENV_PREFIX: &str = "LABMACHINE";

/// Default terminal type requested for shells.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Terminal width of shells opened by the crate.
///
/// Wide enough that typed command lines are not wrapped by the shell.
pub const DEFAULT_TERMINAL_WIDTH: u16 = 4096;

/// Default terminal height.
pub const DEFAULT_TERMINAL_HEIGHT: u16 = 24;

const fn default_port() -> u16 {
    DEFAULT_PORT
}

const fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

const fn default_channel_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_lab_authenticator() -> Authenticator {
    Authenticator::default_key()
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

fn default_shell_args() -> Vec<String> {
    vec!["--norc".to_string(), "--noprofile".to_string()]
}

fn default_term() -> String {
    DEFAULT_TERM.to_string()
}

/// Name of the user running this process.
///
/// Falls back to `root` when neither `USER` nor `USERNAME` is set.
#[must_use]
pub fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

/// Settings of a [`LabHost`](crate::connector::lab::LabHost).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabHostConfig {
    /// Name of the machine, defaults to the hostname.
    #[serde(default)]
    pub name: Option<String>,
    /// Host to dial.
    pub hostname: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// User to log in as.
    #[serde(default = "local_username")]
    pub username: String,
    /// How to authenticate.
    #[serde(default = "default_lab_authenticator")]
    pub authenticator: Authenticator,
    /// Known hosts file checked before the system-wide one.
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
    /// Timeout for dialing and the SSH handshake.
    #[serde(default = "default_connect_timeout", with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Timeout for blocking channel reads.
    #[serde(default = "default_channel_timeout", with = "duration_secs")]
    pub channel_timeout: Duration,
    /// Terminal type requested for the shell session.
    #[serde(default = "default_term")]
    pub term: String,
}

impl LabHostConfig {
    /// Create a configuration for `hostname` with every other field defaulted.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            name: None,
            hostname: hostname.into(),
            port: DEFAULT_PORT,
            username: local_username(),
            authenticator: default_lab_authenticator(),
            known_hosts: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            channel_timeout: DEFAULT_TIMEOUT,
            term: default_term(),
        }
    }

    /// Set the machine name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the authenticator.
    #[must_use]
    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Set the known hosts file.
    #[must_use]
    pub fn known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Name the machine will carry.
    #[must_use]
    pub fn machine_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.hostname)
    }

    /// Apply environment overrides.
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvOverrides) -> Self {
        if let Some(path) = &env.known_hosts {
            self.known_hosts = Some(path.clone());
        }
        self
    }
}

/// Settings of an [`SshMachine`](crate::connector::ssh::SshMachine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConnectorConfig {
    /// Name of the machine, defaults to the hostname.
    #[serde(default)]
    pub name: Option<String>,
    /// Host to reach from the upstream host.
    pub hostname: String,
    /// User to log in as, defaults to the upstream host's user.
    #[serde(default)]
    pub username: Option<String>,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Extra `-o` options for the ssh client, in order.
    #[serde(default)]
    pub ssh_config: Vec<String>,
    /// Skip host key verification.
    #[serde(default)]
    pub ignore_hostkey: bool,
    /// How to authenticate.
    #[serde(default)]
    pub authenticator: Authenticator,
    /// Timeout for blocking channel reads.
    #[serde(default = "default_channel_timeout", with = "duration_secs")]
    pub channel_timeout: Duration,
}

impl SshConnectorConfig {
    /// Create a configuration for `hostname` with every other field defaulted.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            name: None,
            hostname: hostname.into(),
            username: None,
            port: DEFAULT_PORT,
            ssh_config: Vec::new(),
            ignore_hostkey: false,
            authenticator: Authenticator::None,
            channel_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the machine name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the username.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Append an ssh client option.
    #[must_use]
    pub fn ssh_option(mut self, option: impl Into<String>) -> Self {
        self.ssh_config.push(option.into());
        self
    }

    /// Skip host key verification.
    #[must_use]
    pub const fn ignore_hostkey(mut self, ignore: bool) -> Self {
        self.ignore_hostkey = ignore;
        self
    }

    /// Set the authenticator.
    #[must_use]
    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Name the machine will carry.
    #[must_use]
    pub fn machine_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.hostname)
    }
}

/// Settings of the [`LocalHost`](crate::connector::local::LocalHost).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalHostConfig {
    /// Shell program.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Arguments of the shell program.
    #[serde(default = "default_shell_args")]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Timeout for blocking channel reads.
    #[serde(default = "default_channel_timeout", with = "duration_secs")]
    pub channel_timeout: Duration,
}

impl Default for LocalHostConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            args: default_shell_args(),
            env: Vec::new(),
            channel_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl LocalHostConfig {
    /// Apply environment overrides.
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvOverrides) -> Self {
        if let Some(shell) = &env.shell {
            self.shell.clone_from(shell);
        }
        self
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Settings of the log subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Include the event target.
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            target: true,
        }
    }
}

impl LoggingConfig {
    /// Apply environment overrides.
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvOverrides) -> Self {
        if let Some(level) = &env.log {
            self.level.clone_from(level);
        }
        self
    }
}

/// A file describing a lab.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachinesFile {
    /// Log settings.
    pub logging: LoggingConfig,
    /// Local shell settings.
    pub local: LocalHostConfig,
    /// Directly dialed hosts.
    pub lab: Vec<LabHostConfig>,
    /// Hosts reached through another host.
    pub ssh: Vec<SshConnectorConfig>,
}

impl MachinesFile {
    /// Parse a TOML description.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| MachineError::config(e.to_string()))
    }

    /// Load a TOML description from `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MachineError::io_context(format!("reading {}", path.display()), e))?;
        Self::from_toml_str(&content)
    }

    /// Apply environment overrides to every section.
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvOverrides) -> Self {
        self.logging = self.logging.with_overrides(env);
        self.local = self.local.with_overrides(env);
        self.lab = self
            .lab
            .into_iter()
            .map(|lab| lab.with_overrides(env))
            .collect();
        self
    }

    /// Look up a directly dialed host by machine name.
    #[must_use]
    pub fn lab(&self, name: &str) -> Option<&LabHostConfig> {
        self.lab.iter().find(|lab| lab.machine_name() == name)
    }

    /// Look up a chained host by machine name.
    #[must_use]
    pub fn ssh(&self, name: &str) -> Option<&SshConnectorConfig> {
        self.ssh.iter().find(|ssh| ssh.machine_name() == name)
    }
}

/// Settings taken from `LABMACHINE_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// `LABMACHINE_KNOWN_HOSTS`: known hosts file.
    pub known_hosts: Option<PathBuf>,
    /// `LABMACHINE_LOG`: log filter directive.
    pub log: Option<String>,
    /// `LABMACHINE_SHELL`: local shell program.
    pub shell: Option<String>,
}

impl EnvOverrides {
    /// Read overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read overrides through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}_{name}")).filter(|value| !value.is_empty())
        };
        Self {
            known_hosts: get("KNOWN_HOSTS").map(PathBuf::from),
            log: get("LOG"),
            shell: get("SHELL"),
        }
    }
}

/// Durations as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::KeySource;

    #[test]
    fn ssh_defaults() {
        let config = SshConnectorConfig::new("board");
        assert_eq!(config.port, 22);
        assert!(config.ssh_config.is_empty());
        assert!(!config.ignore_hostkey);
        assert_eq!(config.authenticator, Authenticator::None);
        assert_eq!(config.machine_name(), "board");
    }

    #[test]
    fn lab_defaults_to_user_key() {
        let config = LabHostConfig::new("lab.example.com");
        assert_eq!(config.port, 22);
        assert!(matches!(config.authenticator, Authenticator::PrivateKey { .. }));
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn parse_machines_file() {
        let file = MachinesFile::from_toml_str(
            r#"
            [logging]
            level = "debug"
            format = "json"

            [[lab]]
            name = "lab"
            hostname = "lab.example.com"
            port = 2222
            username = "ci"
            authenticator = { kind = "password", password = "hunter2" }
            connect_timeout = 5

            [[ssh]]
            hostname = "board-1"
            ssh_config = ["ConnectTimeout=5", "ServerAliveInterval=10"]
            ignore_hostkey = true
            authenticator = { kind = "private_key", key = { host = "lab", path = "/home/ci/.ssh/id_rsa" } }
            "#,
        )
        .unwrap();

        assert_eq!(file.logging.level, "debug");
        assert_eq!(file.logging.format, LogFormat::Json);

        let lab = file.lab("lab").unwrap();
        assert_eq!(lab.port, 2222);
        assert_eq!(lab.connect_timeout, Duration::from_secs(5));
        assert_eq!(lab.channel_timeout, DEFAULT_TIMEOUT);
        assert_eq!(lab.authenticator, Authenticator::password("hunter2"));

        let board = file.ssh("board-1").unwrap();
        assert_eq!(board.port, 22);
        assert_eq!(board.username, None);
        assert_eq!(board.ssh_config, ["ConnectTimeout=5", "ServerAliveInterval=10"]);
        assert!(board.ignore_hostkey);
        assert_eq!(
            board.authenticator,
            Authenticator::remote_private_key("lab", "/home/ci/.ssh/id_rsa")
        );
    }

    #[test]
    fn plain_key_string_is_local() {
        let file = MachinesFile::from_toml_str(
            r#"
            [[ssh]]
            hostname = "board"
            authenticator = { kind = "private_key", key = "/keys/board" }
            "#,
        )
        .unwrap();
        assert_eq!(
            file.ssh[0].authenticator,
            Authenticator::PrivateKey {
                key: KeySource::Local("/keys/board".into())
            }
        );
    }

    #[test]
    fn unknown_authenticator_kind_is_undefined() {
        let file = MachinesFile::from_toml_str(
            r#"
            [[ssh]]
            hostname = "board"
            authenticator = { kind = "kerberos" }
            "#,
        )
        .unwrap();
        assert_eq!(file.ssh[0].authenticator, Authenticator::Undefined);
    }

    #[test]
    fn missing_hostname_is_config_error() {
        let err = MachinesFile::from_toml_str("[[ssh]]\nport = 22\n").unwrap_err();
        assert!(matches!(err, MachineError::Config { .. }));
    }

    #[test]
    fn missing_file_has_context() {
        let err = MachinesFile::from_path("/nonexistent/lab.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/lab.toml"));
    }

    #[test]
    fn env_overrides() {
        let env = EnvOverrides::from_lookup(|name| match name {
            "LABMACHINE_KNOWN_HOSTS" => Some("/tmp/known_hosts".to_string()),
            "LABMACHINE_LOG" => Some("trace".to_string()),
            "LABMACHINE_SHELL" => Some(String::new()),
            _ => None,
        });
        assert_eq!(env.known_hosts.as_deref(), Some(Path::new("/tmp/known_hosts")));
        assert_eq!(env.shell, None);

        let file = MachinesFile {
            lab: vec![LabHostConfig::new("lab")],
            ..MachinesFile::default()
        }
        .with_overrides(&env);
        assert_eq!(file.logging.level, "trace");
        assert_eq!(file.local.shell, DEFAULT_SHELL);
        assert_eq!(
            file.lab[0].known_hosts.as_deref(),
            Some(Path::new("/tmp/known_hosts"))
        );
    }
}
