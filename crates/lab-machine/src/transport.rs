//! SSH transport for directly dialed hosts.
//!
//! A [`Transport`] is one russh client connection driven from blocking code
//! through a private tokio runtime. Any number of shell sessions can be
//! multiplexed over it with [`Transport::open_session`]; each becomes the
//! backend of its own [`Channel`].

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use russh::client::{self, Msg};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use tokio::runtime::{Builder, Runtime};

use crate::auth::Credentials;
use crate::channel::{Channel, ChannelIo};
use crate::config::{DEFAULT_PORT, DEFAULT_TERMINAL_HEIGHT, DEFAULT_TERMINAL_WIDTH};
use crate::error::{ChannelError, MachineError, Result};

/// System-wide known hosts file.
pub const SYSTEM_KNOWN_HOSTS: &str = "/etc/ssh/ssh_known_hosts";

/// The user's known hosts file, `~/.ssh/known_hosts`.
#[must_use]
pub fn user_known_hosts() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".ssh")
        .join("known_hosts")
}

/// Result of looking a server key up in a known hosts file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHost {
    /// An entry for the host lists this key.
    Match,
    /// Entries for the host exist but list a different key.
    Mismatch,
    /// No entry for the host.
    Unknown,
}

/// Look `key` up for `host:port` in the contents of a known hosts file.
///
/// Hashed host names and marker lines are not supported and are skipped.
#[must_use]
pub fn lookup_known_host(contents: &str, host: &str, port: u16, key: &PublicKey) -> KnownHost {
    let pattern = if port == DEFAULT_PORT {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    };

    let mut seen = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(hosts), Some(_key_type), Some(key_data)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };

        if !hosts.split(',').any(|h| h == pattern) {
            continue;
        }

        let Ok(stored) = russh::keys::parse_public_key_base64(key_data) else {
            tracing::debug!(host, "Unparseable key in known hosts");
            continue;
        };
        if stored.fingerprint(HashAlg::Sha256) == key.fingerprint(HashAlg::Sha256) {
            return KnownHost::Match;
        }
        seen = true;
    }

    if seen { KnownHost::Mismatch } else { KnownHost::Unknown }
}

/// russh client handler verifying server keys against known hosts files.
struct KnownHostsHandler {
    host: String,
    port: u16,
    files: Vec<PathBuf>,
    rejection: Arc<Mutex<Option<String>>>,
}

impl KnownHostsHandler {
    fn reject(&self, reason: String) {
        *self.rejection.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }
}

impl client::Handler for KnownHostsHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        for file in &self.files {
            let contents = match std::fs::read_to_string(file) {
                Ok(contents) => contents,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "Failed to read known hosts");
                    continue;
                }
            };

            match lookup_known_host(&contents, &self.host, self.port, server_public_key) {
                KnownHost::Match => {
                    tracing::debug!(host = %self.host, path = %file.display(), "Host key verified");
                    return Ok(true);
                }
                KnownHost::Mismatch => {
                    tracing::error!(
                        host = %self.host,
                        path = %file.display(),
                        "HOST KEY MISMATCH! Possible man-in-the-middle attack!"
                    );
                    self.reject(format!("key does not match the entry in {}", file.display()));
                    return Ok(false);
                }
                KnownHost::Unknown => {}
            }
        }

        tracing::warn!(host = %self.host, "Host not found in known hosts");
        self.reject("host is not in any known hosts file".to_string());
        Ok(false)
    }
}

/// Parameters for dialing a transport.
#[derive(Debug, Clone)]
pub struct TransportParams<'a> {
    /// Host to dial.
    pub host: &'a str,
    /// Port to dial.
    pub port: u16,
    /// User to log in as.
    pub username: &'a str,
    /// Known hosts files, checked in order.
    pub known_hosts: Vec<PathBuf>,
    /// Timeout for dialing and the handshake.
    pub connect_timeout: Duration,
}

/// An authenticated SSH connection.
pub struct Transport {
    runtime: Runtime,
    handle: RefCell<Option<client::Handle<KnownHostsHandler>>>,
    host: String,
    port: u16,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Transport {
    /// Dial, verify the host key and authenticate.
    ///
    /// A connection that fails authentication is disconnected before the
    /// error is returned.
    pub fn connect(params: &TransportParams<'_>, credentials: &Credentials) -> Result<Rc<Self>> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|e| MachineError::io_context("creating tokio runtime", e))?;

        let rejection = Arc::new(Mutex::new(None));
        let handler = KnownHostsHandler {
            host: params.host.to_string(),
            port: params.port,
            files: params.known_hosts.clone(),
            rejection: Arc::clone(&rejection),
        };

        tracing::info!(host = %params.host, port = params.port, "Connecting to SSH server");

        let connected = runtime.block_on(async {
            tokio::time::timeout(
                params.connect_timeout,
                client::connect(
                    Arc::new(client::Config::default()),
                    (params.host, params.port),
                    handler,
                ),
            )
            .await
        });

        let mut handle = match connected {
            Err(_) => {
                return Err(MachineError::connection(
                    params.host,
                    params.port,
                    format!("timed out after {:?}", params.connect_timeout),
                ));
            }
            Ok(Err(russh::Error::UnknownKey)) => {
                let reason = rejection
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .unwrap_or_else(|| "server key rejected".to_string());
                return Err(MachineError::host_key(params.host, reason));
            }
            Ok(Err(e)) => {
                return Err(MachineError::connection(params.host, params.port, e.to_string()));
            }
            Ok(Ok(handle)) => handle,
        };

        tracing::debug!(user = %params.username, "Authenticating with SSH server");
        if let Err(e) = runtime.block_on(authenticate(&mut handle, params.username, credentials)) {
            if let Err(disconnect) =
                runtime.block_on(handle.disconnect(Disconnect::ByApplication, "", "en"))
            {
                tracing::debug!(error = %disconnect, "Disconnect after failed authentication");
            }
            return Err(e);
        }

        tracing::info!(host = %params.host, user = %params.username, "SSH connection established");

        Ok(Rc::new(Self {
            runtime,
            handle: RefCell::new(Some(handle)),
            host: params.host.to_string(),
            port: params.port,
        }))
    }

    /// Check if the connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.handle
            .try_borrow()
            .map(|handle| handle.is_some())
            .unwrap_or(true)
    }

    /// Open a shell session with a pseudo-terminal.
    pub fn open_session(self: &Rc<Self>, label: &str, term: &str) -> Result<Channel> {
        let mut handle = self.handle.borrow_mut();
        let handle = handle
            .as_mut()
            .ok_or_else(|| MachineError::connection(&self.host, self.port, "transport is closed"))?;

        let session = self
            .runtime
            .block_on(async {
                let mut session = handle.channel_open_session().await?;
                start_shell(&mut session, term).await?;
                Ok::<_, russh::Error>(session)
            })
            .map_err(|e| ChannelError::backend(label, format!("opening shell session: {e}")))?;

        tracing::debug!(host = %self.host, channel = label, "Opened shell session");

        Ok(Channel::new(
            label,
            SessionIo {
                transport: Rc::clone(self),
                session,
                eof: false,
            },
        ))
    }

    /// Disconnect. Closing twice does nothing.
    pub fn close(&self) -> Result<()> {
        let Some(handle) = self.handle.borrow_mut().take() else {
            return Ok(());
        };
        tracing::debug!(host = %self.host, port = self.port, "Disconnecting");
        self.runtime
            .block_on(handle.disconnect(Disconnect::ByApplication, "", "en"))
            .map_err(|e| MachineError::connection(&self.host, self.port, format!("disconnect: {e}")))
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(host = %self.host, error = %e, "Failed to disconnect");
        }
    }
}

async fn start_shell(
    session: &mut russh::Channel<Msg>,
    term: &str,
) -> std::result::Result<(), russh::Error> {
    session
        .request_pty(
            false,
            term,
            DEFAULT_TERMINAL_WIDTH.into(),
            DEFAULT_TERMINAL_HEIGHT.into(),
            0,
            0,
            &[],
        )
        .await?;
    session.request_shell(false).await
}

async fn authenticate(
    handle: &mut client::Handle<KnownHostsHandler>,
    username: &str,
    credentials: &Credentials,
) -> Result<()> {
    let accepted = match credentials {
        Credentials::Password(password) => handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| MachineError::authentication(username, e.to_string()))?
            .success(),
        Credentials::KeyFile(path) => {
            let key = load_key(Path::new(path), username)?;
            let rsa_hash = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
            handle
                .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash))
                .await
                .map_err(|e| MachineError::authentication(username, e.to_string()))?
                .success()
        }
        Credentials::Ambient => authenticate_agent(handle, username).await?,
    };

    if accepted {
        tracing::info!(user = %username, "Authentication successful");
        Ok(())
    } else {
        Err(MachineError::authentication(username, "rejected by server"))
    }
}

fn load_key(path: &Path, username: &str) -> Result<russh::keys::PrivateKey> {
    tracing::debug!(user = %username, key = %path.display(), "Loading private key");
    russh::keys::load_secret_key(path, None).map_err(|e| {
        MachineError::authentication(username, format!("failed to load key {}: {e}", path.display()))
    })
}

#[cfg(unix)]
async fn authenticate_agent(
    handle: &mut client::Handle<KnownHostsHandler>,
    username: &str,
) -> Result<bool> {
    let mut agent = russh::keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| MachineError::authentication(username, format!("no ssh agent: {e}")))?;
    let keys = agent
        .request_identities()
        .await
        .map_err(|e| MachineError::authentication(username, format!("ssh agent: {e}")))?;
    tracing::debug!(user = %username, key_count = keys.len(), "Found keys in SSH agent");

    for key in keys {
        let rsa_hash = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
        match handle
            .authenticate_publickey_with(username, key.clone(), rsa_hash, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => {
                tracing::debug!(user = %username, key_type = %key.algorithm().as_str(), "Agent key rejected");
            }
            Err(e) => {
                tracing::debug!(user = %username, error = %e, "Agent authentication error");
            }
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_agent(
    _handle: &mut client::Handle<KnownHostsHandler>,
    username: &str,
) -> Result<bool> {
    Err(MachineError::authentication(
        username,
        "ssh agent authentication is not supported on this platform",
    ))
}

/// Channel backend of an SSH shell session.
struct SessionIo {
    transport: Rc<Transport>,
    session: russh::Channel<Msg>,
    eof: bool,
}

fn backend_error(e: &russh::Error) -> io::Error {
    io::Error::other(e.to_string())
}

impl ChannelIo for SessionIo {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let Self {
            transport, session, ..
        } = self;
        transport
            .runtime
            .block_on(session.data(data))
            .map_err(|e| backend_error(&e))
    }

    fn read(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<usize> {
        if self.eof {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let Self {
            transport,
            session,
            eof,
        } = self;
        transport.runtime.block_on(async {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    msg = session.wait() => match msg {
                        Some(ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. }) => {
                            buf.extend_from_slice(&data);
                            return Ok(data.len());
                        }
                        Some(ChannelMsg::Eof | ChannelMsg::Close) | None => {
                            *eof = true;
                            return Err(io::ErrorKind::UnexpectedEof.into());
                        }
                        Some(_) => {}
                    },
                    () = &mut deadline => return Ok(0),
                }
            }
        })
    }

    fn close(&mut self) -> io::Result<()> {
        if self.eof || !self.transport.is_connected() {
            return Ok(());
        }
        let Self {
            transport, session, ..
        } = self;
        transport
            .runtime
            .block_on(session.close())
            .map_err(|e| backend_error(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIL2PKgt5GrMn6bdGNHUdK6Y6Z6ixf/Cxvw2LWcJlL4IT";
    const KEY_B: &str = "AAAAC3NzaC1lZDI1NTE5AAAAICHIcvf2PIr6ETisbqq3EqYHG/QwtMLe4xIV2U+YRj7F";

    fn key(data: &str) -> PublicKey {
        russh::keys::parse_public_key_base64(data).unwrap()
    }

    #[test]
    fn known_host_matches() {
        let contents = format!("# lab\nother ssh-ed25519 {KEY_B}\nlab,10.0.0.1 ssh-ed25519 {KEY_A}\n");
        assert_eq!(lookup_known_host(&contents, "lab", 22, &key(KEY_A)), KnownHost::Match);
        assert_eq!(lookup_known_host(&contents, "10.0.0.1", 22, &key(KEY_A)), KnownHost::Match);
    }

    #[test]
    fn known_host_with_other_key_mismatches() {
        let contents = format!("lab ssh-ed25519 {KEY_B}\n");
        assert_eq!(lookup_known_host(&contents, "lab", 22, &key(KEY_A)), KnownHost::Mismatch);
    }

    #[test]
    fn any_listed_key_is_accepted() {
        let contents = format!("lab ssh-ed25519 {KEY_B}\nlab ssh-ed25519 {KEY_A}\n");
        assert_eq!(lookup_known_host(&contents, "lab", 22, &key(KEY_A)), KnownHost::Match);
    }

    #[test]
    fn non_default_port_uses_brackets() {
        let contents = format!("[lab]:2222 ssh-ed25519 {KEY_A}\n");
        assert_eq!(lookup_known_host(&contents, "lab", 2222, &key(KEY_A)), KnownHost::Match);
        assert_eq!(lookup_known_host(&contents, "lab", 22, &key(KEY_A)), KnownHost::Unknown);
    }

    #[test]
    fn markers_and_garbage_are_skipped() {
        let contents = format!("@revoked lab ssh-ed25519 {KEY_A}\nlab\nlab ssh-ed25519 !!!\n");
        assert_eq!(lookup_known_host(&contents, "lab", 22, &key(KEY_A)), KnownHost::Unknown);
    }

    #[test]
    fn refused_connection_is_connection_error() {
        let params = TransportParams {
            host: "127.0.0.1",
            port: 1,
            username: "ci",
            known_hosts: Vec::new(),
            connect_timeout: Duration::from_secs(5),
        };
        let err = Transport::connect(&params, &Credentials::Ambient).unwrap_err();
        assert!(matches!(err, MachineError::Connection { port: 1, .. }));
    }
}
