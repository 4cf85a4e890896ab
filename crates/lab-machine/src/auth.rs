//! Authentication variants.
//!
//! An [`Authenticator`] describes how to prove identity to a remote endpoint.
//! Connectors call [`Authenticator::resolve`] for the host that will actually
//! use the credentials, which turns the description into [`Credentials`].

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MachineError, Result};

/// How to prove identity to a remote endpoint.
///
/// `Undefined` is never built by this crate. It is the landing spot for an
/// unknown `kind` when a machine description is deserialized, and resolving
/// it fails with [`MachineError::UnhandledVariant`].
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Authenticator {
    /// Authenticate using a password.
    ///
    /// Passwords end up in process arguments or on the wire of the first
    /// hop. Prefer keys.
    Password {
        /// The secret.
        password: String,
    },
    /// Authenticate using a private-key file.
    PrivateKey {
        /// Where the key file lives.
        key: KeySource,
    },
    /// Pass no explicit credentials and rely on agent and ssh config.
    #[default]
    None,
    /// Unknown authenticator kind.
    #[serde(other)]
    Undefined,
}

/// Location of a private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySource {
    /// A path on whatever machine runs the client.
    Local(PathBuf),
    /// A path that only makes sense on one specific machine.
    Remote(RemotePath),
}

/// A path bound to the machine it lives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePath {
    /// Name of the machine holding the file.
    pub host: String,
    /// Path of the file on that machine.
    pub path: String,
}

/// Resolved connection parameters.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Plaintext password, no key material.
    Password(String),
    /// Path of a private-key file.
    KeyFile(String),
    /// Nothing explicit; the agent, ssh config and known host keys decide.
    Ambient,
}

impl Authenticator {
    /// Create password auth.
    #[must_use]
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    /// Create private-key auth.
    #[must_use]
    pub fn private_key(key: impl Into<KeySource>) -> Self {
        Self::PrivateKey { key: key.into() }
    }

    /// Create private-key auth for a key that lives on machine `host`.
    #[must_use]
    pub fn remote_private_key(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::PrivateKey {
            key: KeySource::Remote(RemotePath::new(host, path)),
        }
    }

    /// The conventional per-user key, `~/.ssh/id_rsa`.
    #[must_use]
    pub fn default_key() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        Self::private_key(home.join(".ssh").join("id_rsa"))
    }

    /// Resolve into credentials for the machine named `host`.
    ///
    /// `host` is the machine that will present the credentials. A key bound
    /// to a different machine cannot be used there. Without a host the key
    /// resolves to its path on its own machine.
    pub fn resolve(&self, host: Option<&str>) -> Result<Credentials> {
        match self {
            Self::Password { password } => Ok(Credentials::Password(password.clone())),
            Self::PrivateKey { key } => key.path_for(host).map(Credentials::KeyFile),
            Self::None => Ok(Credentials::Ambient),
            Self::Undefined => Err(MachineError::unhandled_variant(
                "authenticator of unknown kind",
            )),
        }
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f.debug_struct("Password").finish_non_exhaustive(),
            Self::PrivateKey { key } => f.debug_struct("PrivateKey").field("key", key).finish(),
            Self::None => f.write_str("None"),
            Self::Undefined => f.write_str("Undefined"),
        }
    }
}

impl KeySource {
    /// Path of the key as seen from the machine named `host`.
    pub fn path_for(&self, host: Option<&str>) -> Result<String> {
        match self {
            Self::Local(path) => Ok(path.to_string_lossy().into_owned()),
            Self::Remote(remote) => match host {
                Some(target) if target != remote.host => Err(MachineError::credential_mismatch(
                    &remote.host,
                    target,
                    &remote.path,
                )),
                _ => Ok(remote.path.clone()),
            },
        }
    }
}

impl From<PathBuf> for KeySource {
    fn from(path: PathBuf) -> Self {
        Self::Local(path)
    }
}

impl From<&str> for KeySource {
    fn from(path: &str) -> Self {
        Self::Local(PathBuf::from(path))
    }
}

impl From<String> for KeySource {
    fn from(path: String) -> Self {
        Self::Local(PathBuf::from(path))
    }
}

impl From<RemotePath> for KeySource {
    fn from(path: RemotePath) -> Self {
        Self::Remote(path)
    }
}

impl RemotePath {
    /// Bind `path` to machine `host`.
    #[must_use]
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.path)
    }
}

impl Credentials {
    /// The password, if this is password auth.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        match self {
            Self::Password(password) => Some(password),
            _ => None,
        }
    }

    /// The key file path, if this is key auth.
    #[must_use]
    pub fn key_file(&self) -> Option<&str> {
        match self {
            Self::KeyFile(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Self::Ambient => f.write_str("Ambient"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_resolves_to_secret() {
        let creds = Authenticator::password("hunter2").resolve(None).unwrap();
        assert_eq!(creds.password(), Some("hunter2"));
        assert_eq!(creds.key_file(), None);
    }

    #[test]
    fn local_key_is_unchanged() {
        let creds = Authenticator::private_key("/home/foo/.ssh/id_rsa_foo")
            .resolve(Some("lab"))
            .unwrap();
        assert_eq!(creds.key_file(), Some("/home/foo/.ssh/id_rsa_foo"));
    }

    #[test]
    fn remote_key_on_its_own_host() {
        let auth = Authenticator::remote_private_key("lab", "/home/ci/.ssh/id_ed25519");
        let creds = auth.resolve(Some("lab")).unwrap();
        assert_eq!(creds, Credentials::KeyFile("/home/ci/.ssh/id_ed25519".into()));
    }

    #[test]
    fn remote_key_on_other_host_mismatches() {
        let auth = Authenticator::remote_private_key("lab", "/home/ci/.ssh/id_ed25519");
        let err = auth.resolve(Some("buildhost")).unwrap_err();
        assert!(matches!(
            err,
            MachineError::CredentialMismatch { ref key_host, ref target_host, .. }
                if key_host == "lab" && target_host == "buildhost"
        ));
    }

    #[test]
    fn none_defers_to_ambient() {
        assert_eq!(Authenticator::None.resolve(Some("lab")).unwrap(), Credentials::Ambient);
    }

    #[test]
    fn undefined_is_unhandled() {
        let err = Authenticator::Undefined.resolve(None).unwrap_err();
        assert!(matches!(err, MachineError::UnhandledVariant { .. }));
    }

    #[test]
    fn debug_redacts_password() {
        let auth = Authenticator::password("hunter2");
        assert!(!format!("{auth:?}").contains("hunter2"));
        let creds = auth.resolve(None).unwrap();
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn default_key_points_at_id_rsa() {
        let Authenticator::PrivateKey { key: KeySource::Local(path) } = Authenticator::default_key()
        else {
            panic!("default key should be a local private key");
        };
        assert!(path.ends_with(".ssh/id_rsa"));
    }
}
