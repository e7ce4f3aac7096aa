//! Signer configuration.
//!
//! Everything a signer needs is passed in here explicitly; there is no
//! global state.  The host build tool owns option parsing and hands over a
//! fully resolved `SignerConfig`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// A key passphrase.
///
/// Held in zeroizing memory, scrubbed on drop.  `Debug` never prints the
/// value, and the value cannot be serialized back out; config files are
/// only ever read.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Passphrase {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase([redacted])")
    }
}

impl Serialize for Passphrase {
    fn serialize<S>(&self, _serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        Err(serde::ser::Error::custom("Passphrase cannot be serialized"))
    }
}

impl<'de> Deserialize<'de> for Passphrase {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Passphrase::new)
    }
}

/// Configuration shared by both signing backends.
///
/// Fields irrelevant to a backend are ignored by it: the keyring/lock-mode
/// options only drive the external tool, the key-file/fingerprint/agent
/// options only drive the embedded signer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerConfig {
    /// External tool executable. Defaults to `gpg` (`gpg.exe` on Windows).
    #[serde(default)]
    pub executable: Option<String>,

    /// Pre-resolved key passphrase; takes precedence over every loader.
    #[serde(default)]
    pub passphrase: Option<Passphrase>,

    /// Explicit key identity passed to the external tool (`--local-user`).
    #[serde(default)]
    pub key_name: Option<String>,

    /// GnuPG home directory override (`--homedir`).
    #[serde(default)]
    pub home_dir: Option<PathBuf>,

    /// Whether a human can be prompted. Non-interactive runs filter out
    /// interactive credential sources and forbid the tool from spawning
    /// pinentry prompts.
    #[serde(default = "default_true")]
    pub interactive: bool,

    /// Legacy agent toggle, only meaningful for gpg before 2.1.
    #[serde(default = "default_true")]
    pub use_agent: bool,

    /// When false, passes `--no-default-keyring`.
    #[serde(default = "default_true")]
    pub default_keyring: bool,

    /// Legacy secret keyring path; obsolete (and warned about) on gpg 2.1+.
    #[serde(default)]
    pub secret_keyring: Option<String>,

    /// Public keyring path (`--keyring`).
    #[serde(default)]
    pub public_keyring: Option<String>,

    /// Keyring lock mode: `once`, `multiple` or `never` (case-insensitive).
    /// Unrecognised values are warned about and ignored.
    #[serde(default)]
    pub lock_mode: Option<String>,

    /// Extra raw arguments prepended verbatim to the tool invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Secret key ring file for the embedded signer, resolved against
    /// [`SignerConfig::base_dir`] when relative.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Hex-encoded key fingerprint (40 characters) selecting one key of
    /// the ring for the embedded signer.
    #[serde(default)]
    pub key_fingerprint: Option<String>,

    /// Base directory for resolving relative key-file paths.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    /// Comma-separated gpg-agent socket locations, resolved against the
    /// user's home directory.
    #[serde(default = "default_agent_sockets")]
    pub agent_socket_locations: String,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            passphrase: None,
            key_name: None,
            home_dir: None,
            interactive: true,
            use_agent: true,
            default_keyring: true,
            secret_keyring: None,
            public_keyring: None,
            lock_mode: None,
            extra_args: Vec::new(),
            key_file: None,
            key_fingerprint: None,
            base_dir: None,
            agent_socket_locations: default_agent_sockets(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_agent_sockets() -> String {
    ".gnupg/S.gpg-agent".to_string()
}
