//! Credential sources for the embedded signer.
//!
//! A small ordered chain of loaders, each able to supply key ring
//! material, a key-selection fingerprint, and/or a passphrase from one
//! source.  Resolution is a fold: first non-null result wins,
//! independently per category.  The chain is a `Vec<Box<dyn Loader>>` and
//! three short loops.
//!
//! Order (and therefore precedence): environment variables, key file,
//! gpg-agent.  The agent is the only interactive source and is filtered
//! out entirely when running non-interactively.
//!
//! # Security
//!
//! - Key material and passphrases travel in `Zeroizing` buffers.
//! - The file loader refuses key files of 5 KiB or more; real secret key
//!   exports are far smaller, and the cap prevents slurping an
//!   accidentally-configured huge file into locked memory.
//! - Nothing in this module logs credential values.

use std::path::{Path, PathBuf};

use tracing::debug;
use zeroize::Zeroizing;

use crate::agent::AgentClient;
use crate::config::SignerConfig;
use crate::error::SignError;

/// Environment variable holding the key ring material itself (armored TSK).
pub const ENV_KEY: &str = "ASCSIGN_KEY";
/// Environment variable holding the 40-hex-character key fingerprint.
pub const ENV_KEY_FINGERPRINT: &str = "ASCSIGN_KEY_FINGERPRINT";
/// Environment variable holding the key passphrase.
pub const ENV_KEY_PASS: &str = "ASCSIGN_KEY_PASS";

/// Default key file name, resolved against the configured base directory.
pub const DEFAULT_KEY_FILE: &str = "signing-key.key";

/// Anything at or above this is not a secret key export we should load.
/// See <https://wiki.gnupg.org/LargeKeys>.
const MAX_KEY_FILE_SIZE: u64 = 5 * 1024 + 1;

/// One credential source.  Every method defaults to "nothing from here".
pub(crate) trait Loader {
    /// Whether this source may end up prompting a human.
    fn interactive(&self) -> bool;

    fn load_key_ring(&self) -> Result<Option<Zeroizing<Vec<u8>>>, SignError> {
        Ok(None)
    }

    /// A 20-byte fingerprint selecting one key of the ring.
    fn load_fingerprint(&self) -> Result<Option<Vec<u8>>, SignError> {
        Ok(None)
    }

    fn load_passphrase(&self, _key_id: u64) -> Result<Option<Zeroizing<String>>, SignError> {
        Ok(None)
    }
}

/// The ordered loader chain, already filtered for interactivity.
pub(crate) struct CredentialChain {
    loaders: Vec<Box<dyn Loader>>,
}

impl CredentialChain {
    pub fn from_config(config: &SignerConfig) -> Self {
        let all: Vec<Box<dyn Loader>> = vec![
            Box::new(EnvLoader),
            Box::new(FileLoader::from_config(config)),
            Box::new(AgentLoader::from_config(config)),
        ];
        let loaders = all
            .into_iter()
            .filter(|loader| config.interactive || !loader.interactive())
            .collect();
        Self { loaders }
    }

    /// Key ring material is mandatory; exhausting the chain is a hard error.
    pub fn key_ring(&self) -> Result<Zeroizing<Vec<u8>>, SignError> {
        for loader in &self.loaders {
            if let Some(material) = loader.load_key_ring()? {
                return Ok(material);
            }
        }
        Err(SignError::CredentialNotFound("key ring material"))
    }

    /// A fingerprint is optional; `None` means "select the first usable key".
    pub fn fingerprint(&self) -> Result<Option<Vec<u8>>, SignError> {
        for loader in &self.loaders {
            if let Some(fingerprint) = loader.load_fingerprint()? {
                return Ok(Some(fingerprint));
            }
        }
        Ok(None)
    }

    /// First passphrase any source can produce, or `None` when exhausted.
    /// Whether that is fatal depends on the selected key, so the caller
    /// decides.
    pub fn passphrase(&self, key_id: u64) -> Result<Option<Zeroizing<String>>, SignError> {
        for loader in &self.loaders {
            if let Some(passphrase) = loader.load_passphrase(key_id)? {
                return Ok(Some(passphrase));
            }
        }
        Ok(None)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.loaders.len()
    }
}

/// Decode a configured fingerprint: exactly 40 hex characters, 20 bytes.
fn decode_fingerprint(text: &str) -> Result<Vec<u8>, SignError> {
    let trimmed = text.trim();
    if trimmed.len() != 40 {
        return Err(SignError::Config(
            "key fingerprint configuration is wrong (expected 40 hex characters)".to_string(),
        ));
    }
    hex::decode(trimmed)
        .map_err(|err| SignError::Config(format!("key fingerprint is not valid hex: {err}")))
}

/// Reads all three credential categories from named environment variables.
struct EnvLoader;

impl Loader for EnvLoader {
    fn interactive(&self) -> bool {
        false
    }

    fn load_key_ring(&self) -> Result<Option<Zeroizing<Vec<u8>>>, SignError> {
        match std::env::var(ENV_KEY) {
            Ok(material) => {
                debug!("using key ring material from ${ENV_KEY}");
                Ok(Some(Zeroizing::new(material.into_bytes())))
            }
            Err(_) => Ok(None),
        }
    }

    fn load_fingerprint(&self) -> Result<Option<Vec<u8>>, SignError> {
        match std::env::var(ENV_KEY_FINGERPRINT) {
            Ok(fingerprint) => decode_fingerprint(&fingerprint).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn load_passphrase(&self, _key_id: u64) -> Result<Option<Zeroizing<String>>, SignError> {
        match std::env::var(ENV_KEY_PASS) {
            Ok(passphrase) => Ok(Some(Zeroizing::new(passphrase))),
            Err(_) => Ok(None),
        }
    }
}

/// Reads the key ring from a configured file path and the fingerprint from
/// the configuration itself.
struct FileLoader {
    key_file: PathBuf,
    fingerprint: Option<String>,
}

impl FileLoader {
    fn from_config(config: &SignerConfig) -> Self {
        let configured = config
            .key_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE));
        let key_file = resolve_against(&configured, config.base_dir.as_deref());
        Self {
            key_file,
            fingerprint: config.key_fingerprint.clone(),
        }
    }
}

fn resolve_against(path: &Path, base: Option<&Path>) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match base {
        Some(base) => base.join(path),
        None => path.to_path_buf(),
    }
}

impl Loader for FileLoader {
    fn interactive(&self) -> bool {
        false
    }

    fn load_key_ring(&self) -> Result<Option<Zeroizing<Vec<u8>>>, SignError> {
        let metadata = match std::fs::metadata(&self.key_file) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => return Ok(None),
        };
        // An oversized file here is a misconfiguration, not a "try the
        // next source" situation.
        if metadata.len() >= MAX_KEY_FILE_SIZE {
            return Err(SignError::Io(std::io::Error::other(format!(
                "refusing to load key {}: larger than 5 KiB",
                self.key_file.display()
            ))));
        }
        debug!(path = %self.key_file.display(), "using key ring material from file");
        Ok(Some(Zeroizing::new(std::fs::read(&self.key_file)?)))
    }

    fn load_fingerprint(&self) -> Result<Option<Vec<u8>>, SignError> {
        match &self.fingerprint {
            Some(fingerprint) => decode_fingerprint(fingerprint).map(Some),
            None => Ok(None),
        }
    }
}

/// Asks the local gpg-agent for the passphrase.  Passphrase only, and the
/// only source that may prompt a human.
struct AgentLoader {
    client: Option<AgentClient>,
}

impl AgentLoader {
    fn from_config(config: &SignerConfig) -> Self {
        let client = std::env::var_os("HOME").map(|home| {
            AgentClient::new(
                &config.agent_socket_locations,
                Path::new(&home),
                config.interactive,
            )
        });
        Self { client }
    }
}

impl Loader for AgentLoader {
    fn interactive(&self) -> bool {
        true
    }

    fn load_passphrase(&self, key_id: u64) -> Result<Option<Zeroizing<String>>, SignError> {
        match &self.client {
            Some(client) => client.get_passphrase(key_id),
            None => Ok(None),
        }
    }
}
