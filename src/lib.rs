//! Detached OpenPGP signing for build artifacts.
//!
//! Two interchangeable backends produce armored `.asc` signatures:
//!
//! - [`GpgCommandSigner`] shells out to an installed `gpg`, probing its
//!   version once and adapting the command line to the release in use.
//! - [`EmbeddedSigner`] signs in-process, resolving the secret key and
//!   passphrase through an ordered chain of credential sources:
//!   environment variables, a key file, and the local gpg-agent.
//!
//! Both implement [`Signer`]: call [`Signer::prepare`] once to probe the
//! environment and fail fast on bad credentials, then [`Signer::sign_to`]
//! per artifact.  [`sign_file`] wraps the common case of signing a file
//! next to itself.
//!
//! ```no_run
//! use ascsign::{sign_file, Signer, SignerConfig, SignerKind};
//!
//! # fn main() -> Result<(), ascsign::SignError> {
//! let mut signer = SignerKind::Embedded.create(SignerConfig::default());
//! signer.prepare()?;
//! let signature = sign_file(signer.as_ref(), "target/release.jar".as_ref())?;
//! # Ok(()) }
//! ```

use std::path::{Path, PathBuf};

mod agent;
mod config;
mod embedded;
mod error;
mod gpg;
mod loaders;
mod version;

pub use agent::AgentClient;
pub use config::{Passphrase, SignerConfig};
pub use embedded::EmbeddedSigner;
pub use error::SignError;
pub use gpg::GpgCommandSigner;
pub use loaders::{DEFAULT_KEY_FILE, ENV_KEY, ENV_KEY_FINGERPRINT, ENV_KEY_PASS};
pub use version::GpgVersion;

/// Extension appended to the source file name for detached signatures.
pub const SIGNATURE_EXTENSION: &str = ".asc";

/// A detached-signature producer.
///
/// Implementations are cheap to construct; all environment probing and
/// credential resolution happens in [`Signer::prepare`], which must be
/// called once before the first [`Signer::sign_to`].
pub trait Signer {
    /// Short backend identifier, usable in configuration and logs.
    fn name(&self) -> &'static str;

    /// Probe the environment and resolve credentials.
    ///
    /// Fails fast: a missing key, a wrong passphrase or an expired key is
    /// reported here, before any artifact is touched.
    fn prepare(&mut self) -> Result<(), SignError>;

    /// Write an armored detached signature of `source` to `dest`.
    fn sign_to(&self, source: &Path, dest: &Path) -> Result<(), SignError>;

    /// Human-readable description of the signing key, for log output.
    fn key_info(&self) -> String;
}

/// Sign `source`, placing the signature next to it as `<source>.asc`.
///
/// A stale signature at that path is removed first, so a failed run never
/// leaves an old signature masquerading as the new one.  Returns the
/// signature path.
pub fn sign_file(signer: &dyn Signer, source: &Path) -> Result<PathBuf, SignError> {
    let dest = signature_path(source);
    if dest.exists() {
        std::fs::remove_file(&dest)?;
    }
    signer.sign_to(source, &dest)?;
    Ok(dest)
}

fn signature_path(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(SIGNATURE_EXTENSION);
    PathBuf::from(name)
}

/// Which backend to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerKind {
    /// The external `gpg` executable.
    Gpg,
    /// The in-process OpenPGP implementation.
    Embedded,
}

impl SignerKind {
    /// Parse a configured backend name.
    pub fn from_name(name: &str) -> Result<Self, SignError> {
        match name {
            "gpg" => Ok(SignerKind::Gpg),
            "bc" => Ok(SignerKind::Embedded),
            other => Err(SignError::Config(format!("unknown signer {other:?}"))),
        }
    }

    /// Build the backend. The signer still needs [`Signer::prepare`].
    pub fn create(self, config: SignerConfig) -> Box<dyn Signer> {
        match self {
            SignerKind::Gpg => Box::new(GpgCommandSigner::new(config)),
            SignerKind::Embedded => Box::new(EmbeddedSigner::new(config)),
        }
    }
}

/// Serializes tests that mutate process-wide environment variables.
#[cfg(test)]
pub(crate) static TEST_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
