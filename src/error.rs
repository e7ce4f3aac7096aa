//! Error types for the signing backends.

use std::io;

use chrono::{DateTime, Utc};

/// Errors surfaced by signers and credential resolution.
///
/// Passphrase values never appear in any of these messages.  An agent
/// *refusal* (the user cancelled, or `--no-ask` hit an empty cache) is not
/// an error at all; the agent loader reports it as "no passphrase from
/// this source" and resolution moves on.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    /// Malformed or conflicting configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required credential was not found in any source.
    ///
    /// Names which credential was missing, never its value.
    #[error("{0} not found")]
    CredentialNotFound(&'static str),

    /// The selected secret key's validity period has elapsed.
    #[error("secret key expired at: {expired_at}")]
    KeyExpired { expired_at: DateTime<Utc> },

    /// The gpg-agent answered with something that is neither `OK` nor `ERR`.
    ///
    /// Fatal for the socket candidate that produced it; the caller falls
    /// back to the next candidate path.
    #[error("gpg-agent protocol error: {0}")]
    AgentProtocol(String),

    /// No dot-separated version run could be extracted from tool output.
    #[error("can't parse version of {0:?}")]
    VersionParse(String),

    /// The external tool ran but exited non-zero.
    #[error("gpg exited with code {code}")]
    ProcessFailed { code: i32 },

    /// The external tool could not be launched at all.
    #[error("unable to execute gpg command: {0}")]
    ProcessLaunch(#[source] io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("openpgp error: {0}")]
    Pgp(#[from] pgp::errors::Error),
}
