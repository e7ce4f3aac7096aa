//! Minimal gpg-agent client.
//!
//! Speaks just enough of the agent's line-oriented Assuan protocol to ask
//! for a cached (or prompted) passphrase:
//!
//! ```text
//! -> connect                      (first reachable candidate socket)
//! <- OK Pleased to meet you
//! -> OPTION display=:0            (best effort, only if $DISPLAY is set)
//! <- OK
//! -> OPTION ttytype=xterm-256color
//! <- OK
//! -> GET_PASSPHRASE [--no-ask] <id> <error> <prompt> <description>
//! <- OK 68756e74657232            (hex-encoded passphrase)
//! ```
//!
//! One request per connection; nothing is pooled.  The field order and
//! `+` escaping are a compatibility surface with gpg-agent and must not
//! be reshaped.
//!
//! Response triage matters here: `ERR ...` means the agent *answered* and
//! refused (user cancelled, or `--no-ask` found nothing cached), which is a
//! soft "no passphrase from this source".  Anything that is neither `OK`
//! nor `ERR` is a protocol error for that socket candidate, and the client
//! falls through to the next candidate path.

use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::SignError;

/// Outcome of one request/response exchange with a reachable agent.
#[derive(Debug)]
pub(crate) enum AgentAnswer {
    Passphrase(Zeroizing<String>),
    Refused,
}

/// Client for a local gpg-agent, addressed by candidate socket paths.
pub struct AgentClient {
    candidates: Vec<PathBuf>,
    interactive: bool,
}

impl AgentClient {
    /// `socket_locations` is a comma-separated list of paths resolved
    /// against `home`; empty entries are skipped.
    pub fn new(socket_locations: &str, home: &Path, interactive: bool) -> Self {
        let candidates = socket_locations
            .split(',')
            .filter(|loc| !loc.is_empty())
            .map(|loc| home.join(loc))
            .collect();
        Self {
            candidates,
            interactive,
        }
    }

    /// Ask the agent for the passphrase caching under the low 32 bits of
    /// `key_id`.
    ///
    /// Returns `Ok(None)` when no candidate socket answers, or when the
    /// agent refuses.  Both mean "no passphrase from this source", never a
    /// hard error.
    #[cfg(unix)]
    pub fn get_passphrase(&self, key_id: u64) -> Result<Option<Zeroizing<String>>, SignError> {
        for path in &self.candidates {
            match self.exchange(path, key_id) {
                Ok(AgentAnswer::Passphrase(passphrase)) => return Ok(Some(passphrase)),
                Ok(AgentAnswer::Refused) => {
                    debug!(socket = %path.display(), "gpg-agent refused the passphrase request");
                    return Ok(None);
                }
                Err(SignError::AgentProtocol(detail)) => {
                    warn!(socket = %path.display(), "gpg-agent protocol error: {detail}");
                }
                Err(SignError::Io(err)) => {
                    debug!(socket = %path.display(), "gpg-agent socket not usable: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// gpg-agent sockets only exist on unix.
    #[cfg(not(unix))]
    pub fn get_passphrase(&self, _key_id: u64) -> Result<Option<Zeroizing<String>>, SignError> {
        Ok(None)
    }

    /// One full connect/greet/request/response exchange against one socket.
    #[cfg(unix)]
    pub(crate) fn exchange(&self, path: &Path, key_id: u64) -> Result<AgentAnswer, SignError> {
        let stream = std::os::unix::net::UnixStream::connect(path)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;

        // Greeting.
        expect_ok(&mut reader)?;

        // Terminal hints so the agent can place a pinentry window.
        if let Ok(display) = std::env::var("DISPLAY") {
            send_option(&mut writer, &mut reader, "display", &display)?;
        }
        if let Ok(term) = std::env::var("TERM") {
            send_option(&mut writer, &mut reader, "ttytype", &term)?;
        }

        let cache_id = format!("{:x}", key_id & 0xFFFF_FFFF);
        let no_ask = if self.interactive { "" } else { "--no-ask " };
        let request = format!(
            "GET_PASSPHRASE {}{} {} {} {}\n",
            no_ask,
            cache_id,
            escape("Passphrase incorrect"),
            escape("GnuPG Key Passphrase"),
            escape(&format!(
                "Enter passphrase for encrypted GnuPG key {cache_id} to use it for signing"
            )),
        );
        writer.write_all(request.as_bytes())?;
        writer.flush()?;

        let line = read_line(&mut reader)?;
        if line.starts_with("ERR") {
            return Ok(AgentAnswer::Refused);
        }
        let payload = match line.strip_prefix("OK") {
            Some(rest) => rest.trim(),
            None => {
                return Err(SignError::AgentProtocol(format!(
                    "expected OK but got this instead: {line}"
                )))
            }
        };
        let bytes = hex::decode(payload)
            .map_err(|err| SignError::AgentProtocol(format!("bad passphrase encoding: {err}")))?;
        let passphrase = String::from_utf8(bytes)
            .map_err(|err| SignError::AgentProtocol(format!("passphrase is not utf-8: {err}")))?;

        Ok(AgentAnswer::Passphrase(Zeroizing::new(passphrase)))
    }
}

#[cfg(unix)]
fn send_option(
    writer: &mut impl Write,
    reader: &mut impl BufRead,
    key: &str,
    value: &str,
) -> Result<(), SignError> {
    writer.write_all(format!("OPTION {key}={value}\n").as_bytes())?;
    writer.flush()?;
    expect_ok(reader)?;
    Ok(())
}

#[cfg(unix)]
fn expect_ok(reader: &mut impl BufRead) -> Result<String, SignError> {
    let line = read_line(reader)?;
    if !line.starts_with("OK") {
        return Err(SignError::AgentProtocol(format!(
            "expected OK but got this instead: {line}"
        )));
    }
    Ok(line)
}

#[cfg(unix)]
fn read_line(reader: &mut impl BufRead) -> Result<String, SignError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(SignError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "gpg-agent closed the connection",
        )));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Escape a request field: space becomes `+`, the characters that would
/// break the line format are percent-encoded.
fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            ' ' => out.push('+'),
            '+' => out.push_str("%2B"),
            '%' => out.push_str("%25"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            _ => out.push(ch),
        }
    }
    out
}
