//! Version extraction and ordering for the external gpg tool.
//!
//! The flag matrix in [`crate::gpg`] is gated on the installed tool's
//! release line (pre-2.0, 2.0, 2.1+), so comparisons here must match what
//! that gating expects: segments compare pairwise, and when one version is
//! a strict prefix of the other the longer one is greater.  That makes
//! `2.2 != 2.2.0` intentionally, see [`GpgVersion::cmp`].

use std::cmp::Ordering;
use std::fmt;

use crate::error::SignError;

/// A gpg version: the dot-separated numeric run of a `gpg --version` banner.
///
/// Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GpgVersion {
    segments: Vec<u32>,
}

impl GpgVersion {
    /// Parse a version from free-form banner text.
    ///
    /// Scans for the last contiguous run shaped like `2.2.15` (two or more
    /// dot-separated decimal segments) and ignores everything around it, so
    /// `"gpg (GnuPG) 2.2.15"` and `"2.2.15"` parse equal.  Fails when no
    /// such run exists.
    pub fn parse(text: &str) -> Result<Self, SignError> {
        let run = last_version_run(text).ok_or_else(|| SignError::VersionParse(text.into()))?;

        let segments = run
            .split('.')
            .map(|s| s.parse::<u32>())
            .collect::<Result<Vec<u32>, _>>()
            .map_err(|_| SignError::VersionParse(text.into()))?;

        Ok(GpgVersion { segments })
    }

    /// Build a version directly from its numeric segments.
    pub(crate) fn from_segments(segments: &[u32]) -> Self {
        GpgVersion {
            segments: segments.to_vec(),
        }
    }

    /// `true` if this version sorts strictly before `other`.
    pub fn is_before(&self, other: &GpgVersion) -> bool {
        self < other
    }

    /// `true` if this version sorts at or after `other`.
    pub fn is_at_least(&self, other: &GpgVersion) -> bool {
        self >= other
    }
}

impl Ord for GpgVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.segments.iter().zip(other.segments.iter()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        // Equal common prefix: the version with more segments is greater,
        // so 2.1.0 > 2.1 and, by the same rule, 2.2 != 2.2.0.
        self.segments.len().cmp(&other.segments.len())
    }
}

impl PartialOrd for GpgVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for GpgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{seg}")?;
        }
        Ok(())
    }
}

/// Find the last substring matching `(\d+\.)+\d+`.
fn last_version_run(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut found: Option<&str> = None;
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }

        // Walk a run of digits and single separating dots; a dot only
        // counts if a digit follows it, so "2.2." yields "2.2".
        let start = i;
        let mut end = i;
        while i < bytes.len() {
            if bytes[i].is_ascii_digit() {
                i += 1;
                end = i;
            } else if bytes[i] == b'.' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
                i += 1;
            } else {
                break;
            }
        }

        let run = &text[start..end];
        if run.contains('.') {
            found = Some(run);
        }
    }

    found
}
