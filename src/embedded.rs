//! Embedded backend: signs in-process with an OpenPGP implementation,
//! no gpg installation required.
//!
//! `prepare` resolves everything up front through the credential chain in
//! [`crate::loaders`]: the secret key ring, an optional key-selection
//! fingerprint, and a passphrase when the selected key is encrypted.  The
//! passphrase is validated by unlocking the key once, so a typo fails at
//! prepare time rather than on the first artifact.  `sign_to` then
//! produces a detached, armored, SHA-512 binary-document signature per
//! call.
//!
//! Signatures are written to a temporary sibling file and renamed into
//! place, so a failed run never leaves a half-written `.asc` behind.

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use pgp::composed::signed_key::{from_reader_many, PublicOrSecret, SignedSecretKey};
use pgp::composed::StandaloneSignature;
use pgp::crypto::hash::HashAlgorithm;
use pgp::packet::{
    SecretKey, SecretSubkey, SignatureConfig, SignatureType, SignatureVersion, Subpacket,
    SubpacketData,
};
use pgp::types::{KeyId, KeyTrait, KeyVersion, SecretKeyTrait, SecretParams};
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::SignerConfig;
use crate::error::SignError;
use crate::loaders::CredentialChain;
use crate::Signer;

/// Detached signing without an external tool.
pub struct EmbeddedSigner {
    config: SignerConfig,
    state: Option<PreparedKey>,
}

struct PreparedKey {
    ring: SignedSecretKey,
    /// Index into `ring.secret_subkeys`; `None` selects the primary key.
    subkey: Option<usize>,
    fingerprint: Vec<u8>,
    passphrase: Option<Zeroizing<String>>,
    info: String,
}

enum SelectedKey<'a> {
    Primary(&'a SecretKey),
    Subkey(&'a SecretSubkey),
}

impl PreparedKey {
    fn selected(&self) -> SelectedKey<'_> {
        match self.subkey {
            None => SelectedKey::Primary(&self.ring.primary_key),
            Some(i) => SelectedKey::Subkey(&self.ring.secret_subkeys[i].key),
        }
    }
}

impl EmbeddedSigner {
    pub fn new(config: SignerConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }
}

impl Signer for EmbeddedSigner {
    fn name(&self) -> &'static str {
        "bc"
    }

    fn prepare(&mut self) -> Result<(), SignError> {
        let chain = CredentialChain::from_config(&self.config);

        let material = chain.key_ring()?;
        let mut rings = parse_rings(&material)?;
        drop(material);

        let wanted = chain.fingerprint()?;

        let candidates = flatten_candidates(&rings);
        let position = select_candidate(&candidates, wanted.as_deref())
            .ok_or(SignError::CredentialNotFound("secret key"))?;
        let chosen = candidates[position].clone();

        let ring = rings.swap_remove(chosen.ring);
        let prepared = PreparedKey {
            info: describe_key(&ring, &chosen.fingerprint),
            ring,
            subkey: chosen.subkey,
            fingerprint: chosen.fingerprint,
            passphrase: None,
        };

        if let Some(expired_at) = expires_at(&prepared) {
            if expired_at < Utc::now() {
                return Err(SignError::KeyExpired { expired_at });
            }
        }

        let encrypted = match prepared.selected() {
            SelectedKey::Primary(key) => key.secret_params().is_encrypted(),
            SelectedKey::Subkey(key) => key.secret_params().is_encrypted(),
        };

        let passphrase = match &self.config.passphrase {
            Some(passphrase) => Some(Zeroizing::new(passphrase.as_str().to_string())),
            None if encrypted => {
                let key_id = match prepared.selected() {
                    SelectedKey::Primary(key) => key.key_id(),
                    SelectedKey::Subkey(key) => key.key_id(),
                };
                chain.passphrase(key_id_bits(&key_id))?
            }
            None => None,
        };
        if encrypted && passphrase.is_none() {
            return Err(SignError::CredentialNotFound("passphrase"));
        }

        // Unlock once now so a wrong passphrase fails here, not mid-build.
        let check = password_fn(passphrase.as_ref());
        match prepared.selected() {
            SelectedKey::Primary(key) => key.unlock(check, |_| Ok(()))?,
            SelectedKey::Subkey(key) => key.unlock(check, |_| Ok(()))?,
        }

        debug!(key = %prepared.info, "embedded signer ready");
        self.state = Some(PreparedKey {
            passphrase,
            ..prepared
        });
        Ok(())
    }

    fn sign_to(&self, source: &Path, dest: &Path) -> Result<(), SignError> {
        let prepared = self
            .state
            .as_ref()
            .ok_or_else(|| SignError::Config("signer is not prepared".to_string()))?;

        let reader = BufReader::new(File::open(source)?);
        let algorithm = match prepared.selected() {
            SelectedKey::Primary(key) => key.algorithm(),
            SelectedKey::Subkey(key) => key.algorithm(),
        };

        let sig_config = SignatureConfig::new_v4(
            SignatureVersion::V4,
            SignatureType::Binary,
            algorithm,
            HashAlgorithm::SHA2_512,
            vec![
                Subpacket::regular(SubpacketData::SignatureCreationTime(
                    Utc::now().trunc_subsecs(0),
                )),
                Subpacket::regular(SubpacketData::IssuerFingerprint(
                    KeyVersion::V4,
                    prepared.fingerprint.clone().into(),
                )),
            ],
            vec![],
        );

        let password = password_fn(prepared.passphrase.as_ref());
        let signature = match prepared.selected() {
            SelectedKey::Primary(key) => sig_config.sign(key, password, reader),
            SelectedKey::Subkey(key) => sig_config.sign(key, password, reader),
        }?;
        let standalone = StandaloneSignature::new(signature);

        let tmp = sibling_tmp_path(dest);
        let written = (|| -> Result<(), SignError> {
            let mut out = File::create(&tmp)?;
            standalone.to_armored_writer(&mut out, None)?;
            Ok(())
        })();
        if let Err(err) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(err);
        }
        std::fs::rename(&tmp, dest)?;
        Ok(())
    }

    fn key_info(&self) -> String {
        match &self.state {
            Some(prepared) => prepared.info.clone(),
            None => "unprepared".to_string(),
        }
    }
}

fn parse_rings(material: &[u8]) -> Result<Vec<SignedSecretKey>, SignError> {
    let (entries, _headers) = from_reader_many(Cursor::new(material))?;
    let mut rings = Vec::new();
    for entry in entries {
        match entry? {
            PublicOrSecret::Secret(ring) => rings.push(ring),
            PublicOrSecret::Public(_) => debug!("ignoring public key in ring material"),
        }
    }
    if rings.is_empty() {
        return Err(SignError::CredentialNotFound("secret key"));
    }
    Ok(rings)
}

/// One signing-capable key of the flattened ring collection, primary keys
/// and secret subkeys alike, in ring order.
#[derive(Debug, Clone)]
struct KeyCandidate {
    ring: usize,
    subkey: Option<usize>,
    fingerprint: Vec<u8>,
    has_private: bool,
}

fn flatten_candidates(rings: &[SignedSecretKey]) -> Vec<KeyCandidate> {
    let mut candidates = Vec::new();
    for (r, ring) in rings.iter().enumerate() {
        candidates.push(KeyCandidate {
            ring: r,
            subkey: None,
            fingerprint: ring.primary_key.fingerprint(),
            has_private: has_secret_material(ring.primary_key.secret_params()),
        });
        for (s, sub) in ring.secret_subkeys.iter().enumerate() {
            candidates.push(KeyCandidate {
                ring: r,
                subkey: Some(s),
                fingerprint: sub.key.fingerprint(),
                has_private: has_secret_material(sub.key.secret_params()),
            });
        }
    }
    candidates
}

/// Pick the key to sign with.
///
/// With a fingerprint: the matching key, wherever it sits in the
/// collection.  Without: the first key that actually carries private
/// material, which skips stripped primaries (laptop keys whose primary
/// lives offline) and lands on their signing subkey.
fn select_candidate(candidates: &[KeyCandidate], wanted: Option<&[u8]>) -> Option<usize> {
    match wanted {
        Some(fingerprint) => candidates
            .iter()
            .position(|c| c.fingerprint == fingerprint && c.has_private),
        None => candidates.iter().position(|c| c.has_private),
    }
}

/// S2K usage 101 is GnuPG's gnu-dummy marker for stripped private parts.
fn has_secret_material(params: &SecretParams) -> bool {
    params.string_to_key_id() != 101
}

/// When the key carries a validity period, the moment it stops being valid.
fn expires_at(prepared: &PreparedKey) -> Option<DateTime<Utc>> {
    match prepared.subkey {
        None => {
            let validity = prepared.ring.details.key_expiration_time()?;
            let public = prepared.ring.primary_key.public_key();
            expiry_deadline(*public.created_at(), Some(validity))
        }
        Some(i) => {
            let sub = &prepared.ring.secret_subkeys[i];
            let validity = sub
                .signatures
                .iter()
                .find_map(|sig| sig.key_expiration_time().copied())?;
            let public = sub.key.public_key();
            expiry_deadline(*public.created_at(), Some(validity))
        }
    }
}

fn expiry_deadline(created: DateTime<Utc>, validity: Option<Duration>) -> Option<DateTime<Utc>> {
    validity.map(|validity| created + validity)
}

/// The low 64 bits of the key identity, as gpg-agent cache keys expect.
fn key_id_bits(key_id: &KeyId) -> u64 {
    let raw = key_id.as_ref();
    let take = raw.len().min(8);
    let mut bytes = [0u8; 8];
    bytes[8 - take..].copy_from_slice(&raw[raw.len() - take..]);
    u64::from_be_bytes(bytes)
}

fn password_fn(passphrase: Option<&Zeroizing<String>>) -> impl FnOnce() -> String + '_ {
    move || {
        passphrase
            .map(|p| p.as_str().to_string())
            .unwrap_or_default()
    }
}

fn describe_key(ring: &SignedSecretKey, fingerprint: &[u8]) -> String {
    match ring.details.users.first() {
        Some(user) => user.id.id().to_string(),
        None => hex::encode(fingerprint),
    }
}

fn sibling_tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
