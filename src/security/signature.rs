use std::fmt;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};

use super::certificate::PublicKey;
use super::hash::HashAlgorithm;
use crate::clock::serde_timestamp;
use crate::error::{NegotiationError, Result};

pub const ED25519_SIGNATURE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    #[serde(rename = "ED25519")]
    Ed25519,
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Ed25519 => f.write_str("ED25519"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureScheme {
    #[serde(rename = "ED25519")]
    Ed25519,
}

impl SignatureScheme {
    pub const ALL: [SignatureScheme; 1] = [SignatureScheme::Ed25519];

    pub fn key_algorithm(&self) -> KeyAlgorithm {
        match self {
            SignatureScheme::Ed25519 => KeyAlgorithm::Ed25519,
        }
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        match self {
            SignatureScheme::Ed25519 => HashAlgorithm::Sha512,
        }
    }

    /// The scheme usable with `key` whose digest is among `accepted`.
    pub fn select(key: KeyAlgorithm, accepted: &[HashAlgorithm]) -> Result<SignatureScheme> {
        SignatureScheme::ALL
            .iter()
            .copied()
            .find(|scheme| {
                scheme.key_algorithm() == key && accepted.contains(&scheme.hash_algorithm())
            })
            .ok_or_else(|| {
                NegotiationError::NoCompatibleScheme(format!(
                    "{} key and accepted algorithms {:?}",
                    key, accepted
                ))
            })
    }

    pub fn sign(&self, key: &SigningKey, bytes: &[u8]) -> Vec<u8> {
        match self {
            SignatureScheme::Ed25519 => key.sign(bytes).to_bytes().to_vec(),
        }
    }

    pub fn verify(&self, key: &PublicKey, bytes: &[u8], sum: &[u8]) -> bool {
        if key.algorithm() != self.key_algorithm() {
            return false;
        }
        match self {
            SignatureScheme::Ed25519 => {
                let Ok(verifying_key) = key.verifying_key() else {
                    return false;
                };
                let Ok(sum) = <[u8; ED25519_SIGNATURE_SIZE]>::try_from(sum) else {
                    return false;
                };
                let signature = ed25519_dalek::Signature::from_bytes(&sum);
                verifying_key.verify(bytes, &signature).is_ok()
            }
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureScheme::Ed25519 => f.write_str("ED25519"),
        }
    }
}

/// Signature embedded in a signed message.
///
/// `sum` is absent while the message is being signed, so the signed bytes
/// commit to the timestamp and scheme but not to the sum itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "serde_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub scheme: SignatureScheme,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "super::base64_opt"
    )]
    pub sum: Option<Vec<u8>>,
}

impl Signature {
    pub fn unsigned(timestamp: DateTime<Utc>, scheme: SignatureScheme) -> Self {
        Self {
            timestamp: crate::clock::canonical(timestamp),
            scheme,
            sum: None,
        }
    }
}
