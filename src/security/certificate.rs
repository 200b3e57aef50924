use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use super::hash::{Hash, HashAlgorithm};
use super::signature::KeyAlgorithm;
use crate::clock::serde_timestamp;
use crate::error::{NegotiationError, Result};

/// Size of an Ed25519 public key in bytes
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    algorithm: KeyAlgorithm,
    #[serde(with = "super::base64_bytes")]
    key: Vec<u8>,
}

impl PublicKey {
    pub fn new(algorithm: KeyAlgorithm, key: Vec<u8>) -> Result<Self> {
        let public = Self { algorithm, key };
        public.verifying_key()?;
        Ok(public)
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self {
            algorithm: KeyAlgorithm::Ed25519,
            key: key.to_bytes().to_vec(),
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        match self.algorithm {
            KeyAlgorithm::Ed25519 => {
                let bytes = <[u8; ED25519_PUBLIC_KEY_SIZE]>::try_from(self.key.as_slice())
                    .map_err(|_| {
                        NegotiationError::Certificate(format!(
                            "invalid key length: expected {}, got {}",
                            ED25519_PUBLIC_KEY_SIZE,
                            self.key.len()
                        ))
                    })?;
                VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| NegotiationError::Certificate(format!("invalid key: {}", e)))
            }
        }
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = hex::encode(&self.key);
        write!(f, "PublicKey({}, {}...)", self.algorithm, &hex[..hex.len().min(16)])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub common_name: String,
    #[serde(with = "serde_timestamp")]
    pub not_before: DateTime<Utc>,
    #[serde(with = "serde_timestamp")]
    pub not_after: DateTime<Utc>,
    pub public_key: PublicKey,
}

impl Certificate {
    pub fn new(
        common_name: impl Into<String>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        public_key: PublicKey,
    ) -> Self {
        Self {
            common_name: common_name.into(),
            not_before: crate::clock::canonical(not_before),
            not_after: crate::clock::canonical(not_after),
            public_key,
        }
    }

    /// Rejects certificates outside their validity window, allowing
    /// `tolerance` on either side.
    pub fn check_validity(&self, now: DateTime<Utc>, tolerance: Duration) -> Result<()> {
        if self.not_before > self.not_after {
            return Err(NegotiationError::Certificate(format!(
                "certificate of '{}' has an empty validity window",
                self.common_name
            )));
        }
        if now + tolerance < self.not_before {
            return Err(NegotiationError::Certificate(format!(
                "certificate of '{}' is not valid before {}",
                self.common_name,
                crate::clock::format(&self.not_before)
            )));
        }
        if now - tolerance > self.not_after {
            return Err(NegotiationError::Certificate(format!(
                "certificate of '{}' expired at {}",
                self.common_name,
                crate::clock::format(&self.not_after)
            )));
        }
        Ok(())
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn fingerprint(&self, algorithm: HashAlgorithm) -> Result<Hash> {
        Ok(Hash::compute(algorithm, &self.canonical_bytes()?))
    }
}
