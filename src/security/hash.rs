use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{NegotiationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
    Blake3,
}

struct Descriptor {
    name: &'static str,
    digest_len: usize,
    collision_safe: bool,
}

const SHA_256: Descriptor = Descriptor {
    name: "SHA-256",
    digest_len: 32,
    collision_safe: true,
};
const SHA_384: Descriptor = Descriptor {
    name: "SHA-384",
    digest_len: 48,
    collision_safe: true,
};
const SHA_512: Descriptor = Descriptor {
    name: "SHA-512",
    digest_len: 64,
    collision_safe: true,
};
const BLAKE3: Descriptor = Descriptor {
    name: "BLAKE3",
    digest_len: 32,
    collision_safe: true,
};

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
        HashAlgorithm::Blake3,
    ];

    fn descriptor(&self) -> &'static Descriptor {
        match self {
            HashAlgorithm::Sha256 => &SHA_256,
            HashAlgorithm::Sha384 => &SHA_384,
            HashAlgorithm::Sha512 => &SHA_512,
            HashAlgorithm::Blake3 => &BLAKE3,
        }
    }

    pub fn name(&self) -> &'static str {
        self.descriptor().name
    }

    pub fn digest_len(&self) -> usize {
        self.descriptor().digest_len
    }

    pub fn is_collision_safe(&self) -> bool {
        self.descriptor().collision_safe
    }

    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(bytes).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(bytes).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(bytes).to_vec(),
            HashAlgorithm::Blake3 => blake3::hash(bytes).as_bytes().to_vec(),
        }
    }

    /// First collision-safe algorithm in `accepted`, else the first one.
    pub fn preferred(accepted: &[HashAlgorithm]) -> Option<HashAlgorithm> {
        accepted
            .iter()
            .copied()
            .find(HashAlgorithm::is_collision_safe)
            .or_else(|| accepted.first().copied())
    }
}

impl FromStr for HashAlgorithm {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self> {
        HashAlgorithm::ALL
            .iter()
            .copied()
            .find(|alg| alg.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| NegotiationError::UnsupportedAlgorithm(s.to_string()))
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for HashAlgorithm {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for HashAlgorithm {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Digest of some bytes under a named algorithm.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "WireHash")]
pub struct Hash {
    algorithm: HashAlgorithm,
    #[serde(with = "super::base64_bytes")]
    sum: Vec<u8>,
}

#[derive(Deserialize)]
struct WireHash {
    algorithm: HashAlgorithm,
    #[serde(with = "super::base64_bytes")]
    sum: Vec<u8>,
}

impl TryFrom<WireHash> for Hash {
    type Error = NegotiationError;

    fn try_from(wire: WireHash) -> Result<Self> {
        Hash::new(wire.algorithm, wire.sum)
    }
}

impl Hash {
    pub fn new(algorithm: HashAlgorithm, sum: Vec<u8>) -> Result<Self> {
        if sum.len() != algorithm.digest_len() {
            return Err(NegotiationError::Serialization(format!(
                "{} digest must be {} bytes, got {}",
                algorithm,
                algorithm.digest_len(),
                sum.len()
            )));
        }
        Ok(Self { algorithm, sum })
    }

    pub fn compute(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            sum: algorithm.digest(bytes),
        }
    }

    /// One hash per algorithm, in the given order.
    pub fn compute_all(algorithms: &[HashAlgorithm], bytes: &[u8]) -> Vec<Self> {
        algorithms
            .iter()
            .map(|alg| Self::compute(*alg, bytes))
            .collect()
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn sum(&self) -> &[u8] {
        &self.sum
    }

    /// Checks that `bytes` digest to this hash.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        let digest = self.algorithm.digest(bytes);
        bool::from(digest.as_slice().ct_eq(self.sum.as_slice()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.sum)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Hash({}:{}...)", self.algorithm, &hex[..hex.len().min(16)])
    }
}

/// Parses the `<ALGORITHM>:<hex>` text form.
impl FromStr for Hash {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, hex_sum) = s
            .split_once(':')
            .ok_or_else(|| NegotiationError::Serialization(format!("not a hash: {}", s)))?;
        let algorithm: HashAlgorithm = algorithm.parse()?;
        let sum = hex::decode(hex_sum)
            .map_err(|e| NegotiationError::Serialization(format!("bad hash digest: {}", e)))?;
        Hash::new(algorithm, sum)
    }
}
