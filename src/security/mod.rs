//! Messages are canonicalized as JSON with a fixed field order, arguments
//! sorted by key and millisecond timestamps. Signed bytes are the same
//! encoding with the signature `sum` left out.

pub mod certificate;
pub mod hash;
pub mod signature;

pub use certificate::{Certificate, PublicKey};
pub use hash::{Hash, HashAlgorithm};
pub use signature::{KeyAlgorithm, Signature, SignatureScheme};

use serde::Serialize;

use crate::error::Result;

/// A message carrying its own signature.
pub trait Signable: Serialize + Clone {
    fn signature(&self) -> &Signature;

    fn signature_mut(&mut self) -> &mut Signature;

    /// Canonical encoding, including the signature sum when present.
    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Canonical encoding with the signature sum omitted.
    fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature_mut().sum = None;
        unsigned.canonical_bytes()
    }
}

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

pub(crate) mod base64_opt {
    use base64::{engine::general_purpose, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| {
            general_purpose::STANDARD
                .decode(s.as_bytes())
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
