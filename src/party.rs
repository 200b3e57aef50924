use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;

use crate::config::Settings;
use crate::error::{BadRequestKind, NegotiationError, Result};
use crate::security::{Certificate, Hash, HashAlgorithm, Signature, SignatureScheme};

/// Signing capability of an owned party.
pub struct OwnedKey {
    signing_key: SigningKey,
    scheme: SignatureScheme,
}

impl OwnedKey {
    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    /// Signs `bytes`; `bytes` must already commit to `timestamp`.
    pub fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.scheme.sign(&self.signing_key, bytes)
    }
}

impl std::fmt::Debug for OwnedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedKey")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum PartyKind {
    Owned(OwnedKey),
    Counter,
}

#[derive(Debug)]
pub struct Party {
    name: String,
    certificate: Certificate,
    fingerprints: Vec<Hash>,
    preferred_fingerprint: Hash,
    kind: PartyKind,
}

impl Party {
    pub fn counter(certificate: Certificate, settings: &Settings, now: DateTime<Utc>) -> Result<Self> {
        Self::build(certificate, PartyKind::Counter, settings, now)
    }

    pub fn owned(
        certificate: Certificate,
        signing_key: SigningKey,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let public = certificate.public_key.verifying_key()?;
        if public != signing_key.verifying_key() {
            return Err(NegotiationError::Certificate(format!(
                "private key does not match certificate of '{}'",
                certificate.common_name
            )));
        }
        let scheme = SignatureScheme::select(
            certificate.public_key.algorithm(),
            &settings.accepted_hash_algorithms,
        )?;
        Self::build(
            certificate,
            PartyKind::Owned(OwnedKey {
                signing_key,
                scheme,
            }),
            settings,
            now,
        )
    }

    fn build(
        certificate: Certificate,
        kind: PartyKind,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        certificate.check_validity(now, settings.certificate_tolerance)?;

        let name = certificate.common_name.trim().to_string();
        if name.is_empty() {
            return Err(NegotiationError::Certificate(
                "certificate has no common name".to_string(),
            ));
        }

        let fingerprints = settings
            .accepted_hash_algorithms
            .iter()
            .map(|alg| certificate.fingerprint(*alg))
            .collect::<Result<Vec<_>>>()?;
        let preferred_fingerprint =
            certificate.fingerprint(settings.preferred_hash_algorithm())?;

        Ok(Self {
            name,
            certificate,
            fingerprints,
            preferred_fingerprint,
            kind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn fingerprints(&self) -> &[Hash] {
        &self.fingerprints
    }

    pub fn preferred_fingerprint(&self) -> &Hash {
        &self.preferred_fingerprint
    }

    pub fn fingerprint(&self, algorithm: HashAlgorithm) -> Option<&Hash> {
        self.fingerprints.iter().find(|h| h.algorithm() == algorithm)
    }

    pub fn has_fingerprint(&self, fingerprint: &Hash) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.kind, PartyKind::Owned(_))
    }

    pub fn kind(&self) -> &PartyKind {
        &self.kind
    }

    pub fn owned_key(&self) -> Result<&OwnedKey> {
        match &self.kind {
            PartyKind::Owned(key) => Ok(key),
            PartyKind::Counter => Err(NegotiationError::NotOwned(self.name.clone())),
        }
    }

    /// Checks `signature` over `bytes` against this party's certificate.
    pub fn verify(&self, bytes: &[u8], signature: &Signature, settings: &Settings) -> Result<()> {
        let digest = signature.scheme.hash_algorithm();
        if !settings.accepts(digest) {
            return Err(NegotiationError::bad_request(
                BadRequestKind::UnsupportedHashAlgorithm,
                format!("signature scheme {} uses {}", signature.scheme, digest),
            ));
        }
        let Some(sum) = signature.sum.as_deref() else {
            return Err(NegotiationError::bad_request(
                BadRequestKind::BadSignature,
                format!("message from '{}' is unsigned", self.name),
            ));
        };
        if !signature
            .scheme
            .verify(&self.certificate.public_key, bytes, sum)
        {
            return Err(NegotiationError::bad_request(
                BadRequestKind::BadSignature,
                format!("signature does not match certificate of '{}'", self.name),
            ));
        }
        Ok(())
    }
}

/// Registry of every known party.
#[derive(Debug, Default)]
pub struct Parties {
    by_name: HashMap<String, Arc<Party>>,
    by_fingerprint: HashMap<Hash, Arc<Party>>,
    accepted: Vec<HashAlgorithm>,
}

impl Parties {
    pub fn new(parties: impl IntoIterator<Item = Party>, settings: &Settings) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut by_fingerprint = HashMap::new();

        for party in parties {
            let party = Arc::new(party);
            if by_name.insert(party.name.clone(), party.clone()).is_some() {
                return Err(NegotiationError::Ambiguous(format!(
                    "party name '{}' is used twice",
                    party.name
                )));
            }
            for fingerprint in &party.fingerprints {
                if let Some(existing) = by_fingerprint.insert(fingerprint.clone(), party.clone()) {
                    return Err(NegotiationError::Ambiguous(format!(
                        "parties '{}' and '{}' share fingerprint {}",
                        existing.name, party.name, fingerprint
                    )));
                }
            }
        }

        Ok(Self {
            by_name,
            by_fingerprint,
            accepted: settings.accepted_hash_algorithms.clone(),
        })
    }

    fn unknown(what: String) -> NegotiationError {
        NegotiationError::bad_request(BadRequestKind::UnknownParty, what)
    }

    pub fn get_any_by_name(&self, name: &str) -> Result<Arc<Party>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Self::unknown(format!("no party named '{}'", name)))
    }

    pub fn get_owned_by_name(&self, name: &str) -> Result<Arc<Party>> {
        self.get_any_by_name(name)
            .ok()
            .filter(|p| p.is_owned())
            .ok_or_else(|| Self::unknown(format!("no owned party named '{}'", name)))
    }

    pub fn get_counter_by_name(&self, name: &str) -> Result<Arc<Party>> {
        self.get_any_by_name(name)
            .ok()
            .filter(|p| !p.is_owned())
            .ok_or_else(|| Self::unknown(format!("no counter-party named '{}'", name)))
    }

    pub fn get_any_by_fingerprint(&self, fingerprint: &Hash) -> Result<Arc<Party>> {
        if !self.accepted.contains(&fingerprint.algorithm()) {
            return Err(NegotiationError::bad_request(
                BadRequestKind::UnsupportedHashAlgorithm,
                format!("fingerprint uses {}", fingerprint.algorithm()),
            ));
        }
        self.by_fingerprint
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| Self::unknown(format!("no party with fingerprint {}", fingerprint)))
    }

    pub fn get_owned_by_fingerprint(&self, fingerprint: &Hash) -> Result<Arc<Party>> {
        let party = self.get_any_by_fingerprint(fingerprint)?;
        if !party.is_owned() {
            return Err(Self::unknown(format!(
                "no owned party with fingerprint {}",
                fingerprint
            )));
        }
        Ok(party)
    }

    pub fn get_counter_by_fingerprint(&self, fingerprint: &Hash) -> Result<Arc<Party>> {
        let party = self.get_any_by_fingerprint(fingerprint)?;
        if party.is_owned() {
            return Err(Self::unknown(format!(
                "no counter-party with fingerprint {}",
                fingerprint
            )));
        }
        Ok(party)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::security::PublicKey;
    use chrono::Duration;
    use rand::rngs::OsRng;

    pub(crate) fn certificate_for(name: &str, key: &SigningKey, now: DateTime<Utc>) -> Certificate {
        Certificate::new(
            name,
            now - Duration::days(30),
            now + Duration::days(365),
            PublicKey::from_verifying_key(&key.verifying_key()),
        )
    }

    pub(crate) fn owned(name: &str, settings: &Settings, now: DateTime<Utc>) -> Party {
        let key = SigningKey::generate(&mut OsRng);
        Party::owned(certificate_for(name, &key, now), key, settings, now).unwrap()
    }

    pub(crate) fn counter_with_key(
        name: &str,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> (Party, SigningKey) {
        let key = SigningKey::generate(&mut OsRng);
        let party = Party::counter(certificate_for(name, &key, now), settings, now).unwrap();
        (party, key)
    }

    #[test]
    fn test_owned_party_signs_and_verifies() {
        let settings = Settings::default();
        let now = Utc::now();
        let buyer = owned("Buyer", &settings, now);

        let key = buyer.owned_key().unwrap();
        let mut signature = Signature::unsigned(now, key.scheme());
        signature.sum = Some(key.sign(b"payload"));

        assert!(buyer.verify(b"payload", &signature, &settings).is_ok());
        let err = buyer.verify(b"other", &signature, &settings).unwrap_err();
        assert_eq!(err.kind(), Some(BadRequestKind::BadSignature));
    }

    #[test]
    fn test_counter_party_cannot_sign() {
        let settings = Settings::default();
        let (seller, _) = counter_with_key("Seller", &settings, Utc::now());
        assert!(matches!(seller.owned_key(), Err(NegotiationError::NotOwned(_))));
    }

    #[test]
    fn test_owned_party_needs_matching_key_and_scheme() {
        let now = Utc::now();
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let cert = certificate_for("Buyer", &key, now);

        let err = Party::owned(cert.clone(), other, &Settings::default(), now).unwrap_err();
        assert!(matches!(err, NegotiationError::Certificate(_)));

        let sha256_only = Settings {
            accepted_hash_algorithms: vec![HashAlgorithm::Sha256],
            ..Settings::default()
        };
        let err = Party::owned(cert, key, &sha256_only, now).unwrap_err();
        assert!(matches!(err, NegotiationError::NoCompatibleScheme(_)));
    }

    #[test]
    fn test_expired_certificate_refused() {
        let settings = Settings::default();
        let now = Utc::now();
        let key = SigningKey::generate(&mut OsRng);
        let cert = Certificate::new(
            "Old",
            now - Duration::days(400),
            now - Duration::days(30),
            PublicKey::from_verifying_key(&key.verifying_key()),
        );
        assert!(Party::counter(cert, &settings, now).is_err());
    }

    #[test]
    fn test_registry_partitions_owned_and_counter() {
        let settings = Settings::default();
        let now = Utc::now();
        let buyer = owned("Buyer", &settings, now);
        let (seller, _) = counter_with_key("Seller", &settings, now);
        let buyer_fp = buyer.preferred_fingerprint().clone();
        let seller_fp = seller.fingerprint(HashAlgorithm::Blake3).unwrap().clone();

        let parties = Parties::new(vec![buyer, seller], &settings).unwrap();

        assert_eq!(parties.get_owned_by_name("Buyer").unwrap().name(), "Buyer");
        assert_eq!(
            parties.get_counter_by_name("Buyer").unwrap_err().kind(),
            Some(BadRequestKind::UnknownParty)
        );
        assert_eq!(parties.get_counter_by_fingerprint(&seller_fp).unwrap().name(), "Seller");
        assert!(parties.get_counter_by_fingerprint(&buyer_fp).is_err());
        assert!(parties.get_owned_by_fingerprint(&buyer_fp).is_ok());
    }

    #[test]
    fn test_registry_rejects_unaccepted_fingerprint_algorithm() {
        let settings = Settings::default();
        let now = Utc::now();
        let (seller, _) = counter_with_key("Seller", &settings, now);
        let sha384 = seller.certificate().fingerprint(HashAlgorithm::Sha384).unwrap();
        let parties = Parties::new(vec![seller], &settings).unwrap();

        let err = parties.get_any_by_fingerprint(&sha384).unwrap_err();
        assert_eq!(err.kind(), Some(BadRequestKind::UnsupportedHashAlgorithm));
    }

    #[test]
    fn test_registry_refuses_duplicate_names() {
        let settings = Settings::default();
        let now = Utc::now();
        let a = owned("Buyer", &settings, now);
        let (b, _) = counter_with_key("Buyer", &settings, now);
        assert!(matches!(
            Parties::new(vec![a, b], &settings),
            Err(NegotiationError::Ambiguous(_))
        ));
    }
}
