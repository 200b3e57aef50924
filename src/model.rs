use crate::clock::serde_timestamp;
use crate::error::{BadRequestKind, NegotiationError, Result};
use crate::security::{Hash, Signable, Signature};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Id of a negotiation, unique per unordered pair of parties.
pub type NegotiationId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub template_hash: Hash,
    pub arguments: BTreeMap<String, String>,
}

impl Contract {
    pub fn new(template_hash: Hash, arguments: BTreeMap<String, String>) -> Self {
        Self {
            template_hash,
            arguments,
        }
    }

    /// Argument values written in hash text form, i.e. references to
    /// other definitions.
    pub fn referenced_hashes(&self) -> impl Iterator<Item = Hash> + '_ {
        self.arguments.values().filter_map(|value| value.parse().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedContractOffer {
    pub negotiation_id: NegotiationId,
    pub offeror_fingerprint: Hash,
    pub receiver_fingerprint: Hash,
    #[serde(with = "serde_timestamp")]
    pub valid_after: DateTime<Utc>,
    #[serde(with = "serde_timestamp")]
    pub valid_until: DateTime<Utc>,
    pub contracts: Vec<Contract>,
    pub signature: Signature,
}

impl SignedContractOffer {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until < now
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        check_offer_terms(&self.contracts, self.valid_after, self.valid_until, now)
    }
}

fn check_offer_terms<T>(
    contracts: &[T],
    valid_after: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    if contracts.is_empty() {
        return Err(NegotiationError::bad_request(
            BadRequestKind::NoContracts,
            "offer must contain at least one contract",
        ));
    }
    if valid_after > valid_until {
        return Err(NegotiationError::bad_request(
            BadRequestKind::ConflictingTimeConstraints,
            format!(
                "validAfter {} is later than validUntil {}",
                crate::clock::format(&valid_after),
                crate::clock::format(&valid_until)
            ),
        ));
    }
    if valid_until < now {
        return Err(NegotiationError::bad_request(
            BadRequestKind::AlreadyExpired,
            format!("offer expired at {}", crate::clock::format(&valid_until)),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedContractAcceptance {
    pub negotiation_id: NegotiationId,
    pub acceptor_fingerprint: Hash,
    pub offeror_fingerprint: Hash,
    pub offer_hash: Hash,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedContractRejection {
    pub negotiation_id: NegotiationId,
    pub rejector_fingerprint: Hash,
    pub offeror_fingerprint: Hash,
    pub offer_hash: Hash,
    pub signature: Signature,
}

macro_rules! impl_signable {
    ($($message:ty),*) => {
        $(
            impl Signable for $message {
                fn signature(&self) -> &Signature {
                    &self.signature
                }

                fn signature_mut(&mut self) -> &mut Signature {
                    &mut self.signature
                }
            }
        )*
    };
}

impl_signable!(
    SignedContractOffer,
    SignedContractAcceptance,
    SignedContractRejection
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Offer,
    Acceptance,
    Rejection,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Offer => f.write_str("offer"),
            MessageKind::Acceptance => f.write_str("acceptance"),
            MessageKind::Rejection => f.write_str("rejection"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignedMessage {
    Offer(SignedContractOffer),
    Acceptance(SignedContractAcceptance),
    Rejection(SignedContractRejection),
}

impl SignedMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SignedMessage::Offer(_) => MessageKind::Offer,
            SignedMessage::Acceptance(_) => MessageKind::Acceptance,
            SignedMessage::Rejection(_) => MessageKind::Rejection,
        }
    }

    pub fn negotiation_id(&self) -> NegotiationId {
        match self {
            SignedMessage::Offer(m) => m.negotiation_id,
            SignedMessage::Acceptance(m) => m.negotiation_id,
            SignedMessage::Rejection(m) => m.negotiation_id,
        }
    }

    pub fn sender_fingerprint(&self) -> &Hash {
        match self {
            SignedMessage::Offer(m) => &m.offeror_fingerprint,
            SignedMessage::Acceptance(m) => &m.acceptor_fingerprint,
            SignedMessage::Rejection(m) => &m.rejector_fingerprint,
        }
    }

    pub fn receiver_fingerprint(&self) -> &Hash {
        match self {
            SignedMessage::Offer(m) => &m.receiver_fingerprint,
            SignedMessage::Acceptance(m) => &m.offeror_fingerprint,
            SignedMessage::Rejection(m) => &m.offeror_fingerprint,
        }
    }

    pub fn signature(&self) -> &Signature {
        match self {
            SignedMessage::Offer(m) => m.signature(),
            SignedMessage::Acceptance(m) => m.signature(),
            SignedMessage::Rejection(m) => m.signature(),
        }
    }

    /// Canonical bytes of the inner message; the content address.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        match self {
            SignedMessage::Offer(m) => m.canonical_bytes(),
            SignedMessage::Acceptance(m) => m.canonical_bytes(),
            SignedMessage::Rejection(m) => m.canonical_bytes(),
        }
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        match self {
            SignedMessage::Offer(m) => m.signing_bytes(),
            SignedMessage::Acceptance(m) => m.signing_bytes(),
            SignedMessage::Rejection(m) => m.signing_bytes(),
        }
    }

    pub fn referenced_hashes(&self) -> Vec<Hash> {
        match self {
            SignedMessage::Offer(m) => m
                .contracts
                .iter()
                .flat_map(Contract::referenced_hashes)
                .collect(),
            SignedMessage::Acceptance(m) => vec![m.offer_hash.clone()],
            SignedMessage::Rejection(m) => vec![m.offer_hash.clone()],
        }
    }
}

impl From<SignedContractOffer> for SignedMessage {
    fn from(offer: SignedContractOffer) -> Self {
        SignedMessage::Offer(offer)
    }
}

impl From<SignedContractAcceptance> for SignedMessage {
    fn from(acceptance: SignedContractAcceptance) -> Self {
        SignedMessage::Acceptance(acceptance)
    }
}

impl From<SignedContractRejection> for SignedMessage {
    fn from(rejection: SignedContractRejection) -> Self {
        SignedMessage::Rejection(rejection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationStatus {
    Initial,
    Offering,
    Accepted,
    Rejected,
    Expired,
}

impl NegotiationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationStatus::Accepted | NegotiationStatus::Rejected | NegotiationStatus::Expired
        )
    }
}

impl fmt::Display for NegotiationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationStatus::Initial => "INITIAL",
            NegotiationStatus::Offering => "OFFERING",
            NegotiationStatus::Accepted => "ACCEPTED",
            NegotiationStatus::Rejected => "REJECTED",
            NegotiationStatus::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedContract {
    pub template_name: String,
    pub arguments: BTreeMap<String, String>,
}

impl TrustedContract {
    pub fn new(template_name: impl Into<String>) -> Self {
        Self {
            template_name: template_name.into(),
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

/// Locally authorized offer, not yet signed or sent. Without an id it
/// opens a new negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedContractOffer {
    pub negotiation_id: Option<NegotiationId>,
    pub offeror_name: String,
    pub receiver_name: String,
    #[serde(with = "serde_timestamp")]
    pub valid_after: DateTime<Utc>,
    #[serde(with = "serde_timestamp")]
    pub valid_until: DateTime<Utc>,
    pub contracts: Vec<TrustedContract>,
}

impl TrustedContractOffer {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        check_offer_terms(&self.contracts, self.valid_after, self.valid_until, now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedContractAcceptance {
    pub negotiation_id: NegotiationId,
    pub acceptor_name: String,
    pub offeror_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedContractRejection {
    pub negotiation_id: NegotiationId,
    pub rejector_name: String,
    pub offeror_name: String,
}
