//! # Contract Proxy
//!
//! A negotiation engine letting two administrative domains reach signed,
//! verifiable agreement on structured contracts without a trusted third party.
//!
//! ## Architecture
//!
//! - **Security**: hash algorithms, Ed25519 signatures and party certificates
//! - **Templates**: parameterized contract texts addressed by content hash
//! - **Parties**: owned (signing) and counter (verify-only) identities
//! - **Negotiation**: per-negotiation state machine with a two-phase outbound commit
//! - **Definition Bank**: content-addressed store of every signed message
//! - **Relay**: async seam for delivery, notification and definition fetches
//! - **Proxy**: the six offer/accept/reject entry points tying it together

pub mod bank;
pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod negotiation;
pub mod negotiations;
pub mod party;
pub mod proxy;
pub mod relay;
pub mod security;
pub mod template;

pub use bank::DefinitionBank;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, Settings};
pub use error::{BadRequestKind, NegotiationError, Result};
pub use model::{
    Contract, NegotiationId, NegotiationStatus, SignedContractAcceptance, SignedContractOffer,
    SignedContractRejection, SignedMessage, TrustedContract, TrustedContractAcceptance,
    TrustedContractOffer, TrustedContractRejection,
};
pub use negotiation::ContractNegotiation;
pub use negotiations::{ContractNegotiations, PartyPair};
pub use party::{Parties, Party, PartyKind};
pub use proxy::ContractProxy;
pub use relay::{ContractRelay, RelayError, RelayResult};
pub use security::{Certificate, Hash, HashAlgorithm, PublicKey, Signature, SignatureScheme};
pub use template::{Template, Templates};
