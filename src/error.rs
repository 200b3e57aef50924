use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::relay::RelayError;
use crate::security::Hash;

pub type Result<T> = std::result::Result<T, NegotiationError>;

/// Machine-readable tag attached to every unsatisfiable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BadRequestKind {
    UnknownParty,
    UnknownNegotiation,
    UnknownTemplate,
    NoContracts,
    AlreadyExpired,
    ConflictingTimeConstraints,
    BadTimestamp,
    BadHash,
    BadSignature,
    AwaitTurn,
    NegotiationAccepted,
    NegotiationRejected,
    NegotiationExpired,
    UnsupportedHashAlgorithm,
    InvalidContract,
}

impl BadRequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadRequestKind::UnknownParty => "UNKNOWN_PARTY",
            BadRequestKind::UnknownNegotiation => "UNKNOWN_NEGOTIATION",
            BadRequestKind::UnknownTemplate => "UNKNOWN_TEMPLATE",
            BadRequestKind::NoContracts => "NO_CONTRACTS",
            BadRequestKind::AlreadyExpired => "ALREADY_EXPIRED",
            BadRequestKind::ConflictingTimeConstraints => "CONFLICTING_TIME_CONSTRAINTS",
            BadRequestKind::BadTimestamp => "BAD_TIMESTAMP",
            BadRequestKind::BadHash => "BAD_HASH",
            BadRequestKind::BadSignature => "BAD_SIGNATURE",
            BadRequestKind::AwaitTurn => "AWAIT_TURN",
            BadRequestKind::NegotiationAccepted => "NEGOTIATION_ACCEPTED",
            BadRequestKind::NegotiationRejected => "NEGOTIATION_REJECTED",
            BadRequestKind::NegotiationExpired => "NEGOTIATION_EXPIRED",
            BadRequestKind::UnsupportedHashAlgorithm => "UNSUPPORTED_HASH_ALGORITHM",
            BadRequestKind::InvalidContract => "INVALID_CONTRACT",
        }
    }
}

impl fmt::Display for BadRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("{kind}: {message}")]
    BadRequest {
        kind: BadRequestKind,
        message: String,
    },

    #[error("Contract using template '{template}' is invalid: {}", problems.join("; "))]
    ContractInvalid {
        template: String,
        problems: Vec<String>,
    },

    #[error("Hash collision: {hash} already maps to a different definition")]
    HashCollision { hash: Hash },

    #[error("Failed to allocate a unique negotiation id after {attempts} attempts")]
    IdGenerationExhausted { attempts: u32 },

    #[error("Template of a validated contract vanished: {0}")]
    TemplateVanished(String),

    #[error("Prepared message does not match negotiation state: {0}")]
    StalePreparation(String),

    #[error("Certificate rejected: {0}")]
    Certificate(String),

    #[error("No signature scheme compatible with {0}")]
    NoCompatibleScheme(String),

    #[error("Ambiguous registry entry: {0}")]
    Ambiguous(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Party cannot sign: {0}")]
    NotOwned(String),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl NegotiationError {
    pub fn bad_request(kind: BadRequestKind, message: impl Into<String>) -> Self {
        NegotiationError::BadRequest {
            kind,
            message: message.into(),
        }
    }

    /// Tag of an unsatisfiable request, `None` for every other failure.
    pub fn kind(&self) -> Option<BadRequestKind> {
        match self {
            NegotiationError::BadRequest { kind, .. } => Some(*kind),
            NegotiationError::ContractInvalid { .. } => Some(BadRequestKind::InvalidContract),
            NegotiationError::UnsupportedAlgorithm(_) => {
                Some(BadRequestKind::UnsupportedHashAlgorithm)
            }
            _ => None,
        }
    }

    /// Broken internal invariants. These are never patched over.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NegotiationError::HashCollision { .. }
                | NegotiationError::IdGenerationExhausted { .. }
                | NegotiationError::TemplateVanished(_)
                | NegotiationError::StalePreparation(_)
        )
    }
}

impl From<serde_json::Error> for NegotiationError {
    fn from(err: serde_json::Error) -> Self {
        NegotiationError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for NegotiationError {
    fn from(err: std::io::Error) -> Self {
        NegotiationError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for NegotiationError {
    fn from(err: toml::de::Error) -> Self {
        NegotiationError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        let err = NegotiationError::bad_request(BadRequestKind::AwaitTurn, "not your turn");
        assert_eq!(err.kind(), Some(BadRequestKind::AwaitTurn));
        assert_eq!(err.to_string(), "AWAIT_TURN: not your turn");
        assert!(!err.is_fatal());

        let invalid = NegotiationError::ContractInvalid {
            template: "simple-purchase".to_string(),
            problems: vec!["missing argument 'Quantity'".to_string()],
        };
        assert_eq!(invalid.kind(), Some(BadRequestKind::InvalidContract));
    }

    #[test]
    fn test_fatal_errors_carry_no_tag() {
        let err = NegotiationError::IdGenerationExhausted { attempts: 32 };
        assert!(err.is_fatal());
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn test_kind_serializes_as_tag() {
        let json = serde_json::to_string(&BadRequestKind::ConflictingTimeConstraints).unwrap();
        assert_eq!(json, "\"CONFLICTING_TIME_CONSTRAINTS\"");
    }
}
