use async_trait::async_trait;
use thiserror::Error;

use crate::model::{NegotiationId, NegotiationStatus, SignedMessage, TrustedContractOffer};
use crate::party::Party;
use crate::security::Hash;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Counter-party unreachable: {0}")]
    Unreachable(String),

    #[error("Failed to send: {0}")]
    SendFailed(String),

    #[error("Counter-party refused the message: {0}")]
    Refused(String),

    #[error("Failed to fetch definitions: {0}")]
    FetchFailed(String),

    #[error("Operation timed out")]
    Timeout,
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContractRelay: Send + Sync {
    /// Delivers a signed message. `Ok` means the counter-party has it.
    async fn send_to_counter_party(
        &self,
        message: &SignedMessage,
        receiver: &Party,
    ) -> RelayResult<()>;

    /// Tells the local event handler the negotiation changed. Best effort.
    async fn send_to_event_handler(
        &self,
        negotiation_id: NegotiationId,
        offer: Option<TrustedContractOffer>,
        status: NegotiationStatus,
    ) -> RelayResult<()>;

    /// Asks the counter-party for the definitions behind `hashes`. May
    /// return fewer messages than requested.
    async fn get_from_counter_party(
        &self,
        hashes: &[Hash],
        counter_party: &Party,
    ) -> RelayResult<Vec<SignedMessage>>;
}

/// In-process relay that records everything, for wiring proxies together in
/// tests and demos.
pub mod memory {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct NegotiationEvent {
        pub negotiation_id: NegotiationId,
        pub offer: Option<TrustedContractOffer>,
        pub status: NegotiationStatus,
    }

    #[derive(Debug, Clone)]
    pub struct Envelope {
        pub receiver: String,
        pub message: SignedMessage,
    }

    #[derive(Debug, Default)]
    pub struct MemoryRelay {
        outbox: Mutex<Vec<Envelope>>,
        events: Mutex<Vec<NegotiationEvent>>,
        published: Mutex<Vec<SignedMessage>>,
        offline: AtomicBool,
    }

    impl MemoryRelay {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        pub fn publish(&self, message: SignedMessage) {
            self.published.lock().push(message);
        }

        pub fn drain_outbox(&self) -> Vec<Envelope> {
            std::mem::take(&mut *self.outbox.lock())
        }

        pub fn events(&self) -> Vec<NegotiationEvent> {
            self.events.lock().clone()
        }

        fn check_online(&self, target: &str) -> RelayResult<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(RelayError::Unreachable(target.to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ContractRelay for MemoryRelay {
        async fn send_to_counter_party(
            &self,
            message: &SignedMessage,
            receiver: &Party,
        ) -> RelayResult<()> {
            self.check_online(receiver.name())?;
            self.outbox.lock().push(Envelope {
                receiver: receiver.name().to_string(),
                message: message.clone(),
            });
            Ok(())
        }

        async fn send_to_event_handler(
            &self,
            negotiation_id: NegotiationId,
            offer: Option<TrustedContractOffer>,
            status: NegotiationStatus,
        ) -> RelayResult<()> {
            self.events.lock().push(NegotiationEvent {
                negotiation_id,
                offer,
                status,
            });
            Ok(())
        }

        async fn get_from_counter_party(
            &self,
            hashes: &[Hash],
            counter_party: &Party,
        ) -> RelayResult<Vec<SignedMessage>> {
            self.check_online(counter_party.name())?;
            let published = self.published.lock();
            let mut found = Vec::new();
            for hash in hashes {
                let hit = published.iter().find(|message| {
                    message
                        .canonical_bytes()
                        .map(|bytes| hash.verify(&bytes))
                        .unwrap_or(false)
                });
                if let Some(message) = hit {
                    found.push(message.clone());
                }
            }
            Ok(found)
        }
    }
}
