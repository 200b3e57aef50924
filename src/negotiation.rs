//! Per-negotiation state machine.
//!
//! ```text
//! INITIAL --offer--> OFFERING --offer--> OFFERING
//!                       |--acceptance--> ACCEPTED
//!                       |--rejection---> REJECTED
//!                       `--(last offer elapsed, observed on update)--> EXPIRED
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::clock;
use crate::config::Settings;
use crate::error::{BadRequestKind, NegotiationError, Result};
use crate::model::{
    Contract, MessageKind, NegotiationId, NegotiationStatus, SignedContractAcceptance,
    SignedContractOffer, SignedContractRejection, SignedMessage, TrustedContract,
    TrustedContractOffer,
};
use crate::negotiations::PartyPair;
use crate::party::{OwnedKey, Party};
use crate::relay::ContractRelay;
use crate::security::{Hash, Signable, Signature};
use crate::template::Templates;

#[derive(Clone, Copy)]
pub struct UpdateContext<'a> {
    pub templates: &'a Templates,
    pub settings: &'a Settings,
    pub now: DateTime<Utc>,
}

#[derive(Debug)]
struct NegotiationLog {
    status: NegotiationStatus,
    offers: Vec<SignedContractOffer>,
    acceptance: Option<SignedContractAcceptance>,
    rejection: Option<SignedContractRejection>,
    /// Name of the party expected to act next.
    active: Option<String>,
    /// Set when the registry dropped this negotiation.
    retired: bool,
}

impl NegotiationLog {
    fn new() -> Self {
        Self {
            status: NegotiationStatus::Initial,
            offers: Vec::new(),
            acceptance: None,
            rejection: None,
            active: None,
            retired: false,
        }
    }
}

#[derive(Debug)]
pub struct ContractNegotiation {
    id: NegotiationId,
    parties: [Arc<Party>; 2],
    log: Mutex<NegotiationLog>,
}

/// A signed message built from a trusted request, not yet delivered.
#[derive(Debug)]
pub struct Prepared {
    negotiation_id: NegotiationId,
    offers_logged: usize,
    status: NegotiationStatus,
    receiver: Arc<Party>,
    message: SignedMessage,
}

impl Prepared {
    pub fn message(&self) -> &SignedMessage {
        &self.message
    }

    pub fn receiver(&self) -> &Arc<Party> {
        &self.receiver
    }

    /// Hands the message to `relay`. Only a successful send yields a
    /// [`Delivered`].
    pub async fn deliver(self, relay: &dyn ContractRelay) -> Result<Delivered> {
        relay
            .send_to_counter_party(&self.message, &self.receiver)
            .await?;
        Ok(Delivered(self))
    }
}

/// A prepared message the counter-party is known to have received.
#[derive(Debug)]
pub struct Delivered(Prepared);

impl Delivered {
    pub fn message(&self) -> &SignedMessage {
        &self.0.message
    }
}

impl ContractNegotiation {
    pub fn new(id: NegotiationId, party1: Arc<Party>, party2: Arc<Party>) -> Self {
        Self {
            id,
            parties: [party1, party2],
            log: Mutex::new(NegotiationLog::new()),
        }
    }

    pub fn id(&self) -> NegotiationId {
        self.id
    }

    pub fn parties(&self) -> &[Arc<Party>; 2] {
        &self.parties
    }

    pub fn pair(&self) -> PartyPair {
        PartyPair::new(self.parties[0].name(), self.parties[1].name())
    }

    pub fn involves(&self, name: &str) -> bool {
        self.parties.iter().any(|p| p.name() == name)
    }

    pub async fn lock(&self) -> NegotiationGuard<'_> {
        NegotiationGuard {
            negotiation: self,
            log: self.log.lock().await,
        }
    }

    /// Marks a negotiation nothing was ever committed to as retired, so a
    /// caller still holding it can no longer update it. Fails while the
    /// negotiation is busy.
    pub(crate) fn retire_if_pristine(&self) -> bool {
        let Ok(mut log) = self.log.try_lock() else {
            return false;
        };
        if log.retired || log.status != NegotiationStatus::Initial || !log.offers.is_empty() {
            return false;
        }
        log.retired = true;
        true
    }

    fn party_by_fingerprint(&self, fingerprint: &Hash) -> Result<&Arc<Party>> {
        self.parties
            .iter()
            .find(|p| p.has_fingerprint(fingerprint))
            .ok_or_else(|| {
                NegotiationError::bad_request(
                    BadRequestKind::UnknownParty,
                    format!(
                        "fingerprint {} is not a party of negotiation {}",
                        fingerprint, self.id
                    ),
                )
            })
    }

    fn counterpart_of(&self, party: &Party) -> Result<&Arc<Party>> {
        match &self.parties {
            [a, b] if a.name() == party.name() => Ok(b),
            [a, b] if b.name() == party.name() => Ok(a),
            _ => Err(NegotiationError::bad_request(
                BadRequestKind::UnknownParty,
                format!("'{}' is not a party of negotiation {}", party.name(), self.id),
            )),
        }
    }
}

pub struct NegotiationGuard<'a> {
    negotiation: &'a ContractNegotiation,
    log: MutexGuard<'a, NegotiationLog>,
}

fn sign<M: Signable>(message: &mut M, key: &OwnedKey) -> Result<()> {
    let bytes = message.signing_bytes()?;
    message.signature_mut().sum = Some(key.sign(&bytes));
    Ok(())
}

fn check_timestamp(signature: &Signature, ctx: &UpdateContext<'_>) -> Result<()> {
    let skew = if signature.timestamp > ctx.now {
        signature.timestamp - ctx.now
    } else {
        ctx.now - signature.timestamp
    };
    if skew > ctx.settings.timestamp_tolerance {
        return Err(NegotiationError::bad_request(
            BadRequestKind::BadTimestamp,
            format!(
                "signature timestamp {} is {}s away from now",
                clock::format(&signature.timestamp),
                skew.num_seconds()
            ),
        ));
    }
    Ok(())
}

impl<'a> NegotiationGuard<'a> {
    pub fn id(&self) -> NegotiationId {
        self.negotiation.id
    }

    pub fn status(&self) -> NegotiationStatus {
        self.log.status
    }

    pub fn offers(&self) -> &[SignedContractOffer] {
        &self.log.offers
    }

    pub fn last_offer(&self) -> Option<&SignedContractOffer> {
        self.log.offers.last()
    }

    pub fn acceptance(&self) -> Option<&SignedContractAcceptance> {
        self.log.acceptance.as_ref()
    }

    pub fn rejection(&self) -> Option<&SignedContractRejection> {
        self.log.rejection.as_ref()
    }

    /// Party expected to act next; `None` before the opening offer.
    pub fn active_party(&self) -> Option<&str> {
        self.log.active.as_deref()
    }

    pub fn is_retired(&self) -> bool {
        self.log.retired
    }

    /// Refuses updates the current state does not allow. An elapsed last
    /// offer moves the negotiation to EXPIRED here.
    fn check_can_update(
        &mut self,
        sender: &Party,
        kind: MessageKind,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = self.negotiation.id;
        if self.log.retired {
            return Err(NegotiationError::bad_request(
                BadRequestKind::UnknownNegotiation,
                format!("negotiation {} was discarded", id),
            ));
        }
        match self.log.status {
            NegotiationStatus::Initial => {
                if kind != MessageKind::Offer {
                    return Err(NegotiationError::bad_request(
                        BadRequestKind::UnknownNegotiation,
                        format!("negotiation {} has no offer to respond to", id),
                    ));
                }
                Ok(())
            }
            NegotiationStatus::Offering => {
                let elapsed = self
                    .log
                    .offers
                    .last()
                    .map_or(false, |offer| offer.is_expired(now));
                if elapsed {
                    self.log.status = NegotiationStatus::Expired;
                    info!(negotiation_id = id, "Negotiation expired");
                    return Err(NegotiationError::bad_request(
                        BadRequestKind::NegotiationExpired,
                        format!("last offer of negotiation {} has expired", id),
                    ));
                }
                if self.log.active.as_deref() != Some(sender.name()) {
                    return Err(NegotiationError::bad_request(
                        BadRequestKind::AwaitTurn,
                        format!("'{}' must wait for the other party to act", sender.name()),
                    ));
                }
                Ok(())
            }
            NegotiationStatus::Accepted => Err(NegotiationError::bad_request(
                BadRequestKind::NegotiationAccepted,
                format!("negotiation {} is already accepted", id),
            )),
            NegotiationStatus::Rejected => Err(NegotiationError::bad_request(
                BadRequestKind::NegotiationRejected,
                format!("negotiation {} is already rejected", id),
            )),
            NegotiationStatus::Expired => Err(NegotiationError::bad_request(
                BadRequestKind::NegotiationExpired,
                format!("negotiation {} has expired", id),
            )),
        }
    }

    fn current_offer(&self) -> Result<&SignedContractOffer> {
        self.log.offers.last().ok_or_else(|| {
            NegotiationError::bad_request(
                BadRequestKind::UnknownNegotiation,
                format!("negotiation {} has no offer to respond to", self.negotiation.id),
            )
        })
    }

    fn check_offer_hash(&self, offer_hash: &Hash, settings: &Settings) -> Result<()> {
        if !settings.accepts(offer_hash.algorithm()) {
            return Err(NegotiationError::bad_request(
                BadRequestKind::UnsupportedHashAlgorithm,
                format!("offer hash uses {}", offer_hash.algorithm()),
            ));
        }
        let last = self.current_offer()?;
        if !offer_hash.verify(&last.canonical_bytes()?) {
            return Err(NegotiationError::bad_request(
                BadRequestKind::BadHash,
                format!(
                    "offer hash {} does not match the last offer of negotiation {}",
                    offer_hash, self.negotiation.id
                ),
            ));
        }
        Ok(())
    }

    fn check_content(&self, message: &SignedMessage, ctx: &UpdateContext<'_>) -> Result<()> {
        match message {
            SignedMessage::Offer(offer) => {
                offer.validate(ctx.now)?;
                for contract in &offer.contracts {
                    ctx.templates.validate(contract)?;
                }
                Ok(())
            }
            SignedMessage::Acceptance(acceptance) => {
                self.check_offer_hash(&acceptance.offer_hash, ctx.settings)
            }
            SignedMessage::Rejection(rejection) => {
                self.check_offer_hash(&rejection.offer_hash, ctx.settings)
            }
        }
    }

    fn apply(&mut self, message: SignedMessage, receiver: &Party) {
        let kind = message.kind();
        match message {
            SignedMessage::Offer(offer) => {
                self.log.offers.push(offer);
                self.log.status = NegotiationStatus::Offering;
            }
            SignedMessage::Acceptance(acceptance) => {
                self.log.acceptance = Some(acceptance);
                self.log.status = NegotiationStatus::Accepted;
            }
            SignedMessage::Rejection(rejection) => {
                self.log.rejection = Some(rejection);
                self.log.status = NegotiationStatus::Rejected;
            }
        }
        self.log.active = Some(receiver.name().to_string());
        info!(
            negotiation_id = self.negotiation.id,
            %kind,
            status = %self.log.status,
            next = receiver.name(),
            "Negotiation updated"
        );
    }

    fn prepared(&self, message: SignedMessage, receiver: &Arc<Party>) -> Prepared {
        Prepared {
            negotiation_id: self.negotiation.id,
            offers_logged: self.log.offers.len(),
            status: self.log.status,
            receiver: receiver.clone(),
            message,
        }
    }

    pub fn prepare_offer(
        &mut self,
        ctx: &UpdateContext<'_>,
        offeror: &Party,
        valid_after: DateTime<Utc>,
        valid_until: DateTime<Utc>,
        contracts: Vec<Contract>,
    ) -> Result<Prepared> {
        let receiver = self.negotiation.counterpart_of(offeror)?.clone();
        let key = offeror.owned_key()?;
        self.check_can_update(offeror, MessageKind::Offer, ctx.now)?;
        for contract in &contracts {
            ctx.templates.validate(contract)?;
        }

        let mut offer = SignedContractOffer {
            negotiation_id: self.negotiation.id,
            offeror_fingerprint: offeror.preferred_fingerprint().clone(),
            receiver_fingerprint: receiver.preferred_fingerprint().clone(),
            valid_after: clock::canonical(valid_after),
            valid_until: clock::canonical(valid_until),
            contracts,
            signature: Signature::unsigned(ctx.now, key.scheme()),
        };
        offer.validate(ctx.now)?;
        sign(&mut offer, key)?;

        Ok(self.prepared(offer.into(), &receiver))
    }

    pub fn prepare_acceptance(&mut self, ctx: &UpdateContext<'_>, acceptor: &Party) -> Result<Prepared> {
        let receiver = self.negotiation.counterpart_of(acceptor)?.clone();
        let key = acceptor.owned_key()?;
        self.check_can_update(acceptor, MessageKind::Acceptance, ctx.now)?;
        let offer_hash = Hash::compute(
            ctx.settings.preferred_hash_algorithm(),
            &self.current_offer()?.canonical_bytes()?,
        );

        let mut acceptance = SignedContractAcceptance {
            negotiation_id: self.negotiation.id,
            acceptor_fingerprint: acceptor.preferred_fingerprint().clone(),
            offeror_fingerprint: receiver.preferred_fingerprint().clone(),
            offer_hash,
            signature: Signature::unsigned(ctx.now, key.scheme()),
        };
        sign(&mut acceptance, key)?;

        Ok(self.prepared(acceptance.into(), &receiver))
    }

    pub fn prepare_rejection(&mut self, ctx: &UpdateContext<'_>, rejector: &Party) -> Result<Prepared> {
        let receiver = self.negotiation.counterpart_of(rejector)?.clone();
        let key = rejector.owned_key()?;
        self.check_can_update(rejector, MessageKind::Rejection, ctx.now)?;
        let offer_hash = Hash::compute(
            ctx.settings.preferred_hash_algorithm(),
            &self.current_offer()?.canonical_bytes()?,
        );

        let mut rejection = SignedContractRejection {
            negotiation_id: self.negotiation.id,
            rejector_fingerprint: rejector.preferred_fingerprint().clone(),
            offeror_fingerprint: receiver.preferred_fingerprint().clone(),
            offer_hash,
            signature: Signature::unsigned(ctx.now, key.scheme()),
        };
        sign(&mut rejection, key)?;

        Ok(self.prepared(rejection.into(), &receiver))
    }

    /// Commits a message the counter-party has received.
    pub fn update_on_behalf_of_owned_party(&mut self, delivered: Delivered) -> Result<SignedMessage> {
        let prepared = delivered.0;
        if self.log.retired
            || prepared.negotiation_id != self.negotiation.id
            || prepared.offers_logged != self.log.offers.len()
            || prepared.status != self.log.status
        {
            return Err(NegotiationError::StalePreparation(format!(
                "{} for negotiation {} was prepared against another state",
                prepared.message.kind(),
                prepared.negotiation_id
            )));
        }
        self.apply(prepared.message.clone(), &prepared.receiver);
        Ok(prepared.message)
    }

    pub fn update_on_behalf_of_counter_party(
        &mut self,
        ctx: &UpdateContext<'_>,
        message: &SignedMessage,
    ) -> Result<()> {
        if message.negotiation_id() != self.negotiation.id {
            return Err(NegotiationError::bad_request(
                BadRequestKind::UnknownNegotiation,
                format!(
                    "message for negotiation {} sent to negotiation {}",
                    message.negotiation_id(),
                    self.negotiation.id
                ),
            ));
        }
        let sender = self
            .negotiation
            .party_by_fingerprint(message.sender_fingerprint())?
            .clone();
        let receiver = self
            .negotiation
            .party_by_fingerprint(message.receiver_fingerprint())?
            .clone();
        if sender.is_owned() || !receiver.is_owned() {
            return Err(NegotiationError::bad_request(
                BadRequestKind::UnknownParty,
                "inbound messages must travel from a counter-party to an owned party",
            ));
        }

        self.check_can_update(&sender, message.kind(), ctx.now)?;
        self.check_content(message, ctx)?;
        check_timestamp(message.signature(), ctx)?;
        sender.verify(&message.signing_bytes()?, message.signature(), ctx.settings)?;

        self.apply(message.clone(), &receiver);
        Ok(())
    }

    pub fn last_offer_as_trusted(&self, templates: &Templates) -> Result<Option<TrustedContractOffer>> {
        let Some(offer) = self.log.offers.last() else {
            return Ok(None);
        };
        let offeror = self.negotiation.party_by_fingerprint(&offer.offeror_fingerprint)?;
        let receiver = self.negotiation.party_by_fingerprint(&offer.receiver_fingerprint)?;

        let contracts = offer
            .contracts
            .iter()
            .map(|contract| {
                let template = templates.get_by_hash(&contract.template_hash).map_err(|_| {
                    NegotiationError::TemplateVanished(contract.template_hash.to_string())
                })?;
                Ok(TrustedContract {
                    template_name: template.name().to_string(),
                    arguments: contract.arguments.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(TrustedContractOffer {
            negotiation_id: Some(self.negotiation.id),
            offeror_name: offeror.name().to_string(),
            receiver_name: receiver.name().to_string(),
            valid_after: offer.valid_after,
            valid_until: offer.valid_until,
            contracts,
        }))
    }
}
