use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::bank::DefinitionBank;
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{NegotiationError, Result};
use crate::model::{
    Contract, MessageKind, NegotiationId, NegotiationStatus, SignedContractAcceptance,
    SignedContractOffer, SignedContractRejection, SignedMessage, TrustedContract,
    TrustedContractAcceptance, TrustedContractOffer, TrustedContractRejection,
};
use crate::negotiation::{ContractNegotiation, NegotiationGuard, UpdateContext};
use crate::negotiations::ContractNegotiations;
use crate::party::{Parties, Party};
use crate::relay::ContractRelay;
use crate::security::Hash;
use crate::template::Templates;

enum Request {
    Offer {
        valid_after: DateTime<Utc>,
        valid_until: DateTime<Utc>,
        contracts: Vec<Contract>,
    },
    Acceptance,
    Rejection,
}

#[derive(Clone)]
pub struct ContractProxy {
    parties: Arc<Parties>,
    templates: Arc<Templates>,
    negotiations: Arc<ContractNegotiations>,
    bank: Arc<DefinitionBank>,
    relay: Arc<dyn ContractRelay>,
    clock: Arc<dyn Clock>,
    settings: Arc<Settings>,
}

impl ContractProxy {
    pub fn new(
        parties: Parties,
        templates: Templates,
        settings: Settings,
        relay: Arc<dyn ContractRelay>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let negotiations = ContractNegotiations::new(settings.id_generation_attempts);
        Self::with_negotiations(parties, templates, settings, negotiations, relay, clock)
    }

    pub fn with_negotiations(
        parties: Parties,
        templates: Templates,
        settings: Settings,
        negotiations: ContractNegotiations,
        relay: Arc<dyn ContractRelay>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            parties: Arc::new(parties),
            templates: Arc::new(templates),
            negotiations: Arc::new(negotiations),
            bank: Arc::new(DefinitionBank::new(&settings.accepted_hash_algorithms)),
            relay,
            clock,
            settings: Arc::new(settings),
        }
    }

    pub fn parties(&self) -> &Parties {
        &self.parties
    }

    pub fn templates(&self) -> &Templates {
        &self.templates
    }

    pub fn negotiations(&self) -> &ContractNegotiations {
        &self.negotiations
    }

    pub fn bank(&self) -> &DefinitionBank {
        &self.bank
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn context(&self, now: DateTime<Utc>) -> UpdateContext<'_> {
        UpdateContext {
            templates: &self.templates,
            settings: &self.settings,
            now,
        }
    }

    // Inbound

    pub async fn offer_signed(&self, offer: SignedContractOffer) -> Result<()> {
        self.receive(offer.into()).await
    }

    pub async fn accept_signed(&self, acceptance: SignedContractAcceptance) -> Result<()> {
        self.receive(acceptance.into()).await
    }

    pub async fn reject_signed(&self, rejection: SignedContractRejection) -> Result<()> {
        self.receive(rejection.into()).await
    }

    async fn receive(&self, message: SignedMessage) -> Result<()> {
        let sender = self
            .parties
            .get_counter_by_fingerprint(message.sender_fingerprint())?;
        let receiver = self
            .parties
            .get_owned_by_fingerprint(message.receiver_fingerprint())?;
        let id = message.negotiation_id();

        // A concurrently refused opening offer may retire the negotiation
        // between lookup and lock.
        let mut negotiation = self.lookup(&message, &receiver, &sender)?;
        let mut guard = negotiation.lock().await;
        while guard.is_retired() {
            drop(guard);
            debug!(negotiation_id = id, "Negotiation was discarded, looking it up again");
            negotiation = self.lookup(&message, &receiver, &sender)?;
            guard = negotiation.lock().await;
        }

        let before = guard.status();
        let ctx = self.context(self.clock.now());
        if let Err(err) = guard.update_on_behalf_of_counter_party(&ctx, &message) {
            warn!(
                negotiation_id = id,
                kind = %message.kind(),
                from = sender.name(),
                error = %err,
                "Refused message from counter-party"
            );
            self.after_refusal(&negotiation, guard, before);
            return Err(err);
        }

        self.bank.add(message.clone())?;
        self.notify_current(&guard)?;
        drop(guard);

        self.resolve_references(&message, &sender).await?;
        Ok(())
    }

    fn lookup(
        &self,
        message: &SignedMessage,
        receiver: &Arc<Party>,
        sender: &Arc<Party>,
    ) -> Result<Arc<ContractNegotiation>> {
        let id = message.negotiation_id();
        match message.kind() {
            MessageKind::Offer => Ok(self
                .negotiations
                .get_or_create(receiver.clone(), sender.clone(), id)),
            _ => self.negotiations.get_by(receiver.name(), sender.name(), id),
        }
    }

    // Outbound

    /// Signs and sends an offer, opening a new negotiation when the request
    /// carries no id. Returns the negotiation id.
    pub async fn offer_trusted(&self, offer: TrustedContractOffer) -> Result<NegotiationId> {
        offer.validate(self.clock.now())?;
        let offeror = self.parties.get_owned_by_name(&offer.offeror_name)?;
        let receiver = self.parties.get_counter_by_name(&offer.receiver_name)?;
        let contracts = offer
            .contracts
            .iter()
            .map(|contract| self.to_contract(contract))
            .collect::<Result<Vec<_>>>()?;

        let (negotiation, created) = match offer.negotiation_id {
            Some(id) => (
                self.negotiations
                    .get_by(offeror.name(), receiver.name(), id)?,
                false,
            ),
            None => (
                self.negotiations.create(offeror.clone(), receiver.clone())?,
                true,
            ),
        };

        let request = Request::Offer {
            valid_after: offer.valid_after,
            valid_until: offer.valid_until,
            contracts,
        };
        let outcome = self.transmit(&negotiation, &offeror, request).await;
        if outcome.is_err() && created && self.negotiations.remove_if_pristine(&negotiation) {
            debug!(negotiation_id = negotiation.id(), "Discarded undelivered negotiation");
        }
        outcome.map(|()| negotiation.id())
    }

    pub async fn accept_trusted(&self, acceptance: TrustedContractAcceptance) -> Result<()> {
        let acceptor = self.parties.get_owned_by_name(&acceptance.acceptor_name)?;
        let offeror = self.parties.get_counter_by_name(&acceptance.offeror_name)?;
        let negotiation =
            self.negotiations
                .get_by(acceptor.name(), offeror.name(), acceptance.negotiation_id)?;
        self.transmit(&negotiation, &acceptor, Request::Acceptance)
            .await
    }

    pub async fn reject_trusted(&self, rejection: TrustedContractRejection) -> Result<()> {
        let rejector = self.parties.get_owned_by_name(&rejection.rejector_name)?;
        let offeror = self.parties.get_counter_by_name(&rejection.offeror_name)?;
        let negotiation =
            self.negotiations
                .get_by(rejector.name(), offeror.name(), rejection.negotiation_id)?;
        self.transmit(&negotiation, &rejector, Request::Rejection)
            .await
    }

    fn to_contract(&self, trusted: &TrustedContract) -> Result<Contract> {
        let template = self.templates.get_by_name(&trusted.template_name)?;
        template.validate(&trusted.arguments)?;
        Ok(Contract::new(
            template.preferred_hash().clone(),
            trusted.arguments.clone(),
        ))
    }

    // The negotiation stays locked until the relay answers.
    async fn transmit(
        &self,
        negotiation: &Arc<ContractNegotiation>,
        sender: &Party,
        request: Request,
    ) -> Result<()> {
        let mut guard = negotiation.lock().await;
        let before = guard.status();
        let ctx = self.context(self.clock.now());

        let prepared = match request {
            Request::Offer {
                valid_after,
                valid_until,
                contracts,
            } => guard.prepare_offer(&ctx, sender, valid_after, valid_until, contracts),
            Request::Acceptance => guard.prepare_acceptance(&ctx, sender),
            Request::Rejection => guard.prepare_rejection(&ctx, sender),
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.after_refusal(negotiation, guard, before);
                return Err(err);
            }
        };

        let kind = prepared.message().kind();
        let to = prepared.receiver().name().to_string();
        let delivered = match prepared.deliver(self.relay.as_ref()).await {
            Ok(delivered) => delivered,
            Err(err) => {
                warn!(
                    negotiation_id = negotiation.id(),
                    %kind,
                    to = %to,
                    error = %err,
                    "Delivery failed, nothing committed"
                );
                return Err(err);
            }
        };
        let message = guard.update_on_behalf_of_owned_party(delivered)?;

        self.bank.add(message)?;
        self.notify_current(&guard)?;
        Ok(())
    }

    /// Reports a status the refused update moved the negotiation to, and
    /// drops a negotiation the refused message would have opened.
    fn after_refusal(
        &self,
        negotiation: &ContractNegotiation,
        guard: NegotiationGuard<'_>,
        before: NegotiationStatus,
    ) {
        if guard.status() != before {
            if let Err(err) = self.notify_current(&guard) {
                warn!(negotiation_id = negotiation.id(), error = %err, "Could not build notification");
            }
        }
        drop(guard);
        self.negotiations.remove_if_pristine(negotiation);
    }

    fn notify_current(&self, guard: &NegotiationGuard<'_>) -> Result<()> {
        let offer = guard.last_offer_as_trusted(&self.templates)?;
        self.notify(guard.id(), offer, guard.status());
        Ok(())
    }

    fn notify(
        &self,
        negotiation_id: NegotiationId,
        offer: Option<TrustedContractOffer>,
        status: NegotiationStatus,
    ) {
        let relay = self.relay.clone();
        tokio::spawn(async move {
            if let Err(err) = relay
                .send_to_event_handler(negotiation_id, offer, status)
                .await
            {
                warn!(negotiation_id, %status, error = %err, "Event handler notification failed");
            }
        });
    }

    fn unknown_references(&self, message: &SignedMessage, requested: &mut HashSet<Hash>) -> Vec<Hash> {
        let candidates: Vec<Hash> = message
            .referenced_hashes()
            .into_iter()
            .filter(|hash| {
                let accepted = self.settings.accepts(hash.algorithm());
                if !accepted {
                    debug!(%hash, "Ignoring reference under an unaccepted algorithm");
                }
                accepted
            })
            .collect();
        self.bank
            .unknown(&candidates)
            .into_iter()
            .filter(|hash| requested.insert(hash.clone()))
            .collect()
    }

    /// Fetches unknown definitions `message` references, directly or through
    /// fetched ones. A failed fetch stops resolution and keeps what was
    /// already stored.
    async fn resolve_references(&self, message: &SignedMessage, counter_party: &Party) -> Result<usize> {
        let mut requested = HashSet::new();
        let mut pending = self.unknown_references(message, &mut requested);
        let mut added = 0;

        while !pending.is_empty() {
            let batch = std::mem::take(&mut pending);
            debug!(count = batch.len(), from = counter_party.name(), "Fetching unknown definitions");

            let fetched = match self
                .relay
                .get_from_counter_party(&batch, counter_party)
                .await
            {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(
                        from = counter_party.name(),
                        unresolved = batch.len(),
                        error = %err,
                        "Definition fetch failed, resolution stopped"
                    );
                    break;
                }
            };

            for definition in fetched {
                let bytes = definition.canonical_bytes()?;
                if !batch.iter().any(|hash| hash.verify(&bytes)) {
                    warn!(
                        from = counter_party.name(),
                        negotiation_id = definition.negotiation_id(),
                        "Discarding fetched definition that matches no requested hash"
                    );
                    continue;
                }
                if self.bank.add_fetched(definition.clone())? {
                    added += 1;
                }
                pending.extend(self.unknown_references(&definition, &mut requested));
            }
        }

        if added > 0 {
            info!(added, from = counter_party.name(), "Resolved referenced definitions");
        }
        Ok(added)
    }

    // Reads

    pub async fn status(&self, a: &str, b: &str, id: NegotiationId) -> Result<NegotiationStatus> {
        let negotiation = self.negotiations.get_by(a, b, id)?;
        let guard = negotiation.lock().await;
        Ok(guard.status())
    }

    pub async fn last_offer_as_trusted(
        &self,
        a: &str,
        b: &str,
        id: NegotiationId,
    ) -> Result<Option<TrustedContractOffer>> {
        let negotiation = self.negotiations.get_by(a, b, id)?;
        let guard = negotiation.lock().await;
        guard.last_offer_as_trusted(&self.templates)
    }

    pub async fn render_last_offer(
        &self,
        a: &str,
        b: &str,
        id: NegotiationId,
    ) -> Result<Option<Vec<String>>> {
        let negotiation = self.negotiations.get_by(a, b, id)?;
        let guard = negotiation.lock().await;
        let Some(offer) = guard.last_offer() else {
            return Ok(None);
        };
        let rendered = offer
            .contracts
            .iter()
            .map(|contract| {
                self.templates.render(contract).map_err(|err| match err {
                    NegotiationError::BadRequest { .. } => {
                        NegotiationError::TemplateVanished(contract.template_hash.to_string())
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(rendered))
    }

    pub fn definitions(&self, hashes: &[Hash]) -> Vec<SignedMessage> {
        self.bank
            .get_many(hashes)
            .into_iter()
            .map(|definition| definition.as_ref().clone())
            .collect()
    }

    pub fn definitions_for_negotiation(&self, id: NegotiationId) -> Vec<SignedMessage> {
        self.bank
            .get_by_negotiation(id)
            .into_iter()
            .map(|definition| definition.as_ref().clone())
            .collect()
    }
}
