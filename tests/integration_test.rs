use chrono::{DateTime, Duration, TimeZone, Utc};
use contract_proxy::{
    clock::ManualClock,
    config::{AppConfig, Settings},
    error::{BadRequestKind, Result},
    model::{
        NegotiationStatus, SignedContractAcceptance, SignedMessage, TrustedContract,
        TrustedContractAcceptance, TrustedContractOffer, TrustedContractRejection,
    },
    party::{Parties, Party},
    proxy::ContractProxy,
    relay::memory::{MemoryRelay, NegotiationEvent},
    security::{
        Certificate, Hash, HashAlgorithm, PublicKey, Signable, Signature, SignatureScheme,
    },
    template::Templates,
};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::sync::Arc;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
[security]
accepted_hash_algorithms = ["SHA-256", "SHA-512", "BLAKE3"]
timestamp_tolerance_secs = 30

[logging]
level = "debug"
format = "plain"

[[templates]]
name = "simple-purchase"
text = "The buyer orders {Quantity} units of article {ArticleNumber}."
"#;

struct Identity {
    name: &'static str,
    key: SigningKey,
    certificate: Certificate,
}

impl Identity {
    fn new(name: &'static str, now: DateTime<Utc>) -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let certificate = Certificate::new(
            name,
            now - Duration::days(1),
            now + Duration::days(90),
            PublicKey::from_verifying_key(&key.verifying_key()),
        );
        Self {
            name,
            key,
            certificate,
        }
    }

    fn owned(&self, settings: &Settings, now: DateTime<Utc>) -> Result<Party> {
        Party::owned(self.certificate.clone(), self.key.clone(), settings, now)
    }

    fn counter(&self, settings: &Settings, now: DateTime<Utc>) -> Result<Party> {
        Party::counter(self.certificate.clone(), settings, now)
    }
}

struct Market {
    clock: Arc<ManualClock>,
    settings: Settings,
    buyer_id: Identity,
    seller_id: Identity,
    buyer: ContractProxy,
    buyer_relay: Arc<MemoryRelay>,
    seller: ContractProxy,
    seller_relay: Arc<MemoryRelay>,
}

fn load_config() -> Result<(Settings, AppConfig)> {
    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), CONFIG).unwrap();
    let config = AppConfig::load(file.path())?;
    config.validate()?;
    Ok((config.settings()?, config))
}

fn proxy(
    config: &AppConfig,
    settings: &Settings,
    parties: Vec<Party>,
    relay: Arc<MemoryRelay>,
    clock: Arc<ManualClock>,
) -> Result<ContractProxy> {
    let templates: Templates = config.load_templates(settings)?;
    Ok(ContractProxy::new(
        Parties::new(parties, settings)?,
        templates,
        settings.clone(),
        relay,
        clock,
    ))
}

async fn setup_market() -> Result<Market> {
    let (settings, config) = load_config()?;
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(now));

    let buyer_id = Identity::new("Buyer", now);
    let seller_id = Identity::new("Seller", now);
    let carrier_id = Identity::new("Carrier", now);

    let buyer_relay = Arc::new(MemoryRelay::new());
    let seller_relay = Arc::new(MemoryRelay::new());

    let buyer = proxy(
        &config,
        &settings,
        vec![buyer_id.owned(&settings, now)?, seller_id.counter(&settings, now)?],
        buyer_relay.clone(),
        clock.clone(),
    )?;
    let seller = proxy(
        &config,
        &settings,
        vec![
            seller_id.owned(&settings, now)?,
            buyer_id.counter(&settings, now)?,
            carrier_id.counter(&settings, now)?,
        ],
        seller_relay.clone(),
        clock.clone(),
    )?;

    Ok(Market {
        clock,
        settings,
        buyer_id,
        seller_id,
        buyer,
        buyer_relay,
        seller,
        seller_relay,
    })
}

/// Hands everything `from` sent to `to`, in order.
async fn deliver(from: &MemoryRelay, to: &ContractProxy) -> Result<()> {
    for envelope in from.drain_outbox() {
        match envelope.message {
            SignedMessage::Offer(offer) => to.offer_signed(offer).await?,
            SignedMessage::Acceptance(acceptance) => to.accept_signed(acceptance).await?,
            SignedMessage::Rejection(rejection) => to.reject_signed(rejection).await?,
        }
    }
    Ok(())
}

async fn wait_for_events(relay: &MemoryRelay, count: usize) -> Vec<NegotiationEvent> {
    for _ in 0..100 {
        if relay.events().len() >= count {
            break;
        }
        tokio::task::yield_now().await;
    }
    relay.events()
}

fn purchase(now: DateTime<Utc>, quantity: &str) -> TrustedContractOffer {
    TrustedContractOffer {
        negotiation_id: None,
        offeror_name: "Buyer".to_string(),
        receiver_name: "Seller".to_string(),
        valid_after: now,
        valid_until: now + Duration::minutes(30),
        contracts: vec![TrustedContract::new("simple-purchase")
            .with_argument("ArticleNumber", "XYZ-123")
            .with_argument("Quantity", quantity)],
    }
}

fn hash_of(message: &SignedMessage) -> Hash {
    Hash::compute(HashAlgorithm::Sha256, &message.canonical_bytes().unwrap())
}

#[tokio::test]
async fn test_simple_purchase_is_accepted() -> Result<()> {
    let market = setup_market().await?;
    let now = market.clock_now();

    let id = market.buyer.offer_trusted(purchase(now, "200")).await?;
    assert_eq!(
        market.buyer.status("Buyer", "Seller", id).await?,
        NegotiationStatus::Offering
    );

    let sent = market.buyer.definitions_for_negotiation(id);
    assert_eq!(sent.len(), 1);
    let bytes = sent[0].canonical_bytes()?;
    for algorithm in &market.settings.accepted_hash_algorithms {
        assert!(market.buyer.bank().contains(&Hash::compute(*algorithm, &bytes)));
    }

    deliver(&market.buyer_relay, &market.seller).await?;
    let seen = market
        .seller
        .last_offer_as_trusted("Seller", "Buyer", id)
        .await?
        .expect("offer logged");
    assert_eq!(seen.offeror_name, "Buyer");
    assert_eq!(seen.contracts, purchase(now, "200").contracts);
    assert_eq!(
        market.seller.render_last_offer("Seller", "Buyer", id).await?,
        Some(vec![
            "The buyer orders {200} units of article {XYZ-123}.".to_string()
        ])
    );

    market
        .seller
        .accept_trusted(TrustedContractAcceptance {
            negotiation_id: id,
            acceptor_name: "Seller".to_string(),
            offeror_name: "Buyer".to_string(),
        })
        .await?;
    deliver(&market.seller_relay, &market.buyer).await?;

    assert_eq!(
        market.buyer.status("Seller", "Buyer", id).await?,
        NegotiationStatus::Accepted
    );
    assert_eq!(
        market.seller.status("Seller", "Buyer", id).await?,
        NegotiationStatus::Accepted
    );

    let mut again = purchase(now, "250");
    again.negotiation_id = Some(id);
    let err = market.buyer.offer_trusted(again).await.unwrap_err();
    assert_eq!(err.kind(), Some(BadRequestKind::NegotiationAccepted));

    let events = wait_for_events(&market.buyer_relay, 2).await;
    let statuses: Vec<_> = events.iter().map(|event| event.status).collect();
    assert_eq!(
        statuses,
        vec![NegotiationStatus::Offering, NegotiationStatus::Accepted]
    );
    assert!(events.iter().all(|event| event.negotiation_id == id));

    Ok(())
}

#[tokio::test]
async fn test_counter_offers_and_rejection() -> Result<()> {
    let market = setup_market().await?;
    let now = market.clock_now();

    let id = market.buyer.offer_trusted(purchase(now, "200")).await?;
    deliver(&market.buyer_relay, &market.seller).await?;

    let mut counter = purchase(now, "150");
    counter.negotiation_id = Some(id);
    counter.offeror_name = "Seller".to_string();
    counter.receiver_name = "Buyer".to_string();
    assert_eq!(market.seller.offer_trusted(counter.clone()).await?, id);
    deliver(&market.seller_relay, &market.buyer).await?;

    // Seller already made its move.
    let err = market.seller.offer_trusted(counter).await.unwrap_err();
    assert_eq!(err.kind(), Some(BadRequestKind::AwaitTurn));

    market
        .buyer
        .reject_trusted(TrustedContractRejection {
            negotiation_id: id,
            rejector_name: "Buyer".to_string(),
            offeror_name: "Seller".to_string(),
        })
        .await?;
    deliver(&market.buyer_relay, &market.seller).await?;

    assert_eq!(
        market.seller.status("Buyer", "Seller", id).await?,
        NegotiationStatus::Rejected
    );
    assert_eq!(market.seller.definitions_for_negotiation(id).len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_acceptance_of_superseded_offer_is_bad_hash() -> Result<()> {
    let market = setup_market().await?;
    let now = market.clock_now();

    let id = market.buyer.offer_trusted(purchase(now, "200")).await?;
    deliver(&market.buyer_relay, &market.seller).await?;
    let first = market.seller.definitions_for_negotiation(id)[0].clone();

    let mut counter = purchase(now, "150");
    counter.negotiation_id = Some(id);
    counter.offeror_name = "Seller".to_string();
    counter.receiver_name = "Buyer".to_string();
    market.seller.offer_trusted(counter).await?;
    deliver(&market.seller_relay, &market.buyer).await?;

    let mut renewed = purchase(now, "180");
    renewed.negotiation_id = Some(id);
    market.buyer.offer_trusted(renewed).await?;
    deliver(&market.buyer_relay, &market.seller).await?;

    let seller = market.seller.parties().get_owned_by_name("Seller")?;
    let buyer = market.seller.parties().get_counter_by_name("Buyer")?;
    let mut stale = SignedContractAcceptance {
        negotiation_id: id,
        acceptor_fingerprint: seller.preferred_fingerprint().clone(),
        offeror_fingerprint: buyer.preferred_fingerprint().clone(),
        offer_hash: hash_of(&first),
        signature: Signature::unsigned(now, SignatureScheme::Ed25519),
    };
    let bytes = stale.signing_bytes()?;
    stale.signature.sum = Some(SignatureScheme::Ed25519.sign(&market.seller_id.key, &bytes));

    let err = market.buyer.accept_signed(stale).await.unwrap_err();
    assert_eq!(err.kind(), Some(BadRequestKind::BadHash));
    assert_eq!(
        market.buyer.status("Buyer", "Seller", id).await?,
        NegotiationStatus::Offering
    );
    Ok(())
}

#[tokio::test]
async fn test_expired_offer_observed_on_next_update() -> Result<()> {
    let market = setup_market().await?;
    let now = market.clock_now();

    let mut late = purchase(now, "200");
    late.valid_after = now - Duration::hours(2);
    late.valid_until = now - Duration::seconds(1);
    let err = market.buyer.offer_trusted(late).await.unwrap_err();
    assert_eq!(err.kind(), Some(BadRequestKind::AlreadyExpired));
    assert!(market.buyer.negotiations().is_empty());

    let id = market.buyer.offer_trusted(purchase(now, "200")).await?;
    deliver(&market.buyer_relay, &market.seller).await?;
    assert_eq!(
        market.seller.status("Seller", "Buyer", id).await?,
        NegotiationStatus::Offering
    );

    market.clock.advance(Duration::hours(1));
    let err = market
        .seller
        .accept_trusted(TrustedContractAcceptance {
            negotiation_id: id,
            acceptor_name: "Seller".to_string(),
            offeror_name: "Buyer".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(BadRequestKind::NegotiationExpired));
    assert_eq!(
        market.seller.status("Seller", "Buyer", id).await?,
        NegotiationStatus::Expired
    );
    assert!(market.seller_relay.drain_outbox().is_empty());

    let events = wait_for_events(&market.seller_relay, 2).await;
    assert_eq!(events.last().map(|e| e.status), Some(NegotiationStatus::Expired));
    Ok(())
}

#[tokio::test]
async fn test_offline_counter_party_commits_nothing() -> Result<()> {
    let market = setup_market().await?;
    let now = market.clock_now();

    market.buyer_relay.set_offline(true);
    let err = market.buyer.offer_trusted(purchase(now, "200")).await.unwrap_err();
    assert!(err.kind().is_none());
    assert!(market.buyer.negotiations().is_empty());
    assert!(market.buyer.bank().is_empty());

    market.buyer_relay.set_offline(false);
    let id = market.buyer.offer_trusted(purchase(now, "200")).await?;
    assert_eq!(market.buyer.definitions_for_negotiation(id).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_referenced_definitions_are_fetched() -> Result<()> {
    let market = setup_market().await?;
    let now = market.clock_now();

    // Seller first settles shipping terms with the carrier.
    let shipping = market
        .seller
        .offer_trusted(TrustedContractOffer {
            negotiation_id: None,
            offeror_name: "Seller".to_string(),
            receiver_name: "Carrier".to_string(),
            valid_after: now,
            valid_until: now + Duration::days(1),
            contracts: vec![TrustedContract::new("simple-purchase")
                .with_argument("ArticleNumber", "PALLET-9")
                .with_argument("Quantity", "4")],
        })
        .await?;
    market.seller_relay.drain_outbox();
    let shipping_offer = market.seller.definitions_for_negotiation(shipping)[0].clone();
    let reference = Hash::compute(HashAlgorithm::Blake3, &shipping_offer.canonical_bytes()?);

    let served = market.seller.definitions(&[reference.clone()]);
    assert_eq!(served, vec![shipping_offer.clone()]);
    for definition in served {
        market.buyer_relay.publish(definition);
    }

    market
        .seller
        .offer_trusted(TrustedContractOffer {
            negotiation_id: None,
            offeror_name: "Seller".to_string(),
            receiver_name: "Buyer".to_string(),
            valid_after: now,
            valid_until: now + Duration::hours(1),
            contracts: vec![TrustedContract::new("simple-purchase")
                .with_argument("ArticleNumber", reference.to_string())
                .with_argument("Quantity", "1")],
        })
        .await?;
    assert!(!market.buyer.bank().contains(&reference));
    deliver(&market.seller_relay, &market.buyer).await?;

    assert!(market.buyer.bank().contains(&reference));
    assert_eq!(market.buyer.definitions(&[reference]), vec![shipping_offer]);
    // Fetched by hash only; the buyer takes no part in the shipping negotiation.
    assert!(market.buyer.definitions_for_negotiation(shipping).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_forged_acceptance_is_refused() -> Result<()> {
    let market = setup_market().await?;
    let now = market.clock_now();

    let id = market.buyer.offer_trusted(purchase(now, "200")).await?;
    let offer = market.buyer.definitions_for_negotiation(id)[0].clone();

    let buyer = market.buyer.parties().get_owned_by_name("Buyer")?;
    let seller = market.buyer.parties().get_counter_by_name("Seller")?;
    let mut forged = SignedContractAcceptance {
        negotiation_id: id,
        acceptor_fingerprint: seller.preferred_fingerprint().clone(),
        offeror_fingerprint: buyer.preferred_fingerprint().clone(),
        offer_hash: hash_of(&offer),
        signature: Signature::unsigned(now, SignatureScheme::Ed25519),
    };
    let bytes = forged.signing_bytes()?;
    // Signed with the buyer's own key instead of the seller's.
    forged.signature.sum = Some(SignatureScheme::Ed25519.sign(&market.buyer_id.key, &bytes));

    let err = market.buyer.accept_signed(forged).await.unwrap_err();
    assert_eq!(err.kind(), Some(BadRequestKind::BadSignature));
    assert_eq!(
        market.buyer.status("Buyer", "Seller", id).await?,
        NegotiationStatus::Offering
    );
    Ok(())
}

impl Market {
    fn clock_now(&self) -> DateTime<Utc> {
        use contract_proxy::clock::Clock;
        self.clock.now()
    }
}
