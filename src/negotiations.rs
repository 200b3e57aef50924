use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{error, info};

use crate::error::{BadRequestKind, NegotiationError, Result};
use crate::model::NegotiationId;
use crate::negotiation::ContractNegotiation;
use crate::party::Party;

/// Party names in a fixed order, so `(A, B)` and `(B, A)` are one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartyPair {
    first: String,
    second: String,
}

impl PartyPair {
    pub fn new(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self {
            first: first.to_string(),
            second: second.to_string(),
        }
    }

    pub fn names(&self) -> (&str, &str) {
        (&self.first, &self.second)
    }
}

pub type IdGenerator = Box<dyn Fn() -> NegotiationId + Send + Sync>;

pub struct ContractNegotiations {
    by_pair: RwLock<HashMap<PartyPair, HashMap<NegotiationId, Arc<ContractNegotiation>>>>,
    attempts: u32,
    generate_id: IdGenerator,
}

impl std::fmt::Debug for ContractNegotiations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractNegotiations")
            .field("len", &self.len())
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl ContractNegotiations {
    pub fn new(attempts: u32) -> Self {
        Self::with_id_generator(attempts, Box::new(|| OsRng.next_u64()))
    }

    pub fn with_id_generator(attempts: u32, generate_id: IdGenerator) -> Self {
        Self {
            by_pair: RwLock::new(HashMap::new()),
            attempts: attempts.max(1),
            generate_id,
        }
    }

    pub fn create(&self, a: Arc<Party>, b: Arc<Party>) -> Result<Arc<ContractNegotiation>> {
        let pair = PartyPair::new(a.name(), b.name());
        let mut by_pair = self.by_pair.write();
        let negotiations = by_pair.entry(pair).or_default();

        for _ in 0..self.attempts {
            let id = (self.generate_id)();
            if negotiations.contains_key(&id) {
                continue;
            }
            let negotiation = Arc::new(ContractNegotiation::new(id, a.clone(), b.clone()));
            negotiations.insert(id, negotiation.clone());
            info!(negotiation_id = id, a = a.name(), b = b.name(), "Negotiation created");
            return Ok(negotiation);
        }

        error!(
            attempts = self.attempts,
            a = a.name(),
            b = b.name(),
            "Could not allocate a negotiation id"
        );
        Err(NegotiationError::IdGenerationExhausted {
            attempts: self.attempts,
        })
    }

    /// Looks up a negotiation opened by the counter-party, creating it under
    /// their id if this is its first message.
    pub fn get_or_create(
        &self,
        a: Arc<Party>,
        b: Arc<Party>,
        id: NegotiationId,
    ) -> Arc<ContractNegotiation> {
        let pair = PartyPair::new(a.name(), b.name());
        if let Some(existing) = self
            .by_pair
            .read()
            .get(&pair)
            .and_then(|negotiations| negotiations.get(&id))
        {
            return existing.clone();
        }

        let mut by_pair = self.by_pair.write();
        by_pair
            .entry(pair)
            .or_default()
            .entry(id)
            .or_insert_with(|| {
                info!(negotiation_id = id, a = a.name(), b = b.name(), "Negotiation created");
                Arc::new(ContractNegotiation::new(id, a.clone(), b.clone()))
            })
            .clone()
    }

    pub fn get_by(&self, a: &str, b: &str, id: NegotiationId) -> Result<Arc<ContractNegotiation>> {
        self.by_pair
            .read()
            .get(&PartyPair::new(a, b))
            .and_then(|negotiations| negotiations.get(&id))
            .cloned()
            .ok_or_else(|| {
                NegotiationError::bad_request(
                    BadRequestKind::UnknownNegotiation,
                    format!("no negotiation {} between '{}' and '{}'", id, a, b),
                )
            })
    }

    /// Drops a negotiation nothing was ever committed to. Anyone still holding
    /// it finds it retired. Returns whether it was removed.
    pub fn remove_if_pristine(&self, negotiation: &ContractNegotiation) -> bool {
        let mut by_pair = self.by_pair.write();
        let Some(negotiations) = by_pair.get_mut(&negotiation.pair()) else {
            return false;
        };
        let registered = negotiations
            .get(&negotiation.id())
            .map_or(false, |n| std::ptr::eq(n.as_ref(), negotiation));
        if !registered || !negotiation.retire_if_pristine() {
            return false;
        }
        negotiations.remove(&negotiation.id());
        if negotiations.is_empty() {
            by_pair.remove(&negotiation.pair());
        }
        true
    }

    pub fn len(&self) -> usize {
        self.by_pair.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
