use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::error::{NegotiationError, Result};
use crate::model::{NegotiationId, SignedMessage};
use crate::security::{Hash, HashAlgorithm};

#[derive(Debug, Default)]
struct BankEntries {
    by_hash: HashMap<Hash, Arc<SignedMessage>>,
    by_negotiation: HashMap<NegotiationId, Vec<Arc<SignedMessage>>>,
    /// First accepted hash of every definition listed under its negotiation.
    indexed: HashSet<Hash>,
    count: usize,
}

/// Content-addressed store of every signed message seen. Entries are never
/// removed.
#[derive(Debug)]
pub struct DefinitionBank {
    accepted: Vec<HashAlgorithm>,
    entries: RwLock<BankEntries>,
}

impl DefinitionBank {
    pub fn new(accepted: &[HashAlgorithm]) -> Self {
        Self {
            accepted: accepted.to_vec(),
            entries: RwLock::new(BankEntries::default()),
        }
    }

    pub fn accepted_hash_algorithms(&self) -> &[HashAlgorithm] {
        &self.accepted
    }

    /// A hash already naming a different definition is fatal and leaves the
    /// bank unchanged. Returns false when nothing changed.
    pub fn add(&self, definition: SignedMessage) -> Result<bool> {
        self.store(definition, true)
    }

    /// Stores a definition fetched from a counter-party by hash. It is
    /// served by hash but never listed under its claimed negotiation id.
    pub fn add_fetched(&self, definition: SignedMessage) -> Result<bool> {
        self.store(definition, false)
    }

    fn store(&self, definition: SignedMessage, index: bool) -> Result<bool> {
        let hashes = Hash::compute_all(&self.accepted, &definition.canonical_bytes()?);
        let mut entries = self.entries.write();

        let mut missing = Vec::with_capacity(hashes.len());
        let mut known = None;
        for hash in &hashes {
            match entries.by_hash.get(hash) {
                Some(existing) if **existing == definition => known = Some(existing.clone()),
                Some(_) => {
                    error!(%hash, "Hash collision in definition bank");
                    return Err(NegotiationError::HashCollision { hash: hash.clone() });
                }
                None => missing.push(hash.clone()),
            }
        }

        let negotiation_id = definition.negotiation_id();
        let kind = definition.kind();
        let stored_now = known.is_none();
        let definition = known.unwrap_or_else(|| Arc::new(definition));
        for hash in missing {
            entries.by_hash.insert(hash, definition.clone());
        }
        if stored_now {
            entries.count += 1;
        }

        let mut indexed_now = false;
        if index {
            if let Some(key) = hashes.first() {
                if entries.indexed.insert(key.clone()) {
                    entries
                        .by_negotiation
                        .entry(negotiation_id)
                        .or_default()
                        .push(definition);
                    indexed_now = true;
                }
            }
        }

        if stored_now || indexed_now {
            debug!(negotiation_id, %kind, indexed = indexed_now, "Definition stored");
        }
        Ok(stored_now || indexed_now)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.read().by_hash.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<Arc<SignedMessage>> {
        self.entries.read().by_hash.get(hash).cloned()
    }

    pub fn get_many(&self, hashes: &[Hash]) -> Vec<Arc<SignedMessage>> {
        let entries = self.entries.read();
        let mut found: Vec<Arc<SignedMessage>> = Vec::new();
        for hash in hashes {
            if let Some(definition) = entries.by_hash.get(hash) {
                if !found.iter().any(|f| Arc::ptr_eq(f, definition)) {
                    found.push(definition.clone());
                }
            }
        }
        found
    }

    pub fn get_by_negotiation(&self, negotiation_id: NegotiationId) -> Vec<Arc<SignedMessage>> {
        self.entries
            .read()
            .by_negotiation
            .get(&negotiation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn unknown(&self, hashes: &[Hash]) -> Vec<Hash> {
        let entries = self.entries.read();
        hashes
            .iter()
            .filter(|hash| !entries.by_hash.contains_key(*hash))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn plant(&self, hash: Hash, definition: SignedMessage) {
        self.entries
            .write()
            .by_hash
            .insert(hash, Arc::new(definition));
    }
}
