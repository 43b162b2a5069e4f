// Pending transactions not yet included in a block

use std::collections::{HashMap, HashSet};

use crate::consensus::validation;
use crate::core::{Block, Hash, OutPoint, Transaction, TransactionHeader};
use crate::error::TransactionError;
use crate::ledger::Blockchain;

/// Transactions keyed by hash, remembered in arrival order
#[derive(Debug, Clone, Default)]
pub struct Mempool {
    transactions: HashMap<Hash, Transaction>,
    arrival: Vec<Hash>,
    /// Outpoint -> pending transaction spending it
    claimed: HashMap<OutPoint, Hash>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending transaction.
    ///
    /// Returns `Ok(false)` when the transaction is already pending or already
    /// on the chain. Fails if an input is spent on the chain or claimed by
    /// another pending transaction.
    pub fn add(&mut self, tx: Transaction, chain: &Blockchain) -> Result<bool, TransactionError> {
        let hash = tx.hash();
        if self.transactions.contains_key(&hash) || chain.contains_transaction(&hash) {
            return Ok(false);
        }
        if tx.is_coinbase() {
            return Err(TransactionError::CoinbaseNotAllowed);
        }
        validation::check_transaction(&tx)?;

        for outpoint in tx.spent_outpoints() {
            if chain.is_spent(outpoint) || self.claimed.contains_key(outpoint) {
                return Err(TransactionError::DoubleSpend(*outpoint));
            }
        }

        for outpoint in tx.spent_outpoints() {
            self.claimed.insert(*outpoint, hash);
        }
        self.arrival.push(hash);
        self.transactions.insert(hash, tx);
        Ok(true)
    }

    /// Drop the given transactions; unknown hashes are ignored
    pub fn remove(&mut self, hashes: &HashSet<Hash>) {
        let mut removed = false;
        for hash in hashes {
            if let Some(tx) = self.transactions.remove(hash) {
                for outpoint in tx.spent_outpoints() {
                    self.claimed.remove(outpoint);
                }
                removed = true;
            }
        }
        if removed {
            self.arrival.retain(|hash| !hashes.contains(hash));
        }
    }

    /// Reconcile with a newly accepted block.
    ///
    /// Its own transactions leave the pool, and so does every pending
    /// transaction spending an outpoint the block spends.
    pub fn remove_block(&mut self, block: &Block) {
        let included: HashSet<Hash> = block.transactions().iter().map(Transaction::hash).collect();
        let conflicting: HashSet<Hash> = block
            .transactions()
            .iter()
            .flat_map(Transaction::spent_outpoints)
            .filter_map(|outpoint| self.claimed.get(outpoint).copied())
            .filter(|hash| !included.contains(hash))
            .collect();
        if !conflicting.is_empty() {
            log::debug!(
                "Dropping {} pending transactions double spent by block {}",
                conflicting.len(),
                block.index()
            );
        }
        let evicted: HashSet<Hash> = included.union(&conflicting).copied().collect();
        self.remove(&evicted);
    }

    /// Up to `limit` pending transactions, oldest first
    pub fn snapshot(&self, limit: usize) -> Vec<Transaction> {
        self.arrival
            .iter()
            .take(limit)
            .filter_map(|hash| self.transactions.get(hash))
            .cloned()
            .collect()
    }

    pub fn headers(&self, limit: usize) -> Vec<TransactionHeader> {
        self.arrival
            .iter()
            .take(limit)
            .filter_map(|hash| self.transactions.get(hash))
            .map(Transaction::header)
            .collect()
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.transactions.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.transactions.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
