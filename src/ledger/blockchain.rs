// Append-only chain of validated blocks

use std::collections::{HashMap, HashSet};

use crate::consensus::validation;
use crate::core::{Block, BlockHeader, Hash, OutPoint, Transaction};
use crate::error::BlockRejected;
use crate::ledger::Mempool;

/// Ordered blocks plus the indexes needed to validate the next one.
///
/// Every block at position i > 0 links to block i - 1 by hash, carries
/// index i, and is not older than its predecessor.
#[derive(Debug, Clone, Default)]
pub struct Blockchain {
    blocks: Vec<Block>,
    block_index: HashMap<Hash, u64>,
    transaction_index: HashMap<Hash, u64>,
    spent_outpoints: HashSet<OutPoint>,
}

impl Blockchain {
    /// Empty chain; the first accepted block must be a genesis-position block
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain holding only `Block::genesis()`
    pub fn with_genesis() -> Self {
        let mut chain = Self::new();
        chain.append(Block::genesis());
        chain
    }

    /// Append `candidates` in order.
    ///
    /// Blocks already on the chain are skipped. The first candidate that does
    /// not extend the tip stops the call: it and everything after it are
    /// dropped, and the error reports which rule failed. Transactions of every
    /// accepted block leave `mempool`.
    pub fn add_blocks(
        &mut self,
        candidates: Vec<Block>,
        mempool: &mut Mempool,
    ) -> Result<usize, BlockRejected> {
        let mut accepted = 0;

        for candidate in candidates {
            if self.block_index.contains_key(&candidate.hash()) {
                log::trace!("Skipping known block {}", candidate.index());
                continue;
            }

            let checked = validation::check_block_link(self.tip(), &candidate).and_then(|()| {
                validation::check_block_transactions(
                    &candidate,
                    |outpoint| self.is_spent(outpoint),
                    |hash| self.contains_transaction(hash),
                )
            });
            if let Err(reason) = checked {
                return Err(BlockRejected {
                    accepted,
                    index: candidate.index(),
                    hash: candidate.hash(),
                    reason,
                });
            }

            mempool.remove_block(&candidate);
            self.append(candidate);
            accepted += 1;
        }

        Ok(accepted)
    }

    fn append(&mut self, block: Block) {
        let index = block.index();
        for tx in block.transactions() {
            self.transaction_index.insert(tx.hash(), index);
            self.spent_outpoints.extend(tx.spent_outpoints().copied());
        }
        self.block_index.insert(block.hash(), index);
        self.blocks.push(block);
    }

    /// Most recently accepted block
    pub fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, index: u64) -> Option<&Block> {
        self.blocks.get(usize::try_from(index).ok()?)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<&Block> {
        self.block_index.get(hash).and_then(|index| self.block(*index))
    }

    pub fn contains_block(&self, hash: &Hash) -> bool {
        self.block_index.contains_key(hash)
    }

    pub fn contains_transaction(&self, hash: &Hash) -> bool {
        self.transaction_index.contains_key(hash)
    }

    pub fn transaction(&self, hash: &Hash) -> Option<&Transaction> {
        let index = self.transaction_index.get(hash)?;
        self.block(*index)?.transaction(hash)
    }

    /// Has an accepted transaction already consumed `outpoint`?
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent_outpoints.contains(outpoint)
    }

    /// Up to `limit` blocks following the block `hash`.
    ///
    /// The zero hash means "from genesis". An unknown hash yields nothing.
    pub fn blocks_after(&self, hash: &Hash, limit: usize) -> &[Block] {
        let start = if hash.is_zero() {
            0
        } else {
            match self.block_index.get(hash) {
                Some(index) => *index as usize + 1,
                None => return &[],
            }
        };
        let start = start.min(self.blocks.len());
        let end = start.saturating_add(limit).min(self.blocks.len());
        &self.blocks[start..end]
    }

    pub fn headers_after(&self, hash: &Hash, limit: usize) -> Vec<BlockHeader> {
        self.blocks_after(hash, limit).iter().map(Block::header).collect()
    }

    /// Re-validate the whole chain from genesis
    pub fn verify(&self) -> Result<(), BlockRejected> {
        validation::verify_chain(&self.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{digest, Address, TransactionInput, TransactionOutput, TransactionParams};
    use crate::error::{ChainValidationError, TransactionError};
    use chrono::Duration;

    fn spend(seed: &[u8], value: u64) -> Transaction {
        Transaction::create(TransactionParams {
            origin: Address::new("alice"),
            destination: Address::new("bob"),
            value,
            note: None,
            inputs: vec![TransactionInput::new(OutPoint::new(digest(seed), 0), value)],
            outputs: vec![TransactionOutput::new(Address::new("bob"), value)],
        })
        .unwrap()
    }

    #[test]
    fn test_extend_from_genesis() {
        let mut chain = Blockchain::with_genesis();
        let mut mempool = Mempool::new();

        for _ in 0..5 {
            let next = Block::create(chain.tip(), vec![]);
            assert_eq!(chain.add_blocks(vec![next], &mut mempool), Ok(1));
        }

        assert_eq!(chain.len(), 6);
        assert_eq!(chain.tip().unwrap().index(), 5);
        assert!(chain.verify().is_ok());
    }

    #[test]
    fn test_empty_chain_accepts_genesis_only() {
        let mut chain = Blockchain::new();
        let mut mempool = Mempool::new();
        let genesis = Block::genesis();
        let orphan = Block::create(Some(&genesis), vec![]);

        let err = chain.add_blocks(vec![orphan], &mut mempool).unwrap_err();
        assert!(matches!(err.reason, ChainValidationError::BrokenLink { .. }));
        assert!(chain.is_empty());

        assert_eq!(chain.add_blocks(vec![genesis], &mut mempool), Ok(1));
    }

    #[test]
    fn test_rejects_suffix_after_bad_block() {
        let mut chain = Blockchain::with_genesis();
        let mut mempool = Mempool::new();
        let genesis_hash = chain.tip().unwrap().hash();

        let b1 = Block::create(chain.tip(), vec![]);
        let stray = Block::create(Some(&Block::create(None, vec![])), vec![]);
        let b2 = Block::create(Some(&b1), vec![]);

        let err = chain.add_blocks(vec![b1.clone(), stray.clone(), b2], &mut mempool).unwrap_err();
        assert_eq!(err.accepted, 1);
        assert_eq!(err.hash, stray.hash());
        assert!(matches!(err.reason, ChainValidationError::BrokenLink { .. }));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.tip().unwrap().hash(), b1.hash());
        assert_ne!(chain.tip().unwrap().hash(), genesis_hash);
    }

    #[test]
    fn test_mismatched_previous_hash_leaves_tip() {
        let mut chain = Blockchain::with_genesis();
        let mut mempool = Mempool::new();
        let tip = chain.tip().unwrap().hash();

        let other = Block::create(None, vec![spend(b"other", 1)]);
        let bad = Block::create(Some(&other), vec![]);
        assert!(chain.add_blocks(vec![bad], &mut mempool).is_err());
        assert_eq!(chain.tip().unwrap().hash(), tip);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_non_monotonic_timestamp() {
        let mut chain = Blockchain::with_genesis();
        let mut mempool = Mempool::new();
        let genesis = chain.tip().unwrap().clone();
        let early = Block::create_at(Some(&genesis), vec![], genesis.timestamp() - Duration::minutes(1));

        let err = chain.add_blocks(vec![early], &mut mempool).unwrap_err();
        assert!(matches!(err.reason, ChainValidationError::NonMonotonicTimestamp { .. }));
    }

    #[test]
    fn test_known_blocks_are_skipped() {
        let mut chain = Blockchain::with_genesis();
        let mut mempool = Mempool::new();
        let b1 = Block::create(chain.tip(), vec![]);

        assert_eq!(chain.add_blocks(vec![b1.clone()], &mut mempool), Ok(1));
        assert_eq!(chain.add_blocks(vec![Block::genesis(), b1], &mut mempool), Ok(0));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_double_spend_across_blocks() {
        let mut chain = Blockchain::with_genesis();
        let mut mempool = Mempool::new();
        let first = spend(b"coin", 5);
        let outpoint = *first.spent_outpoints().next().unwrap();
        let b1 = Block::create(chain.tip(), vec![first]);
        chain.add_blocks(vec![b1], &mut mempool).unwrap();

        assert!(chain.is_spent(&outpoint));
        let b2 = Block::create(chain.tip(), vec![spend(b"coin", 3)]);
        let err = chain.add_blocks(vec![b2], &mut mempool).unwrap_err();
        assert!(matches!(
            err.reason,
            ChainValidationError::Transaction { source: TransactionError::DoubleSpend(_), .. }
        ));
    }

    #[test]
    fn test_lookups() {
        let mut chain = Blockchain::with_genesis();
        let mut mempool = Mempool::new();
        let tx = spend(b"lookup", 2);
        let b1 = Block::create(chain.tip(), vec![tx.clone()]);
        let b2 = Block::create(Some(&b1), vec![]);
        chain.add_blocks(vec![b1.clone(), b2.clone()], &mut mempool).unwrap();

        assert_eq!(chain.block_by_hash(&b1.hash()), Some(&b1));
        assert_eq!(chain.transaction(&tx.hash()), Some(&tx));
        assert!(chain.contains_transaction(&tx.hash()));
        assert_eq!(chain.blocks_after(&Hash::zero(), 10).len(), 3);
        assert_eq!(chain.blocks_after(&b1.hash(), 10), &[b2.clone()]);
        assert_eq!(chain.blocks_after(&b2.hash(), 10).len(), 0);
        assert!(chain.blocks_after(&digest(b"unknown"), 10).is_empty());
        assert_eq!(chain.headers_after(&Hash::zero(), 2).len(), 2);
    }
}
