// Chain and mempool state shared by every connection

mod blockchain;
mod mempool;

pub use blockchain::Blockchain;
pub use mempool::Mempool;

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::core::{Block, Transaction};
use crate::error::{BlockRejected, TransactionError};

/// Ledger shared between tasks. Mutations hold the write guard for their
/// whole duration, so each is atomic with respect to readers.
pub type SharedLedger = Arc<RwLock<Ledger>>;

/// Blockchain and mempool, mutated together
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    blockchain: Blockchain,
    mempool: Mempool,
}

impl Ledger {
    pub fn new(blockchain: Blockchain) -> Self {
        Self {
            blockchain,
            mempool: Mempool::new(),
        }
    }

    pub fn with_genesis() -> Self {
        Self::new(Blockchain::with_genesis())
    }

    pub fn into_shared(self) -> SharedLedger {
        Arc::new(RwLock::new(self))
    }

    pub fn blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// Append blocks, evicting their transactions from the mempool
    pub fn add_blocks(&mut self, candidates: Vec<Block>) -> Result<usize, BlockRejected> {
        self.blockchain.add_blocks(candidates, &mut self.mempool)
    }

    /// Admit a pending transaction; `Ok(false)` when it was already known
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<bool, TransactionError> {
        self.mempool.add(tx, &self.blockchain)
    }

    /// Build a block on the tip from up to `limit` pending transactions and append it
    pub fn mine_block(
        &mut self,
        coinbase: Option<Transaction>,
        limit: usize,
    ) -> Result<Block, BlockRejected> {
        let mut transactions: Vec<Transaction> = coinbase.into_iter().collect();
        transactions.extend(self.mempool.snapshot(limit));

        let block = Block::create(self.blockchain.tip(), transactions);
        self.add_blocks(vec![block.clone()])?;
        Ok(block)
    }
}
