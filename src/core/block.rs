// Block data structures

use std::io::Read;

use chrono::{DateTime, Utc};

use super::serialize::{
    count_u32, read_hash, read_list, read_timestamp, read_u32, read_u64, write_hash, write_list,
    write_timestamp,
};
use crate::core::{digest, now, Address, Hash, Serializable, Transaction, COIN};
use crate::error::ProtocolError;

/// Genesis timestamp: 2021-07-07T00:00:00Z
const GENESIS_TIMESTAMP_MILLIS: i64 = 1_625_616_000_000;

/// Recipient of the genesis coinbase
pub const GENESIS_ADDRESS: &str = "5a1d0c8e2f4b6a7c9e1f3a5b7d9c0e2f4a6b8c0d";

/// Genesis coinbase value
pub const GENESIS_REWARD: u64 = 50 * COIN;

/// Block summary exchanged during inventory sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: Hash,
    pub previous_hash: Hash,
    pub index: u64,
    pub transaction_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl Serializable for BlockHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_hash(buf, &self.hash);
        write_hash(buf, &self.previous_hash);
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.transaction_count.to_le_bytes());
        write_timestamp(buf, &self.timestamp);
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        Ok(Self {
            hash: read_hash(reader)?,
            previous_hash: read_hash(reader)?,
            index: read_u64(reader)?,
            transaction_count: read_u32(reader)?,
            timestamp: read_timestamp(reader)?,
        })
    }
}

/// Block - an ordered batch of transactions linked to its predecessor
///
/// `block_hash` always matches the contents it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    index: u64,
    timestamp: DateTime<Utc>,
    previous_block_hash: Hash,
    transactions: Vec<Transaction>,
    block_hash: Hash,
}

impl Block {
    /// Build the block that follows `previous`, or a genesis-position block when it is `None`.
    ///
    /// The timestamp is clamped to at least the predecessor's.
    pub fn create(previous: Option<&Block>, transactions: Vec<Transaction>) -> Self {
        let timestamp = match previous {
            Some(previous) => now().max(previous.timestamp),
            None => now(),
        };
        Self::create_at(previous, transactions, timestamp)
    }

    /// Same as `create` with an explicit timestamp
    pub fn create_at(
        previous: Option<&Block>,
        transactions: Vec<Transaction>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let (index, previous_block_hash) = match previous {
            Some(previous) => (previous.index + 1, previous.block_hash),
            None => (0, Hash::zero()),
        };
        Self::assemble(index, timestamp, previous_block_hash, transactions)
    }

    /// Create the genesis block
    ///
    /// Deterministic, so every node starts from the same block 0.
    pub fn genesis() -> Self {
        let timestamp = DateTime::from_timestamp_millis(GENESIS_TIMESTAMP_MILLIS)
            .unwrap_or(DateTime::UNIX_EPOCH);
        let coinbase = Transaction::coinbase(
            Address::new(GENESIS_ADDRESS),
            GENESIS_REWARD,
            "Yggdrasil genesis".to_string(),
            timestamp,
        );
        Self::assemble(0, timestamp, Hash::zero(), vec![coinbase])
    }

    fn assemble(
        index: u64,
        timestamp: DateTime<Utc>,
        previous_block_hash: Hash,
        transactions: Vec<Transaction>,
    ) -> Self {
        let mut block = Self {
            index,
            timestamp,
            previous_block_hash,
            transactions,
            block_hash: Hash::zero(),
        };
        block.block_hash = block.calculate_hash();
        block
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn previous_block_hash(&self) -> Hash {
        self.previous_block_hash
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn hash(&self) -> Hash {
        self.block_hash
    }

    /// Look up a contained transaction by hash
    pub fn transaction(&self, hash: &Hash) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.hash() == *hash)
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_block_hash.is_zero()
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            hash: self.block_hash,
            previous_hash: self.previous_block_hash,
            index: self.index,
            transaction_count: count_u32(self.transactions.len()),
            timestamp: self.timestamp,
        }
    }

    /// Recompute the hash from the current fields
    pub fn calculate_hash(&self) -> Hash {
        let mut buf = Vec::new();
        self.encode_body(&mut buf);
        digest(&buf)
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.index.to_le_bytes());
        write_timestamp(buf, &self.timestamp);
        write_hash(buf, &self.previous_block_hash);
        write_list(buf, &self.transactions);
    }
}

// Stored and transmitted as the hash input followed by the hash itself.
impl Serializable for Block {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.encode_body(buf);
        write_hash(buf, &self.block_hash);
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        let index = read_u64(reader)?;
        let timestamp = read_timestamp(reader)?;
        let previous_block_hash = read_hash(reader)?;
        let transactions = read_list(reader)?;
        let block_hash = read_hash(reader)?;

        let block = Self::assemble(index, timestamp, previous_block_hash, transactions);
        if block.block_hash != block_hash {
            return Err(ProtocolError::HashMismatch);
        }
        Ok(block)
    }
}
