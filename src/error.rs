// Error types for the node

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::core::{Hash, OutPoint};

/// Frame or payload could not be decoded.
///
/// Always fatal for the connection that produced it, never for the node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown network code {0:?}")]
    UnknownNetwork([u8; 4]),
    #[error("unknown request code {0:?}")]
    UnknownRequest([u8; 4]),
    #[error("unknown type code {0:?}")]
    UnknownDataType([u8; 4]),
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: u64, max: usize },
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("hash does not match contents")]
    HashMismatch,
    #[error("frame for network {found:?} on a {expected:?} connection")]
    WrongNetwork { expected: [u8; 4], found: [u8; 4] },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::Truncated,
            _ => ProtocolError::InvalidMessage(err.to_string()),
        }
    }
}

/// Session could not be established.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error("expected {expected} during handshake, received {received}")]
    UnexpectedMessage { expected: &'static str, received: &'static str },
    #[error("protocol version {theirs} does not match ours ({ours})")]
    VersionMismatch { ours: u32, theirs: u32 },
    #[error("peer is on network {0:?}")]
    NetworkMismatch([u8; 4]),
    #[error("connected to ourselves")]
    SelfConnection,
    #[error("node {0} is already connected")]
    AlreadyConnected(Uuid),
    #[error("peer clock is {0} seconds away from ours")]
    ClockSkew(i64),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Transport level failure on one connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection closed by peer")]
    Closed,
}

/// Transaction rejected before reaching the mempool or the chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("outputs ({outputs}) exceed inputs ({inputs})")]
    InsufficientInputValue { inputs: u64, outputs: u64 },
    #[error("null input outside a coinbase transaction")]
    NullInput,
    #[error("amount overflow")]
    ValueOverflow,
    #[error("output {} of {} is already spent", .0.index, .0.transaction_hash)]
    DoubleSpend(OutPoint),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("coinbase transactions are only valid inside a block")]
    CoinbaseNotAllowed,
}

/// Why a candidate block does not extend the current tip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainValidationError {
    #[error("block hash {0} does not match its contents")]
    HashMismatch(Hash),
    #[error("previous hash {found} does not match tip {expected}")]
    BrokenLink { expected: Hash, found: Hash },
    #[error("index {found} does not follow tip (expected {expected})")]
    NonMonotonicIndex { expected: u64, found: u64 },
    #[error("timestamp {candidate} is earlier than tip timestamp {previous}")]
    NonMonotonicTimestamp { previous: i64, candidate: i64 },
    #[error("transaction {0} is already in the chain")]
    DuplicateTransaction(Hash),
    #[error("block contains a coinbase transaction outside the first position")]
    MisplacedCoinbase,
    #[error("transaction {hash} rejected: {source}")]
    Transaction {
        hash: Hash,
        #[source]
        source: TransactionError,
    },
}

/// Outcome of a failed `add_blocks`: the prefix before `index` was kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("block {index} ({hash}) rejected after accepting {accepted}: {reason}")]
pub struct BlockRejected {
    pub accepted: usize,
    pub index: u64,
    pub hash: Hash,
    #[source]
    pub reason: ChainValidationError,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("stored record is corrupt: {0}")]
    Decode(#[from] ProtocolError),
    #[error("stored chain failed validation: {0}")]
    InvalidChain(#[from] BlockRejected),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("keystore format error: {0}")]
    Format(#[from] serde_json::Error),
    #[error("invalid key: {0}")]
    InvalidKey(#[from] secp256k1::Error),
    #[error("address {0} is not in the keystore")]
    UnknownAddress(String),
}

/// Top level error for node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Rejected(#[from] BlockRejected),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error("active connection limit ({0}) reached")]
    ConnectionLimit(usize),
    #[error("could not resolve peer address {0}")]
    UnresolvedAddress(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;
