// Basic types for the ledger

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::core::hash160;

/// Length of a block or transaction digest (SHA3-512)
pub const HASH_SIZE: usize = 64;

/// Length of a frame checksum (SHA3-256)
pub const CHECKSUM_SIZE: usize = 32;

/// Base units per coin
pub const COIN: u64 = 100_000_000;

/// 512-bit digest used for block hashes, transaction hashes and outpoints
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a Hash from a slice
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; HASH_SIZE] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// All-zero hash, the previous hash of a genesis block
    pub fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Prints only the first 8 bytes
impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hash({}..)", &self.to_hex()[..16])
    }
}

/// Frame checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum(pub [u8; CHECKSUM_SIZE]);

impl Checksum {
    pub fn as_bytes(&self) -> &[u8; CHECKSUM_SIZE] {
        &self.0
    }
}

/// Account address: hex encoded RIPEMD160(SHA256(public key))
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Derive the address owned by a serialized public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(hex::encode(hash160(public_key)))
    }

    /// Origin used by coinbase transactions
    pub fn coinbase() -> Self {
        Self("0".repeat(40))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current UTC time at the precision the wire format keeps
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
