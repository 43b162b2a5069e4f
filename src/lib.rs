// Yggdrasil: peer-to-peer blockchain node
// Hash-linked ledger, mempool and a framed binary peer protocol

pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod error;
pub mod ledger;
pub mod network;
pub mod storage;
pub mod wallet;

// Re-exports for convenience
pub use cli::{Cli, CliHandler};
pub use config::NodeConfig;
pub use core::{Address, Block, BlockHeader, Hash, OutPoint, Transaction, TransactionParams};
pub use error::{NodeError, ProtocolError};
pub use ledger::{Blockchain, Ledger, Mempool, SharedLedger};
pub use network::{Message, NetworkType, Node, Payload, RequestType};
pub use storage::Storage;
pub use wallet::{KeyPair, Keystore};
