// Consensus and validation logic

pub mod validation;

pub use validation::{check_block_link, check_block_transactions, check_transaction, verify_chain};
