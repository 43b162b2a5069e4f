// Transaction and block validation rules

use std::collections::HashSet;

use crate::core::{Block, Hash, OutPoint, Transaction, TransactionInput, TransactionOutput};
use crate::error::{BlockRejected, ChainValidationError, TransactionError};

/// Sum amounts without wrapping
pub fn checked_sum(values: impl IntoIterator<Item = u64>) -> Result<u64, TransactionError> {
    values
        .into_iter()
        .try_fold(0u64, |total, value| total.checked_add(value))
        .ok_or(TransactionError::ValueOverflow)
}

/// Input/output value rules applied before a transaction is hashed.
///
/// Null inputs are only allowed as the single input of a coinbase, and a
/// coinbase is the only transaction whose outputs may exceed its inputs.
pub fn check_value_balance(
    inputs: &[TransactionInput],
    outputs: &[TransactionOutput],
) -> Result<(), TransactionError> {
    let coinbase = inputs.len() == 1 && inputs[0].is_null();
    if !coinbase && inputs.iter().any(TransactionInput::is_null) {
        return Err(TransactionError::NullInput);
    }

    let input_value = checked_sum(inputs.iter().map(|input| input.value))?;
    let output_value = checked_sum(outputs.iter().map(|output| output.value))?;

    if !coinbase && output_value > input_value {
        return Err(TransactionError::InsufficientInputValue {
            inputs: input_value,
            outputs: output_value,
        });
    }
    Ok(())
}

/// Checks for a transaction that arrived already built (from a peer or from storage)
pub fn check_transaction(tx: &Transaction) -> Result<(), TransactionError> {
    check_value_balance(tx.inputs(), tx.outputs())?;
    tx.verify_signature()
}

/// Does `candidate` directly extend `tip`?
///
/// The candidate's stored hash must match its contents. With no tip only a
/// genesis-position block (index 0, zero previous hash) fits.
pub fn check_block_link(tip: Option<&Block>, candidate: &Block) -> Result<(), ChainValidationError> {
    if candidate.calculate_hash() != candidate.hash() {
        return Err(ChainValidationError::HashMismatch(candidate.hash()));
    }
    let Some(tip) = tip else {
        if !candidate.previous_block_hash().is_zero() {
            return Err(ChainValidationError::BrokenLink {
                expected: Hash::zero(),
                found: candidate.previous_block_hash(),
            });
        }
        if candidate.index() != 0 {
            return Err(ChainValidationError::NonMonotonicIndex {
                expected: 0,
                found: candidate.index(),
            });
        }
        return Ok(());
    };

    if candidate.previous_block_hash() != tip.hash() {
        return Err(ChainValidationError::BrokenLink {
            expected: tip.hash(),
            found: candidate.previous_block_hash(),
        });
    }
    if candidate.index() != tip.index() + 1 {
        return Err(ChainValidationError::NonMonotonicIndex {
            expected: tip.index() + 1,
            found: candidate.index(),
        });
    }
    if candidate.timestamp() < tip.timestamp() {
        return Err(ChainValidationError::NonMonotonicTimestamp {
            previous: tip.timestamp().timestamp_millis(),
            candidate: candidate.timestamp().timestamp_millis(),
        });
    }
    Ok(())
}

/// Validate the transactions of `block` against the chain it would join.
///
/// `is_spent` and `is_known` answer for the chain below the block.
pub fn check_block_transactions(
    block: &Block,
    is_spent: impl Fn(&OutPoint) -> bool,
    is_known: impl Fn(&Hash) -> bool,
) -> Result<(), ChainValidationError> {
    let mut seen = HashSet::new();
    let mut spent_here = HashSet::new();

    for (position, tx) in block.transactions().iter().enumerate() {
        let hash = tx.hash();
        if tx.is_coinbase() && position != 0 {
            return Err(ChainValidationError::MisplacedCoinbase);
        }
        if is_known(&hash) || !seen.insert(hash) {
            return Err(ChainValidationError::DuplicateTransaction(hash));
        }
        check_transaction(tx)
            .map_err(|source| ChainValidationError::Transaction { hash, source })?;

        for outpoint in tx.spent_outpoints() {
            if is_spent(outpoint) || !spent_here.insert(*outpoint) {
                return Err(ChainValidationError::Transaction {
                    hash,
                    source: TransactionError::DoubleSpend(*outpoint),
                });
            }
        }
    }
    Ok(())
}

/// Re-check every link and every transaction of an already assembled chain
pub fn verify_chain(blocks: &[Block]) -> Result<(), BlockRejected> {
    let mut spent = HashSet::new();
    let mut known = HashSet::new();

    for (position, block) in blocks.iter().enumerate() {
        let reject = |reason| BlockRejected {
            accepted: position,
            index: block.index(),
            hash: block.hash(),
            reason,
        };
        let tip = position.checked_sub(1).map(|previous| &blocks[previous]);

        check_block_link(tip, block).map_err(reject)?;
        check_block_transactions(block, |op| spent.contains(op), |h| known.contains(h))
            .map_err(reject)?;

        for tx in block.transactions() {
            known.insert(tx.hash());
            spent.extend(tx.spent_outpoints().copied());
        }
    }
    Ok(())
}
