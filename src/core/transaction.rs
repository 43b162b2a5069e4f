// Transaction data structures

use std::io::Read;

use chrono::{DateTime, Utc};
use secp256k1::{Secp256k1, SecretKey};

use super::serialize::{
    read_flag, read_hash, read_list, read_timestamp, read_u32, read_u64, read_var_bytes,
    read_var_str, write_hash, write_list, write_timestamp, write_var_bytes, write_var_str,
};
use crate::consensus::validation;
use crate::core::{digest, now, sign, verify, Address, Hash, Serializable};
use crate::error::{ProtocolError, TransactionError};

/// Reference to one output of an earlier transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub transaction_hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(transaction_hash: Hash, index: u32) -> Self {
        Self { transaction_hash, index }
    }
}

/// Transaction input - claims `value` from a previous output
///
/// A null outpoint (no referenced transaction) marks a coinbase input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInput {
    pub outpoint: Option<OutPoint>,
    pub value: u64,
}

impl TransactionInput {
    pub fn new(outpoint: OutPoint, value: u64) -> Self {
        Self { outpoint: Some(outpoint), value }
    }

    /// Create a coinbase input (for mining rewards)
    pub fn coinbase(value: u64) -> Self {
        Self { outpoint: None, value }
    }

    pub fn is_null(&self) -> bool {
        self.outpoint.is_none()
    }
}

impl Serializable for TransactionInput {
    fn encode(&self, buf: &mut Vec<u8>) {
        match &self.outpoint {
            Some(outpoint) => {
                buf.push(1);
                write_hash(buf, &outpoint.transaction_hash);
                buf.extend_from_slice(&outpoint.index.to_le_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.value.to_le_bytes());
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        let outpoint = if read_flag(reader)? {
            let transaction_hash = read_hash(reader)?;
            let index = read_u32(reader)?;
            Some(OutPoint::new(transaction_hash, index))
        } else {
            None
        };
        let value = read_u64(reader)?;
        Ok(Self { outpoint, value })
    }
}

/// Transaction output - value payable to `destination`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOutput {
    pub destination: Address,
    pub value: u64,
}

impl TransactionOutput {
    pub fn new(destination: Address, value: u64) -> Self {
        Self { destination, value }
    }
}

impl Serializable for TransactionOutput {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_var_str(buf, self.destination.as_str());
        buf.extend_from_slice(&self.value.to_le_bytes());
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        let destination = Address(read_var_str(reader)?);
        let value = read_u64(reader)?;
        Ok(Self { destination, value })
    }
}

/// Compressed public key of the signer and its DER signature over the transaction hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSignature {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Everything a caller chooses about a new transaction
#[derive(Debug, Clone)]
pub struct TransactionParams {
    pub origin: Address,
    pub destination: Address,
    pub value: u64,
    pub note: Option<String>,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
}

/// Summary announced to peers before the full transaction is requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHeader {
    pub hash: Hash,
    pub timestamp: DateTime<Utc>,
    pub value: u64,
}

impl Serializable for TransactionHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_hash(buf, &self.hash);
        write_timestamp(buf, &self.timestamp);
        buf.extend_from_slice(&self.value.to_le_bytes());
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        Ok(Self {
            hash: read_hash(reader)?,
            timestamp: read_timestamp(reader)?,
            value: read_u64(reader)?,
        })
    }
}

/// Immutable once created: the hash is computed at construction
/// and covers every field except the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    timestamp: DateTime<Utc>,
    origin: Address,
    destination: Address,
    value: u64,
    note: Option<String>,
    inputs: Vec<TransactionInput>,
    outputs: Vec<TransactionOutput>,
    signature: Option<TransactionSignature>,
    transaction_hash: Hash,
}

impl Transaction {
    /// Validate the value balance and build a transaction stamped with the current time
    pub fn create(params: TransactionParams) -> Result<Self, TransactionError> {
        Self::create_at(params, now())
    }

    pub fn create_at(
        params: TransactionParams,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, TransactionError> {
        validation::check_value_balance(&params.inputs, &params.outputs)?;

        let mut tx = Self {
            timestamp,
            origin: params.origin,
            destination: params.destination,
            value: params.value,
            note: params.note,
            inputs: params.inputs,
            outputs: params.outputs,
            signature: None,
            transaction_hash: Hash::zero(),
        };
        tx.transaction_hash = tx.calculate_hash();
        Ok(tx)
    }

    /// Reward transaction: one null input, one output of `value` to `destination`.
    ///
    /// Always balanced, so no validation is needed.
    pub fn coinbase(
        destination: Address,
        value: u64,
        note: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut tx = Self {
            timestamp,
            origin: Address::coinbase(),
            destination: destination.clone(),
            value,
            note: Some(note),
            inputs: vec![TransactionInput::coinbase(value)],
            outputs: vec![TransactionOutput::new(destination, value)],
            signature: None,
            transaction_hash: Hash::zero(),
        };
        tx.transaction_hash = tx.calculate_hash();
        tx
    }

    /// Attach a signature made with `secret_key`. The hash does not change.
    pub fn sign(mut self, secret_key: &SecretKey) -> Self {
        let public_key = secret_key.public_key(&Secp256k1::signing_only());
        self.signature = Some(TransactionSignature {
            public_key: public_key.serialize().to_vec(),
            signature: sign(secret_key, &self.transaction_hash),
        });
        self
    }

    /// Unsigned transactions pass. A present signature must come from `origin`.
    pub fn verify_signature(&self) -> Result<(), TransactionError> {
        let Some(signature) = &self.signature else {
            return Ok(());
        };
        if Address::from_public_key(&signature.public_key) != self.origin {
            return Err(TransactionError::InvalidSignature);
        }
        if !verify(&signature.public_key, &self.transaction_hash, &signature.signature) {
            return Err(TransactionError::InvalidSignature);
        }
        Ok(())
    }

    pub fn hash(&self) -> Hash {
        self.transaction_hash
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn origin(&self) -> &Address {
        &self.origin
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    pub fn inputs(&self) -> &[TransactionInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TransactionOutput] {
        &self.outputs
    }

    pub fn signature(&self) -> Option<&TransactionSignature> {
        self.signature.as_ref()
    }

    /// Exactly one input, and that input is null
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_null()
    }

    /// Outpoints consumed by this transaction
    pub fn spent_outpoints(&self) -> impl Iterator<Item = &OutPoint> + '_ {
        self.inputs.iter().filter_map(|input| input.outpoint.as_ref())
    }

    pub fn header(&self) -> TransactionHeader {
        TransactionHeader {
            hash: self.transaction_hash,
            timestamp: self.timestamp,
            value: self.value,
        }
    }

    fn calculate_hash(&self) -> Hash {
        let mut buf = Vec::new();
        self.encode_body(&mut buf);
        digest(&buf)
    }

    // Hash input: every field except signature and hash
    fn encode_body(&self, buf: &mut Vec<u8>) {
        write_timestamp(buf, &self.timestamp);
        write_var_str(buf, self.origin.as_str());
        write_var_str(buf, self.destination.as_str());
        buf.extend_from_slice(&self.value.to_le_bytes());
        match &self.note {
            Some(note) => {
                buf.push(1);
                write_var_str(buf, note);
            }
            None => buf.push(0),
        }
        write_list(buf, &self.inputs);
        write_list(buf, &self.outputs);
    }
}

impl Serializable for Transaction {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.encode_body(buf);
        match &self.signature {
            Some(signature) => {
                buf.push(1);
                write_var_bytes(buf, &signature.public_key);
                write_var_bytes(buf, &signature.signature);
            }
            None => buf.push(0),
        }
        write_hash(buf, &self.transaction_hash);
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        let timestamp = read_timestamp(reader)?;
        let origin = Address(read_var_str(reader)?);
        let destination = Address(read_var_str(reader)?);
        let value = read_u64(reader)?;
        let note = if read_flag(reader)? { Some(read_var_str(reader)?) } else { None };
        let inputs = read_list(reader)?;
        let outputs = read_list(reader)?;
        let signature = if read_flag(reader)? {
            Some(TransactionSignature {
                public_key: read_var_bytes(reader)?,
                signature: read_var_bytes(reader)?,
            })
        } else {
            None
        };
        let transaction_hash = read_hash(reader)?;

        let tx = Self {
            timestamp,
            origin,
            destination,
            value,
            note,
            inputs,
            outputs,
            signature,
            transaction_hash,
        };
        if tx.calculate_hash() != transaction_hash {
            return Err(ProtocolError::HashMismatch);
        }
        Ok(tx)
    }
}
