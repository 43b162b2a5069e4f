// Message payload variants

use std::io::Read;

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use uuid::Uuid;

use crate::core::{
    count_u32, read_code, read_hash, read_list, read_timestamp, read_u16, read_u32, read_u64,
    read_var_bytes, read_var_str, write_hash, write_list, write_timestamp, write_var_bytes,
    write_var_str, Block, BlockHeader, Hash, Serializable, Transaction, TransactionHeader,
};
use crate::error::ProtocolError;
use crate::network::RequestType;

/// Service bit: the node relays blocks and transactions
pub const NODE_NETWORK: u64 = 1;

/// Batch size used when a GetData request leaves `limit` at zero
pub const DEFAULT_BATCH_LIMIT: usize = 500;

fn write_services(buf: &mut Vec<u8>, services: &BigUint) {
    write_var_bytes(buf, &services.to_bytes_be());
}

fn read_services(reader: &mut dyn Read) -> Result<BigUint, ProtocolError> {
    Ok(BigUint::from_bytes_be(&read_var_bytes(reader)?))
}

fn write_uuid(buf: &mut Vec<u8>, id: &Uuid) {
    buf.extend_from_slice(id.as_bytes());
}

fn read_uuid(reader: &mut dyn Read) -> Result<Uuid, ProtocolError> {
    let mut bytes = [0u8; 16];
    reader.read_exact(&mut bytes)?;
    Ok(Uuid::from_bytes(bytes))
}

/// WVTO / WVBK body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub version: u32,
    pub services: BigUint,
    pub timestamp: DateTime<Utc>,
    pub node_identifier: Uuid,
    pub sender_address: String,
    pub sender_port: u16,
    pub receiver_address: String,
    pub receiver_port: u16,
    pub chain_height: u64,
}

impl Serializable for HandshakeMessage {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_services(buf, &self.services);
        write_timestamp(buf, &self.timestamp);
        write_uuid(buf, &self.node_identifier);
        write_var_str(buf, &self.sender_address);
        buf.extend_from_slice(&self.sender_port.to_le_bytes());
        write_var_str(buf, &self.receiver_address);
        buf.extend_from_slice(&self.receiver_port.to_le_bytes());
        buf.extend_from_slice(&self.chain_height.to_le_bytes());
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: read_u32(reader)?,
            services: read_services(reader)?,
            timestamp: read_timestamp(reader)?,
            node_identifier: read_uuid(reader)?,
            sender_address: read_var_str(reader)?,
            sender_port: read_u16(reader)?,
            receiver_address: read_var_str(reader)?,
            receiver_port: read_u16(reader)?,
            chain_height: read_u64(reader)?,
        })
    }
}

/// What a GetData request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GetDataType {
    /// Block headers after `stop_hash`
    Blockchain,
    /// Full blocks, by hash or after `stop_hash`
    Blocks,
    /// Full transactions by hash
    Transactions,
    /// Headers of pending transactions
    Mempool,
}

impl GetDataType {
    pub fn code(&self) -> [u8; 4] {
        match self {
            GetDataType::Blockchain => *b"BLKC",
            GetDataType::Blocks => *b"BLKS",
            GetDataType::Transactions => *b"TXNS",
            GetDataType::Mempool => *b"MMPL",
        }
    }

    pub fn from_code(code: [u8; 4]) -> Result<Self, ProtocolError> {
        match &code {
            b"BLKC" => Ok(GetDataType::Blockchain),
            b"BLKS" => Ok(GetDataType::Blocks),
            b"TXNS" => Ok(GetDataType::Transactions),
            b"MMPL" => Ok(GetDataType::Mempool),
            _ => Err(ProtocolError::UnknownDataType(code)),
        }
    }
}

/// Typed header announcements carried in RDAT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderType {
    Block,
    Transaction,
}

impl HeaderType {
    pub fn code(&self) -> [u8; 4] {
        match self {
            HeaderType::Block => *b"BLKH",
            HeaderType::Transaction => *b"TXNH",
        }
    }
}

/// GDAT body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDataMessage {
    pub data_type: GetDataType,
    /// Maximum number of items wanted; zero means the default batch
    pub limit: u32,
    pub object_hashes: Vec<Hash>,
    pub stop_hash: Hash,
}

impl GetDataMessage {
    pub fn new(data_type: GetDataType, limit: u32, object_hashes: Vec<Hash>, stop_hash: Hash) -> Self {
        Self {
            data_type,
            limit,
            object_hashes,
            stop_hash,
        }
    }

    /// Blocks following `after`
    pub fn blocks_after(after: Hash) -> Self {
        Self::new(GetDataType::Blocks, 0, Vec::new(), after)
    }

    pub fn blocks(hashes: Vec<Hash>) -> Self {
        Self::new(GetDataType::Blocks, count_u32(hashes.len()), hashes, Hash::zero())
    }

    pub fn transactions(hashes: Vec<Hash>) -> Self {
        Self::new(GetDataType::Transactions, count_u32(hashes.len()), hashes, Hash::zero())
    }

    pub fn mempool(limit: u32) -> Self {
        Self::new(GetDataType::Mempool, limit, Vec::new(), Hash::zero())
    }

    pub fn batch_limit(&self) -> usize {
        match self.limit {
            0 => DEFAULT_BATCH_LIMIT,
            limit => limit as usize,
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self.data_type {
            GetDataType::Transactions if self.object_hashes.is_empty() => Err(
                ProtocolError::InvalidMessage("TXNS request names no transactions".to_string()),
            ),
            GetDataType::Mempool if self.limit == 0 => Err(ProtocolError::InvalidMessage(
                "MMPL request with zero limit".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl Serializable for GetDataMessage {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.data_type.code());
        buf.extend_from_slice(&self.limit.to_le_bytes());
        write_list(buf, &self.object_hashes);
        write_hash(buf, &self.stop_hash);
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        let message = Self {
            data_type: GetDataType::from_code(read_code(reader)?)?,
            limit: read_u32(reader)?,
            object_hashes: read_list(reader)?,
            stop_hash: read_hash(reader)?,
        };
        message.validate()?;
        Ok(message)
    }
}

/// RDAT body, tagged by a four byte code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMessage {
    BlockHeaders(Vec<BlockHeader>),
    TransactionHeaders(Vec<TransactionHeader>),
    Blocks(Vec<Block>),
    Transactions(Vec<Transaction>),
}

impl DataMessage {
    pub fn code(&self) -> [u8; 4] {
        match self {
            DataMessage::BlockHeaders(_) => HeaderType::Block.code(),
            DataMessage::TransactionHeaders(_) => HeaderType::Transaction.code(),
            DataMessage::Blocks(_) => GetDataType::Blocks.code(),
            DataMessage::Transactions(_) => GetDataType::Transactions.code(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DataMessage::BlockHeaders(items) => items.len(),
            DataMessage::TransactionHeaders(items) => items.len(),
            DataMessage::Blocks(items) => items.len(),
            DataMessage::Transactions(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Serializable for DataMessage {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.code());
        match self {
            DataMessage::BlockHeaders(items) => write_list(buf, items),
            DataMessage::TransactionHeaders(items) => write_list(buf, items),
            DataMessage::Blocks(items) => write_list(buf, items),
            DataMessage::Transactions(items) => write_list(buf, items),
        }
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        let code = read_code(reader)?;
        match &code {
            b"BLKH" => Ok(DataMessage::BlockHeaders(read_list(reader)?)),
            b"TXNH" => Ok(DataMessage::TransactionHeaders(read_list(reader)?)),
            b"BLKS" => Ok(DataMessage::Blocks(read_list(reader)?)),
            b"TXNS" => Ok(DataMessage::Transactions(read_list(reader)?)),
            _ => Err(ProtocolError::UnknownDataType(code)),
        }
    }
}

/// One peer as advertised in RADD
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPayload {
    pub node_identifier: Uuid,
    pub timestamp: DateTime<Utc>,
    pub services: BigUint,
    pub ip_address: String,
    pub port: u16,
}

impl Serializable for AddressPayload {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_uuid(buf, &self.node_identifier);
        write_timestamp(buf, &self.timestamp);
        write_services(buf, &self.services);
        write_var_str(buf, &self.ip_address);
        buf.extend_from_slice(&self.port.to_le_bytes());
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        Ok(Self {
            node_identifier: read_uuid(reader)?,
            timestamp: read_timestamp(reader)?,
            services: read_services(reader)?,
            ip_address: read_var_str(reader)?,
            port: read_u16(reader)?,
        })
    }
}

/// RADD body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressMessage {
    pub addresses: Vec<AddressPayload>,
}

impl Serializable for AddressMessage {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_list(buf, &self.addresses);
    }

    fn decode(reader: &mut dyn Read) -> Result<Self, ProtocolError> {
        Ok(Self {
            addresses: read_list(reader)?,
        })
    }
}

/// Payload keyed by request type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    HandshakeOffer(HandshakeMessage),
    HandshakeResponse(HandshakeMessage),
    GetData(GetDataMessage),
    Data(DataMessage),
    GetAddresses,
    Addresses(AddressMessage),
    Ping,
    Pong,
}

impl Payload {
    pub fn request_type(&self) -> RequestType {
        match self {
            Payload::HandshakeOffer(_) => RequestType::HandshakeOffer,
            Payload::HandshakeResponse(_) => RequestType::HandshakeResponse,
            Payload::GetData(_) => RequestType::GetData,
            Payload::Data(_) => RequestType::DataResponse,
            Payload::GetAddresses => RequestType::GetAddresses,
            Payload::Addresses(_) => RequestType::AddressResponse,
            Payload::Ping => RequestType::Ping,
            Payload::Pong => RequestType::Pong,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Payload::HandshakeOffer(body) | Payload::HandshakeResponse(body) => body.serialize(),
            Payload::GetData(body) => body.serialize(),
            Payload::Data(body) => body.serialize(),
            Payload::Addresses(body) => body.serialize(),
            Payload::GetAddresses | Payload::Ping | Payload::Pong => Vec::new(),
        }
    }

    /// Decode the payload bytes of an already validated frame
    pub fn decode(request: RequestType, bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match request {
            RequestType::HandshakeOffer => Payload::HandshakeOffer(HandshakeMessage::deserialize(bytes)?),
            RequestType::HandshakeResponse => {
                Payload::HandshakeResponse(HandshakeMessage::deserialize(bytes)?)
            }
            RequestType::GetData => Payload::GetData(GetDataMessage::deserialize(bytes)?),
            RequestType::DataResponse => Payload::Data(DataMessage::deserialize(bytes)?),
            RequestType::AddressResponse => Payload::Addresses(AddressMessage::deserialize(bytes)?),
            RequestType::GetAddresses => Payload::GetAddresses,
            RequestType::Ping => Payload::Ping,
            RequestType::Pong => Payload::Pong,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest;
    use crate::network::{Message, NetworkType};

    fn handshake() -> HandshakeMessage {
        HandshakeMessage {
            version: 1,
            services: BigUint::from(NODE_NETWORK),
            timestamp: crate::core::now(),
            node_identifier: Uuid::new_v4(),
            sender_address: "10.0.0.1".to_string(),
            sender_port: 7400,
            receiver_address: "10.0.0.2".to_string(),
            receiver_port: 7401,
            chain_height: 12,
        }
    }

    #[test]
    fn test_handshake_through_frame() {
        let offer = handshake();
        let bytes = Message::new(NetworkType::Main, Payload::HandshakeOffer(offer.clone()))
            .encode()
            .unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.payload, Payload::HandshakeOffer(offer));
    }

    #[test]
    fn test_large_services_value() {
        let mut offer = handshake();
        offer.services = BigUint::from(1u8) << 130;
        let decoded = HandshakeMessage::deserialize(&offer.serialize()).unwrap();
        assert_eq!(decoded.services, offer.services);
    }

    #[test]
    fn test_get_data_validation() {
        let empty_txns = GetDataMessage::new(GetDataType::Transactions, 5, vec![], Hash::zero());
        assert!(matches!(
            GetDataMessage::deserialize(&empty_txns.serialize()),
            Err(ProtocolError::InvalidMessage(_))
        ));

        let zero_mempool = GetDataMessage::new(GetDataType::Mempool, 0, vec![], Hash::zero());
        assert!(matches!(
            GetDataMessage::deserialize(&zero_mempool.serialize()),
            Err(ProtocolError::InvalidMessage(_))
        ));

        let blocks = GetDataMessage::blocks(vec![digest(b"a"), digest(b"b")]);
        assert_eq!(GetDataMessage::deserialize(&blocks.serialize()).unwrap(), blocks);
        assert_eq!(GetDataMessage::blocks_after(Hash::zero()).batch_limit(), DEFAULT_BATCH_LIMIT);
    }

    #[test]
    fn test_unknown_get_data_type() {
        let mut bytes = GetDataMessage::mempool(1).serialize();
        bytes[..4].copy_from_slice(b"ZZZZ");
        assert_eq!(
            GetDataMessage::deserialize(&bytes),
            Err(ProtocolError::UnknownDataType(*b"ZZZZ"))
        );
    }

    #[test]
    fn test_data_message_tags() {
        let genesis = Block::genesis();
        let cases = [
            (DataMessage::BlockHeaders(vec![genesis.header()]), *b"BLKH"),
            (DataMessage::Blocks(vec![genesis.clone()]), *b"BLKS"),
            (DataMessage::Transactions(genesis.transactions().to_vec()), *b"TXNS"),
            (DataMessage::TransactionHeaders(vec![]), *b"TXNH"),
        ];
        for (message, tag) in cases {
            let bytes = message.serialize();
            assert_eq!(&bytes[..4], &tag);
            assert_eq!(DataMessage::deserialize(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn test_address_message() {
        let message = AddressMessage {
            addresses: vec![AddressPayload {
                node_identifier: Uuid::new_v4(),
                timestamp: crate::core::now(),
                services: BigUint::from(NODE_NETWORK),
                ip_address: "192.168.1.4".to_string(),
                port: 7400,
            }],
        };
        let payload = Payload::Addresses(message.clone());
        assert_eq!(payload.request_type(), RequestType::AddressResponse);
        assert_eq!(
            Payload::decode(RequestType::AddressResponse, &payload.serialize()).unwrap(),
            payload
        );
    }
}
