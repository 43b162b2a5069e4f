// Handling of messages received on an Active connection

use uuid::Uuid;

use crate::core::{Block, Hash};
use crate::error::{ProtocolError, Result};
use crate::network::{
    AddressMessage, DataMessage, GetDataMessage, GetDataType, Message, Node, Payload, PeerRecord,
    DEFAULT_BATCH_LIMIT,
};

/// Handle one inbound message and return the replies for the sender.
///
/// Errors are reported to the caller, which logs them; the connection stays up.
pub(crate) async fn handle_message(node: &Node, peer_id: &Uuid, message: Message) -> Result<Vec<Payload>> {
    let request = message.request_type();
    match message.payload {
        Payload::GetData(query) => Ok(vec![serve_get_data(node, &query).await]),
        Payload::Data(data) => receive_data(node, peer_id, data).await,
        Payload::GetAddresses => {
            let addresses = node.directory().address_payloads(node.config().peer_record_limit);
            Ok(vec![Payload::Addresses(AddressMessage { addresses })])
        }
        Payload::Addresses(message) => {
            let offered = message.addresses.len();
            let added = {
                let mut directory = node.directory();
                message
                    .addresses
                    .into_iter()
                    .filter(|address| directory.add(PeerRecord::from(address.clone())))
                    .count()
            };
            log::debug!("{} of {} addresses from {} were new", added, offered, peer_id);
            Ok(Vec::new())
        }
        Payload::Ping => Ok(vec![Payload::Pong]),
        Payload::Pong => {
            node.directory().touch(peer_id);
            Ok(Vec::new())
        }
        Payload::HandshakeOffer(_) | Payload::HandshakeResponse(_) => {
            Err(ProtocolError::InvalidMessage(format!("{} on an established connection", request.name())).into())
        }
    }
}

async fn serve_get_data(node: &Node, request: &GetDataMessage) -> Payload {
    let ledger = node.ledger().read().await;
    let chain = ledger.blockchain();
    let limit = request.batch_limit();

    let data = match request.data_type {
        GetDataType::Blockchain => DataMessage::BlockHeaders(chain.headers_after(&request.stop_hash, limit)),
        GetDataType::Blocks if request.object_hashes.is_empty() => {
            DataMessage::Blocks(chain.blocks_after(&request.stop_hash, limit).to_vec())
        }
        GetDataType::Blocks => DataMessage::Blocks(
            request
                .object_hashes
                .iter()
                .filter_map(|hash| chain.block_by_hash(hash))
                .take(limit)
                .cloned()
                .collect(),
        ),
        GetDataType::Transactions => DataMessage::Transactions(
            request
                .object_hashes
                .iter()
                .filter_map(|hash| chain.transaction(hash).or_else(|| ledger.mempool().get(hash)))
                .take(limit)
                .cloned()
                .collect(),
        ),
        GetDataType::Mempool => DataMessage::TransactionHeaders(ledger.mempool().headers(limit)),
    };
    log::debug!("Answering {:?} request with {} items", request.data_type, data.len());
    Payload::Data(data)
}

async fn receive_data(node: &Node, peer_id: &Uuid, data: DataMessage) -> Result<Vec<Payload>> {
    match data {
        DataMessage::BlockHeaders(headers) => {
            let unknown: Vec<Hash> = {
                let ledger = node.ledger().read().await;
                headers
                    .iter()
                    .map(|header| header.hash)
                    .filter(|hash| !ledger.blockchain().contains_block(hash))
                    .collect()
            };
            if unknown.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![Payload::GetData(GetDataMessage::blocks(unknown))])
        }
        DataMessage::Blocks(blocks) => accept_blocks(node, peer_id, blocks).await,
        DataMessage::TransactionHeaders(headers) => {
            let unknown: Vec<Hash> = {
                let ledger = node.ledger().read().await;
                headers
                    .iter()
                    .map(|header| header.hash)
                    .filter(|hash| {
                        !ledger.mempool().contains(hash) && !ledger.blockchain().contains_transaction(hash)
                    })
                    .collect()
            };
            if unknown.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![Payload::GetData(GetDataMessage::transactions(unknown))])
        }
        DataMessage::Transactions(transactions) => {
            let mut accepted = Vec::new();
            {
                let mut ledger = node.ledger().write().await;
                for tx in transactions {
                    let header = tx.header();
                    match ledger.add_transaction(tx) {
                        Ok(true) => accepted.push(header),
                        Ok(false) => log::trace!("Transaction {} already known", header.hash),
                        Err(e) => log::warn!("Rejected transaction {} from {}: {}", header.hash, peer_id, e),
                    }
                }
            }
            if !accepted.is_empty() {
                log::info!("Accepted {} transactions from {}", accepted.len(), peer_id);
                node.broadcast(
                    Payload::Data(DataMessage::TransactionHeaders(accepted)),
                    Some(peer_id),
                );
            }
            Ok(Vec::new())
        }
    }
}

/// Append received blocks, persist and relay what was accepted.
///
/// When the sender is ahead of us by more than the blocks it sent, or sent a
/// full batch, ask for the blocks following our new tip.
async fn accept_blocks(node: &Node, peer_id: &Uuid, blocks: Vec<Block>) -> Result<Vec<Payload>> {
    if blocks.is_empty() {
        return Ok(Vec::new());
    }
    let received = blocks.len();

    let (result, appended, tip) = {
        let mut ledger = node.ledger().write().await;
        let before = ledger.blockchain().len();
        let result = ledger.add_blocks(blocks);
        let chain = ledger.blockchain();
        let appended = chain.blocks()[before..].to_vec();
        let tip = chain.tip().map(|tip| (tip.index(), tip.hash()));
        node.persist_blocks(&appended);
        (result, appended, tip)
    };

    if !appended.is_empty() {
        log::info!(
            "Accepted {} blocks from {}, height now {}",
            appended.len(),
            peer_id,
            tip.map_or(0, |(index, _)| index)
        );
        node.broadcast(
            Payload::Data(DataMessage::BlockHeaders(appended.iter().map(Block::header).collect())),
            Some(peer_id),
        );
    }

    let Some((tip_index, tip_hash)) = tip else {
        return Ok(Vec::new());
    };
    let behind = match result {
        Ok(_) => received >= DEFAULT_BATCH_LIMIT,
        Err(rejected) => {
            log::warn!("Block from {} rejected: {}", peer_id, rejected);
            rejected.index > tip_index + 1
        }
    };
    if behind {
        return Ok(vec![Payload::GetData(GetDataMessage::blocks_after(tip_hash))]);
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::core::{
        digest, now, Address, OutPoint, Transaction, TransactionInput, TransactionOutput,
        TransactionParams,
    };
    use crate::network::{AddressPayload, NetworkType, NODE_NETWORK};
    use num_bigint::BigUint;

    fn node() -> Node {
        Node::new(NodeConfig::default()).unwrap()
    }

    fn message(payload: Payload) -> Message {
        Message::new(NetworkType::Main, payload)
    }

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

    /// Blocks extending genesis, built off-node
    fn extension(count: usize) -> Vec<Block> {
        let mut blocks = vec![Block::genesis()];
        for _ in 0..count {
            let next = Block::create(blocks.last(), vec![]);
            blocks.push(next);
        }
        blocks.split_off(1)
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let node = node();
        let replies = handle_message(&node, &Uuid::new_v4(), message(Payload::Ping)).await.unwrap();
        assert_eq!(replies, vec![Payload::Pong]);
    }

    #[tokio::test]
    async fn test_get_data_blockchain_headers() {
        let node = node();
        node.mine_block().await.unwrap();
        node.mine_block().await.unwrap();

        let request = GetDataMessage::new(GetDataType::Blockchain, 0, vec![], Hash::zero());
        let replies = handle_message(&node, &Uuid::new_v4(), message(Payload::GetData(request)))
            .await
            .unwrap();
        let [Payload::Data(DataMessage::BlockHeaders(headers))] = replies.as_slice() else {
            panic!("unexpected reply {replies:?}");
        };
        let indexes: Vec<u64> = headers.iter().map(|header| header.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_get_data_unknown_stop_hash_is_empty() {
        let node = node();
        let request = Payload::GetData(GetDataMessage::blocks_after(digest(b"nowhere")));
        let replies = handle_message(&node, &Uuid::new_v4(), message(request)).await.unwrap();
        assert_eq!(replies, vec![Payload::Data(DataMessage::Blocks(vec![]))]);
    }

    #[tokio::test]
    async fn test_get_data_transactions_from_mempool() {
        let node = node();
        let tx = spend(b"coin", 7);
        node.add_new_transaction(tx.clone()).await.unwrap();

        let request = Payload::GetData(GetDataMessage::transactions(vec![tx.hash(), digest(b"x")]));
        let replies = handle_message(&node, &Uuid::new_v4(), message(request)).await.unwrap();
        assert_eq!(replies, vec![Payload::Data(DataMessage::Transactions(vec![tx.clone()]))]);

        let request = Payload::GetData(GetDataMessage::mempool(10));
        let replies = handle_message(&node, &Uuid::new_v4(), message(request)).await.unwrap();
        assert_eq!(
            replies,
            vec![Payload::Data(DataMessage::TransactionHeaders(vec![tx.header()]))]
        );
    }

    #[tokio::test]
    async fn test_block_headers_request_unknown_blocks() {
        let node = node();
        let blocks = extension(2);
        let headers = vec![Block::genesis().header(), blocks[0].header(), blocks[1].header()];

        let replies = handle_message(
            &node,
            &Uuid::new_v4(),
            message(Payload::Data(DataMessage::BlockHeaders(headers))),
        )
        .await
        .unwrap();
        assert_eq!(
            replies,
            vec![Payload::GetData(GetDataMessage::blocks(vec![blocks[0].hash(), blocks[1].hash()]))]
        );
    }

    #[tokio::test]
    async fn test_received_blocks_are_persisted() {
        let node = node();
        let blocks = extension(3);

        let replies = handle_message(
            &node,
            &Uuid::new_v4(),
            message(Payload::Data(DataMessage::Blocks(blocks.clone()))),
        )
        .await
        .unwrap();
        assert!(replies.is_empty());
        assert_eq!(node.chain_height().await, 3);
        assert_eq!(node.storage().blocks.tip_index().unwrap(), Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stored_chain_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..NodeConfig::default()
        };
        let blocks = extension(6);

        {
            let node = Node::new(config.clone()).unwrap();
            for batch in blocks.chunks(2) {
                // The same batch from two peers at once
                let deliveries: Vec<_> = (0..2)
                    .map(|_| {
                        let node = node.clone();
                        let batch = batch.to_vec();
                        tokio::spawn(async move {
                            let payload = Payload::Data(DataMessage::Blocks(batch));
                            handle_message(&node, &Uuid::new_v4(), message(payload)).await
                        })
                    })
                    .collect();
                for delivery in deliveries {
                    delivery.await.unwrap().unwrap();
                }
            }
            node.mine_block().await.unwrap();
            assert_eq!(node.chain_height().await, 7);
            node.storage().flush().unwrap();
        }

        let node = Node::new(config).unwrap();
        let chain = node.get_blockchain().await;
        assert_eq!(chain.len(), 8);
        assert_eq!(&chain.blocks()[1..7], blocks.as_slice());
        assert_eq!(node.storage().blocks.tip_index().unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_gap_triggers_resync_request() {
        let node = node();
        let blocks = extension(3);

        let replies = handle_message(
            &node,
            &Uuid::new_v4(),
            message(Payload::Data(DataMessage::Blocks(vec![blocks[2].clone()]))),
        )
        .await
        .unwrap();
        assert_eq!(
            replies,
            vec![Payload::GetData(GetDataMessage::blocks_after(Block::genesis().hash()))]
        );
        assert_eq!(node.chain_height().await, 0);
    }

    #[tokio::test]
    async fn test_transaction_headers_and_bodies() {
        let node = node();
        let tx = spend(b"coin", 3);

        let replies = handle_message(
            &node,
            &Uuid::new_v4(),
            message(Payload::Data(DataMessage::TransactionHeaders(vec![tx.header()]))),
        )
        .await
        .unwrap();
        assert_eq!(replies, vec![Payload::GetData(GetDataMessage::transactions(vec![tx.hash()]))]);

        let bad = Transaction::create(TransactionParams {
            origin: Address::new("mallory"),
            destination: Address::new("mallory"),
            value: 3,
            note: None,
            inputs: vec![TransactionInput::new(OutPoint::new(digest(b"coin"), 0), 3)],
            outputs: vec![TransactionOutput::new(Address::new("mallory"), 3)],
        })
        .unwrap();
        let replies = handle_message(
            &node,
            &Uuid::new_v4(),
            message(Payload::Data(DataMessage::Transactions(vec![tx.clone(), bad.clone()]))),
        )
        .await
        .unwrap();
        assert!(replies.is_empty());
        assert_eq!(node.get_transactions(10).await, vec![tx]);
    }

    #[tokio::test]
    async fn test_address_exchange() {
        let node = node();
        let sender = Uuid::new_v4();
        let advertised = AddressPayload {
            node_identifier: sender,
            timestamp: now(),
            services: BigUint::from(NODE_NETWORK),
            ip_address: "10.9.8.7".to_string(),
            port: 7400,
        };
        let own = AddressPayload {
            node_identifier: node.node_id(),
            ..advertised.clone()
        };

        let replies = handle_message(
            &node,
            &sender,
            message(Payload::Addresses(AddressMessage {
                addresses: vec![advertised.clone(), own],
            })),
        )
        .await
        .unwrap();
        assert!(replies.is_empty());

        let replies = handle_message(&node, &sender, message(Payload::GetAddresses)).await.unwrap();
        assert_eq!(
            replies,
            vec![Payload::Addresses(AddressMessage { addresses: vec![advertised] })]
        );
    }

    #[tokio::test]
    async fn test_handshake_after_activation_is_an_error() {
        let node = node();
        let offer = crate::network::HandshakeMessage {
            version: 1,
            services: BigUint::from(NODE_NETWORK),
            timestamp: now(),
            node_identifier: Uuid::new_v4(),
            sender_address: "127.0.0.1".to_string(),
            sender_port: 1,
            receiver_address: "127.0.0.1".to_string(),
            receiver_port: 2,
            chain_height: 0,
        };
        let result = handle_message(&node, &Uuid::new_v4(), message(Payload::HandshakeOffer(offer))).await;
        assert!(result.is_err());
    }
}
