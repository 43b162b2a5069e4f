// Two or more nodes talking over loopback TCP

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use yggdrasil_node::core::{digest, TransactionInput, TransactionOutput};
use yggdrasil_node::{Address, Node, NodeConfig, OutPoint, Transaction, TransactionParams};

fn config() -> NodeConfig {
    NodeConfig {
        listen_address: "127.0.0.1".to_string(),
        port: 0,
        connection_timeout_ms: 2_000,
        ..NodeConfig::default()
    }
}

async fn start(config: NodeConfig) -> (Node, SocketAddr) {
    let node = Node::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = node.clone();
    tokio::spawn(async move { server.serve(listener).await });
    (node, addr)
}

/// Poll `check` until it holds or five seconds pass
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn payment(seed: &[u8]) -> Transaction {
    Transaction::create(TransactionParams {
        origin: Address::new("alice"),
        destination: Address::new("bob"),
        value: 7,
        note: Some("rent".to_string()),
        inputs: vec![TransactionInput::new(OutPoint::new(digest(seed), 0), 7)],
        outputs: vec![TransactionOutput::new(Address::new("bob"), 7)],
    })
    .unwrap()
}

#[tokio::test]
async fn test_sync_and_relay() {
    let (a, a_addr) = start(config()).await;
    for _ in 0..3 {
        a.mine_block().await.unwrap();
    }

    let (b, _) = start(config()).await;
    let (a, b) = (&a, &b);
    let remote = b.connect_to_peer(a_addr).await.unwrap();
    assert_eq!(remote, a.node_id());

    assert!(eventually(|| async move { b.chain_height().await == 3 }).await);
    assert_eq!(
        b.get_blockchain().await.blocks(),
        a.get_blockchain().await.blocks()
    );
    assert!(eventually(|| async move { a.connections().is_connected(&b.node_id()) }).await);
    assert!(b.known_peers(10).iter().any(|record| record.node_identifier == a.node_id()));

    let tx = payment(b"relay");
    assert!(b.add_new_transaction(tx.clone()).await.unwrap());
    let relayed = &tx;
    assert!(eventually(|| async move { a.get_transactions(10).await.contains(relayed) }).await);

    let block = a.mine_block().await.unwrap();
    assert!(block.transactions().contains(&tx));
    assert!(eventually(|| async move { b.chain_height().await == 4 }).await);
    assert!(b.get_transactions(10).await.is_empty());
    assert!(b.get_blockchain().await.contains_transaction(&tx.hash()));
}

#[tokio::test]
async fn test_connecting_to_self_fails() {
    let (a, a_addr) = start(config()).await;
    let a = &a;

    assert!(a.connect_to_peer(a_addr).await.is_err());
    assert!(eventually(|| async move { a.connections().is_empty() }).await);
}

#[tokio::test]
async fn test_duplicate_connection_refused() {
    let (a, a_addr) = start(config()).await;
    let (b, _) = start(config()).await;
    let a = &a;

    b.connect_to_peer(a_addr).await.unwrap();
    assert!(b.connect_to_peer(a_addr).await.is_err());

    assert!(eventually(|| async move { a.connections().active_count() == 1 && a.connections().len() == 1 }).await);
    assert_eq!(b.connections().active_count(), 1);
}

#[tokio::test]
async fn test_full_node_drops_new_connections() {
    let (full, full_addr) = start(NodeConfig {
        active_connections: 1,
        ..config()
    })
    .await;
    let (first, _) = start(config()).await;
    let (second, _) = start(config()).await;
    let full = &full;

    first.connect_to_peer(full_addr).await.unwrap();
    assert!(eventually(|| async move { full.connections().active_count() == 1 }).await);

    assert!(second.connect_to_peer(full_addr).await.is_err());
    assert!(second.connections().is_empty());
    assert!(full.connections().is_connected(&first.node_id()));
}
