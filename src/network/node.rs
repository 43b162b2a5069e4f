// Network node - owns the ledger, the peer directory and live connections

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use num_bigint::BigUint;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpListener};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::core::{count_u32, now, Block, Hash, Transaction};
use crate::error::{ConnectionError, NodeError, Result, StorageError};
use crate::ledger::{Blockchain, Ledger, SharedLedger};
use crate::network::connections::{ConnectionRegistry, ConnectionSlot};
use crate::network::handlers::handle_message;
use crate::network::peer::{read_message, write_message};
use crate::network::{
    DataMessage, Direction, GetDataMessage, HandshakeMessage, Message, Payload, Peer,
    PeerDirectory, PeerRecord, NODE_NETWORK,
};
use crate::storage::Storage;

/// Messages queued for one connection's writer
const OUTBOX_CAPACITY: usize = 256;
/// Inbound messages waiting for the dispatcher
const DISPATCH_CAPACITY: usize = 64;

/// A handshaken connection, ready to run
struct Session {
    peer_id: Uuid,
    addr: SocketAddr,
    direction: Direction,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    outbox: mpsc::Sender<Message>,
    queued: mpsc::Receiver<Message>,
    slot: ConnectionSlot,
}

/// Network node
#[derive(Clone)]
pub struct Node {
    config: Arc<NodeConfig>,
    node_id: Uuid,
    ledger: SharedLedger,
    directory: Arc<Mutex<PeerDirectory>>,
    connections: Arc<ConnectionRegistry>,
    storage: Storage,
    advertised_port: Arc<AtomicU16>,
}

impl Node {
    /// Open storage, restore the chain and the peer directory.
    ///
    /// Stored blocks are re-validated; a chain that fails validation is an
    /// error. An empty store gets the genesis block.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let storage = match &config.data_dir {
            Some(dir) => Storage::open(dir)?,
            None => Storage::memory()?,
        };
        let node_id = Uuid::new_v4();

        let ledger = Self::restore_ledger(&storage)?;
        log::info!(
            "Node {} ({}) starting with {} blocks",
            config.node_name,
            node_id,
            ledger.blockchain().len()
        );

        let mut directory = PeerDirectory::new(node_id, config.peer_record_limit);
        for record in storage.peers.load(config.peer_record_limit)? {
            directory.add(record);
        }

        Ok(Self {
            connections: ConnectionRegistry::new(config.active_connections),
            advertised_port: Arc::new(AtomicU16::new(config.port)),
            config: Arc::new(config),
            node_id,
            ledger: ledger.into_shared(),
            directory: Arc::new(Mutex::new(directory)),
            storage,
        })
    }

    fn restore_ledger(storage: &Storage) -> Result<Ledger> {
        let stored = storage.blocks.load_chain()?;
        if stored.is_empty() {
            let genesis = Block::genesis();
            storage.blocks.store_block(&genesis)?;
            return Ok(Ledger::with_genesis());
        }

        let mut ledger = Ledger::new(Blockchain::new());
        ledger
            .add_blocks(stored)
            .map_err(StorageError::InvalidChain)?;
        Ok(ledger)
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub(crate) fn directory(&self) -> MutexGuard<'_, PeerDirectory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn known_peers(&self, count: usize) -> Vec<PeerRecord> {
        self.directory().records(count)
    }

    /// Read-only copy of the chain
    pub async fn get_blockchain(&self) -> Blockchain {
        self.ledger.read().await.blockchain().clone()
    }

    pub async fn chain_height(&self) -> u64 {
        let ledger = self.ledger.read().await;
        ledger.blockchain().tip().map_or(0, Block::index)
    }

    /// Pending transactions, oldest first
    pub async fn get_transactions(&self, count: usize) -> Vec<Transaction> {
        self.ledger.read().await.mempool().snapshot(count)
    }

    /// Admit a local transaction and announce it.
    ///
    /// Returns `false` when it was already pending or on the chain.
    pub async fn add_new_transaction(&self, tx: Transaction) -> Result<bool> {
        let header = tx.header();
        let added = self.ledger.write().await.add_transaction(tx)?;
        if added {
            log::info!("Accepted transaction {}", header.hash);
            self.broadcast(
                Payload::Data(DataMessage::TransactionHeaders(vec![header])),
                None,
            );
        }
        Ok(added)
    }

    /// Build a block from the mempool, append, persist and announce it
    pub async fn mine_block(&self) -> Result<Block> {
        let block = {
            let mut ledger = self.ledger.write().await;
            let index = ledger.blockchain().tip().map_or(0, |tip| tip.index() + 1);
            let coinbase = self.config.mining_address.clone().map(|address| {
                Transaction::coinbase(
                    address,
                    self.config.mining_reward,
                    format!("block {index}"),
                    now(),
                )
            });
            let block = ledger.mine_block(coinbase, self.config.block_transaction_limit)?;
            self.persist_blocks(std::slice::from_ref(&block));
            block
        };

        log::info!(
            "Mined block {} ({}) with {} transactions",
            block.index(),
            block.hash(),
            block.transactions().len()
        );
        self.broadcast(Payload::Data(DataMessage::BlockHeaders(vec![block.header()])), None);
        Ok(block)
    }

    /// Write freshly appended blocks.
    ///
    /// Callers hold the ledger write guard so blocks reach storage in chain
    /// order. A failed write is logged; the stored chain is re-validated on
    /// the next start.
    pub(crate) fn persist_blocks(&self, blocks: &[Block]) {
        if let Err(e) = self.storage.blocks.store_blocks(blocks) {
            log::error!("Failed to persist {} blocks: {}", blocks.len(), e);
        }
    }

    /// Queue a message on every Active connection except `except`.
    ///
    /// Connections whose outbox is full miss the message. Returns how many
    /// connections it was queued on.
    pub fn broadcast(&self, payload: Payload, except: Option<&Uuid>) -> usize {
        let message = Message::new(self.config.network, payload);
        let mut sent = 0;
        for (peer_id, outbox) in self.connections.active_outboxes(except) {
            match outbox.try_send(message.clone()) {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Dropping {} for {}: {}", message.request_type().name(), peer_id, e),
            }
        }
        log::debug!("Broadcast {} to {} peers", message.request_type().name(), sent);
        sent
    }

    /// Bind the configured address and serve forever, dialing configured
    /// peers and starting the peer keeper first
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        self.advertised_port.store(listener.local_addr()?.port(), Ordering::Relaxed);
        self.connect_configured_peers();
        self.spawn_peer_keeper();
        self.serve(listener).await
    }

    pub async fn listen(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener`.
    ///
    /// Accept failures are logged and the loop keeps going. Sockets arriving
    /// while every slot is taken are closed immediately.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        self.advertised_port.store(local.port(), Ordering::Relaxed);
        log::info!("Node listening on {}", local);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let Some(slot) = self.connections.try_reserve(addr, Direction::Inbound) else {
                log::warn!(
                    "Rejecting {}: {} connections open",
                    addr,
                    self.connections.limit()
                );
                continue;
            };
            log::info!("New connection from {}", addr);

            let node = self.clone();
            tokio::spawn(async move {
                let peer = Peer::new(stream, addr, Direction::Inbound, node.config.network);
                match node.establish(peer, slot).await {
                    Ok(session) => node.run_session(session).await,
                    Err(e) => log::warn!("Dropped inbound connection {}: {}", addr, e),
                }
            });
        }
    }

    /// Dial `addr`, complete the handshake and start the session.
    ///
    /// Returns the remote node identifier once the connection is Active.
    pub async fn connect_to_peer(&self, addr: SocketAddr) -> Result<Uuid> {
        let slot = self
            .connections
            .try_reserve(addr, Direction::Outbound)
            .ok_or(NodeError::ConnectionLimit(self.connections.limit()))?;
        let peer = Peer::connect(addr, self.config.network, self.config.connection_timeout()).await?;
        let session = self.establish(peer, slot).await?;
        let peer_id = session.peer_id;

        let node = self.clone();
        tokio::spawn(async move { node.run_session(session).await });
        Ok(peer_id)
    }

    /// Resolve `host:port` and connect
    pub async fn connect_to(&self, endpoint: &str) -> Result<Uuid> {
        let addr = lookup_host(endpoint)
            .await?
            .next()
            .ok_or_else(|| NodeError::UnresolvedAddress(endpoint.to_string()))?;
        self.connect_to_peer(addr).await
    }

    fn connect_configured_peers(&self) {
        for endpoint in self.config.peers.clone() {
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.connect_to(&endpoint).await {
                    log::warn!("Could not connect to {}: {}", endpoint, e);
                }
            });
        }
    }

    /// Periodically persist the directory and top up outbound connections
    pub fn spawn_peer_keeper(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.peer_maintenance_interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                node.maintain_peers().await;
            }
        })
    }

    async fn maintain_peers(&self) {
        let records = self.known_peers(self.config.peer_record_limit);
        if let Err(e) = self.storage.peers.replace(&records) {
            log::error!("Failed to persist peer records: {}", e);
        }

        let free = self.config.active_connections.saturating_sub(self.connections.len());
        let mut candidates = Vec::new();
        for record in &records {
            if candidates.len() >= free {
                break;
            }
            if self.connections.is_connected(&record.node_identifier) {
                continue;
            }
            if let Some(addr) = record.resolve().await {
                candidates.push(addr);
            }
        }

        for addr in candidates {
            match self.connect_to_peer(addr).await {
                Ok(peer_id) => log::info!("Peer keeper connected to {} ({})", addr, peer_id),
                Err(e) => log::debug!("Peer keeper could not reach {}: {}", addr, e),
            }
        }
    }

    async fn handshake_message(&self, remote: SocketAddr) -> HandshakeMessage {
        HandshakeMessage {
            version: self.config.protocol_version,
            services: BigUint::from(NODE_NETWORK),
            timestamp: now(),
            node_identifier: self.node_id,
            sender_address: self.config.listen_address.clone(),
            sender_port: self.advertised_port.load(Ordering::Relaxed),
            receiver_address: remote.ip().to_string(),
            receiver_port: remote.port(),
            chain_height: self.chain_height().await,
        }
    }

    /// Run the handshake and register the connection as Active
    async fn establish(&self, mut peer: Peer, slot: ConnectionSlot) -> Result<Session> {
        let ours = self.handshake_message(peer.addr()).await;
        let (outbox, queued) = mpsc::channel(OUTBOX_CAPACITY);

        let (theirs, ()) = peer
            .handshake(&ours, self.config.connection_timeout(), |theirs| {
                slot.activate(theirs.node_identifier, outbox.clone())
            })
            .await?;

        let addr = peer.addr();
        let direction = peer.direction();
        let port = match direction {
            Direction::Outbound => addr.port(),
            Direction::Inbound => theirs.sender_port,
        };
        self.directory().add(PeerRecord {
            node_identifier: theirs.node_identifier,
            time_stamp: now(),
            supported_services: theirs.services.clone(),
            ip_address: addr.ip().to_string(),
            port,
        });
        log::info!(
            "Handshake completed with {} ({}), their height {}",
            addr,
            theirs.node_identifier,
            theirs.chain_height
        );

        let (reader, writer) = peer.into_parts();
        Ok(Session {
            peer_id: theirs.node_identifier,
            addr,
            direction,
            reader,
            writer,
            outbox,
            queued,
            slot,
        })
    }

    /// Messages sent right after the handshake
    async fn greeting(&self, direction: Direction) -> Vec<Payload> {
        let mut greeting = vec![Payload::GetAddresses];
        if direction == Direction::Outbound {
            let tip = {
                let ledger = self.ledger.read().await;
                ledger.blockchain().tip().map_or_else(Hash::zero, Block::hash)
            };
            greeting.push(Payload::GetData(GetDataMessage::blocks_after(tip)));
            greeting.push(Payload::GetData(GetDataMessage::mempool(
                count_u32(self.config.block_transaction_limit),
            )));
        }
        greeting
    }

    /// Drive an Active connection until either side fails or closes.
    ///
    /// Reading happens here; writing and message handling run in their own
    /// tasks so a slow handler never stalls the socket. Both tasks are
    /// stopped and the registry slot released before this returns.
    async fn run_session(self, session: Session) {
        let Session {
            peer_id,
            addr,
            direction,
            mut reader,
            writer,
            outbox,
            queued,
            slot,
        } = session;

        let mut writer_task = tokio::spawn(write_loop(writer, queued));
        let (dispatch, inbound) = mpsc::channel(DISPATCH_CAPACITY);
        let dispatcher = tokio::spawn(self.clone().dispatch_loop(peer_id, inbound, outbox.clone()));

        for payload in self.greeting(direction).await {
            if outbox.send(Message::new(self.config.network, payload)).await.is_err() {
                break;
            }
        }

        let network = self.config.network;
        let mut writer_finished = false;
        let outcome = loop {
            tokio::select! {
                read = read_message(&mut reader, network) => match read {
                    Ok(message) => {
                        log::trace!("{} -> {}", addr, message.request_type().name());
                        if dispatch.send(message).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(e) => break Err(e),
                },
                written = &mut writer_task => {
                    writer_finished = true;
                    break match written {
                        Ok(result) => result,
                        Err(e) => Err(ConnectionError::Io(std::io::Error::other(e))),
                    };
                }
            }
        };

        slot.begin_close();
        drop(dispatch);
        dispatcher.abort();
        let _ = dispatcher.await;
        if !writer_finished {
            writer_task.abort();
            let _ = writer_task.await;
        }
        drop(slot);

        match outcome {
            Ok(()) | Err(ConnectionError::Closed) => log::info!("Connection to {} closed", addr),
            Err(e) => log::warn!("Connection to {} closed: {}", addr, e),
        }
    }

    /// Handle inbound messages in arrival order, queueing any replies
    async fn dispatch_loop(
        self,
        peer_id: Uuid,
        mut inbound: mpsc::Receiver<Message>,
        outbox: mpsc::Sender<Message>,
    ) {
        while let Some(message) = inbound.recv().await {
            let request = message.request_type();
            match handle_message(&self, &peer_id, message).await {
                Ok(replies) => {
                    for payload in replies {
                        let reply = Message::new(self.config.network, payload);
                        if outbox.send(reply).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => log::warn!("Failed to handle {} from {}: {}", request.name(), peer_id, e),
            }
        }
    }
}

/// Write queued messages until the channel closes or the socket fails.
///
/// A message that cannot be encoded is dropped without closing the connection.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queued: mpsc::Receiver<Message>,
) -> std::result::Result<(), ConnectionError> {
    while let Some(message) = queued.recv().await {
        match write_message(&mut writer, &message).await {
            Ok(()) => {}
            Err(ConnectionError::Protocol(e)) => {
                log::error!("Dropping unencodable {}: {}", message.request_type().name(), e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
