// Live connection set owned by the node

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::HandshakeError;
use crate::network::{ConnectionState, Direction, Message};

/// Snapshot of one connection for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub addr: SocketAddr,
    pub direction: Direction,
    pub state: ConnectionState,
    pub node_identifier: Option<Uuid>,
}

#[derive(Debug)]
struct Entry {
    info: ConnectionInfo,
    outbox: Option<mpsc::Sender<Message>>,
}

#[derive(Debug, Default)]
struct Slots {
    next_id: u64,
    entries: HashMap<u64, Entry>,
}

/// Bounded registry of open sockets.
///
/// A slot is taken before the handshake starts and released when its
/// `ConnectionSlot` is dropped, whichever way the connection ends.
#[derive(Debug)]
pub struct ConnectionRegistry {
    limit: usize,
    slots: Mutex<Slots>,
}

impl ConnectionRegistry {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            slots: Mutex::new(Slots::default()),
        })
    }

    // A panic while holding the lock cannot leave `Slots` half-updated.
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a slot for a new socket, or `None` when the limit is reached
    pub fn try_reserve(self: &Arc<Self>, addr: SocketAddr, direction: Direction) -> Option<ConnectionSlot> {
        let mut slots = self.lock();
        if slots.entries.len() >= self.limit {
            return None;
        }
        let id = slots.next_id;
        slots.next_id += 1;
        slots.entries.insert(
            id,
            Entry {
                info: ConnectionInfo {
                    addr,
                    direction,
                    state: ConnectionState::AwaitingHandshake,
                    node_identifier: None,
                },
                outbox: None,
            },
        );
        Some(ConnectionSlot {
            id,
            registry: Arc::clone(self),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Open sockets, including those still handshaking
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.info.state == ConnectionState::Active)
            .count()
    }

    pub fn is_connected(&self, node_identifier: &Uuid) -> bool {
        self.lock()
            .entries
            .values()
            .any(|entry| entry.info.node_identifier.as_ref() == Some(node_identifier))
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.lock().entries.values().map(|entry| entry.info.clone()).collect()
    }

    /// Outboxes of every Active connection except `except`
    pub fn active_outboxes(&self, except: Option<&Uuid>) -> Vec<(Uuid, mpsc::Sender<Message>)> {
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.info.state == ConnectionState::Active)
            .filter_map(|entry| {
                let id = entry.info.node_identifier?;
                if except == Some(&id) {
                    return None;
                }
                Some((id, entry.outbox.clone()?))
            })
            .collect()
    }
}

/// Ownership of one registry slot
#[derive(Debug)]
pub struct ConnectionSlot {
    id: u64,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionSlot {
    /// Mark the connection Active for `node_identifier`.
    ///
    /// Fails if another connection already belongs to that node.
    pub fn activate(
        &self,
        node_identifier: Uuid,
        outbox: mpsc::Sender<Message>,
    ) -> Result<(), HandshakeError> {
        let mut slots = self.registry.lock();
        let duplicate = slots.entries.iter().any(|(id, entry)| {
            *id != self.id && entry.info.node_identifier == Some(node_identifier)
        });
        if duplicate {
            return Err(HandshakeError::AlreadyConnected(node_identifier));
        }
        if let Some(entry) = slots.entries.get_mut(&self.id) {
            entry.info.node_identifier = Some(node_identifier);
            entry.info.state = ConnectionState::Active;
            entry.outbox = Some(outbox);
        }
        Ok(())
    }

    /// Stop routing messages to this connection while it shuts down
    pub fn begin_close(&self) {
        let mut slots = self.registry.lock();
        if let Some(entry) = slots.entries.get_mut(&self.id) {
            entry.info.state = ConnectionState::Closing;
            entry.outbox = None;
        }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.registry.lock().entries.remove(&self.id);
    }
}
