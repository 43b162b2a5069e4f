// Persistent storage for blocks and peer records

mod blockchain_db;
mod peer_store;

pub use blockchain_db::BlockchainDB;
pub use peer_store::PeerStore;

use std::path::Path;

use sled::Db;

use crate::error::StorageError;

/// One sled database holding a `blocks` tree and a `peers` tree
#[derive(Debug, Clone)]
pub struct Storage {
    db: Db,
    pub blocks: BlockchainDB,
    pub peers: PeerStore,
}

impl Storage {
    /// Open (or create) the database under `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref())?;
        log::debug!("Opened storage at {}", path.as_ref().display());
        Self::from_db(db)
    }

    /// Temporary database, removed when dropped
    pub fn memory() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            blocks: BlockchainDB::new(db.open_tree("blocks")?),
            peers: PeerStore::new(db.open_tree("peers")?),
            db,
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
