// Peer records on a sled tree

use sled::{Batch, Tree};

use crate::core::Serializable;
use crate::error::StorageError;
use crate::network::{AddressPayload, PeerRecord};

/// Peer records keyed by node identifier, stored in their wire form
#[derive(Debug, Clone)]
pub struct PeerStore {
    tree: Tree,
}

impl PeerStore {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    pub fn store(&self, record: &PeerRecord) -> Result<(), StorageError> {
        self.tree.insert(
            record.node_identifier.as_bytes(),
            AddressPayload::from(record).serialize(),
        )?;
        Ok(())
    }

    /// Replace the stored set with `records`
    pub fn replace(&self, records: &[PeerRecord]) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for key in self.tree.iter().keys() {
            batch.remove(key?);
        }
        for record in records {
            batch.insert(
                record.node_identifier.as_bytes().as_slice(),
                AddressPayload::from(record).serialize(),
            );
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    /// Up to `limit` records, most recently seen first
    pub fn load(&self, limit: usize) -> Result<Vec<PeerRecord>, StorageError> {
        let mut records = Vec::new();
        for entry in self.tree.iter() {
            let (_, data) = entry?;
            records.push(PeerRecord::from(AddressPayload::deserialize(&data)?));
        }
        records.sort_by(|a, b| b.time_stamp.cmp(&a.time_stamp));
        records.truncate(limit);
        Ok(records)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
