// Block store on a sled tree

use sled::{Batch, Tree};

use crate::core::{Block, Hash, Serializable};
use crate::error::{ProtocolError, StorageError};

const TIP_KEY: &[u8] = b"tip";

/// Accepted blocks, keyed by index with a hash -> index lookup.
///
/// Keys: `b` + index (big-endian) -> serialized block, `h` + hash -> index,
/// `tip` -> index of the last stored block.
#[derive(Debug, Clone)]
pub struct BlockchainDB {
    tree: Tree,
}

impl BlockchainDB {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    /// Store a block and raise the tip to it.
    ///
    /// The tip never moves backwards, so blocks stored out of order still
    /// leave it at the highest index.
    pub fn store_block(&self, block: &Block) -> Result<(), StorageError> {
        let index = block.index();
        let mut batch = Batch::default();
        batch.insert(Self::block_key(index), block.serialize());
        batch.insert(Self::hash_key(&block.hash()), index.to_be_bytes().as_slice());
        self.tree.apply_batch(batch)?;

        self.tree.fetch_and_update(TIP_KEY, |stored| {
            let tip = stored
                .and_then(|data| <[u8; 8]>::try_from(data).ok())
                .map(u64::from_be_bytes)
                .map_or(index, |tip| tip.max(index));
            Some(tip.to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    pub fn store_blocks<'a>(&self, blocks: impl IntoIterator<Item = &'a Block>) -> Result<(), StorageError> {
        for block in blocks {
            self.store_block(block)?;
        }
        Ok(())
    }

    pub fn get_block(&self, index: u64) -> Result<Option<Block>, StorageError> {
        match self.tree.get(Self::block_key(index))? {
            Some(data) => Ok(Some(Block::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
        match self.tree.get(Self::hash_key(hash))? {
            Some(data) => self.get_block(Self::decode_index(&data)?),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &Hash) -> Result<bool, StorageError> {
        Ok(self.tree.contains_key(Self::hash_key(hash))?)
    }

    /// Index of the last stored block
    pub fn tip_index(&self) -> Result<Option<u64>, StorageError> {
        match self.tree.get(TIP_KEY)? {
            Some(data) => Ok(Some(Self::decode_index(&data)?)),
            None => Ok(None),
        }
    }

    /// Every stored block in index order, up to the tip
    pub fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        let Some(tip) = self.tip_index()? else {
            return Ok(Vec::new());
        };
        let mut blocks = Vec::new();
        for entry in self.tree.scan_prefix(b"b") {
            let (_, data) = entry?;
            let block = Block::deserialize(&data)?;
            if block.index() > tip {
                break;
            }
            blocks.push(block);
        }
        Ok(blocks)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.tree.flush()?;
        Ok(())
    }

    fn block_key(index: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(9);
        key.push(b'b');
        key.extend_from_slice(&index.to_be_bytes());
        key
    }

    fn hash_key(hash: &Hash) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + hash.as_bytes().len());
        key.push(b'h');
        key.extend_from_slice(hash.as_bytes());
        key
    }

    fn decode_index(data: &[u8]) -> Result<u64, StorageError> {
        let bytes: [u8; 8] = data.try_into().map_err(|_| {
            ProtocolError::InvalidMessage(format!("stored index has {} bytes", data.len()))
        })?;
        Ok(u64::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> BlockchainDB {
        let db = sled::Config::new().temporary(true).open().unwrap();
        BlockchainDB::new(db.open_tree("blocks").unwrap())
    }

    fn chain(length: usize) -> Vec<Block> {
        let mut blocks = vec![Block::genesis()];
        while blocks.len() < length {
            let next = Block::create(blocks.last(), vec![]);
            blocks.push(next);
        }
        blocks
    }

    #[test]
    fn test_store_and_get_block() {
        let db = db();
        let block = Block::genesis();
        db.store_block(&block).unwrap();

        assert_eq!(db.get_block(0).unwrap(), Some(block.clone()));
        assert_eq!(db.get_block_by_hash(&block.hash()).unwrap(), Some(block.clone()));
        assert!(db.has_block(&block.hash()).unwrap());
        assert!(db.get_block(1).unwrap().is_none());
    }

    #[test]
    fn test_load_chain_in_index_order() {
        let db = db();
        assert!(db.load_chain().unwrap().is_empty());

        let blocks = chain(300);
        db.store_blocks(&blocks).unwrap();

        assert_eq!(db.tip_index().unwrap(), Some(299));
        assert_eq!(db.load_chain().unwrap(), blocks);
    }

    #[test]
    fn test_tip_only_moves_forward() {
        let db = db();
        let blocks = chain(4);
        db.store_blocks([&blocks[0], &blocks[1], &blocks[3], &blocks[2]]).unwrap();

        assert_eq!(db.tip_index().unwrap(), Some(3));
        assert_eq!(db.load_chain().unwrap(), blocks);

        db.store_block(&blocks[1]).unwrap();
        assert_eq!(db.tip_index().unwrap(), Some(3));
    }

    #[test]
    fn test_corrupt_record_reported() {
        let db = db();
        db.store_block(&Block::genesis()).unwrap();
        db.tree.insert(BlockchainDB::block_key(0), &b"garbage"[..]).unwrap();

        assert!(matches!(db.load_chain(), Err(StorageError::Decode(_))));
    }
}
