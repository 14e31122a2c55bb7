use std::collections::BTreeMap;

use glacier_block_util::block::ProposerBlock;
use glacier_block_util::ids::BlockId;
use glacier_util::FastHashMap;
use parking_lot::RwLock;

use super::{CommitStatus, ProposerStorage, StorageError};

/// In-memory proposer storage. All writes go through a single lock.
#[derive(Default)]
pub struct MemoryProposerStorage {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    fork_height: Option<u64>,
    blocks: FastHashMap<BlockId, ProposerBlock>,
    height_index: BTreeMap<u64, BlockId>,
    last_summary_height: Option<u64>,
}

impl Inner {
    fn set_fork_height(&mut self, height: u64) -> Result<(), StorageError> {
        match self.fork_height {
            None => {
                self.fork_height = Some(height);
                Ok(())
            }
            Some(current) if current == height => Ok(()),
            Some(current) => Err(StorageError::ForkHeightConflict {
                current,
                new: height,
            }),
        }
    }

    fn check_height(&self, block: &ProposerBlock) -> Result<bool, StorageError> {
        match self.height_index.get(&block.height()) {
            None => Ok(false),
            Some(existing) if existing == block.id() => Ok(true),
            Some(existing) => Err(StorageError::HeightConflict {
                height: block.height(),
                existing: *existing,
            }),
        }
    }

    fn insert_block(&mut self, block: &ProposerBlock) {
        self.height_index.insert(block.height(), *block.id());
        self.blocks.insert(*block.id(), block.clone());
    }
}

impl MemoryProposerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fork_height(height: u64) -> Self {
        let storage = Self::default();
        storage.inner.write().fork_height = Some(height);
        storage
    }
}

impl ProposerStorage for MemoryProposerStorage {
    fn fork_height(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.inner.read().fork_height)
    }

    fn set_fork_height(&self, height: u64) -> Result<(), StorageError> {
        self.inner.write().set_fork_height(height)
    }

    fn block_id_at_height(&self, height: u64) -> Result<Option<BlockId>, StorageError> {
        Ok(self.inner.read().height_index.get(&height).copied())
    }

    fn get_block(&self, id: &BlockId) -> Result<Option<ProposerBlock>, StorageError> {
        Ok(self.inner.read().blocks.get(id).cloned())
    }

    fn store_block(&self, block: &ProposerBlock) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if !inner.check_height(block)? {
            inner.insert_block(block);
        }
        Ok(())
    }

    fn last_summary_height(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.inner.read().last_summary_height)
    }

    fn commit_summary_block(
        &self,
        fork_height: u64,
        block: &ProposerBlock,
    ) -> Result<CommitStatus, StorageError> {
        let mut inner = self.inner.write();

        let height = block.height();
        match inner.last_summary_height {
            Some(committed_height) if committed_height > height => {
                return Ok(CommitStatus::Superseded { committed_height });
            }
            Some(committed_height) if committed_height == height && inner.check_height(block)? => {
                return Ok(CommitStatus::AlreadyCommitted);
            }
            _ => {}
        }

        // Validate everything before the first write.
        let indexed = inner.check_height(block)?;
        if let Some(current) = inner.fork_height.filter(|h| *h != fork_height) {
            return Err(StorageError::ForkHeightConflict {
                current,
                new: fork_height,
            });
        }

        inner.fork_height = Some(fork_height);
        if !indexed {
            inner.insert_block(block);
        }
        inner.last_summary_height = Some(height);

        Ok(CommitStatus::Committed)
    }
}
