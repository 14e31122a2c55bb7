use glacier_block_util::block::ProposerBlock;
use glacier_block_util::ids::BlockId;

pub use self::memory::MemoryProposerStorage;

mod memory;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("fork height is already set to {current}, got {new}")]
    ForkHeightConflict { current: u64, new: u64 },
    #[error("block {existing} is already indexed at height {height}")]
    HeightConflict { height: u64, existing: BlockId },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Result of [`ProposerStorage::commit_summary_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// The block and its height linkage were stored.
    Committed,
    /// The same block was already committed for this height.
    AlreadyCommitted,
    /// A summary at a greater height was committed earlier.
    Superseded { committed_height: u64 },
}

/// Persisted state of the proposer VM.
pub trait ProposerStorage: Send + Sync + 'static {
    /// Returns `None` until the fork height is observed.
    fn fork_height(&self) -> Result<Option<u64>, StorageError>;

    /// Set-once. Storing the same value again is a no-op.
    fn set_fork_height(&self, height: u64) -> Result<(), StorageError>;

    fn block_id_at_height(&self, height: u64) -> Result<Option<BlockId>, StorageError>;

    fn get_block(&self, id: &BlockId) -> Result<Option<ProposerBlock>, StorageError>;

    /// Stores an accepted block and indexes it by height.
    fn store_block(&self, block: &ProposerBlock) -> Result<(), StorageError>;

    /// Height of the latest committed state summary.
    fn last_summary_height(&self) -> Result<Option<u64>, StorageError>;

    /// Atomically records the fork height, the block, its height linkage
    /// and the committed summary height.
    ///
    /// Repeating the call for the same block is idempotent.
    fn commit_summary_block(
        &self,
        fork_height: u64,
        block: &ProposerBlock,
    ) -> Result<CommitStatus, StorageError>;
}
