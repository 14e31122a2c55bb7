use glacier_block_util::ids::BlockId;
use glacier_block_util::summary::SummaryError;

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum StateSyncError {
    #[error("state summary not found")]
    NotFound,
    #[error("malformed state summary of {len} bytes")]
    Malformed {
        len: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("no proposer block found at height {height}")]
    MissingBlock { height: u64 },
    #[error("state summary at height {height} cannot be wrapped")]
    SummaryTooBig {
        height: u64,
        #[source]
        source: SummaryError,
    },
    #[error("state sync is not implemented by the inner vm")]
    Unsupported,
    #[error("fork height is already set to {current}, got {new}")]
    ForkHeightConflict { current: u64, new: u64 },
    #[error("block {existing} is already committed at height {height}")]
    HeightConflict { height: u64, existing: BlockId },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StateSyncError {
    pub fn malformed<E>(len: usize, source: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Malformed {
            len,
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<StorageError> for StateSyncError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::ForkHeightConflict { current, new } => {
                Self::ForkHeightConflict { current, new }
            }
            StorageError::HeightConflict { height, existing } => {
                Self::HeightConflict { height, existing }
            }
            StorageError::Internal(e) => Self::Internal(e),
        }
    }
}
