use std::sync::Arc;

use bytes::Bytes;
use glacier_block_util::block::ProposerBlock;
use glacier_block_util::ids::SummaryId;
use glacier_block_util::summary::StatelessSummary;

use super::StateSyncError;
use crate::storage::{CommitStatus, ProposerStorage};

/// Checkpoint of the VM state at some height.
pub trait StateSummary: Send + Sync + 'static {
    fn id(&self) -> SummaryId;

    fn height(&self) -> u64;

    fn bytes(&self) -> &Bytes;

    /// Returns `false` if a fresher state has already superseded this summary.
    fn accept(&self) -> Result<bool, StateSyncError>;
}

/// Summary produced or parsed by the proposer VM.
#[derive(Clone)]
pub enum ProposerSummary {
    /// Pre-fork summary of the inner VM, passed through as is.
    Inner(Arc<dyn StateSummary>),
    /// Inner summary bound to the proposer block at the same height.
    Wrapped(WrappedSummary),
}

impl ProposerSummary {
    pub fn is_wrapped(&self) -> bool {
        matches!(self, Self::Wrapped(_))
    }

    pub fn as_wrapped(&self) -> Option<&WrappedSummary> {
        match self {
            Self::Inner(_) => None,
            Self::Wrapped(summary) => Some(summary),
        }
    }

    /// Summary of the inner VM.
    pub fn inner_summary(&self) -> &Arc<dyn StateSummary> {
        match self {
            Self::Inner(summary) => summary,
            Self::Wrapped(summary) => summary.inner_summary(),
        }
    }
}

impl StateSummary for ProposerSummary {
    fn id(&self) -> SummaryId {
        match self {
            Self::Inner(summary) => summary.id(),
            Self::Wrapped(summary) => *summary.stateless().id(),
        }
    }

    fn height(&self) -> u64 {
        match self {
            Self::Inner(summary) => summary.height(),
            Self::Wrapped(summary) => summary.height(),
        }
    }

    fn bytes(&self) -> &Bytes {
        match self {
            Self::Inner(summary) => summary.bytes(),
            Self::Wrapped(summary) => summary.stateless().data(),
        }
    }

    fn accept(&self) -> Result<bool, StateSyncError> {
        match self {
            Self::Inner(summary) => summary.accept(),
            Self::Wrapped(summary) => summary.accept(),
        }
    }
}

impl std::fmt::Debug for ProposerSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProposerSummary")
            .field("wrapped", &self.is_wrapped())
            .field("id", &self.id())
            .field("height", &self.height())
            .finish()
    }
}

#[derive(Clone)]
pub struct WrappedSummary {
    inner: Arc<Inner>,
}

impl WrappedSummary {
    pub(super) fn new(
        stateless: StatelessSummary,
        summary: Arc<dyn StateSummary>,
        block: ProposerBlock,
        storage: Arc<dyn ProposerStorage>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                stateless,
                summary,
                block,
                storage,
            }),
        }
    }

    #[inline]
    pub fn height(&self) -> u64 {
        self.inner.summary.height()
    }

    #[inline]
    pub fn fork_height(&self) -> u64 {
        self.inner.stateless.fork_height()
    }

    pub fn stateless(&self) -> &StatelessSummary {
        &self.inner.stateless
    }

    pub fn inner_summary(&self) -> &Arc<dyn StateSummary> {
        &self.inner.summary
    }

    pub fn block(&self) -> &ProposerBlock {
        &self.inner.block
    }

    /// Commits the proposer block first, then accepts the inner summary.
    ///
    /// Both steps are safe to replay: a repeated call finds the block
    /// already committed and accepts the inner summary again.
    pub fn accept(&self) -> Result<bool, StateSyncError> {
        let height = self.height();
        let block = &self.inner.block;

        match self
            .inner
            .storage
            .commit_summary_block(self.fork_height(), block)?
        {
            CommitStatus::Committed => {
                tracing::info!(
                    height,
                    fork_height = self.fork_height(),
                    block_id = %block.id(),
                    "committed state summary block"
                );
            }
            CommitStatus::AlreadyCommitted => {
                tracing::debug!(height, block_id = %block.id(), "state summary block already committed");
            }
            CommitStatus::Superseded { committed_height } => {
                tracing::info!(
                    height,
                    committed_height,
                    "state summary is superseded by a fresher one"
                );
                return Ok(false);
            }
        }

        self.inner.summary.accept()
    }
}

struct Inner {
    stateless: StatelessSummary,
    summary: Arc<dyn StateSummary>,
    block: ProposerBlock,
    storage: Arc<dyn ProposerStorage>,
}
