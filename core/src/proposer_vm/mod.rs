use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use glacier_block_util::block::ProposerBlock;
use glacier_block_util::summary::StatelessSummary;

pub use self::error::StateSyncError;
pub use self::summary::{ProposerSummary, StateSummary, WrappedSummary};
use crate::storage::ProposerStorage;

mod error;
mod summary;


/// State sync part of the inner VM.
///
/// "Nothing to return" is reported as [`StateSyncError::NotFound`].
///
/// Summaries at or above the fork height are wrapped together with the
/// proposer block, so their bytes must fit into [`InnerSummaryBytes`] (1 MB).
/// Bigger ones are reported as [`StateSyncError::SummaryTooBig`].
///
/// [`InnerSummaryBytes`]: glacier_block_util::summary::InnerSummaryBytes
pub trait StateSyncableVm: Send + Sync + 'static {
    fn state_sync_enabled(&self) -> Result<bool, StateSyncError>;

    fn get_ongoing_sync_state_summary(&self) -> Result<Arc<dyn StateSummary>, StateSyncError>;

    fn get_last_state_summary(&self) -> Result<Arc<dyn StateSummary>, StateSyncError>;

    fn get_state_summary(&self, height: u64) -> Result<Arc<dyn StateSummary>, StateSyncError>;

    fn parse_state_summary(&self, data: &[u8]) -> Result<Arc<dyn StateSummary>, StateSyncError>;
}

#[derive(Clone)]
pub enum StateSyncCapability {
    Supported(Arc<dyn StateSyncableVm>),
    Unsupported,
}

impl StateSyncCapability {
    pub fn get(&self) -> Result<&Arc<dyn StateSyncableVm>, StateSyncError> {
        match self {
            Self::Supported(vm) => Ok(vm),
            Self::Unsupported => Err(StateSyncError::Unsupported),
        }
    }
}

impl<T: StateSyncableVm> From<Arc<T>> for StateSyncCapability {
    fn from(vm: Arc<T>) -> Self {
        Self::Supported(vm)
    }
}

/// Binds inner summaries to proposer blocks after the fork height.
pub struct ProposerVm {
    capability: StateSyncCapability,
    storage: Arc<dyn ProposerStorage>,
    height_index_ready: bool,
}

impl ProposerVm {
    pub fn new<C>(capability: C, storage: Arc<dyn ProposerStorage>) -> Self
    where
        C: Into<StateSyncCapability>,
    {
        Self {
            capability: capability.into(),
            storage,
            height_index_ready: true,
        }
    }

    /// State sync stays disabled until the height index is fully built.
    pub fn with_height_index_ready(mut self, ready: bool) -> Self {
        self.height_index_ready = ready;
        self
    }

    pub fn storage(&self) -> &Arc<dyn ProposerStorage> {
        &self.storage
    }

    pub fn state_sync_enabled(&self) -> Result<bool, StateSyncError> {
        let StateSyncCapability::Supported(vm) = &self.capability else {
            return Ok(false);
        };

        if !self.height_index_ready {
            tracing::debug!("height index is not ready, state sync is disabled");
            return Ok(false);
        }

        vm.state_sync_enabled()
    }

    pub fn get_ongoing_sync_state_summary(&self) -> Result<ProposerSummary, StateSyncError> {
        let inner = self.capability.get()?.get_ongoing_sync_state_summary()?;
        self.build_summary(inner)
    }

    pub fn get_last_state_summary(&self) -> Result<ProposerSummary, StateSyncError> {
        let inner = self.capability.get()?.get_last_state_summary()?;
        self.build_summary(inner)
    }

    pub fn get_state_summary(&self, height: u64) -> Result<ProposerSummary, StateSyncError> {
        let inner = self.capability.get()?.get_state_summary(height)?;
        self.build_summary(inner)
    }

    /// Parses summary bytes without touching the local storage.
    ///
    /// Bytes that are not a wrapped summary are treated as a pre-fork
    /// summary of the inner VM.
    pub fn parse_state_summary(&self, data: &Bytes) -> Result<ProposerSummary, StateSyncError> {
        let vm = self.capability.get()?;
        let len = data.len();

        let stateless = match StatelessSummary::parse(data) {
            Ok(stateless) => stateless,
            Err(e) => {
                tracing::trace!(len, "not a wrapped summary: {e:?}");
                return match vm.parse_state_summary(data) {
                    Ok(inner) => Ok(ProposerSummary::Inner(inner)),
                    Err(e @ StateSyncError::Malformed { .. }) => Err(e),
                    Err(e) => Err(StateSyncError::malformed(len, e)),
                };
            }
        };

        let block = ProposerBlock::deserialize(stateless.block().clone())
            .context("invalid proposer block in state summary")
            .map_err(|e| StateSyncError::malformed(len, e))?;

        let inner = vm
            .parse_state_summary(stateless.inner())
            .context("invalid inner state summary")
            .map_err(|e| StateSyncError::malformed(len, e))?;

        let height = inner.height();
        if block.height() != height {
            return Err(StateSyncError::malformed(
                len,
                anyhow::anyhow!(
                    "proposer block height {} does not match summary height {height}",
                    block.height(),
                ),
            ));
        }
        if stateless.fork_height() > height {
            return Err(StateSyncError::malformed(
                len,
                anyhow::anyhow!(
                    "wrapped summary at height {height} is below fork height {}",
                    stateless.fork_height(),
                ),
            ));
        }

        Ok(ProposerSummary::Wrapped(WrappedSummary::new(
            stateless,
            inner,
            block,
            self.storage.clone(),
        )))
    }

    pub fn build_summary(
        &self,
        inner: Arc<dyn StateSummary>,
    ) -> Result<ProposerSummary, StateSyncError> {
        let height = inner.height();

        let Some(fork_height) = self.storage.fork_height()? else {
            return Ok(ProposerSummary::Inner(inner));
        };
        if height < fork_height {
            return Ok(ProposerSummary::Inner(inner));
        }

        let Some(block_id) = self.storage.block_id_at_height(height)? else {
            tracing::debug!(height, fork_height, "no proposer block id at height");
            return Err(StateSyncError::MissingBlock { height });
        };
        let Some(block) = self.storage.get_block(&block_id)? else {
            tracing::warn!(height, %block_id, "proposer block is missing");
            return Err(StateSyncError::MissingBlock { height });
        };

        let stateless =
            StatelessSummary::build(fork_height, block.data().clone(), inner.bytes().clone())
                .map_err(|source| StateSyncError::SummaryTooBig { height, source })?;

        Ok(ProposerSummary::Wrapped(WrappedSummary::new(
            stateless,
            inner,
            block,
            self.storage.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use glacier_block_util::ids::BlockId;
    use glacier_block_util::summary::{InnerSummaryBytes, SummaryError};

    use super::test::TestVm;
    use super::*;
    use crate::storage::MemoryProposerStorage;

    fn make_vm(fork_height: Option<u64>) -> (Arc<TestVm>, Arc<MemoryProposerStorage>, ProposerVm) {
        let inner = TestVm::new();
        let storage = Arc::new(match fork_height {
            Some(height) => MemoryProposerStorage::with_fork_height(height),
            None => MemoryProposerStorage::new(),
        });
        let vm = ProposerVm::new(inner.clone(), storage.clone());
        (inner, storage, vm)
    }

    fn assert_same(summary: &dyn StateSummary, expected: &dyn StateSummary) {
        assert_eq!(summary.id(), expected.id());
        assert_eq!(summary.height(), expected.height());
        assert_eq!(summary.bytes(), expected.bytes());
    }

    #[test]
    fn state_sync_enabled() {
        let (inner, _, vm) = make_vm(None);
        assert!(vm.state_sync_enabled().unwrap());

        inner.set_enabled(false);
        assert!(!vm.state_sync_enabled().unwrap());
        inner.set_enabled(true);

        let vm = vm.with_height_index_ready(false);
        assert!(!vm.state_sync_enabled().unwrap());

        let vm = ProposerVm::new(
            StateSyncCapability::Unsupported,
            Arc::new(MemoryProposerStorage::new()),
        );
        assert!(!vm.state_sync_enabled().unwrap());
    }

    #[test]
    fn unsupported_inner_vm() {
        let vm = ProposerVm::new(
            StateSyncCapability::Unsupported,
            Arc::new(MemoryProposerStorage::new()),
        );

        assert!(matches!(
            vm.get_last_state_summary(),
            Err(StateSyncError::Unsupported)
        ));
        assert!(matches!(
            vm.get_ongoing_sync_state_summary(),
            Err(StateSyncError::Unsupported)
        ));
        assert!(matches!(
            vm.get_state_summary(1),
            Err(StateSyncError::Unsupported)
        ));
        assert!(matches!(
            vm.parse_state_summary(&Bytes::from_static(b"TEST")),
            Err(StateSyncError::Unsupported)
        ));
    }

    #[test]
    fn not_found_is_forwarded() {
        let (inner, storage, vm) = make_vm(None);

        assert!(vm.get_last_state_summary().unwrap_err().is_not_found());
        assert!(vm.get_ongoing_sync_state_summary().unwrap_err().is_not_found());
        assert!(vm.get_state_summary(100).unwrap_err().is_not_found());

        // Still not found after the fork.
        storage.set_fork_height(10).unwrap();
        inner.add_summary(5, b"pre-fork");
        inner.set_ongoing(Some(20));
        assert!(vm.get_ongoing_sync_state_summary().unwrap_err().is_not_found());
        assert!(vm.get_state_summary(100).unwrap_err().is_not_found());
    }

    #[test]
    fn pass_through_without_fork_height() {
        let (inner, _, vm) = make_vm(None);
        let inner_summary = inner.add_summary(100, b"state");

        let summary = vm.build_summary(inner_summary.clone()).unwrap();
        assert!(!summary.is_wrapped());
        assert_same(&summary, inner_summary.as_ref());

        let last = vm.get_last_state_summary().unwrap();
        assert_same(&last, inner_summary.as_ref());

        let parsed = vm.parse_state_summary(summary.bytes()).unwrap();
        assert!(!parsed.is_wrapped());
        assert_same(&parsed, inner_summary.as_ref());
    }

    #[test]
    fn pass_through_before_fork_height() {
        let (inner, _, vm) = make_vm(Some(50));
        let inner_summary = inner.add_summary(40, b"state");

        let summary = vm.get_state_summary(40).unwrap();
        assert!(!summary.is_wrapped());
        assert_same(&summary, inner_summary.as_ref());

        let parsed = vm.parse_state_summary(summary.bytes()).unwrap();
        assert_same(&parsed, inner_summary.as_ref());
    }

    #[test]
    fn wrapped_after_fork_height() {
        let (inner, storage, vm) = make_vm(Some(50));
        let inner_summary = inner.add_summary(60, b"state");
        let block = ProposerBlock::new_test(60, 1, b"inner block");
        storage.store_block(&block).unwrap();

        let summary = vm.get_state_summary(60).unwrap();
        let wrapped = summary.as_wrapped().unwrap();
        assert_eq!(summary.height(), 60);
        assert_eq!(wrapped.fork_height(), 50);
        assert_eq!(wrapped.block(), &block);
        assert_same(wrapped.inner_summary().as_ref(), inner_summary.as_ref());
        assert_ne!(summary.id(), inner_summary.id());

        let stateless = StatelessSummary::parse(summary.bytes()).unwrap();
        assert_eq!(stateless.block(), block.data());
        assert_eq!(stateless.inner(), inner_summary.bytes());

        // Same summary exactly at the fork height.
        inner.add_summary(50, b"state");
        storage
            .store_block(&ProposerBlock::new_test(50, 1, b"inner block"))
            .unwrap();
        assert!(vm.get_state_summary(50).unwrap().is_wrapped());
    }

    #[test]
    fn too_big_summary_after_fork_height() {
        let (inner, storage, vm) = make_vm(Some(50));
        let payload = vec![0xaa; InnerSummaryBytes::MAX_SIZE];

        // No limit before the fork
        inner.add_summary(40, &payload);
        assert!(!vm.get_state_summary(40).unwrap().is_wrapped());

        inner.add_summary(60, &payload);
        storage
            .store_block(&ProposerBlock::new_test(60, 1, b"inner block"))
            .unwrap();
        assert!(matches!(
            vm.get_state_summary(60),
            Err(StateSyncError::SummaryTooBig {
                height: 60,
                source: SummaryError::InnerTooBig(_),
            })
        ));
    }

    #[test]
    fn wrapped_roundtrip_without_local_state() {
        let (inner, storage, vm) = make_vm(Some(50));
        inner.add_summary(60, b"state");
        storage
            .store_block(&ProposerBlock::new_test(60, 1, b"inner block"))
            .unwrap();
        let summary = vm.get_last_state_summary().unwrap();

        // Fresh node with no persisted state.
        let (_, fresh_storage, fresh_vm) = make_vm(None);
        let parsed = fresh_vm.parse_state_summary(summary.bytes()).unwrap();
        assert!(parsed.is_wrapped());
        assert_eq!(parsed.height(), 60);
        assert_eq!(parsed.id(), summary.id());
        assert_eq!(parsed.bytes(), summary.bytes());
        assert_eq!(
            parsed.as_wrapped().unwrap().stateless().data(),
            summary.bytes()
        );
        assert_eq!(fresh_storage.fork_height().unwrap(), None);
    }

    #[test]
    fn missing_block_is_a_linkage_fault() {
        let (inner, storage, vm) = make_vm(Some(50));
        let inner_summary = inner.add_summary(60, b"state");

        assert!(matches!(
            vm.build_summary(inner_summary.clone()),
            Err(StateSyncError::MissingBlock { height: 60 })
        ));

        // Block at another height does not help.
        storage
            .store_block(&ProposerBlock::new_test(61, 1, b"inner block"))
            .unwrap();
        assert!(matches!(
            vm.get_state_summary(60),
            Err(StateSyncError::MissingBlock { height: 60 })
        ));
    }

    #[test]
    fn malformed_input() {
        let (inner, storage, vm) = make_vm(Some(50));

        // Neither wrapped nor legacy.
        let err = vm
            .parse_state_summary(&Bytes::from_static(b"garbage"))
            .unwrap_err();
        assert!(matches!(err, StateSyncError::Malformed { len: 7, .. }));

        // Wrapped envelope with an invalid block.
        let data = StatelessSummary::build(
            50,
            Bytes::from_static(b"not a block"),
            inner.add_summary(60, b"state").bytes().clone(),
        )
        .unwrap();
        assert!(matches!(
            vm.parse_state_summary(data.data()),
            Err(StateSyncError::Malformed { .. })
        ));

        // Wrapped envelope with an invalid inner summary.
        let block = ProposerBlock::new_test(60, 1, b"inner block");
        let data =
            StatelessSummary::build(50, block.data().clone(), Bytes::from_static(b"???")).unwrap();
        assert!(matches!(
            vm.parse_state_summary(data.data()),
            Err(StateSyncError::Malformed { .. })
        ));

        // Height mismatch between the block and the inner summary.
        let data = StatelessSummary::build(
            50,
            block.data().clone(),
            inner.add_summary(61, b"state").bytes().clone(),
        )
        .unwrap();
        assert!(matches!(
            vm.parse_state_summary(data.data()),
            Err(StateSyncError::Malformed { .. })
        ));

        // Wrapped summary below its own fork height.
        let data = StatelessSummary::build(
            70,
            block.data().clone(),
            inner.add_summary(60, b"state").bytes().clone(),
        )
        .unwrap();
        assert!(matches!(
            vm.parse_state_summary(data.data()),
            Err(StateSyncError::Malformed { .. })
        ));

        assert_eq!(storage.last_summary_height().unwrap(), None);
    }

    #[test]
    fn accept_wrapped_summary() {
        let (inner, storage, vm) = make_vm(None);
        inner.add_summary(60, b"state");
        inner.add_summary(70, b"state");

        // Summaries are minted by a node which already passed the fork.
        let (remote, remote_storage, remote_vm) = make_vm(Some(50));
        let block60 = ProposerBlock::new_test(60, 1, b"inner block");
        let block70 = ProposerBlock::new_test(70, 1, b"inner block");
        remote_storage.store_block(&block60).unwrap();
        remote_storage.store_block(&block70).unwrap();
        remote.add_summary(60, b"state");
        remote.add_summary(70, b"state");

        let bytes60 = remote_vm.get_state_summary(60).unwrap().bytes().clone();
        let bytes70 = remote_vm.get_state_summary(70).unwrap().bytes().clone();

        let summary60 = vm.parse_state_summary(&bytes60).unwrap();
        assert!(summary60.accept().unwrap());
        assert_eq!(inner.accepted(), vec![60]);
        assert_eq!(storage.fork_height().unwrap(), Some(50));
        assert_eq!(storage.block_id_at_height(60).unwrap(), Some(*block60.id()));
        assert_eq!(storage.get_block(block60.id()).unwrap(), Some(block60));

        // Height index now resolves locally.
        let local = vm.get_state_summary(60).unwrap();
        assert_eq!(local.bytes(), &bytes60);

        // Replay of the same summary is idempotent.
        assert!(summary60.accept().unwrap());
        assert_eq!(inner.accepted(), vec![60, 60]);

        let summary70 = vm.parse_state_summary(&bytes70).unwrap();
        assert!(summary70.accept().unwrap());
        assert_eq!(inner.accepted(), vec![60, 60, 70]);

        // Superseded by a fresher summary.
        assert!(!summary60.accept().unwrap());
        assert_eq!(inner.accepted(), vec![60, 60, 70]);
        assert_eq!(storage.last_summary_height().unwrap(), Some(70));
    }

    #[test]
    fn accept_conflicting_block() {
        let (inner, storage, vm) = make_vm(Some(50));
        let inner_summary = inner.add_summary(60, b"state");
        storage
            .store_block(&ProposerBlock::new_test(60, 1, b"inner block"))
            .unwrap();

        let other = ProposerBlock::new_test(60, 2, b"inner block");
        let data = StatelessSummary::build(50, other.data().clone(), inner_summary.bytes().clone())
            .unwrap();
        let summary = vm.parse_state_summary(data.data()).unwrap();

        assert!(matches!(
            summary.accept(),
            Err(StateSyncError::HeightConflict { height: 60, existing }) if existing != BlockId::ZERO
        ));
        assert!(inner.accepted().is_empty());
    }

    #[test]
    fn accept_legacy_summary() {
        let (inner, storage, vm) = make_vm(None);
        assert!(vm.get_state_summary(0).unwrap_err().is_not_found());

        inner.add_summary(40, b"state");
        let summary = vm.get_last_state_summary().unwrap();
        assert!(summary.accept().unwrap());
        assert_eq!(inner.accepted(), vec![40]);
        assert_eq!(storage.last_summary_height().unwrap(), None);

        inner.set_accept_result(false);
        assert!(!summary.accept().unwrap());
    }
}
