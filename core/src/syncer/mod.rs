use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use glacier_block_util::ids::{SummaryId, ValidatorId};
use glacier_util::{FastHashMap, FastHashSet};

pub use self::config::SyncerConfig;
pub use self::trackers::{FrontierTracker, RoundRole, RoundTracker, Seeders, VoteTracker, Voters};
use crate::proposer_vm::{ProposerSummary, ProposerVm, StateSummary, StateSyncError};
use crate::validators::ValidatorSet;

mod config;
pub mod trackers;


/// Requests used by the state syncer.
#[async_trait]
pub trait StateSyncNetwork: Send + Sync + 'static {
    /// Returns serialized frontier summary of the peer.
    ///
    /// Empty response means that the peer has no summary.
    async fn get_state_summary_frontier(
        &self,
        peer: &ValidatorId,
        request_id: u32,
    ) -> Result<Bytes>;

    /// Returns ids of summaries accepted by the peer at the specified heights.
    async fn get_accepted_state_summary(
        &self,
        peer: &ValidatorId,
        request_id: u32,
        heights: &[u64],
    ) -> Result<Vec<SummaryId>>;
}

#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// The summary was accepted, the node continues from its state.
    Accepted(ProposerSummary),
    /// No summary was accepted, the node falls back to bootstrapping.
    Skipped,
    /// State sync is not enabled for this VM.
    Disabled,
}

enum AttemptStatus {
    Done(SyncOutcome),
    Restart,
}

struct WeightedSummary {
    summary: ProposerSummary,
    weight: u64,
}

pub struct StateSyncer {
    config: SyncerConfig,
    vm: Arc<ProposerVm>,
    network: Arc<dyn StateSyncNetwork>,
    beacons: ValidatorSet,
    alpha: u64,

    frontier: FrontierTracker,
    votes: VoteTracker,
    summaries: FastHashMap<SummaryId, WeightedSummary>,

    request_id: u32,
    attempts: usize,
}

impl StateSyncer {
    pub fn new(
        config: SyncerConfig,
        vm: Arc<ProposerVm>,
        network: Arc<dyn StateSyncNetwork>,
        beacons: ValidatorSet,
    ) -> Result<Self> {
        anyhow::ensure!(config.sample_size > 0, "sample size must be greater than zero");
        anyhow::ensure!(
            config.max_outstanding_requests > 0,
            "max outstanding requests must be greater than zero"
        );

        let total_weight = beacons.total_weight();
        let alpha = config.compute_alpha(total_weight);
        anyhow::ensure!(
            beacons.is_empty() || (alpha > 0 && alpha <= total_weight),
            "alpha {alpha} is out of range for the total beacons weight {total_weight}"
        );

        Ok(Self {
            frontier: FrontierTracker::new(config.max_outstanding_requests),
            votes: VoteTracker::new(config.max_outstanding_requests),
            config,
            vm,
            network,
            beacons,
            alpha,
            summaries: Default::default(),
            request_id: 0,
            attempts: 0,
        })
    }

    pub fn alpha(&self) -> u64 {
        self.alpha
    }

    /// Number of started attempts.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&mut self) -> Result<SyncOutcome, StateSyncError> {
        if !self.vm.state_sync_enabled()? {
            tracing::info!("state sync is disabled");
            return Ok(SyncOutcome::Disabled);
        }

        if self.beacons.is_empty() {
            tracing::info!("no state sync beacons, skipping");
            return Ok(SyncOutcome::Skipped);
        }

        let started_at = Instant::now();
        let outcome = loop {
            self.attempts += 1;
            metrics::counter!("glacier_state_sync_attempts").increment(1);

            match self.run_attempt().await? {
                AttemptStatus::Done(outcome) => break outcome,
                AttemptStatus::Restart
                    if self.config.retry && self.attempts < self.config.max_attempts =>
                {
                    tracing::info!(attempt = self.attempts, "restarting state sync");
                }
                AttemptStatus::Restart => {
                    tracing::warn!(attempts = self.attempts, "giving up on state sync");
                    break SyncOutcome::Skipped;
                }
            }
        };

        metrics::histogram!("glacier_state_sync_time").record(started_at.elapsed());
        match &outcome {
            SyncOutcome::Accepted(summary) => tracing::info!(
                id = %summary.id(),
                height = summary.height(),
                elapsed = %humantime::format_duration(started_at.elapsed()),
                "state sync finished"
            ),
            _ => tracing::info!(attempts = self.attempts, "state sync skipped"),
        }

        Ok(outcome)
    }

    async fn run_attempt(&mut self) -> Result<AttemptStatus, StateSyncError> {
        self.start_attempt()?;

        self.frontier_round().await;

        if self.too_many_seeders_failed() {
            return Ok(AttemptStatus::Restart);
        }

        if self.summaries.is_empty() {
            tracing::info!("no state summaries received");
            return Ok(AttemptStatus::Done(SyncOutcome::Skipped));
        }

        self.vote_round().await;

        let best = self
            .summaries
            .values()
            .filter(|item| item.weight >= self.alpha)
            .max_by_key(|item| (item.summary.height(), item.summary.id()));

        let Some(best) = best else {
            let voting_weight = self.beacons.total_weight()
                - self.beacons.subset_weight(self.votes.failed());
            tracing::info!(
                voting_weight,
                alpha = self.alpha,
                summaries = self.summaries.len(),
                "no summary reached alpha"
            );

            return Ok(if voting_weight < self.alpha && self.config.retry {
                AttemptStatus::Restart
            } else {
                AttemptStatus::Done(SyncOutcome::Skipped)
            });
        };

        let summary = best.summary.clone();
        tracing::info!(
            id = %summary.id(),
            height = summary.height(),
            weight = best.weight,
            wrapped = summary.is_wrapped(),
            "accepting state summary"
        );

        if summary.accept()? {
            metrics::counter!("glacier_state_sync_accepted").increment(1);
            Ok(AttemptStatus::Done(SyncOutcome::Accepted(summary)))
        } else {
            tracing::info!(height = summary.height(), "state summary was not accepted");
            Ok(AttemptStatus::Done(SyncOutcome::Skipped))
        }
    }

    fn too_many_seeders_failed(&self) -> bool {
        let sampled_weight = self.frontier.sampled_weight();
        let total_weight = self.beacons.total_weight();
        let failed_weight = self.beacons.subset_weight(self.frontier.failed());

        let res = too_many_failed(failed_weight, sampled_weight, self.alpha, total_weight);
        if res {
            tracing::warn!(
                failed_weight,
                sampled_weight,
                total_weight,
                alpha = self.alpha,
                "too many seeders failed to respond"
            );
        }
        res
    }

    fn start_attempt(&mut self) -> Result<(), StateSyncError> {
        self.request_id = self.request_id.wrapping_add(1);
        self.frontier.clear();
        self.votes.clear();
        self.summaries.clear();

        let seeders = self
            .frontier
            .sample(&self.beacons, self.config.sample_size)
            .map_err(anyhow::Error::from)?;
        tracing::info!(
            request_id = self.request_id,
            attempt = self.attempts,
            seeders = seeders.len(),
            "started state sync attempt"
        );

        self.votes.store(&self.beacons);
        Ok(())
    }

    async fn frontier_round(&mut self) {
        let request_id = self.request_id;
        let timeout = self.config.request_timeout;

        let mut futures = FuturesUnordered::new();
        loop {
            if !self.frontier.has_pending_responses() {
                let peers = self.frontier.pick_to_contact();
                self.frontier.mark_contacted(&peers);

                for peer in peers {
                    let network = self.network.clone();
                    futures.push(async move {
                        let res = with_timeout(
                            timeout,
                            network.get_state_summary_frontier(&peer, request_id),
                        )
                        .await;
                        (peer, res)
                    });
                }
            }

            let Some((peer, res)) = futures.next().await else {
                break;
            };

            match res {
                Ok(data) => self.on_state_summary_frontier(&peer, request_id, data),
                Err(e) => {
                    tracing::debug!(%peer, request_id, "frontier request failed: {e:?}");
                    self.on_state_summary_frontier_failed(&peer, request_id);
                }
            }
        }
    }

    async fn vote_round(&mut self) {
        let request_id = self.request_id;
        let timeout = self.config.request_timeout;

        let mut heights = self
            .summaries
            .values()
            .map(|item| item.summary.height())
            .collect::<Vec<_>>();
        heights.sort_unstable();
        heights.dedup();
        let heights = Arc::<[u64]>::from(heights);

        let mut futures = FuturesUnordered::new();
        loop {
            if !self.votes.has_pending_responses() {
                let peers = self.votes.pick_to_contact();
                self.votes.mark_contacted(&peers);

                for peer in peers {
                    let network = self.network.clone();
                    let heights = heights.clone();
                    futures.push(async move {
                        let res = with_timeout(
                            timeout,
                            network.get_accepted_state_summary(&peer, request_id, &heights),
                        )
                        .await;
                        (peer, res)
                    });
                }
            }

            let Some((peer, res)) = futures.next().await else {
                break;
            };

            match res {
                Ok(ids) => self.on_accepted_state_summary(&peer, request_id, &ids),
                Err(e) => {
                    tracing::debug!(%peer, request_id, "vote request failed: {e:?}");
                    self.on_accepted_state_summary_failed(&peer, request_id);
                }
            }
        }
    }

    fn on_state_summary_frontier(&mut self, peer: &ValidatorId, request_id: u32, data: Bytes) {
        if request_id != self.request_id {
            tracing::debug!(%peer, request_id, "ignoring stale frontier response");
            return;
        }
        if !self.frontier.has_been_contacted(peer) {
            tracing::debug!(%peer, request_id, "ignoring unexpected frontier response");
            return;
        }

        self.frontier.mark_responded(peer);

        if data.is_empty() {
            return;
        }

        match self.vm.parse_state_summary(&data) {
            Ok(summary) => {
                let id = summary.id();
                tracing::debug!(%peer, %id, height = summary.height(), "received state summary frontier");
                self.summaries
                    .entry(id)
                    .or_insert(WeightedSummary { summary, weight: 0 });
            }
            Err(e) => {
                metrics::counter!("glacier_state_sync_invalid_summaries").increment(1);
                tracing::warn!(%peer, len = data.len(), "failed to parse state summary: {e:?}");
            }
        }
    }

    fn on_state_summary_frontier_failed(&mut self, peer: &ValidatorId, request_id: u32) {
        if request_id != self.request_id {
            return;
        }

        metrics::counter!("glacier_state_sync_failed_requests", "role" => Seeders::NAME)
            .increment(1);
        self.frontier.mark_failed(peer);

        // Releases the peer from the contacted set.
        self.on_state_summary_frontier(peer, request_id, Bytes::new());
    }

    fn on_accepted_state_summary(
        &mut self,
        peer: &ValidatorId,
        request_id: u32,
        summary_ids: &[SummaryId],
    ) {
        if request_id != self.request_id {
            tracing::debug!(%peer, request_id, "ignoring stale vote response");
            return;
        }
        if !self.votes.has_been_contacted(peer) {
            tracing::debug!(%peer, request_id, "ignoring unexpected vote response");
            return;
        }

        self.votes.mark_responded(peer);

        let Some(weight) = self.beacons.weight(peer) else {
            return;
        };

        let mut unique = FastHashSet::default();
        for id in summary_ids {
            if !unique.insert(*id) {
                continue;
            }
            if let Some(item) = self.summaries.get_mut(id) {
                item.weight = item.weight.saturating_add(weight);
                tracing::debug!(%peer, %id, weight = item.weight, "received vote");
            }
        }
    }

    fn on_accepted_state_summary_failed(&mut self, peer: &ValidatorId, request_id: u32) {
        if request_id != self.request_id {
            return;
        }

        metrics::counter!("glacier_state_sync_failed_requests", "role" => Voters::NAME)
            .increment(1);
        self.votes.mark_failed(peer);

        // Releases the peer from the contacted set.
        self.on_accepted_state_summary(peer, request_id, &[]);
    }
}

/// Whether the failed seeders leave less than alpha scaled to the sampled weight.
///
/// Computes `failed > sampled - sampled * alpha / total` without rounding.
fn too_many_failed(
    failed_weight: u64,
    sampled_weight: u64,
    alpha: u64,
    total_weight: u64,
) -> bool {
    if total_weight == 0 {
        return false;
    }

    let tolerated = sampled_weight as u128 * total_weight.saturating_sub(alpha) as u128;
    failed_weight as u128 * total_weight as u128 > tolerated
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => anyhow::bail!("request timed out after {}", humantime::format_duration(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::test::{TestNetwork, TestPeer};
    use super::*;
    use crate::proposer_vm::test::TestVm;
    use crate::storage::MemoryProposerStorage;
    use crate::validators::make_validator_set;

    fn make_syncer(weights: &[u64], network: Arc<TestNetwork>) -> (Arc<TestVm>, StateSyncer) {
        let inner = TestVm::new();
        let vm = ProposerVm::new(inner.clone(), Arc::new(MemoryProposerStorage::new()));

        let mut config = SyncerConfig::default();
        config.sample_size = weights.len();
        config.request_timeout = Duration::from_millis(100);

        let beacons = make_validator_set(weights);
        let syncer = StateSyncer::new(config, Arc::new(vm), network, beacons).unwrap();
        (inner, syncer)
    }

    #[test]
    fn failed_weight_threshold() {
        // Full sample: at most `total - alpha` may fail.
        assert!(!too_many_failed(49, 100, 51, 100));
        assert!(too_many_failed(50, 100, 51, 100));

        // Scaled alpha is 25.5, so 24.5 may fail.
        assert!(!too_many_failed(24, 50, 51, 100));
        assert!(too_many_failed(25, 50, 51, 100));

        // Exact scaled alpha
        assert!(!too_many_failed(1, 3, 4, 6));
        assert!(too_many_failed(2, 3, 4, 6));

        assert!(!too_many_failed(0, u64::MAX, u64::MAX, u64::MAX));
        assert!(too_many_failed(1, u64::MAX, u64::MAX, u64::MAX));
        assert!(!too_many_failed(1, 1, 1, 0));
    }

    #[test]
    fn restart_on_fractional_alpha_boundary() {
        let network = TestNetwork::new();
        let (_, mut syncer) = make_syncer(&[25; 4], network);
        syncer.config.sample_size = 2;
        assert_eq!(syncer.alpha(), 51);

        syncer.start_attempt().unwrap();
        assert_eq!(syncer.frontier.sampled_weight(), 50);

        let request_id = syncer.request_id;
        let seeders = syncer.frontier.pick_to_contact();
        assert_eq!(seeders.len(), 2);
        syncer.frontier.mark_contacted(&seeders);
        syncer.on_state_summary_frontier(&seeders[0], request_id, Bytes::new());
        assert!(!syncer.too_many_seeders_failed());

        // failed = 25 > 50 - 50 * 51 / 100 = 24.5
        syncer.on_state_summary_frontier_failed(&seeders[1], request_id);
        assert!(!syncer.frontier.has_pending_responses());
        assert!(syncer.too_many_seeders_failed());
    }

    #[test]
    fn stale_and_unexpected_responses_are_ignored() {
        let network = TestNetwork::new();
        let (inner, mut syncer) = make_syncer(&[10, 10, 10], network);
        let data = inner.add_summary(10, b"state").bytes().clone();

        syncer.start_attempt().unwrap();
        let peers = syncer.frontier.pick_to_contact();
        syncer.frontier.mark_contacted(&peers);
        let request_id = syncer.request_id;

        // Old round
        syncer.on_state_summary_frontier(&peers[0], request_id - 1, data.clone());
        assert!(syncer.frontier.has_been_contacted(&peers[0]));
        assert!(syncer.summaries.is_empty());

        // Unknown peer
        syncer.on_state_summary_frontier(&ValidatorId([42; 32]), request_id, data.clone());
        assert!(syncer.summaries.is_empty());

        syncer.on_state_summary_frontier(&peers[0], request_id, data.clone());
        assert!(!syncer.frontier.has_been_contacted(&peers[0]));
        assert_eq!(syncer.summaries.len(), 1);

        // Duplicate response
        syncer.on_state_summary_frontier_failed(&peers[0], request_id);
        assert!(syncer.frontier.has_pending_responses());

        syncer.on_state_summary_frontier_failed(&peers[1], request_id);
        assert!(!syncer.frontier.has_been_contacted(&peers[1]));
        syncer.on_state_summary_frontier(&peers[2], request_id, Bytes::new());
        assert!(!syncer.frontier.has_pending_responses());
        assert_eq!(syncer.beacons.subset_weight(syncer.frontier.failed()), 20);
    }

    #[test]
    fn votes_are_counted_once_per_voter() {
        let network = TestNetwork::new();
        let (inner, mut syncer) = make_syncer(&[10, 20, 30], network);
        let data = inner.add_summary(10, b"state").bytes().clone();

        syncer.start_attempt().unwrap();
        let request_id = syncer.request_id;
        let seeders = syncer.frontier.pick_to_contact();
        syncer.frontier.mark_contacted(&seeders);
        syncer.on_state_summary_frontier(&seeders[0], request_id, data);
        let id = *syncer.summaries.keys().next().unwrap();

        let voters = syncer.votes.pick_to_contact();
        syncer.votes.mark_contacted(&voters);
        for voter in &voters {
            syncer.on_accepted_state_summary(voter, request_id, &[id, id, SummaryId::ZERO]);
            // Second response from the same voter
            syncer.on_accepted_state_summary(voter, request_id, &[id]);
        }

        assert_eq!(syncer.summaries[&id].weight, 60);
        assert!(!syncer.votes.has_pending_responses());
    }

    #[tokio::test]
    async fn disabled_state_sync() {
        glacier_util::test::init_logger("disabled_state_sync", "debug");

        let network = TestNetwork::new();
        let (inner, mut syncer) = make_syncer(&[10], network.clone());

        inner.set_enabled(false);
        assert!(matches!(syncer.run().await.unwrap(), SyncOutcome::Disabled));
        assert_eq!(network.requests(), 0);
    }

    #[tokio::test]
    async fn batches_are_bounded() {
        glacier_util::test::init_logger("batches_are_bounded", "debug");

        let network = TestNetwork::new();
        let weights = [1; 20];
        let (inner, mut syncer) = make_syncer(&weights, network.clone());
        syncer.frontier = FrontierTracker::new(3);
        syncer.votes = VoteTracker::new(3);

        let summary = inner.add_summary(10, b"state");
        for id in syncer.beacons.ids() {
            network.add_peer(*id, TestPeer::honest(summary.as_ref()));
        }

        let outcome = syncer.run().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Accepted(s) if s.id() == summary.id()));
        assert!(network.max_in_flight() <= 3);
        assert_eq!(network.requests(), 40);
        assert_eq!(inner.accepted(), vec![10]);
    }
}
