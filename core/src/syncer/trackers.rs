use std::marker::PhantomData;

use glacier_block_util::ids::ValidatorId;
use glacier_util::FastHashMap;

use crate::validators::{SampleError, ValidatorSet};

pub trait RoundRole {
    const NAME: &'static str;
}

/// Peers asked for their state summary frontier.
pub enum Seeders {}

impl RoundRole for Seeders {
    const NAME: &'static str = "seeders";
}

/// Peers asked to vote for the collected summaries.
pub enum Voters {}

impl RoundRole for Voters {
    const NAME: &'static str = "voters";
}

pub type FrontierTracker = RoundTracker<Seeders>;
pub type VoteTracker = RoundTracker<Voters>;

/// Bookkeeping of one request round.
///
/// Each peer is in at most one of the `target` and `contacted` sets.
/// The `failed` flag is orthogonal: a failed peer stays contacted until
/// it is explicitly marked as responded.
pub struct RoundTracker<R> {
    peers: FastHashMap<ValidatorId, PeerEntry>,
    sampled: ValidatorSet,
    max_outstanding: usize,
    _role: PhantomData<R>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerStage {
    /// Eligible to contact.
    Target,
    /// Removed from the target set, not yet contacted.
    Picked,
    /// Request is in flight.
    Contacted,
    Done,
}

#[derive(Debug, Clone, Copy)]
struct PeerEntry {
    stage: PeerStage,
    failed: bool,
}

impl PeerEntry {
    const DONE: Self = Self {
        stage: PeerStage::Done,
        failed: false,
    };
}

impl<R: RoundRole> RoundTracker<R> {
    pub fn new(max_outstanding: usize) -> Self {
        Self {
            peers: Default::default(),
            sampled: ValidatorSet::new(),
            max_outstanding,
            _role: PhantomData,
        }
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    /// Replaces the target set with a weighted sample of `validators`.
    ///
    /// Peers with a request in flight keep their state.
    pub fn sample(
        &mut self,
        validators: &ValidatorSet,
        sample_size: usize,
    ) -> Result<&ValidatorSet, SampleError> {
        let sampled = validators.sample(sample_size)?;

        for entry in self.peers.values_mut() {
            if entry.stage != PeerStage::Contacted {
                entry.stage = PeerStage::Done;
            }
        }
        self.store(&sampled);
        self.peers
            .retain(|_, entry| entry.stage != PeerStage::Done || entry.failed);

        tracing::debug!(
            role = R::NAME,
            sampled = sampled.len(),
            weight = sampled.total_weight(),
            "sampled peers"
        );

        self.sampled = sampled;
        Ok(&self.sampled)
    }

    /// Adds every member of `validators` to the target set.
    ///
    /// Peers with a request in flight keep their state.
    pub fn store(&mut self, validators: &ValidatorSet) {
        for id in validators.ids() {
            let entry = self.peers.entry(*id).or_insert(PeerEntry::DONE);
            if entry.stage != PeerStage::Contacted {
                entry.stage = PeerStage::Target;
            }
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Removes up to `max_outstanding` peers from the target set.
    pub fn pick_to_contact(&mut self) -> Vec<ValidatorId> {
        let mut result = Vec::new();
        for (id, entry) in &mut self.peers {
            if result.len() >= self.max_outstanding {
                break;
            }
            if entry.stage == PeerStage::Target {
                entry.stage = PeerStage::Picked;
                result.push(*id);
            }
        }
        result
    }

    pub fn mark_contacted<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a ValidatorId>,
    {
        for id in ids {
            self.peers.entry(*id).or_insert(PeerEntry::DONE).stage = PeerStage::Contacted;
        }
    }

    pub fn has_been_contacted(&self, id: &ValidatorId) -> bool {
        matches!(self.peers.get(id), Some(entry) if entry.stage == PeerStage::Contacted)
    }

    /// The only way for a peer to leave the contacted set.
    pub fn mark_responded(&mut self, id: &ValidatorId) {
        match self.peers.get_mut(id) {
            Some(entry) if entry.stage == PeerStage::Contacted => entry.stage = PeerStage::Done,
            _ => {}
        }
    }

    /// Does not remove the peer from the contacted set.
    pub fn mark_failed(&mut self, id: &ValidatorId) {
        self.peers.entry(*id).or_insert(PeerEntry::DONE).failed = true;
    }

    pub fn has_pending_responses(&self) -> bool {
        self.peers
            .values()
            .any(|entry| entry.stage == PeerStage::Contacted)
    }

    pub fn has_more_to_contact(&self) -> bool {
        self.peers
            .values()
            .any(|entry| entry.stage == PeerStage::Target)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ValidatorId> {
        self.peers
            .iter()
            .filter_map(|(id, entry)| entry.failed.then_some(id))
    }

    pub fn is_failed(&self, id: &ValidatorId) -> bool {
        matches!(self.peers.get(id), Some(entry) if entry.failed)
    }
}

impl RoundTracker<Seeders> {
    /// Validators chosen by the most recent [`sample`].
    ///
    /// [`sample`]: RoundTracker::sample
    pub fn sampled(&self) -> &ValidatorSet {
        &self.sampled
    }

    /// Total weight of the most recent sample.
    pub fn sampled_weight(&self) -> u64 {
        self.sampled.total_weight()
    }
}
