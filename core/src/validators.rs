use std::collections::BTreeMap;

use glacier_block_util::ids::ValidatorId;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidatorSetError {
    #[error("validator {0} has zero weight")]
    ZeroWeight(ValidatorId),
    #[error("total validator weight overflow")]
    WeightOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SampleError {
    #[error("cannot sample from an empty validator set")]
    EmptyValidatorSet,
}

/// Stake-weighted validator set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    weights: BTreeMap<ValidatorId, u64>,
    total_weight: u64,
}

impl ValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_weights<I>(weights: I) -> Result<Self, ValidatorSetError>
    where
        I: IntoIterator<Item = (ValidatorId, u64)>,
    {
        let mut set = Self::new();
        for (id, weight) in weights {
            set.insert(id, weight)?;
        }
        Ok(set)
    }

    /// Inserts or updates the validator weight.
    ///
    /// Returns the previous weight if the validator was already present.
    pub fn insert(&mut self, id: ValidatorId, weight: u64) -> Result<Option<u64>, ValidatorSetError> {
        if weight == 0 {
            return Err(ValidatorSetError::ZeroWeight(id));
        }

        let prev = self.weights.get(&id).copied().unwrap_or_default();
        self.total_weight = (self.total_weight - prev)
            .checked_add(weight)
            .ok_or(ValidatorSetError::WeightOverflow)?;

        Ok(self.weights.insert(id, weight))
    }

    pub fn remove(&mut self, id: &ValidatorId) -> Option<u64> {
        let weight = self.weights.remove(id)?;
        self.total_weight -= weight;
        Some(weight)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: &ValidatorId) -> bool {
        self.weights.contains_key(id)
    }

    #[inline]
    pub fn weight(&self, id: &ValidatorId) -> Option<u64> {
        self.weights.get(id).copied()
    }

    #[inline]
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Total weight of the listed validators. Unknown ids are ignored.
    pub fn subset_weight<'a, I>(&self, ids: I) -> u64
    where
        I: IntoIterator<Item = &'a ValidatorId>,
    {
        ids.into_iter()
            .filter_map(|id| self.weights.get(id))
            .sum()
    }

    pub fn ids(&self) -> impl ExactSizeIterator<Item = &ValidatorId> + Clone {
        self.weights.keys()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&ValidatorId, u64)> + Clone {
        self.weights.iter().map(|(id, weight)| (id, *weight))
    }

    /// Weighted sampling without replacement.
    ///
    /// Returns `min(size, self.len())` distinct validators.
    pub fn sample(&self, size: usize) -> Result<ValidatorSet, SampleError> {
        self.sample_with_rng(size, &mut rand::rng())
    }

    pub fn sample_with_rng<R: Rng + ?Sized>(
        &self,
        size: usize,
        rng: &mut R,
    ) -> Result<ValidatorSet, SampleError> {
        if self.total_weight == 0 {
            return Err(SampleError::EmptyValidatorSet);
        }

        let size = size.min(self.weights.len());

        let mut candidates = self.iter().map(|(id, w)| (*id, w)).collect::<Vec<_>>();
        let mut cumulative = Vec::with_capacity(candidates.len());

        let mut result = ValidatorSet::new();
        for _ in 0..size {
            cumulative.clear();
            let mut total_weight = 0u64;
            for (_, weight) in &candidates {
                total_weight += weight;
                cumulative.push(total_weight);
            }

            let chosen_weight = rng.random_range(0..total_weight);

            // Find the first item which has a weight higher than the chosen weight.
            let i = cumulative.partition_point(|w| *w <= chosen_weight);

            let (id, weight) = candidates.swap_remove(i);
            result.weights.insert(id, weight);
            result.total_weight += weight;
        }

        Ok(result)
    }
}

#[cfg(test)]
pub(crate) fn make_validator_set(weights: &[u64]) -> ValidatorSet {
    ValidatorSet::from_weights(
        weights
            .iter()
            .enumerate()
            .map(|(i, weight)| (ValidatorId([i as u8 + 1; 32]), *weight)),
    )
    .unwrap()
}
