use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use glacier_util::serde_helpers;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct SyncerConfig {
    /// The number of beacons asked for their state summary frontier.
    ///
    /// Default: 20.
    pub sample_size: usize,

    /// Stake weight required for a summary to be accepted.
    ///
    /// Default: more than half of the total beacons weight.
    pub alpha: Option<u64>,

    /// The maximum number of requests sent in one batch.
    ///
    /// Default: 50.
    pub max_outstanding_requests: usize,

    /// Timeout of a single peer request.
    ///
    /// Default: 10 seconds.
    #[serde(with = "serde_helpers::humantime")]
    pub request_timeout: Duration,

    /// Whether to restart the attempt when not enough stake responded.
    ///
    /// Default: true.
    pub retry: bool,

    /// The maximum number of attempts before falling back to bootstrapping.
    ///
    /// Default: 5.
    pub max_attempts: usize,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            sample_size: 20,
            alpha: None,
            max_outstanding_requests: 50,
            request_timeout: Duration::from_secs(10),
            retry: true,
            max_attempts: 5,
        }
    }
}

impl SyncerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        serde_helpers::load_json_from_file(path)
            .with_context(|| format!("failed to load syncer config from {}", path.display()))
    }

    pub fn compute_alpha(&self, total_weight: u64) -> u64 {
        self.alpha.unwrap_or(total_weight / 2 + 1)
    }
}
