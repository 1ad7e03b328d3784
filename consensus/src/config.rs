//! Consensus engine configuration.
//!
//! Everything here is plumbed through the engine constructor; nothing reads
//! process-wide state. Durations deserialize from humantime strings
//! (`"3s"`, `"500ms"`).

use core::time::Duration;

use reimint_types::Round;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsensusConfig {
    /// Base wait for the proposer's proposal at round 0.
    #[serde(with = "humantime_serde")]
    pub propose_timeout: Duration,

    /// Per-round linear growth of the propose timeout.
    #[serde(with = "humantime_serde")]
    pub propose_timeout_delta: Duration,

    /// Base wait after seeing 2/3+ of conflicting prevotes.
    #[serde(with = "humantime_serde")]
    pub prevote_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub prevote_timeout_delta: Duration,

    /// Base wait after seeing 2/3+ of conflicting precommits.
    #[serde(with = "humantime_serde")]
    pub precommit_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub precommit_timeout_delta: Duration,

    /// Pause between committing a block and starting the next height.
    #[serde(with = "humantime_serde")]
    pub commit_timeout: Duration,

    /// When non-zero and the transaction pool is empty, wait this long at
    /// round 0 before proposing an empty block.
    #[serde(with = "humantime_serde")]
    pub create_empty_blocks_interval: Duration,

    /// Enter the next height as soon as a block is committed instead of
    /// waiting out the commit timeout.
    pub skip_timeout_commit: bool,

    /// Bound of the state-machine input queue; overflow drops the oldest
    /// event with a warning.
    pub message_queue_size: usize,

    /// Pacing of the per-peer gossip retries.
    #[serde(with = "humantime_serde")]
    pub peer_gossip_sleep: Duration,

    /// Evidence older than this many blocks is pruned and refused.
    pub evidence_max_age_num_blocks: u64,

    /// Byte budget for evidence included in a single block.
    pub evidence_max_bytes: usize,

    /// Capacity of the validator-set-by-state-root cache.
    pub validator_set_cache_size: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            propose_timeout: Duration::from_millis(3000),
            propose_timeout_delta: Duration::from_millis(500),
            prevote_timeout: Duration::from_millis(3000),
            prevote_timeout_delta: Duration::from_millis(500),
            precommit_timeout: Duration::from_millis(3000),
            precommit_timeout_delta: Duration::from_millis(500),
            commit_timeout: Duration::from_millis(1000),
            create_empty_blocks_interval: Duration::ZERO,
            skip_timeout_commit: false,
            message_queue_size: 10,
            peer_gossip_sleep: Duration::from_millis(100),
            evidence_max_age_num_blocks: 10_000,
            evidence_max_bytes: 1024 * 1024,
            validator_set_cache_size: 120,
        }
    }
}

impl ConsensusConfig {
    pub fn propose(&self, round: Round) -> Duration {
        self.propose_timeout + self.propose_timeout_delta * round
    }

    pub fn prevote_wait(&self, round: Round) -> Duration {
        self.prevote_timeout + self.prevote_timeout_delta * round
    }

    pub fn precommit_wait(&self, round: Round) -> Duration {
        self.precommit_timeout + self.precommit_timeout_delta * round
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_recommended_timeouts() {
        let config = ConsensusConfig::default();
        assert_eq!(config.propose(0), Duration::from_millis(3000));
        assert_eq!(config.propose(4), Duration::from_millis(5000));
        assert_eq!(config.prevote_wait(1), Duration::from_millis(3500));
        assert_eq!(config.precommit_wait(2), Duration::from_millis(4000));
        assert_eq!(config.commit_timeout, Duration::from_millis(1000));
        assert!(!config.skip_timeout_commit);
        assert_eq!(config.message_queue_size, 10);
    }

    #[test]
    fn deserializes_humantime_durations() {
        let config: ConsensusConfig = toml::from_str(
            r#"
            propose_timeout = "2s"
            propose_timeout_delta = "250ms"
            skip_timeout_commit = true
            "#,
        )
        .unwrap();

        assert_eq!(config.propose_timeout, Duration::from_secs(2));
        assert_eq!(config.propose_timeout_delta, Duration::from_millis(250));
        assert!(config.skip_timeout_commit);
        // Unset fields keep their defaults.
        assert_eq!(config.commit_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<ConsensusConfig>("no_such_field = 1").is_err());
    }
}
