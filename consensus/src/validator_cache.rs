//! Bounded cache of validator sets keyed by state root.
//!
//! The staking reader is deterministic per state root, so older sets needed
//! for evidence and commit verification are cached behind a single-flight
//! loader: concurrent requests for the same root share one pipeline call.

use std::sync::Arc;

use alloy_primitives::B256;
use color_eyre::eyre;
use moka::future::Cache;
use reimint_types::ValidatorSet;
use tracing::error;

use crate::pipeline::BlockPipeline;

#[derive(Clone)]
pub struct ValidatorSetCache {
    cache: Cache<B256, Arc<ValidatorSet>>,
    pipeline: Arc<dyn BlockPipeline>,
}

impl ValidatorSetCache {
    pub fn new(pipeline: Arc<dyn BlockPipeline>, capacity: u64) -> Self {
        Self {
            cache: Cache::new(capacity),
            pipeline,
        }
    }

    /// The validator set at `state_root`, fetched through the pipeline on a
    /// miss. Errors are not cached; a later call retries.
    pub async fn get(&self, state_root: B256) -> eyre::Result<Arc<ValidatorSet>> {
        let pipeline = Arc::clone(&self.pipeline);
        self.cache
            .try_get_with(state_root, async move {
                match pipeline.get_validator_set(state_root).await {
                    Ok(set) => Ok(Arc::new(set)),
                    Err(e) => {
                        error!(%state_root, error = %e, "failed to fetch validator set");
                        Err(e)
                    }
                }
            })
            .await
            .map_err(|e: Arc<eyre::Report>| eyre::eyre!("{e}"))
    }

    /// Seed the cache with a set obtained elsewhere (e.g. handed to
    /// `new_block_header` by the block pipeline).
    pub async fn insert(&self, state_root: B256, validators: Arc<ValidatorSet>) {
        self.cache.insert(state_root, validators).await;
    }
}
