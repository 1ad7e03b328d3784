//! The Reimint engine: one constructor wiring the state machine, timeout
//! ticker, gossip reactor, evidence pool and validator-set cache together.
//!
//! Chain id and the minimum voting power are plumbed through here; nothing
//! in the core reads process-wide state.

use std::path::Path;
use std::sync::Arc;

use alloy_consensus::Header;
use alloy_primitives::B256;
use color_eyre::eyre;
use reimint_types::{Evidence, ValidatorSet, WireError};

use crate::config::ConsensusConfig;
use crate::evidence_pool::EvidencePool;
use crate::pipeline::BlockPipeline;
use crate::reactor::{PeerTransport, Reactor};
use crate::state_machine::{StateMachine, StateMachineHandle};
use crate::validator_cache::ValidatorSetCache;
use crate::PeerId;

pub struct ReimintEngine {
    chain_id: u64,
    min_voting_power: u64,
    handle: StateMachineHandle,
    reactor: Reactor,
    evidence: EvidencePool,
    validator_sets: ValidatorSetCache,
}

impl ReimintEngine {
    /// Start the engine for the height following `head_header`. The evidence
    /// store is opened under `data_dir`.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        chain_id: u64,
        min_voting_power: u64,
        config: ConsensusConfig,
        pipeline: Arc<dyn BlockPipeline>,
        transport: Arc<dyn PeerTransport>,
        data_dir: impl AsRef<Path>,
        head_header: &Header,
        validators: ValidatorSet,
    ) -> eyre::Result<Self> {
        let evidence = EvidencePool::open(
            data_dir.as_ref().join("evidence.redb"),
            config.evidence_max_age_num_blocks,
        )
        .await?;
        let validator_sets =
            ValidatorSetCache::new(Arc::clone(&pipeline), config.validator_set_cache_size);

        let validators = filter_by_min_power(validators, min_voting_power)?;
        let machine = StateMachine::new(
            chain_id,
            config,
            pipeline,
            evidence.clone(),
            head_header,
            validators,
        );
        let events = machine.subscribe();
        let handle = machine.start();
        let reactor = Reactor::spawn(handle.queue(), events, transport);

        Ok(Self {
            chain_id,
            min_voting_power,
            handle,
            reactor,
            evidence,
            validator_sets,
        })
    }

    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn handle(&self) -> &StateMachineHandle {
        &self.handle
    }

    pub fn evidence_pool(&self) -> &EvidencePool {
        &self.evidence
    }

    /// Block `header` was persisted; start the next height with the staking
    /// contract's validator set for the new state root.
    pub fn new_block_header(&self, header: Header, validators: ValidatorSet) -> eyre::Result<()> {
        let validators = filter_by_min_power(validators, self.min_voting_power)?;
        self.handle.new_block_header(header, validators);
        Ok(())
    }

    /// Decode and dispatch a raw wire frame from `peer`.
    pub fn handle_peer_message(&self, peer: &PeerId, bytes: &[u8]) -> Result<(), WireError> {
        self.reactor.handle_message(peer, bytes)
    }

    pub fn add_peer(&self, peer: PeerId) {
        self.reactor.add_peer(peer);
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        self.reactor.remove_peer(peer);
    }

    pub fn peer_count(&self) -> usize {
        self.reactor.peer_count()
    }

    /// Validator set at `state_root`, served from the bounded cache.
    pub async fn validator_set_at(&self, state_root: B256) -> eyre::Result<Arc<ValidatorSet>> {
        self.validator_sets.get(state_root).await
    }

    /// Verify gossiped evidence against the validator set at `state_root`
    /// and persist it. Returns `false` for already-known evidence.
    pub async fn add_evidence(&self, evidence: Evidence, state_root: B256) -> eyre::Result<bool> {
        let validators = self.validator_sets.get(state_root).await?;
        Ok(self.evidence.add_evidence(evidence, &validators).await?)
    }

    /// Stop gossip, close the input queue and wait for the loop to drain.
    pub async fn abort(self) {
        self.reactor.stop();
        self.handle.abort().await;
    }
}

fn filter_by_min_power(validators: ValidatorSet, min: u64) -> eyre::Result<ValidatorSet> {
    if min == 0 {
        return Ok(validators);
    }
    ValidatorSet::new(
        validators
            .validators()
            .filter(|v| v.voting_power >= min)
            .cloned(),
    )
    .map_err(Into::into)
}
