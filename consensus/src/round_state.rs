//! Transient per-height consensus state.

use std::sync::Arc;

use alloy_primitives::B256;
use reimint_types::{Block, Height, Proposal, Round, RoundStep, ValidatorSet};
use tokio::time::Instant;

use crate::height_vote_set::HeightVoteSet;

/// Everything the state machine tracks for the height under decision. Built
/// by `new_block_header`, mutated only by the single consensus loop, and
/// dropped when the height is finalized.
pub struct RoundState {
    pub height: Height,
    pub round: Round,
    pub step: RoundStep,

    /// When the height is allowed to start proposing; `commit_time` of the
    /// previous height plus the commit timeout.
    pub start_time: Instant,
    pub commit_time: Option<Instant>,

    pub validators: Arc<ValidatorSet>,

    pub proposal: Option<Proposal>,
    pub proposal_block_hash: Option<B256>,
    pub proposal_block: Option<Block>,

    pub locked_round: Option<Round>,
    pub locked_block: Option<Block>,

    pub valid_round: Option<Round>,
    pub valid_block: Option<Block>,

    pub votes: HeightVoteSet,

    pub commit_round: Option<Round>,
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    pub fn new(height: Height, validators: Arc<ValidatorSet>, start_time: Instant) -> Self {
        Self {
            height,
            round: 0,
            step: RoundStep::NewHeight,
            start_time,
            commit_time: None,
            validators: Arc::clone(&validators),
            proposal: None,
            proposal_block_hash: None,
            proposal_block: None,
            locked_round: None,
            locked_block: None,
            valid_round: None,
            valid_block: None,
            votes: HeightVoteSet::new(height, validators),
            commit_round: None,
            triggered_timeout_precommit: false,
        }
    }

    /// A proposal is complete once both the proposal and its block are here,
    /// and any referenced POLRound actually carries a prevote polka.
    pub fn is_proposal_complete(&self) -> bool {
        let Some(proposal) = &self.proposal else {
            return false;
        };
        if self.proposal_block.is_none() {
            return false;
        }
        match proposal.pol_round {
            None => true,
            Some(pol_round) => self
                .votes
                .prevotes(pol_round)
                .is_some_and(|set| set.has_two_thirds_majority()),
        }
    }

    pub fn locked_block_hash(&self) -> Option<B256> {
        self.locked_block.as_ref().map(Block::hash)
    }

    pub fn proposal_block_matches(&self, hash: &B256) -> bool {
        self.proposal_block
            .as_ref()
            .is_some_and(|block| block.hash() == *hash)
    }
}
