//! All vote sets of the height under decision, across rounds.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use alloy_primitives::B256;
use reimint_types::{is_nil, Height, Round, ValidatorSet, Vote, VoteType};
use thiserror::Error;

use crate::vote_set::{VoteSet, VoteSetError};
use crate::PeerId;

/// How many unexpected future rounds a single peer may seed with votes.
const MAX_PEER_CATCHUP_ROUNDS: usize = 2;

#[derive(Debug, Error)]
pub enum HeightVoteSetError {
    #[error("vote height {got} does not match {expected}")]
    WrongHeight { expected: Height, got: Height },

    #[error("peer {peer} exceeded its catch-up round allowance with round {round}")]
    UnwantedRound { peer: PeerId, round: Round },

    #[error(transparent)]
    VoteSet(#[from] VoteSetError),
}

struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Prevote and precommit sets for every tracked round of the current height,
/// plus the bookkeeping that bounds how far ahead peers may push votes.
pub struct HeightVoteSet {
    height: Height,
    validators: Arc<ValidatorSet>,
    round: Round,
    round_vote_sets: BTreeMap<Round, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerId, HashSet<Round>>,
}

impl HeightVoteSet {
    pub fn new(height: Height, validators: Arc<ValidatorSet>) -> Self {
        let mut hvs = Self {
            height,
            validators,
            round: 0,
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        hvs.add_round(0);
        hvs.add_round(1);
        hvs
    }

    pub const fn height(&self) -> Height {
        self.height
    }

    pub const fn round(&self) -> Round {
        self.round
    }

    /// Track rounds up to and including `round`; called with `current + 1`
    /// when a new round starts so the next round is gossip-ready.
    pub fn set_round(&mut self, round: Round) {
        for r in 0..=round {
            self.add_round(r);
        }
        self.round = round;
    }

    fn add_round(&mut self, round: Round) {
        self.round_vote_sets.entry(round).or_insert_with(|| RoundVoteSet {
            prevotes: VoteSet::new(
                self.height,
                round,
                VoteType::Prevote,
                Arc::clone(&self.validators),
            ),
            precommits: VoteSet::new(
                self.height,
                round,
                VoteType::Precommit,
                Arc::clone(&self.validators),
            ),
        });
    }

    /// Add a vote, creating the round's sets on demand. Votes for untracked
    /// future rounds are only accepted while the sending peer has catch-up
    /// allowance left; our own votes (`peer = None`) are always welcome.
    pub fn add_vote(
        &mut self,
        vote: Vote,
        peer: Option<&PeerId>,
    ) -> Result<bool, HeightVoteSetError> {
        if vote.height != self.height {
            return Err(HeightVoteSetError::WrongHeight {
                expected: self.height,
                got: vote.height,
            });
        }

        let round = vote.round;
        if !self.round_vote_sets.contains_key(&round) {
            if let Some(peer) = peer {
                let rounds = self.peer_catchup_rounds.entry(peer.clone()).or_default();
                if !rounds.contains(&round) && rounds.len() >= MAX_PEER_CATCHUP_ROUNDS {
                    return Err(HeightVoteSetError::UnwantedRound {
                        peer: peer.clone(),
                        round,
                    });
                }
                rounds.insert(round);
            }
            self.add_round(round);
        }

        let sets = self
            .round_vote_sets
            .get_mut(&round)
            .expect("round created above");
        let set = match vote.vote_type {
            VoteType::Prevote => &mut sets.prevotes,
            VoteType::Precommit => &mut sets.precommits,
        };
        Ok(set.add_vote(vote)?)
    }

    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|s| &s.prevotes)
    }

    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|s| &s.precommits)
    }

    pub fn prevotes_mut(&mut self, round: Round) -> Option<&mut VoteSet> {
        self.round_vote_sets.get_mut(&round).map(|s| &mut s.prevotes)
    }

    pub fn precommits_mut(&mut self, round: Round) -> Option<&mut VoteSet> {
        self.round_vote_sets
            .get_mut(&round)
            .map(|s| &mut s.precommits)
    }

    /// The most recent non-nil prevote polka: the greatest round with a 2/3+
    /// prevote majority for an actual block.
    pub fn pol_info(&self) -> Option<(Round, B256)> {
        self.round_vote_sets
            .iter()
            .rev()
            .find_map(|(round, sets)| match sets.prevotes.maj23() {
                Some(hash) if !is_nil(&hash) => Some((*round, hash)),
                _ => None,
            })
    }

    /// Record a peer's 2/3-majority claim on the matching vote set.
    pub fn set_peer_maj23(
        &mut self,
        round: Round,
        vote_type: VoteType,
        peer: PeerId,
        block_hash: B256,
    ) -> bool {
        let Some(sets) = self.round_vote_sets.get_mut(&round) else {
            return false;
        };
        match vote_type {
            VoteType::Prevote => sets.prevotes.set_peer_maj23(peer, block_hash),
            VoteType::Precommit => sets.precommits.set_peer_maj23(peer, block_hash),
        }
    }
}
