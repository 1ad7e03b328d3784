//! Per-(height, round, type) vote tallies with 2/3+ detection.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::B256;
use reimint_types::{
    is_nil, BitArray, Commit, CommitSig, Height, Round, ValidatorSet, Vote, VoteError, VoteType,
};
use thiserror::Error;

use crate::PeerId;

#[derive(Clone, Debug)]
pub struct ConflictingVotes {
    pub existing: Vote,
    pub conflicting: Vote,
}

#[derive(Debug, Error)]
pub enum VoteSetError {
    #[error("vote height {got} does not match set height {expected}")]
    WrongHeight { expected: Height, got: Height },

    #[error("vote round {got} does not match set round {expected}")]
    WrongRound { expected: Round, got: Round },

    #[error("vote type {got} does not match set type {expected}")]
    WrongType { expected: VoteType, got: VoteType },

    #[error("validator index {0} out of range")]
    IndexOutOfRange(u32),

    #[error(transparent)]
    Invalid(#[from] VoteError),

    #[error("conflicting votes from validator index {}", .0.existing.validator_index)]
    Conflicting(Box<ConflictingVotes>),

    #[error("no two-thirds majority to build a commit from")]
    NoMajority,

    #[error("commits are built from precommits, not {0}s")]
    NotPrecommits(VoteType),
}

struct BlockVotes {
    power: u64,
    bits: BitArray,
}

/// All votes of one `(height, round, type)`. At most one vote per validator
/// index; a second vote with a different block hash surfaces as
/// [`VoteSetError::Conflicting`] and leaves the original in place. `maj23`
/// latches onto the first block hash whose power exceeds two thirds and never
/// changes afterwards.
pub struct VoteSet {
    height: Height,
    round: Round,
    vote_type: VoteType,
    validators: Arc<ValidatorSet>,
    votes: Vec<Option<Vote>>,
    votes_bits: BitArray,
    sum: u64,
    maj23: Option<B256>,
    votes_by_block: HashMap<B256, BlockVotes>,
    peer_maj23s: HashMap<PeerId, B256>,
}

impl VoteSet {
    pub fn new(
        height: Height,
        round: Round,
        vote_type: VoteType,
        validators: Arc<ValidatorSet>,
    ) -> Self {
        let len = validators.len();
        Self {
            height,
            round,
            vote_type,
            validators,
            votes: vec![None; len],
            votes_bits: BitArray::new(len),
            sum: 0,
            maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    /// Add a verified vote. `Ok(true)` means the vote was new; `Ok(false)`
    /// that the identical vote was already present.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::WrongHeight {
                expected: self.height,
                got: vote.height,
            });
        }
        if vote.round != self.round {
            return Err(VoteSetError::WrongRound {
                expected: self.round,
                got: vote.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteSetError::WrongType {
                expected: self.vote_type,
                got: vote.vote_type,
            });
        }

        let index = vote.validator_index as usize;
        let validator = self
            .validators
            .get(index)
            .ok_or(VoteSetError::IndexOutOfRange(vote.validator_index))?;
        vote.verify(validator.address)?;

        if let Some(existing) = &self.votes[index] {
            if existing.block_hash == vote.block_hash {
                return Ok(false);
            }
            return Err(VoteSetError::Conflicting(Box::new(ConflictingVotes {
                existing: existing.clone(),
                conflicting: vote,
            })));
        }

        let block_hash = vote.block_hash;
        let power = validator.voting_power;

        self.votes[index] = Some(vote);
        self.votes_bits.set(index, true);
        self.sum += power;

        let by_block = self
            .votes_by_block
            .entry(block_hash)
            .or_insert_with(|| BlockVotes {
                power: 0,
                bits: BitArray::new(self.validators.len()),
            });
        by_block.power += power;
        by_block.bits.set(index, true);

        if self.maj23.is_none() && self.validators.has_two_thirds(by_block.power) {
            self.maj23 = Some(block_hash);
        }
        Ok(true)
    }

    /// The latched 2/3+ block hash, if any. May be the nil hash.
    pub fn maj23(&self) -> Option<B256> {
        self.maj23
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// 2/3+ of total power has voted, across all block hashes combined.
    pub fn has_two_thirds_any(&self) -> bool {
        self.validators.has_two_thirds(self.sum)
    }

    pub fn get(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize).and_then(Option::as_ref)
    }

    pub const fn sum(&self) -> u64 {
        self.sum
    }

    pub const fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub const fn round(&self) -> Round {
        self.round
    }

    /// Bitmap of validators that have voted, any block hash.
    pub fn bit_array(&self) -> BitArray {
        self.votes_bits.clone()
    }

    /// Bitmap of validators that voted for `block_hash`.
    pub fn bit_array_by_block(&self, block_hash: &B256) -> BitArray {
        self.votes_by_block
            .get(block_hash)
            .map_or_else(|| BitArray::new(self.validators.len()), |b| b.bits.clone())
    }

    /// Record a peer's claim that a 2/3 majority exists for `block_hash`.
    /// Returns whether the claim was new for this peer.
    pub fn set_peer_maj23(&mut self, peer: PeerId, block_hash: B256) -> bool {
        self.peer_maj23s.insert(peer, block_hash) != Some(block_hash)
    }

    /// Build the commit aggregate justifying `maj23`. Precommits only, and
    /// only for a non-nil majority.
    pub fn make_commit(&self) -> Result<Commit, VoteSetError> {
        if self.vote_type != VoteType::Precommit {
            return Err(VoteSetError::NotPrecommits(self.vote_type));
        }
        let maj23 = self.maj23.filter(|h| !is_nil(h)).ok_or(VoteSetError::NoMajority)?;

        let mut bitmap = BitArray::new(self.validators.len());
        let mut signatures = Vec::new();
        for vote in self.votes.iter().flatten() {
            if vote.block_hash == maj23 {
                bitmap.set(vote.validator_index as usize, true);
                signatures.push(CommitSig {
                    timestamp: vote.timestamp,
                    signature: vote.signature,
                });
            }
        }
        Ok(Commit { bitmap, signatures })
    }
}

#[cfg(test)]
mod tests {
    use reimint_types::{Signer, Validator};

    use super::*;

    const CHAIN_ID: u64 = 23;
    const HEIGHT: Height = 5;
    const ROUND: Round = 0;

    fn fixture(n: usize) -> (Vec<Signer>, Arc<ValidatorSet>) {
        let signers: Vec<Signer> = (0..n).map(|_| Signer::random()).collect();
        let vals = ValidatorSet::new(signers.iter().map(|s| Validator::new(s.address(), 10)))
            .unwrap();
        // Keep signer order aligned with the set's deterministic order.
        let mut ordered: Vec<Signer> = Vec::with_capacity(n);
        for validator in vals.validators() {
            ordered.push(
                signers
                    .iter()
                    .find(|s| s.address() == validator.address)
                    .unwrap()
                    .clone(),
            );
        }
        (ordered, Arc::new(vals))
    }

    fn vote(signer: &Signer, index: u32, hash: B256, vote_type: VoteType) -> Vote {
        Vote::new_signed(
            signer,
            CHAIN_ID,
            vote_type,
            HEIGHT,
            ROUND,
            hash,
            1_000 + u64::from(index),
            index,
        )
    }

    #[test]
    fn tallies_power_and_latches_maj23() {
        let (signers, vals) = fixture(4);
        let mut set = VoteSet::new(HEIGHT, ROUND, VoteType::Prevote, Arc::clone(&vals));
        let hash = B256::repeat_byte(0xaa);

        for (i, signer) in signers.iter().enumerate().take(2) {
            assert!(set.add_vote(vote(signer, i as u32, hash, VoteType::Prevote)).unwrap());
            assert!(!set.has_two_thirds_majority());
        }

        set.add_vote(vote(&signers[2], 2, hash, VoteType::Prevote)).unwrap();
        assert_eq!(set.maj23(), Some(hash));
        assert!(set.has_two_thirds_any());
        assert_eq!(set.sum(), 30);
    }

    #[test]
    fn duplicate_identical_vote_is_idempotent() {
        let (signers, vals) = fixture(4);
        let mut set = VoteSet::new(HEIGHT, ROUND, VoteType::Prevote, vals);
        let hash = B256::repeat_byte(0xaa);

        let v = vote(&signers[0], 0, hash, VoteType::Prevote);
        assert!(set.add_vote(v.clone()).unwrap());
        assert!(!set.add_vote(v).unwrap());
        assert_eq!(set.sum(), 10);
    }

    #[test]
    fn conflicting_vote_surfaces_both_ballots_and_keeps_the_original() {
        let (signers, vals) = fixture(4);
        let mut set = VoteSet::new(HEIGHT, ROUND, VoteType::Prevote, vals);
        let first = vote(&signers[0], 0, B256::repeat_byte(0xaa), VoteType::Prevote);
        let second = vote(&signers[0], 0, B256::repeat_byte(0xbb), VoteType::Prevote);

        set.add_vote(first.clone()).unwrap();
        let err = set.add_vote(second.clone()).unwrap_err();

        match err {
            VoteSetError::Conflicting(conflict) => {
                assert_eq!(conflict.existing, first);
                assert_eq!(conflict.conflicting, second);
            }
            other => panic!("expected conflicting votes, got {other}"),
        }
        assert_eq!(set.get(0).unwrap().block_hash, first.block_hash);
        assert_eq!(set.sum(), 10);
    }

    #[test]
    fn rejects_mismatched_votes_and_bad_indices() {
        let (signers, vals) = fixture(4);
        let mut set = VoteSet::new(HEIGHT, ROUND, VoteType::Prevote, vals);
        let hash = B256::repeat_byte(0xaa);

        let mut wrong_round = vote(&signers[0], 0, hash, VoteType::Prevote);
        wrong_round.round = 3;
        assert!(matches!(
            set.add_vote(wrong_round),
            Err(VoteSetError::WrongRound { .. })
        ));

        assert!(matches!(
            set.add_vote(vote(&signers[0], 0, hash, VoteType::Precommit)),
            Err(VoteSetError::WrongType { .. })
        ));

        assert!(matches!(
            set.add_vote(vote(&signers[0], 9, hash, VoteType::Prevote)),
            Err(VoteSetError::IndexOutOfRange(9))
        ));

        // A vote whose signature does not match the claimed index.
        assert!(matches!(
            set.add_vote(vote(&signers[0], 1, hash, VoteType::Prevote)),
            Err(VoteSetError::Invalid(_))
        ));
    }

    #[test]
    fn maj23_never_changes_once_set() {
        let (signers, vals) = fixture(4);
        let mut set = VoteSet::new(HEIGHT, ROUND, VoteType::Prevote, vals);
        let hash_a = B256::repeat_byte(0xaa);

        for (i, signer) in signers.iter().enumerate().take(3) {
            set.add_vote(vote(signer, i as u32, hash_a, VoteType::Prevote)).unwrap();
        }
        assert_eq!(set.maj23(), Some(hash_a));

        set.add_vote(vote(&signers[3], 3, B256::repeat_byte(0xbb), VoteType::Prevote))
            .unwrap();
        assert_eq!(set.maj23(), Some(hash_a));
    }

    #[test]
    fn equal_content_hashes_share_a_tally() {
        let (signers, vals) = fixture(4);
        let mut set = VoteSet::new(HEIGHT, ROUND, VoteType::Prevote, vals);

        // Two hashes built independently but with equal bytes must land in
        // the same per-block bucket.
        let hash_x = B256::from_slice(&[0x42; 32]);
        let hash_y = B256::repeat_byte(0x42);

        set.add_vote(vote(&signers[0], 0, hash_x, VoteType::Prevote)).unwrap();
        set.add_vote(vote(&signers[1], 1, hash_y, VoteType::Prevote)).unwrap();

        assert_eq!(set.bit_array_by_block(&hash_x).count_ones(), 2);
    }

    #[test]
    fn nil_votes_count_toward_any_but_form_a_nil_majority() {
        let (signers, vals) = fixture(4);
        let mut set = VoteSet::new(HEIGHT, ROUND, VoteType::Precommit, vals);

        for (i, signer) in signers.iter().enumerate().take(3) {
            set.add_vote(vote(signer, i as u32, reimint_types::NIL_HASH, VoteType::Precommit))
                .unwrap();
        }

        assert_eq!(set.maj23(), Some(reimint_types::NIL_HASH));
        // A nil majority cannot be turned into a commit.
        assert!(matches!(set.make_commit(), Err(VoteSetError::NoMajority)));
    }

    #[test]
    fn make_commit_collects_majority_signatures_in_index_order() {
        let (signers, vals) = fixture(4);
        let mut set = VoteSet::new(HEIGHT, ROUND, VoteType::Precommit, Arc::clone(&vals));
        let hash = B256::repeat_byte(0xcc);

        set.add_vote(vote(&signers[3], 3, hash, VoteType::Precommit)).unwrap();
        set.add_vote(vote(&signers[0], 0, hash, VoteType::Precommit)).unwrap();
        set.add_vote(vote(&signers[1], 1, reimint_types::NIL_HASH, VoteType::Precommit))
            .unwrap();
        set.add_vote(vote(&signers[2], 2, hash, VoteType::Precommit)).unwrap();

        let commit = set.make_commit().unwrap();
        assert_eq!(commit.bitmap.iter_ones().collect::<Vec<_>>(), vec![0, 2, 3]);
        assert_eq!(commit.signatures.len(), 3);
        // Signatures follow index order; timestamps encode the index here.
        assert_eq!(commit.signatures[0].timestamp, 1_000);
        assert_eq!(commit.signatures[1].timestamp, 1_002);
        assert_eq!(commit.signatures[2].timestamp, 1_003);
    }

    #[test]
    fn prevotes_cannot_build_a_commit() {
        let (signers, vals) = fixture(4);
        let mut set = VoteSet::new(HEIGHT, ROUND, VoteType::Prevote, vals);
        let hash = B256::repeat_byte(0xcc);
        for (i, signer) in signers.iter().enumerate().take(3) {
            set.add_vote(vote(signer, i as u32, hash, VoteType::Prevote)).unwrap();
        }
        assert!(matches!(
            set.make_commit(),
            Err(VoteSetError::NotPrecommits(VoteType::Prevote))
        ));
    }

    #[test]
    fn peer_maj23_claims_are_deduplicated_per_peer() {
        let (_, vals) = fixture(4);
        let mut set = VoteSet::new(HEIGHT, ROUND, VoteType::Prevote, vals);
        let hash = B256::repeat_byte(0xaa);

        assert!(set.set_peer_maj23("peer-1".into(), hash));
        assert!(!set.set_peer_maj23("peer-1".into(), hash));
        assert!(set.set_peer_maj23("peer-2".into(), hash));
    }
}
