//! Core data model for the Reimint consensus engine: validators and the
//! proposer-priority validator set, signed votes and proposals, duplicate-vote
//! evidence, block extra-data sealing, and the RLP wire envelope.

pub mod bit_array;
pub mod block;
pub mod evidence;
pub mod extra_data;
pub mod message;
pub mod proposal;
pub mod signing;
pub mod step;
pub mod validator_set;
pub mod vote;

mod codec;

pub use bit_array::BitArray;
pub use block::Block;
pub use evidence::{DuplicateVoteEvidence, Evidence, EvidenceError};
pub use extra_data::{calc_block_hash, Commit, CommitSig, ExtraData, ExtraDataError, EXTRA_VANITY};
pub use message::{ConsensusMessage, PartSetHeader, WireError};
pub use proposal::{proposal_sign_hash, Proposal, ProposalError};
pub use signing::secp256k1::{
    public_key_to_address, recover_address, Signature, Signer, SigningError, SIGNATURE_LENGTH,
};
pub use step::RoundStep;
pub use validator_set::{Validator, ValidatorSet, ValidatorSetError};
pub use vote::{vote_sign_hash, Vote, VoteError, VoteType};

/// Index of the block being decided.
pub type Height = u64;

/// Consensus attempt within a height; the first is 0.
pub type Round = u32;

/// The all-zero hash stands for "nil" in votes and proposals.
pub const NIL_HASH: alloy_primitives::B256 = alloy_primitives::B256::ZERO;

/// Whether a vote or proposal hash is the nil marker.
pub fn is_nil(hash: &alloy_primitives::B256) -> bool {
    *hash == NIL_HASH
}
