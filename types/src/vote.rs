//! Signed consensus ballots.

use alloy_primitives::{keccak256, Address, B256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use thiserror::Error;

use crate::signing::secp256k1::{recover_address, Signature, Signer, SigningError};
use crate::{is_nil, Height, Round};

/// Message type tag reserved for proposal signing bytes. Never stored in a
/// vote set; it only keeps proposal and vote digests in disjoint domains.
pub const PROPOSAL_MESSAGE_TYPE: u8 = 32;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum VoteType {
    Prevote = 1,
    Precommit = 2,
}

impl VoteType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Prevote),
            2 => Some(Self::Precommit),
            _ => None,
        }
    }
}

impl core::fmt::Display for VoteType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Prevote => "prevote",
            Self::Precommit => "precommit",
        })
    }
}

impl Encodable for VoteType {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.as_u8().encode(out);
    }

    fn length(&self) -> usize {
        self.as_u8().length()
    }
}

impl Decodable for VoteType {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let value = u8::decode(buf)?;
        Self::from_u8(value).ok_or(alloy_rlp::Error::Custom("invalid vote type"))
    }
}

#[derive(Debug, Error)]
pub enum VoteError {
    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("vote signed by {recovered}, expected {expected}")]
    WrongSigner { expected: Address, recovered: Address },
}

/// A signed ballot for one `(height, round, type)`. The signature covers the
/// canonical encoding of every other field; an all-zero `block_hash` is nil.
#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct Vote {
    pub chain_id: u64,
    pub vote_type: VoteType,
    pub height: Height,
    pub round: Round,
    pub block_hash: B256,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub validator_index: u32,
    pub signature: Signature,
}

/// The signed portion of a vote.
#[derive(RlpEncodable)]
struct CanonicalVote {
    chain_id: u64,
    vote_type: u8,
    height: Height,
    round: Round,
    block_hash: B256,
    timestamp: u64,
}

impl Vote {
    #[allow(clippy::too_many_arguments)]
    pub fn new_signed(
        signer: &Signer,
        chain_id: u64,
        vote_type: VoteType,
        height: Height,
        round: Round,
        block_hash: B256,
        timestamp: u64,
        validator_index: u32,
    ) -> Self {
        let digest = vote_sign_hash(chain_id, vote_type, height, round, block_hash, timestamp);
        Self {
            chain_id,
            vote_type,
            height,
            round,
            block_hash,
            timestamp,
            validator_index,
            signature: signer.sign_digest(digest),
        }
    }

    pub fn is_nil(&self) -> bool {
        is_nil(&self.block_hash)
    }

    /// Digest of the canonical encoding, the message actually signed.
    pub fn sign_hash(&self) -> B256 {
        vote_sign_hash(
            self.chain_id,
            self.vote_type,
            self.height,
            self.round,
            self.block_hash,
            self.timestamp,
        )
    }

    pub fn recover(&self) -> Result<Address, SigningError> {
        recover_address(self.sign_hash(), &self.signature)
    }

    /// Verify the signature against the expected validator address.
    pub fn verify(&self, expected: Address) -> Result<(), VoteError> {
        let recovered = self.recover()?;
        if recovered != expected {
            return Err(VoteError::WrongSigner { expected, recovered });
        }
        Ok(())
    }
}

/// Digest of the canonical vote encoding `[chainId, type, height, round,
/// blockHash, timestamp]`. This is what a validator's key actually signs.
pub fn vote_sign_hash(
    chain_id: u64,
    vote_type: VoteType,
    height: Height,
    round: Round,
    block_hash: B256,
    timestamp: u64,
) -> B256 {
    keccak256(alloy_rlp::encode(CanonicalVote {
        chain_id,
        vote_type: vote_type.as_u8(),
        height,
        round,
        block_hash,
        timestamp,
    }))
}

/// Digest a proposal signs: same canonical layout with the reserved proposal
/// type tag and the POLRound slotted in after the round.
pub(crate) fn proposal_sign_hash(
    chain_id: u64,
    height: Height,
    round: Round,
    pol_round: u64,
    block_hash: B256,
    timestamp: u64,
) -> B256 {
    #[derive(RlpEncodable)]
    struct CanonicalProposal {
        chain_id: u64,
        message_type: u8,
        height: Height,
        round: Round,
        pol_round: u64,
        block_hash: B256,
        timestamp: u64,
    }

    keccak256(alloy_rlp::encode(CanonicalProposal {
        chain_id,
        message_type: PROPOSAL_MESSAGE_TYPE,
        height,
        round,
        pol_round,
        block_hash,
        timestamp,
    }))
}
