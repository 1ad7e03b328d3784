//! The consensus seal embedded in `header.extra_data`.
//!
//! The first [`EXTRA_VANITY`] bytes are reserved vanity; the remainder is the
//! RLP of `(round, commitRound, POLRound, evidence, proposal, commit?)`. The
//! commit aggregate is absent while a block is still a proposal and filled in
//! at finalization. The block hash substitutes the payload with the evidence
//! hashes, so neither the proposal nor the sealed votes affect block identity.

use alloy_consensus::Header;
use alloy_primitives::{Address, B256, Bytes};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use thiserror::Error;

use crate::bit_array::BitArray;
use crate::codec::{decode_opt_round, encode_opt_round};
use crate::evidence::Evidence;
use crate::proposal::{Proposal, ProposalError};
use crate::signing::secp256k1::Signature;
use crate::validator_set::ValidatorSet;
use crate::vote::{Vote, VoteError, VoteType};
use crate::Round;

/// Reserved vanity prefix of `header.extra_data`.
pub const EXTRA_VANITY: usize = 32;

#[derive(Debug, Error)]
pub enum ExtraDataError {
    #[error("header extra data carries no consensus payload")]
    MissingPayload,

    #[error(transparent)]
    Rlp(#[from] alloy_rlp::Error),

    #[error("sealed block is missing the commit aggregate")]
    MissingCommit,

    #[error("commit bitmap covers {got} validators, expected {expected}")]
    BitmapLength { expected: usize, got: usize },

    #[error("commit carries {got} signatures for {expected} set bits")]
    SignatureCount { expected: usize, got: usize },

    #[error("commit voting power {got} does not exceed 2/3 of {total}")]
    InsufficientVotingPower { got: u64, total: u64 },

    #[error("proposal block hash does not match the sealed header")]
    BlockHashMismatch,

    #[error(transparent)]
    Vote(#[from] VoteError),

    #[error(transparent)]
    Proposal(#[from] ProposalError),
}

/// One precommit in a sealed commit: the vote's timestamp is kept because the
/// signature covers it.
#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct CommitSig {
    pub timestamp: u64,
    pub signature: Signature,
}

/// Aggregate of the precommits justifying a committed block: a validator
/// bitmap plus one [`CommitSig`] per set bit, in index order.
#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct Commit {
    pub bitmap: BitArray,
    pub signatures: Vec<CommitSig>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExtraData {
    pub round: Round,
    pub commit_round: Round,
    pub pol_round: Option<Round>,
    pub evidence: Vec<Evidence>,
    pub proposal: Proposal,
    pub commit: Option<Commit>,
}

impl ExtraData {
    /// Decode the consensus payload from a sealed header.
    pub fn from_header(header: &Header) -> Result<Self, ExtraDataError> {
        let extra = header.extra_data.as_ref();
        if extra.len() <= EXTRA_VANITY {
            return Err(ExtraDataError::MissingPayload);
        }
        let mut payload = &extra[EXTRA_VANITY..];
        Ok(Self::decode(&mut payload)?)
    }

    /// Seal the payload into the header, preserving any existing vanity.
    pub fn seal(&self, header: &mut Header) {
        let mut extra = Vec::with_capacity(EXTRA_VANITY + self.length());
        extra.extend_from_slice(&vanity(header));
        self.encode(&mut extra);
        header.extra_data = Bytes::from(extra);
    }

    /// Verify the commit aggregate: every sealed precommit must be a valid
    /// signature over this block's hash at `commit_round`, and the voting
    /// power of the signers must exceed two thirds.
    pub fn verify_commit(
        &self,
        header: &Header,
        validators: &ValidatorSet,
    ) -> Result<(), ExtraDataError> {
        let commit = self.commit.as_ref().ok_or(ExtraDataError::MissingCommit)?;

        if commit.bitmap.len() != validators.len() {
            return Err(ExtraDataError::BitmapLength {
                expected: validators.len(),
                got: commit.bitmap.len(),
            });
        }
        if commit.signatures.len() != commit.bitmap.count_ones() {
            return Err(ExtraDataError::SignatureCount {
                expected: commit.bitmap.count_ones(),
                got: commit.signatures.len(),
            });
        }

        let block_hash = calc_block_hash(header);
        let mut power = 0u64;

        for (index, commit_sig) in commit.bitmap.iter_ones().zip(commit.signatures.iter()) {
            let validator = validators.get(index).ok_or(ExtraDataError::BitmapLength {
                expected: validators.len(),
                got: commit.bitmap.len(),
            })?;

            let vote = Vote {
                chain_id: self.proposal.chain_id,
                vote_type: VoteType::Precommit,
                height: header.number,
                round: self.commit_round,
                block_hash,
                timestamp: commit_sig.timestamp,
                validator_index: index as u32,
                signature: commit_sig.signature,
            };
            vote.verify(validator.address)?;
            power += validator.voting_power;
        }

        if !validators.has_two_thirds(power) {
            return Err(ExtraDataError::InsufficientVotingPower {
                got: power,
                total: validators.total_voting_power(),
            });
        }
        Ok(())
    }

    /// Verify the embedded proposal: it must commit to this block's hash and
    /// be signed by the expected proposer.
    pub fn verify_proposal(
        &self,
        header: &Header,
        proposer: Address,
    ) -> Result<(), ExtraDataError> {
        if self.proposal.block_hash != calc_block_hash(header) {
            return Err(ExtraDataError::BlockHashMismatch);
        }
        self.proposal.verify(proposer)?;
        Ok(())
    }
}

impl Encodable for ExtraData {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length = self.payload_length();
        alloy_rlp::Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.round.encode(out);
        self.commit_round.encode(out);
        encode_opt_round(self.pol_round).encode(out);
        self.evidence.encode(out);
        self.proposal.encode(out);
        if let Some(commit) = &self.commit {
            commit.encode(out);
        }
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl ExtraData {
    fn payload_length(&self) -> usize {
        self.round.length()
            + self.commit_round.length()
            + encode_opt_round(self.pol_round).length()
            + self.evidence.length()
            + self.proposal.length()
            + self.commit.as_ref().map_or(0, Encodable::length)
    }
}

impl Decodable for ExtraData {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut body = alloy_rlp::Header::decode_bytes(buf, true)?;
        let round = Round::decode(&mut body)?;
        let commit_round = Round::decode(&mut body)?;
        let pol_round = decode_opt_round(u64::decode(&mut body)?)?;
        let evidence = Vec::<Evidence>::decode(&mut body)?;
        let proposal = Proposal::decode(&mut body)?;
        let commit = if body.is_empty() {
            None
        } else {
            Some(Commit::decode(&mut body)?)
        };
        Ok(Self {
            round,
            commit_round,
            pol_round,
            evidence,
            proposal,
            commit,
        })
    }
}

/// The consensus block hash: keccak of the header with its extra data
/// replaced by `vanity ‖ H(ev₁) ‖ H(ev₂) ‖ …`. Votes and the proposal never
/// enter block identity; the evidence set does.
pub fn calc_block_hash(header: &Header) -> B256 {
    let evidence = ExtraData::from_header(header)
        .map(|extra| extra.evidence)
        .unwrap_or_default();
    calc_block_hash_with_evidence(header, &evidence)
}

/// Block hash for a header that has not been sealed yet, with the evidence
/// the proposer intends to include.
pub fn calc_block_hash_with_evidence(header: &Header, evidence: &[Evidence]) -> B256 {
    let mut extra = Vec::with_capacity(EXTRA_VANITY + evidence.len() * 32);
    extra.extend_from_slice(&vanity(header));
    for ev in evidence {
        extra.extend_from_slice(ev.hash().as_slice());
    }

    let mut hashed = header.clone();
    hashed.extra_data = Bytes::from(extra);
    hashed.hash_slow()
}

fn vanity(header: &Header) -> [u8; EXTRA_VANITY] {
    let mut vanity = [0u8; EXTRA_VANITY];
    let extra = header.extra_data.as_ref();
    let len = extra.len().min(EXTRA_VANITY);
    vanity[..len].copy_from_slice(&extra[..len]);
    vanity
}
