//! The RLP wire envelope: `[code, payload]` with one code per message.

use alloy_primitives::B256;
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use thiserror::Error;

use crate::bit_array::BitArray;
use crate::block::Block;
use crate::codec::{decode_opt_round, encode_opt_round};
use crate::proposal::Proposal;
use crate::step::RoundStep;
use crate::vote::{Vote, VoteType};
use crate::{Height, Round};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown message code {0}")]
    UnknownCode(u8),

    #[error("invalid round step {0}")]
    InvalidStep(u8),

    #[error("invalid vote type {0}")]
    InvalidVoteType(u8),

    #[error(transparent)]
    Rlp(#[from] alloy_rlp::Error),
}

/// Header of a block part set, carried by `NewValidBlock` for wire
/// compatibility; blocks are transferred whole here.
#[derive(Clone, Copy, PartialEq, Eq, Debug, RlpEncodable, RlpDecodable)]
pub struct PartSetHeader {
    pub count: u32,
    pub hash: B256,
}

/// Every message exchanged by consensus peers.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ConsensusMessage {
    NewRoundStep {
        height: Height,
        round: Round,
        step: RoundStep,
        seconds_since_start_time: u64,
        last_commit_round: Option<Round>,
    },
    NewValidBlock {
        height: Height,
        round: Round,
        parts: PartSetHeader,
        block_hash: B256,
        is_commit: bool,
    },
    HasVote {
        height: Height,
        round: Round,
        vote_type: VoteType,
        index: u32,
    },
    Proposal(Proposal),
    ProposalPol {
        height: Height,
        pol_round: Round,
        votes: BitArray,
    },
    ProposalBlock(Block),
    Vote(Vote),
    VoteSetMaj23 {
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_hash: B256,
    },
    VoteSetBits {
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_hash: B256,
        votes: BitArray,
    },
    GetProposalBlock {
        block_hash: B256,
    },
}

const CODE_NEW_ROUND_STEP: u8 = 0;
const CODE_NEW_VALID_BLOCK: u8 = 1;
const CODE_HAS_VOTE: u8 = 2;
const CODE_PROPOSAL: u8 = 3;
const CODE_PROPOSAL_POL: u8 = 4;
const CODE_PROPOSAL_BLOCK: u8 = 5;
const CODE_VOTE: u8 = 6;
const CODE_VOTE_SET_MAJ23: u8 = 7;
const CODE_VOTE_SET_BITS: u8 = 8;
const CODE_GET_PROPOSAL_BLOCK: u8 = 9;

#[derive(RlpEncodable, RlpDecodable)]
struct NewRoundStepBody {
    height: Height,
    round: Round,
    step: u8,
    seconds_since_start_time: u64,
    last_commit_round: u64,
}

#[derive(RlpEncodable, RlpDecodable)]
struct NewValidBlockBody {
    height: Height,
    round: Round,
    parts: PartSetHeader,
    block_hash: B256,
    is_commit: bool,
}

#[derive(RlpEncodable, RlpDecodable)]
struct HasVoteBody {
    height: Height,
    round: Round,
    vote_type: u8,
    index: u32,
}

#[derive(RlpEncodable, RlpDecodable)]
struct ProposalPolBody {
    height: Height,
    pol_round: Round,
    votes: BitArray,
}

#[derive(RlpEncodable, RlpDecodable)]
struct VoteSetMaj23Body {
    height: Height,
    round: Round,
    vote_type: u8,
    block_hash: B256,
}

#[derive(RlpEncodable, RlpDecodable)]
struct VoteSetBitsBody {
    height: Height,
    round: Round,
    vote_type: u8,
    block_hash: B256,
    votes: BitArray,
}

impl ConsensusMessage {
    pub const fn code(&self) -> u8 {
        match self {
            Self::NewRoundStep { .. } => CODE_NEW_ROUND_STEP,
            Self::NewValidBlock { .. } => CODE_NEW_VALID_BLOCK,
            Self::HasVote { .. } => CODE_HAS_VOTE,
            Self::Proposal(_) => CODE_PROPOSAL,
            Self::ProposalPol { .. } => CODE_PROPOSAL_POL,
            Self::ProposalBlock(_) => CODE_PROPOSAL_BLOCK,
            Self::Vote(_) => CODE_VOTE,
            Self::VoteSetMaj23 { .. } => CODE_VOTE_SET_MAJ23,
            Self::VoteSetBits { .. } => CODE_VOTE_SET_BITS,
            Self::GetProposalBlock { .. } => CODE_GET_PROPOSAL_BLOCK,
        }
    }

    /// Encode the `[code, payload]` envelope.
    pub fn encode(&self) -> Vec<u8> {
        let code = self.code();
        let payload_length = code.length() + self.body_length();
        let mut out = Vec::with_capacity(payload_length + 4);
        alloy_rlp::Header {
            list: true,
            payload_length,
        }
        .encode(&mut out);
        code.encode(&mut out);
        self.encode_body(&mut out);
        out
    }

    fn body_length(&self) -> usize {
        match self {
            Self::NewRoundStep {
                height,
                round,
                step,
                seconds_since_start_time,
                last_commit_round,
            } => NewRoundStepBody {
                height: *height,
                round: *round,
                step: step.as_u8(),
                seconds_since_start_time: *seconds_since_start_time,
                last_commit_round: encode_opt_round(*last_commit_round),
            }
            .length(),
            Self::NewValidBlock {
                height,
                round,
                parts,
                block_hash,
                is_commit,
            } => NewValidBlockBody {
                height: *height,
                round: *round,
                parts: *parts,
                block_hash: *block_hash,
                is_commit: *is_commit,
            }
            .length(),
            Self::HasVote {
                height,
                round,
                vote_type,
                index,
            } => HasVoteBody {
                height: *height,
                round: *round,
                vote_type: vote_type.as_u8(),
                index: *index,
            }
            .length(),
            Self::Proposal(proposal) => proposal.length(),
            Self::ProposalPol {
                height,
                pol_round,
                votes,
            } => ProposalPolBody {
                height: *height,
                pol_round: *pol_round,
                votes: votes.clone(),
            }
            .length(),
            Self::ProposalBlock(block) => block.length(),
            Self::Vote(vote) => vote.length(),
            Self::VoteSetMaj23 {
                height,
                round,
                vote_type,
                block_hash,
            } => VoteSetMaj23Body {
                height: *height,
                round: *round,
                vote_type: vote_type.as_u8(),
                block_hash: *block_hash,
            }
            .length(),
            Self::VoteSetBits {
                height,
                round,
                vote_type,
                block_hash,
                votes,
            } => VoteSetBitsBody {
                height: *height,
                round: *round,
                vote_type: vote_type.as_u8(),
                block_hash: *block_hash,
                votes: votes.clone(),
            }
            .length(),
            Self::GetProposalBlock { block_hash } => block_hash.length(),
        }
    }

    fn encode_body(&self, out: &mut dyn alloy_rlp::BufMut) {
        match self {
            Self::NewRoundStep {
                height,
                round,
                step,
                seconds_since_start_time,
                last_commit_round,
            } => NewRoundStepBody {
                height: *height,
                round: *round,
                step: step.as_u8(),
                seconds_since_start_time: *seconds_since_start_time,
                last_commit_round: encode_opt_round(*last_commit_round),
            }
            .encode(out),
            Self::NewValidBlock {
                height,
                round,
                parts,
                block_hash,
                is_commit,
            } => NewValidBlockBody {
                height: *height,
                round: *round,
                parts: *parts,
                block_hash: *block_hash,
                is_commit: *is_commit,
            }
            .encode(out),
            Self::HasVote {
                height,
                round,
                vote_type,
                index,
            } => HasVoteBody {
                height: *height,
                round: *round,
                vote_type: vote_type.as_u8(),
                index: *index,
            }
            .encode(out),
            Self::Proposal(proposal) => proposal.encode(out),
            Self::ProposalPol {
                height,
                pol_round,
                votes,
            } => ProposalPolBody {
                height: *height,
                pol_round: *pol_round,
                votes: votes.clone(),
            }
            .encode(out),
            Self::ProposalBlock(block) => block.encode(out),
            Self::Vote(vote) => vote.encode(out),
            Self::VoteSetMaj23 {
                height,
                round,
                vote_type,
                block_hash,
            } => VoteSetMaj23Body {
                height: *height,
                round: *round,
                vote_type: vote_type.as_u8(),
                block_hash: *block_hash,
            }
            .encode(out),
            Self::VoteSetBits {
                height,
                round,
                vote_type,
                block_hash,
                votes,
            } => VoteSetBitsBody {
                height: *height,
                round: *round,
                vote_type: vote_type.as_u8(),
                block_hash: *block_hash,
                votes: votes.clone(),
            }
            .encode(out),
            Self::GetProposalBlock { block_hash } => block_hash.encode(out),
        }
    }

    /// Decode a `[code, payload]` envelope.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut outer = buf;
        let mut body = alloy_rlp::Header::decode_bytes(&mut outer, true)?;
        let code = u8::decode(&mut body)?;

        let message = match code {
            CODE_NEW_ROUND_STEP => {
                let raw = NewRoundStepBody::decode(&mut body)?;
                Self::NewRoundStep {
                    height: raw.height,
                    round: raw.round,
                    step: RoundStep::from_u8(raw.step).ok_or(WireError::InvalidStep(raw.step))?,
                    seconds_since_start_time: raw.seconds_since_start_time,
                    last_commit_round: decode_opt_round(raw.last_commit_round)?,
                }
            }
            CODE_NEW_VALID_BLOCK => {
                let raw = NewValidBlockBody::decode(&mut body)?;
                Self::NewValidBlock {
                    height: raw.height,
                    round: raw.round,
                    parts: raw.parts,
                    block_hash: raw.block_hash,
                    is_commit: raw.is_commit,
                }
            }
            CODE_HAS_VOTE => {
                let raw = HasVoteBody::decode(&mut body)?;
                Self::HasVote {
                    height: raw.height,
                    round: raw.round,
                    vote_type: VoteType::from_u8(raw.vote_type)
                        .ok_or(WireError::InvalidVoteType(raw.vote_type))?,
                    index: raw.index,
                }
            }
            CODE_PROPOSAL => Self::Proposal(Proposal::decode(&mut body)?),
            CODE_PROPOSAL_POL => {
                let raw = ProposalPolBody::decode(&mut body)?;
                Self::ProposalPol {
                    height: raw.height,
                    pol_round: raw.pol_round,
                    votes: raw.votes,
                }
            }
            CODE_PROPOSAL_BLOCK => Self::ProposalBlock(Block::decode(&mut body)?),
            CODE_VOTE => Self::Vote(Vote::decode(&mut body)?),
            CODE_VOTE_SET_MAJ23 => {
                let raw = VoteSetMaj23Body::decode(&mut body)?;
                Self::VoteSetMaj23 {
                    height: raw.height,
                    round: raw.round,
                    vote_type: VoteType::from_u8(raw.vote_type)
                        .ok_or(WireError::InvalidVoteType(raw.vote_type))?,
                    block_hash: raw.block_hash,
                }
            }
            CODE_VOTE_SET_BITS => {
                let raw = VoteSetBitsBody::decode(&mut body)?;
                Self::VoteSetBits {
                    height: raw.height,
                    round: raw.round,
                    vote_type: VoteType::from_u8(raw.vote_type)
                        .ok_or(WireError::InvalidVoteType(raw.vote_type))?,
                    block_hash: raw.block_hash,
                    votes: raw.votes,
                }
            }
            CODE_GET_PROPOSAL_BLOCK => Self::GetProposalBlock {
                block_hash: B256::decode(&mut body)?,
            },
            other => return Err(WireError::UnknownCode(other)),
        };
        Ok(message)
    }
}
