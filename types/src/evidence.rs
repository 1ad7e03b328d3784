//! Verifiable records of validator misbehavior.

use alloy_primitives::{keccak256, B256};
use alloy_rlp::{Decodable, Encodable};
use thiserror::Error;

use crate::validator_set::ValidatorSet;
use crate::vote::{Vote, VoteError};
use crate::Height;

const DUPLICATE_VOTE_KIND: u8 = 0;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("votes are not for the same (validator, height, round, type)")]
    MismatchedVotes,

    #[error("votes reference the same block hash")]
    IdenticalVotes,

    #[error("votes are not in canonical hash order")]
    NonCanonicalOrder,

    #[error("validator index {0} not in the validator set")]
    UnknownValidator(u32),

    #[error(transparent)]
    Vote(#[from] VoteError),
}

/// Two valid votes from one validator for the same `(height, round, type)`
/// but different block hashes. Canonical order: `vote_a.block_hash <
/// vote_b.block_hash`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DuplicateVoteEvidence {
    pub vote_a: Vote,
    pub vote_b: Vote,
}

impl DuplicateVoteEvidence {
    /// Pair two conflicting votes, normalizing to canonical order.
    pub fn new(x: Vote, y: Vote) -> Result<Self, EvidenceError> {
        if x.validator_index != y.validator_index
            || x.height != y.height
            || x.round != y.round
            || x.vote_type != y.vote_type
            || x.chain_id != y.chain_id
        {
            return Err(EvidenceError::MismatchedVotes);
        }
        if x.block_hash == y.block_hash {
            return Err(EvidenceError::IdenticalVotes);
        }

        let (vote_a, vote_b) = if x.block_hash < y.block_hash {
            (x, y)
        } else {
            (y, x)
        };
        Ok(Self { vote_a, vote_b })
    }

    pub fn height(&self) -> Height {
        self.vote_a.height
    }

    pub fn validator_index(&self) -> u32 {
        self.vote_a.validator_index
    }

    /// Check well-formedness and both signatures against the validator set
    /// in force at the evidence height.
    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), EvidenceError> {
        if self.vote_a.block_hash >= self.vote_b.block_hash {
            return Err(EvidenceError::NonCanonicalOrder);
        }
        // Re-run the pairing checks so decoded evidence is held to the same
        // standard as locally-detected evidence.
        Self::new(self.vote_a.clone(), self.vote_b.clone())?;

        let validator = validators
            .get(self.validator_index() as usize)
            .ok_or(EvidenceError::UnknownValidator(self.validator_index()))?;

        self.vote_a.verify(validator.address)?;
        self.vote_b.verify(validator.address)?;
        Ok(())
    }
}

/// All evidence kinds understood by the chain, tagged on the wire.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Evidence {
    DuplicateVote(DuplicateVoteEvidence),
}

impl Evidence {
    pub fn height(&self) -> Height {
        match self {
            Self::DuplicateVote(ev) => ev.height(),
        }
    }

    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), EvidenceError> {
        match self {
            Self::DuplicateVote(ev) => ev.verify(validators),
        }
    }
}

impl From<DuplicateVoteEvidence> for Evidence {
    fn from(ev: DuplicateVoteEvidence) -> Self {
        Self::DuplicateVote(ev)
    }
}

impl Encodable for Evidence {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        match self {
            Self::DuplicateVote(ev) => {
                let payload_length =
                    DUPLICATE_VOTE_KIND.length() + ev.vote_a.length() + ev.vote_b.length();
                alloy_rlp::Header {
                    list: true,
                    payload_length,
                }
                .encode(out);
                DUPLICATE_VOTE_KIND.encode(out);
                ev.vote_a.encode(out);
                ev.vote_b.encode(out);
            }
        }
    }

    fn length(&self) -> usize {
        match self {
            Self::DuplicateVote(ev) => {
                let payload_length =
                    DUPLICATE_VOTE_KIND.length() + ev.vote_a.length() + ev.vote_b.length();
                payload_length + alloy_rlp::length_of_length(payload_length)
            }
        }
    }
}

impl Decodable for Evidence {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut body = alloy_rlp::Header::decode_bytes(buf, true)?;
        let kind = u8::decode(&mut body)?;
        match kind {
            DUPLICATE_VOTE_KIND => {
                let vote_a = Vote::decode(&mut body)?;
                let vote_b = Vote::decode(&mut body)?;
                Ok(Self::DuplicateVote(DuplicateVoteEvidence { vote_a, vote_b }))
            }
            _ => Err(alloy_rlp::Error::Custom("unknown evidence kind")),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{b256, Address};

    use super::*;
    use crate::signing::secp256k1::Signer;
    use crate::validator_set::Validator;
    use crate::vote::VoteType;

    const HASH_A: B256 =
        b256!("0x0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a");
    const HASH_B: B256 =
        b256!("0x0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b");

    fn vote(signer: &Signer, hash: B256, index: u32) -> Vote {
        Vote::new_signed(signer, 23, VoteType::Prevote, 7, 0, hash, 1_000, index)
    }

    fn single_validator_set(signer: &Signer) -> ValidatorSet {
        ValidatorSet::new(vec![Validator::new(signer.address(), 10)]).unwrap()
    }

    #[test]
    fn pairing_normalizes_hash_order() {
        let signer = Signer::random();
        let ev =
            DuplicateVoteEvidence::new(vote(&signer, HASH_B, 0), vote(&signer, HASH_A, 0)).unwrap();
        assert_eq!(ev.vote_a.block_hash, HASH_A);
        assert_eq!(ev.vote_b.block_hash, HASH_B);
    }

    #[test]
    fn pairing_rejects_mismatched_and_identical_votes() {
        let signer = Signer::random();

        assert!(matches!(
            DuplicateVoteEvidence::new(vote(&signer, HASH_A, 0), vote(&signer, HASH_B, 1)),
            Err(EvidenceError::MismatchedVotes)
        ));
        assert!(matches!(
            DuplicateVoteEvidence::new(vote(&signer, HASH_A, 0), vote(&signer, HASH_A, 0)),
            Err(EvidenceError::IdenticalVotes)
        ));
    }

    #[test]
    fn verification_checks_both_signatures() {
        let signer = Signer::random();
        let vals = single_validator_set(&signer);

        let good =
            DuplicateVoteEvidence::new(vote(&signer, HASH_A, 0), vote(&signer, HASH_B, 0)).unwrap();
        assert!(good.verify(&vals).is_ok());

        // Evidence pinned to a stranger's validator set must not verify.
        let other_vals =
            ValidatorSet::new(vec![Validator::new(Address::repeat_byte(0x77), 10)]).unwrap();
        assert!(good.verify(&other_vals).is_err());
    }

    #[test]
    fn verification_rejects_out_of_range_index() {
        let signer = Signer::random();
        let vals = single_validator_set(&signer);

        let ev =
            DuplicateVoteEvidence::new(vote(&signer, HASH_A, 3), vote(&signer, HASH_B, 3)).unwrap();
        assert!(matches!(
            ev.verify(&vals),
            Err(EvidenceError::UnknownValidator(3))
        ));
    }

    #[test]
    fn rlp_round_trip_and_stable_hash() {
        let signer = Signer::random();
        let ev: Evidence =
            DuplicateVoteEvidence::new(vote(&signer, HASH_A, 0), vote(&signer, HASH_B, 0))
                .unwrap()
                .into();

        let encoded = alloy_rlp::encode(&ev);
        let decoded: Evidence = alloy_rlp::decode_exact(&encoded).unwrap();
        assert_eq!(decoded, ev);
        assert_eq!(decoded.hash(), ev.hash());
    }
}
