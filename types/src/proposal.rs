//! Signed block proposals.

use alloy_primitives::{Address, B256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use thiserror::Error;

use crate::codec::{decode_opt_round, encode_opt_round};
use crate::signing::secp256k1::{recover_address, Signature, Signer, SigningError};
use crate::{Height, Round};

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("proposal signed by {recovered}, expected proposer {expected}")]
    WrongProposer { expected: Address, recovered: Address },

    #[error("POLRound {pol_round} is not below the proposal round {round}")]
    InvalidPolRound { pol_round: Round, round: Round },
}

/// A signed `(height, round, POLRound, blockHash)` proposal. `pol_round` of
/// `None` means no prior polka justifies re-proposing this block.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Proposal {
    pub chain_id: u64,
    pub height: Height,
    pub round: Round,
    pub pol_round: Option<Round>,
    pub block_hash: B256,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub signature: Signature,
}

/// Digest of the canonical proposal encoding `[chainId, 32, height, round,
/// POLRound, blockHash, timestamp]`; what the proposer's key signs.
pub fn proposal_sign_hash(
    chain_id: u64,
    height: Height,
    round: Round,
    pol_round: Option<Round>,
    block_hash: B256,
    timestamp: u64,
) -> B256 {
    crate::vote::proposal_sign_hash(
        chain_id,
        height,
        round,
        encode_opt_round(pol_round),
        block_hash,
        timestamp,
    )
}

#[derive(RlpEncodable, RlpDecodable)]
struct RlpProposal {
    chain_id: u64,
    height: Height,
    round: Round,
    pol_round: u64,
    block_hash: B256,
    timestamp: u64,
    signature: Signature,
}

impl Proposal {
    pub fn new_signed(
        signer: &Signer,
        chain_id: u64,
        height: Height,
        round: Round,
        pol_round: Option<Round>,
        block_hash: B256,
        timestamp: u64,
    ) -> Self {
        let digest = proposal_sign_hash(chain_id, height, round, pol_round, block_hash, timestamp);
        Self {
            chain_id,
            height,
            round,
            pol_round,
            block_hash,
            timestamp,
            signature: signer.sign_digest(digest),
        }
    }

    pub fn sign_hash(&self) -> B256 {
        proposal_sign_hash(
            self.chain_id,
            self.height,
            self.round,
            self.pol_round,
            self.block_hash,
            self.timestamp,
        )
    }

    pub fn recover(&self) -> Result<Address, SigningError> {
        recover_address(self.sign_hash(), &self.signature)
    }

    /// A POLRound must reference an earlier round of the same height.
    pub fn check_pol_round(&self) -> Result<(), ProposalError> {
        match self.pol_round {
            Some(pol_round) if pol_round >= self.round => Err(ProposalError::InvalidPolRound {
                pol_round,
                round: self.round,
            }),
            _ => Ok(()),
        }
    }

    /// Verify the signature against the expected proposer for this round.
    pub fn verify(&self, proposer: Address) -> Result<(), ProposalError> {
        let recovered = self.recover()?;
        if recovered != proposer {
            return Err(ProposalError::WrongProposer {
                expected: proposer,
                recovered,
            });
        }
        Ok(())
    }
}

impl Encodable for Proposal {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        RlpProposal::from(self).encode(out);
    }

    fn length(&self) -> usize {
        RlpProposal::from(self).length()
    }
}

impl Decodable for Proposal {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let raw = RlpProposal::decode(buf)?;
        Ok(Self {
            chain_id: raw.chain_id,
            height: raw.height,
            round: raw.round,
            pol_round: decode_opt_round(raw.pol_round)?,
            block_hash: raw.block_hash,
            timestamp: raw.timestamp,
            signature: raw.signature,
        })
    }
}

impl From<&Proposal> for RlpProposal {
    fn from(proposal: &Proposal) -> Self {
        Self {
            chain_id: proposal.chain_id,
            height: proposal.height,
            round: proposal.round,
            pol_round: encode_opt_round(proposal.pol_round),
            block_hash: proposal.block_hash,
            timestamp: proposal.timestamp,
            signature: proposal.signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::b256;

    use super::*;

    const HASH: B256 = b256!("0x2222222222222222222222222222222222222222222222222222222222222222");

    #[test]
    fn signed_proposal_verifies_against_proposer() {
        let signer = Signer::random();
        let proposal = Proposal::new_signed(&signer, 23, 5, 1, Some(0), HASH, 1_700_000_000_000);

        assert!(proposal.verify(signer.address()).is_ok());
        assert!(matches!(
            proposal.verify(Signer::random().address()),
            Err(ProposalError::WrongProposer { .. })
        ));
    }

    #[test]
    fn pol_round_must_precede_round() {
        let signer = Signer::random();

        let no_pol = Proposal::new_signed(&signer, 23, 5, 0, None, HASH, 0);
        assert!(no_pol.check_pol_round().is_ok());

        let valid = Proposal::new_signed(&signer, 23, 5, 3, Some(2), HASH, 0);
        assert!(valid.check_pol_round().is_ok());

        let invalid = Proposal::new_signed(&signer, 23, 5, 3, Some(3), HASH, 0);
        assert!(matches!(
            invalid.check_pol_round(),
            Err(ProposalError::InvalidPolRound { .. })
        ));
    }

    #[test]
    fn rlp_round_trip_preserves_absent_pol_round() {
        let signer = Signer::random();
        for pol_round in [None, Some(0), Some(7)] {
            let proposal = Proposal::new_signed(&signer, 23, 9, 8, pol_round, HASH, 42);
            let encoded = alloy_rlp::encode(&proposal);
            let decoded: Proposal = alloy_rlp::decode_exact(&encoded).unwrap();
            assert_eq!(decoded, proposal);
        }
    }

    #[test]
    fn pol_round_changes_the_digest() {
        let signer = Signer::random();
        let a = Proposal::new_signed(&signer, 23, 9, 8, None, HASH, 42);
        let b = Proposal::new_signed(&signer, 23, 9, 8, Some(0), HASH, 42);
        assert_ne!(a.sign_hash(), b.sign_hash());
    }
}
