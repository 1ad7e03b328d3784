//! Blocks: an Ethereum header plus opaque transaction payloads.
//!
//! Execution semantics live behind the block pipeline; consensus only needs
//! the header (for the extra-data seal and hashing) and the raw transaction
//! bytes to carry them through gossip.

use alloy_consensus::Header;
use alloy_primitives::{B256, Bytes};
use alloy_rlp::{RlpDecodable, RlpEncodable};

use crate::extra_data::calc_block_hash;
use crate::Height;

#[derive(Clone, PartialEq, Eq, Debug, Default, RlpEncodable, RlpDecodable)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Bytes>,
}

impl Block {
    pub const fn new(header: Header, transactions: Vec<Bytes>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// The consensus block hash. Covers the extra-data vanity and the
    /// evidence hashes but never the proposal or the sealed votes.
    pub fn hash(&self) -> B256 {
        calc_block_hash(&self.header)
    }

    pub const fn number(&self) -> Height {
        self.header.number
    }

    pub const fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rlp_round_trip() {
        let block = Block::new(
            Header {
                number: 7,
                gas_limit: 30_000_000,
                ..Default::default()
            },
            vec![
                Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
                Bytes::from(vec![0x00]),
            ],
        );

        let encoded = alloy_rlp::encode(&block);
        let decoded: Block = alloy_rlp::decode_exact(&encoded).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn hash_ignores_transactions() {
        let header = Header {
            number: 7,
            ..Default::default()
        };
        let a = Block::new(header.clone(), Vec::new());
        let b = Block::new(header, vec![Bytes::from(vec![0xde, 0xad, 0xbe, 0xef])]);
        assert_eq!(a.hash(), b.hash());
    }
}
