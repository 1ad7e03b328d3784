//! Small RLP helpers shared by the canonical encodings.

use crate::Round;

/// RLP has no negative integers, so maybe-absent rounds (`POLRound`,
/// `lastCommitRound`) travel as `round + 1` with `0` meaning none.
pub(crate) fn encode_opt_round(round: Option<Round>) -> u64 {
    match round {
        Some(r) => u64::from(r) + 1,
        None => 0,
    }
}

pub(crate) fn decode_opt_round(value: u64) -> Result<Option<Round>, alloy_rlp::Error> {
    match value {
        0 => Ok(None),
        v => u32::try_from(v - 1)
            .map(Some)
            .map_err(|_| alloy_rlp::Error::Custom("round overflows u32")),
    }
}
