//! A compact bit set used for vote bitmaps on the wire and in sealed commits.

use alloy_rlp::{Decodable, Encodable};
use bytes::Bytes;

/// Fixed-length bit array keyed by validator index.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct BitArray {
    bits: usize,
    bytes: Vec<u8>,
}

impl BitArray {
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            bytes: vec![0; bits.div_ceil(8)],
        }
    }

    pub const fn len(&self) -> usize {
        self.bits
    }

    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if index >= self.bits {
            return;
        }
        if value {
            self.bytes[index / 8] |= 1 << (index % 8);
        } else {
            self.bytes[index / 8] &= !(1 << (index % 8));
        }
    }

    pub fn count_ones(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits).filter(|i| self.get(*i))
    }

    /// Bits set in `self` but not in `other`. Used to find votes a peer lacks.
    pub fn difference(&self, other: &Self) -> Self {
        let mut out = Self::new(self.bits);
        for (i, (a, b)) in self.bytes.iter().zip(other.bytes.iter()).enumerate() {
            out.bytes[i] = a & !b;
        }
        if other.bytes.len() < self.bytes.len() {
            out.bytes[other.bytes.len()..].copy_from_slice(&self.bytes[other.bytes.len()..]);
        }
        out
    }

    /// Merge the bits of `other` into `self` (index-aligned prefix).
    pub fn union_with(&mut self, other: &Self) {
        for (a, b) in self.bytes.iter_mut().zip(other.bytes.iter()) {
            *a |= b;
        }
    }
}

impl core::fmt::Debug for BitArray {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BitArray[")?;
        for i in 0..self.bits {
            write!(f, "{}", if self.get(i) { '1' } else { '0' })?;
        }
        write!(f, "]")
    }
}

impl Encodable for BitArray {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let bits = self.bits as u64;
        let payload_length = bits.length() + self.bytes.as_slice().length();
        alloy_rlp::Header {
            list: true,
            payload_length,
        }
        .encode(out);
        bits.encode(out);
        self.bytes.as_slice().encode(out);
    }

    fn length(&self) -> usize {
        let bits = self.bits as u64;
        let payload_length = bits.length() + self.bytes.as_slice().length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for BitArray {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut body = alloy_rlp::Header::decode_bytes(buf, true)?;
        let bits = u64::decode(&mut body)? as usize;
        let bytes = Bytes::decode(&mut body)?;
        if bytes.len() != bits.div_ceil(8) {
            return Err(alloy_rlp::Error::Custom("bit array length mismatch"));
        }
        Ok(Self {
            bits,
            bytes: bytes.to_vec(),
        })
    }
}
