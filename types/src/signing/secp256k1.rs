//! Recoverable secp256k1 signing with Ethereum-style addresses.
//!
//! Consensus signatures are 65 bytes (`r ‖ s ‖ v`) over the keccak256 of a
//! canonical RLP encoding; verification recovers the signer address and
//! compares it against the expected validator.

use core::fmt;

use alloy_primitives::{keccak256, Address, B256};
use k256::ecdsa::{RecoveryId, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length in bytes of a recoverable signature: `r ‖ s ‖ v`.
pub const SIGNATURE_LENGTH: usize = 65;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("invalid recovery id: {0}")]
    InvalidRecoveryId(u8),

    #[error("invalid secp256k1 private key")]
    InvalidPrivateKey,

    #[error("failed to recover signer from signature")]
    RecoveryFailed,
}

/// A 65-byte recoverable ECDSA signature.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex::serde")] [u8; SIGNATURE_LENGTH]);

impl Signature {
    pub const fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, SigningError> {
        let bytes: [u8; SIGNATURE_LENGTH] = slice
            .try_into()
            .map_err(|_| SigningError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    /// The trailing recovery byte (`v`).
    pub const fn recovery_byte(&self) -> u8 {
        self.0[SIGNATURE_LENGTH - 1]
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

impl alloy_rlp::Encodable for Signature {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.0.as_slice().encode(out);
    }

    fn length(&self) -> usize {
        self.0.as_slice().length()
    }
}

impl alloy_rlp::Decodable for Signature {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let bytes = alloy_rlp::Header::decode_bytes(buf, false)?;
        Self::from_slice(bytes).map_err(|_| alloy_rlp::Error::Custom("invalid signature length"))
    }
}

/// The node's own signing identity: a secp256k1 key plus its derived address.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
    address: Address,
}

impl Signer {
    pub fn new(key: SigningKey) -> Self {
        let address = public_key_to_address(key.verifying_key());
        Self { key, address }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SigningError> {
        let key = SigningKey::from_slice(bytes).map_err(|_| SigningError::InvalidPrivateKey)?;
        Ok(Self::new(key))
    }

    pub fn random() -> Self {
        Self::new(SigningKey::random(&mut rand::rngs::OsRng))
    }

    pub const fn address(&self) -> Address {
        self.address
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.key.verifying_key()
    }

    /// Sign a 32-byte digest, producing a recoverable signature.
    pub fn sign_digest(&self, digest: B256) -> Signature {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest.as_slice())
            .expect("signing a 32-byte digest is infallible");

        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes[..64].copy_from_slice(&signature.to_bytes());
        bytes[64] = recovery_id.to_byte();
        Signature(bytes)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Ethereum address derivation: keccak256 of the uncompressed public key's
/// x and y coordinates, keeping the last 20 bytes.
pub fn public_key_to_address(key: &VerifyingKey) -> Address {
    let encoded = key.to_encoded_point(false);
    let hash = keccak256(&encoded.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Recover the address that produced `signature` over `digest`.
pub fn recover_address(digest: B256, signature: &Signature) -> Result<Address, SigningError> {
    let bytes = signature.as_bytes();

    let recovery_id = RecoveryId::from_byte(bytes[64])
        .ok_or(SigningError::InvalidRecoveryId(bytes[64]))?;
    let signature = k256::ecdsa::Signature::from_slice(&bytes[..64])
        .map_err(|_| SigningError::InvalidSignature)?;

    let key = VerifyingKey::recover_from_prehash(digest.as_slice(), &signature, recovery_id)
        .map_err(|_| SigningError::RecoveryFailed)?;

    Ok(public_key_to_address(&key))
}
