//! Keccak-256 hashing and secp256k1 signature recovery.

use alloy_primitives::{Address, B256, U256};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use thiserror::Error;
use tiny_keccak::{Hasher, Keccak};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid recovery id: v = {0}")]
    InvalidRecoveryId(u64),

    #[error("Invalid signature scalars")]
    InvalidSignature,

    #[error("Public key recovery failed")]
    RecoveryFailed,

    #[error("Invalid secret key")]
    InvalidKey,
}

/// Compute keccak256 hash.
pub fn keccak256(data: impl AsRef<[u8]>) -> B256 {
    let mut hasher = Keccak::v256();
    hasher.update(data.as_ref());
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    B256::from(output)
}

/// Hash over several parts without concatenating them first.
pub fn keccak256_concat(parts: &[&[u8]]) -> B256 {
    let mut hasher = Keccak::v256();
    for part in parts {
        hasher.update(part);
    }
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    B256::from(output)
}

/// The message a node signs to attest "block `number` has hash `block_hash`":
/// `keccak256(blockHash ‖ uint256(number))`.
pub fn block_sign_hash(block_hash: &B256, number: u64) -> B256 {
    let number = U256::from(number).to_be_bytes::<32>();
    keccak256_concat(&[block_hash.as_slice(), &number])
}

/// Prefix a 32-byte hash the way `eth_sign` does.
pub fn personal_message_hash(hash: &B256) -> B256 {
    keccak256_concat(&[b"\x19Ethereum Signed Message:\n32", hash.as_slice()])
}

/// Ethereum address of an uncompressed public key.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Normalize `v` to a recovery id. Accepts 0/1, 27/28 and EIP-155 values.
pub fn recovery_id(v: u64) -> Result<u8, CryptoError> {
    match v {
        0 | 1 => Ok(v as u8),
        27 | 28 => Ok((v - 27) as u8),
        v if v >= 35 => Ok(((v - 35) % 2) as u8),
        v => Err(CryptoError::InvalidRecoveryId(v)),
    }
}

/// Recover the signer address of `hash` from an (r, s, v) signature.
pub fn recover_address(hash: &B256, r: &B256, s: &B256, v: u64) -> Result<Address, CryptoError> {
    let recid = RecoveryId::from_byte(recovery_id(v)?).ok_or(CryptoError::InvalidRecoveryId(v))?;

    let mut rs = [0u8; 64];
    rs[..32].copy_from_slice(r.as_slice());
    rs[32..].copy_from_slice(s.as_slice());
    let signature = EcdsaSignature::from_slice(&rs).map_err(|_| CryptoError::InvalidSignature)?;

    let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &signature, recid)
        .map_err(|_| CryptoError::RecoveryFailed)?;
    Ok(address_of(&key))
}

/// A secp256k1 key held in memory, producing Ethereum-style signatures.
#[derive(Clone)]
pub struct LocalSigner {
    key: SigningKey,
    address: Address,
}

impl LocalSigner {
    pub fn from_bytes(secret: &[u8]) -> Result<Self, CryptoError> {
        let key = SigningKey::from_slice(secret).map_err(|_| CryptoError::InvalidKey)?;
        let address = address_of(key.verifying_key());
        Ok(Self { key, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a prehashed message. Returns `(r, s, v)` with `v` in {27, 28}.
    pub fn sign_hash(&self, hash: &B256) -> Result<(B256, B256, u8), CryptoError> {
        let (signature, recid) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|_| CryptoError::InvalidSignature)?;
        let bytes = signature.to_bytes();
        Ok((
            B256::from_slice(&bytes[..32]),
            B256::from_slice(&bytes[32..]),
            27 + recid.to_byte(),
        ))
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_keccak256_empty() {
        assert_eq!(
            keccak256(b""),
            B256::from(hex!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"))
        );
    }

    #[test]
    fn test_keccak_concat_matches_single_pass() {
        assert_eq!(keccak256_concat(&[b"ab", b"cd"]), keccak256(b"abcd"));
    }

    #[test]
    fn test_known_key_address() {
        // Private key 1 controls a well-known address
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let signer = LocalSigner::from_bytes(&secret).unwrap();
        assert_eq!(
            signer.address(),
            Address::from(hex!("7e5f4552091a69125d5dfcb7b8c2659029395bdf"))
        );
    }

    #[test]
    fn test_sign_and_recover() {
        let signer = LocalSigner::from_bytes(&[7u8; 32]).unwrap();
        let hash = block_sign_hash(&B256::repeat_byte(0xAB), 42);
        let (r, s, v) = signer.sign_hash(&hash).unwrap();
        assert!(v == 27 || v == 28);
        assert_eq!(recover_address(&hash, &r, &s, v as u64).unwrap(), signer.address());
        assert_eq!(recover_address(&hash, &r, &s, (v - 27) as u64).unwrap(), signer.address());

        let other = block_sign_hash(&B256::repeat_byte(0xAB), 43);
        assert_ne!(recover_address(&other, &r, &s, v as u64).ok(), Some(signer.address()));
    }

    #[test]
    fn test_recovery_id_normalization() {
        assert_eq!(recovery_id(27).unwrap(), 0);
        assert_eq!(recovery_id(1).unwrap(), 1);
        assert_eq!(recovery_id(37).unwrap(), 0);
        assert_eq!(recovery_id(38).unwrap(), 1);
        assert_eq!(recovery_id(5), Err(CryptoError::InvalidRecoveryId(5)));
    }

    #[test]
    fn test_zero_scalars_rejected() {
        let hash = B256::repeat_byte(1);
        assert_eq!(
            recover_address(&hash, &B256::ZERO, &B256::ZERO, 27),
            Err(CryptoError::InvalidSignature)
        );
    }
}
