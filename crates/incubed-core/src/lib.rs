//! # Incubed Core
//!
//! Pure Rust verification of Incubed node responses.
//!
//! This crate contains **no networking code** and **no chain access**. Every
//! value a client accepts from a remote node passes through [`verify::verify`]
//! first.
//!
//! ## Trust Model
//!
//! - **Merkle proofs** (`trie` module): account, storage, transaction and
//!   receipt values are proven against the roots in a block header. Zero trust
//!   assumptions beyond the header itself.
//!
//! - **Header trust** (`verify` module): the header is trusted because it
//!   matches a locally known hash, header or ancestry, or because enough
//!   registered nodes signed its hash. Signers put their deposit at stake for
//!   every signature, so a signature over a wrong hash is returned as
//!   [`verify::Misbehavior`] evidence rather than silently dropped.
//!
//! ## Usage
//!
//! ```ignore
//! use incubed_core::verify::{verify, SignerRequirement, TrustAnchor};
//! let verified = verify(&query, &response, &proof, &TrustAnchor::Hash(hash), None)?;
//! ```

pub mod crypto;
pub mod trie;
pub mod types;
pub mod verify;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types for convenience
pub use crypto::{keccak256, recover_address, CryptoError, LocalSigner};
pub use trie::{verify_merkle_patricia_proof, ProofError};
pub use types::{BlockHeader, Proof, Query, ResponseValue, Signature};
pub use verify::{
    verify, Misbehavior, SignerRequirement, TrustAnchor, TrustedSigners, Verified,
    VerificationError,
};
