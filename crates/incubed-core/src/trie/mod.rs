//! Merkle-Patricia trie primitives: RLP decoding, proof walking and an
//! in-memory builder for recomputing roots.

pub mod builder;
pub mod proof;
pub mod rlp;

pub use builder::{ordered_trie_root, TrieBuilder, EMPTY_ROOT};
pub use proof::{verify_merkle_patricia_proof, verify_trie_value, ProofError};
pub use rlp::RlpError;
