use crate::crypto::keccak256;
use crate::trie::rlp::{decode_list, Item};
use alloy_primitives::{Bytes, B256};
use thiserror::Error;

/// Errors during Merkle-Patricia trie proof verification.
/// Each variant is specific enough to diagnose exactly what went wrong.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("Empty proof: no trie nodes provided")]
    EmptyProof,

    #[error("Invalid RLP encoding in proof node {index}: {reason}")]
    InvalidRlp { index: usize, reason: String },

    #[error("Proof verification failed at node {index}: computed hash {computed} does not match expected {expected}")]
    RootMismatch {
        index: usize,
        computed: B256,
        expected: B256,
    },

    #[error("Invalid trie node type at depth {depth}: expected branch, extension or leaf, got {node_type}")]
    InvalidNodeType { depth: usize, node_type: String },

    #[error("Proof path incomplete: trie traversal needs node {depth} but the proof ends")]
    IncompleteProof { depth: usize },

    #[error("Proof carries {count} nodes beyond the end of the path")]
    UnusedNodes { count: usize },

    #[error("Value in trie does not match the claimed value")]
    ValueMismatch,
}

/// The reference a parent node holds to its child.
enum NodeRef<'p> {
    Hash(B256),
    /// Nodes shorter than 32 bytes are embedded in their parent.
    Inline(&'p [u8]),
}

/// Core Merkle-Patricia trie proof verification.
///
/// Walks the trie from root to leaf following the proof nodes. Every node
/// referenced by hash must be the next proof node and hash to the reference;
/// embedded nodes are decoded in place.
///
/// `key` is the raw trie key (already hashed for secure tries).
/// Returns `Some(value)` if the key exists, `None` for a proof of
/// non-existence.
pub fn verify_merkle_patricia_proof<'p>(
    expected_root: &B256,
    key: &[u8],
    proof_nodes: &'p [Bytes],
) -> Result<Option<&'p [u8]>, ProofError> {
    if proof_nodes.is_empty() {
        return Err(ProofError::EmptyProof);
    }

    let nibbles = bytes_to_nibbles(key);
    let mut nibble_index: usize = 0;
    let mut nodes = proof_nodes.iter().enumerate();
    let mut next = NodeRef::Hash(*expected_root);
    let mut depth: usize = 0;

    let value = loop {
        let node: &'p [u8] = match next {
            NodeRef::Hash(expected) => {
                let (index, node) = nodes
                    .next()
                    .ok_or(ProofError::IncompleteProof { depth })?;
                let computed = keccak256(node);
                if computed != expected {
                    return Err(ProofError::RootMismatch {
                        index,
                        computed,
                        expected,
                    });
                }
                node.as_ref()
            }
            NodeRef::Inline(node) => node,
        };

        // Empty trie: the root node is the empty string
        if depth == 0 && node == [0x80] {
            break None;
        }

        let items = decode_list(node).map_err(|e| ProofError::InvalidRlp {
            index: depth,
            reason: e.to_string(),
        })?;

        match items.len() {
            17 => {
                // Branch node: 16 children + value
                if nibble_index >= nibbles.len() {
                    break leaf_value(&items[16], depth)?;
                }
                let child = &items[nibbles[nibble_index] as usize];
                nibble_index += 1;
                match child_ref(child, depth)? {
                    Some(r) => next = r,
                    None => break None, // Key not in trie
                }
            }
            2 => {
                // Extension or leaf node
                let path = items[0].bytes().map_err(|e| ProofError::InvalidRlp {
                    index: depth,
                    reason: e.to_string(),
                })?;
                let (prefix_nibbles, is_leaf) = decode_compact_path(path);
                let remaining = &nibbles[nibble_index..];

                if is_leaf {
                    if remaining == prefix_nibbles.as_slice() {
                        break leaf_value(&items[1], depth)?;
                    }
                    // Key doesn't match: proof of non-existence
                    break None;
                }

                if !remaining.starts_with(&prefix_nibbles) {
                    break None; // Path diverges, key not in trie
                }
                nibble_index += prefix_nibbles.len();
                match child_ref(&items[1], depth)? {
                    Some(r) => next = r,
                    None => {
                        return Err(ProofError::InvalidNodeType {
                            depth,
                            node_type: "extension without child".to_string(),
                        })
                    }
                }
            }
            n => {
                return Err(ProofError::InvalidNodeType {
                    depth,
                    node_type: format!("{}-element list", n),
                });
            }
        }
        depth += 1;
    };

    let unused = nodes.count();
    if unused > 0 {
        return Err(ProofError::UnusedNodes { count: unused });
    }
    Ok(value)
}

/// Verify that `key` maps to exactly `expected` (or is absent when `None`).
pub fn verify_trie_value(
    expected_root: &B256,
    key: &[u8],
    proof_nodes: &[Bytes],
    expected: Option<&[u8]>,
) -> Result<(), ProofError> {
    let found = verify_merkle_patricia_proof(expected_root, key, proof_nodes)?;
    if found != expected {
        return Err(ProofError::ValueMismatch);
    }
    Ok(())
}

fn leaf_value<'p>(item: &Item<'p>, depth: usize) -> Result<Option<&'p [u8]>, ProofError> {
    let value = item.bytes().map_err(|e| ProofError::InvalidRlp {
        index: depth,
        reason: e.to_string(),
    })?;
    Ok(if value.is_empty() { None } else { Some(value) })
}

fn child_ref<'p>(item: &Item<'p>, depth: usize) -> Result<Option<NodeRef<'p>>, ProofError> {
    match item {
        Item::Bytes(b) if b.is_empty() => Ok(None),
        Item::Bytes(b) if b.len() == 32 => Ok(Some(NodeRef::Hash(B256::from_slice(b)))),
        Item::Bytes(b) => Err(ProofError::InvalidRlp {
            index: depth,
            reason: format!("child reference of {} bytes", b.len()),
        }),
        Item::List(raw) if raw.len() < 32 => Ok(Some(NodeRef::Inline(raw))),
        Item::List(raw) => Err(ProofError::InvalidRlp {
            index: depth,
            reason: format!("embedded node of {} bytes", raw.len()),
        }),
    }
}

/// Convert bytes to nibbles (4 bits each).
pub(crate) fn bytes_to_nibbles(bytes: &[u8]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(bytes.len() * 2);
    for byte in bytes {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0F);
    }
    nibbles
}

/// Decode compact (hex-prefix) encoding used in trie nodes.
/// Returns (nibbles, is_leaf).
pub(crate) fn decode_compact_path(encoded: &[u8]) -> (Vec<u8>, bool) {
    if encoded.is_empty() {
        return (vec![], false);
    }

    let first_nibble = encoded[0] >> 4;
    let is_leaf = first_nibble >= 2;
    let is_odd = first_nibble % 2 == 1;

    let mut nibbles = Vec::new();

    if is_odd {
        nibbles.push(encoded[0] & 0x0F);
    }

    for &byte in &encoded[1..] {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0F);
    }

    (nibbles, is_leaf)
}

/// Hex-prefix encode a nibble path.
pub(crate) fn encode_compact_path(nibbles: &[u8], is_leaf: bool) -> Vec<u8> {
    let flag = if is_leaf { 2u8 } else { 0u8 };
    let mut out = Vec::with_capacity(nibbles.len() / 2 + 1);
    let rest = if nibbles.len() % 2 == 1 {
        out.push(((flag + 1) << 4) | nibbles[0]);
        &nibbles[1..]
    } else {
        out.push(flag << 4);
        nibbles
    };
    for pair in rest.chunks(2) {
        out.push((pair[0] << 4) | pair[1]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::builder::TrieBuilder;

    #[test]
    fn test_bytes_to_nibbles() {
        let nibbles = bytes_to_nibbles(&[0xAB, 0xCD, 0x00]);
        assert_eq!(nibbles, vec![0xA, 0xB, 0xC, 0xD, 0x0, 0x0]);
    }

    #[test]
    fn test_decode_compact_path_even_extension() {
        // 0x00 prefix: even extension
        let (nibbles, is_leaf) = decode_compact_path(&[0x00, 0xAB, 0xCD]);
        assert!(!is_leaf);
        assert_eq!(nibbles, vec![0xA, 0xB, 0xC, 0xD]);
    }

    #[test]
    fn test_decode_compact_path_odd_extension() {
        // 0x1X prefix: odd extension, first nibble is X
        let (nibbles, is_leaf) = decode_compact_path(&[0x1A, 0xBC]);
        assert!(!is_leaf);
        assert_eq!(nibbles, vec![0xA, 0xB, 0xC]);
    }

    #[test]
    fn test_decode_compact_path_leaf() {
        let (nibbles, is_leaf) = decode_compact_path(&[0x20, 0xAB]);
        assert!(is_leaf);
        assert_eq!(nibbles, vec![0xA, 0xB]);

        let (nibbles, is_leaf) = decode_compact_path(&[0x3A, 0xBC]);
        assert!(is_leaf);
        assert_eq!(nibbles, vec![0xA, 0xB, 0xC]);
    }

    #[test]
    fn test_compact_path_encoding_matches_decoding() {
        for path in [vec![], vec![1], vec![1, 2], vec![0xF, 0, 3]] {
            for leaf in [true, false] {
                let encoded = encode_compact_path(&path, leaf);
                assert_eq!(decode_compact_path(&encoded), (path.clone(), leaf));
            }
        }
    }

    fn sample_trie() -> TrieBuilder {
        let mut trie = TrieBuilder::new();
        for i in 0u64..40 {
            let key = keccak256(&i.to_be_bytes());
            trie.insert(key.as_slice(), vec![i as u8 + 1; 1 + (i as usize % 50)]);
        }
        trie
    }

    #[test]
    fn test_inclusion_proof_verifies() {
        let trie = sample_trie();
        let root = trie.root();
        for i in [0u64, 7, 39] {
            let key = keccak256(&i.to_be_bytes());
            let proof = trie.proof(key.as_slice());
            let value = verify_merkle_patricia_proof(&root, key.as_slice(), &proof).unwrap();
            assert_eq!(value, Some(vec![i as u8 + 1; 1 + (i as usize % 50)].as_slice()));
        }
    }

    #[test]
    fn test_exclusion_proof_verifies() {
        let trie = sample_trie();
        let root = trie.root();
        let missing = keccak256(b"not in the trie");
        let proof = trie.proof(missing.as_slice());
        assert_eq!(
            verify_merkle_patricia_proof(&root, missing.as_slice(), &proof).unwrap(),
            None
        );
    }

    #[test]
    fn test_wrong_root_rejected() {
        let trie = sample_trie();
        let key = keccak256(&3u64.to_be_bytes());
        let proof = trie.proof(key.as_slice());
        let result = verify_merkle_patricia_proof(&B256::repeat_byte(0x11), key.as_slice(), &proof);
        assert!(matches!(result, Err(ProofError::RootMismatch { index: 0, .. })));
    }

    #[test]
    fn test_truncated_proof_rejected() {
        let trie = sample_trie();
        let key = keccak256(&3u64.to_be_bytes());
        let mut proof = trie.proof(key.as_slice());
        proof.pop();
        let result = verify_merkle_patricia_proof(&trie.root(), key.as_slice(), &proof);
        assert!(matches!(result, Err(ProofError::IncompleteProof { .. })));
    }

    #[test]
    fn test_extra_nodes_rejected() {
        let trie = sample_trie();
        let key = keccak256(&3u64.to_be_bytes());
        let mut proof = trie.proof(key.as_slice());
        proof.push(proof[0].clone());
        let result = verify_merkle_patricia_proof(&trie.root(), key.as_slice(), &proof);
        assert_eq!(result, Err(ProofError::UnusedNodes { count: 1 }));
    }

    #[test]
    fn test_empty_trie_exclusion() {
        let proof = vec![Bytes::from_static(&[0x80])];
        let root = crate::trie::EMPTY_ROOT;
        assert_eq!(verify_merkle_patricia_proof(&root, &[0x01], &proof).unwrap(), None);
    }

    #[test]
    fn test_empty_proof_rejected() {
        let result = verify_merkle_patricia_proof(&B256::ZERO, &[0x80], &[]);
        assert_eq!(result, Err(ProofError::EmptyProof));
    }

    #[test]
    fn test_value_mismatch_detected() {
        let trie = sample_trie();
        let key = keccak256(&5u64.to_be_bytes());
        let proof = trie.proof(key.as_slice());
        let result = verify_trie_value(&trie.root(), key.as_slice(), &proof, Some(&[0xFF]));
        assert_eq!(result, Err(ProofError::ValueMismatch));
    }
}
