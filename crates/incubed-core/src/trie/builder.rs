//! In-memory Merkle-Patricia trie construction.
//!
//! Used to recompute ordered transaction roots for block proofs, and by
//! fixtures to produce real roots and proofs.

use crate::crypto::keccak256;
use crate::trie::proof::{bytes_to_nibbles, encode_compact_path};
use crate::trie::rlp::{encode_list, Raw};
use alloy_primitives::{Bytes, B256};
use alloy_rlp::Encodable;
use std::collections::BTreeMap;

/// Root of a trie with no entries: `keccak256(rlp(""))`.
pub const EMPTY_ROOT: B256 = B256::new([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8,
    0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63,
    0xb4, 0x21,
]);

#[derive(Debug, Default, Clone)]
pub struct TrieBuilder {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl TrieBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value. Empty values are treated as deletion.
    pub fn insert(&mut self, key: &[u8], value: impl Into<Vec<u8>>) {
        let value = value.into();
        let nibbles = bytes_to_nibbles(key);
        if value.is_empty() {
            self.entries.remove(&nibbles);
        } else {
            self.entries.insert(nibbles, value);
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(&bytes_to_nibbles(key)).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn root(&self) -> B256 {
        let entries = self.sorted();
        keccak256(&encode_node(&entries, 0, None, &mut Vec::new()))
    }

    /// Nodes from the root along the path of `key`, for inclusion and
    /// exclusion proofs alike. Embedded nodes stay inside their parent.
    pub fn proof(&self, key: &[u8]) -> Vec<Bytes> {
        let entries = self.sorted();
        let path = bytes_to_nibbles(key);
        let mut proof = Vec::new();
        let root = encode_node(&entries, 0, Some(&path), &mut proof);
        // Children are collected before their parent; the root is always hashed.
        if root.len() < 32 {
            proof.push(Bytes::from(root));
        }
        proof.reverse();
        proof
    }

    fn sorted(&self) -> Vec<(&[u8], &[u8])> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect()
    }
}

/// Root of the trie keyed by `rlp(index)`, as used for block transactions
/// and receipts.
pub fn ordered_trie_root<T: AsRef<[u8]>>(items: &[T]) -> B256 {
    let mut trie = TrieBuilder::new();
    for (index, item) in items.iter().enumerate() {
        trie.insert(&alloy_rlp::encode(index as u64), item.as_ref());
    }
    trie.root()
}

/// Encode the node covering `entries` (sorted, sharing the first `depth`
/// nibbles). When `path` is given, hashed nodes on that path are appended to
/// `proof` bottom-up.
fn encode_node(
    entries: &[(&[u8], &[u8])],
    depth: usize,
    path: Option<&[u8]>,
    proof: &mut Vec<Bytes>,
) -> Vec<u8> {
    let node = match entries {
        [] => alloy_rlp::encode(&b""[..]),
        [(key, value)] => {
            let compact = encode_compact_path(&key[depth..], true);
            encode_list(&[&compact.as_slice(), value])
        }
        _ => {
            let prefix = common_prefix(entries, depth);
            if prefix > 0 {
                let child_path = path.filter(|p| {
                    p.len() >= depth + prefix && p[depth..depth + prefix] == entries[0].0[depth..depth + prefix]
                });
                let child = encode_node(entries, depth + prefix, child_path, proof);
                let compact = encode_compact_path(&entries[0].0[depth..depth + prefix], false);
                let child = child_reference(child);
                encode_list(&[&compact.as_slice(), &Raw(&child)])
            } else {
                encode_branch(entries, depth, path, proof)
            }
        }
    };
    if path.is_some() && node.len() >= 32 {
        proof.push(Bytes::from(node.clone()));
    }
    node
}

fn encode_branch(
    entries: &[(&[u8], &[u8])],
    depth: usize,
    path: Option<&[u8]>,
    proof: &mut Vec<Bytes>,
) -> Vec<u8> {
    let mut children: Vec<Vec<u8>> = Vec::with_capacity(17);
    let mut value: &[u8] = &[];
    let mut rest = entries;
    if let Some(((key, v), tail)) = rest.split_first() {
        if key.len() == depth {
            value = v;
            rest = tail;
        }
    }
    for nibble in 0u8..16 {
        let end = rest
            .iter()
            .position(|(key, _)| key[depth] != nibble)
            .unwrap_or(rest.len());
        let (group, tail) = rest.split_at(end);
        rest = tail;
        if group.is_empty() {
            children.push(alloy_rlp::encode(&b""[..]));
            continue;
        }
        let child_path = path.filter(|p| p.len() > depth && p[depth] == nibble);
        let child = encode_node(group, depth + 1, child_path, proof);
        children.push(child_reference(child));
    }
    children.push(alloy_rlp::encode(value));
    let parts: Vec<Raw<'_>> = children.iter().map(|c| Raw(c)).collect();
    let refs: Vec<&dyn Encodable> = parts.iter().map(|r| r as &dyn Encodable).collect();
    encode_list(&refs)
}

/// How a parent refers to a child: embedded when shorter than a hash.
fn child_reference(encoded: Vec<u8>) -> Vec<u8> {
    if encoded.len() < 32 {
        encoded
    } else {
        alloy_rlp::encode(keccak256(&encoded))
    }
}

fn common_prefix(entries: &[(&[u8], &[u8])], depth: usize) -> usize {
    let first = &entries[0].0[depth..];
    let last = &entries[entries.len() - 1].0[depth..];
    first.iter().zip(last).take_while(|(a, b)| a == b).count()
}
