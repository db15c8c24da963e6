use crate::crypto::keccak256;
use crate::trie::rlp::{decode_list, encode_list, Item, Raw, RlpError};
use alloy_primitives::{Address, Bloom, Bytes, B256, B64, U256};
use alloy_rlp::Encodable;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Invalid header RLP: {0}")]
    Rlp(#[from] RlpError),

    #[error("Header has {got} fields, expected at least 15")]
    TooFewFields { got: usize },

    #[error("Header {number} does not chain: expected hash {expected}, got {found}")]
    BrokenChain {
        number: u64,
        expected: B256,
        found: B256,
    },

    #[error("Header number {found} does not follow {expected}")]
    NumberGap { expected: u64, found: u64 },

    #[error("Header field {field} is set but {requires} is not")]
    MissingPredecessor {
        field: &'static str,
        requires: &'static str,
    },
}

/// The decoded fields of an Ethereum block header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderFields {
    pub parent_hash: B256,
    pub ommers_hash: B256,
    pub beneficiary: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub mix_hash: B256,
    pub nonce: B64,
    /// London and later.
    pub base_fee_per_gas: Option<U256>,
    /// Shanghai and later.
    pub withdrawals_root: Option<B256>,
    /// Fields added by later forks, kept as raw RLP items.
    pub extensions: Vec<Bytes>,
}

/// A block header together with its exact encoding.
///
/// `hash == keccak256(raw)` holds by construction: a header can only be
/// built by decoding raw bytes or by encoding a set of fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Bytes", into = "Bytes")]
pub struct BlockHeader {
    fields: HeaderFields,
    raw: Bytes,
    hash: B256,
}

impl BlockHeader {
    /// Decode a header from its RLP encoding.
    pub fn decode(raw: &[u8]) -> Result<Self, HeaderError> {
        let items = decode_list(raw)?;
        if items.len() < 15 {
            return Err(HeaderError::TooFewFields { got: items.len() });
        }

        let nonce = items[14].bytes()?;
        if nonce.len() != 8 {
            return Err(RlpError::InvalidLength { what: "nonce", len: nonce.len() }.into());
        }

        let fields = HeaderFields {
            parent_hash: items[0].as_b256()?,
            ommers_hash: items[1].as_b256()?,
            beneficiary: items[2].as_address()?,
            state_root: items[3].as_b256()?,
            transactions_root: items[4].as_b256()?,
            receipts_root: items[5].as_b256()?,
            logs_bloom: items[6].as_bloom()?,
            difficulty: items[7].as_u256()?,
            number: items[8].as_u64()?,
            gas_limit: items[9].as_u64()?,
            gas_used: items[10].as_u64()?,
            timestamp: items[11].as_u64()?,
            extra_data: Bytes::copy_from_slice(items[12].bytes()?),
            mix_hash: items[13].as_b256()?,
            nonce: B64::from_slice(nonce),
            base_fee_per_gas: items.get(15).map(|i| i.as_u256()).transpose()?,
            withdrawals_root: items.get(16).map(|i| i.as_b256()).transpose()?,
            extensions: items.iter().skip(17).map(raw_item).collect(),
        };

        Ok(Self {
            fields,
            raw: Bytes::copy_from_slice(raw),
            hash: keccak256(raw),
        })
    }

    /// Encode a set of fields into a header. Fork fields are positional, so
    /// each one needs every fork field before it.
    pub fn from_fields(fields: HeaderFields) -> Result<Self, HeaderError> {
        let f = &fields;
        if f.base_fee_per_gas.is_none() && f.withdrawals_root.is_some() {
            return Err(HeaderError::MissingPredecessor {
                field: "withdrawals_root",
                requires: "base_fee_per_gas",
            });
        }
        if f.withdrawals_root.is_none() && !f.extensions.is_empty() {
            return Err(HeaderError::MissingPredecessor {
                field: "extensions",
                requires: "withdrawals_root",
            });
        }
        let extensions: Vec<Raw<'_>> = f.extensions.iter().map(|e| Raw(e)).collect();
        let mut items: Vec<&dyn Encodable> = Vec::with_capacity(15 + 2 + extensions.len());
        items.extend_from_slice(&[
            &f.parent_hash,
            &f.ommers_hash,
            &f.beneficiary,
            &f.state_root,
            &f.transactions_root,
            &f.receipts_root,
            &f.logs_bloom,
            &f.difficulty,
            &f.number,
            &f.gas_limit,
            &f.gas_used,
            &f.timestamp,
            &f.extra_data,
            &f.mix_hash,
            &f.nonce,
        ]);
        if let Some(base_fee) = &f.base_fee_per_gas {
            items.push(base_fee);
        }
        if let Some(root) = &f.withdrawals_root {
            items.push(root);
        }
        items.extend(extensions.iter().map(|e| e as &dyn Encodable));
        let raw = encode_list(&items);
        let hash = keccak256(&raw);
        Ok(Self {
            fields,
            raw: raw.into(),
            hash,
        })
    }

    pub fn fields(&self) -> &HeaderFields {
        &self.fields
    }

    pub fn hash(&self) -> B256 {
        self.hash
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn number(&self) -> u64 {
        self.fields.number
    }

    pub fn parent_hash(&self) -> B256 {
        self.fields.parent_hash
    }

    pub fn state_root(&self) -> B256 {
        self.fields.state_root
    }

    pub fn transactions_root(&self) -> B256 {
        self.fields.transactions_root
    }

    pub fn receipts_root(&self) -> B256 {
        self.fields.receipts_root
    }

    pub fn timestamp(&self) -> u64 {
        self.fields.timestamp
    }
}

impl TryFrom<Bytes> for BlockHeader {
    type Error = HeaderError;

    fn try_from(raw: Bytes) -> Result<Self, Self::Error> {
        Self::decode(&raw)
    }
}

impl From<BlockHeader> for Bytes {
    fn from(header: BlockHeader) -> Self {
        header.raw
    }
}

/// Check that `path` links back from `head` by parent hash, one block at a
/// time. `path[0]` is the parent of `head`. Returns the oldest header.
pub fn verify_ancestry<'h>(
    head: &'h BlockHeader,
    path: &'h [BlockHeader],
) -> Result<&'h BlockHeader, HeaderError> {
    let mut child = head;
    for parent in path {
        if parent.hash() != child.parent_hash() {
            return Err(HeaderError::BrokenChain {
                number: parent.number(),
                expected: child.parent_hash(),
                found: parent.hash(),
            });
        }
        let expected = child.number().saturating_sub(1);
        if parent.number() != expected || child.number() == 0 {
            return Err(HeaderError::NumberGap {
                expected,
                found: parent.number(),
            });
        }
        child = parent;
    }
    Ok(child)
}

fn raw_item(item: &Item<'_>) -> Bytes {
    match item {
        Item::Bytes(b) => alloy_rlp::encode(*b).into(),
        Item::List(raw) => Bytes::copy_from_slice(raw),
    }
}
