//! Minimal RLP decoding for trie nodes, headers, transactions and receipts.
//!
//! Decoding is hand-rolled so nested lists can be kept in their encoded form
//! (embedded trie nodes and access lists are re-hashed or re-emitted
//! verbatim). Encoding goes through `alloy-rlp`.

use alloy_primitives::{Address, Bloom, B256, U256};
use alloy_rlp::{BufMut, Encodable, Header};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RlpError {
    #[error("Empty RLP data")]
    Empty,

    #[error("{0}: insufficient data")]
    Truncated(&'static str),

    #[error("Expected list, got string")]
    ExpectedList,

    #[error("Expected string, got list")]
    ExpectedString,

    #[error("{0} trailing bytes after RLP item")]
    Trailing(usize),

    #[error("Invalid {what} length: {len} bytes")]
    InvalidLength { what: &'static str, len: usize },
}

/// One decoded RLP item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Item<'a> {
    /// A string item: the payload without its prefix.
    Bytes(&'a [u8]),
    /// A list item, kept in its full encoded form (prefix included).
    List(&'a [u8]),
}

impl<'a> Item<'a> {
    pub fn bytes(&self) -> Result<&'a [u8], RlpError> {
        match self {
            Item::Bytes(b) => Ok(b),
            Item::List(_) => Err(RlpError::ExpectedString),
        }
    }

    /// Decode the nested list this item holds.
    pub fn list(&self) -> Result<Vec<Item<'a>>, RlpError> {
        match self {
            Item::List(raw) => decode_list(raw),
            Item::Bytes(_) => Err(RlpError::ExpectedList),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Item::Bytes(b) if b.is_empty())
    }

    pub fn as_u64(&self) -> Result<u64, RlpError> {
        let b = self.bytes()?;
        if b.len() > 8 {
            return Err(RlpError::InvalidLength { what: "u64", len: b.len() });
        }
        Ok(b.iter().fold(0u64, |acc, &byte| (acc << 8) | byte as u64))
    }

    pub fn as_u256(&self) -> Result<U256, RlpError> {
        let b = self.bytes()?;
        if b.len() > 32 {
            return Err(RlpError::InvalidLength { what: "u256", len: b.len() });
        }
        Ok(U256::from_be_slice(b))
    }

    pub fn as_b256(&self) -> Result<B256, RlpError> {
        let b = self.bytes()?;
        if b.len() != 32 {
            return Err(RlpError::InvalidLength { what: "bytes32", len: b.len() });
        }
        Ok(B256::from_slice(b))
    }

    /// A scalar that may have had its leading zeros stripped (signature r/s).
    pub fn as_b256_padded(&self) -> Result<B256, RlpError> {
        let b = self.bytes()?;
        if b.len() > 32 {
            return Err(RlpError::InvalidLength { what: "scalar", len: b.len() });
        }
        let mut out = [0u8; 32];
        out[32 - b.len()..].copy_from_slice(b);
        Ok(B256::from(out))
    }

    pub fn as_address(&self) -> Result<Address, RlpError> {
        let b = self.bytes()?;
        if b.len() != 20 {
            return Err(RlpError::InvalidLength { what: "address", len: b.len() });
        }
        Ok(Address::from_slice(b))
    }

    /// Empty string decodes to `None` (contract creation `to`).
    pub fn as_opt_address(&self) -> Result<Option<Address>, RlpError> {
        if self.is_empty() {
            return Ok(None);
        }
        self.as_address().map(Some)
    }

    pub fn as_bloom(&self) -> Result<Bloom, RlpError> {
        let b = self.bytes()?;
        let bloom: [u8; 256] = b
            .try_into()
            .map_err(|_| RlpError::InvalidLength { what: "bloom", len: b.len() })?;
        Ok(Bloom::from(bloom))
    }
}

/// Decode an RLP list into its items. The whole input must be one list.
pub fn decode_list(data: &[u8]) -> Result<Vec<Item<'_>>, RlpError> {
    let (item, consumed) = decode_item(data)?;
    if consumed != data.len() {
        return Err(RlpError::Trailing(data.len() - consumed));
    }
    let raw = match item {
        Item::List(raw) => raw,
        Item::Bytes(_) => return Err(RlpError::ExpectedList),
    };

    let payload = &raw[list_header_len(raw)..];
    let mut items = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let (item, consumed) = decode_item(&payload[offset..])?;
        items.push(item);
        offset += consumed;
    }
    Ok(items)
}

/// Decode a whole input that must be a single string item.
pub fn decode_bytes(data: &[u8]) -> Result<&[u8], RlpError> {
    let (item, consumed) = decode_item(data)?;
    if consumed != data.len() {
        return Err(RlpError::Trailing(data.len() - consumed));
    }
    item.bytes()
}

/// Decode a single RLP item, returning it and how many bytes were consumed.
pub fn decode_item(data: &[u8]) -> Result<(Item<'_>, usize), RlpError> {
    let prefix = *data.first().ok_or(RlpError::Empty)?;

    if prefix <= 0x7F {
        // Single byte
        Ok((Item::Bytes(&data[..1]), 1))
    } else if prefix <= 0xB7 {
        // Short string (0-55 bytes)
        let length = (prefix - 0x80) as usize;
        if data.len() < 1 + length {
            return Err(RlpError::Truncated("short string"));
        }
        Ok((Item::Bytes(&data[1..1 + length]), 1 + length))
    } else if prefix <= 0xBF {
        // Long string (>55 bytes)
        let len_bytes = (prefix - 0xB7) as usize;
        let length = read_length(data, len_bytes, "long string")?;
        let total = 1 + len_bytes + length;
        if data.len() < total {
            return Err(RlpError::Truncated("long string"));
        }
        Ok((Item::Bytes(&data[1 + len_bytes..total]), total))
    } else if prefix <= 0xF7 {
        // Short list
        let total = 1 + (prefix - 0xC0) as usize;
        if data.len() < total {
            return Err(RlpError::Truncated("short list"));
        }
        Ok((Item::List(&data[..total]), total))
    } else {
        // Long list
        let len_bytes = (prefix - 0xF7) as usize;
        let length = read_length(data, len_bytes, "long list")?;
        let total = 1 + len_bytes + length;
        if data.len() < total {
            return Err(RlpError::Truncated("long list"));
        }
        Ok((Item::List(&data[..total]), total))
    }
}

fn read_length(data: &[u8], len_bytes: usize, what: &'static str) -> Result<usize, RlpError> {
    if len_bytes > std::mem::size_of::<usize>() {
        return Err(RlpError::InvalidLength { what, len: len_bytes });
    }
    if data.len() < 1 + len_bytes {
        return Err(RlpError::Truncated(what));
    }
    Ok(data[1..1 + len_bytes]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize))
}

fn list_header_len(raw: &[u8]) -> usize {
    match raw[0] {
        p if p <= 0xF7 => 1,
        p => 1 + (p - 0xF7) as usize,
    }
}

/// Pre-encoded RLP, emitted as-is.
pub struct Raw<'a>(pub &'a [u8]);

impl Encodable for Raw<'_> {
    fn encode(&self, out: &mut dyn BufMut) {
        out.put_slice(self.0);
    }

    fn length(&self) -> usize {
        self.0.len()
    }
}

/// Encode a list out of heterogeneous encodable items.
pub fn encode_list(items: &[&dyn Encodable]) -> Vec<u8> {
    let payload_length: usize = items.iter().map(|item| item.length()).sum();
    let mut out = Vec::with_capacity(payload_length + 9);
    Header { list: true, payload_length }.encode(&mut out);
    for item in items {
        item.encode(&mut out);
    }
    out
}

/// Re-encode already decoded items (lists are re-emitted verbatim).
pub fn reencode(items: &[Item<'_>]) -> Vec<u8> {
    let raws: Vec<Vec<u8>> = items
        .iter()
        .map(|item| match item {
            Item::Bytes(b) => alloy_rlp::encode(*b),
            Item::List(raw) => raw.to_vec(),
        })
        .collect();
    let parts: Vec<Raw<'_>> = raws.iter().map(|r| Raw(r)).collect();
    let refs: Vec<&dyn Encodable> = parts.iter().map(|r| r as &dyn Encodable).collect();
    encode_list(&refs)
}
