use crate::crypto::{keccak256, recover_address, CryptoError};
use crate::trie::rlp::{decode_list, encode_list, reencode, Item, Raw, RlpError};
use alloy_primitives::{Address, Bloom, Bytes, B256, U256};
use alloy_rlp::Encodable;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error(transparent)]
    Rlp(#[from] RlpError),

    #[error("{what} should have {expected} items, got {got}")]
    FieldCount {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Unsupported transaction type {0:#x}")]
    UnsupportedType(u8),

    #[error("Invalid transaction signature: {0}")]
    Signature(#[from] CryptoError),
}

/// An Ethereum account as stored in the state trie.
/// Verified via Merkle-Patricia trie proofs against a known state root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountState {
    /// Number of transactions sent from this account.
    pub nonce: u64,
    /// Balance in wei.
    pub balance: U256,
    /// Root hash of the account's storage trie.
    /// For externally owned accounts (EOAs), this is the empty trie root.
    pub storage_hash: B256,
    /// Keccak256 hash of the account's code.
    /// For EOAs, this is the hash of the empty string.
    pub code_hash: B256,
}

impl AccountState {
    /// The keccak256 hash of empty bytes, the code hash for EOAs.
    pub const EMPTY_CODE_HASH: B256 = B256::new([
        0xc5, 0xd2, 0x46, 0x01, 0x86, 0xf7, 0x23, 0x3c, 0x92, 0x7e, 0x7d, 0xb2, 0xdc, 0xc7,
        0x03, 0xc0, 0xe5, 0x00, 0xb6, 0x53, 0xca, 0x82, 0x27, 0x3b, 0x7b, 0xfa, 0xd8, 0x04,
        0x5d, 0x85, 0xa4, 0x70,
    ]);

    /// The root of an empty Merkle-Patricia trie.
    pub const EMPTY_STORAGE_ROOT: B256 = crate::trie::EMPTY_ROOT;

    /// The state of an address that has never been touched.
    pub fn empty() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            storage_hash: Self::EMPTY_STORAGE_ROOT,
            code_hash: Self::EMPTY_CODE_HASH,
        }
    }

    /// Check if this is a contract account (has code deployed).
    pub fn is_contract(&self) -> bool {
        self.code_hash != Self::EMPTY_CODE_HASH
    }

    /// Check if this account has a non-empty storage trie.
    pub fn has_storage(&self) -> bool {
        self.storage_hash != Self::EMPTY_STORAGE_ROOT
    }

    /// The state trie leaf value: `rlp([nonce, balance, storageHash, codeHash])`.
    pub fn rlp_encode(&self) -> Vec<u8> {
        encode_list(&[&self.nonce, &self.balance, &self.storage_hash, &self.code_hash])
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let items = decode_list(raw)?;
        expect_fields("account", &items, 4)?;
        Ok(Self {
            nonce: items[0].as_u64()?,
            balance: items[1].as_u256()?,
            storage_hash: items[2].as_b256()?,
            code_hash: items[3].as_b256()?,
        })
    }
}

/// A log entry emitted by a smart contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Address of the contract that emitted the log.
    pub address: Address,
    /// Indexed topics (up to 4, first is usually the event signature hash).
    pub topics: Vec<B256>,
    /// Non-indexed data.
    pub data: Bytes,
}

impl Log {
    fn rlp_encode(&self) -> Vec<u8> {
        let topics: Vec<&dyn Encodable> = self.topics.iter().map(|t| t as &dyn Encodable).collect();
        let topics = encode_list(&topics);
        encode_list(&[&self.address, &Raw(&topics), &self.data])
    }

    fn decode(item: &Item<'_>) -> Result<Self, DecodeError> {
        let fields = item.list()?;
        expect_fields("log", &fields, 3)?;
        let topics = fields[1]
            .list()?
            .iter()
            .map(|t| t.as_b256())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            address: fields[0].as_address()?,
            topics,
            data: Bytes::copy_from_slice(fields[2].bytes()?),
        })
    }
}

/// A transaction receipt as stored in the receipts trie.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    /// EIP-2718 type, 0 for legacy receipts.
    pub tx_type: u8,
    /// Whether the transaction succeeded (1) or failed (0).
    pub status: u8,
    /// Cumulative gas used in the block up to and including this transaction.
    pub cumulative_gas_used: u64,
    /// Bloom filter for quick log searching.
    pub logs_bloom: Bloom,
    /// The logs emitted by this transaction.
    pub logs: Vec<Log>,
}

impl TransactionReceipt {
    /// Decode a transaction receipt from its trie value.
    /// Post-EIP-2718, receipts may be typed (prefixed with a type byte).
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let (tx_type, rlp_data) = match data.first() {
            Some(&t) if t <= 0x7F => (t, &data[1..]),
            _ => (0, data),
        };

        let items = decode_list(rlp_data)?;
        expect_fields("receipt", &items, 4)?;

        let logs = items[3]
            .list()?
            .iter()
            .map(Log::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            tx_type,
            status: items[0].as_u64()? as u8,
            cumulative_gas_used: items[1].as_u64()?,
            logs_bloom: items[2].as_bloom()?,
            logs,
        })
    }

    pub fn rlp_encode(&self) -> Vec<u8> {
        let logs: Vec<Vec<u8>> = self.logs.iter().map(Log::rlp_encode).collect();
        let logs: Vec<Raw<'_>> = logs.iter().map(|l| Raw(l)).collect();
        let logs: Vec<&dyn Encodable> = logs.iter().map(|l| l as &dyn Encodable).collect();
        let logs = encode_list(&logs);
        let status = self.status as u64;
        let body = encode_list(&[
            &status,
            &self.cumulative_gas_used,
            &self.logs_bloom,
            &Raw(&logs),
        ]);
        if self.tx_type == 0 {
            body
        } else {
            let mut out = Vec::with_capacity(body.len() + 1);
            out.push(self.tx_type);
            out.extend_from_slice(&body);
            out
        }
    }
}

/// A signed transaction decoded from its canonical encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx_type: u8,
    pub hash: B256,
    pub chain_id: Option<u64>,
    pub nonce: u64,
    /// Legacy and EIP-2930 transactions.
    pub gas_price: Option<U256>,
    /// EIP-1559 transactions.
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub gas: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub v: u64,
    pub r: B256,
    pub s: B256,
    /// Recovered from the signature.
    pub from: Address,
    pub raw: Bytes,
}

impl SignedTransaction {
    /// Decode legacy, EIP-2930 and EIP-1559 transactions and recover the sender.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let first = *raw.first().ok_or(RlpError::Empty)?;
        if first >= 0xC0 {
            return Self::decode_legacy(raw);
        }
        match first {
            1 | 2 => Self::decode_typed(first, raw),
            t => Err(DecodeError::UnsupportedType(t)),
        }
    }

    fn decode_legacy(raw: &[u8]) -> Result<Self, DecodeError> {
        let items = decode_list(raw)?;
        expect_fields("legacy transaction", &items, 9)?;

        let v = items[6].as_u64()?;
        let chain_id = if v >= 35 { Some((v - 35) / 2) } else { None };

        // EIP-155 appends (chainId, 0, 0) to the signed fields
        let chain_id_bytes = chain_id.unwrap_or_default().to_be_bytes();
        let mut unsigned: Vec<Item<'_>> = items[..6].to_vec();
        if chain_id.is_some() {
            let start = chain_id_bytes.iter().position(|b| *b != 0).unwrap_or(8);
            unsigned.push(Item::Bytes(&chain_id_bytes[start..]));
            unsigned.push(Item::Bytes(&[]));
            unsigned.push(Item::Bytes(&[]));
        }
        let sighash = keccak256(reencode(&unsigned));

        let r = items[7].as_b256_padded()?;
        let s = items[8].as_b256_padded()?;
        let from = recover_address(&sighash, &r, &s, v)?;

        Ok(Self {
            tx_type: 0,
            hash: keccak256(raw),
            chain_id,
            nonce: items[0].as_u64()?,
            gas_price: Some(items[1].as_u256()?),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            gas: items[2].as_u64()?,
            to: items[3].as_opt_address()?,
            value: items[4].as_u256()?,
            input: Bytes::copy_from_slice(items[5].bytes()?),
            v,
            r,
            s,
            from,
            raw: Bytes::copy_from_slice(raw),
        })
    }

    fn decode_typed(tx_type: u8, raw: &[u8]) -> Result<Self, DecodeError> {
        let items = decode_list(&raw[1..])?;
        let expected = if tx_type == 1 { 11 } else { 12 };
        expect_fields("typed transaction", &items, expected)?;

        let mut sig_input = vec![tx_type];
        sig_input.extend_from_slice(&reencode(&items[..expected - 3]));
        let sighash = keccak256(&sig_input);

        let v = items[expected - 3].as_u64()?;
        let r = items[expected - 2].as_b256_padded()?;
        let s = items[expected - 1].as_b256_padded()?;
        let from = recover_address(&sighash, &r, &s, v)?;

        // EIP-1559 inserts the two fee fields where EIP-2930 has gasPrice
        let (gas_price, max_priority, max_fee, rest) = if tx_type == 1 {
            (Some(items[2].as_u256()?), None, None, 3)
        } else {
            (
                None,
                Some(items[2].as_u256()?),
                Some(items[3].as_u256()?),
                4,
            )
        };

        Ok(Self {
            tx_type,
            hash: keccak256(raw),
            chain_id: Some(items[0].as_u64()?),
            nonce: items[1].as_u64()?,
            gas_price,
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: max_priority,
            gas: items[rest].as_u64()?,
            to: items[rest + 1].as_opt_address()?,
            value: items[rest + 2].as_u256()?,
            input: Bytes::copy_from_slice(items[rest + 3].bytes()?),
            v,
            r,
            s,
            from,
            raw: Bytes::copy_from_slice(raw),
        })
    }
}

fn expect_fields(what: &'static str, items: &[Item<'_>], expected: usize) -> Result<(), DecodeError> {
    if items.len() != expected {
        return Err(DecodeError::FieldCount {
            what,
            expected,
            got: items.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestKey, TxTemplate};

    #[test]
    fn test_empty_account_constants() {
        assert_eq!(keccak256(b""), AccountState::EMPTY_CODE_HASH);
        let empty = AccountState::empty();
        assert!(!empty.is_contract());
        assert!(!empty.has_storage());
    }

    #[test]
    fn test_account_encoding_decodes() {
        let account = AccountState {
            nonce: 3,
            balance: U256::from(10u64).pow(U256::from(18)),
            storage_hash: B256::repeat_byte(1),
            code_hash: B256::repeat_byte(2),
        };
        assert_eq!(AccountState::decode(&account.rlp_encode()).unwrap(), account);
    }

    #[test]
    fn test_typed_receipt_decoding() {
        let receipt = TransactionReceipt {
            tx_type: 2,
            status: 1,
            cumulative_gas_used: 21_000,
            logs_bloom: Bloom::ZERO,
            logs: vec![Log {
                address: Address::repeat_byte(0xAA),
                topics: vec![B256::repeat_byte(1), B256::repeat_byte(2)],
                data: Bytes::from_static(b"data"),
            }],
        };
        let encoded = receipt.rlp_encode();
        assert_eq!(encoded[0], 2);
        assert_eq!(TransactionReceipt::decode(&encoded).unwrap(), receipt);
    }

    #[test]
    fn test_receipt_wrong_field_count() {
        let raw = encode_list(&[&1u64, &2u64]);
        assert!(matches!(
            TransactionReceipt::decode(&raw),
            Err(DecodeError::FieldCount { what: "receipt", got: 2, .. })
        ));
    }

    #[test]
    fn test_legacy_transaction_sender_recovered() {
        let key = TestKey::new(5);
        let raw = TxTemplate::legacy(7, Some(Address::repeat_byte(9))).sign(&key, Some(1));
        let tx = SignedTransaction::decode(&raw).unwrap();
        assert_eq!(tx.from, key.address());
        assert_eq!(tx.chain_id, Some(1));
        assert_eq!(tx.nonce, 7);
        assert_eq!(tx.hash, keccak256(&raw));
    }

    #[test]
    fn test_pre_eip155_transaction() {
        let key = TestKey::new(6);
        let raw = TxTemplate::legacy(0, None).sign(&key, None);
        let tx = SignedTransaction::decode(&raw).unwrap();
        assert_eq!(tx.from, key.address());
        assert_eq!(tx.chain_id, None);
        assert_eq!(tx.to, None);
    }

    #[test]
    fn test_eip1559_transaction_sender_recovered() {
        let key = TestKey::new(8);
        let raw = TxTemplate::eip1559(1, Address::repeat_byte(3)).sign(&key, Some(5));
        let tx = SignedTransaction::decode(&raw).unwrap();
        assert_eq!(tx.tx_type, 2);
        assert_eq!(tx.from, key.address());
        assert_eq!(tx.chain_id, Some(5));
        assert!(tx.gas_price.is_none());
        assert!(tx.max_fee_per_gas.is_some());
    }

    #[test]
    fn test_unsupported_type() {
        assert_eq!(
            SignedTransaction::decode(&[0x03, 0xC0]),
            Err(DecodeError::UnsupportedType(3))
        );
    }
}
