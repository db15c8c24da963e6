use crate::crypto::{block_sign_hash, recover_address, CryptoError};
use crate::types::execution::AccountState;
use crate::types::header::BlockHeader;
use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node's attestation that block `block` has hash `block_hash`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    /// The claimed signer.
    pub address: Address,
    pub block: u64,
    pub block_hash: B256,
    pub r: B256,
    pub s: B256,
    pub v: u8,
}

impl Signature {
    /// The signed message, always recomputed from the claimed block and hash.
    pub fn message_hash(&self) -> B256 {
        block_sign_hash(&self.block_hash, self.block)
    }

    pub fn recover(&self) -> Result<Address, CryptoError> {
        recover_address(&self.message_hash(), &self.r, &self.s, self.v as u64)
    }
}

/// A storage slot proof, nested under its account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    /// The slot, unhashed.
    pub key: B256,
    pub value: U256,
    pub proof: Vec<Bytes>,
}

/// An account proof with the storage slots it vouches for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEntry {
    /// The account fields as the node reports them.
    pub account: AccountState,
    /// State trie nodes along `keccak256(address)`.
    pub account_proof: Vec<Bytes>,
    #[serde(default)]
    pub storage_proof: Vec<StorageEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProof {
    pub block: BlockHeader,
    pub accounts: BTreeMap<Address, AccountEntry>,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionProof {
    pub block: BlockHeader,
    pub tx_index: u64,
    /// Transactions trie nodes along `rlp(txIndex)`.
    pub merkle_proof: Vec<Bytes>,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptProof {
    pub block: BlockHeader,
    pub tx_index: u64,
    /// Transactions trie nodes, proving the receipt's transaction hash.
    pub tx_proof: Vec<Bytes>,
    /// Receipts trie nodes along `rlp(txIndex)`.
    pub merkle_proof: Vec<Bytes>,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProof {
    /// Required when the response does not carry the header itself.
    #[serde(default)]
    pub block: Option<BlockHeader>,
    /// Raw transactions in block order.
    #[serde(default)]
    pub transactions: Option<Vec<Bytes>>,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

/// An `eth_call` proof: every account and slot the call touched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallProof {
    pub block: BlockHeader,
    pub accounts: BTreeMap<Address, AccountEntry>,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogReceiptProof {
    pub tx_index: u64,
    pub tx_proof: Vec<Bytes>,
    pub receipt_proof: Vec<Bytes>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBlockProof {
    pub block: BlockHeader,
    /// Keyed by transaction hash.
    pub receipts: BTreeMap<B256, LogReceiptProof>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogProof {
    /// Keyed by block number.
    pub blocks: BTreeMap<u64, LogBlockProof>,
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

/// The proof envelope attached to a node response, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Proof {
    #[serde(rename = "accountProof")]
    Account(AccountProof),
    #[serde(rename = "transactionProof")]
    Transaction(TransactionProof),
    #[serde(rename = "receiptProof")]
    Receipt(ReceiptProof),
    #[serde(rename = "blockProof")]
    Block(BlockProof),
    #[serde(rename = "callProof")]
    Call(CallProof),
    #[serde(rename = "logProof")]
    Log(LogProof),
}

impl Proof {
    pub fn kind(&self) -> &'static str {
        match self {
            Proof::Account(_) => "accountProof",
            Proof::Transaction(_) => "transactionProof",
            Proof::Receipt(_) => "receiptProof",
            Proof::Block(_) => "blockProof",
            Proof::Call(_) => "callProof",
            Proof::Log(_) => "logProof",
        }
    }

    pub fn signatures(&self) -> &[Signature] {
        match self {
            Proof::Account(p) => &p.signatures,
            Proof::Transaction(p) => &p.signatures,
            Proof::Receipt(p) => &p.signatures,
            Proof::Block(p) => &p.signatures,
            Proof::Call(p) => &p.signatures,
            Proof::Log(p) => &p.signatures,
        }
    }

    pub fn signatures_mut(&mut self) -> &mut Vec<Signature> {
        match self {
            Proof::Account(p) => &mut p.signatures,
            Proof::Transaction(p) => &mut p.signatures,
            Proof::Receipt(p) => &mut p.signatures,
            Proof::Block(p) => &mut p.signatures,
            Proof::Call(p) => &mut p.signatures,
            Proof::Log(p) => &mut p.signatures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestKey;
    use crate::types::header::HeaderFields;

    #[test]
    fn test_signature_recovers_signer() {
        let key = TestKey::new(1);
        let sig = key.sign_block(&B256::repeat_byte(0x42), 100);
        assert_eq!(sig.recover().unwrap(), key.address());

        let mut forged = sig.clone();
        forged.block_hash = B256::repeat_byte(0x43);
        assert_ne!(forged.recover().ok(), Some(key.address()));
    }

    #[test]
    fn test_proof_tagged_by_type() {
        let proof = Proof::Block(BlockProof {
            block: Some(BlockHeader::from_fields(HeaderFields::default()).unwrap()),
            transactions: None,
            signatures: vec![],
        });
        let json = serde_json::to_value(&proof).unwrap();
        assert_eq!(json["type"], "blockProof");
        let back: Proof = serde_json::from_value(json).unwrap();
        assert_eq!(back, proof);
    }

    #[test]
    fn test_unknown_proof_type_rejected() {
        let json = serde_json::json!({ "type": "mysteryProof" });
        assert!(serde_json::from_value::<Proof>(json).is_err());
    }
}
