//! Fixtures for tests: deterministic keys, signed transactions, and blocks
//! with real state, transaction and receipt tries.
//!
//! Compiled for this crate's tests and for dependents enabling the `testing`
//! feature.

use crate::crypto::{keccak256, LocalSigner};
use crate::trie::rlp::{encode_list, Raw};
use crate::trie::TrieBuilder;
use crate::types::{
    AccountEntry, AccountProof, AccountState, BlockHeader, HeaderFields, Log, LogData,
    ReceiptData, Signature, SignedTransaction, StorageEntry, TransactionData, TransactionReceipt,
};
use alloy_primitives::{Address, Bloom, Bytes, B256, U256};
use alloy_rlp::Encodable;
use std::collections::BTreeMap;

/// A deterministic secp256k1 key.
#[derive(Clone, Debug)]
pub struct TestKey {
    signer: LocalSigner,
}

impl TestKey {
    pub fn new(seed: u64) -> Self {
        let mut secret = keccak256_seeded(seed);
        // Stay well below the curve order
        secret[0] &= 0x7F;
        let signer = LocalSigner::from_bytes(&secret).expect("seeded secret is a valid key");
        Self { signer }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn signer(&self) -> &LocalSigner {
        &self.signer
    }

    /// Attest that block `number` has hash `block_hash`.
    pub fn sign_block(&self, block_hash: &B256, number: u64) -> Signature {
        let hash = crate::crypto::block_sign_hash(block_hash, number);
        let (r, s, v) = self.signer.sign_hash(&hash).expect("signing a prehash");
        Signature {
            address: self.address(),
            block: number,
            block_hash: *block_hash,
            r,
            s,
            v,
        }
    }
}

fn keccak256_seeded(seed: u64) -> [u8; 32] {
    let mut input = b"incubed-test-key".to_vec();
    input.extend_from_slice(&seed.to_be_bytes());
    keccak256(&input).0
}

/// An unsigned transaction.
#[derive(Clone, Debug)]
pub struct TxTemplate {
    pub tx_type: u8,
    pub nonce: u64,
    pub gas_price: U256,
    pub max_priority_fee_per_gas: U256,
    pub gas: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
}

impl TxTemplate {
    pub fn legacy(nonce: u64, to: Option<Address>) -> Self {
        Self {
            tx_type: 0,
            nonce,
            gas_price: U256::from(20_000_000_000u64),
            max_priority_fee_per_gas: U256::ZERO,
            gas: 21_000,
            to,
            value: U256::from(1_000_000u64),
            input: Bytes::new(),
        }
    }

    pub fn eip1559(nonce: u64, to: Address) -> Self {
        Self {
            tx_type: 2,
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            input: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
            ..Self::legacy(nonce, Some(to))
        }
    }

    /// Sign and encode. `chain_id` is mandatory for typed transactions.
    pub fn sign(&self, key: &TestKey, chain_id: Option<u64>) -> Bytes {
        let to: &[u8] = self.to.as_ref().map(|a| a.as_slice()).unwrap_or(&[]);
        let empty: &[u8] = &[];
        let chain = chain_id.unwrap_or(1);

        if self.tx_type == 0 {
            let mut fields: Vec<&dyn Encodable> = Vec::with_capacity(9);
            fields.extend_from_slice(&[&self.nonce, &self.gas_price, &self.gas, &to, &self.value, &self.input]);
            if chain_id.is_some() {
                fields.extend_from_slice(&[&chain, &empty, &empty]);
            }
            let (r, s, recid) = sign_payload(key, &encode_list(&fields));
            let v = match chain_id {
                Some(id) => id * 2 + 35 + recid,
                None => 27 + recid,
            };
            let (r, s) = (U256::from_be_bytes(r.0), U256::from_be_bytes(s.0));
            let mut signed = fields[..6].to_vec();
            signed.extend_from_slice(&[&v, &r, &s]);
            return encode_list(&signed).into();
        }

        let access_list = Raw(&[0xC0]);
        let fields: [&dyn Encodable; 9] = [
            &chain,
            &self.nonce,
            &self.max_priority_fee_per_gas,
            &self.gas_price,
            &self.gas,
            &to,
            &self.value,
            &self.input,
            &access_list,
        ];
        let mut payload = vec![self.tx_type];
        payload.extend_from_slice(&encode_list(&fields));
        let (r, s, recid) = sign_payload(key, &payload);
        let (r, s) = (U256::from_be_bytes(r.0), U256::from_be_bytes(s.0));
        let mut signed = fields.to_vec();
        signed.extend_from_slice(&[&recid, &r, &s]);
        let mut out = vec![self.tx_type];
        out.extend_from_slice(&encode_list(&signed));
        out.into()
    }
}

fn sign_payload(key: &TestKey, payload: &[u8]) -> (B256, B256, u64) {
    let (r, s, v) = key.signer.sign_hash(&keccak256(payload)).expect("signing a prehash");
    (r, s, (v - 27) as u64)
}

/// A receipt with the given logs and no bloom.
pub fn receipt(tx_type: u8, cumulative_gas_used: u64, logs: Vec<Log>) -> TransactionReceipt {
    TransactionReceipt {
        tx_type,
        status: 1,
        cumulative_gas_used,
        logs_bloom: Bloom::default(),
        logs,
    }
}

#[derive(Clone, Debug, Default)]
struct AccountSpec {
    nonce: u64,
    balance: U256,
    code: Bytes,
    storage: BTreeMap<B256, U256>,
}

/// Builds a block whose header commits to real tries.
#[derive(Clone, Debug, Default)]
pub struct BlockBuilder {
    number: u64,
    parent_hash: B256,
    timestamp: Option<u64>,
    accounts: BTreeMap<Address, AccountSpec>,
    transactions: Vec<(Bytes, TransactionReceipt)>,
}

impl BlockBuilder {
    pub fn new(number: u64) -> Self {
        Self {
            number,
            ..Default::default()
        }
    }

    pub fn parent(mut self, parent_hash: B256) -> Self {
        self.parent_hash = parent_hash;
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn account(mut self, address: Address, nonce: u64, balance: U256) -> Self {
        let spec = self.accounts.entry(address).or_default();
        spec.nonce = nonce;
        spec.balance = balance;
        self
    }

    pub fn code(mut self, address: Address, code: Bytes) -> Self {
        self.accounts.entry(address).or_default().code = code;
        self
    }

    pub fn storage(mut self, address: Address, slot: B256, value: U256) -> Self {
        self.accounts
            .entry(address)
            .or_default()
            .storage
            .insert(slot, value);
        self
    }

    /// Add `count` unrelated accounts so proofs have some depth.
    pub fn filler(mut self, count: u64) -> Self {
        for i in 0..count {
            let address = Address::from_slice(&keccak256(i.to_be_bytes())[12..]);
            self = self.account(address, i, U256::from(i * 1_000 + 1));
        }
        self
    }

    pub fn transaction(mut self, raw: Bytes, receipt: TransactionReceipt) -> Self {
        self.transactions.push((raw, receipt));
        self
    }

    pub fn build(self) -> BlockFixture {
        let mut state = TrieBuilder::new();
        let mut storage = BTreeMap::new();
        let mut accounts = BTreeMap::new();
        let mut codes = BTreeMap::new();

        for (address, spec) in &self.accounts {
            let mut trie = TrieBuilder::new();
            for (slot, value) in &spec.storage {
                if !value.is_zero() {
                    trie.insert(keccak256(slot).as_slice(), alloy_rlp::encode(value));
                }
            }
            let account = AccountState {
                nonce: spec.nonce,
                balance: spec.balance,
                storage_hash: trie.root(),
                code_hash: keccak256(&spec.code),
            };
            state.insert(keccak256(address.as_slice()).as_slice(), account.rlp_encode());
            accounts.insert(*address, account);
            storage.insert(*address, trie);
            codes.insert(*address, spec.code.clone());
        }

        let mut tx_trie = TrieBuilder::new();
        let mut receipt_trie = TrieBuilder::new();
        for (index, (raw, receipt)) in self.transactions.iter().enumerate() {
            let key = alloy_rlp::encode(index as u64);
            tx_trie.insert(&key, raw.to_vec());
            receipt_trie.insert(&key, receipt.rlp_encode());
        }

        let header = BlockHeader::from_fields(HeaderFields {
            parent_hash: self.parent_hash,
            state_root: state.root(),
            transactions_root: tx_trie.root(),
            receipts_root: receipt_trie.root(),
            number: self.number,
            gas_limit: 30_000_000,
            timestamp: self.timestamp.unwrap_or(1_700_000_000 + self.number * 12),
            base_fee_per_gas: Some(U256::from(7)),
            ..Default::default()
        })
        .expect("fixture header fields are in fork order");

        BlockFixture {
            header,
            state,
            storage,
            accounts,
            codes,
            transactions: self.transactions,
            tx_trie,
            receipt_trie,
        }
    }
}

/// A built block and the tries behind its header.
#[derive(Clone, Debug)]
pub struct BlockFixture {
    pub header: BlockHeader,
    state: TrieBuilder,
    storage: BTreeMap<Address, TrieBuilder>,
    accounts: BTreeMap<Address, AccountState>,
    codes: BTreeMap<Address, Bytes>,
    transactions: Vec<(Bytes, TransactionReceipt)>,
    tx_trie: TrieBuilder,
    receipt_trie: TrieBuilder,
}

impl BlockFixture {
    /// The account as stored, or the empty account.
    pub fn account(&self, address: &Address) -> AccountState {
        self.accounts
            .get(address)
            .cloned()
            .unwrap_or_else(AccountState::empty)
    }

    pub fn code(&self, address: &Address) -> Bytes {
        self.codes.get(address).cloned().unwrap_or_default()
    }

    pub fn storage_value(&self, address: &Address, slot: &B256) -> U256 {
        let key = keccak256(slot);
        self.storage
            .get(address)
            .and_then(|trie| trie.get(key.as_slice()))
            .map(|raw| {
                crate::trie::rlp::decode_bytes(raw)
                    .map(U256::from_be_slice)
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn account_entry(&self, address: &Address, slots: &[B256]) -> AccountEntry {
        let empty = TrieBuilder::new();
        let trie = self.storage.get(address).unwrap_or(&empty);
        let storage_proof = slots
            .iter()
            .map(|slot| StorageEntry {
                key: *slot,
                value: self.storage_value(address, slot),
                proof: trie.proof(keccak256(slot).as_slice()),
            })
            .collect();
        AccountEntry {
            account: self.account(address),
            account_proof: self.state.proof(keccak256(address.as_slice()).as_slice()),
            storage_proof,
        }
    }

    pub fn account_proof(&self, address: &Address, slots: &[B256]) -> AccountProof {
        let mut accounts = BTreeMap::new();
        accounts.insert(*address, self.account_entry(address, slots));
        AccountProof {
            block: self.header.clone(),
            accounts,
            signatures: vec![],
        }
    }

    pub fn raw_transactions(&self) -> Vec<Bytes> {
        self.transactions.iter().map(|(raw, _)| raw.clone()).collect()
    }

    pub fn receipt(&self, index: usize) -> &TransactionReceipt {
        &self.transactions[index].1
    }

    pub fn tx_proof(&self, index: u64) -> Vec<Bytes> {
        self.tx_trie.proof(&alloy_rlp::encode(index))
    }

    pub fn receipt_proof(&self, index: u64) -> Vec<Bytes> {
        self.receipt_trie.proof(&alloy_rlp::encode(index))
    }

    /// The transaction as an honest node reports it.
    pub fn transaction_data(&self, index: usize) -> TransactionData {
        let tx = SignedTransaction::decode(&self.transactions[index].0)
            .expect("fixture transactions decode");
        TransactionData {
            hash: tx.hash,
            block_hash: self.header.hash(),
            block_number: self.header.number(),
            transaction_index: index as u64,
            from: tx.from,
            to: tx.to,
            nonce: tx.nonce,
            value: tx.value,
            gas: tx.gas,
            gas_price: tx.gas_price,
            max_fee_per_gas: tx.max_fee_per_gas,
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
            input: tx.input,
            v: tx.v,
            r: tx.r,
            s: tx.s,
        }
    }

    /// The logs of one transaction as an honest node reports them.
    pub fn log_data(&self, index: usize) -> Vec<LogData> {
        let tx_hash = keccak256(&self.transactions[index].0);
        self.transactions[index]
            .1
            .logs
            .iter()
            .enumerate()
            .map(|(i, log)| LogData {
                address: log.address,
                topics: log.topics.clone(),
                data: log.data.clone(),
                block_number: self.header.number(),
                block_hash: self.header.hash(),
                transaction_hash: tx_hash,
                transaction_index: index as u64,
                log_index: i as u64,
            })
            .collect()
    }

    /// The receipt as an honest node reports it.
    pub fn receipt_data(&self, index: usize) -> ReceiptData {
        let receipt = &self.transactions[index].1;
        ReceiptData {
            transaction_hash: keccak256(&self.transactions[index].0),
            transaction_index: index as u64,
            block_hash: self.header.hash(),
            block_number: self.header.number(),
            status: receipt.status,
            cumulative_gas_used: receipt.cumulative_gas_used,
            logs_bloom: receipt.logs_bloom,
            logs: self.log_data(index),
        }
    }
}

/// A chain of empty headers linked by parent hash, oldest first.
pub fn header_chain(first: u64, count: u64) -> Vec<BlockHeader> {
    let mut parent = B256::ZERO;
    (first..first + count)
        .map(|number| {
            let header = BlockBuilder::new(number).parent(parent).build().header;
            parent = header.hash();
            header
        })
        .collect()
}
