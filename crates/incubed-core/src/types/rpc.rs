//! Typed JSON-RPC queries and the response values a node returns for them.

use crate::types::header::BlockHeader;
use alloy_primitives::{Address, Bloom, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Which block a state query targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockRef {
    Latest,
    Number(u64),
    Hash(B256),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    /// Empty matches any address.
    #[serde(default)]
    pub address: Vec<Address>,
    /// Per position: `None` matches anything, otherwise any of the listed topics.
    #[serde(default)]
    pub topics: Vec<Option<Vec<B256>>>,
}

impl LogFilter {
    pub fn matches(&self, log: &LogData) -> bool {
        if self.from_block.is_some_and(|from| log.block_number < from)
            || self.to_block.is_some_and(|to| log.block_number > to)
        {
            return false;
        }
        if !self.address.is_empty() && !self.address.contains(&log.address) {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, wanted)| match wanted {
            None => true,
            Some(options) => log.topics.get(i).is_some_and(|t| options.contains(t)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Query {
    #[serde(rename = "eth_blockNumber")]
    BlockNumber,
    #[serde(rename = "eth_getBalance")]
    Balance { address: Address, block: BlockRef },
    #[serde(rename = "eth_getTransactionCount")]
    TransactionCount { address: Address, block: BlockRef },
    #[serde(rename = "eth_getCode")]
    Code { address: Address, block: BlockRef },
    #[serde(rename = "eth_getStorageAt")]
    StorageAt {
        address: Address,
        slot: B256,
        block: BlockRef,
    },
    #[serde(rename = "eth_getTransactionByHash")]
    TransactionByHash { hash: B256 },
    #[serde(rename = "eth_getTransactionByBlockAndIndex")]
    TransactionByBlockAndIndex { block: BlockRef, index: u64 },
    #[serde(rename = "eth_getTransactionReceipt")]
    TransactionReceipt { hash: B256 },
    #[serde(rename = "eth_getBlockByNumber")]
    BlockByNumber { number: u64, full: bool },
    #[serde(rename = "eth_getBlockByHash")]
    BlockByHash { hash: B256, full: bool },
    #[serde(rename = "eth_getBlockTransactionCountByNumber")]
    BlockTransactionCountByNumber { number: u64 },
    #[serde(rename = "eth_getBlockTransactionCountByHash")]
    BlockTransactionCountByHash { hash: B256 },
    #[serde(rename = "eth_call")]
    Call {
        to: Address,
        data: Bytes,
        block: BlockRef,
    },
    #[serde(rename = "eth_getLogs")]
    Logs(LogFilter),
}

impl Query {
    pub fn method(&self) -> &'static str {
        match self {
            Query::BlockNumber => "eth_blockNumber",
            Query::Balance { .. } => "eth_getBalance",
            Query::TransactionCount { .. } => "eth_getTransactionCount",
            Query::Code { .. } => "eth_getCode",
            Query::StorageAt { .. } => "eth_getStorageAt",
            Query::TransactionByHash { .. } => "eth_getTransactionByHash",
            Query::TransactionByBlockAndIndex { block: BlockRef::Hash(_), .. } => {
                "eth_getTransactionByBlockHashAndIndex"
            }
            Query::TransactionByBlockAndIndex { .. } => "eth_getTransactionByBlockNumberAndIndex",
            Query::TransactionReceipt { .. } => "eth_getTransactionReceipt",
            Query::BlockByNumber { .. } => "eth_getBlockByNumber",
            Query::BlockByHash { .. } => "eth_getBlockByHash",
            Query::BlockTransactionCountByNumber { .. } => "eth_getBlockTransactionCountByNumber",
            Query::BlockTransactionCountByHash { .. } => "eth_getBlockTransactionCountByHash",
            Query::Call { .. } => "eth_call",
            Query::Logs(_) => "eth_getLogs",
        }
    }

    /// Whether a response to this query can carry a proof. The current head
    /// number cannot: it is accepted by sampling instead.
    pub fn is_provable(&self) -> bool {
        !matches!(self, Query::BlockNumber)
    }
}

/// A transaction as reported by a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionData {
    pub hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_index: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub gas: u64,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub input: Bytes,
    pub v: u64,
    pub r: B256,
    pub s: B256,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogData {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptData {
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub block_hash: B256,
    pub block_number: u64,
    pub status: u8,
    pub cumulative_gas_used: u64,
    pub logs_bloom: Bloom,
    pub logs: Vec<LogData>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockTransactions {
    Hashes(Vec<B256>),
    Full(Vec<TransactionData>),
}

impl BlockTransactions {
    pub fn len(&self) -> usize {
        match self {
            BlockTransactions::Hashes(h) => h.len(),
            BlockTransactions::Full(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub header: BlockHeader,
    /// `None` when the node omitted the list.
    #[serde(default)]
    pub transactions: Option<BlockTransactions>,
}

/// The value a node returned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ResponseValue {
    /// Balances, nonces, counts and block numbers.
    Quantity(U256),
    /// Code and call results.
    Bytes(Bytes),
    /// Storage words.
    Word(B256),
    Transaction(Option<TransactionData>),
    Receipt(Option<ReceiptData>),
    Block(Option<Box<BlockData>>),
    Logs(Vec<LogData>),
}

impl ResponseValue {
    pub fn as_quantity(&self) -> Option<U256> {
        match self {
            ResponseValue::Quantity(q) => Some(*q),
            _ => None,
        }
    }
}
