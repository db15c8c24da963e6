pub mod execution;
pub mod header;
pub mod proof;
pub mod rpc;

pub use execution::{AccountState, DecodeError, Log, SignedTransaction, TransactionReceipt};
pub use header::{verify_ancestry, BlockHeader, HeaderError, HeaderFields};
pub use proof::{
    AccountEntry, AccountProof, BlockProof, CallProof, LogBlockProof, LogProof, LogReceiptProof,
    Proof, ReceiptProof, Signature, StorageEntry, TransactionProof,
};
pub use rpc::{
    BlockData, BlockRef, BlockTransactions, LogData, LogFilter, Query, ReceiptData, ResponseValue,
    TransactionData,
};
