//! The chain as the registry components see it.
//!
//! Everything that touches a real chain sits behind these traits: reading
//! blocks and registry logs, and sending registry transactions. Implementations
//! own transaction construction, signing and confirmation.

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The contract rejected the call. `reason` is the revert string verbatim.
    #[error("Transaction reverted: {reason}")]
    Reverted { reason: String },

    #[error("Chain transport error: {reason}")]
    Transport { reason: String },

    #[error("Timed out waiting for {what}")]
    Timeout { what: String },
}

impl ChainError {
    pub fn reverted(reason: impl Into<String>) -> Self {
        ChainError::Reverted {
            reason: reason.into(),
        }
    }

    /// The revert reason, if the contract rejected the call.
    pub fn revert_reason(&self) -> Option<&str> {
        match self {
            ChainError::Reverted { reason } => Some(reason),
            _ => None,
        }
    }
}

/// A log emitted by the registry contract, as returned by the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub log_index: u64,
}

/// A mined registry transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub logs: Vec<RawLog>,
}

/// `ownerIndex(owner)`: whether the owner runs a node, where it sits in the
/// list, and any deposit locked after a vote-kick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnerInfo {
    pub used: bool,
    pub index: u64,
    pub locked_until: u64,
    pub locked_deposit: U256,
}

/// Fraction of a slashed deposit paid to the convicter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardShare {
    pub numerator: u64,
    pub denominator: u64,
}

impl RewardShare {
    pub fn apply(&self, amount: U256) -> U256 {
        if self.denominator == 0 {
            return U256::ZERO;
        }
        amount * U256::from(self.numerator) / U256::from(self.denominator)
    }
}

/// Read access to the chain hosting the registry.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// `None` for blocks the chain does not have (yet).
    async fn block_hash(&self, number: u64) -> Result<Option<B256>, ChainError>;

    async fn block_timestamp(&self, number: u64) -> Result<u64, ChainError>;

    /// Registry logs in `from..=to`, ordered by block then log index.
    async fn registry_logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, ChainError>;
}

/// The node registry contract and its block-hash registry.
///
/// Transaction methods resolve once the transaction is mined; a revert comes
/// back as [`ChainError::Reverted`] with the contract's reason.
#[async_trait]
pub trait RegistryContract: ChainReader {
    /// The account transactions are sent from.
    fn sender(&self) -> Address;

    async fn register_server(
        &self,
        url: &str,
        props: U256,
        timeout: u64,
        deposit: U256,
    ) -> Result<TxReceipt, ChainError>;

    /// Change url, props or timeout and optionally add to the deposit. A zero
    /// timeout keeps the current one.
    async fn update_server(
        &self,
        url: &str,
        props: U256,
        timeout: u64,
        added_deposit: U256,
    ) -> Result<TxReceipt, ChainError>;

    async fn request_unregistering_server(&self) -> Result<TxReceipt, ChainError>;

    async fn cancel_unregistering_server(&self) -> Result<TxReceipt, ChainError>;

    async fn confirm_unregistering_server(&self) -> Result<TxReceipt, ChainError>;

    /// Phase one of a conviction: commit to the evidence without revealing it.
    async fn convict(&self, block: u64, commit: B256) -> Result<TxReceipt, ChainError>;

    /// Phase two: reveal the signature committed to earlier.
    async fn reveal_convict(
        &self,
        owner: Address,
        block_hash: B256,
        block: u64,
        v: u8,
        r: B256,
        s: B256,
    ) -> Result<TxReceipt, ChainError>;

    /// Remove `owner` on the strength of voter signatures over
    /// `personal(keccak(blockHash ‖ owner))`, each `r ‖ s ‖ v`.
    async fn vote_unregister_server(
        &self,
        block: u64,
        owner: Address,
        signatures: Vec<Bytes>,
    ) -> Result<TxReceipt, ChainError>;

    /// Voters eligible to vote `owner` out at `block`, most recent first.
    async fn get_valid_voters(&self, block: u64, owner: Address) -> Result<Vec<Address>, ChainError>;

    async fn calculate_min_deposit(&self, value: U256) -> Result<U256, ChainError>;

    async fn owner_index(&self, owner: Address) -> Result<OwnerInfo, ChainError>;

    /// Pay out the sender's deposit once its lock has elapsed.
    async fn return_deposit(&self) -> Result<TxReceipt, ChainError>;

    async fn convict_reward_share(&self) -> Result<RewardShare, ChainError>;

    /// Store the previous block's hash in the block-hash registry.
    async fn snapshot(&self) -> Result<TxReceipt, ChainError>;

    /// Whether the block-hash registry holds the hash of `block`.
    async fn snapshot_covers(&self, block: u64) -> Result<bool, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_share() {
        let half = RewardShare { numerator: 1, denominator: 2 };
        assert_eq!(half.apply(U256::from(1_001)), U256::from(500));
        let none = RewardShare { numerator: 1, denominator: 0 };
        assert_eq!(none.apply(U256::from(10)), U256::ZERO);
    }

    #[test]
    fn test_revert_reason() {
        assert_eq!(
            ChainError::reverted("wrong convict hash").revert_reason(),
            Some("wrong convict hash")
        );
        let err = ChainError::Timeout { what: "receipt".into() };
        assert_eq!(err.revert_reason(), None);
    }
}
