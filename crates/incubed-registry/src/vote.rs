//! Vote-kick: removing a node on the strength of other nodes' votes.
//!
//! Distinct from conviction. Voters sign `personal(keccak(blockHash ‖ owner))`
//! and the contract removes the target once the voters holding more than half
//! of the eligible weight agree. The removed node's deposit stays locked for a
//! while before its owner can reclaim it.

use crate::chain::{ChainError, RegistryContract, TxReceipt};
use crate::conviction::{ConvictionConfig, ConvictionError};
use crate::state::NodeListState;
use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use futures::future::join_all;
use incubed_core::crypto::{keccak256_concat, personal_message_hash, recover_address};
use incubed_core::{CryptoError, LocalSigner};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const REVERT_NOT_ENOUGH_VOTING_POWER: &str = "not enough voting power";
pub const REVERT_DEPOSIT_STILL_LOCKED: &str = "deposit still locked";

/// Collects vote signatures from other nodes.
#[async_trait]
pub trait VoteSource: Send + Sync {
    /// `voter`'s 65-byte `r ‖ s ‖ v` vote against `target` at `block_hash`,
    /// or `None` if it does not vote.
    async fn request_vote(&self, voter: Address, block_hash: B256, target: Address) -> Option<Bytes>;
}

/// The message a voter signs.
pub fn vote_hash(block_hash: &B256, target: &Address) -> B256 {
    personal_message_hash(&keccak256_concat(&[block_hash.as_slice(), target.as_slice()]))
}

pub fn sign_vote(signer: &LocalSigner, block_hash: &B256, target: &Address) -> Result<Bytes, CryptoError> {
    let (r, s, v) = signer.sign_hash(&vote_hash(block_hash, target))?;
    let mut packed = Vec::with_capacity(65);
    packed.extend_from_slice(r.as_slice());
    packed.extend_from_slice(s.as_slice());
    packed.push(v);
    Ok(packed.into())
}

pub fn recover_vote(vote: &[u8], block_hash: &B256, target: &Address) -> Result<Address, CryptoError> {
    if vote.len() != 65 {
        return Err(CryptoError::InvalidSignature);
    }
    let r = B256::from_slice(&vote[..32]);
    let s = B256::from_slice(&vote[32..64]);
    recover_address(&vote_hash(block_hash, target), &r, &s, vote[64] as u64)
}

pub struct VoteKick<R: ?Sized> {
    registry: Arc<R>,
    config: ConvictionConfig,
}

impl<R: RegistryContract + ?Sized> VoteKick<R> {
    pub fn new(registry: Arc<R>, config: ConvictionConfig) -> Self {
        Self { registry, config }
    }

    /// Voters the contract names for `block`, kept only where the local node
    /// list agrees they may vote.
    pub async fn valid_voters(
        &self,
        block: u64,
        target: Address,
        state: &NodeListState,
    ) -> Result<Vec<Address>, ConvictionError> {
        let timestamp = self.registry.block_timestamp(block).await?;
        let local: HashSet<Address> = state
            .valid_voters(timestamp, &target, self.config.epoch_secs, self.config.max_voters)
            .into_iter()
            .map(|n| n.owner)
            .collect();
        let remote = self.registry.get_valid_voters(block, target).await?;
        let agreed: Vec<Address> = remote
            .iter()
            .filter(|v| local.contains(*v))
            .copied()
            .take(self.config.max_voters)
            .collect();
        if agreed.len() != remote.len() || agreed.len() != local.len() {
            warn!(
                target: "conviction",
                block,
                remote = remote.len(),
                local = local.len(),
                agreed = agreed.len(),
                "Voter lists differ"
            );
        }
        Ok(agreed)
    }

    /// Collect votes against `target` and submit them if they carry more than
    /// half of the voters' weight.
    pub async fn vote_out(
        &self,
        block: u64,
        target: Address,
        state: &NodeListState,
        source: &dyn VoteSource,
    ) -> Result<TxReceipt, ConvictionError> {
        let block_hash = self
            .registry
            .block_hash(block)
            .await?
            .ok_or_else(|| ConvictionError::Protocol {
                reason: format!("block {block} not found"),
            })?;
        let voters = self.valid_voters(block, target, state).await?;
        let total = voters
            .iter()
            .fold(0u64, |sum, v| sum.saturating_add(state.weight_of(v)));

        let votes = join_all(voters.iter().map(|voter| async move {
            (*voter, source.request_vote(*voter, block_hash, target).await)
        }))
        .await;

        let mut voted = 0u64;
        let mut signatures = Vec::new();
        for (voter, vote) in votes {
            let Some(vote) = vote else {
                debug!(target: "conviction", %voter, "No vote");
                continue;
            };
            match recover_vote(&vote, &block_hash, &target) {
                Ok(signer) if signer == voter => {
                    voted = voted.saturating_add(state.weight_of(&voter));
                    signatures.push(vote);
                }
                _ => warn!(target: "conviction", %voter, "Dropping invalid vote"),
            }
        }

        if u128::from(voted) * 2 <= u128::from(total) {
            return Err(ConvictionError::NotEnoughVotingPower { voted, total });
        }

        let receipt = self
            .registry
            .vote_unregister_server(block, target, signatures)
            .await
            .map_err(|e| match e.revert_reason() {
                Some(REVERT_NOT_ENOUGH_VOTING_POWER) => {
                    ConvictionError::NotEnoughVotingPower { voted, total }
                }
                Some(reason) => ConvictionError::Protocol {
                    reason: reason.to_string(),
                },
                None => ConvictionError::Chain(e),
            })?;
        info!(
            target: "conviction",
            %target,
            block,
            voted,
            total,
            "Node voted out"
        );
        Ok(receipt)
    }

    /// Pay out the sender's locked deposit once the lock has passed.
    pub async fn reclaim_deposit(&self) -> Result<TxReceipt, ConvictionError> {
        let info = self.registry.owner_index(self.registry.sender()).await?;
        let head = self.registry.block_number().await?;
        let now = self.registry.block_timestamp(head).await?;
        if info.locked_until > now {
            return Err(ConvictionError::DepositStillLocked {
                until: info.locked_until,
                now,
            });
        }
        self.registry.return_deposit().await.map_err(|e| match e {
            ChainError::Reverted { reason } if reason == REVERT_DEPOSIT_STILL_LOCKED => {
                ConvictionError::DepositStillLocked {
                    until: info.locked_until,
                    now,
                }
            }
            ChainError::Reverted { reason } => ConvictionError::Protocol { reason },
            other => ConvictionError::Chain(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainReader;
    use crate::events::EventLog;
    use crate::state::MAX_NODE_WEIGHT;
    use crate::testing::SimRegistry;
    use alloy_primitives::U256;
    use incubed_core::testing::TestKey;
    use std::collections::HashMap;

    const FINNEY: u64 = 1_000_000_000_000_000;

    struct Voters {
        keys: HashMap<Address, TestKey>,
        silent: HashSet<Address>,
        forged: HashSet<Address>,
    }

    #[async_trait]
    impl VoteSource for Voters {
        async fn request_vote(&self, voter: Address, block_hash: B256, target: Address) -> Option<Bytes> {
            if self.silent.contains(&voter) {
                return None;
            }
            let key = self.keys.get(&voter)?;
            let hash = if self.forged.contains(&voter) {
                B256::repeat_byte(0x0F)
            } else {
                block_hash
            };
            sign_vote(key.signer(), &hash, &target).ok()
        }
    }

    struct Network {
        sim: SimRegistry,
        keys: Vec<TestKey>,
        target: TestKey,
        block: u64,
    }

    /// A target and `voters` nodes, all eligible at the returned block.
    async fn network(voters: u64) -> Network {
        let sim = SimRegistry::new();
        let target = TestKey::new(1_000);
        let keys: Vec<TestKey> = (1..=voters).map(TestKey::new).collect();
        for key in std::iter::once(&target).chain(&keys) {
            sim.as_sender(key.address())
                .register_server(
                    &format!("https://{}.example", key.address()),
                    U256::ZERO,
                    3_600,
                    U256::from(10 * FINNEY),
                )
                .await
                .unwrap();
        }
        sim.advance_time(3_600);
        sim.mine_empty(1);
        let block = sim.head();
        Network { sim, keys, target, block }
    }

    async fn synced(sim: &SimRegistry) -> NodeListState {
        synced_in_units(sim, U256::from(FINNEY)).await
    }

    async fn synced_in_units(sim: &SimRegistry, unit: U256) -> NodeListState {
        let mut state = NodeListState::new(0, B256::ZERO, unit);
        for raw in sim.registry_logs(0, sim.head()).await.unwrap() {
            state.apply(&EventLog::decode(&raw).unwrap().event).unwrap();
        }
        state
    }

    fn source(keys: &[TestKey]) -> Voters {
        Voters {
            keys: keys.iter().map(|k| (k.address(), k.clone())).collect(),
            silent: HashSet::new(),
            forged: HashSet::new(),
        }
    }

    #[test]
    fn test_vote_signature_binds_block_and_target() {
        let key = TestKey::new(7);
        let hash = B256::repeat_byte(0xAB);
        let target = Address::repeat_byte(0x10);
        let vote = sign_vote(key.signer(), &hash, &target).unwrap();
        assert_eq!(vote.len(), 65);
        assert_eq!(recover_vote(&vote, &hash, &target).unwrap(), key.address());
        assert_ne!(
            recover_vote(&vote, &hash, &Address::repeat_byte(0x11)).ok(),
            Some(key.address())
        );
        assert_eq!(
            recover_vote(&vote[..64], &hash, &target),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn test_majority_votes_out_and_locks_deposit() {
        let net = network(5).await;
        let state = synced(&net.sim).await;
        let kick = VoteKick::new(Arc::new(net.sim.clone()), ConvictionConfig::default());

        let voters = kick.valid_voters(net.block, net.target.address(), &state).await.unwrap();
        assert_eq!(voters.len(), 5);
        assert!(!voters.contains(&net.target.address()));

        let mut votes = source(&net.keys);
        votes.silent.insert(net.keys[0].address());
        votes.silent.insert(net.keys[1].address());
        kick.vote_out(net.block, net.target.address(), &state, &votes)
            .await
            .unwrap();
        assert_eq!(net.sim.server_count(), 5);

        let info = net.sim.owner_index(net.target.address()).await.unwrap();
        assert!(!info.used);
        assert_eq!(info.locked_deposit, U256::from(10 * FINNEY) * U256::from(99) / U256::from(100));
        let head = net.sim.head();
        assert_eq!(info.locked_until, net.sim.block_timestamp(head).await.unwrap() + 3_600);
    }

    #[tokio::test]
    async fn test_tally_holds_at_capped_weights() {
        let net = network(5).await;
        let state = synced_in_units(&net.sim, U256::from(1)).await;
        assert_eq!(state.weight_of(&net.keys[0].address()), MAX_NODE_WEIGHT);
        let kick = VoteKick::new(Arc::new(net.sim.clone()), ConvictionConfig::default());
        let mut votes = source(&net.keys);
        for key in &net.keys[..3] {
            votes.silent.insert(key.address());
        }
        assert_eq!(
            kick.vote_out(net.block, net.target.address(), &state, &votes).await,
            Err(ConvictionError::NotEnoughVotingPower {
                voted: 2 * MAX_NODE_WEIGHT,
                total: 5 * MAX_NODE_WEIGHT,
            })
        );
    }

    #[tokio::test]
    async fn test_minority_is_refused_locally() {
        let net = network(5).await;
        let state = synced(&net.sim).await;
        let kick = VoteKick::new(Arc::new(net.sim.clone()), ConvictionConfig::default());
        let mut votes = source(&net.keys);
        // Two honest votes, one forged over another block hash
        votes.silent.insert(net.keys[0].address());
        votes.silent.insert(net.keys[1].address());
        votes.forged.insert(net.keys[2].address());

        let head_before = net.sim.head();
        assert_eq!(
            kick.vote_out(net.block, net.target.address(), &state, &votes).await,
            Err(ConvictionError::NotEnoughVotingPower { voted: 20, total: 50 })
        );
        // Nothing was sent
        assert_eq!(net.sim.head(), head_before);
        assert_eq!(net.sim.server_count(), 6);
    }

    #[tokio::test]
    async fn test_deposit_reclaim_waits_for_lock() {
        let net = network(3).await;
        let state = synced(&net.sim).await;
        VoteKick::new(Arc::new(net.sim.clone()), ConvictionConfig::default())
            .vote_out(net.block, net.target.address(), &state, &source(&net.keys))
            .await
            .unwrap();

        let target = Arc::new(net.sim.as_sender(net.target.address()));
        let own = VoteKick::new(target.clone(), ConvictionConfig::default());
        assert!(matches!(
            own.reclaim_deposit().await,
            Err(ConvictionError::DepositStillLocked { .. })
        ));

        net.sim.advance_time(3_600);
        net.sim.mine_empty(1);
        own.reclaim_deposit().await.unwrap();
        assert_eq!(
            net.sim.paid_to(net.target.address()),
            U256::from(10 * FINNEY) * U256::from(99) / U256::from(100)
        );
        assert!(matches!(
            own.reclaim_deposit().await,
            Err(ConvictionError::Protocol { reason }) if reason == "nothing to transfer"
        ));
    }
}
