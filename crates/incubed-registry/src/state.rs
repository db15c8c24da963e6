//! The node list as an event-sourced projection of the registry.
//!
//! [`NodeListState`] is only ever changed by [`NodeListState::apply`], one
//! event at a time in log order. The list keeps the contract's layout: a node
//! is appended on registration and removed by moving the last node into its
//! slot.

use crate::events::TypedEvent;
use alloy_primitives::{Address, B256, U256};
use incubed_core::TrustedSigners;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("{event}: expected registry index {expected}, got {index}")]
    IndexMismatch {
        event: &'static str,
        expected: u64,
        index: u64,
    },

    #[error("{event}: no node at index {index} for owner {owner}")]
    OwnerMismatch {
        event: &'static str,
        owner: Address,
        index: u64,
    },

    #[error("Owner {0} is already registered")]
    DuplicateOwner(Address),
}

/// Upper bound of a single node's weight, so sums over the list stay in `u64`.
pub const MAX_NODE_WEIGHT: u64 = u32::MAX as u64;

/// One registered node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub owner: Address,
    pub url: String,
    pub deposit: U256,
    pub weight: u64,
    pub registered_at: u64,
    pub unregister_requested_at: Option<u64>,
    pub props: U256,
    pub timeout: u64,
    pub index: u64,
}

/// Deposit held back after a vote-kick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedDeposit {
    pub amount: U256,
    pub locked_until: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeListState {
    nodes: Vec<NodeRecord>,
    pub last_block: u64,
    pub last_hash: B256,
    total_weight: u64,
    locked: BTreeMap<Address, LockedDeposit>,
    weight_unit: U256,
}

impl NodeListState {
    /// An empty list synced up to `block`. Weight is deposit in units of
    /// `weight_unit` wei, between 1 and [`MAX_NODE_WEIGHT`].
    pub fn new(block: u64, hash: B256, weight_unit: U256) -> Self {
        Self {
            nodes: Vec::new(),
            last_block: block,
            last_hash: hash,
            total_weight: 0,
            locked: BTreeMap::new(),
            weight_unit: weight_unit.max(U256::from(1)),
        }
    }

    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn node(&self, owner: &Address) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.owner == *owner)
    }

    /// Zero for owners without a node.
    pub fn weight_of(&self, owner: &Address) -> u64 {
        self.node(owner).map_or(0, |n| n.weight)
    }

    pub fn locked(&self, owner: &Address) -> Option<&LockedDeposit> {
        self.locked.get(owner)
    }

    pub fn weight_for(&self, deposit: U256) -> u64 {
        let units = deposit / self.weight_unit;
        u64::try_from(units).unwrap_or(u64::MAX).clamp(1, MAX_NODE_WEIGHT)
    }

    /// Nodes allowed to vote `target` out of a block with timestamp
    /// `timestamp`: registered at least `epoch` seconds before it, most
    /// recent first, at most `max`.
    pub fn valid_voters(&self, timestamp: u64, target: &Address, epoch: u64, max: usize) -> Vec<&NodeRecord> {
        let mut voters: Vec<&NodeRecord> = self
            .nodes
            .iter()
            .filter(|n| n.owner != *target && n.registered_at.saturating_add(epoch) <= timestamp)
            .collect();
        voters.sort_by(|a, b| {
            b.registered_at
                .cmp(&a.registered_at)
                .then_with(|| b.index.cmp(&a.index))
        });
        voters.truncate(max);
        voters
    }

    /// Apply one event. On error the state is unchanged.
    pub fn apply(&mut self, event: &TypedEvent) -> Result<(), StateError> {
        let name = event.name();
        match event {
            TypedEvent::Registered {
                owner,
                index,
                url,
                props,
                timeout,
                deposit,
                registered_at,
            } => {
                let expected = self.nodes.len() as u64;
                if *index != expected {
                    return Err(StateError::IndexMismatch {
                        event: name,
                        expected,
                        index: *index,
                    });
                }
                if self.node(owner).is_some() {
                    return Err(StateError::DuplicateOwner(*owner));
                }
                let weight = self.weight_for(*deposit);
                self.nodes.push(NodeRecord {
                    owner: *owner,
                    url: url.clone(),
                    deposit: *deposit,
                    weight,
                    registered_at: *registered_at,
                    unregister_requested_at: None,
                    props: *props,
                    timeout: *timeout,
                    index: *index,
                });
                self.total_weight = self.total_weight.saturating_add(weight);
            }
            TypedEvent::Updated {
                owner,
                index,
                url,
                props,
                timeout,
                deposit,
            } => {
                let weight = self.weight_for(*deposit);
                let node = self.node_at_mut(name, owner, *index)?;
                let previous = node.weight;
                node.url = url.clone();
                node.props = *props;
                node.timeout = *timeout;
                node.deposit = *deposit;
                node.weight = weight;
                self.total_weight = self.total_weight.saturating_sub(previous).saturating_add(weight);
            }
            TypedEvent::UnregisterRequested {
                owner,
                index,
                requested_at,
                ..
            } => {
                self.node_at_mut(name, owner, *index)?.unregister_requested_at = Some(*requested_at);
            }
            TypedEvent::UnregisterCancelled { owner, index } => {
                self.node_at_mut(name, owner, *index)?.unregister_requested_at = None;
            }
            TypedEvent::UnregisterConfirmed { owner, index, .. }
            | TypedEvent::Convicted { owner, index, .. } => {
                self.node_at_mut(name, owner, *index)?;
            }
            TypedEvent::VoteCast {
                owner,
                index,
                locked_until,
                locked_deposit,
                ..
            } => {
                self.node_at_mut(name, owner, *index)?;
                self.locked.insert(
                    *owner,
                    LockedDeposit {
                        amount: *locked_deposit,
                        locked_until: *locked_until,
                    },
                );
            }
            TypedEvent::Removed { owner, index } => {
                self.node_at_mut(name, owner, *index)?;
                let removed = self.nodes.swap_remove(*index as usize);
                if let Some(moved) = self.nodes.get_mut(*index as usize) {
                    moved.index = *index;
                }
                self.total_weight = self.total_weight.saturating_sub(removed.weight);
            }
            TypedEvent::DepositReturned { owner, .. } => {
                self.locked.remove(owner);
            }
        }
        Ok(())
    }

    fn node_at_mut(
        &mut self,
        event: &'static str,
        owner: &Address,
        index: u64,
    ) -> Result<&mut NodeRecord, StateError> {
        match self.nodes.get_mut(index as usize) {
            Some(node) if node.owner == *owner => Ok(node),
            _ => Err(StateError::OwnerMismatch {
                event,
                owner: *owner,
                index,
            }),
        }
    }
}

impl TrustedSigners for NodeListState {
    fn is_trusted(&self, address: &Address) -> bool {
        self.node(address).is_some()
    }
}
