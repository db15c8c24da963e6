//! Registry events and their log encoding.
//!
//! Every registry log carries `topic0 = keccak(signature)` and the node owner
//! as `topic1`. The ABI data starts with the node's registry index, except for
//! `LogDepositReturned`, which concerns an owner that no longer has a node.
//!
//! `Convicted`, `UnregisterConfirmed` and `VoteCast` describe why a node goes
//! away; the contract always follows them with a `Removed` log, and only that
//! log takes the node out of the list.

use crate::abi::{self, AbiError, Decoder, Token};
use crate::chain::RawLog;
use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

pub const REGISTERED: &str = "LogServerRegistered(address,uint256,string,uint256,uint64,uint256,uint64)";
pub const UPDATED: &str = "LogServerUpdated(address,uint256,string,uint256,uint64,uint256)";
pub const UNREGISTER_REQUESTED: &str = "LogServerUnregisterRequested(address,uint256,uint64,address)";
pub const UNREGISTER_CANCELLED: &str = "LogServerUnregisterCanceled(address,uint256)";
pub const UNREGISTER_CONFIRMED: &str = "LogServerUnregisterConfirmed(address,uint256,uint256)";
pub const CONVICTED: &str = "LogServerConvicted(address,uint256,uint64,address,uint256)";
pub const REMOVED: &str = "LogServerRemoved(address,uint256)";
pub const VOTE_CAST: &str = "LogServerVoteKicked(address,uint256,uint64,uint256,address)";
pub const DEPOSIT_RETURNED: &str = "LogDepositReturned(address,uint256)";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Unknown registry event topic {0}")]
    UnknownTopic(B256),

    #[error("Log has no topics")]
    NoTopics,

    #[error("{event}: missing indexed owner topic")]
    MissingOwner { event: &'static str },

    #[error("{event}: indexed owner topic is not an address: {topic}")]
    InvalidOwner { event: &'static str, topic: B256 },

    #[error("{event}: {source}")]
    Abi {
        event: &'static str,
        #[source]
        source: AbiError,
    },
}

/// A decoded registry event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TypedEvent {
    Registered {
        owner: Address,
        index: u64,
        url: String,
        props: U256,
        timeout: u64,
        deposit: U256,
        registered_at: u64,
    },
    Updated {
        owner: Address,
        index: u64,
        url: String,
        props: U256,
        timeout: u64,
        deposit: U256,
    },
    UnregisterRequested {
        owner: Address,
        index: u64,
        requested_at: u64,
        caller: Address,
    },
    UnregisterCancelled {
        owner: Address,
        index: u64,
    },
    UnregisterConfirmed {
        owner: Address,
        index: u64,
        deposit: U256,
    },
    Convicted {
        owner: Address,
        index: u64,
        block_number: u64,
        convicter: Address,
        slashed: U256,
    },
    Removed {
        owner: Address,
        index: u64,
    },
    VoteCast {
        owner: Address,
        index: u64,
        locked_until: u64,
        locked_deposit: U256,
        caller: Address,
    },
    DepositReturned {
        owner: Address,
        amount: U256,
    },
}

impl TypedEvent {
    pub fn owner(&self) -> Address {
        match self {
            TypedEvent::Registered { owner, .. }
            | TypedEvent::Updated { owner, .. }
            | TypedEvent::UnregisterRequested { owner, .. }
            | TypedEvent::UnregisterCancelled { owner, .. }
            | TypedEvent::UnregisterConfirmed { owner, .. }
            | TypedEvent::Convicted { owner, .. }
            | TypedEvent::Removed { owner, .. }
            | TypedEvent::VoteCast { owner, .. }
            | TypedEvent::DepositReturned { owner, .. } => *owner,
        }
    }

    pub fn signature(&self) -> &'static str {
        match self {
            TypedEvent::Registered { .. } => REGISTERED,
            TypedEvent::Updated { .. } => UPDATED,
            TypedEvent::UnregisterRequested { .. } => UNREGISTER_REQUESTED,
            TypedEvent::UnregisterCancelled { .. } => UNREGISTER_CANCELLED,
            TypedEvent::UnregisterConfirmed { .. } => UNREGISTER_CONFIRMED,
            TypedEvent::Convicted { .. } => CONVICTED,
            TypedEvent::Removed { .. } => REMOVED,
            TypedEvent::VoteCast { .. } => VOTE_CAST,
            TypedEvent::DepositReturned { .. } => DEPOSIT_RETURNED,
        }
    }

    /// Short event name for logs.
    pub fn name(&self) -> &'static str {
        let signature = self.signature();
        signature.split('(').next().unwrap_or(signature)
    }

    /// Decode a registry log.
    pub fn decode(log: &RawLog) -> Result<Self, EventError> {
        let topic0 = log.topics.first().ok_or(EventError::NoTopics)?;
        let event = signature_for(topic0).ok_or(EventError::UnknownTopic(*topic0))?;
        let owner = indexed_owner(event, log.topics.get(1))?;
        let d = Decoder::new(&log.data);
        let abi_err = |source| EventError::Abi { event, source };

        let decoded = match event {
            REGISTERED => TypedEvent::Registered {
                owner,
                index: d.u64(0).map_err(abi_err)?,
                url: d.string(1).map_err(abi_err)?,
                props: d.uint(2).map_err(abi_err)?,
                timeout: d.u64(3).map_err(abi_err)?,
                deposit: d.uint(4).map_err(abi_err)?,
                registered_at: d.u64(5).map_err(abi_err)?,
            },
            UPDATED => TypedEvent::Updated {
                owner,
                index: d.u64(0).map_err(abi_err)?,
                url: d.string(1).map_err(abi_err)?,
                props: d.uint(2).map_err(abi_err)?,
                timeout: d.u64(3).map_err(abi_err)?,
                deposit: d.uint(4).map_err(abi_err)?,
            },
            UNREGISTER_REQUESTED => TypedEvent::UnregisterRequested {
                owner,
                index: d.u64(0).map_err(abi_err)?,
                requested_at: d.u64(1).map_err(abi_err)?,
                caller: d.address(2).map_err(abi_err)?,
            },
            UNREGISTER_CANCELLED => TypedEvent::UnregisterCancelled {
                owner,
                index: d.u64(0).map_err(abi_err)?,
            },
            UNREGISTER_CONFIRMED => TypedEvent::UnregisterConfirmed {
                owner,
                index: d.u64(0).map_err(abi_err)?,
                deposit: d.uint(1).map_err(abi_err)?,
            },
            CONVICTED => TypedEvent::Convicted {
                owner,
                index: d.u64(0).map_err(abi_err)?,
                block_number: d.u64(1).map_err(abi_err)?,
                convicter: d.address(2).map_err(abi_err)?,
                slashed: d.uint(3).map_err(abi_err)?,
            },
            REMOVED => TypedEvent::Removed {
                owner,
                index: d.u64(0).map_err(abi_err)?,
            },
            VOTE_CAST => TypedEvent::VoteCast {
                owner,
                index: d.u64(0).map_err(abi_err)?,
                locked_until: d.u64(1).map_err(abi_err)?,
                locked_deposit: d.uint(2).map_err(abi_err)?,
                caller: d.address(3).map_err(abi_err)?,
            },
            DEPOSIT_RETURNED => TypedEvent::DepositReturned {
                owner,
                amount: d.uint(0).map_err(abi_err)?,
            },
            _ => return Err(EventError::UnknownTopic(*topic0)),
        };
        Ok(decoded)
    }

    /// Topics and data as the contract emits them.
    pub fn encode(&self) -> (Vec<B256>, Bytes) {
        let topics = vec![abi::event_topic(self.signature()), abi::address_word(&self.owner())];
        let tokens: Vec<Token> = match self.clone() {
            TypedEvent::Registered {
                index,
                url,
                props,
                timeout,
                deposit,
                registered_at,
                ..
            } => vec![
                index.into(),
                Token::String(url),
                props.into(),
                timeout.into(),
                deposit.into(),
                registered_at.into(),
            ],
            TypedEvent::Updated {
                index,
                url,
                props,
                timeout,
                deposit,
                ..
            } => vec![
                index.into(),
                Token::String(url),
                props.into(),
                timeout.into(),
                deposit.into(),
            ],
            TypedEvent::UnregisterRequested {
                index,
                requested_at,
                caller,
                ..
            } => vec![index.into(), requested_at.into(), caller.into()],
            TypedEvent::UnregisterCancelled { index, .. } | TypedEvent::Removed { index, .. } => {
                vec![index.into()]
            }
            TypedEvent::UnregisterConfirmed { index, deposit, .. } => {
                vec![index.into(), deposit.into()]
            }
            TypedEvent::Convicted {
                index,
                block_number,
                convicter,
                slashed,
                ..
            } => vec![index.into(), block_number.into(), convicter.into(), slashed.into()],
            TypedEvent::VoteCast {
                index,
                locked_until,
                locked_deposit,
                caller,
                ..
            } => vec![
                index.into(),
                locked_until.into(),
                locked_deposit.into(),
                caller.into(),
            ],
            TypedEvent::DepositReturned { amount, .. } => vec![amount.into()],
        };
        (topics, abi::encode(&tokens).into())
    }
}

/// A decoded event with its position in the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLog {
    pub block_number: u64,
    pub block_hash: B256,
    pub log_index: u64,
    pub event: TypedEvent,
}

impl EventLog {
    pub fn decode(log: &RawLog) -> Result<Self, EventError> {
        Ok(Self {
            block_number: log.block_number,
            block_hash: log.block_hash,
            log_index: log.log_index,
            event: TypedEvent::decode(log)?,
        })
    }

    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

fn signature_for(topic: &B256) -> Option<&'static str> {
    static TOPICS: OnceLock<Vec<(B256, &'static str)>> = OnceLock::new();
    TOPICS
        .get_or_init(|| {
            [
                REGISTERED,
                UPDATED,
                UNREGISTER_REQUESTED,
                UNREGISTER_CANCELLED,
                UNREGISTER_CONFIRMED,
                CONVICTED,
                REMOVED,
                VOTE_CAST,
                DEPOSIT_RETURNED,
            ]
            .into_iter()
            .map(|signature| (abi::event_topic(signature), signature))
            .collect()
        })
        .iter()
        .find(|(t, _)| t == topic)
        .map(|(_, signature)| *signature)
}

fn indexed_owner(event: &'static str, topic: Option<&B256>) -> Result<Address, EventError> {
    let topic = topic.ok_or(EventError::MissingOwner { event })?;
    if topic[..12].iter().any(|b| *b != 0) {
        return Err(EventError::InvalidOwner { event, topic: *topic });
    }
    Ok(Address::from_slice(&topic[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(event: &TypedEvent) -> RawLog {
        let (topics, data) = event.encode();
        RawLog {
            address: Address::repeat_byte(0xAA),
            topics,
            data,
            block_number: 12,
            block_hash: B256::repeat_byte(12),
            transaction_hash: B256::repeat_byte(0x7E),
            log_index: 3,
        }
    }

    fn owner() -> Address {
        Address::repeat_byte(0x42)
    }

    #[test]
    fn test_registered_decodes_with_url() {
        let event = TypedEvent::Registered {
            owner: owner(),
            index: 4,
            url: "https://in3.example:8500/some/very/long/path/that/spans/words".into(),
            props: U256::from(0xFFu64),
            timeout: 3_600,
            deposit: U256::from(10u64).pow(U256::from(16)),
            registered_at: 1_700_000_000,
        };
        let log = raw(&event);
        assert_eq!(log.topics[1], abi::address_word(&owner()));

        let decoded = EventLog::decode(&log).unwrap();
        assert_eq!(decoded.event, event);
        assert_eq!(decoded.position(), (12, 3));
        assert_eq!(decoded.event.name(), "LogServerRegistered");
    }

    #[test]
    fn test_index_leads_the_data() {
        let event = TypedEvent::Convicted {
            owner: owner(),
            index: 9,
            block_number: 77,
            convicter: Address::repeat_byte(1),
            slashed: U256::from(5u64),
        };
        let log = raw(&event);
        assert_eq!(Decoder::new(&log.data).u64(0).unwrap(), 9);
        assert_eq!(TypedEvent::decode(&log).unwrap(), event);
    }

    #[test]
    fn test_unknown_topic() {
        let mut log = raw(&TypedEvent::Removed { owner: owner(), index: 0 });
        log.topics[0] = B256::repeat_byte(0x01);
        assert_eq!(
            TypedEvent::decode(&log),
            Err(EventError::UnknownTopic(B256::repeat_byte(0x01)))
        );
        log.topics.clear();
        assert_eq!(TypedEvent::decode(&log), Err(EventError::NoTopics));
    }

    #[test]
    fn test_owner_topic_required() {
        let mut log = raw(&TypedEvent::Removed { owner: owner(), index: 0 });
        log.topics.truncate(1);
        assert_eq!(
            TypedEvent::decode(&log),
            Err(EventError::MissingOwner { event: REMOVED })
        );
        log.topics.push(B256::repeat_byte(0xFF));
        assert!(matches!(
            TypedEvent::decode(&log),
            Err(EventError::InvalidOwner { .. })
        ));
    }

    #[test]
    fn test_truncated_data_is_rejected() {
        let mut log = raw(&TypedEvent::VoteCast {
            owner: owner(),
            index: 1,
            locked_until: 10,
            locked_deposit: U256::from(99u64),
            caller: Address::repeat_byte(3),
        });
        log.data = Bytes::copy_from_slice(&log.data[..64]);
        assert!(matches!(
            TypedEvent::decode(&log),
            Err(EventError::Abi { event: VOTE_CAST, .. })
        ));
    }
}
