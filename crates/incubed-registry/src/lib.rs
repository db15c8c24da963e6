//! # Incubed Registry
//!
//! The on-chain side of the node network as the client sees it.
//!
//! - [`watcher::Watcher`] mirrors the registry contract's node list as an
//!   event-sourced [`state::NodeListState`], rewinding on reorgs.
//! - [`conviction::ConvictionEngine`] punishes nodes that signed a wrong block
//!   hash with a commit/reveal conviction.
//! - [`vote::VoteKick`] removes a node by a weighted vote of its peers.
//!
//! Chain access goes through the [`chain::ChainReader`] and
//! [`chain::RegistryContract`] traits.

pub mod abi;
pub mod chain;
pub mod conviction;
pub mod events;
pub mod state;
pub mod vote;
pub mod watcher;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chain::{ChainError, ChainReader, RegistryContract};
pub use conviction::{CaseOutcome, ConvictionConfig, ConvictionEngine, ConvictionError, EvidenceSink};
pub use events::{EventLog, TypedEvent};
pub use state::{NodeListState, NodeRecord, MAX_NODE_WEIGHT};
pub use vote::{VoteKick, VoteSource};
pub use watcher::{
    CheckpointStore, JsonFileCheckpointStore, MemoryCheckpointStore, NodeListHandle, Watcher,
    WatcherConfig, WatcherError,
};
