//! # Incubed Client
//!
//! Asks registered nodes, verifies what they answer and acts on what it finds.
//!
//! - [`selector`] picks nodes at random, weighted by deposit and health.
//! - [`client::Client`] dispatches to several nodes at once, verifies every
//!   answer with [`incubed_core::verify`] and replaces nodes that fail.
//! - [`quorum`] turns the verified answers into one value, flagging signers
//!   that attested to a different block hash.
//!
//! Evidence of wrong signatures is handed to an
//! [`incubed_registry::EvidenceSink`], normally the conviction engine.

pub mod client;
pub mod config;
pub mod health;
pub mod logging;
pub mod quorum;
pub mod random;
pub mod selector;

pub use client::{Client, ClientError, NodeRequest, NodeResponse, NodeTransport, TransportError};
pub use config::{ClientConfig, ProofMode};
pub use health::{Clock, ManualClock, NodeHealth, SystemClock};
pub use quorum::{accept, AcceptPolicy, Answer, QuorumOutcome};
pub use random::{ChaChaSource, FixedSource, RandomSource};
pub use selector::{select_nodes, Weighting};
