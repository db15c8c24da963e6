//! Conviction Engine: two-phase commit/reveal against nodes that signed a
//! wrong block hash.
//!
//! A case is keyed by `(accused, block number)` and moves
//! `Hidden → Revealed → Resolved`, or ends `Expired` when the contract or the
//! local pre-checks refuse it. `Resolved` is only ever reached through a
//! `Convicted` event observed by the Watcher, which also overrides an
//! `Expired` case when the event names this engine as convicter.

use crate::chain::{ChainError, RegistryContract, RewardShare};
use crate::events::{EventLog, TypedEvent};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use incubed_core::crypto::keccak256_concat;
use incubed_core::{CryptoError, Misbehavior, Signature};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, info, warn};

/// Revert reason shared by "evidence too old" and "hash was correct".
pub const REVERT_TOO_OLD_OR_CORRECT: &str =
    "the block is too old or you try to convict with a correct hash";
pub const REVERT_BLOCK_NOT_FOUND: &str = "block not found";
pub const REVERT_WRONG_CONVICT_HASH: &str = "wrong convict hash";

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvictionError {
    #[error("Block {block} is beyond the direct lookup range at head {head} and not covered by a snapshot")]
    EvidenceTooOld { block: u64, head: u64 },

    #[error("The signed hash for block {block} is correct")]
    SignatureWasCorrect { block: u64 },

    #[error("The contract rejected the convict commit")]
    InvalidOrDuplicateCommit,

    #[error("A case against {accused} for block {block} is already in progress")]
    CaseInProgress { accused: Address, block: u64 },

    #[error("Evidence against {accused} for block {block} is no longer actionable")]
    EvidenceDiscarded { accused: Address, block: u64 },

    #[error("Signature claims {claimed} but was signed by {recovered}")]
    WrongSigner { claimed: Address, recovered: Address },

    #[error("Invalid signature: {0}")]
    InvalidSignature(#[from] CryptoError),

    #[error("Not enough voting power: {voted} of {total}")]
    NotEnoughVotingPower { voted: u64, total: u64 },

    #[error("Deposit locked until {until}, now {now}")]
    DepositStillLocked { until: u64, now: u64 },

    #[error("Reveal window missed: hidden at block {hide_block}, head is {head}")]
    RevealWindow { hide_block: u64, head: u64 },

    #[error("Contract rejected the call: {reason}")]
    Protocol { reason: String },

    #[error("No case against {accused} for block {block}")]
    UnknownCase { accused: Address, block: u64 },

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl ConvictionError {
    /// The chain could not be reached; nothing was decided.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConvictionError::Chain(e) if e.revert_reason().is_none())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvictionConfig {
    /// Blocks after the commit within which the reveal must land.
    pub reveal_window_blocks: u64,
    /// How far back the chain serves block hashes without a snapshot.
    pub direct_lookup_blocks: u64,
    pub poll_interval: Duration,
    pub max_voters: usize,
    /// Seconds a node must have been registered before it may vote.
    pub epoch_secs: u64,
}

impl Default for ConvictionConfig {
    fn default() -> Self {
        Self {
            reveal_window_blocks: 128,
            direct_lookup_blocks: 256,
            poll_interval: Duration::from_secs(1),
            max_voters: 24,
            epoch_secs: 3_600,
        }
    }
}

pub type CaseKey = (Address, u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Hidden,
    Revealed,
    Resolved,
    Expired,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Resolved | Phase::Expired)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaseOutcome {
    Resolved {
        accused: Address,
        block: u64,
        slashed: U256,
        reward: U256,
    },
    Expired {
        accused: Address,
        block: u64,
        reason: ConvictionError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvictionCase {
    pub accused: Address,
    pub signed_hash: B256,
    pub block: u64,
    pub signature: Signature,
    pub commit: B256,
    pub phase: Phase,
    /// Block the commit was mined in. Zero until it is.
    pub hide_block: u64,
    pub outcome: Option<CaseOutcome>,
}

/// `keccak(signedBlockHash ‖ convicter ‖ v ‖ r ‖ s)`.
pub fn convict_commit(block_hash: &B256, convicter: &Address, v: u8, r: &B256, s: &B256) -> B256 {
    keccak256_concat(&[
        block_hash.as_slice(),
        convicter.as_slice(),
        &[v],
        r.as_slice(),
        s.as_slice(),
    ])
}

/// Receives signatures over wrong block hashes found during verification.
#[async_trait]
pub trait EvidenceSink: Send + Sync {
    /// An error for which [`ConvictionError::is_retryable`] holds means the
    /// same evidence may be reported again.
    async fn report(&self, evidence: Misbehavior) -> Result<(), ConvictionError>;
}

pub struct ConvictionEngine<R: ?Sized> {
    registry: Arc<R>,
    config: ConvictionConfig,
    cases: Mutex<HashMap<CaseKey, ConvictionCase>>,
    outcomes: broadcast::Sender<CaseOutcome>,
    reward_share: OnceCell<RewardShare>,
}

impl<R: RegistryContract + ?Sized> ConvictionEngine<R> {
    pub fn new(registry: Arc<R>, config: ConvictionConfig) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            registry,
            config,
            cases: Mutex::new(HashMap::new()),
            outcomes,
            reward_share: OnceCell::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaseOutcome> {
        self.outcomes.subscribe()
    }

    pub fn case(&self, key: &CaseKey) -> Option<ConvictionCase> {
        self.cases.lock().get(key).cloned()
    }

    /// Submit the commit for `evidence`. Returns the case key once the case
    /// is `Hidden`.
    pub async fn submit(&self, evidence: &Misbehavior) -> Result<CaseKey, ConvictionError> {
        let signature = &evidence.signature;
        let key = (signature.address, signature.block);
        self.check_not_open(&key)?;

        let recovered = signature.recover()?;
        if recovered != signature.address {
            return Err(ConvictionError::WrongSigner {
                claimed: signature.address,
                recovered,
            });
        }
        if signature.block_hash == evidence.expected_hash {
            return Err(ConvictionError::SignatureWasCorrect { block: signature.block });
        }
        if self.registry.block_hash(signature.block).await? == Some(signature.block_hash) {
            return Err(ConvictionError::SignatureWasCorrect { block: signature.block });
        }

        let head = self.registry.block_number().await?;
        let too_old = head.saturating_sub(signature.block) >= self.config.direct_lookup_blocks;
        if too_old && !self.registry.snapshot_covers(signature.block).await? {
            let reason = ConvictionError::EvidenceTooOld {
                block: signature.block,
                head,
            };
            self.record_expired(new_case(evidence, B256::ZERO), reason.clone());
            return Err(reason);
        }

        let commit = convict_commit(
            &signature.block_hash,
            &self.registry.sender(),
            signature.v,
            &signature.r,
            &signature.s,
        );
        {
            let mut cases = self.cases.lock();
            if let Some(case) = cases.get(&key) {
                if !case.phase.is_terminal() {
                    return Err(ConvictionError::CaseInProgress {
                        accused: key.0,
                        block: key.1,
                    });
                }
            }
            cases.insert(key, new_case(evidence, commit));
        }

        match self.registry.convict(signature.block, commit).await {
            Ok(receipt) => {
                if let Some(case) = self.cases.lock().get_mut(&key) {
                    case.hide_block = receipt.block_number;
                }
                info!(
                    target: "conviction",
                    accused = %key.0,
                    block = key.1,
                    hide_block = receipt.block_number,
                    "Convict commit mined"
                );
                Ok(key)
            }
            Err(e) if e.revert_reason().is_some() => {
                let reason = self.revert_error(e, signature.block, head);
                self.expire(&key, reason.clone());
                Err(reason)
            }
            Err(e) => {
                // Nothing on chain; allow a retry
                self.cases.lock().remove(&key);
                Err(e.into())
            }
        }
    }

    /// Reveal a `Hidden` case once its commit block is behind the head.
    pub async fn reveal(&self, key: CaseKey) -> Result<(), ConvictionError> {
        let case = self.case(&key).ok_or(ConvictionError::UnknownCase {
            accused: key.0,
            block: key.1,
        })?;
        match case.phase {
            Phase::Hidden => {}
            Phase::Revealed | Phase::Resolved => return Ok(()),
            Phase::Expired => {
                return Err(ConvictionError::EvidenceDiscarded {
                    accused: key.0,
                    block: key.1,
                })
            }
        }

        loop {
            let head = self.registry.block_number().await?;
            if head >= case.hide_block + self.config.reveal_window_blocks {
                let reason = ConvictionError::RevealWindow {
                    hide_block: case.hide_block,
                    head,
                };
                self.expire(&key, reason.clone());
                return Err(reason);
            }
            if head > case.hide_block {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        let signature = &case.signature;
        let result = self
            .registry
            .reveal_convict(
                signature.address,
                signature.block_hash,
                signature.block,
                signature.v,
                signature.r,
                signature.s,
            )
            .await;
        match result {
            Ok(receipt) => {
                if let Some(case) = self.cases.lock().get_mut(&key) {
                    if case.phase == Phase::Hidden {
                        case.phase = Phase::Revealed;
                    }
                }
                info!(
                    target: "conviction",
                    accused = %key.0,
                    block = key.1,
                    reveal_block = receipt.block_number,
                    "Conviction revealed"
                );
                Ok(())
            }
            Err(e) if e.revert_reason().is_some() => {
                let head = self.registry.block_number().await?;
                let reason = self.revert_error(e, signature.block, head);
                self.expire(&key, reason.clone());
                Err(reason)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Commit and reveal. A case whose commit is already mined goes
    /// straight to the reveal.
    pub async fn convict(&self, evidence: &Misbehavior) -> Result<(), ConvictionError> {
        let key = (evidence.signature.address, evidence.signature.block);
        let committed = self
            .case(&key)
            .is_some_and(|c| c.phase == Phase::Hidden && c.hide_block > 0);
        let key = if committed { key } else { self.submit(evidence).await? };
        self.reveal(key).await
    }

    /// Fold a registry event into the open cases.
    pub async fn reconcile(&self, log: &EventLog) -> Result<(), ConvictionError> {
        match &log.event {
            TypedEvent::Convicted {
                owner,
                block_number,
                convicter,
                slashed,
                ..
            } => {
                let key = (*owner, *block_number);
                let ours = *convicter == self.registry.sender();
                // A lost receipt can leave our own conviction marked expired
                let phase = self.cases.lock().get(&key).map(|c| c.phase);
                let applies = match phase {
                    Some(Phase::Hidden | Phase::Revealed) => true,
                    Some(Phase::Expired) => ours,
                    Some(Phase::Resolved) | None => false,
                };
                if !applies {
                    return Ok(());
                }
                let reward = if ours {
                    self.reward_share().await?.apply(*slashed)
                } else {
                    U256::ZERO
                };
                let outcome = CaseOutcome::Resolved {
                    accused: *owner,
                    block: *block_number,
                    slashed: *slashed,
                    reward,
                };
                if let Some(case) = self.cases.lock().get_mut(&key) {
                    case.phase = Phase::Resolved;
                    case.outcome = Some(outcome.clone());
                }
                info!(
                    target: "conviction",
                    accused = %owner,
                    block = block_number,
                    %slashed,
                    %reward,
                    "Case resolved"
                );
                let _ = self.outcomes.send(outcome);
            }
            TypedEvent::Removed { owner, .. } => {
                let open: Vec<CaseKey> = self
                    .cases
                    .lock()
                    .iter()
                    .filter(|(k, c)| k.0 == *owner && !c.phase.is_terminal())
                    .map(|(k, _)| *k)
                    .collect();
                for key in open {
                    let reason = ConvictionError::EvidenceDiscarded {
                        accused: key.0,
                        block: key.1,
                    };
                    self.expire(&key, reason);
                }
                debug!(target: "conviction", owner = %owner, "Node removed");
            }
            _ => {}
        }
        Ok(())
    }

    /// Reconcile every event from `events` until the channel closes.
    pub async fn follow(self: Arc<Self>, mut events: broadcast::Receiver<EventLog>) {
        loop {
            match events.recv().await {
                Ok(log) => {
                    if let Err(e) = self.reconcile(&log).await {
                        warn!(target: "conviction", error = %e, "Reconcile failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "conviction", skipped, "Missed registry events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn reward_share(&self) -> Result<RewardShare, ConvictionError> {
        let share = self
            .reward_share
            .get_or_try_init(|| self.registry.convict_reward_share())
            .await?;
        Ok(*share)
    }

    fn check_not_open(&self, key: &CaseKey) -> Result<(), ConvictionError> {
        match self.cases.lock().get(key).map(|c| c.phase) {
            Some(Phase::Hidden | Phase::Revealed) => Err(ConvictionError::CaseInProgress {
                accused: key.0,
                block: key.1,
            }),
            Some(Phase::Resolved) => Err(ConvictionError::EvidenceDiscarded {
                accused: key.0,
                block: key.1,
            }),
            Some(Phase::Expired) | None => Ok(()),
        }
    }

    fn revert_error(&self, error: ChainError, block: u64, head: u64) -> ConvictionError {
        let too_old = || ConvictionError::EvidenceTooOld { block, head };
        match error.revert_reason() {
            Some(REVERT_TOO_OLD_OR_CORRECT) => {
                if head.saturating_sub(block) >= self.config.direct_lookup_blocks {
                    too_old()
                } else {
                    ConvictionError::SignatureWasCorrect { block }
                }
            }
            Some(REVERT_BLOCK_NOT_FOUND) => too_old(),
            Some(REVERT_WRONG_CONVICT_HASH) => ConvictionError::InvalidOrDuplicateCommit,
            Some(reason) => ConvictionError::Protocol {
                reason: reason.to_string(),
            },
            None => ConvictionError::Chain(error),
        }
    }

    fn expire(&self, key: &CaseKey, reason: ConvictionError) {
        let case = self.cases.lock().get(key).cloned();
        if let Some(case) = case {
            if !case.phase.is_terminal() {
                self.record_expired(case, reason);
            }
        }
    }

    fn record_expired(&self, mut case: ConvictionCase, reason: ConvictionError) {
        let outcome = CaseOutcome::Expired {
            accused: case.accused,
            block: case.block,
            reason: reason.clone(),
        };
        warn!(
            target: "conviction",
            accused = %case.accused,
            block = case.block,
            %reason,
            "Case expired"
        );
        case.phase = Phase::Expired;
        case.outcome = Some(outcome.clone());
        self.cases.lock().insert((case.accused, case.block), case);
        let _ = self.outcomes.send(outcome);
    }
}

fn new_case(evidence: &Misbehavior, commit: B256) -> ConvictionCase {
    let signature = evidence.signature.clone();
    ConvictionCase {
        accused: signature.address,
        signed_hash: signature.block_hash,
        block: signature.block,
        signature,
        commit,
        phase: Phase::Hidden,
        hide_block: 0,
        outcome: None,
    }
}

#[async_trait]
impl<R: RegistryContract + ?Sized> EvidenceSink for ConvictionEngine<R> {
    async fn report(&self, evidence: Misbehavior) -> Result<(), ConvictionError> {
        let accused = evidence.accused();
        let block = evidence.signature.block;
        self.convict(&evidence).await.inspect_err(|e| {
            warn!(target: "conviction", %accused, block, error = %e, "Conviction failed");
        })
    }
}
