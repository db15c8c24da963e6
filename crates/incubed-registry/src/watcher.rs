//! Registry Watcher: keeps [`NodeListState`] in step with the registry logs.
//!
//! A sync pass reads every log after the last synced block, applies them in
//! `(block, logIndex)` order to a working copy and publishes the copy only if
//! the whole range applied and the chain did not move underneath. Each commit
//! is kept as a checkpoint so a reorg rewinds to the newest checkpoint still
//! on the canonical chain.

use crate::chain::{ChainError, ChainReader};
use crate::events::{EventError, EventLog};
use crate::state::{NodeListState, StateError};
use alloy_primitives::{B256, U256};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("Registry log out of order at block {block}, log index {log_index}")]
    OutOfOrder { block: u64, log_index: u64 },

    #[error("Chain reorganized at block {block} while syncing")]
    ReorgDuringSync { block: u64 },

    #[error("Undecodable registry log at block {block}, log index {log_index}: {source}")]
    Decode {
        block: u64,
        log_index: u64,
        #[source]
        source: EventError,
    },

    #[error("Registry event at block {block}, log index {log_index} does not fit the node list: {source}")]
    Inconsistent {
        block: u64,
        log_index: u64,
        #[source]
        source: StateError,
    },

    #[error("Checkpoint store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid checkpoint file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Block the registry contract was deployed in.
    pub deploy_block: u64,
    /// Number of committed syncs kept for rewinding.
    pub reorg_depth: usize,
    pub poll_interval: Duration,
    pub weight_unit_wei: U256,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            deploy_block: 0,
            reorg_depth: 16,
            poll_interval: Duration::from_secs(5),
            // 1 finney
            weight_unit_wei: U256::from(1_000_000_000_000_000u64),
        }
    }
}

/// A committed sync.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub block: u64,
    pub hash: B256,
    pub state: NodeListState,
}

impl Checkpoint {
    fn of(state: &NodeListState) -> Self {
        Self {
            block: state.last_block,
            hash: state.last_hash,
            state: state.clone(),
        }
    }
}

/// Durable storage for the retained checkpoints, oldest first.
pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> Result<Vec<Checkpoint>, StoreError>;
    fn save(&self, checkpoints: &[Checkpoint]) -> Result<(), StoreError>;
}

/// Checkpoints kept in memory only. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<Vec<Checkpoint>>>,
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, checkpoints: &[Checkpoint]) -> Result<(), StoreError> {
        *self.inner.lock() = checkpoints.to_vec();
        Ok(())
    }
}

/// Checkpoints in a JSON file, replaced atomically on every save.
pub struct JsonFileCheckpointStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for JsonFileCheckpointStore {
    fn load(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let _guard = self.lock.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, checkpoints: &[Checkpoint]) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(checkpoints)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Shared read access to the latest committed node list.
#[derive(Clone)]
pub struct NodeListHandle {
    inner: Arc<RwLock<Arc<NodeListState>>>,
}

impl NodeListHandle {
    pub fn new(state: NodeListState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(state))),
        }
    }

    pub fn snapshot(&self) -> Arc<NodeListState> {
        self.inner.read().clone()
    }

    fn replace(&self, state: NodeListState) {
        *self.inner.write() = Arc::new(state);
    }
}

pub struct Watcher<C: ?Sized> {
    chain: Arc<C>,
    config: WatcherConfig,
    handle: NodeListHandle,
    checkpoints: VecDeque<Checkpoint>,
    store: Box<dyn CheckpointStore>,
    events: broadcast::Sender<EventLog>,
}

impl<C: ChainReader + ?Sized> Watcher<C> {
    /// Resume from the newest stored checkpoint, or start at the deployment
    /// block.
    pub fn new(
        chain: Arc<C>,
        config: WatcherConfig,
        store: Box<dyn CheckpointStore>,
    ) -> Result<Self, WatcherError> {
        let mut checkpoints: VecDeque<Checkpoint> = store.load()?.into();
        while checkpoints.len() > config.reorg_depth.max(1) {
            checkpoints.pop_front();
        }
        let state = match checkpoints.back() {
            Some(checkpoint) => {
                info!(target: "watcher", block = checkpoint.block, "Resuming from checkpoint");
                checkpoint.state.clone()
            }
            None => fresh_state(&config),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            chain,
            config,
            handle: NodeListHandle::new(state),
            checkpoints,
            store,
            events,
        })
    }

    /// The latest committed node list.
    pub fn snapshot(&self) -> Arc<NodeListState> {
        self.handle.snapshot()
    }

    pub fn handle(&self) -> NodeListHandle {
        self.handle.clone()
    }

    /// Events of every committed sync, in log order.
    pub fn subscribe(&self) -> broadcast::Receiver<EventLog> {
        self.events.subscribe()
    }

    /// Run one sync pass. Returns the events applied, empty when the chain
    /// has no new blocks.
    pub async fn sync(&mut self) -> Result<Vec<EventLog>, WatcherError> {
        self.rewind_if_reorged().await?;

        let base = self.handle.snapshot();
        let head = self.chain.block_number().await?;
        if head <= base.last_block {
            return Ok(Vec::new());
        }
        let from = base.last_block + 1;
        let raw = self.chain.registry_logs(from, head).await?;

        let mut events = Vec::with_capacity(raw.len());
        let mut previous: Option<(u64, u64)> = None;
        for log in &raw {
            let position = (log.block_number, log.log_index);
            let in_range = (from..=head).contains(&log.block_number);
            if !in_range || previous.is_some_and(|p| position <= p) {
                return Err(WatcherError::OutOfOrder {
                    block: log.block_number,
                    log_index: log.log_index,
                });
            }
            previous = Some(position);
            let event = EventLog::decode(log).map_err(|source| WatcherError::Decode {
                block: log.block_number,
                log_index: log.log_index,
                source,
            })?;
            events.push(event);
        }

        let mut working = (*base).clone();
        for event in &events {
            working
                .apply(&event.event)
                .map_err(|source| WatcherError::Inconsistent {
                    block: event.block_number,
                    log_index: event.log_index,
                    source,
                })?;
            debug!(
                target: "watcher",
                block = event.block_number,
                log_index = event.log_index,
                event = event.event.name(),
                owner = %event.event.owner(),
                "Applied registry event"
            );
        }

        let head_hash = self
            .chain
            .block_hash(head)
            .await?
            .ok_or(WatcherError::ReorgDuringSync { block: head })?;
        if base.last_hash != B256::ZERO {
            self.expect_hash(base.last_block, base.last_hash).await?;
        }
        let log_blocks: BTreeMap<u64, B256> = events
            .iter()
            .map(|e| (e.block_number, e.block_hash))
            .collect();
        for (block, hash) in log_blocks {
            self.expect_hash(block, hash).await?;
        }

        working.last_block = head;
        working.last_hash = head_hash;
        self.commit(working)?;
        for event in &events {
            // No subscribers is fine
            let _ = self.events.send(event.clone());
        }
        info!(
            target: "watcher",
            block = head,
            events = events.len(),
            nodes = self.handle.snapshot().len(),
            "Node list synced"
        );
        Ok(events)
    }

    /// Poll until `shutdown` flips to true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!(target: "watcher", error = %e, "Sync pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(target: "watcher", "Watcher stopped");
    }

    async fn expect_hash(&self, block: u64, hash: B256) -> Result<(), WatcherError> {
        match self.chain.block_hash(block).await? {
            Some(current) if current == hash => Ok(()),
            _ => Err(WatcherError::ReorgDuringSync { block }),
        }
    }

    async fn rewind_if_reorged(&mut self) -> Result<(), WatcherError> {
        let current = self.handle.snapshot();
        if current.last_hash == B256::ZERO
            || self.chain.block_hash(current.last_block).await? == Some(current.last_hash)
        {
            return Ok(());
        }
        warn!(target: "watcher", block = current.last_block, "Registry reorg detected");

        while let Some(checkpoint) = self.checkpoints.back() {
            if self.chain.block_hash(checkpoint.block).await? == Some(checkpoint.hash) {
                let state = checkpoint.state.clone();
                info!(target: "watcher", block = checkpoint.block, "Rewound to checkpoint");
                self.store.save(self.checkpoints.make_contiguous())?;
                self.handle.replace(state);
                return Ok(());
            }
            self.checkpoints.pop_back();
        }

        warn!(
            target: "watcher",
            from = self.config.deploy_block,
            "No checkpoint on the canonical chain, resyncing from deployment"
        );
        self.store.save(&[])?;
        self.handle.replace(fresh_state(&self.config));
        Ok(())
    }

    fn commit(&mut self, state: NodeListState) -> Result<(), WatcherError> {
        self.checkpoints.push_back(Checkpoint::of(&state));
        while self.checkpoints.len() > self.config.reorg_depth.max(1) {
            self.checkpoints.pop_front();
        }
        self.store.save(self.checkpoints.make_contiguous())?;
        self.handle.replace(state);
        Ok(())
    }
}

fn fresh_state(config: &WatcherConfig) -> NodeListState {
    NodeListState::new(
        config.deploy_block.saturating_sub(1),
        B256::ZERO,
        config.weight_unit_wei,
    )
}
