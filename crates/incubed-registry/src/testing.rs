//! An in-memory registry contract and chain for tests.
//!
//! [`SimRegistry`] mines one block per successful transaction (reverted
//! transactions mine nothing), emits the registry events as real logs, and
//! enforces the contract's rules with its revert strings. Block hashes are
//! deterministic; [`SimRegistry::reorg`] replaces the newest blocks, rolling
//! the contract back with them.
//!
//! Compiled for this crate's tests and for dependents enabling the `testing`
//! feature.

use crate::chain::{ChainError, ChainReader, OwnerInfo, RawLog, RegistryContract, RewardShare, TxReceipt};
use crate::conviction::{convict_commit, REVERT_BLOCK_NOT_FOUND, REVERT_TOO_OLD_OR_CORRECT, REVERT_WRONG_CONVICT_HASH};
use crate::events::TypedEvent;
use crate::vote::{recover_vote, REVERT_DEPOSIT_STILL_LOCKED, REVERT_NOT_ENOUGH_VOTING_POWER};
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use incubed_core::crypto::{block_sign_hash, keccak256_concat, recover_address};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const REGISTRY_ADDRESS: Address = Address::new([0x1E; 20]);
pub const DEFAULT_SENDER: Address = Address::new([0xDE; 20]);
pub const GENESIS_TIME: u64 = 1_700_000_000;
pub const BLOCK_TIME: u64 = 15;
/// Seconds a node must be registered before it may vote.
pub const VOTING_EPOCH: u64 = 3_600;
pub const MAX_VOTERS: usize = 24;

const MIN_TIMEOUT: u64 = 3_600;
const VOTE_LOCK: u64 = 3_600;
const BLOCKHASH_WINDOW: u64 = 256;
const LOW_DEPOSIT_PERIOD: u64 = 14 * 86_400;
const LIMITED_PERIOD: u64 = 365 * 86_400;
const DAY: u64 = 86_400;

const REVERT_ALREADY_REGISTERED: &str = "Server with the same url or owner is already registered";
const REVERT_NO_SERVER: &str = "sender does not own a server";
const REVERT_LIMIT: &str = "Limit of 50 ETH reached";
const REVERT_URL_IN_USE: &str = "url is already in use";
const REVERT_NOT_ENOUGH_DEPOSIT: &str = "not enough deposit";
const REVERT_ALREADY_UNREGISTERING: &str = "Server is already unregistering";
const REVERT_NOT_UNREGISTERING: &str = "server is not unregistering";
const REVERT_CONFIRM_TOO_EARLY: &str = "Only confirm after the timeout allowed";
const REVERT_OWNER_HAS_NO_SERVER: &str = "owner does not have a server";
const REVERT_NOT_SIGNED_BY_OWNER: &str = "the block was not signed by the owner of the server";
const REVERT_NO_SIGNATURES: &str = "provided no signatures";
const REVERT_NOTHING_TO_TRANSFER: &str = "nothing to transfer";

fn finney(n: u64) -> U256 {
    U256::from(n) * U256::from(1_000_000_000_000_000u64)
}

fn ether(n: u64) -> U256 {
    finney(n * 1_000)
}

#[derive(Clone, Debug)]
struct Server {
    owner: Address,
    url: String,
    deposit: U256,
    props: U256,
    timeout: u64,
    registered_at: u64,
    unregister_time: u64,
}

#[derive(Clone, Debug, Default)]
struct OwnerSlot {
    used: bool,
    index: u64,
    locked_until: u64,
    deposit: U256,
}

#[derive(Clone, Debug, Default)]
struct Contract {
    servers: Vec<Server>,
    owners: HashMap<Address, OwnerSlot>,
    commits: HashMap<(Address, u64), B256>,
    snapshots: BTreeMap<u64, B256>,
    last_registered: u64,
    last_deposit: U256,
    paid: HashMap<Address, U256>,
}

impl Contract {
    fn owned(&self, owner: &Address) -> Option<usize> {
        self.owners
            .get(owner)
            .filter(|slot| slot.used)
            .map(|slot| slot.index as usize)
    }

    fn balance(&self) -> U256 {
        let deposits = self.servers.iter().fold(U256::ZERO, |acc, s| acc + s.deposit);
        self.owners.values().fold(deposits, |acc, o| acc + o.deposit)
    }

    fn check_limit(&self, now: u64, added: U256) -> Result<(), &'static str> {
        if now < GENESIS_TIME + LIMITED_PERIOD && self.balance() + added >= ether(50) {
            return Err(REVERT_LIMIT);
        }
        Ok(())
    }

    fn min_deposit(&self, now: u64) -> U256 {
        if now < GENESIS_TIME + LOW_DEPOSIT_PERIOD {
            return finney(10);
        }
        let elapsed = now.saturating_sub(self.last_registered).max(1);
        (self.last_deposit * U256::from(DAY) / U256::from(elapsed)).max(finney(10))
    }

    fn pay(&mut self, to: Address, amount: U256) {
        *self.paid.entry(to).or_default() += amount;
    }

    /// Swap-remove the server at `index` and free its owner.
    fn remove(&mut self, index: usize) -> TypedEvent {
        let removed = self.servers.swap_remove(index);
        if let Some(slot) = self.owners.get_mut(&removed.owner) {
            slot.used = false;
        }
        if let Some(moved) = self.servers.get(index) {
            if let Some(slot) = self.owners.get_mut(&moved.owner) {
                slot.index = index as u64;
            }
        }
        TypedEvent::Removed {
            owner: removed.owner,
            index: index as u64,
        }
    }

    fn valid_voters(&self, timestamp: u64, target: &Address) -> Vec<(usize, &Server)> {
        let mut voters: Vec<(usize, &Server)> = self
            .servers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.owner != *target && s.registered_at + VOTING_EPOCH <= timestamp)
            .collect();
        voters.sort_by(|(ia, a), (ib, b)| {
            b.registered_at.cmp(&a.registered_at).then_with(|| ib.cmp(ia))
        });
        voters.truncate(MAX_VOTERS);
        voters
    }
}

struct Block {
    hash: B256,
    timestamp: u64,
    logs: Vec<RawLog>,
    /// Contract state after this block.
    contract: Contract,
}

struct Chain {
    blocks: Vec<Block>,
    time: u64,
    salt: u64,
    /// Mined transactions whose receipt is withheld from the sender.
    lost_receipts: u32,
}

impl Chain {
    fn head(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    fn contract(&self) -> &Contract {
        // Genesis always exists
        &self.blocks[self.blocks.len() - 1].contract
    }

    fn mine(&mut self, contract: Contract, events: Vec<TypedEvent>) -> TxReceipt {
        let number = self.head() + 1;
        self.time += BLOCK_TIME;
        let hash = keccak256_concat(&[&self.salt.to_be_bytes()[..], &number.to_be_bytes()[..]]);
        let transaction_hash = keccak256_concat(&[hash.as_slice(), b"tx"]);
        let logs: Vec<RawLog> = events
            .iter()
            .enumerate()
            .map(|(i, event)| {
                let (topics, data) = event.encode();
                RawLog {
                    address: REGISTRY_ADDRESS,
                    topics,
                    data,
                    block_number: number,
                    block_hash: hash,
                    transaction_hash,
                    log_index: i as u64,
                }
            })
            .collect();
        self.blocks.push(Block {
            hash,
            timestamp: self.time,
            logs: logs.clone(),
            contract,
        });
        TxReceipt {
            transaction_hash,
            block_number: number,
            block_hash: hash,
            logs,
        }
    }
}

/// Execution context of the transaction being mined.
struct Tx<'a> {
    sender: Address,
    number: u64,
    timestamp: u64,
    blocks: &'a [Block],
}

impl Tx<'_> {
    /// `blockhash(n)` with the block-hash registry as fallback.
    fn block_hash(&self, contract: &Contract, n: u64) -> Option<B256> {
        if n < self.number && self.number - n <= BLOCKHASH_WINDOW {
            self.blocks.get(n as usize).map(|b| b.hash)
        } else {
            contract.snapshots.get(&n).copied()
        }
    }
}

#[derive(Clone)]
pub struct SimRegistry {
    chain: Arc<Mutex<Chain>>,
    sender: Address,
}

impl Default for SimRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRegistry {
    pub fn new() -> Self {
        let genesis = Block {
            hash: keccak256_concat(&[&0u64.to_be_bytes()[..], &0u64.to_be_bytes()[..]]),
            timestamp: GENESIS_TIME,
            logs: Vec::new(),
            contract: Contract::default(),
        };
        Self {
            chain: Arc::new(Mutex::new(Chain {
                blocks: vec![genesis],
                time: GENESIS_TIME,
                salt: 0,
                lost_receipts: 0,
            })),
            sender: DEFAULT_SENDER,
        }
    }

    /// The same chain, sending from `sender`.
    pub fn as_sender(&self, sender: Address) -> Self {
        Self {
            chain: self.chain.clone(),
            sender,
        }
    }

    pub fn head(&self) -> u64 {
        self.chain.lock().head()
    }

    /// Move the clock; the next block carries the new time.
    pub fn advance_time(&self, secs: u64) {
        self.chain.lock().time += secs;
    }

    pub fn mine_empty(&self, count: u64) {
        let mut chain = self.chain.lock();
        for _ in 0..count {
            let contract = chain.contract().clone();
            chain.mine(contract, Vec::new());
        }
    }

    /// Replace the newest `depth` blocks with empty ones.
    pub fn reorg(&self, depth: u64) {
        let mut chain = self.chain.lock();
        let keep = (chain.blocks.len() as u64).saturating_sub(depth).max(1) as usize;
        let replaced = chain.blocks.len() - keep;
        chain.blocks.truncate(keep);
        chain.salt += 1;
        chain.time = chain.blocks[keep - 1].timestamp;
        for _ in 0..replaced {
            let contract = chain.contract().clone();
            chain.mine(contract, Vec::new());
        }
    }

    pub fn server_count(&self) -> usize {
        self.chain.lock().contract().servers.len()
    }

    /// Everything the contract paid out to `account`.
    pub fn paid_to(&self, account: Address) -> U256 {
        self.chain
            .lock()
            .contract()
            .paid
            .get(&account)
            .copied()
            .unwrap_or_default()
    }

    /// Mine the next successful transaction but answer it with a timeout.
    pub fn lose_next_receipt(&self) {
        self.chain.lock().lost_receipts += 1;
    }

    /// Mine an empty block every `block_time` until the handle is aborted.
    pub fn spawn_miner(&self, block_time: Duration) -> JoinHandle<()> {
        let sim = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(block_time).await;
                sim.mine_empty(1);
            }
        })
    }

    fn transact<F>(&self, f: F) -> Result<TxReceipt, ChainError>
    where
        F: FnOnce(&mut Contract, &Tx<'_>) -> Result<Vec<TypedEvent>, &'static str>,
    {
        let mut chain = self.chain.lock();
        let mut contract = chain.contract().clone();
        let events = {
            let tx = Tx {
                sender: self.sender,
                number: chain.head() + 1,
                timestamp: chain.time + BLOCK_TIME,
                blocks: &chain.blocks,
            };
            f(&mut contract, &tx).map_err(ChainError::reverted)?
        };
        let receipt = chain.mine(contract, events);
        if chain.lost_receipts > 0 {
            chain.lost_receipts -= 1;
            return Err(ChainError::Timeout {
                what: "receipt".into(),
            });
        }
        Ok(receipt)
    }

    fn view<T>(&self, f: impl FnOnce(&Contract) -> T) -> T {
        f(self.chain.lock().contract())
    }
}

#[async_trait]
impl ChainReader for SimRegistry {
    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.head())
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>, ChainError> {
        Ok(self.chain.lock().blocks.get(number as usize).map(|b| b.hash))
    }

    async fn block_timestamp(&self, number: u64) -> Result<u64, ChainError> {
        self.chain
            .lock()
            .blocks
            .get(number as usize)
            .map(|b| b.timestamp)
            .ok_or_else(|| ChainError::Transport {
                reason: format!("unknown block {number}"),
            })
    }

    async fn registry_logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, ChainError> {
        let chain = self.chain.lock();
        Ok(chain
            .blocks
            .iter()
            .enumerate()
            .filter(|(number, _)| (from..=to).contains(&(*number as u64)))
            .flat_map(|(_, b)| b.logs.iter().cloned())
            .collect())
    }
}

#[async_trait]
impl RegistryContract for SimRegistry {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn register_server(
        &self,
        url: &str,
        props: U256,
        timeout: u64,
        deposit: U256,
    ) -> Result<TxReceipt, ChainError> {
        self.transact(|c, tx| {
            let url_taken = c.servers.iter().any(|s| s.url == url);
            if url_taken || c.owned(&tx.sender).is_some() {
                return Err(REVERT_ALREADY_REGISTERED);
            }
            c.check_limit(tx.timestamp, deposit)?;
            if deposit < c.min_deposit(tx.timestamp) {
                return Err(REVERT_NOT_ENOUGH_DEPOSIT);
            }
            let index = c.servers.len() as u64;
            let timeout = timeout.max(MIN_TIMEOUT);
            c.servers.push(Server {
                owner: tx.sender,
                url: url.to_string(),
                deposit,
                props,
                timeout,
                registered_at: tx.timestamp,
                unregister_time: 0,
            });
            let slot = c.owners.entry(tx.sender).or_default();
            slot.used = true;
            slot.index = index;
            c.last_registered = tx.timestamp;
            c.last_deposit = deposit;
            Ok(vec![TypedEvent::Registered {
                owner: tx.sender,
                index,
                url: url.to_string(),
                props,
                timeout,
                deposit,
                registered_at: tx.timestamp,
            }])
        })
    }

    async fn update_server(
        &self,
        url: &str,
        props: U256,
        timeout: u64,
        added_deposit: U256,
    ) -> Result<TxReceipt, ChainError> {
        self.transact(|c, tx| {
            let index = c.owned(&tx.sender).ok_or(REVERT_NO_SERVER)?;
            let url_taken = c
                .servers
                .iter()
                .enumerate()
                .any(|(i, s)| i != index && s.url == url);
            if url_taken {
                return Err(REVERT_URL_IN_USE);
            }
            if added_deposit > U256::ZERO {
                c.check_limit(tx.timestamp, added_deposit)?;
            }
            let server = &mut c.servers[index];
            server.url = url.to_string();
            server.props = props;
            if timeout > 0 {
                server.timeout = timeout.max(MIN_TIMEOUT);
            }
            server.deposit += added_deposit;
            Ok(vec![TypedEvent::Updated {
                owner: tx.sender,
                index: index as u64,
                url: server.url.clone(),
                props,
                timeout: server.timeout,
                deposit: server.deposit,
            }])
        })
    }

    async fn request_unregistering_server(&self) -> Result<TxReceipt, ChainError> {
        self.transact(|c, tx| {
            let index = c.owned(&tx.sender).ok_or(REVERT_NO_SERVER)?;
            let server = &mut c.servers[index];
            if server.unregister_time != 0 {
                return Err(REVERT_ALREADY_UNREGISTERING);
            }
            server.unregister_time = tx.timestamp + server.timeout;
            Ok(vec![TypedEvent::UnregisterRequested {
                owner: tx.sender,
                index: index as u64,
                requested_at: tx.timestamp,
                caller: tx.sender,
            }])
        })
    }

    async fn cancel_unregistering_server(&self) -> Result<TxReceipt, ChainError> {
        self.transact(|c, tx| {
            let index = c.owned(&tx.sender).ok_or(REVERT_NO_SERVER)?;
            let server = &mut c.servers[index];
            if server.unregister_time == 0 {
                return Err(REVERT_NOT_UNREGISTERING);
            }
            server.unregister_time = 0;
            Ok(vec![TypedEvent::UnregisterCancelled {
                owner: tx.sender,
                index: index as u64,
            }])
        })
    }

    async fn confirm_unregistering_server(&self) -> Result<TxReceipt, ChainError> {
        self.transact(|c, tx| {
            let index = c.owned(&tx.sender).ok_or(REVERT_NO_SERVER)?;
            let server = &c.servers[index];
            if server.unregister_time == 0 {
                return Err(REVERT_NOT_UNREGISTERING);
            }
            if tx.timestamp < server.unregister_time {
                return Err(REVERT_CONFIRM_TOO_EARLY);
            }
            let deposit = server.deposit;
            c.pay(tx.sender, deposit);
            let confirmed = TypedEvent::UnregisterConfirmed {
                owner: tx.sender,
                index: index as u64,
                deposit,
            };
            Ok(vec![confirmed, c.remove(index)])
        })
    }

    async fn convict(&self, block: u64, commit: B256) -> Result<TxReceipt, ChainError> {
        self.transact(|c, tx| {
            tx.block_hash(c, block).ok_or(REVERT_BLOCK_NOT_FOUND)?;
            c.commits.insert((tx.sender, block), commit);
            Ok(Vec::new())
        })
    }

    async fn reveal_convict(
        &self,
        owner: Address,
        block_hash: B256,
        block: u64,
        v: u8,
        r: B256,
        s: B256,
    ) -> Result<TxReceipt, ChainError> {
        self.transact(|c, tx| {
            let real = tx.block_hash(c, block).ok_or(REVERT_BLOCK_NOT_FOUND)?;
            if real == block_hash {
                return Err(REVERT_TOO_OLD_OR_CORRECT);
            }
            let index = c.owned(&owner).ok_or(REVERT_OWNER_HAS_NO_SERVER)?;
            let signer = recover_address(&block_sign_hash(&block_hash, block), &r, &s, v as u64);
            if signer != Ok(owner) {
                return Err(REVERT_NOT_SIGNED_BY_OWNER);
            }
            let expected = convict_commit(&block_hash, &tx.sender, v, &r, &s);
            if c.commits.get(&(tx.sender, block)) != Some(&expected) {
                return Err(REVERT_WRONG_CONVICT_HASH);
            }
            c.commits.remove(&(tx.sender, block));

            let slashed = c.servers[index].deposit;
            c.pay(tx.sender, slashed / U256::from(2));
            let convicted = TypedEvent::Convicted {
                owner,
                index: index as u64,
                block_number: block,
                convicter: tx.sender,
                slashed,
            };
            Ok(vec![convicted, c.remove(index)])
        })
    }

    async fn vote_unregister_server(
        &self,
        block: u64,
        owner: Address,
        signatures: Vec<Bytes>,
    ) -> Result<TxReceipt, ChainError> {
        self.transact(|c, tx| {
            let index = c.owned(&owner).ok_or(REVERT_OWNER_HAS_NO_SERVER)?;
            if signatures.is_empty() {
                return Err(REVERT_NO_SIGNATURES);
            }
            let hash = tx.block_hash(c, block).ok_or(REVERT_BLOCK_NOT_FOUND)?;
            let timestamp = tx.blocks[block as usize].timestamp;
            let voters = c.valid_voters(timestamp, &owner);
            let total = voters.iter().fold(U256::ZERO, |acc, (_, s)| acc + s.deposit);

            let mut counted = HashSet::new();
            let mut voted = U256::ZERO;
            for signature in &signatures {
                let Ok(signer) = recover_vote(signature, &hash, &owner) else {
                    continue;
                };
                if let Some((_, voter)) = voters.iter().find(|(_, s)| s.owner == signer) {
                    if counted.insert(signer) {
                        voted += voter.deposit;
                    }
                }
            }
            if voted * U256::from(2) <= total {
                return Err(REVERT_NOT_ENOUGH_VOTING_POWER);
            }

            let deposit = c.servers[index].deposit;
            let locked = deposit * U256::from(99) / U256::from(100);
            let locked_until = tx.timestamp + VOTE_LOCK;
            c.pay(tx.sender, deposit - locked);
            let slot = c.owners.entry(owner).or_default();
            slot.locked_until = locked_until;
            slot.deposit += locked;
            let kicked = TypedEvent::VoteCast {
                owner,
                index: index as u64,
                locked_until,
                locked_deposit: locked,
                caller: tx.sender,
            };
            Ok(vec![kicked, c.remove(index)])
        })
    }

    async fn get_valid_voters(&self, block: u64, owner: Address) -> Result<Vec<Address>, ChainError> {
        let timestamp = self.block_timestamp(block).await?;
        Ok(self.view(|c| {
            c.valid_voters(timestamp, &owner)
                .into_iter()
                .map(|(_, s)| s.owner)
                .collect()
        }))
    }

    async fn calculate_min_deposit(&self, _value: U256) -> Result<U256, ChainError> {
        let now = self.chain.lock().time;
        Ok(self.view(|c| c.min_deposit(now)))
    }

    async fn owner_index(&self, owner: Address) -> Result<OwnerInfo, ChainError> {
        Ok(self.view(|c| {
            let slot = c.owners.get(&owner).cloned().unwrap_or_default();
            OwnerInfo {
                used: slot.used,
                index: slot.index,
                locked_until: slot.locked_until,
                locked_deposit: slot.deposit,
            }
        }))
    }

    async fn return_deposit(&self) -> Result<TxReceipt, ChainError> {
        self.transact(|c, tx| {
            let slot = c.owners.get(&tx.sender).cloned().unwrap_or_default();
            if slot.deposit == U256::ZERO {
                return Err(REVERT_NOTHING_TO_TRANSFER);
            }
            if tx.timestamp < slot.locked_until {
                return Err(REVERT_DEPOSIT_STILL_LOCKED);
            }
            if let Some(slot) = c.owners.get_mut(&tx.sender) {
                slot.deposit = U256::ZERO;
            }
            c.pay(tx.sender, slot.deposit);
            Ok(vec![TypedEvent::DepositReturned {
                owner: tx.sender,
                amount: slot.deposit,
            }])
        })
    }

    async fn convict_reward_share(&self) -> Result<RewardShare, ChainError> {
        Ok(RewardShare {
            numerator: 1,
            denominator: 2,
        })
    }

    async fn snapshot(&self) -> Result<TxReceipt, ChainError> {
        self.transact(|c, tx| {
            let previous = tx.number - 1;
            let hash = tx.blocks[previous as usize].hash;
            c.snapshots.insert(previous, hash);
            Ok(Vec::new())
        })
    }

    async fn snapshot_covers(&self, block: u64) -> Result<bool, ChainError> {
        Ok(self.view(|c| c.snapshots.contains_key(&block)))
    }
}
