//! Per-node health used to scale selection weight.
//!
//! Each timeout or rejected response is a strike; a node's weight is halved
//! per strike. Strikes are forgiven one per decay interval.

use alloy_primitives::Address;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Clone, Debug)]
pub struct ManualClock(Arc<Mutex<Instant>>);

impl ManualClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.0.lock()
    }
}

#[derive(Clone, Copy, Debug)]
struct Strikes {
    count: u32,
    /// When `count` was last brought up to date.
    since: Instant,
}

pub struct NodeHealth {
    clock: Box<dyn Clock>,
    decay: Duration,
    strikes: Mutex<HashMap<Address, Strikes>>,
}

impl NodeHealth {
    pub fn new(clock: Box<dyn Clock>, decay: Duration) -> Self {
        Self {
            clock,
            decay: decay.max(Duration::from_millis(1)),
            strikes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_system_clock(decay: Duration) -> Self {
        Self::new(Box::new(SystemClock), decay)
    }

    /// Record a timeout or a rejected response.
    pub fn penalize(&self, node: &Address) {
        let now = self.clock.now();
        let mut strikes = self.strikes.lock();
        let entry = strikes.entry(*node).or_insert(Strikes { count: 0, since: now });
        self.settle(entry, now);
        entry.count = entry.count.saturating_add(1);
        debug!(target: "client", %node, strikes = entry.count, "Node penalized");
    }

    pub fn strikes(&self, node: &Address) -> u32 {
        let now = self.clock.now();
        let mut strikes = self.strikes.lock();
        match strikes.get_mut(node) {
            Some(entry) => {
                self.settle(entry, now);
                entry.count
            }
            None => 0,
        }
    }

    /// Multiplier in `(0, 1]` applied to the node's selection weight.
    pub fn factor(&self, node: &Address) -> f64 {
        let strikes = self.strikes(node).min(64);
        0.5f64.powi(strikes as i32)
    }

    fn settle(&self, entry: &mut Strikes, now: Instant) {
        let elapsed = now.saturating_duration_since(entry.since);
        let forgiven = (elapsed.as_nanos() / self.decay.as_nanos()) as u64;
        if forgiven == 0 {
            return;
        }
        entry.count = entry.count.saturating_sub(forgiven.min(u32::MAX as u64) as u32);
        entry.since = if entry.count == 0 {
            now
        } else {
            entry.since + self.decay * forgiven as u32
        };
    }
}
