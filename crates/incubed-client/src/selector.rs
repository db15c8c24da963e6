//! Weighted random node selection.

use crate::health::NodeHealth;
use crate::random::RandomSource;
use alloy_primitives::Address;
use incubed_registry::{NodeListState, NodeRecord};
use std::collections::HashSet;

/// What a node's chance of being picked is proportional to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Weighting {
    /// Deposit weight, scaled by health.
    #[default]
    Deposit,
    /// Health only.
    Uniform,
}

/// Pick up to `count` distinct nodes, skipping `exclude`.
///
/// Each draw picks a node with probability proportional to its weight among
/// those not yet picked. The result is fully determined by `rng`.
pub fn select_nodes(
    state: &NodeListState,
    count: usize,
    weighting: Weighting,
    rng: &mut dyn RandomSource,
    health: &NodeHealth,
    exclude: &HashSet<Address>,
) -> Vec<NodeRecord> {
    let mut candidates: Vec<(&NodeRecord, f64)> = state
        .nodes()
        .iter()
        .filter(|n| !exclude.contains(&n.owner))
        .map(|n| {
            let base = match weighting {
                Weighting::Deposit => n.weight as f64,
                Weighting::Uniform => 1.0,
            };
            (n, base * health.factor(&n.owner))
        })
        .filter(|(_, w)| *w > 0.0)
        .collect();

    let mut picked = Vec::with_capacity(count.min(candidates.len()));
    while picked.len() < count && !candidates.is_empty() {
        let total: f64 = candidates.iter().map(|(_, w)| w).sum();
        let target = rng.next_unit() * total;
        let mut acc = 0.0;
        let mut chosen = candidates.len() - 1;
        for (i, (_, w)) in candidates.iter().enumerate() {
            acc += w;
            if target < acc {
                chosen = i;
                break;
            }
        }
        let (node, _) = candidates.remove(chosen);
        picked.push(node.clone());
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ManualClock;
    use crate::random::{ChaChaSource, FixedSource};
    use alloy_primitives::{B256, U256};
    use incubed_registry::TypedEvent;
    use std::collections::HashMap;
    use std::time::Duration;

    fn state(deposits: &[u64]) -> NodeListState {
        let mut state = NodeListState::new(0, B256::ZERO, U256::from(1));
        for (i, deposit) in deposits.iter().enumerate() {
            state
                .apply(&TypedEvent::Registered {
                    owner: Address::with_last_byte(i as u8 + 1),
                    index: i as u64,
                    url: format!("https://n{i}.example"),
                    props: U256::ZERO,
                    timeout: 3_600,
                    deposit: U256::from(*deposit),
                    registered_at: 0,
                })
                .unwrap();
        }
        state
    }

    fn health() -> NodeHealth {
        NodeHealth::new(Box::new(ManualClock::new()), Duration::from_secs(60))
    }

    #[test]
    fn test_picks_distinct_nodes() {
        let state = state(&[1, 1, 1, 1, 1]);
        let mut rng = ChaChaSource::seeded(3);
        let picked = select_nodes(&state, 3, Weighting::Deposit, &mut rng, &health(), &HashSet::new());
        let owners: HashSet<_> = picked.iter().map(|n| n.owner).collect();
        assert_eq!(owners.len(), 3);

        let all = select_nodes(&state, 10, Weighting::Deposit, &mut rng, &health(), &HashSet::new());
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_fixed_randomness_is_deterministic() {
        let state = state(&[1, 2, 4]);
        let first = select_nodes(
            &state,
            1,
            Weighting::Deposit,
            &mut FixedSource::new(vec![0.0]),
            &health(),
            &HashSet::new(),
        );
        assert_eq!(first[0].owner, Address::with_last_byte(1));

        // 0.5 of a total weight of 7 lands in the third node's share
        let third = select_nodes(
            &state,
            1,
            Weighting::Deposit,
            &mut FixedSource::new(vec![0.5]),
            &health(),
            &HashSet::new(),
        );
        assert_eq!(third[0].owner, Address::with_last_byte(3));

        let uniform = select_nodes(
            &state,
            1,
            Weighting::Uniform,
            &mut FixedSource::new(vec![0.5]),
            &health(),
            &HashSet::new(),
        );
        assert_eq!(uniform[0].owner, Address::with_last_byte(2));
    }

    #[test]
    fn test_excluded_nodes_are_never_picked() {
        let state = state(&[1, 1, 1]);
        let exclude: HashSet<_> = [Address::with_last_byte(1), Address::with_last_byte(3)].into();
        let mut rng = ChaChaSource::seeded(1);
        for _ in 0..20 {
            let picked = select_nodes(&state, 2, Weighting::Deposit, &mut rng, &health(), &exclude);
            assert_eq!(picked.len(), 1);
            assert_eq!(picked[0].owner, Address::with_last_byte(2));
        }
    }

    #[test]
    fn test_weight_and_health_shape_the_distribution() {
        let state = state(&[1, 9]);
        let health = health();
        let mut rng = ChaChaSource::seeded(11);
        let mut counts: HashMap<Address, u32> = HashMap::new();
        for _ in 0..2_000 {
            let picked = select_nodes(&state, 1, Weighting::Deposit, &mut rng, &health, &HashSet::new());
            *counts.entry(picked[0].owner).or_default() += 1;
        }
        let heavy = counts[&Address::with_last_byte(2)];
        assert!((1_600..1_990).contains(&heavy), "heavy node picked {heavy} times");

        // Four strikes bring the heavy node's weight below the light one
        for _ in 0..4 {
            health.penalize(&Address::with_last_byte(2));
        }
        counts.clear();
        for _ in 0..2_000 {
            let picked = select_nodes(&state, 1, Weighting::Deposit, &mut rng, &health, &HashSet::new());
            *counts.entry(picked[0].owner).or_default() += 1;
        }
        let heavy = counts.get(&Address::with_last_byte(2)).copied().unwrap_or(0);
        assert!(heavy < 1_000, "penalized node picked {heavy} times");
    }

    #[test]
    fn test_empty_list_yields_nothing() {
        let state = state(&[]);
        let mut rng = ChaChaSource::seeded(1);
        assert!(select_nodes(&state, 3, Weighting::Deposit, &mut rng, &health(), &HashSet::new()).is_empty());
    }
}
