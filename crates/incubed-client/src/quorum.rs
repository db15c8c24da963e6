//! Choosing one value out of the answers the selected nodes gave.

use alloy_primitives::Address;
use incubed_core::{Misbehavior, Query, ResponseValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptPolicy {
    /// A single verified answer is enough.
    Proof,
    /// Unprovable quantities: take the largest reported.
    MaxValue,
}

impl AcceptPolicy {
    pub fn for_query(query: &Query) -> Self {
        if query.is_provable() {
            AcceptPolicy::Proof
        } else {
            AcceptPolicy::MaxValue
        }
    }
}

/// An answer that passed verification, or needed none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Answer {
    pub node: Address,
    pub value: ResponseValue,
    /// Signatures over wrong block hashes found in the proof.
    pub evidence: Vec<Misbehavior>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuorumOutcome {
    Accepted {
        value: ResponseValue,
        node: Address,
    },
    /// The value stands, but some signer attested to a different block hash.
    Disagreement {
        value: ResponseValue,
        node: Address,
        evidence: Vec<Misbehavior>,
    },
}

impl QuorumOutcome {
    pub fn value(&self) -> &ResponseValue {
        match self {
            QuorumOutcome::Accepted { value, .. } | QuorumOutcome::Disagreement { value, .. } => value,
        }
    }

    pub fn into_value(self) -> ResponseValue {
        match self {
            QuorumOutcome::Accepted { value, .. } | QuorumOutcome::Disagreement { value, .. } => value,
        }
    }

    pub fn node(&self) -> Address {
        match self {
            QuorumOutcome::Accepted { node, .. } | QuorumOutcome::Disagreement { node, .. } => *node,
        }
    }

    pub fn evidence(&self) -> &[Misbehavior] {
        match self {
            QuorumOutcome::Accepted { .. } => &[],
            QuorumOutcome::Disagreement { evidence, .. } => evidence,
        }
    }
}

/// Accept one answer under `policy`. `None` when no answer qualifies.
pub fn accept(policy: AcceptPolicy, answers: &[Answer]) -> Option<QuorumOutcome> {
    let chosen = match policy {
        AcceptPolicy::Proof => answers.first()?,
        AcceptPolicy::MaxValue => answers
            .iter()
            .filter_map(|a| a.value.as_quantity().map(|q| (q, a)))
            // First of equal maxima wins
            .fold(None, |best: Option<(_, &Answer)>, (q, a)| match best {
                Some((b, _)) if b >= q => best,
                _ => Some((q, a)),
            })
            .map(|(_, a)| a)?,
    };

    let mut evidence: Vec<Misbehavior> = Vec::new();
    for item in answers.iter().flat_map(|a| a.evidence.iter()) {
        if !evidence.contains(item) {
            evidence.push(item.clone());
        }
    }

    Some(if evidence.is_empty() {
        QuorumOutcome::Accepted {
            value: chosen.value.clone(),
            node: chosen.node,
        }
    } else {
        QuorumOutcome::Disagreement {
            value: chosen.value.clone(),
            node: chosen.node,
            evidence,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{B256, U256};
    use incubed_core::testing::TestKey;
    use incubed_core::types::BlockRef;

    fn answer(node: u8, value: u64) -> Answer {
        Answer {
            node: Address::with_last_byte(node),
            value: ResponseValue::Quantity(U256::from(value)),
            evidence: vec![],
        }
    }

    #[test]
    fn test_policy_follows_provability() {
        assert_eq!(AcceptPolicy::for_query(&Query::BlockNumber), AcceptPolicy::MaxValue);
        let balance = Query::Balance {
            address: Address::ZERO,
            block: BlockRef::Latest,
        };
        assert_eq!(AcceptPolicy::for_query(&balance), AcceptPolicy::Proof);
    }

    #[test]
    fn test_max_value_takes_the_largest() {
        let answers = [answer(1, 1), answer(2, 2), answer(3, 4)];
        let outcome = accept(AcceptPolicy::MaxValue, &answers).unwrap();
        assert_eq!(
            outcome,
            QuorumOutcome::Accepted {
                value: ResponseValue::Quantity(U256::from(4)),
                node: Address::with_last_byte(3),
            }
        );
        let single = accept(AcceptPolicy::MaxValue, &answers[..1]).unwrap();
        assert_eq!(single.value().as_quantity(), Some(U256::from(1)));

        let tie = accept(AcceptPolicy::MaxValue, &[answer(1, 5), answer(2, 5)]).unwrap();
        assert_eq!(tie.node(), Address::with_last_byte(1));
    }

    #[test]
    fn test_nothing_to_accept() {
        assert_eq!(accept(AcceptPolicy::Proof, &[]), None);
        let bytes = Answer {
            node: Address::ZERO,
            value: ResponseValue::Bytes(Default::default()),
            evidence: vec![],
        };
        assert_eq!(accept(AcceptPolicy::MaxValue, &[bytes]), None);
    }

    #[test]
    fn test_evidence_turns_acceptance_into_disagreement() {
        let liar = TestKey::new(5);
        let evidence = Misbehavior {
            signature: liar.sign_block(&B256::repeat_byte(0xEE), 10),
            expected_hash: B256::repeat_byte(0x11),
        };
        let mut first = answer(1, 7);
        first.evidence.push(evidence.clone());
        let mut second = answer(2, 7);
        second.evidence.push(evidence.clone());

        let outcome = accept(AcceptPolicy::Proof, &[first, second]).unwrap();
        assert_eq!(outcome.value().as_quantity(), Some(U256::from(7)));
        assert_eq!(outcome.evidence(), &[evidence]);
        assert!(matches!(outcome, QuorumOutcome::Disagreement { .. }));
    }
}
