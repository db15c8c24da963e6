use super::*;
use crate::crypto::keccak256;
use crate::testing::{header_chain, receipt, BlockBuilder, BlockFixture, TestKey, TxTemplate};
use crate::types::{
    BlockData, BlockProof, BlockTransactions, Log, LogBlockProof, LogData, LogFilter, LogProof,
    LogReceiptProof, ReceiptData, ReceiptProof, TransactionProof,
};
use alloy_primitives::{Bloom, Bytes, U256};
use proptest::prelude::*;
use std::sync::OnceLock;

fn holder() -> Address {
    Address::repeat_byte(0x11)
}

fn fixture() -> &'static BlockFixture {
    static FIXTURE: OnceLock<BlockFixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        BlockBuilder::new(4_000)
            .filler(64)
            .account(holder(), 3, U256::from(10u64).pow(U256::from(18)))
            .build()
    })
}

fn balance_query() -> Query {
    Query::Balance {
        address: holder(),
        block: BlockRef::Latest,
    }
}

fn balance() -> ResponseValue {
    ResponseValue::Quantity(U256::from(10u64).pow(U256::from(18)))
}

fn signed_proof(signatures: Vec<Signature>) -> Proof {
    let mut proof = Proof::Account(fixture().account_proof(&holder(), &[]));
    *proof.signatures_mut() = signatures;
    proof
}

#[test]
fn test_wrong_hash_signature_becomes_evidence() {
    let fx = fixture();
    let honest = TestKey::new(1);
    let liar = TestKey::new(2);
    let wrong = B256::repeat_byte(0xEE);
    let proof = signed_proof(vec![
        honest.sign_block(&fx.header.hash(), 4_000),
        liar.sign_block(&wrong, 4_000),
    ]);
    let trusted = vec![honest.address(), liar.address()];
    let req = SignerRequirement { trusted: &trusted, required: 1 };
    let anchor = TrustAnchor::Hash(fx.header.hash());

    let verified = verify(&balance_query(), &balance(), &proof, &anchor, Some(&req))
        .expect("payload is still proven by the local header");
    assert_eq!(verified.signers, vec![honest.address()]);
    assert_eq!(verified.evidence.len(), 1);
    assert_eq!(verified.evidence[0].accused(), liar.address());
    assert_eq!(verified.evidence[0].signature.block_hash, wrong);
    assert_eq!(verified.evidence[0].expected_hash, fx.header.hash());
    assert_eq!(verified.blocks, vec![(4_000, fx.header.hash())]);
}

#[test]
fn test_duplicate_signatures_count_once() {
    let fx = fixture();
    let key = TestKey::new(1);
    let sig = key.sign_block(&fx.header.hash(), 4_000);
    let proof = signed_proof(vec![sig.clone(), sig]);
    let trusted = vec![key.address()];
    let req = SignerRequirement { trusted: &trusted, required: 2 };
    let anchor = TrustAnchor::Hash(fx.header.hash());
    assert!(matches!(
        verify(&balance_query(), &balance(), &proof, &anchor, Some(&req)),
        Err(VerificationError::IncompleteProof { .. })
    ));
}

#[test]
fn test_untrusted_signer_rejected() {
    let fx = fixture();
    let stranger = TestKey::new(9);
    let proof = signed_proof(vec![stranger.sign_block(&fx.header.hash(), 4_000)]);
    let trusted = vec![TestKey::new(1).address()];
    let req = SignerRequirement { trusted: &trusted, required: 1 };
    let anchor = TrustAnchor::Hash(fx.header.hash());
    assert_eq!(
        verify(&balance_query(), &balance(), &proof, &anchor, Some(&req)),
        Err(VerificationError::UnknownSigner { address: stranger.address() })
    );
}

#[test]
fn test_claimed_signer_must_match_recovered() {
    let fx = fixture();
    let key = TestKey::new(1);
    let mut sig = key.sign_block(&fx.header.hash(), 4_000);
    sig.address = TestKey::new(2).address();
    let proof = signed_proof(vec![sig]);
    let anchor = TrustAnchor::Hash(fx.header.hash());
    assert_eq!(
        verify(&balance_query(), &balance(), &proof, &anchor, None),
        Err(VerificationError::UnknownSigner { address: key.address() })
    );
}

#[test]
fn test_signature_for_foreign_block_is_malformed() {
    let fx = fixture();
    let key = TestKey::new(1);
    let proof = signed_proof(vec![key.sign_block(&fx.header.hash(), 3_999)]);
    let anchor = TrustAnchor::Hash(fx.header.hash());
    assert!(matches!(
        verify(&balance_query(), &balance(), &proof, &anchor, None),
        Err(VerificationError::MalformedProof { .. })
    ));
}

#[test]
fn test_signed_anchor_relies_on_signatures() {
    let fx = fixture();
    let a = TestKey::new(1);
    let b = TestKey::new(2);
    let trusted: BTreeSet<Address> = [a.address(), b.address()].into_iter().collect();
    let req = SignerRequirement { trusted: &trusted, required: 2 };

    let proof = signed_proof(vec![
        a.sign_block(&fx.header.hash(), 4_000),
        b.sign_block(&fx.header.hash(), 4_000),
    ]);
    let verified = verify(&balance_query(), &balance(), &proof, &TrustAnchor::Signed, Some(&req))
        .expect("two agreeing trusted signers");
    assert_eq!(verified.signers.len(), 2);

    // No local header and nothing demanded: nothing vouches for the block
    assert!(matches!(
        verify(&balance_query(), &balance(), &proof, &TrustAnchor::Signed, None),
        Err(VerificationError::IncompleteProof { .. })
    ));

    let c = TestKey::new(3);
    let trusted: BTreeSet<Address> = [a.address(), b.address(), c.address()].into_iter().collect();
    let req = SignerRequirement { trusted: &trusted, required: 2 };
    let proof = signed_proof(vec![
        a.sign_block(&fx.header.hash(), 4_000),
        b.sign_block(&fx.header.hash(), 4_000),
        c.sign_block(&B256::repeat_byte(1), 4_000),
    ]);
    assert!(matches!(
        verify(&balance_query(), &balance(), &proof, &TrustAnchor::Signed, Some(&req)),
        Err(VerificationError::IncompleteProof { .. })
    ));
}

fn header_only(header: &BlockHeader) -> (Query, ResponseValue, Proof) {
    let query = Query::BlockByNumber {
        number: header.number(),
        full: false,
    };
    let response = ResponseValue::Block(Some(Box::new(BlockData {
        header: header.clone(),
        transactions: None,
    })));
    let proof = Proof::Block(BlockProof {
        block: None,
        transactions: None,
        signatures: vec![],
    });
    (query, response, proof)
}

#[test]
fn test_ancestry_anchor() {
    let chain = header_chain(100, 6);
    let head = chain[5].clone();
    let path: Vec<BlockHeader> = chain[..5].iter().rev().cloned().collect();
    let anchor = TrustAnchor::Ancestry { head, path: path.clone() };

    for header in &chain {
        let (query, response, proof) = header_only(header);
        assert!(verify(&query, &response, &proof, &anchor, None).is_ok());
    }

    let outside = BlockBuilder::new(99).build().header;
    let (query, response, proof) = header_only(&outside);
    assert!(matches!(
        verify(&query, &response, &proof, &anchor, None),
        Err(VerificationError::IncompleteProof { .. })
    ));

    // A sibling at the same height is not on the trusted path
    let sibling = BlockBuilder::new(102).parent(chain[1].hash()).timestamp(1).build().header;
    let (query, response, proof) = header_only(&sibling);
    assert!(matches!(
        verify(&query, &response, &proof, &anchor, None),
        Err(VerificationError::HeaderHashMismatch { number: 102, .. })
    ));

    let mut broken = path;
    broken.swap(1, 2);
    let anchor = TrustAnchor::Ancestry { head: chain[5].clone(), path: broken };
    let (query, response, proof) = header_only(&chain[5]);
    assert!(matches!(
        verify(&query, &response, &proof, &anchor, None),
        Err(VerificationError::MalformedProof { .. })
    ));
}

#[test]
fn test_blocks_anchor_needs_every_block() {
    let chain = header_chain(7, 2);
    let anchor = TrustAnchor::Blocks([(7, chain[0].hash())].into_iter().collect());
    let (query, response, proof) = header_only(&chain[0]);
    assert!(verify(&query, &response, &proof, &anchor, None).is_ok());
    let (query, response, proof) = header_only(&chain[1]);
    assert!(matches!(
        verify(&query, &response, &proof, &anchor, None),
        Err(VerificationError::IncompleteProof { .. })
    ));
}

#[test]
fn test_block_number_is_not_provable() {
    let fx = fixture();
    let anchor = TrustAnchor::Hash(fx.header.hash());
    assert!(matches!(
        verify(&Query::BlockNumber, &balance(), &signed_proof(vec![]), &anchor, None),
        Err(VerificationError::MalformedProof { .. })
    ));
}

#[test]
fn test_proof_kind_must_fit_query() {
    let fx = fixture();
    let anchor = TrustAnchor::Hash(fx.header.hash());
    let query = Query::TransactionByHash { hash: B256::ZERO };
    assert!(matches!(
        verify(&query, &ResponseValue::Transaction(None), &signed_proof(vec![]), &anchor, None),
        Err(VerificationError::MalformedProof { .. })
    ));
}

/// A block of transactions, each emitting `index % 3` logs.
fn tx_fixture() -> &'static BlockFixture {
    static FIXTURE: OnceLock<BlockFixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let sender = TestKey::new(5);
        let mut builder = BlockBuilder::new(900);
        for i in 0..24u64 {
            let raw = TxTemplate::legacy(i, Some(holder())).sign(&sender, Some(1));
            let logs = (0..i % 3)
                .map(|j| Log {
                    address: Address::repeat_byte(0x42),
                    topics: vec![B256::with_last_byte(j as u8)],
                    data: Bytes::from(vec![i as u8; 8]),
                })
                .collect();
            builder = builder.transaction(raw, receipt(0, 21_000 * (i + 1), logs));
        }
        builder.build()
    })
}

fn tx_anchor() -> TrustAnchor {
    TrustAnchor::Hash(tx_fixture().header.hash())
}

fn flip_node(nodes: &mut [Bytes], node: prop::sample::Index, byte: prop::sample::Index, bit: u8) {
    let node = node.index(nodes.len());
    let mut raw = nodes[node].to_vec();
    let byte = byte.index(raw.len());
    raw[byte] ^= 1 << bit;
    nodes[node] = raw.into();
}

fn transaction_case(index: u64) -> (Query, ResponseValue, TransactionProof) {
    let fx = tx_fixture();
    let data = fx.transaction_data(index as usize);
    let query = Query::TransactionByHash { hash: data.hash };
    let proof = TransactionProof {
        block: fx.header.clone(),
        tx_index: index,
        merkle_proof: fx.tx_proof(index),
        signatures: vec![],
    };
    (query, ResponseValue::Transaction(Some(data)), proof)
}

fn receipt_case(index: u64) -> (Query, ReceiptData, ReceiptProof) {
    let fx = tx_fixture();
    let data = fx.receipt_data(index as usize);
    let query = Query::TransactionReceipt { hash: data.transaction_hash };
    let proof = ReceiptProof {
        block: fx.header.clone(),
        tx_index: index,
        tx_proof: fx.tx_proof(index),
        merkle_proof: fx.receipt_proof(index),
        signatures: vec![],
    };
    (query, data, proof)
}

/// Transactions 1 and 2 carry logs; their proofs sit in one block proof.
fn log_case() -> (Vec<LogData>, LogProof) {
    let fx = tx_fixture();
    let mut logs = fx.log_data(1);
    logs.extend(fx.log_data(2));
    let receipts = [1u64, 2]
        .into_iter()
        .map(|i| {
            let entry = LogReceiptProof {
                tx_index: i,
                tx_proof: fx.tx_proof(i),
                receipt_proof: fx.receipt_proof(i),
            };
            (keccak256(&fx.raw_transactions()[i as usize]), entry)
        })
        .collect();
    let block = LogBlockProof {
        block: fx.header.clone(),
        receipts,
    };
    let proof = LogProof {
        blocks: [(900, block)].into_iter().collect(),
        signatures: vec![],
    };
    (logs, proof)
}

fn block_case() -> (Query, ResponseValue, Vec<Bytes>) {
    let fx = tx_fixture();
    let raw = fx.raw_transactions();
    let hashes = raw.iter().map(keccak256).collect();
    let query = Query::BlockByNumber { number: 900, full: false };
    let response = ResponseValue::Block(Some(Box::new(BlockData {
        header: fx.header.clone(),
        transactions: Some(BlockTransactions::Hashes(hashes)),
    })));
    (query, response, raw)
}

#[test]
fn test_untampered_cases_verify() {
    let anchor = tx_anchor();
    let (query, response, proof) = transaction_case(7);
    assert!(verify(&query, &response, &Proof::Transaction(proof), &anchor, None).is_ok());
    let (query, data, proof) = receipt_case(8);
    let response = ResponseValue::Receipt(Some(data));
    assert!(verify(&query, &response, &Proof::Receipt(proof), &anchor, None).is_ok());
    let (logs, proof) = log_case();
    let query = Query::Logs(LogFilter::default());
    assert!(verify(&query, &ResponseValue::Logs(logs), &Proof::Log(proof), &anchor, None).is_ok());
    let (query, response, raw) = block_case();
    let proof = Proof::Block(BlockProof {
        block: None,
        transactions: Some(raw),
        signatures: vec![],
    });
    assert!(verify(&query, &response, &proof, &anchor, None).is_ok());
}

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    }
}

proptest! {
    #![proptest_config(proptest_config())]
    #[test]
    fn tampered_proof_node_never_verifies(node in any::<prop::sample::Index>(), byte in any::<prop::sample::Index>(), bit in 0u8..8) {
        let fx = fixture();
        let mut entry = fx.account_entry(&holder(), &[]);
        let node = node.index(entry.account_proof.len());
        let mut raw = entry.account_proof[node].to_vec();
        let byte = byte.index(raw.len());
        raw[byte] ^= 1 << bit;
        entry.account_proof[node] = raw.into();

        let mut proof = fx.account_proof(&holder(), &[]);
        proof.accounts.insert(holder(), entry);
        let anchor = TrustAnchor::Hash(fx.header.hash());
        prop_assert!(verify(&balance_query(), &balance(), &Proof::Account(proof), &anchor, None).is_err());
    }

    #[test]
    fn tampered_balance_never_verifies(bit in 0usize..256) {
        let fx = fixture();
        let proof = Proof::Account(fx.account_proof(&holder(), &[]));
        let anchor = TrustAnchor::Hash(fx.header.hash());
        let claimed = U256::from(10u64).pow(U256::from(18)) ^ (U256::from(1) << bit);
        let result = verify(&balance_query(), &ResponseValue::Quantity(claimed), &proof, &anchor, None);
        prop_assert_eq!(result, Err(VerificationError::ValueMismatch { field: "account" }));
    }

    #[test]
    fn tampered_transaction_proof_never_verifies(
        index in 0u64..24,
        node in any::<prop::sample::Index>(),
        byte in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let (query, response, mut proof) = transaction_case(index);
        flip_node(&mut proof.merkle_proof, node, byte, bit);
        prop_assert!(verify(&query, &response, &Proof::Transaction(proof), &tx_anchor(), None).is_err());
    }

    #[test]
    fn tampered_transaction_payload_never_verifies(index in 0u64..24, bit in 0usize..256, in_value in any::<bool>()) {
        let (query, response, proof) = transaction_case(index);
        let ResponseValue::Transaction(Some(mut data)) = response else {
            unreachable!("transaction_case answers with a transaction");
        };
        let field = if in_value {
            data.value ^= U256::from(1) << bit;
            "value"
        } else {
            let mut r = data.r.0;
            r[bit / 8] ^= 1u8 << (bit % 8);
            data.r = B256::from(r);
            "signature"
        };
        let response = ResponseValue::Transaction(Some(data));
        prop_assert_eq!(
            verify(&query, &response, &Proof::Transaction(proof), &tx_anchor(), None),
            Err(VerificationError::ValueMismatch { field })
        );
    }

    #[test]
    fn tampered_receipt_proofs_never_verify(
        index in 0u64..24,
        in_tx_proof in any::<bool>(),
        node in any::<prop::sample::Index>(),
        byte in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let (query, data, mut proof) = receipt_case(index);
        if in_tx_proof {
            flip_node(&mut proof.tx_proof, node, byte, bit);
        } else {
            flip_node(&mut proof.merkle_proof, node, byte, bit);
        }
        let response = ResponseValue::Receipt(Some(data));
        prop_assert!(verify(&query, &response, &Proof::Receipt(proof), &tx_anchor(), None).is_err());
    }

    #[test]
    fn tampered_receipt_payload_never_verifies(index in 1u64..24, bit in 0usize..2048, in_bloom in any::<bool>()) {
        let (query, mut data, proof) = receipt_case(index);
        let field = if in_bloom {
            let mut bloom = data.logs_bloom.0 .0;
            bloom[bit / 8] ^= 1u8 << (bit % 8);
            data.logs_bloom = Bloom::from(bloom);
            "logsBloom"
        } else {
            data.cumulative_gas_used ^= 1u64 << (bit % 64);
            "cumulativeGasUsed"
        };
        let response = ResponseValue::Receipt(Some(data));
        prop_assert_eq!(
            verify(&query, &response, &Proof::Receipt(proof), &tx_anchor(), None),
            Err(VerificationError::ValueMismatch { field })
        );
    }

    #[test]
    fn tampered_log_proof_never_verifies(
        tx in 1u64..3,
        in_tx_proof in any::<bool>(),
        node in any::<prop::sample::Index>(),
        byte in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let (logs, mut proof) = log_case();
        let hash = keccak256(&tx_fixture().raw_transactions()[tx as usize]);
        let entry = proof
            .blocks
            .get_mut(&900)
            .and_then(|b| b.receipts.get_mut(&hash))
            .expect("receipt proof for the transaction");
        if in_tx_proof {
            flip_node(&mut entry.tx_proof, node, byte, bit);
        } else {
            flip_node(&mut entry.receipt_proof, node, byte, bit);
        }
        let query = Query::Logs(LogFilter::default());
        prop_assert!(verify(&query, &ResponseValue::Logs(logs), &Proof::Log(proof), &tx_anchor(), None).is_err());
    }

    #[test]
    fn tampered_log_payload_never_verifies(log in any::<prop::sample::Index>(), byte in 0usize..8, bit in 0u8..8) {
        let (mut logs, proof) = log_case();
        let log = log.index(logs.len());
        let mut data = logs[log].data.to_vec();
        data[byte] ^= 1 << bit;
        logs[log].data = data.into();
        let query = Query::Logs(LogFilter::default());
        prop_assert_eq!(
            verify(&query, &ResponseValue::Logs(logs), &Proof::Log(proof), &tx_anchor(), None),
            Err(VerificationError::ValueMismatch { field: "log" })
        );
    }

    #[test]
    fn tampered_block_transactions_never_verify(
        tx in any::<prop::sample::Index>(),
        byte in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let (query, response, mut raw) = block_case();
        flip_node(&mut raw, tx, byte, bit);
        let proof = Proof::Block(BlockProof {
            block: None,
            transactions: Some(raw),
            signatures: vec![],
        });
        prop_assert!(verify(&query, &response, &proof, &tx_anchor(), None).is_err());
    }
}
