//! Transaction and receipt responses.

use super::{check_block_ref, check_reported_block, proof_kind_mismatch, unexpected_response, VerificationError};
use crate::trie::verify_merkle_patricia_proof;
use crate::types::{
    BlockHeader, Query, ReceiptData, ReceiptProof, ResponseValue, SignedTransaction,
    TransactionData, TransactionProof, TransactionReceipt,
};
use alloy_primitives::Bytes;

pub(super) fn verify_transaction<'p>(
    query: &Query,
    response: &ResponseValue,
    proof: &'p TransactionProof,
) -> Result<&'p BlockHeader, VerificationError> {
    let header = &proof.block;
    match query {
        Query::TransactionByHash { .. } | Query::TransactionByBlockAndIndex { .. } => {}
        _ => return Err(proof_kind_mismatch(query, "transactionProof")),
    }
    let data = match response {
        ResponseValue::Transaction(Some(data)) => data,
        ResponseValue::Transaction(None) => {
            return Err(VerificationError::incomplete("absence of a transaction cannot be proven"))
        }
        _ => return Err(unexpected_response(query)),
    };

    let tx = prove_transaction(header, proof.tx_index, &proof.merkle_proof)?;

    match query {
        Query::TransactionByHash { hash } if *hash != tx.hash => {
            return Err(VerificationError::ValueMismatch { field: "hash" })
        }
        Query::TransactionByBlockAndIndex { block, index } => {
            check_block_ref(block, header)?;
            if *index != proof.tx_index {
                return Err(VerificationError::ValueMismatch {
                    field: "transactionIndex",
                });
            }
        }
        _ => {}
    }

    check_reported_block(header, &data.block_hash, data.block_number)?;
    if data.transaction_index != proof.tx_index {
        return Err(VerificationError::ValueMismatch {
            field: "transactionIndex",
        });
    }
    compare_transaction(data, &tx)?;
    Ok(header)
}

pub(super) fn verify_receipt<'p>(
    query: &Query,
    response: &ResponseValue,
    proof: &'p ReceiptProof,
) -> Result<&'p BlockHeader, VerificationError> {
    let hash = match query {
        Query::TransactionReceipt { hash } => hash,
        _ => return Err(proof_kind_mismatch(query, "receiptProof")),
    };
    let data = match response {
        ResponseValue::Receipt(Some(data)) => data,
        ResponseValue::Receipt(None) => {
            return Err(VerificationError::incomplete("absence of a receipt cannot be proven"))
        }
        _ => return Err(unexpected_response(query)),
    };
    let header = &proof.block;

    // The transaction proof ties the receipt's index to the requested hash
    let tx = prove_transaction(header, proof.tx_index, &proof.tx_proof)?;
    if tx.hash != *hash || data.transaction_hash != tx.hash {
        return Err(VerificationError::ValueMismatch {
            field: "transactionHash",
        });
    }
    check_reported_block(header, &data.block_hash, data.block_number)?;
    if data.transaction_index != proof.tx_index {
        return Err(VerificationError::ValueMismatch {
            field: "transactionIndex",
        });
    }

    let receipt = prove_receipt(header, proof.tx_index, &proof.merkle_proof)?;
    compare_receipt(data, &receipt)?;
    for log in &data.logs {
        check_reported_block(header, &log.block_hash, log.block_number)?;
        if log.transaction_hash != tx.hash || log.transaction_index != proof.tx_index {
            return Err(VerificationError::ValueMismatch { field: "logs" });
        }
    }
    Ok(header)
}

/// Walk the transactions trie to `index` and decode what is there.
pub(crate) fn prove_transaction(
    header: &BlockHeader,
    index: u64,
    proof: &[Bytes],
) -> Result<SignedTransaction, VerificationError> {
    let key = alloy_rlp::encode(index);
    let raw = verify_merkle_patricia_proof(&header.transactions_root(), &key, proof)
        .map_err(VerificationError::from_trie("transactions"))?
        .ok_or_else(|| {
            VerificationError::malformed(format!(
                "no transaction at index {} of block {}",
                index,
                header.number()
            ))
        })?;
    SignedTransaction::decode(raw)
        .map_err(|e| VerificationError::malformed(format!("transaction {}: {}", index, e)))
}

/// Walk the receipts trie to `index` and decode what is there.
pub(crate) fn prove_receipt(
    header: &BlockHeader,
    index: u64,
    proof: &[Bytes],
) -> Result<TransactionReceipt, VerificationError> {
    let key = alloy_rlp::encode(index);
    let raw = verify_merkle_patricia_proof(&header.receipts_root(), &key, proof)
        .map_err(VerificationError::from_trie("receipts"))?
        .ok_or_else(|| {
            VerificationError::malformed(format!(
                "no receipt at index {} of block {}",
                index,
                header.number()
            ))
        })?;
    TransactionReceipt::decode(raw)
        .map_err(|e| VerificationError::malformed(format!("receipt {}: {}", index, e)))
}

/// Every reported field must match the proven transaction.
pub(crate) fn compare_transaction(
    data: &TransactionData,
    tx: &SignedTransaction,
) -> Result<(), VerificationError> {
    // Nodes report the effective price for fee-market transactions
    let gas_price_ok = tx.gas_price.is_none() || data.gas_price == tx.gas_price;
    let fees_ok = tx.max_fee_per_gas.is_none()
        || (data.max_fee_per_gas == tx.max_fee_per_gas
            && data.max_priority_fee_per_gas == tx.max_priority_fee_per_gas);

    let checks = [
        ("hash", data.hash == tx.hash),
        ("from", data.from == tx.from),
        ("to", data.to == tx.to),
        ("nonce", data.nonce == tx.nonce),
        ("value", data.value == tx.value),
        ("gas", data.gas == tx.gas),
        ("gasPrice", gas_price_ok),
        ("maxFeePerGas", fees_ok),
        ("input", data.input == tx.input),
        ("signature", data.v == tx.v && data.r == tx.r && data.s == tx.s),
    ];
    match checks.iter().find(|(_, ok)| !ok) {
        Some((field, _)) => Err(VerificationError::ValueMismatch { field: *field }),
        None => Ok(()),
    }
}

fn compare_receipt(data: &ReceiptData, receipt: &TransactionReceipt) -> Result<(), VerificationError> {
    let logs_ok = data.logs.len() == receipt.logs.len()
        && data.logs.iter().zip(&receipt.logs).all(|(reported, proven)| {
            reported.address == proven.address
                && reported.topics == proven.topics
                && reported.data == proven.data
        });

    let checks = [
        ("status", data.status == receipt.status),
        ("cumulativeGasUsed", data.cumulative_gas_used == receipt.cumulative_gas_used),
        ("logsBloom", data.logs_bloom == receipt.logs_bloom),
        ("logs", logs_ok),
    ];
    match checks.iter().find(|(_, ok)| !ok) {
        Some((field, _)) => Err(VerificationError::ValueMismatch { field: *field }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{receipt, BlockBuilder, BlockFixture, TestKey, TxTemplate};
    use crate::types::{BlockRef, Log, Proof};
    use crate::verify::{verify, TrustAnchor};
    use alloy_primitives::{Address, B256};

    fn fixture() -> BlockFixture {
        let alice = TestKey::new(1);
        let bob = TestKey::new(2);
        let mut builder = BlockBuilder::new(500);
        for i in 0..20u64 {
            let raw = TxTemplate::legacy(i, Some(bob.address())).sign(&alice, Some(1));
            let logs = vec![Log {
                address: Address::repeat_byte(0xEE),
                topics: vec![B256::with_last_byte(i as u8)],
                data: Bytes::from(vec![i as u8; 40]),
            }];
            builder = builder.transaction(raw, receipt(0, 21_000 * (i + 1), logs));
        }
        let raw = TxTemplate::eip1559(0, alice.address()).sign(&bob, Some(1));
        builder.transaction(raw, receipt(2, 21_000 * 21, vec![])).build()
    }

    fn tx_proof(fx: &BlockFixture, index: u64) -> Proof {
        Proof::Transaction(TransactionProof {
            block: fx.header.clone(),
            tx_index: index,
            merkle_proof: fx.tx_proof(index),
            signatures: vec![],
        })
    }

    fn receipt_proof(fx: &BlockFixture, index: u64) -> Proof {
        Proof::Receipt(ReceiptProof {
            block: fx.header.clone(),
            tx_index: index,
            tx_proof: fx.tx_proof(index),
            merkle_proof: fx.receipt_proof(index),
            signatures: vec![],
        })
    }

    #[test]
    fn test_transaction_by_hash_verifies() {
        let fx = fixture();
        let anchor = TrustAnchor::Hash(fx.header.hash());
        for index in [0usize, 13, 20] {
            let data = fx.transaction_data(index);
            let query = Query::TransactionByHash { hash: data.hash };
            let response = ResponseValue::Transaction(Some(data));
            assert!(verify(&query, &response, &tx_proof(&fx, index as u64), &anchor, None).is_ok());
        }
    }

    #[test]
    fn test_transaction_by_block_and_index() {
        let fx = fixture();
        let anchor = TrustAnchor::Hash(fx.header.hash());
        let query = Query::TransactionByBlockAndIndex { block: BlockRef::Hash(fx.header.hash()), index: 4 };
        let response = ResponseValue::Transaction(Some(fx.transaction_data(4)));
        assert!(verify(&query, &response, &tx_proof(&fx, 4), &anchor, None).is_ok());

        let query = Query::TransactionByBlockAndIndex { block: BlockRef::Number(500), index: 5 };
        assert_eq!(
            verify(&query, &response, &tx_proof(&fx, 4), &anchor, None),
            Err(VerificationError::ValueMismatch { field: "transactionIndex" })
        );
    }

    #[test]
    fn test_spoofed_block_metadata_rejected() {
        let fx = fixture();
        let anchor = TrustAnchor::Hash(fx.header.hash());
        let mut data = fx.transaction_data(3);
        let query = Query::TransactionByHash { hash: data.hash };

        data.block_hash = B256::repeat_byte(0x55);
        let response = ResponseValue::Transaction(Some(data.clone()));
        assert!(matches!(
            verify(&query, &response, &tx_proof(&fx, 3), &anchor, None),
            Err(VerificationError::HeaderHashMismatch { .. })
        ));

        data.block_hash = fx.header.hash();
        data.block_number = 501;
        let response = ResponseValue::Transaction(Some(data));
        assert_eq!(
            verify(&query, &response, &tx_proof(&fx, 3), &anchor, None),
            Err(VerificationError::ValueMismatch { field: "blockNumber" })
        );
    }

    #[test]
    fn test_spoofed_transaction_fields_rejected() {
        let fx = fixture();
        let anchor = TrustAnchor::Hash(fx.header.hash());
        let mut data = fx.transaction_data(7);
        let query = Query::TransactionByHash { hash: data.hash };
        data.value += alloy_primitives::U256::from(1);
        let response = ResponseValue::Transaction(Some(data));
        assert_eq!(
            verify(&query, &response, &tx_proof(&fx, 7), &anchor, None),
            Err(VerificationError::ValueMismatch { field: "value" })
        );
    }

    #[test]
    fn test_proof_for_another_index_rejected() {
        let fx = fixture();
        let anchor = TrustAnchor::Hash(fx.header.hash());
        let data = fx.transaction_data(7);
        let query = Query::TransactionByHash { hash: data.hash };
        let response = ResponseValue::Transaction(Some(data));
        assert_eq!(
            verify(&query, &response, &tx_proof(&fx, 8), &anchor, None),
            Err(VerificationError::ValueMismatch { field: "hash" })
        );
    }

    #[test]
    fn test_receipt_verifies() {
        let fx = fixture();
        let anchor = TrustAnchor::Hash(fx.header.hash());
        for index in [0usize, 9, 20] {
            let data = fx.receipt_data(index);
            let query = Query::TransactionReceipt { hash: data.transaction_hash };
            let response = ResponseValue::Receipt(Some(data));
            assert!(verify(&query, &response, &receipt_proof(&fx, index as u64), &anchor, None).is_ok());
        }
    }

    #[test]
    fn test_receipt_with_altered_log_rejected() {
        let fx = fixture();
        let anchor = TrustAnchor::Hash(fx.header.hash());
        let mut data = fx.receipt_data(2);
        let query = Query::TransactionReceipt { hash: data.transaction_hash };
        data.logs[0].data = Bytes::from_static(b"forged");
        let response = ResponseValue::Receipt(Some(data));
        assert_eq!(
            verify(&query, &response, &receipt_proof(&fx, 2), &anchor, None),
            Err(VerificationError::ValueMismatch { field: "logs" })
        );
    }

    #[test]
    fn test_receipt_status_lie_rejected() {
        let fx = fixture();
        let anchor = TrustAnchor::Hash(fx.header.hash());
        let mut data = fx.receipt_data(2);
        let query = Query::TransactionReceipt { hash: data.transaction_hash };
        data.status = 0;
        let response = ResponseValue::Receipt(Some(data));
        assert_eq!(
            verify(&query, &response, &receipt_proof(&fx, 2), &anchor, None),
            Err(VerificationError::ValueMismatch { field: "status" })
        );
    }

    #[test]
    fn test_missing_transaction_is_incomplete() {
        let fx = fixture();
        let anchor = TrustAnchor::Hash(fx.header.hash());
        let query = Query::TransactionByHash { hash: B256::ZERO };
        assert!(matches!(
            verify(&query, &ResponseValue::Transaction(None), &tx_proof(&fx, 0), &anchor, None),
            Err(VerificationError::IncompleteProof { .. })
        ));
    }
}
