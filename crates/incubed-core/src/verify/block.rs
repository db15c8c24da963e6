//! Full-block responses and per-block transaction counts.

use super::transaction::compare_transaction;
use super::{check_reported_block, proof_kind_mismatch, unexpected_response, VerificationError};
use crate::crypto::keccak256;
use crate::trie::ordered_trie_root;
use crate::types::{BlockHeader, BlockProof, BlockTransactions, Query, ResponseValue, SignedTransaction};
use alloy_primitives::{Bytes, U256};

pub(super) fn verify_block<'a>(
    query: &Query,
    response: &'a ResponseValue,
    proof: &'a BlockProof,
) -> Result<&'a BlockHeader, VerificationError> {
    match query {
        Query::BlockByNumber { .. } | Query::BlockByHash { .. } => verify_full_block(query, response, proof),
        Query::BlockTransactionCountByNumber { .. } | Query::BlockTransactionCountByHash { .. } => {
            verify_transaction_count(query, response, proof)
        }
        _ => Err(proof_kind_mismatch(query, "blockProof")),
    }
}

fn verify_full_block<'a>(
    query: &Query,
    response: &'a ResponseValue,
    proof: &'a BlockProof,
) -> Result<&'a BlockHeader, VerificationError> {
    let block = match response {
        ResponseValue::Block(Some(block)) => block,
        ResponseValue::Block(None) => {
            return Err(VerificationError::incomplete("absence of a block cannot be proven"))
        }
        _ => return Err(unexpected_response(query)),
    };
    let header = &block.header;
    if let Some(proven) = &proof.block {
        if proven.hash() != header.hash() {
            return Err(VerificationError::HeaderHashMismatch {
                number: header.number(),
                expected: proven.hash(),
                found: header.hash(),
            });
        }
    }
    check_requested_block(query, header)?;

    match &block.transactions {
        // The header hash alone anchors the block
        None => {}
        Some(BlockTransactions::Hashes(hashes)) => {
            let raw = raw_transactions(proof, "hash-only transaction list")?;
            check_transactions_root(header, raw)?;
            let hashes_ok = hashes.len() == raw.len()
                && hashes.iter().zip(raw).all(|(hash, raw)| *hash == keccak256(raw));
            if !hashes_ok {
                return Err(VerificationError::ValueMismatch {
                    field: "transactions",
                });
            }
        }
        Some(BlockTransactions::Full(transactions)) => {
            let raw = raw_transactions(proof, "full transaction list")?;
            check_transactions_root(header, raw)?;
            if transactions.len() != raw.len() {
                return Err(VerificationError::ValueMismatch {
                    field: "transactions",
                });
            }
            for (index, (data, raw)) in transactions.iter().zip(raw).enumerate() {
                let tx = SignedTransaction::decode(raw).map_err(|e| {
                    VerificationError::malformed(format!("transaction {}: {}", index, e))
                })?;
                check_reported_block(header, &data.block_hash, data.block_number)?;
                if data.transaction_index != index as u64 {
                    return Err(VerificationError::ValueMismatch {
                        field: "transactionIndex",
                    });
                }
                compare_transaction(data, &tx)?;
            }
        }
    }
    Ok(header)
}

fn verify_transaction_count<'a>(
    query: &Query,
    response: &'a ResponseValue,
    proof: &'a BlockProof,
) -> Result<&'a BlockHeader, VerificationError> {
    let count = match response {
        ResponseValue::Quantity(count) => *count,
        _ => return Err(unexpected_response(query)),
    };
    let header = proof
        .block
        .as_ref()
        .ok_or_else(|| VerificationError::incomplete("block proof without a header"))?;
    check_requested_block(query, header)?;

    let raw = raw_transactions(proof, "transaction count")?;
    check_transactions_root(header, raw)?;
    if U256::from(raw.len()) != count {
        return Err(VerificationError::ValueMismatch {
            field: "transactionCount",
        });
    }
    Ok(header)
}

fn check_requested_block(query: &Query, header: &BlockHeader) -> Result<(), VerificationError> {
    match query {
        Query::BlockByNumber { number, .. } | Query::BlockTransactionCountByNumber { number }
            if *number != header.number() =>
        {
            Err(VerificationError::ValueMismatch { field: "number" })
        }
        Query::BlockByHash { hash, .. } | Query::BlockTransactionCountByHash { hash }
            if *hash != header.hash() =>
        {
            Err(VerificationError::HeaderHashMismatch {
                number: header.number(),
                expected: *hash,
                found: header.hash(),
            })
        }
        _ => Ok(()),
    }
}

fn raw_transactions<'a>(proof: &'a BlockProof, what: &str) -> Result<&'a [Bytes], VerificationError> {
    proof.transactions.as_deref().ok_or_else(|| {
        VerificationError::incomplete(format!("{} needs the raw transactions", what))
    })
}

fn check_transactions_root(header: &BlockHeader, raw: &[Bytes]) -> Result<(), VerificationError> {
    let computed = ordered_trie_root(raw);
    if computed != header.transactions_root() {
        return Err(VerificationError::RootMismatch {
            trie: "transactions",
            computed,
            expected: header.transactions_root(),
        });
    }
    Ok(())
}
