//! `eth_getLogs` responses.
//!
//! Every reported log must sit in a proven receipt of a proven transaction in
//! a block the proof carries, at the position its `logIndex` names. Within one
//! receipt the indexes differ from the positions by a common offset, the index
//! of the receipt's first log in the block. Completeness of the result set is
//! not provable: a node can always omit matching logs.

use super::transaction::{prove_receipt, prove_transaction};
use super::{check_reported_block, proof_kind_mismatch, unexpected_response, VerificationError};
use crate::types::{BlockHeader, Log, LogData, LogProof, Query, ResponseValue, TransactionReceipt};
use alloy_primitives::B256;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

pub(super) fn verify_logs<'p>(
    query: &Query,
    response: &ResponseValue,
    proof: &'p LogProof,
) -> Result<Vec<&'p BlockHeader>, VerificationError> {
    let filter = match query {
        Query::Logs(filter) => filter,
        _ => return Err(proof_kind_mismatch(query, "logProof")),
    };
    let logs = match response {
        ResponseValue::Logs(logs) => logs,
        _ => return Err(unexpected_response(query)),
    };

    let mut receipts: BTreeMap<(u64, B256), TransactionReceipt> = BTreeMap::new();
    let mut reported: BTreeMap<(u64, B256), Vec<&LogData>> = BTreeMap::new();
    let mut used: BTreeMap<u64, &'p BlockHeader> = BTreeMap::new();

    for log in logs {
        if !filter.matches(log) {
            return Err(VerificationError::ValueMismatch { field: "filter" });
        }
        let block = proof.blocks.get(&log.block_number).ok_or_else(|| {
            VerificationError::incomplete(format!("no proof for block {}", log.block_number))
        })?;
        let header = &block.block;
        check_reported_block(header, &log.block_hash, log.block_number)?;

        let receipt = match receipts.entry((log.block_number, log.transaction_hash)) {
            Entry::Occupied(known) => known.into_mut(),
            Entry::Vacant(slot) => {
                let entry = block.receipts.get(&log.transaction_hash).ok_or_else(|| {
                    VerificationError::incomplete(format!(
                        "no receipt proof for transaction {}",
                        log.transaction_hash
                    ))
                })?;
                if entry.tx_index != log.transaction_index {
                    return Err(VerificationError::ValueMismatch {
                        field: "transactionIndex",
                    });
                }
                let tx = prove_transaction(header, entry.tx_index, &entry.tx_proof)?;
                if tx.hash != log.transaction_hash {
                    return Err(VerificationError::ValueMismatch {
                        field: "transactionHash",
                    });
                }
                slot.insert(prove_receipt(header, entry.tx_index, &entry.receipt_proof)?)
            }
        };

        if !receipt.logs.iter().any(|proven| same_log(proven, log)) {
            return Err(VerificationError::ValueMismatch { field: "log" });
        }
        reported
            .entry((log.block_number, log.transaction_hash))
            .or_default()
            .push(log);
        used.insert(header.number(), header);
    }

    for (key, logs) in &reported {
        if let Some(receipt) = receipts.get(key) {
            check_positions(receipt, logs)?;
        }
    }

    tracing::trace!(
        target: "verifier",
        logs = logs.len(),
        blocks = used.len(),
        receipts = receipts.len(),
        "log proof walked"
    );
    Ok(used.into_values().collect())
}

fn same_log(proven: &Log, log: &LogData) -> bool {
    proven.address == log.address && proven.topics == log.topics && proven.data == log.data
}

/// Some offset must place every reported log of one receipt on a distinct
/// proven log with the same content.
fn check_positions(receipt: &TransactionReceipt, logs: &[&LogData]) -> Result<(), VerificationError> {
    let fits = |offset: u64| {
        let mut seen = BTreeSet::new();
        logs.iter().all(|log| {
            let at = log
                .log_index
                .checked_sub(offset)
                .and_then(|p| usize::try_from(p).ok())
                .and_then(|p| receipt.logs.get(p));
            at.is_some_and(|proven| same_log(proven, log)) && seen.insert(log.log_index)
        })
    };
    let Some(first) = logs.first() else {
        return Ok(());
    };
    let placed = receipt
        .logs
        .iter()
        .enumerate()
        .filter(|(_, proven)| same_log(proven, first))
        .filter_map(|(p, _)| first.log_index.checked_sub(p as u64))
        .any(fits);
    if placed {
        Ok(())
    } else {
        Err(VerificationError::ValueMismatch { field: "logIndex" })
    }
}
