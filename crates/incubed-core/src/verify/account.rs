//! Account, storage and code responses, and `eth_call` state bundles.

use super::{check_block_ref, proof_kind_mismatch, unexpected_response, VerificationError};
use crate::crypto::keccak256;
use crate::trie::{verify_merkle_patricia_proof, verify_trie_value};
use crate::types::{
    AccountEntry, AccountProof, AccountState, BlockHeader, CallProof, Query, ResponseValue,
    StorageEntry,
};
use alloy_primitives::{Address, Bytes, B256, U256};

pub(super) fn verify_account<'p>(
    query: &Query,
    response: &ResponseValue,
    proof: &'p AccountProof,
) -> Result<&'p BlockHeader, VerificationError> {
    let (address, block) = match query {
        Query::Balance { address, block }
        | Query::TransactionCount { address, block }
        | Query::Code { address, block }
        | Query::StorageAt { address, block, .. } => (address, block),
        _ => return Err(proof_kind_mismatch(query, "accountProof")),
    };
    check_block_ref(block, &proof.block)?;

    let entry = proof.accounts.get(address).ok_or_else(|| {
        VerificationError::incomplete(format!("no account proof for {}", address))
    })?;

    // The claimed response value replaces the node's own account field, so
    // the leaf only verifies if the response is what the trie holds.
    let mut claimed = entry.account.clone();
    let mut storage = entry.storage_proof.clone();
    match (query, response) {
        (Query::Balance { .. }, ResponseValue::Quantity(balance)) => claimed.balance = *balance,
        (Query::TransactionCount { .. }, ResponseValue::Quantity(nonce)) => {
            claimed.nonce = u64::try_from(*nonce)
                .map_err(|_| VerificationError::ValueMismatch { field: "nonce" })?;
        }
        (Query::Code { .. }, ResponseValue::Bytes(code)) => claimed.code_hash = keccak256(code),
        (Query::StorageAt { slot, .. }, ResponseValue::Word(word)) => {
            let slot_entry = storage
                .iter_mut()
                .find(|s| s.key == *slot)
                .ok_or_else(|| VerificationError::incomplete(format!("no proof for slot {}", slot)))?;
            slot_entry.value = U256::from_be_bytes(word.0);
        }
        _ => return Err(unexpected_response(query)),
    }

    verify_entry(&proof.block.state_root(), address, &claimed, &storage, &entry.account_proof)?;
    Ok(&proof.block)
}

pub(super) fn verify_call<'p>(
    query: &Query,
    response: &ResponseValue,
    proof: &'p CallProof,
) -> Result<&'p BlockHeader, VerificationError> {
    let (to, block) = match query {
        Query::Call { to, block, .. } => (to, block),
        _ => return Err(proof_kind_mismatch(query, "callProof")),
    };
    if !matches!(response, ResponseValue::Bytes(_)) {
        return Err(unexpected_response(query));
    }
    check_block_ref(block, &proof.block)?;

    if !proof.accounts.contains_key(to) {
        return Err(VerificationError::incomplete(format!(
            "call proof lacks the called contract {}",
            to
        )));
    }
    let state_root = proof.block.state_root();
    for (address, entry) in &proof.accounts {
        verify_account_entry(&state_root, address, entry)?;
    }
    Ok(&proof.block)
}

/// Verify an account entry exactly as the node reported it.
pub(crate) fn verify_account_entry(
    state_root: &B256,
    address: &Address,
    entry: &AccountEntry,
) -> Result<(), VerificationError> {
    verify_entry(
        state_root,
        address,
        &entry.account,
        &entry.storage_proof,
        &entry.account_proof,
    )
}

fn verify_entry(
    state_root: &B256,
    address: &Address,
    account: &AccountState,
    storage: &[StorageEntry],
    proof: &[Bytes],
) -> Result<(), VerificationError> {
    let key = keccak256(address.as_slice());
    let leaf = verify_merkle_patricia_proof(state_root, key.as_slice(), proof)
        .map_err(VerificationError::from_trie("state"))?;

    match leaf {
        Some(leaf) if leaf == account.rlp_encode().as_slice() => {}
        // An absent account reads as the empty account
        None if *account == AccountState::empty() => {}
        _ => return Err(VerificationError::ValueMismatch { field: "account" }),
    }

    for slot in storage {
        let key = keccak256(slot.key.as_slice());
        let expected = (!slot.value.is_zero()).then(|| alloy_rlp::encode(slot.value));
        verify_trie_value(&account.storage_hash, key.as_slice(), &slot.proof, expected.as_deref())
            .map_err(VerificationError::from_trie("storage"))?;
    }
    Ok(())
}
