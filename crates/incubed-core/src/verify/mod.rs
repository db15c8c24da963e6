//! Verification of node responses against trusted block headers.
//!
//! Each response carries a typed [`Proof`]. The verifier checks the payload
//! against the trie roots of the proof's block header, the header against the
//! caller's [`TrustAnchor`], and any node signatures over the block hash.
//! Everything here is synchronous and free of shared state.

mod account;
mod block;
mod log;
mod transaction;

use crate::trie::ProofError;
use crate::types::{verify_ancestry, BlockHeader, BlockRef, Proof, Query, ResponseValue, Signature};
use alloy_primitives::{Address, B256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;

/// Errors while verifying a node response. All of them are terminal for that
/// response: the caller falls back to another node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("{trie} root mismatch: computed {computed}, expected {expected}")]
    RootMismatch {
        trie: &'static str,
        computed: B256,
        expected: B256,
    },

    #[error("Malformed proof: {reason}")]
    MalformedProof { reason: String },

    #[error("Signature from untrusted signer {address}")]
    UnknownSigner { address: Address },

    #[error("Block {number} hash mismatch: expected {expected}, got {found}")]
    HeaderHashMismatch {
        number: u64,
        expected: B256,
        found: B256,
    },

    #[error("Incomplete proof: {reason}")]
    IncompleteProof { reason: String },

    #[error("Reported {field} differs from the proven value")]
    ValueMismatch { field: &'static str },
}

impl VerificationError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        VerificationError::MalformedProof {
            reason: reason.into(),
        }
    }

    pub(crate) fn incomplete(reason: impl Into<String>) -> Self {
        VerificationError::IncompleteProof {
            reason: reason.into(),
        }
    }

    /// Attach the trie name to a trie-level failure.
    pub(crate) fn from_trie(trie: &'static str) -> impl Fn(ProofError) -> Self {
        move |err| match err {
            ProofError::RootMismatch {
                computed, expected, ..
            } => VerificationError::RootMismatch {
                trie,
                computed,
                expected,
            },
            ProofError::IncompleteProof { .. } | ProofError::EmptyProof => {
                VerificationError::incomplete(format!("{} trie: {}", trie, err))
            }
            ProofError::ValueMismatch => VerificationError::ValueMismatch { field: trie },
            other => VerificationError::malformed(format!("{} trie: {}", trie, other)),
        }
    }
}

/// What the caller already trusts about the chain.
#[derive(Clone, Debug)]
pub enum TrustAnchor {
    /// The hash of the block the proof must be built on.
    Hash(B256),
    /// A trusted header.
    Header(BlockHeader),
    /// Trusted hashes by block number, for proofs spanning several blocks.
    Blocks(BTreeMap<u64, B256>),
    /// A trusted head and a chain of its ancestors linked by parent hash.
    Ancestry {
        head: BlockHeader,
        path: Vec<BlockHeader>,
    },
    /// Nothing local: the header is trusted on the strength of the node
    /// signatures alone.
    Signed,
}

impl TrustAnchor {
    /// Whether the header is checked against something held locally.
    pub fn is_local(&self) -> bool {
        !matches!(self, TrustAnchor::Signed)
    }

    /// Check a header from the proof against the anchor.
    fn check(&self, header: &BlockHeader) -> Result<(), VerificationError> {
        let expected = match self {
            TrustAnchor::Hash(hash) => *hash,
            TrustAnchor::Header(trusted) => trusted.hash(),
            TrustAnchor::Blocks(hashes) => *hashes.get(&header.number()).ok_or_else(|| {
                VerificationError::incomplete(format!("no trusted hash for block {}", header.number()))
            })?,
            TrustAnchor::Ancestry { head, path } => {
                let oldest = verify_ancestry(head, path)
                    .map_err(|e| VerificationError::malformed(e.to_string()))?;
                if header.number() > head.number() || header.number() < oldest.number() {
                    return Err(VerificationError::incomplete(format!(
                        "block {} outside the trusted ancestry {}..={}",
                        header.number(),
                        oldest.number(),
                        head.number()
                    )));
                }
                let index = (head.number() - header.number()) as usize;
                if index == 0 {
                    head.hash()
                } else {
                    path[index - 1].hash()
                }
            }
            TrustAnchor::Signed => return Ok(()),
        };
        if header.hash() != expected {
            return Err(VerificationError::HeaderHashMismatch {
                number: header.number(),
                expected,
                found: header.hash(),
            });
        }
        Ok(())
    }
}

/// The set of addresses whose signatures count.
pub trait TrustedSigners {
    fn is_trusted(&self, address: &Address) -> bool;
}

impl TrustedSigners for [Address] {
    fn is_trusted(&self, address: &Address) -> bool {
        self.contains(address)
    }
}

impl TrustedSigners for Vec<Address> {
    fn is_trusted(&self, address: &Address) -> bool {
        self.contains(address)
    }
}

impl TrustedSigners for HashSet<Address> {
    fn is_trusted(&self, address: &Address) -> bool {
        self.contains(address)
    }
}

impl TrustedSigners for BTreeSet<Address> {
    fn is_trusted(&self, address: &Address) -> bool {
        self.contains(address)
    }
}

/// Signatures the request demanded.
#[derive(Clone, Copy)]
pub struct SignerRequirement<'a> {
    pub trusted: &'a dyn TrustedSigners,
    /// Minimum number of valid signatures agreeing with the proven header.
    pub required: usize,
}

/// A signature attesting to a block hash that differs from the proven one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Misbehavior {
    pub signature: Signature,
    /// The hash the verified header actually has.
    pub expected_hash: B256,
}

impl Misbehavior {
    pub fn accused(&self) -> Address {
        self.signature.address
    }
}

/// A response that passed verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verified {
    pub value: ResponseValue,
    /// Number and hash of every block the value was proven against.
    pub blocks: Vec<(u64, B256)>,
    /// Signers whose signature agrees with the proven header.
    pub signers: Vec<Address>,
    pub evidence: Vec<Misbehavior>,
}

/// Verify `response` to `query` using `proof`.
pub fn verify(
    query: &Query,
    response: &ResponseValue,
    proof: &Proof,
    anchor: &TrustAnchor,
    signers: Option<&SignerRequirement<'_>>,
) -> Result<Verified, VerificationError> {
    let result = verify_inner(query, response, proof, anchor, signers);
    match &result {
        Ok(verified) => tracing::debug!(
            target: "verifier",
            method = query.method(),
            proof = proof.kind(),
            signers = verified.signers.len(),
            evidence = verified.evidence.len(),
            "response verified"
        ),
        Err(err) => tracing::warn!(
            target: "verifier",
            method = query.method(),
            proof = proof.kind(),
            error = %err,
            "response rejected"
        ),
    }
    result
}

fn verify_inner(
    query: &Query,
    response: &ResponseValue,
    proof: &Proof,
    anchor: &TrustAnchor,
    signers: Option<&SignerRequirement<'_>>,
) -> Result<Verified, VerificationError> {
    if !query.is_provable() {
        return Err(VerificationError::malformed(format!(
            "{} responses carry no proof",
            query.method()
        )));
    }

    // Each arm checks the payload and returns the headers it was proven against.
    let headers: Vec<&BlockHeader> = match proof {
        Proof::Account(p) => vec![account::verify_account(query, response, p)?],
        Proof::Call(p) => vec![account::verify_call(query, response, p)?],
        Proof::Transaction(p) => vec![transaction::verify_transaction(query, response, p)?],
        Proof::Receipt(p) => vec![transaction::verify_receipt(query, response, p)?],
        Proof::Block(p) => vec![block::verify_block(query, response, p)?],
        Proof::Log(p) => log::verify_logs(query, response, p)?,
    };

    for header in &headers {
        anchor.check(header)?;
    }

    let (agreeing, evidence) = check_signatures(proof.signatures(), &headers, signers)?;

    if let Some(req) = signers {
        if agreeing.len() < req.required {
            return Err(VerificationError::incomplete(format!(
                "{} of {} required signatures",
                agreeing.len(),
                req.required
            )));
        }
    }

    if !anchor.is_local() {
        let required = signers.map(|s| s.required).unwrap_or(0);
        if required == 0 {
            return Err(VerificationError::incomplete(
                "no trusted header and no signatures required",
            ));
        }
        // Without a local header the signers are the only witnesses; any
        // disagreement leaves the header undecided.
        if !evidence.is_empty() {
            return Err(VerificationError::incomplete(
                "signers disagree on the block hash",
            ));
        }
    }

    Ok(Verified {
        value: response.clone(),
        blocks: headers.iter().map(|h| (h.number(), h.hash())).collect(),
        signers: agreeing,
        evidence,
    })
}

/// Recover each signature and sort it into agreeing signers and evidence.
fn check_signatures(
    signatures: &[Signature],
    headers: &[&BlockHeader],
    requirement: Option<&SignerRequirement<'_>>,
) -> Result<(Vec<Address>, Vec<Misbehavior>), VerificationError> {
    let mut agreeing = Vec::new();
    let mut evidence = Vec::new();

    for sig in signatures {
        let header = headers
            .iter()
            .find(|h| h.number() == sig.block)
            .ok_or_else(|| {
                VerificationError::malformed(format!(
                    "signature for block {} which the proof does not cover",
                    sig.block
                ))
            })?;

        let recovered = sig
            .recover()
            .map_err(|e| VerificationError::malformed(format!("signature: {}", e)))?;
        if recovered != sig.address {
            return Err(VerificationError::UnknownSigner { address: recovered });
        }
        if let Some(req) = requirement {
            if !req.trusted.is_trusted(&recovered) {
                return Err(VerificationError::UnknownSigner { address: recovered });
            }
        }

        if sig.block_hash == header.hash() {
            if !agreeing.contains(&recovered) {
                agreeing.push(recovered);
            }
        } else {
            tracing::warn!(
                target: "verifier",
                signer = %recovered,
                block = sig.block,
                signed = %sig.block_hash,
                actual = %header.hash(),
                "signature over a wrong block hash"
            );
            evidence.push(Misbehavior {
                signature: sig.clone(),
                expected_hash: header.hash(),
            });
        }
    }

    Ok((agreeing, evidence))
}

/// Check that a proof's header is the block a query asked for.
pub(crate) fn check_block_ref(block: &BlockRef, header: &BlockHeader) -> Result<(), VerificationError> {
    match block {
        BlockRef::Latest => Ok(()),
        BlockRef::Number(n) if *n == header.number() => Ok(()),
        BlockRef::Number(_) => Err(VerificationError::ValueMismatch {
            field: "blockNumber",
        }),
        BlockRef::Hash(h) if *h == header.hash() => Ok(()),
        BlockRef::Hash(h) => Err(VerificationError::HeaderHashMismatch {
            number: header.number(),
            expected: *h,
            found: header.hash(),
        }),
    }
}

/// Check block metadata a node reported next to proven data.
pub(crate) fn check_reported_block(
    header: &BlockHeader,
    block_hash: &B256,
    block_number: u64,
) -> Result<(), VerificationError> {
    if *block_hash != header.hash() {
        return Err(VerificationError::HeaderHashMismatch {
            number: header.number(),
            expected: header.hash(),
            found: *block_hash,
        });
    }
    if block_number != header.number() {
        return Err(VerificationError::ValueMismatch {
            field: "blockNumber",
        });
    }
    Ok(())
}

pub(crate) fn unexpected_response(query: &Query) -> VerificationError {
    VerificationError::malformed(format!("response shape does not fit {}", query.method()))
}

pub(crate) fn proof_kind_mismatch(query: &Query, proof: &'static str) -> VerificationError {
    VerificationError::malformed(format!("{} cannot prove {}", proof, query.method()))
}

#[cfg(test)]
mod tests;
