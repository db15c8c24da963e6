//! Concurrent dispatch to selected nodes.
//!
//! A request goes to `request_count` nodes at once. Every answer is verified
//! before it counts; a node that times out, fails or sends a bad proof is
//! penalized, excluded for the rest of the request and replaced by another
//! node until `max_attempts` nodes have been tried.

use crate::config::{ClientSection, ProofMode};
use crate::health::NodeHealth;
use crate::quorum::{accept, AcceptPolicy, Answer, QuorumOutcome};
use crate::random::{ChaChaSource, RandomSource};
use crate::selector::{select_nodes, Weighting};
use alloy_primitives::Address;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use incubed_core::{
    verify, Misbehavior, Proof, Query, ResponseValue, SignerRequirement, TrustAnchor,
    VerificationError,
};
use incubed_registry::{EvidenceSink, NodeListHandle, NodeListState, NodeRecord};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What is sent to a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRequest {
    pub query: Query,
    /// Nodes the answering node should collect block hash signatures from.
    pub signers: Vec<Address>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeResponse {
    pub value: ResponseValue,
    pub proof: Option<Proof>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },

    #[error("Node returned an error: {0}")]
    Node(String),
}

/// Sends a request to one node.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn send(&self, node: &NodeRecord, request: &NodeRequest) -> Result<NodeResponse, TransportError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("No registered node available")]
    NoNodes,

    #[error("No acceptable answer after asking {attempts} nodes")]
    AllNodesFailed { attempts: usize },

    #[error("Every node asked timed out")]
    Timeout,

    #[error("Invalid client configuration: {0}")]
    Config(String),
}

/// Cases remembered so the same evidence is not reported twice.
const REPORTED_CAPACITY: usize = 4_096;

/// Why one node's answer did not count.
#[derive(Debug)]
enum Failure {
    Timeout,
    Transport(TransportError),
    Rejected(VerificationError),
}

pub struct Client {
    config: ClientSection,
    nodes: NodeListHandle,
    transport: Arc<dyn NodeTransport>,
    rng: Mutex<Box<dyn RandomSource>>,
    health: Arc<NodeHealth>,
    weighting: Weighting,
    evidence: Option<Arc<dyn EvidenceSink>>,
    reported: Arc<Mutex<ReportLedger>>,
    reports: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    pub fn new(config: ClientSection, nodes: NodeListHandle, transport: Arc<dyn NodeTransport>) -> Self {
        let rng: Box<dyn RandomSource> = match config.seed {
            Some(seed) => Box::new(ChaChaSource::seeded(seed)),
            None => Box::new(ChaChaSource::from_entropy()),
        };
        let health = Arc::new(NodeHealth::with_system_clock(config.health_decay()));
        Self {
            config,
            nodes,
            transport,
            rng: Mutex::new(rng),
            health,
            weighting: Weighting::Deposit,
            evidence: None,
            reported: Arc::new(Mutex::new(ReportLedger::new(REPORTED_CAPACITY))),
            reports: Mutex::new(Vec::new()),
        }
    }

    pub fn with_random(mut self, rng: Box<dyn RandomSource>) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn with_health(mut self, health: Arc<NodeHealth>) -> Self {
        self.health = health;
        self
    }

    pub fn with_weighting(mut self, weighting: Weighting) -> Self {
        self.weighting = weighting;
        self
    }

    /// Where signatures over wrong block hashes are sent.
    pub fn with_evidence_sink(mut self, sink: Arc<dyn EvidenceSink>) -> Self {
        self.evidence = Some(sink);
        self
    }

    pub fn health(&self) -> &Arc<NodeHealth> {
        &self.health
    }

    /// Ask the network and return the accepted answer.
    ///
    /// Block headers are trusted through `anchor`; with
    /// [`TrustAnchor::Signed`] the configured number of signers must vouch
    /// for them.
    pub async fn send(&self, query: &Query, anchor: &TrustAnchor) -> Result<QuorumOutcome, ClientError> {
        let policy = AcceptPolicy::for_query(query);
        let verify_proofs = self.config.proof == ProofMode::Standard && policy == AcceptPolicy::Proof;
        if verify_proofs && !anchor.is_local() && self.config.signature_count == 0 {
            return Err(ClientError::Config(
                "a signed anchor needs client.signature_count above 0".into(),
            ));
        }

        let state = self.nodes.snapshot();
        let mut excluded = HashSet::new();
        let picked = self.pick(&state, self.config.request_count, &excluded);
        if picked.is_empty() {
            return Err(ClientError::NoNodes);
        }
        excluded.extend(picked.iter().map(|n| n.owner));

        let signers = if verify_proofs && self.config.signature_count > 0 {
            self.pick(&state, self.config.signature_count, &excluded)
                .into_iter()
                .map(|n| n.owner)
                .collect()
        } else {
            Vec::new()
        };
        let request = NodeRequest {
            query: query.clone(),
            signers,
        };

        let mut attempts = picked.len();
        let mut timeouts = 0;
        let mut answers = Vec::new();
        let mut pending = FuturesUnordered::new();
        for node in picked {
            pending.push(self.ask(node, &request, anchor, &state, verify_proofs));
        }

        while let Some((node, result)) = pending.next().await {
            match result {
                Ok(answer) => {
                    debug!(target: "client", node = %node.owner, method = query.method(), "Answer accepted");
                    answers.push(answer);
                    if policy == AcceptPolicy::Proof {
                        break;
                    }
                }
                Err(failure) => {
                    match &failure {
                        Failure::Timeout => {
                            timeouts += 1;
                            warn!(target: "client", node = %node.owner, url = %node.url, "Node timed out");
                        }
                        Failure::Transport(e) => {
                            warn!(target: "client", node = %node.owner, error = %e, "Node unreachable")
                        }
                        Failure::Rejected(e) => {
                            warn!(target: "client", node = %node.owner, error = %e, "Answer rejected")
                        }
                    }
                    self.health.penalize(&node.owner);
                    if attempts < self.config.max_attempts {
                        if let Some(alternate) = self.pick(&state, 1, &excluded).pop() {
                            debug!(target: "client", failed = %node.owner, alternate = %alternate.owner, "Asking another node");
                            excluded.insert(alternate.owner);
                            attempts += 1;
                            pending.push(self.ask(alternate, &request, anchor, &state, verify_proofs));
                        }
                    }
                }
            }
        }
        // Remaining answers are abandoned
        drop(pending);

        let Some(outcome) = accept(policy, &answers) else {
            return Err(if timeouts == attempts {
                ClientError::Timeout
            } else {
                ClientError::AllNodesFailed { attempts }
            });
        };
        if let QuorumOutcome::Disagreement { evidence, .. } = &outcome {
            info!(
                target: "client",
                method = query.method(),
                signers = evidence.len(),
                "Signers disagree with the proven block"
            );
            self.report(evidence);
        }
        Ok(outcome)
    }

    /// Wait until every evidence report handed out so far has finished.
    pub async fn flush_reports(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.reports.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(target: "client", error = %e, "Evidence report task failed");
            }
        }
    }

    fn pick(&self, state: &NodeListState, count: usize, exclude: &HashSet<Address>) -> Vec<NodeRecord> {
        let mut rng = self.rng.lock();
        select_nodes(state, count, self.weighting, rng.as_mut(), &self.health, exclude)
    }

    async fn ask(
        &self,
        node: NodeRecord,
        request: &NodeRequest,
        anchor: &TrustAnchor,
        state: &NodeListState,
        verify_proofs: bool,
    ) -> (NodeRecord, Result<Answer, Failure>) {
        let sent = tokio::time::timeout(self.config.timeout(), self.transport.send(&node, request)).await;
        let result = match sent {
            Err(_) => Err(Failure::Timeout),
            Ok(Err(e)) => Err(Failure::Transport(e)),
            Ok(Ok(response)) => self.check(&node, request, anchor, state, response, verify_proofs),
        };
        (node, result)
    }

    fn check(
        &self,
        node: &NodeRecord,
        request: &NodeRequest,
        anchor: &TrustAnchor,
        state: &NodeListState,
        response: NodeResponse,
        verify_proofs: bool,
    ) -> Result<Answer, Failure> {
        if !verify_proofs {
            return Ok(Answer {
                node: node.owner,
                value: response.value,
                evidence: Vec::new(),
            });
        }
        let proof = response.proof.ok_or_else(|| {
            Failure::Rejected(VerificationError::IncompleteProof {
                reason: "answer carries no proof".into(),
            })
        })?;
        // Local headers stand on their own; signatures only add evidence
        let required = if anchor.is_local() {
            0
        } else {
            request.signers.len().min(self.config.signature_count)
        };
        let requirement = SignerRequirement {
            trusted: state,
            required,
        };
        let verified = verify(&request.query, &response.value, &proof, anchor, Some(&requirement))
            .map_err(Failure::Rejected)?;
        Ok(Answer {
            node: node.owner,
            value: verified.value,
            evidence: verified.evidence,
        })
    }

    fn report(&self, evidence: &[Misbehavior]) {
        let Some(sink) = &self.evidence else {
            return;
        };
        let mut reported = self.reported.lock();
        let mut reports = self.reports.lock();
        reports.retain(|h| !h.is_finished());
        for item in evidence {
            let key = (item.accused(), item.signature.block);
            if !reported.insert(key) {
                continue;
            }
            let sink = sink.clone();
            let item = item.clone();
            let ledger = self.reported.clone();
            reports.push(tokio::spawn(async move {
                if let Err(e) = sink.report(item).await {
                    if e.is_retryable() {
                        debug!(target: "client", accused = %key.0, block = key.1, "Evidence may be reported again");
                        ledger.lock().remove(&key);
                    }
                }
            }));
        }
    }
}

/// Insertion-ordered set of reported cases; the oldest is forgotten once
/// `capacity` is reached.
struct ReportLedger {
    keys: HashSet<(Address, u64)>,
    order: VecDeque<(Address, u64)>,
    capacity: usize,
}

impl ReportLedger {
    fn new(capacity: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// False if `key` is already held.
    fn insert(&mut self, key: (Address, u64)) -> bool {
        if !self.keys.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }

    fn remove(&mut self, key: &(Address, u64)) {
        if self.keys.remove(key) {
            self.order.retain(|k| k != key);
        }
    }
}
