//! Per-peer outcomes and the dispatch report.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::CallError;
use crate::peer::PeerId;
use crate::tag::CallTag;

/// Outcome of the call to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOutcome<R> {
    /// The peer answered.
    Value(R),

    /// The call failed; the error marker for this peer.
    Failed(CallError),
}

impl<R> PeerOutcome<R> {
    /// Whether the peer answered.
    pub fn is_value(&self) -> bool {
        matches!(self, PeerOutcome::Value(_))
    }

    /// Whether the call failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, PeerOutcome::Failed(_))
    }

    /// The answer, if any.
    pub fn value(&self) -> Option<&R> {
        match self {
            PeerOutcome::Value(value) => Some(value),
            PeerOutcome::Failed(_) => None,
        }
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&CallError> {
        match self {
            PeerOutcome::Value(_) => None,
            PeerOutcome::Failed(error) => Some(error),
        }
    }

    /// Convert back into a `Result`.
    pub fn into_result(self) -> Result<R, CallError> {
        match self {
            PeerOutcome::Value(value) => Ok(value),
            PeerOutcome::Failed(error) => Err(error),
        }
    }
}

impl<R> From<Result<R, CallError>> for PeerOutcome<R> {
    fn from(result: Result<R, CallError>) -> Self {
        match result {
            Ok(value) => PeerOutcome::Value(value),
            Err(error) => PeerOutcome::Failed(error),
        }
    }
}

/// Everything a dispatch observed.
///
/// The outcome map is the result proper. Latencies, tags and the completion
/// order are kept for callers that care about timing or want to audit the
/// correlation.
#[derive(Debug, Clone)]
pub struct DispatchReport<R> {
    outcomes: HashMap<PeerId, PeerOutcome<R>>,
    latencies: HashMap<PeerId, Duration>,
    tags: HashMap<PeerId, CallTag>,
    completion_order: Vec<PeerId>,
}

impl<R> Default for DispatchReport<R> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<R> DispatchReport<R> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            outcomes: HashMap::with_capacity(capacity),
            latencies: HashMap::with_capacity(capacity),
            tags: HashMap::with_capacity(capacity),
            completion_order: Vec::with_capacity(capacity),
        }
    }

    /// Record one consumed completion. Each peer is recorded at most once.
    pub(crate) fn record(
        &mut self,
        peer: PeerId,
        tag: CallTag,
        latency: Duration,
        result: Result<R, CallError>,
    ) {
        debug_assert!(!self.outcomes.contains_key(&peer));
        self.latencies.insert(peer.clone(), latency);
        self.tags.insert(peer.clone(), tag);
        self.completion_order.push(peer.clone());
        self.outcomes.insert(peer, result.into());
    }

    /// Peer to outcome map.
    pub fn outcomes(&self) -> &HashMap<PeerId, PeerOutcome<R>> {
        &self.outcomes
    }

    /// Consume the report, keeping only the outcome map.
    pub fn into_outcomes(self) -> HashMap<PeerId, PeerOutcome<R>> {
        self.outcomes
    }

    /// Outcome for `peer`.
    pub fn outcome(&self, peer: &PeerId) -> Option<&PeerOutcome<R>> {
        self.outcomes.get(peer)
    }

    /// Time between issuing the call to `peer` and consuming its completion.
    pub fn latency(&self, peer: &PeerId) -> Option<Duration> {
        self.latencies.get(peer).copied()
    }

    /// Tag the call to `peer` was issued and completed under.
    pub fn tag(&self, peer: &PeerId) -> Option<CallTag> {
        self.tags.get(peer).copied()
    }

    /// Peers in the order their completions were consumed.
    pub fn completion_order(&self) -> &[PeerId] {
        &self.completion_order
    }

    /// Number of completion events consumed.
    pub fn consumed(&self) -> usize {
        self.completion_order.len()
    }

    /// Number of peers that answered.
    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_value()).count()
    }

    /// Number of peers whose call failed.
    pub fn failed(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_failed()).count()
    }

    /// Number of peers in the report.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether no peer was called.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}
