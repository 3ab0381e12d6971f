//! Client-side fan-out dispatcher.
//!
//! A dispatch issues one call per peer without waiting, then drains its own
//! completion queue until every issued call has been accounted for:
//!
//! ```text
//! issue A ─┐
//! issue B ─┼─> substrate ──> completion queue ──> drain loop ──> peer -> outcome
//! issue C ─┘                 (arrival order)      (N pulls)
//! ```
//!
//! The pending map (`tag -> peer, issue time`) is both the correlation table
//! and the pending-call set: every consumed completion removes exactly one
//! entry and the loop stops when the map is empty. A failed call becomes a
//! [`PeerOutcome::Failed`] entry and never aborts the batch.

mod config;
mod outcome;

pub use config::FanOutConfig;
pub use outcome::{DispatchReport, PeerOutcome};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::error::{CallError, EngineError};
use crate::metrics::{
    MetricsSink, NoopMetrics, RPC_COUNT, RPC_ERRORS, RPC_LATENCY, STATUS_ERROR, STATUS_SUCCESS,
    STATUS_TAG,
};
use crate::peer::PeerId;
use crate::providers::{TimeProvider, TokioTimeProvider};
use crate::queue::{Completion, CompletionQueue};
use crate::substrate::OutboundSubstrate;
use crate::tag::{CallTag, TagFactory};

/// Context kept for one issued call until its completion is consumed.
#[derive(Debug)]
struct PendingCall {
    peer: PeerId,
    issued_at: Duration,
}

/// Shuts the dispatch queue down however the dispatch ends, so late
/// completions are refused instead of piling up.
struct ShutdownOnDrop<'a, T>(&'a CompletionQueue<T>);

impl<T> Drop for ShutdownOnDrop<'_, T> {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Concurrent fan-out over an [`OutboundSubstrate`].
///
/// Each dispatch owns a fresh completion queue, so several dispatches may run
/// concurrently on the same `FanOut`.
pub struct FanOut<S, T = TokioTimeProvider> {
    substrate: S,
    time: T,
    metrics: Arc<dyn MetricsSink>,
    tags: TagFactory,
    config: FanOutConfig,
}

impl<S> FanOut<S, TokioTimeProvider>
where
    S: OutboundSubstrate,
{
    /// Create a dispatcher on the Tokio clock, without metrics.
    pub fn new(substrate: S) -> Self {
        Self::with_time(substrate, TokioTimeProvider::new())
    }
}

impl<S, T> FanOut<S, T>
where
    S: OutboundSubstrate,
    T: TimeProvider,
{
    /// Create a dispatcher measuring latency with `time`.
    pub fn with_time(substrate: S, time: T) -> Self {
        Self {
            substrate,
            time,
            metrics: Arc::new(NoopMetrics),
            tags: TagFactory::new(),
            config: FanOutConfig::default(),
        }
    }

    /// Report call counts and latencies to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: FanOutConfig) -> Self {
        self.config = config;
        self
    }

    /// The substrate calls are issued on.
    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    /// Call every peer with the request built for it and collect the outcomes.
    ///
    /// Duplicate peers are called once. With no peers an empty map is returned
    /// without waiting.
    ///
    /// # Errors
    ///
    /// Only engine failures are errors: see [`dispatch_report`](Self::dispatch_report).
    pub async fn dispatch<I, F>(
        &self,
        peers: I,
        build: F,
    ) -> Result<HashMap<PeerId, PeerOutcome<S::Response>>, EngineError>
    where
        I: IntoIterator<Item = PeerId>,
        F: FnMut(&PeerId) -> S::Request,
    {
        Ok(self.dispatch_report(peers, build).await?.into_outcomes())
    }

    /// Send a clone of `request` to every peer.
    pub async fn dispatch_shared<I>(
        &self,
        peers: I,
        request: &S::Request,
    ) -> Result<HashMap<PeerId, PeerOutcome<S::Response>>, EngineError>
    where
        I: IntoIterator<Item = PeerId>,
        S::Request: Clone,
    {
        self.dispatch(peers, |_| request.clone()).await
    }

    /// Like [`dispatch`](Self::dispatch), also returning latencies, tags and
    /// the completion order.
    ///
    /// # Errors
    ///
    /// - [`EngineError::QueueShutdown`] if the queue went away with calls pending
    /// - [`EngineError::UnknownTag`] for a completion nobody issued
    /// - [`EngineError::DuplicateTag`] if a tag was handed out twice
    /// - [`EngineError::Stalled`] when the configured stall timeout expires
    pub async fn dispatch_report<I, F>(
        &self,
        peers: I,
        build: F,
    ) -> Result<DispatchReport<S::Response>, EngineError>
    where
        I: IntoIterator<Item = PeerId>,
        F: FnMut(&PeerId) -> S::Request,
    {
        let span = tracing::info_span!("fan_out");
        self.run(peers, build).instrument(span).await
    }

    async fn run<I, F>(
        &self,
        peers: I,
        mut build: F,
    ) -> Result<DispatchReport<S::Response>, EngineError>
    where
        I: IntoIterator<Item = PeerId>,
        F: FnMut(&PeerId) -> S::Request,
    {
        let queue = CompletionQueue::new();
        let _guard = ShutdownOnDrop(&queue);
        let sender = queue.sender();

        let mut seen = HashSet::new();
        let mut pending: HashMap<CallTag, PendingCall> = HashMap::new();

        for peer in peers {
            if !seen.insert(peer.clone()) {
                tracing::debug!(%peer, "duplicate peer skipped");
                continue;
            }

            let request = build(&peer);
            let tag = self.tags.next();
            let issued_at = self.time.now();
            if pending
                .insert(
                    tag,
                    PendingCall {
                        peer: peer.clone(),
                        issued_at,
                    },
                )
                .is_some()
            {
                tracing::error!(%tag, "tag issued twice");
                return Err(EngineError::DuplicateTag { tag });
            }

            tracing::trace!(%peer, %tag, "issuing call");
            self.substrate.issue_async(&peer, request, tag, &sender);
        }

        let issued = pending.len();
        let mut report = DispatchReport::with_capacity(issued);
        if issued == 0 {
            return Ok(report);
        }
        tracing::debug!(issued, "calls issued, draining");

        while !pending.is_empty() {
            let (tag, result) = self.next_completion(&queue, pending.len()).await?.into_parts();

            let Some(call) = pending.remove(&tag) else {
                tracing::error!(%tag, "completion for a tag that was never issued");
                return Err(EngineError::UnknownTag { tag });
            };

            let latency = self.time.now().saturating_sub(call.issued_at);
            self.record_metrics(&result, latency);
            if let Err(error) = &result {
                tracing::warn!(peer = %call.peer, %tag, %error, "peer call failed");
            }
            report.record(call.peer, tag, latency, result);
        }

        tracing::debug!(
            consumed = report.consumed(),
            failed = report.failed(),
            "dispatch complete"
        );
        Ok(report)
    }

    async fn next_completion(
        &self,
        queue: &CompletionQueue<S::Response>,
        pending: usize,
    ) -> Result<Completion<S::Response>, EngineError> {
        match self.config.stall_timeout {
            None => queue.next().await,
            Some(timeout) => match self.time.timeout(timeout, queue.next()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(pending, ?timeout, "dispatch stalled");
                    Err(EngineError::Stalled { pending })
                }
            },
        }
    }

    fn record_metrics(&self, result: &Result<S::Response, CallError>, latency: Duration) {
        let status = if result.is_ok() {
            STATUS_SUCCESS
        } else {
            STATUS_ERROR
        };
        let tags = [(STATUS_TAG, status)];

        self.metrics.record_count(RPC_COUNT, &tags);
        let latency_ms = latency.as_micros() as f64 / 1000.0;
        self.metrics.record_latency(RPC_LATENCY, latency_ms, &tags);
        if result.is_err() {
            self.metrics.record_count(RPC_ERRORS, &tags);
        }
    }
}
