//! Observability sink for per-call counters and latencies.
//!
//! The engine reports through [`MetricsSink`] only. Recording is
//! fire-and-forget: implementations must not block and must not fail.
//!
//! Metrics emitted by the fan-out dispatcher, one set per consumed completion:
//!
//! | name | kind | view | tags |
//! |------|------|------|------|
//! | [`RPC_COUNT`] | count | [`RPC_COUNT_VIEW`] | `status` |
//! | [`RPC_LATENCY`] | latency (ms) | [`RPC_LATENCY_VIEW`] | `status` |
//! | [`RPC_ERRORS`] | count (failures only) | [`RPC_ERRORS_VIEW`] | `status` |

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Cumulative count of calls.
pub const RPC_COUNT: &str = "rpc count";

/// Cumulative count of failed calls.
pub const RPC_ERRORS: &str = "rpc errors count";

/// Per-call latency distribution, in milliseconds.
pub const RPC_LATENCY: &str = "rpc latency";

/// Exported view aggregating [`RPC_COUNT`].
pub const RPC_COUNT_VIEW: &str = "food_finder/rpc_count";

/// Exported view aggregating [`RPC_ERRORS`].
pub const RPC_ERRORS_VIEW: &str = "food_finder/rpc_errors";

/// Exported view aggregating [`RPC_LATENCY`].
pub const RPC_LATENCY_VIEW: &str = "food_finder/rpc_latency";

/// View a measure is exported under, None for measures the engine does not
/// emit.
pub fn view_name(measure: &str) -> Option<&'static str> {
    match measure {
        RPC_COUNT => Some(RPC_COUNT_VIEW),
        RPC_ERRORS => Some(RPC_ERRORS_VIEW),
        RPC_LATENCY => Some(RPC_LATENCY_VIEW),
        _ => None,
    }
}

/// Tag key carrying the outcome classification.
pub const STATUS_TAG: &str = "status";

/// `status` value for a successful call.
pub const STATUS_SUCCESS: &str = "success";

/// `status` value for a failed call.
pub const STATUS_ERROR: &str = "error";

/// Latency bucket boundaries in milliseconds.
pub const DEFAULT_LATENCY_BOUNDS_MS: [f64; 10] =
    [0.0, 7.5, 15.0, 22.5, 30.0, 37.5, 45.0, 52.5, 60.0, 67.5];

/// Destination for engine metrics.
pub trait MetricsSink: Send + Sync {
    /// Increment the counter `name` by one.
    fn record_count(&self, name: &str, tags: &[(&str, &str)]);

    /// Record one latency observation for `name`.
    fn record_latency(&self, name: &str, value_ms: f64, tags: &[(&str, &str)]);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_count(&self, _name: &str, _tags: &[(&str, &str)]) {}

    fn record_latency(&self, _name: &str, _value_ms: f64, _tags: &[(&str, &str)]) {}
}

/// Sink that forwards every observation as a `tracing` event.
///
/// Events use the target `callmux::metrics`, so a subscriber can route or
/// filter them separately from regular logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_count(&self, name: &str, tags: &[(&str, &str)]) {
        let view = view_name(name).unwrap_or(name);
        tracing::debug!(target: "callmux::metrics", metric = name, view, ?tags, "count");
    }

    fn record_latency(&self, name: &str, value_ms: f64, tags: &[(&str, &str)]) {
        let view = view_name(name).unwrap_or(name);
        tracing::debug!(
            target: "callmux::metrics",
            metric = name,
            view,
            value_ms,
            ?tags,
            "latency"
        );
    }
}

/// Distribution over fixed bucket boundaries.
///
/// With boundaries `b0 < b1 < ... < bn` there are `n + 2` buckets:
/// `(-inf, b0)`, `[b0, b1)`, ..., `[bn, +inf)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyHistogram {
    bounds: Vec<f64>,
    buckets: Vec<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl LatencyHistogram {
    /// Create an empty histogram over `bounds` (must be ascending).
    pub fn new(bounds: &[f64]) -> Self {
        debug_assert!(bounds.windows(2).all(|w| w[0] < w[1]));
        Self {
            bounds: bounds.to_vec(),
            buckets: vec![0; bounds.len() + 1],
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Add one observation.
    pub fn record(&mut self, value: f64) {
        let index = self.bounds.partition_point(|bound| *bound <= value);
        self.buckets[index] += 1;
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean of all observations, `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Smallest observation, `None` when empty.
    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    /// Largest observation, `None` when empty.
    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Per-bucket counts.
    pub fn bucket_counts(&self) -> &[u64] {
        &self.buckets
    }

    /// Bucket boundaries.
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new(&DEFAULT_LATENCY_BOUNDS_MS)
    }
}

type MetricKey = (String, Vec<(String, String)>);

fn metric_key(name: &str, tags: &[(&str, &str)]) -> MetricKey {
    let mut tags: Vec<(String, String)> = tags
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    tags.sort();
    (name.to_string(), tags)
}

#[derive(Default)]
struct MetricsState {
    counters: HashMap<MetricKey, u64>,
    latencies: HashMap<MetricKey, LatencyHistogram>,
}

/// Sink that aggregates in memory; useful for inspection and tests.
#[derive(Default)]
pub struct InMemoryMetrics {
    state: Mutex<MetricsState>,
}

impl InMemoryMetrics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counter value for `name` with exactly `tags`.
    pub fn count(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        self.lock()
            .counters
            .get(&metric_key(name, tags))
            .copied()
            .unwrap_or(0)
    }

    /// Counter value for `name` summed over every tag combination.
    pub fn total_count(&self, name: &str) -> u64 {
        self.lock()
            .counters
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    /// Latency distribution for `name` with exactly `tags`.
    pub fn histogram(&self, name: &str, tags: &[(&str, &str)]) -> Option<LatencyHistogram> {
        self.lock().latencies.get(&metric_key(name, tags)).cloned()
    }

    /// Number of latency observations for `name` over every tag combination.
    pub fn latency_observations(&self, name: &str) -> u64 {
        self.lock()
            .latencies
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, h)| h.count())
            .sum()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_count(&self, name: &str, tags: &[(&str, &str)]) {
        *self.lock().counters.entry(metric_key(name, tags)).or_insert(0) += 1;
    }

    fn record_latency(&self, name: &str, value_ms: f64, tags: &[(&str, &str)]) {
        self.lock()
            .latencies
            .entry(metric_key(name, tags))
            .or_default()
            .record(value_ms);
    }
}
