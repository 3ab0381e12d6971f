//! Multiplexer counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of what a multiplexer has done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    /// Handlers created (each one starts ACCEPTING).
    pub handlers_created: u64,

    /// Handlers removed from the arena.
    pub handlers_released: u64,

    /// Inbound calls accepted.
    pub calls_accepted: u64,

    /// Replies submitted to the substrate.
    pub replies_sent: u64,

    /// Replies confirmed delivered.
    pub replies_delivered: u64,

    /// Replies the substrate failed to deliver.
    pub failed_deliveries: u64,

    /// Calls answered with a failure by the service.
    pub service_failures: u64,

    /// Calls answered with a failure made up by the fault policy.
    pub manufactured_failures: u64,

    /// Acceptors the substrate cancelled.
    pub accept_cancellations: u64,

    /// Handlers still in the arena.
    pub live_handlers: usize,

    /// Fewest handlers seen ACCEPTING while running; None before any
    /// observation.
    pub min_accepting: Option<usize>,

    /// Most handlers seen ACCEPTING while running.
    pub max_accepting: usize,
}

#[derive(Debug)]
pub(crate) struct StatsCounters {
    pub(crate) handlers_created: AtomicU64,
    pub(crate) handlers_released: AtomicU64,
    pub(crate) calls_accepted: AtomicU64,
    pub(crate) replies_sent: AtomicU64,
    pub(crate) replies_delivered: AtomicU64,
    pub(crate) failed_deliveries: AtomicU64,
    pub(crate) service_failures: AtomicU64,
    pub(crate) manufactured_failures: AtomicU64,
    pub(crate) accept_cancellations: AtomicU64,
    min_accepting: AtomicUsize,
    max_accepting: AtomicUsize,
}

impl Default for StatsCounters {
    fn default() -> Self {
        Self {
            handlers_created: AtomicU64::new(0),
            handlers_released: AtomicU64::new(0),
            calls_accepted: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
            replies_delivered: AtomicU64::new(0),
            failed_deliveries: AtomicU64::new(0),
            service_failures: AtomicU64::new(0),
            manufactured_failures: AtomicU64::new(0),
            accept_cancellations: AtomicU64::new(0),
            min_accepting: AtomicUsize::new(usize::MAX),
            max_accepting: AtomicUsize::new(0),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StatsCounters {
    /// Record the number of ACCEPTING handlers seen after a transition.
    pub(crate) fn observe_accepting(&self, accepting: usize) {
        self.min_accepting.fetch_min(accepting, Ordering::Relaxed);
        self.max_accepting.fetch_max(accepting, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, live_handlers: usize) -> MultiplexerStats {
        let min = self.min_accepting.load(Ordering::Relaxed);
        MultiplexerStats {
            handlers_created: self.handlers_created.load(Ordering::Relaxed),
            handlers_released: self.handlers_released.load(Ordering::Relaxed),
            calls_accepted: self.calls_accepted.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            replies_delivered: self.replies_delivered.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
            service_failures: self.service_failures.load(Ordering::Relaxed),
            manufactured_failures: self.manufactured_failures.load(Ordering::Relaxed),
            accept_cancellations: self.accept_cancellations.load(Ordering::Relaxed),
            live_handlers,
            min_accepting: (min != usize::MAX).then_some(min),
            max_accepting: self.max_accepting.load(Ordering::Relaxed),
        }
    }
}
