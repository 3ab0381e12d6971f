//! Configuration for the request multiplexer.

use std::time::Duration;

/// Configuration for [`Multiplexer`](super::Multiplexer).
#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    /// Number of workers draining the shared queue. Zero is treated as one.
    pub workers: usize,

    /// Events each worker still processes after shutdown is requested.
    pub shutdown_flush_iterations: usize,

    /// Longest wait for one event during the shutdown flush.
    pub flush_poll_timeout: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            shutdown_flush_iterations: 16,
            flush_poll_timeout: Duration::from_millis(10),
        }
    }
}

impl MultiplexerConfig {
    /// Set the number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the shutdown flush bounds.
    pub fn with_shutdown_flush(mut self, iterations: usize, poll_timeout: Duration) -> Self {
        self.shutdown_flush_iterations = iterations;
        self.flush_poll_timeout = poll_timeout;
        self
    }
}
