//! Configuration for the fan-out dispatcher.

use std::time::Duration;

/// Configuration for [`FanOut`](super::FanOut).
#[derive(Clone, Debug, Default)]
pub struct FanOutConfig {
    /// Longest wait for any single completion while calls are pending.
    /// None means wait forever, trusting the substrate to complete every call.
    pub stall_timeout: Option<Duration>,
}

impl FanOutConfig {
    /// Fail a dispatch with [`EngineError::Stalled`](crate::EngineError::Stalled)
    /// when no completion arrives within `timeout`.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }
}
