//! Fault injection for served calls.
//!
//! The multiplexer asks its [`FaultPolicy`] once per accepted call, before the
//! service runs. The decision may delay the reply (modelling processing cost)
//! and may replace it with a manufactured failure (modelling an unreliable
//! peer). All randomness comes from a [`RandomProvider`], so a seeded provider
//! replays the same faults.

use std::marker::PhantomData;
use std::time::Duration;

use crate::error::CallError;
use crate::providers::RandomProvider;

/// What to do to one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultDecision {
    /// Synthetic processing delay applied before replying.
    pub delay: Duration,

    /// When set, reply with this failure instead of calling the service.
    pub failure: Option<CallError>,
}

impl FaultDecision {
    /// No delay, no failure.
    pub fn none() -> Self {
        Self::default()
    }

    /// Fail the call with `error`.
    pub fn fail(error: CallError) -> Self {
        Self {
            delay: Duration::ZERO,
            failure: Some(error),
        }
    }

    /// Apply `delay` before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Decides the fault, if any, applied to a served call.
pub trait FaultPolicy<Req>: Send + Sync + 'static {
    /// Decide for `request`.
    fn decide(&self, request: &Req) -> FaultDecision;
}

/// Never injects anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl<Req> FaultPolicy<Req> for NoFaults {
    fn decide(&self, _request: &Req) -> FaultDecision {
        FaultDecision::none()
    }
}

/// Configuration for [`RandomFaults`].
#[derive(Debug, Clone, PartialEq)]
pub struct RandomFaultsConfig {
    /// Probability in `[0, 1]` that a call fails.
    pub failure_probability: f64,

    /// Failure reported for a failed call.
    pub failure: CallError,

    /// Upper bound (inclusive, millisecond resolution) of the uniform delay.
    pub max_delay: Duration,
}

impl Default for RandomFaultsConfig {
    fn default() -> Self {
        Self {
            failure_probability: 0.3,
            failure: CallError::Cancelled,
            max_delay: Duration::from_millis(20),
        }
    }
}

impl RandomFaultsConfig {
    /// Set the failure probability.
    pub fn with_failure_probability(mut self, probability: f64) -> Self {
        self.failure_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Set the failure reported for failed calls.
    pub fn with_failure(mut self, failure: CallError) -> Self {
        self.failure = failure;
        self
    }

    /// Set the maximum synthetic delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

/// Uniform delay plus Bernoulli failure, drawn from a [`RandomProvider`].
///
/// Each decision draws the delay first, then the failure, so the sequence of
/// decisions for a given seed is fixed.
#[derive(Clone)]
pub struct RandomFaults<R> {
    config: RandomFaultsConfig,
    random: R,
}

impl<R: RandomProvider> RandomFaults<R> {
    /// Create a policy drawing from `random`.
    pub fn new(random: R, config: RandomFaultsConfig) -> Self {
        Self { config, random }
    }

    /// The policy configuration.
    pub fn config(&self) -> &RandomFaultsConfig {
        &self.config
    }
}

impl<R: RandomProvider, Req> FaultPolicy<Req> for RandomFaults<R> {
    fn decide(&self, _request: &Req) -> FaultDecision {
        let max_ms = u64::try_from(self.config.max_delay.as_millis()).unwrap_or(u64::MAX);
        let delay = if max_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.random.random_range(0..max_ms.saturating_add(1)))
        };

        let failure = self
            .random
            .random_bool(self.config.failure_probability)
            .then(|| self.config.failure.clone());

        FaultDecision { delay, failure }
    }
}

/// Deterministic per-request policy backed by a closure.
pub struct ScriptedFaults<F, Req> {
    script: F,
    _marker: PhantomData<fn(&Req)>,
}

impl<F, Req> ScriptedFaults<F, Req>
where
    F: Fn(&Req) -> FaultDecision + Send + Sync + 'static,
{
    /// Decide every call with `script`.
    pub fn new(script: F) -> Self {
        Self {
            script,
            _marker: PhantomData,
        }
    }
}

impl<F, Req> FaultPolicy<Req> for ScriptedFaults<F, Req>
where
    F: Fn(&Req) -> FaultDecision + Send + Sync + 'static,
    Req: 'static,
{
    fn decide(&self, request: &Req) -> FaultDecision {
        (self.script)(request)
    }
}
