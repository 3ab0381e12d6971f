//! Provider abstractions for time and randomness.
//!
//! Engine code reads the clock and draws random numbers only through these
//! traits, so tests can pause time or fix a seed and get reproducible runs.

mod random;
mod time;

pub use random::{RandomProvider, SeededRandomProvider, TokioRandomProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
