//! Random number generation provider abstraction.

use std::cell::RefCell;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};

use rand::distr::uniform::SampleUniform;
use rand::distr::{Distribution, StandardUniform};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Provider trait for random number generation.
///
/// Fault injection draws all of its randomness from here so that a seeded
/// provider replays the same failures and delays.
pub trait RandomProvider: Clone + Send + Sync + 'static {
    /// Generate a random value of type T.
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>;

    /// Generate a random value within `range` (exclusive upper bound).
    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd;

    /// Generate a random f64 in `[0, 1)`.
    fn random_ratio(&self) -> f64 {
        self.random::<f64>()
    }

    /// Generate a random bool with the given probability of being true.
    fn random_bool(&self, probability: f64) -> bool {
        self.random_ratio() < probability
    }
}

/// Production random provider using the thread-local RNG.
#[derive(Debug, Clone, Default)]
pub struct TokioRandomProvider;

impl TokioRandomProvider {
    /// Create a new production random provider.
    pub fn new() -> Self {
        Self
    }
}

thread_local! {
    static RNG: RefCell<rand::rngs::ThreadRng> = RefCell::new(rand::rng());
}

impl RandomProvider for TokioRandomProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        RNG.with(|rng| rng.borrow_mut().random())
    }

    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd,
    {
        RNG.with(|rng| rng.borrow_mut().random_range(range))
    }
}

/// Deterministic provider seeded once, shared by every clone.
///
/// Clones draw from the same ChaCha8 stream, so the sequence observed by a
/// single worker is reproducible for a given seed.
#[derive(Clone)]
pub struct SeededRandomProvider {
    seed: u64,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SeededRandomProvider {
    /// Create a provider from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// The seed this provider was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl RandomProvider for SeededRandomProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random()
    }

    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd,
    {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(range)
    }
}
