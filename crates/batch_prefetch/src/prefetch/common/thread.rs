//! Thread-local RNG for the prefetch worker.
//!
//! Loaders that augment batches randomly should draw from these helpers so
//! that a fixed pipeline seed reproduces the same batch sequence.

use rand::distr::uniform::{SampleRange, SampleUniform};
use rand::rngs::StdRng;
use rand::Rng as _;
use rand::SeedableRng;
use std::cell::RefCell;

thread_local! {
    /// Thread-local RNG, seeded by the worker thread before its first batch.
    pub static PREFETCH_RNG: RefCell<Option<StdRng>> = const { RefCell::new(None) };
}

/// Initialize the calling thread's RNG.
/// Seed formula: base_seed + (generation << 32), where `generation` counts
/// how many times the pipeline has been set up.
pub fn init_prefetch_rng(base_seed: u64, generation: u64) {
    PREFETCH_RNG.with(|rng| {
        let seed = base_seed.wrapping_add(generation << 32);
        *rng.borrow_mut() = Some(StdRng::seed_from_u64(seed));
    })
}

/// Get a random bool from the worker RNG, or thread_rng if not in worker context.
pub fn prefetch_gen_bool(p: f64) -> bool {
    PREFETCH_RNG.with(|rng| {
        let mut rng_ref = rng.borrow_mut();
        match rng_ref.as_mut() {
            Some(rng) => rng.random_bool(p),
            None => rand::rng().random_bool(p),
        }
    })
}

/// Get a random value in `range` from the worker RNG, or thread_rng if not in worker context.
pub fn prefetch_gen_range<T, R>(range: R) -> T
where
    T: SampleUniform,
    R: SampleRange<T>,
{
    PREFETCH_RNG.with(|rng| {
        let mut rng_ref = rng.borrow_mut();
        match rng_ref.as_mut() {
            Some(rng) => rng.random_range(range),
            None => rand::rng().random_range(range),
        }
    })
}
