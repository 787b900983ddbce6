//! # Variates Generation
//!
//! Host implementation of the generator behind the variates pool.
//!
//! The pool is filled batch by batch: a Mersenne Twister with a state width of
//! [`MT_N`] words is twisted once per batch, each tempered word is mapped onto
//! a standard normal deviate through [`inverse_cumulative_normal`], and the
//! batch is appended to the pool. Device backends run the same three steps
//! as device routines (see [`crate::codegen`]); the host backend and the
//! tests use the functions in this module directly.
//!
//! ## Module Structure
//!
//! - [`mt19937`](MersenneTwister): generator state, seed initialisation, twist
//!   and tempering
//! - [`inverse_cumulative_normal`]: rational inverse of the normal
//!   distribution function
//!
//! ## Usage Example
//!
//! ```rust
//! use pricer_compute::rng::{fill_normal_batch, MersenneTwister, MT_N};
//!
//! let mut mt = MersenneTwister::from_seed(42);
//! let mut batch = vec![0.0_f64; MT_N];
//! fill_normal_batch(&mut mt, &mut batch);
//! assert!(batch.iter().all(|z| z.is_finite()));
//! ```

mod inverse_normal;
mod mt19937;

pub use inverse_normal::{inverse_cumulative_normal, A, B, C, D, SATURATION, X_LOW};
pub use mt19937::{temper, MersenneTwister, MT_N, SEED_MULTIPLIER};

use num_traits::Float;

/// Twists `mt` once and writes one batch of normal deviates into `out`.
///
/// `out` holds at most [`MT_N`] values; shorter slices take the leading
/// deviates of the batch.
pub fn fill_normal_batch<T: Float>(mt: &mut MersenneTwister, out: &mut [T]) {
    debug_assert!(out.len() <= MT_N);
    mt.twist();
    for (i, value) in out.iter_mut().enumerate() {
        *value = inverse_cumulative_normal(mt.tempered(i));
    }
}
