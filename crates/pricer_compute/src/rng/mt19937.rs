//! Mersenne Twister (MT19937) with 32-bit output.
//!
//! The generator is advanced one full state at a time: each
//! [`twist`](MersenneTwister::twist) regenerates all [`MT_N`] state words,
//! after which every word is tempered into one raw output. This is the same
//! batch structure the device program uses (one twist work item, then one
//! generate work item per state word), so the host and device sequences
//! coincide.

/// State width of the generator.
pub const MT_N: usize = 624;

const MT_M: usize = 397;
const MATRIX_A: u32 = 0x9908_b0df;
const UPPER_MASK: u32 = 0x8000_0000;
const LOWER_MASK: u32 = 0x7fff_ffff;

/// Seed initialisation multiplier.
pub const SEED_MULTIPLIER: u32 = 1_812_433_253;

/// MT19937 state.
///
/// # Examples
///
/// ```rust
/// use pricer_compute::rng::{MersenneTwister, MT_N};
///
/// let mut mt = MersenneTwister::from_seed(5489);
/// mt.twist();
/// assert_eq!(mt.tempered(0), 3_499_211_612);
/// ```
#[derive(Clone)]
pub struct MersenneTwister {
    state: Box<[u32; MT_N]>,
    seed: u64,
}

impl MersenneTwister {
    /// Initialises the state from the lower 32 bits of `seed`.
    pub fn from_seed(seed: u64) -> Self {
        let mut state = Box::new([0u32; MT_N]);
        state[0] = (seed & 0xffff_ffff) as u32;
        for i in 1..MT_N {
            let prev = state[i - 1];
            state[i] = SEED_MULTIPLIER
                .wrapping_mul(prev ^ (prev >> 30))
                .wrapping_add(i as u32);
        }
        Self { state, seed }
    }

    /// Regenerates all state words.
    pub fn twist(&mut self) {
        let mt = &mut self.state;
        let mag01 = |y: u32| if y & 1 == 0 { 0 } else { MATRIX_A };

        for kk in 0..MT_N - MT_M {
            let y = (mt[kk] & UPPER_MASK) | (mt[kk + 1] & LOWER_MASK);
            mt[kk] = mt[kk + MT_M] ^ (y >> 1) ^ mag01(y);
        }
        for kk in MT_N - MT_M..MT_N - 1 {
            let y = (mt[kk] & UPPER_MASK) | (mt[kk + 1] & LOWER_MASK);
            mt[kk] = mt[kk + MT_M - MT_N] ^ (y >> 1) ^ mag01(y);
        }
        let y = (mt[MT_N - 1] & UPPER_MASK) | (mt[0] & LOWER_MASK);
        mt[MT_N - 1] = mt[MT_M - 1] ^ (y >> 1) ^ mag01(y);
    }

    /// Tempered output of state word `index`.
    #[inline]
    pub fn tempered(&self, index: usize) -> u32 {
        temper(self.state[index])
    }
}

impl std::fmt::Debug for MersenneTwister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MersenneTwister")
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

/// MT19937 tempering transform.
#[inline]
pub fn temper(mut y: u32) -> u32 {
    y ^= y >> 11;
    y ^= (y << 7) & 0x9d2c_5680;
    y ^= (y << 15) & 0xefc6_0000;
    y ^= y >> 18;
    y
}
