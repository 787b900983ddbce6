//! Per-calculation settings.
//!
//! [`Settings`] is passed to every
//! [`initiate_calculation`](crate::ComputeContext::initiate_calculation) call
//! and selects the floating-point precision of the generated kernel, the seed
//! of the variates generator and whether debug telemetry is collected.

use serde::Deserialize;

/// Default seed of the variates generator.
pub const DEFAULT_RNG_SEED: u64 = 42;

/// Floating-point precision used on the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Precision {
    /// 32-bit floats; host values are clamped into the `f32` range.
    #[default]
    Single,
    /// 64-bit floats; requires device support.
    Double,
}

impl Precision {
    /// Lowercase name, as used in messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Single => "single",
            Precision::Double => "double",
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings applying to one calculation invocation.
///
/// # Examples
///
/// ```rust
/// use pricer_compute::{Precision, Settings};
///
/// let settings = Settings {
///     use_double_precision: true,
///     ..Settings::default()
/// };
/// assert_eq!(settings.precision(), Precision::Double);
/// assert_eq!(settings.rng_seed, 42);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Evaluate in 64-bit instead of 32-bit floating point.
    pub use_double_precision: bool,
    /// Seed of the variates generator; only the first pool growth of an
    /// engine consumes it.
    pub rng_seed: u64,
    /// Accumulate operation counts and timings in the engine's debug info.
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_double_precision: false,
            rng_seed: DEFAULT_RNG_SEED,
            debug: false,
        }
    }
}

impl Settings {
    /// Precision selected by these settings.
    #[inline]
    pub fn precision(&self) -> Precision {
        if self.use_double_precision {
            Precision::Double
        } else {
            Precision::Single
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(!settings.use_double_precision);
        assert_eq!(settings.rng_seed, DEFAULT_RNG_SEED);
        assert!(!settings.debug);
        assert_eq!(settings.precision(), Precision::Single);
    }

    #[test]
    fn test_settings_from_toml() {
        let settings: Settings = toml::from_str("use_double_precision = true\nrng_seed = 7").unwrap();
        assert_eq!(settings.precision(), Precision::Double);
        assert_eq!(settings.rng_seed, 7);
        assert!(!settings.debug);
    }
}
