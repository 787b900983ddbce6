//! Rational approximation of the inverse cumulative normal distribution.
//!
//! Acklam's algorithm: a central-region polynomial ratio in `(x - 0.5)²` and
//! a tail-region ratio in `sqrt(-2 ln p)`, relative error below `1.15e-9`.
//! The input is a raw 32-bit generator output mapped to `x = x0 / u32::MAX`;
//! inputs that map onto the closed ends of `[0, 1]` saturate to
//! `±`[`SATURATION`] in both precisions.

use num_traits::Float;

/// Magnitude returned for the extreme raw inputs: the largest finite `f32`.
pub const SATURATION: f64 = f32::MAX as f64;

/// Central-region numerator coefficients.
pub const A: [f64; 6] = [
    -3.969683028665376e+01,
    2.209460984245205e+02,
    -2.759285104469687e+02,
    1.383577518672690e+02,
    -3.066479806614716e+01,
    2.506628277459239e+00,
];

/// Central-region denominator coefficients.
pub const B: [f64; 5] = [
    -5.447609879822406e+01,
    1.615858368580409e+02,
    -1.556989798598866e+02,
    6.680131188771972e+01,
    -1.328068155288572e+01,
];

/// Tail-region numerator coefficients.
pub const C: [f64; 6] = [
    -7.784894002430293e-03,
    -3.223964580411365e-01,
    -2.400758277161838e+00,
    -2.549732539343734e+00,
    4.374664141464968e+00,
    2.938163982698783e+00,
];

/// Tail-region denominator coefficients.
pub const D: [f64; 4] = [
    7.784695709041462e-03,
    3.224671290700398e-01,
    2.445134137142996e+00,
    3.754408661907416e+00,
];

/// Boundary between the lower tail and the central region.
pub const X_LOW: f64 = 0.02425;

#[inline]
fn c<T: Float>(v: f64) -> T {
    T::from(v).unwrap_or_else(T::zero)
}

#[inline]
fn tail<T: Float>(z: T) -> T {
    (((((c::<T>(C[0]) * z + c(C[1])) * z + c(C[2])) * z + c(C[3])) * z + c(C[4])) * z + c(C[5]))
        / ((((c::<T>(D[0]) * z + c(D[1])) * z + c(D[2])) * z + c(D[3])) * z + T::one())
}

/// Maps a raw generator output onto a standard normal deviate.
///
/// # Examples
///
/// ```rust
/// use pricer_compute::rng::inverse_cumulative_normal;
///
/// assert_eq!(inverse_cumulative_normal::<f64>(u32::MAX), f32::MAX as f64);
/// assert_eq!(inverse_cumulative_normal::<f32>(0), -f32::MAX);
/// assert!(inverse_cumulative_normal::<f64>(u32::MAX / 2).abs() < 1e-6);
/// ```
pub fn inverse_cumulative_normal<T: Float>(x0: u32) -> T {
    let x = c::<T>(x0 as f64) / c::<T>(u32::MAX as f64);
    if x0 == u32::MAX || x >= T::one() {
        return c::<T>(SATURATION);
    }
    if x0 == 0 || x <= T::zero() {
        return -c::<T>(SATURATION);
    }

    let x_low = c::<T>(X_LOW);
    let x_high = T::one() - x_low;
    let two = c::<T>(2.0);

    if x < x_low {
        tail((-two * x.ln()).sqrt())
    } else if x > x_high {
        -tail((-two * (T::one() - x).ln()).sqrt())
    } else {
        let z = x - c(0.5);
        let r = z * z;
        (((((c::<T>(A[0]) * r + c(A[1])) * r + c(A[2])) * r + c(A[3])) * r + c(A[4])) * r
            + c(A[5]))
            * z
            / (((((c::<T>(B[0]) * r + c(B[1])) * r + c(B[2])) * r + c(B[3])) * r + c(B[4])) * r
                + T::one())
    }
}
