//! Operation codes understood by the engine.
//!
//! The enumeration mirrors the full opcode set used by the calling model
//! code. Only a closed subset has a kernel implementation; the remaining
//! codes are rejected with [`ComputeError::UnsupportedOpCode`].
//!
//! The tolerant comparison helpers defined here are the host reference of
//! the routines emitted into every kernel, see [`crate::codegen`].

use num_traits::Float;

use crate::error::{ComputeError, ComputeResult};

/// Multiple of machine epsilon used by the tolerant comparisons.
pub const TOLERANCE_ULPS: f64 = 42.0;

/// Operation code of an applied operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum OpCode {
    /// No operation.
    None = 0,
    /// `x + y`
    Add = 1,
    /// `x - y`
    Subtract = 2,
    /// `-x`
    Negative = 3,
    /// `x * y`
    Mult = 4,
    /// `x / y`
    Div = 5,
    /// Regression based conditional expectation.
    ConditionalExpectation = 6,
    /// `1` if `x` and `y` are close, else `0`.
    IndicatorEq = 7,
    /// `1` if `x > y` and not close, else `0`.
    IndicatorGt = 8,
    /// `1` if `x > y` or close, else `0`.
    IndicatorGeq = 9,
    /// `min(x, y)`
    Min = 10,
    /// `max(x, y)`
    Max = 11,
    /// `|x|`
    Abs = 12,
    /// `exp(x)`
    Exp = 13,
    /// `sqrt(x)`
    Sqrt = 14,
    /// `ln(x)`
    Log = 15,
    /// `x^y`
    Pow = 16,
    /// Standard normal cumulative distribution.
    NormalCdf = 17,
    /// Standard normal density.
    NormalPdf = 18,
}

/// All opcodes in numeric order.
pub const ALL_OP_CODES: [OpCode; 19] = [
    OpCode::None,
    OpCode::Add,
    OpCode::Subtract,
    OpCode::Negative,
    OpCode::Mult,
    OpCode::Div,
    OpCode::ConditionalExpectation,
    OpCode::IndicatorEq,
    OpCode::IndicatorGt,
    OpCode::IndicatorGeq,
    OpCode::Min,
    OpCode::Max,
    OpCode::Abs,
    OpCode::Exp,
    OpCode::Sqrt,
    OpCode::Log,
    OpCode::Pow,
    OpCode::NormalCdf,
    OpCode::NormalPdf,
];

impl OpCode {
    /// Numeric code.
    #[inline]
    pub fn code(self) -> usize {
        self as usize
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            OpCode::None => "None",
            OpCode::Add => "Add",
            OpCode::Subtract => "Subtract",
            OpCode::Negative => "Negative",
            OpCode::Mult => "Mult",
            OpCode::Div => "Div",
            OpCode::ConditionalExpectation => "ConditionalExpectation",
            OpCode::IndicatorEq => "IndicatorEq",
            OpCode::IndicatorGt => "IndicatorGt",
            OpCode::IndicatorGeq => "IndicatorGeq",
            OpCode::Min => "Min",
            OpCode::Max => "Max",
            OpCode::Abs => "Abs",
            OpCode::Exp => "Exp",
            OpCode::Sqrt => "Sqrt",
            OpCode::Log => "Log",
            OpCode::Pow => "Pow",
            OpCode::NormalCdf => "NormalCdf",
            OpCode::NormalPdf => "NormalPdf",
        }
    }

    /// Whether kernels can evaluate this opcode.
    pub fn is_supported(self) -> bool {
        !matches!(
            self,
            OpCode::None | OpCode::ConditionalExpectation | OpCode::NormalCdf | OpCode::NormalPdf
        )
    }

    /// Number of operands for supported opcodes.
    pub fn arity(self) -> Option<usize> {
        match self {
            OpCode::Negative | OpCode::Abs | OpCode::Exp | OpCode::Sqrt | OpCode::Log => Some(1),
            OpCode::Add
            | OpCode::Subtract
            | OpCode::Mult
            | OpCode::Div
            | OpCode::IndicatorEq
            | OpCode::IndicatorGt
            | OpCode::IndicatorGeq
            | OpCode::Min
            | OpCode::Max
            | OpCode::Pow => Some(2),
            _ => None,
        }
    }

    /// Checks that the opcode is supported and `args` matches its arity.
    pub fn validate(self, n_args: usize) -> ComputeResult<()> {
        let expected = self.arity().ok_or(ComputeError::UnsupportedOpCode {
            code: self.code(),
            label: self.label(),
        })?;
        if expected != n_args {
            return Err(ComputeError::ArityMismatch {
                label: self.label(),
                expected,
                got: n_args,
            });
        }
        Ok(())
    }

    /// Evaluates a supported opcode on host values.
    ///
    /// `args` must have been checked with [`validate`](Self::validate).
    #[inline]
    pub fn evaluate<T: Float>(self, args: &[T]) -> T {
        match self {
            OpCode::Add => args[0] + args[1],
            OpCode::Subtract => args[0] - args[1],
            OpCode::Negative => -args[0],
            OpCode::Mult => args[0] * args[1],
            OpCode::Div => args[0] / args[1],
            OpCode::IndicatorEq => indicator_eq(args[0], args[1]),
            OpCode::IndicatorGt => indicator_gt(args[0], args[1]),
            OpCode::IndicatorGeq => indicator_geq(args[0], args[1]),
            OpCode::Min => args[0].min(args[1]),
            OpCode::Max => args[0].max(args[1]),
            OpCode::Abs => args[0].abs(),
            OpCode::Exp => args[0].exp(),
            OpCode::Sqrt => args[0].sqrt(),
            OpCode::Log => args[0].ln(),
            OpCode::Pow => args[0].powf(args[1]),
            _ => T::nan(),
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code(), self.label())
    }
}

impl TryFrom<usize> for OpCode {
    type Error = ComputeError;

    fn try_from(code: usize) -> Result<Self, Self::Error> {
        ALL_OP_CODES
            .get(code)
            .copied()
            .ok_or(ComputeError::UnknownOpCode(code))
    }
}

/// Tolerance of the comparisons: 42 × machine epsilon of `T`.
#[inline]
pub fn tolerance<T: Float>() -> T {
    T::from(TOLERANCE_ULPS).unwrap_or_else(T::one) * T::epsilon()
}

/// Tolerant equality.
///
/// If either operand is exactly zero the absolute difference is compared
/// against `tol²`, otherwise against `tol` scaled by either magnitude.
///
/// # Examples
///
/// ```rust
/// use pricer_compute::opcode::close_enough;
///
/// assert!(close_enough(1.0_f64, 1.0 + 1e-15));
/// assert!(!close_enough(1.0_f64, 1.0 + 1e-10));
/// assert!(close_enough(0.0_f32, 0.0));
/// ```
#[inline]
pub fn close_enough<T: Float>(x: T, y: T) -> bool {
    let tol = tolerance::<T>();
    let diff = (x - y).abs();
    if x == T::zero() || y == T::zero() {
        return diff < tol * tol;
    }
    diff <= tol * x.abs() || diff <= tol * y.abs()
}

/// `1` if `x` and `y` are [close](close_enough), `0` otherwise.
#[inline]
pub fn indicator_eq<T: Float>(x: T, y: T) -> T {
    if close_enough(x, y) {
        T::one()
    } else {
        T::zero()
    }
}

/// `1` if `x > y` and the two are not close, `0` otherwise.
#[inline]
pub fn indicator_gt<T: Float>(x: T, y: T) -> T {
    if x > y && !close_enough(x, y) {
        T::one()
    } else {
        T::zero()
    }
}

/// `1` if `x > y` or the two are close, `0` otherwise.
#[inline]
pub fn indicator_geq<T: Float>(x: T, y: T) -> T {
    if x > y || close_enough(x, y) {
        T::one()
    } else {
        T::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_numeric_round_trip() {
        for (code, op) in ALL_OP_CODES.iter().enumerate() {
            assert_eq!(op.code(), code);
            assert_eq!(OpCode::try_from(code).unwrap(), *op);
        }
        assert!(matches!(
            OpCode::try_from(19),
            Err(ComputeError::UnknownOpCode(19))
        ));
    }

    #[test]
    fn test_unsupported_op_codes_are_named() {
        let err = OpCode::NormalCdf.validate(1).unwrap_err();
        assert!(err.to_string().contains("NormalCdf"));
        assert!(OpCode::ConditionalExpectation.validate(3).is_err());
        assert!(OpCode::None.validate(0).is_err());
    }

    #[test]
    fn test_arity_mismatch() {
        assert!(matches!(
            OpCode::Add.validate(1),
            Err(ComputeError::ArityMismatch {
                expected: 2,
                got: 1,
                ..
            })
        ));
        assert!(OpCode::Sqrt.validate(1).is_ok());
    }

    #[test]
    fn test_evaluate_arithmetic() {
        assert_relative_eq!(OpCode::Add.evaluate(&[2.0, 3.0]), 5.0);
        assert_relative_eq!(OpCode::Subtract.evaluate(&[2.0, 3.0]), -1.0);
        assert_relative_eq!(OpCode::Negative.evaluate(&[2.0]), -2.0);
        assert_relative_eq!(OpCode::Mult.evaluate(&[2.0, 3.0]), 6.0);
        assert_relative_eq!(OpCode::Div.evaluate(&[3.0, 2.0]), 1.5);
        assert_relative_eq!(OpCode::Min.evaluate(&[3.0, 2.0]), 2.0);
        assert_relative_eq!(OpCode::Max.evaluate(&[3.0, 2.0]), 3.0);
        assert_relative_eq!(OpCode::Abs.evaluate(&[-3.0]), 3.0);
        assert_relative_eq!(OpCode::Exp.evaluate(&[0.0]), 1.0);
        assert_relative_eq!(OpCode::Sqrt.evaluate(&[9.0]), 3.0);
        assert_relative_eq!(OpCode::Log.evaluate(&[1.0]), 0.0);
        assert_relative_eq!(OpCode::Pow.evaluate(&[2.0, 10.0]), 1024.0);
    }

    #[test]
    fn test_tolerance_per_precision() {
        assert_relative_eq!(tolerance::<f64>(), 42.0 * f64::EPSILON);
        assert_relative_eq!(tolerance::<f32>(), 42.0 * f32::EPSILON);
    }

    #[test]
    fn test_indicator_eq_zero_edge_cases() {
        let tol = tolerance::<f64>();
        // Zero operand compares against tol² (strictly)
        assert_eq!(indicator_eq(0.0, 0.5 * tol * tol), 1.0);
        assert_eq!(indicator_eq(0.5 * tol * tol, 0.0), 1.0);
        assert_eq!(indicator_eq(0.0, tol * tol), 0.0);
        assert_eq!(indicator_eq(0.0, 1e-20), 0.0);
        assert_eq!(indicator_eq(0.0, 0.0), 1.0);
    }

    #[test]
    fn test_indicator_gt_geq() {
        assert_eq!(indicator_gt(2.0, 1.0), 1.0);
        assert_eq!(indicator_gt(1.0, 2.0), 0.0);
        assert_eq!(indicator_gt(1.0 + 1e-16, 1.0), 0.0);
        assert_eq!(indicator_geq(1.0, 1.0 + 1e-16), 1.0);
        assert_eq!(indicator_geq(1.0, 2.0), 0.0);
        assert_eq!(indicator_geq(2.0, 1.0), 1.0);
    }

    proptest! {
        #[test]
        fn prop_indicator_eq_within_tolerance(x in 1e-3_f64..1e6, rel in -0.9_f64..0.9) {
            let y = x * (1.0 + rel * tolerance::<f64>());
            prop_assert_eq!(indicator_eq(x, y), 1.0);
        }

        #[test]
        fn prop_indicator_eq_outside_tolerance(x in 1e-3_f64..1e6, rel in 1e-9_f64..1.0) {
            let y = x * (1.0 + rel);
            prop_assert_eq!(indicator_eq(x, y), 0.0);
        }

        #[test]
        fn prop_gt_and_geq_consistent(x in -1e3_f64..1e3, y in -1e3_f64..1e3) {
            let gt = indicator_gt(x, y);
            let geq = indicator_geq(x, y);
            let eq = indicator_eq(x, y);
            prop_assert!(gt <= geq);
            prop_assert_eq!(geq, if gt == 1.0 || eq == 1.0 { 1.0 } else { 0.0 });
        }
    }
}
