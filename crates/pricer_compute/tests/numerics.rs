//! Numerical behaviour of kernels: tolerant comparisons and single
//! precision narrowing.

use approx::assert_relative_eq;
use pricer_compute::opcode::tolerance;
use pricer_compute::{ComputeContext, Engine, HostBackend, OpCode, RetryPolicy, Settings};
use proptest::prelude::*;

fn engine() -> Engine<HostBackend> {
    Engine::new(HostBackend::new(2, true), RetryPolicy::no_retry())
}

fn double() -> Settings {
    Settings {
        use_double_precision: true,
        ..Settings::default()
    }
}

/// Evaluates `op(x, y)` element-wise.
fn binary(
    engine: &mut Engine<HostBackend>,
    op: OpCode,
    x: &[f64],
    y: &[f64],
    settings: Settings,
) -> Vec<f64> {
    engine.initiate_calculation(x.len(), 0, 0, settings).unwrap();
    let a = engine.create_input_array(x).unwrap();
    let b = engine.create_input_array(y).unwrap();
    let r = engine.apply_operation(op, &[a, b]).unwrap();
    engine.declare_output_variable(r).unwrap();
    let mut outputs = vec![Vec::new()];
    engine.finalize_calculation(&mut outputs).unwrap();
    outputs.remove(0)
}

#[test]
fn test_indicator_eq_tolerance() {
    let mut engine = engine();
    let tol: f64 = tolerance();
    let x = [1.0, 1.0, 0.0, 0.0, 1e-30, -5.0, 0.0];
    let y = [1.0 + 1e-15, 1.0 + 1e-12, 1e-30, 1e-20, 0.0, -5.0, 0.0];
    let result = binary(&mut engine, OpCode::IndicatorEq, &x, &y, double());
    assert_eq!(result, vec![1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0]);
    assert!(1e-30 < tol * tol && 1e-20 > tol * tol);
}

#[test]
fn test_indicator_gt_and_geq() {
    let mut engine = engine();
    let x = [2.0, 1.0, 1.0 + 1e-15, 0.5];
    let y = [1.0, 1.0, 1.0, 1.0];
    assert_eq!(
        binary(&mut engine, OpCode::IndicatorGt, &x, &y, double()),
        vec![1.0, 0.0, 0.0, 0.0]
    );
    assert_eq!(
        binary(&mut engine, OpCode::IndicatorGeq, &x, &y, double()),
        vec![1.0, 1.0, 1.0, 0.0]
    );
}

#[test]
fn test_single_precision_tolerance() {
    let mut engine = engine();
    // 1 + 1e-6 is within 42 single precision ulps of 1, not of double.
    let x = [1.0, 1.0];
    let y = [1.0 + 1e-6, 1.0 + 1e-4];
    assert_eq!(
        binary(&mut engine, OpCode::IndicatorEq, &x, &y, Settings::default()),
        vec![1.0, 0.0]
    );
    assert_eq!(
        binary(&mut engine, OpCode::IndicatorEq, &x, &y, double()),
        vec![0.0, 0.0]
    );
}

#[test]
fn test_narrowing_clamps_to_float_max() {
    let mut engine = engine();
    engine
        .initiate_calculation(4, 0, 0, Settings::default())
        .unwrap();
    let scalar = engine.create_input_variable(1e300).unwrap();
    let array = engine
        .create_input_array(&[1e300, -1e300, 1.5, f64::MAX])
        .unwrap();
    engine.declare_output_variable(scalar).unwrap();
    engine.declare_output_variable(array).unwrap();

    let mut outputs = vec![Vec::new(), Vec::new()];
    engine.finalize_calculation(&mut outputs).unwrap();

    let max = f32::MAX as f64;
    assert_eq!(outputs[0], vec![max; 4]);
    assert_eq!(outputs[1], vec![max, -max, 1.5, max]);
    assert!(outputs.iter().flatten().all(|v| v.is_finite()));
}

#[test]
fn test_double_precision_keeps_wide_values() {
    let mut engine = engine();
    let result = binary(&mut engine, OpCode::Max, &[1e300, 0.1], &[0.0, 0.2], double());
    assert_eq!(result, vec![1e300, 0.2]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_kernel_matches_host_arithmetic(
        values in prop::collection::vec((0.1f64..100.0, 0.1f64..100.0), 1..64)
    ) {
        let mut engine = engine();
        let (x, y): (Vec<f64>, Vec<f64>) = values.into_iter().unzip();

        let sum = binary(&mut engine, OpCode::Add, &x, &y, double());
        let quotient = binary(&mut engine, OpCode::Div, &x, &y, double());
        let power = binary(&mut engine, OpCode::Pow, &x, &y, double());
        for i in 0..x.len() {
            prop_assert_eq!(sum[i], x[i] + y[i]);
            prop_assert_eq!(quotient[i], x[i] / y[i]);
            assert_relative_eq!(power[i], x[i].powf(y[i]), max_relative = 1e-12);
        }
    }
}
