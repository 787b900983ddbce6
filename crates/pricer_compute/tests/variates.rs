//! Variates pool tests through the engine.
//!
//! Deviates read by kernels must equal the host reference generator, stay
//! in place as the pool grows, and be reproducible for a fixed seed.

use approx::assert_abs_diff_eq;
use pricer_compute::rng::{fill_normal_batch, MersenneTwister, MT_N};
use pricer_compute::{
    ComputeContext, ComputeError, Engine, HostBackend, OpCode, RetryPolicy, Settings,
};

fn engine() -> Engine<HostBackend> {
    Engine::new(HostBackend::new(2, true), RetryPolicy::no_retry())
}

fn double(seed: u64) -> Settings {
    Settings {
        use_double_precision: true,
        rng_seed: seed,
        debug: false,
    }
}

fn reference(seed: u64, len: usize) -> Vec<f64> {
    let mut mt = MersenneTwister::from_seed(seed);
    let mut values = vec![0.0_f64; len.div_ceil(MT_N) * MT_N];
    for batch in values.chunks_mut(MT_N) {
        fill_normal_batch(&mut mt, batch);
    }
    values
}

/// Declares every variate of a `dim × steps` grid as an output.
fn read_grid(
    engine: &mut Engine<HostBackend>,
    n: usize,
    dim: usize,
    steps: usize,
    settings: Settings,
) -> Vec<Vec<f64>> {
    engine.initiate_calculation(n, 0, 0, settings).unwrap();
    let grid = engine.create_input_variates(dim, steps).unwrap();
    for &id in grid.iter().flatten() {
        engine.declare_output_variable(id).unwrap();
    }
    let mut outputs = vec![Vec::new(); dim * steps];
    engine.finalize_calculation(&mut outputs).unwrap();
    outputs
}

#[test]
fn test_kernel_reads_pool_by_variate_index() {
    let mut engine = engine();
    let (n, dim, steps) = (8, 3, 2);
    let outputs = read_grid(&mut engine, n, dim, steps, double(42));
    let expected = reference(42, n * dim * steps);

    for (index, output) in outputs.iter().enumerate() {
        assert_eq!(output.as_slice(), &expected[index * n..(index + 1) * n]);
    }
}

#[test]
fn test_grid_ids_assigned_per_step_across_dimensions() {
    let mut engine = engine();
    engine.initiate_calculation(4, 0, 0, double(1)).unwrap();
    engine.create_input_variable(1.0).unwrap();
    let grid = engine.create_input_variates(3, 2).unwrap();
    assert_eq!(grid, vec![vec![1, 2, 3], vec![4, 5, 6]]);

    let more = engine.create_input_variates(2, 1).unwrap();
    assert_eq!(more, vec![vec![7, 8]]);
}

#[test]
fn test_same_seed_same_deviates() {
    let mut first = engine();
    let mut second = engine();
    read_grid(&mut first, 1000, 2, 1, double(7));
    read_grid(&mut second, 1000, 2, 1, double(7));
    assert_eq!(first.read_variates().unwrap(), second.read_variates().unwrap());

    let mut other = engine();
    read_grid(&mut other, 1000, 2, 1, double(8));
    assert_ne!(first.read_variates().unwrap(), other.read_variates().unwrap());
}

#[test]
fn test_growth_keeps_existing_deviates() {
    let mut engine = engine();
    read_grid(&mut engine, 100, 1, 1, double(3));
    assert_eq!(engine.variates_pool_size(), MT_N);
    let before = engine.read_variates().unwrap();

    read_grid(&mut engine, 1000, 2, 3, double(3));
    assert_eq!(engine.variates_pool_size(), 10 * MT_N);
    let after = engine.read_variates().unwrap();
    assert_eq!(&after[..MT_N], &before[..]);
    assert_eq!(after, reference(3, 6000));
}

#[test]
fn test_seed_of_later_calculations_ignored() {
    let mut engine = engine();
    read_grid(&mut engine, 10, 1, 1, double(11));
    read_grid(&mut engine, 2000, 1, 1, double(99));
    assert_eq!(engine.read_variates().unwrap(), reference(11, 2000));
}

#[test]
fn test_empty_grid_does_not_grow_pool() {
    let mut engine = engine();
    engine.initiate_calculation(10, 0, 0, double(1)).unwrap();
    let grid = engine.create_input_variates(0, 5).unwrap();
    assert_eq!(grid.len(), 5);
    assert!(grid.iter().all(Vec::is_empty));
    assert!(engine.create_input_variates(4, 0).unwrap().is_empty());
    assert_eq!(engine.variates_pool_size(), 0);
}

#[test]
fn test_pool_precision_is_fixed() {
    let mut engine = engine();
    read_grid(&mut engine, 10, 1, 1, Settings::default());

    engine.initiate_calculation(10, 0, 0, double(42)).unwrap();
    let err = engine.create_input_variates(1, 1).unwrap_err();
    assert!(matches!(
        err,
        ComputeError::VariatesPrecisionMismatch {
            pool: "single",
            requested: "double"
        }
    ));
}

#[test]
fn test_single_precision_deviates_match_reference() {
    let mut engine = engine();
    let outputs = read_grid(&mut engine, 50, 1, 1, Settings::default());

    let mut mt = MersenneTwister::from_seed(Settings::default().rng_seed);
    let mut expected = vec![0.0_f32; MT_N];
    fill_normal_batch(&mut mt, &mut expected);
    for (got, want) in outputs[0].iter().zip(&expected) {
        assert_eq!(*got, *want as f64);
    }
}

#[test]
fn test_deviates_are_standard_normal() {
    let mut engine = engine();
    let n = 20_000;
    engine.initiate_calculation(n, 0, 0, double(2024)).unwrap();
    let z = engine.create_input_variates(1, 1).unwrap();
    let squared = engine
        .apply_operation(OpCode::Mult, &[z[0][0], z[0][0]])
        .unwrap();
    engine.declare_output_variable(z[0][0]).unwrap();
    engine.declare_output_variable(squared).unwrap();

    let mut outputs = vec![Vec::new(), Vec::new()];
    engine.finalize_calculation(&mut outputs).unwrap();

    let mean = outputs[0].iter().sum::<f64>() / n as f64;
    let second_moment = outputs[1].iter().sum::<f64>() / n as f64;
    assert_abs_diff_eq!(mean, 0.0, epsilon = 0.05);
    assert_abs_diff_eq!(second_moment - mean * mean, 1.0, epsilon = 0.05);
    assert!(outputs[0].iter().all(|z| z.is_finite()));
}
