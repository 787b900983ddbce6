//! Criterion benchmarks for pricer_compute.
//!
//! Benchmarks cover:
//! - Cached kernel re-execution (1K, 10K, 100K paths)
//! - First build of a calculation (recording + kernel build + run)
//! - Variates pool growth
//! - CUDA C source emission

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pricer_compute::codegen::{CudaEmitter, SourceEmitter};
use pricer_compute::ir::{Instruction, KernelProgram, Operand};
use pricer_compute::{
    ComputeContext, Engine, HostBackend, OpCode, Precision, RetryPolicy, Settings,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn engine() -> Engine<HostBackend> {
    Engine::new(HostBackend::new(0, true), RetryPolicy::no_retry())
}

fn settings() -> Settings {
    Settings {
        use_double_precision: true,
        ..Settings::default()
    }
}

fn spots(n: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n).map(|_| rng.gen_range(80.0..120.0)).collect()
}

/// Discounted call payoff over `steps` log-Euler steps.
fn record_call(engine: &mut Engine<HostBackend>, spot: &[f64], steps: usize) {
    let s0 = engine.create_input_array(spot).unwrap();
    let drift = engine.create_input_variable(-0.02).unwrap();
    let vol = engine.create_input_variable(0.2).unwrap();
    let strike = engine.create_input_variable(100.0).unwrap();
    let zero = engine.create_input_variable(0.0).unwrap();
    let df = engine.create_input_variable(0.95).unwrap();
    let z = engine.create_input_variates(1, steps).unwrap();

    let mut s = s0;
    for row in &z {
        let shock = engine.apply_operation(OpCode::Mult, &[vol, row[0]]).unwrap();
        let log_step = engine.apply_operation(OpCode::Add, &[drift, shock]).unwrap();
        let growth = engine.apply_operation(OpCode::Exp, &[log_step]).unwrap();
        let next = engine.apply_operation(OpCode::Mult, &[s, growth]).unwrap();
        for id in [shock, log_step, growth] {
            engine.free_variable(id).unwrap();
        }
        if s != s0 {
            engine.free_variable(s).unwrap();
        }
        s = next;
    }
    let intrinsic = engine.apply_operation(OpCode::Subtract, &[s, strike]).unwrap();
    let payoff = engine.apply_operation(OpCode::Max, &[intrinsic, zero]).unwrap();
    let pv = engine.apply_operation(OpCode::Mult, &[payoff, df]).unwrap();
    engine.declare_output_variable(pv).unwrap();
}

/// Benchmark re-execution of a cached kernel with fresh inputs.
fn bench_cached_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("cached_execution");

    for n in [1_000, 10_000, 100_000] {
        let spot = spots(n);
        let mut engine = engine();
        let (id, _) = engine.initiate_calculation(n, 0, 0, settings()).unwrap();
        record_call(&mut engine, &spot, 12);
        let mut outputs = vec![Vec::new()];
        engine.finalize_calculation(&mut outputs).unwrap();

        group.bench_with_input(BenchmarkId::new("paths", n), &n, |b, &n| {
            b.iter(|| {
                engine.initiate_calculation(n, id, 0, settings()).unwrap();
                engine.create_input_array(&spot).unwrap();
                for value in [-0.02, 0.2, 100.0, 0.0, 0.95] {
                    engine.create_input_variable(value).unwrap();
                }
                engine.finalize_calculation(&mut outputs).unwrap();
                black_box(outputs[0][0])
            });
        });
    }

    group.finish();
}

/// Benchmark a first run: recording, kernel build and execution.
fn bench_first_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("first_build");

    for steps in [1, 12, 52] {
        let spot = spots(1_000);
        let mut engine = engine();
        group.bench_with_input(BenchmarkId::new("steps", steps), &steps, |b, &steps| {
            b.iter(|| {
                engine.initiate_calculation(1_000, 0, 0, settings()).unwrap();
                record_call(&mut engine, &spot, steps);
                let mut outputs = vec![Vec::new()];
                engine.finalize_calculation(&mut outputs).unwrap();
                black_box(outputs)
            });
        });
    }

    group.finish();
}

/// Benchmark variates pool growth from empty.
fn bench_pool_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_growth");

    for n in [1_000, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::new("deviates", n), &n, |b, &n| {
            b.iter(|| {
                let mut engine = engine();
                engine.initiate_calculation(n, 0, 0, settings()).unwrap();
                engine.create_input_variates(1, 1).unwrap();
                black_box(engine.variates_pool_size())
            });
        });
    }

    group.finish();
}

/// Benchmark CUDA C emission for long instruction sequences.
fn bench_source_emission(c: &mut Criterion) {
    let mut group = c.benchmark_group("source_emission");

    for length in [10, 100, 1_000] {
        let mut instructions = Vec::with_capacity(length);
        for k in 0..length {
            let lhs = if k == 0 {
                Operand::Input {
                    offset: 0,
                    scalar: false,
                }
            } else {
                Operand::Result(k)
            };
            instructions.push(Instruction {
                result: k + 1,
                declare: true,
                op: OpCode::Mult,
                args: vec![lhs, Operand::Variate { index: k % 4 }],
            });
        }
        let program = KernelProgram {
            name: KernelProgram::kernel_name(1, 0),
            n: 10_000,
            input_len: 10_000,
            n_variates: 4,
            n_registers: length + 1,
            instructions,
            outputs: vec![Operand::Result(length)],
        };

        group.bench_with_input(
            BenchmarkId::new("instructions", length),
            &program,
            |b, program| {
                b.iter(|| black_box(CudaEmitter.kernel_source(program, Precision::Double)));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cached_execution,
    bench_first_build,
    bench_pool_growth,
    bench_source_emission
);
criterion_main!(benches);
