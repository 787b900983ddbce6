//! Demo command implementation
//!
//! Prices a European call under geometric Brownian motion on a compute
//! device. The first run records the model and builds the kernel; later runs
//! of the same slot only upload inputs and execute the cached kernel.

use std::time::Instant;

use pricer_compute::{ComputeConfig, ComputeContext, ComputeFramework, DebugInfo, OpCode};
use serde::Serialize;
use tracing::info;

use crate::{CliError, Result};

const SPOT: f64 = 100.0;
const STRIKE: f64 = 100.0;
const RATE: f64 = 0.03;
const VOLATILITY: f64 = 0.2;
const MATURITY: f64 = 1.0;

/// Arguments of the demo command
#[derive(Debug, Clone)]
pub struct DemoArgs {
    /// Device to run on
    pub device: String,
    /// Monte Carlo paths
    pub num_paths: usize,
    /// Time steps per path
    pub steps: usize,
    /// Runs of the same slot
    pub runs: usize,
    /// Output format (table, json)
    pub format: String,
}

#[derive(Debug, Serialize)]
struct RunReport {
    run: usize,
    calculation_id: usize,
    new_kernel: bool,
    price: f64,
    std_error: f64,
    elapsed_ms: f64,
}

#[derive(Debug, Serialize)]
struct DemoReport<'a> {
    device: &'a str,
    num_paths: usize,
    steps: usize,
    double_precision: bool,
    runs: Vec<RunReport>,
    debug: Option<DebugInfo>,
}

/// Run the demo command
pub fn run(config: &ComputeConfig, args: &DemoArgs) -> Result<()> {
    if args.format != "table" && args.format != "json" {
        return Err(CliError::InvalidArgument(format!(
            "Unknown format: {}. Supported: json, table",
            args.format
        )));
    }
    if args.steps == 0 {
        return Err(CliError::InvalidArgument(
            "steps must be at least 1".to_string(),
        ));
    }

    let settings = config.default_settings;
    let mut framework = ComputeFramework::new(config);
    let context = framework.context(&args.device)?;
    info!(
        device = %args.device,
        paths = args.num_paths,
        steps = args.steps,
        runs = args.runs,
        "Starting demo"
    );

    let mut runs = Vec::with_capacity(args.runs);
    let mut id = 0;
    for run in 1..=args.runs {
        let start = Instant::now();
        let (calculation_id, new_kernel) =
            context.initiate_calculation(args.num_paths, id, 0, settings)?;
        id = calculation_id;
        record_call(context, args.steps, new_kernel)?;

        let mut outputs = vec![Vec::new()];
        context.finalize_calculation(&mut outputs)?;
        let (price, std_error) = mean_and_error(&outputs[0]);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
        info!(run, new_kernel, price, elapsed_ms, "Run complete");

        runs.push(RunReport {
            run,
            calculation_id,
            new_kernel,
            price,
            std_error,
            elapsed_ms,
        });
    }

    let report = DemoReport {
        device: &args.device,
        num_paths: args.num_paths,
        steps: args.steps,
        double_precision: settings.use_double_precision,
        runs,
        debug: settings.debug.then(|| *context.debug_info()),
    };

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_table(&report),
    }
    Ok(())
}

/// Discounted call payoff over log-Euler steps.
///
/// Inputs are created in the same order on every run; the model itself is
/// only recorded while the slot has no kernel.
fn record_call(context: &mut dyn ComputeContext, steps: usize, record: bool) -> Result<()> {
    let dt = MATURITY / steps as f64;
    let spot = context.create_input_variable(SPOT)?;
    let drift = context.create_input_variable((RATE - 0.5 * VOLATILITY * VOLATILITY) * dt)?;
    let vol = context.create_input_variable(VOLATILITY * dt.sqrt())?;
    let strike = context.create_input_variable(STRIKE)?;
    let zero = context.create_input_variable(0.0)?;
    let discount = context.create_input_variable((-RATE * MATURITY).exp())?;
    if !record {
        return Ok(());
    }

    let z = context.create_input_variates(1, steps)?;
    let mut s = spot;
    for row in &z {
        let shock = context.apply_operation(OpCode::Mult, &[vol, row[0]])?;
        let log_step = context.apply_operation(OpCode::Add, &[drift, shock])?;
        let growth = context.apply_operation(OpCode::Exp, &[log_step])?;
        let next = context.apply_operation(OpCode::Mult, &[s, growth])?;
        context.free_variable(shock)?;
        context.free_variable(log_step)?;
        context.free_variable(growth)?;
        if s != spot {
            context.free_variable(s)?;
        }
        s = next;
    }
    let intrinsic = context.apply_operation(OpCode::Subtract, &[s, strike])?;
    let payoff = context.apply_operation(OpCode::Max, &[intrinsic, zero])?;
    let pv = context.apply_operation(OpCode::Mult, &[payoff, discount])?;
    context.declare_output_variable(pv)?;
    Ok(())
}

fn mean_and_error(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0);
    (mean, (variance / n).sqrt())
}

fn print_table(report: &DemoReport<'_>) {
    println!(
        "\n{} | {} paths x {} steps | {}",
        report.device,
        report.num_paths,
        report.steps,
        if report.double_precision {
            "double"
        } else {
            "single"
        }
    );
    println!("┌─────┬────────┬────────────┬────────────┬────────────┐");
    println!("│ Run │ Kernel │ Price      │ Std error  │ Time (ms)  │");
    println!("├─────┼────────┼────────────┼────────────┼────────────┤");
    for run in &report.runs {
        println!(
            "│ {:>3} │ {:<6} │ {:>10.5} │ {:>10.5} │ {:>10.3} │",
            run.run,
            if run.new_kernel { "built" } else { "cached" },
            run.price,
            run.std_error,
            run.elapsed_ms
        );
    }
    println!("└─────┴────────┴────────────┴────────────┴────────────┘");

    if let Some(debug) = &report.debug {
        println!("\nOperations:        {}", debug.number_of_operations);
        println!("Data copy (ns):    {}", debug.nanoseconds_data_copy);
        println!("Program build (ns):{}", debug.nanoseconds_program_build);
        println!("Calculation (ns):  {}", debug.nanoseconds_calculation);
    }
}
