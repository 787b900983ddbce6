//! Host backend: kernels run on a dedicated rayon thread pool.
//!
//! "Building" a kernel validates the program's buffer references and keeps
//! the resolved instruction list; launching interprets it path-parallel, one
//! register file per worker. The generator is the host
//! [`MersenneTwister`] and produces the same deviates as the device routines.

use num_traits::Float;
use rayon::prelude::*;
use tracing::debug;

use super::{host_sizeof_entries, DeviceBackend, DeviceDescriptor, LaunchArgs};
use crate::config::ComputeConfig;
use crate::error::{ComputeError, ComputeResult};
use crate::ir::{KernelProgram, Operand};
use crate::rng::{fill_normal_batch, MersenneTwister, MT_N};
use crate::settings::Precision;
use crate::tracker::StagedValues;

/// Values held by the host "device".
#[derive(Clone, Debug, PartialEq)]
pub enum HostBuffer {
    /// Single precision values.
    Single(Vec<f32>),
    /// Double precision values.
    Double(Vec<f64>),
}

impl HostBuffer {
    /// Number of values.
    pub fn len(&self) -> usize {
        match self {
            HostBuffer::Single(v) => v.len(),
            HostBuffer::Double(v) => v.len(),
        }
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn precision(&self) -> Precision {
        match self {
            HostBuffer::Single(_) => Precision::Single,
            HostBuffer::Double(_) => Precision::Double,
        }
    }
}

/// Element types a [`HostBuffer`] can hold.
trait HostValue: Float + Send + Sync {
    fn view(buffer: &HostBuffer) -> Option<&[Self]>;
    fn view_mut(buffer: &mut HostBuffer) -> Option<&mut [Self]>;
}

impl HostValue for f32 {
    fn view(buffer: &HostBuffer) -> Option<&[Self]> {
        match buffer {
            HostBuffer::Single(v) => Some(v.as_slice()),
            HostBuffer::Double(_) => None,
        }
    }

    fn view_mut(buffer: &mut HostBuffer) -> Option<&mut [Self]> {
        match buffer {
            HostBuffer::Single(v) => Some(v.as_mut_slice()),
            HostBuffer::Double(_) => None,
        }
    }
}

impl HostValue for f64 {
    fn view(buffer: &HostBuffer) -> Option<&[Self]> {
        match buffer {
            HostBuffer::Double(v) => Some(v.as_slice()),
            HostBuffer::Single(_) => None,
        }
    }

    fn view_mut(buffer: &mut HostBuffer) -> Option<&mut [Self]> {
        match buffer {
            HostBuffer::Double(v) => Some(v.as_mut_slice()),
            HostBuffer::Single(_) => None,
        }
    }
}

/// Validated program ready for interpretation.
#[derive(Clone, Debug)]
pub struct HostKernel {
    program: KernelProgram,
    precision: Precision,
}

/// Host backend bound to one rayon thread pool.
pub struct HostBackend {
    descriptor: DeviceDescriptor,
    threads: usize,
    pool: Option<rayon::ThreadPool>,
}

impl HostBackend {
    /// Device name of the host backend.
    pub const DEVICE_NAME: &'static str = "Host/Rayon/cpu";

    /// Creates a host backend with `threads` workers (0 = one per logical
    /// CPU).
    pub fn new(threads: usize, supports_double_precision: bool) -> Self {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };
        let info = vec![
            (
                "device_name".to_string(),
                format!("cpu ({} threads)", threads),
            ),
            (
                "driver_version".to_string(),
                "rayon".to_string(),
            ),
            (
                "device_version".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
            (
                "device_extensions".to_string(),
                if supports_double_precision {
                    "fp64".to_string()
                } else {
                    String::new()
                },
            ),
            (
                "device_double_fp_config".to_string(),
                if supports_double_precision {
                    "Denorm,InfNan,RoundNearest,RoundZero,RoundInf,FMA".to_string()
                } else {
                    String::new()
                },
            ),
        ];
        Self {
            descriptor: DeviceDescriptor {
                name: Self::DEVICE_NAME.to_string(),
                info,
                supports_double_precision,
            },
            threads,
            pool: None,
        }
    }

    /// Creates the host backend described by `config`.
    pub fn from_config(config: &ComputeConfig) -> Self {
        Self::new(
            config.resolved_host_threads(),
            config.host_double_precision,
        )
    }

    fn pool(&self) -> ComputeResult<&rayon::ThreadPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| ComputeError::device("Host backend", "not connected"))
    }
}

impl std::fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBackend")
            .field("name", &self.descriptor.name)
            .field("threads", &self.threads)
            .field("connected", &self.pool.is_some())
            .finish()
    }
}

impl DeviceBackend for HostBackend {
    type Kernel = HostKernel;
    type Buffer = HostBuffer;
    type Generator = MersenneTwister;

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn connect(&mut self) -> ComputeResult<()> {
        if self.pool.is_some() {
            return Ok(());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("pricer-compute-{}", i))
            .build()
            .map_err(|e| ComputeError::Transient(e.to_string()))?;
        debug!(threads = self.threads, "Host execution queue created");
        self.pool = Some(pool);
        Ok(())
    }

    fn health_checks(&mut self) -> Vec<(String, String)> {
        let mut entries = host_sizeof_entries();
        match self.pool() {
            Ok(pool) => {
                let sizes = pool.install(|| {
                    [
                        ("uint", std::mem::size_of::<u32>()),
                        ("ulong", std::mem::size_of::<u64>()),
                        ("float", std::mem::size_of::<f32>()),
                        ("double", std::mem::size_of::<f64>()),
                    ]
                });
                entries.extend(
                    sizes
                        .iter()
                        .map(|(ty, size)| (format!("device_sizeof({})", ty), size.to_string())),
                );
            }
            Err(err) => entries.push(("device_sizeof".to_string(), err.to_string())),
        }
        entries
    }

    fn build_kernel(
        &mut self,
        program: &KernelProgram,
        precision: Precision,
    ) -> ComputeResult<HostKernel> {
        if precision == Precision::Double && !self.descriptor.supports_double_precision {
            return Err(ComputeError::DoublePrecisionUnsupported {
                device: self.descriptor.name.clone(),
            });
        }

        let check = |operand: &Operand, defined: &[bool]| -> Result<(), String> {
            match *operand {
                Operand::Input { offset, scalar } => {
                    let end = if scalar { offset + 1 } else { offset + program.n };
                    if end > program.input_len {
                        return Err(format!("{} outside input buffer", operand));
                    }
                }
                Operand::Variate { index } => {
                    if index >= program.n_variates {
                        return Err(format!("{} outside variates pool", operand));
                    }
                }
                Operand::Result(id) => {
                    if !defined.get(id).copied().unwrap_or(false) {
                        return Err(format!("{} used before assignment", operand));
                    }
                }
            }
            Ok(())
        };

        let mut defined = vec![false; program.n_registers];
        let mut log = Vec::new();
        for instruction in &program.instructions {
            if let Err(e) = instruction.op.validate(instruction.args.len()) {
                log.push(format!("{}: {}", instruction, e));
            }
            for arg in &instruction.args {
                if let Err(e) = check(arg, &defined) {
                    log.push(format!("{}: {}", instruction, e));
                }
            }
            match defined.get_mut(instruction.result) {
                Some(slot) => *slot = true,
                None => log.push(format!("{}: register out of range", instruction)),
            }
        }
        for output in &program.outputs {
            if let Err(e) = check(output, &defined) {
                log.push(format!("output {}", e));
            }
        }

        if !log.is_empty() {
            return Err(ComputeError::build(
                program.name.as_str(),
                "invalid program",
                &log.join("\n"),
            ));
        }

        Ok(HostKernel {
            program: program.clone(),
            precision,
        })
    }

    fn upload(&mut self, values: &StagedValues) -> ComputeResult<HostBuffer> {
        Ok(match values {
            StagedValues::Single(v) => HostBuffer::Single(v.clone()),
            StagedValues::Double(v) => HostBuffer::Double(v.clone()),
        })
    }

    fn allocate(&mut self, len: usize, precision: Precision) -> ComputeResult<HostBuffer> {
        Ok(match precision {
            Precision::Single => HostBuffer::Single(vec![0.0; len]),
            Precision::Double => HostBuffer::Double(vec![0.0; len]),
        })
    }

    fn copy_prefix(
        &mut self,
        src: &HostBuffer,
        dst: &mut HostBuffer,
        len: usize,
    ) -> ComputeResult<()> {
        if len > src.len() || len > dst.len() {
            return Err(ComputeError::device(
                "Copy buffer",
                format!("{} values exceed buffer sizes {} / {}", len, src.len(), dst.len()),
            ));
        }
        match (src, dst) {
            (HostBuffer::Single(s), HostBuffer::Single(d)) => d[..len].copy_from_slice(&s[..len]),
            (HostBuffer::Double(s), HostBuffer::Double(d)) => d[..len].copy_from_slice(&s[..len]),
            (s, d) => {
                return Err(ComputeError::device(
                    "Copy buffer",
                    format!("{} source into {} destination", s.precision(), d.precision()),
                ))
            }
        }
        Ok(())
    }

    fn download(&mut self, src: &HostBuffer, offset: usize, out: &mut [f64]) -> ComputeResult<()> {
        let end = offset + out.len();
        if end > src.len() {
            return Err(ComputeError::device(
                "Read buffer",
                format!("range {}..{} exceeds buffer size {}", offset, end, src.len()),
            ));
        }
        match src {
            HostBuffer::Single(v) => {
                for (o, &x) in out.iter_mut().zip(&v[offset..end]) {
                    *o = x as f64;
                }
            }
            HostBuffer::Double(v) => out.copy_from_slice(&v[offset..end]),
        }
        Ok(())
    }

    fn seed_generator(&mut self, seed: u64, _precision: Precision) -> ComputeResult<MersenneTwister> {
        Ok(MersenneTwister::from_seed(seed))
    }

    fn generate_batch(
        &mut self,
        generator: &mut MersenneTwister,
        pool: &mut HostBuffer,
        offset: usize,
    ) -> ComputeResult<()> {
        let end = offset + MT_N;
        if end > pool.len() {
            return Err(ComputeError::device(
                "Generate variates",
                format!("batch {}..{} exceeds pool size {}", offset, end, pool.len()),
            ));
        }
        match pool {
            HostBuffer::Single(v) => fill_normal_batch(generator, &mut v[offset..end]),
            HostBuffer::Double(v) => fill_normal_batch(generator, &mut v[offset..end]),
        }
        Ok(())
    }

    fn launch(&mut self, kernel: &HostKernel, args: LaunchArgs<'_, HostBuffer>) -> ComputeResult<()> {
        let pool = self.pool()?;
        match kernel.precision {
            Precision::Single => execute::<f32>(pool, &kernel.program, args),
            Precision::Double => execute::<f64>(pool, &kernel.program, args),
        }
    }

    fn finish(&mut self) -> ComputeResult<()> {
        // Launches complete before `launch` returns.
        self.pool().map(|_| ())
    }
}

fn view<'a, T: HostValue>(buffer: Option<&'a HostBuffer>, what: &str) -> ComputeResult<&'a [T]> {
    match buffer {
        None => Ok(&[]),
        Some(b) => T::view(b).ok_or_else(|| {
            ComputeError::device("Launch", format!("{} buffer precision does not match kernel", what))
        }),
    }
}

fn execute<T: HostValue>(
    pool: &rayon::ThreadPool,
    program: &KernelProgram,
    args: LaunchArgs<'_, HostBuffer>,
) -> ComputeResult<()> {
    let n = args.n;
    let input = view::<T>(args.input, "input")?;
    let rn = view::<T>(args.variates, "variates")?;
    let output = match args.output {
        Some(b) => T::view_mut(b).ok_or_else(|| {
            ComputeError::device("Launch", "output buffer precision does not match kernel")
        })?,
        None => return Ok(()),
    };

    let n_out = program.outputs.len();
    if n_out == 0 || n == 0 {
        return Ok(());
    }
    if output.len() < n_out * n || rn.len() < program.n_variates * n || input.len() < program.input_len {
        return Err(ComputeError::device(
            format!("Launch kernel '{}'", program.name),
            "buffer smaller than kernel signature",
        ));
    }

    // Path-major staging, transposed into the output-major layout below.
    let mut staging = vec![T::zero(); n * n_out];
    pool.install(|| {
        staging.par_chunks_mut(n_out).enumerate().for_each_init(
            || vec![T::zero(); program.n_registers],
            |registers, (i, row)| evaluate_path(program, i, input, rn, registers, row),
        );
    });

    for (i, row) in staging.chunks(n_out).enumerate() {
        for (k, &value) in row.iter().enumerate() {
            output[k * n + i] = value;
        }
    }
    Ok(())
}

#[inline]
fn evaluate_path<T: Float>(
    program: &KernelProgram,
    i: usize,
    input: &[T],
    rn: &[T],
    registers: &mut [T],
    row: &mut [T],
) {
    let n = program.n;
    let fetch = |operand: &Operand, registers: &[T]| -> T {
        match *operand {
            Operand::Input { offset, scalar } => input[if scalar { offset } else { offset + i }],
            Operand::Variate { index } => rn[index * n + i],
            Operand::Result(id) => registers[id],
        }
    };

    for instruction in &program.instructions {
        let mut values = [T::zero(); 2];
        for (value, arg) in values.iter_mut().zip(&instruction.args) {
            *value = fetch(arg, registers);
        }
        registers[instruction.result] = instruction.op.evaluate(&values[..instruction.args.len()]);
    }
    for (value, output) in row.iter_mut().zip(&program.outputs) {
        *value = fetch(output, registers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Instruction;
    use crate::opcode::OpCode;
    use approx::assert_relative_eq;

    fn connected(threads: usize) -> HostBackend {
        let mut backend = HostBackend::new(threads, true);
        backend.connect().unwrap();
        backend
    }

    fn add_program(n: usize) -> KernelProgram {
        KernelProgram {
            name: KernelProgram::kernel_name(1, 0),
            n,
            input_len: 1 + n,
            n_variates: 0,
            n_registers: 3,
            instructions: vec![Instruction {
                result: 2,
                declare: true,
                op: OpCode::Add,
                args: vec![
                    Operand::Input {
                        offset: 0,
                        scalar: true,
                    },
                    Operand::Input {
                        offset: 1,
                        scalar: false,
                    },
                ],
            }],
            outputs: vec![
                Operand::Result(2),
                Operand::Input {
                    offset: 0,
                    scalar: true,
                },
            ],
        }
    }

    #[test]
    fn test_descriptor() {
        let backend = HostBackend::new(2, false);
        let descriptor = backend.descriptor();
        assert_eq!(descriptor.name, "Host/Rayon/cpu");
        assert!(!descriptor.supports_double_precision);
        assert_eq!(descriptor.info[0].0, "device_name");
        assert_eq!(descriptor.info[0].1, "cpu (2 threads)");
    }

    #[test]
    fn test_launch_before_connect_fails() {
        let mut backend = HostBackend::new(1, true);
        let program = add_program(2);
        let kernel = backend.build_kernel(&program, Precision::Double).unwrap();
        let args = LaunchArgs {
            n: 2,
            input: None,
            variates: None,
            output: None,
        };
        assert!(backend.launch(&kernel, args).is_err());
    }

    #[test]
    fn test_execute_output_major() {
        let mut backend = connected(2);
        let program = add_program(4);
        let kernel = backend.build_kernel(&program, Precision::Double).unwrap();

        let input = backend
            .upload(&StagedValues::Double(vec![2.0, 1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let mut output = backend.allocate(8, Precision::Double).unwrap();
        backend
            .launch(
                &kernel,
                LaunchArgs {
                    n: 4,
                    input: Some(&input),
                    variates: None,
                    output: Some(&mut output),
                },
            )
            .unwrap();
        backend.finish().unwrap();

        assert_eq!(
            output,
            HostBuffer::Double(vec![3.0, 4.0, 5.0, 6.0, 2.0, 2.0, 2.0, 2.0])
        );
    }

    #[test]
    fn test_build_rejects_out_of_range_reference() {
        let mut backend = connected(1);
        let mut program = add_program(4);
        program.input_len = 2;
        let err = backend.build_kernel(&program, Precision::Single).unwrap_err();
        match err {
            ComputeError::Build { kernel, log, .. } => {
                assert_eq!(kernel, "pricer_kernel_1_0");
                assert!(log.contains("outside input buffer"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_rejects_double_without_support() {
        let mut backend = HostBackend::new(1, false);
        let err = backend
            .build_kernel(&add_program(2), Precision::Double)
            .unwrap_err();
        assert!(matches!(err, ComputeError::DoublePrecisionUnsupported { .. }));
    }

    #[test]
    fn test_precision_mismatch_rejected() {
        let mut backend = connected(1);
        let kernel = backend
            .build_kernel(&add_program(2), Precision::Single)
            .unwrap();
        let input = backend
            .upload(&StagedValues::Double(vec![1.0, 2.0, 3.0]))
            .unwrap();
        let mut output = backend.allocate(4, Precision::Single).unwrap();
        let result = backend.launch(
            &kernel,
            LaunchArgs {
                n: 2,
                input: Some(&input),
                variates: None,
                output: Some(&mut output),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_generate_matches_reference() {
        let mut backend = connected(1);
        let mut generator = backend.seed_generator(7, Precision::Double).unwrap();
        let mut pool = backend.allocate(2 * MT_N, Precision::Double).unwrap();
        backend.generate_batch(&mut generator, &mut pool, 0).unwrap();
        backend
            .generate_batch(&mut generator, &mut pool, MT_N)
            .unwrap();

        let mut reference = MersenneTwister::from_seed(7);
        let mut expected = vec![0.0_f64; 2 * MT_N];
        fill_normal_batch(&mut reference, &mut expected[..MT_N]);
        fill_normal_batch(&mut reference, &mut expected[MT_N..]);
        assert_eq!(pool, HostBuffer::Double(expected));

        assert!(backend
            .generate_batch(&mut generator, &mut pool, MT_N + 1)
            .is_err());
    }

    #[test]
    fn test_copy_prefix_and_download() {
        let mut backend = connected(1);
        let src = backend
            .upload(&StagedValues::Single(vec![1.5, 2.5, 3.5]))
            .unwrap();
        let mut dst = backend.allocate(5, Precision::Single).unwrap();
        backend.copy_prefix(&src, &mut dst, 2).unwrap();

        let mut out = [0.0; 3];
        backend.download(&dst, 1, &mut out).unwrap();
        assert_relative_eq!(out[0], 2.5);
        assert_eq!(out[1], 0.0);
        assert!(backend.download(&dst, 4, &mut out).is_err());
    }

    #[test]
    fn test_health_checks() {
        let mut backend = connected(1);
        let entries = backend.health_checks();
        assert!(entries.contains(&("device_sizeof(double)".to_string(), "8".to_string())));
        assert!(entries.contains(&("host_sizeof(ulong)".to_string(), "8".to_string())));
    }
}
