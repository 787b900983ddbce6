//! CUDA backend: kernels are emitted as CUDA C, compiled with NVRTC and run
//! through the driver API.
//!
//! Each device gets its own context and default stream when the engine
//! connects. Kernel modules are loaded under the kernel name; the variates
//! program is loaded once per device and precision.

use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::sys::{CUdevice_attribute, CUdeviceptr};
use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, DevicePtr, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileError, CompileOptions, Ptx};
use tracing::{debug, warn};

use super::{host_sizeof_entries, DeviceBackend, DeviceDescriptor, LaunchArgs, CUDA_PREFIX};
use crate::codegen::{CudaEmitter, SourceEmitter, GENERATE_ROUTINE, SEED_ROUTINE, TWIST_ROUTINE};
use crate::error::{ComputeError, ComputeResult};
use crate::ir::KernelProgram;
use crate::rng::MT_N;
use crate::settings::Precision;
use crate::tracker::StagedValues;

const HEALTH_CHECK_MODULE: &str = "pricer_health_check";
const HEALTH_CHECK_SOURCE: &str = "extern \"C\" __global__ void pricer_health_check(unsigned long long* out) {\n    \
     out[0] = sizeof(unsigned int);\n    \
     out[1] = sizeof(unsigned long);\n    \
     out[2] = sizeof(float);\n    \
     out[3] = sizeof(double);\n}\n";

/// Probed ordinals stop at the first device that fails to open.
const MAX_DEVICES: usize = 16;

/// Discovers the CUDA devices present on this machine.
pub fn enumerate() -> Vec<CudaBackend> {
    let mut backends = Vec::new();
    for ordinal in 0..MAX_DEVICES {
        match CudaDevice::new(ordinal) {
            Ok(device) => backends.push(CudaBackend::probe(ordinal, &device)),
            Err(err) => {
                if ordinal == 0 {
                    debug!(error = %err, "No CUDA device available");
                }
                break;
            }
        }
    }
    backends
}

/// Device buffer in one precision.
pub enum CudaBuffer {
    /// Single precision values.
    Single(CudaSlice<f32>),
    /// Double precision values.
    Double(CudaSlice<f64>),
}

impl CudaBuffer {
    fn len(&self) -> usize {
        match self {
            CudaBuffer::Single(s) => s.len(),
            CudaBuffer::Double(s) => s.len(),
        }
    }

    fn device_ptr(&self) -> *mut c_void {
        let ptr: &CUdeviceptr = match self {
            CudaBuffer::Single(s) => s.device_ptr(),
            CudaBuffer::Double(s) => s.device_ptr(),
        };
        ptr as *const CUdeviceptr as *mut c_void
    }
}

/// Loaded calculation kernel.
pub struct CudaKernel {
    name: String,
    function: CudaFunction,
    precision: Precision,
}

impl CudaKernel {
    /// Kernel name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Device-resident MT19937 state with its routines.
pub struct CudaGenerator {
    state: CudaSlice<u32>,
    precision: Precision,
    twist: CudaFunction,
    generate: CudaFunction,
}

/// Backend for one CUDA device.
pub struct CudaBackend {
    ordinal: usize,
    descriptor: DeviceDescriptor,
    device: Option<Arc<CudaDevice>>,
    emitter: CudaEmitter,
}

impl CudaBackend {
    fn probe(ordinal: usize, device: &Arc<CudaDevice>) -> Self {
        let model = device
            .name()
            .unwrap_or_else(|_| format!("device {}", ordinal));
        let capability = match (
            device.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR),
            device.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR),
        ) {
            (Ok(major), Ok(minor)) => format!("{}.{}", major, minor),
            _ => "unknown".to_string(),
        };
        let multiprocessors = device
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
            .map(|count| count.to_string())
            .unwrap_or_else(|e| e.to_string());

        let info = vec![
            ("device_name".to_string(), model.clone()),
            ("driver_version".to_string(), "CUDA driver API".to_string()),
            (
                "device_version".to_string(),
                format!("compute capability {}", capability),
            ),
            ("device_extensions".to_string(), "fp64".to_string()),
            (
                "device_double_fp_config".to_string(),
                "Denorm,InfNan,RoundNearest,RoundZero,RoundInf,FMA".to_string(),
            ),
            ("multiprocessor_count".to_string(), multiprocessors),
        ];

        Self {
            ordinal,
            descriptor: DeviceDescriptor {
                name: format!("{}NVIDIA/{} (#{})", CUDA_PREFIX, model, ordinal),
                info,
                supports_double_precision: true,
            },
            device: None,
            emitter: CudaEmitter,
        }
    }

    fn device(&self) -> ComputeResult<&Arc<CudaDevice>> {
        self.device
            .as_ref()
            .ok_or_else(|| ComputeError::device("CUDA backend", "not connected"))
    }

    /// Compiles `source` and loads its entry points as module `module`.
    fn load(
        &self,
        module: &str,
        source: &str,
        functions: &[&'static str],
    ) -> ComputeResult<()> {
        let ptx: Ptx = compile_ptx_with_opts(source, CompileOptions::default()).map_err(|e| {
            let log = match &e {
                CompileError::CompileError { log, .. } => log.to_string_lossy().into_owned(),
                other => format!("{:?}", other),
            };
            ComputeError::build(module, "NVRTC compilation failed", &log)
        })?;
        self.device()?
            .load_ptx(ptx, module, functions)
            .map_err(|e| ComputeError::device(format!("Load module '{}'", module), e))
    }

    fn function(&self, module: &str, name: &str) -> ComputeResult<CudaFunction> {
        self.device()?.get_func(module, name).ok_or_else(|| {
            ComputeError::device(
                format!("Load module '{}'", module),
                format!("function '{}' not found", name),
            )
        })
    }

    fn variates_module(precision: Precision) -> &'static str {
        match precision {
            Precision::Single => "pricer_variates_single",
            Precision::Double => "pricer_variates_double",
        }
    }

    fn run_health_check(&mut self) -> ComputeResult<Vec<u64>> {
        if self.device()?.get_func(HEALTH_CHECK_MODULE, HEALTH_CHECK_MODULE).is_none() {
            self.load(HEALTH_CHECK_MODULE, HEALTH_CHECK_SOURCE, &[HEALTH_CHECK_MODULE])?;
        }
        let function = self.function(HEALTH_CHECK_MODULE, HEALTH_CHECK_MODULE)?;
        let device = self.device()?;
        let mut out = device
            .alloc_zeros::<u64>(4)
            .map_err(|e| ComputeError::device("Health check", e))?;
        unsafe { function.launch(single_item(), (&mut out,)) }
            .map_err(|e| ComputeError::device("Health check", e))?;
        device
            .dtoh_sync_copy(&out)
            .map_err(|e| ComputeError::device("Health check", e))
    }
}

fn single_item() -> LaunchConfig {
    LaunchConfig {
        grid_dim: (1, 1, 1),
        block_dim: (1, 1, 1),
        shared_mem_bytes: 0,
    }
}

impl DeviceBackend for CudaBackend {
    type Kernel = CudaKernel;
    type Buffer = CudaBuffer;
    type Generator = CudaGenerator;

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn connect(&mut self) -> ComputeResult<()> {
        if self.device.is_some() {
            return Ok(());
        }
        let device = CudaDevice::new(self.ordinal).map_err(|e| {
            ComputeError::Transient(format!("CUDA device {}: {}", self.ordinal, e))
        })?;
        debug!(device = %self.descriptor.name, "CUDA context created");
        self.device = Some(device);
        Ok(())
    }

    fn health_checks(&mut self) -> Vec<(String, String)> {
        let mut entries = host_sizeof_entries();
        let types = ["uint", "ulong", "float", "double"];
        match self.run_health_check() {
            Ok(sizes) => entries.extend(
                types
                    .iter()
                    .zip(sizes)
                    .map(|(ty, size)| (format!("device_sizeof({})", ty), size.to_string())),
            ),
            Err(err) => {
                warn!(device = %self.descriptor.name, error = %err, "Device health check failed");
                entries.push(("device_sizeof".to_string(), err.to_string()));
            }
        }
        entries
    }

    fn build_kernel(
        &mut self,
        program: &KernelProgram,
        precision: Precision,
    ) -> ComputeResult<CudaKernel> {
        let source = self.emitter.kernel_source(program, precision);
        debug!(kernel = %program.name, "Kernel source:\n{}", source);

        // Function names must outlive the device; one entry per (slot, version).
        let name: &'static str = Box::leak(program.name.clone().into_boxed_str());
        self.load(name, &source, &[name])?;
        Ok(CudaKernel {
            name: program.name.clone(),
            function: self.function(name, name)?,
            precision,
        })
    }

    fn upload(&mut self, values: &StagedValues) -> ComputeResult<CudaBuffer> {
        let device = self.device()?;
        let buffer = match values {
            StagedValues::Single(v) => device.htod_sync_copy(v).map(CudaBuffer::Single),
            StagedValues::Double(v) => device.htod_sync_copy(v).map(CudaBuffer::Double),
        };
        buffer.map_err(|e| ComputeError::device("Write input buffer", e))
    }

    fn allocate(&mut self, len: usize, precision: Precision) -> ComputeResult<CudaBuffer> {
        let device = self.device()?;
        let buffer = match precision {
            Precision::Single => device.alloc_zeros::<f32>(len).map(CudaBuffer::Single),
            Precision::Double => device.alloc_zeros::<f64>(len).map(CudaBuffer::Double),
        };
        buffer.map_err(|e| ComputeError::device("Allocate buffer", e))
    }

    fn copy_prefix(
        &mut self,
        src: &CudaBuffer,
        dst: &mut CudaBuffer,
        len: usize,
    ) -> ComputeResult<()> {
        if len == 0 {
            return Ok(());
        }
        if len > src.len() || len > dst.len() {
            return Err(ComputeError::device(
                "Copy buffer",
                format!("{} values exceed buffer sizes {} / {}", len, src.len(), dst.len()),
            ));
        }
        let device = self.device()?;
        let result = match (src, dst) {
            (CudaBuffer::Single(s), CudaBuffer::Single(d)) => {
                device.dtod_copy(&s.slice(0..len), &mut d.slice_mut(0..len))
            }
            (CudaBuffer::Double(s), CudaBuffer::Double(d)) => {
                device.dtod_copy(&s.slice(0..len), &mut d.slice_mut(0..len))
            }
            _ => {
                return Err(ComputeError::device(
                    "Copy buffer",
                    "source and destination precision differ",
                ))
            }
        };
        result.map_err(|e| ComputeError::device("Copy buffer", e))
    }

    fn download(&mut self, src: &CudaBuffer, offset: usize, out: &mut [f64]) -> ComputeResult<()> {
        let end = offset + out.len();
        if end > src.len() {
            return Err(ComputeError::device(
                "Read buffer",
                format!("range {}..{} exceeds buffer size {}", offset, end, src.len()),
            ));
        }
        let device = self.device()?;
        match src {
            CudaBuffer::Single(s) => {
                let mut staging = vec![0.0_f32; out.len()];
                device
                    .dtoh_sync_copy_into(&s.slice(offset..end), &mut staging)
                    .map_err(|e| ComputeError::device("Read buffer", e))?;
                for (o, x) in out.iter_mut().zip(staging) {
                    *o = x as f64;
                }
            }
            CudaBuffer::Double(s) => device
                .dtoh_sync_copy_into(&s.slice(offset..end), out)
                .map_err(|e| ComputeError::device("Read buffer", e))?,
        }
        Ok(())
    }

    fn seed_generator(&mut self, seed: u64, precision: Precision) -> ComputeResult<CudaGenerator> {
        let module = Self::variates_module(precision);
        if self.device()?.get_func(module, SEED_ROUTINE).is_none() {
            let source = self.emitter.variates_source(precision);
            self.load(module, &source, &[SEED_ROUTINE, TWIST_ROUTINE, GENERATE_ROUTINE])?;
        }
        let seed_fn = self.function(module, SEED_ROUTINE)?;
        let twist = self.function(module, TWIST_ROUTINE)?;
        let generate = self.function(module, GENERATE_ROUTINE)?;

        let device = self.device()?;
        let mut state = device
            .alloc_zeros::<u32>(MT_N)
            .map_err(|e| ComputeError::device("Allocate generator state", e))?;
        unsafe { seed_fn.launch(single_item(), (seed, &mut state)) }
            .map_err(|e| ComputeError::device("Seed generator", e))?;

        Ok(CudaGenerator {
            state,
            precision,
            twist,
            generate,
        })
    }

    fn generate_batch(
        &mut self,
        generator: &mut CudaGenerator,
        pool: &mut CudaBuffer,
        offset: usize,
    ) -> ComputeResult<()> {
        if offset + MT_N > pool.len() {
            return Err(ComputeError::device(
                "Generate variates",
                format!("batch {}..{} exceeds pool size {}", offset, offset + MT_N, pool.len()),
            ));
        }
        unsafe {
            generator
                .twist
                .clone()
                .launch(single_item(), (&mut generator.state,))
        }
        .map_err(|e| ComputeError::device("Twist generator", e))?;

        let config = LaunchConfig::for_num_elems(MT_N as u32);
        let offset = offset as u64;
        let launched = match (pool, generator.precision) {
            (CudaBuffer::Single(p), Precision::Single) => unsafe {
                generator
                    .generate
                    .clone()
                    .launch(config, (offset, &generator.state, p))
            },
            (CudaBuffer::Double(p), Precision::Double) => unsafe {
                generator
                    .generate
                    .clone()
                    .launch(config, (offset, &generator.state, p))
            },
            _ => {
                return Err(ComputeError::device(
                    "Generate variates",
                    "pool precision does not match generator",
                ))
            }
        };
        launched.map_err(|e| ComputeError::device("Generate variates", e))
    }

    fn launch(&mut self, kernel: &CudaKernel, args: LaunchArgs<'_, CudaBuffer>) -> ComputeResult<()> {
        let context = || format!("Launch kernel '{}'", kernel.name);
        let mut params: Vec<*mut c_void> = Vec::with_capacity(3);
        for buffer in [args.input, args.variates].into_iter().flatten() {
            if !matches_precision(buffer, kernel.precision) {
                return Err(ComputeError::device(context(), "buffer precision does not match kernel"));
            }
            params.push(buffer.device_ptr());
        }
        match args.output {
            Some(buffer) if matches_precision(buffer, kernel.precision) => {
                params.push(buffer.device_ptr())
            }
            Some(_) => {
                return Err(ComputeError::device(context(), "buffer precision does not match kernel"))
            }
            None => return Ok(()),
        }

        let config = launch_config(args.n).map_err(|message| ComputeError::device(context(), message))?;
        unsafe { kernel.function.clone().launch(config, &mut params[..]) }
            .map_err(|e| ComputeError::device(context(), e))
    }

    fn finish(&mut self) -> ComputeResult<()> {
        self.device()?
            .synchronize()
            .map_err(|e| ComputeError::device("Finish queue", e))
    }
}

/// One thread per path; the grid is indexed with 32-bit counts.
fn launch_config(n: usize) -> Result<LaunchConfig, String> {
    u32::try_from(n)
        .map(LaunchConfig::for_num_elems)
        .map_err(|_| format!("{} paths exceed the launch grid limit of {}", n, u32::MAX))
}

fn matches_precision(buffer: &CudaBuffer, precision: Precision) -> bool {
    matches!(
        (buffer, precision),
        (CudaBuffer::Single(_), Precision::Single) | (CudaBuffer::Double(_), Precision::Double)
    )
}

impl std::fmt::Debug for CudaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaBackend")
            .field("name", &self.descriptor.name)
            .field("ordinal", &self.ordinal)
            .field("connected", &self.device.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_config_covers_paths() {
        let config = launch_config(1000).unwrap();
        let threads = config.grid_dim.0 as usize * config.block_dim.0 as usize;
        assert!(threads >= 1000);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_launch_config_rejects_oversized_grid() {
        let n = u32::MAX as usize + 1;
        let message = launch_config(n).unwrap_err();
        assert!(message.contains(&n.to_string()));
    }
}
