//! # Device Backends
//!
//! A backend exposes the primitives one device offers to the engine:
//! connection, kernel build and launch, buffer transfer and the three
//! generator routines behind the variates pool. The lifecycle state machine,
//! kernel caching and pool growth live in [`Engine`](crate::Engine) and are
//! shared by all backends.
//!
//! ## Backends
//!
//! | Backend | Device name | Feature |
//! |---------|-------------|---------|
//! | [`HostBackend`] | `Host/Rayon/cpu` | always |
//! | `CudaBackend` | `CUDA/NVIDIA/<device> (#<ordinal>)` | `cuda` |
//!
//! Device resources are owned by the associated `Kernel`, `Buffer` and
//! `Generator` types and released when those values are dropped.

pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use host::HostBackend;

#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;

use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::{ComputeError, ComputeResult};
use crate::ir::KernelProgram;
use crate::settings::Precision;
use crate::tracker::StagedValues;

/// Leading component of CUDA device names.
pub const CUDA_PREFIX: &str = "CUDA/";

/// Static description of a device, known before connecting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// `backend/platform/device` identifier.
    pub name: String,
    /// Ordered diagnostic key/value pairs.
    pub info: Vec<(String, String)>,
    /// Whether kernels may run in double precision.
    pub supports_double_precision: bool,
}

/// Buffers bound to one kernel launch.
///
/// Only the buffers the kernel signature includes are present.
pub struct LaunchArgs<'a, B> {
    /// Number of paths.
    pub n: usize,
    /// Input buffer.
    pub input: Option<&'a B>,
    /// Variates pool.
    pub variates: Option<&'a B>,
    /// Output buffer, output-major.
    pub output: Option<&'a mut B>,
}

/// Primitives of one compute device.
pub trait DeviceBackend: Send {
    /// Compiled kernel.
    type Kernel: Send;
    /// Device buffer of values in one precision.
    type Buffer: Send;
    /// Device-resident generator state.
    type Generator: Send;

    /// Device description.
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Acquires the device and creates its execution queue.
    ///
    /// Retryable failures are reported as [`ComputeError::Transient`].
    fn connect(&mut self) -> ComputeResult<()>;

    /// Diagnostic entries appended to the device info after connecting.
    ///
    /// Failed checks are reported as the entry value.
    fn health_checks(&mut self) -> Vec<(String, String)>;

    /// Builds a kernel for `program` evaluated in `precision`.
    fn build_kernel(
        &mut self,
        program: &KernelProgram,
        precision: Precision,
    ) -> ComputeResult<Self::Kernel>;

    /// Copies staged host values into a new device buffer.
    fn upload(&mut self, values: &StagedValues) -> ComputeResult<Self::Buffer>;

    /// Allocates a zeroed device buffer of `len` values.
    fn allocate(&mut self, len: usize, precision: Precision) -> ComputeResult<Self::Buffer>;

    /// Copies the first `len` values of `src` into `dst`.
    fn copy_prefix(
        &mut self,
        src: &Self::Buffer,
        dst: &mut Self::Buffer,
        len: usize,
    ) -> ComputeResult<()>;

    /// Reads `out.len()` values starting at `offset`, widened to `f64`.
    fn download(&mut self, src: &Self::Buffer, offset: usize, out: &mut [f64])
        -> ComputeResult<()>;

    /// Creates generator state seeded from `seed`, producing deviates in
    /// `precision`.
    fn seed_generator(&mut self, seed: u64, precision: Precision)
        -> ComputeResult<Self::Generator>;

    /// Twists the generator once and writes one batch of
    /// [`MT_N`](crate::rng::MT_N) normal deviates to `pool` at `offset`.
    fn generate_batch(
        &mut self,
        generator: &mut Self::Generator,
        pool: &mut Self::Buffer,
        offset: usize,
    ) -> ComputeResult<()>;

    /// Enqueues `kernel` over paths `[0, n)`.
    fn launch(&mut self, kernel: &Self::Kernel, args: LaunchArgs<'_, Self::Buffer>)
        -> ComputeResult<()>;

    /// Blocks until all enqueued work has completed.
    fn finish(&mut self) -> ComputeResult<()>;
}

/// Connects `backend`, retrying transient failures under `policy`.
///
/// Non-transient failures are returned immediately; exhausting the attempts
/// yields [`ComputeError::ConnectionFailed`].
pub fn connect_with_retry<B: DeviceBackend>(
    backend: &mut B,
    policy: &RetryPolicy,
) -> ComputeResult<()> {
    let attempts = policy.attempts.max(1);
    let mut last = String::new();

    for attempt in 1..=attempts {
        match backend.connect() {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() => {
                warn!(
                    device = %backend.descriptor().name,
                    attempt,
                    attempts,
                    error = %err,
                    "Device connection failed, retrying"
                );
                last = err.to_string();
                if attempt < attempts {
                    std::thread::sleep(policy.delay);
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(ComputeError::ConnectionFailed { attempts, last })
}

/// `(host_sizeof(<type>), <bytes>)` entries for the host side of the health
/// checks.
pub(crate) fn host_sizeof_entries() -> Vec<(String, String)> {
    [
        ("uint", std::mem::size_of::<u32>()),
        ("ulong", std::mem::size_of::<u64>()),
        ("float", std::mem::size_of::<f32>()),
        ("double", std::mem::size_of::<f64>()),
    ]
    .into_iter()
    .map(|(ty, size)| (format!("host_sizeof({})", ty), size.to_string()))
    .collect()
}
