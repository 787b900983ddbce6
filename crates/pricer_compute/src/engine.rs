//! # Compute Engine
//!
//! [`Engine`] binds one [`DeviceBackend`] and drives the calculation
//! lifecycle on it:
//!
//! ```text
//! Idle → CreatingInputs ⇄ CreatingVariates → Calculating → Idle
//! ```
//!
//! A calculation is identified by a 1-based slot id. The first run of a slot
//! (or of a new `version` of it) records inputs, variates and operations and
//! builds a kernel at finalisation; later runs with the same id and version
//! only recreate the inputs with fresh values and execute the cached kernel.
//!
//! ## Operation Validity
//!
//! | Operation | States | Kernel cached |
//! |-----------|--------|---------------|
//! | `create_input_variable` / `create_input_array` | `CreatingInputs` | allowed |
//! | `create_input_variates` | `CreatingInputs`, `CreatingVariates` | rejected |
//! | `apply_operation` | `CreatingInputs`, `CreatingVariates`, `Calculating` | rejected |
//! | `free_variable` | `Calculating` | rejected |
//! | `declare_output_variable` | any but `Idle` | rejected |
//! | `finalize_calculation` | any but `Idle` | allowed |
//!
//! ## Usage Example
//!
//! ```rust
//! use pricer_compute::{ComputeContext, Engine, HostBackend, OpCode, RetryPolicy, Settings};
//!
//! let mut engine = Engine::new(HostBackend::new(2, true), RetryPolicy::no_retry());
//! let (id, new_calc) = engine
//!     .initiate_calculation(4, 0, 0, Settings::default())
//!     .unwrap();
//! assert!(new_calc);
//!
//! let a = engine.create_input_variable(2.0).unwrap();
//! let b = engine.create_input_array(&[1.0, 2.0, 3.0, 4.0]).unwrap();
//! let sum = engine.apply_operation(OpCode::Add, &[a, b]).unwrap();
//! engine.declare_output_variable(sum).unwrap();
//!
//! let mut outputs = vec![Vec::new()];
//! engine.finalize_calculation(&mut outputs).unwrap();
//! assert_eq!(outputs[0], vec![3.0, 4.0, 5.0, 6.0]);
//! # let _ = id;
//! ```

use std::fmt;

use tracing::{debug, error, info, trace};

use crate::backend::{connect_with_retry, DeviceBackend, LaunchArgs};
use crate::config::RetryPolicy;
use crate::debug::{DebugInfo, Stopwatch};
use crate::error::{ComputeError, ComputeResult};
use crate::ir::{InputLayout, KernelProgram, VarId};
use crate::opcode::OpCode;
use crate::settings::{Precision, Settings};
use crate::tracker::VariableTracker;
use crate::variates::VariatesPool;

/// Lifecycle state of an engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ComputeState {
    /// No calculation in progress.
    #[default]
    Idle,
    /// Inputs may be created.
    CreatingInputs,
    /// Variates are being reserved.
    CreatingVariates,
    /// Operations are being recorded.
    Calculating,
}

impl fmt::Display for ComputeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComputeState::Idle => "Idle",
            ComputeState::CreatingInputs => "CreatingInputs",
            ComputeState::CreatingVariates => "CreatingVariates",
            ComputeState::Calculating => "Calculating",
        })
    }
}

/// Capability set of a compute device, as seen by calling model code.
///
/// Implemented by [`Engine`] for every backend; the
/// [`ComputeFramework`](crate::ComputeFramework) hands out trait objects so
/// callers do not depend on the backend type.
pub trait ComputeContext: Send {
    /// `backend/platform/device` identifier.
    fn device_name(&self) -> &str;

    /// Connects to the device. Idempotent.
    fn init(&mut self) -> ComputeResult<()>;

    /// Opens a calculation on slot `id` (0 creates a new slot).
    ///
    /// Returns the slot id and `true` if the calculation must be recorded
    /// from scratch, `false` if a cached kernel will be re-executed.
    fn initiate_calculation(
        &mut self,
        n: usize,
        id: usize,
        version: usize,
        settings: Settings,
    ) -> ComputeResult<(usize, bool)>;

    /// Disposes slot `id` and releases its kernel.
    fn dispose_calculation(&mut self, id: usize) -> ComputeResult<()>;

    /// Creates a scalar input, broadcast to all paths.
    fn create_input_variable(&mut self, value: f64) -> ComputeResult<VarId>;

    /// Creates an array input with one value per path.
    fn create_input_array(&mut self, values: &[f64]) -> ComputeResult<VarId>;

    /// Reserves `dim × steps` pooled variates, returned as `[step][dim]`.
    fn create_input_variates(&mut self, dim: usize, steps: usize)
        -> ComputeResult<Vec<Vec<VarId>>>;

    /// Records `op(args)` and returns the result id.
    fn apply_operation(&mut self, op: OpCode, args: &[VarId]) -> ComputeResult<VarId>;

    /// Records the operation with numeric code `code`.
    fn apply_operation_code(&mut self, code: usize, args: &[VarId]) -> ComputeResult<VarId> {
        let op = OpCode::try_from(code)?;
        self.apply_operation(op, args)
    }

    /// Marks a result id as reusable.
    fn free_variable(&mut self, id: VarId) -> ComputeResult<()>;

    /// Appends `id` to the outputs.
    fn declare_output_variable(&mut self, id: VarId) -> ComputeResult<()>;

    /// Builds (if needed) and runs the kernel, writing one vector of `n`
    /// values per declared output.
    fn finalize_calculation(&mut self, outputs: &mut [Vec<f64>]) -> ComputeResult<()>;

    /// Diagnostic key/value pairs.
    fn device_info(&self) -> &[(String, String)];

    /// Whether double precision calculations are possible.
    fn supports_double_precision(&self) -> bool;

    /// Accumulated telemetry.
    fn debug_info(&self) -> &DebugInfo;

    /// Current lifecycle state.
    fn state(&self) -> ComputeState;
}

/// Compiled kernel and the structure it was built for.
struct CachedKernel<K> {
    kernel: K,
    precision: Precision,
    layout: InputLayout,
    input_len: usize,
    n_variates: usize,
    n_outputs: usize,
}

struct CalculationSlot<K> {
    n: usize,
    version: usize,
    disposed: bool,
    kernel: Option<CachedKernel<K>>,
}

/// Compute engine bound to one device.
pub struct Engine<B: DeviceBackend> {
    backend: B,
    retry: RetryPolicy,
    initialised: bool,
    healthy: bool,
    device_info: Vec<(String, String)>,
    debug_info: DebugInfo,
    slots: Vec<CalculationSlot<B::Kernel>>,
    pool: VariatesPool<B>,
    state: ComputeState,
    current: Option<usize>,
    settings: Settings,
    tracker: VariableTracker,
}

const ALL_ACTIVE: &[ComputeState] = &[
    ComputeState::CreatingInputs,
    ComputeState::CreatingVariates,
    ComputeState::Calculating,
];

impl<B: DeviceBackend> Engine<B> {
    /// Creates an engine for `backend`; nothing is connected until first
    /// use.
    pub fn new(backend: B, retry: RetryPolicy) -> Self {
        let device_info = backend.descriptor().info.clone();
        Self {
            backend,
            retry,
            initialised: false,
            healthy: true,
            device_info,
            debug_info: DebugInfo::default(),
            slots: Vec::new(),
            pool: VariatesPool::new(),
            state: ComputeState::Idle,
            current: None,
            settings: Settings::default(),
            tracker: VariableTracker::new(0, Precision::Single),
        }
    }

    /// Underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether the engine has not failed to connect.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Number of deviates in the variates pool.
    pub fn variates_pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Copies the whole variates pool to the host.
    pub fn read_variates(&mut self) -> ComputeResult<Vec<f64>> {
        let mut out = vec![0.0; self.pool.size()];
        if let Some(buffer) = self.pool.buffer() {
            self.backend.download(buffer, 0, &mut out)?;
            self.backend.finish()?;
        }
        Ok(out)
    }

    /// Clears the accumulated telemetry.
    pub fn reset_debug_info(&mut self) {
        self.debug_info.reset();
    }

    fn require_state(&self, operation: &'static str, allowed: &[ComputeState]) -> ComputeResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ComputeError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn current_id(&self, operation: &'static str) -> ComputeResult<usize> {
        self.current
            .ok_or(ComputeError::NoActiveCalculation { operation })
    }

    /// Rejects structural changes to a slot whose kernel is cached.
    fn require_no_kernel(&self, operation: &'static str) -> ComputeResult<()> {
        let id = self.current_id(operation)?;
        let slot = &self.slots[id - 1];
        if slot.kernel.is_some() {
            return Err(ComputeError::KernelAlreadyBuilt {
                operation,
                id,
                version: slot.version,
            });
        }
        Ok(())
    }

    fn slot_mut(&mut self, id: usize) -> ComputeResult<&mut CalculationSlot<B::Kernel>> {
        let max = self.slots.len();
        if id == 0 || id > max {
            return Err(ComputeError::InvalidCalculationId { id, max });
        }
        let slot = &mut self.slots[id - 1];
        if slot.disposed {
            return Err(ComputeError::CalculationDisposed(id));
        }
        Ok(slot)
    }

    fn run_calculation(&mut self, outputs: &mut [Vec<f64>]) -> ComputeResult<()> {
        let id = self.current_id("finalize_calculation")?;
        let settings = self.settings;
        let precision = settings.precision();
        let n = self.tracker.n();

        let Self {
            backend,
            slots,
            pool,
            tracker,
            debug_info,
            ..
        } = self;
        let slot = &mut slots[id - 1];

        let expected = match &slot.kernel {
            Some(cached) => cached.n_outputs,
            None => tracker.outputs().len(),
        };
        if outputs.len() != expected {
            return Err(ComputeError::OutputCountMismatch {
                expected,
                got: outputs.len(),
            });
        }
        if precision == Precision::Double && !backend.descriptor().supports_double_precision {
            return Err(ComputeError::DoublePrecisionUnsupported {
                device: backend.descriptor().name.clone(),
            });
        }

        let mut watch = Stopwatch::start(settings.debug);

        match &slot.kernel {
            Some(cached) => {
                if &cached.layout != tracker.layout() {
                    return Err(ComputeError::InputLayoutMismatch {
                        expected: cached.layout.to_string(),
                        got: tracker.layout().to_string(),
                    });
                }
                trace!(calculation = id, version = slot.version, "Reusing cached kernel");
            }
            None => {
                let program = KernelProgram {
                    name: KernelProgram::kernel_name(id, slot.version),
                    n,
                    input_len: tracker.layout().buffer_len(n),
                    n_variates: tracker.n_variates(),
                    n_registers: tracker.next_id(),
                    instructions: tracker.instructions().to_vec(),
                    outputs: tracker.output_operands().to_vec(),
                };
                trace!(kernel = %program.name, "Kernel program:\n{}", program);

                let kernel = backend.build_kernel(&program, precision)?;
                info!(
                    kernel = %program.name,
                    instructions = program.instructions.len(),
                    outputs = program.outputs.len(),
                    %precision,
                    "Kernel built"
                );
                slot.kernel = Some(CachedKernel {
                    kernel,
                    precision,
                    layout: tracker.layout().clone(),
                    input_len: program.input_len,
                    n_variates: program.n_variates,
                    n_outputs: program.outputs.len(),
                });
                debug_info.nanoseconds_program_build += watch.lap();
            }
        }
        watch.lap();

        let cached = slot
            .kernel
            .as_ref()
            .ok_or_else(|| ComputeError::device("Finalize calculation", "no kernel available"))?;

        let input = if cached.input_len > 0 {
            Some(backend.upload(tracker.values())?)
        } else {
            None
        };
        let output_len = cached.n_outputs * n;
        let mut output = if output_len > 0 {
            Some(backend.allocate(output_len, precision)?)
        } else {
            None
        };
        let variates = if cached.n_variates > 0 {
            if pool.size() < cached.n_variates * n {
                return Err(ComputeError::device(
                    "Finalize calculation",
                    format!(
                        "variates pool holds {} values, kernel requires {}",
                        pool.size(),
                        cached.n_variates * n
                    ),
                ));
            }
            pool.buffer()
        } else {
            None
        };
        backend.finish()?;
        debug_info.nanoseconds_data_copy += watch.lap();

        backend.launch(
            &cached.kernel,
            LaunchArgs {
                n,
                input: input.as_ref(),
                variates,
                output: output.as_mut(),
            },
        )?;
        backend.finish()?;
        debug_info.nanoseconds_calculation += watch.lap();

        if let Some(buffer) = output.as_ref() {
            for (k, out) in outputs.iter_mut().enumerate() {
                out.clear();
                out.resize(n, 0.0);
                backend.download(buffer, k * n, out)?;
            }
            backend.finish()?;
        }
        debug_info.nanoseconds_data_copy += watch.lap();

        Ok(())
    }
}

impl<B: DeviceBackend> ComputeContext for Engine<B> {
    fn device_name(&self) -> &str {
        &self.backend.descriptor().name
    }

    fn init(&mut self) -> ComputeResult<()> {
        if self.initialised {
            return Ok(());
        }
        if !self.healthy {
            return Err(ComputeError::Unhealthy(self.device_name().to_string()));
        }

        if let Err(err) = connect_with_retry(&mut self.backend, &self.retry) {
            self.healthy = false;
            error!(device = %self.device_name(), error = %err, "Compute engine initialisation failed");
            return Err(err);
        }

        let checks = self.backend.health_checks();
        self.device_info.extend(checks);
        self.initialised = true;
        info!(device = %self.device_name(), "Compute engine initialised");
        Ok(())
    }

    fn initiate_calculation(
        &mut self,
        n: usize,
        id: usize,
        version: usize,
        settings: Settings,
    ) -> ComputeResult<(usize, bool)> {
        self.init()?;
        if n == 0 {
            return Err(ComputeError::ZeroPaths);
        }
        if self.state != ComputeState::Idle {
            debug!(state = %self.state, "Abandoning calculation in progress");
        }

        let precision = settings.precision();
        let (id, new_calc) = if id == 0 {
            self.slots.push(CalculationSlot {
                n,
                version,
                disposed: false,
                kernel: None,
            });
            let id = self.slots.len();
            debug!(calculation = id, n, version, "Calculation slot created");
            (id, true)
        } else {
            let slot = self.slot_mut(id)?;
            if slot.n != n {
                return Err(ComputeError::PathCountMismatch {
                    id,
                    expected: slot.n,
                    got: n,
                });
            }
            let reusable = slot.version == version
                && slot
                    .kernel
                    .as_ref()
                    .is_some_and(|cached| cached.precision == precision);
            if reusable {
                debug!(calculation = id, version, "Cached kernel found");
            } else {
                if slot.kernel.take().is_some() {
                    debug!(calculation = id, old = slot.version, new = version, "Cached kernel released");
                }
                slot.version = version;
            }
            (id, !reusable)
        };

        self.tracker.reset(n, precision);
        self.settings = settings;
        self.current = Some(id);
        self.state = ComputeState::CreatingInputs;
        Ok((id, new_calc))
    }

    fn dispose_calculation(&mut self, id: usize) -> ComputeResult<()> {
        let slot = self.slot_mut(id)?;
        slot.disposed = true;
        slot.kernel = None;
        if self.current == Some(id) {
            self.current = None;
            self.state = ComputeState::Idle;
        }
        debug!(calculation = id, "Calculation disposed");
        Ok(())
    }

    fn create_input_variable(&mut self, value: f64) -> ComputeResult<VarId> {
        self.require_state("create_input_variable", &[ComputeState::CreatingInputs])?;
        Ok(self.tracker.create_scalar(value))
    }

    fn create_input_array(&mut self, values: &[f64]) -> ComputeResult<VarId> {
        self.require_state("create_input_array", &[ComputeState::CreatingInputs])?;
        self.tracker.create_array(values)
    }

    fn create_input_variates(
        &mut self,
        dim: usize,
        steps: usize,
    ) -> ComputeResult<Vec<Vec<VarId>>> {
        const OPERATION: &str = "create_input_variates";
        self.require_state(
            OPERATION,
            &[ComputeState::CreatingInputs, ComputeState::CreatingVariates],
        )?;
        self.require_no_kernel(OPERATION)?;
        self.pool.check_precision(&self.settings)?;

        let grid = self.tracker.create_variates(dim, steps);
        self.state = ComputeState::CreatingVariates;

        let required = self.tracker.n_variates() * self.tracker.n();
        if required > 0 {
            self.pool.ensure(&mut self.backend, required, &self.settings)?;
        }
        Ok(grid)
    }

    fn apply_operation(&mut self, op: OpCode, args: &[VarId]) -> ComputeResult<VarId> {
        const OPERATION: &str = "apply_operation";
        self.require_state(OPERATION, ALL_ACTIVE)?;
        self.require_no_kernel(OPERATION)?;

        let id = self.tracker.apply(op, args)?;
        self.state = ComputeState::Calculating;
        if self.settings.debug {
            self.debug_info.number_of_operations += self.tracker.n() as u64;
        }
        Ok(id)
    }

    fn free_variable(&mut self, id: VarId) -> ComputeResult<()> {
        const OPERATION: &str = "free_variable";
        self.require_state(OPERATION, &[ComputeState::Calculating])?;
        self.require_no_kernel(OPERATION)?;
        self.tracker.free(id);
        Ok(())
    }

    fn declare_output_variable(&mut self, id: VarId) -> ComputeResult<()> {
        const OPERATION: &str = "declare_output_variable";
        self.require_state(OPERATION, ALL_ACTIVE)?;
        self.require_no_kernel(OPERATION)?;
        self.tracker.declare_output(id)
    }

    fn finalize_calculation(&mut self, outputs: &mut [Vec<f64>]) -> ComputeResult<()> {
        if self.state == ComputeState::Idle {
            return Err(ComputeError::NoActiveCalculation {
                operation: "finalize_calculation",
            });
        }
        let result = self.run_calculation(outputs);
        self.state = ComputeState::Idle;
        self.current = None;
        result
    }

    fn device_info(&self) -> &[(String, String)] {
        &self.device_info
    }

    fn supports_double_precision(&self) -> bool {
        self.backend.descriptor().supports_double_precision
    }

    fn debug_info(&self) -> &DebugInfo {
        &self.debug_info
    }

    fn state(&self) -> ComputeState {
        self.state
    }
}

impl<B: DeviceBackend> fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("device", &self.backend.descriptor().name)
            .field("initialised", &self.initialised)
            .field("healthy", &self.healthy)
            .field("state", &self.state)
            .field("slots", &self.slots.len())
            .field("pool", &self.pool)
            .finish()
    }
}

impl<B: DeviceBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        if self.initialised {
            debug!(
                device = %self.backend.descriptor().name,
                slots = self.slots.len(),
                variates = self.pool.size(),
                "Releasing compute engine"
            );
        }
    }
}
