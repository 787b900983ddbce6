//! # Kernel Source Emission
//!
//! The instruction list in [`crate::ir`] is backend-agnostic; turning it into
//! source text for a device compiler is the only backend-specific step of a
//! kernel build. A [`SourceEmitter`] produces two programs:
//!
//! - the calculation kernel for one [`KernelProgram`], and
//! - the variates program: seed initialisation, twist and generate routines
//!   behind the variates pool.
//!
//! ## Emitters
//!
//! - [`CudaEmitter`]: CUDA C for NVRTC.

pub mod cuda;

pub use cuda::CudaEmitter;

use crate::ir::KernelProgram;
use crate::settings::Precision;

/// Name of the seed initialisation routine (one work item).
pub const SEED_ROUTINE: &str = "pricer_seed_initialization";
/// Name of the twist routine (one work item).
pub const TWIST_ROUTINE: &str = "pricer_twist";
/// Name of the generate routine (one work item per state word).
pub const GENERATE_ROUTINE: &str = "pricer_generate";

/// Backend-specific source text emission.
pub trait SourceEmitter {
    /// Source of the kernel evaluating `program` in `precision`.
    ///
    /// The entry point is named `program.name`.
    fn kernel_source(&self, program: &KernelProgram, precision: Precision) -> String;

    /// Source of the variates program producing deviates in `precision`.
    ///
    /// Entry points are [`SEED_ROUTINE`], [`TWIST_ROUTINE`] and
    /// [`GENERATE_ROUTINE`].
    fn variates_source(&self, precision: Precision) -> String;
}
