//! # pricer_compute: Device-Offload Compute Engine
//!
//! ## Layer 3 (Engine) Role
//!
//! pricer_compute executes Monte Carlo model code on a compute device. The
//! calling model replays its operation sequence once per calculation; the
//! engine records it, synthesises a data-parallel kernel evaluating all `n`
//! paths at once and caches that kernel per calculation slot, so later runs
//! only upload fresh input values.
//!
//! This crate provides:
//! - The lifecycle state machine and kernel cache (`engine`)
//! - Variable id bookkeeping with result-id recycling (`tracker`)
//! - The backend-agnostic instruction list (`ir`) and its CUDA C rendition
//!   (`codegen`)
//! - A growable pool of MT19937 normal deviates shared by all slots
//!   (`variates`, `rng`)
//! - Device backends: a rayon host backend and an optional CUDA backend
//!   (`backend`)
//! - A device registry handing out contexts by name (`framework`)
//! - Configuration from defaults, TOML files and the environment (`config`)
//!
//! ## Usage Example
//!
//! ```rust
//! use pricer_compute::{ComputeConfig, ComputeFramework, OpCode, Settings};
//!
//! let mut framework = ComputeFramework::new(&ComputeConfig::default());
//! let context = framework.context("Host/Rayon/cpu").unwrap();
//!
//! let settings = Settings { use_double_precision: true, ..Settings::default() };
//! let (id, new_calc) = context.initiate_calculation(1000, 0, 0, settings).unwrap();
//! assert!(new_calc);
//!
//! // Geometric Brownian motion over one step.
//! let s0 = context.create_input_variable(100.0).unwrap();
//! let vol = context.create_input_variable(0.2).unwrap();
//! let z = context.create_input_variates(1, 1).unwrap();
//! let shock = context.apply_operation(OpCode::Mult, &[vol, z[0][0]]).unwrap();
//! let growth = context.apply_operation(OpCode::Exp, &[shock]).unwrap();
//! let spot = context.apply_operation(OpCode::Mult, &[s0, growth]).unwrap();
//! context.declare_output_variable(spot).unwrap();
//!
//! let mut outputs = vec![Vec::new()];
//! context.finalize_calculation(&mut outputs).unwrap();
//! assert_eq!(outputs[0].len(), 1000);
//! assert!(outputs[0].iter().all(|&s| s > 0.0));
//!
//! // Same slot and version: the cached kernel is executed again.
//! let (_, new_calc) = context.initiate_calculation(1000, id, 0, settings).unwrap();
//! assert!(!new_calc);
//! ```
//!
//! ## Feature Flags
//!
//! - `cuda`: CUDA backend; kernels are emitted as CUDA C and compiled with
//!   NVRTC through `cudarc`

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod backend;
pub mod codegen;
pub mod config;
pub mod debug;
pub mod engine;
pub mod error;
pub mod framework;
pub mod ir;
pub mod opcode;
pub mod rng;
pub mod settings;
pub mod tracker;
pub mod variates;

pub use backend::{DeviceBackend, DeviceDescriptor, HostBackend, LaunchArgs};
#[cfg(feature = "cuda")]
pub use backend::CudaBackend;
pub use config::{build_config, ComputeConfig, ConfigError, ConfigOverrides, LogLevel, RetryPolicy};
pub use debug::DebugInfo;
pub use engine::{ComputeContext, ComputeState, Engine};
pub use error::{ComputeError, ComputeResult};
pub use framework::ComputeFramework;
pub use ir::VarId;
pub use opcode::OpCode;
pub use settings::{Precision, Settings, DEFAULT_RNG_SEED};
