//! Error types for the compute engine.
//!
//! Every failure is reported through [`ComputeError`]. Variants fall into
//! four categories:
//!
//! - **Protocol violations**: a call made in the wrong lifecycle state, an
//!   id or size mismatch, or a structural mutation of a calculation whose
//!   kernel is already compiled.
//! - **Unsupported features**: an opcode outside the supported set, or
//!   double precision requested on a device without it.
//! - **Device failures**: allocation, program build, kernel creation or
//!   launch failures reported by the backend.
//! - **Connection failures**: transient errors while acquiring a device,
//!   which are the only category retried automatically.

use thiserror::Error;

use crate::engine::ComputeState;

/// Errors raised by the compute engine and its backends.
///
/// # Examples
///
/// ```rust
/// use pricer_compute::ComputeError;
///
/// let err = ComputeError::ZeroPaths;
/// assert_eq!(err.to_string(), "Invalid path count: n must not be zero");
/// assert!(!err.is_transient());
/// ```
#[derive(Debug, Clone, Error)]
pub enum ComputeError {
    // -------------------------------------------------------------------------
    // Protocol violations
    // -------------------------------------------------------------------------
    /// An operation was called outside the lifecycle states that permit it.
    #[error("{operation}(): not allowed in state {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the engine was in
        state: ComputeState,
    },

    /// An operation requires an active calculation but none is in progress.
    #[error("{operation}(): no calculation is in progress")]
    NoActiveCalculation {
        /// Operation that was attempted
        operation: &'static str,
    },

    /// A calculation id outside the range of created slots.
    #[error("Invalid calculation id {id}: expected 1..={max}")]
    InvalidCalculationId {
        /// Requested id
        id: usize,
        /// Largest id created so far
        max: usize,
    },

    /// The path count differs from the one recorded for the slot.
    #[error("Path count {got} for calculation id {id} does not match recorded path count {expected}")]
    PathCountMismatch {
        /// Calculation id
        id: usize,
        /// Path count recorded when the slot was created
        expected: usize,
        /// Path count passed by the caller
        got: usize,
    },

    /// The calculation id was disposed and can not be used any more.
    #[error("Calculation id {0} was already disposed, it can not be used any more")]
    CalculationDisposed(usize),

    /// A structural mutation was attempted on a slot with a compiled kernel.
    #[error("{operation}(): calculation id {id} in version {version} has a kernel already")]
    KernelAlreadyBuilt {
        /// Operation that was attempted
        operation: &'static str,
        /// Calculation id
        id: usize,
        /// Version of the compiled kernel
        version: usize,
    },

    /// The number of output buffers does not match the declared outputs.
    #[error("Output size ({got}) inconsistent with kernel output size ({expected})")]
    OutputCountMismatch {
        /// Declared output variables
        expected: usize,
        /// Output buffers supplied by the caller
        got: usize,
    },

    /// The input layout differs from the one the cached kernel was built for.
    #[error("Input buffer layout ({got}) inconsistent with kernel input buffer layout ({expected})")]
    InputLayoutMismatch {
        /// Layout recorded at build time
        expected: String,
        /// Layout of the current call
        got: String,
    },

    /// An input array does not hold one value per path.
    #[error("Input array length {got} does not match path count {expected}")]
    InputLengthMismatch {
        /// Path count of the calculation
        expected: usize,
        /// Length of the supplied array
        got: usize,
    },

    /// An operand or output references an id that is not defined.
    #[error("Variable id {id} is not defined in the current calculation")]
    UndefinedVariable {
        /// Offending variable id
        id: usize,
    },

    /// The number of operands does not match the opcode's arity.
    #[error("Op code {label} expects {expected} argument(s), got {got}")]
    ArityMismatch {
        /// Opcode label
        label: &'static str,
        /// Operand count required by the opcode
        expected: usize,
        /// Operand count supplied
        got: usize,
    },

    /// A calculation was initiated with `n == 0`.
    #[error("Invalid path count: n must not be zero")]
    ZeroPaths,

    /// The shared variates pool was generated in a different precision.
    #[error("Variates pool was generated in {pool} precision, calculation requests {requested} precision")]
    VariatesPrecisionMismatch {
        /// Precision of the existing pool
        pool: &'static str,
        /// Precision requested by the calculation
        requested: &'static str,
    },

    // -------------------------------------------------------------------------
    // Unsupported features
    // -------------------------------------------------------------------------
    /// The opcode is part of the enumeration but has no kernel implementation.
    #[error("No implementation for op code {code} ({label}) provided")]
    UnsupportedOpCode {
        /// Numeric opcode
        code: usize,
        /// Opcode label
        label: &'static str,
    },

    /// The numeric opcode is outside the enumeration.
    #[error("Unknown op code {0}")]
    UnknownOpCode(usize),

    /// Double precision was requested on a device that does not support it.
    #[error(
        "Double precision is configured for this calculation, but not supported by device '{device}'. \
         Switch to single precision or use an appropriate device"
    )]
    DoublePrecisionUnsupported {
        /// Device name
        device: String,
    },

    /// The backend is not compiled into this build.
    #[error("Backend '{0}' is not available. Rebuild with the corresponding feature enabled")]
    BackendUnavailable(&'static str),

    // -------------------------------------------------------------------------
    // Device failures
    // -------------------------------------------------------------------------
    /// A device call failed.
    #[error("{context}: {message}")]
    Device {
        /// What was being done
        context: String,
        /// Decoded device error text
        message: String,
    },

    /// Program build failed; carries the compiler diagnostic log.
    #[error("Error during program build for kernel '{kernel}': {message}: {log}")]
    Build {
        /// Kernel name
        kernel: String,
        /// Decoded device error text
        message: String,
        /// Compiler log excerpt
        log: String,
    },

    // -------------------------------------------------------------------------
    // Lookup and connection
    // -------------------------------------------------------------------------
    /// The requested device name is not registered.
    #[error("Device '{name}' not found. Available devices: {}", .available.join(","))]
    UnknownDevice {
        /// Requested name
        name: String,
        /// Registered names
        available: Vec<String>,
    },

    /// A retryable failure while acquiring the device.
    #[error("Transient device failure: {0}")]
    Transient(String),

    /// Connection acquisition gave up after the configured attempts.
    #[error("Error acquiring device connection after {attempts} attempt(s): {last}")]
    ConnectionFailed {
        /// Attempts made
        attempts: usize,
        /// Last error text
        last: String,
    },

    /// The engine failed earlier and refuses to initialise again.
    #[error("Engine for device '{0}' is not healthy, check log for previous errors")]
    Unhealthy(String),
}

impl ComputeError {
    /// Returns `true` for failures that connection acquisition may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ComputeError::Transient(_))
    }

    /// Shorthand for a [`ComputeError::Device`] error.
    pub fn device(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ComputeError::Device {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

/// Longest compiler log excerpt kept in a [`ComputeError::Build`].
pub const BUILD_LOG_LIMIT: usize = 1024;

impl ComputeError {
    /// Shorthand for a [`ComputeError::Build`] error, truncating `log` to
    /// [`BUILD_LOG_LIMIT`] bytes.
    pub fn build(kernel: impl Into<String>, message: impl Into<String>, log: &str) -> Self {
        let mut end = log.len().min(BUILD_LOG_LIMIT);
        while !log.is_char_boundary(end) {
            end -= 1;
        }
        ComputeError::Build {
            kernel: kernel.into(),
            message: message.into(),
            log: log[..end].to_string(),
        }
    }
}

/// Result type for compute engine operations.
pub type ComputeResult<T> = Result<T, ComputeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_device_lists_available() {
        let err = ComputeError::UnknownDevice {
            name: "Host/Rayon/gpu".to_string(),
            available: vec!["Host/Rayon/cpu".to_string(), "CUDA/NVIDIA/0".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Host/Rayon/gpu"));
        assert!(msg.contains("Host/Rayon/cpu,CUDA/NVIDIA/0"));
    }

    #[test]
    fn test_invalid_state_names_operation() {
        let err = ComputeError::InvalidState {
            operation: "free_variable",
            state: ComputeState::CreatingInputs,
        };
        assert_eq!(
            err.to_string(),
            "free_variable(): not allowed in state CreatingInputs"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(ComputeError::Transient("busy".to_string()).is_transient());
        assert!(!ComputeError::ConnectionFailed {
            attempts: 3,
            last: "busy".to_string()
        }
        .is_transient());
        assert!(!ComputeError::device("alloc", "out of memory").is_transient());
    }

    #[test]
    fn test_build_error_carries_log() {
        let err = ComputeError::Build {
            kernel: "pricer_kernel_1_0".to_string(),
            message: "NVRTC_ERROR_COMPILATION".to_string(),
            log: "error: identifier \"foo\" is undefined".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pricer_kernel_1_0"));
        assert!(msg.contains("identifier \"foo\""));
    }

    #[test]
    fn test_build_log_truncated_on_char_boundary() {
        let log = "é".repeat(BUILD_LOG_LIMIT);
        match ComputeError::build("k", "failed", &log) {
            ComputeError::Build { log, .. } => {
                assert_eq!(log.len(), BUILD_LOG_LIMIT);
                assert!(log.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
