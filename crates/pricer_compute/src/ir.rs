//! Backend-agnostic kernel representation.
//!
//! Applied operations are recorded as a single-assignment instruction list
//! over typed operands. A [`KernelProgram`] bundles that list with the buffer
//! dimensions and the declared outputs; backends either interpret it (host)
//! or hand it to a [`SourceEmitter`](crate::codegen::SourceEmitter) and
//! compile the resulting source (device).
//!
//! # Buffer Addressing
//!
//! For path `i` of `n`:
//!
//! | Operand | Element |
//! |---------|---------|
//! | `Input { offset, scalar: true }` | `input[offset]` |
//! | `Input { offset, scalar: false }` | `input[offset + i]` |
//! | `Variate { index }` | `rn[index * n + i]` |
//! | `Result(id)` | register `v<id>` |
//!
//! Output `k` is written to `output[k * n + i]`.

use std::fmt;

use crate::opcode::OpCode;

/// Variable id within a calculation.
pub type VarId = usize;

/// Typed reference to a value available to an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Element of the input buffer.
    Input {
        /// Offset of the variable in the input buffer.
        offset: usize,
        /// Scalars are broadcast; arrays hold one value per path.
        scalar: bool,
    },
    /// Pooled normal variate.
    Variate {
        /// Position of the variate among the calculation's variates.
        index: usize,
    },
    /// Register holding an intermediate result.
    Result(VarId),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Input {
                offset,
                scalar: true,
            } => write!(f, "input[{}]", offset),
            Operand::Input {
                offset,
                scalar: false,
            } => write!(f, "input[{} + i]", offset),
            Operand::Variate { index } => write!(f, "rn[{} * n + i]", index),
            Operand::Result(id) => write!(f, "v{}", id),
        }
    }
}

/// One single-assignment step: `result = op(args...)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    /// Register written by the instruction.
    pub result: VarId,
    /// `false` when the register is a recycled id declared by an earlier
    /// instruction.
    pub declare: bool,
    /// Operation applied.
    pub op: OpCode,
    /// Operands in order.
    pub args: Vec<Operand>,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{} = {}(", self.result, self.op.label())?;
        for (k, arg) in self.args.iter().enumerate() {
            if k > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(")")
    }
}

/// Kind of an input variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputKind {
    /// One value broadcast to all paths.
    Scalar,
    /// One value per path.
    Array,
}

/// Ordered list of input kinds; determines the input buffer layout.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct InputLayout {
    kinds: Vec<InputKind>,
}

impl InputLayout {
    /// Creates an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an input and returns its buffer offset.
    pub fn push(&mut self, kind: InputKind, n: usize) -> usize {
        let offset = self.buffer_len(n);
        self.kinds.push(kind);
        offset
    }

    /// Number of input variables.
    #[inline]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether there are no inputs.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Kind of input `index`.
    #[inline]
    pub fn kind(&self, index: usize) -> Option<InputKind> {
        self.kinds.get(index).copied()
    }

    /// Buffer offset of input `index`.
    pub fn offset(&self, index: usize, n: usize) -> usize {
        self.kinds[..index]
            .iter()
            .map(|k| match k {
                InputKind::Scalar => 1,
                InputKind::Array => n,
            })
            .sum()
    }

    /// Number of values in the input buffer.
    pub fn buffer_len(&self, n: usize) -> usize {
        self.offset(self.kinds.len(), n)
    }
}

impl fmt::Display for InputLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (k, kind) in self.kinds.iter().enumerate() {
            if k > 0 {
                f.write_str(",")?;
            }
            f.write_str(match kind {
                InputKind::Scalar => "scalar",
                InputKind::Array => "array",
            })?;
        }
        f.write_str("]")
    }
}

/// Everything a backend needs to build one kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelProgram {
    /// Kernel entry point name, unique per calculation id and version.
    pub name: String,
    /// Number of paths.
    pub n: usize,
    /// Number of values in the input buffer.
    pub input_len: usize,
    /// Number of variates referenced through the pool.
    pub n_variates: usize,
    /// Number of registers (highest variable id + 1).
    pub n_registers: usize,
    /// Instruction sequence.
    pub instructions: Vec<Instruction>,
    /// Source of each declared output, in declaration order.
    pub outputs: Vec<Operand>,
}

impl KernelProgram {
    /// Kernel name for calculation `id` in `version`.
    pub fn kernel_name(id: usize, version: usize) -> String {
        format!("pricer_kernel_{}_{}", id, version)
    }

    /// Whether the kernel takes an input buffer.
    #[inline]
    pub fn has_input(&self) -> bool {
        self.input_len > 0
    }

    /// Whether the kernel takes the variates pool.
    #[inline]
    pub fn has_variates(&self) -> bool {
        self.n_variates > 0
    }

    /// Number of values in the output buffer.
    #[inline]
    pub fn output_len(&self) -> usize {
        self.outputs.len() * self.n
    }

    /// Whether the kernel takes an output buffer.
    #[inline]
    pub fn has_output(&self) -> bool {
        self.output_len() > 0
    }
}

impl fmt::Display for KernelProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} (n = {}, input = {}, variates = {})",
            self.name, self.n, self.input_len, self.n_variates
        )?;
        for instruction in &self.instructions {
            writeln!(f, "  {}", instruction)?;
        }
        for (k, output) in self.outputs.iter().enumerate() {
            writeln!(f, "  output[{} * n + i] = {}", k, output)?;
        }
        Ok(())
    }
}
