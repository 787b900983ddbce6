//! Variable & buffer tracker for the calculation being recorded.
//!
//! Ids are issued sequentially: inputs first, then variates, then results.
//! Freed result ids are recycled last-in-first-out, and only ever for new
//! results, so the ids of inputs and variates stay stable across
//! re-executions of a cached kernel.

use crate::error::{ComputeError, ComputeResult};
use crate::ir::{InputKind, InputLayout, Instruction, Operand, VarId};
use crate::opcode::OpCode;
use crate::settings::Precision;

/// Input values staged in the working precision of the calculation.
#[derive(Clone, Debug, PartialEq)]
pub enum StagedValues {
    /// Narrowed to `f32`, clamped into its finite range.
    Single(Vec<f32>),
    /// Kept as `f64`.
    Double(Vec<f64>),
}

impl StagedValues {
    /// Creates an empty buffer in `precision`.
    pub fn new(precision: Precision) -> Self {
        match precision {
            Precision::Single => StagedValues::Single(Vec::new()),
            Precision::Double => StagedValues::Double(Vec::new()),
        }
    }

    /// Precision of the staged values.
    pub fn precision(&self) -> Precision {
        match self {
            StagedValues::Single(_) => Precision::Single,
            StagedValues::Double(_) => Precision::Double,
        }
    }

    /// Number of staged values.
    pub fn len(&self) -> usize {
        match self {
            StagedValues::Single(v) => v.len(),
            StagedValues::Double(v) => v.len(),
        }
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stages one value.
    pub fn push(&mut self, value: f64) {
        match self {
            StagedValues::Single(v) => v.push(narrow(value)),
            StagedValues::Double(v) => v.push(value),
        }
    }

    /// Stages a slice of values.
    pub fn extend(&mut self, values: &[f64]) {
        match self {
            StagedValues::Single(v) => v.extend(values.iter().map(|&x| narrow(x))),
            StagedValues::Double(v) => v.extend_from_slice(values),
        }
    }
}

/// Converts to `f32`, clamping finite overflow to `±f32::MAX`.
///
/// NaN is passed through.
#[inline]
pub fn narrow(value: f64) -> f32 {
    value.clamp(-(f32::MAX as f64), f32::MAX as f64) as f32
}

/// Id bookkeeping and recorded instructions for one calculation build.
#[derive(Clone, Debug)]
pub struct VariableTracker {
    n: usize,
    next_id: VarId,
    layout: InputLayout,
    values: StagedValues,
    n_variates: usize,
    freed: Vec<VarId>,
    outputs: Vec<VarId>,
    output_operands: Vec<Operand>,
    instructions: Vec<Instruction>,
}

impl VariableTracker {
    /// Creates an empty tracker for `n` paths.
    pub fn new(n: usize, precision: Precision) -> Self {
        Self {
            n,
            next_id: 0,
            layout: InputLayout::new(),
            values: StagedValues::new(precision),
            n_variates: 0,
            freed: Vec::new(),
            outputs: Vec::new(),
            output_operands: Vec::new(),
            instructions: Vec::new(),
        }
    }

    /// Number of paths.
    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    /// Next id that has never been issued.
    #[inline]
    pub fn next_id(&self) -> VarId {
        self.next_id
    }

    /// Layout of the inputs created so far.
    #[inline]
    pub fn layout(&self) -> &InputLayout {
        &self.layout
    }

    /// Staged input values.
    #[inline]
    pub fn values(&self) -> &StagedValues {
        &self.values
    }

    /// Number of variates reserved.
    #[inline]
    pub fn n_variates(&self) -> usize {
        self.n_variates
    }

    /// Ids currently available for recycling, most recent last.
    #[inline]
    pub fn freed(&self) -> &[VarId] {
        &self.freed
    }

    /// Declared outputs in declaration order.
    #[inline]
    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    /// Recorded instructions.
    #[inline]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    #[inline]
    fn n_inputs(&self) -> usize {
        self.layout.len()
    }

    /// Creates a scalar input broadcast to all paths.
    pub fn create_scalar(&mut self, value: f64) -> VarId {
        self.push_input(InputKind::Scalar);
        self.values.push(value);
        self.next_id - 1
    }

    /// Creates an array input holding one value per path.
    pub fn create_array(&mut self, values: &[f64]) -> ComputeResult<VarId> {
        if values.len() != self.n {
            return Err(ComputeError::InputLengthMismatch {
                expected: self.n,
                got: values.len(),
            });
        }
        self.push_input(InputKind::Array);
        self.values.extend(values);
        Ok(self.next_id - 1)
    }

    fn push_input(&mut self, kind: InputKind) {
        debug_assert_eq!(self.next_id, self.n_inputs());
        self.layout.push(kind, self.n);
        self.next_id += 1;
    }

    /// Reserves a `dim × steps` grid of variate ids, indexed `[step][dim]`.
    pub fn create_variates(&mut self, dim: usize, steps: usize) -> Vec<Vec<VarId>> {
        let mut grid = Vec::with_capacity(steps);
        for _ in 0..steps {
            let row: Vec<VarId> = (self.next_id..self.next_id + dim).collect();
            self.next_id += dim;
            self.n_variates += dim;
            grid.push(row);
        }
        grid
    }

    /// Typed operand for a defined id.
    pub fn operand(&self, id: VarId) -> ComputeResult<Operand> {
        let n_inputs = self.n_inputs();
        if id < n_inputs {
            return Ok(Operand::Input {
                offset: self.layout.offset(id, self.n),
                scalar: self.layout.kind(id) == Some(InputKind::Scalar),
            });
        }
        if id < n_inputs + self.n_variates {
            return Ok(Operand::Variate {
                index: id - n_inputs,
            });
        }
        if id < self.next_id && !self.freed.contains(&id) {
            return Ok(Operand::Result(id));
        }
        Err(ComputeError::UndefinedVariable { id })
    }

    /// Records `op(args)` and returns the id of its result.
    pub fn apply(&mut self, op: OpCode, args: &[VarId]) -> ComputeResult<VarId> {
        op.validate(args.len())?;
        let operands = args
            .iter()
            .map(|&id| self.operand(id))
            .collect::<ComputeResult<Vec<_>>>()?;

        let (result, declare) = match self.freed.pop() {
            Some(id) => (id, false),
            None => {
                let id = self.next_id;
                self.next_id += 1;
                (id, true)
            }
        };
        self.instructions.push(Instruction {
            result,
            declare,
            op,
            args: operands,
        });
        Ok(result)
    }

    /// Makes a result id available for recycling.
    ///
    /// Input and variate ids are never freed. Freeing an id that is not a
    /// live result is a no-op.
    pub fn free(&mut self, id: VarId) {
        if id < self.n_inputs() + self.n_variates || id >= self.next_id {
            return;
        }
        if !self.freed.contains(&id) {
            self.freed.push(id);
        }
    }

    /// Appends `id` to the output list.
    ///
    /// The operand is resolved now; freeing the id afterwards does not
    /// undeclare it, and the output reads the register's final value.
    pub fn declare_output(&mut self, id: VarId) -> ComputeResult<()> {
        let operand = self.operand(id)?;
        self.outputs.push(id);
        self.output_operands.push(operand);
        Ok(())
    }

    /// Operands of the declared outputs, in declaration order.
    #[inline]
    pub fn output_operands(&self) -> &[Operand] {
        &self.output_operands
    }

    /// Drops all recorded state and starts a new build for `n` paths.
    pub fn reset(&mut self, n: usize, precision: Precision) {
        *self = Self::new(n, precision);
    }
}
