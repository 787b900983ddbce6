//! CUDA C emission for NVRTC.
//!
//! Every kernel is emitted as a standalone translation unit: the tolerant
//! comparison helpers, then one `extern "C" __global__` entry point whose
//! body is guarded by `i < n`.

use std::fmt::{self, Display};

use super::{SourceEmitter, GENERATE_ROUTINE, SEED_ROUTINE, TWIST_ROUTINE};
use crate::ir::{Instruction, KernelProgram, Operand};
use crate::opcode::{OpCode, TOLERANCE_ULPS};
use crate::rng::{A, B, C, D, MT_N, SATURATION, SEED_MULTIPLIER, X_LOW};
use crate::settings::Precision;

/// Emits CUDA C source.
#[derive(Clone, Copy, Debug, Default)]
pub struct CudaEmitter;

impl SourceEmitter for CudaEmitter {
    fn kernel_source(&self, program: &KernelProgram, precision: Precision) -> String {
        KernelSource { program, precision }.to_string()
    }

    fn variates_source(&self, precision: Precision) -> String {
        VariatesSource { precision }.to_string()
    }
}

fn fp_type(precision: Precision) -> &'static str {
    match precision {
        Precision::Single => "float",
        Precision::Double => "double",
    }
}

/// Floating point literal in the working precision.
fn lit(value: f64, precision: Precision) -> String {
    match precision {
        Precision::Single => format!("{:?}f", value),
        Precision::Double => format!("{:?}", value),
    }
}

/// Math function name in the working precision.
fn math(name: &str, precision: Precision) -> String {
    match precision {
        Precision::Single => format!("{}f", name),
        Precision::Double => name.to_string(),
    }
}

fn epsilon(precision: Precision) -> f64 {
    match precision {
        Precision::Single => f32::EPSILON as f64,
        Precision::Double => f64::EPSILON,
    }
}

struct KernelSource<'a> {
    program: &'a KernelProgram,
    precision: Precision,
}

impl KernelSource<'_> {
    fn operand(&self, operand: &Operand) -> String {
        match *operand {
            Operand::Input {
                offset,
                scalar: true,
            } => format!("input[{}UL]", offset),
            Operand::Input {
                offset,
                scalar: false,
            } => format!("input[{}UL + i]", offset),
            Operand::Variate { index } => format!("rn[{}UL + i]", index * self.program.n),
            Operand::Result(id) => format!("v{}", id),
        }
    }

    fn expression(&self, instruction: &Instruction) -> String {
        let p = self.precision;
        let args: Vec<String> = instruction.args.iter().map(|a| self.operand(a)).collect();
        let arg = |k: usize| args.get(k).map(String::as_str).unwrap_or("0");
        match instruction.op {
            OpCode::Add => format!("{} + {}", arg(0), arg(1)),
            OpCode::Subtract => format!("{} - {}", arg(0), arg(1)),
            OpCode::Negative => format!("-{}", arg(0)),
            OpCode::Mult => format!("{} * {}", arg(0), arg(1)),
            OpCode::Div => format!("{} / {}", arg(0), arg(1)),
            OpCode::IndicatorEq => format!("pricer_indicator_eq({}, {})", arg(0), arg(1)),
            OpCode::IndicatorGt => format!("pricer_indicator_gt({}, {})", arg(0), arg(1)),
            OpCode::IndicatorGeq => format!("pricer_indicator_geq({}, {})", arg(0), arg(1)),
            OpCode::Min => format!("{}({}, {})", math("fmin", p), arg(0), arg(1)),
            OpCode::Max => format!("{}({}, {})", math("fmax", p), arg(0), arg(1)),
            OpCode::Abs => format!("{}({})", math("fabs", p), arg(0)),
            OpCode::Exp => format!("{}({})", math("exp", p), arg(0)),
            OpCode::Sqrt => format!("{}({})", math("sqrt", p), arg(0)),
            OpCode::Log => format!("{}({})", math("log", p), arg(0)),
            OpCode::Pow => format!("{}({}, {})", math("pow", p), arg(0), arg(1)),
            // Rejected when the operation is applied.
            OpCode::None
            | OpCode::ConditionalExpectation
            | OpCode::NormalCdf
            | OpCode::NormalPdf => lit(f64::NAN, p),
        }
    }

    fn helpers(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.precision;
        let t = fp_type(p);
        let zero = lit(0.0, p);
        let one = lit(1.0, p);
        writeln!(
            f,
            "__device__ bool pricer_close_enough(const {t} x, const {t} y) {{\n    \
             const {t} tol = {ulps} * {eps};\n    \
             const {t} diff = {fabs}(x - y);\n    \
             if (x == {zero} || y == {zero})\n        \
             return diff < tol * tol;\n    \
             return diff <= tol * {fabs}(x) || diff <= tol * {fabs}(y);\n}}\n",
            ulps = lit(TOLERANCE_ULPS, p),
            eps = lit(epsilon(p), p),
            fabs = math("fabs", p),
        )?;
        writeln!(
            f,
            "__device__ {t} pricer_indicator_eq(const {t} x, const {t} y) {{\n    \
             return pricer_close_enough(x, y) ? {one} : {zero};\n}}\n"
        )?;
        writeln!(
            f,
            "__device__ {t} pricer_indicator_gt(const {t} x, const {t} y) {{\n    \
             return x > y && !pricer_close_enough(x, y) ? {one} : {zero};\n}}\n"
        )?;
        writeln!(
            f,
            "__device__ {t} pricer_indicator_geq(const {t} x, const {t} y) {{\n    \
             return x > y || pricer_close_enough(x, y) ? {one} : {zero};\n}}\n"
        )
    }
}

impl Display for KernelSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let program = self.program;
        let t = fp_type(self.precision);
        if self.precision == Precision::Double {
            writeln!(f, "// double precision kernel\n")?;
        }
        self.helpers(f)?;

        let mut params = Vec::new();
        if program.has_input() {
            params.push(format!("const {}* input", t));
        }
        if program.has_variates() {
            params.push(format!("const {}* rn", t));
        }
        if program.has_output() {
            params.push(format!("{}* output", t));
        }

        writeln!(
            f,
            "extern \"C\" __global__ void {}({}) {{",
            program.name,
            params.join(", ")
        )?;
        writeln!(
            f,
            "    const unsigned long i = (unsigned long)blockIdx.x * blockDim.x + threadIdx.x;"
        )?;
        writeln!(f, "    if (i < {}UL) {{", program.n)?;
        for instruction in &program.instructions {
            if instruction.declare {
                write!(f, "        {} ", t)?;
            } else {
                write!(f, "        ")?;
            }
            writeln!(f, "v{} = {};", instruction.result, self.expression(instruction))?;
        }
        for (k, output) in program.outputs.iter().enumerate() {
            writeln!(
                f,
                "        output[{}UL + i] = {};",
                k * program.n,
                self.operand(output)
            )?;
        }
        writeln!(f, "    }}")?;
        writeln!(f, "}}")
    }
}

struct VariatesSource {
    precision: Precision,
}

impl VariatesSource {
    fn polynomial(coefficients: &[f64], var: &str, monic: bool, precision: Precision) -> String {
        let mut expr = lit(coefficients[0], precision);
        for &c in &coefficients[1..] {
            expr = format!("({} * {} + {})", expr, var, lit(c, precision));
        }
        if monic {
            expr = format!("({} * {} + {})", expr, var, lit(1.0, precision));
        }
        expr
    }
}

impl Display for VariatesSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.precision;
        let t = fp_type(p);
        let max = lit(SATURATION, p);
        let sqrt = math("sqrt", p);
        let log = math("log", p);
        let m = 397;

        writeln!(
            f,
            "__device__ {t} pricer_inverse_cumulative_normal(const unsigned int x0) {{\n    \
             if (x0 == 0xffffffffU) return {max};\n    \
             if (x0 == 0U) return -{max};\n    \
             const {t} x = ({t})x0 / ({t})4294967295.0;\n    \
             if (x >= {one}) return {max};\n    \
             if (x <= {zero}) return -{max};\n    \
             if (x < {x_low}) {{\n        \
             const {t} z = {sqrt}({m2} * {log}(x));\n        \
             return {c} / {d};\n    \
             }}\n    \
             if (x > {x_high}) {{\n        \
             const {t} z = {sqrt}({m2} * {log}({one} - x));\n        \
             return -{c} / {d};\n    \
             }}\n    \
             const {t} z = x - {half};\n    \
             const {t} r = z * z;\n    \
             return {a} * z / {b};\n}}\n",
            one = lit(1.0, p),
            zero = lit(0.0, p),
            half = lit(0.5, p),
            m2 = lit(-2.0, p),
            x_low = lit(X_LOW, p),
            x_high = lit(1.0 - X_LOW, p),
            a = Self::polynomial(&A, "r", false, p),
            b = Self::polynomial(&B, "r", true, p),
            c = Self::polynomial(&C, "z", false, p),
            d = Self::polynomial(&D, "z", true, p),
        )?;

        writeln!(
            f,
            "extern \"C\" __global__ void {SEED_ROUTINE}(const unsigned long long s, unsigned int* mt) {{\n    \
             if (blockIdx.x * blockDim.x + threadIdx.x != 0) return;\n    \
             mt[0] = (unsigned int)(s & 0xffffffffULL);\n    \
             for (unsigned int i = 1; i < {MT_N}U; ++i)\n        \
             mt[i] = {SEED_MULTIPLIER}U * (mt[i - 1] ^ (mt[i - 1] >> 30)) + i;\n}}\n"
        )?;

        writeln!(
            f,
            "extern \"C\" __global__ void {TWIST_ROUTINE}(unsigned int* mt) {{\n    \
             if (blockIdx.x * blockDim.x + threadIdx.x != 0) return;\n    \
             const unsigned int mag01[2] = {{0x0U, 0x9908b0dfU}};\n    \
             unsigned int y;\n    \
             int kk;\n    \
             for (kk = 0; kk < {n} - {m}; ++kk) {{\n        \
             y = (mt[kk] & 0x80000000U) | (mt[kk + 1] & 0x7fffffffU);\n        \
             mt[kk] = mt[kk + {m}] ^ (y >> 1) ^ mag01[y & 0x1U];\n    \
             }}\n    \
             for (; kk < {n} - 1; ++kk) {{\n        \
             y = (mt[kk] & 0x80000000U) | (mt[kk + 1] & 0x7fffffffU);\n        \
             mt[kk] = mt[kk + ({m} - {n})] ^ (y >> 1) ^ mag01[y & 0x1U];\n    \
             }}\n    \
             y = (mt[{n} - 1] & 0x80000000U) | (mt[0] & 0x7fffffffU);\n    \
             mt[{n} - 1] = mt[{m} - 1] ^ (y >> 1) ^ mag01[y & 0x1U];\n}}\n",
            n = MT_N,
        )?;

        writeln!(
            f,
            "extern \"C\" __global__ void {GENERATE_ROUTINE}(const unsigned long long offset, const unsigned int* mt, {t}* output) {{\n    \
             const unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;\n    \
             if (i < {MT_N}U) {{\n        \
             unsigned int y = mt[i];\n        \
             y ^= (y >> 11);\n        \
             y ^= (y << 7) & 0x9d2c5680U;\n        \
             y ^= (y << 15) & 0xefc60000U;\n        \
             y ^= (y >> 18);\n        \
             output[offset + i] = pricer_inverse_cumulative_normal(y);\n    \
             }}\n}}"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> KernelProgram {
        KernelProgram {
            name: KernelProgram::kernel_name(3, 1),
            n: 4,
            input_len: 5,
            n_variates: 2,
            n_registers: 5,
            instructions: vec![
                Instruction {
                    result: 4,
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
                },
                Instruction {
                    result: 4,
                    declare: false,
                    op: OpCode::IndicatorGeq,
                    args: vec![Operand::Result(4), Operand::Variate { index: 1 }],
                },
            ],
            outputs: vec![Operand::Result(4), Operand::Variate { index: 0 }],
        }
    }

    #[test]
    fn test_kernel_signature_and_guard() {
        let source = CudaEmitter.kernel_source(&program(), Precision::Double);
        assert!(source.contains(
            "extern \"C\" __global__ void pricer_kernel_3_1(const double* input, const double* rn, double* output)"
        ));
        assert!(source.contains("if (i < 4UL) {"));
    }

    #[test]
    fn test_kernel_body() {
        let source = CudaEmitter.kernel_source(&program(), Precision::Double);
        assert!(source.contains("        double v4 = input[0UL] + input[1UL + i];"));
        assert!(source.contains("        v4 = pricer_indicator_geq(v4, rn[4UL + i]);"));
        assert!(source.contains("output[0UL + i] = v4;"));
        assert!(source.contains("output[4UL + i] = rn[0UL + i];"));
    }

    #[test]
    fn test_signature_omits_unused_buffers() {
        let mut p = program();
        p.n_variates = 0;
        p.instructions.truncate(1);
        p.outputs.truncate(1);
        let source = CudaEmitter.kernel_source(&p, Precision::Single);
        assert!(source.contains("pricer_kernel_3_1(const float* input, float* output)"));

        p.outputs.clear();
        let source = CudaEmitter.kernel_source(&p, Precision::Single);
        assert!(source.contains("pricer_kernel_3_1(const float* input)"));
    }

    #[test]
    fn test_single_precision_helpers() {
        let source = CudaEmitter.kernel_source(&program(), Precision::Single);
        assert!(source.contains("const float tol = 42.0f * 1.1920928955078125e-7f;"));
        assert!(source.contains("return diff < tol * tol;"));
        assert!(source.contains("fabsf(x - y)"));
        assert!(!source.contains("double"));
    }

    #[test]
    fn test_math_functions_follow_precision() {
        let mut p = program();
        p.instructions[1].op = OpCode::Pow;
        assert!(CudaEmitter
            .kernel_source(&p, Precision::Single)
            .contains("v4 = powf(v4, rn[4UL + i]);"));
        assert!(CudaEmitter
            .kernel_source(&p, Precision::Double)
            .contains("v4 = pow(v4, rn[4UL + i]);"));
    }

    #[test]
    fn test_variates_program_routines() {
        let source = CudaEmitter.variates_source(Precision::Double);
        assert!(source.contains(
            "extern \"C\" __global__ void pricer_seed_initialization(const unsigned long long s, unsigned int* mt)"
        ));
        assert!(source.contains("extern \"C\" __global__ void pricer_twist(unsigned int* mt)"));
        assert!(source.contains(
            "pricer_generate(const unsigned long long offset, const unsigned int* mt, double* output)"
        ));
        assert!(source.contains("1812433253U"));
        assert!(source.contains("if (x0 == 0xffffffffU) return 3.4028234663852886e38;"));
        assert!(source.contains("output[offset + i] = pricer_inverse_cumulative_normal(y);"));
    }

    #[test]
    fn test_variates_single_precision_saturates_at_float_max() {
        let source = CudaEmitter.variates_source(Precision::Single);
        assert!(source.contains(&format!("return {:?}f;", f32::MAX as f64)));
        assert!(source.contains("float* output"));
    }
}
