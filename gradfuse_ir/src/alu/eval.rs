//! Reference interpreter for `AluExp`.
//!
//! Used by the CPU backend to run tuned kernels and by property tests to
//! check that tracker lowering and the simplifier preserve meaning. The
//! per-op numeric semantics here are normative:
//!
//! - `Idiv(x, y)` is `floor(x / y)`
//! - `Mod(x, y)` is `x - Idiv(x, y) * y`
//! - on `bool`, `Add` is OR and `Mul` is AND

use std::collections::HashMap;

use num_complex::Complex32;

use super::{AluArg, AluExp, AluOp};
use crate::dtype::{DType, Scalar};
use crate::error::IrError;
use crate::IrResult;

/// Source of buffer elements for `GlobalView`/`GlobalIndex` reads.
pub trait BufferReader {
    fn read_global(&self, gid: usize, offset: i64, dtype: DType) -> IrResult<Scalar>;
}

/// Reader for expressions that must not touch any buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBuffers;

impl BufferReader for NoBuffers {
    fn read_global(&self, gid: usize, _offset: i64, _dtype: DType) -> IrResult<Scalar> {
        Err(IrError::Eval(format!(
            "expression reads buffer {gid} but no buffers were provided"
        )))
    }
}

impl AluExp {
    /// Evaluate under an assignment of `Special` variables and a buffer
    /// reader.
    pub fn evaluate(
        &self,
        ctx: &HashMap<String, i64>,
        globals: &dyn BufferReader,
    ) -> IrResult<Scalar> {
        match (self.op(), self.arg()) {
            (AluOp::Const, AluArg::Const(s)) => Ok(*s),
            (AluOp::Special, AluArg::Special { name, .. }) => {
                let v = *ctx
                    .get(name)
                    .ok_or_else(|| IrError::Eval(format!("unbound loop variable {name}")))?;
                Ok(Scalar::I32(v as i32))
            }
            (AluOp::GlobalView, AluArg::View { gid, tracker }) => {
                let mut idx = Vec::with_capacity(self.src().len());
                for s in self.src() {
                    let v = s.evaluate(ctx, globals)?.as_i64().ok_or_else(|| {
                        IrError::Eval("non-integer index in GlobalView".into())
                    })?;
                    idx.push(v);
                }
                let (offset, valid) = tracker.offset_and_valid(&idx);
                if valid {
                    globals.read_global(*gid, offset, self.dtype())
                } else {
                    Ok(Scalar::zero(self.dtype()))
                }
            }
            (AluOp::GlobalIndex, AluArg::Global { gid }) => {
                let off = self.src()[0]
                    .evaluate(ctx, globals)?
                    .as_i64()
                    .ok_or_else(|| IrError::Eval("non-integer offset in GlobalIndex".into()))?;
                globals.read_global(*gid, off, self.dtype())
            }
            (AluOp::Where, _) => {
                let c = self.src()[0]
                    .evaluate(ctx, globals)?
                    .as_bool()
                    .ok_or_else(|| IrError::Eval("non-bool Where condition".into()))?;
                if c {
                    self.src()[1].evaluate(ctx, globals)
                } else {
                    self.src()[2].evaluate(ctx, globals)
                }
            }
            (op @ (AluOp::Cmplt | AluOp::Cmpeq | AluOp::Cmpne), _) => {
                let a = self.src()[0].evaluate(ctx, globals)?;
                let b = self.src()[1].evaluate(ctx, globals)?;
                compare_scalar(op, a, b)
            }
            (op @ (AluOp::Add | AluOp::Sub | AluOp::Mul | AluOp::Idiv | AluOp::Mod), _) => {
                let a = self.src()[0].evaluate(ctx, globals)?;
                let b = self.src()[1].evaluate(ctx, globals)?;
                binary_scalar(op, self.dtype(), a, b)
            }
            (op, _) => {
                let a = self.src()[0].evaluate(ctx, globals)?;
                unary_scalar(op, a)
            }
        }
    }
}

fn floor_div_i64(a: i64, b: i64) -> IrResult<i64> {
    if b == 0 {
        return Err(IrError::Eval("integer division by zero".into()));
    }
    let q = a / b;
    let r = a % b;
    Ok(if r != 0 && ((r < 0) != (b < 0)) { q - 1 } else { q })
}

/// Binary arithmetic on scalars. Operands are cast to `dtype` first
/// (lenient mixed-dtype behavior: the result dtype is the first operand's).
pub fn binary_scalar(op: AluOp, dtype: DType, a: Scalar, b: Scalar) -> IrResult<Scalar> {
    let a = a.cast(dtype)?;
    let b = b.cast(dtype)?;
    match (a, b) {
        (Scalar::F32(x), Scalar::F32(y)) => {
            let v = match op {
                AluOp::Add => x + y,
                AluOp::Sub => x - y,
                AluOp::Mul => x * y,
                AluOp::Idiv => (x / y).floor(),
                AluOp::Mod => x - (x / y).floor() * y,
                _ => return Err(IrError::Type(format!("{op:?} is not binary arithmetic"))),
            };
            Ok(Scalar::F32(v))
        }
        (Scalar::I32(x), Scalar::I32(y)) => {
            let (x, y) = (x as i64, y as i64);
            let v = match op {
                AluOp::Add => x + y,
                AluOp::Sub => x - y,
                AluOp::Mul => x * y,
                AluOp::Idiv => floor_div_i64(x, y)?,
                AluOp::Mod => x - floor_div_i64(x, y)? * y,
                _ => return Err(IrError::Type(format!("{op:?} is not binary arithmetic"))),
            };
            Ok(Scalar::I32(v as i32))
        }
        (Scalar::U32(x), Scalar::U32(y)) => {
            let v = match op {
                AluOp::Add => x.wrapping_add(y),
                AluOp::Sub => x.wrapping_sub(y),
                AluOp::Mul => x.wrapping_mul(y),
                AluOp::Idiv => {
                    if y == 0 {
                        return Err(IrError::Eval("integer division by zero".into()));
                    }
                    x / y
                }
                AluOp::Mod => {
                    if y == 0 {
                        return Err(IrError::Eval("integer division by zero".into()));
                    }
                    x % y
                }
                _ => return Err(IrError::Type(format!("{op:?} is not binary arithmetic"))),
            };
            Ok(Scalar::U32(v))
        }
        (Scalar::Bool(x), Scalar::Bool(y)) => {
            let v = match op {
                AluOp::Add => x || y,
                AluOp::Mul => x && y,
                _ => return Err(IrError::Type(format!("{op:?} is not defined on bool"))),
            };
            Ok(Scalar::Bool(v))
        }
        (Scalar::C64(x), Scalar::C64(y)) => {
            let v = match op {
                AluOp::Add => x + y,
                AluOp::Sub => x - y,
                AluOp::Mul => x * y,
                _ => return Err(IrError::Type(format!("{op:?} is not defined on complex64"))),
            };
            Ok(Scalar::C64(v))
        }
        _ => Err(IrError::Type("mismatched scalar dtypes after cast".into())),
    }
}

/// Float-only unary semantics.
pub fn unary_scalar(op: AluOp, a: Scalar) -> IrResult<Scalar> {
    let x = match a {
        Scalar::F32(x) => x,
        _ => {
            return Err(IrError::Type(format!(
                "{op:?} requires float32, got {}",
                a.dtype()
            )))
        }
    };
    let v = match op {
        AluOp::Neg => -x,
        AluOp::Sin => x.sin(),
        AluOp::Cos => x.cos(),
        AluOp::Exp => x.exp(),
        AluOp::Log => x.ln(),
        AluOp::Sqrt => x.sqrt(),
        AluOp::Reciprocal => x.recip(),
        _ => return Err(IrError::Type(format!("{op:?} is not unary"))),
    };
    Ok(Scalar::F32(v))
}

/// Comparison semantics; real operands compare by value, complex operands
/// support only equality.
pub fn compare_scalar(op: AluOp, a: Scalar, b: Scalar) -> IrResult<Scalar> {
    if let (Scalar::C64(x), Scalar::C64(y)) = (a, b) {
        return match op {
            AluOp::Cmpeq => Ok(Scalar::Bool(complex_bits_eq(x, y))),
            AluOp::Cmpne => Ok(Scalar::Bool(!complex_bits_eq(x, y))),
            _ => Err(IrError::Type("complex64 values are unordered".into())),
        };
    }
    let x = a
        .as_f64()
        .ok_or_else(|| IrError::Type("cannot compare complex with real".into()))?;
    let y = b
        .as_f64()
        .ok_or_else(|| IrError::Type("cannot compare complex with real".into()))?;
    let v = match op {
        AluOp::Cmplt => x < y,
        AluOp::Cmpeq => x == y,
        AluOp::Cmpne => x != y,
        _ => return Err(IrError::Type(format!("{op:?} is not a comparison"))),
    };
    Ok(Scalar::Bool(v))
}

fn complex_bits_eq(x: Complex32, y: Complex32) -> bool {
    x.re == y.re && x.im == y.im
}
