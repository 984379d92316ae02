//! User-level array operations.
//!
//! Thin wrappers that normalize operands (explicit broadcasts when the
//! shapes differ, scalars passed through untouched) and dispatch the core
//! primitive through the active trace.

use gradfuse_ir::{DType, Scalar};

use crate::aval::ShapedArray;
use crate::error::{CoreError, CoreResult};
use crate::primitives::{broadcast_shapes, CompareOp, Primitive};
use crate::trace::bind1;
use crate::value::Value;

/// Broadcast `x` to `shape`, inserting leading axes as needed. No-op
/// when the shapes already agree.
pub fn broadcast_to(x: &Value, shape: &[usize]) -> CoreResult<Value> {
    let from = x.shape();
    if from == shape {
        return Ok(x.clone());
    }
    if shape.len() < from.len() {
        return Err(CoreError::Type(format!(
            "cannot broadcast {:?} down to {:?}",
            from, shape
        )));
    }
    let axes: Vec<usize> = (0..shape.len() - from.len()).collect();
    bind1(
        Primitive::Broadcast {
            shape: shape.to_vec(),
            axes,
        },
        &[x.clone()],
    )
}

/// Broadcast non-scalar operands to a common shape; scalars participate
/// in kernels directly.
fn aligned(operands: &[&Value]) -> CoreResult<Vec<Value>> {
    let shapes: Vec<Vec<usize>> = operands.iter().map(|v| v.shape()).collect();
    let non_scalar: Vec<&[usize]> = shapes
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.as_slice())
        .collect();
    if non_scalar.is_empty() {
        return Ok(operands.iter().map(|&v| v.clone()).collect());
    }
    let common = broadcast_shapes(&non_scalar)?;
    operands
        .iter()
        .map(|&v| {
            if v.shape().is_empty() {
                Ok(v.clone())
            } else {
                broadcast_to(v, &common)
            }
        })
        .collect()
}

pub fn add(x: &Value, y: &Value) -> CoreResult<Value> {
    let ops = aligned(&[x, y])?;
    bind1(Primitive::Add, &ops)
}

pub fn mul(x: &Value, y: &Value) -> CoreResult<Value> {
    let ops = aligned(&[x, y])?;
    bind1(Primitive::Mul, &ops)
}

pub fn neg(x: &Value) -> CoreResult<Value> {
    bind1(Primitive::Neg, &[x.clone()])
}

/// `x - y`, composed as `x + (-y)` (or a `-1` product for non-floats).
pub fn sub(x: &Value, y: &Value) -> CoreResult<Value> {
    let minus_y = if y.dtype().is_float() {
        neg(y)?
    } else {
        mul(y, &Value::Lit(Scalar::I32(-1)))?
    };
    add(x, &minus_y)
}

/// `x / y`, composed as `x * reciprocal(y)`.
pub fn div(x: &Value, y: &Value) -> CoreResult<Value> {
    mul(x, &reciprocal(y)?)
}

pub fn sin(x: &Value) -> CoreResult<Value> {
    bind1(Primitive::Sin, &[x.clone()])
}

pub fn cos(x: &Value) -> CoreResult<Value> {
    bind1(Primitive::Cos, &[x.clone()])
}

pub fn exp(x: &Value) -> CoreResult<Value> {
    bind1(Primitive::Exp, &[x.clone()])
}

pub fn log(x: &Value) -> CoreResult<Value> {
    bind1(Primitive::Log, &[x.clone()])
}

pub fn sqrt(x: &Value) -> CoreResult<Value> {
    bind1(Primitive::Sqrt, &[x.clone()])
}

pub fn reciprocal(x: &Value) -> CoreResult<Value> {
    bind1(Primitive::Reciprocal, &[x.clone()])
}

/// Sum over `axes`; axes must be strictly increasing.
pub fn reduce_sum(x: &Value, axes: &[usize]) -> CoreResult<Value> {
    if axes.is_empty() {
        return Ok(x.clone());
    }
    if axes.windows(2).any(|w| w[1] <= w[0]) {
        return Err(CoreError::Type(format!(
            "reduce_sum axes {axes:?} must be strictly increasing"
        )));
    }
    bind1(
        Primitive::ReduceSum {
            axes: axes.to_vec(),
        },
        &[x.clone()],
    )
}

/// Sum every axis down to a scalar.
pub fn sum_all(x: &Value) -> CoreResult<Value> {
    let ndim = x.shape().len();
    reduce_sum(x, &(0..ndim).collect::<Vec<_>>())
}

pub fn cmp_lt(x: &Value, y: &Value) -> CoreResult<Value> {
    let ops = aligned(&[x, y])?;
    bind1(Primitive::Compare { op: CompareOp::Lt }, &ops)
}

pub fn cmp_eq(x: &Value, y: &Value) -> CoreResult<Value> {
    let ops = aligned(&[x, y])?;
    bind1(Primitive::Compare { op: CompareOp::Eq }, &ops)
}

pub fn cmp_ne(x: &Value, y: &Value) -> CoreResult<Value> {
    let ops = aligned(&[x, y])?;
    bind1(Primitive::Compare { op: CompareOp::Ne }, &ops)
}

/// Select `x` where `cond`, else `y`.
pub fn where_(cond: &Value, x: &Value, y: &Value) -> CoreResult<Value> {
    let ops = aligned(&[cond, x, y])?;
    bind1(Primitive::Where, &ops)
}

pub fn transpose(x: &Value, perm: &[usize]) -> CoreResult<Value> {
    bind1(
        Primitive::Transpose {
            perm: perm.to_vec(),
        },
        &[x.clone()],
    )
}

pub fn reshape(x: &Value, shape: &[usize]) -> CoreResult<Value> {
    bind1(
        Primitive::Reshape {
            shape: shape.to_vec(),
        },
        &[x.clone()],
    )
}

pub fn flip(x: &Value, axes: &[usize]) -> CoreResult<Value> {
    bind1(
        Primitive::Flip {
            axes: axes.to_vec(),
        },
        &[x.clone()],
    )
}

/// Move axis `src` to position `dst`.
pub fn moveaxis(x: &Value, src: usize, dst: usize) -> CoreResult<Value> {
    let n = x.shape().len();
    if src >= n || dst >= n {
        return Err(CoreError::Type(format!(
            "moveaxis({src}, {dst}) on a {n}-d value"
        )));
    }
    let mut perm: Vec<usize> = (0..n).filter(|&k| k != src).collect();
    perm.insert(dst, src);
    transpose(x, &perm)
}

/// A zero of the given abstract value: a literal for scalars, a
/// broadcast zero otherwise.
pub fn zeros_aval(aval: &ShapedArray) -> CoreResult<Value> {
    let zero = Value::Lit(Scalar::zero(aval.dtype));
    if aval.is_scalar() {
        Ok(zero)
    } else {
        broadcast_to(&zero, &aval.shape)
    }
}

/// Zeros with the shape and dtype of `x`.
pub fn zeros_like(x: &Value) -> CoreResult<Value> {
    zeros_aval(&x.aval())
}

/// Ones with the shape and dtype of `x`.
pub fn ones_like(x: &Value) -> CoreResult<Value> {
    let aval = x.aval();
    let one = Value::Lit(Scalar::one(aval.dtype));
    if aval.is_scalar() {
        Ok(one)
    } else {
        broadcast_to(&one, &aval.shape)
    }
}

/// Scalar literal of a dtype, for building constants in traced code.
pub fn constant(dtype: DType, v: f64) -> CoreResult<Value> {
    let s = match dtype {
        DType::Float32 => Scalar::F32(v as f32),
        DType::Int32 => Scalar::I32(v as i32),
        DType::Uint32 => Scalar::U32(v as u32),
        DType::Bool => Scalar::Bool(v != 0.0),
        DType::Complex64 => {
            return Err(CoreError::Type(
                "use Scalar::C64 for complex constants".into(),
            ))
        }
    };
    Ok(Value::Lit(s))
}
