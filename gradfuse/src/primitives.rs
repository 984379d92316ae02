//! The closed primitive set and its abstract-eval (shape/dtype) rules.
//!
//! Parameters live inside the enum variants. Each primitive also has a
//! JVP rule (`jvp`), an optional transpose rule (`transpose`) and a JIT
//! rule (`jit`/`fuse`), kept in their transformation's module.

use std::rc::Rc;

use gradfuse_ir::DType;

use crate::aval::ShapedArray;
use crate::error::{CoreError, CoreResult};
use crate::jaxpr::Jaxpr;

/// Comparison operator carried by `Primitive::Compare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn name(self) -> &'static str {
        match self {
            CompareOp::Lt => "lt",
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
        }
    }
}

/// Atomic operation of the tracing runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Primitive {
    Add,
    Mul,
    Neg,
    Sin,
    Cos,
    Exp,
    Log,
    Sqrt,
    Reciprocal,
    /// Sum over `axes` (sorted, unique); the reduced axes disappear.
    ReduceSum { axes: Vec<usize> },
    Compare { op: CompareOp },
    /// `where(cond, x, y)`: `x` where `cond`, else `y`.
    Where,
    /// Axis permutation: output axis `k` is input axis `perm[k]`.
    Transpose { perm: Vec<usize> },
    /// Broadcast to `shape`; `axes` are the inserted output positions.
    /// Existing unit axes stretch to the target dims.
    Broadcast { shape: Vec<usize>, axes: Vec<usize> },
    Reshape { shape: Vec<usize> },
    /// Reverse the listed axes.
    Flip { axes: Vec<usize> },
    /// Uniform `uint32` bits of `shape`, keyed by a `uint32[2]` PRNG key.
    RandomBits { shape: Vec<usize> },
    /// Call of a traced subprogram; the first `num_consts` inputs bind
    /// the program's hoisted constants.
    JitCall {
        jaxpr: Rc<Jaxpr>,
        num_consts: usize,
    },
}

impl Primitive {
    /// Printed name (also the name in the Jaxpr text format).
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Add => "add",
            Primitive::Mul => "mul",
            Primitive::Neg => "neg",
            Primitive::Sin => "sin",
            Primitive::Cos => "cos",
            Primitive::Exp => "exp",
            Primitive::Log => "log",
            Primitive::Sqrt => "sqrt",
            Primitive::Reciprocal => "reciprocal",
            Primitive::ReduceSum { .. } => "reduce_sum",
            Primitive::Compare { .. } => "compare",
            Primitive::Where => "where",
            Primitive::Transpose { .. } => "transpose",
            Primitive::Broadcast { .. } => "broadcast",
            Primitive::Reshape { .. } => "reshape",
            Primitive::Flip { .. } => "flip",
            Primitive::RandomBits { .. } => "random_bits",
            Primitive::JitCall { .. } => "jit_call",
        }
    }

    /// True for the ops whose kernel body is a pointwise expression.
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Primitive::Add
                | Primitive::Mul
                | Primitive::Neg
                | Primitive::Sin
                | Primitive::Cos
                | Primitive::Exp
                | Primitive::Log
                | Primitive::Sqrt
                | Primitive::Reciprocal
                | Primitive::Compare { .. }
                | Primitive::Where
        )
    }

    /// True for the ops that only rearrange data.
    pub fn is_view_op(&self) -> bool {
        matches!(
            self,
            Primitive::Transpose { .. }
                | Primitive::Broadcast { .. }
                | Primitive::Reshape { .. }
                | Primitive::Flip { .. }
        )
    }

    pub fn num_outputs(&self) -> usize {
        match self {
            Primitive::JitCall { jaxpr, .. } => jaxpr.outs.len(),
            _ => 1,
        }
    }

    /// Shape/dtype propagation. Elementwise ops broadcast their operand
    /// shapes (NumPy right-aligned rules) and take the first operand's
    /// dtype; comparisons produce `bool`.
    pub fn abstract_eval(&self, in_avals: &[ShapedArray]) -> CoreResult<Vec<ShapedArray>> {
        match self {
            Primitive::Add | Primitive::Mul => {
                let [a, b] = expect_arity::<2>(self, in_avals)?;
                let shape = broadcast_shapes(&[&a.shape, &b.shape])?;
                Ok(vec![ShapedArray::new(shape, a.dtype)])
            }
            Primitive::Neg
            | Primitive::Sin
            | Primitive::Cos
            | Primitive::Exp
            | Primitive::Log
            | Primitive::Sqrt
            | Primitive::Reciprocal => {
                let [a] = expect_arity::<1>(self, in_avals)?;
                if !a.dtype.is_float() {
                    return Err(CoreError::Type(format!(
                        "{} requires float32, got {}",
                        self.name(),
                        a.dtype
                    )));
                }
                Ok(vec![a.clone()])
            }
            Primitive::ReduceSum { axes } => {
                let [a] = expect_arity::<1>(self, in_avals)?;
                check_axes(axes, a.ndim(), self.name())?;
                let shape: Vec<usize> = a
                    .shape
                    .iter()
                    .enumerate()
                    .filter(|(k, _)| !axes.contains(k))
                    .map(|(_, &d)| d)
                    .collect();
                Ok(vec![ShapedArray::new(shape, a.dtype)])
            }
            Primitive::Compare { .. } => {
                let [a, b] = expect_arity::<2>(self, in_avals)?;
                let shape = broadcast_shapes(&[&a.shape, &b.shape])?;
                Ok(vec![ShapedArray::new(shape, DType::Bool)])
            }
            Primitive::Where => {
                let [c, x, y] = expect_arity::<3>(self, in_avals)?;
                if c.dtype != DType::Bool {
                    return Err(CoreError::Type(format!(
                        "where condition must be bool, got {}",
                        c.dtype
                    )));
                }
                let shape = broadcast_shapes(&[&c.shape, &x.shape, &y.shape])?;
                Ok(vec![ShapedArray::new(shape, x.dtype)])
            }
            Primitive::Transpose { perm } => {
                let [a] = expect_arity::<1>(self, in_avals)?;
                if perm.len() != a.ndim() {
                    return Err(CoreError::Type(format!(
                        "transpose perm {:?} against {}-d input",
                        perm,
                        a.ndim()
                    )));
                }
                let shape: Vec<usize> = perm.iter().map(|&p| a.shape[p]).collect();
                Ok(vec![ShapedArray::new(shape, a.dtype)])
            }
            Primitive::Broadcast { shape, axes } => {
                let [a] = expect_arity::<1>(self, in_avals)?;
                if shape.len() != a.ndim() + axes.len() {
                    return Err(CoreError::Type(format!(
                        "broadcast of {} to {:?} adding {} axes",
                        a,
                        shape,
                        axes.len()
                    )));
                }
                let mut src = a.shape.iter();
                for (k, &d) in shape.iter().enumerate() {
                    if axes.contains(&k) {
                        continue;
                    }
                    let &s = src.next().ok_or_else(|| {
                        CoreError::Internal("broadcast axis bookkeeping".into())
                    })?;
                    if s != d && s != 1 {
                        return Err(CoreError::Type(format!(
                            "cannot broadcast {a} to {shape:?}"
                        )));
                    }
                }
                Ok(vec![ShapedArray::new(shape.clone(), a.dtype)])
            }
            Primitive::Reshape { shape } => {
                let [a] = expect_arity::<1>(self, in_avals)?;
                let new_size: usize = shape.iter().product();
                if new_size != a.size() {
                    return Err(CoreError::Type(format!(
                        "cannot reshape {a} to {shape:?}"
                    )));
                }
                Ok(vec![ShapedArray::new(shape.clone(), a.dtype)])
            }
            Primitive::Flip { axes } => {
                let [a] = expect_arity::<1>(self, in_avals)?;
                check_axes(axes, a.ndim(), self.name())?;
                Ok(vec![a.clone()])
            }
            Primitive::RandomBits { shape } => {
                let [key] = expect_arity::<1>(self, in_avals)?;
                if key.dtype != DType::Uint32 || key.shape != [2] {
                    return Err(CoreError::Type(format!(
                        "random_bits key must be uint32[2], got {key}"
                    )));
                }
                Ok(vec![ShapedArray::new(shape.clone(), DType::Uint32)])
            }
            Primitive::JitCall { jaxpr, .. } => {
                if in_avals.len() != jaxpr.in_binders.len() {
                    return Err(CoreError::Type(format!(
                        "jit_call of a {}-input program with {} arguments",
                        jaxpr.in_binders.len(),
                        in_avals.len()
                    )));
                }
                for (got, binder) in in_avals.iter().zip(&jaxpr.in_binders) {
                    if *got != binder.aval {
                        return Err(CoreError::Type(format!(
                            "jit_call argument {got} does not match binder {}",
                            binder.aval
                        )));
                    }
                }
                Ok(jaxpr.outs.iter().map(|o| o.aval()).collect())
            }
        }
    }
}

/// Fold an elementwise primitive over scalar operands; `None` when the
/// primitive has no scalar semantics (views, reductions, calls).
pub(crate) fn fold_scalars(
    prim: &Primitive,
    operands: &[gradfuse_ir::Scalar],
) -> CoreResult<Option<gradfuse_ir::Scalar>> {
    use gradfuse_ir::{binary_scalar, compare_scalar, unary_scalar, AluOp};
    let folded = match (prim, operands) {
        (Primitive::Add, [a, b]) => binary_scalar(AluOp::Add, a.dtype(), *a, *b)?,
        (Primitive::Mul, [a, b]) => binary_scalar(AluOp::Mul, a.dtype(), *a, *b)?,
        (Primitive::Neg, [a]) => unary_scalar(AluOp::Neg, *a)?,
        (Primitive::Sin, [a]) => unary_scalar(AluOp::Sin, *a)?,
        (Primitive::Cos, [a]) => unary_scalar(AluOp::Cos, *a)?,
        (Primitive::Exp, [a]) => unary_scalar(AluOp::Exp, *a)?,
        (Primitive::Log, [a]) => unary_scalar(AluOp::Log, *a)?,
        (Primitive::Sqrt, [a]) => unary_scalar(AluOp::Sqrt, *a)?,
        (Primitive::Reciprocal, [a]) => unary_scalar(AluOp::Reciprocal, *a)?,
        (Primitive::Compare { op }, [a, b]) => {
            let alu = match op {
                CompareOp::Lt => AluOp::Cmplt,
                CompareOp::Eq => AluOp::Cmpeq,
                CompareOp::Ne => AluOp::Cmpne,
            };
            compare_scalar(alu, *a, *b)?
        }
        (Primitive::Where, [c, x, y]) => {
            if c.as_bool() == Some(true) {
                *x
            } else {
                *y
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(folded))
}

fn expect_arity<'a, const N: usize>(
    prim: &Primitive,
    in_avals: &'a [ShapedArray],
) -> CoreResult<[&'a ShapedArray; N]> {
    if in_avals.len() != N {
        return Err(CoreError::Type(format!(
            "{} expects {} operands, got {}",
            prim.name(),
            N,
            in_avals.len()
        )));
    }
    let mut it = in_avals.iter();
    Ok(std::array::from_fn(|_| {
        it.next().expect("length checked above")
    }))
}

fn check_axes(axes: &[usize], ndim: usize, name: &str) -> CoreResult<()> {
    let mut prev: Option<usize> = None;
    for &a in axes {
        if a >= ndim {
            return Err(CoreError::Type(format!(
                "{name} axis {a} out of range for a {ndim}-d input"
            )));
        }
        if let Some(p) = prev {
            if a <= p {
                return Err(CoreError::Type(format!(
                    "{name} axes {axes:?} must be strictly increasing"
                )));
            }
        }
        prev = Some(a);
    }
    Ok(())
}

/// NumPy broadcasting: align shapes on the right; dims agree when equal
/// or one of them is 1.
pub fn broadcast_shapes(shapes: &[&[usize]]) -> CoreResult<Vec<usize>> {
    let ndim = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut out = vec![1usize; ndim];
    for s in shapes {
        let off = ndim - s.len();
        for (k, &d) in s.iter().enumerate() {
            let cur = out[off + k];
            if cur == d || d == 1 {
                continue;
            }
            if cur == 1 {
                out[off + k] = d;
            } else {
                return Err(CoreError::Type(format!(
                    "cannot broadcast shapes {shapes:?}"
                )));
            }
        }
    }
    Ok(out)
}
