//! Fused kernel expression construction.
//!
//! Shared by the eval trace (one primitive at a time, over the arrays'
//! actual trackers) and the JIT compiler (whole programs, over abstract
//! buffers). An in-flight expression is written against per-axis logical
//! index variables `idx0, idx1, ...` of its producing operation's output
//! shape; consuming it under a different shape is an index substitution,
//! and materializing it substitutes the flat `gidx` (and `ridx`) loop
//! variables.

use std::collections::HashMap;
use std::rc::Rc;

use gradfuse_backend::Backend;
use gradfuse_ir::{
    tune_null, AluExp, AluOp, DType, Kernel, ReduceOp, Reduction, Scalar, ShapeTracker,
    unravel_alu, GIDX, RIDX,
};

use crate::array::Array;
use crate::error::{CoreError, CoreResult};
use crate::primitives::{broadcast_shapes, CompareOp, Primitive};

/// One operand of a kernel under construction.
#[derive(Debug, Clone)]
pub(crate) enum Source {
    /// A scalar constant, foldable into the expression.
    Const(Scalar),
    /// An external buffer (id is the caller's buffer numbering) seen
    /// through a tracker.
    Buffer {
        id: usize,
        tracker: ShapeTracker,
        dtype: DType,
    },
    /// A previously fused expression.
    Fused(Fused),
}

impl Source {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Source::Const(_) => vec![],
            Source::Buffer { tracker, .. } => tracker.shape().to_vec(),
            Source::Fused(f) => f.shape.clone(),
        }
    }
}

/// An expression over `idx{k}` logical index variables of `shape`,
/// reading the external buffers listed in `args` (gid k reads
/// `args[k]`).
#[derive(Debug, Clone)]
pub(crate) struct Fused {
    pub exp: AluExp,
    pub args: Vec<usize>,
    pub shape: Vec<usize>,
}

fn idx_name(k: usize) -> String {
    format!("idx{k}")
}

fn idx_special(k: usize, dim: usize) -> AluExp {
    AluExp::special(idx_name(k), dim)
}

fn idx_specials(shape: &[usize]) -> Vec<AluExp> {
    shape
        .iter()
        .enumerate()
        .map(|(k, &d)| idx_special(k, d))
        .collect()
}

/// Lift any source into `Fused` form.
pub(crate) fn to_fused(source: &Source) -> CoreResult<Fused> {
    match source {
        Source::Const(s) => Ok(Fused {
            exp: AluExp::constant(*s),
            args: vec![],
            shape: vec![],
        }),
        Source::Buffer { id, tracker, dtype } => {
            let shape = tracker.shape().to_vec();
            let exp =
                AluExp::global_view(0, tracker.clone(), idx_specials(&shape), *dtype)?;
            Ok(Fused {
                exp,
                args: vec![*id],
                shape,
            })
        }
        Source::Fused(f) => Ok(f.clone()),
    }
}

/// Renumber a fused expression's buffers into a shared argument list and
/// remap its logical indices to a broadcast-compatible `out_shape`
/// (right-aligned; unit axes read index 0).
fn align(fused: &Fused, out_shape: &[usize], args: &mut Vec<usize>) -> CoreResult<AluExp> {
    let mut gid_map: HashMap<usize, usize> = HashMap::new();
    for (gid, &buf) in fused.args.iter().enumerate() {
        let slot = match args.iter().position(|&b| b == buf) {
            Some(pos) => pos,
            None => {
                args.push(buf);
                args.len() - 1
            }
        };
        gid_map.insert(gid, slot);
    }
    let exp = fused.exp.reindex_gids(&gid_map)?;

    if fused.shape == out_shape {
        return Ok(exp);
    }
    let offset = out_shape.len() - fused.shape.len();
    let mut env: HashMap<String, AluExp> = HashMap::new();
    for (k, &d) in fused.shape.iter().enumerate() {
        let out_d = out_shape[k + offset];
        let replacement = if d == 1 && out_d != 1 {
            AluExp::index(0)
        } else if d != out_d {
            return Err(CoreError::Internal(format!(
                "fused operand of shape {:?} under output shape {:?}",
                fused.shape, out_shape
            )));
        } else {
            idx_special(k + offset, out_d)
        };
        env.insert(idx_name(k), replacement);
    }
    Ok(exp.substitute(&env)?)
}

/// Build the pointwise expression of an elementwise primitive over
/// broadcast operands.
pub(crate) fn elementwise(prim: &Primitive, sources: &[Source]) -> CoreResult<Fused> {
    let shapes: Vec<Vec<usize>> = sources.iter().map(Source::shape).collect();
    let shape_refs: Vec<&[usize]> = shapes.iter().map(|s| s.as_slice()).collect();
    let out_shape = broadcast_shapes(&shape_refs)?;

    let mut args: Vec<usize> = Vec::new();
    let mut exprs = Vec::with_capacity(sources.len());
    for source in sources {
        let fused = to_fused(source)?;
        exprs.push(align(&fused, &out_shape, &mut args)?);
    }

    let exp = match (prim, exprs.as_slice()) {
        (Primitive::Add, [a, b]) => AluExp::add(a.clone(), b.clone())?,
        (Primitive::Mul, [a, b]) => AluExp::mul(a.clone(), b.clone())?,
        (Primitive::Neg, [a]) => AluExp::neg(a.clone())?,
        (Primitive::Sin, [a]) => AluExp::unary(AluOp::Sin, a.clone())?,
        (Primitive::Cos, [a]) => AluExp::unary(AluOp::Cos, a.clone())?,
        (Primitive::Exp, [a]) => AluExp::unary(AluOp::Exp, a.clone())?,
        (Primitive::Log, [a]) => AluExp::unary(AluOp::Log, a.clone())?,
        (Primitive::Sqrt, [a]) => AluExp::unary(AluOp::Sqrt, a.clone())?,
        (Primitive::Reciprocal, [a]) => AluExp::unary(AluOp::Reciprocal, a.clone())?,
        (Primitive::Compare { op }, [a, b]) => {
            let alu = match op {
                CompareOp::Lt => AluOp::Cmplt,
                CompareOp::Eq => AluOp::Cmpeq,
                CompareOp::Ne => AluOp::Cmpne,
            };
            AluExp::compare(alu, a.clone(), b.clone())?
        }
        (Primitive::Where, [c, x, y]) => AluExp::where_(c.clone(), x.clone(), y.clone())?,
        _ => {
            return Err(CoreError::Internal(format!(
                "{} is not an elementwise kernel op",
                prim.name()
            )))
        }
    };
    Ok(Fused {
        exp,
        args,
        shape: out_shape,
    })
}

/// Build the body of a sum reduction: kept axes become output indices,
/// reduced axes unravel the `ridx` loop variable.
pub(crate) fn reduce_sum(source: &Source, axes: &[usize]) -> CoreResult<(Fused, Reduction)> {
    let fused = to_fused(source)?;
    let in_shape = fused.shape.clone();
    if let Some(&bad) = axes.iter().find(|&&a| a >= in_shape.len()) {
        return Err(CoreError::Type(format!(
            "reduce_sum axis {bad} out of range for shape {in_shape:?}"
        )));
    }
    let out_shape: Vec<usize> = in_shape
        .iter()
        .enumerate()
        .filter(|(k, _)| !axes.contains(k))
        .map(|(_, &d)| d)
        .collect();
    let reduce_size: usize = axes.iter().map(|&a| in_shape[a]).product();

    let ridx = AluExp::special(RIDX, reduce_size);
    let mut env: HashMap<String, AluExp> = HashMap::new();
    let mut out_pos = 0usize;
    let mut trailing = reduce_size;
    // walk reduced axes in order, peeling their strides off ridx
    let mut reduced_exprs: HashMap<usize, AluExp> = HashMap::new();
    for &a in axes {
        let d = in_shape[a];
        trailing /= d.max(1);
        let q = AluExp::idiv(ridx.clone(), AluExp::index(trailing.max(1) as i64))?;
        reduced_exprs.insert(a, AluExp::modulo(q, AluExp::index(d as i64))?);
    }
    for (k, &d) in in_shape.iter().enumerate() {
        if let Some(e) = reduced_exprs.remove(&k) {
            env.insert(idx_name(k), e);
        } else {
            env.insert(idx_name(k), idx_special(out_pos, d));
            out_pos += 1;
        }
    }
    let exp = fused.exp.substitute(&env)?;
    let reduction = Reduction {
        dtype: exp.dtype(),
        op: ReduceOp::Add,
        size: reduce_size,
    };
    Ok((
        Fused {
            exp,
            args: fused.args,
            shape: out_shape,
        },
        reduction,
    ))
}

/// Apply a view primitive to a source without materializing anything:
/// buffers rewrite their tracker, fused expressions substitute indices.
pub(crate) fn view(prim: &Primitive, source: &Source) -> CoreResult<Source> {
    if let Source::Buffer { id, tracker, dtype } = source {
        let tracker = match prim {
            Primitive::Transpose { perm } => tracker.permute(perm)?,
            Primitive::Reshape { shape } => tracker.reshape(shape)?,
            Primitive::Broadcast { shape, axes } => tracker.broadcast(shape, axes)?,
            Primitive::Flip { axes } => {
                let flags = flip_flags(tracker.ndim(), axes);
                tracker.flip(&flags)?
            }
            _ => {
                return Err(CoreError::Internal(format!(
                    "{} is not a view op",
                    prim.name()
                )))
            }
        };
        return Ok(Source::Buffer {
            id: *id,
            tracker,
            dtype: *dtype,
        });
    }

    let fused = to_fused(source)?;
    let in_shape = fused.shape.clone();
    let (out_shape, env): (Vec<usize>, HashMap<String, AluExp>) = match prim {
        Primitive::Transpose { perm } => {
            let out_shape: Vec<usize> = perm.iter().map(|&p| in_shape[p]).collect();
            let mut env = HashMap::new();
            for (k, &p) in perm.iter().enumerate() {
                env.insert(idx_name(p), idx_special(k, out_shape[k]));
            }
            (out_shape, env)
        }
        Primitive::Reshape { shape } => {
            let out_shape = shape.clone();
            // flat index over the new shape, unravelled over the old
            let mut flat = AluExp::index(0);
            let strides = contiguous_strides_usize(&out_shape);
            for (k, &d) in out_shape.iter().enumerate() {
                let term =
                    AluExp::mul(idx_special(k, d), AluExp::index(strides[k] as i64))?;
                flat = AluExp::add(flat, term)?;
            }
            let unravelled = unravel_alu(&in_shape, flat)?;
            let mut env = HashMap::new();
            for (j, e) in unravelled.into_iter().enumerate() {
                env.insert(idx_name(j), e);
            }
            (out_shape, env)
        }
        Primitive::Broadcast { shape, axes } => {
            let out_shape = shape.clone();
            let mut env = HashMap::new();
            let mut src_axis = 0usize;
            for (k, &d) in out_shape.iter().enumerate() {
                if axes.contains(&k) {
                    continue;
                }
                let in_d = *in_shape.get(src_axis).ok_or_else(|| {
                    CoreError::Type(format!(
                        "broadcast of {in_shape:?} to {out_shape:?} adding axes {axes:?}"
                    ))
                })?;
                let replacement = if in_d == 1 && d != 1 {
                    AluExp::index(0)
                } else {
                    idx_special(k, d)
                };
                env.insert(idx_name(src_axis), replacement);
                src_axis += 1;
            }
            (out_shape, env)
        }
        Primitive::Flip { axes } => {
            let mut env = HashMap::new();
            for &a in axes {
                let d = in_shape[a];
                let mirrored = AluExp::sub(
                    AluExp::index(d as i64 - 1),
                    idx_special(a, d),
                )?;
                env.insert(idx_name(a), mirrored);
            }
            (in_shape.clone(), env)
        }
        _ => {
            return Err(CoreError::Internal(format!(
                "{} is not a view op",
                prim.name()
            )))
        }
    };
    let exp = fused.exp.substitute(&env)?;
    Ok(Source::Fused(Fused {
        exp,
        args: fused.args,
        shape: out_shape,
    }))
}

pub(crate) fn flip_flags(ndim: usize, axes: &[usize]) -> Vec<bool> {
    let mut flags = vec![false; ndim];
    for &a in axes {
        if a < ndim {
            flags[a] = true;
        }
    }
    flags
}

fn contiguous_strides_usize(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; shape.len()];
    let mut acc = 1usize;
    for (k, &d) in shape.iter().enumerate().rev() {
        strides[k] = acc;
        acc *= d;
    }
    strides
}

/// Substitute the flat loop variables into a fused body, producing a
/// dispatchable kernel.
pub(crate) fn finalize(fused: &Fused, reduction: Option<Reduction>) -> CoreResult<Kernel> {
    let size: usize = fused.shape.iter().product();
    let gidx = AluExp::special(GIDX, size);
    let unravelled = unravel_alu(&fused.shape, gidx)?;
    let mut env: HashMap<String, AluExp> = HashMap::new();
    for (k, e) in unravelled.into_iter().enumerate() {
        env.insert(idx_name(k), e);
    }
    let exp = fused.exp.substitute(&env)?;
    Ok(Kernel {
        nargs: fused.args.len(),
        size,
        exp,
        reduction,
    })
}

/// Dispatch a fused body on a backend, allocating the output.
pub(crate) fn dispatch(
    backend: &Rc<dyn Backend>,
    fused: &Fused,
    reduction: Option<Reduction>,
    buffers: &[&Array],
) -> CoreResult<Array> {
    let kernel = finalize(fused, reduction)?;
    let tuned = tune_null(&kernel)?;
    let out_dtype = tuned.out_dtype();
    let out_slot = backend.malloc(kernel.size * out_dtype.size_in_bytes(), None)?;
    let input_slots: Vec<_> = fused
        .args
        .iter()
        .map(|&b| {
            buffers
                .get(b)
                .map(|a| a.slot())
                .ok_or_else(|| CoreError::Internal(format!("kernel reads unbound buffer {b}")))
        })
        .collect::<CoreResult<Vec<_>>>()?;
    if let Err(err) = backend.execute_sync(&tuned, &input_slots, &[out_slot], None) {
        let _ = backend.dec_ref(out_slot);
        return Err(err.into());
    }
    Ok(Array::from_owned_slot(
        out_slot,
        out_dtype,
        ShapeTracker::contiguous(&fused.shape),
        backend.clone(),
    ))
}

/// Copy an array into a fresh contiguous buffer via an identity kernel.
pub(crate) fn materialize(array: &Array) -> CoreResult<Array> {
    let source = Source::Buffer {
        id: 0,
        tracker: array.tracker().clone(),
        dtype: array.dtype(),
    };
    let fused = to_fused(&source)?;
    dispatch(array.backend(), &fused, None, &[array])
}
