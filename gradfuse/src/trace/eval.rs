//! The eval trace: primitives applied to concrete data.
//!
//! Elementwise and reduction primitives go through the same kernel-build
//! path the JIT uses (one primitive per kernel), view primitives compose
//! the array's tracker without copying, and scalar-only applications fold
//! on the host.

use std::rc::Rc;

use gradfuse_backend::Backend;
use gradfuse_ir::Scalar;

use crate::array::{default_backend, Array};
use crate::error::{CoreError, CoreResult};
use crate::fuse;
use crate::primitives::{fold_scalars, Primitive};
use crate::value::Value;

pub(crate) fn process(prim: &Primitive, args: &[Value]) -> CoreResult<Vec<Value>> {
    match prim {
        Primitive::JitCall { jaxpr, num_consts } => {
            crate::jit::compile_and_run(jaxpr, *num_consts, args)
        }
        Primitive::RandomBits { shape } => {
            let key = concrete(&args[0])?;
            let out = crate::prng::eval_random_bits(&key, shape)?;
            Ok(vec![Value::Concrete(out)])
        }
        _ if prim.is_view_op() => {
            let out = apply_view(prim, &args[0])?;
            Ok(vec![Value::Concrete(out)])
        }
        Primitive::ReduceSum { axes } => {
            let (source, buffers) = collect_sources(args)?;
            let (fused, reduction) = fuse::reduce_sum(&source[0], axes)?;
            let backend = pick_backend(&buffers);
            let refs: Vec<&Array> = buffers.iter().collect();
            let out = fuse::dispatch(&backend, &fused, Some(reduction), &refs)?;
            Ok(vec![Value::Concrete(out)])
        }
        _ if prim.is_elementwise() => {
            // scalar fast path: fold on the host
            if let Some(lits) = all_lits(args) {
                if let Some(folded) = fold_scalars(prim, &lits)? {
                    return Ok(vec![Value::Lit(folded)]);
                }
            }
            let (sources, buffers) = collect_sources(args)?;
            let fused = fuse::elementwise(prim, &sources)?;
            let backend = pick_backend(&buffers);
            let refs: Vec<&Array> = buffers.iter().collect();
            let out = fuse::dispatch(&backend, &fused, None, &refs)?;
            Ok(vec![Value::Concrete(out)])
        }
        other => Err(CoreError::Internal(format!(
            "no eval rule for {}",
            other.name()
        ))),
    }
}

fn concrete(value: &Value) -> CoreResult<Array> {
    value.to_array()
}

fn all_lits(args: &[Value]) -> Option<Vec<Scalar>> {
    args.iter()
        .map(|a| match a {
            Value::Lit(s) => Some(*s),
            _ => None,
        })
        .collect()
}

/// Convert eval-level values to kernel sources; concrete arrays become
/// buffers numbered by their position in the returned list.
fn collect_sources(args: &[Value]) -> CoreResult<(Vec<fuse::Source>, Vec<Array>)> {
    let mut buffers: Vec<Array> = Vec::new();
    let mut sources = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::Lit(s) => sources.push(fuse::Source::Const(*s)),
            Value::Concrete(a) => {
                let id = buffers.len();
                sources.push(fuse::Source::Buffer {
                    id,
                    tracker: a.tracker().clone(),
                    dtype: a.dtype(),
                });
                buffers.push(a.clone());
            }
            _ => {
                return Err(CoreError::Internal(
                    "tracer reached the eval trace".into(),
                ))
            }
        }
    }
    Ok((sources, buffers))
}

fn pick_backend(buffers: &[Array]) -> Rc<dyn Backend> {
    buffers
        .first()
        .map(|a| a.backend().clone())
        .unwrap_or_else(default_backend)
}

/// View primitives share the slot through a composed tracker; a scalar
/// literal is first materialized as a one-element array.
fn apply_view(prim: &Primitive, arg: &Value) -> CoreResult<Array> {
    let array = concrete(arg)?;
    let tracker = array.tracker();
    let new_tracker = match prim {
        Primitive::Transpose { perm } => tracker.permute(perm)?,
        Primitive::Reshape { shape } => tracker.reshape(shape)?,
        Primitive::Broadcast { shape, axes } => tracker.broadcast(shape, axes)?,
        Primitive::Flip { axes } => {
            let flags = fuse::flip_flags(tracker.ndim(), axes);
            tracker.flip(&flags)?
        }
        other => {
            return Err(CoreError::Internal(format!(
                "{} is not a view op",
                other.name()
            )))
        }
    };
    array.with_tracker(new_tracker)
}
