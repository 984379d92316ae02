//! Forward-mode automatic differentiation.
//!
//! A `JvpTracer` pairs a primal with its tangent; each primitive's rule
//! computes both outputs from both inputs. Tangents of non-differentiable
//! outputs (comparisons, random bits) are zeros.

use std::cell::RefCell;
use std::rc::Rc;

use gradfuse_ir::Scalar;

use crate::aval::ShapedArray;
use crate::error::{CoreError, CoreResult};
use crate::ops;
use crate::primitives::Primitive;
use crate::trace::{bind1, full_raise, new_main, MainTrace, TraceKind};
use crate::tree::{flatten, unflatten, Tree};
use crate::value::Value;

/// Forward-mode tracer: `(primal, tangent)` with identical avals.
#[derive(Debug)]
pub struct JvpTracer {
    pub(crate) level: usize,
    pub(crate) primal: Value,
    pub(crate) tangent: Value,
}

impl JvpTracer {
    pub fn aval(&self) -> ShapedArray {
        self.primal.aval()
    }
}

fn tracer(level: usize, primal: Value, tangent: Value) -> Value {
    Value::Jvp(Rc::new(JvpTracer {
        level,
        primal,
        tangent,
    }))
}

/// Lift a lower-level value: its tangent is zero.
pub(crate) fn lift(level: usize, value: &Value) -> CoreResult<Value> {
    let tangent = ops::zeros_like(value)?;
    Ok(tracer(level, value.clone(), tangent))
}

fn unpack(level: usize, args: &[Value]) -> CoreResult<(Vec<Value>, Vec<Value>)> {
    let mut primals = Vec::with_capacity(args.len());
    let mut tangents = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::Jvp(t) if t.level == level => {
                primals.push(t.primal.clone());
                tangents.push(t.tangent.clone());
            }
            _ => {
                return Err(CoreError::Internal(
                    "jvp rule applied to a non-jvp tracer".into(),
                ))
            }
        }
    }
    Ok((primals, tangents))
}

/// The JVP rule table.
pub(crate) fn process(level: usize, prim: &Primitive, args: &[Value]) -> CoreResult<Vec<Value>> {
    let (p, t) = unpack(level, args)?;
    let two = Value::Lit(Scalar::F32(2.0));
    let (primal_out, tangent_out) = match prim {
        Primitive::Add => (ops::add(&p[0], &p[1])?, ops::add(&t[0], &t[1])?),
        Primitive::Mul => {
            let po = ops::mul(&p[0], &p[1])?;
            let to = ops::add(&ops::mul(&t[0], &p[1])?, &ops::mul(&p[0], &t[1])?)?;
            (po, to)
        }
        Primitive::Neg => (ops::neg(&p[0])?, ops::neg(&t[0])?),
        Primitive::Sin => (ops::sin(&p[0])?, ops::mul(&ops::cos(&p[0])?, &t[0])?),
        Primitive::Cos => {
            let po = ops::cos(&p[0])?;
            let to = ops::neg(&ops::mul(&ops::sin(&p[0])?, &t[0])?)?;
            (po, to)
        }
        Primitive::Exp => {
            let po = ops::exp(&p[0])?;
            let to = ops::mul(&po, &t[0])?;
            (po, to)
        }
        Primitive::Log => (ops::log(&p[0])?, ops::div(&t[0], &p[0])?),
        Primitive::Sqrt => {
            let po = ops::sqrt(&p[0])?;
            let to = ops::div(&t[0], &ops::mul(&po, &two)?)?;
            (po, to)
        }
        Primitive::Reciprocal => {
            // d(1/x) = -t / x^2 = -t * (1/x)^2
            let po = ops::reciprocal(&p[0])?;
            let to = ops::neg(&ops::mul(&t[0], &ops::mul(&po, &po)?)?)?;
            (po, to)
        }
        Primitive::ReduceSum { .. }
        | Primitive::Transpose { .. }
        | Primitive::Broadcast { .. }
        | Primitive::Reshape { .. }
        | Primitive::Flip { .. } => {
            // structural/linear ops apply identically to the tangent
            let po = bind1(prim.clone(), &[p[0].clone()])?;
            let to = bind1(prim.clone(), &[t[0].clone()])?;
            (po, to)
        }
        Primitive::Compare { .. } => {
            let po = bind1(prim.clone(), &p)?;
            let to = ops::zeros_like(&po)?;
            (po, to)
        }
        Primitive::Where => {
            let po = ops::where_(&p[0], &p[1], &p[2])?;
            let to = ops::where_(&p[0], &t[1], &t[2])?;
            (po, to)
        }
        Primitive::RandomBits { .. } => {
            let po = bind1(prim.clone(), &[p[0].clone()])?;
            let to = ops::zeros_like(&po)?;
            (po, to)
        }
        Primitive::JitCall { jaxpr, .. } => {
            let (pos, tos) = jvp_flat(|vals| jaxpr.eval(vals), &p, &t)?;
            return Ok(pos
                .into_iter()
                .zip(tos)
                .map(|(po, to)| tracer(level, po, to))
                .collect());
        }
    };
    Ok(vec![tracer(level, primal_out, tangent_out)])
}

/// Forward-mode transform over flat value lists.
pub fn jvp_flat<F>(
    f: F,
    primals: &[Value],
    tangents: &[Value],
) -> CoreResult<(Vec<Value>, Vec<Value>)>
where
    F: FnOnce(&[Value]) -> CoreResult<Vec<Value>>,
{
    if primals.len() != tangents.len() {
        return Err(CoreError::TreeMismatch(format!(
            "{} primals against {} tangents",
            primals.len(),
            tangents.len()
        )));
    }
    for (p, t) in primals.iter().zip(tangents) {
        if p.aval() != t.aval() {
            return Err(CoreError::Type(format!(
                "tangent {} does not match primal {}",
                t.aval(),
                p.aval()
            )));
        }
    }
    let frame = new_main(TraceKind::Jvp);
    let level = frame.level();
    let tracers: Vec<Value> = primals
        .iter()
        .zip(tangents)
        .map(|(p, t)| tracer(level, p.clone(), t.clone()))
        .collect();
    let outs = f(&tracers)?;
    let top = MainTrace {
        level,
        kind: TraceKind::Jvp,
    };
    let mut primals_out = Vec::with_capacity(outs.len());
    let mut tangents_out = Vec::with_capacity(outs.len());
    for out in outs {
        match full_raise(top, &out)? {
            Value::Jvp(t) => {
                primals_out.push(t.primal.clone());
                tangents_out.push(t.tangent.clone());
            }
            _ => {
                return Err(CoreError::Internal(
                    "jvp output did not raise to a jvp tracer".into(),
                ))
            }
        }
    }
    Ok((primals_out, tangents_out))
}

/// Forward-mode transform over trees of values. The primal and tangent
/// trees must share a structure; so do the outputs.
pub fn jvp<F>(f: F, primals: &Tree, tangents: &Tree) -> CoreResult<(Tree, Tree)>
where
    F: Fn(&Tree) -> CoreResult<Tree>,
{
    let (primal_leaves, primal_def) = flatten(primals);
    let (tangent_leaves, tangent_def) = flatten(tangents);
    if primal_def != tangent_def {
        return Err(CoreError::TreeMismatch(
            "primal and tangent trees differ in structure".into(),
        ));
    }
    let out_def: RefCell<Option<crate::tree::TreeDef>> = RefCell::new(None);
    let (pos, tos) = jvp_flat(
        |vals| {
            let tree = unflatten(&primal_def, vals.to_vec())?;
            let out = f(&tree)?;
            let (leaves, def) = flatten(&out);
            *out_def.borrow_mut() = Some(def);
            Ok(leaves)
        },
        &primal_leaves,
        &tangent_leaves,
    )?;
    let def = out_def
        .into_inner()
        .ok_or_else(|| CoreError::Internal("jvp output structure not captured".into()))?;
    Ok((unflatten(&def, pos)?, unflatten(&def, tos)?))
}
