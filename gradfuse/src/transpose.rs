//! Reverse-mode AD: Jaxpr transposition, `vjp` and `grad`.
//!
//! `eval_jaxpr_transposed` walks a linear program backwards, pulling
//! output cotangents to the inputs marked as undefined primals.
//! Equations over fully-known inputs evaluate forwards first (they are
//! the nonlinear data of the program); every other equation must be
//! linear in its unknown inputs, with a transpose rule below.

use std::collections::HashMap;

use gradfuse_ir::{DType, Scalar};

use crate::aval::ShapedArray;
use crate::error::{CoreError, CoreResult};
use crate::jaxpr::{Atom, Jaxpr};
use crate::partial_eval::linearize_flat;
use crate::primitives::Primitive;
use crate::trace::bind;
use crate::ops;
use crate::tree::{flatten, unflatten, Tree, TreeDef};
use crate::value::Value;

/// One argument of a transposed evaluation: a concrete value, or the
/// sentinel marking an input whose cotangent is wanted.
#[derive(Debug, Clone)]
pub enum TransposeArg {
    Known(Value),
    Undef(ShapedArray),
}

/// An equation input as the transpose pass sees it.
#[derive(Debug, Clone)]
enum CtIn {
    Known(Value),
    /// Unknown input: the variable id the cotangent accumulates into.
    Undef { id: u32, aval: ShapedArray },
}

/// Pull `cotangents` back through `jaxpr` to every `Undef` argument.
/// Returns one entry per argument: `Some(cotangent)` for undefined
/// primals, `None` for known ones.
pub fn eval_jaxpr_transposed(
    jaxpr: &Jaxpr,
    args: &[TransposeArg],
    cotangents: &[Value],
) -> CoreResult<Vec<Option<Value>>> {
    if args.len() != jaxpr.in_binders.len() {
        return Err(CoreError::Type(format!(
            "transposed program expects {} arguments, got {}",
            jaxpr.in_binders.len(),
            args.len()
        )));
    }
    if cotangents.len() != jaxpr.outs.len() {
        return Err(CoreError::Type(format!(
            "{} cotangents for {} outputs",
            cotangents.len(),
            jaxpr.outs.len()
        )));
    }

    // forward sweep: evaluate everything reachable from known inputs
    let mut known: HashMap<u32, Value> = HashMap::new();
    let mut undef: HashMap<u32, ShapedArray> = HashMap::new();
    for (binder, arg) in jaxpr.in_binders.iter().zip(args) {
        match arg {
            TransposeArg::Known(v) => {
                known.insert(binder.id, v.clone());
            }
            TransposeArg::Undef(aval) => {
                if *aval != binder.aval {
                    return Err(CoreError::Type(format!(
                        "undefined primal {} against binder {}",
                        aval, binder.aval
                    )));
                }
                undef.insert(binder.id, aval.clone());
            }
        }
    }
    let atom_known = |known: &HashMap<u32, Value>, atom: &Atom| -> Option<Value> {
        match atom {
            Atom::Lit(l) => Some(Value::Lit(l.value)),
            Atom::Var(v) => known.get(&v.id).cloned(),
        }
    };
    let mut forward_evaluated: Vec<bool> = vec![false; jaxpr.eqns.len()];
    for (i, eqn) in jaxpr.eqns.iter().enumerate() {
        let resolved: Option<Vec<Value>> =
            eqn.inputs.iter().map(|a| atom_known(&known, a)).collect();
        if let Some(inputs) = resolved {
            let outs = bind(eqn.prim.clone(), &inputs)?;
            for (binder, out) in eqn.out_binders.iter().zip(outs) {
                known.insert(binder.id, out);
            }
            forward_evaluated[i] = true;
        } else {
            for binder in &eqn.out_binders {
                undef.insert(binder.id, binder.aval.clone());
            }
        }
    }

    // seed output cotangents
    let mut ct_env: HashMap<u32, Value> = HashMap::new();
    for (out, ct) in jaxpr.outs.iter().zip(cotangents) {
        if let Atom::Var(v) = out {
            if undef.contains_key(&v.id) {
                accumulate(&mut ct_env, v.id, ct.clone())?;
            }
        }
        // cotangents of literal or known outputs vanish
    }

    // backward sweep
    for (i, eqn) in jaxpr.eqns.iter().enumerate().rev() {
        if forward_evaluated[i] {
            continue;
        }
        let cts_out: Vec<Option<Value>> = eqn
            .out_binders
            .iter()
            .map(|b| ct_env.remove(&b.id))
            .collect();
        if cts_out.iter().all(Option::is_none) {
            continue; // dead branch
        }
        let cts_out: Vec<Value> = eqn
            .out_binders
            .iter()
            .zip(cts_out)
            .map(|(b, ct)| match ct {
                Some(v) => Ok(v),
                None => ops::zeros_aval(&b.aval),
            })
            .collect::<CoreResult<Vec<_>>>()?;
        let ins: Vec<CtIn> = eqn
            .inputs
            .iter()
            .map(|atom| match atom {
                Atom::Lit(l) => CtIn::Known(Value::Lit(l.value)),
                Atom::Var(v) => match known.get(&v.id) {
                    Some(val) => CtIn::Known(val.clone()),
                    None => CtIn::Undef {
                        id: v.id,
                        aval: v.aval.clone(),
                    },
                },
            })
            .collect();
        let ct_ins = transpose_rule(&eqn.prim, &ins, &cts_out)?;
        for (input, ct) in ins.iter().zip(ct_ins) {
            if let (CtIn::Undef { id, .. }, Some(ct)) = (input, ct) {
                accumulate(&mut ct_env, *id, ct)?;
            }
        }
    }

    // collect per-argument cotangents; untouched ones are zeros
    jaxpr
        .in_binders
        .iter()
        .zip(args)
        .map(|(binder, arg)| match arg {
            TransposeArg::Known(_) => Ok(None),
            TransposeArg::Undef(aval) => match ct_env.remove(&binder.id) {
                Some(ct) => Ok(Some(ct)),
                None => Ok(Some(ops::zeros_aval(aval)?)),
            },
        })
        .collect()
}

fn accumulate(ct_env: &mut HashMap<u32, Value>, id: u32, ct: Value) -> CoreResult<()> {
    let next = match ct_env.remove(&id) {
        Some(existing) => ops::add(&existing, &ct)?,
        None => ct,
    };
    ct_env.insert(id, next);
    Ok(())
}

fn the_known(input: &CtIn) -> Option<&Value> {
    match input {
        CtIn::Known(v) => Some(v),
        CtIn::Undef { .. } => None,
    }
}

fn undef_aval(input: &CtIn) -> Option<&ShapedArray> {
    match input {
        CtIn::Undef { aval, .. } => Some(aval),
        CtIn::Known(_) => None,
    }
}

/// Sum a cotangent down to an input's abstract value: reduce the axes
/// the input did not contribute (implicitly broadcast operands), then
/// restore its shape.
fn unbroadcast(ct: &Value, target: &ShapedArray) -> CoreResult<Value> {
    let ct_shape = ct.shape();
    if ct_shape == target.shape {
        return Ok(ct.clone());
    }
    let offset = ct_shape.len() - target.shape.len();
    let mut reduce_axes: Vec<usize> = (0..offset).collect();
    for (k, &d) in target.shape.iter().enumerate() {
        if d == 1 && ct_shape[k + offset] != 1 {
            reduce_axes.push(k + offset);
        }
    }
    let summed = ops::reduce_sum(ct, &reduce_axes)?;
    ops::reshape(&summed, &target.shape)
}

/// Per-primitive transpose over linear arguments. Produces one optional
/// cotangent per input; known inputs get `None`.
fn transpose_rule(
    prim: &Primitive,
    ins: &[CtIn],
    cts: &[Value],
) -> CoreResult<Vec<Option<Value>>> {
    let ct = &cts[0];
    match prim {
        Primitive::Add => ins
            .iter()
            .map(|i| match i {
                CtIn::Undef { aval, .. } => unbroadcast(ct, aval).map(Some),
                CtIn::Known(_) => Ok(None),
            })
            .collect(),
        Primitive::Neg => Ok(vec![Some(ops::neg(ct)?)]),
        Primitive::Mul => {
            // linearity: exactly one side is undefined
            match (&ins[0], &ins[1]) {
                (CtIn::Known(k), CtIn::Undef { aval, .. }) => {
                    let scaled = ops::mul(ct, k)?;
                    Ok(vec![None, Some(unbroadcast(&scaled, aval)?)])
                }
                (CtIn::Undef { aval, .. }, CtIn::Known(k)) => {
                    let scaled = ops::mul(ct, k)?;
                    Ok(vec![Some(unbroadcast(&scaled, aval)?), None])
                }
                _ => Err(CoreError::Type(
                    "mul of two unknown inputs in a linear program".into(),
                )),
            }
        }
        Primitive::ReduceSum { axes } => {
            let aval = undef_aval(&ins[0]).ok_or_else(|| {
                CoreError::Internal("reduce_sum transpose with known input".into())
            })?;
            let ct_in = bind(
                Primitive::Broadcast {
                    shape: aval.shape.clone(),
                    axes: axes.clone(),
                },
                &[ct.clone()],
            )?
            .remove(0);
            Ok(vec![Some(ct_in)])
        }
        Primitive::Broadcast { shape, axes } => {
            let aval = undef_aval(&ins[0]).ok_or_else(|| {
                CoreError::Internal("broadcast transpose with known input".into())
            })?;
            // reduce the inserted axes and every stretched unit axis,
            // then restore the original shape
            let mut reduce_axes: Vec<usize> = axes.clone();
            let mut src_axis = 0usize;
            for (k, &d) in shape.iter().enumerate() {
                if axes.contains(&k) {
                    continue;
                }
                if aval.shape[src_axis] == 1 && d != 1 {
                    reduce_axes.push(k);
                }
                src_axis += 1;
            }
            reduce_axes.sort_unstable();
            reduce_axes.dedup();
            let summed = ops::reduce_sum(ct, &reduce_axes)?;
            let restored = ops::reshape(&summed, &aval.shape)?;
            Ok(vec![Some(restored)])
        }
        Primitive::Transpose { perm } => {
            let inverse = gradfuse_ir::shape::invert_permutation(perm);
            Ok(vec![Some(ops::transpose(ct, &inverse)?)])
        }
        Primitive::Reshape { .. } => {
            let aval = undef_aval(&ins[0]).ok_or_else(|| {
                CoreError::Internal("reshape transpose with known input".into())
            })?;
            Ok(vec![Some(ops::reshape(ct, &aval.shape)?)])
        }
        Primitive::Flip { axes } => Ok(vec![Some(ops::flip(ct, axes)?)]),
        Primitive::Where => {
            let cond = the_known(&ins[0]).ok_or_else(|| {
                CoreError::Type("where condition must be known in a linear program".into())
            })?;
            let zeros = ops::zeros_like(ct)?;
            let ct_x = match &ins[1] {
                CtIn::Undef { aval, .. } => {
                    Some(unbroadcast(&ops::where_(cond, ct, &zeros)?, aval)?)
                }
                CtIn::Known(_) => None,
            };
            let ct_y = match &ins[2] {
                CtIn::Undef { aval, .. } => {
                    Some(unbroadcast(&ops::where_(cond, &zeros, ct)?, aval)?)
                }
                CtIn::Known(_) => None,
            };
            Ok(vec![None, ct_x, ct_y])
        }
        Primitive::JitCall { jaxpr, .. } => {
            let inner_args: Vec<TransposeArg> = ins
                .iter()
                .map(|i| match i {
                    CtIn::Known(v) => TransposeArg::Known(v.clone()),
                    CtIn::Undef { aval, .. } => TransposeArg::Undef(aval.clone()),
                })
                .collect();
            eval_jaxpr_transposed(jaxpr, &inner_args, cts)
        }
        other => Err(CoreError::Type(format!(
            "{} has no transpose rule (nonlinear operation in a linear position)",
            other.name()
        ))),
    }
}

/// The pullback produced by `vjp`.
#[derive(Debug, Clone)]
pub struct VjpFn {
    jaxpr: std::rc::Rc<Jaxpr>,
    consts: Vec<Value>,
    in_avals: Vec<ShapedArray>,
}

impl VjpFn {
    /// Pull output cotangents back to the primal inputs.
    pub fn call(&self, cotangents: &[Value]) -> CoreResult<Vec<Value>> {
        let mut args: Vec<TransposeArg> = self
            .consts
            .iter()
            .map(|c| TransposeArg::Known(c.clone()))
            .collect();
        args.extend(self.in_avals.iter().map(|a| TransposeArg::Undef(a.clone())));
        let cts = eval_jaxpr_transposed(&self.jaxpr, &args, cotangents)?;
        cts.into_iter()
            .skip(self.consts.len())
            .map(|ct| {
                ct.ok_or_else(|| {
                    CoreError::Internal("missing cotangent for an undefined primal".into())
                })
            })
            .collect()
    }
}

/// Reverse-mode transform over flat value lists: evaluates `f` and
/// returns the outputs with a pullback.
pub fn vjp_flat<F>(f: F, primals: &[Value]) -> CoreResult<(Vec<Value>, VjpFn)>
where
    F: FnOnce(&[Value]) -> CoreResult<Vec<Value>>,
{
    let in_avals: Vec<ShapedArray> = primals.iter().map(Value::aval).collect();
    let (primals_out, linear) = linearize_flat(f, primals)?;
    let (jaxpr, consts) = linear.into_parts();
    Ok((
        primals_out,
        VjpFn {
            jaxpr,
            consts,
            in_avals,
        },
    ))
}

/// Tree-structured `vjp`.
pub fn vjp<F>(f: F, primals: &Tree) -> CoreResult<(Tree, impl Fn(&Tree) -> CoreResult<Tree>)>
where
    F: Fn(&Tree) -> CoreResult<Tree>,
{
    let (primal_leaves, in_def) = flatten(primals);
    let out_def: std::cell::RefCell<Option<TreeDef>> = std::cell::RefCell::new(None);
    let (outs, vjp_fn) = vjp_flat(
        |vals| {
            let tree = unflatten(&in_def, vals.to_vec())?;
            let out = f(&tree)?;
            let (leaves, def) = flatten(&out);
            *out_def.borrow_mut() = Some(def);
            Ok(leaves)
        },
        &primal_leaves,
    )?;
    let def = out_def
        .into_inner()
        .ok_or_else(|| CoreError::Internal("vjp output structure not captured".into()))?;
    let out_tree = unflatten(&def, outs)?;
    let pullback = move |cotangents: &Tree| -> CoreResult<Tree> {
        let (ct_leaves, ct_def) = flatten(cotangents);
        if ct_def != def {
            return Err(CoreError::TreeMismatch(
                "cotangent tree does not match the output structure".into(),
            ));
        }
        let cts_in = vjp_fn.call(&ct_leaves)?;
        unflatten(&in_def, cts_in)
    };
    Ok((out_tree, pullback))
}

/// Gradient of a scalar-valued function with respect to its first
/// positional argument.
pub fn grad<F>(f: F) -> impl Fn(&Value) -> CoreResult<Value>
where
    F: Fn(&Value) -> CoreResult<Value>,
{
    move |x: &Value| {
        let (outs, vjp_fn) = vjp_flat(|vals| Ok(vec![f(&vals[0])?]), &[x.clone()])?;
        let out_aval = outs[0].aval();
        if !out_aval.is_scalar() || out_aval.dtype != DType::Float32 {
            return Err(CoreError::Type(format!(
                "grad requires a scalar float32 output, got {out_aval}"
            )));
        }
        let mut cts = vjp_fn.call(&[Value::Lit(Scalar::F32(1.0))])?;
        Ok(cts.remove(0))
    }
}
