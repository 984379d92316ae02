//! The typed, equation-form program IR (SSA style).
//!
//! A `Jaxpr` is `(in_binders, eqns, outs)`. Every variable used by an
//! equation or an output is bound earlier (an input binder or a previous
//! equation's output binder); `typecheck` verifies this along with the
//! abstract-eval of every equation.
//!
//! # Module structure
//!
//! - `mod`: types, `eval_jaxpr`, `typecheck`, `flatten`, `simplify`,
//!   `fingerprint`
//! - `print`: the stable text format (part of the tested surface)

mod print;
#[cfg(test)]
mod tests;

use std::cell::Cell;
use std::collections::{HashMap, HashSet};

use gradfuse_ir::Scalar;

use crate::aval::ShapedArray;
use crate::error::{CoreError, CoreResult};
use crate::primitives::Primitive;
use crate::trace::bind;
use crate::util::FpHash;
use crate::value::Value;

thread_local! {
    static NEXT_VAR_ID: Cell<u32> = const { Cell::new(0) };
}

/// A unique binder with its abstract value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Var {
    pub id: u32,
    pub aval: ShapedArray,
}

impl Var {
    /// Fresh binder with a process-unique id.
    pub fn fresh(aval: ShapedArray) -> Var {
        let id = NEXT_VAR_ID.with(|c| {
            let id = c.get();
            c.set(id + 1);
            id
        });
        Var { id, aval }
    }
}

/// A scalar literal inlined into an equation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lit {
    pub value: Scalar,
}

impl Lit {
    pub fn aval(&self) -> ShapedArray {
        ShapedArray::scalar(self.value.dtype())
    }
}

/// An equation operand or program output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Atom {
    Var(Var),
    Lit(Lit),
}

impl Atom {
    pub fn aval(&self) -> ShapedArray {
        match self {
            Atom::Var(v) => v.aval.clone(),
            Atom::Lit(l) => l.aval(),
        }
    }

    pub fn lit(value: Scalar) -> Atom {
        Atom::Lit(Lit { value })
    }
}

/// One primitive application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JaxprEqn {
    pub prim: Primitive,
    pub inputs: Vec<Atom>,
    pub out_binders: Vec<Var>,
}

/// A closed program over its input binders.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jaxpr {
    pub in_binders: Vec<Var>,
    pub eqns: Vec<JaxprEqn>,
    pub outs: Vec<Atom>,
}

impl Jaxpr {
    /// Run the program through the active trace stack: each equation is
    /// dispatched with `bind`, so evaluation composes with every
    /// transformation.
    pub fn eval(&self, args: &[Value]) -> CoreResult<Vec<Value>> {
        if args.len() != self.in_binders.len() {
            return Err(CoreError::Type(format!(
                "program expects {} arguments, got {}",
                self.in_binders.len(),
                args.len()
            )));
        }
        let mut env: HashMap<u32, Value> = HashMap::new();
        for (binder, arg) in self.in_binders.iter().zip(args) {
            env.insert(binder.id, arg.clone());
        }
        let read = |env: &HashMap<u32, Value>, atom: &Atom| -> CoreResult<Value> {
            match atom {
                Atom::Lit(l) => Ok(Value::Lit(l.value)),
                Atom::Var(v) => env.get(&v.id).cloned().ok_or_else(|| {
                    CoreError::Internal(format!("unbound variable v{} in program", v.id))
                }),
            }
        };
        for eqn in &self.eqns {
            let inputs = eqn
                .inputs
                .iter()
                .map(|a| read(&env, a))
                .collect::<CoreResult<Vec<_>>>()?;
            let outs = bind(eqn.prim.clone(), &inputs)?;
            if outs.len() != eqn.out_binders.len() {
                return Err(CoreError::Internal(format!(
                    "{} produced {} outputs for {} binders",
                    eqn.prim.name(),
                    outs.len(),
                    eqn.out_binders.len()
                )));
            }
            for (binder, out) in eqn.out_binders.iter().zip(outs) {
                env.insert(binder.id, out);
            }
        }
        self.outs.iter().map(|a| read(&env, a)).collect()
    }

    /// Verify the SSA discipline and every equation's abstract eval.
    pub fn typecheck(&self) -> CoreResult<()> {
        let mut in_scope: HashSet<u32> = HashSet::new();
        let mut avals: HashMap<u32, ShapedArray> = HashMap::new();
        for binder in &self.in_binders {
            if !in_scope.insert(binder.id) {
                return Err(CoreError::Type(format!(
                    "binder v{} bound twice",
                    binder.id
                )));
            }
            avals.insert(binder.id, binder.aval.clone());
        }
        let check_atom = |in_scope: &HashSet<u32>,
                          avals: &HashMap<u32, ShapedArray>,
                          atom: &Atom|
         -> CoreResult<ShapedArray> {
            match atom {
                Atom::Lit(l) => Ok(l.aval()),
                Atom::Var(v) => {
                    if !in_scope.contains(&v.id) {
                        return Err(CoreError::Type(format!(
                            "use of unbound variable v{}",
                            v.id
                        )));
                    }
                    let actual = &avals[&v.id];
                    if *actual != v.aval {
                        return Err(CoreError::Type(format!(
                            "variable v{} used at {} but bound at {}",
                            v.id, v.aval, actual
                        )));
                    }
                    Ok(v.aval.clone())
                }
            }
        };
        for eqn in &self.eqns {
            let in_avals = eqn
                .inputs
                .iter()
                .map(|a| check_atom(&in_scope, &avals, a))
                .collect::<CoreResult<Vec<_>>>()?;
            let out_avals = eqn.prim.abstract_eval(&in_avals)?;
            if out_avals.len() != eqn.out_binders.len() {
                return Err(CoreError::Type(format!(
                    "{} binds {} outputs but produces {}",
                    eqn.prim.name(),
                    eqn.out_binders.len(),
                    out_avals.len()
                )));
            }
            for (binder, aval) in eqn.out_binders.iter().zip(out_avals) {
                if binder.aval != aval {
                    return Err(CoreError::Type(format!(
                        "binder v{} declared {} but {} produces {}",
                        binder.id,
                        binder.aval,
                        eqn.prim.name(),
                        aval
                    )));
                }
                if !in_scope.insert(binder.id) {
                    return Err(CoreError::Type(format!(
                        "binder v{} bound twice",
                        binder.id
                    )));
                }
                avals.insert(binder.id, binder.aval.clone());
            }
        }
        for out in &self.outs {
            check_atom(&in_scope, &avals, out)?;
        }
        Ok(())
    }

    /// Inline every `jit_call` equation (recursively), producing an
    /// equivalent program with no nested calls.
    pub fn flatten(&self) -> CoreResult<Jaxpr> {
        let mut subst: HashMap<u32, Atom> = HashMap::new();
        let mut eqns: Vec<JaxprEqn> = Vec::new();
        let resolve = |subst: &HashMap<u32, Atom>, atom: &Atom| -> Atom {
            match atom {
                Atom::Var(v) => subst.get(&v.id).cloned().unwrap_or_else(|| atom.clone()),
                Atom::Lit(_) => atom.clone(),
            }
        };
        for eqn in &self.eqns {
            let inputs: Vec<Atom> = eqn.inputs.iter().map(|a| resolve(&subst, a)).collect();
            if let Primitive::JitCall { jaxpr, .. } = &eqn.prim {
                let inner = jaxpr.flatten()?;
                // bind the inner program's inputs to our resolved operands
                let mut inner_subst: HashMap<u32, Atom> = HashMap::new();
                for (binder, atom) in inner.in_binders.iter().zip(&inputs) {
                    inner_subst.insert(binder.id, atom.clone());
                }
                for inner_eqn in &inner.eqns {
                    let inner_inputs: Vec<Atom> = inner_eqn
                        .inputs
                        .iter()
                        .map(|a| resolve(&inner_subst, a))
                        .collect();
                    let out_binders: Vec<Var> = inner_eqn
                        .out_binders
                        .iter()
                        .map(|b| {
                            let fresh = Var::fresh(b.aval.clone());
                            inner_subst.insert(b.id, Atom::Var(fresh.clone()));
                            fresh
                        })
                        .collect();
                    eqns.push(JaxprEqn {
                        prim: inner_eqn.prim.clone(),
                        inputs: inner_inputs,
                        out_binders,
                    });
                }
                for (call_binder, inner_out) in eqn.out_binders.iter().zip(&inner.outs) {
                    subst.insert(call_binder.id, resolve(&inner_subst, inner_out));
                }
            } else {
                eqns.push(JaxprEqn {
                    prim: eqn.prim.clone(),
                    inputs,
                    out_binders: eqn.out_binders.clone(),
                });
            }
        }
        let outs = self.outs.iter().map(|a| resolve(&subst, a)).collect();
        Ok(Jaxpr {
            in_binders: self.in_binders.clone(),
            eqns,
            outs,
        })
    }

    /// Dead-code elimination, scalar constant folding, arithmetic
    /// identities, and hash-consing of identical equations. Preserves
    /// observable semantics.
    pub fn simplify(&self) -> CoreResult<Jaxpr> {
        let mut subst: HashMap<u32, Atom> = HashMap::new();
        let mut seen: HashMap<(Primitive, Vec<Atom>), Vec<Var>> = HashMap::new();
        let mut eqns: Vec<JaxprEqn> = Vec::new();
        let resolve = |subst: &HashMap<u32, Atom>, atom: &Atom| -> Atom {
            match atom {
                Atom::Var(v) => subst.get(&v.id).cloned().unwrap_or_else(|| atom.clone()),
                Atom::Lit(_) => atom.clone(),
            }
        };
        for eqn in &self.eqns {
            let inputs: Vec<Atom> = eqn.inputs.iter().map(|a| resolve(&subst, a)).collect();

            if let Some(folded) = fold_constant(&eqn.prim, &inputs)? {
                subst.insert(eqn.out_binders[0].id, Atom::lit(folded));
                continue;
            }
            if let Some(atom) = identity_rewrite(&eqn.prim, &inputs, &eqn.out_binders) {
                subst.insert(eqn.out_binders[0].id, atom);
                continue;
            }
            let key = (eqn.prim.clone(), inputs.clone());
            if let Some(prior) = seen.get(&key) {
                for (binder, existing) in eqn.out_binders.iter().zip(prior) {
                    subst.insert(binder.id, Atom::Var(existing.clone()));
                }
                continue;
            }
            seen.insert(key, eqn.out_binders.clone());
            eqns.push(JaxprEqn {
                prim: eqn.prim.clone(),
                inputs,
                out_binders: eqn.out_binders.clone(),
            });
        }
        let outs: Vec<Atom> = self.outs.iter().map(|a| resolve(&subst, a)).collect();

        // dead-code elimination, backwards
        let mut used: HashSet<u32> = outs
            .iter()
            .filter_map(|a| match a {
                Atom::Var(v) => Some(v.id),
                Atom::Lit(_) => None,
            })
            .collect();
        let mut kept: Vec<JaxprEqn> = Vec::new();
        for eqn in eqns.into_iter().rev() {
            if eqn.out_binders.iter().any(|b| used.contains(&b.id)) {
                for atom in &eqn.inputs {
                    if let Atom::Var(v) = atom {
                        used.insert(v.id);
                    }
                }
                kept.push(eqn);
            }
        }
        kept.reverse();
        Ok(Jaxpr {
            in_binders: self.in_binders.clone(),
            eqns: kept,
            outs,
        })
    }

    /// Stable structural fingerprint (variables renumbered in definition
    /// order), used as the JIT cache key.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FpHash::new();
        let mut ids: HashMap<u32, u64> = HashMap::new();
        fingerprint_into(self, &mut hasher, &mut ids);
        hasher.finish()
    }
}

fn fingerprint_into(jaxpr: &Jaxpr, hasher: &mut FpHash, ids: &mut HashMap<u32, u64>) {
    let mut dense = |ids: &mut HashMap<u32, u64>, id: u32| -> u64 {
        let next = ids.len() as u64;
        *ids.entry(id).or_insert(next)
    };
    let hash_aval = |hasher: &mut FpHash, aval: &ShapedArray| {
        hasher.push_slice(&aval.shape);
        hasher.push(aval.dtype as u64);
    };
    hasher.push_usize(jaxpr.in_binders.len());
    for binder in &jaxpr.in_binders {
        let idx = dense(ids, binder.id);
        hasher.push(idx);
        hash_aval(hasher, &binder.aval);
    }
    hasher.push_usize(jaxpr.eqns.len());
    for eqn in &jaxpr.eqns {
        fingerprint_prim(&eqn.prim, hasher, ids);
        hasher.push_usize(eqn.inputs.len());
        for atom in &eqn.inputs {
            match atom {
                Atom::Var(v) => {
                    hasher.push(1);
                    let idx = dense(ids, v.id);
                    hasher.push(idx);
                }
                Atom::Lit(l) => {
                    hasher.push(2);
                    hasher.push(scalar_bits(l.value));
                }
            }
        }
        for binder in &eqn.out_binders {
            let idx = dense(ids, binder.id);
            hasher.push(idx);
            hash_aval(hasher, &binder.aval);
        }
    }
    hasher.push_usize(jaxpr.outs.len());
    for atom in &jaxpr.outs {
        match atom {
            Atom::Var(v) => {
                let idx = dense(ids, v.id);
                hasher.push(idx);
            }
            Atom::Lit(l) => hasher.push(scalar_bits(l.value)),
        }
    }
}

fn fingerprint_prim(prim: &Primitive, hasher: &mut FpHash, ids: &mut HashMap<u32, u64>) {
    // the discriminant tag, then the params
    let tag = match prim {
        Primitive::Add => 0u64,
        Primitive::Mul => 1,
        Primitive::Neg => 2,
        Primitive::Sin => 3,
        Primitive::Cos => 4,
        Primitive::Exp => 5,
        Primitive::Log => 6,
        Primitive::Sqrt => 7,
        Primitive::Reciprocal => 8,
        Primitive::ReduceSum { .. } => 9,
        Primitive::Compare { .. } => 10,
        Primitive::Where => 11,
        Primitive::Transpose { .. } => 12,
        Primitive::Broadcast { .. } => 13,
        Primitive::Reshape { .. } => 14,
        Primitive::Flip { .. } => 15,
        Primitive::RandomBits { .. } => 16,
        Primitive::JitCall { .. } => 17,
    };
    hasher.push(tag);
    match prim {
        Primitive::ReduceSum { axes } | Primitive::Flip { axes } => hasher.push_slice(axes),
        Primitive::Compare { op } => hasher.push(*op as u64),
        Primitive::Transpose { perm } => hasher.push_slice(perm),
        Primitive::Broadcast { shape, axes } => {
            hasher.push_slice(shape);
            hasher.push_slice(axes);
        }
        Primitive::Reshape { shape } | Primitive::RandomBits { shape } => {
            hasher.push_slice(shape)
        }
        Primitive::JitCall { jaxpr, num_consts } => {
            hasher.push_usize(*num_consts);
            fingerprint_into(jaxpr, hasher, ids);
        }
        _ => {}
    }
}

fn scalar_bits(s: Scalar) -> u64 {
    match s {
        Scalar::F32(v) => 0x1_0000_0000u64 | v.to_bits() as u64,
        Scalar::I32(v) => 0x2_0000_0000u64 | v as u32 as u64,
        Scalar::U32(v) => 0x3_0000_0000u64 | v as u64,
        Scalar::Bool(v) => 0x4_0000_0000u64 | v as u64,
        Scalar::C64(v) => {
            0x5_0000_0000u64 ^ ((v.re.to_bits() as u64) << 16) ^ v.im.to_bits() as u64
        }
    }
}

/// Fold an equation whose operands are all scalar literals.
fn fold_constant(prim: &Primitive, inputs: &[Atom]) -> CoreResult<Option<Scalar>> {
    let mut lits = Vec::with_capacity(inputs.len());
    for atom in inputs {
        match atom {
            Atom::Lit(l) => lits.push(l.value),
            Atom::Var(_) => return Ok(None),
        }
    }
    crate::primitives::fold_scalars(prim, &lits)
}

/// `x + 0`, `x * 1` and friends collapse to their non-trivial operand
/// when the shapes agree.
fn identity_rewrite(prim: &Primitive, inputs: &[Atom], out_binders: &[Var]) -> Option<Atom> {
    let [out] = out_binders else { return None };
    let is_lit = |atom: &Atom, v: f64| -> bool {
        matches!(atom, Atom::Lit(l) if l.value.as_f64() == Some(v))
    };
    let keep = |atom: &Atom| -> Option<Atom> {
        (atom.aval() == out.aval).then(|| atom.clone())
    };
    match (prim, inputs) {
        (Primitive::Add, [x, z]) if is_lit(z, 0.0) => keep(x),
        (Primitive::Add, [z, x]) if is_lit(z, 0.0) => keep(x),
        (Primitive::Mul, [x, o]) if is_lit(o, 1.0) => keep(x),
        (Primitive::Mul, [o, x]) if is_lit(o, 1.0) => keep(x),
        _ => None,
    }
}
