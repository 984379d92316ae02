//! Partial evaluation: split a trace into a known (eager) part and an
//! unknown part recorded as a Jaxpr.
//!
//! Each `PeTracer` is either known (it carries a value from a lower
//! level) or unknown (it carries a recipe: an input binder, a hoisted
//! constant, or an equation over other tracers). Equation recipes hold
//! weak references to their output tracers so unused outputs can be
//! collected before the Jaxpr is assembled; a dead weak reference at
//! assembly time simply produces a fresh (dead) binder.
//!
//! `linearize` runs `jvp` under a partial-evaluation trace with known
//! primals and unknown tangents; the unknown half is the linear program.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::aval::ShapedArray;
use crate::error::{CoreError, CoreResult};
use crate::jaxpr::{Atom, Jaxpr, JaxprEqn, Var};
use crate::jvp::jvp_flat;
use crate::primitives::Primitive;
use crate::trace::{bind, current_dynamic, new_main, TraceKind};
use crate::tree::{flatten, unflatten, Tree, TreeDef};
use crate::util::topo_sort;
use crate::value::Value;

/// How an unknown tracer came to be.
#[derive(Debug)]
pub(crate) enum Recipe {
    /// An input of the program under construction.
    Lambda,
    /// A value lifted from below, to be hoisted as a constant.
    Const(Value),
    /// An output of a recorded equation.
    Eqn(Rc<EqnRecipe>),
}

/// A recorded primitive application.
#[derive(Debug)]
pub(crate) struct EqnRecipe {
    pub prim: Primitive,
    pub tracers_in: Vec<Rc<PeTracer>>,
    pub avals_out: Vec<ShapedArray>,
    /// Weak back-edges to the outputs; owning them would keep unused
    /// outputs alive forever.
    pub tracer_refs_out: RefCell<Vec<Weak<PeTracer>>>,
}

/// Partial-evaluation tracer.
#[derive(Debug)]
pub struct PeTracer {
    pub(crate) level: usize,
    pub(crate) aval: ShapedArray,
    /// The concrete (lower-level) value when this tracer is known.
    pub(crate) known: Option<Value>,
    pub(crate) recipe: RefCell<Option<Recipe>>,
}

impl PeTracer {
    fn known_at(level: usize, value: Value) -> Rc<PeTracer> {
        Rc::new(PeTracer {
            level,
            aval: value.aval(),
            known: Some(value),
            recipe: RefCell::new(None),
        })
    }

    pub(crate) fn lambda(level: usize, aval: ShapedArray) -> Rc<PeTracer> {
        Rc::new(PeTracer {
            level,
            aval,
            known: None,
            recipe: RefCell::new(Some(Recipe::Lambda)),
        })
    }

    fn is_known(&self) -> bool {
        self.known.is_some() && self.recipe.borrow().is_none()
    }

    /// Turn a known tracer into a graph node with a constant recipe.
    /// Idempotent; unknown tracers are untouched.
    fn instantiate_const(&self) -> CoreResult<()> {
        let mut recipe = self.recipe.borrow_mut();
        if recipe.is_some() {
            return Ok(());
        }
        let value = self
            .known
            .clone()
            .ok_or_else(|| CoreError::Internal("tracer with neither value nor recipe".into()))?;
        *recipe = Some(Recipe::Const(value));
        Ok(())
    }
}

/// Lift a lower value into the trace as a known tracer.
pub(crate) fn lift(level: usize, value: &Value) -> CoreResult<Value> {
    Ok(Value::PartialEval(PeTracer::known_at(level, value.clone())))
}

fn unpack(level: usize, args: &[Value]) -> CoreResult<Vec<Rc<PeTracer>>> {
    args.iter()
        .map(|arg| match arg {
            Value::PartialEval(t) if t.level == level => Ok(t.clone()),
            _ => Err(CoreError::Internal(
                "partial-eval rule applied to a foreign tracer".into(),
            )),
        })
        .collect()
}

/// The partial-evaluation processing rule.
///
/// Known-only applications execute immediately below this trace, except
/// while this trace is the dynamic (jit-staging) trace, where everything
/// is recorded. Otherwise known inputs are instantiated as constants and
/// the application becomes an equation recipe.
pub(crate) fn process(level: usize, prim: &Primitive, args: &[Value]) -> CoreResult<Vec<Value>> {
    let tracers = unpack(level, args)?;
    let staging = current_dynamic() == Some(level);
    if !staging && tracers.iter().all(|t| t.is_known()) {
        let lowered: Vec<Value> = tracers
            .iter()
            .map(|t| t.known.clone().expect("checked known above"))
            .collect();
        return bind(prim.clone(), &lowered);
    }

    for t in &tracers {
        t.instantiate_const()?;
    }
    let in_avals: Vec<ShapedArray> = tracers.iter().map(|t| t.aval.clone()).collect();
    let avals_out = prim.abstract_eval(&in_avals)?;

    let eqn = Rc::new(EqnRecipe {
        prim: prim.clone(),
        tracers_in: tracers,
        avals_out: avals_out.clone(),
        tracer_refs_out: RefCell::new(Vec::new()),
    });
    let outs: Vec<Rc<PeTracer>> = avals_out
        .into_iter()
        .map(|aval| {
            Rc::new(PeTracer {
                level,
                aval,
                known: None,
                recipe: RefCell::new(Some(Recipe::Eqn(eqn.clone()))),
            })
        })
        .collect();
    *eqn.tracer_refs_out.borrow_mut() = outs.iter().map(Rc::downgrade).collect();
    Ok(outs.into_iter().map(Value::PartialEval).collect())
}

/// Assemble the Jaxpr of the unknown graph reachable from `outs`.
///
/// Returns the program and its hoisted constant values. `in_tracers`
/// become the trailing input binders; constants form the leading ones.
pub(crate) fn tracers_to_jaxpr(
    in_tracers: &[Rc<PeTracer>],
    outs: &[Value],
    level: usize,
) -> CoreResult<(Jaxpr, Vec<Value>)> {
    // collect the equation graph by pointer identity
    let mut eqn_index: HashMap<usize, Rc<EqnRecipe>> = HashMap::new();
    let mut roots: Vec<usize> = Vec::new();
    let mut register = |eqn: &Rc<EqnRecipe>,
                        index: &mut HashMap<usize, Rc<EqnRecipe>>|
     -> usize {
        let key = Rc::as_ptr(eqn) as usize;
        index.entry(key).or_insert_with(|| eqn.clone());
        key
    };
    for out in outs {
        if let Value::PartialEval(t) = out {
            if t.level == level {
                if let Some(Recipe::Eqn(eqn)) = &*t.recipe.borrow() {
                    roots.push(register(eqn, &mut eqn_index));
                }
            }
        }
    }
    // every reachable equation, via a worklist
    let mut pending = roots.clone();
    while let Some(key) = pending.pop() {
        let eqn = eqn_index[&key].clone();
        for t in &eqn.tracers_in {
            if let Some(Recipe::Eqn(parent)) = &*t.recipe.borrow() {
                let pkey = Rc::as_ptr(parent) as usize;
                if !eqn_index.contains_key(&pkey) {
                    register(parent, &mut eqn_index);
                    pending.push(pkey);
                }
            }
        }
    }
    // dependencies-first equation order
    let order = topo_sort(&roots, |key| {
        let eqn = &eqn_index[&key];
        eqn.tracers_in
            .iter()
            .filter_map(|t| match &*t.recipe.borrow() {
                Some(Recipe::Eqn(parent)) => Some(Rc::as_ptr(parent) as usize),
                _ => None,
            })
            .collect()
    });

    let mut vars: HashMap<usize, Var> = HashMap::new(); // tracer ptr -> var
    let const_vars: HashMap<usize, Var> = HashMap::new();
    let consts: Vec<Value> = Vec::new();
    let const_binders: Vec<Var> = Vec::new();
    let in_binders: Vec<Var> = in_tracers
        .iter()
        .map(|t| {
            let var = Var::fresh(t.aval.clone());
            vars.insert(Rc::as_ptr(t) as usize, var.clone());
            var
        })
        .collect();

    struct ConstPool {
        vars: HashMap<usize, Var>,
        binders: Vec<Var>,
        values: Vec<Value>,
    }
    let mut pool = ConstPool {
        vars: const_vars,
        binders: const_binders,
        values: consts,
    };

    fn atom_for(
        t: &Rc<PeTracer>,
        vars: &mut HashMap<usize, Var>,
        pool: &mut ConstPool,
    ) -> CoreResult<Atom> {
        let key = Rc::as_ptr(t) as usize;
        if let Some(var) = vars.get(&key) {
            return Ok(Atom::Var(var.clone()));
        }
        match &*t.recipe.borrow() {
            Some(Recipe::Const(value)) => {
                // scalar literals inline; everything else hoists
                if let Value::Lit(s) = value {
                    return Ok(Atom::lit(*s));
                }
                if let Some(var) = pool.vars.get(&key) {
                    return Ok(Atom::Var(var.clone()));
                }
                let var = Var::fresh(t.aval.clone());
                pool.vars.insert(key, var.clone());
                pool.binders.push(var.clone());
                pool.values.push(value.clone());
                Ok(Atom::Var(var))
            }
            Some(Recipe::Lambda) => Err(CoreError::Internal(
                "input tracer not among the program inputs".into(),
            )),
            Some(Recipe::Eqn(_)) => Err(CoreError::Internal(
                "equation output used before its equation".into(),
            )),
            None => Err(CoreError::Internal(
                "unknown tracer without a recipe".into(),
            )),
        }
    }

    let mut eqns: Vec<JaxprEqn> = Vec::new();
    for key in order {
        let eqn = &eqn_index[&key];
        let inputs = eqn
            .tracers_in
            .iter()
            .map(|t| atom_for(t, &mut vars, &mut pool))
            .collect::<CoreResult<Vec<_>>>()?;
        let out_binders: Vec<Var> = eqn
            .avals_out
            .iter()
            .zip(eqn.tracer_refs_out.borrow().iter())
            .map(|(aval, weak)| match weak.upgrade() {
                Some(t) => {
                    let var = Var::fresh(t.aval.clone());
                    vars.insert(Rc::as_ptr(&t) as usize, var.clone());
                    var
                }
                // the output died unused; bind a fresh dead var
                None => Var::fresh(aval.clone()),
            })
            .collect();
        eqns.push(JaxprEqn {
            prim: eqn.prim.clone(),
            inputs,
            out_binders,
        });
    }

    let out_atoms = outs
        .iter()
        .map(|out| match out {
            Value::PartialEval(t) if t.level == level => {
                // a known output hoists like any constant
                t.instantiate_const()?;
                atom_for(t, &mut vars, &mut pool)
            }
            Value::Lit(s) => Ok(Atom::lit(*s)),
            other => {
                // an output that never touched this trace (a captured
                // array, a lower tracer) becomes a hoisted constant
                let var = Var::fresh(other.aval());
                pool.binders.push(var.clone());
                pool.values.push(other.clone());
                Ok(Atom::Var(var))
            }
        })
        .collect::<CoreResult<Vec<_>>>()?;

    let mut all_binders = pool.binders;
    all_binders.extend(in_binders);
    let jaxpr = Jaxpr {
        in_binders: all_binders,
        eqns,
        outs: out_atoms,
    };
    jaxpr.typecheck()?;
    Ok((jaxpr, pool.values))
}

/// The linear map produced by `linearize`.
#[derive(Debug, Clone)]
pub struct LinearFn {
    jaxpr: Rc<Jaxpr>,
    consts: Vec<Value>,
}

impl LinearFn {
    /// Apply the linear map to tangent inputs.
    pub fn call(&self, tangents: &[Value]) -> CoreResult<Vec<Value>> {
        let mut args = self.consts.clone();
        args.extend(tangents.iter().cloned());
        self.jaxpr.eval(&args)
    }

    pub fn jaxpr(&self) -> &Jaxpr {
        &self.jaxpr
    }

    pub(crate) fn into_parts(self) -> (Rc<Jaxpr>, Vec<Value>) {
        (self.jaxpr, self.consts)
    }
}

/// Linearize `f` at `primals`: evaluate the primal outputs and capture
/// the tangent map as a Jaxpr.
pub fn linearize_flat<F>(f: F, primals: &[Value]) -> CoreResult<(Vec<Value>, LinearFn)>
where
    F: FnOnce(&[Value]) -> CoreResult<Vec<Value>>,
{
    let frame = new_main(TraceKind::PartialEval);
    let level = frame.level();
    let tangent_in: Vec<Rc<PeTracer>> = primals
        .iter()
        .map(|p| PeTracer::lambda(level, p.aval()))
        .collect();
    let tangent_values: Vec<Value> = tangent_in
        .iter()
        .map(|t| Value::PartialEval(t.clone()))
        .collect();
    let (primals_out, tangents_out) = jvp_flat(f, primals, &tangent_values)?;
    for p in &primals_out {
        if matches!(p, Value::PartialEval(t) if t.level == level && !t.is_known()) {
            return Err(CoreError::Internal(
                "primal output depends on tangent inputs".into(),
            ));
        }
    }
    let (jaxpr, consts) = tracers_to_jaxpr(&tangent_in, &tangents_out, level)?;
    drop(frame);
    Ok((
        primals_out,
        LinearFn {
            jaxpr: Rc::new(jaxpr),
            consts,
        },
    ))
}

/// Tree-structured `linearize`.
pub fn linearize<F>(
    f: F,
    primals: &Tree,
) -> CoreResult<(Tree, impl Fn(&Tree) -> CoreResult<Tree>)>
where
    F: Fn(&Tree) -> CoreResult<Tree>,
{
    let (primal_leaves, in_def) = flatten(primals);
    let out_def: RefCell<Option<TreeDef>> = RefCell::new(None);
    let (primals_out, lin) = linearize_flat(
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
        .ok_or_else(|| CoreError::Internal("linearize output structure not captured".into()))?;
    let primal_tree = unflatten(&def, primals_out)?;
    let lin_def = def;
    let lin_in_def = in_def;
    let lin_fn = move |tangents: &Tree| -> CoreResult<Tree> {
        let (leaves, def) = flatten(tangents);
        if def != lin_in_def {
            return Err(CoreError::TreeMismatch(
                "tangent tree does not match the primal structure".into(),
            ));
        }
        let outs = lin.call(&leaves)?;
        unflatten(&lin_def, outs)
    };
    Ok((primal_tree, lin_fn))
}
