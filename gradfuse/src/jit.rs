//! The JIT compiler: Jaxpr to a fused kernel schedule.
//!
//! Compilation flattens nested calls, simplifies, decides fusion by
//! dataflow ("black" equations materialize to buffers, everything else
//! fuses into its consumer), and emits a linear step program of
//! `Malloc` / `ConstBind` / `Execute` / `Free`. Programs are cached per
//! backend by the Jaxpr fingerprint plus the constant slot ids.
//!
//! Cache behavior is configurable the usual way:
//! - `GRADFUSE_DISABLE_JIT_CACHE` bypasses the cache entirely
//! - `GRADFUSE_JIT_DEBUG` logs compile/cache events to stderr

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::env;
use std::rc::Rc;

use gradfuse_backend::Backend;
use gradfuse_ir::{tune_null, Scalar, ShapeTracker, TunedKernel};

use crate::array::{default_backend, Array};
use crate::aval::ShapedArray;
use crate::error::{CoreError, CoreResult};
use crate::fuse::{self, Source};
use crate::jaxpr::{Atom, Jaxpr};
use crate::partial_eval::{tracers_to_jaxpr, PeTracer};
use crate::primitives::Primitive;
use crate::trace::{bind, new_main, set_dynamic, TraceKind};
use crate::value::Value;

fn cache_disabled() -> bool {
    env::var("GRADFUSE_DISABLE_JIT_CACHE").is_ok()
}

fn should_log() -> bool {
    env::var("GRADFUSE_JIT_DEBUG").is_ok()
}

fn log_jit(msg: &str) {
    if should_log() {
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), "{msg}");
    }
}

/// One playback step of a compiled program.
#[derive(Debug, Clone)]
pub enum Step {
    /// Allocate the buffer for `id`.
    Malloc { id: usize, byte_size: usize },
    /// Bind `id` to the program's `index`-th constant slot.
    ConstBind { id: usize, index: usize },
    /// Dispatch one kernel reading `inputs` and writing `output`.
    Execute {
        kernel: TunedKernel,
        inputs: Vec<usize>,
        output: usize,
    },
    /// Release an intermediate after its last use.
    Free { id: usize },
}

#[derive(Debug, Clone)]
enum ProgramOut {
    Buffer { id: usize },
    Literal(Scalar),
}

/// A compiled, replayable kernel schedule.
#[derive(Debug)]
pub struct JitProgram {
    steps: Vec<Step>,
    consts: Vec<Array>,
    num_inputs: usize,
    in_avals: Vec<ShapedArray>,
    outs: Vec<ProgramOut>,
    out_avals: Vec<ShapedArray>,
    backend: Rc<dyn Backend>,
}

impl JitProgram {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of kernel dispatches in the schedule.
    pub fn execute_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Step::Execute { .. }))
            .count()
    }

    pub fn out_avals(&self) -> &[ShapedArray] {
        &self.out_avals
    }

    /// Play the schedule back over concrete inputs.
    pub fn execute(&self, inputs: &[Array]) -> CoreResult<Vec<Array>> {
        if inputs.len() != self.num_inputs {
            return Err(CoreError::Type(format!(
                "compiled program expects {} inputs, got {}",
                self.num_inputs,
                inputs.len()
            )));
        }
        for (input, aval) in inputs.iter().zip(&self.in_avals) {
            if input.aval() != *aval {
                return Err(CoreError::Type(format!(
                    "compiled program input {} does not match {}",
                    input.aval(),
                    aval
                )));
            }
        }
        let materialized = inputs
            .iter()
            .map(Array::contiguous)
            .collect::<CoreResult<Vec<_>>>()?;

        let mut slots: HashMap<usize, gradfuse_backend::Slot> = HashMap::new();
        for (index, c) in self.consts.iter().enumerate() {
            slots.insert(index, c.slot());
        }
        for (j, input) in materialized.iter().enumerate() {
            slots.insert(self.consts.len() + j, input.slot());
        }

        let mut live_temps: HashMap<usize, gradfuse_backend::Slot> = HashMap::new();
        let cleanup = |backend: &Rc<dyn Backend>,
                       live: &mut HashMap<usize, gradfuse_backend::Slot>| {
            for (_, slot) in live.drain() {
                let _ = backend.dec_ref(slot);
            }
        };

        let mut run = || -> CoreResult<()> {
            for step in &self.steps {
                match step {
                    Step::Malloc { id, byte_size } => {
                        let slot = self.backend.malloc(*byte_size, None)?;
                        slots.insert(*id, slot);
                        live_temps.insert(*id, slot);
                    }
                    Step::ConstBind { .. } => {
                        // constant slots were bound above; the step exists
                        // so the schedule is self-describing
                    }
                    Step::Execute {
                        kernel,
                        inputs,
                        output,
                    } => {
                        let in_slots = inputs
                            .iter()
                            .map(|id| {
                                slots.get(id).copied().ok_or_else(|| {
                                    CoreError::Internal(format!("step reads unbound id {id}"))
                                })
                            })
                            .collect::<CoreResult<Vec<_>>>()?;
                        let out_slot = slots.get(output).copied().ok_or_else(|| {
                            CoreError::Internal(format!("step writes unbound id {output}"))
                        })?;
                        // dispatches run in emit order; the reference
                        // backend completes each before returning
                        self.backend
                            .execute(kernel, &in_slots, &[out_slot], None)
                            .wait()?;
                    }
                    Step::Free { id } => {
                        if let Some(slot) = live_temps.remove(id) {
                            self.backend.dec_ref(slot)?;
                        }
                    }
                }
            }
            Ok(())
        };
        if let Err(err) = run() {
            cleanup(&self.backend, &mut live_temps);
            return Err(err);
        }

        let mut wrap = || -> CoreResult<Vec<Array>> {
            let mut outputs = Vec::with_capacity(self.outs.len());
            for (out, aval) in self.outs.iter().zip(&self.out_avals) {
                let array = match out {
                    ProgramOut::Buffer { id } => {
                        let slot = slots.get(id).copied().ok_or_else(|| {
                            CoreError::Internal(format!("output reads unbound id {id}"))
                        })?;
                        self.backend.inc_ref(slot)?;
                        Array::from_owned_slot(
                            slot,
                            aval.dtype,
                            ShapeTracker::contiguous(&aval.shape),
                            self.backend.clone(),
                        )
                    }
                    ProgramOut::Literal(s) => {
                        Array::from_scalars_on(&[*s], &[], self.backend.clone())?
                    }
                };
                outputs.push(array);
            }
            Ok(outputs)
        };
        let outputs = wrap();
        // temps that were not freed by a Free step back an output and are
        // owned by it now; release the schedule's own reference either way
        cleanup(&self.backend, &mut live_temps);
        outputs
    }
}

type CacheKey = (&'static str, u64, Vec<u64>);

thread_local! {
    /// Thread-local compile cache; entries live for the process.
    static PROGRAM_CACHE: RefCell<HashMap<CacheKey, Rc<JitProgram>>> =
        RefCell::new(HashMap::new());
}

/// Record `f` as a Jaxpr by tracing it on all-unknown inputs of the
/// given avals. Returns the program and its hoisted constants.
pub fn make_jaxpr<F>(f: F, in_avals: &[ShapedArray]) -> CoreResult<(Jaxpr, Vec<Value>)>
where
    F: FnOnce(&[Value]) -> CoreResult<Vec<Value>>,
{
    let frame = new_main(TraceKind::PartialEval);
    let level = frame.level();
    let _dynamic = set_dynamic(level);
    let in_tracers: Vec<Rc<PeTracer>> = in_avals
        .iter()
        .map(|aval| PeTracer::lambda(level, aval.clone()))
        .collect();
    let args: Vec<Value> = in_tracers
        .iter()
        .map(|t| Value::PartialEval(t.clone()))
        .collect();
    let outs = f(&args)?;
    tracers_to_jaxpr(&in_tracers, &outs, level)
}

/// Wrap `f` for tracing and compilation: the call site stages a
/// `jit_call` under an active transformation, and compiles and runs
/// immediately at the eval level.
pub fn jit<F>(f: F) -> impl Fn(&[Value]) -> CoreResult<Vec<Value>>
where
    F: Fn(&[Value]) -> CoreResult<Vec<Value>>,
{
    move |args: &[Value]| {
        let in_avals: Vec<ShapedArray> = args.iter().map(Value::aval).collect();
        let (jaxpr, consts) = make_jaxpr(|vals| f(vals), &in_avals)?;
        let num_consts = consts.len();
        let mut all_args = consts;
        all_args.extend(args.iter().cloned());
        bind(
            Primitive::JitCall {
                jaxpr: Rc::new(jaxpr),
                num_consts,
            },
            &all_args,
        )
    }
}

/// Eval-level execution of a `jit_call`: compile (or hit the cache) and
/// run.
pub(crate) fn compile_and_run(
    jaxpr: &Rc<Jaxpr>,
    num_consts: usize,
    args: &[Value],
) -> CoreResult<Vec<Value>> {
    let consts = args[..num_consts]
        .iter()
        .map(Value::to_array)
        .collect::<CoreResult<Vec<_>>>()?;
    let inputs = args[num_consts..]
        .iter()
        .map(Value::to_array)
        .collect::<CoreResult<Vec<_>>>()?;
    let backend = inputs
        .first()
        .or_else(|| consts.first())
        .map(|a| a.backend().clone())
        .unwrap_or_else(default_backend);
    let program = compile(jaxpr, &consts, backend)?;
    let outs = program.execute(&inputs)?;
    Ok(outs.into_iter().map(Value::Concrete).collect())
}

/// Compile a Jaxpr for a backend, with caching.
pub fn compile(
    jaxpr: &Jaxpr,
    consts: &[Array],
    backend: Rc<dyn Backend>,
) -> CoreResult<Rc<JitProgram>> {
    let key: CacheKey = (
        backend.kind(),
        jaxpr.fingerprint(),
        consts.iter().map(|c| c.slot().id()).collect(),
    );
    if !cache_disabled() {
        let hit = PROGRAM_CACHE.with(|cache| cache.borrow().get(&key).cloned());
        if let Some(program) = hit {
            log_jit(&format!("[jit] cache hit for {:016x}", key.1));
            return Ok(program);
        }
    }
    log_jit(&format!("[jit] compiling {:016x}", key.1));
    let program = Rc::new(compile_uncached(jaxpr, consts, backend)?);
    if !cache_disabled() {
        PROGRAM_CACHE.with(|cache| {
            cache.borrow_mut().insert(key, program.clone());
        });
    }
    Ok(program)
}

fn compile_uncached(
    jaxpr: &Jaxpr,
    consts: &[Array],
    backend: Rc<dyn Backend>,
) -> CoreResult<JitProgram> {
    let jaxpr = jaxpr.flatten()?.simplify()?;
    jaxpr.typecheck()?;
    let num_consts = consts.len();
    if num_consts > jaxpr.in_binders.len() {
        return Err(CoreError::Internal(
            "more constants than input binders".into(),
        ));
    }
    let num_inputs = jaxpr.in_binders.len() - num_consts;
    let black = black_set(&jaxpr);

    let mut steps: Vec<Step> = Vec::new();
    let mut env: HashMap<u32, Source> = HashMap::new();
    for (i, binder) in jaxpr.in_binders.iter().enumerate() {
        if i < num_consts {
            steps.push(Step::ConstBind { id: i, index: i });
        }
        env.insert(
            binder.id,
            Source::Buffer {
                id: i,
                tracker: ShapeTracker::contiguous(&binder.aval.shape),
                dtype: binder.aval.dtype,
            },
        );
    }
    let mut next_id = jaxpr.in_binders.len();

    for (i, eqn) in jaxpr.eqns.iter().enumerate() {
        let sources: Vec<Source> = eqn
            .inputs
            .iter()
            .map(|atom| match atom {
                Atom::Lit(l) => Ok(Source::Const(l.value)),
                Atom::Var(v) => env.get(&v.id).cloned().ok_or_else(|| {
                    CoreError::Internal(format!("unbound variable v{} during emit", v.id))
                }),
            })
            .collect::<CoreResult<Vec<_>>>()?;

        let (result, reduction) = match &eqn.prim {
            Primitive::ReduceSum { axes } => {
                let (fused, reduction) = fuse::reduce_sum(&sources[0], axes)?;
                (Source::Fused(fused), Some(reduction))
            }
            p if p.is_view_op() => (fuse::view(p, &sources[0])?, None),
            p if p.is_elementwise() => {
                (Source::Fused(fuse::elementwise(p, &sources)?), None)
            }
            Primitive::RandomBits { .. } => {
                return Err(CoreError::Type(
                    "random_bits is not supported under jit".into(),
                ));
            }
            Primitive::JitCall { .. } => {
                return Err(CoreError::Internal(
                    "nested jit_call survived flattening".into(),
                ));
            }
            other => {
                return Err(CoreError::Internal(format!(
                    "no jit rule for {}",
                    other.name()
                )));
            }
        };

        if black[i] || reduction.is_some() {
            let fused = fuse::to_fused(&result)?;
            let kernel = fuse::finalize(&fused, reduction)?;
            let tuned = tune_null(&kernel)?;
            let out_dtype = tuned.out_dtype();
            let id = next_id;
            next_id += 1;
            steps.push(Step::Malloc {
                id,
                byte_size: kernel.size * out_dtype.size_in_bytes(),
            });
            steps.push(Step::Execute {
                kernel: tuned,
                inputs: fused.args.clone(),
                output: id,
            });
            env.insert(
                eqn.out_binders[0].id,
                Source::Buffer {
                    id,
                    tracker: ShapeTracker::contiguous(&eqn.out_binders[0].aval.shape),
                    dtype: out_dtype,
                },
            );
        } else {
            env.insert(eqn.out_binders[0].id, result);
        }
    }

    // program outputs
    let mut outs = Vec::with_capacity(jaxpr.outs.len());
    let mut out_ids: HashSet<usize> = HashSet::new();
    let out_avals: Vec<ShapedArray> = jaxpr.outs.iter().map(Atom::aval).collect();
    for atom in &jaxpr.outs {
        match atom {
            Atom::Lit(l) => outs.push(ProgramOut::Literal(l.value)),
            Atom::Var(v) => match env.get(&v.id) {
                Some(Source::Buffer { id, .. }) => {
                    out_ids.insert(*id);
                    outs.push(ProgramOut::Buffer { id: *id });
                }
                _ => {
                    return Err(CoreError::Internal(format!(
                        "program output v{} was not materialized",
                        v.id
                    )));
                }
            },
        }
    }

    // free each intermediate after its last consuming dispatch
    let first_temp = jaxpr.in_binders.len();
    let mut last_use: HashMap<usize, usize> = HashMap::new();
    for (s, step) in steps.iter().enumerate() {
        if let Step::Execute { inputs, .. } = step {
            for &id in inputs {
                last_use.insert(id, s);
            }
        }
    }
    let mut with_frees: Vec<Step> = Vec::with_capacity(steps.len());
    for (s, step) in steps.into_iter().enumerate() {
        with_frees.push(step);
        let freed: Vec<usize> = last_use
            .iter()
            .filter(|&(&id, &at)| at == s && id >= first_temp && !out_ids.contains(&id))
            .map(|(&id, _)| id)
            .collect();
        for id in freed {
            last_use.remove(&id);
            with_frees.push(Step::Free { id });
        }
    }

    Ok(JitProgram {
        steps: with_frees,
        consts: consts.to_vec(),
        num_inputs,
        in_avals: jaxpr.in_binders[num_consts..]
            .iter()
            .map(|b| b.aval.clone())
            .collect(),
        outs,
        out_avals,
        backend,
    })
}

/// Decide which equations materialize.
///
/// Black equations: reductions, producers of program outputs, and any
/// equation whose output reaches two or more distinct black successors
/// through fuseable equations (its value would otherwise be recomputed
/// per consumer).
fn black_set(jaxpr: &Jaxpr) -> Vec<bool> {
    let n = jaxpr.eqns.len();
    let mut black = vec![false; n];

    let mut producer: HashMap<u32, usize> = HashMap::new();
    for (i, eqn) in jaxpr.eqns.iter().enumerate() {
        for binder in &eqn.out_binders {
            producer.insert(binder.id, i);
        }
        if matches!(eqn.prim, Primitive::ReduceSum { .. }) {
            black[i] = true;
        }
    }
    for out in &jaxpr.outs {
        if let Atom::Var(v) = out {
            if let Some(&i) = producer.get(&v.id) {
                black[i] = true;
            }
        }
    }
    // successors of each equation
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, eqn) in jaxpr.eqns.iter().enumerate() {
        for atom in &eqn.inputs {
            if let Atom::Var(v) = atom {
                if let Some(&p) = producer.get(&v.id) {
                    consumers[p].push(i);
                }
            }
        }
    }
    // right-to-left: the set of black successors reachable through
    // fuseable equations; two or more forces materialization
    let mut reach: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    for i in (0..n).rev() {
        let mut reached: HashSet<usize> = HashSet::new();
        for &c in &consumers[i] {
            if black[c] {
                reached.insert(c);
            } else {
                reached.extend(reach[c].iter().copied());
            }
        }
        if !black[i] && reached.len() >= 2 {
            black[i] = true;
        }
        reach[i] = if black[i] {
            let mut only_self = HashSet::new();
            only_self.insert(i);
            only_self
        } else {
            reached
        };
    }
    black
}
