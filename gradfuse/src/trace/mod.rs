//! The trace stack and primitive dispatch.
//!
//! A process-wide (thread-local) stack of active traces interprets every
//! primitive application. The bottom frame is the eval trace; transforms
//! push a frame for their dynamic extent and pop it on every exit path
//! (the `FrameGuard` RAII type makes that structural, including unwind).
//!
//! `bind` is the single dispatch point: it finds the topmost relevant
//! trace for the arguments, raises every argument into that trace, and
//! hands the application to the trace kind's `process` rule.

pub(crate) mod eval;

use std::cell::{Cell, RefCell};

use crate::error::{CoreError, CoreResult};
use crate::primitives::Primitive;
use crate::value::Value;

/// The interpretation a trace frame applies to primitives.
///
/// `jit` tracing is partial evaluation on all-unknown inputs marked as
/// the dynamic trace, so it needs no kind of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TraceKind {
    Eval,
    Jvp,
    PartialEval,
}

/// One frame of the trace stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MainTrace {
    pub level: usize,
    pub kind: TraceKind,
}

thread_local! {
    static TRACE_STACK: RefCell<Vec<MainTrace>> = RefCell::new(vec![MainTrace {
        level: 0,
        kind: TraceKind::Eval,
    }]);
    static DYNAMIC_LEVEL: Cell<Option<usize>> = const { Cell::new(None) };
}

/// RAII handle for a pushed trace frame; dropping pops it.
#[derive(Debug)]
pub(crate) struct FrameGuard {
    level: usize,
}

impl FrameGuard {
    pub fn level(&self) -> usize {
        self.level
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        TRACE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let popped = stack.pop();
            debug_assert_eq!(
                popped.map(|t| t.level),
                Some(self.level),
                "trace frames must pop in push order"
            );
        });
    }
}

/// Push a new trace frame. The frame lives until the guard drops.
pub(crate) fn new_main(kind: TraceKind) -> FrameGuard {
    TRACE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let level = stack.len();
        stack.push(MainTrace { level, kind });
        FrameGuard { level }
    })
}

/// RAII handle marking a frame as the dynamic trace (set by `jit` while
/// staging); restores the previous marker on drop.
#[derive(Debug)]
pub(crate) struct DynamicGuard {
    previous: Option<usize>,
}

impl Drop for DynamicGuard {
    fn drop(&mut self) {
        DYNAMIC_LEVEL.with(|d| d.set(self.previous));
    }
}

pub(crate) fn set_dynamic(level: usize) -> DynamicGuard {
    DYNAMIC_LEVEL.with(|d| {
        let previous = d.replace(Some(level));
        DynamicGuard { previous }
    })
}

pub(crate) fn current_dynamic() -> Option<usize> {
    DYNAMIC_LEVEL.with(|d| d.get())
}

fn frame_at(level: usize) -> CoreResult<MainTrace> {
    TRACE_STACK.with(|stack| {
        stack.borrow().get(level).copied().ok_or_else(|| {
            CoreError::Type(format!(
                "tracer from an exited trace (level {level}) escaped its scope"
            ))
        })
    })
}

/// The trace that interprets an application: the highest trace among the
/// argument tracers, or the dynamic trace when it sits higher.
pub(crate) fn find_top_trace(args: &[Value]) -> CoreResult<MainTrace> {
    let mut level = args.iter().map(Value::level).max().unwrap_or(0);
    if let Some(dynamic) = current_dynamic() {
        if dynamic > level {
            level = dynamic;
        }
    }
    frame_at(level)
}

/// Bring `value` into `trace`: unchanged at the same level, boxed via the
/// trace's pure/lift rule from below, an error from above.
pub(crate) fn full_raise(trace: MainTrace, value: &Value) -> CoreResult<Value> {
    let level = value.level();
    if level > trace.level {
        return Err(CoreError::Type(format!(
            "tracer of level {level} escaped into a level-{} trace",
            trace.level
        )));
    }
    if level == trace.level && level > 0 {
        let kind_matches = matches!(
            (&trace.kind, value),
            (TraceKind::Jvp, Value::Jvp(_)) | (TraceKind::PartialEval, Value::PartialEval(_))
        );
        if !kind_matches {
            return Err(CoreError::Internal(format!(
                "different tracers at level {level}"
            )));
        }
        return Ok(value.clone());
    }
    // level 0 data, or a lower-level tracer: lift via the trace's pure rule
    match trace.kind {
        TraceKind::Eval => Ok(value.clone()),
        TraceKind::Jvp => crate::jvp::lift(trace.level, value),
        TraceKind::PartialEval => crate::partial_eval::lift(trace.level, value),
    }
}

/// Dispatch a primitive application through the top trace.
pub fn bind(prim: Primitive, args: &[Value]) -> CoreResult<Vec<Value>> {
    let top = find_top_trace(args)?;
    let raised = args
        .iter()
        .map(|a| full_raise(top, a))
        .collect::<CoreResult<Vec<_>>>()?;
    match top.kind {
        TraceKind::Eval => eval::process(&prim, &raised),
        TraceKind::Jvp => crate::jvp::process(top.level, &prim, &raised),
        TraceKind::PartialEval => crate::partial_eval::process(top.level, &prim, &raised),
    }
}

/// `bind` for single-output primitives.
pub fn bind1(prim: Primitive, args: &[Value]) -> CoreResult<Value> {
    let mut outs = bind(prim, args)?;
    match outs.len() {
        1 => Ok(outs.remove(0)),
        n => Err(CoreError::Internal(format!(
            "expected a single output, got {n}"
        ))),
    }
}
