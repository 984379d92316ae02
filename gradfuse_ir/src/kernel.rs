//! Kernel bundles and the tuning pass.
//!
//! A `Kernel` is a scalar program plus its output size: either a pure
//! elementwise kernel (one evaluation per output element, indexed by the
//! `gidx` loop variable) or a reduction kernel (one evaluation per
//! `(gidx, ridx)` pair, accumulated into the output element).
//!
//! Tuning turns a kernel into the form a backend consumes: loop variables
//! are enumerated explicitly and every `GlobalView` is lowered to a
//! `GlobalIndex` read guarded by its validity bit.

use serde::{Deserialize, Serialize};

use crate::alu::{AluArg, AluExp, AluOp};
use crate::dtype::{DType, Scalar};
use crate::error::IrError;
use crate::IrResult;

/// Name of the per-output-element loop variable.
pub const GIDX: &str = "gidx";
/// Name of the per-reduction-element loop variable.
pub const RIDX: &str = "ridx";

/// Accumulation operator of a reduction kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Add,
    Max,
}

impl ReduceOp {
    /// Identity element of the accumulation.
    pub fn init(self, dtype: DType) -> Scalar {
        match self {
            ReduceOp::Add => Scalar::zero(dtype),
            ReduceOp::Max => match dtype {
                DType::Float32 => Scalar::F32(f32::NEG_INFINITY),
                DType::Int32 => Scalar::I32(i32::MIN),
                DType::Uint32 => Scalar::U32(0),
                DType::Bool => Scalar::Bool(false),
                DType::Complex64 => Scalar::zero(dtype),
            },
        }
    }
}

/// Reduction descriptor: accumulate `size` evaluations per output element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reduction {
    pub dtype: DType,
    pub op: ReduceOp,
    pub size: usize,
}

/// An untuned kernel: `(nargs, size, exp, reduction?)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Kernel {
    /// Number of input buffers the expression reads (`gid` in
    /// `0..nargs`).
    pub nargs: usize,
    /// Number of output elements.
    pub size: usize,
    /// Body; references `gidx` (and `ridx` for reductions).
    pub exp: AluExp,
    pub reduction: Option<Reduction>,
}

/// A named loop variable a tuned kernel iterates over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpecialVar {
    pub name: String,
    pub bound: usize,
}

/// A kernel after tuning: the expression references only constants, the
/// listed loop variables, and `GlobalIndex` reads from the input slots in
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunedKernel {
    pub nargs: usize,
    pub size: usize,
    pub exp: AluExp,
    pub reduction: Option<Reduction>,
    pub loop_vars: Vec<SpecialVar>,
}

impl TunedKernel {
    /// Output element dtype: the accumulator dtype for reductions, the
    /// expression dtype otherwise.
    pub fn out_dtype(&self) -> DType {
        match &self.reduction {
            Some(r) => r.dtype,
            None => self.exp.dtype(),
        }
    }
}

/// Lower one `GlobalView` to a guarded `GlobalIndex` read.
fn lower_view(exp: &AluExp) -> IrResult<Option<AluExp>> {
    let AluArg::View { gid, tracker } = exp.arg() else {
        return Ok(None);
    };
    let (offset, valid) = tracker.to_alu_exp(exp.src())?;
    let read = AluExp::global_index(*gid, offset, exp.dtype())?;
    let lowered = if valid.resolve().and_then(Scalar::as_bool) == Some(true) {
        read
    } else {
        // out-of-mask reads produce zero
        AluExp::where_(valid, read, AluExp::constant(Scalar::zero(exp.dtype())))?
    };
    Ok(Some(lowered))
}

/// The null tuner: no dimension splitting. Lowers every `GlobalView` into
/// `GlobalIndex` through its tracker and reports the `gidx`/`ridx` loop
/// variables unchanged.
pub fn tune_null(kernel: &Kernel) -> IrResult<TunedKernel> {
    let mut failure: Option<IrError> = None;
    let exp = kernel.exp.rewrite(&mut |e| {
        if failure.is_some() {
            return None;
        }
        match lower_view(e) {
            Ok(replacement) => replacement,
            Err(err) => {
                failure = Some(err);
                None
            }
        }
    })?;
    if let Some(err) = failure {
        return Err(err);
    }

    let mut loop_vars = vec![SpecialVar {
        name: GIDX.to_string(),
        bound: kernel.size,
    }];
    if let Some(r) = &kernel.reduction {
        loop_vars.push(SpecialVar {
            name: RIDX.to_string(),
            bound: r.size,
        });
    }

    // a tuned kernel must not retain any abstract buffer read
    if !exp.collect(&|e| e.op() == AluOp::GlobalView).is_empty() {
        return Err(IrError::Eval("tuning left an unlowered GlobalView".into()));
    }

    Ok(TunedKernel {
        nargs: kernel.nargs,
        size: kernel.size,
        exp,
        reduction: kernel.reduction,
        loop_vars,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ShapeTracker;

    #[test]
    fn test_tune_lowers_views() {
        let tracker = ShapeTracker::contiguous(&[2, 3]);
        let gidx = AluExp::special(GIDX, 6);
        let indices = crate::tracker::unravel_alu(&[2, 3], gidx).unwrap();
        let exp = AluExp::global_view(0, tracker, indices, DType::Float32).unwrap();
        let kernel = Kernel {
            nargs: 1,
            size: 6,
            exp,
            reduction: None,
        };
        let tuned = tune_null(&kernel).unwrap();
        assert!(tuned
            .exp
            .collect(&|e| e.op() == AluOp::GlobalView)
            .is_empty());
        assert_eq!(
            tuned
                .exp
                .collect(&|e| e.op() == AluOp::GlobalIndex)
                .len(),
            1
        );
        assert_eq!(tuned.loop_vars.len(), 1);
        assert_eq!(tuned.loop_vars[0].name, GIDX);
        assert_eq!(tuned.loop_vars[0].bound, 6);
    }

    #[test]
    fn test_contiguous_view_lowers_to_bare_read() {
        // no mask, in-range indices: the validity bit folds to true and
        // the Where disappears
        let tracker = ShapeTracker::contiguous(&[4]);
        let gidx = AluExp::special(GIDX, 4);
        let exp =
            AluExp::global_view(0, tracker, vec![gidx], DType::Float32).unwrap();
        let kernel = Kernel {
            nargs: 1,
            size: 4,
            exp,
            reduction: None,
        };
        let tuned = tune_null(&kernel).unwrap();
        assert_eq!(tuned.exp.op(), AluOp::GlobalIndex);
    }

    #[test]
    fn test_reduction_reports_ridx() {
        let tracker = ShapeTracker::contiguous(&[8]);
        let ridx = AluExp::special(RIDX, 8);
        let exp = AluExp::global_view(0, tracker, vec![ridx], DType::Float32).unwrap();
        let kernel = Kernel {
            nargs: 1,
            size: 1,
            exp,
            reduction: Some(Reduction {
                dtype: DType::Float32,
                op: ReduceOp::Add,
                size: 8,
            }),
        };
        let tuned = tune_null(&kernel).unwrap();
        let names: Vec<&str> = tuned.loop_vars.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec![GIDX, RIDX]);
    }
}
