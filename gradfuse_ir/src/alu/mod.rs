//! The scalar expression IR (`AluExp`).
//!
//! An `AluExp` is an immutable algebraic term `(op, dtype, src[], arg?)`.
//! Constructors validate dtypes and perform local peephole simplification
//! (constant folding, identities, interval tightening), so an expression is
//! simplified by construction and rebuilding a term re-simplifies it.
//!
//! Terms are shared through `Rc` and compared structurally; sharing is safe
//! because every node is immutable after construction.
//!
//! # Module structure
//!
//! - `mod`: node type, constructors, interval propagation
//! - `transform`: `substitute`, `rewrite`, `collect`, `reindex_gids`
//! - `eval`: reference interpreter and per-op scalar semantics

mod eval;
mod transform;
#[cfg(test)]
mod tests;

pub use eval::{binary_scalar, compare_scalar, unary_scalar, BufferReader, NoBuffers};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::dtype::{DType, Scalar};
use crate::error::IrError;
use crate::tracker::ShapeTracker;
use crate::IrResult;

/// Operation tag of an expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    // binary arithmetic, dtype-preserving
    Add,
    Sub,
    Mul,
    Idiv,
    Mod,
    // float-only unary
    Neg,
    Sin,
    Cos,
    Exp,
    Log,
    Sqrt,
    Reciprocal,
    // comparisons, produce bool
    Cmplt,
    Cmpeq,
    Cmpne,
    // ternary select
    Where,
    // leaves
    Const,
    Special,
    // buffer reads: logical (pre-lowering) and physical (post-lowering)
    GlobalView,
    GlobalIndex,
}

/// Non-child payload of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AluArg {
    None,
    /// Literal value of a `Const` node.
    Const(Scalar),
    /// Named loop variable with a known exclusive upper bound.
    Special { name: String, bound: usize },
    /// Abstract read from input buffer `gid` through a view; the logical
    /// index vector lives in `src`.
    View { gid: usize, tracker: ShapeTracker },
    /// Physical read from input buffer `gid`; the offset expression is
    /// `src[0]`.
    Global { gid: usize },
}

#[derive(Debug)]
pub(crate) struct AluNode {
    op: AluOp,
    dtype: DType,
    src: Vec<AluExp>,
    arg: AluArg,
    /// Inclusive value interval, when one is known. `None` means unbounded
    /// or unordered (complex).
    range: Option<(f64, f64)>,
}

/// An immutable, structurally-shared scalar expression.
#[derive(Clone)]
pub struct AluExp(Rc<AluNode>);

impl fmt::Debug for AluExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl PartialEq for AluExp {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        self.0.op == other.0.op
            && self.0.dtype == other.0.dtype
            && self.0.arg == other.0.arg
            && self.0.src == other.0.src
    }
}

impl Eq for AluExp {}

impl Hash for AluExp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.op.hash(state);
        self.0.dtype.hash(state);
        self.0.arg.hash(state);
        for s in &self.0.src {
            s.hash(state);
        }
    }
}

impl AluExp {
    // ---------- accessors ----------

    pub fn op(&self) -> AluOp {
        self.0.op
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn src(&self) -> &[AluExp] {
        &self.0.src
    }

    pub fn arg(&self) -> &AluArg {
        &self.0.arg
    }

    /// Smallest value this expression can take, when known.
    pub fn min(&self) -> Option<f64> {
        self.0.range.map(|(lo, _)| lo)
    }

    /// Largest value this expression can take, when known.
    pub fn max(&self) -> Option<f64> {
        self.0.range.map(|(_, hi)| hi)
    }

    /// The literal value iff this is a `Const` node.
    pub fn resolve(&self) -> Option<Scalar> {
        match &self.0.arg {
            AluArg::Const(s) if self.0.op == AluOp::Const => Some(*s),
            _ => None,
        }
    }

    fn is_const_value(&self, v: f64) -> bool {
        self.resolve().and_then(Scalar::as_f64) == Some(v)
    }

    // ---------- leaf constructors ----------

    fn build(op: AluOp, dtype: DType, src: Vec<AluExp>, arg: AluArg) -> AluExp {
        let range = compute_range(op, dtype, &src, &arg);
        AluExp(Rc::new(AluNode {
            op,
            dtype,
            src,
            arg,
            range,
        }))
    }

    /// Literal constant.
    pub fn constant(value: Scalar) -> AluExp {
        let dtype = value.dtype();
        Self::build(AluOp::Const, dtype, vec![], AluArg::Const(value))
    }

    pub fn f32(v: f32) -> AluExp {
        Self::constant(Scalar::F32(v))
    }

    /// An `int32` index constant. Sizes and offsets all fit in `i32`.
    pub fn index(v: i64) -> AluExp {
        Self::constant(Scalar::I32(v as i32))
    }

    pub fn bool_const(v: bool) -> AluExp {
        Self::constant(Scalar::Bool(v))
    }

    /// Named loop variable over `0..bound`, dtype `int32`.
    pub fn special(name: impl Into<String>, bound: usize) -> AluExp {
        Self::build(
            AluOp::Special,
            DType::Int32,
            vec![],
            AluArg::Special {
                name: name.into(),
                bound,
            },
        )
    }

    /// Abstract read of buffer `gid` at logical position `indices` through
    /// `tracker`. Evaluates to zero wherever the view is masked out.
    pub fn global_view(
        gid: usize,
        tracker: ShapeTracker,
        indices: Vec<AluExp>,
        dtype: DType,
    ) -> IrResult<AluExp> {
        if indices.len() != tracker.ndim() {
            return Err(IrError::Shape(format!(
                "GlobalView with {} indices into a {}-d view",
                indices.len(),
                tracker.ndim()
            )));
        }
        for idx in &indices {
            if idx.dtype() != DType::Int32 {
                return Err(IrError::Type(format!(
                    "GlobalView index must be int32, got {}",
                    idx.dtype()
                )));
            }
        }
        Ok(Self::build(
            AluOp::GlobalView,
            dtype,
            indices,
            AluArg::View { gid, tracker },
        ))
    }

    /// Physical read of buffer `gid` at element offset `offset`.
    pub fn global_index(gid: usize, offset: AluExp, dtype: DType) -> IrResult<AluExp> {
        if offset.dtype() != DType::Int32 {
            return Err(IrError::Type(format!(
                "GlobalIndex offset must be int32, got {}",
                offset.dtype()
            )));
        }
        Ok(Self::build(
            AluOp::GlobalIndex,
            dtype,
            vec![offset],
            AluArg::Global { gid },
        ))
    }

    // ---------- binary arithmetic ----------

    /// Binary arithmetic node. The result dtype is the first operand's
    /// (lenient mixed-dtype behavior); constants fold eagerly.
    pub fn binary(op: AluOp, a: AluExp, b: AluExp) -> IrResult<AluExp> {
        debug_assert!(matches!(
            op,
            AluOp::Add | AluOp::Sub | AluOp::Mul | AluOp::Idiv | AluOp::Mod
        ));
        let dtype = a.dtype();
        if matches!(op, AluOp::Idiv | AluOp::Mod) && !dtype.is_numeric() {
            return Err(IrError::Type(format!("{op:?} is not defined on {dtype}")));
        }
        if matches!(op, AluOp::Idiv | AluOp::Mod) && dtype == DType::Complex64 {
            return Err(IrError::Type(format!("{op:?} is not defined on {dtype}")));
        }

        // constant folding
        if let (Some(x), Some(y)) = (a.resolve(), b.resolve()) {
            return Ok(Self::constant(binary_scalar(op, dtype, x, y)?));
        }

        // identities
        match op {
            AluOp::Add => {
                if b.is_const_value(0.0) {
                    return Ok(a);
                }
                if a.is_const_value(0.0) {
                    return Ok(b.cast_like(dtype));
                }
            }
            AluOp::Sub => {
                if b.is_const_value(0.0) {
                    return Ok(a);
                }
            }
            AluOp::Mul => {
                if b.is_const_value(1.0) {
                    return Ok(a);
                }
                if a.is_const_value(1.0) {
                    return Ok(b.cast_like(dtype));
                }
                if a.is_const_value(0.0) || b.is_const_value(0.0) {
                    return Ok(Self::constant(Scalar::zero(dtype)));
                }
            }
            AluOp::Idiv => {
                if b.is_const_value(1.0) {
                    return Ok(a);
                }
                // x in [0, c) divided by c is zero
                if let (Some(lo), Some(hi), Some(c)) =
                    (a.min(), a.max(), b.resolve().and_then(Scalar::as_f64))
                {
                    if lo >= 0.0 && hi < c {
                        return Ok(Self::constant(Scalar::zero(dtype)));
                    }
                }
            }
            AluOp::Mod => {
                if b.is_const_value(1.0) {
                    return Ok(Self::constant(Scalar::zero(dtype)));
                }
                // x in [0, c) mod c is x
                if let (Some(lo), Some(hi), Some(c)) =
                    (a.min(), a.max(), b.resolve().and_then(Scalar::as_f64))
                {
                    if lo >= 0.0 && hi < c {
                        return Ok(a);
                    }
                }
            }
            _ => {}
        }

        Ok(Self::build(op, dtype, vec![a, b], AluArg::None))
    }

    // When an identity drops the typed side of a lenient mixed-dtype pair
    // (`0 + x`), the survivor must still carry the result dtype.
    fn cast_like(self, dtype: DType) -> AluExp {
        if self.dtype() == dtype {
            return self;
        }
        if let Some(s) = self.resolve() {
            if let Ok(c) = s.cast(dtype) {
                return Self::constant(c);
            }
        }
        // Non-constant mixed-dtype operands keep their own dtype; the
        // lenient rule only fixes the result dtype of the surrounding node.
        self
    }

    pub fn add(a: AluExp, b: AluExp) -> IrResult<AluExp> {
        Self::binary(AluOp::Add, a, b)
    }

    pub fn sub(a: AluExp, b: AluExp) -> IrResult<AluExp> {
        Self::binary(AluOp::Sub, a, b)
    }

    pub fn mul(a: AluExp, b: AluExp) -> IrResult<AluExp> {
        Self::binary(AluOp::Mul, a, b)
    }

    pub fn idiv(a: AluExp, b: AluExp) -> IrResult<AluExp> {
        Self::binary(AluOp::Idiv, a, b)
    }

    pub fn modulo(a: AluExp, b: AluExp) -> IrResult<AluExp> {
        Self::binary(AluOp::Mod, a, b)
    }

    // ---------- unary ----------

    /// Float-only unary node.
    pub fn unary(op: AluOp, a: AluExp) -> IrResult<AluExp> {
        debug_assert!(matches!(
            op,
            AluOp::Neg
                | AluOp::Sin
                | AluOp::Cos
                | AluOp::Exp
                | AluOp::Log
                | AluOp::Sqrt
                | AluOp::Reciprocal
        ));
        if !a.dtype().is_float() {
            return Err(IrError::Type(format!(
                "{op:?} requires float32, got {}",
                a.dtype()
            )));
        }
        if let Some(x) = a.resolve() {
            return Ok(Self::constant(unary_scalar(op, x)?));
        }
        // double negation
        if op == AluOp::Neg && a.op() == AluOp::Neg {
            return Ok(a.src()[0].clone());
        }
        Ok(Self::build(op, a.dtype(), vec![a], AluArg::None))
    }

    pub fn neg(a: AluExp) -> IrResult<AluExp> {
        Self::unary(AluOp::Neg, a)
    }

    pub fn sin(a: AluExp) -> IrResult<AluExp> {
        Self::unary(AluOp::Sin, a)
    }

    pub fn cos(a: AluExp) -> IrResult<AluExp> {
        Self::unary(AluOp::Cos, a)
    }

    // ---------- comparisons ----------

    /// Comparison node; always produces `bool`.
    pub fn compare(op: AluOp, a: AluExp, b: AluExp) -> IrResult<AluExp> {
        debug_assert!(matches!(op, AluOp::Cmplt | AluOp::Cmpeq | AluOp::Cmpne));
        if let (Some(x), Some(y)) = (a.resolve(), b.resolve()) {
            return Ok(Self::constant(compare_scalar(op, x, y)?));
        }
        match op {
            AluOp::Cmplt => {
                if a == b {
                    return Ok(Self::bool_const(false));
                }
                // interval tightening
                if let (Some(ahi), Some(blo)) = (a.max(), b.min()) {
                    if ahi < blo {
                        return Ok(Self::bool_const(true));
                    }
                }
                if let (Some(alo), Some(bhi)) = (a.min(), b.max()) {
                    if alo >= bhi {
                        return Ok(Self::bool_const(false));
                    }
                }
            }
            AluOp::Cmpeq => {
                if a == b {
                    return Ok(Self::bool_const(true));
                }
            }
            AluOp::Cmpne => {
                if a == b {
                    return Ok(Self::bool_const(false));
                }
            }
            _ => {}
        }
        Ok(Self::build(op, DType::Bool, vec![a, b], AluArg::None))
    }

    pub fn cmplt(a: AluExp, b: AluExp) -> IrResult<AluExp> {
        Self::compare(AluOp::Cmplt, a, b)
    }

    pub fn cmpeq(a: AluExp, b: AluExp) -> IrResult<AluExp> {
        Self::compare(AluOp::Cmpeq, a, b)
    }

    pub fn cmpne(a: AluExp, b: AluExp) -> IrResult<AluExp> {
        Self::compare(AluOp::Cmpne, a, b)
    }

    // ---------- ternary ----------

    /// `Where(cond, a, b)`: `a` where `cond`, else `b`. Result dtype is
    /// `a`'s.
    pub fn where_(cond: AluExp, a: AluExp, b: AluExp) -> IrResult<AluExp> {
        if cond.dtype() != DType::Bool {
            return Err(IrError::Type(format!(
                "Where condition must be bool, got {}",
                cond.dtype()
            )));
        }
        if let Some(c) = cond.resolve().and_then(Scalar::as_bool) {
            return Ok(if c { a } else { b });
        }
        if a == b {
            return Ok(a);
        }
        let dtype = a.dtype();
        Ok(Self::build(AluOp::Where, dtype, vec![cond, a, b], AluArg::None))
    }

    /// Boolean conjunction, encoded as `Mul` (bool `Mul` is AND).
    pub fn and(a: AluExp, b: AluExp) -> IrResult<AluExp> {
        Self::binary(AluOp::Mul, a, b)
    }
}

/// Bottom-up interval analysis. `Special(n)` contributes `[0, n-1]`; the
/// arithmetic ops combine children conservatively.
fn compute_range(op: AluOp, dtype: DType, src: &[AluExp], arg: &AluArg) -> Option<(f64, f64)> {
    match op {
        AluOp::Const => match arg {
            AluArg::Const(s) => s.as_f64().map(|v| (v, v)),
            _ => None,
        },
        AluOp::Special => match arg {
            AluArg::Special { bound, .. } => {
                if *bound == 0 {
                    // empty range; keep min <= max
                    Some((0.0, 0.0))
                } else {
                    Some((0.0, (*bound - 1) as f64))
                }
            }
            _ => None,
        },
        AluOp::Add => {
            let (alo, ahi) = src[0].0.range?;
            let (blo, bhi) = src[1].0.range?;
            Some((alo + blo, ahi + bhi))
        }
        AluOp::Sub => {
            let (alo, ahi) = src[0].0.range?;
            let (blo, bhi) = src[1].0.range?;
            Some((alo - bhi, ahi - blo))
        }
        AluOp::Mul => {
            let (alo, ahi) = src[0].0.range?;
            let (blo, bhi) = src[1].0.range?;
            let cands = [alo * blo, alo * bhi, ahi * blo, ahi * bhi];
            let lo = cands.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = cands.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            Some((lo, hi))
        }
        AluOp::Idiv => {
            let (alo, ahi) = src[0].0.range?;
            let c = src[1].resolve().and_then(Scalar::as_f64)?;
            if c > 0.0 {
                Some(((alo / c).floor(), (ahi / c).floor()))
            } else {
                None
            }
        }
        AluOp::Mod => {
            let (alo, _) = src[0].0.range?;
            let c = src[1].resolve().and_then(Scalar::as_f64)?;
            if c > 0.0 && alo >= 0.0 {
                Some((0.0, c - 1.0))
            } else {
                None
            }
        }
        AluOp::Neg => {
            let (lo, hi) = src[0].0.range?;
            Some((-hi, -lo))
        }
        AluOp::Sin | AluOp::Cos => Some((-1.0, 1.0)),
        AluOp::Cmplt | AluOp::Cmpeq | AluOp::Cmpne => Some((0.0, 1.0)),
        AluOp::Where => {
            let (alo, ahi) = src[1].0.range?;
            let (blo, bhi) = src[2].0.range?;
            Some((alo.min(blo), ahi.max(bhi)))
        }
        _ => {
            let _ = dtype;
            None
        }
    }
}

impl fmt::Display for AluExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.0.op, &self.0.arg) {
            (AluOp::Const, AluArg::Const(s)) => write!(f, "{s}"),
            (AluOp::Special, AluArg::Special { name, bound }) => write!(f, "{name}<{bound}>"),
            (AluOp::GlobalView, AluArg::View { gid, .. }) => {
                write!(f, "view(g{gid}")?;
                for s in &self.0.src {
                    write!(f, ", {s}")?;
                }
                write!(f, ")")
            }
            (AluOp::GlobalIndex, AluArg::Global { gid }) => {
                write!(f, "g{gid}[{}]", self.0.src[0])
            }
            (op, _) => {
                write!(f, "({op:?}")?;
                for s in &self.0.src {
                    write!(f, " {s}")?;
                }
                write!(f, ")")
            }
        }
    }
}
