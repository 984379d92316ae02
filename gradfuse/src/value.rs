//! The tracer sum type.
//!
//! Every runtime quantity flowing through user code is a `Value`: a
//! scalar literal, a concrete array, or a tracer belonging to one of the
//! active traces. Polymorphism across tracers is a tagged sum with a
//! per-kind dispatch in `trace::bind`, not a trait object.

use std::rc::Rc;

use gradfuse_ir::{DType, Scalar};

use crate::array::Array;
use crate::aval::ShapedArray;
use crate::error::{CoreError, CoreResult};
use crate::jvp::JvpTracer;
use crate::partial_eval::PeTracer;

/// A runtime value: concrete data or a tracer of an active trace.
#[derive(Debug, Clone)]
pub enum Value {
    /// An unboxed scalar literal. Stays symbolic so traced programs can
    /// inline it instead of hoisting a device buffer.
    Lit(Scalar),
    /// A concrete array on a backend.
    Concrete(Array),
    /// Forward-mode tracer carrying `(primal, tangent)`.
    Jvp(Rc<JvpTracer>),
    /// Partial-evaluation tracer carrying a known value or a recipe.
    PartialEval(Rc<PeTracer>),
}

impl Value {
    pub fn aval(&self) -> ShapedArray {
        match self {
            Value::Lit(s) => ShapedArray::scalar(s.dtype()),
            Value::Concrete(a) => a.aval(),
            Value::Jvp(t) => t.aval(),
            Value::PartialEval(t) => t.aval.clone(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.aval().dtype
    }

    pub fn shape(&self) -> Vec<usize> {
        self.aval().shape
    }

    /// Trace level this value lives at; concrete data is level 0.
    pub(crate) fn level(&self) -> usize {
        match self {
            Value::Lit(_) | Value::Concrete(_) => 0,
            Value::Jvp(t) => t.level,
            Value::PartialEval(t) => t.level,
        }
    }

    /// The concrete array behind this value. Fails on tracers: data only
    /// exists outside an active transformation.
    pub fn to_array(&self) -> CoreResult<Array> {
        match self {
            Value::Concrete(a) => Ok(a.clone()),
            Value::Lit(s) => Array::scalar(*s),
            _ => Err(CoreError::Type(
                "cannot read a tracer as concrete data".into(),
            )),
        }
    }

    /// Host readback, for tests and display.
    pub fn to_f32_vec(&self) -> CoreResult<Vec<f32>> {
        match self {
            Value::Lit(Scalar::F32(v)) => Ok(vec![*v]),
            _ => self.to_array()?.to_f32_vec(),
        }
    }

    /// The single element of a scalar value as `f32`.
    pub fn item_f32(&self) -> CoreResult<f32> {
        match self {
            Value::Lit(Scalar::F32(v)) => Ok(*v),
            Value::Lit(other) => Err(CoreError::Type(format!(
                "expected float32 scalar, got {}",
                other.dtype()
            ))),
            _ => match self.to_array()?.item()? {
                Scalar::F32(v) => Ok(v),
                other => Err(CoreError::Type(format!(
                    "expected float32 scalar, got {}",
                    other.dtype()
                ))),
            },
        }
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Value {
        Value::Lit(Scalar::F32(v))
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Value {
        Value::Lit(s)
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Value {
        Value::Concrete(a)
    }
}
