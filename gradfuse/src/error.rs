//! Core error types.
//!
//! Backend and IR errors propagate unwrapped through the transformation
//! layer; the core adds the tracer-level error kinds.

use gradfuse_backend::BackendError;
use gradfuse_ir::IrError;
use thiserror::Error;

/// Errors surfaced by tracing, transformation and compilation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Dtype/shape incompatibility, a nonlinear operation in a transpose,
    /// a tracer escaping its trace, or `grad` of a non-scalar output.
    #[error("TypeError: {0}")]
    Type(String),

    /// Structural mismatch between the tree a transformation expects and
    /// the tree it was given.
    #[error("TreeMismatchError: {0}")]
    TreeMismatch(String),

    /// Backend failures, propagated without wrapping.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// IR-layer failures, propagated without wrapping.
    #[error(transparent)]
    Ir(#[from] IrError),

    /// Broken internal invariant; not intended to be caught by users.
    #[error("InternalError: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
