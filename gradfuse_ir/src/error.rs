//! Error types for the IR layer.

use thiserror::Error;

/// Errors raised while constructing or evaluating IR values.
///
/// Construction errors are all type errors in the sense of the core error
/// taxonomy: a dtype or shape that the operation cannot accept.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IrError {
    /// Dtype or arity mismatch in an expression constructor.
    #[error("TypeError: {0}")]
    Type(String),

    /// Shape/stride mismatch in a view operation.
    #[error("ShapeError: {0}")]
    Shape(String),

    /// An unbound `Special` variable or missing buffer during evaluation.
    #[error("EvalError: {0}")]
    Eval(String),
}
