//! Backend error types.

use thiserror::Error;

/// Errors surfaced by backend operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Use of a freed or never-allocated slot, or a refcount underflow.
    #[error("SlotError: {0}")]
    Slot(String),

    /// A dispatch was cancelled before completion.
    #[error("ExecutionCancelled: kernel dispatch was cancelled")]
    Cancelled,

    /// Kernel evaluation failed (malformed expression, out-of-range read).
    #[error("ExecError: {0}")]
    Exec(String),

    /// A read or write outside a slot's byte range.
    #[error("BoundsError: {0}")]
    Bounds(String),
}

pub type BackendResult<T> = Result<T, BackendError>;
