//! Scalar expression IR and view algebra for the gradfuse array compiler.
//!
//! This crate is the self-contained lower layer of the gradfuse workspace.
//! It knows nothing about tracing or autodiff; it provides:
//!
//! - `dtype`: the closed element-type set and runtime scalar literals
//! - `shape`: stride/permutation helpers shared by the view algebra
//! - `alu`: an immutable, simplifying scalar expression IR (`AluExp`)
//! - `tracker`: composable logical-to-physical index views (`ShapeTracker`)
//! - `kernel`: the `(size, reduction, expression)` kernel bundle and the
//!   tuning pass that lowers buffer views to physical offsets

pub mod alu;
pub mod dtype;
pub mod error;
pub mod kernel;
pub mod shape;
pub mod tracker;

pub use alu::{
    binary_scalar, compare_scalar, unary_scalar, AluArg, AluExp, AluOp, BufferReader, NoBuffers,
};
pub use dtype::{DType, Scalar};
pub use error::IrError;
pub use kernel::{tune_null, Kernel, ReduceOp, Reduction, SpecialVar, TunedKernel, GIDX, RIDX};
pub use tracker::{unravel_alu, ShapeTracker, View};

/// Result alias used throughout the IR layer.
pub type IrResult<T> = Result<T, IrError>;
