//! Tracing autodiff and JIT kernel fusion over a NumPy-style array
//! runtime.
//!
//! User programs are ordinary Rust closures over [`Value`]s. A stack of
//! tracing interpreters captures them as a typed IR ([`jaxpr::Jaxpr`]),
//! which the transformations consume:
//!
//! - [`jvp`] / [`jvp_flat`]: forward-mode derivatives
//! - [`linearize`] / [`linearize_flat`]: primal evaluation plus the
//!   tangent map as a linear program
//! - [`vjp`] / [`vjp_flat`] / [`grad`]: reverse-mode via program
//!   transposition
//! - [`jit`]: compilation to a schedule of fused kernels on a backend
//!
//! The scalar kernel IR and view algebra live in `gradfuse_ir`; the
//! device contract and reference CPU backend in `gradfuse_backend`.

// Core modules
pub mod array;
pub mod aval;
pub mod error;
pub mod jaxpr;
pub mod ops;
pub mod prng;
pub mod tree;
pub mod value;

// Tracing and transformations
pub mod jit;
pub mod jvp;
pub mod partial_eval;
pub mod trace;
pub mod transpose;

// Shared internals
mod fuse;
pub mod primitives;
pub mod util;

pub use array::{default_backend, set_default_backend, Array};
pub use aval::ShapedArray;
pub use error::{CoreError, CoreResult};
pub use jaxpr::{Atom, Jaxpr, JaxprEqn, Lit, Var};
pub use jit::{compile, jit, make_jaxpr, JitProgram, Step};
pub use jvp::{jvp, jvp_flat};
pub use partial_eval::{linearize, linearize_flat, LinearFn};
pub use primitives::{CompareOp, Primitive};
pub use trace::{bind, bind1};
pub use transpose::{eval_jaxpr_transposed, grad, vjp, vjp_flat, TransposeArg, VjpFn};
pub use tree::{Tree, TreeDef};
pub use value::Value;

// Re-export the lower layers' surface types
pub use gradfuse_backend::{Backend, CancelToken, CpuBackend, Slot};
pub use gradfuse_ir::{DType, Scalar};
