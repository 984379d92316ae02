//! Device backend contract and reference CPU backend for gradfuse.
//!
//! This crate defines the only interface the compiler core consumes:
//!
//! - `Slot`: an opaque, reference-counted device buffer handle
//! - `Backend`: malloc / refcount / read / execute over tuned kernels
//! - `Dispatch`: completion handle for asynchronous kernel execution
//! - `CancelToken`: cooperative cancellation of in-flight dispatches
//! - `CpuBackend`: a backend that runs tuned kernels by interpreting
//!   their scalar expression per output element

pub mod backend;
pub mod cancel;
pub mod cpu;
pub mod error;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use gradfuse_backend::prelude::*;
/// ```
pub mod prelude {
    pub use super::backend::{Backend, Dispatch, Slot};
    pub use super::cancel::CancelToken;
    pub use super::cpu::CpuBackend;
    pub use super::error::BackendError;
}

pub use prelude::*;
