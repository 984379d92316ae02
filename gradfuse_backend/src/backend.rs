//! The device backend contract.
//!
//! The core guarantees that a tuned kernel's expression references only
//! constants, the loop variables listed in `TunedKernel::loop_vars`, and
//! `GlobalIndex(gid, offset)` reads from the provided input slots in
//! order. A backend turns that into device execution; the reference
//! implementation interprets it on the host.
//!
//! Execution is asynchronous at the interface: `execute` and `read`
//! return a `Dispatch` and the `*_sync` variants block on it. The
//! scheduling model is single-threaded cooperative (one execution context
//! touches a backend at a time), so `Dispatch` is a completion handle
//! rather than a poll-driven future.

use gradfuse_ir::TunedKernel;

use crate::cancel::CancelToken;
use crate::error::{BackendError, BackendResult};

/// Opaque handle to a device buffer. Reference counted by the backend;
/// the holder owns exactly the references it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(pub(crate) u64);

impl Slot {
    /// Stable numeric id, used in JIT cache keys.
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Completion handle of an asynchronous backend operation.
///
/// In the cooperative model a dispatch either completed or failed by the
/// time the handle is observed; `wait` surfaces the outcome.
#[derive(Debug)]
#[must_use = "a Dispatch carries the outcome of the dispatch; call wait()"]
pub struct Dispatch<T> {
    outcome: BackendResult<T>,
}

impl<T> Dispatch<T> {
    /// Wrap an already-completed outcome.
    pub fn ready(outcome: BackendResult<T>) -> Dispatch<T> {
        Dispatch { outcome }
    }

    /// Block until the operation completes and return its outcome.
    pub fn wait(self) -> BackendResult<T> {
        self.outcome
    }

    pub fn is_complete(&self) -> bool {
        true
    }
}

/// The device-agnostic buffer and kernel dispatch contract.
pub trait Backend: std::fmt::Debug {
    /// Identifies the backend implementation; part of JIT cache keys.
    fn kind(&self) -> &'static str;

    /// Allocate a buffer of `byte_size` bytes with refcount 1. With
    /// `init`, the buffer holds a copy of the given bytes (which must be
    /// exactly `byte_size` long); otherwise it is zero-filled.
    fn malloc(&self, byte_size: usize, init: Option<&[u8]>) -> BackendResult<Slot>;

    /// Take an additional reference to a live slot.
    fn inc_ref(&self, slot: Slot) -> BackendResult<()>;

    /// Release one reference; the slot is freed when the count reaches
    /// zero. Releasing a freed slot is a `SlotError`.
    fn dec_ref(&self, slot: Slot) -> BackendResult<()>;

    /// Read `count` bytes (or the rest of the buffer) starting at byte
    /// `start`.
    fn read(&self, slot: Slot, start: usize, count: Option<usize>) -> Dispatch<Vec<u8>>;

    fn read_sync(&self, slot: Slot, start: usize, count: Option<usize>) -> BackendResult<Vec<u8>> {
        self.read(slot, start, count).wait()
    }

    /// Dispatch a tuned kernel. `inputs` bind the kernel's buffer ids in
    /// order; `outputs` receive the result (one slot for the reference
    /// backends). Independent kernels may run concurrently, but a backend
    /// must honor the data dependencies implied by the slot lists.
    fn execute(
        &self,
        kernel: &TunedKernel,
        inputs: &[Slot],
        outputs: &[Slot],
        cancel: Option<&CancelToken>,
    ) -> Dispatch<()>;

    fn execute_sync(
        &self,
        kernel: &TunedKernel,
        inputs: &[Slot],
        outputs: &[Slot],
        cancel: Option<&CancelToken>,
    ) -> BackendResult<()> {
        self.execute(kernel, inputs, outputs, cancel).wait()
    }
}

/// Helper shared by backends: validate a read range against a buffer
/// length.
pub(crate) fn check_range(
    len: usize,
    start: usize,
    count: Option<usize>,
) -> BackendResult<std::ops::Range<usize>> {
    let end = match count {
        Some(c) => start + c,
        None => len,
    };
    if start > len || end > len || start > end {
        return Err(BackendError::Bounds(format!(
            "read of bytes {start}..{end} from a buffer of {len}"
        )));
    }
    Ok(start..end)
}
