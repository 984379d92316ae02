//! Reference CPU backend.
//!
//! Runs a tuned kernel by interpreting its scalar expression once per
//! output element (and once per reduction element for reduction
//! kernels). Slow by design: this backend exists to pin down the
//! semantics the code-generating backends must reproduce, and to make the
//! whole pipeline testable on the host.

use std::cell::RefCell;
use std::collections::HashMap;

use gradfuse_ir::{
    binary_scalar, AluOp, BufferReader, DType, IrError, ReduceOp, Scalar, TunedKernel, GIDX, RIDX,
};

use crate::backend::{check_range, Backend, Dispatch, Slot};
use crate::cancel::CancelToken;
use crate::error::{BackendError, BackendResult};

#[derive(Debug)]
struct SlotEntry {
    data: Vec<u8>,
    refcount: usize,
}

#[derive(Debug, Default)]
struct SlotTable {
    next_id: u64,
    entries: HashMap<u64, SlotEntry>,
}

impl SlotTable {
    fn get(&self, slot: Slot) -> BackendResult<&SlotEntry> {
        self.entries
            .get(&slot.0)
            .ok_or_else(|| BackendError::Slot(format!("use of freed or unknown slot {}", slot.0)))
    }

    fn get_mut(&mut self, slot: Slot) -> BackendResult<&mut SlotEntry> {
        self.entries
            .get_mut(&slot.0)
            .ok_or_else(|| BackendError::Slot(format!("use of freed or unknown slot {}", slot.0)))
    }
}

/// Host backend over plain byte vectors.
///
/// Interior mutability keeps the `Backend` methods `&self`; the
/// scheduling model is single-threaded cooperative, so a `RefCell` table
/// suffices.
#[derive(Debug, Default)]
pub struct CpuBackend {
    slots: RefCell<SlotTable>,
}

impl CpuBackend {
    pub fn new() -> CpuBackend {
        CpuBackend::default()
    }

    /// Number of live slots, for leak assertions in tests.
    pub fn live_slots(&self) -> usize {
        self.slots.borrow().entries.len()
    }

    fn run_kernel(
        &self,
        kernel: &TunedKernel,
        inputs: &[Slot],
        outputs: &[Slot],
        cancel: Option<&CancelToken>,
    ) -> BackendResult<()> {
        if !kernel
            .exp
            .collect(&|e| e.op() == AluOp::GlobalView)
            .is_empty()
        {
            return Err(BackendError::Exec(
                "kernel was not tuned: GlobalView remains in the expression".into(),
            ));
        }
        if inputs.len() != kernel.nargs {
            return Err(BackendError::Exec(format!(
                "kernel expects {} inputs, got {}",
                kernel.nargs,
                inputs.len()
            )));
        }
        let [output] = outputs else {
            return Err(BackendError::Exec(format!(
                "kernel writes 1 output, got {}",
                outputs.len()
            )));
        };

        let out_dtype = kernel.out_dtype();
        let out_bytes = kernel.size * out_dtype.size_in_bytes();

        // Evaluate into a staging buffer first: a cancelled or failed
        // dispatch must not make partial writes visible.
        let mut staged = vec![0u8; out_bytes];
        {
            let table = self.slots.borrow();
            let reader = TableReader {
                table: &table,
                inputs,
            };
            let mut ctx: HashMap<String, i64> = HashMap::new();
            for g in 0..kernel.size {
                if let Some(token) = cancel {
                    if token.is_requested() {
                        return Err(BackendError::Cancelled);
                    }
                }
                ctx.insert(GIDX.to_string(), g as i64);
                let value = match &kernel.reduction {
                    None => kernel
                        .exp
                        .evaluate(&ctx, &reader)
                        .map_err(exec_err)?,
                    Some(red) => {
                        let mut acc = red.op.init(red.dtype);
                        for r in 0..red.size {
                            ctx.insert(RIDX.to_string(), r as i64);
                            let v = kernel.exp.evaluate(&ctx, &reader).map_err(exec_err)?;
                            acc = accumulate(red.op, red.dtype, acc, v).map_err(exec_err)?;
                        }
                        acc
                    }
                };
                value.write_to(&mut staged, g).map_err(exec_err)?;
            }
        }

        let mut table = self.slots.borrow_mut();
        let entry = table.get_mut(*output)?;
        if entry.data.len() < out_bytes {
            return Err(BackendError::Bounds(format!(
                "kernel writes {} bytes into a slot of {}",
                out_bytes,
                entry.data.len()
            )));
        }
        entry.data[..out_bytes].copy_from_slice(&staged);
        Ok(())
    }
}

fn exec_err(e: IrError) -> BackendError {
    BackendError::Exec(e.to_string())
}

fn accumulate(op: ReduceOp, dtype: DType, acc: Scalar, v: Scalar) -> Result<Scalar, IrError> {
    match op {
        ReduceOp::Add => binary_scalar(AluOp::Add, dtype, acc, v),
        ReduceOp::Max => {
            let keep_acc = match (acc.as_f64(), v.as_f64()) {
                (Some(a), Some(b)) => a >= b,
                _ => return Err(IrError::Type("max reduction over complex64".into())),
            };
            Ok(if keep_acc { acc } else { v.cast(dtype)? })
        }
    }
}

struct TableReader<'a> {
    table: &'a SlotTable,
    inputs: &'a [Slot],
}

impl BufferReader for TableReader<'_> {
    fn read_global(&self, gid: usize, offset: i64, dtype: DType) -> Result<Scalar, IrError> {
        let slot = self
            .inputs
            .get(gid)
            .ok_or_else(|| IrError::Eval(format!("kernel reads unbound buffer {gid}")))?;
        let entry = self
            .table
            .get(*slot)
            .map_err(|e| IrError::Eval(e.to_string()))?;
        if offset < 0 {
            return Err(IrError::Eval(format!("negative buffer offset {offset}")));
        }
        Scalar::read_from(&entry.data, dtype, offset as usize)
    }
}

impl Backend for CpuBackend {
    fn kind(&self) -> &'static str {
        "cpu"
    }

    fn malloc(&self, byte_size: usize, init: Option<&[u8]>) -> BackendResult<Slot> {
        let data = match init {
            Some(bytes) => {
                if bytes.len() != byte_size {
                    return Err(BackendError::Bounds(format!(
                        "malloc of {} bytes initialized with {}",
                        byte_size,
                        bytes.len()
                    )));
                }
                bytes.to_vec()
            }
            None => vec![0u8; byte_size],
        };
        let mut table = self.slots.borrow_mut();
        let id = table.next_id;
        table.next_id += 1;
        table.entries.insert(id, SlotEntry { data, refcount: 1 });
        Ok(Slot(id))
    }

    fn inc_ref(&self, slot: Slot) -> BackendResult<()> {
        let mut table = self.slots.borrow_mut();
        table.get_mut(slot)?.refcount += 1;
        Ok(())
    }

    fn dec_ref(&self, slot: Slot) -> BackendResult<()> {
        let mut table = self.slots.borrow_mut();
        let entry = table.get_mut(slot)?;
        entry.refcount -= 1;
        if entry.refcount == 0 {
            table.entries.remove(&slot.0);
        }
        Ok(())
    }

    fn read(&self, slot: Slot, start: usize, count: Option<usize>) -> Dispatch<Vec<u8>> {
        let table = self.slots.borrow();
        let outcome = table.get(slot).and_then(|entry| {
            let range = check_range(entry.data.len(), start, count)?;
            Ok(entry.data[range].to_vec())
        });
        Dispatch::ready(outcome)
    }

    fn execute(
        &self,
        kernel: &TunedKernel,
        inputs: &[Slot],
        outputs: &[Slot],
        cancel: Option<&CancelToken>,
    ) -> Dispatch<()> {
        Dispatch::ready(self.run_kernel(kernel, inputs, outputs, cancel))
    }
}
