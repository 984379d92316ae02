//! Concrete arrays: a refcounted device slot viewed through a
//! `ShapeTracker`.
//!
//! Cloning an array takes a slot reference; dropping releases it. View
//! operations (transpose, broadcast, ...) share the slot and compose the
//! tracker, so they are zero-copy.

use std::cell::RefCell;
use std::rc::Rc;

use gradfuse_backend::{Backend, CpuBackend, Slot};
use gradfuse_ir::{DType, Scalar, ShapeTracker};

use crate::aval::ShapedArray;
use crate::error::{CoreError, CoreResult};

thread_local! {
    static DEFAULT_BACKEND: RefCell<Rc<dyn Backend>> =
        RefCell::new(Rc::new(CpuBackend::new()));
}

/// The backend new arrays are placed on when none is specified.
pub fn default_backend() -> Rc<dyn Backend> {
    DEFAULT_BACKEND.with(|b| b.borrow().clone())
}

/// Replace the default backend (e.g. with a fresh one per test).
pub fn set_default_backend(backend: Rc<dyn Backend>) {
    DEFAULT_BACKEND.with(|b| *b.borrow_mut() = backend);
}

/// A concrete tensor on a device.
#[derive(Debug)]
pub struct Array {
    slot: Slot,
    dtype: DType,
    tracker: ShapeTracker,
    backend: Rc<dyn Backend>,
}

impl Array {
    /// Wrap an owned slot reference. The new `Array` takes over one
    /// reference count; the caller must not release it again.
    pub(crate) fn from_owned_slot(
        slot: Slot,
        dtype: DType,
        tracker: ShapeTracker,
        backend: Rc<dyn Backend>,
    ) -> Array {
        Array {
            slot,
            dtype,
            tracker,
            backend,
        }
    }

    /// Upload scalars in row-major order.
    pub fn from_scalars(values: &[Scalar], shape: &[usize]) -> CoreResult<Array> {
        let backend = default_backend();
        Self::from_scalars_on(values, shape, backend)
    }

    pub fn from_scalars_on(
        values: &[Scalar],
        shape: &[usize],
        backend: Rc<dyn Backend>,
    ) -> CoreResult<Array> {
        let size: usize = shape.iter().product();
        if values.len() != size {
            return Err(CoreError::Type(format!(
                "{} values for shape {:?} ({} elements)",
                values.len(),
                shape,
                size
            )));
        }
        let dtype = values
            .first()
            .map(|v| v.dtype())
            .unwrap_or(DType::Float32);
        let mut bytes = vec![0u8; size * dtype.size_in_bytes()];
        for (k, v) in values.iter().enumerate() {
            if v.dtype() != dtype {
                return Err(CoreError::Type(
                    "mixed dtypes in array initializer".into(),
                ));
            }
            v.write_to(&mut bytes, k)?;
        }
        let slot = backend.malloc(bytes.len(), Some(&bytes))?;
        Ok(Array::from_owned_slot(
            slot,
            dtype,
            ShapeTracker::contiguous(shape),
            backend,
        ))
    }

    pub fn from_f32(values: &[f32], shape: &[usize]) -> CoreResult<Array> {
        let scalars: Vec<Scalar> = values.iter().map(|&v| Scalar::F32(v)).collect();
        Self::from_scalars(&scalars, shape)
    }

    pub fn from_u32(values: &[u32], shape: &[usize]) -> CoreResult<Array> {
        let scalars: Vec<Scalar> = values.iter().map(|&v| Scalar::U32(v)).collect();
        Self::from_scalars(&scalars, shape)
    }

    pub fn from_complex(values: &[num_complex::Complex32], shape: &[usize]) -> CoreResult<Array> {
        let scalars: Vec<Scalar> = values.iter().map(|&v| Scalar::C64(v)).collect();
        Self::from_scalars(&scalars, shape)
    }

    pub fn scalar(value: Scalar) -> CoreResult<Array> {
        Self::from_scalars(&[value], &[])
    }

    /// Zero-filled array of the given abstract value.
    pub fn zeros(aval: &ShapedArray) -> CoreResult<Array> {
        let backend = default_backend();
        let slot = backend.malloc(aval.byte_size().max(aval.dtype.size_in_bytes()), None)?;
        Ok(Array::from_owned_slot(
            slot,
            aval.dtype,
            ShapeTracker::contiguous(&aval.shape),
            backend,
        ))
    }

    pub fn shape(&self) -> &[usize] {
        self.tracker.shape()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn aval(&self) -> ShapedArray {
        ShapedArray::new(self.shape().to_vec(), self.dtype)
    }

    pub fn tracker(&self) -> &ShapeTracker {
        &self.tracker
    }

    pub(crate) fn slot(&self) -> Slot {
        self.slot
    }

    pub(crate) fn backend(&self) -> &Rc<dyn Backend> {
        &self.backend
    }

    /// Share the slot under a different tracker (a zero-copy view).
    pub(crate) fn with_tracker(&self, tracker: ShapeTracker) -> CoreResult<Array> {
        self.backend.inc_ref(self.slot)?;
        Ok(Array::from_owned_slot(
            self.slot,
            self.dtype,
            tracker,
            self.backend.clone(),
        ))
    }

    /// Release this array's slot reference explicitly. Equivalent to
    /// dropping it.
    pub fn dispose(self) {}

    /// Copy into a contiguous buffer when the view is not already one.
    pub fn contiguous(&self) -> CoreResult<Array> {
        if self.tracker.is_contiguous() {
            return Ok(self.clone());
        }
        crate::fuse::materialize(self)
    }

    /// Read every logical element back to the host, in row-major order.
    /// Masked-out elements read as zero.
    pub fn to_scalars(&self) -> CoreResult<Vec<Scalar>> {
        let bytes = self.backend.read_sync(self.slot, 0, None)?;
        let shape = self.shape().to_vec();
        let size: usize = shape.iter().product();
        let mut out = Vec::with_capacity(size);
        let mut idx = vec![0i64; shape.len()];
        for _ in 0..size {
            let (offset, valid) = self.tracker.offset_and_valid(&idx);
            let v = if valid {
                Scalar::read_from(&bytes, self.dtype, offset as usize)?
            } else {
                Scalar::zero(self.dtype)
            };
            out.push(v);
            // increment the row-major odometer
            for k in (0..shape.len()).rev() {
                idx[k] += 1;
                if idx[k] < shape[k] as i64 {
                    break;
                }
                idx[k] = 0;
            }
        }
        Ok(out)
    }

    pub fn to_f32_vec(&self) -> CoreResult<Vec<f32>> {
        self.to_scalars()?
            .into_iter()
            .map(|s| match s {
                Scalar::F32(v) => Ok(v),
                other => Err(CoreError::Type(format!(
                    "expected float32 elements, got {}",
                    other.dtype()
                ))),
            })
            .collect()
    }

    pub fn to_u32_vec(&self) -> CoreResult<Vec<u32>> {
        self.to_scalars()?
            .into_iter()
            .map(|s| match s {
                Scalar::U32(v) => Ok(v),
                other => Err(CoreError::Type(format!(
                    "expected uint32 elements, got {}",
                    other.dtype()
                ))),
            })
            .collect()
    }

    /// The single element of a size-1 array.
    pub fn item(&self) -> CoreResult<Scalar> {
        let scalars = self.to_scalars()?;
        match scalars.as_slice() {
            [s] => Ok(*s),
            _ => Err(CoreError::Type(format!(
                "item() on an array of {} elements",
                scalars.len()
            ))),
        }
    }
}

impl Clone for Array {
    fn clone(&self) -> Array {
        self.backend
            .inc_ref(self.slot)
            .expect("slot of a live array must be valid");
        Array {
            slot: self.slot,
            dtype: self.dtype,
            tracker: self.tracker.clone(),
            backend: self.backend.clone(),
        }
    }
}

impl Drop for Array {
    fn drop(&mut self) {
        // the backend reports SlotError for double frees; nothing useful
        // can be done with it during drop
        let _ = self.backend.dec_ref(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f32_roundtrip() {
        let a = Array::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!(a.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_clone_shares_slot() {
        let a = Array::from_f32(&[1.0], &[1]).unwrap();
        let b = a.clone();
        drop(a);
        assert_eq!(b.to_f32_vec().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_view_readback_through_tracker() {
        let a = Array::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let t = a.tracker().permute(&[1, 0]).unwrap();
        let at = a.with_tracker(t).unwrap();
        assert_eq!(at.to_f32_vec().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_zeros() {
        let z = Array::zeros(&ShapedArray::new(vec![3], DType::Float32)).unwrap();
        assert_eq!(z.to_f32_vec().unwrap(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_complex_roundtrip() {
        use num_complex::Complex32;
        let zs = [Complex32::new(1.0, 2.0), Complex32::new(-0.5, 0.0)];
        let a = Array::from_complex(&zs, &[2]).unwrap();
        assert_eq!(a.dtype(), DType::Complex64);
        let back = a.to_scalars().unwrap();
        assert_eq!(back, vec![Scalar::C64(zs[0]), Scalar::C64(zs[1])]);
    }
}
