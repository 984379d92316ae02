//! Element types and runtime scalar literals.
//!
//! The dtype set is closed: `float32`, `int32`, `uint32`, `bool` and
//! `complex64` (a pair of `f32`, NumPy layout). Buffers are little-endian
//! byte arrays; `Scalar` knows how to encode/decode one element.

use std::fmt;
use std::hash::{Hash, Hasher};

use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::error::IrError;

/// Element type of a buffer or expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Float32,
    Int32,
    Uint32,
    Bool,
    Complex64,
}

impl DType {
    /// Bytes per element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Float32 | DType::Int32 | DType::Uint32 => 4,
            DType::Bool => 1,
            DType::Complex64 => 8,
        }
    }

    /// True for the real floating type. Complex is not "float" here: the
    /// float-only unary ops (`Sin`, `Log`, ...) accept `float32` only.
    pub fn is_float(self) -> bool {
        matches!(self, DType::Float32)
    }

    /// True for every dtype that supports arithmetic (everything except
    /// `bool`, whose `Add`/`Mul` are OR/AND).
    pub fn is_numeric(self) -> bool {
        !matches!(self, DType::Bool)
    }

    /// True for the integer index types.
    pub fn is_integer(self) -> bool {
        matches!(self, DType::Int32 | DType::Uint32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Float32 => "float32",
            DType::Int32 => "int32",
            DType::Uint32 => "uint32",
            DType::Bool => "bool",
            DType::Complex64 => "complex64",
        };
        write!(f, "{name}")
    }
}

/// One runtime element, tagged with its dtype.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Scalar {
    F32(f32),
    I32(i32),
    U32(u32),
    Bool(bool),
    C64(Complex32),
}

impl Scalar {
    pub fn dtype(self) -> DType {
        match self {
            Scalar::F32(_) => DType::Float32,
            Scalar::I32(_) => DType::Int32,
            Scalar::U32(_) => DType::Uint32,
            Scalar::Bool(_) => DType::Bool,
            Scalar::C64(_) => DType::Complex64,
        }
    }

    /// The additive identity of a dtype.
    pub fn zero(dtype: DType) -> Scalar {
        match dtype {
            DType::Float32 => Scalar::F32(0.0),
            DType::Int32 => Scalar::I32(0),
            DType::Uint32 => Scalar::U32(0),
            DType::Bool => Scalar::Bool(false),
            DType::Complex64 => Scalar::C64(Complex32::new(0.0, 0.0)),
        }
    }

    /// The multiplicative identity of a dtype.
    pub fn one(dtype: DType) -> Scalar {
        match dtype {
            DType::Float32 => Scalar::F32(1.0),
            DType::Int32 => Scalar::I32(1),
            DType::Uint32 => Scalar::U32(1),
            DType::Bool => Scalar::Bool(true),
            DType::Complex64 => Scalar::C64(Complex32::new(1.0, 0.0)),
        }
    }

    /// Real value as `f64`, when the dtype is real. Used by the interval
    /// analysis; complex values have no order and return `None`.
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Scalar::F32(v) => Some(v as f64),
            Scalar::I32(v) => Some(v as f64),
            Scalar::U32(v) => Some(v as f64),
            Scalar::Bool(v) => Some(if v { 1.0 } else { 0.0 }),
            Scalar::C64(_) => None,
        }
    }

    /// Integer value, for index arithmetic.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Scalar::I32(v) => Some(v as i64),
            Scalar::U32(v) => Some(v as i64),
            Scalar::Bool(v) => Some(v as i64),
            Scalar::F32(v) if v.fract() == 0.0 => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Scalar::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Reinterpret a real value under another dtype (used when folding
    /// lenient mixed-dtype arithmetic).
    pub fn cast(self, dtype: DType) -> Result<Scalar, IrError> {
        if self.dtype() == dtype {
            return Ok(self);
        }
        let v = self
            .as_f64()
            .ok_or_else(|| IrError::Type(format!("cannot cast {self} to {dtype}")))?;
        Ok(match dtype {
            DType::Float32 => Scalar::F32(v as f32),
            DType::Int32 => Scalar::I32(v as i32),
            DType::Uint32 => Scalar::U32(v as u32),
            DType::Bool => Scalar::Bool(v != 0.0),
            DType::Complex64 => Scalar::C64(Complex32::new(v as f32, 0.0)),
        })
    }

    /// Decode the element at index `idx` of a little-endian buffer.
    pub fn read_from(buf: &[u8], dtype: DType, idx: usize) -> Result<Scalar, IrError> {
        let sz = dtype.size_in_bytes();
        let at = idx * sz;
        let bytes = buf
            .get(at..at + sz)
            .ok_or_else(|| IrError::Eval(format!("read of element {idx} past end of buffer")))?;
        Ok(match dtype {
            DType::Float32 => Scalar::F32(f32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])),
            DType::Int32 => Scalar::I32(i32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])),
            DType::Uint32 => Scalar::U32(u32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])),
            DType::Bool => Scalar::Bool(bytes[0] != 0),
            DType::Complex64 => {
                let re = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let im = f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                Scalar::C64(Complex32::new(re, im))
            }
        })
    }

    /// Encode this element at index `idx` of a little-endian buffer.
    pub fn write_to(self, buf: &mut [u8], idx: usize) -> Result<(), IrError> {
        let sz = self.dtype().size_in_bytes();
        let at = idx * sz;
        let dst = buf
            .get_mut(at..at + sz)
            .ok_or_else(|| IrError::Eval(format!("write of element {idx} past end of buffer")))?;
        match self {
            Scalar::F32(v) => dst.copy_from_slice(&v.to_le_bytes()),
            Scalar::I32(v) => dst.copy_from_slice(&v.to_le_bytes()),
            Scalar::U32(v) => dst.copy_from_slice(&v.to_le_bytes()),
            Scalar::Bool(v) => dst[0] = v as u8,
            Scalar::C64(v) => {
                dst[..4].copy_from_slice(&v.re.to_le_bytes());
                dst[4..].copy_from_slice(&v.im.to_le_bytes());
            }
        }
        Ok(())
    }
}

// Bitwise equality so Scalar can key hash maps. Two NaNs with the same
// payload compare equal, which is what structural sharing wants.
impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::F32(a), Scalar::F32(b)) => a.to_bits() == b.to_bits(),
            (Scalar::I32(a), Scalar::I32(b)) => a == b,
            (Scalar::U32(a), Scalar::U32(b)) => a == b,
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::C64(a), Scalar::C64(b)) => {
                a.re.to_bits() == b.re.to_bits() && a.im.to_bits() == b.im.to_bits()
            }
            _ => false,
        }
    }
}

impl Eq for Scalar {}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Scalar::F32(v) => v.to_bits().hash(state),
            Scalar::I32(v) => v.hash(state),
            Scalar::U32(v) => v.hash(state),
            Scalar::Bool(v) => v.hash(state),
            Scalar::C64(v) => {
                v.re.to_bits().hash(state);
                v.im.to_bits().hash(state);
            }
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Whole floats print without a trailing ".0" so literals in the
            // Jaxpr text format read as `add a 2`.
            Scalar::F32(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e7 {
                    write!(f, "{}", *v as i64)
                } else {
                    write!(f, "{v}")
                }
            }
            Scalar::I32(v) => write!(f, "{v}"),
            Scalar::U32(v) => write!(f, "{v}"),
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::C64(v) => write!(f, "{}+{}i", v.re, v.im),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::Float32.size_in_bytes(), 4);
        assert_eq!(DType::Int32.size_in_bytes(), 4);
        assert_eq!(DType::Uint32.size_in_bytes(), 4);
        assert_eq!(DType::Bool.size_in_bytes(), 1);
        assert_eq!(DType::Complex64.size_in_bytes(), 8);
    }

    #[test]
    fn test_scalar_roundtrip() {
        let mut buf = vec![0u8; 16];
        Scalar::F32(1.5).write_to(&mut buf, 0).unwrap();
        Scalar::F32(-2.25).write_to(&mut buf, 1).unwrap();
        assert_eq!(
            Scalar::read_from(&buf, DType::Float32, 0).unwrap(),
            Scalar::F32(1.5)
        );
        assert_eq!(
            Scalar::read_from(&buf, DType::Float32, 1).unwrap(),
            Scalar::F32(-2.25)
        );
    }

    #[test]
    fn test_complex_roundtrip() {
        let mut buf = vec![0u8; 8];
        let z = Scalar::C64(Complex32::new(1.0, -3.5));
        z.write_to(&mut buf, 0).unwrap();
        assert_eq!(Scalar::read_from(&buf, DType::Complex64, 0).unwrap(), z);
    }

    #[test]
    fn test_scalar_display_trims_whole_floats() {
        assert_eq!(Scalar::F32(2.0).to_string(), "2");
        assert_eq!(Scalar::F32(0.5).to_string(), "0.5");
        assert_eq!(Scalar::I32(-3).to_string(), "-3");
    }
}
