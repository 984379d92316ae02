//! Abstract values: the `(shape, dtype)` summary of a tensor.

use std::fmt;

use gradfuse_ir::DType;
use serde::{Deserialize, Serialize};

/// Shape and dtype of a tensor, without its storage. Every tracer and IR
/// binder carries exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapedArray {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl ShapedArray {
    pub fn new(shape: Vec<usize>, dtype: DType) -> ShapedArray {
        ShapedArray { shape, dtype }
    }

    pub fn scalar(dtype: DType) -> ShapedArray {
        ShapedArray {
            shape: vec![],
            dtype,
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Element count; 1 for the empty shape.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.size() * self.dtype.size_in_bytes()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }
}

impl fmt::Display for ShapedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (k, d) in self.shape.iter().enumerate() {
            if k > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let a = ShapedArray::new(vec![2, 3], DType::Float32);
        assert_eq!(a.to_string(), "float32[2,3]");
        assert_eq!(ShapedArray::scalar(DType::Bool).to_string(), "bool[]");
    }

    #[test]
    fn test_scalar_size() {
        assert_eq!(ShapedArray::scalar(DType::Float32).size(), 1);
        assert_eq!(ShapedArray::new(vec![4, 5], DType::Int32).size(), 20);
    }
}
