//! Shape, stride and permutation helpers shared by the view algebra.

use crate::error::IrError;

/// Number of elements in a shape. The empty shape (a scalar) has one.
pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major (C-contiguous) strides, in elements.
pub fn contiguous_strides(shape: &[usize]) -> Vec<isize> {
    let mut strides = vec![0isize; shape.len()];
    let mut acc = 1isize;
    for (k, &dim) in shape.iter().enumerate().rev() {
        strides[k] = acc;
        acc *= dim as isize;
    }
    strides
}

/// Check that `perm` is a permutation of `0..n`.
pub fn check_permutation(perm: &[usize], n: usize) -> Result<(), IrError> {
    if perm.len() != n {
        return Err(IrError::Shape(format!(
            "permutation of length {} applied to {} axes",
            perm.len(),
            n
        )));
    }
    let mut seen = vec![false; n];
    for &p in perm {
        if p >= n || seen[p] {
            return Err(IrError::Shape(format!("invalid permutation {perm:?}")));
        }
        seen[p] = true;
    }
    Ok(())
}

/// Reorder `items` so that output position `k` holds `items[perm[k]]`.
pub fn apply_permutation<T: Clone>(items: &[T], perm: &[usize]) -> Vec<T> {
    perm.iter().map(|&p| items[p].clone()).collect()
}

/// Inverse permutation: `invert(p)[p[k]] == k`.
pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; perm.len()];
    for (k, &p) in perm.iter().enumerate() {
        inv[p] = k;
    }
    inv
}
