//! Tests for the view algebra.
//!
//! The central property: the numeric and symbolic lowerings agree. For
//! every tracker under test we enumerate all logical indices, evaluate the
//! `to_alu_exp` pair with the reference interpreter, and compare against
//! `offset_and_valid`.

use std::collections::HashMap;

use pretty_assertions::assert_eq;

use super::*;
use crate::alu::NoBuffers;

fn all_indices(shape: &[usize]) -> Vec<Vec<i64>> {
    let mut out = vec![vec![]];
    for &d in shape {
        let mut next = Vec::new();
        for prefix in &out {
            for i in 0..d as i64 {
                let mut v = prefix.clone();
                v.push(i);
                next.push(v);
            }
        }
        out = next;
    }
    out
}

/// Assert the symbolic lowering matches the numeric one everywhere.
fn check_lowerings_agree(t: &ShapeTracker) {
    let shape = t.shape().to_vec();
    let indices: Vec<AluExp> = shape
        .iter()
        .enumerate()
        .map(|(k, &d)| AluExp::special(format!("i{k}"), d))
        .collect();
    let (off_exp, valid_exp) = t.to_alu_exp(&indices).unwrap();
    for idx in all_indices(&shape) {
        let ctx: HashMap<String, i64> = idx
            .iter()
            .enumerate()
            .map(|(k, &v)| (format!("i{k}"), v))
            .collect();
        let (off, valid) = t.offset_and_valid(&idx);
        let sym_valid = valid_exp
            .evaluate(&ctx, &NoBuffers)
            .unwrap()
            .as_bool()
            .unwrap();
        assert_eq!(sym_valid, valid, "validity mismatch at {idx:?}");
        if valid {
            let sym_off = off_exp
                .evaluate(&ctx, &NoBuffers)
                .unwrap()
                .as_i64()
                .unwrap();
            assert_eq!(sym_off, off, "offset mismatch at {idx:?}");
        }
    }
}

#[test]
fn test_contiguous_layout() {
    let t = ShapeTracker::contiguous(&[2, 3]);
    assert!(t.is_contiguous());
    assert_eq!(t.offset_and_valid(&[0, 0]), (0, true));
    assert_eq!(t.offset_and_valid(&[1, 2]), (5, true));
    check_lowerings_agree(&t);
}

#[test]
fn test_scalar_tracker() {
    let t = ShapeTracker::contiguous(&[]);
    assert_eq!(t.size(), 1);
    assert_eq!(t.offset_and_valid(&[]), (0, true));
    check_lowerings_agree(&t);
}

#[test]
fn test_permute() {
    let t = ShapeTracker::contiguous(&[2, 3]).permute(&[1, 0]).unwrap();
    assert_eq!(t.shape(), &[3, 2]);
    // [j][i] reads original [i][j]
    assert_eq!(t.offset_and_valid(&[2, 1]), (5, true));
    check_lowerings_agree(&t);
}

#[test]
fn test_broadcast_stride_zero() {
    let t = ShapeTracker::contiguous(&[3]).broadcast(&[4, 3], &[0]).unwrap();
    assert_eq!(t.shape(), &[4, 3]);
    for i in 0..4 {
        assert_eq!(t.offset_and_valid(&[i, 2]), (2, true));
    }
    check_lowerings_agree(&t);
}

#[test]
fn test_broadcast_stretches_unit_dims() {
    let t = ShapeTracker::contiguous(&[1, 3]).broadcast(&[5, 3], &[]).unwrap();
    assert_eq!(t.shape(), &[5, 3]);
    assert_eq!(t.offset_and_valid(&[4, 1]), (1, true));
    check_lowerings_agree(&t);
}

#[test]
fn test_pad_masks_border() {
    let t = ShapeTracker::contiguous(&[2]).pad(&[(1, 2)]).unwrap();
    assert_eq!(t.shape(), &[5]);
    assert_eq!(t.offset_and_valid(&[0]), (0, false));
    assert_eq!(t.offset_and_valid(&[1]), (0, true));
    assert_eq!(t.offset_and_valid(&[2]), (1, true));
    assert_eq!(t.offset_and_valid(&[3]).1, false);
    assert_eq!(t.offset_and_valid(&[4]).1, false);
    check_lowerings_agree(&t);
}

#[test]
fn test_shrink() {
    let t = ShapeTracker::contiguous(&[4, 4]).shrink(&[(1, 3), (2, 4)]).unwrap();
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.offset_and_valid(&[0, 0]), (6, true));
    assert_eq!(t.offset_and_valid(&[1, 1]), (11, true));
    check_lowerings_agree(&t);
}

#[test]
fn test_pad_then_shrink_roundtrip() {
    let base = ShapeTracker::contiguous(&[3]);
    let padded = base.pad(&[(2, 2)]).unwrap();
    let back = padded.shrink(&[(2, 5)]).unwrap();
    assert_eq!(back.shape(), &[3]);
    for i in 0..3 {
        assert_eq!(back.offset_and_valid(&[i]), (i, true));
    }
    check_lowerings_agree(&back);
}

#[test]
fn test_pad_or_shrink_signed() {
    // negative shrinks, positive pads
    let t = ShapeTracker::contiguous(&[5])
        .pad_or_shrink(&[(-1, 2)])
        .unwrap();
    assert_eq!(t.shape(), &[6]);
    // first element dropped, two invalid at the end
    assert_eq!(t.offset_and_valid(&[0]), (1, true));
    assert_eq!(t.offset_and_valid(&[3]), (4, true));
    assert_eq!(t.offset_and_valid(&[4]).1, false);
    check_lowerings_agree(&t);
}

#[test]
fn test_flip() {
    let t = ShapeTracker::contiguous(&[4]).flip(&[true]).unwrap();
    assert_eq!(t.offset_and_valid(&[0]), (3, true));
    assert_eq!(t.offset_and_valid(&[3]), (0, true));
    check_lowerings_agree(&t);
}

#[test]
fn test_flip_with_mask() {
    let t = ShapeTracker::contiguous(&[2])
        .pad(&[(1, 0)])
        .unwrap()
        .flip(&[true])
        .unwrap();
    assert_eq!(t.shape(), &[3]);
    assert_eq!(t.offset_and_valid(&[0]), (1, true));
    assert_eq!(t.offset_and_valid(&[1]), (0, true));
    assert_eq!(t.offset_and_valid(&[2]).1, false);
    check_lowerings_agree(&t);
}

#[test]
fn test_repeat_tiles_with_modulo() {
    let t = ShapeTracker::contiguous(&[3]).repeat(&[2]).unwrap();
    assert_eq!(t.shape(), &[6]);
    for i in 0..6i64 {
        assert_eq!(t.offset_and_valid(&[i]), (i % 3, true));
    }
    check_lowerings_agree(&t);
}

#[test]
fn test_moveaxis() {
    let t = ShapeTracker::contiguous(&[2, 3, 4]).moveaxis(2, 0).unwrap();
    assert_eq!(t.shape(), &[4, 2, 3]);
    assert_eq!(t.offset_and_valid(&[1, 0, 2]), (2 * 4 + 1, true));
    check_lowerings_agree(&t);
}

#[test]
fn test_reshape_merges_contiguous_runs() {
    let t = ShapeTracker::contiguous(&[2, 3, 4]).reshape(&[6, 4]).unwrap();
    assert_eq!(t.views().len(), 1, "contiguous merge must not push a view");
    assert_eq!(t.offset_and_valid(&[5, 3]), (23, true));
    check_lowerings_agree(&t);
}

#[test]
fn test_reshape_of_permuted_view_pushes() {
    let t = ShapeTracker::contiguous(&[2, 3])
        .permute(&[1, 0])
        .unwrap()
        .reshape(&[6])
        .unwrap();
    assert_eq!(t.views().len(), 2, "non-mergeable reshape pushes a view");
    // flat index k of the transpose reads original [k % 2][k / 2]
    for k in 0..6i64 {
        let (i, j) = (k % 2, k / 2);
        assert_eq!(t.offset_and_valid(&[k]), (i * 3 + j, true));
    }
    check_lowerings_agree(&t);
}

#[test]
fn test_reshape_same_shape_is_identity() {
    let t = ShapeTracker::contiguous(&[2, 3]).permute(&[1, 0]).unwrap();
    let r = t.reshape(&[3, 2]).unwrap();
    assert_eq!(t, r);
}

#[test]
fn test_reshape_split_axis() {
    let t = ShapeTracker::contiguous(&[6]).reshape(&[2, 3]).unwrap();
    assert_eq!(t.views().len(), 1);
    assert_eq!(t.offset_and_valid(&[1, 2]), (5, true));
    check_lowerings_agree(&t);
}

#[test]
fn test_reshape_wrong_count_errors() {
    let t = ShapeTracker::contiguous(&[2, 3]);
    assert!(t.reshape(&[7]).is_err());
}

#[test]
fn test_compose() {
    let inner = ShapeTracker::contiguous(&[2, 3]).permute(&[1, 0]).unwrap();
    let outer = ShapeTracker::contiguous(&[3, 2]).flip(&[true, false]).unwrap();
    let t = outer.compose(&inner).unwrap();
    assert_eq!(t.shape(), &[3, 2]);
    // outer flips axis 0 of the transposed view
    assert_eq!(
        t.offset_and_valid(&[0, 0]),
        inner.offset_and_valid(&[2, 0])
    );
    check_lowerings_agree(&t);
}

#[test]
fn test_masked_view_through_reshape_stays_correct() {
    // pad then flatten through a pushed view; validity must survive
    let t = ShapeTracker::contiguous(&[2, 2])
        .pad(&[(1, 0), (0, 1)])
        .unwrap()
        .reshape(&[9])
        .unwrap();
    let mut valid_count = 0;
    for k in 0..9 {
        if t.offset_and_valid(&[k]).1 {
            valid_count += 1;
        }
    }
    assert_eq!(valid_count, 4);
    check_lowerings_agree(&t);
}

#[test]
fn test_zero_size_dims() {
    let t = ShapeTracker::contiguous(&[2, 0, 3]);
    assert_eq!(t.size(), 0);
    assert_eq!(t.ndim(), 3);
}
