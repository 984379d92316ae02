//! Eager (eval-trace) operation semantics: kernels over concrete
//! arrays, zero-copy views, broadcasting, and the scalar fast path.

use gradfuse::{ops, Array, DType, Scalar, Value};

fn array(values: &[f32], shape: &[usize]) -> Value {
    Value::from(Array::from_f32(values, shape).unwrap())
}

#[test]
fn test_scalar_arithmetic_folds_on_host() {
    let out = ops::add(&Value::from(2.0f32), &Value::from(3.0f32)).unwrap();
    assert!(matches!(out, Value::Lit(Scalar::F32(v)) if v == 5.0));
}

#[test]
fn test_elementwise_add_and_mul() {
    let x = array(&[1.0, 2.0, 3.0], &[3]);
    let y = array(&[10.0, 20.0, 30.0], &[3]);
    let sum = ops::add(&x, &y).unwrap();
    assert_eq!(sum.to_f32_vec().unwrap(), vec![11.0, 22.0, 33.0]);
    let product = ops::mul(&x, &y).unwrap();
    assert_eq!(product.to_f32_vec().unwrap(), vec![10.0, 40.0, 90.0]);
}

#[test]
fn test_scalar_broadcasts_into_kernel() {
    let x = array(&[1.0, 2.0, 3.0], &[3]);
    let shifted = ops::add(&x, &Value::from(0.5f32)).unwrap();
    assert_eq!(shifted.to_f32_vec().unwrap(), vec![1.5, 2.5, 3.5]);
}

#[test]
fn test_row_broadcast() {
    // [2,3] + [3] broadcasts the row
    let x = array(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let row = array(&[10.0, 20.0, 30.0], &[3]);
    let out = ops::add(&x, &row).unwrap();
    assert_eq!(
        out.to_f32_vec().unwrap(),
        vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
    );
}

#[test]
fn test_incompatible_broadcast_is_type_error() {
    let x = array(&[1.0, 2.0], &[2]);
    let y = array(&[1.0, 2.0, 3.0], &[3]);
    assert!(ops::add(&x, &y).is_err());
}

#[test]
fn test_sub_and_div_compose() {
    let x = array(&[4.0, 9.0], &[2]);
    let y = array(&[1.0, 3.0], &[2]);
    assert_eq!(ops::sub(&x, &y).unwrap().to_f32_vec().unwrap(), vec![3.0, 6.0]);
    assert_eq!(ops::div(&x, &y).unwrap().to_f32_vec().unwrap(), vec![4.0, 3.0]);
}

#[test]
fn test_unary_kernels() {
    let x = array(&[0.0, 1.0], &[2]);
    let s = ops::sin(&x).unwrap().to_f32_vec().unwrap();
    assert!((s[0] - 0.0).abs() < 1e-6);
    assert!((s[1] - 1.0f32.sin()).abs() < 1e-6);
    let e = ops::exp(&x).unwrap().to_f32_vec().unwrap();
    assert!((e[1] - std::f32::consts::E).abs() < 1e-5);
}

#[test]
fn test_reduce_sum_axes() {
    let x = array(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let rows = ops::reduce_sum(&x, &[1]).unwrap();
    assert_eq!(rows.to_f32_vec().unwrap(), vec![6.0, 15.0]);
    let cols = ops::reduce_sum(&x, &[0]).unwrap();
    assert_eq!(cols.to_f32_vec().unwrap(), vec![5.0, 7.0, 9.0]);
    let all = ops::reduce_sum(&x, &[0, 1]).unwrap();
    assert_eq!(all.to_f32_vec().unwrap(), vec![21.0]);
}

#[test]
fn test_transpose_is_zero_copy_view() {
    let x = array(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let t = ops::transpose(&x, &[1, 0]).unwrap();
    assert_eq!(t.shape(), vec![3, 2]);
    assert_eq!(
        t.to_f32_vec().unwrap(),
        vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
    );
    // kernels read views correctly too
    let doubled = ops::add(&t, &t).unwrap();
    assert_eq!(
        doubled.to_f32_vec().unwrap(),
        vec![2.0, 8.0, 4.0, 10.0, 6.0, 12.0]
    );
}

#[test]
fn test_reshape_and_flip() {
    let x = array(&[1.0, 2.0, 3.0, 4.0], &[4]);
    let grid = ops::reshape(&x, &[2, 2]).unwrap();
    assert_eq!(grid.shape(), vec![2, 2]);
    let flipped = ops::flip(&x, &[0]).unwrap();
    assert_eq!(flipped.to_f32_vec().unwrap(), vec![4.0, 3.0, 2.0, 1.0]);
}

#[test]
fn test_moveaxis() {
    let x = array(&(0..24).map(|i| i as f32).collect::<Vec<_>>(), &[2, 3, 4]);
    let moved = ops::moveaxis(&x, 2, 0).unwrap();
    assert_eq!(moved.shape(), vec![4, 2, 3]);
    // element [i,j,k] of the moved array is [j,k,i] of the original
    let v = moved.to_f32_vec().unwrap();
    assert_eq!(v[0], 0.0);
    assert_eq!(v[1], 4.0);
}

#[test]
fn test_compare_and_where() {
    let x = array(&[1.0, 5.0, 3.0], &[3]);
    let y = array(&[4.0, 2.0, 3.0], &[3]);
    let lt = ops::cmp_lt(&x, &y).unwrap();
    assert_eq!(lt.dtype(), DType::Bool);
    let picked = ops::where_(&lt, &x, &y).unwrap();
    assert_eq!(picked.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0]);

    let eq = ops::cmp_eq(&x, &y).unwrap();
    let only_equal = ops::where_(&eq, &x, &ops::zeros_like(&x).unwrap()).unwrap();
    assert_eq!(only_equal.to_f32_vec().unwrap(), vec![0.0, 0.0, 3.0]);
}

#[test]
fn test_zeros_and_ones_like() {
    let x = array(&[1.0, 2.0], &[2]);
    assert_eq!(
        ops::zeros_like(&x).unwrap().to_f32_vec().unwrap(),
        vec![0.0, 0.0]
    );
    assert_eq!(
        ops::ones_like(&x).unwrap().to_f32_vec().unwrap(),
        vec![1.0, 1.0]
    );
}

#[test]
fn test_chained_views_then_kernel() {
    // transpose then flip then an elementwise kernel over the composed view
    let x = array(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let t = ops::transpose(&x, &[1, 0]).unwrap();
    let tf = ops::flip(&t, &[0]).unwrap();
    let out = ops::mul(&tf, &Value::from(10.0f32)).unwrap();
    // transpose: [[1,3],[2,4]]; flip axis 0: [[2,4],[1,3]]
    assert_eq!(out.to_f32_vec().unwrap(), vec![20.0, 40.0, 10.0, 30.0]);
}
