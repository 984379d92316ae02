//! Forward-mode and linearization scenarios.

use gradfuse::tree::{flatten, Tree};
use gradfuse::{jvp, jvp_flat, linearize, linearize_flat, ops, Array, CoreError, Value};

fn close(a: f32, b: f32) {
    assert!((a - b).abs() < 1e-4, "{a} != {b}");
}

#[test]
fn test_jvp_basic_product_rule() {
    // d(x * sin(x)) = sin(x) + x cos(x)
    let f = |xs: &[Value]| Ok(vec![ops::mul(&xs[0], &ops::sin(&xs[0])?)?]);
    let x = 1.3f32;
    let (primals, tangents) =
        jvp_flat(f, &[Value::from(x)], &[Value::from(1.0f32)]).unwrap();
    close(primals[0].item_f32().unwrap(), x * x.sin());
    close(tangents[0].item_f32().unwrap(), x.sin() + x * x.cos());
}

#[test]
fn test_jvp_zero_tangents_stay_zero() {
    // jvp(f, x, zeros) has elementwise-zero tangents
    let f = |xs: &[Value]| {
        let y = ops::exp(&ops::sin(&xs[0])?)?;
        Ok(vec![ops::reduce_sum(&y, &[0])?])
    };
    let x = Value::from(Array::from_f32(&[0.1, 0.2, 0.3], &[3]).unwrap());
    let zeros = ops::zeros_like(&x).unwrap();
    let (_, tangents) = jvp_flat(f, &[x], &[zeros]).unwrap();
    assert_eq!(tangents[0].to_f32_vec().unwrap(), vec![0.0]);
}

#[test]
fn test_jvp_tangent_aval_mismatch_is_an_error() {
    let f = |xs: &[Value]| Ok(vec![xs[0].clone()]);
    let x = Value::from(Array::from_f32(&[1.0, 2.0], &[2]).unwrap());
    let bad_tangent = Value::from(Array::from_f32(&[1.0, 2.0, 3.0], &[3]).unwrap());
    let err = jvp_flat(f, &[x], &[bad_tangent]).unwrap_err();
    assert!(matches!(err, CoreError::Type(_)), "{err}");
}

#[test]
fn test_jvp_tree_structure_mismatch() {
    let f = |t: &Tree| Ok(t.clone());
    let primals = Tree::dict([("a", Tree::leaf(1.0f32))]);
    let tangents = Tree::dict([("b", Tree::leaf(1.0f32))]);
    let err = jvp(f, &primals, &tangents).unwrap_err();
    assert!(matches!(err, CoreError::TreeMismatch(_)), "{err}");
}

#[test]
fn test_linearize_sin_at_3() {
    let (primals, lin) =
        linearize_flat(|xs| Ok(vec![ops::sin(&xs[0])?]), &[Value::from(3.0f32)]).unwrap();
    close(primals[0].item_f32().unwrap(), 3.0f32.sin());
    let out = lin.call(&[Value::from(1.0f32)]).unwrap();
    close(out[0].item_f32().unwrap(), 3.0f32.cos());
    let out = lin.call(&[Value::from(-42.0f32)]).unwrap();
    close(out[0].item_f32().unwrap(), -42.0 * 3.0f32.cos());
}

#[test]
fn test_linearize_is_linear() {
    // lin(a*u + b*v) == a*lin(u) + b*lin(v)
    let f = |xs: &[Value]| {
        let y = ops::mul(&xs[0], &ops::cos(&xs[0])?)?;
        Ok(vec![ops::sum_all(&y)?])
    };
    let x = Value::from(Array::from_f32(&[0.4, 1.1, -0.6], &[3]).unwrap());
    let (_, lin) = linearize_flat(f, &[x]).unwrap();

    let u = Value::from(Array::from_f32(&[1.0, 0.5, -2.0], &[3]).unwrap());
    let v = Value::from(Array::from_f32(&[0.3, -1.0, 0.8], &[3]).unwrap());
    let (a, b) = (2.5f32, -1.25f32);

    let au = ops::mul(&u, &Value::from(a)).unwrap();
    let bv = ops::mul(&v, &Value::from(b)).unwrap();
    let combined = ops::add(&au, &bv).unwrap();

    let lhs = lin.call(&[combined]).unwrap()[0].item_f32().unwrap();
    let lin_u = lin.call(&[u]).unwrap()[0].item_f32().unwrap();
    let lin_v = lin.call(&[v]).unwrap()[0].item_f32().unwrap();
    close(lhs, a * lin_u + b * lin_v);
}

#[test]
fn test_linearize_tree_scenario() {
    // inputs {a, b}; outputs {r1 = a*a + b, r2 = b}
    let f = |t: &Tree| {
        let a = t.get("a")?.expect_leaf()?;
        let b = t.get("b")?.expect_leaf()?;
        let r1 = ops::add(&ops::mul(a, a)?, b)?;
        Ok(Tree::dict([
            ("r1", Tree::Leaf(r1)),
            ("r2", Tree::Leaf(b.clone())),
        ]))
    };
    let primals = Tree::dict([
        ("a", Tree::leaf(1.0f32)),
        ("b", Tree::leaf(2.0f32)),
    ]);
    let (y, lin) = linearize(f, &primals).unwrap();
    close(y.get("r1").unwrap().expect_leaf().unwrap().item_f32().unwrap(), 3.0);
    close(y.get("r2").unwrap().expect_leaf().unwrap().item_f32().unwrap(), 2.0);

    let tangents = Tree::dict([
        ("a", Tree::leaf(1.0f32)),
        ("b", Tree::leaf(0.0f32)),
    ]);
    let dy = lin(&tangents).unwrap();
    close(dy.get("r1").unwrap().expect_leaf().unwrap().item_f32().unwrap(), 2.0);
    close(dy.get("r2").unwrap().expect_leaf().unwrap().item_f32().unwrap(), 0.0);
}

#[test]
fn test_linearize_tangent_program_typechecks() {
    let f = |xs: &[Value]| {
        let y = ops::mul(&ops::sin(&xs[0])?, &xs[0])?;
        Ok(vec![ops::sum_all(&y)?])
    };
    let x = Value::from(Array::from_f32(&[0.2, 0.4], &[2]).unwrap());
    let (_, lin) = linearize_flat(f, &[x]).unwrap();
    lin.jaxpr()
        .flatten()
        .unwrap()
        .simplify()
        .unwrap()
        .typecheck()
        .unwrap();
}

#[test]
fn test_flatten_preserves_leaf_order() {
    let tree = Tree::dict([
        ("x", Tree::leaf(1.0f32)),
        ("y", Tree::List(vec![Tree::leaf(2.0f32), Tree::leaf(3.0f32)])),
    ]);
    let (leaves, _) = flatten(&tree);
    let values: Vec<f32> = leaves.iter().map(|v| v.item_f32().unwrap()).collect();
    assert_eq!(values, vec![1.0, 2.0, 3.0]);
}
