//! Tests for the scalar expression IR.

use std::collections::HashMap;

use pretty_assertions::assert_eq;

use super::*;
use crate::tracker::ShapeTracker;

fn eval_int(e: &AluExp, ctx: &[(&str, i64)]) -> i64 {
    let ctx: HashMap<String, i64> = ctx.iter().map(|&(n, v)| (n.to_string(), v)).collect();
    e.evaluate(&ctx, &NoBuffers)
        .unwrap()
        .as_i64()
        .expect("integer result")
}

#[test]
fn test_constant_folding() {
    let e = AluExp::add(AluExp::f32(2.0), AluExp::f32(3.0)).unwrap();
    assert_eq!(e.resolve(), Some(Scalar::F32(5.0)));

    let e = AluExp::mul(AluExp::index(6), AluExp::index(7)).unwrap();
    assert_eq!(e.resolve(), Some(Scalar::I32(42)));
}

#[test]
fn test_identities() {
    let x = AluExp::special("x", 10);
    assert_eq!(AluExp::add(x.clone(), AluExp::index(0)).unwrap(), x);
    assert_eq!(AluExp::add(AluExp::index(0), x.clone()).unwrap(), x);
    assert_eq!(AluExp::mul(x.clone(), AluExp::index(1)).unwrap(), x);
    assert_eq!(
        AluExp::mul(x.clone(), AluExp::index(0)).unwrap().resolve(),
        Some(Scalar::I32(0))
    );
    assert_eq!(AluExp::sub(x.clone(), AluExp::index(0)).unwrap(), x);
}

#[test]
fn test_where_folding() {
    let a = AluExp::special("a", 4);
    let b = AluExp::special("b", 4);
    assert_eq!(
        AluExp::where_(AluExp::bool_const(true), a.clone(), b.clone()).unwrap(),
        a
    );
    assert_eq!(
        AluExp::where_(AluExp::bool_const(false), a.clone(), b.clone()).unwrap(),
        b
    );
}

#[test]
fn test_double_negation() {
    // a non-constant float term: a buffer read
    let e = AluExp::global_index(0, AluExp::special("i", 4), DType::Float32).unwrap();
    let n = AluExp::neg(AluExp::neg(e.clone()).unwrap()).unwrap();
    assert_eq!(n, e);
}

#[test]
fn test_comparison_self() {
    let x = AluExp::special("x", 8);
    assert_eq!(
        AluExp::cmplt(x.clone(), x.clone()).unwrap().resolve(),
        Some(Scalar::Bool(false))
    );
    assert_eq!(
        AluExp::cmpeq(x.clone(), x.clone()).unwrap().resolve(),
        Some(Scalar::Bool(true))
    );
    assert_eq!(
        AluExp::cmpne(x.clone(), x).unwrap().resolve(),
        Some(Scalar::Bool(false))
    );
}

#[test]
fn test_interval_tightening() {
    // x in [0, 7], so x < 8 is always true and x < 0 is always false
    let x = AluExp::special("x", 8);
    assert_eq!(
        AluExp::cmplt(x.clone(), AluExp::index(8)).unwrap().resolve(),
        Some(Scalar::Bool(true))
    );
    assert_eq!(
        AluExp::cmplt(x.clone(), AluExp::index(0)).unwrap().resolve(),
        Some(Scalar::Bool(false))
    );
    // -1 < x is always true
    assert_eq!(
        AluExp::cmplt(AluExp::index(-1), x).unwrap().resolve(),
        Some(Scalar::Bool(true))
    );
}

#[test]
fn test_mod_and_idiv_elision() {
    // x in [0, 5): x % 5 = x, x / 5 = 0
    let x = AluExp::special("x", 5);
    assert_eq!(AluExp::modulo(x.clone(), AluExp::index(5)).unwrap(), x);
    assert_eq!(
        AluExp::idiv(x, AluExp::index(5)).unwrap().resolve(),
        Some(Scalar::I32(0))
    );
}

#[test]
fn test_min_max_propagation() {
    let x = AluExp::special("x", 4); // [0, 3]
    let y = AluExp::special("y", 3); // [0, 2]
    let sum = AluExp::add(x.clone(), y.clone()).unwrap();
    assert_eq!(sum.min(), Some(0.0));
    assert_eq!(sum.max(), Some(5.0));
    let prod = AluExp::mul(x, AluExp::index(7)).unwrap();
    assert_eq!(prod.min(), Some(0.0));
    assert_eq!(prod.max(), Some(21.0));
}

#[test]
fn test_float_only_unary_rejects_int() {
    let x = AluExp::special("x", 4);
    assert!(AluExp::sin(x.clone()).is_err());
    assert!(AluExp::neg(x).is_err());
}

#[test]
fn test_where_requires_bool_condition() {
    let c = AluExp::index(1);
    assert!(AluExp::where_(c, AluExp::f32(1.0), AluExp::f32(2.0)).is_err());
}

#[test]
fn test_evaluate_floor_division() {
    let x = AluExp::special("x", 100);
    let q = AluExp::idiv(
        AluExp::sub(x.clone(), AluExp::index(50)).unwrap(),
        AluExp::index(7),
    )
    .unwrap();
    // floor(-half / 7), not truncation
    assert_eq!(eval_int(&q, &[("x", 1)]), -7);
    assert_eq!(eval_int(&q, &[("x", 49)]), -1);
    assert_eq!(eval_int(&q, &[("x", 57)]), 1);
    // Mod = x - Idiv(x, y) * y, always in [0, y)
    let m = AluExp::modulo(
        AluExp::sub(x, AluExp::index(50)).unwrap(),
        AluExp::index(7),
    )
    .unwrap();
    assert_eq!(eval_int(&m, &[("x", 1)]), 0);
    assert!((0..7).contains(&eval_int(&m, &[("x", 3)])));
}

#[test]
fn test_evaluate_bool_semantics() {
    let t = AluExp::bool_const(true);
    let f = AluExp::bool_const(false);
    // bool Add is OR, bool Mul is AND
    assert_eq!(
        AluExp::add(t.clone(), f.clone()).unwrap().resolve(),
        Some(Scalar::Bool(true))
    );
    assert_eq!(
        AluExp::mul(t, f).unwrap().resolve(),
        Some(Scalar::Bool(false))
    );
}

#[test]
fn test_substitute() {
    let x = AluExp::special("x", 10);
    let e = AluExp::add(
        AluExp::mul(x.clone(), AluExp::index(3)).unwrap(),
        AluExp::index(2),
    )
    .unwrap();
    let env: HashMap<String, AluExp> = [("x".to_string(), AluExp::index(4))].into();
    let r = e.substitute(&env).unwrap();
    assert_eq!(r.resolve(), Some(Scalar::I32(14)));
}

#[test]
fn test_substitute_composition_with_disjoint_domains() {
    // substitute(substitute(e, s1), s2) == substitute(e, s1 then s2)
    let e = AluExp::add(
        AluExp::special("a", 10),
        AluExp::mul(AluExp::special("b", 10), AluExp::index(2)).unwrap(),
    )
    .unwrap();
    let s1: HashMap<String, AluExp> = [("a".to_string(), AluExp::special("c", 5))].into();
    let s2: HashMap<String, AluExp> = [("b".to_string(), AluExp::index(3))].into();
    let seq = e.substitute(&s1).unwrap().substitute(&s2).unwrap();
    let mut joint = s1.clone();
    joint.extend(s2.clone());
    let once = e.substitute(&joint).unwrap();
    assert_eq!(seq, once);
}

#[test]
fn test_rewrite_reaches_fixpoint() {
    // rewrite x -> x (identity) terminates and preserves the term
    let e = AluExp::add(AluExp::special("x", 4), AluExp::index(1)).unwrap();
    let r = e.rewrite(&mut |_| None).unwrap();
    assert_eq!(r, e);

    // rewrite every Special to a constant, bottom-up
    let r = e
        .rewrite(&mut |n| match n.arg() {
            AluArg::Special { .. } => Some(AluExp::index(2)),
            _ => None,
        })
        .unwrap();
    assert_eq!(r.resolve(), Some(Scalar::I32(3)));
}

#[test]
fn test_simplifier_idempotent() {
    // rebuilding an already-simplified expression changes nothing
    let e = AluExp::add(
        AluExp::mul(AluExp::special("g", 12), AluExp::index(3)).unwrap(),
        AluExp::special("r", 4),
    )
    .unwrap();
    let again = e.rewrite(&mut |_| None).unwrap();
    assert_eq!(e, again);
}

#[test]
fn test_collect() {
    let e = AluExp::add(
        AluExp::special("a", 2),
        AluExp::mul(AluExp::special("b", 3), AluExp::special("a", 2)).unwrap(),
    )
    .unwrap();
    let specials = e.collect(&|n| n.op() == AluOp::Special);
    assert_eq!(specials.len(), 3);
}

#[test]
fn test_reindex_gids() {
    let t = ShapeTracker::contiguous(&[4]);
    let idx = vec![AluExp::special("i", 4)];
    let e = AluExp::global_view(0, t, idx, DType::Float32).unwrap();
    let map: HashMap<usize, usize> = [(0, 2)].into();
    let r = e.reindex_gids(&map).unwrap();
    match r.arg() {
        AluArg::View { gid, .. } => assert_eq!(*gid, 2),
        other => panic!("expected view arg, got {other:?}"),
    }
    // unmapped gid is an error
    let empty = HashMap::new();
    assert!(e.reindex_gids(&empty).is_err());
}

#[test]
fn test_global_view_reads_through_tracker() {
    struct Buf(Vec<f32>);
    impl BufferReader for Buf {
        fn read_global(&self, _gid: usize, offset: i64, _dtype: DType) -> crate::IrResult<Scalar> {
            Ok(Scalar::F32(self.0[offset as usize]))
        }
    }
    let t = ShapeTracker::contiguous(&[2, 2]).permute(&[1, 0]).unwrap();
    let e = AluExp::global_view(
        0,
        t,
        vec![AluExp::special("i", 2), AluExp::special("j", 2)],
        DType::Float32,
    )
    .unwrap();
    let buf = Buf(vec![0.0, 1.0, 2.0, 3.0]);
    let ctx: HashMap<String, i64> = [("i".to_string(), 0), ("j".to_string(), 1)].into();
    // transposed read: [i=0][j=1] reads original [1][0] = 2.0
    assert_eq!(e.evaluate(&ctx, &buf).unwrap(), Scalar::F32(2.0));
}
