//! Tests for the program IR: text format, typecheck, flatten, simplify.

use gradfuse_ir::{DType, Scalar};
use pretty_assertions::assert_eq;

use super::*;
use crate::jit::{jit, make_jaxpr};
use crate::ops;
use crate::value::Value;

fn f32_aval(shape: &[usize]) -> ShapedArray {
    ShapedArray::new(shape.to_vec(), DType::Float32)
}

#[test]
fn test_pretty_print_golden() {
    // tracing x -> (x + 2) * x over float32[2,3]
    let (jaxpr, consts) = make_jaxpr(
        |xs| {
            let y = ops::add(&xs[0], &Value::from(2.0f32))?;
            let z = ops::mul(&y, &xs[0])?;
            Ok(vec![z])
        },
        &[f32_aval(&[2, 3])],
    )
    .unwrap();
    assert!(consts.is_empty());
    insta::assert_snapshot!(jaxpr.to_string(), @r"
    { lambda a:float32[2,3] .
      let b:float32[2,3] = add a 2
          c:float32[2,3] = mul b a
      in ( c ) }
    ");
}

#[test]
fn test_pretty_print_params() {
    let (jaxpr, _) = make_jaxpr(
        |xs| Ok(vec![ops::reduce_sum(&xs[0], &[0])?]),
        &[f32_aval(&[4, 5])],
    )
    .unwrap();
    insta::assert_snapshot!(jaxpr.to_string(), @r"
    { lambda a:float32[4,5] .
      let b:float32[5] = reduce_sum[axes=[0]] a
      in ( b ) }
    ");
}

#[test]
fn test_typecheck_accepts_traced_programs() {
    let (jaxpr, _) = make_jaxpr(
        |xs| {
            let s = ops::sin(&xs[0])?;
            let c = ops::cos(&xs[0])?;
            let m = ops::mul(&s, &c)?;
            Ok(vec![ops::reduce_sum(&m, &[0])?])
        },
        &[f32_aval(&[8, 3])],
    )
    .unwrap();
    jaxpr.typecheck().unwrap();
}

#[test]
fn test_typecheck_rejects_unbound_var() {
    let a = Var::fresh(f32_aval(&[2]));
    let stray = Var::fresh(f32_aval(&[2]));
    let out = Var::fresh(f32_aval(&[2]));
    let jaxpr = Jaxpr {
        in_binders: vec![a],
        eqns: vec![JaxprEqn {
            prim: Primitive::Neg,
            inputs: vec![Atom::Var(stray)],
            out_binders: vec![out.clone()],
        }],
        outs: vec![Atom::Var(out)],
    };
    assert!(jaxpr.typecheck().is_err());
}

#[test]
fn test_flatten_inlines_jit_call() {
    let inner = jit(|xs: &[Value]| Ok(vec![ops::sin(&xs[0])?]));
    let (jaxpr, _) = make_jaxpr(
        |xs| {
            let y = inner(&[xs[0].clone()])?;
            ops::mul(&y[0], &xs[0]).map(|v| vec![v])
        },
        &[f32_aval(&[3])],
    )
    .unwrap();
    assert!(jaxpr
        .eqns
        .iter()
        .any(|e| matches!(e.prim, Primitive::JitCall { .. })));

    let flat = jaxpr.flatten().unwrap();
    assert!(flat
        .eqns
        .iter()
        .all(|e| !matches!(e.prim, Primitive::JitCall { .. })));
    flat.typecheck().unwrap();
    // the inlined body is sin then mul
    let names: Vec<&str> = flat.eqns.iter().map(|e| e.prim.name()).collect();
    assert_eq!(names, vec!["sin", "mul"]);
}

#[test]
fn test_flatten_then_simplify_typechecks() {
    // the universal invariant: typecheck(flatten().simplify()) succeeds
    let inner = jit(|xs: &[Value]| {
        let a = ops::add(&xs[0], &Value::from(0.0f32))?;
        Ok(vec![ops::mul(&a, &Value::from(1.0f32))?])
    });
    let (jaxpr, _) = make_jaxpr(
        |xs| inner(&[xs[0].clone()]),
        &[f32_aval(&[2, 2])],
    )
    .unwrap();
    jaxpr.flatten().unwrap().simplify().unwrap().typecheck().unwrap();
}

#[test]
fn test_simplify_folds_scalar_constants() {
    let (jaxpr, _) = make_jaxpr(
        |xs| {
            // 2 + 3 is constant; x * 5 survives
            let c = ops::add(&Value::from(2.0f32), &Value::from(3.0f32))?;
            Ok(vec![ops::mul(&xs[0], &c)?])
        },
        &[f32_aval(&[4])],
    )
    .unwrap();
    let simplified = jaxpr.simplify().unwrap();
    let names: Vec<&str> = simplified.eqns.iter().map(|e| e.prim.name()).collect();
    assert_eq!(names, vec!["mul"]);
    match &simplified.eqns[0].inputs[1] {
        Atom::Lit(l) => assert_eq!(l.value, Scalar::F32(5.0)),
        other => panic!("expected folded literal, got {other:?}"),
    }
}

#[test]
fn test_simplify_identity_and_dce() {
    let (jaxpr, _) = make_jaxpr(
        |xs| {
            let kept = ops::add(&xs[0], &Value::from(0.0f32))?; // identity
            let _dead = ops::sin(&xs[0])?; // unused
            Ok(vec![kept])
        },
        &[f32_aval(&[4])],
    )
    .unwrap();
    let simplified = jaxpr.simplify().unwrap();
    assert!(simplified.eqns.is_empty(), "{simplified}");
    // the output collapses to the input binder
    assert_eq!(
        simplified.outs,
        vec![Atom::Var(simplified.in_binders[0].clone())]
    );
}

#[test]
fn test_simplify_cse_merges_duplicates() {
    let (jaxpr, _) = make_jaxpr(
        |xs| {
            let a = ops::sin(&xs[0])?;
            let b = ops::sin(&xs[0])?;
            Ok(vec![ops::mul(&a, &b)?])
        },
        &[f32_aval(&[4])],
    )
    .unwrap();
    let simplified = jaxpr.simplify().unwrap();
    let sins = simplified
        .eqns
        .iter()
        .filter(|e| matches!(e.prim, Primitive::Sin))
        .count();
    assert_eq!(sins, 1);
}

#[test]
fn test_fingerprint_stable_across_traces() {
    let trace = || {
        make_jaxpr(
            |xs| {
                let y = ops::add(&xs[0], &Value::from(2.0f32))?;
                Ok(vec![ops::mul(&y, &xs[0])?])
            },
            &[f32_aval(&[2, 3])],
        )
        .unwrap()
        .0
    };
    // distinct traces allocate distinct variable ids; the fingerprint
    // renumbers them
    assert_eq!(trace().fingerprint(), trace().fingerprint());
}

#[test]
fn test_fingerprint_distinguishes_programs() {
    let (add2, _) = make_jaxpr(
        |xs| Ok(vec![ops::add(&xs[0], &Value::from(2.0f32))?]),
        &[f32_aval(&[3])],
    )
    .unwrap();
    let (add3, _) = make_jaxpr(
        |xs| Ok(vec![ops::add(&xs[0], &Value::from(3.0f32))?]),
        &[f32_aval(&[3])],
    )
    .unwrap();
    assert_ne!(add2.fingerprint(), add3.fingerprint());
}

#[test]
fn test_eval_jaxpr_matches_direct_eval() {
    let (jaxpr, consts) = make_jaxpr(
        |xs| {
            let y = ops::add(&xs[0], &Value::from(2.0f32))?;
            Ok(vec![ops::mul(&y, &xs[0])?])
        },
        &[f32_aval(&[])],
    )
    .unwrap();
    assert!(consts.is_empty());
    let out = jaxpr.eval(&[Value::from(4.0f32)]).unwrap();
    assert_eq!(out[0].item_f32().unwrap(), 24.0);
}
