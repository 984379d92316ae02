//! Reverse-mode scenarios: scalar gradients, second-order derivatives,
//! and the vjp/jvp duality.

use gradfuse::{grad, jvp_flat, ops, vjp_flat, Array, Value};

fn close(a: f32, b: f32) {
    assert!((a - b).abs() < 1e-4, "{a} != {b}");
}

fn cube(x: &Value) -> gradfuse::CoreResult<Value> {
    let x2 = ops::mul(x, x)?;
    ops::mul(&x2, x)
}

#[test]
fn test_grad_of_cube() {
    // f(x) = x^3, f'(x) = 3x^2
    let df = grad(cube);
    close(df(&Value::from(4.0f32)).unwrap().item_f32().unwrap(), 48.0);
    close(df(&Value::from(5.0f32)).unwrap().item_f32().unwrap(), 75.0);
    close(df(&Value::from(0.0f32)).unwrap().item_f32().unwrap(), 0.0);
    close(df(&Value::from(-4.0f32)).unwrap().item_f32().unwrap(), 48.0);
}

#[test]
fn test_grad_of_sin_cos_composition() {
    // f(x) = sin(cos(x)), f'(x) = -cos(cos(x)) * sin(x)
    let f = |x: &Value| ops::sin(&ops::cos(x)?);
    let df = grad(f);
    close(
        df(&Value::from(3.0f32)).unwrap().item_f32().unwrap(),
        -0.077_432_00,
    );
}

#[test]
fn test_second_order_derivative() {
    let f = |x: &Value| ops::sin(&ops::cos(x)?);
    let ddf = grad(grad(f));
    close(
        ddf(&Value::from(3.0f32)).unwrap().item_f32().unwrap(),
        0.559_854_3,
    );
}

#[test]
fn test_grad_requires_scalar_float_output() {
    let vector_valued = grad(|x: &Value| ops::broadcast_to(x, &[3]));
    let err = vector_valued(&Value::from(1.0f32)).unwrap_err();
    assert!(matches!(err, gradfuse::CoreError::Type(_)), "{err}");
}

#[test]
fn test_grad_through_arrays() {
    // f(x) = sum(x * x) over a vector, df = 2x
    let f = |x: &Value| ops::sum_all(&ops::mul(x, x)?);
    let x = Value::from(Array::from_f32(&[1.0, -2.0, 3.0], &[3]).unwrap());
    let (_, pullback) = vjp_flat(|xs| Ok(vec![f(&xs[0])?]), &[x]).unwrap();
    let cts = pullback.call(&[Value::from(1.0f32)]).unwrap();
    assert_eq!(cts[0].to_f32_vec().unwrap(), vec![2.0, -4.0, 6.0]);
}

#[test]
fn test_grad_through_where() {
    // f(x) = where(x < 0, -x, x) is |x|; the gradient routes by branch
    let f = |x: &Value| {
        let negative = ops::cmp_lt(x, &Value::from(0.0f32))?;
        ops::where_(&negative, &ops::neg(x)?, x)
    };
    let df = grad(f);
    close(df(&Value::from(2.0f32)).unwrap().item_f32().unwrap(), 1.0);
    close(df(&Value::from(-2.0f32)).unwrap().item_f32().unwrap(), -1.0);
}

#[test]
fn test_grad_sums_over_implicit_scalar_broadcast() {
    // f(x) = sum(x + v) over a 3-vector: each element contributes dx
    let v = Array::from_f32(&[1.0, 2.0, 3.0], &[3]).unwrap();
    let f = move |x: &Value| ops::sum_all(&ops::add(x, &Value::from(v.clone()))?);
    let df = grad(f);
    close(df(&Value::from(2.0f32)).unwrap().item_f32().unwrap(), 3.0);
}

#[test]
fn test_vjp_jvp_duality() {
    // <vjp(f,x)(y), u> == <y, jvp(f,x,u)> for f(x) = sin(x) * x
    let f = |x: &Value| ops::mul(&ops::sin(x)?, x);
    let x = Value::from(Array::from_f32(&[0.5, 1.5, -0.7, 2.2], &[4]).unwrap());
    let u = Value::from(Array::from_f32(&[1.0, -1.0, 0.5, 2.0], &[4]).unwrap());
    let y = Value::from(Array::from_f32(&[0.3, 0.9, -2.0, 1.1], &[4]).unwrap());

    let (_, tangents) = jvp_flat(
        |xs| Ok(vec![f(&xs[0])?]),
        std::slice::from_ref(&x),
        std::slice::from_ref(&u),
    )
    .unwrap();
    let (_, pullback) = vjp_flat(|xs| Ok(vec![f(&xs[0])?]), &[x]).unwrap();
    let cts = pullback.call(std::slice::from_ref(&y)).unwrap();

    let dot = |a: &Value, b: &Value| -> f32 {
        a.to_f32_vec()
            .unwrap()
            .iter()
            .zip(b.to_f32_vec().unwrap())
            .map(|(p, q)| p * q)
            .sum()
    };
    close(dot(&cts[0], &u), dot(&y, &tangents[0]));
}

#[test]
fn test_grad_of_reduction_broadcasts_cotangent() {
    // f(x) = sum(x, axis=0) pulled back over ones gives ones
    let x = Value::from(Array::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap());
    let (y, pullback) = vjp_flat(|xs| Ok(vec![ops::reduce_sum(&xs[0], &[0])?]), &[x]).unwrap();
    assert_eq!(y[0].to_f32_vec().unwrap(), vec![5.0, 7.0, 9.0]);
    let ct = Value::from(Array::from_f32(&[1.0, 10.0, 100.0], &[3]).unwrap());
    let cts = pullback.call(&[ct]).unwrap();
    assert_eq!(
        cts[0].to_f32_vec().unwrap(),
        vec![1.0, 10.0, 100.0, 1.0, 10.0, 100.0]
    );
}
