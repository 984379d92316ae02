//! Splittable counter-based PRNG (Threefry-2x32).
//!
//! Keys are `uint32[2]` values; `random_bits` feeds a flat counter
//! through the block cipher, so the stream is a pure function of
//! `(key, shape)` and never mutates state. `split` derives fresh keys by
//! drawing bits shaped `[n, 2]`.

use gradfuse_ir::Scalar;

use crate::array::Array;
use crate::error::{CoreError, CoreResult};
use crate::primitives::Primitive;
use crate::trace::bind1;
use crate::value::Value;

const ROTATIONS: [[u32; 4]; 2] = [[13, 15, 26, 6], [17, 29, 16, 24]];
const PARITY: u32 = 0x1BD1_1BDA;

/// The Threefry-2x32 block function, 20 rounds.
fn threefry2x32(key: [u32; 2], ctr: [u32; 2]) -> [u32; 2] {
    let ks = [key[0], key[1], key[0] ^ key[1] ^ PARITY];
    let mut x = [ctr[0].wrapping_add(ks[0]), ctr[1].wrapping_add(ks[1])];
    for group in 0..5u32 {
        for &rot in &ROTATIONS[(group % 2) as usize] {
            x[0] = x[0].wrapping_add(x[1]);
            x[1] = x[1].rotate_left(rot) ^ x[0];
        }
        let i = group as usize;
        x[0] = x[0].wrapping_add(ks[(i + 1) % 3]);
        x[1] = x[1].wrapping_add(ks[(i + 2) % 3].wrapping_add(group + 1));
    }
    x
}

/// Build a root key from a seed.
pub fn key(seed: u64) -> CoreResult<Value> {
    let array = Array::from_u32(&[(seed >> 32) as u32, seed as u32], &[2])?;
    Ok(Value::Concrete(array))
}

/// Uniform `uint32` bits of the requested shape.
pub fn random_bits(key: &Value, shape: &[usize]) -> CoreResult<Value> {
    bind1(
        Primitive::RandomBits {
            shape: shape.to_vec(),
        },
        &[key.clone()],
    )
}

/// Split a key into `n` fresh keys: a new leading axis of size `n` over
/// the `uint32[..,2]` layout.
pub fn split(key: &Value, n: usize) -> CoreResult<Value> {
    random_bits(key, &[n, 2])
}

/// Uniform floats in `[0, 1)`. Computed on the host from `random_bits`,
/// so the key must be concrete.
pub fn uniform(key: &Value, shape: &[usize]) -> CoreResult<Value> {
    let bits = random_bits(key, shape)?.to_array()?.to_u32_vec()?;
    let floats: Vec<f32> = bits
        .iter()
        // keep the top 23 bits as a mantissa in [1, 2), then shift down
        .map(|&b| f32::from_bits((b >> 9) | 0x3f80_0000) - 1.0)
        .collect();
    Ok(Value::Concrete(Array::from_f32(&floats, shape)?))
}

/// Implementation rule for `random_bits` on concrete keys (the eval
/// path; the hash is not expressible in the kernel IR).
pub(crate) fn eval_random_bits(key_array: &Array, shape: &[usize]) -> CoreResult<Array> {
    let key_words = key_array.to_u32_vec()?;
    let [k0, k1] = key_words.as_slice() else {
        return Err(CoreError::Type(format!(
            "random_bits key must be uint32[2], got {} words",
            key_words.len()
        )));
    };
    let size: usize = shape.iter().product();
    let words: Vec<Scalar> = (0..size as u64)
        .map(|i| {
            let out = threefry2x32([*k0, *k1], [(i >> 32) as u32, i as u32]);
            Scalar::U32(out[0])
        })
        .collect();
    Array::from_scalars_on(&words, shape, key_array.backend().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threefry_known_answer() {
        // zero key, zero counter: the cipher must not be the identity
        let out = threefry2x32([0, 0], [0, 0]);
        assert_ne!(out, [0, 0]);
        // deterministic
        assert_eq!(out, threefry2x32([0, 0], [0, 0]));
    }

    #[test]
    fn test_bits_deterministic_per_key() {
        let k = key(42).unwrap();
        let a = random_bits(&k, &[8]).unwrap().to_array().unwrap();
        let b = random_bits(&k, &[8]).unwrap().to_array().unwrap();
        assert_eq!(a.to_u32_vec().unwrap(), b.to_u32_vec().unwrap());

        let k2 = key(43).unwrap();
        let c = random_bits(&k2, &[8]).unwrap().to_array().unwrap();
        assert_ne!(a.to_u32_vec().unwrap(), c.to_u32_vec().unwrap());
    }

    #[test]
    fn test_split_layout() {
        let k = key(7).unwrap();
        let keys = split(&k, 3).unwrap();
        assert_eq!(keys.shape(), vec![3, 2]);
        // subkeys differ from each other
        let words = keys.to_array().unwrap().to_u32_vec().unwrap();
        assert_ne!(&words[0..2], &words[2..4]);
    }

    #[test]
    fn test_uniform_in_unit_interval() {
        let k = key(123).unwrap();
        let u = uniform(&k, &[64]).unwrap().to_f32_vec().unwrap();
        assert!(u.iter().all(|&v| (0.0..1.0).contains(&v)));
        // not all identical
        assert!(u.iter().any(|&v| v != u[0]));
    }
}
