//! SIMD kernels for vector distance math.
//!
//! Lanes are `wide::f32x8`; the tail that does not fill a lane is summed
//! with scalar code. Lane sums are reduced in a fixed order so results are
//! deterministic and symmetric in their arguments.

use wide::f32x8;

const LANES: usize = 8;

#[inline]
fn lane(chunk: &[f32]) -> f32x8 {
    let mut buf = [0.0f32; LANES];
    buf.copy_from_slice(chunk);
    f32x8::new(buf)
}

#[inline]
fn reduce(v: f32x8) -> f32 {
    v.to_array().iter().sum()
}

/// Dot product of two equally sized slices.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    if a.len() < LANES {
        return a.iter().zip(b).map(|(x, y)| x * y).sum();
    }

    let chunks_a = a.chunks_exact(LANES);
    let chunks_b = b.chunks_exact(LANES);
    let rem_a = chunks_a.remainder();
    let rem_b = chunks_b.remainder();

    let mut acc = f32x8::splat(0.0);
    for (ca, cb) in chunks_a.zip(chunks_b) {
        acc = acc + lane(ca) * lane(cb);
    }

    reduce(acc) + rem_a.iter().zip(rem_b).map(|(x, y)| x * y).sum::<f32>()
}

/// Squared euclidean distance of two equally sized slices.
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    if a.len() < LANES {
        return a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum();
    }

    let chunks_a = a.chunks_exact(LANES);
    let chunks_b = b.chunks_exact(LANES);
    let rem_a = chunks_a.remainder();
    let rem_b = chunks_b.remainder();

    let mut acc = f32x8::splat(0.0);
    for (ca, cb) in chunks_a.zip(chunks_b) {
        let d = lane(ca) - lane(cb);
        acc = acc + d * d;
    }

    reduce(acc)
        + rem_a
            .iter()
            .zip(rem_b)
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum::<f32>()
}

/// Euclidean norm of a slice.
pub fn norm(a: &[f32]) -> f32 {
    dot_product(a, a).sqrt()
}

/// Normalize a slice to unit length in place. Zero vectors are left untouched.
pub fn normalize_in_place(a: &mut [f32]) {
    let n = norm(a);
    if n > 0.0 {
        for value in a.iter_mut() {
            *value /= n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_dot_product_matches_scalar() {
        let a: Vec<f32> = (0..37).map(|i| i as f32 * 0.25).collect();
        let b: Vec<f32> = (0..37).map(|i| 1.0 - i as f32 * 0.1).collect();
        assert!((dot_product(&a, &b) - scalar_dot(&a, &b)).abs() < 1e-3);
    }

    #[test]
    fn test_short_vectors() {
        assert_eq!(dot_product(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
        assert_eq!(l2_squared(&[1.0, 2.0], &[3.0, 5.0]), 13.0);
    }

    #[test]
    fn test_l2_squared_zero_for_identical() {
        let a: Vec<f32> = (0..19).map(|i| (i as f32).sin()).collect();
        assert_eq!(l2_squared(&a, &a), 0.0);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize_in_place(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0; 4];
        normalize_in_place(&mut zero);
        assert_eq!(zero, vec![0.0; 4]);
    }
}
