//! SIMD-accelerated f32 kernels for distance computation.
//!
//! Slices are processed eight lanes at a time with `wide::f32x8`; the tail that
//! does not fill a full lane group is handled with scalar arithmetic.

use wide::f32x8;

const LANES: usize = 8;

#[inline]
fn load(chunk: &[f32]) -> f32x8 {
    let mut lanes = [0.0f32; LANES];
    lanes.copy_from_slice(chunk);
    f32x8::new(lanes)
}

/// SIMD-accelerated dot product calculation.
///
/// Both slices must have the same length; extra elements of the longer
/// slice are ignored.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let (a, b) = (&a[..len], &b[..len]);

    if len < LANES {
        return a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    }

    let mut acc = f32x8::splat(0.0);
    let chunks_a = a.chunks_exact(LANES);
    let chunks_b = b.chunks_exact(LANES);
    let remainder_a = chunks_a.remainder();
    let remainder_b = chunks_b.remainder();

    for (chunk_a, chunk_b) in chunks_a.zip(chunks_b) {
        acc += load(chunk_a) * load(chunk_b);
    }

    let mut total: f32 = acc.to_array().iter().sum();
    total += remainder_a
        .iter()
        .zip(remainder_b.iter())
        .map(|(x, y)| x * y)
        .sum::<f32>();
    total
}

/// SIMD-accelerated squared Euclidean distance.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let (a, b) = (&a[..len], &b[..len]);

    if len < LANES {
        return a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
    }

    let mut acc = f32x8::splat(0.0);
    let chunks_a = a.chunks_exact(LANES);
    let chunks_b = b.chunks_exact(LANES);
    let remainder_a = chunks_a.remainder();
    let remainder_b = chunks_b.remainder();

    for (chunk_a, chunk_b) in chunks_a.zip(chunks_b) {
        let diff = load(chunk_a) - load(chunk_b);
        acc += diff * diff;
    }

    let mut total: f32 = acc.to_array().iter().sum();
    total += remainder_a
        .iter()
        .zip(remainder_b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>();
    total
}

/// Euclidean norm of a vector.
pub fn norm(vector: &[f32]) -> f32 {
    dot_product(vector, vector).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_dot_product_matches_scalar() {
        let a: Vec<f32> = (0..19).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..19).map(|i| 1.0 - i as f32 * 0.25).collect();

        let expected = scalar_dot(&a, &b);
        assert!((dot_product(&a, &b) - expected).abs() < 1e-3);
    }

    #[test]
    fn test_short_vectors_use_scalar_path() {
        assert_eq!(dot_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
        assert_eq!(squared_l2(&[1.0, 0.0], &[0.0, 1.0]), 2.0);
    }

    #[test]
    fn test_squared_l2_long_vectors() {
        let a = vec![1.0f32; 17];
        let b = vec![3.0f32; 17];
        assert!((squared_l2(&a, &b) - 68.0).abs() < 1e-4);
    }

    #[test]
    fn test_norm() {
        assert!((norm(&[3.0, 4.0]) - 5.0).abs() < 1e-6);
        assert_eq!(norm(&[0.0; 12]), 0.0);
    }
}
