//! SIMD-optimized reductions for the CPU backend
//!
//! AVX2 + FMA on x86_64 with runtime feature detection, scalar everywhere
//! else.

#![allow(unsafe_op_in_unsafe_fn)]

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

/// AVX2 and FMA both present at runtime
#[cfg(target_arch = "x86_64")]
pub fn has_avx2() -> bool {
    is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
}

#[cfg(not(target_arch = "x86_64"))]
pub fn has_avx2() -> bool {
    false
}

/// Dot product of two equally sized slices
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    if has_avx2() {
        return unsafe { dot_f32_avx2(a, b) };
    }

    dot_f32_scalar(a, b)
}

fn dot_f32_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

/// Two independent FMA chains over 16 lanes per step
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);
    let mut acc0 = _mm256_setzero_ps();
    let mut acc1 = _mm256_setzero_ps();

    let mut pairs = a.chunks_exact(16).zip(b.chunks_exact(16));
    for (x, y) in &mut pairs {
        acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(x.as_ptr()), _mm256_loadu_ps(y.as_ptr()), acc0);
        acc1 = _mm256_fmadd_ps(_mm256_loadu_ps(x.as_ptr().add(8)), _mm256_loadu_ps(y.as_ptr().add(8)), acc1);
    }

    let tail = n - n % 16;
    lanes(_mm256_add_ps(acc0, acc1)).iter().sum::<f32>() + dot_f32_scalar(&a[tail..], &b[tail..])
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn lanes(v: __m256) -> [f32; 8] {
    let mut out = [0.0f32; 8];
    _mm256_storeu_ps(out.as_mut_ptr(), v);
    out
}

/// Largest element, `-inf` for an empty slice
pub fn max_f32(a: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    if has_avx2() {
        return unsafe { max_f32_avx2(a) };
    }

    a.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn max_f32_avx2(a: &[f32]) -> f32 {
    let mut acc = _mm256_set1_ps(f32::NEG_INFINITY);
    let chunks = a.chunks_exact(8);
    let rest = chunks.remainder();
    for c in chunks {
        acc = _mm256_max_ps(acc, _mm256_loadu_ps(c.as_ptr()));
    }
    lanes(acc).into_iter().chain(rest.iter().copied()).fold(f32::NEG_INFINITY, f32::max)
}

/// Sum of squares, the RMS norm reduction
pub fn sum_of_squares(x: &[f32]) -> f32 {
    dot_f32(x, x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_matches_scalar() {
        let a: Vec<f32> = (0..37).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..37).map(|i| 1.0 - i as f32 * 0.25).collect();
        let expected = dot_f32_scalar(&a, &b);
        let got = dot_f32(&a, &b);
        assert!((expected - got).abs() < 1e-3 * expected.abs().max(1.0));
    }

    #[test]
    fn test_max_with_remainder() {
        let mut a = vec![-1.0f32; 19];
        a[18] = 4.0;
        assert_eq!(max_f32(&a), 4.0);
        assert_eq!(max_f32(&[]), f32::NEG_INFINITY);
    }

    #[test]
    fn test_sum_of_squares() {
        assert_eq!(sum_of_squares(&[3.0, 4.0]), 25.0);
    }
}
