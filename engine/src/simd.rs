//! SIMD-accelerated squared-L2 distance with safe runtime dispatch.
//!
//! Design goals:
//! - Always safe to run: never executes unsupported instructions (no SIGILL).
//! - One binary works across a wide range of CPUs: AVX2(+FMA) → SSE2 → scalar
//!   on x86_64, NEON on aarch64, scalar everywhere else.
//! - The vectorized paths process eight lanes per step and fold the tail with
//!   the scalar loop, so all variants agree with the scalar reference up to
//!   floating-point reassociation.

/// Returns the squared Euclidean distance $\sum_i (a_i - b_i)^2$.
///
/// # Panics
/// Panics if `a.len() != b.len()`.
#[inline]
pub fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(
        a.len(),
        b.len(),
        "input slices must have the same length: got {} and {}",
        a.len(),
        b.len()
    );
    let len = a.len();
    if len == 0 {
        return 0.0;
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        // NEON (AdvSIMD) is ubiquitous on aarch64, but keep a defensive check.
        if std::arch::is_aarch64_feature_detected!("neon") {
            return l2_sq_neon(a, b, len);
        }
    }

    #[cfg(target_arch = "x86_64")]
    unsafe {
        // AVX2 does not strictly imply FMA; guard to avoid executing
        // unsupported instructions.
        if std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma") {
            return l2_sq_avx2(a, b, len);
        }
        if std::is_x86_feature_detected!("sse2") {
            return l2_sq_sse2(a, b, len);
        }
    }

    l2_sq_scalar(a, b)
}

/// Scalar reference implementation. The dispatched variants are validated
/// against this in tests.
#[inline]
pub fn l2_sq_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0;
    for i in 0..a.len().min(b.len()) {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

// ===== x86_64 SIMD implementations =====

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[target_feature(enable = "fma")]
unsafe fn l2_sq_avx2(a: &[f32], b: &[f32], len: usize) -> f32 {
    let mut acc = _mm256_setzero_ps();
    let chunks = len / 8;
    for i in 0..chunks {
        let off = i * 8;
        let va = _mm256_loadu_ps(a.as_ptr().add(off));
        let vb = _mm256_loadu_ps(b.as_ptr().add(off));
        let d = _mm256_sub_ps(va, vb);
        acc = _mm256_fmadd_ps(d, d, acc);
    }
    let mut tmp = [0.0f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), acc);
    let mut sum: f32 = tmp.iter().sum();
    for i in (chunks * 8)..len {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn l2_sq_sse2(a: &[f32], b: &[f32], len: usize) -> f32 {
    let mut acc = _mm_setzero_ps();
    let chunks = len / 4;
    for i in 0..chunks {
        let off = i * 4;
        let va = _mm_loadu_ps(a.as_ptr().add(off));
        let vb = _mm_loadu_ps(b.as_ptr().add(off));
        let d = _mm_sub_ps(va, vb);
        acc = _mm_add_ps(acc, _mm_mul_ps(d, d));
    }
    let mut tmp = [0.0f32; 4];
    _mm_storeu_ps(tmp.as_mut_ptr(), acc);
    let mut sum: f32 = tmp.iter().sum();
    for i in (chunks * 4)..len {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

// ===== aarch64 NEON implementations =====

#[cfg(target_arch = "aarch64")]
use std::arch::aarch64::*;

#[cfg(target_arch = "aarch64")]
#[inline]
unsafe fn hadd_f32x4(v: float32x4_t) -> f32 {
    vaddvq_f32(v)
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn l2_sq_neon(a: &[f32], b: &[f32], len: usize) -> f32 {
    let mut acc0: float32x4_t = vdupq_n_f32(0.0);
    let mut acc1: float32x4_t = vdupq_n_f32(0.0);
    let chunks = len / 8;
    for i in 0..chunks {
        let off = i * 8;
        let va = vld1q_f32(a.as_ptr().add(off));
        let vb = vld1q_f32(b.as_ptr().add(off));
        let d = vsubq_f32(va, vb);
        acc0 = vmlaq_f32(acc0, d, d);

        let va = vld1q_f32(a.as_ptr().add(off + 4));
        let vb = vld1q_f32(b.as_ptr().add(off + 4));
        let d = vsubq_f32(va, vb);
        acc1 = vmlaq_f32(acc1, d, d);
    }
    let mut sum = hadd_f32x4(vaddq_f32(acc0, acc1));
    for i in (chunks * 8)..len {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::Rng;

    fn random_pair(dim: usize) -> (Vec<f32>, Vec<f32>) {
        let mut rng = rand::thread_rng();
        let a = (0..dim).map(|_| rng.gen_range(-10.0..10.0)).collect();
        let b = (0..dim).map(|_| rng.gen_range(-10.0..10.0)).collect();
        (a, b)
    }

    #[test]
    fn l2_sq_basic() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![1.0, 2.0, 3.0, 6.0];
        assert!((l2_sq(&a, &b) - 4.0).abs() < 1e-6);
    }

    #[test]
    fn l2_sq_identity_is_zero() {
        let a: Vec<f32> = (0..300).map(|i| (i as f32).sin()).collect();
        assert_eq!(l2_sq(&a, &a), 0.0);
    }

    #[test]
    fn l2_sq_empty() {
        assert_eq!(l2_sq(&[], &[]), 0.0);
    }

    #[test]
    fn dispatched_matches_scalar_reference_dims() {
        // Reference workload dimensions plus tails that exercise the scalar
        // remainder fold.
        for dim in [128usize, 512, 1024, 4096, 7, 9, 131] {
            for _ in 0..8 {
                let (a, b) = random_pair(dim);
                let scalar = l2_sq_scalar(&a, &b);
                let fast = l2_sq(&a, &b);
                let tol = 1e-3 * scalar.max(1e-6);
                assert!(
                    (fast - scalar).abs() <= tol,
                    "dim={} scalar={} fast={}",
                    dim,
                    scalar,
                    fast
                );
            }
        }
    }

    proptest! {
        #[test]
        fn l2_sq_is_symmetric_and_nonnegative(
            v in proptest::collection::vec(-100.0f32..100.0, 1..256)
        ) {
            let w: Vec<f32> = v.iter().rev().copied().collect();
            let d1 = l2_sq(&v, &w);
            let d2 = l2_sq(&w, &v);
            prop_assert!(d1 >= 0.0);
            let tol = 1e-3 * d1.abs().max(1e-6);
            prop_assert!((d1 - d2).abs() <= tol);
        }
    }
}
