//! ARM NEON kernels for FP32 vectors (aarch64 only).
//!
//! NEON is always present on aarch64, so no runtime probe guards these.
//! Pointers may have any alignment; `vld1q_f32` tolerates unaligned loads.

#[cfg(target_arch = "aarch64")]
pub(crate) fn dot_f32_neon(a: *const f32, b: *const f32, n: usize) -> f32 {
    use std::arch::aarch64::*;

    let blocks = n / 4;
    // SAFETY: offsets stay below `n`; unaligned loads are valid on aarch64.
    let mut result = unsafe {
        let mut sum = vdupq_n_f32(0.0);
        for i in 0..blocks {
            let offset = i * 4;
            let va = vld1q_f32(a.add(offset));
            let vb = vld1q_f32(b.add(offset));
            sum = vfmaq_f32(sum, va, vb);
        }
        vaddvq_f32(sum)
    };

    for i in blocks * 4..n {
        // SAFETY: i < n, both pointers readable for n elements.
        unsafe {
            result += a.add(i).read_unaligned() * b.add(i).read_unaligned();
        }
    }
    result
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn squared_l2_f32_neon(a: *const f32, b: *const f32, n: usize) -> f32 {
    use std::arch::aarch64::*;

    let blocks = n / 4;
    // SAFETY: offsets stay below `n`; unaligned loads are valid on aarch64.
    let mut result = unsafe {
        let mut sum = vdupq_n_f32(0.0);
        for i in 0..blocks {
            let offset = i * 4;
            let d = vsubq_f32(vld1q_f32(a.add(offset)), vld1q_f32(b.add(offset)));
            sum = vfmaq_f32(sum, d, d);
        }
        vaddvq_f32(sum)
    };

    for i in blocks * 4..n {
        // SAFETY: i < n, both pointers readable for n elements.
        unsafe {
            let d = a.add(i).read_unaligned() - b.add(i).read_unaligned();
            result += d * d;
        }
    }
    result
}
