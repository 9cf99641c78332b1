//! Specialized native CPU routines.
//!
//! Dispatch selects these when the capability table reports
//! [`NATIVE_DROPOUT`](crate::backend::NATIVE_DROPOUT) /
//! [`NATIVE_DROPOUT_GRADIENT`](crate::backend::NATIVE_DROPOUT_GRADIENT).
//! They compute exactly what [`super::cpu`] computes, for the same mask.
//!
//! ## Optimizations
//! - `rayon` splits the tensor into fixed-size chunks processed in parallel
//! - With `--features=simd` on an AVX2 target, each chunk is processed eight
//!   lanes at a time: `_mm256_mul_ps` scales, then a lane mask zeroes dropped
//!   elements with `_mm256_and_ps`, so dropped infinities and NaNs become `0.0`
//!
//! ## Safety
//! - SIMD paths use `unsafe` blocks and assume AVX2 is enabled at compile time

use crate::mask::Mask;
use crate::tensors::{Tensor, TensorFloat};
use rayon::prelude::*;

#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
use core::arch::x86_64::{
    _mm256_and_ps, _mm256_loadu_ps, _mm256_mul_ps, _mm256_set1_ps, _mm256_storeu_ps,
};

/// Elements per parallel work item.
const CHUNK: usize = 4096;

/// Inverted-dropout forward, parallel and vectorized.
pub fn dropout(
    input: &Tensor<TensorFloat>,
    mask: &Mask,
    keep_prob: TensorFloat,
    output: &mut Tensor<TensorFloat>,
) {
    apply_mask(input, mask, keep_prob, output);
}

/// Dropout gradient, parallel and vectorized.
pub fn dropout_gradient(
    grad: &Tensor<TensorFloat>,
    mask: &Mask,
    keep_prob: TensorFloat,
    output: &mut Tensor<TensorFloat>,
) {
    apply_mask(grad, mask, keep_prob, output);
}

fn apply_mask(
    src: &Tensor<TensorFloat>,
    mask: &Mask,
    keep_prob: TensorFloat,
    output: &mut Tensor<TensorFloat>,
) {
    debug_assert_eq!(src.shape, mask.shape);
    debug_assert_eq!(src.shape, output.shape);

    let scale = 1.0 / keep_prob;
    output
        .data
        .par_chunks_mut(CHUNK)
        .zip(src.data.par_chunks(CHUNK))
        .zip(mask.data.par_chunks(CHUNK))
        .for_each(|((out, x), keep)| apply_chunk(out, x, keep, scale));
}

#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
fn apply_chunk(out: &mut [TensorFloat], x: &[TensorFloat], keep: &[bool], scale: TensorFloat) {
    const LANES: usize = 8;

    // all bits set keeps a lane, all bits clear yields +0.0
    let kept = f32::from_bits(u32::MAX);
    let sv = unsafe { _mm256_set1_ps(scale) };

    let mut idx = 0;
    while idx + LANES <= out.len() {
        let mut lanes = [0.0f32; LANES];
        for (l, &k) in lanes.iter_mut().zip(&keep[idx..idx + LANES]) {
            *l = if k { kept } else { 0.0 };
        }
        unsafe {
            let xv = _mm256_loadu_ps(x[idx..].as_ptr());
            let mv = _mm256_loadu_ps(lanes.as_ptr());
            let scaled = _mm256_mul_ps(xv, sv);
            _mm256_storeu_ps(out[idx..].as_mut_ptr(), _mm256_and_ps(scaled, mv));
        }
        idx += LANES;
    }

    for i in idx..out.len() {
        out[i] = if keep[i] { x[i] * scale } else { 0.0 };
    }
}

#[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
fn apply_chunk(out: &mut [TensorFloat], x: &[TensorFloat], keep: &[bool], scale: TensorFloat) {
    for ((o, &v), &k) in out.iter_mut().zip(x).zip(keep) {
        *o = if k { v * scale } else { 0.0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::generate_mask;
    use crate::ops::cpu;

    #[test]
    fn matches_reference_across_chunk_boundaries() {
        let len = CHUNK * 2 + 13;
        #[allow(clippy::cast_precision_loss)]
        let input = Tensor::new(vec![len], (0..len).map(|i| i as f32 * 0.5 - 7.0).collect());
        let mask = generate_mask(&[len], 0.6, 1234);

        let mut reference = Tensor::zeros(vec![len]);
        let mut native = Tensor::zeros(vec![len]);
        cpu::dropout(&input, &mask, 0.6, &mut reference);
        dropout(&input, &mask, 0.6, &mut native);

        assert_eq!(reference, native);
    }

    #[test]
    fn dropped_non_finite_inputs_become_zero() {
        let len = CHUNK + 21;
        let specials = [f32::INFINITY, f32::NEG_INFINITY, f32::NAN, 3.0];
        let input = Tensor::new(vec![len], (0..len).map(|i| specials[i % 4]).collect());
        let mask = generate_mask(&[len], 0.5, 77);

        let mut reference = Tensor::zeros(vec![len]);
        let mut native = Tensor::zeros(vec![len]);
        cpu::dropout(&input, &mask, 0.5, &mut reference);
        dropout(&input, &mask, 0.5, &mut native);

        for (i, (&r, &n)) in reference.data.iter().zip(&native.data).enumerate() {
            assert!(
                r.to_bits() == n.to_bits() || (r.is_nan() && n.is_nan()),
                "element {i}: reference {r}, native {n}"
            );
            if !mask.data[i] {
                assert_eq!(n.to_bits(), 0.0f32.to_bits());
            }
        }
    }
}
