//! Generic reference kernels over host memory.
//!
//! # CPU Reference Backend
//!
//! These are the fallback implementations dispatch uses when a node runs on
//! the CPU and no specialized native routine is available. They are plain
//! sequential loops: the definition of what every other tier must compute.
//!
//! All kernels write into a caller-provided output tensor. Shapes have
//! already been checked by the operator layer; the kernels only assert it in
//! debug builds.

use crate::mask::Mask;
use crate::tensors::{Tensor, TensorFloat};

/// Inverted-dropout forward: `output = mask * input * (1 / keep_prob)`.
///
/// # Example
/// ```rust
/// use briny_graph::ops::cpu::dropout;
/// use briny_graph::tensors::Tensor;
///
/// let input = Tensor::new(vec![4], vec![1.0, 2.0, 3.0, 4.0]);
/// let mask = Tensor::new(vec![4], vec![true, false, true, false]);
/// let mut out = Tensor::zeros(vec![4]);
/// dropout(&input, &mask, 0.5, &mut out);
/// assert_eq!(out.data, vec![2.0, 0.0, 6.0, 0.0]);
/// ```
pub fn dropout(
    input: &Tensor<TensorFloat>,
    mask: &Mask,
    keep_prob: TensorFloat,
    output: &mut Tensor<TensorFloat>,
) {
    apply_mask(input, mask, keep_prob, output);
}

/// Dropout gradient: `output = mask * grad * (1 / keep_prob)`.
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
    for ((o, &x), &keep) in output.data.iter_mut().zip(&src.data).zip(&mask.data) {
        *o = if keep { x * scale } else { 0.0 };
    }
}

/// Copies `input` into `output` unchanged.
pub fn identity(input: &Tensor<TensorFloat>, output: &mut Tensor<TensorFloat>) {
    debug_assert_eq!(input.shape, output.shape);
    output.data.copy_from_slice(&input.data);
}

/// Sets every element of `output` to `value`.
pub fn fill(output: &mut Tensor<TensorFloat>, value: TensorFloat) {
    output.data.fill(value);
}

/// Elementwise sum of `inputs` into `output`.
pub fn sum(inputs: &[&Tensor<TensorFloat>], output: &mut Tensor<TensorFloat>) {
    output.data.fill(0.0);
    for input in inputs {
        debug_assert_eq!(input.shape, output.shape);
        for (o, &x) in output.data.iter_mut().zip(&input.data) {
            *o += x;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_elements_are_zero_and_kept_are_rescaled() {
        let input = Tensor::new(vec![2, 2], vec![1.0, -2.0, 3.0, 4.0]);
        let mask = Tensor::new(vec![2, 2], vec![false, true, true, false]);
        let mut out = Tensor::zeros(vec![2, 2]);
        dropout(&input, &mask, 0.25, &mut out);
        assert_eq!(out.data, vec![0.0, -8.0, 12.0, 0.0]);
    }

    #[test]
    fn gradient_uses_the_same_rule() {
        let grad = Tensor::ones(vec![3]);
        let mask = Tensor::new(vec![3], vec![true, false, true]);
        let mut out = Tensor::full(vec![3], 9.0);
        dropout_gradient(&grad, &mask, 0.5, &mut out);
        assert_eq!(out.data, vec![2.0, 0.0, 2.0]);
    }

    #[test]
    fn sum_overwrites_previous_contents() {
        let a = Tensor::new(vec![2], vec![1.0, 2.0]);
        let b = Tensor::new(vec![2], vec![10.0, 20.0]);
        let mut out = Tensor::full(vec![2], 100.0);
        sum(&[&a, &b], &mut out);
        assert_eq!(out.data, vec![11.0, 22.0]);
    }
}
