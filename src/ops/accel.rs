//! Accelerator kernel entry points.
//!
//! The operator core never touches device memory itself. It holds opaque
//! [`DeviceArray`] handles and submits work through the [`Accelerator`] trait;
//! a device implementation owns the storage behind every handle, which is what
//! keeps an output buffer a valid target until the stream is synchronized.
//!
//! Submission methods (`copy`, `fill`, `add_assign`, `dropout_*`) are
//! asynchronous: they enqueue work on the given stream and return. Only
//! [`Accelerator::synchronize`] and [`Accelerator::download`] wait.
//!
//! # Dropout kernels
//!
//! Both dropout kernels take the *drop rate* (`1 - keep_probability`) and a
//! 64-bit seed. Per-element randomness is derived from `(seed, index)` with
//! [`kernel_uniform`], so a backward launch with the forward's seed reproduces
//! the forward pattern without any mask being stored.

use crate::backend::Stream;
use crate::error::Result;
use crate::tensors::{Shape, Tensor, TensorFloat, element_count};

/// Identifies a buffer owned by an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Handle to a device-resident float array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceArray {
    id: BufferId,
    shape: Shape,
}

impl DeviceArray {
    /// Wraps a buffer id; only accelerator implementations mint these.
    #[must_use]
    pub const fn new(id: BufferId, shape: Shape) -> Self {
        Self { id, shape }
    }

    /// The backing buffer.
    #[must_use]
    pub const fn id(&self) -> BufferId {
        self.id
    }

    /// Logical shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        element_count(&self.shape)
    }

    /// Whether the array holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A device that can store arrays and run the kernels the operator core needs.
pub trait Accelerator: Send + Sync {
    /// Short device name for logs.
    fn name(&self) -> &'static str;

    /// Allocates a zero-filled array.
    ///
    /// # Errors
    /// Fails if the device cannot allocate.
    fn alloc(&self, shape: &[usize]) -> Result<DeviceArray>;

    /// Copies a host tensor into a new device array.
    ///
    /// # Errors
    /// Fails if the device cannot allocate or write.
    fn upload(&self, host: &Tensor<TensorFloat>) -> Result<DeviceArray>;

    /// Waits for all queued work, then reads `array` back to the host.
    ///
    /// # Errors
    /// Fails on unknown handles or device read-back failures.
    fn download(&self, array: &DeviceArray) -> Result<Tensor<TensorFloat>>;

    /// Releases the storage behind `array`.
    ///
    /// # Errors
    /// Fails on unknown handles.
    fn free(&self, array: DeviceArray) -> Result<()>;

    /// Enqueues `dst = src`.
    ///
    /// # Errors
    /// Fails on unknown handles or mismatched lengths.
    fn copy(&self, src: &DeviceArray, dst: &DeviceArray, stream: &Stream) -> Result<()>;

    /// Enqueues `dst[i] = value` for every element.
    ///
    /// # Errors
    /// Fails on unknown handles.
    fn fill(&self, dst: &DeviceArray, value: TensorFloat, stream: &Stream) -> Result<()>;

    /// Enqueues `dst[i] += src[i]`.
    ///
    /// # Errors
    /// Fails on unknown handles or mismatched lengths.
    fn add_assign(&self, src: &DeviceArray, dst: &DeviceArray, stream: &Stream) -> Result<()>;

    /// Enqueues the dropout forward kernel:
    /// `output[i] = keep(seed, i) ? input[i] / (1 - drop_rate) : 0`.
    ///
    /// # Errors
    /// Fails on unknown handles or mismatched lengths.
    fn dropout_forward(
        &self,
        input: &DeviceArray,
        drop_rate: TensorFloat,
        output: &DeviceArray,
        seed: u64,
        stream: &Stream,
    ) -> Result<()>;

    /// Enqueues the dropout backward kernel, which applies the same pattern as
    /// [`Accelerator::dropout_forward`] for the same seed to `input_grad`.
    ///
    /// # Errors
    /// Fails on unknown handles or mismatched lengths.
    fn dropout_backward(
        &self,
        input_grad: &DeviceArray,
        drop_rate: TensorFloat,
        output_grad: &DeviceArray,
        seed: u64,
        stream: &Stream,
    ) -> Result<()>;

    /// Blocks until everything queued on `stream` has completed.
    ///
    /// # Errors
    /// Propagates device failures raised while draining the queue.
    fn synchronize(&self, stream: &Stream) -> Result<()>;
}

/// PCG output permutation used by the dropout kernels.
#[must_use]
pub const fn pcg_hash(v: u32) -> u32 {
    let state = v.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

/// The uniform `[0, 1)` draw a dropout kernel makes for element `index`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn kernel_uniform(seed: u64, index: u32) -> TensorFloat {
    let lo = seed as u32;
    let hi = (seed >> 32) as u32;
    let h = pcg_hash(pcg_hash(index ^ lo) ^ hi);
    (h >> 8) as TensorFloat * (1.0 / 16_777_216.0)
}

/// Whether a dropout kernel keeps element `index`.
#[must_use]
pub fn kernel_keeps(seed: u64, index: u32, drop_rate: TensorFloat) -> bool {
    kernel_uniform(seed, index) >= drop_rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_draws_stay_in_unit_interval() {
        for i in 0..4096 {
            let u = kernel_uniform(0xDEAD_BEEF_0000_0001, i);
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn zero_drop_rate_keeps_everything() {
        assert!((0..1024).all(|i| kernel_keeps(42, i, 0.0)));
    }

    #[test]
    fn both_seed_halves_matter() {
        let a: Vec<bool> = (0..256).map(|i| kernel_keeps(1, i, 0.5)).collect();
        let b: Vec<bool> = (0..256).map(|i| kernel_keeps(1 | (1 << 32), i, 0.5)).collect();
        assert_ne!(a, b);
    }

    #[test]
    fn drop_fraction_tracks_drop_rate() {
        let dropped = (0..10_000).filter(|&i| !kernel_keeps(99, i, 0.25)).count();
        assert!((2_000..3_000).contains(&dropped), "dropped {dropped}");
    }
}
