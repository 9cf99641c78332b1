//! Host-memory accelerator with real stream semantics.
//!
//! `EmulatedAccelerator` implements [`Accelerator`] without a GPU. Submitted
//! work is queued per stream and only executed when the stream is
//! synchronized (or when any array is downloaded), so code paths that forget
//! to synchronize observe stale buffers exactly as they would on a device.
//! Every launch is recorded, which lets callers check what actually crossed
//! the kernel boundary.
//!
//! Kernels use the same per-element hash as the WGSL shader, so patterns
//! match the `wgpu` backend bit for bit.

use super::accel::{Accelerator, BufferId, DeviceArray, kernel_keeps};
use crate::backend::{Stream, StreamId};
use crate::error::{OpError, Result};
use crate::tensors::{Tensor, TensorFloat, element_count};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A kernel that crossed the accelerator boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    /// `dropout_forward` with the arguments it received.
    DropoutForward {
        /// Drop rate handed to the kernel.
        drop_rate: TensorFloat,
        /// Seed handed to the kernel.
        seed: u64,
    },
    /// `dropout_backward` with the arguments it received.
    DropoutBackward {
        /// Drop rate handed to the kernel.
        drop_rate: TensorFloat,
        /// Seed handed to the kernel.
        seed: u64,
    },
    /// Buffer copy.
    Copy,
    /// Constant fill.
    Fill,
    /// Elementwise accumulate.
    AddAssign,
}

/// One recorded submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelLaunch {
    /// What ran.
    pub kernel: Kernel,
    /// Which stream it was queued on.
    pub stream: StreamId,
}

#[derive(Debug)]
enum Command {
    Dropout {
        src: BufferId,
        dst: BufferId,
        drop_rate: TensorFloat,
        seed: u64,
    },
    Copy {
        src: BufferId,
        dst: BufferId,
    },
    Fill {
        dst: BufferId,
        value: TensorFloat,
    },
    AddAssign {
        src: BufferId,
        dst: BufferId,
    },
}

#[derive(Debug, Default)]
struct EmulatedState {
    buffers: HashMap<BufferId, Vec<TensorFloat>>,
    queues: BTreeMap<StreamId, VecDeque<Command>>,
    launches: Vec<KernelLaunch>,
}

impl EmulatedState {
    fn buffer(&self, id: BufferId) -> Result<&Vec<TensorFloat>> {
        self.buffers
            .get(&id)
            .ok_or_else(|| OpError::Accelerator(format!("unknown buffer {}", id.0)))
    }

    fn check_pair(&self, src: &DeviceArray, dst: &DeviceArray) -> Result<()> {
        let (a, b) = (self.buffer(src.id())?.len(), self.buffer(dst.id())?.len());
        if a != b {
            return Err(OpError::Accelerator(format!(
                "buffer length mismatch: {a} vs {b}"
            )));
        }
        if u32::try_from(a).is_err() {
            return Err(OpError::Accelerator(format!(
                "{a} elements exceed the kernel index range"
            )));
        }
        Ok(())
    }

    fn enqueue(&mut self, stream: StreamId, kernel: Kernel, command: Command) {
        tracing::trace!(%stream, ?kernel, "queued emulated kernel");
        self.launches.push(KernelLaunch { kernel, stream });
        self.queues.entry(stream).or_default().push_back(command);
    }

    fn drain(&mut self, stream: StreamId) -> Result<()> {
        let Some(queue) = self.queues.get_mut(&stream) else {
            return Ok(());
        };
        let commands: Vec<Command> = queue.drain(..).collect();
        for command in commands {
            self.execute(command)?;
        }
        Ok(())
    }

    fn drain_all(&mut self) -> Result<()> {
        let streams: Vec<StreamId> = self.queues.keys().copied().collect();
        for stream in streams {
            self.drain(stream)?;
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Dropout {
                src,
                dst,
                drop_rate,
                seed,
            } => {
                let input = self.buffer(src)?.clone();
                let keep = 1.0 - drop_rate;
                let out = self.buffer_mut(dst)?;
                for (i, (o, &x)) in out.iter_mut().zip(&input).enumerate() {
                    *o = if kernel_keeps(seed, i as u32, drop_rate) {
                        x / keep
                    } else {
                        0.0
                    };
                }
            }
            Command::Copy { src, dst } => {
                let input = self.buffer(src)?.clone();
                self.buffer_mut(dst)?.copy_from_slice(&input);
            }
            Command::Fill { dst, value } => {
                self.buffer_mut(dst)?.fill(value);
            }
            Command::AddAssign { src, dst } => {
                let input = self.buffer(src)?.clone();
                for (o, x) in self.buffer_mut(dst)?.iter_mut().zip(input) {
                    *o += x;
                }
            }
        }
        Ok(())
    }

    fn buffer_mut(&mut self, id: BufferId) -> Result<&mut Vec<TensorFloat>> {
        self.buffers
            .get_mut(&id)
            .ok_or_else(|| OpError::Accelerator(format!("unknown buffer {}", id.0)))
    }
}

/// An [`Accelerator`] backed by host memory with deferred, per-stream execution.
#[derive(Debug, Default)]
pub struct EmulatedAccelerator {
    state: Mutex<EmulatedState>,
    next_id: AtomicU64,
}

impl EmulatedAccelerator {
    /// A device with no buffers and empty queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EmulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mint(&self, shape: &[usize]) -> DeviceArray {
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        DeviceArray::new(id, shape.to_vec())
    }

    /// Every kernel submitted so far, in submission order.
    #[must_use]
    pub fn launches(&self) -> Vec<KernelLaunch> {
        self.lock().launches.clone()
    }

    /// Number of commands queued on `stream` and not yet executed.
    #[must_use]
    pub fn pending(&self, stream: StreamId) -> usize {
        self.lock().queues.get(&stream).map_or(0, VecDeque::len)
    }

    /// Current contents of `array` without waiting for queued work.
    ///
    /// # Errors
    /// Fails on unknown handles.
    pub fn peek(&self, array: &DeviceArray) -> Result<Tensor<TensorFloat>> {
        let data = self.lock().buffer(array.id())?.clone();
        Ok(Tensor::new(array.shape().to_vec(), data))
    }

    /// Number of live buffers.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    fn submit_dropout(
        &self,
        kernel: Kernel,
        src: &DeviceArray,
        dst: &DeviceArray,
        drop_rate: TensorFloat,
        seed: u64,
        stream: &Stream,
    ) -> Result<()> {
        let mut state = self.lock();
        state.check_pair(src, dst)?;
        state.enqueue(
            stream.id(),
            kernel,
            Command::Dropout {
                src: src.id(),
                dst: dst.id(),
                drop_rate,
                seed,
            },
        );
        Ok(())
    }
}

impl Accelerator for EmulatedAccelerator {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn alloc(&self, shape: &[usize]) -> Result<DeviceArray> {
        let array = self.mint(shape);
        self.lock()
            .buffers
            .insert(array.id(), vec![0.0; element_count(shape)]);
        Ok(array)
    }

    fn upload(&self, host: &Tensor<TensorFloat>) -> Result<DeviceArray> {
        let array = self.mint(host.shape());
        self.lock().buffers.insert(array.id(), host.data.clone());
        Ok(array)
    }

    fn download(&self, array: &DeviceArray) -> Result<Tensor<TensorFloat>> {
        let mut state = self.lock();
        state.drain_all()?;
        let data = state.buffer(array.id())?.clone();
        Ok(Tensor::new(array.shape().to_vec(), data))
    }

    fn free(&self, array: DeviceArray) -> Result<()> {
        self.lock()
            .buffers
            .remove(&array.id())
            .map(|_| ())
            .ok_or_else(|| OpError::Accelerator(format!("unknown buffer {}", array.id().0)))
    }

    fn copy(&self, src: &DeviceArray, dst: &DeviceArray, stream: &Stream) -> Result<()> {
        let mut state = self.lock();
        state.check_pair(src, dst)?;
        state.enqueue(
            stream.id(),
            Kernel::Copy,
            Command::Copy {
                src: src.id(),
                dst: dst.id(),
            },
        );
        Ok(())
    }

    fn fill(&self, dst: &DeviceArray, value: TensorFloat, stream: &Stream) -> Result<()> {
        let mut state = self.lock();
        state.buffer(dst.id())?;
        state.enqueue(stream.id(), Kernel::Fill, Command::Fill { dst: dst.id(), value });
        Ok(())
    }

    fn add_assign(&self, src: &DeviceArray, dst: &DeviceArray, stream: &Stream) -> Result<()> {
        let mut state = self.lock();
        state.check_pair(src, dst)?;
        state.enqueue(
            stream.id(),
            Kernel::AddAssign,
            Command::AddAssign {
                src: src.id(),
                dst: dst.id(),
            },
        );
        Ok(())
    }

    fn dropout_forward(
        &self,
        input: &DeviceArray,
        drop_rate: TensorFloat,
        output: &DeviceArray,
        seed: u64,
        stream: &Stream,
    ) -> Result<()> {
        self.submit_dropout(
            Kernel::DropoutForward { drop_rate, seed },
            input,
            output,
            drop_rate,
            seed,
            stream,
        )
    }

    fn dropout_backward(
        &self,
        input_grad: &DeviceArray,
        drop_rate: TensorFloat,
        output_grad: &DeviceArray,
        seed: u64,
        stream: &Stream,
    ) -> Result<()> {
        self.submit_dropout(
            Kernel::DropoutBackward { drop_rate, seed },
            input_grad,
            output_grad,
            drop_rate,
            seed,
            stream,
        )
    }

    fn synchronize(&self, stream: &Stream) -> Result<()> {
        self.lock().drain(stream.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn work_waits_for_synchronize() {
        let device = Arc::new(EmulatedAccelerator::new());
        let stream = Stream::new(device.clone(), 0);

        let src = device.upload(&Tensor::new(vec![3], vec![1.0, 2.0, 3.0])).unwrap();
        let dst = device.alloc(&[3]).unwrap();
        device.copy(&src, &dst, &stream).unwrap();

        assert_eq!(device.pending(stream.id()), 1);
        assert_eq!(device.peek(&dst).unwrap().data, vec![0.0; 3]);

        stream.synchronize().unwrap();
        assert_eq!(device.pending(stream.id()), 0);
        assert_eq!(device.peek(&dst).unwrap().data, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn stream_order_is_submission_order() {
        let device = Arc::new(EmulatedAccelerator::new());
        let stream = Stream::new(device.clone(), 3);

        let ones = device.upload(&Tensor::ones(vec![2])).unwrap();
        let acc = device.alloc(&[2]).unwrap();
        device.fill(&acc, 5.0, &stream).unwrap();
        device.add_assign(&ones, &acc, &stream).unwrap();
        device.add_assign(&ones, &acc, &stream).unwrap();

        assert_eq!(device.download(&acc).unwrap().data, vec![7.0, 7.0]);
    }

    #[test]
    fn mismatched_lengths_are_rejected_at_submission() {
        let device = Arc::new(EmulatedAccelerator::new());
        let stream = Stream::new(device.clone(), 0);
        let a = device.alloc(&[2]).unwrap();
        let b = device.alloc(&[3]).unwrap();
        assert!(matches!(device.copy(&a, &b, &stream), Err(OpError::Accelerator(_))));
        assert!(device.launches().is_empty());
    }

    #[test]
    fn free_releases_storage() {
        let device = EmulatedAccelerator::new();
        let a = device.alloc(&[4]).unwrap();
        assert_eq!(device.live_buffers(), 1);
        device.free(a.clone()).unwrap();
        assert_eq!(device.live_buffers(), 0);
        assert!(device.free(a).is_err());
    }
}
