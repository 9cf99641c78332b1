//! GPU accelerator using WGPU.
//!
//! This module implements [`Accelerator`] on top of WGPU + WGSL. It handles
//! GPU context initialization, shader validation and pipeline creation, and
//! asynchronous submission of the kernels the operator core needs:
//!
//! - `dropout`: inverted dropout, shared by the forward and backward entry points
//! - `add`: elementwise accumulate
//!
//! Kernel launches only encode and submit; nothing waits until
//! [`Accelerator::synchronize`] or [`Accelerator::download`]. WGPU exposes one
//! queue per device, so every stream maps onto it and submission order is
//! preserved across streams as well.

use super::accel::{Accelerator, BufferId, DeviceArray};
use crate::backend::Stream;
use crate::error::{OpError, Result};
use crate::tensors::{Tensor, TensorFloat, element_count};
use briny::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use wgpu::util::DeviceExt;

const DROPOUT: &str = include_str!("shaders/dropout.wgsl");
const ADD: &str = include_str!("shaders/add.wgsl");

/// Threads per workgroup in every shader.
const WORKGROUP: u32 = 64;

/// Maximum workgroups per dispatch dimension.
const MAX_GROUPS: u32 = 65_535;

/// Basic wrapper for common GPU errors.
#[derive(Debug)]
pub enum GpuError {
    /// An error in requesting the adapter.
    Adapter(wgpu::RequestAdapterError),
    /// An error in requesting the GPU (device).
    Device(wgpu::RequestDeviceError),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adapter(e) => write!(f, "Adapter error: {e}"),
            Self::Device(e) => write!(f, "Device error: {e}"),
        }
    }
}

/// Wrapper for a `GpuError` or `ValidationError` depending on how it fails.
#[derive(Debug)]
pub enum GpuFailureKind {
    /// An error resulting from the GPU.
    Gpu(GpuError),
    /// An error resulting from validating data.
    Validation(ValidationError),
}

impl std::fmt::Display for GpuFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gpu(err) => write!(f, "GPU error: {err}"),
            Self::Validation(err) => write!(f, "Validation error: {err}"),
        }
    }
}

/// A type of error closely related to the GPU.
#[derive(Debug)]
pub struct GpuFailure {
    /// The optional type of failure that occured.
    pub kind: Option<GpuFailureKind>,
    /// The optional message explaining the failure.
    pub message: Option<String>,
}

impl From<GpuError> for GpuFailure {
    fn from(kind: GpuError) -> Self {
        Self {
            kind: Some(GpuFailureKind::Gpu(kind)),
            message: None,
        }
    }
}

impl From<ValidationError> for GpuFailure {
    fn from(kind: ValidationError) -> Self {
        Self {
            kind: Some(GpuFailureKind::Validation(kind)),
            message: None,
        }
    }
}

impl From<String> for GpuFailure {
    fn from(msg: String) -> Self {
        Self {
            kind: None,
            message: Some(msg),
        }
    }
}

impl std::fmt::Display for GpuFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(kind) = &self.kind {
            write!(f, "GPU failure: {kind}")
        } else if let Some(msg) = &self.message {
            write!(f, "GPU failure: {msg}")
        } else {
            write!(f, "Unknown GPU failure")
        }
    }
}

impl std::error::Error for GpuFailure {}

impl From<GpuFailure> for OpError {
    fn from(e: GpuFailure) -> Self {
        Self::Accelerator(e.to_string())
    }
}

/// Holds the WGPU device and queue used for executing compute pipelines.
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// A queue for information related to the device.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Initializes a new GPU context, selecting the default adapter and creating a device + queue.
    ///
    /// # Errors
    /// Returns `Err(GpuError)` if adapter or device acquisition fails.
    pub fn new() -> core::result::Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(GpuError::Adapter)?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(GpuError::Device)?;

        Ok(Self { device, queue })
    }
}

/// Secure wrapper for WGSL source code.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        let src = self.0;

        if src.len() > 65536 {
            return Err(ValidationError);
        }

        if !src.contains("fn main") {
            return Err(ValidationError);
        }

        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }

        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }

        Ok(())
    }
}

/// Validates a WGSL shader and compiles it into a labeled module.
///
/// # Errors
/// Fails when the source does not pass [`WgslSource`] validation.
pub fn load_shader(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> core::result::Result<wgpu::ShaderModule, GpuFailure> {
    WgslSource(source).validate()?;

    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

fn as_bytes<T: Copy>(data: &[T]) -> &[u8] {
    let len = std::mem::size_of_val(data);
    unsafe { std::slice::from_raw_parts(data.as_ptr().cast::<u8>(), len) }
}

fn bytes_to_f32_slice(data: &[u8]) -> core::result::Result<&[f32], &'static str> {
    use std::mem::{align_of, size_of};

    if data.as_ptr() as usize % align_of::<f32>() != 0 {
        return Err("unaligned buffer");
    }

    if data.len() % size_of::<f32>() != 0 {
        return Err("buffer length is not a multiple of f32");
    }

    let len = data.len() / size_of::<f32>();
    let ptr = data.as_ptr().cast::<f32>();
    unsafe { Ok(std::slice::from_raw_parts(ptr, len)) }
}

fn byte_len(elements: usize) -> u64 {
    (elements.max(1) * size_of::<f32>()) as u64
}

/// A compiled `(uniform params, read-only src, read-write dst)` compute kernel.
struct Kernel {
    label: &'static str,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl Kernel {
    fn new(
        device: &wgpu::Device,
        label: &'static str,
        source: &str,
    ) -> core::result::Result<Self, GpuFailure> {
        let module = load_shader(device, label, source)?;

        let storage = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage(1, true),
                storage(2, false),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });

        Ok(Self {
            label,
            layout,
            pipeline,
        })
    }

    /// Encodes one launch over `len` elements and submits it without waiting.
    #[allow(clippy::cast_possible_truncation)]
    fn launch(
        &self,
        gpu: &GpuContext,
        params: [u32; 4],
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        len: usize,
    ) {
        let device = &gpu.device;
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: as_bytes(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.label),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: src.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: dst.as_entire_binding(),
                },
            ],
        });

        let groups = (len as u32).div_ceil(WORKGROUP);
        let x = groups.min(MAX_GROUPS);
        let y = groups.div_ceil(x);

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(self.label),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        gpu.queue.submit(Some(encoder.finish()));
    }
}

/// An [`Accelerator`] running WGSL kernels through WGPU.
pub struct WgpuAccelerator {
    gpu: GpuContext,
    dropout: Kernel,
    add: Kernel,
    buffers: Mutex<HashMap<BufferId, wgpu::Buffer>>,
    next_id: AtomicU64,
}

lazy_static::lazy_static! {
    static ref SHARED: Option<Arc<WgpuAccelerator>> = match WgpuAccelerator::new() {
        Ok(accel) => Some(Arc::new(accel)),
        Err(e) => {
            tracing::warn!(%e, "wgpu accelerator unavailable");
            None
        }
    };
}

impl WgpuAccelerator {
    /// Acquires a GPU and compiles the kernels.
    ///
    /// # Errors
    /// Fails if no adapter/device is available or a shader fails validation.
    pub fn new() -> core::result::Result<Self, GpuFailure> {
        let gpu = GpuContext::new()?;
        let dropout = Kernel::new(&gpu.device, "dropout", DROPOUT)?;
        let add = Kernel::new(&gpu.device, "add", ADD)?;
        tracing::info!("wgpu accelerator initialised");
        Ok(Self {
            gpu,
            dropout,
            add,
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// The process-wide instance, created on first use; `None` without a usable GPU.
    #[must_use]
    pub fn shared() -> Option<Arc<Self>> {
        SHARED.clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BufferId, wgpu::Buffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, shape: &[usize], buffer: wgpu::Buffer) -> DeviceArray {
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, buffer);
        DeviceArray::new(id, shape.to_vec())
    }

    fn buffer(&self, array: &DeviceArray) -> Result<wgpu::Buffer> {
        self.lock()
            .get(&array.id())
            .cloned()
            .ok_or_else(|| OpError::Accelerator(format!("unknown buffer {}", array.id().0)))
    }

    fn pair(&self, src: &DeviceArray, dst: &DeviceArray) -> Result<(wgpu::Buffer, wgpu::Buffer)> {
        if src.len() != dst.len() {
            return Err(OpError::Accelerator(format!(
                "buffer length mismatch: {} vs {}",
                src.len(),
                dst.len()
            )));
        }
        if u32::try_from(src.len()).is_err() {
            return Err(OpError::Accelerator(format!(
                "{} elements exceed the kernel index range",
                src.len()
            )));
        }
        Ok((self.buffer(src)?, self.buffer(dst)?))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn launch_dropout(
        &self,
        src: &DeviceArray,
        drop_rate: TensorFloat,
        dst: &DeviceArray,
        seed: u64,
        stream: &Stream,
    ) -> Result<()> {
        let (a, b) = self.pair(src, dst)?;
        if src.is_empty() {
            return Ok(());
        }
        tracing::trace!(stream = %stream.id(), drop_rate, seed, len = src.len(), "submitting dropout kernel");
        let params = [
            src.len() as u32,
            seed as u32,
            (seed >> 32) as u32,
            drop_rate.to_bits(),
        ];
        self.dropout.launch(&self.gpu, params, &a, &b, src.len());
        Ok(())
    }

    fn wait(&self) -> Result<()> {
        self.gpu
            .device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| OpError::Accelerator(format!("{e:?}")))
    }
}

impl Accelerator for WgpuAccelerator {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn alloc(&self, shape: &[usize]) -> Result<DeviceArray> {
        let buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("array"),
            size: byte_len(element_count(shape)),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(self.register(shape, buffer))
    }

    fn upload(&self, host: &Tensor<TensorFloat>) -> Result<DeviceArray> {
        if host.is_empty() {
            return self.alloc(host.shape());
        }
        let buffer = self
            .gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("array"),
                contents: as_bytes(&host.data),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            });
        Ok(self.register(host.shape(), buffer))
    }

    fn download(&self, array: &DeviceArray) -> Result<Tensor<TensorFloat>> {
        let source = self.buffer(array)?;
        if array.is_empty() {
            return Ok(Tensor::new(array.shape().to_vec(), Vec::new()));
        }
        let size = byte_len(array.len());
        let device = &self.gpu.device;

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("download"),
        });
        encoder.copy_buffer_to_buffer(&source, 0, &staging, 0, size);
        self.gpu.queue.submit(Some(encoder.finish()));

        let (tx, rx) = std::sync::mpsc::channel();
        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait()?;
        rx.recv()
            .map_err(|e| OpError::Accelerator(e.to_string()))?
            .map_err(|e| OpError::Accelerator(format!("{e:?}")))?;

        let view = slice.get_mapped_range();
        let data = bytes_to_f32_slice(&view)
            .map_err(|e| OpError::Accelerator(e.to_string()))?
            .to_vec();
        drop(view);
        staging.unmap();

        Ok(Tensor::new(array.shape().to_vec(), data))
    }

    fn free(&self, array: DeviceArray) -> Result<()> {
        let buffer = self
            .lock()
            .remove(&array.id())
            .ok_or_else(|| OpError::Accelerator(format!("unknown buffer {}", array.id().0)))?;
        buffer.destroy();
        Ok(())
    }

    fn copy(&self, src: &DeviceArray, dst: &DeviceArray, stream: &Stream) -> Result<()> {
        let (a, b) = self.pair(src, dst)?;
        if src.is_empty() {
            return Ok(());
        }
        tracing::trace!(stream = %stream.id(), len = src.len(), "submitting copy");
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("copy") });
        encoder.copy_buffer_to_buffer(&a, 0, &b, 0, byte_len(src.len()));
        self.gpu.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn fill(&self, dst: &DeviceArray, value: TensorFloat, stream: &Stream) -> Result<()> {
        let buffer = self.buffer(dst)?;
        if dst.is_empty() {
            return Ok(());
        }
        tracing::trace!(stream = %stream.id(), value, len = dst.len(), "submitting fill");
        let values = vec![value; dst.len()];
        self.gpu.queue.write_buffer(&buffer, 0, as_bytes(&values));
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_assign(&self, src: &DeviceArray, dst: &DeviceArray, stream: &Stream) -> Result<()> {
        let (a, b) = self.pair(src, dst)?;
        if src.is_empty() {
            return Ok(());
        }
        tracing::trace!(stream = %stream.id(), len = src.len(), "submitting add");
        self.add
            .launch(&self.gpu, [src.len() as u32, 0, 0, 0], &a, &b, src.len());
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
        self.launch_dropout(input, drop_rate, output, seed, stream)
    }

    fn dropout_backward(
        &self,
        input_grad: &DeviceArray,
        drop_rate: TensorFloat,
        output_grad: &DeviceArray,
        seed: u64,
        stream: &Stream,
    ) -> Result<()> {
        self.launch_dropout(input_grad, drop_rate, output_grad, seed, stream)
    }

    fn synchronize(&self, stream: &Stream) -> Result<()> {
        tracing::trace!(stream = %stream.id(), "synchronizing");
        // flushes pending `write_buffer` fills
        self.gpu.queue.submit(std::iter::empty());
        self.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::accel::kernel_keeps;

    #[test]
    fn bundled_shaders_pass_validation() {
        assert!(WgslSource(DROPOUT).validate().is_ok());
        assert!(WgslSource(ADD).validate().is_ok());
    }

    #[test]
    fn rejects_forbidden_shader_source() {
        assert!(WgslSource("fn main() { let p: ptr<function, f32>; }").validate().is_err());
        assert!(WgslSource("fn helper() {}").validate().is_err());
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn gpu_dropout_matches_host_hash() {
        let Some(gpu) = WgpuAccelerator::shared() else {
            return;
        };
        let stream = Stream::new(gpu.clone(), 0);
        let input = gpu.upload(&Tensor::ones(vec![300])).unwrap();
        let output = gpu.alloc(&[300]).unwrap();
        gpu.dropout_forward(&input, 0.5, &output, 77, &stream).unwrap();
        let out = gpu.download(&output).unwrap();

        for (i, &v) in out.data.iter().enumerate() {
            let expected = if kernel_keeps(77, i as u32, 0.5) { 2.0 } else { 0.0 };
            assert_eq!(v, expected, "element {i}");
        }
    }
}
