//! Operation Dispatch Layer
//!
//! This module selects the tier that runs each call, based on the node's
//! [`DeviceContext`] and the [`Capabilities`] handed to `compute()`.
//!
//! Selection, re-evaluated on every call and never cached on a node:
//! 1. Accelerator context: the accelerator kernel, unconditionally. The call
//!    only enqueues work on the stream.
//! 2. CPU context with the named native routine available: [`super::native`].
//! 3. CPU context otherwise: the reference kernels in [`super::cpu`].
//!
//! The dropout kernels on accelerators take a drop rate, not a keep
//! probability; that conversion happens here, at the kernel call, and
//! nowhere else.

use super::{cpu, native};
use crate::backend::{
    Capabilities, DeviceContext, NATIVE_DROPOUT, NATIVE_DROPOUT_GRADIENT, Stream,
};
use crate::error::{OpError, Result};
use crate::graph::NodeId;
use crate::mask::MaskCell;
use crate::tensors::TensorFloat;
use crate::value::Value;

/// The implementation family a call was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Accelerator kernel, asynchronous.
    Accelerator,
    /// Specialized native CPU routine.
    Native,
    /// Generic reference implementation.
    Reference,
}

/// A selected tier together with what it needs to run.
#[derive(Debug, Clone, Copy)]
pub enum Route<'a> {
    /// Submit on this stream.
    Accelerator(&'a Stream),
    /// Use the native routine.
    Native,
    /// Use the reference implementation.
    Reference,
}

impl Route<'_> {
    /// The tier this route runs on.
    #[must_use]
    pub const fn tier(&self) -> Tier {
        match self {
            Self::Accelerator(_) => Tier::Accelerator,
            Self::Native => Tier::Native,
            Self::Reference => Tier::Reference,
        }
    }
}

/// Picks the tier for one call of an operation whose native routine is named `native`.
#[must_use]
pub fn select<'a>(ctx: &'a DeviceContext, caps: &Capabilities, native: &str) -> Route<'a> {
    match ctx {
        DeviceContext::Accelerator(stream) => Route::Accelerator(stream),
        DeviceContext::Cpu if caps.is_available(native) => Route::Native,
        DeviceContext::Cpu => Route::Reference,
    }
}

fn check_shape(op: &'static str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(OpError::ShapeMismatch {
            op,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

/// Training-mode dropout forward for `node`, drawing or reusing its pattern from `cell`.
///
/// # Errors
/// Shape/device mismatches between the buffers and the route, a pattern
/// cached on the other tier family, or accelerator submission failures.
#[allow(clippy::too_many_arguments)]
pub fn dropout(
    node: NodeId,
    cell: &MaskCell,
    keep_prob: TensorFloat,
    seed: u64,
    input: &Value,
    output: &mut Value,
    ctx: &DeviceContext,
    caps: &Capabilities,
) -> Result<Tier> {
    const OP: &str = "Dropout";
    check_shape(OP, input.shape(), output.shape())?;

    let route = select(ctx, caps, NATIVE_DROPOUT);
    tracing::trace!(%node, tier = ?route.tier(), "dispatching dropout");

    match route {
        Route::Accelerator(stream) => {
            let (x, y) = (input.device(OP)?, output.device(OP)?);
            let seed = cell.accelerator_seed_or_init(node, seed)?;
            stream
                .device()
                .dropout_forward(x, 1.0 - keep_prob, y, seed, stream)?;
        }
        Route::Native => {
            let x = input.host(OP)?;
            let mask = cell.host_mask_or_init(node, x.shape(), keep_prob, seed)?;
            native::dropout(x, &mask, keep_prob, output.host_mut(OP)?);
        }
        Route::Reference => {
            let x = input.host(OP)?;
            let mask = cell.host_mask_or_init(node, x.shape(), keep_prob, seed)?;
            cpu::dropout(x, &mask, keep_prob, output.host_mut(OP)?);
        }
    }
    Ok(route.tier())
}

/// Dropout gradient for the forward node `forward`, reading its cached pattern from `cell`.
///
/// # Errors
/// [`OpError::MissingState`] if the forward node has not run, plus the
/// failures listed for [`dropout`].
pub fn dropout_gradient(
    forward: NodeId,
    cell: &MaskCell,
    keep_prob: TensorFloat,
    grad: &Value,
    output: &mut Value,
    ctx: &DeviceContext,
    caps: &Capabilities,
) -> Result<Tier> {
    const OP: &str = "DropoutGradient";
    check_shape(OP, grad.shape(), output.shape())?;

    let route = select(ctx, caps, NATIVE_DROPOUT_GRADIENT);
    tracing::trace!(%forward, tier = ?route.tier(), "dispatching dropout gradient");

    match route {
        Route::Accelerator(stream) => {
            let (g, y) = (grad.device(OP)?, output.device(OP)?);
            let seed = cell.accelerator_seed(forward)?;
            stream
                .device()
                .dropout_backward(g, 1.0 - keep_prob, y, seed, stream)?;
        }
        Route::Native | Route::Reference => {
            let g = grad.host(OP)?;
            let mask = cell.host_mask(forward)?;
            check_shape(OP, mask.shape(), g.shape())?;
            let out = output.host_mut(OP)?;
            if route.tier() == Tier::Native {
                native::dropout_gradient(g, &mask, keep_prob, out);
            } else {
                cpu::dropout_gradient(g, &mask, keep_prob, out);
            }
        }
    }
    Ok(route.tier())
}

/// Identity pass-through, used by inference-mode forward calls.
///
/// # Errors
/// Shape/device mismatches or accelerator submission failures.
pub fn identity(
    op: &'static str,
    input: &Value,
    output: &mut Value,
    ctx: &DeviceContext,
) -> Result<()> {
    check_shape(op, input.shape(), output.shape())?;
    match ctx {
        DeviceContext::Accelerator(stream) => {
            stream
                .device()
                .copy(input.device(op)?, output.device(op)?, stream)
        }
        DeviceContext::Cpu => {
            cpu::identity(input.host(op)?, output.host_mut(op)?);
            Ok(())
        }
    }
}

/// Fills `output` with `value`.
///
/// # Errors
/// Device mismatches or accelerator submission failures.
pub fn fill(
    op: &'static str,
    output: &mut Value,
    value: TensorFloat,
    ctx: &DeviceContext,
) -> Result<()> {
    match ctx {
        DeviceContext::Accelerator(stream) => stream.device().fill(output.device(op)?, value, stream),
        DeviceContext::Cpu => {
            cpu::fill(output.host_mut(op)?, value);
            Ok(())
        }
    }
}

/// Elementwise sum of `inputs` into `output`.
///
/// # Errors
/// Shape/device mismatches or accelerator submission failures.
pub fn sum(
    op: &'static str,
    inputs: &[&Value],
    output: &mut Value,
    ctx: &DeviceContext,
) -> Result<()> {
    for input in inputs {
        check_shape(op, output.shape(), input.shape())?;
    }
    match ctx {
        DeviceContext::Accelerator(stream) => {
            let device = stream.device();
            let out = output.device(op)?;
            let Some((first, rest)) = inputs.split_first() else {
                return device.fill(out, 0.0, stream);
            };
            device.copy(first.device(op)?, out, stream)?;
            for input in rest {
                device.add_assign(input.device(op)?, out, stream)?;
            }
            Ok(())
        }
        DeviceContext::Cpu => {
            let hosts = inputs
                .iter()
                .map(|v| v.host(op))
                .collect::<Result<Vec<_>>>()?;
            cpu::sum(&hosts, output.host_mut(op)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::accel::Accelerator;
    use crate::ops::emulated::EmulatedAccelerator;
    use std::sync::Arc;

    #[test]
    fn cpu_routes_follow_capabilities() {
        let ctx = DeviceContext::Cpu;
        let none = Capabilities::none();
        let native = Capabilities::none().with(NATIVE_DROPOUT, true);

        assert_eq!(select(&ctx, &none, NATIVE_DROPOUT).tier(), Tier::Reference);
        assert_eq!(select(&ctx, &native, NATIVE_DROPOUT).tier(), Tier::Native);
        assert_eq!(
            select(&ctx, &native, NATIVE_DROPOUT_GRADIENT).tier(),
            Tier::Reference
        );
    }

    #[test]
    fn accelerator_context_ignores_capabilities() {
        let ctx = DeviceContext::Accelerator(Stream::new(Arc::new(EmulatedAccelerator::new()), 0));
        let native = Capabilities::none().with(NATIVE_DROPOUT, true);
        assert_eq!(select(&ctx, &native, NATIVE_DROPOUT).tier(), Tier::Accelerator);
    }

    #[test]
    fn host_value_on_accelerator_is_rejected() {
        let device = Arc::new(EmulatedAccelerator::new());
        let ctx = DeviceContext::Accelerator(Stream::new(device.clone(), 0));
        let input = Value::Host(crate::tensors::Tensor::ones(vec![2]));
        let mut output = Value::Device(device.alloc(&[2]).unwrap());
        assert!(matches!(
            identity("Dropout", &input, &mut output, &ctx),
            Err(OpError::DeviceMismatch { .. })
        ));
    }
}
