//! Ones shaped like a node's output.

use super::{OpKind, Operator, expect_arity};
use crate::backend::{Capabilities, DeviceContext};
use crate::error::{OpError, Result};
use crate::graph::{Node, NodeId, NodeRef};
use crate::ops::dispatch;
use crate::tensors::Shape;
use crate::value::Value;

/// Produces ones with its input's shape.
///
/// Used as the initial output gradient of reverse-mode differentiation.
/// The input is only read for its shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnesLike;

impl Operator for OnesLike {
    fn name(&self) -> &'static str {
        "OnesLike"
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Shape> {
        expect_arity(self.name(), inputs, 1)?;
        Ok(inputs[0].to_vec())
    }

    fn compute(
        &self,
        _node: NodeId,
        _inputs: &[&Value],
        output: &mut Value,
        ctx: &DeviceContext,
        _caps: &Capabilities,
        _inference: bool,
    ) -> Result<()> {
        dispatch::fill(self.name(), output, 1.0, ctx)
    }

    fn gradient(&self, _node: &NodeRef, _output_grad: &NodeRef) -> Result<Vec<NodeRef>> {
        Err(OpError::UnsupportedOperation { op: self.name() })
    }
}

/// Builds a node producing ones shaped like `input`.
///
/// # Errors
/// Never fails for a single input; the `Result` mirrors the other factories.
pub fn ones_like(input: &NodeRef, ctx: DeviceContext) -> Result<NodeRef> {
    Node::build(OpKind::OnesLike(OnesLike), vec![input.clone()], ctx)
}
