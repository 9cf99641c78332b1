//! Elementwise addition of same-shaped nodes.

use super::{OpKind, Operator};
use crate::backend::{Capabilities, DeviceContext};
use crate::error::{OpError, Result};
use crate::graph::{Node, NodeId, NodeRef};
use crate::ops::dispatch;
use crate::tensors::Shape;
use crate::value::Value;

/// Elementwise sum of one or more inputs with identical shapes.
///
/// Reverse-mode wiring uses it to accumulate the gradient contributions of a
/// node consumed more than once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Operator for Sum {
    fn name(&self) -> &'static str {
        "Sum"
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Shape> {
        let Some((first, rest)) = inputs.split_first() else {
            return Err(OpError::shape(self.name(), "needs at least one input"));
        };
        if let Some(bad) = rest.iter().find(|s| *s != first) {
            return Err(OpError::shape(
                self.name(),
                format!("input shapes differ: {first:?} vs {bad:?}"),
            ));
        }
        Ok(first.to_vec())
    }

    fn compute(
        &self,
        _node: NodeId,
        inputs: &[&Value],
        output: &mut Value,
        ctx: &DeviceContext,
        _caps: &Capabilities,
        _inference: bool,
    ) -> Result<()> {
        dispatch::sum(self.name(), inputs, output, ctx)
    }

    fn gradient(&self, node: &NodeRef, output_grad: &NodeRef) -> Result<Vec<NodeRef>> {
        Ok(vec![output_grad.clone(); node.inputs().len()])
    }
}

/// Builds the elementwise sum of `inputs`.
///
/// # Errors
/// [`OpError::ShapeInference`] if `inputs` is empty or the shapes differ.
pub fn sum(inputs: &[NodeRef], ctx: DeviceContext) -> Result<NodeRef> {
    Node::build(OpKind::Sum(Sum), inputs.to_vec(), ctx)
}
