//! Graph inputs.

use super::{Operator, OpKind, expect_arity};
use crate::backend::{Capabilities, DeviceContext};
use crate::error::{OpError, Result};
use crate::graph::{Node, NodeId, NodeRef};
use crate::tensors::Shape;
use crate::value::Value;

/// A value supplied by the executor at run time.
///
/// Its shape is declared up front so downstream shapes can be inferred while
/// the graph is built. `compute` is never called on a placeholder during a
/// normal run; the executor injects the feed instead.
#[derive(Debug, Clone)]
pub struct Placeholder {
    shape: Shape,
}

impl Placeholder {
    /// The declared shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
}

impl Operator for Placeholder {
    fn name(&self) -> &'static str {
        "Placeholder"
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Shape> {
        expect_arity(self.name(), inputs, 0)?;
        Ok(self.shape.clone())
    }

    /// Always fails: a placeholder has no value until one is fed.
    fn compute(
        &self,
        node: NodeId,
        _inputs: &[&Value],
        _output: &mut Value,
        _ctx: &DeviceContext,
        _caps: &Capabilities,
        _inference: bool,
    ) -> Result<()> {
        Err(OpError::MissingFeed(node))
    }

    fn gradient(&self, _node: &NodeRef, _output_grad: &NodeRef) -> Result<Vec<NodeRef>> {
        Ok(Vec::new())
    }
}

/// Declares a graph input of the given shape.
#[must_use]
pub fn placeholder(shape: impl Into<Shape>, ctx: DeviceContext) -> NodeRef {
    let shape = shape.into();
    let op = Placeholder {
        shape: shape.clone(),
    };
    Node::leaf(OpKind::Placeholder(op), shape, ctx)
}
