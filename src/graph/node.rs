//! Graph vertices.
//!
//! A [`Node`] is one operator application: an [`OpKind`] with its immutable
//! config and runtime state, the input nodes it reads, and the
//! [`DeviceContext`] it runs under. Nodes are immutable once built and shared
//! as [`NodeRef`]s, so several consumers (and a gradient node's back-reference)
//! can hold the same node without copying it.
//!
//! Output shapes are inferred when the node is built; a node that exists has
//! a valid shape.

use crate::backend::{Capabilities, DeviceContext};
use crate::error::{OpError, Result};
use crate::operators::{DropoutOp, OpKind, Operator};
use crate::tensors::Shape;
use crate::value::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared handle to a node.
pub type NodeRef = Arc<Node>;

/// Process-unique node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

impl NodeId {
    /// Mints a fresh id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// One operator application in the graph.
pub struct Node {
    id: NodeId,
    op: OpKind,
    inputs: Vec<NodeRef>,
    control_deps: Vec<NodeRef>,
    ctx: DeviceContext,
    shape: Shape,
}

impl Node {
    /// Builds a node, inferring its output shape from its inputs.
    ///
    /// # Errors
    /// [`OpError::ShapeInference`] if `op` rejects the input shapes.
    pub(crate) fn build(op: OpKind, inputs: Vec<NodeRef>, ctx: DeviceContext) -> Result<NodeRef> {
        Self::build_with_deps(op, inputs, Vec::new(), ctx)
    }

    /// Builds an input-less node whose shape is known up front.
    pub(crate) fn leaf(op: OpKind, shape: Shape, ctx: DeviceContext) -> NodeRef {
        Arc::new(Self {
            id: NodeId::next(),
            op,
            inputs: Vec::new(),
            control_deps: Vec::new(),
            ctx,
            shape,
        })
    }

    /// Like [`Node::build`], additionally ordering the node after `control_deps`.
    pub(crate) fn build_with_deps(
        op: OpKind,
        inputs: Vec<NodeRef>,
        control_deps: Vec<NodeRef>,
        ctx: DeviceContext,
    ) -> Result<NodeRef> {
        let input_shapes: Vec<&[usize]> = inputs.iter().map(|n| n.shape()).collect();
        let shape = op.infer_shape(&input_shapes)?;
        Ok(Arc::new(Self {
            id: NodeId::next(),
            op,
            inputs,
            control_deps,
            ctx,
            shape,
        }))
    }

    /// This node's id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// The operator kind and its state.
    #[must_use]
    pub const fn op(&self) -> &OpKind {
        &self.op
    }

    /// Short operator name, e.g. `"Dropout"`.
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        self.op.name()
    }

    /// Input edges, in order.
    #[must_use]
    pub fn inputs(&self) -> &[NodeRef] {
        &self.inputs
    }

    /// Nodes that must be evaluated before this one without feeding it data.
    #[must_use]
    pub fn control_deps(&self) -> &[NodeRef] {
        &self.control_deps
    }

    /// Where this node runs.
    #[must_use]
    pub const fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// The output shape inferred at construction.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The dropout operator, if this is a dropout node.
    #[must_use]
    pub const fn as_dropout(&self) -> Option<&DropoutOp> {
        match &self.op {
            OpKind::Dropout(op) => Some(op),
            _ => None,
        }
    }

    /// Re-runs shape inference on explicit input shapes.
    ///
    /// # Errors
    /// [`OpError::ShapeInference`] on incompatible shapes.
    pub fn infer_shape(&self, input_shapes: &[&[usize]]) -> Result<Shape> {
        self.op.infer_shape(input_shapes)
    }

    /// Runs the operator, writing into the caller-allocated `output`.
    ///
    /// Synchronous on the CPU; on an accelerator the work is only queued on
    /// the context's stream and `output` is valid after that stream is
    /// synchronized.
    ///
    /// # Errors
    /// - [`OpError::ShapeMismatch`] if `output` does not have this node's shape
    /// - [`OpError::ShapeInference`] if the number of inputs is wrong
    /// - any failure of the operator itself
    pub fn compute(
        &self,
        inputs: &[&Value],
        output: &mut Value,
        ctx: &DeviceContext,
        caps: &Capabilities,
        inference: bool,
    ) -> Result<()> {
        if inputs.len() != self.inputs.len() {
            return Err(OpError::shape(
                self.op_name(),
                format!("expected {} inputs, got {}", self.inputs.len(), inputs.len()),
            ));
        }
        if output.shape() != self.shape.as_slice() {
            return Err(OpError::ShapeMismatch {
                op: self.op_name(),
                expected: self.shape.clone(),
                actual: output.shape().to_vec(),
            });
        }
        self.op
            .compute(self.id, inputs, output, ctx, caps, inference)
    }

    /// Builds the gradient nodes of this node's inputs, given the gradient
    /// node of its output. One entry per input edge; no numeric work.
    ///
    /// # Errors
    /// [`OpError::UnsupportedOperation`] for terminal backward-graph nodes.
    pub fn gradient(self: &Arc<Self>, output_grad: &NodeRef) -> Result<Vec<NodeRef>> {
        self.op.gradient(self, output_grad)
    }
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("op", &self.op_name())
            .field("inputs", &self.inputs.iter().map(|n| n.id).collect::<Vec<_>>())
            .field(
                "control_deps",
                &self.control_deps.iter().map(|n| n.id).collect::<Vec<_>>(),
            )
            .field("ctx", &self.ctx)
            .field("shape", &self.shape)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{placeholder, sum};

    #[test]
    fn ids_are_unique() {
        let a = NodeId::next();
        let b = NodeId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }

    #[test]
    fn shape_is_inferred_at_construction() {
        let x = placeholder(vec![2, 3], DeviceContext::Cpu);
        let y = sum(&[x.clone(), x.clone()], DeviceContext::Cpu).unwrap();
        assert_eq!(y.shape(), &[2, 3]);
        assert_eq!(y.inputs().len(), 2);
        assert!(Arc::ptr_eq(&y.inputs()[0], &x));
    }

    #[test]
    fn compute_rejects_wrong_output_shape() {
        let x = placeholder(vec![2], DeviceContext::Cpu);
        let y = sum(&[x], DeviceContext::Cpu).unwrap();
        let input = Value::Host(crate::tensors::Tensor::ones(vec![2]));
        let mut out = Value::Host(crate::tensors::Tensor::zeros(vec![3]));
        let err = y
            .compute(&[&input], &mut out, &DeviceContext::Cpu, &Capabilities::none(), false)
            .unwrap_err();
        assert!(matches!(err, OpError::ShapeMismatch { .. }));
    }
}
