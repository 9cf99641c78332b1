//! # Operator Kinds
//!
//! Every graph node carries one [`OpKind`]. The set is closed: the execution
//! loop matches on it, and each kind implements the same three-call
//! [`Operator`] contract.
//!
//! ## The Contract
//!
//! - `infer_shape`: pure and deterministic, run when the node is built
//! - `compute`: writes into a caller-allocated output through [`crate::ops::dispatch`]
//! - `gradient`: builds backward-graph nodes, one per input edge
//!
//! ## Kinds
//!
//! - [`Placeholder`]: a graph input, fed at execution time
//! - [`OnesLike`]: ones with the input's shape; seeds reverse mode
//! - [`Sum`]: elementwise sum; accumulates gradient fan-out
//! - [`DropoutOp`]: inverted dropout with a cached, seeded pattern
//! - [`DropoutGradientOp`]: applies a dropout node's pattern to a gradient
//!
//! Each kind has a factory function returning a [`NodeRef`]; these are the
//! intended way to build nodes.

mod dropout;
mod ones_like;
mod placeholder;
mod sum;

pub use dropout::{DropoutConfig, DropoutGradientOp, DropoutOp, dropout, dropout_gradient};
pub use ones_like::{OnesLike, ones_like};
pub use placeholder::{Placeholder, placeholder};
pub use sum::{Sum, sum};

use crate::backend::{Capabilities, DeviceContext};
use crate::error::{OpError, Result};
use crate::graph::{NodeId, NodeRef};
use crate::tensors::Shape;
use crate::value::Value;

/// The uniform interface every operator kind implements.
pub trait Operator {
    /// Short kind name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Output shape for the given input shapes.
    ///
    /// # Errors
    /// [`OpError::ShapeInference`] on wrong arity or incompatible shapes.
    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Shape>;

    /// Computes the output of node `node` into `output`.
    ///
    /// # Errors
    /// Operator-specific; see each kind.
    fn compute(
        &self,
        node: NodeId,
        inputs: &[&Value],
        output: &mut Value,
        ctx: &DeviceContext,
        caps: &Capabilities,
        inference: bool,
    ) -> Result<()>;

    /// Gradient nodes for each input of `node`, given its output gradient.
    ///
    /// # Errors
    /// [`OpError::UnsupportedOperation`] if the kind is terminal in the backward graph.
    fn gradient(&self, node: &NodeRef, output_grad: &NodeRef) -> Result<Vec<NodeRef>>;
}

/// The closed set of operator kinds.
#[derive(Debug)]
pub enum OpKind {
    /// Graph input.
    Placeholder(Placeholder),
    /// Ones shaped like the input.
    OnesLike(OnesLike),
    /// Elementwise sum.
    Sum(Sum),
    /// Inverted dropout.
    Dropout(DropoutOp),
    /// Gradient of a dropout node.
    DropoutGradient(DropoutGradientOp),
}

macro_rules! each_kind {
    ($self:expr, $op:ident => $body:expr) => {
        match $self {
            OpKind::Placeholder($op) => $body,
            OpKind::OnesLike($op) => $body,
            OpKind::Sum($op) => $body,
            OpKind::Dropout($op) => $body,
            OpKind::DropoutGradient($op) => $body,
        }
    };
}

impl Operator for OpKind {
    fn name(&self) -> &'static str {
        each_kind!(self, op => op.name())
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Shape> {
        each_kind!(self, op => op.infer_shape(inputs))
    }

    fn compute(
        &self,
        node: NodeId,
        inputs: &[&Value],
        output: &mut Value,
        ctx: &DeviceContext,
        caps: &Capabilities,
        inference: bool,
    ) -> Result<()> {
        each_kind!(self, op => op.compute(node, inputs, output, ctx, caps, inference))
    }

    fn gradient(&self, node: &NodeRef, output_grad: &NodeRef) -> Result<Vec<NodeRef>> {
        each_kind!(self, op => op.gradient(node, output_grad))
    }
}

/// The only input value of a unary operator.
fn single<'a>(op: &'static str, inputs: &[&'a Value]) -> Result<&'a Value> {
    match inputs {
        [value] => Ok(*value),
        _ => Err(OpError::shape(
            op,
            format!("expected 1 input, got {}", inputs.len()),
        )),
    }
}

/// Checks that exactly `n` input shapes were given.
fn expect_arity(op: &'static str, inputs: &[&[usize]], n: usize) -> Result<()> {
    if inputs.len() == n {
        Ok(())
    } else {
        Err(OpError::shape(
            op,
            format!("expected {n} input(s), got {}", inputs.len()),
        ))
    }
}
