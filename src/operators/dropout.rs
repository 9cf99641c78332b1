//! Inverted dropout and its gradient.
//!
//! # Forward
//!
//! In training mode each element is kept with probability `keep_prob` and
//! survivors are rescaled by `1 / keep_prob`, so inference needs no rescale:
//!
//! ```text
//! output = mask * input * (1 / keep_prob)
//! ```
//!
//! With the inference flag set the node is an identity and never touches its
//! pattern.
//!
//! # Pattern Lifetime
//!
//! The pattern is drawn on the first training-mode `compute()` and then reused
//! by every later call until [`DropoutOp::reset_mask`]. The paired gradient
//! node reads it from the forward node at compute time.
//!
//! # Gradient
//!
//! [`DropoutGradientOp`] holds the forward node itself (not a copy of its
//! config) and applies the same pattern and scale to the incoming gradient. It
//! is terminal: asking it for a gradient fails.

use super::{OpKind, Operator, expect_arity, single};
use crate::backend::{Capabilities, DeviceContext};
use crate::error::{OpError, Result};
use crate::graph::{Node, NodeId, NodeRef};
use crate::mask::{Mask, MaskCell, Pattern};
use crate::ops::dispatch;
use crate::tensors::{Shape, TensorFloat};
use crate::value::Value;
use briny::prelude::*;
use std::sync::Arc;

/// Construction-time configuration of a dropout node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropoutConfig {
    /// Probability of keeping an element, in `(0, 1]`, with a finite `1 / keep_prob`.
    pub keep_prob: TensorFloat,
    /// Seed of the node's pattern stream.
    pub seed: u64,
}

impl DropoutConfig {
    /// A config with seed 0.
    #[must_use]
    pub const fn new(keep_prob: TensorFloat) -> Self {
        Self { keep_prob, seed: 0 }
    }

    /// Returns the config with `seed` as its pattern seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl Validate for DropoutConfig {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        let p = self.keep_prob;
        // subnormal keep probabilities overflow the rescale factor
        if !p.is_finite() || p <= 0.0 || p > 1.0 || !(1.0 / p).is_finite() {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Dropout operator state: the validated config and the cached pattern.
#[derive(Debug)]
pub struct DropoutOp {
    config: DropoutConfig,
    pattern: MaskCell,
}

impl DropoutOp {
    /// The validated config.
    #[must_use]
    pub const fn config(&self) -> DropoutConfig {
        self.config
    }

    /// Keep probability.
    #[must_use]
    pub const fn keep_prob(&self) -> TensorFloat {
        self.config.keep_prob
    }

    /// The construction-time seed; never changes.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.config.seed
    }

    /// The cached host mask, if a CPU tier has drawn one.
    #[must_use]
    pub fn mask(&self) -> Option<Arc<Mask>> {
        match self.pattern.current()? {
            Pattern::Host(mask) => Some(mask),
            Pattern::Accelerator { .. } => None,
        }
    }

    /// The cached pattern, wherever it was drawn.
    #[must_use]
    pub fn pattern(&self) -> Option<Pattern> {
        self.pattern.current()
    }

    /// How many patterns have been discarded by [`DropoutOp::reset_mask`].
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.pattern.generation()
    }

    /// Discards the cached pattern; the next training-mode `compute()` draws
    /// the pattern of the next generation.
    pub fn reset_mask(&self) {
        self.pattern.reset();
        tracing::debug!(generation = self.pattern.generation(), "reset dropout mask");
    }

    pub(crate) const fn cell(&self) -> &MaskCell {
        &self.pattern
    }
}

impl Operator for DropoutOp {
    fn name(&self) -> &'static str {
        "Dropout"
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Shape> {
        expect_arity(self.name(), inputs, 1)?;
        Ok(inputs[0].to_vec())
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
        let input = single(self.name(), inputs)?;
        if inference {
            return dispatch::identity(self.name(), input, output, ctx);
        }
        dispatch::dropout(
            node,
            &self.pattern,
            self.config.keep_prob,
            self.config.seed,
            input,
            output,
            ctx,
            caps,
        )?;
        Ok(())
    }

    fn gradient(&self, node: &NodeRef, output_grad: &NodeRef) -> Result<Vec<NodeRef>> {
        let grad = dropout_gradient(node, output_grad)?;
        tracing::debug!(forward = %node.id(), gradient = %grad.id(), "wired dropout gradient");
        Ok(vec![grad])
    }
}

/// Gradient of a dropout node.
#[derive(Debug)]
pub struct DropoutGradientOp {
    forward: NodeRef,
}

impl DropoutGradientOp {
    /// The forward dropout node this gradient reads from.
    #[must_use]
    pub const fn forward(&self) -> &NodeRef {
        &self.forward
    }

    fn source(&self) -> Result<&DropoutOp> {
        self.forward.as_dropout().ok_or_else(|| OpError::InvalidConfig {
            op: "DropoutGradient",
            reason: format!("{} is not a dropout node", self.forward.id()),
        })
    }
}

impl Operator for DropoutGradientOp {
    fn name(&self) -> &'static str {
        "DropoutGradient"
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Shape> {
        expect_arity(self.name(), inputs, 1)?;
        if inputs[0] != self.forward.shape() {
            return Err(OpError::shape(
                self.name(),
                format!(
                    "gradient shape {:?} differs from forward shape {:?}",
                    inputs[0],
                    self.forward.shape()
                ),
            ));
        }
        Ok(inputs[0].to_vec())
    }

    /// Applies the forward pattern; the inference flag is ignored.
    fn compute(
        &self,
        _node: NodeId,
        inputs: &[&Value],
        output: &mut Value,
        ctx: &DeviceContext,
        caps: &Capabilities,
        _inference: bool,
    ) -> Result<()> {
        let grad = single(self.name(), inputs)?;
        let forward = self.source()?;
        dispatch::dropout_gradient(
            self.forward.id(),
            forward.cell(),
            forward.keep_prob(),
            grad,
            output,
            ctx,
            caps,
        )?;
        Ok(())
    }

    fn gradient(&self, _node: &NodeRef, _output_grad: &NodeRef) -> Result<Vec<NodeRef>> {
        Err(OpError::UnsupportedOperation { op: self.name() })
    }
}

/// Builds a dropout node over `input`.
///
/// # Errors
/// [`OpError::InvalidConfig`] if `keep_prob` is not a finite value in `(0, 1]`
/// or is so small that `1 / keep_prob` overflows.
///
/// # Example
/// ```rust
/// use briny_graph::backend::DeviceContext;
/// use briny_graph::operators::{dropout, placeholder, DropoutConfig};
///
/// let x = placeholder(vec![4], DeviceContext::Cpu);
/// let y = dropout(&x, DropoutConfig::new(0.5).with_seed(42), DeviceContext::Cpu).unwrap();
/// assert_eq!(y.shape(), &[4]);
/// assert!(dropout(&x, DropoutConfig::new(0.0), DeviceContext::Cpu).is_err());
/// ```
pub fn dropout(input: &NodeRef, config: DropoutConfig, ctx: DeviceContext) -> Result<NodeRef> {
    let keep_prob = config.keep_prob;
    let config = TrustedData::new(config)
        .map_err(|_| OpError::InvalidConfig {
            op: "Dropout",
            reason: format!(
                "keep_prob must be finite, in (0, 1] and have a finite reciprocal, got {keep_prob}"
            ),
        })?
        .into_inner();

    let op = DropoutOp {
        config,
        pattern: MaskCell::new(),
    };
    Node::build(OpKind::Dropout(op), vec![input.clone()], ctx)
}

/// Builds the gradient node of the dropout node `forward`, fed by `output_grad`.
///
/// The gradient node runs in `forward`'s device context and lists `forward` as
/// a control dependency, so any topological evaluation runs the forward first.
///
/// # Errors
/// - [`OpError::InvalidConfig`] if `forward` is not a dropout node
/// - [`OpError::ShapeInference`] if `output_grad` has a different shape
pub fn dropout_gradient(forward: &NodeRef, output_grad: &NodeRef) -> Result<NodeRef> {
    if forward.as_dropout().is_none() {
        return Err(OpError::InvalidConfig {
            op: "DropoutGradient",
            reason: format!("{} is a {} node", forward.id(), forward.op_name()),
        });
    }
    let op = DropoutGradientOp {
        forward: forward.clone(),
    };
    Node::build_with_deps(
        OpKind::DropoutGradient(op),
        vec![output_grad.clone()],
        vec![forward.clone()],
        forward.context().clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::placeholder;

    #[test]
    fn keep_prob_bounds() {
        assert!(DropoutConfig::new(1.0).validate().is_ok());
        assert!(DropoutConfig::new(1e-6).validate().is_ok());
        assert!(DropoutConfig::new(0.0).validate().is_err());
        assert!(DropoutConfig::new(-0.5).validate().is_err());
        assert!(DropoutConfig::new(1.5).validate().is_err());
        assert!(DropoutConfig::new(f32::NAN).validate().is_err());
    }

    #[test]
    fn keep_prob_with_infinite_reciprocal_is_rejected() {
        assert!(DropoutConfig::new(1e-45).validate().is_err());
        assert!(DropoutConfig::new(f32::MIN_POSITIVE).validate().is_ok());

        let x = placeholder(vec![4], DeviceContext::Cpu);
        assert!(matches!(
            dropout(&x, DropoutConfig::new(1e-45), DeviceContext::Cpu),
            Err(OpError::InvalidConfig { op: "Dropout", .. })
        ));
    }

    #[test]
    fn seed_defaults_to_zero() {
        let x = placeholder(vec![3], DeviceContext::Cpu);
        let y = dropout(&x, DropoutConfig::new(0.9), DeviceContext::Cpu).unwrap();
        let op = y.as_dropout().unwrap();
        assert_eq!(op.seed(), 0);
        assert_eq!(op.generation(), 0);
        assert!(op.pattern().is_none());
    }

    #[test]
    fn infer_shape_checks_arity() {
        let x = placeholder(vec![3], DeviceContext::Cpu);
        let y = dropout(&x, DropoutConfig::new(0.5), DeviceContext::Cpu).unwrap();
        assert_eq!(y.infer_shape(&[&[7, 2]]).unwrap(), vec![7, 2]);
        assert!(matches!(
            y.infer_shape(&[]),
            Err(OpError::ShapeInference { op: "Dropout", .. })
        ));
        assert!(y.infer_shape(&[&[1], &[1]]).is_err());
    }

    #[test]
    fn gradient_requires_a_dropout_forward() {
        let x = placeholder(vec![3], DeviceContext::Cpu);
        let g = placeholder(vec![3], DeviceContext::Cpu);
        assert!(matches!(
            dropout_gradient(&x, &g),
            Err(OpError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn gradient_shape_must_match_forward() {
        let x = placeholder(vec![3], DeviceContext::Cpu);
        let y = dropout(&x, DropoutConfig::new(0.5), DeviceContext::Cpu).unwrap();
        let g = placeholder(vec![4], DeviceContext::Cpu);
        assert!(matches!(
            y.gradient(&g),
            Err(OpError::ShapeInference { op: "DropoutGradient", .. })
        ));
    }
}
