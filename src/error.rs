//! Error types for graph construction and operator execution.
//!
//! Every fallible operation in the crate returns [`Result`], whose error is
//! [`OpError`]. Failures are deterministic given the node state, so nothing
//! here is retried; errors propagate to the caller, which decides whether to
//! abort the enclosing graph run.

use crate::graph::NodeId;
use crate::tensors::Shape;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, OpError>;

/// Where a dropout pattern lives once it has been drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSite {
    /// A boolean mask cached in host memory by the CPU tiers.
    Host,
    /// A pattern regenerated on demand by an accelerator kernel from a seed.
    Accelerator,
}

impl core::fmt::Display for PatternSite {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// Everything that can go wrong while building or running operator nodes.
#[derive(Error, Debug)]
pub enum OpError {
    /// Input shapes are incompatible with the operator; raised while building the graph.
    #[error("shape inference failed for {op}: {reason}")]
    ShapeInference {
        /// Operator kind that rejected its inputs.
        op: &'static str,
        /// What was wrong with the input shapes.
        reason: String,
    },

    /// The node is terminal in the backward graph.
    #[error("{op} does not support gradient construction")]
    UnsupportedOperation {
        /// Operator kind asked for a gradient.
        op: &'static str,
    },

    /// A gradient ran before its forward node produced the state it reads.
    #[error("{op} node {node} has no dropout pattern yet; run its forward node first")]
    MissingState {
        /// Operator kind that found the state missing.
        op: &'static str,
        /// The forward node whose state is missing.
        node: NodeId,
    },

    /// Operator configuration failed validation at construction.
    #[error("invalid configuration for {op}: {reason}")]
    InvalidConfig {
        /// Operator kind being constructed.
        op: &'static str,
        /// Which constraint was violated.
        reason: String,
    },

    /// A buffer passed to `compute` does not have the inferred shape.
    #[error("{op} expected a buffer of shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Operator kind that checked the buffer.
        op: &'static str,
        /// Shape inferred from the inputs.
        expected: Shape,
        /// Shape of the buffer actually provided.
        actual: Shape,
    },

    /// A host value reached an accelerator call or a device value reached a CPU call.
    #[error("{op} running on {expected} received a value resident elsewhere")]
    DeviceMismatch {
        /// Operator kind being computed.
        op: &'static str,
        /// Where the values were expected to live.
        expected: &'static str,
    },

    /// The forward pattern was drawn on one tier family and requested on the other.
    #[error("node {node} cached its dropout pattern on the {cached} but was asked for it on the {requested}")]
    MaskLocation {
        /// The forward node owning the pattern.
        node: NodeId,
        /// Where the pattern was drawn.
        cached: PatternSite,
        /// Where it was requested.
        requested: PatternSite,
    },

    /// An executor run did not supply a value for a placeholder.
    #[error("no value fed for placeholder {0}")]
    MissingFeed(NodeId),

    /// An executor lookup found no value for a node it had already ordered.
    #[error("node {0} has not been evaluated")]
    MissingValue(NodeId),

    /// The accelerator backend reported a failure.
    #[error("accelerator failure: {0}")]
    Accelerator(String),
}

impl OpError {
    /// Convenience constructor for [`OpError::ShapeInference`].
    pub fn shape(op: &'static str, reason: impl Into<String>) -> Self {
        Self::ShapeInference {
            op,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_value_is_not_reported_as_a_feed() {
        let id = NodeId::next();
        let feed = OpError::MissingFeed(id).to_string();
        let value = OpError::MissingValue(id).to_string();
        assert!(feed.contains("placeholder"));
        assert!(!value.contains("placeholder"));
        assert_eq!(value, format!("node {id} has not been evaluated"));
    }
}
